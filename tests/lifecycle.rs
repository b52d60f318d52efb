//! Process lifecycle: fork, wait, exit, kill, reparenting.

use rv6_sched::{Machine, MachineOpts, UserText};

const PGSIZE: usize = 4096;

#[test]
fn fork_wait_delivers_the_exit_status() {
    let mut text = UserText::new();
    let child = text.register(|u| {
        // fork returns 0 in the child.
        assert_eq!(u.arg0(), 0);
        assert_eq!(u.getppid(), 1);
        u.exit(7)
    });
    text.set_init(move |u| {
        let addr = u.sbrk(PGSIZE as i32) as usize;

        // No children yet.
        assert_eq!(u.wait(0), -1);

        u.set_entry(child);
        let pid = u.fork();
        assert!(pid > 1);

        let reaped = u.wait(addr);
        assert_eq!(reaped, pid);
        let status: i32 = u.read(addr).unwrap();
        assert_eq!(status, 7);

        u.poweroff(0)
    });

    assert_eq!(Machine::boot(MachineOpts::default(), text).run(), 0);
}

#[test]
fn pids_are_unique_and_monotonic_across_slot_reuse() {
    let mut text = UserText::new();
    let child = text.register(|u| u.exit(0));
    text.set_init(move |u| {
        let mut last = u.getpid();
        for _ in 0..8 {
            u.set_entry(child);
            let pid = u.fork();
            assert!(pid > last as isize);
            last = pid as i32;
            assert_eq!(u.wait(0), pid);
        }
        u.poweroff(0)
    });

    assert_eq!(Machine::boot(MachineOpts::default(), text).run(), 0);
}

#[test]
fn wait_with_a_bad_address_keeps_the_zombie() {
    let mut text = UserText::new();
    let child = text.register(|u| u.exit(3));
    text.set_init(move |u| {
        let addr = u.sbrk(PGSIZE as i32) as usize;
        u.set_entry(child);
        let pid = u.fork();
        assert!(pid > 1);

        // Let the child die, then try to reap it through an unmapped
        // address: the copy fails and the zombie must survive for a retry.
        u.sleep(2);
        assert_eq!(u.wait(1 << 30), -1);
        assert_eq!(u.wait(addr), pid);
        let status: i32 = u.read(addr).unwrap();
        assert_eq!(status, 3);

        u.poweroff(0)
    });

    assert_eq!(Machine::boot(MachineOpts::default(), text).run(), 0);
}

#[test]
fn kill_wakes_a_sleeper_and_wait_sees_minus_one() {
    let mut text = UserText::new();
    let sleeper = text.register(|u| {
        // Far longer than the test; only a kill ends it.
        u.sleep(600_000);
        u.exit(99)
    });
    text.set_init(move |u| {
        let addr = u.sbrk(PGSIZE as i32) as usize;

        assert_eq!(u.kill(4242), -1);

        u.set_entry(sleeper);
        let pid = u.fork();
        assert!(pid > 1);
        u.sleep(2);

        assert_eq!(u.kill(pid as i32), 0);
        assert_eq!(u.wait(addr), pid);
        let status: i32 = u.read(addr).unwrap();
        assert_eq!(status, -1);

        u.poweroff(0)
    });

    assert_eq!(Machine::boot(MachineOpts::default(), text).run(), 0);
}

#[test]
fn orphans_are_reparented_to_init_and_reaped_there() {
    let mut text = UserText::new();
    let grandchild = text.register(|u| {
        u.sleep(3);
        u.exit(21)
    });
    let middle = text.register(move |u| {
        u.set_entry(grandchild);
        let pid = u.fork();
        assert!(pid > 0);
        // Die first, abandoning the grandchild to init.
        u.exit(1)
    });
    text.set_init(move |u| {
        let addr = u.sbrk(PGSIZE as i32) as usize;
        u.set_entry(middle);
        let mid = u.fork();
        assert!(mid > 1);

        // Two waits: the middle process, then the adopted grandchild.
        let mut statuses = Vec::new();
        for _ in 0..2 {
            let pid = u.wait(addr);
            assert!(pid > 0);
            let status: i32 = u.read(addr).unwrap();
            statuses.push(status);
        }
        statuses.sort_unstable();
        assert_eq!(statuses, vec![1, 21]);
        assert_eq!(u.wait(0), -1);

        u.poweroff(0)
    });

    assert_eq!(Machine::boot(MachineOpts::default(), text).run(), 0);
}

#[test]
fn fork_fails_cleanly_when_memory_is_exhausted() {
    let mut text = UserText::new();
    let child = text.register(|u| u.exit(0));
    text.set_init(move |u| {
        u.set_entry(child);
        // Every page went to the first process; the child can't be built.
        assert_eq!(u.fork(), -1);
        assert_eq!(u.wait(0), -1);
        u.poweroff(0)
    });

    let opts = MachineOpts {
        ncpu: 1,
        // Just enough to boot: page table wiring, initcode, trapframe.
        kmem_pages: 6,
    };
    assert_eq!(Machine::boot(opts, text).run(), 0);
}

#[test]
fn procdump_lists_live_processes() {
    let mut text = UserText::new();
    text.set_init(|u| {
        u.sleep(3);
        u.poweroff(0)
    });
    let machine = Machine::boot(MachineOpts::default(), text);
    machine.with_hart(|kernel| kernel.procdump());
    assert_eq!(machine.run(), 0);
}
