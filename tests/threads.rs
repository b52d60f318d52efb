//! clone/join: threads sharing one address space.

use rv6_sched::{Machine, MachineOpts, UserText};

const PGSIZE: usize = 4096;

fn two_cpu() -> MachineOpts {
    MachineOpts {
        ncpu: 2,
        ..Default::default()
    }
}

/// A cloned thread starts at the given entry with the two arguments in its
/// argument registers and its stack pointer at the top of the caller's
/// stack page; join returns that stack page to the parent.
#[test]
fn clone_enters_fn_with_args_and_join_returns_the_stack() {
    let mut text = UserText::new();
    let thread = text.register(|u| {
        // arg1 carries the stack base in this program.
        assert_eq!(u.sp(), u.arg0() + PGSIZE);
        assert_eq!(u.arg1(), 22);
        u.exit(0)
    });
    let leader = text.register(move |u| {
        let stack = u.sbrk(PGSIZE as i32) as usize;
        let tid = u.clone(thread, stack, 22, stack);
        assert!(tid > 0);

        let cell = u.sbrk(PGSIZE as i32) as usize;
        assert_eq!(u.join(cell), tid);
        let returned: usize = u.read(cell).unwrap();
        assert_eq!(returned, stack);

        // Nothing left to join.
        assert_eq!(u.join(0), -1);
        u.exit(0)
    });
    text.set_init(move |u| {
        u.set_entry(leader);
        let pid = u.fork();
        assert!(pid > 1);
        assert_eq!(u.wait(0), pid);
        u.poweroff(0)
    });

    assert_eq!(Machine::boot(two_cpu(), text).run(), 0);
}

/// Growth of the shared address space by one thread is the size of every
/// thread in the group.
#[test]
fn growproc_is_visible_across_the_thread_group() {
    let mut text = UserText::new();
    let watcher = text.register(|u| {
        // arg0 is the size at clone time; wait until the leader grows it.
        let base = u.arg0() as isize;
        while u.sbrk(0) <= base {
            u.pause();
        }
        u.exit(0)
    });
    let leader = text.register(move |u| {
        let stack = u.sbrk(PGSIZE as i32) as usize;
        let size_now = u.sbrk(0) as usize;
        let tid = u.clone(watcher, size_now, 0, stack);
        assert!(tid > 0);

        u.sleep(2);
        assert!(u.sbrk(PGSIZE as i32) > 0);

        assert_eq!(u.join(0), tid);
        u.exit(0)
    });
    text.set_init(move |u| {
        u.set_entry(leader);
        let pid = u.fork();
        assert!(pid > 1);
        assert_eq!(u.wait(0), pid);
        u.poweroff(0)
    });

    assert_eq!(Machine::boot(two_cpu(), text).run(), 0);
}

/// Killing any member of a thread group kills the whole group, but not the
/// (separate-address-space) parent that forked the leader.
#[test]
fn kill_takes_down_the_whole_thread_group() {
    let mut text = UserText::new();
    let spinner = text.register(|u| {
        loop {
            u.pause();
        }
    });
    let leader = text.register(move |u| {
        let stack = u.sbrk(PGSIZE as i32) as usize;
        assert!(u.clone(spinner, 0, 0, stack) > 0);
        loop {
            u.pause();
        }
    });
    text.set_init(move |u| {
        let addr = u.sbrk(PGSIZE as i32) as usize;
        u.set_entry(leader);
        // Deterministic pids: init is 1, the leader 2, the spinner 3.
        assert_eq!(u.fork(), 2);

        // Kill the *thread*; the leader must die with it.
        while u.kill(3) == -1 {
            u.sleep(1);
        }

        let mut reaped = Vec::new();
        for _ in 0..2 {
            let pid = u.wait(addr);
            assert!(pid > 0);
            let status: i32 = u.read(addr).unwrap();
            assert_eq!(status, -1);
            reaped.push(pid);
        }
        reaped.sort_unstable();
        assert_eq!(reaped, vec![2, 3]);

        u.poweroff(0)
    });

    assert_eq!(Machine::boot(two_cpu(), text).run(), 0);
}

/// join reaps a forked (non-thread) child too, delivering a null stack, the
/// same way wait would.
#[test]
fn join_on_a_forked_child_delivers_a_null_stack() {
    let mut text = UserText::new();
    let child = text.register(|u| u.exit(0));
    text.set_init(move |u| {
        let cell = u.sbrk(PGSIZE as i32) as usize;
        u.set_entry(child);
        let pid = u.fork();
        assert!(pid > 1);

        assert_eq!(u.join(cell), pid);
        let stack: usize = u.read(cell).unwrap();
        assert_eq!(stack, 0);

        u.poweroff(0)
    });

    assert_eq!(Machine::boot(two_cpu(), text).run(), 0);
}
