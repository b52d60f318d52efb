//! The two scheduling policies and the mode-switch surface.

use std::sync::{Arc, Mutex};

use rv6_sched::{Machine, MachineOpts, UserText};

/// Under FCFS, three compute-bound children run strictly in arrival
/// (smallest-pid) order: a later child sees no CPU before every earlier one
/// has exited.
#[test]
fn fcfs_runs_arrivals_to_completion_in_order() {
    let log: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));

    let mut text = UserText::new();
    let worker_log = Arc::clone(&log);
    let worker = text.register(move |u| {
        assert_eq!(u.getlev(), 99);
        let pid = u.getpid();
        worker_log.lock().unwrap().push(pid);
        for _ in 0..40 {
            u.pause();
        }
        worker_log.lock().unwrap().push(-pid);
        u.exit(0)
    });
    text.set_init(move |u| {
        for _ in 0..3 {
            u.set_entry(worker);
            assert!(u.fork() > 0);
        }
        for _ in 0..3 {
            assert!(u.wait(0) > 0);
        }
        u.poweroff(0)
    });

    let opts = MachineOpts {
        ncpu: 1,
        ..Default::default()
    };
    assert_eq!(Machine::boot(opts, text).run(), 0);

    // Each worker ran start-to-exit before the next started: 2, -2, 3, -3,
    // 4, -4.
    let log = log.lock().unwrap();
    assert_eq!(log.as_slice(), &[2, -2, 3, -3, 4, -4]);
}

#[test]
fn mode_switches_reject_the_mode_in_force() {
    let mut text = UserText::new();
    text.set_init(|u| {
        assert_eq!(u.fcfsmode(), -1);
        assert_eq!(u.mlfqmode(), 0);
        assert_eq!(u.mlfqmode(), -1);
        assert_eq!(u.fcfsmode(), 0);
        assert_eq!(u.fcfsmode(), -1);
        u.poweroff(0)
    });
    assert_eq!(Machine::boot(MachineOpts::default(), text).run(), 0);
}

#[test]
fn getlev_is_99_under_fcfs_and_a_queue_level_under_mlfq() {
    let mut text = UserText::new();
    let worker = text.register(|u| {
        // Created under MLFQ: fresh processes enter the top queue.
        assert_eq!(u.getlev(), 0);
        u.exit(0)
    });
    text.set_init(move |u| {
        assert_eq!(u.getlev(), 99);
        assert_eq!(u.mlfqmode(), 0);

        u.set_entry(worker);
        let pid = u.fork();
        assert!(pid > 1);
        assert_eq!(u.wait(0), pid);

        let lev = u.getlev();
        assert!((0..=2).contains(&lev));

        assert_eq!(u.fcfsmode(), 0);
        assert_eq!(u.getlev(), 99);
        u.poweroff(0)
    });
    assert_eq!(Machine::boot(MachineOpts::default(), text).run(), 0);
}

#[test]
fn setpriority_distinguishes_bad_pid_from_bad_priority() {
    let mut text = UserText::new();
    text.set_init(|u| {
        let pid = u.getpid();
        assert_eq!(u.setpriority(pid, 5), -2);
        assert_eq!(u.setpriority(pid, -1), -2);
        assert_eq!(u.setpriority(4242, 2), -1);
        assert_eq!(u.setpriority(pid, 2), 0);
        u.poweroff(0)
    });
    assert_eq!(Machine::boot(MachineOpts::default(), text).run(), 0);
}

/// A sleeper woken by the ticking clock: sleep(n) blocks for at least n
/// ticks of uptime.
#[test]
fn sleep_tracks_the_clock() {
    let mut text = UserText::new();
    text.set_init(|u| {
        let before = u.uptime();
        assert_eq!(u.sleep(3), 0);
        let after = u.uptime();
        assert!(after - before >= 3);
        u.poweroff(0)
    });
    assert_eq!(Machine::boot(MachineOpts::default(), text).run(), 0);
}

/// yield is a no-op observably: the caller keeps making progress.
#[test]
fn yield_returns_zero_and_reschedules() {
    let mut text = UserText::new();
    text.set_init(|u| {
        for _ in 0..10 {
            assert_eq!(u.yield_cpu(), 0);
        }
        u.poweroff(0)
    });
    assert_eq!(Machine::boot(MachineOpts::default(), text).run(), 0);
}
