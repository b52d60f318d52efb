//! The scheduling policies.
//!
//! Both policies share one signature: given the process table, return a
//! RUNNABLE slot with its lock held, or none. The scheduler loop stays
//! generic; everything mode-specific (selection, the per-level quanta, the
//! periodic priority boost, the mode switches) lives here.
//!
//! The mode itself is a lock-free atomic so that paths holding a slot lock
//! (allocproc) may read it; the boost bookkeeping sits behind the policy
//! lock, which is ordered before any slot lock.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::kernel::Kernel;
use crate::lock::Spinlock;
use crate::param::{MLFQ_BOOST_INTERVAL, MLFQ_MAXPRIORITY, MLFQ_QUANTUM};
use crate::proc::{KernelCtx, Pid, ProcGuard, Procs, Procstate};
use crate::KernelError;

/// The scheduling policy in force.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SchedMode {
    /// First-come-first-served: smallest pid first, run to completion.
    Fcfs,
    /// Three-level feedback queue with an explicit bottom-level priority.
    Mlfq,
}

struct BoostClock {
    /// Tick the current boost window started at; `ticks - base` is the
    /// new-tick count since the last mode switch or boost.
    base: u32,
}

/// Owner of the global scheduling mode and the boost clock.
pub(crate) struct Policy {
    mode: AtomicUsize,
    clock: Spinlock<BoostClock>,
}

impl Policy {
    pub(crate) fn new() -> Self {
        Self {
            mode: AtomicUsize::new(SchedMode::Fcfs as usize),
            clock: Spinlock::new("sched", BoostClock { base: 0 }),
        }
    }

    pub fn mode(&self) -> SchedMode {
        if self.mode.load(Ordering::Acquire) == SchedMode::Mlfq as usize {
            SchedMode::Mlfq
        } else {
            SchedMode::Fcfs
        }
    }

    fn set_mode(&self, mode: SchedMode) {
        self.mode.store(mode as usize, Ordering::Release);
    }
}

/// Scheduling fields of a freshly allocated slot, per the mode in force:
/// top of the MLFQ, or the FCFS sentinels.
pub(crate) fn initial_fields(kernel: &Kernel) -> (i32, i32, i32) {
    match kernel.policy().mode() {
        SchedMode::Mlfq => (0, 0, MLFQ_MAXPRIORITY),
        SchedMode::Fcfs => (-1, -1, -1),
    }
}

/// Select the next process to run: a RUNNABLE slot, returned with its lock
/// held, or None. Every lock taken along the way other than the winner's is
/// released before this returns.
pub(crate) fn pick_next(kernel: &Kernel) -> Option<ProcGuard<'_>> {
    let procs = kernel.procs();
    match kernel.policy().mode() {
        SchedMode::Fcfs => fcfs_pick(procs),
        SchedMode::Mlfq => mlfq_pick(procs),
    }
}

/// FCFS: of all RUNNABLE slots, the one with the smallest pid. Pids are
/// unique and monotonically allocated, so the smallest pid is the earliest
/// surviving arrival.
fn fcfs_pick(procs: &Procs) -> Option<ProcGuard<'_>> {
    let mut earliest: Option<ProcGuard<'_>> = None;
    for p in procs.pool() {
        let guard = p.lock();
        if guard.state() != Procstate::RUNNABLE {
            continue;
        }
        let wins = match &earliest {
            Some(e) => guard.pid() < e.pid(),
            None => true,
        };
        if wins {
            // Replacing the candidate releases the loser's lock; so does
            // letting a losing probe go out of scope.
            earliest = Some(guard);
        }
    }
    earliest
}

/// MLFQ: the first RUNNABLE slot in table order at L0, else at L1, else the
/// highest-priority RUNNABLE slot at L2 (ties to the earlier table slot).
fn mlfq_pick(procs: &Procs) -> Option<ProcGuard<'_>> {
    // L0 and L1: round robin by table order.
    for level in 0..2 {
        for p in procs.pool() {
            let guard = p.lock();
            if guard.state() == Procstate::RUNNABLE && guard.deref_info().level == level {
                return Some(guard);
            }
        }
    }

    // L2: priority scheduling, higher wins, ties to the earlier slot.
    let mut selected: Option<ProcGuard<'_>> = None;
    for p in procs.pool() {
        let guard = p.lock();
        if guard.state() != Procstate::RUNNABLE || guard.deref_info().level != 2 {
            continue;
        }
        let wins = match &selected {
            Some(s) => guard.deref_info().priority > s.deref_info().priority,
            None => true,
        };
        if wins {
            selected = Some(guard);
        }
    }
    selected
}

/// Reset every scheduled slot to the top of the MLFQ: level 0, no ticks
/// used, maximal priority. Prevents starvation at the lower levels.
pub(crate) fn boost_priority_all(procs: &Procs) {
    for p in procs.pool() {
        let mut guard = p.lock();
        match guard.state() {
            Procstate::RUNNABLE | Procstate::RUNNING | Procstate::SLEEPING => {
                let info = guard.deref_mut_info();
                info.level = 0;
                info.ticks_used = 0;
                info.priority = MLFQ_MAXPRIORITY;
            }
            _ => {}
        }
    }
}

/// Switch the machine to MLFQ scheduling. Fails if it is already in force.
pub(crate) fn mlfq_mode(kernel: &Kernel) -> Result<(), KernelError> {
    let policy = kernel.policy();
    let mut clock = policy.clock.lock();
    if policy.mode() == SchedMode::Mlfq {
        return Err(KernelError::AlreadyInMode);
    }

    for p in kernel.procs().pool() {
        let mut guard = p.lock();
        match guard.state() {
            Procstate::RUNNABLE | Procstate::SLEEPING => {
                let info = guard.deref_mut_info();
                info.level = 0;
                info.ticks_used = 0;
                info.priority = MLFQ_MAXPRIORITY;
            }
            _ => {}
        }
    }

    policy.set_mode(SchedMode::Mlfq);
    clock.base = kernel.ticks_now();
    Ok(())
}

/// Switch the machine to FCFS scheduling. Fails if it is already in force.
pub(crate) fn fcfs_mode(kernel: &Kernel) -> Result<(), KernelError> {
    let policy = kernel.policy();
    let mut clock = policy.clock.lock();
    if policy.mode() == SchedMode::Fcfs {
        return Err(KernelError::AlreadyInMode);
    }

    for p in kernel.procs().pool() {
        let mut guard = p.lock();
        match guard.state() {
            Procstate::RUNNABLE | Procstate::SLEEPING => {
                let info = guard.deref_mut_info();
                info.level = -1;
                info.ticks_used = -1;
                info.priority = -1;
            }
            _ => {}
        }
    }

    policy.set_mode(SchedMode::Fcfs);
    clock.base = kernel.ticks_now();
    Ok(())
}

/// The MLFQ queue level of the current process, or 99 under FCFS.
pub(crate) fn getlev(ctx: &KernelCtx<'_>) -> usize {
    if ctx.kernel().policy().mode() == SchedMode::Fcfs {
        return 99;
    }
    let guard = ctx.proc().lock();
    guard.deref_info().level as usize
}

/// Set the explicit priority of the process with the given pid.
pub(crate) fn set_priority(kernel: &Kernel, pid: Pid, priority: i32) -> Result<(), KernelError> {
    if !(0..=MLFQ_MAXPRIORITY).contains(&priority) {
        return Err(KernelError::BadPriority);
    }
    for p in kernel.procs().pool() {
        let mut guard = p.lock();
        if guard.state() != Procstate::UNUSED && guard.pid() == pid {
            guard.deref_mut_info().priority = priority;
            return Ok(());
        }
    }
    Err(KernelError::NoSuchProc)
}

/// A timer tick observed by the running process at a trap boundary: run the
/// boost clock, charge the process's quantum, and give up the CPU. Under
/// FCFS the yield alone is the whole story: selection puts the smallest
/// pid straight back on the hart.
pub(crate) fn clock_intr(ctx: &KernelCtx<'_>, now: u32) {
    let kernel = ctx.kernel();
    let policy = kernel.policy();

    if policy.mode() == SchedMode::Mlfq {
        {
            let mut clock = policy.clock.lock();
            // Recheck under the policy lock; a mode switch may have raced.
            if policy.mode() == SchedMode::Mlfq
                && now.wrapping_sub(clock.base) >= MLFQ_BOOST_INTERVAL as u32
            {
                clock.base = now;
                boost_priority_all(kernel.procs());
            }
        }

        let mut guard = ctx.proc().lock();
        let info = guard.deref_mut_info();
        if info.level < 0 {
            // This process was running across the switch to MLFQ and still
            // carries the FCFS sentinels; it joins the top queue now.
            info.level = 0;
            info.ticks_used = 0;
            info.priority = MLFQ_MAXPRIORITY;
        }
        info.ticks_used += 1;
        let level = info.level.min(2) as usize;
        if info.ticks_used >= MLFQ_QUANTUM[level] {
            info.ticks_used = 0;
            if info.level < 2 {
                // Used up the quantum: demote.
                info.level += 1;
            } else if info.priority > 0 {
                // Bottom level: pay in priority instead.
                info.priority -= 1;
            }
        }
        drop(guard);
    }

    ctx.yield_cpu();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Machine;

    /// Allocate `n` slots and mark them RUNNABLE with the given scheduling
    /// fields; returns their pids.
    fn stage(kernel: &Kernel, procs: &[(i32, i32, i32)]) -> Vec<Pid> {
        procs
            .iter()
            .map(|&fields| {
                let mut guard = kernel.procs().alloc(kernel.kmem(), fields).unwrap();
                guard.deref_mut_info().state = Procstate::RUNNABLE;
                guard.pid()
            })
            .collect()
    }

    fn retire(kernel: &Kernel, pid: Pid) {
        for p in kernel.procs().pool() {
            let mut guard = p.lock();
            if guard.state() != Procstate::UNUSED && guard.pid() == pid {
                guard.clear(None, kernel.kmem());
                return;
            }
        }
        panic!("retire: no such pid");
    }

    #[test]
    fn fcfs_picks_smallest_pid() {
        let machine = Machine::boot_for_test();
        machine.with_hart(|kernel| {
            let pids = stage(kernel, &[(-1, -1, -1), (-1, -1, -1), (-1, -1, -1)]);
            for &expect in pids.iter() {
                // Every hart, every round: the minimum RUNNABLE pid.
                for _ in 0..2 {
                    let guard = pick_next(kernel).unwrap();
                    assert_eq!(guard.pid(), expect);
                }
                retire(kernel, expect);
            }
        });
    }

    #[test]
    fn mlfq_prefers_upper_levels_and_l2_priority() {
        let machine = Machine::boot_for_test();
        machine.with_hart(|kernel| {
            mlfq_mode(kernel).unwrap();
            let pids = stage(kernel, &[(2, 0, 1), (2, 0, 3), (1, 0, 0), (0, 0, 2)]);

            // No slot at level k runs while one at level < k is RUNNABLE.
            let guard = pick_next(kernel).unwrap();
            assert_eq!(guard.pid(), pids[3]);
            drop(guard);
            retire(kernel, pids[3]);

            let guard = pick_next(kernel).unwrap();
            assert_eq!(guard.pid(), pids[2]);
            drop(guard);
            retire(kernel, pids[2]);

            // Among level-2 slots, the highest priority wins.
            let guard = pick_next(kernel).unwrap();
            assert_eq!(guard.pid(), pids[1]);
            drop(guard);
            retire(kernel, pids[1]);

            let guard = pick_next(kernel).unwrap();
            assert_eq!(guard.pid(), pids[0]);
            drop(guard);
            retire(kernel, pids[0]);

            assert!(pick_next(kernel).is_none());
            fcfs_mode(kernel).unwrap();
        });
    }

    #[test]
    fn selection_releases_every_skipped_lock() {
        let machine = Machine::boot_for_test();
        machine.with_hart(|kernel| {
            let pids = stage(kernel, &[(-1, -1, -1), (-1, -1, -1)]);
            let guard = pick_next(kernel).unwrap();
            drop(guard);
            // Nothing left locked: every slot can be locked again in turn.
            for p in kernel.procs().pool() {
                drop(p.lock());
            }
            for &pid in &pids {
                retire(kernel, pid);
            }
        });
    }

    #[test]
    fn boost_is_idempotent() {
        let machine = Machine::boot_for_test();
        machine.with_hart(|kernel| {
            mlfq_mode(kernel).unwrap();
            let pids = stage(kernel, &[(2, 5, 0), (1, 3, 1)]);

            let snapshot = |kernel: &Kernel| -> Vec<(i32, i32, i32)> {
                kernel
                    .procs()
                    .pool()
                    .map(|p| {
                        let g = p.lock();
                        let info = g.deref_info();
                        (info.level, info.ticks_used, info.priority)
                    })
                    .collect()
            };

            boost_priority_all(kernel.procs());
            let once = snapshot(kernel);
            boost_priority_all(kernel.procs());
            assert_eq!(once, snapshot(kernel));

            for &pid in &pids {
                retire(kernel, pid);
            }
            fcfs_mode(kernel).unwrap();
        });
    }

    #[test]
    fn mode_switch_rejects_the_mode_in_force() {
        let machine = Machine::boot_for_test();
        machine.with_hart(|kernel| {
            assert_eq!(kernel.policy().mode(), SchedMode::Fcfs);
            assert_eq!(fcfs_mode(kernel), Err(KernelError::AlreadyInMode));
            mlfq_mode(kernel).unwrap();
            assert_eq!(mlfq_mode(kernel), Err(KernelError::AlreadyInMode));
            fcfs_mode(kernel).unwrap();
        });
    }
}
