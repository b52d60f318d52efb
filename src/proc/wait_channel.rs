use std::ptr;

use super::{KernelCtx, Procstate};
use crate::kernel::Kernel;
use crate::lock::SpinlockGuard;

pub struct WaitChannel {
    /// Required to make this type non-zero-sized. If it were zero-sized,
    /// multiple wait channels may have the same address, spuriously waking
    /// up more threads.
    _padding: u8,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self { _padding: 0 }
    }

    /// Atomically release `lk` and sleep on this channel. Reacquires `lk`
    /// when awakened.
    pub fn sleep<T>(&self, lk: &mut SpinlockGuard<'_, T>, ctx: &KernelCtx<'_>) {
        // Must acquire p->lock in order to
        // change p->state and then call sched.
        // Once we hold p->lock, we can be
        // guaranteed that we won't miss any wakeup
        // (wakeup locks p->lock),
        // so it's okay to release lk.
        let mut guard = ctx.proc().lock();
        lk.reacquire_after(move || {
            // Go to sleep.
            guard.deref_mut_info().waitchannel = self;
            guard.deref_mut_info().state = Procstate::SLEEPING;
            // SAFETY: we hold p->lock, changed the process's state, and
            // interrupts are disabled by the lock's push_off.
            unsafe { guard.sched() };

            // Tidy up.
            guard.deref_mut_info().waitchannel = ptr::null();

            drop(guard);
            // Reacquire original lock.
        });
    }

    /// Wake up all processes sleeping on this channel.
    /// Must be called without any p->lock.
    pub fn wakeup(&self, kernel: &Kernel) {
        kernel.procs().wakeup_pool(self);
    }
}
