//! Sleepable locks
use std::ops::{Deref, DerefMut};

use super::{Spinlock, SpinlockGuard};
use crate::kernel::Kernel;
use crate::proc::{KernelCtx, WaitChannel};

/// Similar to `Spinlock`, but guards of this lock can `sleep()`/`wakeup()`
/// on a channel owned by the lock itself.
pub struct Sleepablelock<T> {
    lock: Spinlock<T>,

    /// WaitChannel used to sleep/wakeup the lock's guards.
    waitchannel: WaitChannel,
}

/// Guards of `Sleepablelock<T>`.
pub struct SleepablelockGuard<'s, T> {
    lock: &'s Sleepablelock<T>,
    inner: SpinlockGuard<'s, T>,
}

impl<T> Sleepablelock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: Spinlock::new(name, data),
            waitchannel: WaitChannel::new(),
        }
    }

    pub fn lock(&self) -> SleepablelockGuard<'_, T> {
        SleepablelockGuard {
            lock: self,
            inner: self.lock.lock(),
        }
    }
}

impl<T> SleepablelockGuard<'_, T> {
    /// Atomically release the lock and sleep on its channel; reacquires the
    /// lock when awakened.
    pub fn sleep(&mut self, ctx: &KernelCtx<'_>) {
        self.lock.waitchannel.sleep(&mut self.inner, ctx);
    }

    /// Wake up all processes sleeping on this lock's channel.
    pub fn wakeup(&self, kernel: &Kernel) {
        self.lock.waitchannel.wakeup(kernel);
    }
}

impl<T> Deref for SleepablelockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T> DerefMut for SleepablelockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}
