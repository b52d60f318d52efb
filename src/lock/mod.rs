//! The lock module.
//!
//! Contains types for locks and lock guards that provide mutual exclusion.
//! Guards may be handed across a `swtch`: the raw lock records only the
//! owning hart, so the thread resumed on that hart releases what the
//! switched-out thread acquired, exactly as on the real machine.

mod sleepablelock;
mod spinlock;

pub use sleepablelock::{Sleepablelock, SleepablelockGuard};
pub use spinlock::{RawSpinlock, Spinlock, SpinlockGuard};
