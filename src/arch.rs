//! The hosted hart.
//!
//! On the real machine a context switch is a handful of assembly saving the
//! callee-saved registers (swtch.S). The host has no stack-switch primitive,
//! so every kernel thread (one per process slot, plus one scheduler thread
//! per hart) is an OS thread, and a `Context` is the parking spot where that
//! thread waits while it is switched out. `swtch(save, load)` wakes the
//! thread waiting in `load`, handing it the current hart, and parks the
//! calling thread in `save`. Exactly one thread runs per hart at a time, so
//! the lock-handoff contract of the real `swtch` carries over unchanged.
//!
//! Which hart a thread is on is a thread-local binding, updated every time a
//! thread is resumed; `myproc()` and the spinlock's `holding()` go through
//! it just as they go through `tp` on RISC-V.

use std::cell::Cell;
use std::panic;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use spin::Once;

thread_local! {
    /// The hart this thread currently runs on (a `*mut Cpu`, as usize).
    /// Zero while the thread is not bound to any hart.
    static HART: Cell<usize> = Cell::new(0);
}

/// What a parked kernel thread receives when it is woken.
#[derive(Copy, Clone)]
pub(crate) enum Handoff {
    /// Run on the given hart (a `*mut Cpu`, as usize).
    Run(usize),
    /// The slot was reclaimed before this thread ever ran; unwind quietly.
    Retire,
}

struct SwitchChannel {
    handoff: Mutex<Option<Handoff>>,
    resumed: Condvar,
}

/// The saved state of a switched-out kernel thread: the spot its OS thread
/// parks in until the next `swtch` into it.
pub(crate) struct Context {
    chan: Arc<SwitchChannel>,
}

/// A cloneable reference to a `Context`'s parking spot, held by the slot's
/// kernel thread itself.
pub(crate) struct ContextHandle {
    chan: Arc<SwitchChannel>,
}

impl SwitchChannel {
    fn resume(&self, handoff: Handoff) {
        let mut slot = self.handoff.lock().unwrap();
        assert!(slot.is_none(), "swtch: context already resumed");
        *slot = Some(handoff);
        self.resumed.notify_one();
    }

    fn park(&self) -> Handoff {
        let mut slot = self.handoff.lock().unwrap();
        loop {
            if let Some(handoff) = slot.take() {
                return handoff;
            }
            slot = self.resumed.wait(slot).unwrap();
        }
    }
}

impl Context {
    pub(crate) fn new() -> Self {
        Self {
            chan: Arc::new(SwitchChannel {
                handoff: Mutex::new(None),
                resumed: Condvar::new(),
            }),
        }
    }

    pub(crate) fn handle(&self) -> ContextHandle {
        ContextHandle {
            chan: Arc::clone(&self.chan),
        }
    }

    /// Wake the (never-run) kernel thread parked here so it can unwind.
    /// A no-op if the thread already finished; nothing ever parks on a
    /// reclaimed context again.
    pub(crate) fn retire(&self) {
        let mut slot = self.chan.handoff.lock().unwrap();
        *slot = Some(Handoff::Retire);
        self.chan.resumed.notify_one();
    }
}

impl ContextHandle {
    pub(crate) fn park(&self) -> Handoff {
        self.chan.park()
    }
}

/// Returns the current hart binding (a `*mut Cpu` as usize), or 0.
pub(crate) fn hart() -> usize {
    HART.with(|h| h.get())
}

pub(crate) fn bind(hart: usize) {
    HART.with(|h| h.set(hart));
}

/// Switch threads: wake whoever waits in `load` on this hart, then park in
/// `save` until someone switches back. Locks held by the caller stay held;
/// by the handoff contract the other side releases them.
pub(crate) unsafe fn swtch(save: &Context, load: &Context) {
    let hart = hart();
    assert!(hart != 0, "swtch: no hart");
    load.chan.resume(Handoff::Run(hart));
    match save.chan.park() {
        Handoff::Run(hart) => bind(hart),
        Handoff::Retire => unreachable!("swtch: retired while running"),
    }
}

/// The exiting half of `swtch`: hand the hart over without parking. The
/// caller's kernel thread is done for good and must unwind via
/// [`exit_thread`] without touching its process slot again.
pub(crate) unsafe fn swtch_final(load: &Context) {
    let hart = hart();
    assert!(hart != 0, "swtch: no hart");
    load.chan.resume(Handoff::Run(hart));
}

/// Panic payload that terminates a process's kernel thread. Caught by the
/// thread trampoline; the host panic hook stays silent about it.
pub(crate) struct ProcExited;

/// Ends the calling kernel thread. Must be called with no locks held and no
/// live lock guards anywhere on the stack.
pub(crate) fn exit_thread() -> ! {
    panic::panic_any(ProcExited)
}

/// Nothing runnable: let the host rest until the next poll.
pub(crate) fn wfi() {
    thread::sleep(Duration::from_micros(200));
}

static HOST_HOOKS: Once<()> = Once::new();

/// One-time host integration: teach the panic hook to stay quiet about the
/// `ProcExited` unwinds that end process kernel threads.
pub(crate) fn install_host_hooks() {
    HOST_HOOKS.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if info.payload().downcast_ref::<ProcExited>().is_none() {
                previous(info);
            }
        }));
    });
}
