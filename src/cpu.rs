use std::cell::UnsafeCell;
use std::ptr;

use array_macro::array;

use crate::arch::{self, Context};
use crate::kernel::Kernel;
use crate::param::NCPU;
use crate::proc::Proc;

/// Per-CPU state.
pub struct Cpu {
    /// Index of this hart.
    pub id: usize,

    /// The kernel this hart belongs to. Wired once at boot.
    pub(crate) kernel: *const Kernel,

    /// The process running on this cpu, or null.
    pub(crate) proc: *const Proc,

    /// swtch() here to enter scheduler().
    pub(crate) context: Context,

    /// Depth of push_off() nesting.
    pub(crate) noff: i32,

    /// Were interrupts enabled before push_off()?
    pub(crate) interrupt_enabled: bool,

    /// The modeled interrupt-enable bit of this hart.
    intr: bool,
}

impl Cpu {
    fn new(id: usize) -> Self {
        Self {
            id,
            kernel: ptr::null(),
            proc: ptr::null(),
            context: Context::new(),
            noff: 0,
            interrupt_enabled: false,
            intr: false,
        }
    }
}

// The `Cpu` struct of the current cpu can be mutated. To do so, we need to
// obtain mutable pointers to the elements of `cpus` from a shared reference
// of a `Kernel`. It requires interior mutability, so we use `UnsafeCell`.
pub struct Cpus([UnsafeCell<Cpu>; NCPU]);

// SAFETY: each thread accesses only the `Cpu` of the hart it is bound to,
// and at most one thread is bound to a hart at a time.
unsafe impl Sync for Cpus {}

impl Cpus {
    pub(crate) fn new() -> Self {
        Self(array![i => UnsafeCell::new(Cpu::new(i)); NCPU])
    }

    /// Wire the kernel backpointer of every hart. Runs once at boot, before
    /// any hart is bound.
    pub(crate) fn init(&mut self, kernel: *const Kernel) {
        for cpu in self.0.iter_mut() {
            cpu.get_mut().kernel = kernel;
        }
    }

    pub(crate) fn as_ptr(&self, id: usize) -> *mut Cpu {
        self.0[id].get()
    }
}

/// Binds the calling thread to a hart. The hosted analog of starting to run
/// on that hart; `swtch` rebinds resumed threads automatically.
pub(crate) unsafe fn bind(cpu: *mut Cpu) {
    arch::bind(cpu as usize);
}

/// Return this hart's cpu struct. Panics on a thread that is not bound to
/// any hart.
pub(crate) fn current() -> *mut Cpu {
    let hart = arch::hart();
    assert!(hart != 0, "mycpu: no hart");
    hart as *mut Cpu
}

/// Return this hart's id.
pub fn cpuid() -> usize {
    unsafe { (*current()).id }
}

/// The kernel of the hart this thread runs on.
pub(crate) unsafe fn current_kernel<'a>() -> &'a Kernel {
    let kernel = unsafe { (*current()).kernel };
    assert!(!kernel.is_null(), "mycpu: no kernel");
    unsafe { &*kernel }
}

/// Return the current `struct proc *`, or null if none.
pub(crate) fn current_proc() -> *const Proc {
    unsafe {
        push_off();
        let p = (*current()).proc;
        pop_off();
        p
    }
}

pub(crate) fn intr_on() {
    unsafe { (*current()).intr = true };
}

pub(crate) fn intr_off() {
    unsafe { (*current()).intr = false };
}

pub(crate) fn intr_get() -> bool {
    unsafe { (*current()).intr }
}

/// push_off/pop_off are like intr_off()/intr_on() except that they are
/// matched: it takes two pop_off()s to undo two push_off()s. Also, if
/// interrupts are initially off, then push_off, pop_off leaves them off.
pub(crate) unsafe fn push_off() {
    let old = intr_get();
    intr_off();
    let cpu = current();
    unsafe {
        if (*cpu).noff == 0 {
            (*cpu).interrupt_enabled = old;
        }
        (*cpu).noff += 1;
    }
}

/// pop_off() should be paired with push_off().
pub(crate) unsafe fn pop_off() {
    let cpu = current();
    assert!(!intr_get(), "pop_off - interruptible");
    unsafe {
        assert!((*cpu).noff >= 1, "pop_off");
        (*cpu).noff -= 1;
        if (*cpu).noff == 0 && (*cpu).interrupt_enabled {
            intr_on();
        }
    }
}
