//! Per-process state and the kernel context of the running process.

use std::cell::UnsafeCell;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use arrayvec::ArrayString;

use crate::arch::{self, Context};
use crate::cpu;
use crate::file::{RcFile, RcInode};
use crate::kalloc::Kmem;
use crate::kernel::Kernel;
use crate::lock::Spinlock;
use crate::param::{MAXPROCNAME, NOFILE};
use crate::vm::UserMemory;

mod procs;
mod wait_channel;

pub use procs::*;
pub use wait_channel::*;

pub type Pid = i32;

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Procstate {
    ZOMBIE,
    RUNNING,
    RUNNABLE,
    SLEEPING,
    UNUSED,
    USED,
}

impl Procstate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Procstate::USED => "used",
            Procstate::UNUSED => "unused",
            Procstate::SLEEPING => "sleep ",
            Procstate::RUNNABLE => "runble",
            Procstate::RUNNING => "run   ",
            Procstate::ZOMBIE => "zombie",
        }
    }
}

/// Saved user registers. Lives in a page of its own, reachable from the
/// process's `ProcData`.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct TrapFrame {
    /// Saved user program counter. In the hosted model this indexes the
    /// machine's user text, so 0 is initcode.
    pub epc: usize,

    /// Saved user stack pointer.
    pub sp: usize,

    /// Argument/return registers.
    pub a0: usize,
    pub a1: usize,
    pub a2: usize,
    pub a3: usize,
    pub a4: usize,
    pub a5: usize,

    /// Syscall number register.
    pub a7: usize,
}

/// Proc::info's spinlock must be held when using these.
pub struct ProcInfo {
    /// Process state.
    pub state: Procstate,

    /// If non-null, sleeping on waitchannel.
    pub(crate) waitchannel: *const WaitChannel,

    /// Exit status to be returned to parent's wait.
    pub(crate) xstate: i32,

    /// Process ID.
    pub(crate) pid: Pid,

    /// Identity of the shared address space; slots with equal `mem_id` form
    /// a thread group. 0 while the slot has no user memory.
    pub(crate) mem_id: u64,

    /// For clone-created slots, the caller-provided user stack page,
    /// returned to the joiner. 0 for forked children.
    pub(crate) user_stack: usize,

    /// MLFQ queue level, 0..3. Sentinel -1 under FCFS.
    pub(crate) level: i32,

    /// Ticks consumed at the current level. Sentinel -1 under FCFS.
    pub(crate) ticks_used: i32,

    /// Explicit priority at the bottom level, 0..=3, higher wins.
    /// Sentinel -1 under FCFS.
    pub(crate) priority: i32,
}

/// Proc::data are private to the process, so the slot's lock need not be
/// held to use them from the process itself.
pub struct ProcData {
    /// Virtual address of kernel stack. Assigned at boot, never reassigned.
    pub kstack: usize,

    /// The trapframe page, allocated by allocproc.
    pub(crate) trap_frame: *mut TrapFrame,

    /// This process's handle on its user address space.
    pub(crate) memory: Option<UserMemory>,

    /// swtch() here to run process.
    pub(crate) context: Context,

    /// Open files.
    pub open_files: [Option<RcFile>; NOFILE],

    /// Current directory.
    pub(crate) cwd: Option<RcInode>,

    /// Process name (debugging).
    pub name: ArrayString<MAXPROCNAME>,

    /// Last tick this process accounted for at a trap boundary.
    pub(crate) last_tick: u32,
}

impl ProcInfo {
    const fn new() -> Self {
        Self {
            state: Procstate::UNUSED,
            waitchannel: ptr::null(),
            xstate: 0,
            pid: 0,
            mem_id: 0,
            user_stack: 0,
            level: 0,
            ticks_used: 0,
            priority: 0,
        }
    }
}

impl ProcData {
    fn new() -> Self {
        Self {
            kstack: 0,
            trap_frame: ptr::null_mut(),
            memory: None,
            context: Context::new(),
            open_files: array_macro::array![_ => None; NOFILE],
            cwd: None,
            name: ArrayString::new(),
            last_tick: 0,
        }
    }

    pub fn trap_frame(&self) -> &TrapFrame {
        // SAFETY: non-null on every slot that is not UNUSED, and the page
        // behind it outlives the slot's claim on it.
        unsafe { &*self.trap_frame }
    }

    pub fn trap_frame_mut(&mut self) -> &mut TrapFrame {
        unsafe { &mut *self.trap_frame }
    }
}

/// Per-process state.
///
/// A slot is UNUSED iff its pid is 0, its trapframe is null, and it holds no
/// user memory.
pub struct Proc {
    /// Parent process. `wait_lock` must be held when using this.
    parent: UnsafeCell<*const Proc>,

    pub info: Spinlock<ProcInfo>,

    pub(crate) data: UnsafeCell<ProcData>,

    /// Waitchannel saying child proc is dead.
    pub(crate) child_waitchannel: WaitChannel,

    /// If true, the process has been killed.
    killed: AtomicBool,
}

// SAFETY: `parent` is protected by the process table's wait_lock, `data` by
// the running-process discipline (only the process itself, or a ProcGuard of
// an unpublished/zombie slot, touches it), and everything else is a lock or
// an atomic.
unsafe impl Sync for Proc {}
unsafe impl Send for Proc {}

impl Proc {
    pub(crate) fn new() -> Self {
        Self {
            parent: UnsafeCell::new(ptr::null()),
            info: Spinlock::new("proc", ProcInfo::new()),
            data: UnsafeCell::new(ProcData::new()),
            child_waitchannel: WaitChannel::new(),
            killed: AtomicBool::new(false),
        }
    }

    pub(crate) fn lock(&self) -> ProcGuard<'_> {
        mem::forget(self.info.lock());
        ProcGuard { proc: self }
    }

    /// Kill the process; it dies at its next return to user mode.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// This process's pid without taking the slot lock, for paths that may
    /// not block (procdump, getppid's read of a parent that cannot be
    /// reaped while wait_lock is held).
    pub(crate) unsafe fn pid_raw(&self) -> Pid {
        unsafe { (*self.info.get_mut_raw()).pid }
    }

    /// The parent link. Callers prove they hold `wait_lock` with the guard.
    pub(crate) fn get_mut_parent<'b>(&self, _guard: &'b mut WaitGuard<'_>) -> &'b mut *const Proc {
        unsafe { &mut *self.parent.get() }
    }
}

/// Proof that the slot's lock is held: created by `Proc::lock`, releases on
/// drop. `freeproc` (here `clear`) takes one instead of re-checking
/// `holding()` at run time.
pub struct ProcGuard<'s> {
    proc: &'s Proc,
}

impl<'s> ProcGuard<'s> {
    pub(crate) fn deref_info(&self) -> &ProcInfo {
        // SAFETY: self.info is locked.
        unsafe { &*self.info.get_mut_raw() }
    }

    pub(crate) fn deref_mut_info(&mut self) -> &mut ProcInfo {
        // SAFETY: self.info is locked and &mut self is exclusive.
        unsafe { &mut *self.info.get_mut_raw() }
    }

    /// Mutable access to the slot's private data.
    ///
    /// # Safety
    ///
    /// The slot must not be running: either it is not yet published
    /// RUNNABLE, or it is a ZOMBIE being reaped, or the caller is the
    /// process itself.
    pub(crate) unsafe fn deref_mut_data(&mut self) -> &mut ProcData {
        unsafe { &mut *self.data.get() }
    }

    pub(crate) fn raw(&self) -> *const Proc {
        self.proc
    }

    pub fn state(&self) -> Procstate {
        self.deref_info().state
    }

    pub(crate) fn pid(&self) -> Pid {
        self.deref_info().pid
    }

    /// Wake process from sleep().
    pub(crate) fn wakeup(&mut self) {
        if self.state() == Procstate::SLEEPING {
            self.deref_mut_info().state = Procstate::RUNNABLE;
        }
    }

    /// Switch to scheduler. Must hold only this slot's lock and have changed
    /// the process's state. Saves and restores `interrupt_enabled` because
    /// it is a property of this kernel thread, not this CPU.
    pub(crate) unsafe fn sched(&mut self) {
        assert!(!cpu::intr_get(), "sched interruptible");
        assert_ne!(self.state(), Procstate::RUNNING, "sched running");
        let c = cpu::current();
        unsafe {
            assert_eq!((*c).noff, 1, "sched locks");
            let interrupt_enabled = (*c).interrupt_enabled;
            arch::swtch(&(*self.data.get()).context, &(*c).context);
            // swtch may have moved this thread to another cpu.
            let c = cpu::current();
            (*c).interrupt_enabled = interrupt_enabled;
        }
    }

    /// The last switch of an exiting process: hand the hart (and this slot's
    /// lock) to the scheduler and end the kernel thread. The scheduler side
    /// releases the lock, so the guard must not run its destructor.
    pub(crate) unsafe fn sched_final(self) -> ! {
        assert!(!cpu::intr_get(), "sched interruptible");
        assert_eq!(self.state(), Procstate::ZOMBIE, "sched_final not zombie");
        let c = cpu::current();
        unsafe {
            assert_eq!((*c).noff, 1, "sched locks");
            let sched_context = &(*c).context as *const Context;
            mem::forget(self);
            arch::swtch_final(&*sched_context);
        }
        arch::exit_thread()
    }

    /// Free a proc structure and the data hanging from it, including user
    /// pages. The slot lock is held by construction; a `WaitGuard` must be
    /// supplied to also clear the parent link.
    pub(crate) fn clear(&mut self, parent_guard: Option<&mut WaitGuard<'_>>, kmem: &Spinlock<Kmem>) {
        // SAFETY: the slot is being torn down; nothing runs on it.
        let data = unsafe { &mut *self.data.get() };
        let trap_frame = mem::replace(&mut data.trap_frame, ptr::null_mut());
        if !trap_frame.is_null() {
            // SAFETY: allocproc leaked exactly this page into the pointer.
            kmem.lock().free(unsafe { crate::kalloc::Page::from_usize(trap_frame as usize) });
        }
        if let Some(memory) = data.memory.take() {
            memory.free(kmem);
        }
        // Unpark the slot's kernel thread if it never got to run.
        data.context.retire();
        for file in data.open_files.iter_mut() {
            let _ = file.take();
        }
        data.cwd = None;
        data.name.clear();
        data.last_tick = 0;

        if let Some(guard) = parent_guard {
            *self.proc.get_mut_parent(guard) = ptr::null();
        }

        let info = self.deref_mut_info();
        info.waitchannel = ptr::null();
        info.pid = 0;
        info.xstate = 0;
        info.mem_id = 0;
        info.user_stack = 0;
        info.level = 0;
        info.ticks_used = 0;
        info.priority = 0;
        info.state = Procstate::UNUSED;

        self.killed.store(false, Ordering::Release);
    }

    /// Temporarily release the slot lock, run `f`, and reacquire. Used where
    /// the lock order demands `wait_lock` before this lock.
    pub(crate) fn reacquire_after<F, U>(&mut self, f: F) -> U
    where
        F: FnOnce(&Proc) -> U,
    {
        unsafe { self.info.unlock() };
        let result = f(self.proc);
        mem::forget(self.info.lock());
        result
    }
}

impl std::ops::Deref for ProcGuard<'_> {
    type Target = Proc;

    fn deref(&self) -> &Self::Target {
        self.proc
    }
}

impl Drop for ProcGuard<'_> {
    fn drop(&mut self) {
        unsafe { self.proc.info.unlock() };
    }
}

/// The current Cpu's process. Grants lock-free access to the process's
/// private `ProcData`.
pub struct CurrentProc<'s> {
    inner: &'s Proc,
}

impl<'s> CurrentProc<'s> {
    pub fn pid(&self) -> Pid {
        // pid is not modified while the process runs.
        unsafe { self.inner.pid_raw() }
    }

    pub fn deref_data(&self) -> &ProcData {
        // SAFETY: data is private to the running process.
        unsafe { &*self.inner.data.get() }
    }

    pub fn deref_mut_data(&mut self) -> &mut ProcData {
        unsafe { &mut *self.inner.data.get() }
    }

    pub fn trap_frame(&self) -> &TrapFrame {
        self.deref_data().trap_frame()
    }

    pub fn trap_frame_mut(&mut self) -> &mut TrapFrame {
        self.deref_mut_data().trap_frame_mut()
    }

    /// This process's handle on its address space. Every process that runs
    /// has one.
    pub fn memory(&self) -> &UserMemory {
        self.deref_data().memory.as_ref().unwrap()
    }

    pub(crate) fn raw(&self) -> *const Proc {
        self.inner
    }
}

impl std::ops::Deref for CurrentProc<'_> {
    type Target = Proc;

    fn deref(&self) -> &Self::Target {
        self.inner
    }
}

/// The context of the current kernel thread: the kernel it belongs to and
/// the process it runs.
pub struct KernelCtx<'s> {
    kernel: &'s Kernel,
    proc: CurrentProc<'s>,
}

impl<'s> KernelCtx<'s> {
    pub fn kernel(&self) -> &'s Kernel {
        self.kernel
    }

    pub fn proc(&self) -> &CurrentProc<'s> {
        &self.proc
    }

    pub fn proc_mut(&mut self) -> &mut CurrentProc<'s> {
        &mut self.proc
    }

    /// Give up the CPU for one scheduling round.
    // Its name cannot be `yield` because `yield` is a reserved keyword.
    pub fn yield_cpu(&self) {
        let mut guard = self.proc.lock();
        guard.deref_mut_info().state = Procstate::RUNNABLE;
        unsafe { guard.sched() };
    }
}

/// Creates the `KernelCtx` of the current Cpu; panics if no process runs on
/// it. The ctx is usable only inside the given closure.
pub(crate) fn kernel_ctx<F, R>(f: F) -> R
where
    F: for<'s> FnOnce(KernelCtx<'s>) -> R,
{
    let cpu = cpu::current();
    // SAFETY: the kernel outlives every bound thread, and `proc` stays
    // current for the duration of the closure.
    let (kernel, proc) = unsafe {
        let kernel = &*(*cpu).kernel;
        let proc = (*cpu).proc;
        assert!(!proc.is_null(), "kernel_ctx: no current proc");
        (kernel, &*proc)
    };
    f(KernelCtx {
        kernel,
        proc: CurrentProc { inner: proc },
    })
}
