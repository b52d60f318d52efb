//! The hosted user space.
//!
//! Real user programs are ELF images; here they are entries registered in
//! the machine's user text before boot, selected by the trapframe's `epc`.
//! Entry 0 is initcode, the program the first process runs. A `UserCtx` is
//! what an entry gets to work with: the syscall vector, its two argument
//! registers, and access to its own user memory through the same
//! copyin/copyout paths a real pointer dereference would exercise.

use zerocopy::{AsBytes, FromBytes};

use crate::proc::KernelCtx;
use crate::syscall::*;
use crate::trap;
use crate::vm::UVAddr;
use crate::KernelError;

/// A user program entry. The return value becomes the exit status.
pub type UserFn = Box<dyn Fn(&mut UserCtx<'_, '_>) -> i32 + Send + Sync>;

/// The user programs of one machine, frozen at boot. Index 0 is initcode.
pub struct UserText {
    init: Option<UserFn>,
    entries: Vec<UserFn>,
}

impl UserText {
    pub fn new() -> Self {
        Self {
            init: None,
            entries: Vec::new(),
        }
    }

    /// Install the init program, at user pc 0.
    pub fn set_init<F>(&mut self, f: F)
    where
        F: Fn(&mut UserCtx<'_, '_>) -> i32 + Send + Sync + 'static,
    {
        self.init = Some(Box::new(f));
    }

    /// Register a program; returns its user pc, for `clone` and
    /// `set_entry`.
    pub fn register<F>(&mut self, f: F) -> usize
    where
        F: Fn(&mut UserCtx<'_, '_>) -> i32 + Send + Sync + 'static,
    {
        self.entries.push(Box::new(f));
        self.entries.len()
    }

    pub fn has_init(&self) -> bool {
        self.init.is_some()
    }

    pub(crate) fn entry(&self, epc: usize) -> Option<&UserFn> {
        if epc == 0 {
            self.init.as_ref()
        } else {
            self.entries.get(epc - 1)
        }
    }
}

impl Default for UserText {
    fn default() -> Self {
        Self::new()
    }
}

/// What a user program runs against: its argument registers as of entry,
/// and the machine underneath.
pub struct UserCtx<'a, 's> {
    ctx: &'a mut KernelCtx<'s>,
    a0: usize,
    a1: usize,
}

impl<'a, 's> UserCtx<'a, 's> {
    pub(crate) fn new(ctx: &'a mut KernelCtx<'s>, a0: usize, a1: usize) -> Self {
        Self { ctx, a0, a1 }
    }

    /// First argument register as of entry: 0 in a forked child, `arg1` in
    /// a cloned thread.
    pub fn arg0(&self) -> usize {
        self.a0
    }

    /// Second argument register as of entry: `arg2` in a cloned thread.
    pub fn arg1(&self) -> usize {
        self.a1
    }

    /// The saved user stack pointer: the top of the caller-provided stack
    /// page in a cloned thread.
    pub fn sp(&self) -> usize {
        self.ctx.proc().trap_frame().sp
    }

    /// Trap into the kernel: arguments into the argument registers, the
    /// syscall number into a7, and back with a0.
    pub fn ecall(&mut self, num: usize, args: [usize; 4]) -> isize {
        {
            let tf = self.ctx.proc_mut().trap_frame_mut();
            tf.a0 = args[0];
            tf.a1 = args[1];
            tf.a2 = args[2];
            tf.a3 = args[3];
            tf.a7 = num;
        }
        trap::usertrap_syscall(self.ctx);
        self.ctx.proc().trap_frame().a0 as isize
    }

    /// A point where the timer may preempt, as any instruction boundary is
    /// on hardware. A pending kill lands here too.
    pub fn pause(&mut self) {
        trap::usertrap_clock(self.ctx);
    }

    /// Point the saved user pc at `entry`, so a subsequent `fork`'s child
    /// resumes there.
    pub fn set_entry(&mut self, entry: usize) {
        self.ctx.proc_mut().trap_frame_mut().epc = entry;
    }

    /// Read a value from this process's user memory.
    pub fn read<T: AsBytes + FromBytes + Default>(&self, addr: usize) -> Result<T, KernelError> {
        let mut value = T::default();
        self.ctx
            .proc()
            .memory()
            .copy_in(&mut value, UVAddr::new(addr))?;
        Ok(value)
    }

    /// Write a value into this process's user memory.
    pub fn write<T: AsBytes>(&mut self, addr: usize, value: &T) -> Result<(), KernelError> {
        self.ctx.proc().memory().copy_out(UVAddr::new(addr), value)
    }

    pub fn fork(&mut self) -> isize {
        self.ecall(SYS_FORK, [0; 4])
    }

    pub fn exit(&mut self, status: i32) -> ! {
        let _ = self.ecall(SYS_EXIT, [status as usize, 0, 0, 0]);
        unreachable!("exit returned")
    }

    pub fn wait(&mut self, addr: usize) -> isize {
        self.ecall(SYS_WAIT, [addr, 0, 0, 0])
    }

    pub fn getpid(&mut self) -> i32 {
        self.ecall(SYS_GETPID, [0; 4]) as i32
    }

    pub fn getppid(&mut self) -> i32 {
        self.ecall(SYS_GETPPID, [0; 4]) as i32
    }

    pub fn kill(&mut self, pid: i32) -> isize {
        self.ecall(SYS_KILL, [pid as usize, 0, 0, 0])
    }

    pub fn sleep(&mut self, ticks: i32) -> isize {
        self.ecall(SYS_SLEEP, [ticks as usize, 0, 0, 0])
    }

    pub fn uptime(&mut self) -> isize {
        self.ecall(SYS_UPTIME, [0; 4])
    }

    pub fn sbrk(&mut self, delta: i32) -> isize {
        self.ecall(SYS_SBRK, [delta as usize, 0, 0, 0])
    }

    pub fn yield_cpu(&mut self) -> isize {
        self.ecall(SYS_YIELD, [0; 4])
    }

    pub fn clone(&mut self, fcn: usize, arg1: usize, arg2: usize, stack: usize) -> isize {
        self.ecall(SYS_CLONE, [fcn, arg1, arg2, stack])
    }

    pub fn join(&mut self, addr: usize) -> isize {
        self.ecall(SYS_JOIN, [addr, 0, 0, 0])
    }

    pub fn getlev(&mut self) -> isize {
        self.ecall(SYS_GETLEV, [0; 4])
    }

    pub fn setpriority(&mut self, pid: i32, priority: i32) -> isize {
        self.ecall(SYS_SETPRIORITY, [pid as usize, priority as usize, 0, 0])
    }

    pub fn mlfqmode(&mut self) -> isize {
        self.ecall(SYS_MLFQMODE, [0; 4])
    }

    pub fn fcfsmode(&mut self) -> isize {
        self.ecall(SYS_FCFSMODE, [0; 4])
    }

    pub fn poweroff(&mut self, code: i32) -> ! {
        let _ = self.ecall(SYS_POWEROFF, [code as usize, 0, 0, 0]);
        unreachable!("poweroff returned")
    }
}
