//! Process-related system calls.

use crate::kernel::machine_poweroff;
use crate::ok_or;
use crate::proc::{growproc, KernelCtx};
use crate::sched;
use crate::vm::UVAddr;
use crate::KernelError;

/// -1 on the syscall wire.
const EFAIL: usize = usize::MAX;
/// -2 on the syscall wire: priority out of range.
const EBADPRIO: usize = usize::MAX - 1;

impl KernelCtx<'_> {
    pub(crate) fn sys_fork(&mut self) -> usize {
        let kernel = self.kernel();
        match kernel.procs().fork(self) {
            Ok(pid) => pid as usize,
            Err(_) => EFAIL,
        }
    }

    pub(crate) fn sys_exit(&mut self) -> usize {
        let n = ok_or!(self.proc().argint(0), return EFAIL);
        let kernel = self.kernel();
        kernel.procs().exit_current(n, self)
    }

    pub(crate) fn sys_wait(&mut self) -> usize {
        let addr = ok_or!(self.proc().argaddr(0), return EFAIL);
        let kernel = self.kernel();
        match kernel.procs().wait(UVAddr::new(addr), self) {
            Ok(pid) => pid as usize,
            Err(_) => EFAIL,
        }
    }

    pub(crate) fn sys_getpid(&mut self) -> usize {
        self.proc().pid() as usize
    }

    pub(crate) fn sys_getppid(&mut self) -> usize {
        let kernel = self.kernel();
        let mut parent_guard = kernel.procs().wait_guard();
        let parent = *self.proc().get_mut_parent(&mut parent_guard);
        if parent.is_null() {
            // The initial process has no parent.
            return 0;
        }
        // The parent cannot be reaped while wait_lock is held, and a dead
        // parent would have left us reparented to init.
        unsafe { (*parent).pid_raw() as usize }
    }

    pub(crate) fn sys_kill(&mut self) -> usize {
        let pid = ok_or!(self.proc().argint(0), return EFAIL);
        let kernel = self.kernel();
        match kernel.procs().kill(pid) {
            Ok(()) => 0,
            Err(_) => EFAIL,
        }
    }

    pub(crate) fn sys_sbrk(&mut self) -> usize {
        let n = ok_or!(self.proc().argint(0), return EFAIL);
        match growproc(self, n) {
            Ok(old_size) => old_size,
            Err(_) => EFAIL,
        }
    }

    pub(crate) fn sys_sleep(&mut self) -> usize {
        let n = ok_or!(self.proc().argint(0), return EFAIL);
        let n = if n < 0 { 0 } else { n as u32 };
        let kernel = self.kernel();
        let mut ticks = kernel.ticks().lock();
        let ticks0 = *ticks;
        while ticks.wrapping_sub(ticks0) < n {
            if self.proc().killed() {
                return EFAIL;
            }
            ticks.sleep(self);
        }
        0
    }

    /// How many clock tick interrupts have occurred since start.
    pub(crate) fn sys_uptime(&mut self) -> usize {
        *self.kernel().ticks().lock() as usize
    }

    pub(crate) fn sys_yield(&mut self) -> usize {
        self.yield_cpu();
        0
    }

    pub(crate) fn sys_getlev(&mut self) -> usize {
        sched::getlev(self)
    }

    pub(crate) fn sys_setpriority(&mut self) -> usize {
        let pid = ok_or!(self.proc().argint(0), return EFAIL);
        let priority = ok_or!(self.proc().argint(1), return EFAIL);
        match sched::set_priority(self.kernel(), pid, priority) {
            Ok(()) => 0,
            Err(KernelError::BadPriority) => EBADPRIO,
            Err(_) => EFAIL,
        }
    }

    pub(crate) fn sys_mlfqmode(&mut self) -> usize {
        let kernel = self.kernel();
        match sched::mlfq_mode(kernel) {
            Ok(()) => 0,
            Err(_) => {
                let _ = kernel.printer_write_fmt(format_args!("Error: already in MLFQ mode\n"));
                EFAIL
            }
        }
    }

    pub(crate) fn sys_fcfsmode(&mut self) -> usize {
        let kernel = self.kernel();
        match sched::fcfs_mode(kernel) {
            Ok(()) => 0,
            Err(_) => {
                let _ = kernel.printer_write_fmt(format_args!("Error: already in FCFS mode\n"));
                EFAIL
            }
        }
    }

    pub(crate) fn sys_clone(&mut self) -> usize {
        let fcn = ok_or!(self.proc().argaddr(0), return EFAIL);
        let arg1 = ok_or!(self.proc().argaddr(1), return EFAIL);
        let arg2 = ok_or!(self.proc().argaddr(2), return EFAIL);
        let stack = ok_or!(self.proc().argaddr(3), return EFAIL);
        let kernel = self.kernel();
        match kernel.procs().clone_thread(self, fcn, arg1, arg2, stack) {
            Ok(pid) => pid as usize,
            Err(_) => EFAIL,
        }
    }

    pub(crate) fn sys_join(&mut self) -> usize {
        let addr = ok_or!(self.proc().argaddr(0), return EFAIL);
        let kernel = self.kernel();
        match kernel.procs().join(UVAddr::new(addr), self) {
            Ok(pid) => pid as usize,
            Err(_) => EFAIL,
        }
    }

    pub(crate) fn sys_poweroff(&mut self) -> usize {
        let code = ok_or!(self.proc().argint(0), return EFAIL);
        machine_poweroff(self, code)
    }
}
