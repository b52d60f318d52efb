//! System calls.
//!
//! Mostly argument marshalling, since we don't trust user code, and calls
//! into the inner methods. Arguments arrive in the trapframe's argument
//! registers; the return value goes back through a0.

use crate::proc::{CurrentProc, KernelCtx};

pub const SYS_FORK: usize = 1;
pub const SYS_EXIT: usize = 2;
pub const SYS_WAIT: usize = 3;
pub const SYS_KILL: usize = 6;
pub const SYS_GETPID: usize = 11;
pub const SYS_SBRK: usize = 12;
pub const SYS_SLEEP: usize = 13;
pub const SYS_UPTIME: usize = 14;
pub const SYS_POWEROFF: usize = 22;
pub const SYS_YIELD: usize = 23;
pub const SYS_GETPPID: usize = 24;
pub const SYS_GETLEV: usize = 25;
pub const SYS_SETPRIORITY: usize = 26;
pub const SYS_MLFQMODE: usize = 27;
pub const SYS_FCFSMODE: usize = 28;
pub const SYS_CLONE: usize = 29;
pub const SYS_JOIN: usize = 30;

impl CurrentProc<'_> {
    fn argraw(&self, n: usize) -> usize {
        let tf = self.trap_frame();
        match n {
            0 => tf.a0,
            1 => tf.a1,
            2 => tf.a2,
            3 => tf.a3,
            4 => tf.a4,
            5 => tf.a5,
            _ => panic!("argraw"),
        }
    }

    /// Fetch the nth 32-bit system call argument.
    pub(crate) fn argint(&self, n: usize) -> Result<i32, ()> {
        Ok(self.argraw(n) as i32)
    }

    /// Retrieve an argument as a pointer. Doesn't check for legality, since
    /// copyin/copyout will do that.
    pub(crate) fn argaddr(&self, n: usize) -> Result<usize, ()> {
        Ok(self.argraw(n))
    }
}

pub(crate) fn syscall(num: usize, ctx: &mut KernelCtx<'_>) -> usize {
    match num {
        SYS_FORK => ctx.sys_fork(),
        SYS_EXIT => ctx.sys_exit(),
        SYS_WAIT => ctx.sys_wait(),
        SYS_KILL => ctx.sys_kill(),
        SYS_GETPID => ctx.sys_getpid(),
        SYS_SBRK => ctx.sys_sbrk(),
        SYS_SLEEP => ctx.sys_sleep(),
        SYS_UPTIME => ctx.sys_uptime(),
        SYS_POWEROFF => ctx.sys_poweroff(),
        SYS_YIELD => ctx.sys_yield(),
        SYS_GETPPID => ctx.sys_getppid(),
        SYS_GETLEV => ctx.sys_getlev(),
        SYS_SETPRIORITY => ctx.sys_setpriority(),
        SYS_MLFQMODE => ctx.sys_mlfqmode(),
        SYS_FCFSMODE => ctx.sys_fcfsmode(),
        SYS_CLONE => ctx.sys_clone(),
        SYS_JOIN => ctx.sys_join(),
        _ => {
            let _ = ctx.kernel().printer_write_fmt(format_args!(
                "{} {}: unknown sys call {}\n",
                ctx.proc().pid(),
                ctx.proc().deref_data().name.as_str(),
                num
            ));
            usize::MAX
        }
    }
}
