//! Traps from user space, hosted.
//!
//! On hardware, `usertrap` runs on ecall and on device interrupts, and
//! `usertrapret` restores the user registers and sret's. Here the only trap
//! sources are the syscall vector (a user program calling `ecall`) and the
//! timer, which a running process observes at its trap boundaries: syscall
//! returns and the explicit preemption points of the hosted user program.
//! `usertrapret` "returns" to user space by dispatching the entry the
//! trapframe's `epc` names in the machine's user text.

use crate::proc::KernelCtx;
use crate::syscall;
use crate::user::UserCtx;

/// Handle a system call from user space: dispatch on the trapframe's
/// syscall number, store the return value in a0, then do what the return
/// path to user space does (die if killed, yield if the timer has fired).
pub(crate) fn usertrap_syscall(ctx: &mut KernelCtx<'_>) {
    let num = ctx.proc().trap_frame().a7;
    let ret = syscall::syscall(num, ctx);
    ctx.proc_mut().trap_frame_mut().a0 = ret;

    if ctx.proc().killed() {
        let kernel = ctx.kernel();
        kernel.procs().exit_current(-1, ctx);
    }

    clock_check(ctx);
}

/// A timer trap from user space: a kill lands here like on any other trap,
/// then the tick is accounted.
pub(crate) fn usertrap_clock(ctx: &mut KernelCtx<'_>) {
    if ctx.proc().killed() {
        let kernel = ctx.kernel();
        kernel.procs().exit_current(-1, ctx);
    }
    clock_check(ctx);
}

/// A trap boundary: if the clock advanced since this process last looked,
/// account the tick and give up the CPU, as the timer-interrupt arm of
/// usertrap does.
pub(crate) fn clock_check(ctx: &mut KernelCtx<'_>) {
    let now = *ctx.kernel().ticks().lock();
    let seen = ctx.proc().deref_data().last_tick;
    if now != seen {
        ctx.proc_mut().deref_mut_data().last_tick = now;
        crate::sched::clock_intr(ctx, now);
    }
}

/// Return to user space: run the entry named by the trapframe's `epc`. When
/// the entry returns, its value becomes the process's exit status.
/// A process killed before it gets back to user space dies here.
pub(crate) fn usertrapret(ctx: &mut KernelCtx<'_>) -> ! {
    if ctx.proc().killed() {
        let kernel = ctx.kernel();
        kernel.procs().exit_current(-1, ctx);
    }

    let (epc, a0, a1) = {
        let tf = ctx.proc().trap_frame();
        (tf.epc, tf.a0, tf.a1)
    };

    let status = match ctx.kernel().user_text().entry(epc) {
        Some(entry) => {
            let mut user = UserCtx::new(ctx, a0, a1);
            entry(&mut user)
        }
        // Jumping to unmapped text is fatal to the process.
        None => -1,
    };

    let kernel = ctx.kernel();
    kernel.procs().exit_current(status, ctx)
}
