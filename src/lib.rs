//! rv6-sched: the process control and scheduling core of an xv6-family
//! teaching kernel, modeled on the host.
//!
//! The kernel proper (the process table, the lifecycle operations
//! `fork`/`clone`/`exit`/`wait`/`join`/`kill`, the per-CPU scheduler with
//! interchangeable FCFS and MLFQ policies, and the sleep/wakeup primitive)
//! is the real thing, with the same locking discipline as on hardware. Only
//! the machine underneath is modeled: each hart is an OS thread, each
//! process's kernel thread is an OS thread parked in its `Context`, and
//! `swtch` is a park/unpark handoff (see `arch`). The lock-handoff contract
//! of `swtch` is preserved exactly: the scheduler holds `p.lock` across the
//! switch in, and the resumed side releases it.

#![deny(keyword_idents)]
#![deny(non_ascii_idents)]
#![deny(unused_import_braces)]
#![allow(dead_code)]

mod arch;
mod cpu;
mod file;
mod kalloc;
mod kernel;
mod lock;
mod memlayout;
mod param;
mod proc;
mod sched;
mod syscall;
mod sysproc;
mod trap;
mod user;
mod vm;

pub use crate::{
    kernel::{Kernel, Machine, MachineOpts},
    param::{NCPU, NOFILE, NPROC},
    proc::{KernelCtx, Procstate},
    sched::SchedMode,
    user::{UserCtx, UserText},
    vm::UVAddr,
};

/// Evaluates to the `Ok` value of `$e`, or short-circuits with `$err`.
#[macro_export]
macro_rules! ok_or {
    ($e:expr, $err:expr) => {
        match $e {
            Ok(r) => r,
            Err(_) => $err,
        }
    };
}

/// Evaluates to the `Some` value of `$e`, or short-circuits with `$err`.
#[macro_export]
macro_rules! some_or {
    ($e:expr, $err:expr) => {
        match $e {
            Some(r) => r,
            None => $err,
        }
    };
}

/// Error kinds of the fallible kernel operations.
///
/// The syscall layer flattens these into the wire codes (-1, and -2 for an
/// out-of-range priority). Programmer errors (lock discipline, init exiting)
/// are not errors but panics.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KernelError {
    /// No UNUSED slot in the process table.
    OutOfSlots,
    /// The page allocator is exhausted.
    OutOfMemory,
    /// copyin/copyout touched an unmapped user address.
    CopyFault,
    /// wait/join found no child of the calling process.
    NoChild,
    /// The calling process has been killed.
    Killed,
    /// No non-UNUSED slot carries the given pid.
    NoSuchProc,
    /// setpriority argument outside 0..=3.
    BadPriority,
    /// mlfqmode/fcfsmode called for the mode already in force.
    AlreadyInMode,
}
