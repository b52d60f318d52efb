//! The kernel object and the hosted machine around it.
//!
//! There is no global `KERNEL` static: a `Machine` owns one pinned kernel,
//! so several machines can coexist in one test binary. Harts are OS threads
//! running the scheduler loop; a timer thread advances `ticks`. `poweroff`
//! (the teaching kernel's QEMU finisher) stops the harts and the timer and
//! becomes the machine's exit code.

use std::fmt;
use std::marker::PhantomPinned;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use pin_project::pin_project;

use crate::arch;
use crate::cpu::{self, Cpus};
use crate::file::FileSystem;
use crate::kalloc::Kmem;
use crate::lock::{Sleepablelock, Spinlock};
use crate::param::{KMEMPAGES, NCPU, TICK_MS};
use crate::proc::{self, KernelCtx, Procs};
use crate::sched::Policy;
use crate::user::UserText;

/// Hart reserved for the host thread that boots (and, in tests, inspects)
/// the machine.
const MONITOR_HART: usize = NCPU - 2;

/// Hart reserved for the timer.
const TIMER_HART: usize = NCPU - 1;

/// The console sink.
pub struct Printer;

impl fmt::Write for Printer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        eprint!("{}", s);
        Ok(())
    }
}

/// The kernel.
///
/// Pinned inside its `Machine`: `Procs::initial_proc` and the per-CPU
/// kernel backpointers point into it.
#[pin_project]
pub struct Kernel {
    /// Set when any kernel thread suffers a genuine panic; the harts stop
    /// scheduling.
    panicked: AtomicBool,

    /// Set by poweroff.
    halted: AtomicBool,
    exit_code: AtomicI32,

    printer: Spinlock<Printer>,

    /// The page allocator.
    kmem: Spinlock<Kmem>,

    /// Serializes growproc across every address space; never held across a
    /// slot lock.
    memlock: Spinlock<()>,

    /// Clock ticks since boot. sys_sleep sleeps on its channel.
    ticks: Sleepablelock<u32>,

    /// The scheduling-policy state.
    policy: Policy,

    pub file_system: FileSystem,

    /// The user programs, frozen at boot.
    user_text: UserText,

    /// Current process system.
    #[pin]
    procs: Procs,

    cpus: Cpus,

    #[pin]
    _marker: PhantomPinned,
}

// SAFETY: the raw pointers inside (`cpu.proc`, `cpu.kernel`,
// `Procs::initial_proc`, the parent links) all point into this pinned
// kernel or its pool and are governed by the documented lock discipline.
unsafe impl Send for Kernel {}
unsafe impl Sync for Kernel {}

impl Kernel {
    fn new(kmem_pages: usize, user_text: UserText) -> Self {
        Self {
            panicked: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            exit_code: AtomicI32::new(0),
            printer: Spinlock::new("PRINTLN", Printer),
            kmem: Spinlock::new("KMEM", Kmem::new(kmem_pages)),
            memlock: Spinlock::new("memlock", ()),
            ticks: Sleepablelock::new("time", 0),
            policy: Policy::new(),
            file_system: FileSystem::new(),
            user_text,
            procs: Procs::new(),
            cpus: Cpus::new(),
            _marker: PhantomPinned,
        }
    }

    pub fn procs(&self) -> &Procs {
        &self.procs
    }

    pub(crate) fn kmem(&self) -> &Spinlock<Kmem> {
        &self.kmem
    }

    pub(crate) fn memlock(&self) -> &Spinlock<()> {
        &self.memlock
    }

    pub(crate) fn ticks(&self) -> &Sleepablelock<u32> {
        &self.ticks
    }

    pub(crate) fn ticks_now(&self) -> u32 {
        *self.ticks.lock()
    }

    pub(crate) fn policy(&self) -> &Policy {
        &self.policy
    }

    pub(crate) fn user_text(&self) -> &UserText {
        &self.user_text
    }

    pub(crate) fn cpus(&self) -> &Cpus {
        &self.cpus
    }

    pub(crate) fn set_panicked(&self) {
        self.panicked.store(true, Ordering::Release);
    }

    pub fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }

    pub(crate) fn halt(&self, code: i32) {
        self.exit_code.store(code, Ordering::Release);
        self.halted.store(true, Ordering::Release);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Acquire)
    }

    /// Prints the given formatted string to the console.
    pub fn printer_write_fmt(&self, args: fmt::Arguments<'_>) -> fmt::Result {
        use fmt::Write;
        if self.is_panicked() {
            // Skip the lock to avoid wedging a panicked machine further.
            unsafe { (*self.printer.get_mut_raw()).write_fmt(args) }
        } else {
            let mut printer = self.printer.lock();
            printer.write_fmt(args)
        }
    }

    /// Print a process listing to the console. For debugging; on hardware
    /// this hangs off the console's ^P escape.
    pub fn procdump(&self) {
        self.procs.dump(self);
    }
}

/// Shut the machine down with the given exit code. Stops the harts and the
/// timer; the calling process never runs again.
pub(crate) fn machine_poweroff(ctx: &KernelCtx<'_>, code: i32) -> ! {
    ctx.kernel().halt(code);
    // Hand the hart back; with the machine halted nothing schedules this
    // process again, but a hart mid-selection may run it once more.
    loop {
        ctx.yield_cpu();
    }
}

pub struct MachineOpts {
    /// Scheduler harts, at most `NCPU - 2`.
    pub ncpu: usize,
    /// Pages the allocator hands out.
    pub kmem_pages: usize,
}

impl Default for MachineOpts {
    fn default() -> Self {
        Self {
            ncpu: 1,
            kmem_pages: KMEMPAGES,
        }
    }
}

/// A booted machine: a pinned kernel plus its hart and timer threads.
pub struct Machine {
    kernel: Pin<Arc<Kernel>>,
    harts: Vec<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

impl Machine {
    /// Boot: build the kernel, set up the first user process from the
    /// machine's user text, then start the scheduler harts and the timer.
    pub fn boot(opts: MachineOpts, text: UserText) -> Machine {
        assert!(
            opts.ncpu >= 1 && opts.ncpu <= NCPU - 2,
            "boot: bad hart count"
        );
        assert!(text.has_init(), "boot: no init program");
        Self::boot_inner(opts.ncpu, opts.kmem_pages, text, true)
    }

    /// A bare machine for unit tests: no harts, no timer, no first process;
    /// drive the kernel from the monitor hart via `with_hart`.
    #[cfg(test)]
    pub(crate) fn boot_for_test() -> Machine {
        Self::boot_inner(0, KMEMPAGES, UserText::new(), false)
    }

    fn boot_inner(ncpu: usize, kmem_pages: usize, text: UserText, userinit: bool) -> Machine {
        arch::install_host_hooks();

        let mut arc = Arc::new(Kernel::new(kmem_pages, text));
        let kernel_ptr = Arc::as_ptr(&arc);
        {
            // Sole owner until the harts start.
            let kernel = Arc::get_mut(&mut arc).unwrap();
            kernel.cpus.init(kernel_ptr);

            // The boot thread works from the reserved monitor hart.
            unsafe { cpu::bind(kernel.cpus.as_ptr(MONITOR_HART)) };

            // SAFETY: the kernel is in its final home inside the Arc.
            let pinned = unsafe { Pin::new_unchecked(kernel) };
            let proj = pinned.project();
            let mut procs = proj.procs;
            procs.as_mut().init();
            if userinit {
                let cwd = proj.file_system.namei_root();
                // Boot is FCFS; the first process carries the sentinels.
                procs.user_proc_init(cwd, proj.kmem, (-1, -1, -1));
            }
        }
        let kernel = unsafe { Pin::new_unchecked(arc) };

        let mut harts = Vec::new();
        for i in 0..ncpu {
            let k = kernel.clone();
            harts.push(
                thread::Builder::new()
                    .name(format!("hart{}", i))
                    .spawn(move || {
                        unsafe { cpu::bind(k.cpus().as_ptr(i)) };
                        proc::scheduler(&k);
                    })
                    .expect("boot: hart"),
            );
        }

        let timer = if ncpu > 0 {
            let k = kernel.clone();
            Some(
                thread::Builder::new()
                    .name("timer".into())
                    .spawn(move || {
                        unsafe { cpu::bind(k.cpus().as_ptr(TIMER_HART)) };
                        while !k.is_halted() && !k.is_panicked() {
                            thread::sleep(Duration::from_millis(TICK_MS));
                            let mut ticks = k.ticks().lock();
                            let now = ticks.wrapping_add(1);
                            *ticks = now;
                            ticks.wakeup(&k);
                        }
                    })
                    .expect("boot: timer"),
            )
        } else {
            None
        };

        Machine {
            kernel,
            harts,
            timer,
        }
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Run the caller against the kernel from the reserved monitor hart.
    /// One inspecting thread at a time.
    pub fn with_hart<R>(&self, f: impl FnOnce(&Kernel) -> R) -> R {
        let prev = arch::hart();
        unsafe { cpu::bind(self.kernel.cpus().as_ptr(MONITOR_HART)) };
        let _restore = scopeguard::guard((), move |()| arch::bind(prev));
        f(&self.kernel)
    }

    /// Wait for the machine to power off; returns the exit code.
    /// Panics if any kernel thread panicked.
    pub fn run(mut self) -> i32 {
        for hart in self.harts.drain(..) {
            if hart.join().is_err() {
                self.kernel.set_panicked();
            }
        }
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
        assert!(!self.kernel.is_panicked(), "kernel panicked");
        self.kernel.exit_code()
    }
}
