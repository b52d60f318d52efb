use std::marker::PhantomPinned;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;

use array_macro::array;
use itertools::izip;
use pin_project::pin_project;

use super::{kernel_ctx, KernelCtx, Pid, Proc, ProcGuard, Procstate, TrapFrame};
use crate::arch::{self, ContextHandle, Handoff};
use crate::cpu::{self, Cpu};
use crate::file::RcInode;
use crate::kalloc::Kmem;
use crate::kernel::Kernel;
use crate::lock::{Spinlock, SpinlockGuard};
use crate::memlayout::{kstack, PGSIZE};
use crate::param::{NPROC, ROOTDEV};
use crate::sched;
use crate::vm::{UVAddr, UserMemory};
use crate::KernelError;

/// A user program that calls exec("/init") on the real machine. The hosted
/// dispatcher never decodes it (user pc 0 selects the machine's init entry),
/// but it is what the first page of the first process contains.
const INITCODE: [u8; 52] = [
    0x17, 0x05, 0, 0, 0x13, 0x05, 0x45, 0x02, 0x97, 0x05, 0, 0, 0x93, 0x85, 0x35, 0x02, 0x93, 0x08,
    0x70, 0, 0x73, 0, 0, 0, 0x93, 0x08, 0x20, 0, 0x73, 0, 0, 0, 0xef, 0xf0, 0x9f, 0xff, 0x2f, 0x69,
    0x6e, 0x69, 0x74, 0, 0, 0x24, 0, 0, 0, 0, 0, 0, 0, 0,
];

/// What a reap delivers to the caller-supplied address: `wait` the exit
/// status, `join` the child's recorded user stack.
enum Deliver {
    Status,
    Stack,
}

/// Holds the wait_lock. Accessing any slot's `parent` link requires one.
pub struct WaitGuard<'s>(SpinlockGuard<'s, ()>);

impl<'s> WaitGuard<'s> {
    pub(crate) fn inner_mut(&mut self) -> &mut SpinlockGuard<'s, ()> {
        &mut self.0
    }
}

/// Process system type containing & managing whole processes.
///
/// `initial_proc` is set once by `user_proc_init` and points into
/// `process_pool`, so a `Procs` must never move; it is pinned inside the
/// `Kernel`.
#[pin_project]
pub struct Procs {
    nextpid: AtomicI32,

    #[pin]
    process_pool: [Proc; NPROC],

    initial_proc: *const Proc,

    // Helps ensure that wakeups of wait()ing
    // parents are not lost. Helps obey the
    // memory model when using p->parent.
    // Must be acquired before any p->lock.
    wait_lock: Spinlock<()>,

    #[pin]
    _marker: PhantomPinned,
}

impl Procs {
    pub(crate) fn new() -> Self {
        Self {
            nextpid: AtomicI32::new(1),
            process_pool: array![_ => Proc::new(); NPROC],
            initial_proc: ptr::null(),
            wait_lock: Spinlock::new("wait_lock", ()),
            _marker: PhantomPinned,
        }
    }

    /// Initialize the proc table at boot time.
    pub(crate) fn init(self: Pin<&mut Self>) {
        // SAFETY: we don't move the `Procs`.
        let this = unsafe { self.get_unchecked_mut() };
        for (i, p) in this.process_pool.iter_mut().enumerate() {
            p.data.get_mut().kstack = kstack(i);
        }
    }

    pub(crate) fn pool(&self) -> impl Iterator<Item = &Proc> {
        self.process_pool.iter()
    }

    pub(crate) fn initial_proc(&self) -> *const Proc {
        assert!(!self.initial_proc.is_null(), "initial_proc not set");
        self.initial_proc
    }

    fn allocpid(&self) -> Pid {
        self.nextpid.fetch_add(1, Ordering::Relaxed)
    }

    /// Acquires the wait_lock and returns the `WaitGuard`.
    pub(crate) fn wait_guard(&self) -> WaitGuard<'_> {
        WaitGuard(self.wait_lock.lock())
    }

    /// Look in the process table for an UNUSED proc. If found, initialize
    /// state required to run in the kernel (pid, scheduling fields for the
    /// mode in force, trapframe page, an empty page table, a kernel thread
    /// parked at forkret) and return with the slot's lock held.
    /// If there are no free procs, or a memory allocation fails, return Err.
    pub(crate) fn alloc(
        &self,
        kmem: &Spinlock<Kmem>,
        fields: (i32, i32, i32),
    ) -> Result<ProcGuard<'_>, KernelError> {
        for p in self.process_pool.iter() {
            let mut guard = p.lock();
            if guard.state() == Procstate::UNUSED {
                let (level, ticks_used, priority) = fields;
                {
                    let info = guard.deref_mut_info();
                    info.pid = self.allocpid();
                    info.state = Procstate::USED;
                    info.level = level;
                    info.ticks_used = ticks_used;
                    info.priority = priority;
                }

                // Allocate a trapframe page.
                let trap_frame = match kmem.lock().alloc() {
                    Some(page) => page,
                    None => {
                        guard.clear(None, kmem);
                        return Err(KernelError::OutOfMemory);
                    }
                };
                // SAFETY: the slot is not published yet.
                unsafe { guard.deref_mut_data() }.trap_frame =
                    trap_frame.into_usize() as *mut TrapFrame;

                // An empty user page table.
                let memory = match UserMemory::new(kmem) {
                    Ok(memory) => memory,
                    Err(err) => {
                        guard.clear(None, kmem);
                        return Err(err);
                    }
                };
                guard.deref_mut_info().mem_id = memory.mem_id();

                // Set up a fresh context parked at forkret, which returns to
                // user space: the slot's kernel thread is born here.
                let handle = {
                    let data = unsafe { guard.deref_mut_data() };
                    data.memory = Some(memory);
                    data.context = arch::Context::new();
                    data.last_tick = 0;
                    data.context.handle()
                };
                if spawn_kernel_thread(handle).is_err() {
                    guard.clear(None, kmem);
                    return Err(KernelError::OutOfMemory);
                }
                return Ok(guard);
            }
        }
        Err(KernelError::OutOfSlots)
    }

    /// Set up the first user process.
    pub(crate) fn user_proc_init(
        self: Pin<&mut Self>,
        cwd: RcInode,
        kmem: &Spinlock<Kmem>,
        fields: (i32, i32, i32),
    ) {
        // SAFETY: we don't move the `Procs`.
        let this = unsafe { self.get_unchecked_mut() };
        let initial = {
            let mut guard = this
                .alloc(kmem, fields)
                .expect("user_proc_init: Procs::alloc");

            {
                // SAFETY: the slot is not published yet.
                let data = unsafe { guard.deref_mut_data() };

                // Allocate one user page and copy initcode's instructions
                // and data into it.
                let memory = data.memory.as_ref().unwrap();
                memory
                    .grow(PGSIZE as isize, kmem)
                    .expect("user_proc_init: uvmfirst");
                memory
                    .copy_out_bytes(UVAddr::new(0), &INITCODE)
                    .expect("user_proc_init: initcode");

                // Prepare for the very first "return" from kernel to user.
                let tf = data.trap_frame_mut();
                tf.epc = 0; // user program counter
                tf.sp = PGSIZE; // user stack pointer

                data.name.push_str("initcode");
                data.cwd = Some(cwd);
            }
            guard.deref_mut_info().state = Procstate::RUNNABLE;
            guard.raw()
        };
        this.initial_proc = initial;
    }

    /// Create a new process, copying the parent. Sets up the child to
    /// return as if from the fork() system call.
    /// Returns Ok(new process id) on success, Err on error.
    pub fn fork(&self, ctx: &mut KernelCtx<'_>) -> Result<Pid, KernelError> {
        let kernel = ctx.kernel();
        let kmem = kernel.kmem();

        // Allocate process.
        let mut np = self.alloc(kmem, sched::initial_fields(kernel))?;

        // Copy user memory from parent to child.
        {
            // SAFETY: the child is not published yet.
            let npdata = unsafe { np.deref_mut_data() };
            if npdata
                .memory
                .as_ref()
                .unwrap()
                .copy_from(ctx.proc().memory(), kmem)
                .is_err()
            {
                np.clear(None, kmem);
                return Err(KernelError::OutOfMemory);
            }
        }

        {
            // SAFETY: the child is not published yet.
            let npdata = unsafe { np.deref_mut_data() };

            // Copy saved user registers.
            *npdata.trap_frame_mut() = *ctx.proc().trap_frame();

            // Cause fork to return 0 in the child.
            npdata.trap_frame_mut().a0 = 0;

            // Increment reference counts on open file descriptors.
            for (nf, f) in izip!(
                npdata.open_files.iter_mut(),
                ctx.proc().deref_data().open_files.iter()
            ) {
                if let Some(file) = f {
                    *nf = Some(file.dup());
                }
            }
            npdata.cwd = ctx.proc().deref_data().cwd.clone();
            npdata.name = ctx.proc().deref_data().name;
        }

        let pid = np.pid();
        let parent = ctx.proc().raw();

        // The lock order is wait_lock -> p->lock, so drop the slot lock
        // while the parent link is written.
        np.reacquire_after(|proc| {
            let mut parent_guard = self.wait_guard();
            *proc.get_mut_parent(&mut parent_guard) = parent;
        });

        np.deref_mut_info().state = Procstate::RUNNABLE;

        Ok(pid)
    }

    /// Create a thread sharing the parent's address space. The child starts
    /// at `fcn` with `arg1`/`arg2` in its first argument registers and its
    /// stack pointer at the top of the caller-allocated `stack` page.
    /// Returns Ok(new thread's pid) on success, Err on error.
    pub fn clone_thread(
        &self,
        ctx: &mut KernelCtx<'_>,
        fcn: usize,
        arg1: usize,
        arg2: usize,
        stack: usize,
    ) -> Result<Pid, KernelError> {
        let kernel = ctx.kernel();
        let kmem = kernel.kmem();

        let mut np = self.alloc(kmem, sched::initial_fields(kernel))?;

        // Share the parent's address space: the fresh table from alloc goes
        // back, and the child's handle aliases the parent's table, so the
        // sizes agree by construction and stay that way.
        let shared = ctx.proc().memory().share();
        np.deref_mut_info().mem_id = shared.mem_id();
        {
            // SAFETY: the child is not published yet.
            let npdata = unsafe { np.deref_mut_data() };
            if let Some(fresh) = npdata.memory.replace(shared) {
                fresh.free(kmem);
            }
        }

        // Save the caller's stack page for join().
        np.deref_mut_info().user_stack = stack;

        {
            // SAFETY: the child is not published yet.
            let npdata = unsafe { np.deref_mut_data() };

            // Copy saved user registers, then point the child at its entry:
            // pc at fcn, stack at the top of the caller's page, and the two
            // arguments in a0/a1.
            *npdata.trap_frame_mut() = *ctx.proc().trap_frame();
            let tf = npdata.trap_frame_mut();
            tf.epc = fcn;
            tf.sp = stack + PGSIZE;
            tf.a0 = arg1;
            tf.a1 = arg2;

            // Increment reference counts on open file descriptors.
            for (nf, f) in izip!(
                npdata.open_files.iter_mut(),
                ctx.proc().deref_data().open_files.iter()
            ) {
                if let Some(file) = f {
                    *nf = Some(file.dup());
                }
            }
            npdata.cwd = ctx.proc().deref_data().cwd.clone();
            npdata.name = ctx.proc().deref_data().name;
        }

        let pid = np.pid();
        let parent = ctx.proc().raw();

        np.reacquire_after(|proc| {
            let mut parent_guard = self.wait_guard();
            *proc.get_mut_parent(&mut parent_guard) = parent;
        });

        np.deref_mut_info().state = Procstate::RUNNABLE;

        Ok(pid)
    }

    /// Wait for a child process to exit and return its pid; copies the exit
    /// status to `addr` unless null.
    pub fn wait(&self, addr: UVAddr, ctx: &mut KernelCtx<'_>) -> Result<Pid, KernelError> {
        self.reap(addr, Deliver::Status, ctx)
    }

    /// Like `wait`, but delivers the reaped child's recorded user stack, as
    /// handed to clone(), instead of its exit status.
    pub fn join(&self, addr: UVAddr, ctx: &mut KernelCtx<'_>) -> Result<Pid, KernelError> {
        self.reap(addr, Deliver::Stack, ctx)
    }

    fn reap(
        &self,
        addr: UVAddr,
        deliver: Deliver,
        ctx: &mut KernelCtx<'_>,
    ) -> Result<Pid, KernelError> {
        let mut parent_guard = self.wait_guard();

        loop {
            // Scan through the table looking for exited children.
            let mut havekids = false;
            for pp in self.process_pool.iter() {
                if *pp.get_mut_parent(&mut parent_guard) != ctx.proc().raw() {
                    continue;
                }
                // Make sure the child isn't still in exit() or swtch().
                let mut np = pp.lock();
                havekids = true;

                if np.state() == Procstate::ZOMBIE {
                    let pid = np.pid();
                    if !addr.is_null() {
                        let copied = match deliver {
                            Deliver::Status => {
                                ctx.proc().memory().copy_out(addr, &np.deref_info().xstate)
                            }
                            Deliver::Stack => ctx
                                .proc()
                                .memory()
                                .copy_out(addr, &np.deref_info().user_stack),
                        };
                        if copied.is_err() {
                            // Leave the zombie in place so the call can be
                            // retried with a good address.
                            return Err(KernelError::CopyFault);
                        }
                    }
                    // Reap the zombie child process.
                    np.clear(Some(&mut parent_guard), ctx.kernel().kmem());
                    return Ok(pid);
                }
            }

            // No point waiting if we don't have any children.
            if !havekids {
                return Err(KernelError::NoChild);
            }
            if ctx.proc().killed() {
                return Err(KernelError::Killed);
            }

            // Wait for a child to exit.
            //DOC: wait-sleep
            ctx.proc()
                .child_waitchannel
                .sleep(parent_guard.inner_mut(), ctx);
        }
    }

    /// Pass p's abandoned children to init. The caller holds the wait_lock.
    fn reparent(&self, proc: *const Proc, parent_guard: &mut WaitGuard<'_>, kernel: &Kernel) {
        for pp in self.process_pool.iter() {
            let parent = pp.get_mut_parent(parent_guard);
            if *parent == proc {
                *parent = self.initial_proc();
                unsafe { (*self.initial_proc()).child_waitchannel.wakeup(kernel) };
            }
        }
    }

    /// Exit the current process. Does not return. An exited process remains
    /// in the zombie state until its parent calls wait().
    pub fn exit_current(&self, status: i32, ctx: &mut KernelCtx<'_>) -> ! {
        assert!(
            !ptr::eq(ctx.proc().raw(), self.initial_proc()),
            "init exiting"
        );
        let kernel = ctx.kernel();

        // Close all open files.
        for file in ctx.proc_mut().deref_mut_data().open_files.iter_mut() {
            let _ = file.take();
        }

        // Releasing the working directory may write the disk.
        {
            let _tx = kernel.file_system.begin_tx();
            ctx.proc_mut().deref_mut_data().cwd = None;
        }

        let mut parent_guard = self.wait_guard();

        // Give any children to init.
        self.reparent(ctx.proc().raw(), &mut parent_guard, kernel);

        // Parent might be sleeping in wait(). Non-null since the exiting
        // process is not init.
        let parent = *ctx.proc().get_mut_parent(&mut parent_guard);
        unsafe { (*parent).child_waitchannel.wakeup(kernel) };

        let mut guard = ctx.proc().lock();
        guard.deref_mut_info().xstate = status;
        guard.deref_mut_info().state = Procstate::ZOMBIE;

        // Should manually drop since this function never returns.
        drop(parent_guard);

        // Jump into the scheduler, never to return.
        unsafe { guard.sched_final() }
    }

    /// Kill the process with the given pid, together with every slot that
    /// shares its address space (its whole thread group). The victims won't
    /// exit until they try to return to user space.
    pub fn kill(&self, pid: Pid) -> Result<(), KernelError> {
        if pid <= 0 {
            return Err(KernelError::NoSuchProc);
        }
        for p in self.process_pool.iter() {
            let guard = p.lock();
            if guard.pid() != pid {
                continue;
            }
            let group = guard.deref_info().mem_id;
            drop(guard);

            for q in self.process_pool.iter() {
                let mut qguard = q.lock();
                if ptr::eq(q, p) || (group != 0 && qguard.deref_info().mem_id == group) {
                    q.kill();
                    // Wake it so it notices the flag.
                    qguard.wakeup();
                }
            }
            return Ok(());
        }
        Err(KernelError::NoSuchProc)
    }

    /// Wake up all processes in the pool sleeping on the channel.
    /// Must be called without any p->lock.
    pub(crate) fn wakeup_pool(&self, target: &super::WaitChannel) {
        let current = cpu::current_proc();
        for p in self.process_pool.iter() {
            if p as *const Proc != current {
                let mut guard = p.lock();
                if guard.deref_info().waitchannel == target as *const _ {
                    guard.wakeup();
                }
            }
        }
    }

    /// Print a process listing to the console. For debugging.
    /// No lock to avoid wedging a stuck machine further.
    pub fn dump(&self, kernel: &Kernel) {
        let _ = kernel.printer_write_fmt(format_args!("\n"));
        for p in self.process_pool.iter() {
            let info = unsafe { &*p.info.get_mut_raw() };
            if let Procstate::UNUSED = info.state {
                continue;
            }
            let name = unsafe { &(*p.data.get()).name };
            let _ = kernel.printer_write_fmt(format_args!(
                "{} {} {}\n",
                info.pid,
                info.state.as_str(),
                name.as_str()
            ));
        }
    }
}

/// Grow or shrink the current process's user memory by n bytes; returns the
/// old size. `memlock` serializes growth, and is never held across a slot
/// lock.
pub(crate) fn growproc(ctx: &KernelCtx<'_>, n: i32) -> Result<usize, KernelError> {
    let kernel = ctx.kernel();
    let _memlock = kernel.memlock().lock();
    ctx.proc().memory().grow(n as isize, kernel.kmem())
}

/// Per-CPU process scheduler, one invocation per hart.
/// Loops, doing:
///  - choose a process to run per the policy in force.
///  - swtch to start running that process.
///  - eventually that process transfers control
///    via swtch back to the scheduler.
/// Returns only when the machine powers off.
pub(crate) fn scheduler(kernel: &Kernel) {
    let c = cpu::current();
    unsafe { (*c).proc = ptr::null() };
    loop {
        // Avoid deadlock by ensuring that devices can interrupt.
        cpu::intr_on();

        if kernel.is_halted() || kernel.is_panicked() {
            break;
        }

        match sched::pick_next(kernel) {
            Some(mut guard) => {
                // Switch to chosen process. It is the process's job to
                // release its lock and then reacquire it before jumping
                // back to us.
                guard.deref_mut_info().state = Procstate::RUNNING;
                unsafe {
                    (*c).proc = guard.raw();
                    arch::swtch(&(*c).context, &(*guard.data.get()).context);

                    // Process is done running for now. It should have
                    // changed its p->state before coming back.
                    (*c).proc = ptr::null();
                }
            }
            None => arch::wfi(),
        }
    }
}

/// A fork child's very first scheduling by scheduler() will swtch to
/// forkret.
unsafe fn forkret() -> ! {
    kernel_ctx(|mut ctx: KernelCtx<'_>| {
        // Still holding p->lock from scheduler.
        unsafe { ctx.proc().info.unlock() };

        // File system initialization must be run in the context of a
        // regular process (e.g., because it calls sleep), and thus cannot
        // be run from main().
        ctx.kernel().file_system.init(ROOTDEV);

        crate::trap::usertrapret(&mut ctx)
    });
    unreachable!("forkret: returned from user space")
}

/// Starts the kernel thread of a freshly allocated slot, parked until the
/// scheduler switches into its context for the first time.
fn spawn_kernel_thread(handle: ContextHandle) -> std::io::Result<()> {
    thread::Builder::new()
        .name("kproc".into())
        .spawn(move || {
            let hart = match handle.park() {
                Handoff::Run(hart) => hart,
                // Reclaimed before ever running.
                Handoff::Retire => return,
            };
            unsafe { cpu::bind(hart as *mut Cpu) };

            let result = panic::catch_unwind(AssertUnwindSafe(|| unsafe { forkret() }));
            if let Err(payload) = result {
                if payload.downcast_ref::<arch::ProcExited>().is_none() {
                    // A genuine panic on this kernel thread: freeze the
                    // machine, then hand the hart back so its scheduler
                    // observes the panic instead of waiting forever for a
                    // switch that won't come.
                    unsafe {
                        cpu::current_kernel().set_panicked();
                        arch::swtch_final(&(*cpu::current()).context);
                    }
                }
            }
        })
        .map(|_| ())
}
