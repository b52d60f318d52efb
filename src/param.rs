use static_assertions::const_assert;

/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Maximum number of CPUs.
///
/// The last two entries are reserved: one hart for the timer and one for the
/// host thread that boots (and, in tests, inspects) the machine. Scheduler
/// harts therefore number at most `NCPU - 2`.
pub const NCPU: usize = 8;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Device number of file system root disk.
pub const ROOTDEV: u32 = 1;

/// Maximum length of process name.
pub const MAXPROCNAME: usize = 16;

/// Number of MLFQ levels.
pub const NMLFQLEVEL: usize = 3;

/// Per-level MLFQ time quantum, in ticks. A process that uses up its quantum
/// is demoted one level; at the bottom level its priority is decremented
/// instead.
pub const MLFQ_QUANTUM: [i32; NMLFQLEVEL] = [4, 6, 8];

/// Highest (best) explicit priority of a bottom-level process.
pub const MLFQ_MAXPRIORITY: i32 = 3;

/// Ticks between global priority boosts, counted from the last mode switch.
pub const MLFQ_BOOST_INTERVAL: i32 = 64;

/// Interval of the hosted timer, in milliseconds of host time per tick.
pub const TICK_MS: u64 = 1;

/// Default number of pages the hosted page allocator hands out.
pub const KMEMPAGES: usize = 4096;

const_assert!(NCPU >= 3);
const_assert!(NPROC >= 2);
const_assert!(MLFQ_QUANTUM[0] > 0);
