//! File-system collaborators, reduced to what the process core exercises:
//! refcounted file and inode handles (dup on `fork`/`clone`, release on
//! `exit`/reap) and the transaction token that brackets inode releases.

use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Arc;

use crate::lock::{Spinlock, SpinlockGuard};

pub struct File {
    pub readable: bool,
    pub writable: bool,
}

/// A reference-counted handle to an open file. Dropping the last handle
/// closes the file.
#[derive(Clone)]
pub struct RcFile {
    inner: Arc<File>,
}

impl RcFile {
    pub fn new(readable: bool, writable: bool) -> Self {
        Self {
            inner: Arc::new(File { readable, writable }),
        }
    }

    /// Increment ref count for the file.
    pub fn dup(&self) -> Self {
        self.clone()
    }

    /// Number of live handles, counting this one.
    pub fn refs(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

pub struct Inode {
    pub inum: u32,
}

/// A reference-counted handle to an in-memory inode. Dropping the last
/// handle puts the inode.
#[derive(Clone)]
pub struct RcInode {
    inner: Arc<Inode>,
}

impl RcInode {
    fn new(inum: u32) -> Self {
        Self {
            inner: Arc::new(Inode { inum }),
        }
    }

    pub fn inum(&self) -> u32 {
        self.inner.inum
    }
}

pub struct FileSystem {
    /// Set by the first process to reach `forkret`.
    initialized: AtomicBool,

    /// The root directory.
    root: RcInode,

    /// Stand-in for the log's outstanding-op accounting.
    log: Spinlock<()>,
}

/// Bracket of a file-system operation (`begin_op`/`end_op`): inode releases
/// happen inside one.
pub struct FsTransaction<'s> {
    _guard: SpinlockGuard<'s, ()>,
}

impl FileSystem {
    pub(crate) fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            root: RcInode::new(1),
            log: Spinlock::new("log", ()),
        }
    }

    /// Mount the root device. Called once, from the first `forkret`; the
    /// fence publishes the initialization to every other hart.
    pub(crate) fn init(&self, _dev: u32) {
        if !self.initialized.swap(true, Ordering::SeqCst) {
            fence(Ordering::SeqCst);
        }
    }

    pub fn initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// The root directory, for `cwd` of the first process.
    pub fn namei_root(&self) -> RcInode {
        self.root.clone()
    }

    pub fn begin_tx(&self) -> FsTransaction<'_> {
        FsTransaction {
            _guard: self.log.lock(),
        }
    }
}
