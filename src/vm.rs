//! User address spaces.
//!
//! A `PageTable` owns the user pages of one address space together with the
//! trampoline/trapframe mappings and the mapped size. A `UserMemory` is a
//! refcounted handle to one: `fork` builds a fresh table and deep-copies into
//! it, `clone` shares the parent's table, and the physical pages go back to
//! the allocator when the last handle is freed, so a thread group's teardown
//! is safe no matter which sibling is reaped last.
//! Since the mapped size lives in the shared table, every sibling reports
//! one value and `growproc` needs no propagation pass.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use zerocopy::{AsBytes, FromBytes};

use crate::kalloc::{Kmem, Page};
use crate::lock::Spinlock;
use crate::memlayout::{PGSIZE, TRAMPOLINE, TRAPFRAME};
use crate::KernelError;

bitflags! {
    /// Page permissions.
    pub struct PteFlags: usize {
        /// Readable.
        const R = 1 << 1;
        /// Writable.
        const W = 1 << 2;
        /// Executable.
        const X = 1 << 3;
        /// Accessible in user mode.
        const U = 1 << 4;
    }
}

/// A user virtual address.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct UVAddr(usize);

impl UVAddr {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub const fn into_usize(self) -> usize {
        self.0
    }
}

/// Identity of an address space. Monotonic and never reused, so two slots
/// belong to one thread group iff their ids are equal.
static NEXT_MEM_ID: AtomicU64 = AtomicU64::new(1);

struct PageTableInner {
    /// Bytes of user address space currently mapped.
    size: usize,

    /// The user pages; page `i` backs virtual addresses
    /// `i * PGSIZE .. (i + 1) * PGSIZE`.
    pages: Vec<Page>,

    /// Supervisor-only mappings at the top of the address space: the
    /// trampoline and the trapframe page.
    specials: Vec<(usize, PteFlags)>,

    /// Pages charged to this table for its own wiring.
    overhead: usize,
}

pub struct PageTable {
    mem_id: u64,
    inner: Spinlock<PageTableInner>,
}

/// A handle to a user address space, owned by a process slot. Handles of
/// thread siblings point to one `PageTable`.
pub struct UserMemory {
    table: Arc<PageTable>,
}

const fn pgroundup(n: usize) -> usize {
    (n + PGSIZE - 1) & !(PGSIZE - 1)
}

impl UserMemory {
    /// An empty user page table with the trampoline code (supervisor
    /// execute-only) mapped at the highest user virtual address and the
    /// trapframe page (read/write) just below it. Returns an error if the
    /// page allocator cannot back the table.
    pub(crate) fn new(kmem: &Spinlock<Kmem>) -> Result<Self, KernelError> {
        // An empty page table: one page of root wiring.
        if !kmem.lock().reserve(1) {
            return Err(KernelError::OutOfMemory);
        }
        let this = Self {
            table: Arc::new(PageTable {
                mem_id: NEXT_MEM_ID.fetch_add(1, Ordering::Relaxed),
                inner: Spinlock::new(
                    "pagetable",
                    PageTableInner {
                        size: 0,
                        pages: Vec::new(),
                        specials: Vec::new(),
                        overhead: 1,
                    },
                ),
            }),
        };

        // Map the trampoline code (for system call return) at the highest
        // user virtual address, then the trapframe page just below it; undo
        // everything if either mapping cannot be wired. Only the supervisor
        // uses them, so neither is PteFlags::U.
        if this
            .map_special(kmem, TRAMPOLINE, PteFlags::R | PteFlags::X)
            .is_err()
            || this
                .map_special(kmem, TRAPFRAME, PteFlags::R | PteFlags::W)
                .is_err()
        {
            this.free(kmem);
            return Err(KernelError::OutOfMemory);
        }
        Ok(this)
    }

    fn map_special(
        &self,
        kmem: &Spinlock<Kmem>,
        va: usize,
        perm: PteFlags,
    ) -> Result<(), KernelError> {
        if !kmem.lock().reserve(1) {
            return Err(KernelError::OutOfMemory);
        }
        let mut inner = self.table.inner.lock();
        inner.overhead += 1;
        inner.specials.push((va, perm));
        Ok(())
    }

    /// Another handle to the same address space, for a thread sibling.
    pub(crate) fn share(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
        }
    }

    /// Copy the whole of `src`, pages and size, into this (empty) table.
    /// On allocation failure nothing is kept.
    pub(crate) fn copy_from(
        &self,
        src: &UserMemory,
        kmem: &Spinlock<Kmem>,
    ) -> Result<(), KernelError> {
        let (size, copies) = {
            let src_inner = src.table.inner.lock();
            let mut copies = Vec::with_capacity(src_inner.pages.len());
            let mut kmem = kmem.lock();
            for page in src_inner.pages.iter() {
                match kmem.alloc() {
                    Some(mut copy) => {
                        copy.as_bytes_mut().copy_from_slice(page.as_bytes());
                        copies.push(copy);
                    }
                    None => {
                        for copy in copies.drain(..) {
                            kmem.free(copy);
                        }
                        return Err(KernelError::OutOfMemory);
                    }
                }
            }
            (src_inner.size, copies)
        };

        let mut inner = self.table.inner.lock();
        debug_assert!(inner.pages.is_empty());
        inner.pages = copies;
        inner.size = size;
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.table.inner.lock().size
    }

    pub fn mem_id(&self) -> u64 {
        self.table.mem_id
    }

    /// Grow or shrink the address space by `n` bytes; returns the old size.
    /// Callers serialize growth of a shared table through `memlock`.
    pub(crate) fn grow(&self, n: isize, kmem: &Spinlock<Kmem>) -> Result<usize, KernelError> {
        let mut inner = self.table.inner.lock();
        let old = inner.size;
        let new = match (old as isize).checked_add(n) {
            Some(sz) if sz >= 0 => sz as usize,
            _ => return Err(KernelError::OutOfMemory),
        };

        let want = pgroundup(new) / PGSIZE;
        let have = inner.pages.len();
        if want > have {
            let mut kmem = kmem.lock();
            for _ in have..want {
                match kmem.alloc() {
                    Some(page) => inner.pages.push(page),
                    None => {
                        // Deallocate what this call allocated.
                        while inner.pages.len() > have {
                            let page = inner.pages.pop().unwrap();
                            kmem.free(page);
                        }
                        return Err(KernelError::OutOfMemory);
                    }
                }
            }
        } else if want < have {
            let mut kmem = kmem.lock();
            while inner.pages.len() > want {
                let page = inner.pages.pop().unwrap();
                kmem.free(page);
            }
        }
        inner.size = new;
        Ok(old)
    }

    /// Copy `src` to the user address `dst`.
    pub fn copy_out_bytes(&self, dst: UVAddr, src: &[u8]) -> Result<(), KernelError> {
        let mut inner = self.table.inner.lock();
        let addr = dst.into_usize();
        if addr.checked_add(src.len()).map_or(true, |end| end > inner.size) {
            return Err(KernelError::CopyFault);
        }
        for (i, byte) in src.iter().enumerate() {
            let va = addr + i;
            inner.pages[va / PGSIZE].as_bytes_mut()[va % PGSIZE] = *byte;
        }
        Ok(())
    }

    /// Copy from the user address `src` into `dst`.
    pub fn copy_in_bytes(&self, dst: &mut [u8], src: UVAddr) -> Result<(), KernelError> {
        let inner = self.table.inner.lock();
        let addr = src.into_usize();
        if addr.checked_add(dst.len()).map_or(true, |end| end > inner.size) {
            return Err(KernelError::CopyFault);
        }
        for (i, byte) in dst.iter_mut().enumerate() {
            let va = addr + i;
            *byte = inner.pages[va / PGSIZE].as_bytes()[va % PGSIZE];
        }
        Ok(())
    }

    /// Copy a value to the user address `dst`.
    pub fn copy_out<T: AsBytes>(&self, dst: UVAddr, src: &T) -> Result<(), KernelError> {
        self.copy_out_bytes(dst, src.as_bytes())
    }

    /// Copy a value in from the user address `src`.
    pub fn copy_in<T: AsBytes + FromBytes>(
        &self,
        dst: &mut T,
        src: UVAddr,
    ) -> Result<(), KernelError> {
        self.copy_in_bytes(dst.as_bytes_mut(), src)
    }

    /// Drop this handle; the last handle returns the pages, data and
    /// wiring alike, to the allocator.
    pub(crate) fn free(self, kmem: &Spinlock<Kmem>) {
        if let Ok(table) = Arc::try_unwrap(self.table) {
            let inner = table.inner.into_inner();
            let mut kmem = kmem.lock();
            for page in inner.pages {
                kmem.free(page);
            }
            kmem.release(inner.overhead);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kmem(pages: usize) -> Spinlock<Kmem> {
        Spinlock::new("kmem", Kmem::new(pages))
    }

    // The lock layer needs a bound hart; run vm tests through a machine.
    fn with_vm_hart(f: impl FnOnce(&Spinlock<Kmem>)) {
        let machine = crate::kernel::Machine::boot_for_test();
        machine.with_hart(|_| f(&kmem(16)));
    }

    #[test]
    fn grow_and_copy_roundtrip() {
        with_vm_hart(|kmem| {
            let mem = UserMemory::new(kmem).unwrap();
            assert_eq!(mem.size(), 0);
            assert_eq!(mem.grow(PGSIZE as isize + 16, kmem).unwrap(), 0);
            assert_eq!(mem.size(), PGSIZE + 16);

            let val: u64 = 0xdeadbeef;
            mem.copy_out(UVAddr::new(PGSIZE - 4), &val).unwrap();
            let mut back: u64 = 0;
            mem.copy_in(&mut back, UVAddr::new(PGSIZE - 4)).unwrap();
            assert_eq!(back, val);

            // Out of bounds fails without touching anything.
            assert!(mem.copy_out(UVAddr::new(mem.size()), &val).is_err());
            mem.free(kmem);
        });
    }

    #[test]
    fn deep_copy_is_independent_and_share_is_not() {
        with_vm_hart(|kmem| {
            let a = UserMemory::new(kmem).unwrap();
            a.grow(PGSIZE as isize, kmem).unwrap();
            a.copy_out(UVAddr::new(0), &7u32).unwrap();

            let b = UserMemory::new(kmem).unwrap();
            b.copy_from(&a, kmem).unwrap();
            assert_ne!(a.mem_id(), b.mem_id());
            b.copy_out(UVAddr::new(0), &9u32).unwrap();
            let mut x: u32 = 0;
            a.copy_in(&mut x, UVAddr::new(0)).unwrap();
            assert_eq!(x, 7);

            let c = a.share();
            assert_eq!(a.mem_id(), c.mem_id());
            c.copy_out(UVAddr::new(0), &5u32).unwrap();
            a.copy_in(&mut x, UVAddr::new(0)).unwrap();
            assert_eq!(x, 5);

            // Growth through one handle is the size of all of them.
            c.grow(PGSIZE as isize, kmem).unwrap();
            assert_eq!(a.size(), 2 * PGSIZE);

            a.free(kmem);
            b.free(kmem);
            c.free(kmem);
        });
    }

    #[test]
    fn pages_return_to_the_allocator() {
        with_vm_hart(|kmem| {
            let before = kmem.lock().free_pages();
            let a = UserMemory::new(kmem).unwrap();
            a.grow(3 * PGSIZE as isize, kmem).unwrap();
            let b = a.share();
            assert!(kmem.lock().free_pages() < before);
            a.free(kmem);
            // The sibling still holds the table.
            assert!(kmem.lock().free_pages() < before);
            b.free(kmem);
            assert_eq!(kmem.lock().free_pages(), before);
        });
    }

    #[test]
    fn exhaustion_rolls_back() {
        with_vm_hart(|kmem| {
            let a = UserMemory::new(kmem).unwrap();
            let before = kmem.lock().free_pages();
            assert!(a.grow((before + 5) as isize * PGSIZE as isize, kmem).is_err());
            // Nothing kept from the failed growth.
            assert_eq!(kmem.lock().free_pages(), before);
            assert_eq!(a.size(), 0);
            a.free(kmem);
        });
    }
}
