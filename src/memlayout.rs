//! The layout of the modeled address space.
//!
//! User virtual addresses run from 0 to the process's mapped size; the
//! trampoline sits at the highest user virtual address with the trapframe
//! just below it, as on the real machine. Kernel stacks keep their
//! conventional high placement so each slot's `kstack` is a stable,
//! boot-assigned address.

/// Bytes per page.
pub const PGSIZE: usize = 4096;

/// One beyond the highest possible virtual address.
pub const MAXVA: usize = 1 << 38;

/// The trampoline page, at the highest user virtual address.
pub const TRAMPOLINE: usize = MAXVA - PGSIZE;

/// The trapframe page, just below the trampoline.
pub const TRAPFRAME: usize = TRAMPOLINE - PGSIZE;

/// Kernel stack of the `i`th process slot: high in memory, each followed by
/// an (unmapped) guard page.
pub const fn kstack(i: usize) -> usize {
    TRAMPOLINE - (i + 1) * 2 * PGSIZE
}
