//! # Hardware Address Translation (HAT)
//!
//! One contract ([`Hat`]) over two page-table formats:
//!
//! | Backend | Root | Levels | TLB tags |
//! |---------|------|--------|----------|
//! | [`x86_64::X86Hat`] | one PML4/PML5 frame (`CR3`) | 4 or 5 | PCID, `INVPCID` when present |
//! | [`aarch64::Aarch64Hat`] | `TTBR0` (user) + `TTBR1` (kernel) | 4 | 16-bit ASID |
//!
//! ## Virtual Address → table indices
//!
//! Every level consumes 9 bits of the virtual address:
//!
//! ```text
//! | 56‒48 | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  L5   |  L4   |  L3   |  L2   |  L1   | Offset |
//! ```
//!
//! The walk stops at L1 for a 4 KiB page or at L2 for a 2 MiB huge page
//! ([`MapFlags::HUGE`]). Intermediate tables are allocated on demand from a
//! [`FrameAlloc`]; all frames one insertion needs are reserved **before** the
//! tree is touched, so an out-of-memory insertion leaves no half-built chain.
//!
//! ## Kernel half
//!
//! Upper-half mappings are shared between every address space. On x86_64 the
//! root slots 256..512 are copied from the kernel root when a space is
//! created; on aarch64 all spaces share the kernel's `TTBR1` tree. Neither
//! [`Hat::scrub`] nor any other per-space operation frees kernel-half tables.
//!
//! ## Locking
//!
//! The HAT takes no locks for table edits: callers hold the owning address
//! space's lock. TLB invalidation sequences are serialized by one global
//! [`SpinLock`](kernel_sync::SpinLock) (see [`invalidate`]).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

extern crate alloc;

pub mod aarch64;
mod flags;
pub mod invalidate;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
mod table;
mod walk;
pub mod x86_64;

pub use flags::{CacheType, MapFlags, Translation};
pub use invalidate::{Invalidation, InvalidationMode};
pub use table::PageTable;
pub use walk::ScrubStats;

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Source of physical frames for page tables.
///
/// Implemented by the frame allocator; the HAT never allocates data pages.
pub trait FrameAlloc {
    /// One **zeroed**, 4 KiB-aligned frame for a page table.
    fn alloc_table(&self) -> Option<PhysicalAddress>;

    /// Return a table frame obtained from [`alloc_table`](Self::alloc_table).
    fn free_table(&self, table: PhysicalAddress);

    /// Drop the reference a still-mapped terminal entry holds on `frames`
    /// frames starting at `base`, if the allocator tracks them as allocated.
    ///
    /// Returns `false` for memory the allocator does not own (MMIO,
    /// firmware ranges), which is left alone.
    fn release_leaf(&self, base: PhysicalAddress, frames: usize) -> bool;
}

impl<A: FrameAlloc + ?Sized> FrameAlloc for &A {
    #[inline]
    fn alloc_table(&self) -> Option<PhysicalAddress> {
        (**self).alloc_table()
    }

    #[inline]
    fn free_table(&self, table: PhysicalAddress) {
        (**self).free_table(table);
    }

    #[inline]
    fn release_leaf(&self, base: PhysicalAddress, frames: usize) -> bool {
        (**self).release_leaf(base, frames)
    }
}

/// Errors from table edits.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HatError {
    /// Reserving the intermediate tables for an insertion failed; nothing was changed.
    #[error("out of memory ({needed} page-table frames needed)")]
    OutOfMemory { needed: usize },
}

/// Machine-independent page-table operations.
///
/// All methods act on an explicit root; callers serialize edits to the same
/// root. `resolve` never allocates.
pub trait Hat: Send + Sync {
    /// Per-space translation root.
    type Root: Copy + Eq + core::fmt::Debug + Send + Sync;

    /// Whether TLB maintenance reaches every CPU without software IPIs
    /// (aarch64 inner-shareable `TLBI`).
    const BROADCASTS_INVALIDATION: bool;

    /// Root of the kernel address space.
    fn kernel_root(&self) -> Self::Root;

    /// A fresh root with an empty user half and the kernel half shared.
    ///
    /// # Errors
    /// [`HatError::OutOfMemory`] if no frame is available for the root.
    fn create_root(&self) -> Result<Self::Root, HatError>;

    /// Map `virt → phys` with `flags`, replacing any existing leaf.
    ///
    /// # Errors
    /// [`HatError::OutOfMemory`] if the missing intermediate tables cannot be reserved.
    fn insert(
        &self,
        root: Self::Root,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: MapFlags,
    ) -> Result<(), HatError>;

    /// Clear the leaf mapping `virt` and return what it mapped.
    fn remove(&self, root: Self::Root, virt: VirtualAddress) -> Option<Translation>;

    /// Translate `virt`.
    fn resolve(&self, root: Self::Root, virt: VirtualAddress) -> Option<Translation>;

    /// Perform TLB maintenance on the **calling** CPU.
    fn invalidate(&self, root: Self::Root, request: Invalidation);

    /// Free the user half of `root`: every intermediate table, every
    /// allocator-owned frame still mapped, and the root itself.
    fn scrub(&self, root: Self::Root) -> ScrubStats;

    /// Switch the calling CPU to `root`, tagged with `asid`.
    fn load(&self, root: Self::Root, asid: u16);

    #[inline]
    fn is_user_half(&self, virt: VirtualAddress) -> bool {
        !virt.is_upper_half()
    }
}
