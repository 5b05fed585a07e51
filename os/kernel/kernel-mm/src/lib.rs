//! # Virtual Memory
//!
//! Address spaces, segments and page-fault handling on top of the frame
//! allocator ([`kernel_alloc`]) and a page-table backend ([`kernel_vmem::Hat`]).
//!
//! ```text
//!   trap entry ──► Vm::dispatch_fault ──► segment policy ──► FrameAllocator
//!                                               │
//!   scheduler ───► Vm::{create,fork,destroy}_space, Vm::load
//!                                               │
//!                        Vm::map_range ─────────┴──► Hat ──► shootdown ──► IPIs
//! ```
//!
//! One [`Vm`] exists per machine. It owns the backend, the ASID pool, the
//! per-CPU table and the kernel address space, and borrows the frame
//! allocator.
//!
//! ## Locking
//!
//! | Lock | Guards |
//! |------|--------|
//! | frame allocator | frame table, free lists |
//! | per [`AddressSpace`] | segment list, page-table edits of that root |
//! | shootdown | one cross-CPU invalidation at a time |
//! | [`kernel_vmem::invalidate::INVALIDATION_LOCK`] | local TLB maintenance sequences |
//!
//! Space locks are taken before the shootdown lock; the frame allocator
//! lock is innermost.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod asid;
pub mod cpu;
pub mod fault;
pub mod platform;
pub mod segment;
mod shootdown;
pub mod space;
#[cfg(test)]
mod testing;

pub use fault::{FaultError, FaultFlags};
pub use platform::Platform;
pub use segment::{FaultPolicy, MapMode, PageState, Protection, Segment, SegmentError, TrackedPage};
pub use space::{AddressSpace, KERNEL_SPACE_ID, SpaceId, VmError};

use crate::asid::AsidPool;
use crate::cpu::CpuTable;
use crate::shootdown::Shootdown;
use core::sync::atomic::AtomicU64;
use kernel_alloc::FrameAllocator;
use kernel_info::config::MmConfig;
use kernel_memory_addresses::{PhysMapper, VirtualAddress};
use kernel_vmem::{Hat, Translation};

/// The memory manager.
pub struct Vm<'a, M, H: Hat, P> {
    pfa: &'a FrameAllocator<M>,
    hat: H,
    platform: P,
    config: MmConfig,
    asids: AsidPool,
    cpus: CpuTable,
    shootdown: Shootdown<H::Root>,
    kernel: AddressSpace<H::Root>,
    next_id: AtomicU64,
}

impl<'a, M, H, P> Vm<'a, M, H, P>
where
    M: PhysMapper,
    H: Hat,
    P: Platform,
{
    /// Wire up the memory manager for `cpus` CPUs.
    ///
    /// `hat` must already own the kernel root; the kernel space wraps it
    /// with ASID 0.
    #[must_use]
    pub fn new(pfa: &'a FrameAllocator<M>, hat: H, platform: P, config: MmConfig, cpus: usize) -> Self {
        let kernel = AddressSpace::new(
            KERNEL_SPACE_ID,
            hat.kernel_root(),
            kernel_info::memory::KERNEL_ASID,
            config.paging.user_mmap_ceiling(),
        );
        log::info!(
            "vm: {} CPUs, {} ASIDs, kernel root {:?}",
            cpus,
            config.asid_count,
            kernel.root()
        );
        Self {
            pfa,
            hat,
            platform,
            asids: AsidPool::new(config.asid_count),
            config,
            cpus: CpuTable::new(cpus),
            shootdown: Shootdown::new(),
            kernel,
            next_id: AtomicU64::new(KERNEL_SPACE_ID + 1),
        }
    }

    #[must_use]
    pub const fn pfa(&self) -> &'a FrameAllocator<M> {
        self.pfa
    }

    #[must_use]
    pub const fn hat(&self) -> &H {
        &self.hat
    }

    #[must_use]
    pub const fn platform(&self) -> &P {
        &self.platform
    }

    #[must_use]
    pub const fn config(&self) -> &MmConfig {
        &self.config
    }

    #[must_use]
    pub const fn asids(&self) -> &AsidPool {
        &self.asids
    }

    #[must_use]
    pub const fn cpus(&self) -> &CpuTable {
        &self.cpus
    }

    #[must_use]
    pub const fn kernel_space(&self) -> &AddressSpace<H::Root> {
        &self.kernel
    }

    /// Translate `virt` in `space`.
    #[must_use]
    pub fn resolve(&self, space: &AddressSpace<H::Root>, virt: VirtualAddress) -> Option<Translation> {
        let _guard = space.lock();
        self.hat.resolve(space.root(), virt)
    }
}
