//! # Address Spaces
//!
//! An [`AddressSpace`] is a translation root, the ASID its TLB entries are
//! tagged with, and the segments carved out of its user half. The kernel
//! space owns the shared upper half and uses ASID 0.

use crate::cpu::cpus_in;
use crate::segment::Segment;
use crate::{Platform, Vm};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_info::boot::BootMemoryInfo;
use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::{
    HUGE_PAGE_SIZE, PAGE_SIZE, PhysMapper, PhysicalAddress, VirtualAddress, align_down, align_up,
};
use kernel_sync::{SpinLock, SpinLockGuard};
use kernel_vmem::{CacheType, Hat, HatError, Invalidation, MapFlags};

/// Identifier of an address space; never reused.
pub type SpaceId = u64;

/// Id of the kernel address space.
pub const KERNEL_SPACE_ID: SpaceId = 1;

/// Errors from address-space operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("range is empty, overflows or leaves the address space's half")]
    InvalidRange,
}

impl From<HatError> for VmError {
    fn from(e: HatError) -> Self {
        match e {
            HatError::OutOfMemory { .. } => Self::OutOfMemory,
        }
    }
}

pub(crate) struct SpaceInner {
    pub(crate) segments: Vec<Segment>,
    /// Next segment ends here.
    pub(crate) mmap_base: u64,
}

/// One virtual address space.
pub struct AddressSpace<R> {
    id: SpaceId,
    root: R,
    asid: u16,
    /// CPUs that have loaded this space and may hold its TLB entries.
    cpu_mask: AtomicU64,
    inner: SpinLock<SpaceInner>,
}

impl<R: Copy + core::fmt::Debug> core::fmt::Debug for AddressSpace<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("root", &self.root)
            .field("asid", &self.asid)
            .field("cpu_mask", &format_args!("{:#b}", self.cpu_mask()))
            .finish_non_exhaustive()
    }
}

impl<R: Copy> AddressSpace<R> {
    pub(crate) const fn new(id: SpaceId, root: R, asid: u16, mmap_base: u64) -> Self {
        Self {
            id,
            root,
            asid,
            cpu_mask: AtomicU64::new(0),
            inner: SpinLock::new(SpaceInner {
                segments: Vec::new(),
                mmap_base,
            }),
        }
    }

    #[must_use]
    pub const fn id(&self) -> SpaceId {
        self.id
    }

    #[must_use]
    pub const fn root(&self) -> R {
        self.root
    }

    #[must_use]
    pub const fn asid(&self) -> u16 {
        self.asid
    }

    #[must_use]
    pub fn cpu_mask(&self) -> u64 {
        self.cpu_mask.load(Ordering::Acquire)
    }

    /// Whether any CPU has ever loaded this space.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.cpu_mask() != 0
    }

    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.inner.lock().segments.len()
    }

    /// Segment containing `addr`, as its index and the offset into it.
    #[must_use]
    pub fn find_segment(&self, addr: VirtualAddress) -> Option<(usize, u64)> {
        self.inner
            .lock()
            .segments
            .iter()
            .enumerate()
            .find(|(_, s)| s.contains(addr))
            .map(|(i, s)| (i, addr - s.base()))
    }

    pub(crate) fn lock(&self) -> SpinLockGuard<'_, SpaceInner> {
        self.inner.lock()
    }

    fn mark_loaded(&self, cpu: usize) {
        self.cpu_mask.fetch_or(1 << cpu, Ordering::AcqRel);
    }
}

impl<M, H, P> Vm<'_, M, H, P>
where
    M: PhysMapper,
    H: Hat,
    P: Platform,
{
    /// A new, empty user address space sharing the kernel half.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the root table cannot be allocated.
    ///
    /// # Panics
    /// If the ASID pool is exhausted.
    pub fn create_space(&self) -> Result<AddressSpace<H::Root>, VmError> {
        let root = self.hat.create_root()?;
        let asid = self.asids.alloc();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        log::debug!("vm: space {id} root {root:?} asid {asid}");
        Ok(AddressSpace::new(
            id,
            root,
            asid,
            self.config.paging.user_mmap_ceiling(),
        ))
    }

    /// Tear down `space`: release every segment, flush its ASID, free its
    /// tables and return the ASID to the pool.
    pub fn destroy_space(&self, space: AddressSpace<H::Root>) {
        let running = self.cpus.running(space.id());
        if running != 0 {
            log::warn!("vm: destroying space {} while loaded on CPUs {running:#b}", space.id());
        }

        let mut segments = core::mem::take(&mut space.lock().segments);
        let unmapped: usize = segments
            .iter()
            .map(|segment| self.unmap_pages(space.root(), segment))
            .sum();
        if space.is_active() {
            self.shootdown(&space, Invalidation::asid(space.asid()));
        }
        for segment in &mut segments {
            self.release_frames(segment);
        }

        let stats = self.hat.scrub(space.root());
        log::debug!(
            "vm: space {} destroyed ({} segments, {} pages unmapped, {:?})",
            space.id(),
            segments.len(),
            unmapped,
            stats
        );
        self.asids.free(space.asid());
    }

    /// Duplicate `parent` into a new space. Private pages become
    /// copy-on-write in both.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the child cannot be built; the partial
    /// child is destroyed.
    pub fn fork_space(&self, parent: &AddressSpace<H::Root>) -> Result<AddressSpace<H::Root>, VmError> {
        let child = self.create_space()?;
        let mut downgraded = false;
        let mut result = Ok(());
        {
            let mut from = parent.lock();
            let mut to = child.lock();
            to.mmap_base = from.mmap_base;
            for segment in &mut from.segments {
                match self.clone_into(parent.root(), segment, child.root(), &mut to) {
                    Ok(d) => downgraded |= d,
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
        }

        if downgraded && self.needs_flush(parent) {
            self.shootdown(parent, Invalidation::asid(parent.asid()));
        }
        if let Err(e) = result {
            log::warn!("vm: fork of space {} failed: {e}", parent.id());
            self.destroy_space(child);
            return Err(VmError::OutOfMemory);
        }
        log::debug!("vm: space {} forked into {}", parent.id(), child.id());
        Ok(child)
    }

    /// Map `size` bytes at `virt` to `phys`.
    ///
    /// Each step uses a 2 MiB page when both addresses are 2 MiB aligned and
    /// at least 2 MiB remain. Existing mappings are replaced. Allocator
    /// frames left mapped in a user space are released when it is
    /// destroyed.
    ///
    /// # Errors
    /// - [`VmError::InvalidRange`] for an empty or overflowing range, or a
    ///   user space range reaching into the kernel half.
    /// - [`VmError::OutOfMemory`] if page tables run out; the part mapped
    ///   so far stays mapped.
    pub fn map_range(
        &self,
        space: &AddressSpace<H::Root>,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        size: u64,
        flags: MapFlags,
    ) -> Result<(), VmError> {
        if !virt.is_aligned(PAGE_SIZE) || !phys.is_aligned(PAGE_SIZE) {
            log::warn!("vm: misaligned mapping {virt} -> {phys}, aligning down");
        }
        let (virt, end) = self.checked_range(space, virt, size)?;
        let mut phys = phys.frame_base();

        let _guard = space.lock();
        let mut cur = virt.as_u64();
        let mut leaves = 0usize;
        let mut last = PAGE_SIZE;
        let mut result = Ok(());
        while cur < end {
            let huge = cur.is_multiple_of(HUGE_PAGE_SIZE)
                && phys.is_aligned(HUGE_PAGE_SIZE)
                && end - cur >= HUGE_PAGE_SIZE;
            let leaf = if huge {
                flags | MapFlags::HUGE
            } else {
                flags.difference(MapFlags::HUGE)
            };
            if let Err(e) = self.hat.insert(space.root(), VirtualAddress::new(cur), phys, leaf) {
                result = Err(e.into());
                break;
            }
            leaves += 1;
            last = leaf.granule();
            cur += last;
            phys += last;
        }

        // A new huge page may stand in for a whole table of old entries.
        match leaves {
            0 => {}
            1 if last == PAGE_SIZE => self.invalidate_range(space, Some(virt)),
            _ => self.invalidate_range(space, None),
        }
        result
    }

    /// Remove every leaf in `size` bytes at `virt`. Frames are not freed.
    ///
    /// # Errors
    /// [`VmError::InvalidRange`] as for [`map_range`](Self::map_range).
    pub fn unmap_range(&self, space: &AddressSpace<H::Root>, virt: VirtualAddress, size: u64) -> Result<(), VmError> {
        let (virt, end) = self.checked_range(space, virt, size)?;

        let _guard = space.lock();
        let mut cur = virt.as_u64();
        let mut leaves = 0usize;
        let mut removed = virt;
        while cur < end {
            match self.hat.remove(space.root(), VirtualAddress::new(cur)) {
                Some(t) => {
                    if t.is_huge() && !cur.is_multiple_of(HUGE_PAGE_SIZE) {
                        log::warn!("vm: unmapping {cur:#x} removed the whole 2 MiB page around it");
                    }
                    leaves += 1;
                    removed = VirtualAddress::new(align_down(cur, t.size));
                    cur = removed.as_u64() + t.size;
                }
                None => cur += PAGE_SIZE,
            }
        }

        match leaves {
            0 => {}
            1 => self.invalidate_range(space, Some(removed)),
            _ => self.invalidate_range(space, None),
        }
        Ok(())
    }

    /// Switch the calling CPU to `space`. Returns `false` if it was
    /// already loaded.
    pub fn load(&self, space: &AddressSpace<H::Root>) -> bool {
        let cpu = self.platform.current_cpu();
        if self.cpus.current_space(cpu) == space.id() {
            return false;
        }
        space.mark_loaded(cpu);
        self.hat.load(space.root(), space.asid());
        self.cpus.set_current_space(cpu, space.id());
        true
    }

    /// Populate the kernel half: every RAM range through the HHDM, the
    /// kernel image at its link address, and the framebuffer
    /// write-combining. Run before any user space is created.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if page tables run out.
    pub fn bootstrap_kernel_space(&self, boot: &BootMemoryInfo<'_>) -> Result<(), VmError> {
        let kernel = &self.kernel;
        let data = MapFlags::READ | MapFlags::WRITE | MapFlags::GLOBAL;

        for entry in boot.memory_map.iter().filter(|e| e.kind.is_ram() && e.length > 0) {
            let start = align_down(entry.base.as_u64(), PAGE_SIZE);
            let end = align_up(entry.end().as_u64(), PAGE_SIZE);
            self.map_range(
                kernel,
                VirtualAddress::new(HHDM_BASE + start),
                PhysicalAddress::new(start),
                end - start,
                data,
            )?;
        }

        let image = boot.kernel;
        self.map_range(
            kernel,
            image.virtual_base,
            image.physical_base,
            align_up(image.length, PAGE_SIZE),
            data | MapFlags::EXEC,
        )?;

        if let Some(fb) = boot.framebuffer {
            self.map_range(
                kernel,
                VirtualAddress::new(HHDM_BASE + fb.base.as_u64()),
                fb.base,
                align_up(fb.length, PAGE_SIZE),
                data.with_cache(CacheType::WriteCombining),
            )?;
        }

        log::info!(
            "vm: kernel half ready ({} memory-map entries, image {} +{:#x}, framebuffer {})",
            boot.memory_map.len(),
            image.virtual_base,
            image.length,
            if boot.framebuffer.is_some() { "mapped" } else { "absent" }
        );
        Ok(())
    }

    /// Whether changes to `space` must reach other TLBs.
    pub(crate) fn needs_flush(&self, space: &AddressSpace<H::Root>) -> bool {
        space.id() == KERNEL_SPACE_ID || space.is_active()
    }

    /// Flush `page` alone, or every entry of `space` when `None`.
    fn invalidate_range(&self, space: &AddressSpace<H::Root>, page: Option<VirtualAddress>) {
        if !self.needs_flush(space) {
            return;
        }
        let request = if let Some(virt) = page {
            Invalidation::page(virt, space.asid())
        } else if space.id() == KERNEL_SPACE_ID {
            Invalidation::everything()
        } else {
            Invalidation::asid(space.asid())
        };
        self.shootdown(space, request);
    }

    /// Page-align `virt..virt+size` and check it stays within the space's half.
    fn checked_range(
        &self,
        space: &AddressSpace<H::Root>,
        virt: VirtualAddress,
        size: u64,
    ) -> Result<(VirtualAddress, u64), VmError> {
        let start = virt.align_down(PAGE_SIZE);
        let end = virt
            .as_u64()
            .checked_add(size)
            .and_then(|end| end.checked_add(PAGE_SIZE - 1))
            .map(|end| align_down(end, PAGE_SIZE))
            .ok_or(VmError::InvalidRange)?;
        if size == 0 {
            return Err(VmError::InvalidRange);
        }
        if space.id() != KERNEL_SPACE_ID {
            let last = VirtualAddress::new(end - 1);
            if !self.hat.is_user_half(start) || !self.hat.is_user_half(last) {
                return Err(VmError::InvalidRange);
            }
        }
        Ok((start, end))
    }

    /// CPUs other than the caller that may cache entries of `space`.
    pub(crate) fn remote_holders(&self, space: &AddressSpace<H::Root>, request: Invalidation) -> u64 {
        let online = self.cpus.online_mask();
        let holders = if space.id() == KERNEL_SPACE_ID || request.asid == kernel_info::memory::KERNEL_ASID {
            online
        } else {
            space.cpu_mask()
        };
        let me = 1u64 << self.platform.current_cpu();
        let targets = holders & online & !me;
        if log::log_enabled!(log::Level::Trace) {
            for cpu in cpus_in(targets) {
                log::trace!("vm: shootdown target CPU {cpu}");
            }
        }
        targets
    }
}
