//! # Segments
//!
//! A segment is a page-aligned range of one address space with a single
//! protection and sharing mode. Every page in it is tracked individually so
//! the fault handler knows whether to populate, copy or refuse.
//!
//! ```text
//!  mmap ceiling ─┬─────────────┐
//!                │ segment #0  │ ◄─ first bump allocation
//!                ├─────────────┤
//!                │ segment #1  │
//!  mmap base  ───┼─────────────┤ ◄─ next allocation ends here
//!                │    free     │
//! ```

use crate::space::{AddressSpace, SpaceInner};
use crate::{Platform, Vm};
use alloc::vec::Vec;
use bitflags::bitflags;
use kernel_memory_addresses::{PAGE_BYTES, PAGE_SIZE, PhysMapper, PhysicalAddress, VirtualAddress, align_up};
use kernel_vmem::{Hat, Invalidation, MapFlags};

bitflags! {
    /// Access a segment allows.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

bitflags! {
    /// How a segment is backed and placed.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct MapMode: u32 {
        /// Zero-filled on first touch; no backing object.
        const ANONYMOUS = 1 << 0;
        /// Copy-on-write across fork.
        const PRIVATE = 1 << 1;
        /// Same frames in every space.
        const SHARED = 1 << 2;
        /// Use the hint as the base if it is free.
        const FIXED = 1 << 3;
    }
}

impl Protection {
    /// Leaf attributes for a user mapping with this protection.
    #[must_use]
    pub fn map_flags(self) -> MapFlags {
        let mut flags = MapFlags::USER;
        flags.set(MapFlags::READ, self.intersects(Self::READ | Self::WRITE | Self::EXEC));
        flags.set(MapFlags::WRITE, self.contains(Self::WRITE));
        flags.set(MapFlags::EXEC, self.contains(Self::EXEC));
        flags
    }
}

/// Population state of one tracked page.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum PageState {
    /// Never touched; the next access populates it.
    #[default]
    None,
    /// Backed by a frame and mapped.
    Present,
    /// Torn down; any further access is an error.
    Unmapped,
}

/// Per-page bookkeeping of a segment.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TrackedPage {
    pub virt: VirtualAddress,
    pub phys: PhysicalAddress,
    /// Owners of `phys`: the frame's share count in the allocator.
    pub refcount: u16,
    pub state: PageState,
}

impl TrackedPage {
    const fn unpopulated(virt: VirtualAddress) -> Self {
        Self {
            virt,
            phys: PhysicalAddress::zero(),
            refcount: 0,
            state: PageState::None,
        }
    }
}

/// What resolves a fault inside a segment.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultPolicy {
    /// Demand-zero with copy-on-write for private mappings.
    Anonymous,
}

/// Errors from segment management.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SegmentError {
    #[error("unsupported mapping mode")]
    Unsupported,
    #[error("exactly one of PRIVATE or SHARED is required")]
    InvalidMode,
    #[error("invalid segment length")]
    InvalidLength,
    #[error("out of memory")]
    OutOfMemory,
}

/// A contiguous range of an address space.
#[derive(Debug, Clone)]
pub struct Segment {
    base: VirtualAddress,
    len: u64,
    prot: Protection,
    mode: MapMode,
    policy: FaultPolicy,
    pages: Vec<TrackedPage>,
}

impl Segment {
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Exclusive end.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.as_u64() + self.len
    }

    #[must_use]
    pub const fn protection(&self) -> Protection {
        self.prot
    }

    #[must_use]
    pub const fn mode(&self) -> MapMode {
        self.mode
    }

    #[must_use]
    pub const fn policy(&self) -> FaultPolicy {
        self.policy
    }

    #[must_use]
    /// Half-open containment.
    #[must_use]
    pub const fn contains(&self, addr: VirtualAddress) -> bool {
        addr.as_u64() >= self.base.as_u64() && addr.as_u64() < self.end()
    }

    /// Index of the tracked page covering `addr`.
    pub(crate) fn page_index(&self, addr: VirtualAddress) -> Option<usize> {
        let page = addr.align_down(PAGE_SIZE);
        self.pages.binary_search_by_key(&page, |p| p.virt).ok()
    }

    pub(crate) fn page_mut(&mut self, index: usize) -> &mut TrackedPage {
        &mut self.pages[index]
    }

    const fn overlaps(&self, base: u64, len: u64) -> bool {
        base < self.end() && self.base.as_u64() < base + len
    }
}

impl SpaceInner {
    fn range_is_free(&self, base: u64, len: u64, ceiling: u64) -> bool {
        base.checked_add(len).is_some_and(|end| end <= ceiling)
            && !self.segments.iter().any(|s| s.overlaps(base, len))
    }

    /// Bump allocate `len` bytes below the current mmap base.
    fn carve(&mut self, len: u64) -> Option<u64> {
        let base = self.mmap_base.checked_sub(len)?;
        if base < PAGE_SIZE {
            return None;
        }
        self.mmap_base = base;
        Some(base)
    }
}

impl<M, H, P> Vm<'_, M, H, P>
where
    M: PhysMapper,
    H: Hat,
    P: Platform,
{
    /// Reserve `len` bytes (rounded up to pages) in `space`.
    ///
    /// Pages are populated lazily by the fault handler. With
    /// [`MapMode::FIXED`] the page-aligned `hint` is used if nothing
    /// occupies it; otherwise the segment is carved below the previous
    /// one.
    ///
    /// # Errors
    /// - [`SegmentError::InvalidLength`] for an empty or unrepresentable length.
    /// - [`SegmentError::InvalidMode`] unless exactly one of `PRIVATE` and `SHARED` is set.
    /// - [`SegmentError::Unsupported`] for shared anonymous memory.
    /// - [`SegmentError::OutOfMemory`] if the user half is exhausted or the
    ///   page list cannot be allocated.
    pub fn create_segment(
        &self,
        space: &AddressSpace<H::Root>,
        len: u64,
        prot: Protection,
        mode: MapMode,
        hint: Option<VirtualAddress>,
    ) -> Result<VirtualAddress, SegmentError> {
        if len == 0 || len > u64::MAX - PAGE_SIZE {
            return Err(SegmentError::InvalidLength);
        }
        let len = align_up(len, PAGE_SIZE);
        if mode.contains(MapMode::PRIVATE) == mode.contains(MapMode::SHARED) {
            return Err(SegmentError::InvalidMode);
        }
        if mode.contains(MapMode::SHARED) {
            return Err(SegmentError::Unsupported);
        }

        let ceiling = self.config.paging.user_mmap_ceiling();
        let mut inner = space.lock();
        let fixed = hint
            .filter(|_| mode.contains(MapMode::FIXED))
            .map(|h| h.align_down(PAGE_SIZE).as_u64());
        let base = match fixed {
            Some(h) if inner.range_is_free(h, len, ceiling) => h,
            _ => {
                if let Some(h) = fixed {
                    log::warn!("segment: fixed hint {h:#x} ({len:#x} bytes) is taken, placing elsewhere");
                }
                inner.carve(len).ok_or(SegmentError::OutOfMemory)?
            }
        };

        #[allow(clippy::cast_possible_truncation)]
        let count = (len / PAGE_SIZE) as usize;
        let mut pages = Vec::new();
        pages
            .try_reserve_exact(count)
            .map_err(|_| SegmentError::OutOfMemory)?;
        pages.extend(
            (0..len)
                .step_by(PAGE_BYTES)
                .map(|off| TrackedPage::unpopulated(VirtualAddress::new(base + off))),
        );

        inner.segments.push(Segment {
            base: VirtualAddress::new(base),
            len,
            prot,
            mode: mode | MapMode::ANONYMOUS,
            policy: FaultPolicy::Anonymous,
            pages,
        });
        log::debug!("segment: space {} {base:#x}+{len:#x} {prot:?} {mode:?}", space.id());
        Ok(VirtualAddress::new(base))
    }

    /// Tear down the segment starting at `base`.
    ///
    /// Private pages are unmapped and their frame reference dropped; shared
    /// pages are only unmapped. Returns `false` if no segment starts there.
    pub fn destroy_segment(&self, space: &AddressSpace<H::Root>, base: VirtualAddress) -> bool {
        let mut inner = space.lock();
        let Some(index) = inner.segments.iter().position(|s| s.base == base) else {
            log::warn!("segment: space {} has no segment at {base}", space.id());
            return false;
        };
        let mut segment = inner.segments.remove(index);
        let unmapped = self.unmap_pages(space.root(), &segment);
        if unmapped > 0 && self.needs_flush(space) {
            self.shootdown(space, Invalidation::asid(space.asid()));
        }
        self.release_frames(&mut segment);
        true
    }

    /// Bookkeeping of the page covering `addr`.
    #[must_use]
    pub fn tracked_page(&self, space: &AddressSpace<H::Root>, addr: VirtualAddress) -> Option<TrackedPage> {
        let mut inner = space.lock();
        let segment = inner.segments.iter_mut().find(|s| s.contains(addr))?;
        let index = segment.page_index(addr)?;
        let page = segment.page_mut(index);
        self.sync_refcount(page);
        Some(*page)
    }

    /// Copy the segment at `base` from `parent` into `child`.
    ///
    /// Present pages of a private segment become copy-on-write: both sides
    /// map the same frame read-only and hold one frame reference each.
    /// `child` must not be in use elsewhere.
    ///
    /// # Errors
    /// [`SegmentError::OutOfMemory`] if the child's tables cannot be
    /// allocated. Pages cloned so far stay registered in the child.
    pub fn clone_segment(
        &self,
        parent: &AddressSpace<H::Root>,
        child: &AddressSpace<H::Root>,
        base: VirtualAddress,
    ) -> Result<bool, SegmentError> {
        let mut from = parent.lock();
        let Some(segment) = from.segments.iter_mut().find(|s| s.base == base) else {
            return Ok(false);
        };
        let mut to = child.lock();
        let result = self.clone_into(parent.root(), segment, child.root(), &mut to);
        drop(to);
        drop(from);
        if matches!(result, Ok(true)) && self.needs_flush(parent) {
            self.shootdown(parent, Invalidation::asid(parent.asid()));
        }
        result.map(|_| true)
    }

    /// Register a copy of `segment` in `child`. Returns whether any parent
    /// page lost write access.
    pub(crate) fn clone_into(
        &self,
        parent_root: H::Root,
        segment: &mut Segment,
        child_root: H::Root,
        child: &mut SpaceInner,
    ) -> Result<bool, SegmentError> {
        let mut copy = Segment {
            base: segment.base,
            len: segment.len,
            prot: segment.prot,
            mode: segment.mode,
            policy: segment.policy,
            pages: Vec::new(),
        };
        copy.pages
            .try_reserve_exact(segment.pages.len())
            .map_err(|_| SegmentError::OutOfMemory)?;
        copy.pages
            .extend(segment.pages.iter().map(|p| TrackedPage::unpopulated(p.virt)));
        for (src, dst) in segment.pages.iter().zip(copy.pages.iter_mut()) {
            if src.state == PageState::Unmapped {
                dst.state = PageState::Unmapped;
            }
        }

        let private = segment.mode.contains(MapMode::PRIVATE);
        let flags = if private {
            segment.prot.map_flags().difference(MapFlags::WRITE)
        } else {
            segment.prot.map_flags()
        };

        let mut downgraded = false;
        let mut result = Ok(());
        for (src, dst) in segment.pages.iter_mut().zip(copy.pages.iter_mut()) {
            if src.state != PageState::Present {
                continue;
            }
            if let Err(e) = self.hat.insert(child_root, src.virt, src.phys, flags) {
                log::warn!("segment: cloning {}: {e}", src.virt);
                result = Err(SegmentError::OutOfMemory);
                break;
            }
            if !self.pfa.share(src.phys) {
                self.hat.remove(child_root, src.virt);
                continue;
            }
            if private && segment.prot.contains(Protection::WRITE) {
                if let Err(e) = self.hat.insert(parent_root, src.virt, src.phys, flags) {
                    log::warn!("segment: write-protecting {}: {e}", src.virt);
                }
                downgraded = true;
            }
            self.sync_refcount(src);
            *dst = *src;
        }

        child.segments.push(copy);
        result.map(|()| downgraded)
    }

    /// Remove the translation of every present page of `segment`.
    ///
    /// Returns the number removed. The caller invalidates them everywhere,
    /// then hands the frames back with [`release_frames`](Self::release_frames).
    pub(crate) fn unmap_pages(&self, root: H::Root, segment: &Segment) -> usize {
        let mut unmapped = 0;
        for page in segment.pages.iter().filter(|p| p.state == PageState::Present) {
            self.hat.remove(root, page.virt);
            unmapped += 1;
        }
        unmapped
    }

    /// Drop this space's reference to every private frame of `segment` and
    /// mark all its pages unmapped.
    pub(crate) fn release_frames(&self, segment: &mut Segment) {
        let private = segment.mode.contains(MapMode::PRIVATE);
        for page in &mut segment.pages {
            if private && page.state == PageState::Present {
                self.pfa.free(page.phys, 1);
            }
            *page = TrackedPage {
                state: PageState::Unmapped,
                refcount: 0,
                ..*page
            };
        }
    }

    /// Reload `page.refcount` from the allocator. Other owners drop their
    /// share without touching this space.
    pub(crate) fn sync_refcount(&self, page: &mut TrackedPage) {
        if page.state == PageState::Present {
            page.refcount = self.pfa.refcount(page.phys).unwrap_or(0);
        }
    }
}
