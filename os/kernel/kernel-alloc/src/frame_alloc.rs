//! # Physical frame database
//!
//! Every usable 4 KiB frame above 1 MiB gets one [`FrameEntry`] in a table
//! sorted by physical address. The table lives in RAM itself: it is carved
//! from the first usable range large enough to hold it, and those frames
//! are [`FrameKind::Reserved`] forever.
//!
//! ```text
//!  table index   0      1      2      3      4      5   ...
//!  frame        0x100  0x101  0x102  0x103  0x200  0x201
//!  kind         Rsvd   Dirty  Zero   Obj    Dirty  Zero
//!                       │             ▲       │
//!  dirty list ──────────┴─────────────┼───────┘
//!  zero list  ──── 2 ─── 5            │ refcount 1
//! ```
//!
//! Free frames sit on exactly one of two intrusive, doubly linked lists:
//! the *zero* list (contents known to be zero) and the *dirty* list. Freed
//! frames always go to the dirty list; [`FrameAllocator::prezero`] moves
//! them over.
//!
//! ## Locking
//!
//! One [`SpinLock`] guards the table and both lists. Zero-filling happens
//! with the lock released while the frame's `locked` bit is set.

use crate::descriptor::{FrameDescriptor, FrameEntry, FrameKind, NIL};
use kernel_info::boot::{MemoryKind, MemoryMapEntry};
use kernel_info::config::{MmConfig, SHORT_MEMORY_MAP};
use kernel_info::memory::LOW_MEMORY_LIMIT;
use kernel_memory_addresses::{PAGE_SIZE, PhysMapper, PhysicalAddress, align_down, align_up, pages_for};
use kernel_sync::SpinLock;
use kernel_vmem::FrameAlloc;

const ENTRY_BYTES: u64 = size_of::<FrameEntry>() as u64;

/// Frames beyond this many are ignored; table indices are `u32` with [`NIL`] reserved.
const MAX_FRAMES: u64 = NIL as u64;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameAllocError {
    #[error("the memory map has no usable frames above 1 MiB")]
    NoUsableMemory,
    #[error("no usable range can hold the frame table ({frames} frames)")]
    NoRoomForDatabase { frames: u64 },
}

/// What an allocated frame is used for.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum FrameUsage {
    #[default]
    Object,
    Heap,
    System,
}

impl FrameUsage {
    const fn kind(self) -> FrameKind {
        match self {
            Self::Object => FrameKind::Object,
            Self::Heap => FrameKind::Heap,
            Self::System => FrameKind::System,
        }
    }
}

/// Parameters of one [`FrameAllocator::alloc`] call.
///
/// ```
/// use kernel_alloc::{FrameRequest, FrameUsage};
///
/// let huge = FrameRequest::run(512).aligned(512).usage(FrameUsage::Heap);
/// assert_eq!(huge.count, 512);
/// assert!(!huge.zero);
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameRequest {
    pub count: usize,
    pub zero: bool,
    /// Alignment of the first frame number, in frames. 0 and 1 mean none.
    pub align: usize,
    pub usage: FrameUsage,
}

impl FrameRequest {
    #[must_use]
    pub const fn single() -> Self {
        Self::run(1)
    }

    /// `count` physically consecutive frames.
    #[must_use]
    pub const fn run(count: usize) -> Self {
        Self {
            count,
            zero: false,
            align: 0,
            usage: FrameUsage::Object,
        }
    }

    #[must_use]
    pub const fn zeroed(mut self) -> Self {
        self.zero = true;
        self
    }

    #[must_use]
    pub const fn aligned(mut self, frames: usize) -> Self {
        self.align = frames;
        self
    }

    #[must_use]
    pub const fn usage(mut self, usage: FrameUsage) -> Self {
        self.usage = usage;
        self
    }

    const fn is_single(&self) -> bool {
        self.count == 1 && self.align <= 1
    }
}

/// Snapshot of one frame's descriptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame: PhysicalAddress,
    pub kind: FrameKind,
    pub refcount: u16,
    pub locked: bool,
}

/// Frame counts. `used + reserved + free_zero + free_dirty == total` at all times.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub total: usize,
    pub reserved: usize,
    pub used: usize,
    pub free_zero: usize,
    pub free_dirty: usize,
}

impl FrameStats {
    #[must_use]
    pub const fn free(&self) -> usize {
        self.free_zero + self.free_dirty
    }
}

#[derive(Debug, Copy, Clone)]
struct FreeList {
    head: u32,
    len: usize,
}

impl FreeList {
    const EMPTY: Self = Self { head: NIL, len: 0 };
}

struct FrameDb {
    table: PhysicalAddress,
    len: u32,
    zero: FreeList,
    dirty: FreeList,
    used: usize,
    reserved: usize,
    /// Dirty frames off-list while [`FrameAllocator::prezero`] fills them.
    zeroing: usize,
}

impl FrameDb {
    fn slot<M: PhysMapper>(&self, mapper: &M, index: u32) -> *mut FrameEntry {
        debug_assert!(index < self.len);
        // Entries never straddle a frame, so each slot is reachable on its own.
        mapper
            .phys_to_ptr(self.table + u64::from(index) * ENTRY_BYTES)
            .cast()
    }

    fn get<M: PhysMapper>(&self, mapper: &M, index: u32) -> FrameEntry {
        // SAFETY: the table frames are Reserved and only touched under the db lock.
        unsafe { self.slot(mapper, index).read() }
    }

    fn put<M: PhysMapper>(&self, mapper: &M, index: u32, entry: FrameEntry) {
        // SAFETY: as in `get`.
        unsafe { self.slot(mapper, index).write(entry) }
    }

    fn desc<M: PhysMapper>(&self, mapper: &M, index: u32) -> FrameDescriptor {
        self.get(mapper, index).desc
    }

    fn set_desc<M: PhysMapper>(&self, mapper: &M, index: u32, desc: FrameDescriptor) {
        let mut entry = self.get(mapper, index);
        entry.desc = desc;
        self.put(mapper, index, entry);
    }

    fn set_links<M: PhysMapper>(&self, mapper: &M, index: u32, prev: Option<u32>, next: Option<u32>) {
        let mut entry = self.get(mapper, index);
        if let Some(prev) = prev {
            entry.prev = prev;
        }
        if let Some(next) = next {
            entry.next = next;
        }
        self.put(mapper, index, entry);
    }

    fn frame_of<M: PhysMapper>(&self, mapper: &M, index: u32) -> PhysicalAddress {
        PhysicalAddress::from_frame_number(u64::from(self.desc(mapper, index).frame()))
    }

    const fn list(&mut self, kind: FrameKind) -> &mut FreeList {
        if matches!(kind, FrameKind::ZeroFree) {
            &mut self.zero
        } else {
            &mut self.dirty
        }
    }

    fn push_front<M: PhysMapper>(&mut self, mapper: &M, index: u32, kind: FrameKind) {
        debug_assert!(kind.is_free());
        let head = self.list(kind).head;
        let desc = self.desc(mapper, index).with_kind(kind).with_refcount(0);
        self.put(
            mapper,
            index,
            FrameEntry {
                desc,
                prev: NIL,
                next: head,
            },
        );
        if head != NIL {
            self.set_links(mapper, head, Some(index), None);
        }
        let list = self.list(kind);
        list.head = index;
        list.len += 1;
    }

    fn unlink<M: PhysMapper>(&mut self, mapper: &M, index: u32) {
        let entry = self.get(mapper, index);
        let kind = entry.desc.kind();
        debug_assert!(kind.is_free());

        if entry.prev == NIL {
            self.list(kind).head = entry.next;
        } else {
            self.set_links(mapper, entry.prev, None, Some(entry.next));
        }
        if entry.next != NIL {
            self.set_links(mapper, entry.next, Some(entry.prev), None);
        }
        self.list(kind).len -= 1;
        self.set_links(mapper, index, Some(NIL), Some(NIL));
    }

    fn pop<M: PhysMapper>(&mut self, mapper: &M, kind: FrameKind) -> Option<u32> {
        let head = self.list(kind).head;
        if head == NIL {
            return None;
        }
        self.unlink(mapper, head);
        Some(head)
    }

    /// Mark an unlinked frame allocated with one owner.
    fn claim<M: PhysMapper>(&mut self, mapper: &M, index: u32, kind: FrameKind, lock: bool) {
        let desc = self
            .desc(mapper, index)
            .with_kind(kind)
            .with_refcount(1)
            .with_locked(lock);
        self.set_desc(mapper, index, desc);
        self.used += 1;
    }

    fn is_available<M: PhysMapper>(&self, mapper: &M, index: u32) -> bool {
        let desc = self.desc(mapper, index);
        desc.kind().is_free() && !desc.locked()
    }

    fn take_one<M: PhysMapper>(&mut self, mapper: &M, zero: bool, kind: FrameKind) -> Option<u32> {
        let (index, needs_fill) = if zero {
            match self.pop(mapper, FrameKind::ZeroFree) {
                Some(index) => (index, false),
                None => (self.pop(mapper, FrameKind::DirtyFree)?, true),
            }
        } else {
            let index = self
                .pop(mapper, FrameKind::DirtyFree)
                .or_else(|| self.pop(mapper, FrameKind::ZeroFree))?;
            (index, false)
        };
        self.claim(mapper, index, kind, needs_fill);
        Some(index)
    }

    /// First index of `count` consecutive, available frames whose first
    /// frame number is a multiple of `align`.
    fn find_run<M: PhysMapper>(&self, mapper: &M, count: u32, align: u64) -> Option<u32> {
        let align = align.max(1);
        let mut start = 0u32;
        'search: while start.checked_add(count)? <= self.len {
            let first = self.desc(mapper, start);
            if !self.is_available(mapper, start) || u64::from(first.frame()) % align != 0 {
                start += 1;
                continue;
            }
            for k in 1..count {
                let index = start + k;
                let contiguous = self.desc(mapper, index).frame() == first.frame() + k;
                if !contiguous || !self.is_available(mapper, index) {
                    start = index + 1;
                    continue 'search;
                }
            }
            return Some(start);
        }
        None
    }

    fn take_run<M: PhysMapper>(
        &mut self,
        mapper: &M,
        count: u32,
        align: u64,
        zero: bool,
        kind: FrameKind,
    ) -> Option<u32> {
        let start = self.find_run(mapper, count, align)?;
        for index in start..start + count {
            let dirty = self.desc(mapper, index).kind() == FrameKind::DirtyFree;
            self.unlink(mapper, index);
            self.claim(mapper, index, kind, zero && dirty);
        }
        Some(start)
    }

    /// Binary search for the entry describing `pa`.
    fn index_of<M: PhysMapper>(&self, mapper: &M, pa: PhysicalAddress) -> Option<u32> {
        let target = u32::try_from(pa.frame_number()).ok()?;
        let (mut lo, mut hi) = (0, self.len);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let frame = self.desc(mapper, mid).frame();
            match frame.cmp(&target) {
                core::cmp::Ordering::Less => lo = mid + 1,
                core::cmp::Ordering::Greater => hi = mid,
                core::cmp::Ordering::Equal => return Some(mid),
            }
        }
        None
    }

    /// Drop one reference to `pa`; the last one returns it to the dirty list.
    fn release<M: PhysMapper>(&mut self, mapper: &M, pa: PhysicalAddress) {
        let Some(index) = self.index_of(mapper, pa) else {
            log::warn!("pfa: ignoring free of untracked frame {pa}");
            return;
        };
        let desc = self.desc(mapper, index);
        if desc.locked() {
            log::warn!("pfa: ignoring free of {pa} while it is being zeroed");
            return;
        }
        match desc.kind() {
            FrameKind::ZeroFree | FrameKind::DirtyFree => {
                log::warn!("pfa: ignoring double free of {pa}");
                return;
            }
            FrameKind::Reserved => {
                log::warn!("pfa: ignoring free of reserved frame {pa}");
                return;
            }
            FrameKind::Object | FrameKind::Heap | FrameKind::System => {}
        }

        let refcount = desc.refcount().saturating_sub(1);
        if refcount > 0 {
            self.set_desc(mapper, index, desc.with_refcount(refcount));
            return;
        }
        self.used -= 1;
        self.push_front(mapper, index, FrameKind::DirtyFree);
    }

    const fn stats(&self) -> FrameStats {
        FrameStats {
            total: self.len as usize,
            reserved: self.reserved,
            used: self.used,
            free_zero: self.zero.len,
            free_dirty: self.dirty.len + self.zeroing,
        }
    }
}

/// Usable ranges as `(first frame, frame count)`: page-aligned inward,
/// clipped above [`LOW_MEMORY_LIMIT`], strictly ascending.
fn usable_ranges(memory_map: &[MemoryMapEntry]) -> impl Iterator<Item = (u64, u64)> + '_ {
    memory_map
        .iter()
        .filter(|e| e.kind == MemoryKind::Usable)
        .scan(LOW_MEMORY_LIMIT, |floor, e| {
            let start = align_up(e.base.as_u64(), PAGE_SIZE).max(*floor);
            let end = align_down(e.end().as_u64(), PAGE_SIZE);
            *floor = (*floor).max(end);
            Some((start, end))
        })
        .filter(|&(start, end)| start < end)
        .map(|(start, end)| (start / PAGE_SIZE, (end - start) / PAGE_SIZE))
}

fn dump_memory_map(memory_map: &[MemoryMapEntry]) {
    log::info!("pfa: memory map, {} entries", memory_map.len());
    for e in memory_map {
        log::info!(
            "pfa:   {:#014x}-{:#014x} {:>9} KiB  {}",
            e.base.as_u64(),
            e.end().as_u64(),
            e.length / 1024,
            e.kind.as_str()
        );
    }
}

/// The physical frame allocator.
pub struct FrameAllocator<M> {
    mapper: M,
    db: SpinLock<FrameDb>,
}

impl<M: PhysMapper> FrameAllocator<M> {
    /// Build the frame database from the boot memory map.
    ///
    /// Only [`MemoryKind::Usable`] ranges above 1 MiB are tracked. The table
    /// is written into the first usable range that can hold it, then up to
    /// [`MmConfig::prezero_frames`] frames are zero-filled.
    ///
    /// # Safety
    /// Every `Usable` range must be RAM that nothing else uses, reachable
    /// through `mapper` for as long as the allocator lives.
    ///
    /// # Errors
    /// - [`FrameAllocError::NoUsableMemory`] if nothing is left to manage.
    /// - [`FrameAllocError::NoRoomForDatabase`] if no single range fits the table.
    pub unsafe fn new(mapper: M, memory_map: &[MemoryMapEntry], config: &MmConfig) -> Result<Self, FrameAllocError> {
        if config.verbose_memmap || memory_map.len() < SHORT_MEMORY_MAP {
            dump_memory_map(memory_map);
        }

        let found: u64 = usable_ranges(memory_map).map(|(_, frames)| frames).sum();
        if found == 0 {
            return Err(FrameAllocError::NoUsableMemory);
        }
        if found > MAX_FRAMES {
            log::warn!("pfa: tracking only {MAX_FRAMES} of {found} usable frames");
        }
        let total = found.min(MAX_FRAMES);

        let table_frames = pages_for(total * ENTRY_BYTES);
        let (table_first, _) = usable_ranges(memory_map)
            .find(|&(_, frames)| frames >= table_frames)
            .ok_or(FrameAllocError::NoRoomForDatabase { frames: table_frames })?;
        let table_range = table_first..table_first + table_frames;

        #[allow(clippy::cast_possible_truncation)]
        let mut db = FrameDb {
            table: PhysicalAddress::from_frame_number(table_first),
            len: total as u32,
            zero: FreeList::EMPTY,
            dirty: FreeList::EMPTY,
            used: 0,
            reserved: table_frames as usize,
            zeroing: 0,
        };

        // Lowest address at the head of the dirty list.
        let mut index = 0u32;
        let mut tail = NIL;
        let frames = usable_ranges(memory_map).flat_map(|(first, n)| first..first + n);
        for pfn in frames.take(db.len as usize) {
            let reserved = table_range.contains(&pfn);
            #[allow(clippy::cast_possible_truncation)]
            let desc = FrameDescriptor::new().with_frame(pfn as u32).with_kind(if reserved {
                FrameKind::Reserved
            } else {
                FrameKind::DirtyFree
            });
            if reserved {
                db.put(&mapper, index, FrameEntry { desc, prev: NIL, next: NIL });
            } else {
                db.put(&mapper, index, FrameEntry { desc, prev: tail, next: NIL });
                if tail == NIL {
                    db.dirty.head = index;
                } else {
                    db.set_links(&mapper, tail, None, Some(index));
                }
                db.dirty.len += 1;
                tail = index;
            }
            index += 1;
        }

        let this = Self {
            mapper,
            db: SpinLock::new(db),
        };
        let zeroed = this.prezero(config.prezero_frames);
        let stats = this.stats();
        log::info!(
            "pfa: {} frames ({} MiB) tracked, table at {} ({} frames), {} prezeroed",
            stats.total,
            (stats.total as u64 * PAGE_SIZE) >> 20,
            PhysicalAddress::from_frame_number(table_first),
            stats.reserved,
            zeroed
        );
        Ok(this)
    }

    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    /// Allocate per `request`; `None` when nothing satisfies it.
    ///
    /// The first frame of the run is returned; every frame in it has
    /// refcount 1.
    pub fn alloc(&self, request: FrameRequest) -> Option<PhysicalAddress> {
        let Ok(count) = u32::try_from(request.count) else {
            log::warn!("pfa: run of {} frames can never be satisfied", request.count);
            return None;
        };
        if count == 0 {
            log::warn!("pfa: zero-frame allocation request");
            return None;
        }

        let kind = request.usage.kind();
        let start = {
            let mut db = self.db.lock();
            if request.is_single() {
                db.take_one(&self.mapper, request.zero, kind)?
            } else {
                db.take_run(&self.mapper, count, request.align as u64, request.zero, kind)?
            }
        };

        if request.zero {
            for index in start..start + count {
                let (pa, locked) = self.db.with_lock(|db| {
                    (db.frame_of(&self.mapper, index), db.desc(&self.mapper, index).locked())
                });
                if !locked {
                    continue;
                }
                // SAFETY: the frame is ours and marked locked.
                unsafe { self.mapper.zero_frame(pa) };
                self.db.with_lock(|db| {
                    let desc = db.desc(&self.mapper, index).with_locked(false);
                    db.set_desc(&self.mapper, index, desc);
                });
            }
        }

        let db = self.db.lock();
        Some(db.frame_of(&self.mapper, start))
    }

    /// Drop one reference to each of `frames` frames starting at `base`.
    ///
    /// Frames whose count reaches zero go to the dirty list. Untracked,
    /// free, reserved or locked frames are logged and skipped.
    pub fn free(&self, base: PhysicalAddress, frames: usize) {
        let mut db = self.db.lock();
        let mut pa = base.frame_base();
        for _ in 0..frames {
            db.release(&self.mapper, pa);
            pa += PAGE_SIZE;
        }
    }

    /// Add an owner to an allocated frame.
    ///
    /// Returns `false` (and logs) if `pa` is not allocated or the count is saturated.
    pub fn share(&self, pa: PhysicalAddress) -> bool {
        let db = self.db.lock();
        let Some(index) = db.index_of(&self.mapper, pa) else {
            log::warn!("pfa: cannot share untracked frame {pa}");
            return false;
        };
        let desc = db.desc(&self.mapper, index);
        if !desc.kind().is_allocated() || desc.refcount() == u16::MAX {
            log::warn!("pfa: cannot share {pa} ({:?}, refcount {})", desc.kind(), desc.refcount());
            return false;
        }
        db.set_desc(&self.mapper, index, desc.with_refcount(desc.refcount() + 1));
        true
    }

    #[must_use]
    pub fn lookup(&self, pa: PhysicalAddress) -> Option<FrameInfo> {
        let db = self.db.lock();
        let index = db.index_of(&self.mapper, pa)?;
        let desc = db.desc(&self.mapper, index);
        Some(FrameInfo {
            frame: db.frame_of(&self.mapper, index),
            kind: desc.kind(),
            refcount: desc.refcount(),
            locked: desc.locked(),
        })
    }

    #[must_use]
    pub fn refcount(&self, pa: PhysicalAddress) -> Option<u16> {
        self.lookup(pa).map(|info| info.refcount)
    }

    /// Move up to `max` frames from the dirty list to the zero list.
    ///
    /// Returns the number of frames zero-filled.
    pub fn prezero(&self, max: usize) -> usize {
        let mut done = 0;
        while done < max {
            let taken = self.db.with_lock(|db| {
                let index = db.pop(&self.mapper, FrameKind::DirtyFree)?;
                let desc = db.desc(&self.mapper, index).with_locked(true);
                db.set_desc(&self.mapper, index, desc);
                db.zeroing += 1;
                Some((index, db.frame_of(&self.mapper, index)))
            });
            let Some((index, pa)) = taken else {
                break;
            };

            // SAFETY: off-list and locked, so nobody else can hand it out.
            unsafe { self.mapper.zero_frame(pa) };

            self.db.with_lock(|db| {
                let desc = db.desc(&self.mapper, index).with_locked(false);
                db.set_desc(&self.mapper, index, desc);
                db.zeroing -= 1;
                db.push_front(&self.mapper, index, FrameKind::ZeroFree);
            });
            done += 1;
        }
        done
    }

    #[must_use]
    pub fn stats(&self) -> FrameStats {
        self.db.lock().stats()
    }
}

impl<M: PhysMapper> FrameAlloc for FrameAllocator<M> {
    fn alloc_table(&self) -> Option<PhysicalAddress> {
        self.alloc(FrameRequest::single().zeroed().usage(FrameUsage::System))
    }

    fn free_table(&self, table: PhysicalAddress) {
        self.free(table, 1);
    }

    fn release_leaf(&self, base: PhysicalAddress, frames: usize) -> bool {
        if !self.lookup(base).is_some_and(|info| info.kind.is_allocated()) {
            return false;
        }
        self.free(base, frames);
        true
    }
}
