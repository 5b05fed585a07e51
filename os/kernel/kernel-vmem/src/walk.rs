//! Format-generic table walks shared by both backends.

use crate::table::{EntryFormat, MAX_LEVELS, PageTable, level_shift, level_size, table_at};
use crate::{FrameAlloc, HatError, MapFlags, Translation};
use core::marker::PhantomData;
use core::ops::Range;
use kernel_memory_addresses::{HUGE_PAGE_SIZE, PAGE_SIZE, PhysMapper, PhysicalAddress, VirtualAddress};

/// Counts from one [`Walker::scrub`].
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ScrubStats {
    /// Table frames returned, the root included.
    pub tables: usize,
    /// Still-mapped terminal entries whose frames the allocator took back.
    pub released_leaves: usize,
}

pub(crate) struct Walker<'a, F, M, A> {
    mapper: &'a M,
    alloc: &'a A,
    levels: usize,
    _format: PhantomData<F>,
}

#[derive(Copy, Clone, Default)]
struct Cursor {
    table: PhysicalAddress,
    level: usize,
    next: usize,
    end: usize,
}

impl<'a, F, M, A> Walker<'a, F, M, A>
where
    F: EntryFormat,
    M: PhysMapper,
    A: FrameAlloc,
{
    pub(crate) const fn new(mapper: &'a M, alloc: &'a A, levels: usize) -> Self {
        Self {
            mapper,
            alloc,
            levels,
            _format: PhantomData,
        }
    }

    #[inline(always)]
    fn table(&self, pa: PhysicalAddress) -> &'a mut PageTable {
        // SAFETY: every address handed to this walker is a root or an address
        // read from a present non-leaf entry of a tree the caller owns.
        unsafe { table_at(self.mapper, pa) }
    }

    /// Locate the leaf for `virt`: `(table, index, entry, level)`.
    fn find_leaf(&self, root: PhysicalAddress, virt: VirtualAddress) -> Option<(PhysicalAddress, usize, u64, usize)> {
        let mut table = root;
        for level in (1..=self.levels).rev() {
            let index = virt.table_index(level_shift(level));
            let entry = self.table(table).get(index);
            if !F::is_present(entry) {
                return None;
            }
            if F::is_leaf(entry, level) {
                return Some((table, index, entry, level));
            }
            table = F::address(entry, level);
        }
        None
    }

    fn translation(virt: VirtualAddress, entry: u64, level: usize) -> Translation {
        let size = level_size(level);
        Translation {
            phys: F::address(entry, level) + (virt.as_u64() & (size - 1)),
            flags: F::decode(entry, level, virt.is_upper_half()),
            size,
        }
    }

    pub(crate) fn resolve(&self, root: PhysicalAddress, virt: VirtualAddress) -> Option<Translation> {
        self.find_leaf(root, virt)
            .map(|(_, _, entry, level)| Self::translation(virt, entry, level))
    }

    pub(crate) fn remove(&self, root: PhysicalAddress, virt: VirtualAddress) -> Option<Translation> {
        let (table, index, entry, level) = self.find_leaf(root, virt)?;
        self.table(table).set(index, 0);
        Some(Self::translation(virt, entry, level))
    }

    /// Install a leaf, reserving every missing intermediate table first.
    pub(crate) fn insert(
        &self,
        root: PhysicalAddress,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: MapFlags,
    ) -> Result<(), HatError> {
        let leaf_level = if flags.contains(MapFlags::HUGE) { 2 } else { 1 };
        let upper_half = virt.is_upper_half();

        if leaf_level == 2 && !(virt.is_aligned(HUGE_PAGE_SIZE) && phys.is_aligned(HUGE_PAGE_SIZE)) {
            log::warn!("hat: misaligned huge mapping {virt} -> {phys}");
        } else if !(virt.is_aligned(PAGE_SIZE) && phys.is_aligned(PAGE_SIZE)) {
            log::warn!("hat: misaligned mapping {virt} -> {phys}");
        }

        // Descend through the existing chain.
        let mut table = root;
        let mut level = self.levels;
        while level > leaf_level {
            let entry = self.table(table).get(virt.table_index(level_shift(level)));
            if !F::is_present(entry) {
                break;
            }
            if F::is_leaf(entry, level) {
                log::warn!("hat: replacing level-{level} leaf at {virt} with a table");
                break;
            }
            table = F::address(entry, level);
            level -= 1;
        }

        // Reserve all missing tables up front so failure leaves the tree untouched.
        let needed = level - leaf_level;
        let mut reserved = [PhysicalAddress::zero(); MAX_LEVELS];
        for i in 0..needed {
            if let Some(frame) = self.alloc.alloc_table() {
                reserved[i] = frame;
            } else {
                for &frame in &reserved[..i] {
                    self.alloc.free_table(frame);
                }
                return Err(HatError::OutOfMemory { needed });
            }
        }

        for &next in &reserved[..needed] {
            self.table(table)
                .set(virt.table_index(level_shift(level)), F::table_entry(next, !upper_half));
            table = next;
            level -= 1;
        }

        let slot = virt.table_index(level_shift(leaf_level));
        let previous = self.table(table).get(slot);
        self.table(table)
            .set(slot, F::leaf_entry(phys, flags, leaf_level, upper_half));

        // A huge page over a table: the table and everything below it go.
        if F::is_present(previous) && !F::is_leaf(previous, leaf_level) {
            let freed = self.teardown(
                F::address(previous, leaf_level),
                leaf_level - 1,
                0..PageTable::ENTRIES,
                false,
            );
            log::debug!("hat: huge page at {virt} replaced {} tables", freed.tables);
        }
        Ok(())
    }

    /// Copy root entries `slots` from `src` into `dst`.
    pub(crate) fn copy_slots(&self, src: PhysicalAddress, dst: PhysicalAddress, slots: Range<usize>) {
        let (src, dst) = (self.table(src), self.table(dst));
        for i in slots {
            dst.set(i, src.get(i));
        }
    }

    /// Tear down the subtree below root entries `root_slots`, then the root.
    pub(crate) fn scrub(&self, root: PhysicalAddress, root_slots: Range<usize>) -> ScrubStats {
        self.teardown(root, self.levels, root_slots, true)
    }

    /// Free every table below entries `slots` of the level-`level` table at
    /// `table`, then `table` itself. Terminal frames go back to the
    /// allocator only with `release_leaves`.
    ///
    /// Iterative, deepest tables first; the explicit stack never grows past
    /// the paging depth.
    fn teardown(&self, table: PhysicalAddress, level: usize, slots: Range<usize>, release_leaves: bool) -> ScrubStats {
        let mut stats = ScrubStats::default();
        let mut stack = [Cursor::default(); MAX_LEVELS];
        stack[0] = Cursor {
            table,
            level,
            next: slots.start,
            end: slots.end,
        };
        let mut depth = 1;

        while depth > 0 {
            let top = &mut stack[depth - 1];
            if top.next == top.end {
                self.alloc.free_table(top.table);
                stats.tables += 1;
                depth -= 1;
                continue;
            }

            let (table, level, index) = (top.table, top.level, top.next);
            top.next += 1;

            let pt = self.table(table);
            let entry = pt.get(index);
            if !F::is_present(entry) {
                continue;
            }
            pt.set(index, 0);

            if F::is_leaf(entry, level) {
                #[allow(clippy::cast_possible_truncation)]
                let frames = (level_size(level) / PAGE_SIZE) as usize;
                if release_leaves && self.alloc.release_leaf(F::address(entry, level), frames) {
                    stats.released_leaves += 1;
                }
                continue;
            }

            stack[depth] = Cursor {
                table: F::address(entry, level),
                level: level - 1,
                next: 0,
                end: PageTable::ENTRIES,
            };
            depth += 1;
        }

        stats
    }
}
