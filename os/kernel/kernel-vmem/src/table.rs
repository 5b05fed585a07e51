use crate::MapFlags;
use kernel_memory_addresses::{PhysMapper, PhysicalAddress};

/// Highest paging depth any backend uses (x86_64 LA57).
pub(crate) const MAX_LEVELS: usize = 5;

/// A 4 KiB page-table frame: 512 raw 64-bit entries.
///
/// Both backends share the geometry; only the entry encoding differs
/// (see [`EntryFormat`]).
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [u64; PageTable::ENTRIES],
}

impl PageTable {
    pub const ENTRIES: usize = 512;

    #[inline(always)]
    #[must_use]
    pub const fn get(&self, index: usize) -> u64 {
        self.entries[index]
    }

    #[inline(always)]
    pub const fn set(&mut self, index: usize, entry: u64) {
        self.entries[index] = entry;
    }

    /// Number of non-zero entries.
    #[must_use]
    pub fn populated(&self) -> usize {
        self.entries.iter().filter(|&&e| e != 0).count()
    }
}

/// View the table frame at `pa`.
///
/// # Safety
/// `pa` must be a page-table frame reachable through `mapper`, and the
/// caller must hold whatever lock serializes edits to that tree.
#[inline(always)]
pub(crate) unsafe fn table_at<'a, M: PhysMapper>(mapper: &M, pa: PhysicalAddress) -> &'a mut PageTable {
    unsafe { mapper.phys_to_mut::<PageTable>(pa) }
}

/// Bit position of the index for `level` (1 = leaf table).
#[inline(always)]
#[allow(clippy::cast_possible_truncation)]
pub(crate) const fn level_shift(level: usize) -> u32 {
    12 + 9 * (level as u32 - 1)
}

/// Bytes mapped by one leaf at `level`.
#[inline(always)]
pub(crate) const fn level_size(level: usize) -> u64 {
    1 << level_shift(level)
}

/// Hardware encoding of table entries for one architecture.
pub(crate) trait EntryFormat {
    fn is_present(entry: u64) -> bool;

    /// Whether a present entry at `level` maps memory instead of a table.
    fn is_leaf(entry: u64, level: usize) -> bool;

    /// Output address of a present entry.
    fn address(entry: u64, level: usize) -> PhysicalAddress;

    /// Non-leaf entry pointing at `table`.
    fn table_entry(table: PhysicalAddress, user: bool) -> u64;

    /// Leaf entry for `phys` at `level` (1 or 2).
    fn leaf_entry(phys: PhysicalAddress, flags: MapFlags, level: usize, upper_half: bool) -> u64;

    /// Attributes of a leaf entry.
    fn decode(entry: u64, level: usize, upper_half: bool) -> MapFlags;
}
