use crate::{PAGE_SIZE, align_down, is_aligned};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Virtual memory address.
///
/// The upper half (bit 63 set) belongs to the kernel on both supported
/// architectures; the lower half belongs to user space.
///
/// ```rust
/// # use kernel_memory_addresses::*;
/// assert!(VirtualAddress::new(0xFFFF_FFFF_8000_0000).is_upper_half());
/// assert!(!VirtualAddress::new(0x0000_7000_0000_0000).is_upper_half());
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// 9-bit table index for the level whose index starts at bit `shift`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn table_index(self, shift: u32) -> usize {
        ((self.0 >> shift) & 0x1FF) as usize
    }

    /// Whether the address lies in the kernel (upper) half.
    #[inline]
    #[must_use]
    pub const fn is_upper_half(self) -> bool {
        self.0 & (1 << 63) != 0
    }

    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }

    #[inline]
    #[must_use]
    pub const fn align_down(self, a: u64) -> Self {
        Self(align_down(self.0, a))
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned(self, a: u64) -> bool {
        is_aligned(self.0, a)
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

/// Byte distance between two addresses.
impl Sub for VirtualAddress {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> u64 {
        self.0 - rhs.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_indices_for_four_levels() {
        // PML4=1, PDPT=2, PD=3, PT=4, offset=0x5
        let va = VirtualAddress::new((1 << 39) | (2 << 30) | (3 << 21) | (4 << 12) | 0x5);
        assert_eq!(va.table_index(39), 1);
        assert_eq!(va.table_index(30), 2);
        assert_eq!(va.table_index(21), 3);
        assert_eq!(va.table_index(12), 4);
        assert_eq!(va.page_offset(), 5);
    }

    #[test]
    fn fifth_level_index() {
        let va = VirtualAddress::new(0x00FF_F000_0000_0000);
        assert_eq!(va.table_index(48), 0xFF);
    }
}
