//! # Memory Layout

/// Start of the kernel half with 4-level paging (48-bit canonical).
pub const HIGHER_HALF_4LV: u64 = 0xffff_8000_0000_0000;

/// Start of the kernel half with 5-level paging (57-bit canonical).
pub const HIGHER_HALF_5LV: u64 = 0xff00_0000_0000_0000;

/// Higher Half Direct Map base. Physical memory is reachable at
/// [`HHDM_BASE`] + `pa` in every address space.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Where the kernel executes (VMA).
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Top of the user-half region segments are carved from (4-level).
pub const USER_MMAP_CEILING_4LV: u64 = 0x0000_7000_0000_0000 - GIB;

/// Top of the user-half region segments are carved from (5-level).
pub const USER_MMAP_CEILING_5LV: u64 = 0x00ff_f000_0000_0000 - GIB;

/// Physical memory below this address is never handed out.
pub const LOW_MEMORY_LIMIT: u64 = 0x0010_0000;

/// Number of hardware address-space identifiers (12-bit PCID, 16-bit ASID
/// truncated to the same pool size).
pub const ASID_COUNT: usize = 4096;

/// The ASID reserved for the kernel address space.
pub const KERNEL_ASID: u16 = 0;

/// Root-table slot where the kernel half begins.
pub const KERNEL_HALF_FIRST_SLOT: usize = 256;

const GIB: u64 = 1024 * 1024 * 1024;

/// Paging depth.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PagingMode {
    /// PML4 root, 48-bit virtual addresses.
    FourLevel,
    /// PML5 root (`CR4.LA57`), 57-bit virtual addresses.
    FiveLevel,
}

impl PagingMode {
    #[must_use]
    pub const fn levels(self) -> usize {
        match self {
            Self::FourLevel => 4,
            Self::FiveLevel => 5,
        }
    }

    /// Bit position of the root-level index.
    #[must_use]
    pub const fn root_shift(self) -> u32 {
        match self {
            Self::FourLevel => 39,
            Self::FiveLevel => 48,
        }
    }

    #[must_use]
    pub const fn higher_half(self) -> u64 {
        match self {
            Self::FourLevel => HIGHER_HALF_4LV,
            Self::FiveLevel => HIGHER_HALF_5LV,
        }
    }

    #[must_use]
    pub const fn user_mmap_ceiling(self) -> u64 {
        match self {
            Self::FourLevel => USER_MMAP_CEILING_4LV,
            Self::FiveLevel => USER_MMAP_CEILING_5LV,
        }
    }
}

const _: () = {
    assert!(HHDM_BASE >= HIGHER_HALF_4LV);
    assert!(KERNEL_BASE > HHDM_BASE);
    assert!(USER_MMAP_CEILING_4LV < HIGHER_HALF_4LV);
    assert!(USER_MMAP_CEILING_5LV < HIGHER_HALF_5LV);
    assert!(USER_MMAP_CEILING_4LV.is_multiple_of(4096));
    assert!(ASID_COUNT.is_power_of_two());
};
