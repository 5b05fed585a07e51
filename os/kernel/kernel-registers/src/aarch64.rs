//! # AArch64 translation registers
//!
//! * `TTBR0_EL1`: user-half root, tagged with the ASID in bits 63:48
//! * `MAIR_EL1`: memory attribute slots referenced by a descriptor's `AttrIndx`
//! * `TCR_EL1`: 48-bit split, 4 KiB granule, 16-bit ASIDs
//!
//! `TTBR1_EL1` (kernel half) is written once during bring-up and never
//! reloaded on address-space switches.

use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// `TTBR0_EL1` / `TTBR1_EL1` layout.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Ttbr {
    /// Bit 0 — CnP: common-not-private.
    pub cnp: bool,

    /// Bits 1–47 — table base address >> 1.
    #[bits(47)]
    baddr: u64,

    /// Bits 48–63 — ASID.
    #[bits(16)]
    pub asid: u16,
}

impl Ttbr {
    #[must_use]
    pub fn for_root(root: PhysicalAddress, asid: u16) -> Self {
        debug_assert!(root.is_aligned(4096), "root table must be 4K-aligned");
        Self::new().with_baddr(root.as_u64() >> 1).with_asid(asid)
    }

    #[must_use]
    pub fn root_phys(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.baddr() << 1)
    }
}

/// `MAIR_EL1` attribute slot for normal write-back memory.
pub const MAIR_IDX_WRITE_BACK: u8 = 0;
/// Normal non-cacheable; used for write-combining framebuffers.
pub const MAIR_IDX_NON_CACHEABLE: u8 = 1;
/// Device-nGnRnE (strongly ordered, uncached).
pub const MAIR_IDX_DEVICE_NGNRNE: u8 = 2;
/// Device-nGnRE (MMIO).
pub const MAIR_IDX_DEVICE_NGNRE: u8 = 3;
/// Normal write-through.
pub const MAIR_IDX_WRITE_THROUGH: u8 = 4;

/// `MAIR_EL1` value matching the `MAIR_IDX_*` slots.
pub const MAIR_VALUE: u64 = 0xFF // normal, inner/outer WB RW-allocate
    | (0x44 << 8) // normal, inner/outer non-cacheable
    | (0x00 << 16) // device-nGnRnE
    | (0x04 << 24) // device-nGnRE
    | (0xBB << 32); // normal, inner/outer WT RW-allocate

/// `TCR_EL1` for a 48-bit split with 4 KiB granules and 16-bit ASIDs.
///
/// `pa_range` is `ID_AA64MMFR0_EL1.PARange`.
#[must_use]
pub const fn tcr_value(pa_range: u64) -> u64 {
    16 // T0SZ
        | (16 << 16) // T1SZ
        | (1 << 8) // TTBR0 inner WB RW-allocate
        | (1 << 10) // TTBR0 outer WB RW-allocate
        | (3 << 12) // TTBR0 inner shareable
        | (1 << 24) // TTBR1 inner WB RW-allocate
        | (1 << 26) // TTBR1 outer WB RW-allocate
        | (3 << 28) // TTBR1 inner shareable
        | (2 << 30) // TTBR1 4K granule
        | ((pa_range & 0x7) << 32)
        | (1 << 36) // 16-bit ASIDs
}

/// Write `TTBR0_EL1` and synchronize.
///
/// # Safety
/// EL1 only. `value` must reference a valid table tree.
#[cfg(all(feature = "asm", target_arch = "aarch64"))]
pub unsafe fn store_ttbr0(value: Ttbr) {
    unsafe {
        core::arch::asm!(
            "dsb ishst",
            "msr ttbr0_el1, {}",
            "isb",
            in(reg) value.into_bits(),
            options(nostack, preserves_flags)
        );
    }
}

/// Write `TTBR1_EL1` and synchronize.
///
/// # Safety
/// EL1 only. The kernel half must stay mapped across the switch.
#[cfg(all(feature = "asm", target_arch = "aarch64"))]
pub unsafe fn store_ttbr1(value: Ttbr) {
    unsafe {
        core::arch::asm!(
            "dsb ishst",
            "msr ttbr1_el1, {}",
            "isb",
            in(reg) value.into_bits(),
            options(nostack, preserves_flags)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asid_in_top_sixteen_bits() {
        let t = Ttbr::for_root(PhysicalAddress::new(0x4008_0000), 0x1234);
        assert_eq!(t.into_bits(), 0x1234_0000_4008_0000);
        assert_eq!(t.root_phys(), PhysicalAddress::new(0x4008_0000));
    }

    #[test]
    fn mair_slots() {
        let slot = |i: u8| (MAIR_VALUE >> (u64::from(i) * 8)) & 0xFF;
        assert_eq!(slot(MAIR_IDX_WRITE_BACK), 0xFF);
        assert_eq!(slot(MAIR_IDX_NON_CACHEABLE), 0x44);
        assert_eq!(slot(MAIR_IDX_DEVICE_NGNRNE), 0x00);
        assert_eq!(slot(MAIR_IDX_DEVICE_NGNRE), 0x04);
        assert_eq!(slot(MAIR_IDX_WRITE_THROUGH), 0xBB);
    }
}
