use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// CR3 with `CR4.PCIDE = 1`.
///
/// The low 12 bits carry the process-context identifier instead of the
/// PWT/PCD cache bits. Bit 63 is only meaningful on writes: when set, TLB
/// entries tagged with the new PCID survive the switch.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Cr3 {
    /// Bits 0–11 — PCID of the address space being loaded.
    #[bits(12)]
    pub pcid: u16,

    /// Bits 12–51 — root table physical base >> 12.
    #[bits(40)]
    root_4k: u64,

    /// Bits 52–62 — Reserved.
    #[bits(11, access = RO)]
    pub reserved: u16,

    /// Bit 63 — do not flush entries tagged with [`pcid`](Self::pcid).
    pub no_flush: bool,
}

impl Cr3 {
    /// Build a CR3 value for `root` tagged with `pcid`.
    ///
    /// `root` must be 4 KiB-aligned.
    #[must_use]
    pub fn for_root(root: PhysicalAddress, pcid: u16, no_flush: bool) -> Self {
        debug_assert!(root.is_aligned(4096), "root table must be 4K-aligned");
        Self::new()
            .with_pcid(pcid & 0xFFF)
            .with_root_4k(root.as_u64() >> 12)
            .with_no_flush(no_flush)
    }

    /// Physical address of the root table.
    #[must_use]
    pub fn root_phys(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.root_4k() << 12)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl crate::LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl crate::StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcid_and_root_round_trip() {
        let cr3 = Cr3::for_root(PhysicalAddress::new(0x1234_5000), 0x2A, true);
        assert_eq!(cr3.into_bits(), 0x8000_0000_1234_502A);
        assert_eq!(cr3.root_phys(), PhysicalAddress::new(0x1234_5000));
        assert_eq!(cr3.pcid(), 0x2A);
    }

    #[test]
    fn pcid_is_truncated_to_twelve_bits() {
        let cr3 = Cr3::for_root(PhysicalAddress::new(0x1000), 0x1FFF, false);
        assert_eq!(cr3.pcid(), 0xFFF);
        assert!(!cr3.no_flush());
    }
}
