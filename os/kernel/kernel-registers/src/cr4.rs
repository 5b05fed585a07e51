use bitfield_struct::bitfield;

/// CR4, reduced to the paging-related controls.
///
/// All other bits are carried through untouched so a read-modify-write
/// never disturbs unrelated features.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Cr4 {
    #[bits(7, access = RO)]
    pub reserved0: u8,

    /// Bit 7 — PGE: Page Global Enable. Toggling it flushes every TLB
    /// entry, global ones included.
    pub pge: bool,

    #[bits(4, access = RO)]
    pub reserved1: u8,

    /// Bit 12 — LA57: 57-bit linear addresses (5-level paging).
    pub la57: bool,

    #[bits(4, access = RO)]
    pub reserved2: u8,

    /// Bit 17 — PCIDE: Process-Context Identifiers.
    pub pcide: bool,

    #[bits(46, access = RO)]
    pub reserved3: u64,
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl crate::LoadRegisterUnsafe for Cr4 {
    unsafe fn load_unsafe() -> Self {
        let cr4: u64;
        unsafe {
            core::arch::asm!("mov {}, cr4", out(reg) cr4, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr4)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl crate::StoreRegisterUnsafe for Cr4 {
    unsafe fn store_unsafe(self) {
        let cr4 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr4, {}", in(reg) cr4, options(nostack, preserves_flags));
        }
    }
}
