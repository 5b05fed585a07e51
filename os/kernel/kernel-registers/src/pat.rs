//! # Page Attribute Table
//!
//! The PAT MSR holds eight memory-type slots. A leaf PTE picks one with its
//! `PAT`, `PCD` and `PWT` bits (index = `PAT << 2 | PCD << 1 | PWT`).
//!
//! ```text
//!  slot  PAT PCD PWT   type
//!   0     0   0   0    WB
//!   1     0   0   1    WT
//!   2     0   1   0    UC-
//!   3     0   1   1    UC
//!   4     1   0   0    WB
//!   5     1   0   1    WT
//!   6     1   1   0    WP
//!   7     1   1   1    WC
//! ```
//!
//! The low four slots match the power-on default, so mappings created before
//! the MSR is programmed keep their meaning.

/// `IA32_PAT` MSR index.
pub const IA32_PAT: u32 = 0x277;

/// Architectural memory-type encodings used in PAT slots.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PatMemoryType {
    Uncacheable = 0x00,
    WriteCombining = 0x01,
    WriteThrough = 0x04,
    WriteProtected = 0x05,
    WriteBack = 0x06,
    UncachedMinus = 0x07,
}

/// Slot layout programmed at boot.
pub const PAT_SLOTS: [PatMemoryType; 8] = [
    PatMemoryType::WriteBack,
    PatMemoryType::WriteThrough,
    PatMemoryType::UncachedMinus,
    PatMemoryType::Uncacheable,
    PatMemoryType::WriteBack,
    PatMemoryType::WriteThrough,
    PatMemoryType::WriteProtected,
    PatMemoryType::WriteCombining,
];

/// [`PAT_SLOTS`] packed into the MSR value.
pub const PAT_VALUE: u64 = encode(&PAT_SLOTS);

#[must_use]
pub const fn encode(slots: &[PatMemoryType; 8]) -> u64 {
    let mut value = 0;
    let mut i = 0;
    while i < 8 {
        value |= (slots[i] as u64) << (i * 8);
        i += 1;
    }
    value
}

/// Program `IA32_PAT` with [`PAT_VALUE`].
///
/// # Safety
/// Ring 0 only. Existing cached translations must be flushed by the caller.
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
#[allow(clippy::cast_possible_truncation)]
pub unsafe fn store_pat() {
    let lo = (PAT_VALUE & 0xFFFF_FFFF) as u32;
    let hi = (PAT_VALUE >> 32) as u32;
    unsafe {
        core::arch::asm!(
            "wrmsr",
            in("ecx") IA32_PAT,
            in("eax") lo,
            in("edx") hi,
            options(nostack, preserves_flags)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_value() {
        assert_eq!(PAT_VALUE, 0x0105_0406_0007_0406);
    }
}
