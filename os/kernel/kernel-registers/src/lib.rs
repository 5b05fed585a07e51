//! # Paging control registers
//!
//! Typed layouts for the registers the memory subsystem programs:
//!
//! | Register | Module | Used for |
//! |----------|--------|----------|
//! | `CR3` | [`cr3`] | root table + PCID on x86_64 |
//! | `CR4` | [`cr4`] | `PGE` toggling, `PCIDE`, `LA57` |
//! | `IA32_PAT` | [`pat`] | cache-type slots referenced by PTEs |
//! | `TTBR0_EL1`, `MAIR_EL1`, `TCR_EL1` | [`aarch64`] | user root + ASID, memory attributes |
//!
//! Layouts are plain data and usable on any host. The actual register
//! accesses are gated behind the `asm` feature and the matching
//! `target_arch`, so the crate builds (and tests) everywhere.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod aarch64;
pub mod cr3;
pub mod cr4;
pub mod pat;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0 / EL1).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0 / EL1).
    unsafe fn store_unsafe(self);
}
