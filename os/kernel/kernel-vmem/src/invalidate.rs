//! # TLB invalidation requests
//!
//! ```text
//!  mode         x86_64 (INVPCID)   x86_64 (PCID only)      x86_64 (no PCID)   aarch64
//!  SingleAddr   type 0             INVLPG / CR3 trick      INVLPG             TLBI VAE1IS / VAAE1IS
//!  SingleAsid   type 1             CR3 reload trick        PGE toggle         TLBI ASIDE1IS
//!  AllAsids     type 3             PGE toggle              PGE toggle         TLBI VMALLE1IS
//!  EntireTlb    type 2             PGE toggle              PGE toggle         TLBI VMALLE1IS
//! ```
//!
//! Every sequence runs under [`INVALIDATION_LOCK`] so the multi-step
//! variants (CR3 and CR4 toggles) never interleave on one CPU with another
//! invalidation started from interrupt context.

use kernel_memory_addresses::VirtualAddress;
use kernel_sync::SpinLock;

/// Serializes every invalidation sequence issued through a [`Hat`](crate::Hat).
pub static INVALIDATION_LOCK: SpinLock<()> = SpinLock::new(());

/// Run `f` with [`INVALIDATION_LOCK`] held.
#[inline]
pub fn serialized<R>(f: impl FnOnce() -> R) -> R {
    let _guard = INVALIDATION_LOCK.lock();
    f()
}

/// What to drop from the TLB.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InvalidationMode {
    /// One page of one address space.
    SingleAddr = 0,
    /// Every non-global entry tagged with one ASID.
    SingleAsid = 1,
    /// Every non-global entry of every ASID.
    AllAsids = 2,
    /// Everything, global entries included.
    EntireTlb = 3,
}

impl TryFrom<u32> for InvalidationMode {
    type Error = u32;

    /// Decode a mode received over an IPI mailbox.
    fn try_from(raw: u32) -> Result<Self, u32> {
        match raw {
            0 => Ok(Self::SingleAddr),
            1 => Ok(Self::SingleAsid),
            2 => Ok(Self::AllAsids),
            3 => Ok(Self::EntireTlb),
            other => Err(other),
        }
    }
}

/// One invalidation request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Invalidation {
    pub mode: InvalidationMode,
    /// Page to drop; only meaningful for [`InvalidationMode::SingleAddr`].
    pub virt: VirtualAddress,
    pub asid: u16,
}

impl Invalidation {
    #[must_use]
    pub const fn page(virt: VirtualAddress, asid: u16) -> Self {
        Self {
            mode: InvalidationMode::SingleAddr,
            virt,
            asid,
        }
    }

    #[must_use]
    pub const fn asid(asid: u16) -> Self {
        Self {
            mode: InvalidationMode::SingleAsid,
            virt: VirtualAddress::new(0),
            asid,
        }
    }

    #[must_use]
    pub const fn all_asids() -> Self {
        Self {
            mode: InvalidationMode::AllAsids,
            virt: VirtualAddress::new(0),
            asid: 0,
        }
    }

    #[must_use]
    pub const fn everything() -> Self {
        Self {
            mode: InvalidationMode::EntireTlb,
            virt: VirtualAddress::new(0),
            asid: 0,
        }
    }
}
