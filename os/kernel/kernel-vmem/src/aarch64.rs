//! # AArch64 backend
//!
//! 4-level, 4 KiB-granule tables. User mappings live under `TTBR0_EL1`,
//! kernel mappings under `TTBR1_EL1`, which every address space shares.
//!
//! Stage-1 descriptor bits used here:
//!
//! | Bits  | Field     | Meaning |
//! |-------|-----------|---------|
//! | 0     | valid     | |
//! | 1     | type      | 1 = table/page, 0 = block (level 2) |
//! | 4:2   | AttrIndx  | `MAIR_EL1` slot |
//! | 6     | AP[1]     | EL0 accessible |
//! | 7     | AP[2]     | read-only |
//! | 9:8   | SH        | shareability |
//! | 10    | AF        | access flag |
//! | 11    | nG        | not global (ASID-tagged) |
//! | 53    | PXN       | no EL1 execution |
//! | 54    | UXN       | no EL0 execution |
//!
//! `TLBI ...IS` operations reach every CPU in the inner-shareable domain,
//! so this backend sets [`Hat::BROADCASTS_INVALIDATION`].

use crate::invalidate::{self, Invalidation, InvalidationMode};
use crate::table::{EntryFormat, PageTable};
use crate::walk::{ScrubStats, Walker};
use crate::{CacheType, FrameAlloc, Hat, HatError, MapFlags, Translation};
use bitfield_struct::bitfield;
use bitflags::bitflags;
use kernel_memory_addresses::{PhysMapper, PhysicalAddress, VirtualAddress};
use kernel_registers::aarch64::{
    MAIR_IDX_DEVICE_NGNRE, MAIR_IDX_DEVICE_NGNRNE, MAIR_IDX_NON_CACHEABLE, MAIR_IDX_WRITE_BACK,
    MAIR_IDX_WRITE_THROUGH, Ttbr,
};

const LEVELS: usize = 4;
const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;
const BLOCK_ADDR_MASK: u64 = 0x0000_FFFF_FFE0_0000;
const ATTR_INDX_SHIFT: u32 = 2;
const SH_SHIFT: u32 = 8;
const SH_OUTER: u64 = 0b10;
const SH_INNER: u64 = 0b11;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct DescriptorBits: u64 {
        const VALID = 1 << 0;
        const TABLE_OR_PAGE = 1 << 1;
        const ATTR_INDX = 0b111 << 2;
        const AP_EL0 = 1 << 6;
        const AP_RO = 1 << 7;
        const SH = 0b11 << 8;
        const AF = 1 << 10;
        const NG = 1 << 11;
        const PXN = 1 << 53;
        const UXN = 1 << 54;
    }
}

const fn attr_index(cache: CacheType) -> u8 {
    match cache {
        CacheType::WriteBack | CacheType::WriteProtect => MAIR_IDX_WRITE_BACK,
        CacheType::WriteCombining => MAIR_IDX_NON_CACHEABLE,
        CacheType::Uncached => MAIR_IDX_DEVICE_NGNRNE,
        CacheType::Device => MAIR_IDX_DEVICE_NGNRE,
        CacheType::WriteThrough => MAIR_IDX_WRITE_THROUGH,
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn attr_cache(index: u64) -> CacheType {
    match index as u8 {
        MAIR_IDX_NON_CACHEABLE => CacheType::WriteCombining,
        MAIR_IDX_DEVICE_NGNRNE => CacheType::Uncached,
        MAIR_IDX_DEVICE_NGNRE => CacheType::Device,
        MAIR_IDX_WRITE_THROUGH => CacheType::WriteThrough,
        _ => CacheType::WriteBack,
    }
}

pub(crate) struct Aarch64Format;

impl EntryFormat for Aarch64Format {
    #[inline(always)]
    fn is_present(entry: u64) -> bool {
        entry & DescriptorBits::VALID.bits() != 0
    }

    #[inline(always)]
    fn is_leaf(entry: u64, level: usize) -> bool {
        level == 1 || entry & DescriptorBits::TABLE_OR_PAGE.bits() == 0
    }

    #[inline(always)]
    fn address(entry: u64, level: usize) -> PhysicalAddress {
        if level == 2 && Self::is_leaf(entry, level) {
            PhysicalAddress::new(entry & BLOCK_ADDR_MASK)
        } else {
            PhysicalAddress::new(entry & ADDR_MASK)
        }
    }

    fn table_entry(table: PhysicalAddress, _user: bool) -> u64 {
        (table.as_u64() & ADDR_MASK) | (DescriptorBits::VALID | DescriptorBits::TABLE_OR_PAGE).bits()
    }

    fn leaf_entry(phys: PhysicalAddress, flags: MapFlags, level: usize, upper_half: bool) -> u64 {
        if !flags.contains(MapFlags::READ) {
            log::warn!("hat: aarch64 cannot map {phys} non-readable; mapping readable");
        }

        let cache = flags.cache_type();
        if cache == CacheType::WriteProtect {
            log::debug!("hat: no write-protect memory type on aarch64; using write-back for {phys}");
        }

        let mut bits = DescriptorBits::VALID | DescriptorBits::AF;
        bits.set(DescriptorBits::TABLE_OR_PAGE, level == 1);
        bits.set(DescriptorBits::AP_EL0, flags.contains(MapFlags::USER));
        bits.set(DescriptorBits::AP_RO, !flags.contains(MapFlags::WRITE));
        bits.set(DescriptorBits::NG, !flags.contains(MapFlags::GLOBAL));

        let exec = flags.contains(MapFlags::EXEC);
        if upper_half {
            bits.insert(DescriptorBits::UXN);
            bits.set(DescriptorBits::PXN, !exec);
        } else {
            bits.insert(DescriptorBits::PXN);
            bits.set(DescriptorBits::UXN, !exec);
        }

        let shareability = if cache == CacheType::WriteBack || cache == CacheType::WriteProtect {
            SH_INNER
        } else {
            SH_OUTER
        };
        let mask = if level == 1 { ADDR_MASK } else { BLOCK_ADDR_MASK };

        (phys.as_u64() & mask)
            | bits.bits()
            | (u64::from(attr_index(cache)) << ATTR_INDX_SHIFT)
            | (shareability << SH_SHIFT)
    }

    fn decode(entry: u64, level: usize, upper_half: bool) -> MapFlags {
        let bits = DescriptorBits::from_bits_retain(entry);
        let mut flags = MapFlags::READ;
        flags.set(MapFlags::WRITE, !bits.contains(DescriptorBits::AP_RO));
        flags.set(MapFlags::USER, bits.contains(DescriptorBits::AP_EL0));
        flags.set(MapFlags::GLOBAL, !bits.contains(DescriptorBits::NG));
        let xn = if upper_half {
            DescriptorBits::PXN
        } else {
            DescriptorBits::UXN
        };
        flags.set(MapFlags::EXEC, !bits.contains(xn));
        flags.set(MapFlags::HUGE, level == 2);
        flags.with_cache(attr_cache(
            (entry & DescriptorBits::ATTR_INDX.bits()) >> ATTR_INDX_SHIFT,
        ))
    }
}

/// Register operand of `TLBI VAE1IS` / `VAAE1IS` / `ASIDE1IS`.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct TlbiOperand {
    /// Bits 0–43 — VA[55:12].
    #[bits(44)]
    pub va_page: u64,

    #[bits(4, access = RO)]
    pub reserved: u8,

    /// Bits 48–63 — ASID (ignored by the `VAA` forms).
    #[bits(16)]
    pub asid: u16,
}

impl TlbiOperand {
    #[must_use]
    pub const fn for_page(virt: VirtualAddress, asid: u16) -> Self {
        Self::new()
            .with_va_page((virt.as_u64() >> 12) & ((1 << 44) - 1))
            .with_asid(asid)
    }

    #[must_use]
    pub const fn for_asid(asid: u16) -> Self {
        Self::new().with_asid(asid)
    }
}

/// TLB maintenance and translation-base writes.
pub trait Aarch64Mmu: Send + Sync {
    /// `TLBI VAE1IS` or, with `all_asids`, `TLBI VAAE1IS`.
    fn tlbi_va(&self, operand: TlbiOperand, all_asids: bool);
    /// `TLBI ASIDE1IS`.
    fn tlbi_asid(&self, operand: TlbiOperand);
    /// `TLBI VMALLE1IS`.
    fn tlbi_all(&self);
    fn write_ttbr0(&self, ttbr: Ttbr);
}

#[cfg(all(feature = "asm", target_arch = "aarch64"))]
pub struct NativeAarch64Mmu {
    _private: (),
}

#[cfg(all(feature = "asm", target_arch = "aarch64"))]
impl NativeAarch64Mmu {
    /// # Safety
    /// Only usable at EL1.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

#[cfg(all(feature = "asm", target_arch = "aarch64"))]
impl Aarch64Mmu for NativeAarch64Mmu {
    fn tlbi_va(&self, operand: TlbiOperand, all_asids: bool) {
        unsafe {
            if all_asids {
                core::arch::asm!(
                    "dsb ishst",
                    "tlbi vaae1is, {}",
                    "dsb ish",
                    "isb",
                    in(reg) operand.into_bits(),
                    options(nostack, preserves_flags)
                );
            } else {
                core::arch::asm!(
                    "dsb ishst",
                    "tlbi vae1is, {}",
                    "dsb ish",
                    "isb",
                    in(reg) operand.into_bits(),
                    options(nostack, preserves_flags)
                );
            }
        }
    }

    fn tlbi_asid(&self, operand: TlbiOperand) {
        unsafe {
            core::arch::asm!(
                "dsb ishst",
                "tlbi aside1is, {}",
                "dsb ish",
                "isb",
                in(reg) operand.into_bits(),
                options(nostack, preserves_flags)
            );
        }
    }

    fn tlbi_all(&self) {
        unsafe {
            core::arch::asm!(
                "dsb ishst",
                "tlbi vmalle1is",
                "dsb ish",
                "isb",
                options(nostack, preserves_flags)
            );
        }
    }

    fn write_ttbr0(&self, ttbr: Ttbr) {
        unsafe { kernel_registers::aarch64::store_ttbr0(ttbr) }
    }
}

/// Translation roots of one address space.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Aarch64Root {
    /// Private user-half tree.
    pub ttbr0: PhysicalAddress,
    /// Kernel-half tree, identical in every space.
    pub ttbr1: PhysicalAddress,
}

/// aarch64 [`Hat`].
pub struct Aarch64Hat<M, A, U> {
    mapper: M,
    alloc: A,
    mmu: U,
    kernel_root: Aarch64Root,
}

impl<M, A, U> Aarch64Hat<M, A, U>
where
    M: PhysMapper + Send + Sync,
    A: FrameAlloc + Send + Sync,
    U: Aarch64Mmu,
{
    /// Backend with fresh, empty `TTBR0` and `TTBR1` trees for the kernel.
    ///
    /// # Errors
    /// [`HatError::OutOfMemory`] if the roots cannot be allocated.
    pub fn new(mapper: M, alloc: A, mmu: U) -> Result<Self, HatError> {
        let ttbr1 = alloc.alloc_table().ok_or(HatError::OutOfMemory { needed: 2 })?;
        let Some(ttbr0) = alloc.alloc_table() else {
            alloc.free_table(ttbr1);
            return Err(HatError::OutOfMemory { needed: 2 });
        };
        Ok(Self::with_kernel_root(mapper, alloc, mmu, Aarch64Root { ttbr0, ttbr1 }))
    }

    pub fn with_kernel_root(mapper: M, alloc: A, mmu: U, kernel_root: Aarch64Root) -> Self {
        log::info!(
            "hat: aarch64 4-level paging, kernel TTBR1 {}, ASID-tagged TTBR0",
            kernel_root.ttbr1
        );
        Self {
            mapper,
            alloc,
            mmu,
            kernel_root,
        }
    }

    pub const fn mmu(&self) -> &U {
        &self.mmu
    }

    fn walker(&self) -> Walker<'_, Aarch64Format, M, A> {
        Walker::new(&self.mapper, &self.alloc, LEVELS)
    }

    const fn tree(root: Aarch64Root, virt: VirtualAddress) -> PhysicalAddress {
        if virt.is_upper_half() {
            root.ttbr1
        } else {
            root.ttbr0
        }
    }
}

impl<M, A, U> Hat for Aarch64Hat<M, A, U>
where
    M: PhysMapper + Send + Sync,
    A: FrameAlloc + Send + Sync,
    U: Aarch64Mmu,
{
    type Root = Aarch64Root;

    const BROADCASTS_INVALIDATION: bool = true;

    fn kernel_root(&self) -> Aarch64Root {
        self.kernel_root
    }

    fn create_root(&self) -> Result<Aarch64Root, HatError> {
        let ttbr0 = self.alloc.alloc_table().ok_or(HatError::OutOfMemory { needed: 1 })?;
        Ok(Aarch64Root {
            ttbr0,
            ttbr1: self.kernel_root.ttbr1,
        })
    }

    fn insert(
        &self,
        root: Aarch64Root,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: MapFlags,
    ) -> Result<(), HatError> {
        self.walker().insert(Self::tree(root, virt), virt, phys, flags)
    }

    fn remove(&self, root: Aarch64Root, virt: VirtualAddress) -> Option<Translation> {
        self.walker().remove(Self::tree(root, virt), virt)
    }

    fn resolve(&self, root: Aarch64Root, virt: VirtualAddress) -> Option<Translation> {
        self.walker().resolve(Self::tree(root, virt), virt)
    }

    fn invalidate(&self, _root: Aarch64Root, request: Invalidation) {
        invalidate::serialized(|| match request.mode {
            InvalidationMode::SingleAddr => {
                // Global kernel entries carry no ASID.
                let global = request.virt.is_upper_half();
                self.mmu
                    .tlbi_va(TlbiOperand::for_page(request.virt, request.asid), global);
            }
            InvalidationMode::SingleAsid => self.mmu.tlbi_asid(TlbiOperand::for_asid(request.asid)),
            InvalidationMode::AllAsids | InvalidationMode::EntireTlb => self.mmu.tlbi_all(),
        });
    }

    fn scrub(&self, root: Aarch64Root) -> ScrubStats {
        if root.ttbr0 == self.kernel_root.ttbr0 {
            log::warn!("hat: refusing to scrub the kernel root");
            return ScrubStats::default();
        }
        let stats = self.walker().scrub(root.ttbr0, 0..PageTable::ENTRIES);
        log::debug!(
            "hat: scrubbed TTBR0 {}: {} tables, {} leaves",
            root.ttbr0,
            stats.tables,
            stats.released_leaves
        );
        stats
    }

    fn load(&self, root: Aarch64Root, asid: u16) {
        self.mmu.write_ttbr0(Ttbr::for_root(root.ttbr0, asid));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{MmuOp, RecordingMmu, SimFrameAlloc};
    use kernel_memory_addresses::SimRam;

    const RAM_BASE: u64 = 0x4000_0000;

    fn hat(ram: &SimRam, frames: usize) -> Aarch64Hat<&SimRam, SimFrameAlloc<'_>, RecordingMmu> {
        Aarch64Hat::new(ram, SimFrameAlloc::new(ram, frames), RecordingMmu::new()).unwrap()
    }

    #[test]
    fn user_page_descriptor() {
        let e = Aarch64Format::leaf_entry(
            PhysicalAddress::new(0x8000_1000),
            MapFlags::READ | MapFlags::WRITE | MapFlags::USER,
            1,
            false,
        );
        let bits = DescriptorBits::from_bits_retain(e);
        assert!(bits.contains(
            DescriptorBits::VALID
                | DescriptorBits::TABLE_OR_PAGE
                | DescriptorBits::AF
                | DescriptorBits::AP_EL0
                | DescriptorBits::NG
                | DescriptorBits::PXN
                | DescriptorBits::UXN
        ));
        assert!(!bits.contains(DescriptorBits::AP_RO));
        assert_eq!((e >> SH_SHIFT) & 0b11, SH_INNER);
        assert_eq!(e & ADDR_MASK, 0x8000_1000);
    }

    #[test]
    fn kernel_text_descriptor() {
        let e = Aarch64Format::leaf_entry(
            PhysicalAddress::new(0x4020_0000),
            MapFlags::READ | MapFlags::EXEC | MapFlags::GLOBAL | MapFlags::HUGE,
            2,
            true,
        );
        let bits = DescriptorBits::from_bits_retain(e);
        assert!(!bits.contains(DescriptorBits::TABLE_OR_PAGE), "level-2 leaf is a block");
        assert!(bits.contains(DescriptorBits::UXN | DescriptorBits::AP_RO));
        assert!(!bits.intersects(DescriptorBits::PXN | DescriptorBits::NG | DescriptorBits::AP_EL0));
    }

    #[test]
    fn device_memory_is_outer_shareable() {
        let e = Aarch64Format::leaf_entry(
            PhysicalAddress::new(0x0900_0000),
            (MapFlags::READ | MapFlags::WRITE).with_cache(CacheType::Device),
            1,
            true,
        );
        assert_eq!((e >> ATTR_INDX_SHIFT) & 0b111, u64::from(MAIR_IDX_DEVICE_NGNRE));
        assert_eq!((e >> SH_SHIFT) & 0b11, SH_OUTER);
        assert_eq!(
            Aarch64Format::decode(e, 1, true).cache_type(),
            CacheType::Device
        );
    }

    #[test]
    fn round_trip_both_halves() {
        let ram = SimRam::new(RAM_BASE, 32);
        let hat = hat(&ram, 32);
        let root = hat.create_root().unwrap();

        let user = VirtualAddress::new(0x0000_4000_0000_0000);
        let kernel = VirtualAddress::new(0xFFFF_8880_0010_0000);
        let uflags = MapFlags::READ | MapFlags::USER;
        let kflags = MapFlags::READ | MapFlags::WRITE | MapFlags::GLOBAL;
        hat.insert(root, user, PhysicalAddress::new(0x9000_0000), uflags).unwrap();
        hat.insert(root, kernel, PhysicalAddress::new(0x9000_1000), kflags).unwrap();

        let t = hat.resolve(root, user).unwrap();
        assert_eq!((t.phys, t.flags), (PhysicalAddress::new(0x9000_0000), uflags));
        let t = hat.resolve(root, kernel).unwrap();
        assert_eq!((t.phys, t.flags), (PhysicalAddress::new(0x9000_1000), kflags));

        // Kernel half goes to the shared tree, visible from any space.
        let other = hat.create_root().unwrap();
        assert!(hat.resolve(other, kernel).is_some());
        assert!(hat.resolve(other, user).is_none());
    }

    #[test]
    fn block_round_trip() {
        let ram = SimRam::new(RAM_BASE, 32);
        let hat = hat(&ram, 32);
        let root = hat.create_root().unwrap();
        let va = VirtualAddress::new(0x20_0000);
        hat.insert(root, va, PhysicalAddress::new(0x8020_0000), MapFlags::READ | MapFlags::HUGE)
            .unwrap();
        let t = hat.resolve(root, va + 0x1234).unwrap();
        assert!(t.is_huge());
        assert_eq!(t.phys, PhysicalAddress::new(0x8020_1234));
    }

    #[test]
    fn scrub_leaves_shared_kernel_tree() {
        let ram = SimRam::new(RAM_BASE, 32);
        let hat = hat(&ram, 32);
        let root = hat.create_root().unwrap();
        let kernel = VirtualAddress::new(0xFFFF_8880_0000_0000);
        hat.insert(root, kernel, PhysicalAddress::new(0x1000), MapFlags::READ).unwrap();
        hat.insert(root, VirtualAddress::new(0x1000), PhysicalAddress::new(0x2000), MapFlags::READ)
            .unwrap();

        let stats = hat.scrub(root);
        assert_eq!(stats.tables, 4);
        assert!(hat.resolve(hat.kernel_root(), kernel).is_some());
        assert_eq!(hat.scrub(hat.kernel_root()), ScrubStats::default());
    }

    #[test]
    fn invalidation_uses_broadcast_tlbi() {
        let ram = SimRam::new(RAM_BASE, 8);
        let hat = hat(&ram, 8);
        let root = hat.create_root().unwrap();
        let user = VirtualAddress::new(0x7000);
        let kernel = VirtualAddress::new(0xFFFF_8880_0000_3000);

        hat.invalidate(root, Invalidation::page(user, 9));
        hat.invalidate(root, Invalidation::page(kernel, 9));
        hat.invalidate(root, Invalidation::asid(9));
        hat.invalidate(root, Invalidation::everything());
        hat.load(root, 9);

        assert_eq!(
            hat.mmu().take_ops(),
            [
                MmuOp::TlbiVa(TlbiOperand::for_page(user, 9), false),
                MmuOp::TlbiVa(TlbiOperand::for_page(kernel, 9), true),
                MmuOp::TlbiAsid(TlbiOperand::for_asid(9)),
                MmuOp::TlbiAll,
                MmuOp::WriteTtbr0(Ttbr::for_root(root.ttbr0, 9)),
            ]
        );
    }

    #[test]
    fn tlbi_operand_layout() {
        let op = TlbiOperand::for_page(VirtualAddress::new(0xFFFF_8000_0000_5000), 0xAB);
        assert_eq!(op.asid(), 0xAB);
        assert_eq!(op.va_page(), 0xFF_8000_0005);
    }
}
