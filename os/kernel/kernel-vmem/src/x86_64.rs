//! # x86_64 backend
//!
//! 4- or 5-level tables rooted in `CR3`. Leaf entries select one of the
//! eight PAT slots programmed by
//! [`PAT_VALUE`](kernel_registers::pat::PAT_VALUE):
//!
//! | Cache type | PAT | PCD | PWT | slot |
//! |------------|-----|-----|-----|------|
//! | write-back | 0 | 0 | 0 | 0 |
//! | write-through | 0 | 0 | 1 | 1 |
//! | uncached / device | 0 | 1 | 1 | 3 |
//! | write-protect | 1 | 1 | 0 | 6 |
//! | write-combining | 1 | 1 | 1 | 7 |
//!
//! The PAT selector is bit 7 in a 4 KiB PTE and bit 12 in a 2 MiB PDE
//! (where bit 7 is `PS`).

use crate::invalidate::{self, Invalidation, InvalidationMode};
use crate::table::{EntryFormat, PageTable};
use crate::walk::{ScrubStats, Walker};
use crate::{CacheType, FrameAlloc, Hat, HatError, MapFlags, Translation};
use bitflags::bitflags;
use core::fmt;
use kernel_info::config::MmConfig;
use kernel_info::memory::{KERNEL_HALF_FIRST_SLOT, PagingMode};
use kernel_memory_addresses::{PhysMapper, PhysicalAddress, VirtualAddress};
use kernel_registers::cr3::Cr3;
use kernel_registers::cr4::Cr4;

bitflags! {
    /// Hardware bits of an x86_64 table entry.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct X86EntryBits: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const PWT = 1 << 3;
        const PCD = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        /// `PS` in a PDE/PDPTE, `PAT` in a PTE.
        const PS_OR_PAT = 1 << 7;
        const GLOBAL = 1 << 8;
        /// `PAT` in a 2 MiB / 1 GiB leaf.
        const PAT_HUGE = 1 << 12;
        const NX = 1 << 63;
    }
}

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Huge leaves carry `PAT` in bit 12, so their address starts at the page-size boundary.
const fn leaf_addr_mask(level: usize) -> u64 {
    if level == 1 {
        ADDR_MASK
    } else {
        ADDR_MASK & !((1 << crate::table::level_shift(level)) - 1)
    }
}

/// `(PAT, PCD, PWT)` for a cache type.
const fn pat_select(cache: CacheType) -> (bool, bool, bool) {
    match cache {
        CacheType::WriteBack => (false, false, false),
        CacheType::WriteThrough => (false, false, true),
        CacheType::Uncached | CacheType::Device => (false, true, true),
        CacheType::WriteProtect => (true, true, false),
        CacheType::WriteCombining => (true, true, true),
    }
}

const fn pat_slot_type(slot: u64) -> CacheType {
    match slot {
        1 | 5 => CacheType::WriteThrough,
        2 | 3 => CacheType::Uncached,
        6 => CacheType::WriteProtect,
        7 => CacheType::WriteCombining,
        _ => CacheType::WriteBack,
    }
}

pub(crate) struct X86Format;

impl EntryFormat for X86Format {
    #[inline(always)]
    fn is_present(entry: u64) -> bool {
        entry & X86EntryBits::PRESENT.bits() != 0
    }

    #[inline(always)]
    fn is_leaf(entry: u64, level: usize) -> bool {
        level == 1 || entry & X86EntryBits::PS_OR_PAT.bits() != 0
    }

    #[inline(always)]
    fn address(entry: u64, level: usize) -> PhysicalAddress {
        if Self::is_leaf(entry, level) {
            PhysicalAddress::new(entry & leaf_addr_mask(level))
        } else {
            PhysicalAddress::new(entry & ADDR_MASK)
        }
    }

    fn table_entry(table: PhysicalAddress, user: bool) -> u64 {
        let mut bits = X86EntryBits::PRESENT | X86EntryBits::WRITABLE;
        bits.set(X86EntryBits::USER, user);
        (table.as_u64() & ADDR_MASK) | bits.bits()
    }

    fn leaf_entry(phys: PhysicalAddress, flags: MapFlags, level: usize, _upper_half: bool) -> u64 {
        if !flags.contains(MapFlags::READ) {
            log::warn!("hat: x86_64 cannot map {phys} non-readable; mapping readable");
        }

        let mut bits = X86EntryBits::PRESENT;
        bits.set(X86EntryBits::WRITABLE, flags.contains(MapFlags::WRITE));
        bits.set(X86EntryBits::USER, flags.contains(MapFlags::USER));
        bits.set(X86EntryBits::GLOBAL, flags.contains(MapFlags::GLOBAL));
        bits.set(X86EntryBits::NX, !flags.contains(MapFlags::EXEC));

        let (pat, pcd, pwt) = pat_select(flags.cache_type());
        bits.set(X86EntryBits::PWT, pwt);
        bits.set(X86EntryBits::PCD, pcd);
        if level == 1 {
            bits.set(X86EntryBits::PS_OR_PAT, pat);
        } else {
            bits.insert(X86EntryBits::PS_OR_PAT);
            bits.set(X86EntryBits::PAT_HUGE, pat);
        }

        (phys.as_u64() & leaf_addr_mask(level)) | bits.bits()
    }

    fn decode(entry: u64, level: usize, _upper_half: bool) -> MapFlags {
        let bits = X86EntryBits::from_bits_retain(entry);
        let mut flags = MapFlags::READ;
        flags.set(MapFlags::WRITE, bits.contains(X86EntryBits::WRITABLE));
        flags.set(MapFlags::USER, bits.contains(X86EntryBits::USER));
        flags.set(MapFlags::GLOBAL, bits.contains(X86EntryBits::GLOBAL));
        flags.set(MapFlags::EXEC, !bits.contains(X86EntryBits::NX));
        flags.set(MapFlags::HUGE, level == 2);

        let pat = if level == 1 {
            bits.contains(X86EntryBits::PS_OR_PAT)
        } else {
            bits.contains(X86EntryBits::PAT_HUGE)
        };
        let slot = (u64::from(pat) << 2)
            | (u64::from(bits.contains(X86EntryBits::PCD)) << 1)
            | u64::from(bits.contains(X86EntryBits::PWT));
        flags.with_cache(pat_slot_type(slot))
    }
}

/// `INVPCID` descriptor types.
#[repr(u64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InvpcidType {
    IndividualAddress = 0,
    SingleContext = 1,
    AllContextsIncludingGlobal = 2,
    AllContextsExceptGlobal = 3,
}

impl From<InvalidationMode> for InvpcidType {
    fn from(mode: InvalidationMode) -> Self {
        match mode {
            InvalidationMode::SingleAddr => Self::IndividualAddress,
            InvalidationMode::SingleAsid => Self::SingleContext,
            InvalidationMode::AllAsids => Self::AllContextsExceptGlobal,
            InvalidationMode::EntireTlb => Self::AllContextsIncludingGlobal,
        }
    }
}

/// Privileged instructions the backend needs, per CPU.
pub trait X86Mmu: Send + Sync {
    fn invlpg(&self, virt: VirtualAddress);
    fn invpcid(&self, kind: InvpcidType, pcid: u16, virt: VirtualAddress);
    fn read_cr3(&self) -> Cr3;
    fn write_cr3(&self, cr3: Cr3);
    fn read_cr4(&self) -> Cr4;
    fn write_cr4(&self, cr4: Cr4);
}

/// The real thing, for ring 0 on x86_64.
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
pub struct NativeX86Mmu {
    _private: (),
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl NativeX86Mmu {
    /// # Safety
    /// Only usable at CPL 0.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl X86Mmu for NativeX86Mmu {
    fn invlpg(&self, virt: VirtualAddress) {
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) virt.as_u64(), options(nostack, preserves_flags));
        }
    }

    fn invpcid(&self, kind: InvpcidType, pcid: u16, virt: VirtualAddress) {
        let descriptor: [u64; 2] = [u64::from(pcid), virt.as_u64()];
        unsafe {
            core::arch::asm!(
                "invpcid {}, [{}]",
                in(reg) kind as u64,
                in(reg) descriptor.as_ptr(),
                options(nostack, preserves_flags)
            );
        }
    }

    fn read_cr3(&self) -> Cr3 {
        use kernel_registers::LoadRegisterUnsafe;
        unsafe { Cr3::load_unsafe() }
    }

    fn write_cr3(&self, cr3: Cr3) {
        use kernel_registers::StoreRegisterUnsafe;
        unsafe { cr3.store_unsafe() }
    }

    fn read_cr4(&self) -> Cr4 {
        use kernel_registers::LoadRegisterUnsafe;
        unsafe { Cr4::load_unsafe() }
    }

    fn write_cr4(&self, cr4: Cr4) {
        use kernel_registers::StoreRegisterUnsafe;
        unsafe { cr4.store_unsafe() }
    }
}

/// Physical address of a PML4/PML5 root.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct X86Root(pub PhysicalAddress);

impl fmt::Debug for X86Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X86Root({})", self.0)
    }
}

/// x86_64 [`Hat`].
pub struct X86Hat<M, A, U> {
    mapper: M,
    alloc: A,
    mmu: U,
    paging: PagingMode,
    pcid: bool,
    invpcid: bool,
    kernel_root: X86Root,
}

impl<M, A, U> X86Hat<M, A, U>
where
    M: PhysMapper + Send + Sync,
    A: FrameAlloc + Send + Sync,
    U: X86Mmu,
{
    /// Backend with a fresh, empty kernel root.
    ///
    /// # Errors
    /// [`HatError::OutOfMemory`] if the root cannot be allocated.
    pub fn new(mapper: M, alloc: A, mmu: U, config: &MmConfig) -> Result<Self, HatError> {
        let root = alloc.alloc_table().ok_or(HatError::OutOfMemory { needed: 1 })?;
        Ok(Self::with_kernel_root(mapper, alloc, mmu, config, X86Root(root)))
    }

    /// Backend adopting an existing kernel root (e.g. the loader's `CR3`).
    pub fn with_kernel_root(mapper: M, alloc: A, mmu: U, config: &MmConfig, kernel_root: X86Root) -> Self {
        log::info!(
            "hat: x86_64 {}-level paging, pcid={}, invpcid={}, kernel root {}",
            config.paging.levels(),
            config.pcid,
            config.use_invpcid(),
            kernel_root.0
        );
        Self {
            mapper,
            alloc,
            mmu,
            paging: config.paging,
            pcid: config.pcid,
            invpcid: config.use_invpcid(),
            kernel_root,
        }
    }

    pub const fn mmu(&self) -> &U {
        &self.mmu
    }

    fn walker(&self) -> Walker<'_, X86Format, M, A> {
        Walker::new(&self.mapper, &self.alloc, self.paging.levels())
    }

    /// Toggle `CR4.PGE` twice; drops every entry, global ones included.
    fn flush_everything(&self) {
        let cr4 = self.mmu.read_cr4();
        self.mmu.write_cr4(cr4.with_pge(!cr4.pge()));
        self.mmu.write_cr4(cr4);
    }

    /// Drop every entry tagged with `pcid` without `INVPCID`.
    ///
    /// Loading a CR3 value with bit 63 clear flushes the new PCID; switching
    /// back with bit 63 set keeps the current context's entries.
    fn flush_pcid(&self, root: X86Root, pcid: u16) {
        let current = self.mmu.read_cr3();
        if current.pcid() == pcid & 0xFFF {
            self.mmu.write_cr3(current.with_no_flush(false));
            return;
        }
        self.mmu.write_cr3(Cr3::for_root(root.0, pcid, false));
        self.mmu.write_cr3(current.with_no_flush(true));
    }

    fn invalidate_locked(&self, root: X86Root, request: Invalidation) {
        use InvalidationMode::{AllAsids, EntireTlb, SingleAddr, SingleAsid};

        if self.invpcid {
            self.mmu.invpcid(request.mode.into(), request.asid, request.virt);
            return;
        }

        if self.pcid {
            match request.mode {
                // INVLPG only reaches the current PCID (and global entries).
                SingleAddr
                    if request.virt.is_upper_half()
                        || self.mmu.read_cr3().pcid() == request.asid & 0xFFF =>
                {
                    self.mmu.invlpg(request.virt);
                }
                SingleAddr | SingleAsid => self.flush_pcid(root, request.asid),
                AllAsids | EntireTlb => self.flush_everything(),
            }
            return;
        }

        match request.mode {
            SingleAddr => self.mmu.invlpg(request.virt),
            SingleAsid | AllAsids | EntireTlb => self.flush_everything(),
        }
    }
}

impl<M, A, U> Hat for X86Hat<M, A, U>
where
    M: PhysMapper + Send + Sync,
    A: FrameAlloc + Send + Sync,
    U: X86Mmu,
{
    type Root = X86Root;

    const BROADCASTS_INVALIDATION: bool = false;

    fn kernel_root(&self) -> X86Root {
        self.kernel_root
    }

    fn create_root(&self) -> Result<X86Root, HatError> {
        let root = self.alloc.alloc_table().ok_or(HatError::OutOfMemory { needed: 1 })?;
        self.walker()
            .copy_slots(self.kernel_root.0, root, KERNEL_HALF_FIRST_SLOT..PageTable::ENTRIES);
        Ok(X86Root(root))
    }

    fn insert(
        &self,
        root: X86Root,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: MapFlags,
    ) -> Result<(), HatError> {
        self.walker().insert(root.0, virt, phys, flags)
    }

    fn remove(&self, root: X86Root, virt: VirtualAddress) -> Option<Translation> {
        self.walker().remove(root.0, virt)
    }

    fn resolve(&self, root: X86Root, virt: VirtualAddress) -> Option<Translation> {
        self.walker().resolve(root.0, virt)
    }

    fn invalidate(&self, root: X86Root, request: Invalidation) {
        invalidate::serialized(|| self.invalidate_locked(root, request));
    }

    fn scrub(&self, root: X86Root) -> ScrubStats {
        if root == self.kernel_root {
            log::warn!("hat: refusing to scrub the kernel root");
            return ScrubStats::default();
        }
        let stats = self.walker().scrub(root.0, 0..KERNEL_HALF_FIRST_SLOT);
        log::debug!(
            "hat: scrubbed {:?}: {} tables, {} leaves",
            root,
            stats.tables,
            stats.released_leaves
        );
        stats
    }

    fn load(&self, root: X86Root, asid: u16) {
        let cr3 = if self.pcid {
            Cr3::for_root(root.0, asid, true)
        } else {
            Cr3::for_root(root.0, 0, false)
        };
        self.mmu.write_cr3(cr3);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{MmuOp, RecordingMmu, SimFrameAlloc};
    use kernel_memory_addresses::{HUGE_PAGE_SIZE, SimRam};

    const RAM_BASE: u64 = 0x10_0000;

    fn hat<'a>(ram: &'a SimRam, frames: usize, config: &MmConfig) -> X86Hat<&'a SimRam, SimFrameAlloc<'a>, RecordingMmu> {
        let alloc = SimFrameAlloc::new(ram, frames);
        X86Hat::new(ram, alloc, RecordingMmu::new(), config).unwrap()
    }

    fn rw_user() -> MapFlags {
        MapFlags::READ | MapFlags::WRITE | MapFlags::USER
    }

    #[test]
    fn insert_resolve_round_trip() {
        let ram = SimRam::new(RAM_BASE, 64);
        let hat = hat(&ram, 64, &MmConfig::default());
        let root = hat.create_root().unwrap();

        let va = VirtualAddress::new(0x0000_7000_0000_1000);
        let pa = PhysicalAddress::new(0xDEAD_B000);
        let flags = rw_user().with_cache(CacheType::WriteCombining);
        hat.insert(root, va, pa, flags).unwrap();

        let t = hat.resolve(root, va + 0x123).unwrap();
        assert_eq!(t.phys, pa + 0x123);
        assert_eq!(t.flags, flags);
        assert_eq!(t.size, 4096);

        assert_eq!(hat.remove(root, va).map(|t| t.base()), Some(pa));
        assert!(hat.resolve(root, va).is_none());
    }

    #[test]
    fn leaf_bits_match_hardware_layout() {
        let pa = PhysicalAddress::new(0x20_0000);
        let wb = X86Format::leaf_entry(pa, MapFlags::READ | MapFlags::WRITE | MapFlags::GLOBAL, 1, true);
        assert_eq!(wb, 0x20_0000 | 0b1_0000_0011 | (1 << 63));

        let wc_huge = X86Format::leaf_entry(
            pa,
            (MapFlags::READ | MapFlags::EXEC | MapFlags::HUGE).with_cache(CacheType::WriteCombining),
            2,
            true,
        );
        // P | PWT | PCD | PS | PAT(12), executable
        assert_eq!(wc_huge, 0x20_0000 | 1 | (1 << 3) | (1 << 4) | (1 << 7) | (1 << 12));

        let wp = X86Format::leaf_entry(pa, MapFlags::READ.with_cache(CacheType::WriteProtect), 1, false);
        assert_eq!(wp & 0b1001_1000, (1 << 7) | (1 << 4));
    }

    #[test]
    fn user_half_tables_are_user_accessible() {
        let ram = SimRam::new(RAM_BASE, 64);
        let hat = hat(&ram, 64, &MmConfig::default());
        let root = hat.create_root().unwrap();
        hat.insert(root, VirtualAddress::new(0x40_0000), PhysicalAddress::new(0x1000), MapFlags::READ)
            .unwrap();

        let pml4 = unsafe { crate::table::table_at(&ram, root.0) };
        let e = pml4.get(0);
        assert_eq!(e & 0b111, 0b111, "P|W|U expected on user-half table entries");
    }

    #[test]
    fn huge_mapping_uses_one_pd_entry() {
        let ram = SimRam::new(RAM_BASE, 64);
        let hat = hat(&ram, 64, &MmConfig::default());
        let root = hat.create_root().unwrap();

        let va = VirtualAddress::new(0x4000_0000);
        let pa = PhysicalAddress::new(0x8000_0000);
        hat.insert(root, va, pa, MapFlags::READ | MapFlags::HUGE).unwrap();

        let t = hat.resolve(root, va + 0x1_2345).unwrap();
        assert!(t.is_huge());
        assert_eq!(t.phys, pa + 0x1_2345);
        assert_eq!(t.size, HUGE_PAGE_SIZE);
        assert!(t.flags.contains(MapFlags::HUGE));
    }

    #[test]
    fn five_level_walk() {
        let ram = SimRam::new(RAM_BASE, 64);
        let cfg = MmConfig::new(PagingMode::FiveLevel);
        let hat = hat(&ram, 64, &cfg);
        let root = hat.create_root().unwrap();

        let va = VirtualAddress::new(0x00F0_0000_0000_0000);
        hat.insert(root, va, PhysicalAddress::new(0x5000), MapFlags::READ).unwrap();
        assert_eq!(hat.resolve(root, va).unwrap().phys, PhysicalAddress::new(0x5000));
        // PML5, PML4, PDPT, PD, PT
        assert_eq!(hat.alloc.outstanding(), 1 + 1 + 4);
    }

    #[test]
    fn oom_mid_walk_leaves_tree_untouched() {
        let ram = SimRam::new(RAM_BASE, 64);
        // Two frames left after both roots; a 4 KiB insertion needs three.
        let hat = hat(&ram, 4, &MmConfig::default());
        let root = hat.create_root().unwrap();
        let before = hat.alloc.available();

        let err = hat
            .insert(root, VirtualAddress::new(0x1000), PhysicalAddress::new(0x2000), MapFlags::READ)
            .unwrap_err();
        assert_eq!(err, HatError::OutOfMemory { needed: 3 });
        assert_eq!(hat.alloc.available(), before, "reserved frames must be returned");

        let pml4 = unsafe { crate::table::table_at(&ram, root.0) };
        assert_eq!(pml4.populated(), 0);
    }

    #[test]
    fn create_root_shares_kernel_half() {
        let ram = SimRam::new(RAM_BASE, 64);
        let hat = hat(&ram, 64, &MmConfig::default());
        let kva = VirtualAddress::new(0xFFFF_8880_0000_0000);
        hat.insert(hat.kernel_root(), kva, PhysicalAddress::new(0x3000), MapFlags::READ | MapFlags::GLOBAL)
            .unwrap();

        let a = hat.create_root().unwrap();
        let b = hat.create_root().unwrap();
        assert_eq!(hat.resolve(a, kva).unwrap().phys, PhysicalAddress::new(0x3000));
        assert_eq!(hat.resolve(b, kva).unwrap().phys, PhysicalAddress::new(0x3000));
    }

    #[test]
    fn scrub_frees_user_tables_only() {
        let ram = SimRam::new(RAM_BASE, 64);
        let hat = hat(&ram, 64, &MmConfig::default());
        hat.insert(
            hat.kernel_root(),
            VirtualAddress::new(0xFFFF_FFFF_8000_0000),
            PhysicalAddress::new(0x3000),
            MapFlags::READ,
        )
        .unwrap();
        let kernel_tables = hat.alloc.outstanding();

        let root = hat.create_root().unwrap();
        for i in 0..4 {
            hat.insert(
                root,
                VirtualAddress::new(0x1000 * i + (i << 39)),
                PhysicalAddress::new(0x9000_0000),
                rw_user(),
            )
            .unwrap();
        }

        let stats = hat.scrub(root);
        // root + 4 * (PDPT, PD, PT)
        assert_eq!(stats.tables, 13);
        assert_eq!(hat.alloc.outstanding(), kernel_tables);
        assert!(
            hat.resolve(hat.kernel_root(), VirtualAddress::new(0xFFFF_FFFF_8000_0000))
                .is_some()
        );
    }

    #[test]
    fn huge_page_over_a_table_frees_it() {
        let ram = SimRam::new(RAM_BASE, 64);
        let hat = hat(&ram, 64, &MmConfig::default());
        let root = hat.create_root().unwrap();
        let va = VirtualAddress::new(0x4000_0000);

        hat.insert(root, va + 0x3000, PhysicalAddress::new(0x9000_0000), rw_user())
            .unwrap();
        let with_table = hat.alloc.outstanding();

        hat.insert(root, va, PhysicalAddress::new(0x8000_0000), rw_user() | MapFlags::HUGE)
            .unwrap();
        assert_eq!(hat.alloc.outstanding(), with_table - 1);
        let t = hat.resolve(root, va + 0x3000).unwrap();
        assert!(t.is_huge());
        assert_eq!(t.phys, PhysicalAddress::new(0x8000_3000));

        // root, PDPT, PD
        assert_eq!(hat.scrub(root).tables, 3);
    }

    #[test]
    fn load_tags_cr3_with_pcid() {
        let ram = SimRam::new(RAM_BASE, 8);
        let hat = hat(&ram, 8, &MmConfig::default().with_pcid(true));
        let root = hat.create_root().unwrap();
        hat.load(root, 7);
        assert_eq!(hat.mmu().take_ops(), [MmuOp::WriteCr3(Cr3::for_root(root.0, 7, true))]);
        let cr3 = hat.mmu().read_cr3();
        assert_eq!(cr3.pcid(), 7);
        assert_eq!(cr3.root_phys(), root.0);
    }

    #[test]
    fn invpcid_types() {
        let ram = SimRam::new(RAM_BASE, 8);
        let cfg = MmConfig::default().with_pcid(true).with_invpcid(true);
        let hat = hat(&ram, 8, &cfg);
        let root = hat.create_root().unwrap();
        let va = VirtualAddress::new(0x1000);

        hat.invalidate(root, Invalidation::page(va, 3));
        hat.invalidate(root, Invalidation::asid(3));
        hat.invalidate(root, Invalidation::all_asids());
        hat.invalidate(root, Invalidation::everything());

        assert_eq!(
            hat.mmu().take_ops(),
            [
                MmuOp::Invpcid(InvpcidType::IndividualAddress, 3, va),
                MmuOp::Invpcid(InvpcidType::SingleContext, 3, VirtualAddress::new(0)),
                MmuOp::Invpcid(InvpcidType::AllContextsExceptGlobal, 0, VirtualAddress::new(0)),
                MmuOp::Invpcid(InvpcidType::AllContextsIncludingGlobal, 0, VirtualAddress::new(0)),
            ]
        );
    }

    #[test]
    fn pcid_without_invpcid_uses_cr3_trick() {
        let ram = SimRam::new(RAM_BASE, 8);
        let hat = hat(&ram, 8, &MmConfig::default().with_pcid(true));
        let current = hat.create_root().unwrap();
        let other = hat.create_root().unwrap();
        hat.load(current, 1);
        let _ = hat.mmu().take_ops();

        hat.invalidate(other, Invalidation::asid(2));
        let ops = hat.mmu().take_ops();
        assert_eq!(
            ops,
            [
                MmuOp::WriteCr3(Cr3::for_root(other.0, 2, false)),
                MmuOp::WriteCr3(Cr3::for_root(current.0, 1, true)),
            ]
        );

        // A page of the current context goes through INVLPG.
        hat.invalidate(current, Invalidation::page(VirtualAddress::new(0x7000), 1));
        assert_eq!(hat.mmu().take_ops(), [MmuOp::Invlpg(VirtualAddress::new(0x7000))]);
    }

    #[test]
    fn no_pcid_falls_back_to_pge_toggle() {
        let ram = SimRam::new(RAM_BASE, 8);
        let hat = hat(&ram, 8, &MmConfig::default());
        hat.mmu().write_cr4(Cr4::new().with_pge(true));
        let _ = hat.mmu().take_ops();
        let root = hat.create_root().unwrap();

        hat.invalidate(root, Invalidation::asid(5));
        assert_eq!(
            hat.mmu().take_ops(),
            [
                MmuOp::WriteCr4(Cr4::new().with_pge(false)),
                MmuOp::WriteCr4(Cr4::new().with_pge(true)),
            ]
        );
    }

    #[test]
    fn cache_selection_matches_programmed_pat() {
        use kernel_registers::pat::{PAT_SLOTS, PatMemoryType};

        for (cache, expected) in [
            (CacheType::WriteBack, PatMemoryType::WriteBack),
            (CacheType::WriteThrough, PatMemoryType::WriteThrough),
            (CacheType::Uncached, PatMemoryType::Uncacheable),
            (CacheType::Device, PatMemoryType::Uncacheable),
            (CacheType::WriteProtect, PatMemoryType::WriteProtected),
            (CacheType::WriteCombining, PatMemoryType::WriteCombining),
        ] {
            let (pat, pcd, pwt) = pat_select(cache);
            let slot = (usize::from(pat) << 2) | (usize::from(pcd) << 1) | usize::from(pwt);
            assert_eq!(PAT_SLOTS[slot], expected, "{cache:?}");
        }
    }
}
