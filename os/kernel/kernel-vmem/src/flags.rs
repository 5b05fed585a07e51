use bitflags::bitflags;
use kernel_memory_addresses::{HUGE_PAGE_SIZE, PAGE_SIZE, PhysicalAddress};

bitflags! {
    /// Architecture-neutral mapping attributes.
    ///
    /// Permission bits, the mapping type (user/global/huge) and at most one
    /// cache-type bit; no cache bit means write-back.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// Accessible from user mode.
        const USER = 1 << 3;
        /// Survives address-space switches in the TLB.
        const GLOBAL = 1 << 4;
        /// 2 MiB leaf one level above the page table.
        const HUGE = 1 << 5;

        const WRITE_THROUGH = 1 << 8;
        const UNCACHED = 1 << 9;
        const WRITE_PROTECT = 1 << 10;
        const WRITE_COMBINING = 1 << 11;
        const DEVICE = 1 << 12;

        const CACHE_MASK = Self::WRITE_THROUGH.bits()
            | Self::UNCACHED.bits()
            | Self::WRITE_PROTECT.bits()
            | Self::WRITE_COMBINING.bits()
            | Self::DEVICE.bits();
    }
}

/// Memory type of a mapping.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum CacheType {
    #[default]
    WriteBack,
    WriteThrough,
    Uncached,
    WriteProtect,
    WriteCombining,
    /// MMIO; uncached on x86_64, device-nGnRE on aarch64.
    Device,
}

impl CacheType {
    #[must_use]
    pub const fn as_flags(self) -> MapFlags {
        match self {
            Self::WriteBack => MapFlags::empty(),
            Self::WriteThrough => MapFlags::WRITE_THROUGH,
            Self::Uncached => MapFlags::UNCACHED,
            Self::WriteProtect => MapFlags::WRITE_PROTECT,
            Self::WriteCombining => MapFlags::WRITE_COMBINING,
            Self::Device => MapFlags::DEVICE,
        }
    }
}

impl MapFlags {
    /// The requested memory type. If several cache bits are set the
    /// strongest ordering wins.
    #[must_use]
    pub const fn cache_type(self) -> CacheType {
        if self.contains(Self::DEVICE) {
            CacheType::Device
        } else if self.contains(Self::UNCACHED) {
            CacheType::Uncached
        } else if self.contains(Self::WRITE_COMBINING) {
            CacheType::WriteCombining
        } else if self.contains(Self::WRITE_PROTECT) {
            CacheType::WriteProtect
        } else if self.contains(Self::WRITE_THROUGH) {
            CacheType::WriteThrough
        } else {
            CacheType::WriteBack
        }
    }

    /// Replace the cache type.
    #[must_use]
    pub const fn with_cache(self, cache: CacheType) -> Self {
        self.difference(Self::CACHE_MASK).union(cache.as_flags())
    }

    /// Bytes covered by one leaf with these flags.
    #[must_use]
    pub const fn granule(self) -> u64 {
        if self.contains(Self::HUGE) {
            HUGE_PAGE_SIZE
        } else {
            PAGE_SIZE
        }
    }
}

/// Result of resolving a virtual address.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Translation {
    /// Physical address the queried virtual address translates to.
    pub phys: PhysicalAddress,
    /// Attributes of the leaf entry.
    pub flags: MapFlags,
    /// Bytes covered by the leaf (4 KiB or 2 MiB).
    pub size: u64,
}

impl Translation {
    /// Base of the page or huge page backing the translation.
    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.phys.align_down(self.size)
    }

    #[must_use]
    pub const fn is_huge(&self) -> bool {
        self.size == HUGE_PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_type_round_trip() {
        for cache in [
            CacheType::WriteBack,
            CacheType::WriteThrough,
            CacheType::Uncached,
            CacheType::WriteProtect,
            CacheType::WriteCombining,
            CacheType::Device,
        ] {
            let flags = (MapFlags::READ | MapFlags::WRITE_PROTECT).with_cache(cache);
            assert_eq!(flags.cache_type(), cache);
            assert!(flags.contains(MapFlags::READ));
        }
    }

    #[test]
    fn granule_follows_huge_bit() {
        assert_eq!(MapFlags::READ.granule(), 4096);
        assert_eq!((MapFlags::READ | MapFlags::HUGE).granule(), 2 * 1024 * 1024);
    }
}
