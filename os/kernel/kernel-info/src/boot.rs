//! # Boot Memory Information

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Kind of a physical memory-map range as reported by the loader.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryKind {
    /// Free RAM, managed by the frame allocator.
    Usable = 0,
    /// Firmware or chipset reserved.
    Reserved = 1,
    /// ACPI tables; reusable once parsed.
    AcpiReclaimable = 2,
    /// ACPI non-volatile storage.
    AcpiNvs = 3,
    /// Defective RAM.
    BadMemory = 4,
    /// Loader data (page tables, boot info); reclaimable later.
    BootloaderReclaimable = 5,
    /// Kernel image and boot modules.
    KernelAndModules = 6,
    /// Linear framebuffer.
    Framebuffer = 7,
}

impl MemoryKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Usable => "usable",
            Self::Reserved => "reserved",
            Self::AcpiReclaimable => "acpi reclaimable",
            Self::AcpiNvs => "acpi nvs",
            Self::BadMemory => "bad memory",
            Self::BootloaderReclaimable => "bootloader reclaimable",
            Self::KernelAndModules => "kernel and modules",
            Self::Framebuffer => "framebuffer",
        }
    }

    /// Whether the range is backed by RAM the kernel should reach through the HHDM.
    #[must_use]
    pub const fn is_ram(self) -> bool {
        matches!(
            self,
            Self::Usable | Self::AcpiReclaimable | Self::BootloaderReclaimable | Self::KernelAndModules
        )
    }
}

/// One entry of the ordered physical memory map.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryMapEntry {
    pub base: PhysicalAddress,
    pub length: u64,
    pub kind: MemoryKind,
}

impl MemoryMapEntry {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryKind) -> Self {
        Self {
            base: PhysicalAddress::new(base),
            length,
            kind,
        }
    }

    /// Exclusive end address.
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.as_u64() + self.length)
    }
}

/// Where the loader placed the kernel image.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KernelImage {
    pub virtual_base: VirtualAddress,
    pub physical_base: PhysicalAddress,
    pub length: u64,
}

/// Physical range of the linear framebuffer.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FramebufferRegion {
    pub base: PhysicalAddress,
    pub length: u64,
}

/// Everything the memory subsystem needs from the loader.
#[derive(Debug, Copy, Clone)]
pub struct BootMemoryInfo<'a> {
    /// Memory map, ordered by base address.
    pub memory_map: &'a [MemoryMapEntry],
    pub kernel: KernelImage,
    pub framebuffer: Option<FramebufferRegion>,
}
