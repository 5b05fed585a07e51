//! The kernel's frame allocator instance.

use crate::frame_alloc::{FrameAllocError, FrameAllocator};
use crate::phys_mapper::HhdmPhysMapper;
use kernel_info::boot::MemoryMapEntry;
use kernel_info::config::MmConfig;
use kernel_sync::SyncOnceCell;

static FRAME_ALLOCATOR: SyncOnceCell<FrameAllocator<HhdmPhysMapper>> = SyncOnceCell::new();

/// Build the global allocator from the boot memory map, once.
///
/// Later calls return the existing instance and ignore their arguments. A
/// failed initialization leaves the slot empty.
///
/// # Safety
/// As for [`FrameAllocator::new`]: the `Usable` ranges must be unused RAM
/// covered by the higher-half direct map.
///
/// # Errors
/// Whatever [`FrameAllocator::new`] reports.
pub unsafe fn init_global(
    memory_map: &[MemoryMapEntry],
    config: &MmConfig,
) -> Result<&'static FrameAllocator<HhdmPhysMapper>, FrameAllocError> {
    FRAME_ALLOCATOR.get_or_try_init(|| unsafe { FrameAllocator::new(HhdmPhysMapper, memory_map, config) })
}

/// The global allocator, once [`init_global`] succeeded.
#[must_use]
pub fn frame_allocator() -> Option<&'static FrameAllocator<HhdmPhysMapper>> {
    FRAME_ALLOCATOR.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_init_leaves_slot_empty() {
        // Nothing above 1 MiB: fails before touching memory.
        let map = [MemoryMapEntry::new(
            0x1000,
            0x9_F000,
            kernel_info::boot::MemoryKind::Usable,
        )];
        let err = unsafe { init_global(&map, &MmConfig::default()) }.err();
        assert_eq!(err, Some(FrameAllocError::NoUsableMemory));
        assert!(frame_allocator().is_none());
    }
}
