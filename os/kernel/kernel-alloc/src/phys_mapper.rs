//! # HHDM-based [`PhysMapper`]
//!
//! With a higher-half direct map every physical address is visible at
//! `HHDM_BASE + pa`, so turning a physical address into a pointer is one
//! addition. The kernel's page tables, the frame table and every frame the
//! allocator zeroes or copies are reached this way.
//!
//! ```
//! use kernel_alloc::phys_mapper::HhdmPhysMapper;
//! use kernel_info::memory::HHDM_BASE;
//! use kernel_memory_addresses::{PhysMapper, PhysicalAddress};
//!
//! let ptr = HhdmPhysMapper.phys_to_ptr(PhysicalAddress::new(0x1234_0000));
//! assert_eq!(ptr as u64, HHDM_BASE + 0x1234_0000);
//! ```

use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::{PhysMapper, PhysicalAddress};

/// [`PhysMapper`] for kernels with a higher-half direct map.
///
/// Dereferencing the returned pointers is only sound once the HHDM covers
/// the referenced range (the loader's tables, then the kernel space built by
/// `kernel-mm`).
#[derive(Debug, Copy, Clone, Default)]
pub struct HhdmPhysMapper;

impl PhysMapper for HhdmPhysMapper {
    #[inline]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        (HHDM_BASE + pa.as_u64()) as *mut u8
    }
}
