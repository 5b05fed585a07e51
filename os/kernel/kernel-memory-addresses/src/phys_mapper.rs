use crate::{PAGE_BYTES, PhysicalAddress};

/// Converts physical addresses into pointers usable from the current
/// virtual address space (a higher-half direct map in the kernel, a
/// simulated RAM block in tests).
///
/// Implementations must return pointers for which every byte of the
/// containing 4 KiB frame is addressable.
pub trait PhysMapper {
    /// Pointer to the byte at `pa`.
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8;

    /// View the frame at `pa` as a `T`.
    ///
    /// # Safety
    /// - `pa` must be mapped writable and suitably aligned for `T`.
    /// - The bytes at `pa` must be a valid `T` and not aliased for `'a`.
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *self.phys_to_ptr(pa).cast::<T>() }
    }

    /// Fill the 4 KiB frame at `pa` with zeros.
    ///
    /// # Safety
    /// The frame must be owned by the caller.
    #[inline]
    unsafe fn zero_frame(&self, pa: PhysicalAddress) {
        unsafe {
            core::ptr::write_bytes(self.phys_to_ptr(pa.frame_base()), 0, PAGE_BYTES);
        }
    }

    /// Copy one 4 KiB frame onto another.
    ///
    /// # Safety
    /// `dst` must be owned by the caller and distinct from `src`.
    #[inline]
    unsafe fn copy_frame(&self, dst: PhysicalAddress, src: PhysicalAddress) {
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.phys_to_ptr(src.frame_base()),
                self.phys_to_ptr(dst.frame_base()),
                PAGE_BYTES,
            );
        }
    }
}

impl<M: PhysMapper + ?Sized> PhysMapper for &M {
    #[inline]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        (**self).phys_to_ptr(pa)
    }
}
