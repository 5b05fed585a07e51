use crate::{PAGE_BYTES, PAGE_SIZE, PhysMapper, PhysicalAddress};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;

#[repr(C, align(4096))]
struct SimFrame(UnsafeCell<[u8; PAGE_BYTES]>);

/// Simulated physical memory for host tests.
///
/// A contiguous block of 4 KiB frames that pretends to live at physical
/// address `base`. Physical addresses are turned into host pointers by
/// offsetting into the block, the way an HHDM offsets into the kernel half.
pub struct SimRam {
    base: PhysicalAddress,
    frames: Box<[SimFrame]>,
}

// Safety: callers coordinate access to individual frames the same way they
// would for real RAM.
unsafe impl Sync for SimRam {}
unsafe impl Send for SimRam {}

impl SimRam {
    /// `frames` zeroed frames starting at physical address `base`.
    ///
    /// # Panics
    /// If `base` is not page-aligned.
    #[must_use]
    pub fn new(base: u64, frames: usize) -> Self {
        assert_eq!(base % PAGE_SIZE, 0, "simulated RAM base must be page-aligned");
        let frames: Vec<SimFrame> = (0..frames)
            .map(|_| SimFrame(UnsafeCell::new([0; PAGE_BYTES])))
            .collect();
        Self {
            base: PhysicalAddress::new(base),
            frames: frames.into_boxed_slice(),
        }
    }

    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// Size of the block in bytes.
    #[must_use]
    pub fn len_bytes(&self) -> u64 {
        self.frames.len() as u64 * PAGE_SIZE
    }

    #[must_use]
    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        pa >= self.base && pa.as_u64() - self.base.as_u64() < self.len_bytes()
    }

    /// Copy of the frame containing `pa`.
    ///
    /// # Panics
    /// If `pa` is outside the block.
    #[must_use]
    pub fn read_frame(&self, pa: PhysicalAddress) -> [u8; PAGE_BYTES] {
        let mut out = [0; PAGE_BYTES];
        unsafe {
            core::ptr::copy_nonoverlapping(self.phys_to_ptr(pa.frame_base()), out.as_mut_ptr(), PAGE_BYTES);
        }
        out
    }

    /// Write `bytes` starting at `pa`.
    ///
    /// # Panics
    /// If the write leaves the block.
    pub fn write_bytes(&self, pa: PhysicalAddress, bytes: &[u8]) {
        assert!(self.contains(pa + bytes.len().saturating_sub(1) as u64));
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.phys_to_ptr(pa), bytes.len());
        }
    }
}

impl PhysMapper for SimRam {
    #[allow(clippy::cast_possible_truncation)]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        assert!(self.contains(pa), "{pa:?} outside simulated RAM");
        let off = pa.as_u64() - self.base.as_u64();
        let frame = &self.frames[(off / PAGE_SIZE) as usize];
        unsafe { frame.0.get().cast::<u8>().add((off % PAGE_SIZE) as usize) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_addressable_and_zeroed() {
        let ram = SimRam::new(0x10_0000, 4);
        let pa = PhysicalAddress::new(0x10_2010);
        assert_eq!(ram.read_frame(pa), [0; PAGE_BYTES]);

        ram.write_bytes(pa, &[1, 2, 3]);
        let frame = ram.read_frame(pa);
        assert_eq!(&frame[0x10..0x13], &[1, 2, 3]);

        unsafe { ram.zero_frame(pa) };
        assert_eq!(ram.read_frame(pa), [0; PAGE_BYTES]);
    }

    #[test]
    fn copy_frame_duplicates_contents() {
        let ram = SimRam::new(0x20_0000, 2);
        let a = PhysicalAddress::new(0x20_0000);
        let b = PhysicalAddress::new(0x20_1000);
        ram.write_bytes(a + 100, b"hello");
        unsafe { ram.copy_frame(b, a) };
        assert_eq!(&ram.read_frame(b)[100..105], b"hello");
    }

    #[test]
    #[should_panic(expected = "outside simulated RAM")]
    fn out_of_range_panics() {
        let ram = SimRam::new(0x10_0000, 1);
        let _ = ram.phys_to_ptr(PhysicalAddress::new(0x10_1000));
    }
}
