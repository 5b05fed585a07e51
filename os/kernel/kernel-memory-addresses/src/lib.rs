//! # Physical and Virtual Address Types
//!
//! Strongly typed wrappers for the two address spaces the memory subsystem
//! juggles: **physical** addresses (RAM frames, MMIO, page-table frames) and
//! **virtual** addresses (what the MMU translates).
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in physical memory. |
//! | [`VirtualAddress`] | A byte address in some address space. |
//! | [`PhysMapper`] | Turns a physical address into a pointer the CPU can dereference. |
//!
//! Both address types are `#[repr(transparent)]` over `u64` and derive
//! `Copy`, `Ord` and `Hash`, so they can be sorted, searched and used as keys.
//!
//! ## Page granules
//!
//! The subsystem only deals in two granules:
//!
//! - [`PAGE_SIZE`]: 4 KiB base pages
//! - [`HUGE_PAGE_SIZE`]: 2 MiB huge pages (one level above the leaf table)
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0000_7000_0020_1234);
//! assert_eq!(va.align_down(PAGE_SIZE).as_u64(), 0x0000_7000_0020_1000);
//! assert_eq!(va.page_offset(), 0x234);
//!
//! let pa = PhysicalAddress::from_frame_number(0x1234);
//! assert_eq!(pa.as_u64(), 0x0123_4000);
//! assert_eq!(pa.frame_number(), 0x1234);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

#[cfg(any(test, feature = "sim"))]
extern crate alloc;

mod phys_mapper;
mod physical_address;
#[cfg(any(test, feature = "sim"))]
mod sim;
mod virtual_address;

pub use phys_mapper::PhysMapper;
#[cfg(any(test, feature = "sim"))]
pub use sim::SimRam;
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// Base page size in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// [`PAGE_SIZE`] as a byte count for slices and pointer arithmetic.
#[allow(clippy::cast_possible_truncation)]
pub const PAGE_BYTES: usize = PAGE_SIZE as usize;

/// log2([`PAGE_SIZE`]).
pub const PAGE_SHIFT: u32 = 12;

/// Huge page size in bytes (2 MiB).
pub const HUGE_PAGE_SIZE: u64 = 512 * PAGE_SIZE;

/// Number of base frames covered by one huge page.
pub const HUGE_PAGE_FRAMES: usize = 512;

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two and `x + a - 1` must not overflow.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(1, 4096), 4096);
/// assert_eq!(align_up(4096, 4096), 4096);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

/// Whether `x` is a multiple of `a` (power of two).
#[inline(always)]
#[must_use]
pub const fn is_aligned(x: u64, a: u64) -> bool {
    x & (a - 1) == 0
}

/// Number of base pages needed to cover `bytes`.
#[inline(always)]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    align_up(bytes, PAGE_SIZE) >> PAGE_SHIFT
}
