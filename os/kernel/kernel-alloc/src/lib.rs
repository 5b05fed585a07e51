//! # Physical Frame Allocation
//!
//! The kernel's single physical allocator: a frame database with one
//! descriptor per usable 4 KiB frame.
//!
//! ```text
//! boot memory map ──► FrameAllocator::new ──► frame table (carved from RAM)
//!                                                │
//!             alloc / free / share / lookup ◄────┤ zero list, dirty list
//!                                                │
//!             kernel_vmem::FrameAlloc ◄──────────┘ page-table frames
//! ```
//!
//! * Single frames come off the zero or dirty list in O(1).
//! * Runs of consecutive frames (2 MiB huge pages) are found by scanning
//!   the address-sorted table.
//! * Address → descriptor lookup is a binary search.
//! * Reference counts let copy-on-write pages have several owners.
//!
//! The allocator is an explicit object; the kernel keeps its instance in
//! [`global`], tests build their own over a `SimRam`.
//!
//! ## Example
//!
//! ```
//! use kernel_alloc::{FrameAllocator, FrameRequest};
//! use kernel_info::boot::{MemoryKind, MemoryMapEntry};
//! use kernel_info::config::MmConfig;
//! use kernel_memory_addresses::SimRam;
//!
//! let ram = SimRam::new(0x10_0000, 32);
//! let map = [MemoryMapEntry::new(0x10_0000, ram.len_bytes(), MemoryKind::Usable)];
//! let pfa = unsafe { FrameAllocator::new(&ram, &map, &MmConfig::default()) }.unwrap();
//!
//! let frame = pfa.alloc(FrameRequest::single().zeroed()).unwrap();
//! assert_eq!(pfa.refcount(frame), Some(1));
//! pfa.free(frame, 1);
//! assert_eq!(pfa.stats().used, 0);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod descriptor;
pub mod frame_alloc;
pub mod global;
pub mod phys_mapper;

pub use descriptor::{FrameDescriptor, FrameKind};
pub use frame_alloc::{FrameAllocError, FrameAllocator, FrameInfo, FrameRequest, FrameStats, FrameUsage};
