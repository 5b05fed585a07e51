//! # Memory Layout and Boot Handoff
//!
//! Single source of truth for the constants and boot-time inputs the memory
//! subsystem is configured with.
//!
//! ### Memory Layout ([`memory`])
//! Address-space layout per paging mode:
//! * **User half**: segments are bump-allocated downward from the mmap ceiling
//! * **Higher half**: HHDM plus the kernel image, shared by every space
//!
//! ```text
//! Virtual Address Space Layout (x86_64, 4-level):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │         User Space              │
//! USER_MMAP_CEILING     ├─────────────────────────────────┤ 0x0000_6fff_c000_0000
//!                       │   (segments grow downward)      │
//! HIGHER_HALF           ├─────────────────────────────────┤ 0xffff_8000_0000_0000
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Mapping    │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │       Kernel Text & Data        │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ### Boot Information ([`boot`])
//! The ordered physical memory map, the kernel image placement and the
//! optional framebuffer, as handed over by the loader.
//!
//! ### Runtime Configuration ([`config`])
//! [`MmConfig`](config::MmConfig): paging depth, PCID/INVPCID availability
//! and boot diagnostics, assembled from CPU feature probing and the kernel
//! command line.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod config;
pub mod memory;
