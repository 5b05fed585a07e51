//! # Memory Subsystem Configuration

use crate::memory::{ASID_COUNT, PagingMode};

/// Number of frames zero-filled onto the zero list during boot.
pub const DEFAULT_PREZERO_FRAMES: usize = 512;

/// Memory maps with fewer entries than this are always dumped at boot.
pub const SHORT_MEMORY_MAP: usize = 8;

/// Runtime configuration of the memory subsystem.
///
/// Built from CPU feature probing plus the kernel command line:
///
/// ```rust
/// # use kernel_info::config::MmConfig;
/// # use kernel_info::memory::PagingMode;
/// let cfg = MmConfig::new(PagingMode::FourLevel)
///     .with_pcid(true)
///     .with_cmdline("root=/dev/nvme0n1 verbose");
/// assert!(cfg.verbose_memmap);
/// assert!(cfg.pcid);
/// ```
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MmConfig {
    pub paging: PagingMode,
    /// `CR4.PCIDE` available and enabled.
    pub pcid: bool,
    /// `INVPCID` instruction available.
    pub invpcid: bool,
    /// Dump every memory-map entry during frame allocator init.
    pub verbose_memmap: bool,
    /// Size of the ASID pool (entry 0 belongs to the kernel).
    pub asid_count: usize,
    /// Frames zero-filled at boot.
    pub prezero_frames: usize,
}

impl Default for MmConfig {
    fn default() -> Self {
        Self::new(PagingMode::FourLevel)
    }
}

impl MmConfig {
    #[must_use]
    pub const fn new(paging: PagingMode) -> Self {
        Self {
            paging,
            pcid: false,
            invpcid: false,
            verbose_memmap: false,
            asid_count: ASID_COUNT,
            prezero_frames: DEFAULT_PREZERO_FRAMES,
        }
    }

    #[must_use]
    pub const fn with_pcid(mut self, pcid: bool) -> Self {
        self.pcid = pcid;
        self
    }

    /// `INVPCID` only makes sense with PCIDs enabled.
    #[must_use]
    pub const fn with_invpcid(mut self, invpcid: bool) -> Self {
        self.invpcid = invpcid;
        self
    }

    #[must_use]
    pub const fn with_asid_count(mut self, count: usize) -> Self {
        self.asid_count = count;
        self
    }

    #[must_use]
    pub const fn with_prezero_frames(mut self, frames: usize) -> Self {
        self.prezero_frames = frames;
        self
    }

    /// Apply recognized kernel command-line tokens.
    ///
    /// * `verbose`: dump the memory map at boot
    /// * `nopcid`: disable PCID and INVPCID
    #[must_use]
    pub fn with_cmdline(mut self, cmdline: &str) -> Self {
        for token in cmdline.split_ascii_whitespace() {
            match token {
                "verbose" => self.verbose_memmap = true,
                "nopcid" => {
                    self.pcid = false;
                    self.invpcid = false;
                }
                _ => {}
            }
        }
        self
    }

    /// Whether `INVPCID` may actually be used.
    #[must_use]
    pub const fn use_invpcid(&self) -> bool {
        self.pcid && self.invpcid
    }
}
