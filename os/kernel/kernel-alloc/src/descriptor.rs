use bitfield_struct::bitfield;

/// State of one physical frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Free, known to contain only zeros.
    ZeroFree = 0,
    /// Free, contents unknown.
    DirtyFree = 1,
    /// Never handed out (the frame database itself).
    Reserved = 2,
    /// Allocated for anonymous memory and page caches.
    Object = 3,
    /// Allocated to back the kernel heap.
    Heap = 4,
    /// Allocated for kernel structures (page tables, stacks).
    System = 5,
}

impl FrameKind {
    #[must_use]
    pub const fn is_free(self) -> bool {
        matches!(self, Self::ZeroFree | Self::DirtyFree)
    }

    #[must_use]
    pub const fn is_allocated(self) -> bool {
        matches!(self, Self::Object | Self::Heap | Self::System)
    }

    #[must_use]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_bits(value: u8) -> Self {
        match value {
            0 => Self::ZeroFree,
            1 => Self::DirtyFree,
            3 => Self::Object,
            4 => Self::Heap,
            5 => Self::System,
            _ => Self::Reserved,
        }
    }
}

/// Packed per-frame state.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct FrameDescriptor {
    /// Bits 0–3 — current state.
    #[bits(4)]
    pub kind: FrameKind,

    /// Bit 4 — being zero-filled outside the database lock.
    pub locked: bool,

    #[bits(3, access = RO)]
    pub reserved0: u8,

    /// Bits 8–23 — owners of an allocated frame.
    #[bits(16)]
    pub refcount: u16,

    /// Bits 24–27 — NUMA domain. Always 0.
    #[bits(4)]
    pub domain: u8,

    #[bits(4, access = RO)]
    pub reserved1: u8,

    /// Bits 32–63 — physical frame number.
    #[bits(32)]
    pub frame: u32,
}

/// One slot of the address-sorted frame table: the descriptor plus its
/// free-list links (table indices, [`NIL`] terminated).
#[derive(Debug, Copy, Clone)]
#[repr(C)]
pub(crate) struct FrameEntry {
    pub desc: FrameDescriptor,
    pub prev: u32,
    pub next: u32,
}

pub(crate) const NIL: u32 = u32::MAX;

const _: () = assert!(size_of::<FrameEntry>() == 16);
const _: () = assert!(4096 % size_of::<FrameEntry>() == 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_packing() {
        let d = FrameDescriptor::new()
            .with_kind(FrameKind::Heap)
            .with_refcount(2)
            .with_frame(0x12_3456);
        assert_eq!(d.into_bits(), (0x12_3456 << 32) | (2 << 8) | 4);
        assert_eq!(d.kind(), FrameKind::Heap);
        assert!(!d.locked());
    }

    #[test]
    fn kind_classes() {
        assert!(FrameKind::ZeroFree.is_free());
        assert!(FrameKind::System.is_allocated());
        assert!(!FrameKind::Reserved.is_free());
        assert!(!FrameKind::Reserved.is_allocated());
        assert_eq!(FrameKind::from_bits(FrameKind::Object.into_bits()), FrameKind::Object);
    }
}
