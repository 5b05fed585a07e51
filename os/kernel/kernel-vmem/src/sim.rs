//! Host-side doubles for the MMU backends.
//!
//! [`RecordingMmu`] implements both [`X86Mmu`] and [`Aarch64Mmu`], keeps the
//! register state a real CPU would, and logs every privileged operation so
//! tests can assert the exact invalidation sequence.

use crate::FrameAlloc;
use crate::aarch64::{Aarch64Mmu, TlbiOperand};
use crate::x86_64::{InvpcidType, X86Mmu};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_memory_addresses::{PhysMapper, PhysicalAddress, SimRam, VirtualAddress};
use kernel_registers::aarch64::Ttbr;
use kernel_registers::cr3::Cr3;
use kernel_registers::cr4::Cr4;
use kernel_sync::SpinLock;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MmuOp {
    Invlpg(VirtualAddress),
    Invpcid(InvpcidType, u16, VirtualAddress),
    WriteCr3(Cr3),
    WriteCr4(Cr4),
    TlbiVa(TlbiOperand, bool),
    TlbiAsid(TlbiOperand),
    TlbiAll,
    WriteTtbr0(Ttbr),
}

#[derive(Debug, Default)]
pub struct RecordingMmu {
    ops: SpinLock<Vec<MmuOp>>,
    cr3: AtomicU64,
    cr4: AtomicU64,
}

impl RecordingMmu {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, op: MmuOp) {
        self.ops.lock().push(op);
    }

    /// Everything recorded so far; clears the log.
    pub fn take_ops(&self) -> Vec<MmuOp> {
        core::mem::take(&mut *self.ops.lock())
    }
}

impl X86Mmu for RecordingMmu {
    fn invlpg(&self, virt: VirtualAddress) {
        self.record(MmuOp::Invlpg(virt));
    }

    fn invpcid(&self, kind: InvpcidType, pcid: u16, virt: VirtualAddress) {
        self.record(MmuOp::Invpcid(kind, pcid, virt));
    }

    fn read_cr3(&self) -> Cr3 {
        Cr3::from_bits(self.cr3.load(Ordering::Acquire))
    }

    fn write_cr3(&self, cr3: Cr3) {
        self.record(MmuOp::WriteCr3(cr3));
        // Bit 63 always reads back as zero.
        self.cr3
            .store(cr3.with_no_flush(false).into_bits(), Ordering::Release);
    }

    fn read_cr4(&self) -> Cr4 {
        Cr4::from_bits(self.cr4.load(Ordering::Acquire))
    }

    fn write_cr4(&self, cr4: Cr4) {
        self.record(MmuOp::WriteCr4(cr4));
        self.cr4.store(cr4.into_bits(), Ordering::Release);
    }
}

impl Aarch64Mmu for RecordingMmu {
    fn tlbi_va(&self, operand: TlbiOperand, all_asids: bool) {
        self.record(MmuOp::TlbiVa(operand, all_asids));
    }

    fn tlbi_asid(&self, operand: TlbiOperand) {
        self.record(MmuOp::TlbiAsid(operand));
    }

    fn tlbi_all(&self) {
        self.record(MmuOp::TlbiAll);
    }

    fn write_ttbr0(&self, ttbr: Ttbr) {
        self.record(MmuOp::WriteTtbr0(ttbr));
    }
}

/// Table-frame source over the first `frames` frames of a [`SimRam`].
///
/// Does not track data frames: [`FrameAlloc::release_leaf`] always reports
/// foreign memory.
pub struct SimFrameAlloc<'a> {
    ram: &'a SimRam,
    free: SpinLock<Vec<PhysicalAddress>>,
    total: usize,
}

impl<'a> SimFrameAlloc<'a> {
    #[must_use]
    pub fn new(ram: &'a SimRam, frames: usize) -> Self {
        let base = ram.base();
        // Popped from the back: lowest address first.
        let free: Vec<_> = (0..frames as u64)
            .rev()
            .map(|i| base + i * kernel_memory_addresses::PAGE_SIZE)
            .filter(|&pa| ram.contains(pa))
            .collect();
        let total = free.len();
        Self {
            ram,
            free: SpinLock::new(free),
            total,
        }
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    pub fn outstanding(&self) -> usize {
        self.total - self.available()
    }
}

impl FrameAlloc for SimFrameAlloc<'_> {
    fn alloc_table(&self) -> Option<PhysicalAddress> {
        let frame = self.free.lock().pop()?;
        unsafe { self.ram.zero_frame(frame) };
        Some(frame)
    }

    fn free_table(&self, table: PhysicalAddress) {
        self.free.lock().push(table);
    }

    fn release_leaf(&self, _base: PhysicalAddress, _frames: usize) -> bool {
        false
    }
}
