//! Host-side fixtures for unit tests.

use crate::space::AddressSpace;
use crate::{FaultError, FaultFlags, Platform, Vm};
use kernel_alloc::{FrameAllocator, FrameRequest};
use kernel_info::boot::{MemoryKind, MemoryMapEntry};
use kernel_info::config::MmConfig;
use kernel_memory_addresses::{PhysicalAddress, SimRam, VirtualAddress};
use kernel_vmem::sim::RecordingMmu;
use kernel_vmem::x86_64::{X86Hat, X86Root};
use std::cell::Cell;
use std::sync::Mutex;

pub const BASE: u64 = 0x10_0000;

pub type TestPfa = FrameAllocator<&'static SimRam>;
pub type TestHat = X86Hat<&'static SimRam, &'static TestPfa, RecordingMmu>;

thread_local! {
    static CPU: Cell<usize> = const { Cell::new(0) };
}

/// Make the calling thread act as `cpu`.
pub fn set_cpu(cpu: usize) {
    CPU.with(|c| c.set(cpu));
}

#[derive(Default)]
pub struct TestPlatform {
    pub ipis: Mutex<Vec<usize>>,
}

impl Platform for TestPlatform {
    fn current_cpu(&self) -> usize {
        CPU.with(Cell::get)
    }

    fn send_invalidate_ipi(&self, cpu: usize) {
        self.ipis.lock().unwrap().push(cpu);
    }

    fn broadcast_halt(&self) {}

    fn halt_forever(&self) -> ! {
        panic!("halted");
    }
}

pub struct Harness {
    pub ram: &'static SimRam,
    pub pfa: &'static TestPfa,
    pub vm: Vm<'static, &'static SimRam, TestHat, TestPlatform>,
}

impl Harness {
    pub fn new(frames: usize) -> Self {
        Self::with_cpus(frames, 1)
    }

    pub fn with_cpus(frames: usize, cpus: usize) -> Self {
        set_cpu(0);
        let ram: &'static SimRam = Box::leak(Box::new(SimRam::new(BASE, frames)));
        let map = [MemoryMapEntry::new(BASE, ram.len_bytes(), MemoryKind::Usable)];
        let config = MmConfig::default().with_prezero_frames(8);
        let pfa: &'static TestPfa = Box::leak(Box::new(unsafe { FrameAllocator::new(ram, &map, &config) }.unwrap()));
        let hat = X86Hat::new(ram, pfa, RecordingMmu::new(), &config).unwrap();
        let vm = Vm::new(pfa, hat, TestPlatform::default(), config, cpus);
        Self { ram, pfa, vm }
    }

    pub fn mmu(&self) -> &RecordingMmu {
        self.vm.hat().mmu()
    }

    pub fn frame(&self) -> PhysicalAddress {
        self.pfa.alloc(FrameRequest::single()).unwrap()
    }

    /// User-mode read or write fault at `addr`.
    pub fn touch(&self, space: &AddressSpace<X86Root>, addr: VirtualAddress, write: bool) -> Result<(), FaultError> {
        let mut flags = FaultFlags::USER;
        flags.set(FaultFlags::WRITE, write);
        self.vm.handle_fault(space, addr, flags)
    }
}
