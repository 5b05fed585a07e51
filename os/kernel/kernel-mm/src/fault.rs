//! # Page Faults
//!
//! The trap stubs decode the architecture's fault syndrome into
//! [`FaultFlags`] and hand it to [`Vm::dispatch_fault`]. Resolution:
//!
//! | Page state | Access | Outcome |
//! |------------|--------|---------|
//! | no segment | any | [`FaultError::UnmappedAccess`] |
//! | any | not allowed by the segment | [`FaultError::ProtectionViolation`] |
//! | `Unmapped` | any | [`FaultError::PageUnmapped`] |
//! | `None` | allowed | zeroed frame mapped (demand zero) |
//! | `Present` | already allowed by the installed entry | nothing (another CPU got there first) |
//! | `Present` | write to read-only entry | private copy (copy-on-write) |
//! | `Present` | anything else | [`FaultError::AlreadyPresent`] |

use crate::segment::{FaultPolicy, MapMode, PageState, Protection, TrackedPage};
use crate::space::AddressSpace;
use crate::{Platform, Vm};
use bitfield_struct::bitfield;
use bitflags::bitflags;
use core::fmt::Debug;
use kernel_alloc::{FrameRequest, FrameUsage};
use kernel_memory_addresses::{PhysMapper, PhysicalAddress, VirtualAddress};
use kernel_vmem::{Hat, Invalidation, MapFlags};

bitflags! {
    /// Architecture-neutral description of a faulting access.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct FaultFlags: u32 {
        /// The page was present; the access broke its permissions.
        const PROTECTION = 1 << 0;
        const WRITE = 1 << 1;
        /// Instruction fetch.
        const EXEC = 1 << 2;
        /// Raised from user mode.
        const USER = 1 << 3;
    }
}

/// Why a fault could not be resolved.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FaultError {
    #[error("address is not inside any segment")]
    UnmappedAccess,
    #[error("access not permitted by the segment")]
    ProtectionViolation,
    #[error("page was unmapped")]
    PageUnmapped,
    #[error("page is already present")]
    AlreadyPresent,
    #[error("out of memory")]
    OutOfMemory,
}

/// x86_64 page-fault error code.
///
/// Reference: Intel SDM Vol. 3A, §6.15 "Page-Fault Exception (#PF)".
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultErrorCode {
    /// 0 = non-present page, 1 = protection violation.
    pub present: bool,
    /// 0 = read, 1 = write.
    pub write: bool,
    /// 1 = CPL 3.
    pub user: bool,
    /// Reserved bit set in a paging structure.
    pub reserved_bit: bool,
    pub instruction_fetch: bool,
    pub protection_key: bool,
    pub shadow_stack: bool,
    #[bits(8)]
    __: u8,
    pub sgx: bool,
    #[bits(48)]
    __: u64,
}

impl PageFaultErrorCode {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if !self.present() {
            "non-present page"
        } else if self.reserved_bit() {
            "reserved bit set in a paging structure"
        } else if self.instruction_fetch() {
            "instruction fetch from a protected page"
        } else if self.write() {
            "write to a protected page"
        } else {
            "read from a protected page"
        }
    }
}

/// aarch64 exception syndrome register (`ESR_EL1`).
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Esr {
    /// Fault status code for aborts.
    #[bits(6)]
    pub dfsc: u8,
    /// Write not Read.
    pub wnr: bool,
    #[bits(18)]
    __: u32,
    /// Instruction length.
    pub il: bool,
    /// Exception class.
    #[bits(6)]
    pub ec: u8,
    #[bits(32)]
    __: u32,
}

const EC_IABT_LOWER: u8 = 0x20;
const EC_IABT_CURRENT: u8 = 0x21;
const EC_DABT_LOWER: u8 = 0x24;
const EC_DABT_CURRENT: u8 = 0x25;

/// Permission faults at levels 0 to 3.
const FSC_PERMISSION: core::ops::RangeInclusive<u8> = 0x0C..=0x0F;

/// Classify an x86_64 `#PF` error code.
#[must_use]
pub const fn decode_x86_64(error_code: u64) -> FaultFlags {
    let code = PageFaultErrorCode::from_bits(error_code);
    let mut bits = 0;
    if code.present() {
        bits |= FaultFlags::PROTECTION.bits();
    }
    if code.write() {
        bits |= FaultFlags::WRITE.bits();
    }
    if code.instruction_fetch() {
        bits |= FaultFlags::EXEC.bits();
    }
    if code.user() {
        bits |= FaultFlags::USER.bits();
    }
    FaultFlags::from_bits_truncate(bits)
}

/// Classify an aarch64 abort from its `ESR_EL1` value. `None` for
/// exception classes that are not instruction or data aborts.
#[must_use]
pub fn decode_aarch64(esr: u64) -> Option<FaultFlags> {
    let esr = Esr::from_bits(esr);
    let mut flags = match esr.ec() {
        EC_IABT_LOWER => FaultFlags::EXEC | FaultFlags::USER,
        EC_IABT_CURRENT => FaultFlags::EXEC,
        EC_DABT_LOWER => FaultFlags::USER,
        EC_DABT_CURRENT => FaultFlags::empty(),
        _ => return None,
    };
    let data = matches!(esr.ec(), EC_DABT_LOWER | EC_DABT_CURRENT);
    flags.set(FaultFlags::WRITE, data && esr.wnr());
    flags.set(FaultFlags::PROTECTION, FSC_PERMISSION.contains(&esr.dfsc()));
    Some(flags)
}

/// Whether `prot` allows the access described by `flags`.
fn permits(prot: Protection, flags: FaultFlags) -> bool {
    if flags.contains(FaultFlags::EXEC) {
        prot.contains(Protection::EXEC)
    } else if flags.contains(FaultFlags::WRITE) {
        prot.contains(Protection::WRITE)
    } else {
        prot.intersects(Protection::READ | Protection::WRITE | Protection::EXEC)
    }
}

/// Whether an installed leaf with attributes `leaf` allows the access.
fn leaf_permits(leaf: MapFlags, flags: FaultFlags) -> bool {
    let access = if flags.contains(FaultFlags::EXEC) {
        leaf.contains(MapFlags::EXEC)
    } else if flags.contains(FaultFlags::WRITE) {
        leaf.contains(MapFlags::WRITE)
    } else {
        leaf.contains(MapFlags::READ)
    };
    access && (leaf.contains(MapFlags::USER) || !flags.contains(FaultFlags::USER))
}

impl<M, H, P> Vm<'_, M, H, P>
where
    M: PhysMapper,
    H: Hat,
    P: Platform,
{
    /// Resolve a fault at `addr` in `space`.
    ///
    /// # Errors
    /// See [`FaultError`]; every error is an access the process may not make.
    pub fn handle_fault(
        &self,
        space: &AddressSpace<H::Root>,
        addr: VirtualAddress,
        flags: FaultFlags,
    ) -> Result<(), FaultError> {
        let mut inner = space.lock();
        let segment = inner
            .segments
            .iter_mut()
            .find(|s| s.contains(addr))
            .ok_or(FaultError::UnmappedAccess)?;
        if !permits(segment.protection(), flags) {
            return Err(FaultError::ProtectionViolation);
        }
        let (prot, mode) = (segment.protection(), segment.mode());
        debug_assert_eq!(segment.policy(), FaultPolicy::Anonymous);
        let index = segment.page_index(addr).ok_or(FaultError::UnmappedAccess)?;
        let page = segment.page_mut(index);
        self.sync_refcount(page);

        match page.state {
            PageState::Unmapped => Err(FaultError::PageUnmapped),
            PageState::None => self.demand_zero(space, page, prot),
            PageState::Present
                if self
                    .hat
                    .resolve(space.root(), addr)
                    .is_some_and(|t| leaf_permits(t.flags, flags)) =>
            {
                log::trace!("fault: spurious {flags:?} fault at {addr}");
                Ok(())
            }
            PageState::Present
                if flags.contains(FaultFlags::WRITE | FaultFlags::PROTECTION)
                    && mode.contains(MapMode::PRIVATE)
                    && page.refcount >= 1 =>
            {
                let result = self.copy_on_write(space, page, prot);
                drop(inner);
                result.map(|(virt, replaced)| {
                    if self.needs_flush(space) {
                        self.shootdown(space, Invalidation::page(virt, space.asid()));
                    }
                    if let Some(old) = replaced {
                        self.pfa.free(old, 1);
                    }
                })
            }
            PageState::Present => Err(FaultError::AlreadyPresent),
        }
    }

    /// Trap-entry contract: resolve the fault or stop the machine.
    ///
    /// `context` is the saved register state, printed on failure.
    pub fn dispatch_fault(
        &self,
        space: &AddressSpace<H::Root>,
        addr: VirtualAddress,
        flags: FaultFlags,
        context: &dyn Debug,
    ) {
        if let Err(e) = self.handle_fault(space, addr, flags) {
            self.platform.broadcast_halt();
            log::error!(
                "fatal page fault on CPU {} in space {} at {addr}: {e} ({flags:?})",
                self.platform.current_cpu(),
                space.id()
            );
            log::error!("{context:#?}");
            self.platform.halt_forever();
        }
    }

    fn demand_zero(&self, space: &AddressSpace<H::Root>, page: &mut TrackedPage, prot: Protection) -> Result<(), FaultError> {
        let frame = self
            .pfa
            .alloc(FrameRequest::single().zeroed().usage(FrameUsage::Object))
            .ok_or(FaultError::OutOfMemory)?;
        if let Err(e) = self.hat.insert(space.root(), page.virt, frame, prot.map_flags()) {
            log::warn!("fault: mapping {}: {e}", page.virt);
            self.pfa.free(frame, 1);
            return Err(FaultError::OutOfMemory);
        }
        *page = TrackedPage {
            phys: frame,
            refcount: 1,
            state: PageState::Present,
            ..*page
        };
        Ok(())
    }

    /// Give `page` a private writable frame. Returns the page to invalidate
    /// and the frame whose share to drop once it is invalidated.
    fn copy_on_write(
        &self,
        space: &AddressSpace<H::Root>,
        page: &mut TrackedPage,
        prot: Protection,
    ) -> Result<(VirtualAddress, Option<PhysicalAddress>), FaultError> {
        let flags = prot.map_flags();
        let old = page.phys;

        // Last owner: write-enable in place.
        if self.pfa.refcount(old) == Some(1) {
            self.hat
                .insert(space.root(), page.virt, old, flags)
                .map_err(|_| FaultError::OutOfMemory)?;
            page.refcount = 1;
            return Ok((page.virt, None));
        }

        let frame = self
            .pfa
            .alloc(FrameRequest::single().usage(FrameUsage::Object))
            .ok_or(FaultError::OutOfMemory)?;
        // SAFETY: `frame` was just allocated; `old` stays mapped read-only.
        unsafe { self.pfa.mapper().copy_frame(frame, old) };
        if let Err(e) = self.hat.insert(space.root(), page.virt, frame, flags) {
            log::warn!("fault: remapping {}: {e}", page.virt);
            self.pfa.free(frame, 1);
            return Err(FaultError::OutOfMemory);
        }
        *page = TrackedPage {
            phys: frame,
            refcount: 1,
            ..*page
        };
        log::trace!("fault: copied {} from {old} to {frame}", page.virt);
        Ok((page.virt, Some(old)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, set_cpu};
    use kernel_memory_addresses::PAGE_SIZE;
    use kernel_vmem::x86_64::X86Root;
    use std::sync::Barrier;
    use std::thread;

    const RW: Protection = Protection::READ.union(Protection::WRITE);

    #[test]
    fn x86_error_codes() {
        assert_eq!(decode_x86_64(0b0000), FaultFlags::empty());
        assert_eq!(decode_x86_64(0b0111), FaultFlags::PROTECTION | FaultFlags::WRITE | FaultFlags::USER);
        assert_eq!(decode_x86_64(0b1_0101), FaultFlags::PROTECTION | FaultFlags::EXEC | FaultFlags::USER);
        assert_eq!(
            PageFaultErrorCode::from_bits(0b0011).explain(),
            "write to a protected page"
        );
    }

    #[test]
    fn aarch64_syndromes() {
        // Data abort from EL0, write, level-3 permission fault.
        let esr = (0x24 << 26) | (1 << 25) | (1 << 6) | 0x0F;
        assert_eq!(
            decode_aarch64(esr),
            Some(FaultFlags::USER | FaultFlags::WRITE | FaultFlags::PROTECTION)
        );
        // Instruction abort at EL1, level-2 translation fault.
        assert_eq!(decode_aarch64((0x21 << 26) | 0x06), Some(FaultFlags::EXEC));
        // SVC is not an abort.
        assert_eq!(decode_aarch64(0x15 << 26), None);
    }

    #[test]
    fn demand_zero_populates_once() {
        let h = Harness::new(64);
        let space = h.vm.create_space().unwrap();
        let base = h.vm.create_segment(&space, 4 * 4096, RW, MapMode::PRIVATE, None).unwrap();
        let addr = base + 0x1234;

        h.touch(&space, addr, false).unwrap();
        let page = h.vm.tracked_page(&space, addr).unwrap();
        assert_eq!(page.state, PageState::Present);
        assert_eq!(page.refcount, 1);
        assert_eq!(page.virt, base + 0x1000);
        assert_eq!(h.ram.read_frame(page.phys), [0; 4096]);

        let t = h.vm.resolve(&space, addr).unwrap();
        assert_eq!(t.base(), page.phys);
        assert!(t.flags.contains(MapFlags::USER | MapFlags::WRITE));

        // A second fault the installed entry already allows changes nothing.
        let used = h.pfa.stats().used;
        h.touch(&space, addr, true).unwrap();
        assert_eq!(h.vm.tracked_page(&space, addr).unwrap(), page);
        assert_eq!(h.pfa.stats().used, used);
        h.vm.destroy_space(space);
    }

    #[test]
    fn racing_first_touches_both_succeed() {
        let h = Harness::with_cpus(64, 2);
        let space = h.vm.create_space().unwrap();
        let base = h.vm.create_segment(&space, PAGE_SIZE, RW, MapMode::PRIVATE, None).unwrap();
        let used = h.pfa.stats().used;
        let start = Barrier::new(2);

        let results: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|cpu| {
                    let (h, space, start) = (&h, &space, &start);
                    s.spawn(move || {
                        set_cpu(cpu);
                        start.wait();
                        h.touch(space, base, cpu == 1)
                    })
                })
                .collect();
            handles.into_iter().map(|t| t.join().unwrap()).collect()
        });

        assert_eq!(results, [Ok(()), Ok(())]);
        // One data frame plus three tables.
        assert_eq!(h.pfa.stats().used, used + 4);
        assert_eq!(h.vm.tracked_page(&space, base).unwrap().state, PageState::Present);
        h.vm.destroy_space(space);
    }

    #[test]
    fn faults_outside_segments_and_permissions() {
        let h = Harness::new(64);
        let space = h.vm.create_space().unwrap();
        let ro = h
            .vm
            .create_segment(&space, 4096, Protection::READ, MapMode::PRIVATE, None)
            .unwrap();

        assert_eq!(
            h.touch(&space, VirtualAddress::new(0x1000), false),
            Err(FaultError::UnmappedAccess)
        );
        assert_eq!(h.touch(&space, ro, true), Err(FaultError::ProtectionViolation));
        assert_eq!(
            h.vm.handle_fault(&space, ro, FaultFlags::EXEC | FaultFlags::USER),
            Err(FaultError::ProtectionViolation)
        );
        assert_eq!(h.vm.tracked_page(&space, ro).unwrap().state, PageState::None);
        h.vm.destroy_space(space);
    }

    #[test]
    fn copy_on_write_after_sharing() {
        let h = Harness::new(64);
        let parent = h.vm.create_space().unwrap();
        let base = h.vm.create_segment(&parent, 4096, RW, MapMode::PRIVATE, None).unwrap();
        h.touch(&parent, base, true).unwrap();
        let original = space_phys(&h, &parent, base);
        h.ram.write_bytes(original + 8, b"parent");

        let child = h.vm.fork_space(&parent).unwrap();
        assert_eq!(h.pfa.refcount(original), Some(2));
        assert_eq!(h.vm.tracked_page(&parent, base).unwrap().refcount, 2);
        assert_eq!(h.vm.tracked_page(&child, base).unwrap().refcount, 2);
        assert!(!h.vm.resolve(&parent, base).unwrap().flags.contains(MapFlags::WRITE));
        assert!(!h.vm.resolve(&child, base).unwrap().flags.contains(MapFlags::WRITE));

        h.vm.handle_fault(&child, base, FaultFlags::WRITE | FaultFlags::PROTECTION | FaultFlags::USER)
            .unwrap();
        let copy = space_phys(&h, &child, base);
        assert_eq!(h.vm.resolve(&parent, base).unwrap().base(), original);
        assert_eq!(&h.ram.read_frame(original)[8..14], b"parent");
        assert_ne!(copy, original);
        assert_eq!(&h.ram.read_frame(copy)[8..14], b"parent");
        assert_eq!(h.vm.tracked_page(&child, base).unwrap().refcount, 1);
        // The parent is the last owner of the original.
        assert_eq!(h.vm.tracked_page(&parent, base).unwrap().refcount, 1);
        assert_eq!(h.pfa.refcount(original), Some(1));
        assert_eq!(h.pfa.refcount(copy), Some(1));
        assert!(h.vm.resolve(&child, base).unwrap().flags.contains(MapFlags::WRITE));

        // The parent is now the only owner and gets its frame back writable.
        h.vm.handle_fault(&parent, base, FaultFlags::WRITE | FaultFlags::PROTECTION | FaultFlags::USER)
            .unwrap();
        assert_eq!(space_phys(&h, &parent, base), original);
        assert!(h.vm.resolve(&parent, base).unwrap().flags.contains(MapFlags::WRITE));

        h.vm.destroy_space(child);
        h.vm.destroy_space(parent);
        assert_eq!(h.pfa.refcount(original).unwrap_or(0), 0);
    }

    #[test]
    #[should_panic(expected = "halted")]
    fn unresolvable_fault_halts() {
        let h = Harness::new(64);
        let space = h.vm.create_space().unwrap();
        h.vm.dispatch_fault(&space, VirtualAddress::new(0xdead_0000), FaultFlags::USER, &"rip=0x401000");
    }

    fn space_phys(h: &Harness, space: &AddressSpace<X86Root>, addr: VirtualAddress) -> PhysicalAddress {
        h.vm.tracked_page(space, addr).unwrap().phys
    }

    #[test]
    fn page_size_granularity() {
        let h = Harness::new(64);
        let space = h.vm.create_space().unwrap();
        let base = h.vm.create_segment(&space, 3 * PAGE_SIZE, RW, MapMode::PRIVATE, None).unwrap();
        h.touch(&space, base + 2 * PAGE_SIZE + 7, true).unwrap();
        assert_eq!(h.vm.tracked_page(&space, base).unwrap().state, PageState::None);
        assert_eq!(
            h.vm.tracked_page(&space, base + 2 * PAGE_SIZE).unwrap().state,
            PageState::Present
        );
        h.vm.destroy_space(space);
    }
}
