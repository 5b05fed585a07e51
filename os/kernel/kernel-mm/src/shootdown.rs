//! # TLB shootdown
//!
//! ```text
//!  initiator                               target CPU
//!  ─────────                               ──────────
//!  serial.lock()
//!  mailbox ← {root, mode, va, asid}
//!  rendezvous.arm(n)
//!  pending |= targets, send IPIs  ───────► handle_shootdown_ipi()
//!  invalidate locally                        take pending bit
//!                                            read mailbox, invalidate
//!  rendezvous.wait()  ◄──────────────────── rendezvous.arrive()
//!  clear mailbox, unlock
//! ```
//!
//! On aarch64 the hardware broadcasts `TLBI ...IS` to every CPU in the
//! inner-shareable domain, so only the local step runs.

use crate::cpu::cpus_in;
use crate::space::AddressSpace;
use crate::{Platform, Vm};
use core::hint::spin_loop;
use kernel_memory_addresses::{PhysMapper, VirtualAddress};
use kernel_sync::{Rendezvous, SpinLock};
use kernel_vmem::{Hat, Invalidation, InvalidationMode};

/// A published request. The mode travels raw, as it would in a
/// cross-CPU mailbox word.
#[derive(Debug, Copy, Clone)]
struct Mailbox<R> {
    root: R,
    mode: u32,
    virt: VirtualAddress,
    asid: u16,
}

pub(crate) struct Shootdown<R> {
    serial: SpinLock<()>,
    mailbox: SpinLock<Option<Mailbox<R>>>,
    rendezvous: Rendezvous,
}

impl<R> Shootdown<R> {
    pub(crate) const fn new() -> Self {
        Self {
            serial: SpinLock::new(()),
            mailbox: SpinLock::new(None),
            rendezvous: Rendezvous::new(),
        }
    }
}

impl<M, H, P> Vm<'_, M, H, P>
where
    M: PhysMapper,
    H: Hat,
    P: Platform,
{
    /// Apply `request` on every CPU that may cache entries of `space` and
    /// return once all of them have done so.
    pub(crate) fn shootdown(&self, space: &AddressSpace<H::Root>, request: Invalidation) {
        if H::BROADCASTS_INVALIDATION {
            self.hat.invalidate(space.root(), request);
            return;
        }

        // Keep answering other initiators while waiting our turn.
        let _serial = loop {
            if let Some(guard) = self.shootdown.serial.try_lock() {
                break guard;
            }
            self.handle_shootdown_ipi();
            spin_loop();
        };

        let targets = self.remote_holders(space, request);
        if targets == 0 {
            self.hat.invalidate(space.root(), request);
            return;
        }

        *self.shootdown.mailbox.lock() = Some(Mailbox {
            root: space.root(),
            mode: request.mode as u32,
            virt: request.virt,
            asid: request.asid,
        });
        self.shootdown.rendezvous.arm(targets.count_ones() as usize);
        for cpu in cpus_in(targets) {
            self.cpus.set_pending(cpu);
            self.platform.send_invalidate_ipi(cpu);
        }

        self.hat.invalidate(space.root(), request);
        self.shootdown.rendezvous.wait();
        *self.shootdown.mailbox.lock() = None;
    }

    /// Shootdown IPI entry point, called on the interrupted CPU.
    ///
    /// Returns `false` if this CPU had no request pending.
    pub fn handle_shootdown_ipi(&self) -> bool {
        let cpu = self.platform.current_cpu();
        if !self.cpus.take_pending(cpu) {
            return false;
        }

        let mailbox = *self.shootdown.mailbox.lock();
        match mailbox {
            Some(m) => match InvalidationMode::try_from(m.mode) {
                Ok(mode) => self.hat.invalidate(
                    m.root,
                    Invalidation {
                        mode,
                        virt: m.virt,
                        asid: m.asid,
                    },
                ),
                Err(raw) => log::warn!("shootdown: CPU {cpu} ignoring invalid mode {raw}"),
            },
            None => log::warn!("shootdown: CPU {cpu} signalled without a request"),
        }
        self.shootdown.rendezvous.arrive();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, set_cpu};
    use kernel_vmem::sim::MmuOp;

    #[test]
    fn invalid_mode_is_acknowledged_but_skipped() {
        let h = Harness::with_cpus(64, 2);
        *h.vm.shootdown.mailbox.lock() = Some(Mailbox {
            root: h.vm.kernel_space().root(),
            mode: 9,
            virt: VirtualAddress::new(0),
            asid: 0,
        });
        h.vm.shootdown.rendezvous.arm(1);
        h.vm.cpus.set_pending(1);
        h.mmu().take_ops();

        set_cpu(1);
        assert!(h.vm.handle_shootdown_ipi());
        assert!(!h.vm.handle_shootdown_ipi());
        set_cpu(0);

        assert!(h.vm.shootdown.rendezvous.is_complete());
        assert!(h.mmu().take_ops().is_empty());
    }

    #[test]
    fn sole_holder_invalidates_locally() {
        let h = Harness::with_cpus(64, 4);
        let space = h.vm.create_space().unwrap();
        h.vm.load(&space);
        h.mmu().take_ops();

        let va = VirtualAddress::new(0x5000);
        h.vm.shootdown(&space, Invalidation::page(va, space.asid()));
        assert!(h.vm.platform().ipis.lock().unwrap().is_empty());
        assert_eq!(h.mmu().take_ops(), [MmuOp::Invlpg(va)]);
    }

    #[test]
    fn kernel_space_targets_every_online_cpu() {
        let h = Harness::with_cpus(64, 3);
        let targets = h.vm.remote_holders(h.vm.kernel_space(), Invalidation::everything());
        assert_eq!(targets, 0b110);
    }
}
