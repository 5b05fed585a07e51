use core::hint::spin_loop;
use core::sync::atomic::{AtomicUsize, Ordering};

/// A one-shot countdown shared between an initiator and `n` participants.
///
/// The initiator [`arm`](Self::arm)s it with the number of participants,
/// notifies them, and [`wait`](Self::wait)s. Each participant calls
/// [`arrive`](Self::arrive) exactly once after finishing its part; the
/// `Release`/`Acquire` pairing makes every participant's work visible to
/// the initiator once `wait` returns.
///
/// ```text
///  initiator            participant 1        participant 2
///  arm(2) ───────┐
///  notify ───────┼────► work                 work
///  local work    │      arrive() ── 1        arrive() ── 0
///  wait() ◄──────┴───────────────────────────────────────┘
/// ```
///
/// Re-arming while participants are still outstanding is a logic error;
/// callers serialize rounds with an outer lock.
pub struct Rendezvous {
    pending: AtomicUsize,
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self::new()
    }
}

impl Rendezvous {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pending: AtomicUsize::new(0),
        }
    }

    /// Start a round expecting `participants` arrivals.
    #[inline]
    pub fn arm(&self, participants: usize) {
        self.pending.store(participants, Ordering::Release);
    }

    /// Check in. Returns `false` (and changes nothing) if no round is pending.
    #[inline]
    pub fn arrive(&self) -> bool {
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Participants that have not arrived yet.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    /// Spin until every participant has arrived.
    #[inline]
    pub fn wait(&self) {
        while !self.is_complete() {
            spin_loop();
        }
    }
}
