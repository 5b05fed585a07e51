//! Per-CPU memory-management state.

use core::sync::atomic::{AtomicU64, Ordering};

/// Upper bound on CPUs; CPU sets are `u64` masks.
pub const MAX_CPUS: usize = 64;

/// Space id meaning "nothing loaded".
pub const NO_SPACE: u64 = 0;

/// Which space each CPU runs and which CPUs owe a shootdown acknowledgement.
pub struct CpuTable {
    online: AtomicU64,
    pending: AtomicU64,
    current: [AtomicU64; MAX_CPUS],
}

impl CpuTable {
    /// Table with CPUs `0..count` online.
    #[must_use]
    pub fn new(count: usize) -> Self {
        let count = count.clamp(1, MAX_CPUS);
        let online = if count == MAX_CPUS {
            u64::MAX
        } else {
            (1 << count) - 1
        };
        Self {
            online: AtomicU64::new(online),
            pending: AtomicU64::new(0),
            current: [const { AtomicU64::new(NO_SPACE) }; MAX_CPUS],
        }
    }

    #[must_use]
    pub fn online_mask(&self) -> u64 {
        self.online.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn current_space(&self, cpu: usize) -> u64 {
        self.current[cpu].load(Ordering::Acquire)
    }

    pub fn set_current_space(&self, cpu: usize, space: u64) {
        self.current[cpu].store(space, Ordering::Release);
    }

    /// CPUs currently running `space`.
    #[must_use]
    pub fn running(&self, space: u64) -> u64 {
        self.current
            .iter()
            .enumerate()
            .filter(|(_, c)| c.load(Ordering::Acquire) == space)
            .fold(0, |mask, (cpu, _)| mask | (1 << cpu))
    }

    pub fn set_pending(&self, cpu: usize) {
        self.pending.fetch_or(1 << cpu, Ordering::AcqRel);
    }

    /// Clear and return `cpu`'s pending flag.
    pub fn take_pending(&self, cpu: usize) -> bool {
        let bit = 1 << cpu;
        self.pending.fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }
}

/// Iterate the CPU numbers set in `mask`.
pub fn cpus_in(mut mask: u64) -> impl Iterator<Item = usize> {
    core::iter::from_fn(move || {
        if mask == 0 {
            return None;
        }
        let cpu = mask.trailing_zeros() as usize;
        mask &= mask - 1;
        Some(cpu)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn online_mask_for_count() {
        assert_eq!(CpuTable::new(1).online_mask(), 0b1);
        assert_eq!(CpuTable::new(4).online_mask(), 0b1111);
        assert_eq!(CpuTable::new(MAX_CPUS).online_mask(), u64::MAX);
    }

    #[test]
    fn pending_flags_are_taken_once() {
        let cpus = CpuTable::new(4);
        cpus.set_pending(2);
        assert!(!cpus.take_pending(1));
        assert!(cpus.take_pending(2));
        assert!(!cpus.take_pending(2));
    }

    #[test]
    fn running_collects_cpus() {
        let cpus = CpuTable::new(4);
        cpus.set_current_space(1, 7);
        cpus.set_current_space(3, 7);
        cpus.set_current_space(2, 9);
        assert_eq!(cpus.running(7), 0b1010);
        assert_eq!(cpus_in(0b1010).collect::<Vec<_>>(), [1, 3]);
    }
}
