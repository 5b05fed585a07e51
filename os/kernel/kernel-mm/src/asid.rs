//! Address-space identifier pool.

use kernel_info::memory::{ASID_COUNT, KERNEL_ASID};
use kernel_sync::SpinLock;

const WORDS: usize = ASID_COUNT / 64;

/// Bitmap of ASIDs in use. ASID 0 belongs to the kernel and is never handed out.
pub struct AsidPool {
    bits: SpinLock<[u64; WORDS]>,
    limit: usize,
}

impl AsidPool {
    /// Pool of `count` ASIDs (clamped to [`ASID_COUNT`]), the kernel's included.
    #[must_use]
    pub fn new(count: usize) -> Self {
        let mut bits = [0u64; WORDS];
        bits[0] = 1 << KERNEL_ASID;
        Self {
            bits: SpinLock::new(bits),
            limit: count.clamp(1, ASID_COUNT),
        }
    }

    /// Lowest free ASID.
    ///
    /// # Panics
    /// When every ASID is taken; running out is a fatal configuration error.
    pub fn alloc(&self) -> u16 {
        let mut bits = self.bits.lock();
        for (w, word) in bits.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones() as usize;
            let asid = w * 64 + bit;
            if asid >= self.limit {
                break;
            }
            *word |= 1 << bit;
            #[allow(clippy::cast_possible_truncation)]
            return asid as u16;
        }
        drop(bits);
        panic!("out of ASIDs ({} in use)", self.limit);
    }

    /// Return `asid` to the pool.
    pub fn free(&self, asid: u16) {
        let asid = usize::from(asid);
        if asid == usize::from(KERNEL_ASID) || asid >= self.limit {
            log::warn!("asid: refusing to free ASID {asid}");
            return;
        }
        let mut bits = self.bits.lock();
        let (w, bit) = (asid / 64, asid % 64);
        if bits[w] & (1 << bit) == 0 {
            log::warn!("asid: ASID {asid} freed twice");
            return;
        }
        bits[w] &= !(1 << bit);
    }

    /// ASIDs currently taken, the kernel's included.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.bits.lock().iter().map(|w| w.count_ones() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_asid_is_reserved() {
        let pool = AsidPool::new(ASID_COUNT);
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.alloc(), 1);
        assert_eq!(pool.alloc(), 2);
        pool.free(KERNEL_ASID);
        assert_eq!(pool.in_use(), 3);
    }

    #[test]
    fn freed_asids_are_reused_lowest_first() {
        let pool = AsidPool::new(ASID_COUNT);
        let ids: Vec<_> = (0..100).map(|_| pool.alloc()).collect();
        pool.free(ids[70]);
        pool.free(ids[10]);
        pool.free(ids[10]);
        assert_eq!(pool.alloc(), ids[10]);
        assert_eq!(pool.alloc(), ids[70]);
    }

    #[test]
    #[should_panic(expected = "out of ASIDs")]
    fn exhaustion_is_fatal() {
        let pool = AsidPool::new(4);
        for _ in 0..4 {
            pool.alloc();
        }
    }

    #[test]
    fn full_pool_spans_words() {
        let pool = AsidPool::new(ASID_COUNT);
        for _ in 1..ASID_COUNT {
            pool.alloc();
        }
        assert_eq!(pool.in_use(), ASID_COUNT);
        pool.free(4095);
        assert_eq!(pool.alloc(), 4095);
    }
}
