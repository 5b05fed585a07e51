use kernel_alloc::{FrameAllocator, FrameRequest, FrameStats, FrameUsage};
use kernel_info::boot::{MemoryKind, MemoryMapEntry};
use kernel_info::config::MmConfig;
use kernel_memory_addresses::{PhysicalAddress, SimRam};
use std::collections::HashSet;
use std::thread;

const BASE: u64 = 0x10_0000;

fn build(ram: &SimRam, prezero: usize) -> FrameAllocator<&SimRam> {
    let map = [MemoryMapEntry::new(BASE, ram.len_bytes(), MemoryKind::Usable)];
    let cfg = MmConfig::default().with_prezero_frames(prezero);
    unsafe { FrameAllocator::new(ram, &map, &cfg) }.expect("frame database")
}

fn conserved(stats: FrameStats) -> bool {
    stats.used + stats.free() + stats.reserved == stats.total
}

#[test]
fn frame_conservation_over_mixed_sequence() {
    let ram = SimRam::new(BASE, 128);
    let pfa = build(&ram, 16);
    let total = pfa.stats().total;

    let mut held = Vec::new();
    for round in 0..6 {
        for i in 0..10 {
            let request = if (round + i) % 3 == 0 {
                FrameRequest::single().zeroed()
            } else {
                FrameRequest::single().usage(FrameUsage::Heap)
            };
            held.push((pfa.alloc(request).expect("frame"), 1));
            assert!(conserved(pfa.stats()));
        }
        if let Some(run) = pfa.alloc(FrameRequest::run(4)) {
            held.push((run, 4));
        }
        for _ in 0..7 {
            let (pa, n) = held.remove(0);
            pfa.free(pa, n);
            assert!(conserved(pfa.stats()));
        }
        pfa.prezero(3);
        assert!(conserved(pfa.stats()));
    }

    for (pa, n) in held {
        pfa.free(pa, n);
    }
    let stats = pfa.stats();
    assert!(conserved(stats));
    assert_eq!(stats.used, 0);
    assert_eq!(stats.total, total);
}

#[test]
fn single_frames_are_never_handed_out_twice() {
    let ram = SimRam::new(BASE, 64);
    let pfa = build(&ram, 8);
    let mut seen = HashSet::new();
    while let Some(pa) = pfa.alloc(FrameRequest::single()) {
        assert!(seen.insert(pa), "{pa} handed out twice");
    }
    assert_eq!(seen.len(), 63);
}

#[test]
fn exhaustion_then_exact_reuse() {
    // One frame holds the table; four remain.
    let ram = SimRam::new(BASE, 5);
    let pfa = build(&ram, 0);

    let frames: Vec<_> = (0..4)
        .map(|_| pfa.alloc(FrameRequest::single()).expect("frame"))
        .collect();
    assert!(pfa.alloc(FrameRequest::single()).is_none());
    assert!(pfa.alloc(FrameRequest::single().zeroed()).is_none());

    pfa.free(frames[2], 1);
    assert_eq!(pfa.alloc(FrameRequest::single()), Some(frames[2]));
}

#[test]
fn freed_frames_come_back_dirty_and_zero_requests_clean_them() {
    let ram = SimRam::new(BASE, 3);
    let pfa = build(&ram, 2);
    let a = pfa.alloc(FrameRequest::single().zeroed()).expect("frame");
    ram.write_bytes(a, b"scribble");
    pfa.free(a, 1);
    assert_eq!(pfa.stats().free_dirty, 1);

    // The zero list still has one frame; take it first.
    let b = pfa.alloc(FrameRequest::single().zeroed()).expect("frame");
    assert_ne!(a, b);
    let c = pfa.alloc(FrameRequest::single().zeroed()).expect("frame");
    assert_eq!(c, a);
    assert!(ram.read_frame(c).iter().all(|&byte| byte == 0));
}

#[test]
fn concurrent_allocation_is_exclusive() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 60;

    let ram = SimRam::new(BASE, 256);
    let pfa = build(&ram, 32);

    let per_thread: Vec<Vec<PhysicalAddress>> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let pfa = &pfa;
                s.spawn(move || {
                    let mut mine = Vec::new();
                    for i in 0..PER_THREAD {
                        let zero = (t + i) % 2 == 0;
                        let request = if zero {
                            FrameRequest::single().zeroed()
                        } else {
                            FrameRequest::single()
                        };
                        let pa = pfa.alloc(request).expect("enough frames for every thread");
                        if i % 5 == 4 {
                            // Return one now and then so frees race with allocations too.
                            pfa.free(pa, 1);
                        } else {
                            mine.push(pa);
                        }
                    }
                    mine
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut seen = HashSet::new();
    for pa in per_thread.iter().flatten() {
        assert!(seen.insert(*pa), "{pa} owned by two threads");
    }
    let stats = pfa.stats();
    assert_eq!(stats.used, seen.len());
    assert!(conserved(stats));

    for pa in seen {
        pfa.free(pa, 1);
    }
    assert_eq!(pfa.stats().used, 0);
}
