use kernel_sync::Rendezvous;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

#[test]
fn unarmed_is_complete_and_rejects_arrivals() {
    let r = Rendezvous::new();
    assert!(r.is_complete());
    assert!(!r.arrive());
    assert_eq!(r.remaining(), 0);
}

#[test]
fn counts_down_to_zero() {
    let r = Rendezvous::new();
    r.arm(2);
    assert_eq!(r.remaining(), 2);
    assert!(r.arrive());
    assert!(!r.is_complete());
    assert!(r.arrive());
    assert!(r.is_complete());
    assert!(!r.arrive(), "extra arrival must not underflow");
}

#[test]
fn wait_observes_all_participant_work() {
    let participants = 6;
    let r = Arc::new(Rendezvous::new());
    let done = Arc::new(AtomicUsize::new(0));
    r.arm(participants);

    let handles: Vec<_> = (0..participants)
        .map(|i| {
            let r = Arc::clone(&r);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5 * i as u64));
                done.fetch_add(1, Ordering::Relaxed);
                r.arrive();
            })
        })
        .collect();

    r.wait();
    assert_eq!(done.load(Ordering::Relaxed), participants);

    for h in handles {
        h.join().unwrap();
    }
}
