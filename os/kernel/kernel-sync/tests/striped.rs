use kernel_sync::StripedLocks;
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn keys_wrap_onto_stripes() {
    let locks = StripedLocks::new(4, |i| i * 10);
    assert_eq!(locks.len(), 4);
    assert_eq!(*locks.lock(1), 10);
    assert_eq!(*locks.lock(5), 10);
    assert_eq!(*locks.lock(7), 30);
}

#[test]
fn distinct_stripes_lock_independently() {
    let locks = StripedLocks::new(2, |_| 0u32);
    let _a = locks.lock(0);
    assert!(locks.stripe(1).try_lock().is_some());
    assert!(locks.stripe(2).try_lock().is_none());
}

#[test]
fn per_stripe_counters_are_exact() {
    let threads = 6;
    let iters = 3_000;
    let locks = Arc::new(StripedLocks::new(3, |_| 0usize));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let locks = Arc::clone(&locks);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    *locks.lock(t) += 1;
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let counts: Vec<usize> = locks.iter().map(|s| *s.lock()).collect();
    assert_eq!(counts, vec![2 * iters; 3]);
}

#[test]
#[should_panic(expected = "at least one stripe")]
fn empty_pool_is_rejected() {
    let _ = StripedLocks::new(0, |_| ());
}
