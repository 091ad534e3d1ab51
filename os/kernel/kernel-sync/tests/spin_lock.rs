use kernel_sync::SpinLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn try_lock_fails_while_held() {
    let l = SpinLock::new(1u8);

    let g1 = l.try_lock();
    assert!(g1.is_some());
    assert!(l.is_locked());
    assert!(l.try_lock().is_none());

    drop(g1);
    assert!(!l.is_locked());
    assert!(l.try_lock().is_some());
}

#[test]
fn with_lock_releases_afterwards() {
    let l = SpinLock::new(vec![0x1000_u32]);
    let len = l.with_lock(|pages| {
        pages.push(0x2000);
        pages.len()
    });
    assert_eq!(len, 2);
    assert!(!l.is_locked());
    assert_eq!(l.into_inner(), vec![0x1000, 0x2000]);
}

#[test]
fn get_mut_allows_direct_mutation() {
    let mut l = SpinLock::new([0u32; 4]);
    l.get_mut()[3] = 7;
    assert_eq!(l.lock()[3], 7);
}

#[test]
fn contended_lock_is_exclusive() {
    let threads = 8;
    let iters = 5_000;

    let lock = Arc::new(SpinLock::new(0usize));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let in_cs = Arc::clone(&in_cs);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    lock.with_lock(|v| {
                        let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(prev, 0, "mutual exclusion violated");
                        *v += 1;
                        in_cs.fetch_sub(1, Ordering::SeqCst);
                    });
                    thread::yield_now();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(lock.with_lock(|v| *v), threads * iters);
}

/// Scanners that skip busy shards still claim every slot exactly once.
#[test]
fn skipping_busy_shards_never_loses_a_slot() {
    const SHARDS: usize = 16;
    const SLOTS: usize = 64;
    let threads = 4;

    let shards: Arc<Vec<SpinLock<[bool; SLOTS]>>> =
        Arc::new((0..SHARDS).map(|_| SpinLock::new([false; SLOTS])).collect());
    let claimed = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let shards = Arc::clone(&shards);
            let claimed = Arc::clone(&claimed);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                loop {
                    let mut progress = false;
                    for shard in shards.iter() {
                        let Some(mut slots) = shard.try_lock() else {
                            progress = true;
                            continue;
                        };
                        if let Some(slot) = slots.iter_mut().find(|s| !**s) {
                            *slot = true;
                            claimed.fetch_add(1, Ordering::SeqCst);
                            progress = true;
                        }
                    }
                    if !progress {
                        break;
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(claimed.load(Ordering::SeqCst), SHARDS * SLOTS);
    assert!(shards.iter().all(|s| s.lock().iter().all(|b| *b)));
}

#[test]
fn lock_is_released_on_panic() {
    let l = SpinLock::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");
    assert_eq!(l.with_lock(|v| *v), 123);
}

#[test]
fn spinlock_is_sync_for_send_t() {
    fn takes_sync<S: Sync>(_s: &S) {}
    let l = SpinLock::new(0u8);
    takes_sync(&l);
}
