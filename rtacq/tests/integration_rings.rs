//! Integration tests for the slot rings under a real producer thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rtacq::ring::TrailingRing;
use rtacq::scan::{FullState, LockState, ScanRing};
use rtacq::spin::SpinLock;

#[test]
fn test_trailing_timestamps_never_go_backwards() {
    const SLOT: usize = 64;
    let ring = Arc::new(TrailingRing::new(SLOT).unwrap());
    let mut producer = ring.claim_producer().unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let done = Arc::clone(&done);
        std::thread::spawn(move || {
            let mut payload = [0u8; SLOT];
            for ts in 1..=50_000u64 {
                payload[..8].copy_from_slice(&ts.to_le_bytes());
                producer.publish(&payload, ts);
            }
            done.store(true, Ordering::Release);
        })
    };

    let mut out = [0u8; SLOT];
    let mut last = 0;
    while !done.load(Ordering::Acquire) {
        let read = ring.read_into(&mut out);
        if read.has_data() {
            let mut embedded = [0u8; 8];
            embedded.copy_from_slice(&out[..8]);
            assert_eq!(u64::from_le_bytes(embedded), read.timestamp_us);
            assert!(read.timestamp_us >= last);
            last = read.timestamp_us;
        }
    }
    writer.join().unwrap();

    // Final state: the trailing slot holds the second-to-last sample.
    assert_eq!(ring.read_into(&mut out).timestamp_us, 49_999);
}

#[test]
fn test_scan_exhaustion_drops_and_recovers() {
    let ring = ScanRing::new(3, 4).unwrap();
    let held: Vec<_> = (0..3).map(|i| ring.try_lock_slot(i).unwrap()).collect();

    for expected in 1..=4 {
        assert!(ring.find_next_unlocked_slot().is_none());
        assert_eq!(ring.lost_buffers(), expected);
    }
    for i in 0..3 {
        assert_eq!(ring.lock_state(i), LockState::Locked);
        assert_eq!(ring.full_state(i), FullState::Free);
    }

    drop(held);
    let mut slot = ring.find_next_unlocked_slot().unwrap();
    slot.write(&[7; 4]);
    slot.commit(99);

    let mut out = [0u8; 4];
    let read = ring.read_next(&mut out).unwrap();
    assert_eq!(read.timestamp_us, 99);
    assert_eq!(out, [7; 4]);
}

#[test]
fn test_scan_every_unit_accounted_for() {
    const UNITS: u64 = 30_000;
    let ring = ScanRing::new(4, 8).unwrap();
    let mut received = 0u64;

    std::thread::scope(|s| {
        let producer = s.spawn(|| {
            for ts in 1..=UNITS {
                if let Some(mut slot) = ring.find_next_unlocked_slot() {
                    slot.write(&ts.to_le_bytes());
                    slot.commit(ts);
                }
            }
        });

        let mut out = [0u8; 8];
        loop {
            let finished = producer.is_finished();
            while let Some(read) = ring.read_next(&mut out) {
                assert_eq!(u64::from_le_bytes(out), read.timestamp_us);
                received += 1;
            }
            if finished {
                break;
            }
        }
    });

    // Every unit was read, overwritten before being read, or dropped.
    assert_eq!(received + ring.overruns() + ring.lost_buffers(), UNITS);
}

#[test]
fn test_spin_lock_serializes_threads() {
    let lock = Arc::new(SpinLock::new((0u64, 0u64)));
    let threads: Vec<_> = (0..4)
        .map(|_| {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                for _ in 0..10_000 {
                    let mut guard = lock.acquire();
                    guard.0 += 1;
                    guard.1 = guard.0 * 2;
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let guard = lock.acquire();
    assert_eq!(guard.0, 40_000);
    assert_eq!(guard.1, 80_000);
}
