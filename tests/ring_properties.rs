//! Property-based tests for the SPSC byte ring
//!
//! Invariants exercised over arbitrary operation interleavings:
//! - the reader cursor never passes the published writer cursor
//! - every byte is consumed exactly once, in order (the concatenation of
//!   consume windows equals the concatenation of produced chunks)
//! - relocation (any mix of cheap and expensive) loses no unread byte

use proptest::prelude::*;

use spool::config::RingTuning;
use spool::ring::ring;

fn published(tx: &spool::ring::RingProducer) -> u64 {
    tx.position() - (tx.unpublished() as u64)
}

proptest! {
    /// Reader never passes the published writer, under any interleaving.
    #[test]
    fn prop_reader_never_passes_writer(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..60),
        publish_every in 1usize..5,
        consume_every in 1usize..5,
        initial in 8usize..128,
    ) {
        let (mut tx, mut rx) = ring(RingTuning { initial_size: initial, multiplier: 1.5 });

        for (i, chunk) in chunks.iter().enumerate() {
            tx.push_bytes(chunk).unwrap();
            if i % publish_every == 0 {
                tx.publish();
            }
            if i % consume_every == 0 {
                let mut drain = rx.begin();
                let n = drain.window().len();
                drain.advance(n);
                drop(drain);
                rx.publish_read();
            }
            prop_assert!(rx.position() <= published(&tx),
                "reader {} passed published writer {}", rx.position(), published(&tx));
            prop_assert!(published(&tx) <= tx.position());
        }
    }

    /// Exactly-once, in-order delivery across arbitrary chunking.
    #[test]
    fn prop_bytes_delivered_exactly_once_in_order(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..48), 1..60),
        publish_every in 1usize..4,
        consume_every in 1usize..6,
        initial in 8usize..64,
    ) {
        let (mut tx, mut rx) = ring(RingTuning { initial_size: initial, multiplier: 1.5 });
        let mut produced = Vec::new();
        let mut consumed = Vec::new();

        for (i, chunk) in chunks.iter().enumerate() {
            tx.push_bytes(chunk).unwrap();
            produced.extend_from_slice(chunk);
            if i % publish_every == 0 {
                tx.publish();
            }
            if i % consume_every == 0 {
                let mut drain = rx.begin();
                let window = drain.window().to_vec();
                drain.advance(window.len());
                consumed.extend_from_slice(&window);
                drop(drain);
                rx.publish_read();
            }
        }

        tx.publish();
        let mut drain = rx.begin();
        let window = drain.window().to_vec();
        drain.advance(window.len());
        consumed.extend_from_slice(&window);

        prop_assert_eq!(consumed, produced);
    }

    /// A tiny ring forced through many relocations drops nothing even when
    /// the consumer lags far behind.
    #[test]
    fn prop_relocation_preserves_unread_bytes(
        lengths in prop::collection::vec(1usize..200, 1..40),
        initial in 4usize..32,
        multiplier in 1.25f64..3.0,
    ) {
        let (mut tx, mut rx) = ring(RingTuning { initial_size: initial, multiplier });
        let mut produced = Vec::new();

        // produce everything first: every chunk beyond the tail forces the
        // expensive copying relocation because nothing is consumed yet
        for (i, len) in lengths.iter().enumerate() {
            let byte = (i % 251) as u8;
            let chunk = vec![byte; *len];
            tx.push_bytes(&chunk).unwrap();
            produced.extend_from_slice(&chunk);
        }
        tx.publish();

        let mut consumed = Vec::new();
        let mut drain = rx.begin();
        let window = drain.window().to_vec();
        drain.advance(window.len());
        consumed.extend_from_slice(&window);

        prop_assert_eq!(consumed, produced);
    }
}

/// Cross-thread FIFO smoke test at a size proptest would make too slow.
#[test]
fn threaded_fifo_with_relocations() {
    let (mut tx, mut rx) = ring(RingTuning { initial_size: 64, multiplier: 1.5 });
    let total: u64 = 50_000;

    let producer = std::thread::spawn(move || {
        for i in 0..total {
            tx.push_bytes(&i.to_le_bytes()).unwrap();
            if i % 13 == 0 {
                tx.publish();
            }
        }
        tx.publish();
    });

    let mut expected: u64 = 0;
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(30);
    while expected < total {
        assert!(std::time::Instant::now() < deadline, "consumer stalled at {expected}");
        let consumed = {
            let drain = rx.begin();
            let window = drain.window();
            let complete = window.len() - (window.len() % 8);
            for chunk in window[..complete].chunks_exact(8) {
                let value = u64::from_le_bytes(chunk.try_into().unwrap());
                assert_eq!(value, expected, "out-of-order delivery");
                expected += 1;
            }
            complete
        };
        let mut drain = rx.begin();
        drain.advance(consumed);
        drop(drain);
        rx.publish_read();
        if consumed == 0 {
            std::hint::spin_loop();
        }
    }
    producer.join().unwrap();
}
