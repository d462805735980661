//! Property tests for pacing and frame mutation
//!
//! The token-bucket envelope and the checksum fix-up must hold for
//! arbitrary rates, bursts and templates, not just the handpicked unit
//! cases.

use proptest::prelude::*;

use netblast_stream::bytes::{incremental_update, internet_checksum, read_be_uint, write_be_uint};
use netblast_stream::{MutationDescriptor, Stream, TokenBucket};
use netblast_timer::Timestamp;

fn at(ns: u64) -> Timestamp {
    Timestamp::from_nanos(ns)
}

proptest! {
    /// Packets observed in any interval T never exceed
    /// burst + rate * T + 1.
    #[test]
    fn token_bucket_envelope(
        rate_pps in 1u32..50_000,
        burst in 0u32..64,
        deltas in prop::collection::vec(0u64..2_000_000, 1..200),
    ) {
        let mut bucket = TokenBucket::new(f64::from(rate_pps), burst, at(0));
        let mut now_ns = 0u64;
        let mut admitted = 0u64;
        for delta in deltas {
            now_ns += delta;
            if bucket.consume(1.0, at(now_ns)) {
                admitted += 1;
            }
        }
        let interval_secs = now_ns as f64 / 1e9;
        let envelope = f64::from(burst) + f64::from(rate_pps) * interval_secs + 1.0;
        prop_assert!(
            admitted as f64 <= envelope + 1e-6,
            "admitted {} over envelope {}",
            admitted,
            envelope
        );
    }

    /// Refill with an unchanged clock never changes the balance.
    #[test]
    fn refill_idempotent(
        rate_pps in 0u32..100_000,
        burst in 0u32..256,
        now_ns in 0u64..u64::MAX / 2,
    ) {
        let mut bucket = TokenBucket::new(f64::from(rate_pps), burst, at(0));
        bucket.refill(at(now_ns));
        let first = bucket.tokens();
        bucket.refill(at(now_ns));
        prop_assert_eq!(bucket.tokens(), first);
    }

    /// Incremental update equals a full recompute for any word-aligned
    /// region change.
    #[test]
    fn checksum_incremental_equals_full(
        mut data in prop::collection::vec(1u8..=255, 16..128),
        new_words in prop::collection::vec(any::<u8>(), 8),
    ) {
        if data.len() % 2 != 0 {
            data.push(1);
        }
        // A nonzero word outside the mutated region keeps the sum away
        // from the ones-complement negative-zero representation.
        data[2] = 0x7f;
        let base = internet_checksum(&data);
        let old = data[4..12].to_vec();
        data[4..12].copy_from_slice(&new_words);
        let full = internet_checksum(&data);
        let updated = incremental_update(base, &old, &data[4..12]);
        prop_assert_eq!(updated, full);
    }

    /// Big-endian write/read round-trips for any width.
    #[test]
    fn be_uint_round_trip(value in any::<u64>(), width in 1usize..=8) {
        let mut buf = vec![0u8; width];
        let truncated = if width == 8 {
            value
        } else {
            value & ((1u64 << (width * 8)) - 1)
        };
        write_be_uint(&mut buf, truncated);
        prop_assert_eq!(read_be_uint(&buf), truncated);
    }

    /// Materialized frames always verify their checksum and never touch
    /// the template.
    #[test]
    fn materialize_preserves_template(
        seed in any::<u64>(),
        packets in 1usize..16,
    ) {
        let mut template: Vec<u8> = (0..96).map(|i| ((seed >> (i % 56)) as u8) | 1).collect();
        template[14] = 0;
        template[15] = 0;
        let ck = internet_checksum(&template[16..96]);
        template[14..16].copy_from_slice(&ck.to_be_bytes());

        let mutation = MutationDescriptor {
            seq_offset: Some(16),
            timestamp_offset: Some(24),
            checksum_offset: Some(14),
        };
        let mut stream = Stream::new(
            "prop",
            template.clone(),
            1_000_000.0,
            64,
            mutation,
            at(0),
        ).unwrap();

        let mut buf = [0u8; 96];
        for i in 0..packets {
            let len = stream.materialize(&mut buf, at(seed % 1_000_000_000 + i as u64));
            prop_assert_eq!(len, 96);
            let stored = read_be_uint(&buf[14..16]) as u16;
            prop_assert_eq!(stored, internet_checksum(&buf[16..96]));
            prop_assert_eq!(read_be_uint(&buf[16..24]), i as u64);
        }
        prop_assert_eq!(stream.stats().packets, packets as u64);
    }
}
