//! TP segmentation and reassembly invariants.

use bytes::Bytes;
use fabricip::tp::{segment, Reassembler, Reassembly, ReassemblyKey, TpHeader, TP_UNIT};
use proptest::prelude::*;

fn key() -> ReassemblyKey {
    ReassemblyKey {
        service_id: 0x1001,
        method_id: 0x0002,
        client_id: 0x0000,
        session_id: 0x0001,
    }
}

proptest! {
    /// reassemble(segment(P, M)) == P, delivered exactly once
    #[test]
    fn segmentation_roundtrips(
        data in prop::collection::vec(any::<u8>(), 0..6000),
        max_segment in 16usize..2048,
    ) {
        let payload = Bytes::from(data);
        let segments = segment(&payload, max_segment);

        // every non-final segment is 16-byte aligned and maximal
        for (tp, chunk) in &segments[..segments.len() - 1] {
            prop_assert!(tp.more);
            prop_assert_eq!(chunk.len() % TP_UNIT, 0);
            prop_assert_eq!(chunk.len(), (max_segment / TP_UNIT) * TP_UNIT);
        }
        prop_assert!(!segments.last().unwrap().0.more);

        let mut reassembler = Reassembler::new();
        let mut delivered = Vec::new();
        for (tp, chunk) in segments {
            if let Reassembly::Complete(full) = reassembler.process(key(), tp, chunk) {
                delivered.push(full);
            }
        }
        prop_assert_eq!(delivered.len(), 1);
        prop_assert_eq!(delivered.remove(0), payload);
        prop_assert!(reassembler.is_empty());
    }

    /// Reassembly does not depend on segment arrival order
    #[test]
    fn reassembly_is_permutation_invariant(
        (data, order) in prop::collection::vec(any::<u8>(), 1..4000)
            .prop_flat_map(|data| {
                let count = segment(&Bytes::from(data.clone()), 256).len();
                (Just(data), Just((0..count).collect::<Vec<_>>()).prop_shuffle())
            }),
    ) {
        let payload = Bytes::from(data);
        let segments = segment(&payload, 256);

        let mut reassembler = Reassembler::new();
        let mut delivered = Vec::new();
        for index in order {
            let (tp, chunk) = segments[index].clone();
            if let Reassembly::Complete(full) = reassembler.process(key(), tp, chunk) {
                delivered.push(full);
            }
        }
        prop_assert_eq!(delivered.len(), 1);
        prop_assert_eq!(delivered.remove(0), payload);
    }

    /// A misaligned non-final segment kills the transfer for good
    #[test]
    fn misaligned_segment_drops_the_session(trim in 1usize..16) {
        let payload = Bytes::from(vec![0x5Au8; 1024]);
        let segments = segment(&payload, 256);
        prop_assert!(segments.len() > 2);

        let mut reassembler = Reassembler::new();

        // feed the first segment intact, then a truncated second one
        let (tp0, chunk0) = segments[0].clone();
        prop_assert_eq!(reassembler.process(key(), tp0, chunk0), Reassembly::Pending);

        let (tp1, chunk1) = segments[1].clone();
        let truncated = chunk1.slice(..chunk1.len() - trim);
        prop_assert_eq!(
            reassembler.process(key(), tp1, truncated),
            Reassembly::Malformed
        );
        prop_assert!(reassembler.is_empty());

        // the remaining segments can no longer complete the transfer
        for (tp, chunk) in segments.into_iter().skip(2) {
            prop_assert_eq!(reassembler.process(key(), tp, chunk), Reassembly::Pending);
        }
    }
}

/// The spec-sized case: 5000 patterned bytes survive segmentation at the
/// default datagram budget
#[test]
fn five_thousand_byte_pattern_roundtrips() {
    let payload: Bytes = (0..5000usize)
        .map(|i| (i % 256) as u8)
        .collect::<Vec<_>>()
        .into();

    let mut reassembler = Reassembler::new();
    let mut result = None;
    for (tp, chunk) in segment(&payload, 1400) {
        if let Reassembly::Complete(full) = reassembler.process(key(), tp, chunk) {
            result = Some(full);
        }
    }

    let full = result.expect("reassembly completes");
    assert_eq!(full.len(), 5000);
    for (i, byte) in full.iter().enumerate() {
        assert_eq!(*byte, (i % 256) as u8);
    }
}

/// Wire encoding of the TP header: offset in 16-byte units shifted left
/// by four, more flag in bit 0
#[test]
fn tp_header_bit_layout() {
    let mut buf = bytes::BytesMut::new();
    TpHeader::new(4096, true).serialize(&mut buf);
    assert_eq!(&buf[..], &[0x00, 0x00, 0x10, 0x01]);

    let parsed = TpHeader::parse(&mut buf.freeze()).unwrap();
    assert_eq!(parsed.offset, 4096);
    assert!(parsed.more);
}
