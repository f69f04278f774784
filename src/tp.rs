//! # SOME/IP-TP Segmentation
//!
//! In-band segmentation and reassembly for payloads that exceed the
//! datagram MTU. A TP message carries a 4-byte header between the SOME/IP
//! header and the segment payload:
//!
//! ```text
//! +----------------------------------+--------+-------+
//! |          Offset (28 bits)        | Res(3) | More  |
//! +----------------------------------+--------+-------+
//! ```
//!
//! The offset is counted in 16-byte units, so every non-final segment must
//! carry a payload that is a multiple of 16 bytes. Reassembly is keyed by
//! (service, method, client, session) and tolerates arbitrary segment
//! ordering; the expected total length is derived from the final segment.
//!
//! This module holds no timers. The reactor evicts reassembly state that
//! has been idle too long via [`Reassembler::evict_idle`].

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the TP header in bytes
pub const TP_HEADER_SIZE: usize = 4;

/// Segment granularity: non-final segments are multiples of this
pub const TP_UNIT: usize = 16;

/// Default maximum segment payload: MTU (1500) minus IP (20), UDP (8),
/// SOME/IP header (16) and TP header (4), rounded down to a 16-byte unit.
pub const DEFAULT_MAX_SEGMENT: usize = 1392;

/// TP header carrying the byte offset of a segment and the more flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpHeader {
    /// Byte offset of this segment in the original payload (multiple of 16)
    pub offset: u32,
    /// True when further segments follow
    pub more: bool,
}

impl TpHeader {
    pub fn new(offset: u32, more: bool) -> Self {
        Self { offset, more }
    }

    /// Parse the 4-byte TP header
    pub fn parse(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < TP_HEADER_SIZE {
            return None;
        }
        let value = buf.get_u32();
        Some(Self {
            offset: (value >> 4) * TP_UNIT as u32,
            more: value & 0x1 != 0,
        })
    }

    /// Serialize to the wire encoding: `(offset/16) << 4 | more`
    pub fn serialize(&self, buf: &mut impl BufMut) {
        let value = (self.offset / TP_UNIT as u32) << 4 | u32::from(self.more);
        buf.put_u32(value);
    }
}

/// Partition a payload into TP segments of at most `max_segment` bytes.
///
/// Non-final segment sizes are rounded down to a multiple of 16; the final
/// segment carries the remainder. A payload that already fits yields a
/// single segment with the more flag cleared.
///
/// # Panics
///
/// Panics if `max_segment` is below 16, which cannot produce valid
/// non-final segments.
pub fn segment(payload: &Bytes, max_segment: usize) -> Vec<(TpHeader, Bytes)> {
    let chunk = (max_segment / TP_UNIT) * TP_UNIT;
    assert!(chunk > 0, "max_segment must be at least 16");

    let mut segments = Vec::with_capacity(payload.len() / chunk + 1);
    let mut offset = 0usize;

    loop {
        let remaining = payload.len() - offset;
        let (size, more) = if remaining > chunk {
            (chunk, true)
        } else {
            (remaining, false)
        };
        segments.push((
            TpHeader::new(offset as u32, more),
            payload.slice(offset..offset + size),
        ));
        offset += size;
        if !more {
            break;
        }
    }

    segments
}

/// Prepend a TP header to a segment payload
pub fn encode_segment(header: TpHeader, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(TP_HEADER_SIZE + data.len());
    header.serialize(&mut buf);
    buf.extend_from_slice(data);
    buf.freeze()
}

/// Reassembly key: one in-flight transfer per request/response stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReassemblyKey {
    pub service_id: u16,
    pub method_id: u16,
    pub client_id: u16,
    pub session_id: u16,
}

/// Outcome of feeding one segment to the reassembler
#[derive(Debug, PartialEq, Eq)]
pub enum Reassembly {
    /// All segments arrived; the full payload is delivered exactly once
    Complete(Bytes),
    /// More segments outstanding
    Pending,
    /// The segment was invalid; the whole transfer was discarded
    Malformed,
}

struct Transfer {
    /// Received segments by byte offset; duplicates overwrite
    segments: BTreeMap<u32, Bytes>,
    /// Total length, known once the final segment arrived
    final_len: Option<u32>,
    last_activity: Instant,
}

impl Transfer {
    fn new() -> Self {
        Self {
            segments: BTreeMap::new(),
            final_len: None,
            last_activity: Instant::now(),
        }
    }

    /// Concatenate if the received segments form exactly the full payload
    fn try_complete(&self) -> Option<Bytes> {
        let final_len = self.final_len?;

        let mut expected_offset = 0u32;
        for (&offset, data) in &self.segments {
            if offset != expected_offset {
                return None;
            }
            expected_offset += data.len() as u32;
        }
        if expected_offset != final_len {
            return None;
        }

        let mut full = BytesMut::with_capacity(final_len as usize);
        for data in self.segments.values() {
            full.extend_from_slice(data);
        }
        Some(full.freeze())
    }
}

/// Out-of-order reassembler for TP transfers
#[derive(Default)]
pub struct Reassembler {
    transfers: HashMap<ReassemblyKey, Transfer>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of in-flight transfers
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Feed one segment.
    ///
    /// A non-final segment whose payload is not 16-byte aligned poisons the
    /// transfer: its state is dropped and later segments of the same key
    /// start a fresh (and incomplete) transfer.
    pub fn process(&mut self, key: ReassemblyKey, header: TpHeader, data: Bytes) -> Reassembly {
        if header.more && (data.is_empty() || data.len() % TP_UNIT != 0) {
            self.transfers.remove(&key);
            return Reassembly::Malformed;
        }

        let transfer = self.transfers.entry(key).or_insert_with(Transfer::new);
        transfer.last_activity = Instant::now();
        transfer.segments.insert(header.offset, data.clone());
        if !header.more {
            transfer.final_len = Some(header.offset + data.len() as u32);
        }

        match transfer.try_complete() {
            Some(full) => {
                self.transfers.remove(&key);
                Reassembly::Complete(full)
            }
            None => Reassembly::Pending,
        }
    }

    /// Drop the state of one transfer
    pub fn abort(&mut self, key: &ReassemblyKey) {
        self.transfers.remove(key);
    }

    /// Drop transfers with no activity for `max_idle`
    pub fn evict_idle(&mut self, max_idle: Duration) {
        let now = Instant::now();
        self.transfers
            .retain(|_, t| now.duration_since(t.last_activity) < max_idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ReassemblyKey {
        ReassemblyKey {
            service_id: 0x1001,
            method_id: 0x0001,
            client_id: 0x0000,
            session_id: 0x0007,
        }
    }

    fn patterned(len: usize) -> Bytes {
        (0..len).map(|i| (i % 256) as u8).collect::<Vec<_>>().into()
    }

    #[test_log::test]
    fn tp_header_wire_encoding() {
        let header = TpHeader::new(32, true);
        let mut buf = BytesMut::new();
        header.serialize(&mut buf);
        // offset 32 bytes = 2 units, shifted left by 4, more bit set
        assert_eq!(&buf[..], &[0x00, 0x00, 0x00, 0x21]);

        let parsed = TpHeader::parse(&mut buf.freeze()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test_log::test]
    fn segment_sizes_are_aligned() {
        let payload = patterned(5000);
        let segments = segment(&payload, 1400);

        // 1400 rounds down to 1392
        for (tp, data) in &segments[..segments.len() - 1] {
            assert!(tp.more);
            assert_eq!(data.len(), 1392);
            assert_eq!(tp.offset as usize % TP_UNIT, 0);
        }
        let (last, last_data) = segments.last().unwrap();
        assert!(!last.more);
        assert_eq!(last.offset, 3 * 1392);
        assert_eq!(last_data.len(), 5000 - 3 * 1392);
    }

    #[test_log::test]
    fn empty_payload_yields_one_final_segment() {
        let segments = segment(&Bytes::new(), 1392);
        assert_eq!(segments.len(), 1);
        assert!(!segments[0].0.more);
        assert!(segments[0].1.is_empty());
    }

    #[test_log::test]
    fn reassembles_in_order() {
        let payload = patterned(5000);
        let mut reassembler = Reassembler::new();

        let mut result = Reassembly::Pending;
        for (tp, data) in segment(&payload, 1392) {
            result = reassembler.process(key(), tp, data);
        }

        assert_eq!(result, Reassembly::Complete(payload));
        assert!(reassembler.is_empty());
    }

    #[test_log::test]
    fn reassembles_out_of_order() {
        let payload = patterned(4000);
        let mut reassembler = Reassembler::new();

        let mut segments = segment(&payload, 512);
        segments.reverse();

        let mut completed = None;
        for (tp, data) in segments {
            if let Reassembly::Complete(full) = reassembler.process(key(), tp, data) {
                completed = Some(full);
            }
        }

        assert_eq!(completed, Some(payload));
        assert!(reassembler.is_empty());
    }

    #[test_log::test]
    fn last_segment_first_stays_pending_until_gap_filled() {
        let payload = patterned(100);
        let mut reassembler = Reassembler::new();
        let segments = segment(&payload, 64);
        assert_eq!(segments.len(), 2);

        let (last, last_data) = segments[1].clone();
        assert_eq!(
            reassembler.process(key(), last, last_data),
            Reassembly::Pending
        );
        let (first, first_data) = segments[0].clone();
        assert_eq!(
            reassembler.process(key(), first, first_data),
            Reassembly::Complete(payload)
        );
    }

    #[test_log::test]
    fn misaligned_non_final_segment_poisons_the_transfer() {
        let mut reassembler = Reassembler::new();

        // valid first segment
        assert_eq!(
            reassembler.process(key(), TpHeader::new(0, true), patterned(32)),
            Reassembly::Pending
        );

        // 30 bytes is not a multiple of 16
        assert_eq!(
            reassembler.process(key(), TpHeader::new(32, true), patterned(30)),
            Reassembly::Malformed
        );
        assert!(reassembler.is_empty());

        // the final segment alone can no longer complete the transfer
        assert_eq!(
            reassembler.process(key(), TpHeader::new(64, false), patterned(10)),
            Reassembly::Pending
        );
    }

    #[test_log::test]
    fn distinct_keys_are_independent(){
        let payload = patterned(64);
        let mut reassembler = Reassembler::new();

        let other = ReassemblyKey {
            session_id: 0x0008,
            ..key()
        };

        assert_eq!(
            reassembler.process(key(), TpHeader::new(0, true), payload.slice(..32)),
            Reassembly::Pending
        );
        assert_eq!(
            reassembler.process(other, TpHeader::new(0, false), payload.slice(..16)),
            Reassembly::Complete(payload.slice(..16))
        );
        assert_eq!(reassembler.len(), 1);
    }

    #[test_log::test]
    fn idle_transfers_are_evicted() {
        let mut reassembler = Reassembler::new();
        reassembler.process(key(), TpHeader::new(0, true), patterned(16));
        assert_eq!(reassembler.len(), 1);

        reassembler.evict_idle(Duration::from_secs(3600));
        assert_eq!(reassembler.len(), 1);

        reassembler.evict_idle(Duration::ZERO);
        assert!(reassembler.is_empty());
    }
}
