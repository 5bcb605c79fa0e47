//! Adversarial Property-Based Tests for RTP Packet Handling
//!
//! # Attack Plan
//!
//! 1. **Malformed RTP Headers**: Truncated packets, wrong version, CSRC counts
//!    and extension lengths pointing past the end of the datagram, bogus padding.
//!
//! 2. **Malformed Payload Headers**: Video chunks shorter than their header, or
//!    with offsets far beyond the tile they claim to belong to.
//!
//! 3. **Sequence and Timestamp Wraparound**: 65535 -> 0 and 2^32 - 1 -> 0
//!    transitions must keep frames and units ordered.
//!
//! 4. **Buffer Abuse**: Duplicate storms, stale packets, timestamps jumping
//!    backwards, decode/expire calls interleaved with inserts at arbitrary times.
//!
//! # Invariants
//!
//! - parse_rtp_packet never panics on any input and rejects non-v2 packets
//! - VideoPayloadHeader::parse never panics
//! - The playout buffer never panics and always validates
//! - The frame assembler never panics on arbitrary unit payloads

use bytes::Bytes;
use proptest::prelude::*;
use std::time::{Duration, Instant};

use playout::resource::ResourceManager;
use playout::rtp::packetizer::VideoPayloadHeader;
use playout::rtp::{
    parse_rtp_packet, Decoder, FrameAssembler, FrameUnit, PacketError, PacketRecord, PlayoutBuffer,
    PlayoutBufferConfig, PlayoutStats,
};

// ============================================================================
// ADVERSARIAL GENERATORS
// ============================================================================

/// Generate malformed RTP packets
fn malformed_rtp_packet() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        // Too short
        Just(vec![]),
        Just(vec![0x80]),
        Just(vec![0x80, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00]), // 11 bytes
        // Wrong version (0, 1, 3)
        Just(vec![0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x01]),
        Just(vec![0x40, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x01]),
        Just(vec![0xC0, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x01]),
        // Max CSRC count (15) but no CSRC data
        Just(vec![0x8F, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x01]),
        // Extension bit set but no extension data
        Just(vec![0x90, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x01]),
        // Extension with bogus length (claims 65535 32-bit words)
        Just(vec![
            0x90, 0x00, // V=2, X=1
            0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x01,
            0xBE, 0xDE, // Extension header ID
            0xFF, 0xFF, // Extension length = 65535 words
        ]),
        // Padding bit set, padding count larger than the payload
        Just(vec![0xA0, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x01, 0xAA, 0xFF]),
        // Padding bit set with a zero count
        Just(vec![0xA0, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x01, 0x00]),
        // All bits set
        Just(vec![0xFF; 100]),
        // All zeros
        Just(vec![0x00; 100]),
    ]
}

/// One step against a playout buffer
#[derive(Debug, Clone)]
enum Op {
    Insert { seq: u16, ts: u32, marker: bool, at_ms: u64 },
    Decode { at_ms: u64 },
    Expire { at_ms: u64 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (any::<u16>(), any::<u32>(), any::<bool>(), 0u64..5_000)
            .prop_map(|(seq, ts, marker, at_ms)| Op::Insert { seq, ts, marker, at_ms }),
        // Narrow ranges so packets actually collide into shared frames
        6 => (0u16..32, 0u32..8, any::<bool>(), 0u64..5_000)
            .prop_map(|(seq, ts, marker, at_ms)| Op::Insert {
                seq: seq.wrapping_sub(16),
                ts: ts.wrapping_sub(4).wrapping_mul(3000),
                marker,
                at_ms,
            }),
        2 => (0u64..5_000).prop_map(|at_ms| Op::Decode { at_ms }),
        1 => (0u64..5_000).prop_map(|at_ms| Op::Expire { at_ms }),
    ]
}

// ============================================================================
// INVARIANT: PARSERS NEVER PANIC
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(10000))]

    #[test]
    fn prop_parse_rtp_packet_never_panics(data in proptest::collection::vec(any::<u8>(), 0..200)) {
        let _ = parse_rtp_packet(Bytes::from(data));
    }

    #[test]
    fn prop_parse_rtp_packet_malformed_rejected(data in malformed_rtp_packet()) {
        prop_assert!(parse_rtp_packet(Bytes::from(data)).is_err());
    }

    #[test]
    fn prop_video_header_parse_never_panics(data in proptest::collection::vec(any::<u8>(), 0..64)) {
        match VideoPayloadHeader::parse(&data) {
            Ok((_, rest)) => prop_assert_eq!(rest.len(), data.len() - VideoPayloadHeader::LEN),
            Err(e) => prop_assert!(matches!(e, PacketError::PayloadHeaderTruncated { .. }), "unexpected error variant"),
        }
    }

    /// Payload always lies within the datagram
    #[test]
    fn prop_payload_within_datagram(data in proptest::collection::vec(any::<u8>(), 12..300)) {
        let len = data.len();
        if let Ok(record) = parse_rtp_packet(Bytes::from(data)) {
            prop_assert!(record.payload.len() <= len - 12);
        }
    }
}

// ============================================================================
// INVARIANT: VERSION CHECK
// ============================================================================

#[test]
fn test_rejects_all_non_v2_versions() {
    let base_packet = [0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x01];

    for version in [0u8, 1, 3] {
        let mut packet = base_packet;
        packet[0] = (version << 6) | (packet[0] & 0x3F);
        assert_eq!(
            parse_rtp_packet(Bytes::copy_from_slice(&packet)).unwrap_err(),
            PacketError::UnsupportedVersion(version),
            "Version {} should be rejected",
            version
        );
    }
}

#[test]
fn test_csrc_and_extension_skipped() {
    let mut packet = vec![0x91, 0x80, 0x00, 0x07, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x01];
    packet.extend_from_slice(&[0, 0, 0, 2]); // one CSRC
    packet.extend_from_slice(&[0xBE, 0xDE, 0x00, 0x01, 0, 0, 0, 0]); // one-word extension
    packet.push(0xAA);

    let record = parse_rtp_packet(Bytes::from(packet)).unwrap();
    assert_eq!(record.seq, 7);
    assert!(record.marker);
    assert_eq!(&record.payload[..], &[0xAA]);
}

// ============================================================================
// INVARIANT: BUFFER NEVER PANICS, ALWAYS VALIDATES
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn prop_buffer_survives_arbitrary_ops(ops in proptest::collection::vec(op_strategy(), 0..300)) {
        let t0 = Instant::now();
        let mut buf = PlayoutBuffer::new(PlayoutBufferConfig {
            playout_delay: Duration::from_millis(32),
            ..Default::default()
        });
        let mut decoder = |units: &[FrameUnit], _: &PlayoutStats| units.len();

        // Time never runs backwards for the buffer
        let mut clock = 0u64;
        for op in ops {
            match op {
                Op::Insert { seq, ts, marker, at_ms } => {
                    clock = clock.max(at_ms);
                    let packet = PacketRecord::new(seq, ts, marker, Bytes::from_static(b"x"));
                    buf.insert_at(packet, t0 + Duration::from_millis(clock));
                }
                Op::Decode { at_ms } => {
                    clock = clock.max(at_ms);
                    if let Some(units) = buf.decode(t0 + Duration::from_millis(clock), &mut decoder) {
                        prop_assert!(units > 0);
                    }
                }
                Op::Expire { at_ms } => {
                    clock = clock.max(at_ms);
                    buf.remove_expired(t0 + Duration::from_millis(clock));
                }
            }
            prop_assert!(buf.validate());
        }

        let stats = buf.playout_stats();
        prop_assert!(stats.received_total <= stats.expected_total);
    }

    #[test]
    fn prop_duplicate_storm_keeps_one_copy(seq in any::<u16>(), copies in 2usize..50) {
        let mut buf = PlayoutBuffer::default();
        let now = Instant::now();
        for _ in 0..copies {
            buf.insert_at(PacketRecord::new(seq, 1000, false, Bytes::from_static(b"x")), now);
        }
        prop_assert_eq!(buf.len(), 1);
        prop_assert_eq!(buf.frames().next().map(|f| f.unit_count()), Some(1));
    }
}

#[test]
fn test_wraparound_frames_stay_ordered() {
    let mut buf = PlayoutBuffer::default();
    let now = Instant::now();
    let mut seq: u16 = 65530;
    let mut ts: u32 = u32::MAX - 6000;
    for _ in 0..5 {
        for i in 0..3 {
            buf.insert_at(PacketRecord::new(seq, ts, i == 2, Bytes::from_static(b"x")), now);
            seq = seq.wrapping_add(1);
        }
        ts = ts.wrapping_add(3000);
    }
    assert!(buf.validate());
    assert_eq!(buf.len(), 5);
    assert!(buf.frames().all(|f| f.unit_count() == 3 && f.is_complete()));
}

// ============================================================================
// INVARIANT: ASSEMBLER NEVER PANICS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    #[test]
    fn prop_assembler_survives_garbage(
        payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..120), 1..8)
    ) {
        let manager = ResourceManager::new();
        let mut assembler = FrameAssembler::new(&manager);
        let units: Vec<FrameUnit> = payloads
            .into_iter()
            .enumerate()
            .map(|(i, p)| FrameUnit {
                seq: i as u16,
                packet: PacketRecord::new(i as u16, 0, false, p),
            })
            .collect();
        let _ = assembler.decode(&units, &PlayoutStats::default());
    }
}
