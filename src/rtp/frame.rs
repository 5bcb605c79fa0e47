/// Per-frame assembly list
///
/// A frame collects every packet that shares one RTP timestamp. Units are kept
/// newest-first (descending by 16-bit wraparound distance) so the common case
/// of in-order arrival is a push at the head.

use std::collections::VecDeque;
use std::time::Instant;
use tracing::{trace, warn};

use super::packet::PacketRecord;
use super::seq_distance;

/// One packet inside a frame's assembly list
#[derive(Debug, Clone)]
pub struct FrameUnit {
    pub seq: u16,
    pub packet: PacketRecord,
}

/// Result of filing a packet into a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitInsert {
    Inserted,
    Duplicate,
    OutOfMemory,
}

#[derive(Debug)]
pub struct Frame {
    timestamp: u32,
    arrival_time: Instant,
    playout_time: Instant,
    units: VecDeque<FrameUnit>,
    marker_seen: bool,
    forced_complete: bool,
    decoded: bool,
}

impl Frame {
    /// Open a frame around its first packet. Returns `None` (dropping the
    /// packet) if the unit list cannot be allocated.
    pub(crate) fn open(packet: PacketRecord, arrival_time: Instant, playout_time: Instant) -> Option<Self> {
        let mut units = VecDeque::new();
        if units.try_reserve(1).is_err() {
            warn!("Out of memory opening frame (RTP TS={}), packet dropped", packet.timestamp);
            return None;
        }

        let timestamp = packet.timestamp;
        let marker_seen = packet.marker;
        units.push_back(FrameUnit {
            seq: packet.seq,
            packet,
        });

        Some(Self {
            timestamp,
            arrival_time,
            playout_time,
            units,
            marker_seen,
            forced_complete: false,
            decoded: false,
        })
    }

    /// File a packet by sequence number. Duplicates are dropped without
    /// touching the list.
    pub(crate) fn add_unit(&mut self, packet: PacketRecord) -> UnitInsert {
        debug_assert_eq!(packet.timestamp, self.timestamp);

        if self.units.try_reserve(1).is_err() {
            warn!(
                "Out of memory adding unit seq={} to frame (RTP TS={}), packet dropped",
                packet.seq, self.timestamp
            );
            return UnitInsert::OutOfMemory;
        }

        let seq = packet.seq;
        let pos = self
            .units
            .iter()
            .position(|unit| seq_distance(seq, unit.seq) >= 0)
            .unwrap_or(self.units.len());

        if self.units.get(pos).is_some_and(|unit| unit.seq == seq) {
            trace!("Dropping duplicate packet: seq={} (RTP TS={})", seq, self.timestamp);
            return UnitInsert::Duplicate;
        }

        self.marker_seen |= packet.marker;
        self.units.insert(pos, FrameUnit { seq, packet });
        UnitInsert::Inserted
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn arrival_time(&self) -> Instant {
        self.arrival_time
    }

    pub fn playout_time(&self) -> Instant {
        self.playout_time
    }

    /// Units newest-first
    pub fn units(&self) -> impl ExactSizeIterator<Item = &FrameUnit> {
        self.units.iter()
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    pub(crate) fn units_contiguous(&mut self) -> &[FrameUnit] {
        self.units.make_contiguous()
    }

    pub fn marker_seen(&self) -> bool {
        self.marker_seen
    }

    pub fn is_forced_complete(&self) -> bool {
        self.forced_complete
    }

    /// Complete once the marker packet arrived or a heuristic gave up waiting
    pub fn is_complete(&self) -> bool {
        self.marker_seen || self.forced_complete
    }

    pub fn is_decoded(&self) -> bool {
        self.decoded
    }

    pub(crate) fn force_complete(&mut self) {
        self.forced_complete = true;
    }

    pub(crate) fn mark_decoded(&mut self) {
        self.decoded = true;
    }

    /// Units strictly descending with no repeated sequence numbers, all
    /// carrying this frame's timestamp.
    pub(crate) fn units_ordered(&self) -> bool {
        let same_ts = self.units.iter().all(|u| u.packet.timestamp == self.timestamp && u.seq == u.packet.seq);
        let descending = self
            .units
            .iter()
            .zip(self.units.iter().skip(1))
            .all(|(newer, older)| seq_distance(newer.seq, older.seq) > 0);
        same_ts && descending
    }
}
