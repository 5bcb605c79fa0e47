/// RTP Playout Buffer
///
/// Reassembles out-of-order, lossy RTP traffic into frames keyed by RTP
/// timestamp and hands each frame to a decoder once its playout time passes.
///
/// Frames live in a `VecDeque` ordered by timestamp. New frames are only ever
/// appended at the back (a packet for an older, never-opened timestamp is
/// discarded) and frames only leave from the front, so the deque gives O(1)
/// append and expiry without linked nodes.

use std::collections::VecDeque;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicI32, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use super::frame::{Frame, FrameUnit, UnitInsert};
use super::packet::PacketRecord;
use super::stats::{ArrivalStats, PlayoutStats, StatsConfig};
use super::ts_cmp;

/// Conservative default: two video frames at 60 fps
pub const DEFAULT_PLAYOUT_DELAY: Duration = Duration::from_millis(32);

/// How long past its playout time an incomplete frame is waited for
pub const DECODE_GRACE: Duration = Duration::from_secs(1);

/// Live operator adjustment to the playout delay, in milliseconds
pub type OffsetKnob = Arc<AtomicI32>;

/// Playout buffer shared between the receive task and the playout task
pub type SharedPlayoutBuffer = Arc<Mutex<PlayoutBuffer>>;

/// Lock a shared buffer. Every operation leaves the buffer consistent, so a
/// poisoned lock is still safe to use.
pub fn lock_buffer(buffer: &Mutex<PlayoutBuffer>) -> MutexGuard<'_, PlayoutBuffer> {
    buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Receives complete (or given-up-on) frames
pub trait Decoder {
    type Output;

    /// `units` are newest-first; `stats` are the session's cumulative counters.
    fn decode(&mut self, units: &[FrameUnit], stats: &PlayoutStats) -> Self::Output;
}

impl<F, R> Decoder for F
where
    F: FnMut(&[FrameUnit], &PlayoutStats) -> R,
{
    type Output = R;

    fn decode(&mut self, units: &[FrameUnit], stats: &PlayoutStats) -> R {
        self(units, stats)
    }
}

/// What `insert` did with a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Opened a new frame at the back of the buffer
    NewFrame,
    /// Filed into an existing frame
    Attached,
    /// Same sequence number already present in the frame
    Duplicate,
    /// Older than the oldest retained frame
    TooOld,
    /// Falls between retained frames but its frame was never opened
    NoSuchFrame,
    /// Allocation failed; packet dropped
    OutOfMemory,
}

impl InsertOutcome {
    pub fn is_accepted(self) -> bool {
        matches!(self, InsertOutcome::NewFrame | InsertOutcome::Attached)
    }
}

impl From<UnitInsert> for InsertOutcome {
    fn from(value: UnitInsert) -> Self {
        match value {
            UnitInsert::Inserted => InsertOutcome::Attached,
            UnitInsert::Duplicate => InsertOutcome::Duplicate,
            UnitInsert::OutOfMemory => InsertOutcome::OutOfMemory,
        }
    }
}

/// Configuration for the playout buffer
#[derive(Debug, Clone)]
pub struct PlayoutBufferConfig {
    /// Fixed delay between a frame's first packet and its playout time
    pub playout_delay: Duration,
    pub stats: StatsConfig,
}

impl Default for PlayoutBufferConfig {
    fn default() -> Self {
        Self {
            playout_delay: DEFAULT_PLAYOUT_DELAY,
            stats: StatsConfig::default(),
        }
    }
}

pub struct PlayoutBuffer {
    frames: VecDeque<Frame>,
    playout_delay: Duration,
    offset_ms: Option<OffsetKnob>,
    stats: ArrivalStats,
    #[cfg(test)]
    fail_allocations: bool,
}

impl PlayoutBuffer {
    pub fn new(config: PlayoutBufferConfig) -> Self {
        Self {
            frames: VecDeque::new(),
            playout_delay: config.playout_delay,
            offset_ms: None,
            stats: ArrivalStats::new(config.stats),
            #[cfg(test)]
            fail_allocations: false,
        }
    }

    /// Attach a live operator offset, read whenever a frame is opened
    pub fn with_offset_knob(mut self, knob: OffsetKnob) -> Self {
        self.offset_ms = Some(knob);
        self
    }

    pub fn set_playout_delay(&mut self, delay: Duration) {
        debug!("Playout delay set to {:?}", delay);
        self.playout_delay = delay;
    }

    pub fn playout_delay(&self) -> Duration {
        self.playout_delay
    }

    /// Insert a packet received now
    pub fn insert(&mut self, packet: PacketRecord) -> InsertOutcome {
        self.insert_at(packet, Instant::now())
    }

    /// Insert a packet that arrived at `now`. Always consumes the packet:
    /// it is either filed into a frame or dropped.
    pub fn insert_at(&mut self, packet: PacketRecord, now: Instant) -> InsertOutcome {
        self.stats.record(packet.seq, packet.timestamp, packet.ssrc);

        let outcome = self.place(packet, now);
        debug_assert!(self.validate(), "playout buffer invariants violated");
        outcome
    }

    fn place(&mut self, packet: PacketRecord, now: Instant) -> InsertOutcome {
        let Some(last) = self.frames.back_mut() else {
            return match self.prepare_frame(packet, now) {
                Some(frame) => self.push_frame(frame),
                None => InsertOutcome::OutOfMemory,
            };
        };

        match ts_cmp(packet.timestamp, last.timestamp()) {
            Ordering::Equal => last.add_unit(packet).into(),
            Ordering::Greater => {
                // Nothing changes unless the new frame could be built
                let Some(frame) = self.prepare_frame(packet, now) else {
                    return InsertOutcome::OutOfMemory;
                };
                // A new frame has started, the previous one gets nothing more
                if let Some(last) = self.frames.back_mut() {
                    last.force_complete();
                }
                self.push_frame(frame)
            }
            Ordering::Less => self.attach_late(packet),
        }
    }

    /// Reserve a slot for a new frame and build it around `packet`
    fn prepare_frame(&mut self, packet: PacketRecord, now: Instant) -> Option<Frame> {
        if self.allocation_fails() || self.frames.try_reserve(1).is_err() {
            warn!("Out of memory opening frame (RTP TS={}), packet dropped", packet.timestamp);
            return None;
        }

        let playout_time = self.playout_time_for(now);
        Frame::open(packet, now, playout_time)
    }

    fn push_frame(&mut self, frame: Frame) -> InsertOutcome {
        trace!("Opened frame RTP TS={}", frame.timestamp());
        self.frames.push_back(frame);
        InsertOutcome::NewFrame
    }

    #[cfg(not(test))]
    fn allocation_fails(&self) -> bool {
        false
    }

    #[cfg(test)]
    fn allocation_fails(&self) -> bool {
        self.fail_allocations
    }

    fn attach_late(&mut self, packet: PacketRecord) -> InsertOutcome {
        let ts = packet.timestamp;
        let too_old = self
            .frames
            .front()
            .map_or(true, |first| ts_cmp(ts, first.timestamp()) == Ordering::Less);
        if too_old {
            debug!("A very old packet - discarded (seq={}, RTP TS={})", packet.seq, ts);
            return Self::discard(packet, InsertOutcome::TooOld);
        }

        trace!("A packet for a previous frame, but might still be useful (RTP TS={})", ts);
        let slot = self
            .frames
            .iter_mut()
            .rev()
            .find(|frame| ts_cmp(frame.timestamp(), ts) != Ordering::Greater);

        match slot {
            Some(frame) if frame.timestamp() == ts => frame.add_unit(packet).into(),
            _ => {
                debug!("Packet for a frame that is not present (seq={}, RTP TS={})", packet.seq, ts);
                Self::discard(packet, InsertOutcome::NoSuchFrame)
            }
        }
    }

    fn discard(packet: PacketRecord, reason: InsertOutcome) -> InsertOutcome {
        if packet.marker {
            debug!("Dropped packet with marker bit set (seq={})", packet.seq);
        }
        reason
    }

    fn playout_time_for(&self, arrival: Instant) -> Instant {
        let offset_ms = self
            .offset_ms
            .as_ref()
            .map_or(0, |knob| knob.load(AtomicOrdering::Relaxed));
        let delay_us = self.playout_delay.as_micros() as i64 + offset_ms as i64 * 1000;
        if delay_us <= 0 {
            return arrival;
        }
        arrival + Duration::from_micros(delay_us as u64)
    }

    /// Decode the oldest undecoded frame whose playout time has passed, if it
    /// is complete. At most one frame is decoded per call. Incomplete frames
    /// more than `DECODE_GRACE` late are forced complete so a later call can
    /// decode whatever did arrive.
    pub fn decode<D: Decoder>(&mut self, now: Instant, decoder: &mut D) -> Option<D::Output> {
        let stats = self.stats.playout_stats();

        for frame in self.frames.iter_mut() {
            if frame.is_decoded() || now <= frame.playout_time() {
                continue;
            }

            if frame.is_complete() {
                let output = decoder.decode(frame.units_contiguous(), &stats);
                frame.mark_decoded();
                return Some(output);
            }

            if now > frame.playout_time() + DECODE_GRACE {
                frame.force_complete();
            }
            debug!(
                "Unable to decode frame due to missing data (RTP TS={})",
                frame.timestamp()
            );
        }

        None
    }

    /// Drop complete frames whose playout time has passed, oldest first.
    /// Stops at the first frame that is not yet eligible. Returns how many
    /// frames were removed.
    pub fn remove_expired(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        while let Some(front) = self.frames.front() {
            if !(front.is_complete() && now > front.playout_time()) {
                break;
            }
            if !front.is_decoded() {
                debug!("Expiring frame that was never decoded (RTP TS={})", front.timestamp());
            }
            self.frames.pop_front();
            removed += 1;
        }
        removed
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Frames oldest-first
    pub fn frames(&self) -> impl DoubleEndedIterator<Item = &Frame> {
        self.frames.iter()
    }

    pub fn stats(&self) -> &ArrivalStats {
        &self.stats
    }

    pub fn playout_stats(&self) -> PlayoutStats {
        self.stats.playout_stats()
    }

    /// Timestamps strictly ascending and every frame's units strictly ordered
    pub fn validate(&self) -> bool {
        let ascending = self
            .frames
            .iter()
            .zip(self.frames.iter().skip(1))
            .all(|(a, b)| ts_cmp(b.timestamp(), a.timestamp()) == Ordering::Greater);
        ascending && self.frames.iter().all(Frame::units_ordered)
    }
}

impl Default for PlayoutBuffer {
    fn default() -> Self {
        Self::new(PlayoutBufferConfig::default())
    }
}

impl Drop for PlayoutBuffer {
    fn drop(&mut self) {
        let totals = self.stats.playout_stats();
        if totals.expected_total > 0 {
            info!(
                "Playout buffer: total {}/{} packets received ({:.5}%)",
                totals.received_total,
                totals.expected_total,
                totals.received_total as f64 / totals.expected_total as f64 * 100.0
            );
        }
    }
}
