/// Arrival statistics
///
/// A 65536-bit circular bitmap indexed by sequence number records which
/// packets arrived. Completed windows of `STATS_WINDOW` sequence numbers are
/// folded into received/expected counters, and a loss report is emitted every
/// few seconds of media time. Purely observational: nothing here feeds back
/// into insertion, and all arithmetic wraps.

use serde::Serialize;
use std::fmt;
use tracing::info;

/// Sequence numbers folded together
pub const STATS_WINDOW: u16 = 128;

const WORD_BITS: u16 = u64::BITS as u16;
const BITMAP_WORDS: usize = (1 << 16) / WORD_BITS as usize;

const _: () = assert!(STATS_WINDOW % WORD_BITS == 0);

#[derive(Debug, Clone)]
pub struct StatsConfig {
    /// Media clock rate in Hz (90 kHz for video)
    pub clock_rate: u32,
    /// Report cadence in seconds of media time
    pub report_interval_secs: u32,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            clock_rate: 90_000,
            report_interval_secs: 5,
        }
    }
}

/// Cumulative counters handed to the decoder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlayoutStats {
    pub received_total: u64,
    pub expected_total: u64,
}

/// Periodic loss report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsReport {
    pub ssrc: u32,
    pub received: u64,
    pub expected: u64,
    pub longest_gap: u32,
    pub reordered: bool,
    pub duplicates: bool,
}

impl StatsReport {
    pub fn received_pct(&self) -> f64 {
        if self.expected == 0 {
            return 100.0;
        }
        self.received as f64 / self.expected as f64 * 100.0
    }

    pub fn loss_pct(&self) -> f64 {
        100.0 - self.received_pct()
    }

    pub fn lost(&self) -> u64 {
        self.expected.saturating_sub(self.received)
    }
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SSRC {:08x}: {}/{} packets received ({:.4}%), {} lost, max loss {}{}{}",
            self.ssrc,
            self.received,
            self.expected,
            self.received_pct(),
            self.lost(),
            self.longest_gap,
            if self.reordered { ", reordered pkts" } else { "" },
            if self.duplicates { ", dups" } else { "" },
        )
    }
}

pub struct ArrivalStats {
    config: StatsConfig,
    packets: Box<[u64]>,
    /// Window-aligned sequence number up to which the bitmap has been folded
    last_report_seq: Option<u16>,
    last_report_ts: Option<u32>,
    // since the last report
    received: u64,
    expected: u64,
    longest_gap: u32,
    reordered: bool,
    duplicates: bool,
    cumulative: PlayoutStats,
}

impl ArrivalStats {
    pub fn new(config: StatsConfig) -> Self {
        Self {
            config,
            packets: vec![0u64; BITMAP_WORDS].into_boxed_slice(),
            last_report_seq: None,
            last_report_ts: None,
            received: 0,
            expected: 0,
            longest_gap: 0,
            reordered: false,
            duplicates: false,
            cumulative: PlayoutStats::default(),
        }
    }

    /// Record one arrival. Returns a report when the interval elapsed.
    pub fn record(&mut self, seq: u16, timestamp: u32, ssrc: u32) -> Option<StatsReport> {
        let cursor = match self.last_report_seq {
            Some(cursor) => cursor,
            None => {
                // Treat the part of the first window before `seq` as received
                let start = seq / STATS_WINDOW * STATS_WINDOW;
                let mut i = start;
                while i != seq {
                    self.set_bit(i);
                    i = i.wrapping_add(1);
                }
                self.last_report_seq = Some(start);
                self.last_report_ts = Some(timestamp);
                start
            }
        };

        let (idx, bit) = Self::slot(seq);
        let word = self.packets[idx];
        if (word & !bit) > bit {
            self.reordered = true;
        }
        if word & bit != 0 {
            self.duplicates = true;
        }
        self.packets[idx] |= bit;

        let ahead = seq.wrapping_sub(cursor);
        if ahead >= STATS_WINDOW * 2 && ahead < 0x8000 {
            // Stop one window short so late packets can still land
            let until = (seq / STATS_WINDOW * STATS_WINDOW).wrapping_sub(STATS_WINDOW);
            self.fold(cursor, until);
            self.last_report_seq = Some(until);
        }

        self.maybe_report(timestamp, ssrc)
    }

    fn fold(&mut self, from: u16, until: u16) {
        let mut i = from;
        while i != until {
            let idx = (i / WORD_BITS) as usize;
            let word = self.packets[idx];
            let received = word.count_ones() as u64;

            self.expected += WORD_BITS as u64;
            self.received += received;
            self.cumulative.expected_total += WORD_BITS as u64;
            self.cumulative.received_total += received;
            self.longest_gap = self.longest_gap.max(longest_zero_run(word));

            self.packets[idx] = 0;
            i = i.wrapping_add(WORD_BITS);
        }
    }

    fn maybe_report(&mut self, timestamp: u32, ssrc: u32) -> Option<StatsReport> {
        let last_ts = self.last_report_ts?;
        let interval = self.config.clock_rate.saturating_mul(self.config.report_interval_secs);
        // Serial arithmetic: a late packet from before the last report is negative
        let elapsed = timestamp.wrapping_sub(last_ts) as i32;
        if elapsed <= 0 || (elapsed as u32) < interval || self.expected == 0 {
            return None;
        }

        let report = StatsReport {
            ssrc,
            received: self.received,
            expected: self.expected,
            longest_gap: self.longest_gap,
            reordered: self.reordered,
            duplicates: self.duplicates,
        };
        info!("{}", report);

        self.received = 0;
        self.expected = 0;
        self.longest_gap = 0;
        self.reordered = false;
        self.duplicates = false;
        self.last_report_ts = Some(timestamp);

        Some(report)
    }

    fn set_bit(&mut self, seq: u16) {
        let (idx, bit) = Self::slot(seq);
        self.packets[idx] |= bit;
    }

    #[inline]
    fn slot(seq: u16) -> (usize, u64) {
        ((seq / WORD_BITS) as usize, 1u64 << (seq % WORD_BITS))
    }

    /// Cumulative totals for the session
    pub fn playout_stats(&self) -> PlayoutStats {
        self.cumulative
    }

    pub fn reordered(&self) -> bool {
        self.reordered
    }

    pub fn duplicates(&self) -> bool {
        self.duplicates
    }

    pub fn longest_gap(&self) -> u32 {
        self.longest_gap
    }
}

impl Default for ArrivalStats {
    fn default() -> Self {
        Self::new(StatsConfig::default())
    }
}

/// Longest run of zero bits in a 64-bit word.
///
/// The leading run comes from `leading_zeros`. Shifting right one bit at a
/// time exposes every other run (trailing and interior) as the trailing-zero
/// count of the shifted word.
pub fn longest_zero_run(mut word: u64) -> u32 {
    if word == 0 {
        return u64::BITS;
    }
    if word == u64::MAX {
        return 0;
    }

    let mut longest = word.leading_zeros();
    while word != 0 {
        longest = longest.max(word.trailing_zeros());
        word >>= 1;
    }
    longest
}
