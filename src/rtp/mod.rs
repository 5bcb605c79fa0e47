//! RTP media path: packet records, the playout buffer, arrival statistics,
//! and the sender-side packetizer whose framing the receiver depends on.

pub mod assembler;
pub mod frame;
pub mod packet;
pub mod packetizer;
pub mod pbuf;
pub mod receiver;
pub mod stats;

pub use assembler::{AssembledFrame, FrameAssembler};
pub use frame::{Frame, FrameUnit};
pub use packet::{parse_rtp_packet, PacketError, PacketRecord, RtpHeader};
pub use pbuf::{Decoder, InsertOutcome, PlayoutBuffer, PlayoutBufferConfig, SharedPlayoutBuffer};
pub use receiver::{run_playout, RtpReceiver};
pub use stats::{ArrivalStats, PlayoutStats, StatsConfig, StatsReport};

use std::cmp::Ordering;

/// Signed distance from `b` to `a` in 16-bit sequence space.
/// Positive means `a` is newer than `b`.
#[inline]
pub fn seq_distance(a: u16, b: u16) -> i16 {
    a.wrapping_sub(b) as i16
}

/// Order two RTP timestamps using 32-bit serial arithmetic.
#[inline]
pub fn ts_cmp(a: u32, b: u32) -> Ordering {
    (a.wrapping_sub(b) as i32).cmp(&0)
}
