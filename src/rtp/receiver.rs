use anyhow::{Context, Result};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::packet::parse_rtp_packet;
use super::pbuf::{lock_buffer, Decoder, InsertOutcome, SharedPlayoutBuffer};
use crate::metrics::SessionMetrics;

/// Largest datagram the receive loop accepts
const MAX_DATAGRAM: usize = 65536;

/// Feeds datagrams from a UDP socket into a shared playout buffer
pub struct RtpReceiver {
    socket: UdpSocket,
    buffer: SharedPlayoutBuffer,
    metrics: Arc<SessionMetrics>,
}

impl RtpReceiver {
    /// Bind to a specific port (or 0 for auto-assign)
    pub async fn bind(port: u16, buffer: SharedPlayoutBuffer, metrics: Arc<SessionMetrics>) -> Result<Self> {
        let addr = format!("0.0.0.0:{}", port);
        let socket = UdpSocket::bind(&addr)
            .await
            .context(format!("Failed to bind RTP socket on {}", addr))?;

        debug!("RTP receiver bound to port {}", port);

        Ok(Self::from_socket(socket, buffer, metrics))
    }

    /// Create from an already-bound socket (avoids port race conditions)
    pub fn from_socket(socket: UdpSocket, buffer: SharedPlayoutBuffer, metrics: Arc<SessionMetrics>) -> Self {
        Self {
            socket,
            buffer,
            metrics,
        }
    }

    pub fn local_port(&self) -> Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Receive until cancelled. Returns the number of datagrams received.
    pub async fn run(&self, cancel_token: CancellationToken) -> Result<u64> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut datagrams: u64 = 0;

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, addr)) => {
                            if datagrams == 0 {
                                info!("First RTP packet received: {} bytes from {}", len, addr);
                            }
                            datagrams += 1;
                            self.process_datagram(&buf[..len]);
                        }
                        Err(e) => {
                            warn!("RTP receive error: {}", e);
                        }
                    }
                }
                _ = cancel_token.cancelled() => {
                    debug!("RTP receive cancelled by shutdown signal");
                    break;
                }
            }
        }

        info!("RTP receive done: {} datagrams received", datagrams);
        Ok(datagrams)
    }

    /// Parse one datagram and hand it to the playout buffer
    pub fn process_datagram(&self, data: &[u8]) -> Option<InsertOutcome> {
        let packet = match parse_rtp_packet(Bytes::copy_from_slice(data)) {
            Ok(packet) => packet,
            Err(e) => {
                trace!("Ignoring malformed RTP datagram: {}", e);
                self.metrics.record_malformed();
                return None;
            }
        };

        let outcome = lock_buffer(&self.buffer).insert(packet);
        self.metrics.record_insert(outcome);
        Some(outcome)
    }
}

/// Drive the playout side: every `tick`, decode every frame that is due,
/// expire what has been played out, and pass the decoder's outputs to `sink`
/// after the buffer lock is released. Returns the number of frames decoded.
pub async fn run_playout<D, S>(
    buffer: SharedPlayoutBuffer,
    mut decoder: D,
    tick: Duration,
    metrics: Arc<SessionMetrics>,
    cancel_token: CancellationToken,
    mut sink: S,
) -> u64
where
    D: Decoder,
    S: FnMut(D::Output),
{
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut decoded_total: u64 = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancel_token.cancelled() => {
                debug!("Playout loop cancelled by shutdown signal");
                break;
            }
        }

        let (outputs, expired) = {
            let mut pbuf = lock_buffer(&buffer);
            let now = Instant::now();
            let mut outputs = Vec::new();
            while let Some(output) = pbuf.decode(now, &mut decoder) {
                outputs.push(output);
            }
            let expired = pbuf.remove_expired(now);
            metrics.update_playout_stats(pbuf.playout_stats());
            (outputs, expired)
        };

        if !outputs.is_empty() {
            trace!("Decoded {} frame(s), expired {}", outputs.len(), expired);
        }
        decoded_total += outputs.len() as u64;
        metrics.record_decoded(outputs.len() as u64);
        metrics.record_expired(expired as u64);

        for output in outputs {
            sink(output);
        }
    }

    info!("Playout done: {} frames decoded", decoded_total);
    decoded_total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::packet::RtpHeader;
    use crate::rtp::pbuf::{PlayoutBuffer, PlayoutBufferConfig};
    use crate::rtp::{FrameUnit, PlayoutStats};
    use bytes::{BufMut, BytesMut};
    use std::sync::Mutex;

    fn shared_buffer(delay: Duration) -> SharedPlayoutBuffer {
        Arc::new(Mutex::new(PlayoutBuffer::new(PlayoutBufferConfig {
            playout_delay: delay,
            ..Default::default()
        })))
    }

    fn datagram(seq: u16, ts: u32, marker: bool) -> Vec<u8> {
        let mut buf = BytesMut::new();
        RtpHeader {
            payload_type: 96,
            marker,
            sequence: seq,
            timestamp: ts,
            ssrc: 0x1234_5678,
        }
        .write_to(&mut buf);
        buf.put_slice(&[seq as u8; 8]);
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_run_immediate_cancel() {
        let receiver = RtpReceiver::bind(0, shared_buffer(Duration::ZERO), Arc::new(SessionMetrics::new()))
            .await
            .unwrap();
        assert_ne!(receiver.local_port().unwrap(), 0);
        let cancel_token = CancellationToken::new();
        cancel_token.cancel();
        assert_eq!(receiver.run(cancel_token).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_process_datagram_counts_outcomes() {
        let buffer = shared_buffer(Duration::from_millis(50));
        let metrics = Arc::new(SessionMetrics::new());
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let receiver = RtpReceiver::from_socket(socket, buffer.clone(), metrics.clone());

        assert_eq!(receiver.process_datagram(&datagram(1, 100, false)), Some(InsertOutcome::NewFrame));
        assert_eq!(receiver.process_datagram(&datagram(2, 100, true)), Some(InsertOutcome::Attached));
        assert_eq!(receiver.process_datagram(&datagram(2, 100, true)), Some(InsertOutcome::Duplicate));
        assert_eq!(receiver.process_datagram(&[0x80, 0x60]), None);

        let s = metrics.snapshot();
        assert_eq!(s.packets_received, 3);
        assert_eq!(s.packets_duplicate, 1);
        assert_eq!(s.packets_malformed, 1);
        assert_eq!(lock_buffer(&buffer).len(), 1);
    }

    #[tokio::test]
    async fn test_playout_decodes_due_frames() {
        let buffer = shared_buffer(Duration::from_millis(5));
        let metrics = Arc::new(SessionMetrics::new());
        {
            let mut pbuf = lock_buffer(&buffer);
            pbuf.insert(crate::rtp::PacketRecord::new(10, 3000, false, vec![1u8]));
            pbuf.insert(crate::rtp::PacketRecord::new(11, 3000, true, vec![2u8]));
            pbuf.insert(crate::rtp::PacketRecord::new(12, 6000, true, vec![3u8]));
        }

        let cancel_token = CancellationToken::new();
        let decoded = Arc::new(Mutex::new(Vec::new()));
        let sink_decoded = decoded.clone();
        let decoder = |units: &[FrameUnit], _: &PlayoutStats| {
            (units[0].packet.timestamp, units.len())
        };
        let handle = tokio::spawn(run_playout(
            buffer.clone(),
            decoder,
            Duration::from_millis(2),
            metrics.clone(),
            cancel_token.clone(),
            move |out| sink_decoded.lock().unwrap().push(out),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel_token.cancel();
        let total = handle.await.unwrap();

        assert_eq!(total, 2);
        assert_eq!(*decoded.lock().unwrap(), vec![(3000, 2), (6000, 1)]);
        assert_eq!(metrics.snapshot().frames_decoded, 2);
        assert!(lock_buffer(&buffer).is_empty());
    }
}
