/// Session metrics HTTP endpoint
/// Serves /health, /ready and Prometheus /metrics for a receive session

use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::rtp::{InsertOutcome, PlayoutStats};

/// Timeout for reading HTTP request (prevents slow-loris attacks)
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Point-in-time copy of the session counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub packets_received: u64,
    pub packets_malformed: u64,
    pub packets_discarded: u64,
    pub packets_duplicate: u64,
    pub frames_decoded: u64,
    pub frames_expired: u64,
    pub received_total: u64,
    pub expected_total: u64,
}

impl MetricsSnapshot {
    pub fn loss_pct(&self) -> f64 {
        if self.expected_total == 0 {
            return 0.0;
        }
        let lost = self.expected_total.saturating_sub(self.received_total);
        lost as f64 * 100.0 / self.expected_total as f64
    }
}

/// Counters shared between the receive loop, the playout loop and the HTTP server
#[derive(Debug, Default)]
pub struct SessionMetrics {
    packets_received: AtomicU64,
    packets_malformed: AtomicU64,
    packets_discarded: AtomicU64,
    packets_duplicate: AtomicU64,
    frames_decoded: AtomicU64,
    frames_expired: AtomicU64,
    received_total: AtomicU64,
    expected_total: AtomicU64,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a parsed packet by what the playout buffer did with it
    pub fn record_insert(&self, outcome: InsertOutcome) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        if outcome.is_accepted() {
            return;
        }
        if outcome == InsertOutcome::Duplicate {
            self.packets_duplicate.fetch_add(1, Ordering::Relaxed);
        } else {
            self.packets_discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_malformed(&self) {
        self.packets_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decoded(&self, count: u64) {
        self.frames_decoded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_expired(&self, count: u64) {
        self.frames_expired.fetch_add(count, Ordering::Relaxed);
    }

    pub fn update_playout_stats(&self, stats: PlayoutStats) {
        self.received_total.store(stats.received_total, Ordering::Relaxed);
        self.expected_total.store(stats.expected_total, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_malformed: self.packets_malformed.load(Ordering::Relaxed),
            packets_discarded: self.packets_discarded.load(Ordering::Relaxed),
            packets_duplicate: self.packets_duplicate.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            frames_expired: self.frames_expired.load(Ordering::Relaxed),
            received_total: self.received_total.load(Ordering::Relaxed),
            expected_total: self.expected_total.load(Ordering::Relaxed),
        }
    }
}

/// Run the metrics HTTP server
pub async fn run_metrics_server(port: u16, metrics: Arc<SessionMetrics>, cancel_token: CancellationToken) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server on port {}: {}", port, e);
            return;
        }
    };

    info!("Metrics server listening on http://0.0.0.0:{}/metrics", port);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((mut socket, peer_addr)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_request(&mut socket, &metrics).await {
                                debug!("Error handling request from {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                    }
                }
            }
            _ = cancel_token.cancelled() => {
                info!("Metrics server shutting down");
                break;
            }
        }
    }
}

async fn handle_request(socket: &mut tokio::net::TcpStream, metrics: &SessionMetrics) -> std::io::Result<()> {
    let mut buf = [0u8; 1024];

    let n = match timeout(REQUEST_TIMEOUT, socket.read(&mut buf)).await {
        Ok(result) => result?,
        Err(_) => {
            debug!("Request timeout after {:?}", REQUEST_TIMEOUT);
            return Ok(());
        }
    };

    if n == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buf[..n]);
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let snapshot = metrics.snapshot();
    let response = match path {
        "/health" | "/healthz" | "/health/" => build_health_response(&snapshot),
        // Ready once media is flowing
        "/ready" | "/readyz" | "/ready/" => build_ready_response(snapshot.packets_received > 0),
        "/metrics" => build_metrics_response(&snapshot),
        _ => build_not_found_response(),
    };

    socket.write_all(response.as_bytes()).await?;
    socket.flush().await?;

    Ok(())
}

#[derive(Serialize)]
struct HealthBody<'a> {
    status: &'static str,
    #[serde(flatten)]
    metrics: &'a MetricsSnapshot,
}

fn build_health_response(snapshot: &MetricsSnapshot) -> String {
    let body = serde_json::to_string(&HealthBody {
        status: "healthy",
        metrics: snapshot,
    })
    .unwrap_or_else(|_| r#"{"status":"healthy"}"#.to_string());

    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}

fn build_ready_response(ready: bool) -> String {
    let (status_code, status_text, body) = if ready {
        (200, "OK", r#"{"ready":true}"#)
    } else {
        (503, "Service Unavailable", r#"{"ready":false}"#)
    };

    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status_code,
        status_text,
        body.len(),
        body
    )
}

fn build_metrics_response(s: &MetricsSnapshot) -> String {
    let body = format!(
        "# HELP playout_packets_total RTP packets by outcome\n\
         # TYPE playout_packets_total counter\n\
         playout_packets_total{{result=\"received\"}} {}\n\
         playout_packets_total{{result=\"malformed\"}} {}\n\
         playout_packets_total{{result=\"discarded\"}} {}\n\
         playout_packets_total{{result=\"duplicate\"}} {}\n\
         # HELP playout_frames_total Frames leaving the playout buffer\n\
         # TYPE playout_frames_total counter\n\
         playout_frames_total{{result=\"decoded\"}} {}\n\
         playout_frames_total{{result=\"expired\"}} {}\n\
         # HELP playout_sequence_received_total Sequence numbers seen in folded windows\n\
         # TYPE playout_sequence_received_total counter\n\
         playout_sequence_received_total {}\n\
         # HELP playout_sequence_expected_total Sequence numbers expected in folded windows\n\
         # TYPE playout_sequence_expected_total counter\n\
         playout_sequence_expected_total {}\n\
         # HELP playout_loss_ratio Fraction of expected packets never received\n\
         # TYPE playout_loss_ratio gauge\n\
         playout_loss_ratio {:.6}\n",
        s.packets_received,
        s.packets_malformed,
        s.packets_discarded,
        s.packets_duplicate,
        s.frames_decoded,
        s.frames_expired,
        s.received_total,
        s.expected_total,
        s.loss_pct() / 100.0
    );

    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}

fn build_not_found_response() -> String {
    let body = r#"{"error":"Not Found"}"#;
    format!(
        "HTTP/1.1 404 Not Found\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}
