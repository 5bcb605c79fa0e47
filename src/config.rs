use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::env;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::sync::atomic::AtomicI32;
use std::sync::Arc;
use std::time::Duration;

use crate::rtp::packetizer::{VideoPayloadHeader, CHUNK_ALIGNMENT, TRANSPORT_OVERHEAD};
use crate::rtp::pbuf::OffsetKnob;
use crate::rtp::{PlayoutBufferConfig, StatsConfig};

/// Longest playout delay accepted at startup
const MAX_PLAYOUT_DELAY: Duration = Duration::from_secs(10);

/// Largest UDP payload over IPv4
const MAX_MTU: usize = 65507;

#[derive(Debug, Clone)]
pub struct Config {
    // Receive side
    pub rtp_port: u16,
    pub playout_delay: Duration,
    /// Initial operator offset in ms; when set a live knob is created
    pub playout_offset_ms: Option<i32>,
    pub decode_tick: Duration,

    // Media clock and loss reporting
    pub clock_rate: u32,
    pub stats_report_secs: u32,

    // Send side
    pub remote_addr: Option<String>,
    pub mtu: usize,
    /// Pacing budget in bits/second, 0 = unlimited
    pub send_rate_bps: u64,
    pub frame_width: u16,
    pub frame_height: u16,
    pub frame_fps: u32,

    // Metrics HTTP server port (optional, disabled if not set)
    // When set, exposes /health, /ready, and /metrics endpoints
    pub metrics_port: Option<u16>,
}

fn parse_or<T, F>(get: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match get(key).filter(|s| !s.trim().is_empty()) {
        Some(value) => value
            .trim()
            .parse()
            .ok()
            .with_context(|| format!("{} has an invalid value '{}'", key, value)),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env if present, ignore if missing
        Self::from_getter(|key| env::var(key).ok())
    }

    /// Parse config from a custom getter function (for testing)
    pub fn from_getter<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let delay_ms: f64 = parse_or(&get, "PLAYOUT_DELAY_MS", 32.0)?;
        if !delay_ms.is_finite() || delay_ms < 0.0 {
            bail!("PLAYOUT_DELAY_MS must be a non-negative number of milliseconds");
        }

        Ok(Config {
            rtp_port: parse_or(&get, "RTP_PORT", 5004)?,
            playout_delay: Duration::from_micros((delay_ms * 1000.0).round() as u64),
            playout_offset_ms: get("PLAYOUT_OFFSET_MS")
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.trim().parse())
                .transpose()
                .context("PLAYOUT_OFFSET_MS must be a whole number of milliseconds")?,
            decode_tick: Duration::from_millis(parse_or(&get, "DECODE_TICK_MS", 2)?),

            clock_rate: parse_or(&get, "MEDIA_CLOCK_RATE", 90_000)?,
            stats_report_secs: parse_or(&get, "STATS_REPORT_SECS", 5)?,

            remote_addr: get("REMOTE_ADDR").filter(|s| !s.is_empty()),
            mtu: parse_or(&get, "MTU", 1500)?,
            send_rate_bps: parse_or(&get, "SEND_RATE_BPS", 0)?,
            frame_width: parse_or(&get, "FRAME_WIDTH", 640)?,
            frame_height: parse_or(&get, "FRAME_HEIGHT", 480)?,
            frame_fps: parse_or(&get, "FRAME_FPS", 30)?,

            metrics_port: get("METRICS_PORT").and_then(|s| s.parse().ok()),
        })
    }

    /// Create config from a HashMap (convenience for testing)
    #[cfg(test)]
    pub fn from_map(map: &HashMap<&str, &str>) -> Result<Self> {
        Self::from_getter(|key| map.get(key).map(|v| v.to_string()))
    }

    /// Validate configuration values at startup.
    /// Returns Ok(()) if all validations pass, or Err with details of what failed.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        let min_mtu = TRANSPORT_OVERHEAD + VideoPayloadHeader::LEN + CHUNK_ALIGNMENT;
        if self.mtu < min_mtu {
            errors.push(format!("MTU={} too small (minimum {}).", self.mtu, min_mtu));
        } else if self.mtu > MAX_MTU {
            errors.push(format!("MTU={} exceeds the largest UDP payload ({}).", self.mtu, MAX_MTU));
        }

        if self.clock_rate == 0 {
            errors.push("MEDIA_CLOCK_RATE must be greater than 0.".to_string());
        }

        if self.stats_report_secs == 0 {
            errors.push("STATS_REPORT_SECS must be greater than 0.".to_string());
        }

        if self.playout_delay > MAX_PLAYOUT_DELAY {
            errors.push(format!(
                "PLAYOUT_DELAY_MS={} seems too long (max: {}).",
                self.playout_delay.as_millis(),
                MAX_PLAYOUT_DELAY.as_millis()
            ));
        }

        if self.decode_tick.is_zero() {
            errors.push("DECODE_TICK_MS must be greater than 0.".to_string());
        }

        if !(1..=240).contains(&self.frame_fps) {
            errors.push(format!("FRAME_FPS={} out of range (1-240).", self.frame_fps));
        }

        if self.frame_width == 0 || self.frame_height == 0 {
            errors.push(format!(
                "Frame size {}x{} invalid. Both dimensions must be non-zero.",
                self.frame_width, self.frame_height
            ));
        }

        if let Some(remote) = &self.remote_addr {
            if remote.to_socket_addrs().is_err() {
                errors.push(format!("Cannot resolve REMOTE_ADDR '{}'. Expected host:port.", remote));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )
        }
    }

    pub fn playout_config(&self) -> PlayoutBufferConfig {
        PlayoutBufferConfig {
            playout_delay: self.playout_delay,
            stats: StatsConfig {
                clock_rate: self.clock_rate,
                report_interval_secs: self.stats_report_secs,
            },
        }
    }

    /// A live offset knob seeded from PLAYOUT_OFFSET_MS, if configured
    pub fn offset_knob(&self) -> Option<OffsetKnob> {
        self.playout_offset_ms.map(|ms| Arc::new(AtomicI32::new(ms)))
    }

    /// Resolve REMOTE_ADDR (required in send mode)
    pub fn remote_socket_addr(&self) -> Result<SocketAddr> {
        let remote = self.remote_addr.as_deref().context("REMOTE_ADDR not set")?;
        remote
            .to_socket_addrs()
            .context(format!("Cannot resolve REMOTE_ADDR '{}'", remote))?
            .next()
            .context(format!("REMOTE_ADDR '{}' resolved to no addresses", remote))
    }
}
