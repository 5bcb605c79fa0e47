use anyhow::{Context, Result};
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use playout::cli::{parse_args, print_help};
use playout::config::Config;
use playout::metrics::{run_metrics_server, SessionMetrics};
use playout::resource::ResourceManager;
use playout::rtp::packetizer::{ColorSpace, Pacer, Packetizer, RtpSender, VideoFrame};
use playout::rtp::{run_playout, FrameAssembler, PlayoutBuffer, RtpReceiver};

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    if args.help {
        print_help();
        return Ok(());
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("playout=info".parse().context("invalid log directive")?),
        )
        .init();

    info!("playout v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    info!("Configuration loaded");

    // Handle --validate mode
    if args.validate {
        info!("Validating configuration...");
        match config.validate() {
            Ok(()) => {
                info!("Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                error!("{}", e);
                std::process::exit(1);
            }
        }
    }
    config.validate()?;

    let cancel_token = CancellationToken::new();
    spawn_shutdown_watch(cancel_token.clone(), args.duration_secs.map(Duration::from_secs));

    if args.send {
        run_sender(&config, cancel_token).await
    } else {
        run_receiver(&config, cancel_token).await
    }
}

/// Cancel on Ctrl+C, or once `limit` has elapsed
fn spawn_shutdown_watch(cancel_token: CancellationToken, limit: Option<Duration>) {
    tokio::spawn(async move {
        let deadline = async {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
                info!("Ctrl+C received, shutting down");
            }
            _ = deadline => info!("Run duration elapsed, shutting down"),
        }
        cancel_token.cancel();
    });
}

async fn run_receiver(config: &Config, cancel_token: CancellationToken) -> Result<()> {
    let mut pbuf = PlayoutBuffer::new(config.playout_config());
    if let Some(knob) = config.offset_knob() {
        info!("Operator playout offset: {} ms", config.playout_offset_ms.unwrap_or(0));
        pbuf = pbuf.with_offset_knob(knob);
    }
    let buffer = Arc::new(Mutex::new(pbuf));
    let metrics = Arc::new(SessionMetrics::new());

    if let Some(port) = config.metrics_port {
        tokio::spawn(run_metrics_server(port, metrics.clone(), cancel_token.clone()));
    }

    let receiver = RtpReceiver::bind(config.rtp_port, buffer.clone(), metrics.clone()).await?;
    info!(
        "Receiving RTP on port {} (playout delay {:?})",
        receiver.local_port()?,
        config.playout_delay
    );

    let resources = ResourceManager::new();
    let assembler = FrameAssembler::new(&resources);
    let playout = tokio::spawn(run_playout(
        buffer.clone(),
        assembler,
        config.decode_tick,
        metrics.clone(),
        cancel_token.clone(),
        |assembled| match assembled {
            Ok(frame) if frame.is_whole() => {
                debug!("Frame RTP TS={} played out ({} tiles)", frame.timestamp, frame.tiles.len());
            }
            Ok(frame) => {
                debug!(
                    "Frame RTP TS={} played out with {} bytes missing",
                    frame.timestamp,
                    frame.bytes_missing()
                );
            }
            Err(e) => warn!("Frame dropped: {}", e),
        },
    ));

    let datagrams = receiver.run(cancel_token.clone()).await?;
    cancel_token.cancel();
    let decoded = playout.await.context("playout task failed")?;

    let snapshot = metrics.snapshot();
    info!(
        "Session done: {} datagrams, {} frames decoded, {} frames expired, {:.3}% loss",
        datagrams,
        decoded,
        snapshot.frames_expired,
        snapshot.loss_pct()
    );
    Ok(())
}

/// Test pattern: a diagonal gradient that moves one pixel per frame
fn synthetic_frame(config: &Config, index: u64) -> VideoFrame {
    let color_space = ColorSpace::Uyvy;
    let width = config.frame_width as usize;
    let len = color_space.frame_len(config.frame_width, config.frame_height);
    let data: Vec<u8> = (0..len)
        .map(|i| {
            let x = (i / 2) % width;
            let y = (i / 2) / width;
            (x as u64 + y as u64 + index) as u8
        })
        .collect();
    VideoFrame::single(
        config.frame_width,
        config.frame_height,
        color_space,
        config.frame_fps as f64,
        Bytes::from(data),
    )
}

async fn run_sender(config: &Config, cancel_token: CancellationToken) -> Result<()> {
    let remote = config.remote_socket_addr()?;
    let packetizer = Packetizer::new(config.mtu)?;
    let pacer = Pacer::new(config.send_rate_bps);
    let mut sender = RtpSender::connect(remote, packetizer, pacer, config.clock_rate).await?;
    info!(
        "Sending {}x{}@{} to {} (SSRC {:08x})",
        config.frame_width,
        config.frame_height,
        config.frame_fps,
        remote,
        sender.ssrc()
    );

    let mut interval = tokio::time::interval(Duration::from_secs(1) / config.frame_fps);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut frames: u64 = 0;
    let mut packets: u64 = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancel_token.cancelled() => break,
        }
        let frame = synthetic_frame(config, frames);
        packets += sender.send_frame(&frame).await? as u64;
        frames += 1;
    }

    info!("Sender done: {} frames in {} packets", frames, packets);
    Ok(())
}
