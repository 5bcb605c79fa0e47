/// Sender packetizer and pacer
///
/// Splits outgoing video tiles and audio buffers into MTU-sized RTP payloads,
/// each prefixed by a payload header describing the frame, and paces the
/// packets against a bit-rate budget.
///
/// The receiver relies on two properties of this framing: exactly one packet
/// per timestamp carries the marker bit (the last), and every packet of one
/// timestamp is sent before any packet of the next.

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::packet::{PacketError, RtpHeader, RTP_HEADER_LEN};

/// IPv4 + UDP + RTP header bytes
pub const TRANSPORT_OVERHEAD: usize = 40;

/// Video chunk lengths are a multiple of this
pub const CHUNK_ALIGNMENT: usize = 48;

/// Dynamic payload types
pub const VIDEO_PAYLOAD_TYPE: u8 = 96;
pub const AUDIO_PAYLOAD_TYPE: u8 = 97;

/// Flags value carried in every video payload header
pub const VIDEO_FLAGS: u16 = 1 << 15;

/// Pixel layout of a video tile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColorSpace {
    Uyvy = 1,
    Rgba = 2,
    Rgb = 3,
    I420 = 4,
}

impl ColorSpace {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(ColorSpace::Uyvy),
            2 => Some(ColorSpace::Rgba),
            3 => Some(ColorSpace::Rgb),
            4 => Some(ColorSpace::I420),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Bytes needed for one `width` x `height` image
    pub fn frame_len(self, width: u16, height: u16) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            ColorSpace::Uyvy => pixels * 2,
            ColorSpace::Rgba => pixels * 4,
            ColorSpace::Rgb => pixels * 3,
            ColorSpace::I420 => pixels * 3 / 2,
        }
    }
}

/// Position of a tile within its frame's grid
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TileInfo {
    pub x_count: u8,
    pub y_count: u8,
    pub pos_x: u8,
    pub pos_y: u8,
}

impl TileInfo {
    pub fn to_u32(self) -> u32 {
        u32::from_be_bytes([self.x_count, self.y_count, self.pos_x, self.pos_y])
    }

    pub fn from_u32(value: u32) -> Self {
        let [x_count, y_count, pos_x, pos_y] = value.to_be_bytes();
        Self {
            x_count,
            y_count,
            pos_x,
            pos_y,
        }
    }
}

/// Header prefixed to every video chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoPayloadHeader {
    pub width: u16,
    pub height: u16,
    pub color_space: u8,
    /// Frames per second in 16.16 fixed point
    pub fps_fixed: u32,
    pub aux: u32,
    pub tile_info: u32,
    /// Byte offset of this chunk within the tile
    pub offset: u32,
    pub flags: u16,
    pub length: u16,
}

impl VideoPayloadHeader {
    pub const LEN: usize = 25;

    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_u8(self.color_space);
        buf.put_u32(self.fps_fixed);
        buf.put_u32(self.aux);
        buf.put_u32(self.tile_info);
        buf.put_u32(self.offset);
        buf.put_u16(self.flags);
        buf.put_u16(self.length);
    }

    /// Parse the header off the front of a payload, returning the chunk data
    pub fn parse(payload: &[u8]) -> Result<(Self, &[u8]), PacketError> {
        if payload.len() < Self::LEN {
            return Err(PacketError::PayloadHeaderTruncated {
                len: payload.len(),
                needed: Self::LEN,
            });
        }
        let mut buf = payload;
        let header = Self {
            width: buf.get_u16(),
            height: buf.get_u16(),
            color_space: buf.get_u8(),
            fps_fixed: buf.get_u32(),
            aux: buf.get_u32(),
            tile_info: buf.get_u32(),
            offset: buf.get_u32(),
            flags: buf.get_u16(),
            length: buf.get_u16(),
        };
        Ok((header, buf))
    }

    pub fn fps(&self) -> f64 {
        self.fps_fixed as f64 / 65536.0
    }
}

/// Header prefixed to every audio chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioPayloadHeader {
    pub ch_count: u8,
    /// Bits per sample
    pub audio_quant: u8,
    pub sample_rate: u32,
    /// Total length of the audio buffer
    pub buffer_len: u32,
    pub offset: u32,
    pub length: u16,
}

impl AudioPayloadHeader {
    pub const LEN: usize = 16;

    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.ch_count);
        buf.put_u8(self.audio_quant);
        buf.put_u32(self.sample_rate);
        buf.put_u32(self.buffer_len);
        buf.put_u32(self.offset);
        buf.put_u16(self.length);
    }

    pub fn parse(payload: &[u8]) -> Result<(Self, &[u8]), PacketError> {
        if payload.len() < Self::LEN {
            return Err(PacketError::PayloadHeaderTruncated {
                len: payload.len(),
                needed: Self::LEN,
            });
        }
        let mut buf = payload;
        let header = Self {
            ch_count: buf.get_u8(),
            audio_quant: buf.get_u8(),
            sample_rate: buf.get_u32(),
            buffer_len: buf.get_u32(),
            offset: buf.get_u32(),
            length: buf.get_u16(),
        };
        Ok((header, buf))
    }
}

#[derive(Debug, Clone)]
pub struct Tile {
    pub width: u16,
    pub height: u16,
    pub data: Bytes,
}

/// A frame as a grid of tiles, stored row-major
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub color_space: ColorSpace,
    pub fps: f64,
    pub aux: u32,
    pub grid_width: u8,
    pub grid_height: u8,
    pub tiles: Vec<Tile>,
}

impl VideoFrame {
    pub fn single(width: u16, height: u16, color_space: ColorSpace, fps: f64, data: Bytes) -> Self {
        Self {
            color_space,
            fps,
            aux: 0,
            grid_width: 1,
            grid_height: 1,
            tiles: vec![Tile { width, height, data }],
        }
    }

    pub fn tile(&self, x: u8, y: u8) -> Option<&Tile> {
        if x >= self.grid_width || y >= self.grid_height {
            return None;
        }
        self.tiles
            .get(y as usize * self.grid_width as usize + x as usize)
    }
}

/// Interleaved PCM audio
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub ch_count: u8,
    pub bytes_per_sample: u8,
    pub sample_rate: u32,
    pub data: Bytes,
}

/// One video chunk ready to be wrapped in RTP
#[derive(Debug, Clone)]
pub struct VideoPacket {
    pub marker: bool,
    pub header: VideoPayloadHeader,
    pub data: Bytes,
}

impl VideoPacket {
    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(VideoPayloadHeader::LEN + self.data.len());
        self.header.write_to(&mut buf);
        buf.put_slice(&self.data);
        buf.freeze()
    }
}

#[derive(Debug, Clone)]
pub struct AudioPacket {
    pub marker: bool,
    pub header: AudioPayloadHeader,
    pub data: Bytes,
}

impl AudioPacket {
    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(AudioPayloadHeader::LEN + self.data.len());
        self.header.write_to(&mut buf);
        buf.put_slice(&self.data);
        buf.freeze()
    }
}

/// Splits frames into MTU-sized chunks
#[derive(Debug, Clone, Copy)]
pub struct Packetizer {
    mtu: usize,
}

impl Packetizer {
    pub fn new(mtu: usize) -> Result<Self, PacketError> {
        if mtu < TRANSPORT_OVERHEAD + VideoPayloadHeader::LEN + CHUNK_ALIGNMENT {
            return Err(PacketError::MtuTooSmall(mtu));
        }
        Ok(Self { mtu })
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Video chunk size: what fits after the headers, rounded down to the alignment
    pub fn video_chunk_len(&self) -> usize {
        (self.mtu - TRANSPORT_OVERHEAD - VideoPayloadHeader::LEN) / CHUNK_ALIGNMENT * CHUNK_ALIGNMENT
    }

    pub fn audio_chunk_len(&self) -> usize {
        self.mtu - TRANSPORT_OVERHEAD - AudioPayloadHeader::LEN
    }

    /// All tiles of a frame; only the last chunk of the last tile is marked
    pub fn packetize_frame(&self, frame: &VideoFrame) -> Vec<VideoPacket> {
        let mut packets = Vec::new();
        for y in 0..frame.grid_height {
            for x in 0..frame.grid_width {
                let last = x == frame.grid_width - 1 && y == frame.grid_height - 1;
                self.packetize_tile_into(frame, x, y, last, &mut packets);
            }
        }
        packets
    }

    /// A single tile sent on its own; its last chunk is marked
    pub fn packetize_tile(&self, frame: &VideoFrame, x: u8, y: u8) -> Vec<VideoPacket> {
        let mut packets = Vec::new();
        self.packetize_tile_into(frame, x, y, true, &mut packets);
        packets
    }

    fn packetize_tile_into(&self, frame: &VideoFrame, x: u8, y: u8, send_marker: bool, out: &mut Vec<VideoPacket>) {
        let Some(tile) = frame.tile(x, y) else {
            return;
        };

        let tile_info = TileInfo {
            x_count: frame.grid_width,
            y_count: frame.grid_height,
            pos_x: x,
            pos_y: y,
        };
        let base = VideoPayloadHeader {
            width: tile.width,
            height: tile.height,
            color_space: frame.color_space.tag(),
            fps_fixed: (frame.fps * 65536.0) as u32,
            aux: frame.aux,
            tile_info: tile_info.to_u32(),
            offset: 0,
            flags: VIDEO_FLAGS,
            length: 0,
        };

        let chunk = self.video_chunk_len();
        let mut pos = 0;
        // An empty tile still produces one (empty) packet
        loop {
            let mut len = chunk;
            let mut marker = false;
            if pos + len >= tile.data.len() {
                len = tile.data.len() - pos;
                marker = send_marker;
            }
            out.push(VideoPacket {
                marker,
                header: VideoPayloadHeader {
                    offset: pos as u32,
                    length: len as u16,
                    ..base
                },
                data: tile.data.slice(pos..pos + len),
            });
            pos += len;
            if pos >= tile.data.len() {
                break;
            }
        }
    }

    /// Audio chunks carry no alignment constraint; the final chunk is marked
    pub fn packetize_audio(&self, audio: &AudioBuffer) -> Vec<AudioPacket> {
        let chunk = self.audio_chunk_len();
        let mut packets = Vec::new();
        let mut pos = 0;
        loop {
            let mut len = chunk;
            let mut marker = false;
            if pos + len >= audio.data.len() {
                len = audio.data.len() - pos;
                marker = true;
            }
            packets.push(AudioPacket {
                marker,
                header: AudioPayloadHeader {
                    ch_count: audio.ch_count,
                    audio_quant: audio.bytes_per_sample.saturating_mul(8),
                    sample_rate: audio.sample_rate,
                    buffer_len: audio.data.len() as u32,
                    offset: pos as u32,
                    length: len as u16,
                },
                data: audio.data.slice(pos..pos + len),
            });
            pos += len;
            if pos >= audio.data.len() {
                break;
            }
        }
        packets
    }
}

/// Spaces packets so the stream stays under a bit-rate budget.
///
/// Each packet reserves `len * 8 / rate` seconds of the link; `pace` waits
/// until the previous packet's slot has elapsed. A zero rate disables pacing.
#[derive(Debug)]
pub struct Pacer {
    rate_bps: u64,
    next_slot: Option<Instant>,
}

impl Pacer {
    pub fn new(rate_bps: u64) -> Self {
        Self {
            rate_bps,
            next_slot: None,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Time one packet of `len` bytes occupies at the configured rate
    pub fn slot_for(&self, len: usize) -> Duration {
        if self.rate_bps == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos((len as u64 * 8).saturating_mul(1_000_000_000) / self.rate_bps)
    }

    /// Wait for the next send slot, then reserve one for a packet of `len` bytes
    pub async fn pace(&mut self, len: usize) {
        if self.rate_bps == 0 {
            return;
        }
        let now = Instant::now();
        let start = match self.next_slot {
            Some(slot) if slot > now => {
                tokio::time::sleep_until(slot).await;
                slot
            }
            _ => now,
        };
        self.next_slot = Some(start + self.slot_for(len));
    }
}

/// Sends packetized frames over UDP
pub struct RtpSender {
    socket: UdpSocket,
    remote: SocketAddr,
    packetizer: Packetizer,
    pacer: Pacer,
    ssrc: u32,
    sequence: u16,
    clock_rate: u32,
    epoch: Instant,
    ts_base: u32,
}

impl RtpSender {
    pub async fn connect(remote: SocketAddr, packetizer: Packetizer, pacer: Pacer, clock_rate: u32) -> Result<Self> {
        let bind_addr = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .context(format!("Failed to bind sender socket on {}", bind_addr))?;

        let mut rng = rand::thread_rng();
        let ssrc = rng.gen::<u32>();
        debug!("RTP sender SSRC {:08x} -> {}", ssrc, remote);

        Ok(Self {
            socket,
            remote,
            packetizer,
            pacer,
            ssrc,
            sequence: rng.gen::<u16>(),
            clock_rate,
            epoch: Instant::now(),
            ts_base: rng.gen::<u32>(),
        })
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Current media time in clock-rate ticks
    pub fn media_timestamp(&self) -> u32 {
        let ticks = self.epoch.elapsed().as_micros() as u64 * self.clock_rate as u64 / 1_000_000;
        self.ts_base.wrapping_add(ticks as u32)
    }

    /// Send every tile of a frame under one timestamp. Returns packets sent.
    pub async fn send_frame(&mut self, frame: &VideoFrame) -> Result<usize> {
        let timestamp = self.media_timestamp();
        let packets = self.packetizer.packetize_frame(frame);
        for packet in &packets {
            self.send_payload(VIDEO_PAYLOAD_TYPE, timestamp, packet.marker, &packet.to_payload())
                .await?;
        }
        trace!("Sent frame RTP TS={} in {} packets", timestamp, packets.len());
        Ok(packets.len())
    }

    /// Send one tile of a frame under its own timestamp
    pub async fn send_tile(&mut self, frame: &VideoFrame, x: u8, y: u8) -> Result<usize> {
        let timestamp = self.media_timestamp();
        let packets = self.packetizer.packetize_tile(frame, x, y);
        for packet in &packets {
            self.send_payload(VIDEO_PAYLOAD_TYPE, timestamp, packet.marker, &packet.to_payload())
                .await?;
        }
        Ok(packets.len())
    }

    pub async fn send_audio(&mut self, audio: &AudioBuffer) -> Result<usize> {
        let timestamp = self.media_timestamp();
        let packets = self.packetizer.packetize_audio(audio);
        for packet in &packets {
            self.send_payload(AUDIO_PAYLOAD_TYPE, timestamp, packet.marker, &packet.to_payload())
                .await?;
        }
        Ok(packets.len())
    }

    async fn send_payload(&mut self, payload_type: u8, timestamp: u32, marker: bool, payload: &[u8]) -> Result<()> {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_LEN + payload.len());
        RtpHeader {
            payload_type,
            marker,
            sequence: self.sequence,
            timestamp,
            ssrc: self.ssrc,
        }
        .write_to(&mut buf);
        buf.put_slice(payload);

        self.pacer.pace(buf.len()).await;
        self.socket
            .send_to(&buf, self.remote)
            .await
            .context("Failed to send RTP packet")?;
        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }
}
