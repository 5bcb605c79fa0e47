/// Frame assembler
///
/// A `Decoder` that rebuilds each tile's pixel buffer from the chunks of a
/// playout frame, placing every chunk at the byte offset its payload header
/// names. Frames handed over after a timeout are assembled with holes and the
/// missing byte count is reported.

use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

use super::frame::FrameUnit;
use super::packetizer::{ColorSpace, TileInfo, VideoPayloadHeader};
use super::pbuf::Decoder;
use super::stats::PlayoutStats;
use crate::resource::{ResourceManager, SharedLock};

/// Name of the lock serializing assembler critical sections
pub const ASSEMBLER_LOCK: &str = "frame-assembler";

/// Largest tile buffer the assembler will allocate (4096 x 4096 RGBA)
pub const MAX_TILE_BYTES: usize = 4096 * 4096 * 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssembleError {
    #[error("frame RTP TS={timestamp} has no usable units")]
    NoUsableUnits { timestamp: u32 },
}

#[derive(Debug, Clone)]
pub struct AssembledTile {
    pub info: TileInfo,
    pub width: u16,
    pub height: u16,
    pub data: Bytes,
    pub bytes_received: usize,
}

impl AssembledTile {
    pub fn bytes_missing(&self) -> usize {
        self.data.len().saturating_sub(self.bytes_received)
    }
}

#[derive(Debug, Clone)]
pub struct AssembledFrame {
    pub timestamp: u32,
    pub color_space: u8,
    pub fps: f64,
    pub tiles: Vec<AssembledTile>,
    pub stats: PlayoutStats,
}

impl AssembledFrame {
    pub fn bytes_missing(&self) -> usize {
        self.tiles.iter().map(AssembledTile::bytes_missing).sum()
    }

    /// Every tile fully received
    pub fn is_whole(&self) -> bool {
        self.bytes_missing() == 0
    }
}

struct Chunk<'a> {
    offset: usize,
    data: &'a [u8],
}

pub struct FrameAssembler {
    lock: SharedLock,
    frames_assembled: u64,
}

impl FrameAssembler {
    pub fn new(resources: &ResourceManager) -> Self {
        let lock = resources.acquire_shared_lock(ASSEMBLER_LOCK);
        debug!("Frame assembler serialized by shared lock '{}'", lock.name());
        Self {
            lock,
            frames_assembled: 0,
        }
    }

    pub fn frames_assembled(&self) -> u64 {
        self.frames_assembled
    }

    fn assemble(&mut self, units: &[FrameUnit], stats: &PlayoutStats) -> Result<AssembledFrame, AssembleError> {
        let _guard = self.lock.lock();

        let timestamp = units.first().map_or(0, |u| u.packet.timestamp);
        let mut first: Option<VideoPayloadHeader> = None;
        let mut tiles: BTreeMap<(u8, u8), (VideoPayloadHeader, Vec<Chunk<'_>>)> = BTreeMap::new();

        for unit in units {
            let (header, data) = match VideoPayloadHeader::parse(&unit.packet.payload) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("Skipping unit seq={} (RTP TS={}): {}", unit.seq, timestamp, e);
                    continue;
                }
            };
            let end = header.offset as usize + data.len();
            let declared = ColorSpace::from_tag(header.color_space)
                .map_or(end, |cs| cs.frame_len(header.width, header.height));
            if declared > MAX_TILE_BYTES {
                warn!("Skipping unit seq={}: tile of {} bytes is too large", unit.seq, declared);
                continue;
            }
            if header.length as usize != data.len() {
                warn!(
                    "Unit seq={} declares {} bytes but carries {}",
                    unit.seq,
                    header.length,
                    data.len()
                );
            }

            if let Some(f) = first {
                if f.color_space != header.color_space || f.fps_fixed != header.fps_fixed {
                    debug!("Unit seq={} disagrees with frame format, ignored", unit.seq);
                    continue;
                }
            } else {
                first = Some(header);
            }

            let info = TileInfo::from_u32(header.tile_info);
            tiles
                .entry((info.pos_y, info.pos_x))
                .or_insert_with(|| (header, Vec::new()))
                .1
                .push(Chunk {
                    offset: header.offset as usize,
                    data,
                });
        }

        let Some(first) = first else {
            return Err(AssembleError::NoUsableUnits { timestamp });
        };

        let tiles = tiles
            .into_values()
            .map(|(header, chunks)| build_tile(&header, &chunks))
            .collect();

        self.frames_assembled += 1;
        Ok(AssembledFrame {
            timestamp,
            color_space: first.color_space,
            fps: first.fps(),
            tiles,
            stats: *stats,
        })
    }
}

fn build_tile(header: &VideoPayloadHeader, chunks: &[Chunk<'_>]) -> AssembledTile {
    let seen_len = chunks
        .iter()
        .map(|c| c.offset + c.data.len())
        .max()
        .unwrap_or(0);
    let expected_len = ColorSpace::from_tag(header.color_space)
        .map_or(seen_len, |cs| cs.frame_len(header.width, header.height));

    let mut data = BytesMut::zeroed(expected_len);
    let mut bytes_received = 0;
    for chunk in chunks {
        if chunk.offset >= expected_len {
            continue;
        }
        let len = chunk.data.len().min(expected_len - chunk.offset);
        data[chunk.offset..chunk.offset + len].copy_from_slice(&chunk.data[..len]);
        bytes_received += len;
    }

    AssembledTile {
        info: TileInfo::from_u32(header.tile_info),
        width: header.width,
        height: header.height,
        data: data.freeze(),
        bytes_received,
    }
}

impl Decoder for FrameAssembler {
    type Output = Result<AssembledFrame, AssembleError>;

    fn decode(&mut self, units: &[FrameUnit], stats: &PlayoutStats) -> Self::Output {
        self.assemble(units, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::packet::PacketRecord;
    use crate::rtp::packetizer::{Packetizer, Tile, VideoFrame};

    fn units_for(frame: &VideoFrame, ts: u32) -> Vec<FrameUnit> {
        Packetizer::new(1500)
            .unwrap()
            .packetize_frame(frame)
            .into_iter()
            .enumerate()
            .rev()
            .map(|(i, p)| FrameUnit {
                seq: i as u16,
                packet: PacketRecord::new(i as u16, ts, p.marker, p.to_payload()),
            })
            .collect()
    }

    fn pattern(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    #[test]
    fn test_whole_frame_reassembled() {
        let manager = ResourceManager::new();
        let mut assembler = FrameAssembler::new(&manager);
        let data = pattern(ColorSpace::Uyvy.frame_len(64, 48));
        let frame = VideoFrame::single(64, 48, ColorSpace::Uyvy, 25.0, data.clone());

        let out = assembler
            .decode(&units_for(&frame, 9000), &PlayoutStats::default())
            .unwrap();
        assert_eq!(out.timestamp, 9000);
        assert!(out.is_whole());
        assert_eq!(out.tiles.len(), 1);
        assert_eq!(out.tiles[0].data, data);
        assert_eq!(out.fps, 25.0);
        assert_eq!(assembler.frames_assembled(), 1);
    }

    #[test]
    fn test_missing_chunk_reported() {
        let manager = ResourceManager::new();
        let mut assembler = FrameAssembler::new(&manager);
        let len = ColorSpace::Rgb.frame_len(40, 40);
        let frame = VideoFrame::single(40, 40, ColorSpace::Rgb, 30.0, pattern(len));

        let mut units = units_for(&frame, 1);
        // drop the middle chunk
        let removed = units.remove(1);
        let missing = removed.packet.payload.len() - VideoPayloadHeader::LEN;

        let out = assembler.decode(&units, &PlayoutStats::default()).unwrap();
        assert!(!out.is_whole());
        assert_eq!(out.bytes_missing(), missing);
        assert_eq!(out.tiles[0].data.len(), len);
    }

    #[test]
    fn test_tiles_kept_apart() {
        let manager = ResourceManager::new();
        let mut assembler = FrameAssembler::new(&manager);
        let tiles = (0..2)
            .map(|i| Tile {
                width: 16,
                height: 16,
                data: Bytes::from(vec![i as u8 + 1; ColorSpace::Rgba.frame_len(16, 16)]),
            })
            .collect();
        let frame = VideoFrame {
            color_space: ColorSpace::Rgba,
            fps: 60.0,
            aux: 0,
            grid_width: 2,
            grid_height: 1,
            tiles,
        };

        let out = assembler
            .decode(&units_for(&frame, 5), &PlayoutStats::default())
            .unwrap();
        assert!(out.is_whole());
        assert_eq!(out.tiles.len(), 2);
        assert!(out.tiles[0].data.iter().all(|b| *b == 1));
        assert!(out.tiles[1].data.iter().all(|b| *b == 2));
        assert_eq!(out.tiles[1].info.pos_x, 1);
    }

    #[test]
    fn test_garbage_units_rejected() {
        let manager = ResourceManager::new();
        let mut assembler = FrameAssembler::new(&manager);
        let units = vec![FrameUnit {
            seq: 1,
            packet: PacketRecord::new(1, 77, true, vec![1u8, 2, 3]),
        }];
        assert_eq!(
            assembler.decode(&units, &PlayoutStats::default()).unwrap_err(),
            AssembleError::NoUsableUnits { timestamp: 77 }
        );
    }

    #[test]
    fn test_oversized_tile_skipped() {
        let manager = ResourceManager::new();
        let mut assembler = FrameAssembler::new(&manager);
        let packet = crate::rtp::packetizer::VideoPacket {
            marker: true,
            header: VideoPayloadHeader {
                width: u16::MAX,
                height: u16::MAX,
                color_space: ColorSpace::Rgba.tag(),
                fps_fixed: 30 << 16,
                aux: 0,
                tile_info: 0,
                offset: 0,
                flags: 0,
                length: 4,
            },
            data: Bytes::from_static(&[1, 2, 3, 4]),
        };
        let units = vec![FrameUnit {
            seq: 1,
            packet: PacketRecord::new(1, 3, true, packet.to_payload()),
        }];
        assert!(assembler.decode(&units, &PlayoutStats::default()).is_err());
    }

    #[test]
    fn test_assembler_holds_named_lock() {
        let manager = ResourceManager::new();
        let a = FrameAssembler::new(&manager);
        let b = FrameAssembler::new(&manager);
        assert_eq!(manager.active_locks(), 1);
        assert_eq!(a.lock.name(), ASSEMBLER_LOCK);
        drop(a);
        drop(b);
        assert_eq!(manager.active_locks(), 0);
    }
}
