/// RTP packet records
///
/// The network layer strips the RFC 3550 fixed header (plus CSRC list,
/// header extension and padding) and hands the playout buffer an immutable
/// `PacketRecord`. The buffer owns the record from then on.

use bytes::{BufMut, Bytes};
use thiserror::Error;

/// RTP protocol version carried in the top two bits of the first octet
pub const RTP_VERSION: u8 = 2;

/// Size of the fixed RTP header (no CSRCs, no extension)
pub const RTP_HEADER_LEN: usize = 12;

/// Errors produced while parsing packets off the wire
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet truncated: {len} bytes, need at least {needed}")]
    Truncated { len: usize, needed: usize },

    #[error("unsupported RTP version {0}")]
    UnsupportedVersion(u8),

    #[error("header extension overruns packet: need {needed} bytes, have {len}")]
    ExtensionOverrun { len: usize, needed: usize },

    #[error("invalid padding length {pad} for {available} payload bytes")]
    InvalidPadding { pad: u8, available: usize },

    #[error("payload header truncated: {len} bytes, need {needed}")]
    PayloadHeaderTruncated { len: usize, needed: usize },

    #[error("MTU {0} too small for packet headers")]
    MtuTooSmall(usize),
}

/// RTP fixed header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub payload_type: u8,
    pub marker: bool,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    /// Serialize as a 12-byte fixed header (V=2, no padding/extension/CSRCs)
    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(RTP_VERSION << 6);
        buf.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7F));
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
    }
}

/// A received RTP packet with its header stripped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketRecord {
    pub seq: u16,
    pub timestamp: u32,
    pub marker: bool,
    pub ssrc: u32,
    pub payload_type: u8,
    pub payload: Bytes,
}

impl PacketRecord {
    pub fn new(seq: u16, timestamp: u32, marker: bool, payload: impl Into<Bytes>) -> Self {
        Self {
            seq,
            timestamp,
            marker,
            ssrc: 0,
            payload_type: 0,
            payload: payload.into(),
        }
    }
}

/// Parse the RTP header and return it along with the payload byte range.
pub fn parse_rtp_header(data: &[u8]) -> Result<(RtpHeader, std::ops::Range<usize>), PacketError> {
    if data.len() < RTP_HEADER_LEN {
        return Err(PacketError::Truncated {
            len: data.len(),
            needed: RTP_HEADER_LEN,
        });
    }

    let version = (data[0] >> 6) & 0x03;
    if version != RTP_VERSION {
        return Err(PacketError::UnsupportedVersion(version));
    }

    let has_padding = (data[0] & 0x20) != 0;
    let has_extension = (data[0] & 0x10) != 0;
    let cc = (data[0] & 0x0F) as usize;

    let header = RtpHeader {
        payload_type: data[1] & 0x7F,
        marker: (data[1] & 0x80) != 0,
        sequence: u16::from_be_bytes([data[2], data[3]]),
        timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
    };

    let mut offset = RTP_HEADER_LEN + cc * 4;
    if data.len() < offset {
        return Err(PacketError::Truncated {
            len: data.len(),
            needed: offset,
        });
    }

    if has_extension {
        if data.len() < offset + 4 {
            return Err(PacketError::ExtensionOverrun {
                len: data.len(),
                needed: offset + 4,
            });
        }
        let ext_words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4 + ext_words * 4;
        if data.len() < offset {
            return Err(PacketError::ExtensionOverrun {
                len: data.len(),
                needed: offset,
            });
        }
    }

    let mut end = data.len();
    if has_padding {
        let pad = data[end - 1];
        let available = end - offset;
        if pad == 0 || pad as usize > available {
            return Err(PacketError::InvalidPadding { pad, available });
        }
        end -= pad as usize;
    }

    Ok((header, offset..end))
}

/// Parse a datagram into a `PacketRecord`. The payload shares the datagram's buffer.
pub fn parse_rtp_packet(data: Bytes) -> Result<PacketRecord, PacketError> {
    let (header, payload) = parse_rtp_header(&data)?;
    Ok(PacketRecord {
        seq: header.sequence,
        timestamp: header.timestamp,
        marker: header.marker,
        ssrc: header.ssrc,
        payload_type: header.payload_type,
        payload: data.slice(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_parse_rtp_header_valid() {
        let packet = [
            0x80, 0xE0, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x12, 0x34, 0x56, 0x78, 0xAA, 0xBB,
        ];
        let record = parse_rtp_packet(Bytes::copy_from_slice(&packet)).unwrap();
        assert_eq!(record.payload_type, 96);
        assert!(record.marker);
        assert_eq!(record.seq, 1);
        assert_eq!(record.timestamp, 16);
        assert_eq!(record.ssrc, 0x12345678);
        assert_eq!(&record.payload[..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_header_written_then_parsed() {
        let header = RtpHeader {
            payload_type: 96,
            marker: true,
            sequence: 65535,
            timestamp: 90_000,
            ssrc: 0xDEADBEEF,
        };
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);
        buf.put_slice(b"payload");
        assert_eq!(buf.len(), RTP_HEADER_LEN + 7);

        let (parsed, range) = parse_rtp_header(&buf).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(&buf[range], b"payload");
    }

    #[test]
    fn test_too_short_rejected() {
        let err = parse_rtp_header(&[0x80, 0x00, 0x00]).unwrap_err();
        assert_eq!(err, PacketError::Truncated { len: 3, needed: 12 });
    }

    #[test]
    fn test_wrong_version_rejected() {
        let packet = [0x40, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1];
        assert_eq!(
            parse_rtp_header(&packet).unwrap_err(),
            PacketError::UnsupportedVersion(1)
        );
    }

    #[test]
    fn test_csrc_list_skipped() {
        let mut packet = vec![0x82, 0x00, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1];
        packet.extend_from_slice(&[0u8; 8]); // two CSRCs
        packet.push(0x55);
        let (_, range) = parse_rtp_header(&packet).unwrap();
        assert_eq!(range, 20..21);
    }

    #[test]
    fn test_bogus_extension_length_rejected() {
        let packet = [
            0x90, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x01, 0xBE, 0xDE,
            0xFF, 0xFF,
        ];
        assert!(matches!(
            parse_rtp_header(&packet),
            Err(PacketError::ExtensionOverrun { .. })
        ));
    }

    #[test]
    fn test_padding_removed() {
        let packet = [0xA0, 0x00, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1, 0x11, 0x22, 0x00, 0x02];
        let (_, range) = parse_rtp_header(&packet).unwrap();
        assert_eq!(range, 12..14);
    }

    #[test]
    fn test_padding_longer_than_payload_rejected() {
        let packet = [0xA0, 0x00, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1, 0x11, 0x09];
        assert!(matches!(
            parse_rtp_header(&packet),
            Err(PacketError::InvalidPadding { pad: 9, .. })
        ));
    }
}
