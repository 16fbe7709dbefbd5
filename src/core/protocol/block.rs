//! XMODEM/YMODEM block framing
//!
//! Wire layout of one block:
//!
//! ```text
//! SOH|STX  blk  ~blk  payload(128|1024)  checksum | crc_hi crc_lo
//! ```
//!
//! Short payloads are NUL-padded. YMODEM block 0 carries a [`BatchHeader`]
//! instead of file data.

use super::checksum::{self, ChecksumType};
use super::control::{SOH, STX};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Payload size of an SOH block
pub const SHORT_BLOCK: usize = 128;
/// Payload size of an STX block
pub const LONG_BLOCK: usize = 1024;

/// Marker plus block number plus complement
const PREAMBLE_LEN: usize = 3;

/// Block frame size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    /// 128-byte payload, SOH marker
    Short,
    /// 1024-byte payload, STX marker
    Long,
}

impl FrameKind {
    /// Payload bytes carried by this frame kind
    pub fn payload_len(self) -> usize {
        match self {
            FrameKind::Short => SHORT_BLOCK,
            FrameKind::Long => LONG_BLOCK,
        }
    }

    /// Start-of-block marker byte
    pub fn marker(self) -> u8 {
        match self {
            FrameKind::Short => SOH,
            FrameKind::Long => STX,
        }
    }

    /// Frame kind announced by a marker byte
    pub fn from_marker(marker: u8) -> Option<Self> {
        match marker {
            SOH => Some(FrameKind::Short),
            STX => Some(FrameKind::Long),
            _ => None,
        }
    }

    /// Total bytes on the wire for one block of this kind
    pub fn frame_len(self, use_crc: bool) -> usize {
        PREAMBLE_LEN + self.payload_len() + ChecksumType::for_mode(use_crc).size()
    }

    /// Smallest frame kind able to carry `len` payload bytes
    pub fn fitting(len: usize) -> Self {
        if len <= SHORT_BLOCK {
            FrameKind::Short
        } else {
            FrameKind::Long
        }
    }
}

/// Block validator as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validator {
    /// 8-bit arithmetic checksum
    Checksum(u8),
    /// CRC-16/XMODEM
    Crc(u16),
}

impl Validator {
    /// Compute the validator of a (padded) payload
    pub fn compute(payload: &[u8], use_crc: bool) -> Self {
        if use_crc {
            Validator::Crc(checksum::crc16_xmodem(payload))
        } else {
            Validator::Checksum(checksum::sum8_checksum(payload))
        }
    }

    /// Algorithm used by this validator
    pub fn checksum_type(&self) -> ChecksumType {
        match self {
            Validator::Checksum(_) => ChecksumType::Sum8,
            Validator::Crc(_) => ChecksumType::Crc16Xmodem,
        }
    }

    fn push_to(&self, frame: &mut Vec<u8>) {
        match *self {
            Validator::Checksum(sum) => frame.push(sum),
            Validator::Crc(crc) => frame.extend_from_slice(&crc.to_be_bytes()),
        }
    }
}

/// Block framing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// No bytes at all
    #[error("empty frame")]
    Empty,

    /// First byte is neither SOH nor STX
    #[error("bad block marker 0x{0:02X}")]
    BadMarker(u8),

    /// Frame is neither a checksum nor a CRC frame of its kind
    #[error("{actual} bytes is not a valid {kind:?} frame length")]
    BadLength {
        /// Frame kind announced by the marker
        kind: FrameKind,
        /// Bytes received
        actual: usize,
    },

    /// Block number and its complement disagree
    #[error("block number {number} does not match complement {complement}")]
    SequenceMismatch {
        /// Block number byte
        number: u8,
        /// Complement byte
        complement: u8,
    },

    /// Arithmetic checksum disagrees with the payload
    #[error("checksum mismatch: computed 0x{computed:02X}, received 0x{received:02X}")]
    ChecksumMismatch {
        /// Checksum of the received payload
        computed: u8,
        /// Checksum carried by the frame
        received: u8,
    },

    /// CRC disagrees with the payload
    #[error("CRC mismatch: computed 0x{computed:04X}, received 0x{received:04X}")]
    CrcMismatch {
        /// CRC of the received payload
        computed: u16,
        /// CRC carried by the frame
        received: u16,
    },

    /// Payload does not fit the requested frame kind
    #[error("payload of {len} bytes exceeds the {max}-byte frame")]
    PayloadTooLong {
        /// Payload length
        len: usize,
        /// Frame capacity
        max: usize,
    },

    /// YMODEM block 0 could not be parsed
    #[error("malformed batch header: {0}")]
    BadHeader(String),
}

/// One framed transfer unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferBlock {
    block_number: u8,
    payload: Bytes,
    frame_kind: FrameKind,
    validator: Validator,
}

impl TransferBlock {
    /// Build a block, NUL-padding the payload to the frame size
    pub fn new(
        block_number: u8,
        payload: &[u8],
        frame_kind: FrameKind,
        use_crc: bool,
    ) -> Result<Self, FrameError> {
        let max = frame_kind.payload_len();
        if payload.len() > max {
            return Err(FrameError::PayloadTooLong {
                len: payload.len(),
                max,
            });
        }

        let mut padded = payload.to_vec();
        padded.resize(max, 0);
        let validator = Validator::compute(&padded, use_crc);

        Ok(Self {
            block_number,
            payload: Bytes::from(padded),
            frame_kind,
            validator,
        })
    }

    /// YMODEM block 0 describing a file
    pub fn header(header: &BatchHeader, use_crc: bool) -> Result<Self, FrameError> {
        let payload = header.to_payload();
        Self::new(0, &payload, FrameKind::fitting(payload.len()), use_crc)
    }

    /// YMODEM block 0 with an empty file name
    pub fn end_of_batch(use_crc: bool) -> Self {
        Self {
            block_number: 0,
            payload: Bytes::from(vec![0u8; SHORT_BLOCK]),
            frame_kind: FrameKind::Short,
            validator: Validator::compute(&[0u8; SHORT_BLOCK], use_crc),
        }
    }

    /// Sequence number (wraps at 256)
    pub fn block_number(&self) -> u8 {
        self.block_number
    }

    /// Full padded payload
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Frame size
    pub fn frame_kind(&self) -> FrameKind {
        self.frame_kind
    }

    /// Validator carried by the block
    pub fn validator(&self) -> Validator {
        self.validator
    }

    /// Serialize to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(self.frame_kind.frame_len(true));
        frame.push(self.frame_kind.marker());
        frame.push(self.block_number);
        frame.push(!self.block_number);
        frame.extend_from_slice(&self.payload);
        self.validator.push_to(&mut frame);
        frame
    }
}

/// Encode one block to wire bytes
pub fn encode(
    block_number: u8,
    payload: &[u8],
    frame_kind: FrameKind,
    use_crc: bool,
) -> Result<Vec<u8>, FrameError> {
    Ok(TransferBlock::new(block_number, payload, frame_kind, use_crc)?.encode())
}

/// Decode and validate one complete frame
///
/// The validator kind follows from the frame length: a checksum frame is one
/// byte shorter than the CRC frame of the same kind.
pub fn decode(bytes: &[u8]) -> Result<TransferBlock, FrameError> {
    let (&marker, _) = bytes.split_first().ok_or(FrameError::Empty)?;
    let frame_kind = FrameKind::from_marker(marker).ok_or(FrameError::BadMarker(marker))?;

    let use_crc = if bytes.len() == frame_kind.frame_len(true) {
        true
    } else if bytes.len() == frame_kind.frame_len(false) {
        false
    } else {
        return Err(FrameError::BadLength {
            kind: frame_kind,
            actual: bytes.len(),
        });
    };

    let number = bytes[1];
    let complement = bytes[2];
    if number != !complement {
        return Err(FrameError::SequenceMismatch { number, complement });
    }

    let payload_end = PREAMBLE_LEN + frame_kind.payload_len();
    let payload = &bytes[PREAMBLE_LEN..payload_end];
    let trailer = &bytes[payload_end..];

    let validator = if use_crc {
        let received = u16::from_be_bytes([trailer[0], trailer[1]]);
        let computed = checksum::crc16_xmodem(payload);
        if computed != received {
            return Err(FrameError::CrcMismatch { computed, received });
        }
        Validator::Crc(received)
    } else {
        let received = trailer[0];
        let computed = checksum::sum8_checksum(payload);
        if computed != received {
            return Err(FrameError::ChecksumMismatch { computed, received });
        }
        Validator::Checksum(received)
    };

    Ok(TransferBlock {
        block_number: number,
        payload: Bytes::copy_from_slice(payload),
        frame_kind,
        validator,
    })
}

/// YMODEM block-0 file description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchHeader {
    /// Bare file name (no directory components)
    pub name: String,
    /// Declared file length, when the sender supplied one
    pub length: Option<u64>,
    /// Modification time, when the sender supplied a non-zero one
    pub modified: Option<DateTime<Utc>>,
}

impl BatchHeader {
    /// Header for a file of known length
    pub fn new(name: impl Into<String>, length: u64) -> Self {
        Self {
            name: name.into(),
            length: Some(length),
            modified: None,
        }
    }

    /// Attach a modification time
    #[must_use]
    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }

    /// Serialize as `name NUL decimal-length SPACE octal-mtime`
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = self.name.as_bytes().to_vec();
        payload.push(0);
        if let Some(length) = self.length {
            let mtime = self
                .modified
                .map_or(0, |ts| u64::try_from(ts.timestamp()).unwrap_or(0));
            payload.extend_from_slice(format!("{length} {mtime:o}").as_bytes());
        }
        payload
    }

    /// Parse a block-0 payload; `None` marks the end of the batch
    pub fn parse(payload: &[u8]) -> Result<Option<Self>, FrameError> {
        let name_end = payload
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| FrameError::BadHeader("file name is not NUL-terminated".into()))?;
        if name_end == 0 {
            return Ok(None);
        }

        let name = String::from_utf8_lossy(&payload[..name_end]).into_owned();
        let rest = &payload[name_end + 1..];
        let info_end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let info = std::str::from_utf8(&rest[..info_end])
            .map_err(|_| FrameError::BadHeader("file info is not ASCII".into()))?;

        let mut fields = info.split_ascii_whitespace();
        let length = fields
            .next()
            .map(|f| {
                f.parse::<u64>()
                    .map_err(|_| FrameError::BadHeader(format!("bad length field {f:?}")))
            })
            .transpose()?;
        let modified = match fields.next() {
            Some(f) => {
                let secs = i64::from_str_radix(f, 8)
                    .map_err(|_| FrameError::BadHeader(format!("bad mtime field {f:?}")))?;
                if secs == 0 {
                    None
                } else {
                    Utc.timestamp_opt(secs, 0).single()
                }
            }
            None => None,
        };

        Ok(Some(Self {
            name,
            length,
            modified,
        }))
    }

    /// Number of data blocks needed for the declared length
    pub fn total_blocks(&self, frame_kind: FrameKind) -> Option<u64> {
        let per_block = frame_kind.payload_len() as u64;
        self.length.map(|len| len.div_ceil(per_block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let frame = encode(1, b"hello", FrameKind::Short, false).unwrap();
        assert_eq!(frame.len(), 132);
        assert_eq!(&frame[..3], &[SOH, 0x01, 0xFE]);
        assert_eq!(&frame[3..8], b"hello");
        assert!(frame[8..131].iter().all(|&b| b == 0));
        assert_eq!(frame[131], checksum::sum8_checksum(b"hello"));
    }

    #[test]
    fn test_encode_crc_long() {
        let payload = vec![0xA5u8; LONG_BLOCK];
        let frame = encode(0xFF, &payload, FrameKind::Long, true).unwrap();
        assert_eq!(frame.len(), 1029);
        assert_eq!(&frame[..3], &[STX, 0xFF, 0x00]);
        let crc = checksum::crc16_xmodem(&payload);
        assert_eq!(&frame[1027..], &crc.to_be_bytes());
    }

    #[test]
    fn test_decode_recovers_padded_payload() {
        for (kind, use_crc) in [
            (FrameKind::Short, false),
            (FrameKind::Short, true),
            (FrameKind::Long, false),
            (FrameKind::Long, true),
        ] {
            let data: Vec<u8> = (0..100u8).collect();
            let block = decode(&encode(7, &data, kind, use_crc).unwrap()).unwrap();
            assert_eq!(block.block_number(), 7);
            assert_eq!(block.frame_kind(), kind);
            assert_eq!(&block.payload()[..100], &data[..]);
            assert!(block.payload()[100..].iter().all(|&b| b == 0));
            assert_eq!(block.payload().len(), kind.payload_len());
        }
    }

    #[test]
    fn test_payload_too_long() {
        let err = encode(1, &[0u8; 129], FrameKind::Short, true).unwrap_err();
        assert_eq!(err, FrameError::PayloadTooLong { len: 129, max: 128 });
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(decode(&[]), Err(FrameError::Empty));
        assert!(matches!(decode(&[0x41, 1, 0xFE]), Err(FrameError::BadMarker(0x41))));

        let mut frame = encode(3, b"abc", FrameKind::Short, false).unwrap();
        frame[2] = 0x00;
        assert!(matches!(decode(&frame), Err(FrameError::SequenceMismatch { number: 3, .. })));

        let mut frame = encode(3, b"abc", FrameKind::Short, false).unwrap();
        frame[4] ^= 0x01;
        assert!(matches!(decode(&frame), Err(FrameError::ChecksumMismatch { .. })));

        let mut frame = encode(3, b"abc", FrameKind::Short, true).unwrap();
        frame[10] ^= 0x80;
        assert!(matches!(decode(&frame), Err(FrameError::CrcMismatch { .. })));

        let frame = encode(3, b"abc", FrameKind::Short, true).unwrap();
        assert!(matches!(
            decode(&frame[..100]),
            Err(FrameError::BadLength { kind: FrameKind::Short, actual: 100 })
        ));
    }

    #[test]
    fn test_header_roundtrip() {
        let modified = Utc.timestamp_opt(0o14_000_000_000, 0).single().unwrap();
        let header = BatchHeader::new("GAMES.ZIP", 123_456).with_modified(modified);
        let payload = header.to_payload();
        assert!(payload.starts_with(b"GAMES.ZIP\0123456 14000000000"));
        assert_eq!(BatchHeader::parse(&payload).unwrap(), Some(header));
    }

    #[test]
    fn test_header_without_mtime() {
        let parsed = BatchHeader::parse(b"README.TXT\x0042\0\0\0").unwrap().unwrap();
        assert_eq!(parsed.name, "README.TXT");
        assert_eq!(parsed.length, Some(42));
        assert_eq!(parsed.modified, None);

        let bare = BatchHeader::parse(b"NOTES\0\0\0").unwrap().unwrap();
        assert_eq!(bare.length, None);
    }

    #[test]
    fn test_empty_name_ends_batch() {
        let block = TransferBlock::end_of_batch(true);
        let decoded = decode(&block.encode()).unwrap();
        assert_eq!(decoded.block_number(), 0);
        assert_eq!(BatchHeader::parse(decoded.payload()).unwrap(), None);
    }

    #[test]
    fn test_bad_header_fields() {
        assert!(matches!(BatchHeader::parse(b"NO-TERMINATOR"), Err(FrameError::BadHeader(_))));
        assert!(matches!(BatchHeader::parse(b"A\0x12 0\0"), Err(FrameError::BadHeader(_))));
        assert!(matches!(BatchHeader::parse(b"A\x0012 9\0"), Err(FrameError::BadHeader(_))));
    }

    #[test]
    fn test_long_header_uses_stx() {
        let name = "N".repeat(200);
        let block = TransferBlock::header(&BatchHeader::new(name, 1), true).unwrap();
        assert_eq!(block.frame_kind(), FrameKind::Long);
    }

    #[test]
    fn test_total_blocks() {
        let header = BatchHeader::new("A", 1025);
        assert_eq!(header.total_blocks(FrameKind::Long), Some(2));
        assert_eq!(header.total_blocks(FrameKind::Short), Some(9));
        assert_eq!(BatchHeader::new("A", 0).total_blocks(FrameKind::Long), Some(0));
    }
}
