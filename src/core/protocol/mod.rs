//! Protocol implementations
//!
//! Provides the XMODEM-family wire format:
//! - Control bytes
//! - Checksum algorithms (8-bit sum, CRC-16/XMODEM)
//! - Block framing and the YMODEM batch header

pub mod block;
pub mod checksum;

pub use block::{
    decode as decode_block, encode as encode_block, BatchHeader, FrameError, FrameKind,
    TransferBlock, Validator, LONG_BLOCK, SHORT_BLOCK,
};
pub use checksum::{calculate as calc_checksum, ChecksumType};

/// XMODEM control characters
pub mod control {
    /// Start of Header (128 byte block)
    pub const SOH: u8 = 0x01;
    /// Start of Text (1K block)
    pub const STX: u8 = 0x02;
    /// End of Transmission
    pub const EOT: u8 = 0x04;
    /// Acknowledge
    pub const ACK: u8 = 0x06;
    /// Negative Acknowledge, also requests checksum mode
    pub const NAK: u8 = 0x15;
    /// Cancel
    pub const CAN: u8 = 0x18;
    /// 'C', requests CRC mode
    pub const CRC_REQUEST: u8 = 0x43;
}
