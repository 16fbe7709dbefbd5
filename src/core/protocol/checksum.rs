//! Block validators
//!
//! XMODEM-family blocks are validated either with an 8-bit arithmetic
//! checksum or with CRC-16/XMODEM.

/// Validator algorithm carried by a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChecksumType {
    /// Sum of payload bytes mod 256
    Sum8,
    /// CRC-16 XMODEM (polynomial 0x1021, init 0x0000)
    Crc16Xmodem,
}

impl ChecksumType {
    /// Validator selected by the CRC negotiation flag
    pub fn for_mode(use_crc: bool) -> Self {
        if use_crc {
            ChecksumType::Crc16Xmodem
        } else {
            ChecksumType::Sum8
        }
    }

    /// Get name of checksum type
    pub fn name(&self) -> &'static str {
        match self {
            ChecksumType::Sum8 => "Checksum",
            ChecksumType::Crc16Xmodem => "CRC-16/XMODEM",
        }
    }

    /// Get output size in bytes
    pub fn size(&self) -> usize {
        match self {
            ChecksumType::Sum8 => 1,
            ChecksumType::Crc16Xmodem => 2,
        }
    }
}

/// Calculate the wire bytes of the validator for `data`
pub fn calculate(data: &[u8], algorithm: ChecksumType) -> Vec<u8> {
    match algorithm {
        ChecksumType::Sum8 => vec![sum8_checksum(data)],
        ChecksumType::Crc16Xmodem => crc16_xmodem(data).to_be_bytes().to_vec(),
    }
}

/// Verify checksum
pub fn verify(data: &[u8], checksum: &[u8], algorithm: ChecksumType) -> bool {
    calculate(data, algorithm) == checksum
}

/// Simple 8-bit sum
pub fn sum8_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// CRC-16/XMODEM
/// Polynomial: 0x1021, Init: 0x0000, RefIn: false, RefOut: false
pub fn crc16_xmodem(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| crc16_update(crc, byte))
}

/// Feed one byte into a running CRC-16/XMODEM value
pub fn crc16_update(mut crc: u16, byte: u8) -> u16 {
    crc ^= u16::from(byte) << 8;
    for _ in 0..8 {
        if crc & 0x8000 != 0 {
            crc = (crc << 1) ^ 0x1021;
        } else {
            crc <<= 1;
        }
    }
    crc
}
