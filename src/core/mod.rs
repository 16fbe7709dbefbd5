//! Core module containing the transfer engine
//!
//! This module provides:
//! - Block framing for XMODEM/YMODEM (checksum and CRC-16)
//! - Byte channels (loopback pair, TCP)
//! - Sender and receiver state machines
//! - Protocol registry with key bindings and a remembered default
//! - Batch queue with time and ratio admission
//! - External protocol delegate (ZMODEM engine, DSZ-style programs)
//! - Transfer context and dispatch

pub mod batch;
pub mod context;
pub mod dispatch;
pub mod external;
pub mod protocol;
pub mod registry;
pub mod transfer;
pub mod transport;
