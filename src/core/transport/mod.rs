//! Byte channels the transfer engine runs over
//!
//! The engine only needs a polled byte stream: check whether a byte is
//! waiting, take it, write a burst, and ask whether the peer is still there.
//!
//! Supports:
//! - In-memory loopback pairs (tests, demos)
//! - Raw TCP connections

mod loopback;
mod tcp;

pub use loopback::LoopbackChannel;
pub use tcp::{TcpChannel, TcpConfig};

use async_trait::async_trait;
use thiserror::Error;

/// Channel error types
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection timeout
    #[error("Connection timeout after {0} seconds")]
    Timeout(u64),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Peer hung up
    #[error("Disconnected")]
    Disconnected,
}

/// Polled byte stream between this end and the remote peer
#[async_trait]
pub trait ByteChannel: Send {
    /// True when at least one received byte is waiting
    fn read_available(&mut self) -> bool;

    /// Take the next received byte, if any
    fn read_byte(&mut self) -> Option<u8>;

    /// Write a burst of bytes to the peer
    async fn write(&mut self, data: &[u8]) -> Result<(), ChannelError>;

    /// Check if the peer is still connected
    fn is_connected(&self) -> bool;

    /// Drop the connection
    async fn disconnect(&mut self) -> Result<(), ChannelError>;

    /// Discard everything currently waiting, returning how many bytes were dropped
    fn purge(&mut self) -> usize {
        let mut dropped = 0;
        while self.read_available() {
            if self.read_byte().is_none() {
                break;
            }
            dropped += 1;
        }
        dropped
    }
}
