//! In-memory channel pair

use super::{ByteChannel, ChannelError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type Pipe = Arc<Mutex<VecDeque<u8>>>;

/// One end of an in-memory full-duplex link
///
/// Bytes written on one end become readable on the other. Disconnecting
/// either end hangs up both.
#[derive(Debug)]
pub struct LoopbackChannel {
    inbound: Pipe,
    outbound: Pipe,
    connected: Arc<AtomicBool>,
}

impl LoopbackChannel {
    /// Create two connected ends
    pub fn pair() -> (Self, Self) {
        let a_to_b: Pipe = Arc::default();
        let b_to_a: Pipe = Arc::default();
        let connected = Arc::new(AtomicBool::new(true));

        let a = Self {
            inbound: Arc::clone(&b_to_a),
            outbound: Arc::clone(&a_to_b),
            connected: Arc::clone(&connected),
        };
        let b = Self {
            inbound: a_to_b,
            outbound: b_to_a,
            connected,
        };
        (a, b)
    }

    /// Queue bytes for the peer without awaiting
    pub fn send_now(&self, data: &[u8]) {
        self.outbound.lock().extend(data.iter().copied());
    }

    /// Take every byte the peer has written so far
    pub fn take_received(&self) -> Vec<u8> {
        self.inbound.lock().drain(..).collect()
    }

    /// Bytes waiting to be read on this end
    pub fn pending(&self) -> usize {
        self.inbound.lock().len()
    }

    /// Hang up both ends
    pub fn hang_up(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl ByteChannel for LoopbackChannel {
    fn read_available(&mut self) -> bool {
        !self.inbound.lock().is_empty()
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.inbound.lock().pop_front()
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::Disconnected);
        }
        self.send_now(data);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&mut self) -> Result<(), ChannelError> {
        self.hang_up();
        Ok(())
    }
}
