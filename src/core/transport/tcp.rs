//! TCP channel implementation

use super::{ByteChannel, ChannelError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

/// TCP connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Host address
    pub host: String,
    /// Port number
    pub port: u16,
    /// Connection timeout in seconds
    pub timeout_secs: u64,
}

impl TcpConfig {
    /// Create a new TCP configuration
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeout_secs: 10,
        }
    }

    /// Set timeout
    #[must_use]
    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self::new("localhost", 23)
    }
}

/// Byte channel over a TCP stream
pub struct TcpChannel {
    stream: Option<TcpStream>,
    buffer: VecDeque<u8>,
    peer: String,
}

impl TcpChannel {
    /// Dial the configured host
    pub async fn connect(config: &TcpConfig) -> Result<Self, ChannelError> {
        let addr = config.address();

        let stream = tokio::time::timeout(
            Duration::from_secs(config.timeout_secs),
            TcpStream::connect(&addr),
        )
        .await
        .map_err(|_| ChannelError::Timeout(config.timeout_secs))?
        .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;

        Self::from_stream(stream, addr)
    }

    /// Wait for a single inbound connection on the configured address
    pub async fn accept(config: &TcpConfig) -> Result<Self, ChannelError> {
        let listener = TcpListener::bind(config.address()).await?;
        tracing::info!("Waiting for peer on {}", config.address());
        let (stream, peer) = listener.accept().await?;
        Self::from_stream(stream, peer.to_string())
    }

    fn from_stream(stream: TcpStream, peer: String) -> Result<Self, ChannelError> {
        // Per-byte replies must not sit in Nagle's buffer
        stream.set_nodelay(true).map_err(ChannelError::IoError)?;
        tracing::debug!("TCP channel open to {}", peer);
        Ok(Self {
            stream: Some(stream),
            buffer: VecDeque::with_capacity(4096),
            peer,
        })
    }

    /// Remote address
    pub fn peer(&self) -> &str {
        &self.peer
    }

    fn fill(&mut self) {
        let Some(stream) = self.stream.as_ref() else {
            return;
        };

        let mut chunk = [0u8; 4096];
        match stream.try_read(&mut chunk) {
            Ok(0) => {
                tracing::debug!("Peer {} closed the connection", self.peer);
                self.stream = None;
            }
            Ok(n) => self.buffer.extend(&chunk[..n]),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                tracing::warn!("TCP read from {} failed: {}", self.peer, e);
                self.stream = None;
            }
        }
    }
}

#[async_trait]
impl ByteChannel for TcpChannel {
    fn read_available(&mut self) -> bool {
        if self.buffer.is_empty() {
            self.fill();
        }
        !self.buffer.is_empty()
    }

    fn read_byte(&mut self) -> Option<u8> {
        if self.buffer.is_empty() {
            self.fill();
        }
        self.buffer.pop_front()
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        let stream = self.stream.as_mut().ok_or(ChannelError::Disconnected)?;
        stream.write_all(data).await.map_err(ChannelError::IoError)?;
        stream.flush().await.map_err(ChannelError::IoError)?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn disconnect(&mut self) -> Result<(), ChannelError> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await.ok();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_channel_exchanges_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(&[0x43]).await.unwrap();
            let mut reply = [0u8; 1];
            tokio::io::AsyncReadExt::read_exact(&mut stream, &mut reply).await.unwrap();
            reply[0]
        });

        let mut channel = TcpChannel::connect(&TcpConfig::new("127.0.0.1", port)).await.unwrap();
        let mut waited = 0;
        while !channel.read_available() && waited < 200 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            waited += 1;
        }
        assert_eq!(channel.read_byte(), Some(0x43));
        channel.write(&[0x06]).await.unwrap();
        assert_eq!(server.await.unwrap(), 0x06);

        channel.disconnect().await.unwrap();
        assert!(!channel.is_connected());
    }
}
