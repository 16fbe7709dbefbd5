//! Outbound state machine
//!
//! `AwaitStart -> SendBlock -> AwaitAck -> {NextBlock | Retry | Aborted | Complete}`

use super::{
    send_cancel, wait_for_byte, SenderReply, TransferError, TransferReport, TransferSession,
    TransferStatus,
};
use crate::core::protocol::control::EOT;
use crate::core::protocol::{encode_block, BatchHeader, FrameKind, SHORT_BLOCK};
use crate::core::transport::ByteChannel;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::Path;
use tokio::time::Instant;

/// A file offered in a YMODEM batch
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    /// Block-0 description
    pub header: BatchHeader,
    /// File contents
    pub data: Bytes,
}

impl OutgoingFile {
    /// Describe in-memory contents under `name`
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            header: BatchHeader::new(name, data.len() as u64),
            data,
        }
    }

    /// Attach a modification time to the header
    #[must_use]
    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.header = self.header.with_modified(modified);
        self
    }

    /// Load a file from disk, keeping only its bare name
    pub async fn from_path(path: &Path) -> std::io::Result<Self> {
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map_or_else(|| "file".to_string(), |n| n.to_string_lossy().into_owned());
        let mut file = Self::new(name, data);
        if let Ok(modified) = tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
            file = file.with_modified(DateTime::<Utc>::from(modified));
        }
        Ok(file)
    }
}

struct Outbound<'a> {
    channel: &'a mut dyn ByteChannel,
    session: &'a mut TransferSession,
    bytes: u64,
    blocks: u64,
    files: usize,
}

impl<'a> Outbound<'a> {
    fn new(channel: &'a mut dyn ByteChannel, session: &'a mut TransferSession) -> Self {
        Self {
            channel,
            session,
            bytes: 0,
            blocks: 0,
            files: 0,
        }
    }

    /// Wait for 'C' or NAK and adopt the requested mode
    async fn await_start(&mut self) -> Result<(), TransferError> {
        let deadline = Instant::now() + self.session.tuning().start_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(byte) = wait_for_byte(&mut *self.channel, self.session, remaining).await? else {
                return Err(TransferError::StartTimeout);
            };
            match SenderReply::from_byte(byte) {
                Some(SenderReply::CrcRequest) => {
                    self.session.set_crc(true);
                    break;
                }
                Some(SenderReply::Nak) => {
                    self.session.set_crc(false);
                    break;
                }
                Some(SenderReply::Cancel) => return Err(TransferError::PeerCancelled),
                _ => {}
            }
        }

        // Repeated start requests must not be mistaken for block replies
        let stale = self.channel.purge();
        if stale > 0 {
            tracing::debug!("Discarded {} byte(s) queued behind the start request", stale);
        }
        tracing::debug!(crc = self.session.use_crc(), "Receiver ready");
        Ok(())
    }

    async fn await_reply(&mut self) -> Result<SenderReply, TransferError> {
        let deadline = Instant::now() + self.session.tuning().ack_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match wait_for_byte(&mut *self.channel, self.session, remaining).await? {
                Some(byte) => {
                    if let Some(reply) = SenderReply::from_byte(byte) {
                        return Ok(reply);
                    }
                }
                None => return Ok(SenderReply::TimedOut),
            }
        }
    }

    /// Send one block until it is acknowledged
    ///
    /// When `selects_mode` is set a NAK or 'C' reply also switches the
    /// validator before the resend.
    async fn transmit_block(
        &mut self,
        number: u8,
        payload: &[u8],
        frame_kind: FrameKind,
        selects_mode: bool,
    ) -> Result<(), TransferError> {
        loop {
            self.session.check_cancel(&*self.channel)?;
            let frame = encode_block(number, payload, frame_kind, self.session.use_crc())?;
            self.channel.write(&frame).await?;
            tracing::debug!(block = number, len = frame.len(), "Block sent");

            match self.await_reply().await? {
                SenderReply::Ack => {
                    self.session.record_success();
                    return Ok(());
                }
                SenderReply::Cancel => return Err(TransferError::PeerCancelled),
                reply @ (SenderReply::Nak | SenderReply::CrcRequest) => {
                    if selects_mode {
                        self.session.set_crc(reply == SenderReply::CrcRequest);
                    }
                    self.session.record_error()?;
                    tracing::warn!(
                        block = number,
                        errors = self.session.consecutive_errors(),
                        "Block rejected, resending"
                    );
                }
                SenderReply::TimedOut => {
                    self.session.record_error()?;
                    tracing::warn!(
                        block = number,
                        errors = self.session.consecutive_errors(),
                        "No reply to block, resending"
                    );
                }
            }
        }
    }

    async fn send_data(
        &mut self,
        name: &str,
        data: &[u8],
        frame_kind: FrameKind,
    ) -> Result<(), TransferError> {
        let size = data.len() as u64;
        let total_blocks = Some(size.div_ceil(frame_kind.payload_len() as u64));
        let mut offset = 0;
        let mut sent: u64 = 0;
        self.session.set_block_number(1);

        while offset < data.len() {
            let remaining = data.len() - offset;
            // A short tail goes out in a 128-byte frame
            let kind = if remaining <= SHORT_BLOCK {
                FrameKind::Short
            } else {
                frame_kind
            };
            let chunk = &data[offset..offset + remaining.min(kind.payload_len())];

            self.transmit_block(self.session.block_number(), chunk, kind, sent == 0)
                .await?;

            offset += chunk.len();
            sent += 1;
            self.bytes += chunk.len() as u64;
            self.blocks += 1;
            self.session.advance();
            self.session
                .publish(name, offset as u64, Some(size), sent, total_blocks);
        }
        Ok(())
    }

    /// EOT until ACK; the customary NAK of the first EOT is free
    async fn send_eot(&mut self) -> Result<(), TransferError> {
        let mut naks = 0;
        loop {
            self.session.check_cancel(&*self.channel)?;
            self.channel.write(&[EOT]).await?;

            match self.await_reply().await? {
                SenderReply::Ack => {
                    self.session.record_success();
                    return Ok(());
                }
                SenderReply::Cancel => return Err(TransferError::PeerCancelled),
                SenderReply::Nak | SenderReply::CrcRequest => {
                    naks += 1;
                    if naks > 1 {
                        self.session.record_error()?;
                    }
                }
                SenderReply::TimedOut => {
                    self.session.record_error()?;
                    tracing::warn!(errors = self.session.consecutive_errors(), "No reply to EOT");
                }
            }
        }
    }

    async fn xmodem(&mut self, name: &str, data: &[u8], frame_kind: FrameKind) -> Result<(), TransferError> {
        self.await_start().await?;
        self.send_data(name, data, frame_kind).await?;
        self.send_eot().await?;
        self.files += 1;
        Ok(())
    }

    async fn ymodem_file(&mut self, file: &OutgoingFile) -> Result<(), TransferError> {
        self.await_start().await?;
        let header = file.header.to_payload();
        self.transmit_block(0, &header, FrameKind::fitting(header.len()), true)
            .await?;
        tracing::info!(file = %file.header.name, bytes = file.data.len(), "Header accepted");

        self.await_start().await?;
        self.send_data(&file.header.name, &file.data, FrameKind::Long)
            .await?;
        self.send_eot().await?;
        self.files += 1;
        Ok(())
    }

    /// Empty header closes the batch
    async fn end_batch(&mut self) -> Result<(), TransferError> {
        self.await_start().await?;
        self.transmit_block(0, &[], FrameKind::Short, true).await
    }

    async fn finish(self, result: Result<(), TransferError>) -> TransferReport {
        let status = match result {
            Ok(()) => {
                tracing::info!(
                    bytes = self.bytes,
                    blocks = self.blocks,
                    errors = self.session.total_errors(),
                    "Send complete"
                );
                TransferStatus::Complete
            }
            Err(e) => {
                tracing::error!(bytes = self.bytes, "Send aborted: {}", e);
                send_cancel(self.channel, &e).await;
                TransferStatus::Aborted(e)
            }
        };

        TransferReport {
            bytes: self.bytes,
            blocks: self.blocks,
            files: self.files,
            total_errors: self.session.total_errors(),
            status,
        }
    }
}

/// Send one file with XMODEM
///
/// `frame_kind` picks 128-byte (XMODEM, XMODEM-CRC) or 1024-byte
/// (XMODEM-1K) blocks; the receiver's start request picks the validator.
pub async fn send_file(
    channel: &mut dyn ByteChannel,
    session: &mut TransferSession,
    name: &str,
    data: &[u8],
    frame_kind: FrameKind,
) -> TransferReport {
    tracing::info!(file = name, bytes = data.len(), "Starting XMODEM send");
    let mut outbound = Outbound::new(channel, session);
    let result = outbound.xmodem(name, data, frame_kind).await;
    outbound.finish(result).await
}

/// An open YMODEM batch, fed one file at a time
///
/// Lets the caller re-check its budget between files. A failed
/// [`send`](Self::send) leaves the batch unusable; pass the error to
/// [`close`](Self::close) to cancel the peer and get the report.
pub struct YmodemBatch<'a> {
    outbound: Outbound<'a>,
}

impl<'a> YmodemBatch<'a> {
    /// Open a batch on `channel`
    pub fn new(channel: &'a mut dyn ByteChannel, session: &'a mut TransferSession) -> Self {
        tracing::info!("Starting YMODEM batch send");
        Self {
            outbound: Outbound::new(channel, session),
        }
    }

    /// Send the next file: header, data blocks, EOT
    pub async fn send(&mut self, file: &OutgoingFile) -> Result<(), TransferError> {
        self.outbound.ymodem_file(file).await
    }

    /// Files sent so far
    pub fn files_sent(&self) -> usize {
        self.outbound.files
    }

    /// End the batch with the empty header, or abort it with `result`'s error
    pub async fn close(mut self, result: Result<(), TransferError>) -> TransferReport {
        let result = match result {
            Ok(()) => self.outbound.end_batch().await,
            Err(e) => Err(e),
        };
        self.outbound.finish(result).await
    }
}

/// Send a YMODEM batch
pub async fn send_batch(
    channel: &mut dyn ByteChannel,
    session: &mut TransferSession,
    files: &[OutgoingFile],
) -> TransferReport {
    let mut batch = YmodemBatch::new(channel, session);
    let mut result = Ok(());
    for file in files {
        result = batch.send(file).await;
        if result.is_err() {
            break;
        }
    }
    batch.close(result).await
}
