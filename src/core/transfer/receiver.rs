//! Inbound state machine
//!
//! `RequestStart -> AwaitBlock -> {Accept | DuplicateAck | Error | Done}`

use super::{
    send_cancel, wait_for_byte, BlockOutcome, ReceiveReport, ReceivedFile, TransferError,
    TransferSession, TransferStatus,
};
use crate::core::protocol::control::{ACK, CAN, CRC_REQUEST, EOT, NAK, SOH, STX};
use crate::core::protocol::{decode_block, BatchHeader, FrameError, FrameKind};
use crate::core::transport::ByteChannel;
use tokio::time::Instant;

struct Inbound<'a> {
    channel: &'a mut dyn ByteChannel,
    session: &'a mut TransferSession,
    prefer_crc: bool,
    files: Vec<ReceivedFile>,
    bytes: u64,
    blocks: u64,
}

/// Strip any directory part a sender put in a file name
fn bare_name(name: &str) -> &str {
    name.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(name)
}

impl<'a> Inbound<'a> {
    fn new(channel: &'a mut dyn ByteChannel, session: &'a mut TransferSession) -> Self {
        let prefer_crc = session.use_crc();
        Self {
            channel,
            session,
            prefer_crc,
            files: Vec::new(),
            bytes: 0,
            blocks: 0,
        }
    }

    fn start_char(&self) -> u8 {
        if self.session.use_crc() {
            CRC_REQUEST
        } else {
            NAK
        }
    }

    /// Ask for the first block until something frame-like arrives
    ///
    /// Returns the marker (SOH, STX or EOT) already taken off the wire.
    async fn request_start(&mut self) -> Result<u8, TransferError> {
        let tuning = self.session.tuning().clone();
        let mut cans = 0;

        for attempt in 0..tuning.start_attempts {
            let crc = self.prefer_crc && attempt < tuning.crc_fallback_after;
            if self.session.use_crc() != crc {
                tracing::debug!("Falling back to checksum mode");
            }
            self.session.set_crc(crc);
            let request = self.start_char();
            self.channel.write(&[request]).await?;

            let deadline = Instant::now() + tuning.block_timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match wait_for_byte(&mut *self.channel, self.session, remaining).await? {
                    Some(marker @ (SOH | STX | EOT)) => return Ok(marker),
                    Some(CAN) => {
                        cans += 1;
                        if cans >= 2 {
                            return Err(TransferError::PeerCancelled);
                        }
                    }
                    Some(_) => cans = 0,
                    None => break,
                }
            }
        }

        Err(TransferError::StartTimeout)
    }

    /// Read and classify whatever comes next
    async fn next_block(&mut self, pending: Option<u8>) -> BlockOutcome {
        let block_timeout = self.session.tuning().block_timeout;
        let byte_timeout = self.session.tuning().byte_timeout;

        let marker = match pending {
            Some(marker) => marker,
            None => match wait_for_byte(&mut *self.channel, self.session, block_timeout).await {
                Err(_) => return BlockOutcome::Cancelled,
                Ok(None) => return BlockOutcome::TimedOut,
                Ok(Some(byte)) => byte,
            },
        };

        match marker {
            EOT => return BlockOutcome::EndOfTransfer,
            CAN => return BlockOutcome::PeerCancelled,
            _ => {}
        }
        let Some(kind) = FrameKind::from_marker(marker) else {
            return BlockOutcome::Malformed(FrameError::BadMarker(marker));
        };

        let len = kind.frame_len(self.session.use_crc());
        let mut frame = Vec::with_capacity(len);
        frame.push(marker);
        while frame.len() < len {
            match wait_for_byte(&mut *self.channel, self.session, byte_timeout).await {
                Err(_) => return BlockOutcome::Cancelled,
                Ok(None) => {
                    return BlockOutcome::Malformed(FrameError::BadLength {
                        kind,
                        actual: frame.len(),
                    })
                }
                Ok(Some(byte)) => frame.push(byte),
            }
        }

        let expected = self.session.block_number();
        match decode_block(&frame) {
            Ok(block) if block.block_number() == expected => BlockOutcome::Accepted(block),
            Ok(block) if block.block_number() == expected.wrapping_sub(1) => {
                BlockOutcome::DuplicateAck
            }
            Ok(block) => BlockOutcome::OutOfSequence {
                expected,
                received: block.block_number(),
            },
            Err(FrameError::ChecksumMismatch { .. }) => BlockOutcome::BadChecksum,
            Err(FrameError::CrcMismatch { .. }) => BlockOutcome::BadCrc,
            Err(e) => BlockOutcome::Malformed(e),
        }
    }

    /// Wait for YMODEM block 0; `None` ends the batch
    async fn receive_header(&mut self) -> Result<Option<BatchHeader>, TransferError> {
        self.session.set_block_number(0);
        let mut pending = Some(self.request_start().await?);
        let mut cans = 0;

        loop {
            let outcome = self.next_block(pending.take()).await;
            if outcome != BlockOutcome::PeerCancelled {
                cans = 0;
            }

            match outcome {
                BlockOutcome::Accepted(block) => match BatchHeader::parse(block.payload()) {
                    Ok(header) => {
                        self.channel.write(&[ACK]).await?;
                        self.session.record_success();
                        return Ok(header);
                    }
                    Err(e) => {
                        self.session.record_error()?;
                        tracing::warn!(errors = self.session.consecutive_errors(), "{}", e);
                        self.channel.write(&[NAK]).await?;
                    }
                },
                // Our ACK of the last EOT got lost
                BlockOutcome::EndOfTransfer | BlockOutcome::DuplicateAck => {
                    self.channel.write(&[ACK]).await?;
                }
                BlockOutcome::PeerCancelled => {
                    cans += 1;
                    if cans >= 2 {
                        return Err(TransferError::PeerCancelled);
                    }
                }
                BlockOutcome::Cancelled => return Err(TransferError::SessionCancelled),
                failure => {
                    self.session.record_error()?;
                    tracing::warn!(
                        errors = self.session.consecutive_errors(),
                        "Bad header block: {:?}",
                        failure
                    );
                    let request = self.start_char();
                    self.channel.write(&[request]).await?;
                }
            }
        }
    }

    /// Receive data blocks of one file through its EOT handshake
    async fn receive_blocks(
        &mut self,
        name: &str,
        header: Option<&BatchHeader>,
        marker: u8,
    ) -> Result<ReceivedFile, TransferError> {
        let limit = header.and_then(|h| h.length);
        let mut data = Vec::new();
        let mut pending = Some(marker);
        let mut accepted: u64 = 0;
        let mut total_blocks = None;
        let mut eots = 0;
        let mut cans = 0;
        self.session.set_block_number(1);

        loop {
            let outcome = self.next_block(pending.take()).await;
            if outcome != BlockOutcome::EndOfTransfer {
                eots = 0;
            }
            if outcome != BlockOutcome::PeerCancelled {
                cans = 0;
            }

            match outcome {
                BlockOutcome::Accepted(block) => {
                    let payload = block.payload();
                    let take = match limit {
                        Some(limit) => {
                            let left = limit.saturating_sub(data.len() as u64);
                            payload.len().min(usize::try_from(left).unwrap_or(usize::MAX))
                        }
                        None => payload.len(),
                    };
                    data.extend_from_slice(&payload[..take]);
                    if total_blocks.is_none() {
                        total_blocks = header.and_then(|h| h.total_blocks(block.frame_kind()));
                    }

                    self.channel.write(&[ACK]).await?;
                    self.session.record_success();
                    tracing::debug!(block = block.block_number(), len = take, "Block accepted");
                    self.session.advance();
                    accepted += 1;
                    self.blocks += 1;
                    self.bytes += take as u64;
                    self.session
                        .publish(name, data.len() as u64, limit, accepted, total_blocks);
                }
                BlockOutcome::DuplicateAck => {
                    tracing::debug!("Duplicate block, re-acknowledging");
                    self.channel.write(&[ACK]).await?;
                }
                BlockOutcome::EndOfTransfer => {
                    eots += 1;
                    if eots >= 2 {
                        self.channel.write(&[ACK]).await?;
                        break;
                    }
                    self.channel.write(&[NAK]).await?;
                }
                BlockOutcome::PeerCancelled => {
                    cans += 1;
                    if cans >= 2 {
                        return Err(TransferError::PeerCancelled);
                    }
                }
                BlockOutcome::Cancelled => return Err(TransferError::SessionCancelled),
                failure => {
                    self.session.record_error()?;
                    tracing::warn!(
                        block = self.session.block_number(),
                        errors = self.session.consecutive_errors(),
                        "Rejected block: {:?}",
                        failure
                    );
                    // Until the first block lands the sender is still waiting to start
                    let reply = if accepted == 0 { self.start_char() } else { NAK };
                    self.channel.write(&[reply]).await?;
                }
            }
        }

        tracing::info!(file = name, bytes = data.len(), blocks = accepted, "File received");
        Ok(ReceivedFile {
            name: bare_name(name).to_string(),
            declared_length: limit,
            modified: header.and_then(|h| h.modified),
            data,
        })
    }

    async fn xmodem(&mut self, name: &str) -> Result<(), TransferError> {
        let marker = self.request_start().await?;
        let file = self.receive_blocks(name, None, marker).await?;
        self.files.push(file);
        Ok(())
    }

    async fn ymodem(&mut self) -> Result<(), TransferError> {
        while let Some(header) = self.receive_header().await? {
            tracing::info!(file = %header.name, length = ?header.length, "Receiving");
            let marker = self.request_start().await?;
            let file = self.receive_blocks(&header.name, Some(&header), marker).await?;
            self.files.push(file);
        }
        Ok(())
    }

    async fn finish(self, result: Result<(), TransferError>) -> ReceiveReport {
        let status = match result {
            Ok(()) => {
                tracing::info!(
                    files = self.files.len(),
                    bytes = self.bytes,
                    errors = self.session.total_errors(),
                    "Receive complete"
                );
                TransferStatus::Complete
            }
            Err(e) => {
                tracing::error!(bytes = self.bytes, "Receive aborted: {}", e);
                send_cancel(self.channel, &e).await;
                TransferStatus::Aborted(e)
            }
        };

        ReceiveReport {
            files: self.files,
            bytes: self.bytes,
            blocks: self.blocks,
            total_errors: self.session.total_errors(),
            status,
        }
    }
}

/// Receive one file with XMODEM
///
/// The session's CRC setting is the preferred mode; `name` labels the
/// result since plain XMODEM carries no file name. The data keeps the
/// sender's padding.
pub async fn receive_file(
    channel: &mut dyn ByteChannel,
    session: &mut TransferSession,
    name: &str,
) -> ReceiveReport {
    tracing::info!(file = name, crc = session.use_crc(), "Starting XMODEM receive");
    let mut inbound = Inbound::new(channel, session);
    let result = inbound.xmodem(name).await;
    inbound.finish(result).await
}

/// Receive a YMODEM batch until the sender's empty header
pub async fn receive_batch(
    channel: &mut dyn ByteChannel,
    session: &mut TransferSession,
) -> ReceiveReport {
    tracing::info!("Starting YMODEM batch receive");
    let mut inbound = Inbound::new(channel, session);
    let result = inbound.ymodem().await;
    inbound.finish(result).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::encode_block;
    use crate::core::transfer::{CancelFlag, TransferTuning};
    use crate::core::transport::LoopbackChannel;

    fn session() -> TransferSession {
        TransferSession::new(TransferTuning::default(), CancelFlag::new())
    }

    fn corrupt(number: u8) -> Vec<u8> {
        let mut frame = encode_block(number, b"payload", FrameKind::Short, true).unwrap();
        frame[5] ^= 0xFF;
        frame
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_requests_fall_back_to_nak() {
        let (mut local, remote) = LoopbackChannel::pair();
        let mut session = session();
        let report = receive_file(&mut local, &mut session, "A").await;

        assert!(matches!(report.error(), Some(TransferError::StartTimeout)));
        let wire = remote.take_received();
        assert_eq!(&wire[..5], &[CRC_REQUEST; 5]);
        assert_eq!(&wire[5..10], &[NAK; 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nine_errors_then_success() {
        let (mut local, remote) = LoopbackChannel::pair();
        for _ in 0..9 {
            remote.send_now(&corrupt(1));
        }
        remote.send_now(&encode_block(1, b"hello", FrameKind::Short, true).unwrap());
        remote.send_now(&[EOT, EOT]);

        let mut session = session();
        let report = receive_file(&mut local, &mut session, "A").await;

        assert!(report.is_complete());
        assert_eq!(report.total_errors, 9);
        let file = &report.files[0];
        assert_eq!(file.data.len(), 128);
        assert_eq!(&file.data[..5], b"hello");
        assert!(remote.take_received().ends_with(&[ACK, NAK, ACK]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tenth_error_aborts() {
        let (mut local, remote) = LoopbackChannel::pair();
        for _ in 0..10 {
            remote.send_now(&corrupt(1));
        }
        remote.send_now(&encode_block(1, b"late", FrameKind::Short, true).unwrap());

        let mut session = session();
        let report = receive_file(&mut local, &mut session, "A").await;

        assert!(matches!(report.error(), Some(TransferError::TooManyErrors(10))));
        assert!(report.files.is_empty());
        assert!(remote.take_received().ends_with(&[CAN, CAN]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_is_acked_not_written() {
        let (mut local, remote) = LoopbackChannel::pair();
        let block = encode_block(1, b"once", FrameKind::Short, true).unwrap();
        remote.send_now(&block);
        remote.send_now(&block);
        remote.send_now(&[EOT, EOT]);

        let mut session = session();
        let report = receive_file(&mut local, &mut session, "A").await;

        assert!(report.is_complete());
        assert_eq!(report.blocks, 1);
        assert_eq!(report.total_errors, 0);
        assert_eq!(report.files[0].data.len(), 128);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_sequence_is_an_error() {
        let (mut local, remote) = LoopbackChannel::pair();
        remote.send_now(&encode_block(1, b"one", FrameKind::Short, true).unwrap());
        remote.send_now(&encode_block(5, b"five", FrameKind::Short, true).unwrap());
        remote.send_now(&encode_block(2, b"two", FrameKind::Short, true).unwrap());
        remote.send_now(&[EOT, EOT]);

        let mut session = session();
        let report = receive_file(&mut local, &mut session, "A").await;

        assert!(report.is_complete());
        assert_eq!(report.total_errors, 1);
        assert_eq!(&report.files[0].data[128..131], b"two");
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_cans_abort_quietly() {
        let (mut local, remote) = LoopbackChannel::pair();
        remote.send_now(&encode_block(1, b"one", FrameKind::Short, true).unwrap());
        remote.send_now(&[CAN, CAN]);

        let mut session = session();
        let report = receive_file(&mut local, &mut session, "A").await;

        assert!(matches!(report.error(), Some(TransferError::PeerCancelled)));
        assert_eq!(report.bytes, 128);
        assert_eq!(remote.take_received(), vec![CRC_REQUEST, ACK]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_header_truncates_and_strips_path() {
        let (mut local, remote) = LoopbackChannel::pair();
        let header = BatchHeader::new("upload/dir/NOTES.TXT", 5);
        remote.send_now(&crate::core::protocol::TransferBlock::header(&header, true).unwrap().encode());
        remote.send_now(&encode_block(1, b"hello world", FrameKind::Short, true).unwrap());
        remote.send_now(&[EOT, EOT]);
        remote.send_now(&crate::core::protocol::TransferBlock::end_of_batch(true).encode());

        let mut session = session();
        let report = receive_batch(&mut local, &mut session).await;

        assert!(report.is_complete());
        assert_eq!(report.files.len(), 1);
        assert_eq!(report.files[0].name, "NOTES.TXT");
        assert_eq!(report.files[0].data, b"hello");
        assert_eq!(report.files[0].declared_length, Some(5));
    }

    async fn wait_for_pending(remote: &LoopbackChannel, len: usize) {
        while remote.pending() < len {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
    }

    /// Feeds block 1, reads its ACK, then runs `stop`
    async fn first_block_then(remote: &LoopbackChannel, stop: impl FnOnce()) -> Vec<u8> {
        wait_for_pending(remote, 1).await;
        let start = remote.take_received();
        remote.send_now(&encode_block(1, &[9u8; 128], FrameKind::Short, true).unwrap());
        wait_for_pending(remote, 1).await;
        let mut seen = start;
        seen.extend(remote.take_received());
        stop();
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_cancel_after_first_block_sends_can() {
        let (mut local, remote) = LoopbackChannel::pair();
        let cancel = CancelFlag::new();
        let mut session = TransferSession::new(TransferTuning::default(), cancel.clone());

        let (report, seen) = tokio::join!(
            receive_file(&mut local, &mut session, "A"),
            first_block_then(&remote, || cancel.cancel())
        );

        assert_eq!(seen, vec![CRC_REQUEST, ACK]);
        assert!(matches!(report.error(), Some(TransferError::SessionCancelled)));
        assert_eq!(report.bytes, 128);
        assert_eq!(remote.take_received(), vec![CAN, CAN]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_up_after_first_block_sends_nothing() {
        let (mut local, remote) = LoopbackChannel::pair();
        let mut session = session();

        let (report, seen) = tokio::join!(
            receive_file(&mut local, &mut session, "A"),
            first_block_then(&remote, || remote.hang_up())
        );

        assert_eq!(seen, vec![CRC_REQUEST, ACK]);
        assert!(matches!(report.error(), Some(TransferError::SessionCancelled)));
        assert_eq!(report.bytes, 128);
        assert!(remote.take_received().is_empty());
    }

    #[test]
    fn test_bare_name() {
        assert_eq!(bare_name("a/b/C.ZIP"), "C.ZIP");
        assert_eq!(bare_name("C:\\DL\\X.ARC"), "X.ARC");
        assert_eq!(bare_name("PLAIN"), "PLAIN");
    }
}
