//! Native XMODEM/YMODEM transfer engine
//!
//! Both state machines run as polling loops over a [`ByteChannel`]: every
//! wait checks the session's cancel flag and the link state, then yields to
//! the runtime for one poll interval. A single transfer owns its
//! [`TransferSession`] for its whole lifetime.

mod receiver;
mod sender;

pub use receiver::{receive_batch, receive_file};
pub use sender::{send_batch, send_file, OutgoingFile, YmodemBatch};

use crate::core::batch::{estimated_time, DEFAULT_ETA_FACTOR};
use crate::core::protocol::control::{ACK, CAN, CRC_REQUEST, NAK};
use crate::core::protocol::{FrameError, TransferBlock};
use crate::core::transport::{ByteChannel, ChannelError};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Timing and retry limits of the native protocols
#[derive(Debug, Clone, PartialEq)]
pub struct TransferTuning {
    /// How long a sender waits for the receiver's start request
    pub start_timeout: Duration,
    /// How long a sender waits for the reply to one block
    pub ack_timeout: Duration,
    /// How long a receiver waits for the next block to begin
    pub block_timeout: Duration,
    /// Gap allowed between two bytes of the same frame
    pub byte_timeout: Duration,
    /// Start requests a receiver sends before giving up
    pub start_attempts: u32,
    /// Start requests sent as 'C' before falling back to NAK
    pub crc_fallback_after: u32,
    /// Retries after the first failure; one more consecutive error aborts
    pub max_retries: u32,
    /// Sleep between two polls of the channel
    pub poll_interval: Duration,
}

impl Default for TransferTuning {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(90),
            ack_timeout: Duration::from_secs(5),
            block_timeout: Duration::from_secs(10),
            byte_timeout: Duration::from_secs(1),
            start_attempts: 10,
            crc_fallback_after: 5,
            max_retries: 9,
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// Cooperative cancellation shared between a transfer and its controller
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create a flag in the not-cancelled state
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Check whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear a previous request
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Transfer errors
#[derive(Debug, Error)]
pub enum TransferError {
    /// Block could not be built or parsed
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Peer never asked for the first block
    #[error("Peer did not start the transfer")]
    StartTimeout,

    /// Consecutive error budget exhausted
    #[error("Too many errors ({0} in a row)")]
    TooManyErrors(u32),

    /// Peer sent CAN
    #[error("Cancelled by remote")]
    PeerCancelled,

    /// Local cancel or hang-up
    #[error("Session cancelled")]
    SessionCancelled,

    /// Channel failure
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Local file I/O
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Whether the peer should be told with CAN CAN
    fn notify_peer(&self) -> bool {
        !matches!(
            self,
            TransferError::PeerCancelled | TransferError::Channel(ChannelError::Disconnected)
        )
    }
}

/// Terminal state of a transfer
#[derive(Debug)]
pub enum TransferStatus {
    /// Every block and the end-of-file handshake went through
    Complete,
    /// Transfer stopped early
    Aborted(TransferError),
}

/// Result of an outbound transfer
#[derive(Debug)]
pub struct TransferReport {
    /// Payload bytes acknowledged by the peer
    pub bytes: u64,
    /// Data blocks acknowledged by the peer
    pub blocks: u64,
    /// Files fully sent
    pub files: usize,
    /// Errors over the whole transfer
    pub total_errors: u32,
    /// Terminal state
    pub status: TransferStatus,
}

impl TransferReport {
    /// Check for a clean finish
    pub fn is_complete(&self) -> bool {
        matches!(self.status, TransferStatus::Complete)
    }

    /// Fatal error, if the transfer aborted
    pub fn error(&self) -> Option<&TransferError> {
        match &self.status {
            TransferStatus::Complete => None,
            TransferStatus::Aborted(e) => Some(e),
        }
    }
}

/// A file taken off the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Name from the batch header, or the caller's label for plain XMODEM
    pub name: String,
    /// Length the sender declared, if any
    pub declared_length: Option<u64>,
    /// Modification time the sender declared, if any
    pub modified: Option<DateTime<Utc>>,
    /// File contents, truncated to the declared length when known
    pub data: Vec<u8>,
}

/// Result of an inbound transfer
#[derive(Debug)]
pub struct ReceiveReport {
    /// Completed files, in arrival order
    pub files: Vec<ReceivedFile>,
    /// Payload bytes accepted, including any partial file
    pub bytes: u64,
    /// Data blocks accepted
    pub blocks: u64,
    /// Errors over the whole transfer
    pub total_errors: u32,
    /// Terminal state
    pub status: TransferStatus,
}

impl ReceiveReport {
    /// Check for a clean finish
    pub fn is_complete(&self) -> bool {
        matches!(self.status, TransferStatus::Complete)
    }

    /// Fatal error, if the transfer aborted
    pub fn error(&self) -> Option<&TransferError> {
        match &self.status {
            TransferStatus::Complete => None,
            TransferStatus::Aborted(e) => Some(e),
        }
    }
}

/// Progress snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    /// File being moved
    pub file_name: String,
    /// Bytes of this file moved so far
    pub bytes: u64,
    /// Declared file size, when known
    pub file_size: Option<u64>,
    /// Blocks of this file moved so far
    pub block: u64,
    /// Blocks this file needs, when the size is known
    pub total_blocks: Option<u64>,
    /// Errors so far
    pub retries: u32,
    /// Seconds left at the current link speed, when the size is known
    pub eta_secs: Option<u64>,
}

impl TransferProgress {
    /// Get percentage complete
    pub fn percent(&self) -> Option<f32> {
        match self.file_size {
            Some(0) => Some(100.0),
            #[allow(clippy::cast_precision_loss)]
            Some(size) => Some((self.bytes as f32 / size as f32) * 100.0),
            None => None,
        }
    }
}

/// Reply a sender can get for a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderReply {
    /// Block accepted
    Ack,
    /// Resend, or checksum mode on the first block
    Nak,
    /// 'C': resend, or CRC mode on the first block
    CrcRequest,
    /// Receiver gave up
    Cancel,
    /// Nothing usable before the deadline
    TimedOut,
}

impl SenderReply {
    /// Classify a control byte; unrelated bytes are line noise
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            ACK => Some(SenderReply::Ack),
            NAK => Some(SenderReply::Nak),
            CRC_REQUEST => Some(SenderReply::CrcRequest),
            CAN => Some(SenderReply::Cancel),
            _ => None,
        }
    }
}

/// What a receiver made of the next thing on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// The expected block, intact
    Accepted(TransferBlock),
    /// The previous block again; its ACK was lost
    DuplicateAck,
    /// Arithmetic checksum mismatch
    BadChecksum,
    /// CRC mismatch
    BadCrc,
    /// Intact block with the wrong number
    OutOfSequence {
        /// Number the receiver wanted
        expected: u8,
        /// Number on the block
        received: u8,
    },
    /// Garbage, a short frame, or a bad block number complement
    Malformed(FrameError),
    /// Nothing arrived in time
    TimedOut,
    /// EOT
    EndOfTransfer,
    /// CAN
    PeerCancelled,
    /// Local cancel or hang-up
    Cancelled,
}

impl BlockOutcome {
    /// Whether this outcome counts against the error budget
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            BlockOutcome::BadChecksum
                | BlockOutcome::BadCrc
                | BlockOutcome::OutOfSequence { .. }
                | BlockOutcome::Malformed(_)
                | BlockOutcome::TimedOut
        )
    }
}

/// State of one transfer invocation
#[derive(Debug)]
pub struct TransferSession {
    tuning: TransferTuning,
    link_speed: u32,
    use_crc: bool,
    block_number: u8,
    consecutive_errors: u32,
    total_errors: u32,
    cancel: CancelFlag,
    progress: Option<mpsc::Sender<TransferProgress>>,
}

impl TransferSession {
    /// Create a session preferring CRC mode
    pub fn new(tuning: TransferTuning, cancel: CancelFlag) -> Self {
        Self {
            tuning,
            link_speed: 0,
            use_crc: true,
            block_number: 0,
            consecutive_errors: 0,
            total_errors: 0,
            cancel,
            progress: None,
        }
    }

    /// Set the initial validator mode (a receiver's preference)
    #[must_use]
    pub fn with_crc(mut self, use_crc: bool) -> Self {
        self.use_crc = use_crc;
        self
    }

    /// Set the link speed used for time estimates
    #[must_use]
    pub fn with_link_speed(mut self, bps: u32) -> Self {
        self.link_speed = bps;
        self
    }

    /// Publish progress snapshots to a channel
    #[must_use]
    pub fn with_progress(mut self, tx: mpsc::Sender<TransferProgress>) -> Self {
        self.progress = Some(tx);
        self
    }

    /// Tuning in effect
    pub fn tuning(&self) -> &TransferTuning {
        &self.tuning
    }

    /// Link speed in bits per second
    pub fn link_speed(&self) -> u32 {
        self.link_speed
    }

    /// Whether blocks carry a CRC
    pub fn use_crc(&self) -> bool {
        self.use_crc
    }

    /// Current block number
    pub fn block_number(&self) -> u8 {
        self.block_number
    }

    /// Errors since the last success
    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Errors over the whole session
    pub fn total_errors(&self) -> u32 {
        self.total_errors
    }

    /// Cancel flag of this session
    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub(crate) fn set_crc(&mut self, use_crc: bool) {
        self.use_crc = use_crc;
    }

    pub(crate) fn set_block_number(&mut self, number: u8) {
        self.block_number = number;
    }

    pub(crate) fn advance(&mut self) {
        self.block_number = self.block_number.wrapping_add(1);
    }

    /// Count one failure; errors out once the retry budget is spent
    pub fn record_error(&mut self) -> Result<(), TransferError> {
        self.consecutive_errors += 1;
        self.total_errors += 1;
        if self.consecutive_errors > self.tuning.max_retries {
            return Err(TransferError::TooManyErrors(self.consecutive_errors));
        }
        Ok(())
    }

    /// Reset the consecutive counter after a good exchange
    pub fn record_success(&mut self) {
        self.consecutive_errors = 0;
    }

    /// Fail if the session was cancelled or the peer hung up
    pub fn check_cancel(&self, channel: &dyn ByteChannel) -> Result<(), TransferError> {
        if self.cancel.is_cancelled() || !channel.is_connected() {
            return Err(TransferError::SessionCancelled);
        }
        Ok(())
    }

    pub(crate) fn publish(
        &self,
        file_name: &str,
        bytes: u64,
        file_size: Option<u64>,
        block: u64,
        total_blocks: Option<u64>,
    ) {
        let Some(tx) = &self.progress else {
            return;
        };
        let eta_secs = file_size.map(|size| {
            estimated_time(size.saturating_sub(bytes), self.link_speed, DEFAULT_ETA_FACTOR)
        });
        // A slow consumer only misses snapshots
        let _ = tx.try_send(TransferProgress {
            file_name: file_name.to_string(),
            bytes,
            file_size,
            block,
            total_blocks,
            retries: self.total_errors,
            eta_secs,
        });
    }
}

/// Wait up to `timeout` for one byte
///
/// Returns `Ok(None)` on timeout and `SessionCancelled` as soon as the
/// cancel flag is raised or the link drops.
pub async fn wait_for_byte(
    channel: &mut dyn ByteChannel,
    session: &TransferSession,
    timeout: Duration,
) -> Result<Option<u8>, TransferError> {
    let deadline = Instant::now() + timeout;
    loop {
        session.check_cancel(channel)?;
        if channel.read_available() {
            if let Some(byte) = channel.read_byte() {
                return Ok(Some(byte));
            }
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(session.tuning.poll_interval).await;
    }
}

/// Tell the peer we are giving up
pub(crate) async fn send_cancel(channel: &mut dyn ByteChannel, error: &TransferError) {
    if error.notify_peer() && channel.is_connected() {
        channel.write(&[CAN, CAN]).await.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::LoopbackChannel;

    #[test]
    fn test_abort_on_tenth_consecutive_error() {
        let mut session = TransferSession::new(TransferTuning::default(), CancelFlag::new());
        for _ in 0..9 {
            assert!(session.record_error().is_ok());
        }
        assert!(matches!(session.record_error(), Err(TransferError::TooManyErrors(10))));
        assert_eq!(session.total_errors(), 10);
    }

    #[test]
    fn test_success_resets_consecutive_only() {
        let mut session = TransferSession::new(TransferTuning::default(), CancelFlag::new());
        for _ in 0..9 {
            session.record_error().unwrap();
        }
        session.record_success();
        assert_eq!(session.consecutive_errors(), 0);
        assert_eq!(session.total_errors(), 9);
        for _ in 0..9 {
            assert!(session.record_error().is_ok());
        }
    }

    #[test]
    fn test_block_number_wraps() {
        let mut session = TransferSession::new(TransferTuning::default(), CancelFlag::new());
        session.set_block_number(255);
        session.advance();
        assert_eq!(session.block_number(), 0);
    }

    #[test]
    fn test_sender_reply_classification() {
        assert_eq!(SenderReply::from_byte(0x06), Some(SenderReply::Ack));
        assert_eq!(SenderReply::from_byte(0x15), Some(SenderReply::Nak));
        assert_eq!(SenderReply::from_byte(b'C'), Some(SenderReply::CrcRequest));
        assert_eq!(SenderReply::from_byte(0x18), Some(SenderReply::Cancel));
        assert_eq!(SenderReply::from_byte(b'x'), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_byte_times_out() {
        let (mut a, _b) = LoopbackChannel::pair();
        let session = TransferSession::new(TransferTuning::default(), CancelFlag::new());
        let started = Instant::now();
        let got = wait_for_byte(&mut a, &session, Duration::from_secs(5)).await.unwrap();
        assert_eq!(got, None);
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_byte_sees_cancel_and_hang_up() {
        let (mut a, b) = LoopbackChannel::pair();
        let cancel = CancelFlag::new();
        let session = TransferSession::new(TransferTuning::default(), cancel.clone());

        b.send_now(&[0x06]);
        assert_eq!(wait_for_byte(&mut a, &session, Duration::from_secs(1)).await.unwrap(), Some(0x06));

        cancel.cancel();
        assert!(matches!(
            wait_for_byte(&mut a, &session, Duration::from_secs(1)).await,
            Err(TransferError::SessionCancelled)
        ));

        cancel.reset();
        b.hang_up();
        assert!(matches!(
            wait_for_byte(&mut a, &session, Duration::from_secs(1)).await,
            Err(TransferError::SessionCancelled)
        ));
    }

    #[test]
    fn test_progress_percent() {
        let progress = TransferProgress {
            file_name: "A".into(),
            bytes: 512,
            file_size: Some(1024),
            block: 1,
            total_blocks: Some(2),
            retries: 0,
            eta_secs: None,
        };
        assert_eq!(progress.percent(), Some(50.0));
    }
}
