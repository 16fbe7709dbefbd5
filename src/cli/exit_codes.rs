//! CLI Exit Codes
//!
//! Standard exit codes for CLI transfers and automation.

use crate::config::ConfigError;
use crate::core::dispatch::DispatchError;
use crate::core::external::ExternalError;
use crate::core::transfer::TransferError;
use crate::core::transport::ChannelError;
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Connection failed or dropped
    pub const CONNECTION_FAILED: u8 = 3;

    /// Peer never started or stopped answering
    pub const TIMEOUT: u8 = 4;

    /// File not found
    pub const FILE_NOT_FOUND: u8 = 5;

    /// Permission denied
    pub const PERMISSION_DENIED: u8 = 6;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 7;

    /// Malformed block that could not be recovered
    pub const PROTOCOL_ERROR: u8 = 8;

    /// Error budget exhausted
    pub const TRANSFER_FAILED: u8 = 9;

    /// Cancelled locally
    pub const CANCELLED: u8 = 10;

    /// Cancelled by the peer
    pub const REMOTE_CANCELLED: u8 = 11;

    /// Batch queue refused the file
    pub const QUEUE_REJECTED: u8 = 12;

    /// External protocol program failed
    pub const EXTERNAL_FAILED: u8 = 13;

    /// Some files of a batch did not go through
    pub const PARTIAL_BATCH: u8 = 14;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Plain success
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Success with a summary line
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success(Some(msg.into()))
    }

    /// Failure with an explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Connection could not be made
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::Error(ExitCodes::CONNECTION_FAILED, msg.into())
    }

    /// Input file missing
    pub fn file_not_found(path: &str) -> Self {
        Self::Error(ExitCodes::FILE_NOT_FOUND, format!("File not found: {path}"))
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Convert to `ExitCode`
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

fn io_code(err: &std::io::Error) -> u8 {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::NotFound => ExitCodes::FILE_NOT_FOUND,
        ErrorKind::PermissionDenied => ExitCodes::PERMISSION_DENIED,
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => {
            ExitCodes::CONNECTION_FAILED
        }
        ErrorKind::TimedOut => ExitCodes::TIMEOUT,
        _ => ExitCodes::ERROR,
    }
}

impl From<std::io::Error> for CliResult {
    fn from(err: std::io::Error) -> Self {
        Self::Error(io_code(&err), err.to_string())
    }
}

impl From<&ChannelError> for CliResult {
    fn from(err: &ChannelError) -> Self {
        let code = match err {
            ChannelError::Timeout(_) => ExitCodes::TIMEOUT,
            ChannelError::IoError(e) => io_code(e),
            ChannelError::ConnectionFailed(_) | ChannelError::Disconnected => ExitCodes::CONNECTION_FAILED,
        };
        Self::Error(code, err.to_string())
    }
}

impl From<&TransferError> for CliResult {
    fn from(err: &TransferError) -> Self {
        let code = match err {
            TransferError::Frame(_) => ExitCodes::PROTOCOL_ERROR,
            TransferError::StartTimeout => ExitCodes::TIMEOUT,
            TransferError::TooManyErrors(_) => ExitCodes::TRANSFER_FAILED,
            TransferError::PeerCancelled => ExitCodes::REMOTE_CANCELLED,
            TransferError::SessionCancelled => ExitCodes::CANCELLED,
            TransferError::Channel(e) => return Self::from(e),
            TransferError::Io(e) => io_code(e),
        };
        Self::Error(code, err.to_string())
    }
}

impl From<&DispatchError> for CliResult {
    fn from(err: &DispatchError) -> Self {
        let code = match err {
            DispatchError::Unsupported { .. } | DispatchError::NoDelegate => ExitCodes::INVALID_ARGS,
            DispatchError::Admission(_) => ExitCodes::QUEUE_REJECTED,
            DispatchError::External(ExternalError::Spawn(e) | ExternalError::Manifest(e))
            | DispatchError::Io(e) => io_code(e),
            DispatchError::Commit(e) => io_code(&e.source),
            DispatchError::External(_) => ExitCodes::EXTERNAL_FAILED,
        };
        Self::Error(code, err.to_string())
    }
}

impl From<&ConfigError> for CliResult {
    fn from(err: &ConfigError) -> Self {
        Self::Error(ExitCodes::CONFIG_ERROR, err.to_string())
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Connection failed",
        4 => "Timed out",
        5 => "File not found",
        6 => "Permission denied",
        7 => "Configuration error",
        8 => "Protocol error",
        9 => "Transfer failed",
        10 => "Cancelled",
        11 => "Cancelled by remote",
        12 => "Rejected by batch queue",
        13 => "External protocol failed",
        14 => "Batch partially transferred",
        127 => "Internal error",
        _ => "Unknown error",
    }
}

/// Print exit code table
pub fn print_exit_codes() {
    println!("Exit Codes:");
    for code in (0..=14).chain([127]) {
        println!("  {:>3}  {}", code, exit_code_description(code));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::batch::{AdmissionDenied, BatchEntry, CommitError, DirectoryId, Direction};
    use crate::core::protocol::FrameError;

    #[test]
    fn test_cli_result() {
        let success = CliResult::success();
        assert!(success.is_success());
        assert_eq!(success.code(), 0);

        let error = CliResult::error(3, "Connection failed");
        assert!(!error.is_success());
        assert_eq!(error.code(), 3);
        assert_eq!(error.message(), Some("Connection failed"));
    }

    #[test]
    fn test_from_io_error() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let result = CliResult::from(err);
        assert_eq!(result.code(), ExitCodes::FILE_NOT_FOUND);
    }

    #[test]
    fn test_transfer_errors() {
        let code = |e: TransferError| CliResult::from(&e).code();
        assert_eq!(code(TransferError::TooManyErrors(10)), ExitCodes::TRANSFER_FAILED);
        assert_eq!(code(TransferError::StartTimeout), ExitCodes::TIMEOUT);
        assert_eq!(code(TransferError::PeerCancelled), ExitCodes::REMOTE_CANCELLED);
        assert_eq!(code(TransferError::SessionCancelled), ExitCodes::CANCELLED);
        assert_eq!(code(TransferError::Frame(FrameError::Empty)), ExitCodes::PROTOCOL_ERROR);
        assert_eq!(
            code(TransferError::Channel(ChannelError::Disconnected)),
            ExitCodes::CONNECTION_FAILED
        );
    }

    #[test]
    fn test_dispatch_errors() {
        let rejected = DispatchError::Admission(AdmissionDenied::NotQueueable);
        assert_eq!(CliResult::from(&rejected).code(), ExitCodes::QUEUE_REJECTED);
        let failed = DispatchError::External(ExternalError::ExternalProcessFailed { code: 2 });
        assert_eq!(CliResult::from(&failed).code(), ExitCodes::EXTERNAL_FAILED);
        let refused = DispatchError::Commit(CommitError {
            entry: BatchEntry::new("up.zip", DirectoryId::Area(1), 1, Direction::Upload),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only area"),
        });
        assert_eq!(CliResult::from(&refused).code(), ExitCodes::PERMISSION_DENIED);
    }

    #[test]
    fn test_every_code_described() {
        for code in (0..=14).chain([127]) {
            assert_ne!(exit_code_description(code), "Unknown error");
        }
    }
}
