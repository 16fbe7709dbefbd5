//! # bbsxfer Core Library
//!
//! File transfer engine for BBS-style sessions:
//! - XMODEM, XMODEM-CRC, XMODEM-1K and YMODEM batch, sender and receiver
//! - Batch queue admitting files against a time budget and transfer ratio
//! - Protocol registry with per-listing key bindings
//! - External protocols (ZMODEM and DSZ-style programs) run as processes
//! - TOML configuration and a CLI with exit codes
//!
//! ## Example
//!
//! ```rust,no_run
//! use bbsxfer_core::{send_file, CancelFlag, FrameKind, TcpChannel, TcpConfig, TransferSession, TransferTuning};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut channel = TcpChannel::connect(&TcpConfig::new("localhost", 2323)).await?;
//!     let mut session = TransferSession::new(TransferTuning::default(), CancelFlag::new());
//!
//!     let data = std::fs::read("README.md")?;
//!     let report = send_file(&mut channel, &mut session, "README.md", &data, FrameKind::Long).await;
//!     println!("{} bytes, {} errors", report.bytes, report.total_errors);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes};
pub use crate::config::{ConfigError, XferConfig};
pub use crate::core::batch::{
    AdmissionDenied, BatchEntry, BatchQueue, BatchSettings, CommitError, DirectoryId, Direction,
};
pub use crate::core::context::{
    FileStore, LocalFileStore, SessionPolicy, TransferContext, TransferPolicyProvider,
};
pub use crate::core::dispatch::{BatchSummary, DispatchError, SingleOutcome};
pub use crate::core::external::{
    ExternalDelegate, ExternalError, ExternalOutcome, ExternalProcessRunner, ExternalProtocol,
    SystemProcessRunner,
};
pub use crate::core::protocol::{BatchHeader, FrameError, FrameKind, TransferBlock};
pub use crate::core::registry::{ProtocolId, ProtocolRegistry, ProtocolSelector, TransferKind};
pub use crate::core::transfer::{
    receive_batch, receive_file, send_batch, send_file, CancelFlag, OutgoingFile, ReceiveReport,
    TransferError, TransferProgress, TransferReport, TransferSession, TransferTuning,
};
pub use crate::core::transport::{ByteChannel, ChannelError, LoopbackChannel, TcpChannel, TcpConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
