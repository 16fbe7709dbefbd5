//! Collaborators a transfer runs against
//!
//! The session owner supplies a [`TransferPolicyProvider`] (time and ratio
//! accounting) and a [`FileStore`] (where files come from and go to), and
//! bundles them with the channel and queue into a [`TransferContext`] that
//! is passed explicitly to every dispatch entry point.

use crate::core::batch::{unalign_filename, BatchEntry, BatchQueue, DirectoryId, Direction};
use crate::core::external::ExternalDelegate;
use crate::core::transfer::{CancelFlag, TransferProgress, TransferSession, TransferTuning};
use crate::core::transport::ByteChannel;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Ratio reported when nothing has been downloaded yet
pub const UNLIMITED_RATIO: f64 = 99.999;

/// Cap on any computed ratio
pub const MAX_RATIO: f64 = 99.998;

/// Time and ratio accounting of the connected caller
#[cfg_attr(test, mockall::automock)]
pub trait TransferPolicyProvider {
    /// Seconds of connection time left; negative once overdrawn
    fn remaining_seconds(&self) -> i64;

    /// Current upload/download ratio
    fn ratio(&self) -> f64;

    /// Caller is exempt from ratio checks (and therefore from time checks)
    fn ratio_exempt(&self) -> bool;

    /// Ratio the caller must keep; 0 disables the check
    fn required_ratio(&self) -> f64;

    /// Caller is exempt from time checks
    fn time_exempt(&self) -> bool {
        false
    }

    /// Ratio after `extra_bytes` more have been downloaded
    fn projected_ratio(&self, _extra_bytes: u64) -> f64 {
        self.ratio()
    }
}

/// On-disk side of the file areas
#[cfg_attr(test, mockall::automock)]
pub trait FileStore {
    /// Record a finished transfer; uploads move into their area
    ///
    /// An error leaves the entry uncommitted; a staged upload stays where
    /// it was for [`discard`](Self::discard) to remove.
    fn commit(&mut self, entry: &BatchEntry) -> std::io::Result<()>;

    /// Drop whatever a failed upload left behind
    fn discard(&mut self, entry: &BatchEntry);

    /// Path an entry is read from (downloads) or written to (uploads)
    fn locate(&self, entry: &BatchEntry) -> Option<PathBuf>;

    /// Directory inbound files land in before they are committed
    fn staging_dir(&self) -> PathBuf;
}

/// Policy of a local session: a fixed time allowance and byte counters
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    deadline: Option<Instant>,
    uploaded_bytes: u64,
    downloaded_bytes: u64,
    required_ratio: f64,
    ratio_exempt: bool,
    time_exempt: bool,
}

impl SessionPolicy {
    /// Caller with `time_left` of connection time and no ratio requirement
    pub fn new(time_left: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + time_left),
            uploaded_bytes: 0,
            downloaded_bytes: 0,
            required_ratio: 0.0,
            ratio_exempt: false,
            time_exempt: false,
        }
    }

    /// Caller with no time limit
    pub fn unlimited() -> Self {
        Self {
            deadline: None,
            time_exempt: true,
            ..Self::new(Duration::ZERO)
        }
    }

    /// Require a minimum ratio
    #[must_use]
    pub fn with_required_ratio(mut self, ratio: f64) -> Self {
        self.required_ratio = ratio;
        self
    }

    /// Start from existing byte counters
    #[must_use]
    pub fn with_history(mut self, uploaded: u64, downloaded: u64) -> Self {
        self.uploaded_bytes = uploaded;
        self.downloaded_bytes = downloaded;
        self
    }

    /// Exempt the caller from ratio checks
    #[must_use]
    pub fn with_ratio_exempt(mut self, exempt: bool) -> Self {
        self.ratio_exempt = exempt;
        self
    }

    /// Count finished uploads
    pub fn record_upload(&mut self, bytes: u64) {
        self.uploaded_bytes += bytes;
    }

    /// Count finished downloads
    pub fn record_download(&mut self, bytes: u64) {
        self.downloaded_bytes += bytes;
    }
}

impl TransferPolicyProvider for SessionPolicy {
    fn remaining_seconds(&self) -> i64 {
        match self.deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    -i64::try_from((now - deadline).as_secs()).unwrap_or(i64::MAX)
                } else {
                    i64::try_from((deadline - now).as_secs()).unwrap_or(i64::MAX)
                }
            }
            None => i64::MAX,
        }
    }

    fn ratio(&self) -> f64 {
        self.projected_ratio(0)
    }

    fn ratio_exempt(&self) -> bool {
        self.ratio_exempt
    }

    fn required_ratio(&self) -> f64 {
        self.required_ratio
    }

    fn time_exempt(&self) -> bool {
        self.time_exempt
    }

    #[allow(clippy::cast_precision_loss)]
    fn projected_ratio(&self, extra_bytes: u64) -> f64 {
        let downloaded = self.downloaded_bytes + extra_bytes;
        if downloaded == 0 {
            return UNLIMITED_RATIO;
        }
        (self.uploaded_bytes as f64 / downloaded as f64).min(MAX_RATIO)
    }
}

/// File store over a single area directory with a staging directory beside it
///
/// Downloads may also come from anywhere on disk once registered.
#[derive(Debug)]
pub struct LocalFileStore {
    area_dir: PathBuf,
    staging: PathBuf,
    sources: HashMap<String, PathBuf>,
    committed: Vec<BatchEntry>,
}

impl LocalFileStore {
    /// Store rooted at `area_dir`, staging uploads in `staging`
    pub fn new(area_dir: impl Into<PathBuf>, staging: impl Into<PathBuf>) -> Self {
        Self {
            area_dir: area_dir.into(),
            staging: staging.into(),
            sources: HashMap::new(),
            committed: Vec::new(),
        }
    }

    /// Area directory
    pub fn area_dir(&self) -> &Path {
        &self.area_dir
    }

    /// Make a file on disk available for download and describe it
    pub fn register(&mut self, path: &Path, directory: DirectoryId) -> std::io::Result<BatchEntry> {
        let length = std::fs::metadata(path)?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"))?;
        let entry = BatchEntry::new(&name, directory, length, Direction::Download);
        self.sources.insert(entry.filename().to_string(), path.to_path_buf());
        Ok(entry)
    }

    /// Entries committed so far, oldest first
    pub fn committed(&self) -> &[BatchEntry] {
        &self.committed
    }

    fn staged_path(&self, entry: &BatchEntry) -> PathBuf {
        self.staging.join(entry.display_name())
    }
}

impl FileStore for LocalFileStore {
    fn commit(&mut self, entry: &BatchEntry) -> std::io::Result<()> {
        if entry.direction() == Direction::Upload {
            let from = self.staged_path(entry);
            let to = self.area_dir.join(entry.display_name());
            // Different long names can align to the same stored name
            if to.exists() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("{} already exists", to.display()),
                ));
            }
            std::fs::rename(&from, &to)?;
        }
        tracing::debug!(file = %entry.display_name(), direction = %entry.direction(), "Committed");
        self.committed.push(entry.clone());
        Ok(())
    }

    fn discard(&mut self, entry: &BatchEntry) {
        let path = self.staged_path(entry);
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "Discarded partial upload"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), "Could not discard: {}", e),
        }
    }

    fn locate(&self, entry: &BatchEntry) -> Option<PathBuf> {
        match entry.direction() {
            Direction::Download => self
                .sources
                .get(entry.filename())
                .cloned()
                .or_else(|| Some(self.area_dir.join(unalign_filename(entry.filename())))),
            Direction::Upload => Some(self.staged_path(entry)),
        }
    }

    fn staging_dir(&self) -> PathBuf {
        self.staging.clone()
    }
}

/// Everything one transfer needs, passed explicitly into dispatch
pub struct TransferContext<'a> {
    /// Link to the peer
    pub channel: &'a mut dyn ByteChannel,
    /// Caller's time and ratio accounting
    pub policy: &'a dyn TransferPolicyProvider,
    /// File areas
    pub store: &'a mut dyn FileStore,
    /// Caller's pending transfers; also carries the link speed
    pub queue: &'a mut BatchQueue,
    /// Cancellation shared with the session owner
    pub cancel: CancelFlag,
    /// Protocol limits
    pub tuning: TransferTuning,
    /// Progress sink
    pub progress: Option<mpsc::Sender<TransferProgress>>,
    /// Runner for external protocols and the ZMODEM engine
    pub delegate: Option<&'a ExternalDelegate>,
}

impl<'a> TransferContext<'a> {
    /// Context with default tuning and no external protocols
    pub fn new(
        channel: &'a mut dyn ByteChannel,
        policy: &'a dyn TransferPolicyProvider,
        store: &'a mut dyn FileStore,
        queue: &'a mut BatchQueue,
    ) -> Self {
        Self {
            channel,
            policy,
            store,
            queue,
            cancel: CancelFlag::new(),
            tuning: TransferTuning::default(),
            progress: None,
            delegate: None,
        }
    }

    /// Use `tuning` for native transfers
    #[must_use]
    pub fn with_tuning(mut self, tuning: TransferTuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// Share `cancel` with the session owner
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Publish progress to `tx`
    #[must_use]
    pub fn with_progress(mut self, tx: mpsc::Sender<TransferProgress>) -> Self {
        self.progress = Some(tx);
        self
    }

    /// Route external protocols through `delegate`
    #[must_use]
    pub fn with_delegate(mut self, delegate: &'a ExternalDelegate) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Link speed in bits per second
    pub fn link_speed(&self) -> u32 {
        self.queue.link_speed()
    }

    /// Fresh session for one native transfer
    pub fn session(&self, use_crc: bool) -> TransferSession {
        let session = TransferSession::new(self.tuning.clone(), self.cancel.clone())
            .with_crc(use_crc)
            .with_link_speed(self.link_speed());
        match &self.progress {
            Some(tx) => session.with_progress(tx.clone()),
            None => session,
        }
    }
}
