//! Transfer entry points
//!
//! Picks the native engine or the external delegate for a protocol and
//! keeps the batch queue and file store in step with what actually moved.

use crate::core::batch::{
    check_ratio, check_time, commit_entry, AdmissionDenied, BatchEntry, CommitError, DirectoryId, Direction,
};
use crate::core::context::TransferContext;
use crate::core::external::{ExternalError, ExternalOutcome};
use crate::core::registry::{ProtocolId, TransferKind};
use crate::core::transfer::{
    self, OutgoingFile, ReceiveReport, ReceivedFile, TransferError, TransferReport, TransferStatus,
    YmodemBatch,
};
use std::path::PathBuf;
use thiserror::Error;

/// Dispatch errors
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Protocol cannot do the requested operation
    #[error("{protocol:?} cannot do {kind}")]
    Unsupported {
        /// Requested protocol
        protocol: ProtocolId,
        /// Requested operation
        kind: TransferKind,
    },

    /// Protocol needs the external delegate and none is configured
    #[error("No external protocol runner configured")]
    NoDelegate,

    /// Queueing was refused
    #[error("Cannot queue: {0}")]
    Admission(#[from] AdmissionDenied),

    /// External run could not be carried out
    #[error(transparent)]
    External(#[from] ExternalError),

    /// Local file access
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file moved but the store refused it
    #[error(transparent)]
    Commit(#[from] CommitError),
}

/// Result of a single-file operation
#[derive(Debug)]
pub enum SingleOutcome {
    /// The file went into the batch queue
    Queued,
    /// Native send finished
    Sent(TransferReport),
    /// Native receive finished
    Received(ReceiveReport),
    /// External program finished
    External(ExternalOutcome),
}

impl SingleOutcome {
    /// Whether the file moved (or was queued) without error
    pub fn is_success(&self) -> bool {
        match self {
            SingleOutcome::Queued => true,
            SingleOutcome::Sent(report) => report.is_complete(),
            SingleOutcome::Received(report) => report.is_complete() && !report.files.is_empty(),
            SingleOutcome::External(outcome) => outcome.is_sent(),
        }
    }
}

/// What a batch operation did to the queue
#[derive(Debug, Default)]
pub struct BatchSummary {
    /// Entries transferred and committed
    pub completed: Vec<BatchEntry>,
    /// Entries that failed and were dropped
    pub failed: Vec<BatchEntry>,
    /// Entries dropped for lack of time
    pub skipped: Vec<(BatchEntry, AdmissionDenied)>,
    /// Files received that were never queued
    pub unexpected: Vec<BatchEntry>,
    /// Why the batch stopped before the queue was empty
    pub stopped_by: Option<AdmissionDenied>,
    /// Payload bytes moved natively
    pub bytes: u64,
    /// Errors over the native transfer
    pub total_errors: u32,
    /// Fatal native error
    pub error: Option<TransferError>,
    /// Exit status of an external run
    pub external: Option<ExternalOutcome>,
}

impl BatchSummary {
    /// Everything queued went through
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
            && self.skipped.is_empty()
            && self.stopped_by.is_none()
            && self.error.is_none()
            && self.external.map_or(true, ExternalOutcome::is_sent)
    }

    /// Record how a queued entry settled
    fn settle(&mut self, result: Result<Option<BatchEntry>, CommitError>) {
        match result {
            Ok(Some(done)) => self.completed.push(done),
            Ok(None) => {}
            Err(e) => self.failed.push(e.entry),
        }
    }

    fn absorb_report(&mut self, bytes: u64, total_errors: u32, status: TransferStatus) {
        self.bytes += bytes;
        self.total_errors += total_errors;
        if let TransferStatus::Aborted(e) = status {
            self.error = Some(e);
        }
    }
}

fn single_kind(entry: &BatchEntry) -> TransferKind {
    match (entry.direction(), entry.directory()) {
        (Direction::Download, DirectoryId::Temporary) => TransferKind::DownloadTemp,
        (Direction::Download, _) => TransferKind::Download,
        (Direction::Upload, DirectoryId::Temporary) => TransferKind::UploadTemp,
        (Direction::Upload, _) => TransferKind::Upload,
    }
}

fn is_delegated(protocol: ProtocolId) -> bool {
    matches!(protocol, ProtocolId::Zmodem | ProtocolId::External(_))
}

fn unsupported(protocol: ProtocolId, kind: TransferKind) -> DispatchError {
    DispatchError::Unsupported { protocol, kind }
}

/// Send one file to the user, or queue it with [`ProtocolId::Batch`]
pub async fn send_file(
    ctx: &mut TransferContext<'_>,
    protocol: ProtocolId,
    entry: &BatchEntry,
) -> Result<SingleOutcome, DispatchError> {
    let kind = single_kind(entry);
    if protocol == ProtocolId::Batch {
        if !kind.offers_queueing() {
            return Err(unsupported(protocol, kind));
        }
        ctx.queue.add(entry.clone(), ctx.policy)?;
        return Ok(SingleOutcome::Queued);
    }

    let path = ctx
        .store
        .locate(entry)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, entry.display_name()))?;

    if is_delegated(protocol) {
        let delegate = ctx.delegate.ok_or(DispatchError::NoDelegate)?;
        let outcome = delegate
            .run_single(protocol, kind, &path, ctx.link_speed())
            .await?;
        if outcome.is_sent() {
            commit_entry(&mut *ctx.store, entry)?;
        }
        return Ok(SingleOutcome::External(outcome));
    }

    let (frame_kind, _) = protocol
        .native_framing()
        .ok_or_else(|| unsupported(protocol, kind))?;
    let file = OutgoingFile::from_path(&path).await?;
    let mut session = ctx.session(true);
    let report = if protocol == ProtocolId::Ymodem {
        transfer::send_batch(&mut *ctx.channel, &mut session, std::slice::from_ref(&file)).await
    } else {
        transfer::send_file(
            &mut *ctx.channel,
            &mut session,
            &file.header.name,
            &file.data,
            frame_kind,
        )
        .await
    };
    if report.is_complete() {
        commit_entry(&mut *ctx.store, entry)?;
    }
    Ok(SingleOutcome::Sent(report))
}

/// Receive one file from the user, or queue it with [`ProtocolId::Batch`]
///
/// The file lands where the store locates `entry` and is committed once
/// complete; anything partial is discarded.
pub async fn receive_file(
    ctx: &mut TransferContext<'_>,
    protocol: ProtocolId,
    entry: &BatchEntry,
) -> Result<SingleOutcome, DispatchError> {
    let kind = single_kind(entry);
    if protocol == ProtocolId::Batch {
        if !kind.offers_queueing() {
            return Err(unsupported(protocol, kind));
        }
        ctx.queue.add(entry.clone(), ctx.policy)?;
        return Ok(SingleOutcome::Queued);
    }

    let path = ctx
        .store
        .locate(entry)
        .unwrap_or_else(|| ctx.store.staging_dir().join(entry.display_name()));
    ensure_parent(&path).await?;

    if is_delegated(protocol) {
        let delegate = ctx.delegate.ok_or(DispatchError::NoDelegate)?;
        let outcome = delegate
            .run_single(protocol, kind, &path, ctx.link_speed())
            .await?;
        if outcome.is_sent() {
            commit_entry(&mut *ctx.store, entry)?;
        } else {
            ctx.store.discard(entry);
        }
        return Ok(SingleOutcome::External(outcome));
    }

    let (_, prefer_crc) = protocol
        .native_framing()
        .ok_or_else(|| unsupported(protocol, kind))?;
    let mut session = ctx.session(prefer_crc);
    let report = if protocol == ProtocolId::Ymodem {
        transfer::receive_batch(&mut *ctx.channel, &mut session).await
    } else {
        transfer::receive_file(&mut *ctx.channel, &mut session, &entry.display_name()).await
    };

    match report.files.first() {
        Some(file) if report.is_complete() => {
            tokio::fs::write(&path, &file.data).await?;
            commit_entry(&mut *ctx.store, entry)?;
        }
        _ => ctx.store.discard(entry),
    }
    Ok(SingleOutcome::Received(report))
}

/// Send every queued download
///
/// Native YMODEM re-checks the caller before each file: a ratio below the
/// requirement ends the batch, a file there is no time left for is dropped
/// from the queue, and a failed file ends the batch.
pub async fn download_batch(
    ctx: &mut TransferContext<'_>,
    protocol: ProtocolId,
) -> Result<BatchSummary, DispatchError> {
    match protocol {
        ProtocolId::Ymodem => native_download_batch(ctx).await,
        p if is_delegated(p) => external_batch(ctx, p, TransferKind::DownloadBatch).await,
        p => Err(unsupported(p, TransferKind::DownloadBatch)),
    }
}

/// Receive every queued upload
///
/// Queued uploads that do not arrive are failed so their partial files
/// are discarded.
pub async fn upload_batch(
    ctx: &mut TransferContext<'_>,
    protocol: ProtocolId,
) -> Result<BatchSummary, DispatchError> {
    match protocol {
        ProtocolId::Ymodem => native_upload_batch(ctx).await,
        p if is_delegated(p) => external_batch(ctx, p, TransferKind::UploadBatch).await,
        p => Err(unsupported(p, TransferKind::UploadBatch)),
    }
}

/// Send queued downloads and receive queued uploads in one external run
pub async fn bidirectional_batch(
    ctx: &mut TransferContext<'_>,
    protocol: ProtocolId,
) -> Result<BatchSummary, DispatchError> {
    if !is_delegated(protocol) {
        return Err(unsupported(protocol, TransferKind::Bidirectional));
    }
    external_batch(ctx, protocol, TransferKind::Bidirectional).await
}

async fn native_download_batch(ctx: &mut TransferContext<'_>) -> Result<BatchSummary, DispatchError> {
    let pending: Vec<BatchEntry> = ctx.queue.iter_direction(Direction::Download).cloned().collect();
    let mut summary = BatchSummary::default();
    if pending.is_empty() {
        tracing::info!("No downloads queued");
        return Ok(summary);
    }
    tracing::info!(
        files = pending.len(),
        secs = ctx.queue.aggregate_time(Direction::Download),
        "YMODEM batch download"
    );

    let mut session = ctx.session(true);
    let mut batch = YmodemBatch::new(&mut *ctx.channel, &mut session);
    let mut sent_bytes = 0;
    let mut result = Ok(());

    for entry in pending {
        if let Err(denied) = check_ratio(ctx.policy, sent_bytes) {
            tracing::warn!(file = %entry.display_name(), "Ratio too low to continue");
            summary.stopped_by = Some(denied);
            break;
        }
        if let Err(denied) = check_time(ctx.policy, ctx.queue.entry_time(&entry)) {
            tracing::warn!(file = %entry.display_name(), "Not enough time left");
            ctx.queue.fail(entry.filename(), Direction::Download, &mut *ctx.store);
            summary.skipped.push((entry, denied));
            continue;
        }

        let loaded = match ctx.store.locate(&entry) {
            Some(path) => OutgoingFile::from_path(&path).await,
            None => Err(std::io::Error::new(std::io::ErrorKind::NotFound, entry.display_name())),
        };
        let file = match loaded {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(file = %entry.display_name(), "Cannot read file: {}", e);
                if let Some(failed) = ctx.queue.fail(entry.filename(), Direction::Download, &mut *ctx.store) {
                    summary.failed.push(failed);
                }
                continue;
            }
        };

        match batch.send(&file).await {
            Ok(()) => {
                sent_bytes += entry.length();
                summary.settle(ctx.queue.complete(entry.filename(), Direction::Download, &mut *ctx.store));
            }
            Err(e) => {
                if let Some(failed) = ctx.queue.fail(entry.filename(), Direction::Download, &mut *ctx.store) {
                    summary.failed.push(failed);
                }
                result = Err(e);
                break;
            }
        }
    }

    let report = batch.close(result).await;
    summary.absorb_report(report.bytes, report.total_errors, report.status);
    Ok(summary)
}

async fn native_upload_batch(ctx: &mut TransferContext<'_>) -> Result<BatchSummary, DispatchError> {
    let staging = ctx.store.staging_dir();
    tokio::fs::create_dir_all(&staging).await?;
    tracing::info!(
        files = ctx.queue.count(Direction::Upload),
        staging = %staging.display(),
        "YMODEM batch upload"
    );

    let mut session = ctx.session(true);
    let report = transfer::receive_batch(&mut *ctx.channel, &mut session).await;

    let mut summary = BatchSummary::default();
    for file in &report.files {
        store_upload(ctx, file, &staging, &mut summary).await;
    }

    let missing: Vec<String> = ctx
        .queue
        .iter_direction(Direction::Upload)
        .map(|e| e.filename().to_string())
        .collect();
    for name in missing {
        if let Some(failed) = ctx.queue.fail(&name, Direction::Upload, &mut *ctx.store) {
            summary.failed.push(failed);
        }
    }

    summary.absorb_report(report.bytes, report.total_errors, report.status);
    Ok(summary)
}

/// Write one received file to staging and commit it
async fn store_upload(
    ctx: &mut TransferContext<'_>,
    file: &ReceivedFile,
    staging: &std::path::Path,
    summary: &mut BatchSummary,
) {
    let queued = ctx
        .queue
        .position(&file.name, Direction::Upload)
        .and_then(|i| ctx.queue.entries().get(i).cloned());
    let entry = queued.clone().unwrap_or_else(|| {
        BatchEntry::new(&file.name, DirectoryId::Temporary, file.data.len() as u64, Direction::Upload)
    });
    let path: PathBuf = ctx
        .store
        .locate(&entry)
        .unwrap_or_else(|| staging.join(entry.display_name()));

    if let Err(e) = tokio::fs::write(&path, &file.data).await {
        tracing::error!(file = %file.name, "Cannot store upload: {}", e);
        if let Some(failed) = ctx.queue.fail(&file.name, Direction::Upload, &mut *ctx.store) {
            summary.failed.push(failed);
        }
        return;
    }

    if queued.is_some() {
        summary.settle(ctx.queue.complete(&file.name, Direction::Upload, &mut *ctx.store));
    } else {
        tracing::info!(file = %file.name, "Received a file that was not queued");
        match commit_entry(&mut *ctx.store, &entry) {
            Ok(()) => summary.unexpected.push(entry),
            Err(e) => summary.failed.push(e.entry),
        }
    }
}

async fn external_batch(
    ctx: &mut TransferContext<'_>,
    protocol: ProtocolId,
    kind: TransferKind,
) -> Result<BatchSummary, DispatchError> {
    let delegate = ctx.delegate.ok_or(DispatchError::NoDelegate)?;
    let run = match kind {
        TransferKind::DownloadBatch => {
            delegate
                .send_batch(protocol, &mut *ctx.queue, ctx.policy, &mut *ctx.store)
                .await?
        }
        TransferKind::UploadBatch => {
            delegate
                .receive_batch(protocol, &mut *ctx.queue, ctx.policy, &mut *ctx.store)
                .await?
        }
        TransferKind::Bidirectional => {
            delegate
                .bidirectional_batch(protocol, &mut *ctx.queue, ctx.policy, &mut *ctx.store)
                .await?
        }
        other => return Err(unsupported(protocol, other)),
    };
    Ok(BatchSummary {
        completed: run.completed,
        failed: run.failed,
        external: Some(run.outcome),
        ..BatchSummary::default()
    })
}

async fn ensure_parent(path: &std::path::Path) -> std::io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => tokio::fs::create_dir_all(dir).await,
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::batch::{BatchQueue, BatchSettings};
    use crate::core::context::{FileStore, LocalFileStore, MockTransferPolicyProvider, SessionPolicy};
    use crate::core::transfer::{CancelFlag, TransferSession, TransferTuning};
    use crate::core::transport::LoopbackChannel;
    use tempfile::tempdir;

    fn policy(remaining: i64, projected: f64, required: f64) -> MockTransferPolicyProvider {
        let mut policy = MockTransferPolicyProvider::new();
        policy.expect_remaining_seconds().return_const(remaining);
        policy.expect_ratio().return_const(projected);
        policy.expect_projected_ratio().returning(move |_| projected);
        policy.expect_required_ratio().return_const(required);
        policy.expect_ratio_exempt().return_const(false);
        policy.expect_time_exempt().return_const(false);
        policy
    }

    fn peer_session() -> TransferSession {
        TransferSession::new(TransferTuning::default(), CancelFlag::new())
    }

    /// Store holding `files` (name, size) and a queue with all of them
    fn downloads(dir: &std::path::Path, files: &[(&str, usize)]) -> (LocalFileStore, BatchQueue) {
        let mut store = LocalFileStore::new(dir, dir.join("staging"));
        let mut queue = BatchQueue::new(BatchSettings::default(), 2400);
        let generous = SessionPolicy::unlimited();
        for (name, size) in files {
            let path = dir.join(name);
            let data: Vec<u8> = (0..*size).map(|i| (i % 256) as u8).collect();
            std::fs::write(&path, data).unwrap();
            let entry = store.register(&path, DirectoryId::Area(1)).unwrap();
            queue.add(entry, &generous).unwrap();
        }
        (store, queue)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ymodem_download_batch_empties_queue() {
        let dir = tempdir().unwrap();
        let (mut store, mut queue) = downloads(dir.path(), &[("one.txt", 1500), ("two.bin", 130)]);
        let (mut local, mut remote) = LoopbackChannel::pair();
        let policy = policy(10_000, 1.0, 0.0);
        let mut peer = peer_session();

        let mut ctx = TransferContext::new(&mut local, &policy, &mut store, &mut queue);
        let (summary, received) = tokio::join!(
            download_batch(&mut ctx, ProtocolId::Ymodem),
            transfer::receive_batch(&mut remote, &mut peer)
        );
        let summary = summary.unwrap();

        assert!(summary.is_clean(), "{summary:?}");
        assert_eq!(summary.completed.len(), 2);
        assert!(received.is_complete());
        let names: Vec<&str> = received.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["one.txt", "two.bin"]);
        assert_eq!(received.files[0].data.len(), 1500);
        assert_eq!(received.files[1].data, std::fs::read(dir.path().join("two.bin")).unwrap());
        assert!(queue.is_empty());
        assert_eq!(store.committed().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_batch_drops_file_without_time() {
        let dir = tempdir().unwrap();
        // 40 000 bytes at 2400 bps is 211 s; 100 bytes is 1 s
        let (mut store, mut queue) = downloads(dir.path(), &[("big.zip", 40_000), ("small.txt", 100)]);
        let (mut local, mut remote) = LoopbackChannel::pair();
        let policy = policy(60, 1.0, 0.0);
        let mut peer = peer_session();

        let mut ctx = TransferContext::new(&mut local, &policy, &mut store, &mut queue);
        let (summary, received) = tokio::join!(
            download_batch(&mut ctx, ProtocolId::Ymodem),
            transfer::receive_batch(&mut remote, &mut peer)
        );
        let summary = summary.unwrap();

        assert_eq!(summary.skipped.len(), 1);
        assert!(matches!(summary.skipped[0].1, AdmissionDenied::InsufficientTime { .. }));
        assert_eq!(summary.completed.len(), 1);
        assert_eq!(received.files.len(), 1);
        assert_eq!(received.files[0].name, "small.txt");
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_batch_stops_on_low_ratio() {
        let dir = tempdir().unwrap();
        let (mut store, mut queue) = downloads(dir.path(), &[("a.txt", 10)]);
        let (mut local, mut remote) = LoopbackChannel::pair();
        let policy = policy(10_000, 0.1, 0.5);
        let mut peer = peer_session();

        let mut ctx = TransferContext::new(&mut local, &policy, &mut store, &mut queue);
        let (summary, received) = tokio::join!(
            download_batch(&mut ctx, ProtocolId::Ymodem),
            transfer::receive_batch(&mut remote, &mut peer)
        );
        let summary = summary.unwrap();

        assert!(matches!(summary.stopped_by, Some(AdmissionDenied::RatioTooLow { .. })));
        assert!(summary.completed.is_empty());
        // The batch is still closed properly
        assert!(received.is_complete());
        assert!(received.files.is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_batch_commits_and_fails_missing() {
        let area = tempdir().unwrap();
        let mut store = LocalFileStore::new(area.path(), area.path().join("staging"));
        let mut queue = BatchQueue::new(BatchSettings::default(), 2400);
        let policy = SessionPolicy::unlimited();
        for name in ["game.zip", "never.txt"] {
            let entry = BatchEntry::new(name, DirectoryId::Area(1), 0, Direction::Upload);
            queue.add(entry, &policy).unwrap();
        }
        let (mut local, mut remote) = LoopbackChannel::pair();
        let mut peer = peer_session();
        let files = vec![
            OutgoingFile::new("game.zip", vec![1u8; 700]),
            OutgoingFile::new("extra.doc", vec![2u8; 20]),
        ];

        let mut ctx = TransferContext::new(&mut local, &policy, &mut store, &mut queue);
        let (summary, sent) = tokio::join!(
            upload_batch(&mut ctx, ProtocolId::Ymodem),
            transfer::send_batch(&mut remote, &mut peer, &files)
        );
        let summary = summary.unwrap();

        assert!(sent.is_complete());
        assert_eq!(summary.completed.len(), 1);
        assert_eq!(summary.unexpected.len(), 1);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].display_name(), "NEVER.TXT");
        assert!(queue.is_empty());
        assert_eq!(std::fs::read(area.path().join("GAME.ZIP")).unwrap(), vec![1u8; 700]);
        assert!(area.path().join("EXTRA.DOC").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_not_counted_when_area_is_missing() {
        let root = tempdir().unwrap();
        let staging = root.path().join("staging");
        let mut store = LocalFileStore::new(root.path().join("no-such-area"), &staging);
        let mut queue = BatchQueue::new(BatchSettings::default(), 2400);
        let policy = SessionPolicy::unlimited();
        let entry = BatchEntry::new("game.zip", DirectoryId::Area(1), 0, Direction::Upload);
        queue.add(entry, &policy).unwrap();
        let (mut local, mut remote) = LoopbackChannel::pair();
        let mut peer = peer_session();
        let files = vec![OutgoingFile::new("game.zip", vec![1u8; 300])];

        let mut ctx = TransferContext::new(&mut local, &policy, &mut store, &mut queue);
        let (summary, sent) = tokio::join!(
            upload_batch(&mut ctx, ProtocolId::Ymodem),
            transfer::send_batch(&mut remote, &mut peer, &files)
        );
        let summary = summary.unwrap();

        assert!(sent.is_complete());
        assert!(summary.completed.is_empty());
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].display_name(), "GAME.ZIP");
        assert!(!summary.is_clean());
        assert!(queue.is_empty());
        assert!(store.committed().is_empty());
        // The staged copy is discarded, not stranded
        assert!(staging.read_dir().unwrap().next().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_colliding_unqueued_uploads_keep_the_first() {
        let area = tempdir().unwrap();
        let mut store = LocalFileStore::new(area.path(), area.path().join("staging"));
        let mut queue = BatchQueue::new(BatchSettings::default(), 2400);
        let policy = SessionPolicy::unlimited();
        let (mut local, mut remote) = LoopbackChannel::pair();
        let mut peer = peer_session();
        // Both align to LONGNAME.TXT
        let files = vec![
            OutgoingFile::new("longname1.txt", vec![1u8; 40]),
            OutgoingFile::new("longname2.txt", vec![2u8; 40]),
        ];

        let mut ctx = TransferContext::new(&mut local, &policy, &mut store, &mut queue);
        let (summary, sent) = tokio::join!(
            upload_batch(&mut ctx, ProtocolId::Ymodem),
            transfer::send_batch(&mut remote, &mut peer, &files)
        );
        let summary = summary.unwrap();

        assert!(sent.is_complete());
        assert_eq!(summary.unexpected.len(), 1);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].display_name(), "LONGNAME.TXT");
        assert_eq!(std::fs::read(area.path().join("LONGNAME.TXT")).unwrap(), vec![1u8; 40]);
        assert!(store.staging_dir().read_dir().unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_batch_protocol_queues_single_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.txt");
        std::fs::write(&path, b"x").unwrap();
        let mut store = LocalFileStore::new(dir.path(), dir.path().join("staging"));
        let entry = store.register(&path, DirectoryId::Area(3)).unwrap();
        let temp = BatchEntry::new("t.txt", DirectoryId::Temporary, 1, Direction::Download);
        let mut queue = BatchQueue::new(BatchSettings::default(), 2400);
        let policy = SessionPolicy::unlimited();
        let (mut local, _remote) = LoopbackChannel::pair();

        let mut ctx = TransferContext::new(&mut local, &policy, &mut store, &mut queue);
        let outcome = send_file(&mut ctx, ProtocolId::Batch, &entry).await.unwrap();
        assert!(matches!(outcome, SingleOutcome::Queued));
        assert!(matches!(
            send_file(&mut ctx, ProtocolId::Batch, &temp).await,
            Err(DispatchError::Unsupported { .. })
        ));
        assert!(matches!(
            send_file(&mut ctx, ProtocolId::Zmodem, &entry).await,
            Err(DispatchError::NoDelegate)
        ));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_xmodem_receive_commits() {
        let area = tempdir().unwrap();
        let mut store = LocalFileStore::new(area.path(), area.path().join("staging"));
        let mut queue = BatchQueue::new(BatchSettings::default(), 2400);
        let policy = SessionPolicy::unlimited();
        let entry = BatchEntry::new("note.txt", DirectoryId::Area(1), 0, Direction::Upload);
        let (mut local, mut remote) = LoopbackChannel::pair();
        let mut peer = peer_session();
        let data = vec![b'n'; 128];

        let mut ctx = TransferContext::new(&mut local, &policy, &mut store, &mut queue);
        let (outcome, sent) = tokio::join!(
            receive_file(&mut ctx, ProtocolId::XmodemCrc, &entry),
            transfer::send_file(&mut remote, &mut peer, "note.txt", &data, crate::core::protocol::FrameKind::Short)
        );

        assert!(sent.is_complete());
        assert!(outcome.unwrap().is_success());
        assert_eq!(std::fs::read(area.path().join("NOTE.TXT")).unwrap(), data);
        assert!(store.staging_dir().read_dir().unwrap().next().is_none());
    }
}
