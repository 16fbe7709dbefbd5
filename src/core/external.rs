//! External protocol delegate
//!
//! Protocols this crate does not speak natively are run as another
//! program. The delegate expands the protocol's command template, writes
//! file manifests for batch runs, runs the command through an
//! [`ExternalProcessRunner`] and reconciles the batch queue with the
//! program's DSZ-format transfer log afterwards.

use crate::core::batch::{align_filename, BatchEntry, BatchQueue, CommitError, Direction};
use crate::core::context::{FileStore, TransferPolicyProvider};
use crate::core::registry::{ProtocolId, ProtocolRegistry, TransferKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Highest speed substituted into a command line
pub const MAX_TEMPLATE_SPEED: u32 = 57_600;

/// Manifest of files to send, relative to the work directory
pub const DOWNLOAD_MANIFEST: &str = "filesdl.lst";

/// Manifest of files to receive, relative to the work directory
pub const UPLOAD_MANIFEST: &str = "filesul.lst";

/// An externally implemented protocol
///
/// Each template is a command line with `%1`..`%5` placeholders; a
/// missing template means the protocol cannot do that operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalProtocol {
    /// Display name
    pub name: String,
    /// Receive one file
    pub receive: Option<String>,
    /// Send one file
    pub send: Option<String>,
    /// Receive a batch listed in the upload manifest
    pub receive_batch: Option<String>,
    /// Send a batch listed in the download manifest
    pub send_batch: Option<String>,
    /// Both manifests in one run
    pub bidirectional: Option<String>,
    /// Exit code that means success
    pub ok_code: i32,
}

impl ExternalProtocol {
    /// Command template for an operation
    pub fn template(&self, kind: TransferKind) -> Option<&str> {
        let template = match kind {
            TransferKind::Upload | TransferKind::UploadTemp => &self.receive,
            TransferKind::Download | TransferKind::DownloadTemp => &self.send,
            TransferKind::UploadBatch => &self.receive_batch,
            TransferKind::DownloadBatch => &self.send_batch,
            TransferKind::Bidirectional => &self.bidirectional,
        };
        template.as_deref().filter(|t| !t.trim().is_empty())
    }
}

/// Values substituted into a command template
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateVars {
    /// `%1`: link speed
    pub link_speed: u32,
    /// `%2`: port
    pub port: String,
    /// `%3`: the file, or the download manifest
    pub file: String,
    /// `%4`: modem speed
    pub modem_speed: u32,
    /// `%5`: the upload manifest
    pub upload_list: String,
}

/// Expand `%1`..`%5` and `%%`; other `%` sequences are kept as written
pub fn expand_template(template: &str, vars: &TemplateVars) -> String {
    let mut out = String::with_capacity(template.len() + 32);
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('1') => out.push_str(&vars.link_speed.min(MAX_TEMPLATE_SPEED).to_string()),
            Some('2') => out.push_str(&vars.port),
            Some('3') => out.push_str(&vars.file),
            Some('4') => out.push_str(&vars.modem_speed.min(MAX_TEMPLATE_SPEED).to_string()),
            Some('5') => out.push_str(&vars.upload_list),
            Some('%') => out.push('%'),
            _ => {
                out.push('%');
                continue;
            }
        }
        chars.next();
    }
    out
}

/// External delegate errors
#[derive(Debug, Error)]
pub enum ExternalError {
    /// Protocol is not configured for the operation
    #[error("{protocol} cannot do {kind}")]
    Unsupported {
        /// Protocol name, or its id when unknown
        protocol: String,
        /// Requested operation
        kind: TransferKind,
    },

    /// The program could not be started
    #[error("Failed to start external program: {0}")]
    Spawn(#[source] std::io::Error),

    /// The program ran and reported failure
    #[error("External program failed with exit code {code}")]
    ExternalProcessFailed {
        /// Exit code
        code: i32,
    },

    /// A manifest or log could not be written or read
    #[error("Manifest error: {0}")]
    Manifest(#[source] std::io::Error),
}

/// Runs command lines for the delegate
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExternalProcessRunner: Send + Sync {
    /// Run `command_line` in `working_dir` to completion and return its exit code
    async fn run(&self, command_line: &str, working_dir: &Path) -> std::io::Result<i32>;
}

/// Runs command lines through the platform shell
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessRunner;

#[async_trait]
impl ExternalProcessRunner for SystemProcessRunner {
    async fn run(&self, command_line: &str, working_dir: &Path) -> std::io::Result<i32> {
        #[cfg(windows)]
        let mut command = {
            let mut c = tokio::process::Command::new("cmd");
            c.arg("/C").arg(command_line);
            c
        };
        #[cfg(not(windows))]
        let mut command = {
            let mut c = tokio::process::Command::new("sh");
            c.arg("-c").arg(command_line);
            c
        };

        tracing::info!(command = command_line, dir = %working_dir.display(), "Running external protocol");
        let status = command.current_dir(working_dir).status().await?;
        // Killed by a signal
        Ok(status.code().unwrap_or(-1))
    }
}

/// How an external run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalOutcome {
    /// Exit code matched the protocol's OK code
    Sent,
    /// Any other exit code
    Failed {
        /// Exit code
        code: i32,
    },
}

impl ExternalOutcome {
    /// Classify an exit code
    pub fn from_exit_code(code: i32, ok_code: i32) -> Self {
        if code == ok_code {
            ExternalOutcome::Sent
        } else {
            ExternalOutcome::Failed { code }
        }
    }

    /// Whether the run succeeded
    pub fn is_sent(self) -> bool {
        self == ExternalOutcome::Sent
    }

    /// Failure as an error
    pub fn into_result(self) -> Result<(), ExternalError> {
        match self {
            ExternalOutcome::Sent => Ok(()),
            ExternalOutcome::Failed { code } => Err(ExternalError::ExternalProcessFailed { code }),
        }
    }
}

/// A manifest file that is removed when dropped
#[derive(Debug)]
pub struct ManifestGuard {
    path: PathBuf,
}

impl ManifestGuard {
    /// Write one path per CRLF-terminated line to `path`
    pub fn write(path: PathBuf, files: &[PathBuf]) -> std::io::Result<Self> {
        let mut body = String::new();
        for file in files {
            body.push_str(&file.to_string_lossy());
            body.push_str("\r\n");
        }
        remove_if_present(&path)?;
        std::fs::write(&path, body)?;
        tracing::debug!(path = %path.display(), files = files.len(), "Manifest written");
        Ok(Self { path })
    }

    /// Manifest location
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ManifestGuard {
    fn drop(&mut self) {
        if let Err(e) = remove_if_present(&self.path) {
            tracing::warn!(path = %self.path.display(), "Could not remove manifest: {}", e);
        }
    }
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// What a DSZ log line reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DszStatus {
    /// We received the file
    Received,
    /// We sent the file
    Sent,
    /// The file failed
    Error,
}

/// One parsed DSZ log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DszRecord {
    /// Outcome
    pub status: DszStatus,
    /// Characters per second
    pub cps: u32,
    /// Aligned file name, path removed
    pub file_name: String,
}

/// Parse one DSZ log line
///
/// The first character of the line is the status code, the fifth field
/// the cps and the eleventh the file path. Lines with an unknown code or
/// fewer fields are ignored.
pub fn parse_dsz_line(line: &str) -> Option<DszRecord> {
    let status = match line.chars().next()? {
        'Z' | 'r' | 'R' | 'B' | 'H' => DszStatus::Received,
        'z' | 's' | 'S' | 'b' | 'h' | 'Q' => DszStatus::Sent,
        'E' | 'e' | 'L' | 'l' | 'U' => DszStatus::Error,
        _ => return None,
    };
    let fields: Vec<&str> = line.split_whitespace().collect();
    let path = fields.get(10)?;
    let bare = path.rsplit(&['/', '\\'][..]).next().unwrap_or(path);
    Some(DszRecord {
        status,
        cps: fields.get(4).and_then(|f| f.parse().ok()).unwrap_or(0),
        file_name: align_filename(bare),
    })
}

/// Parse a whole DSZ log, skipping lines that are not transfer records
pub fn parse_dsz_log(text: &str) -> Vec<DszRecord> {
    text.lines().filter_map(parse_dsz_line).collect()
}

/// Queue changes made after a batch run
#[derive(Debug)]
pub struct BatchRun {
    /// Exit status of the program
    pub outcome: ExternalOutcome,
    /// Entries committed
    pub completed: Vec<BatchEntry>,
    /// Entries failed and dropped
    pub failed: Vec<BatchEntry>,
}

impl BatchRun {
    fn settle(&mut self, result: Result<Option<BatchEntry>, CommitError>) {
        match result {
            Ok(Some(done)) => self.completed.push(done),
            Ok(None) => {}
            Err(e) => self.failed.push(e.entry),
        }
    }
}

/// Runs external protocols and the ZMODEM engine
pub struct ExternalDelegate {
    runner: Arc<dyn ExternalProcessRunner>,
    work_dir: PathBuf,
    dsz_log: Option<PathBuf>,
    port: String,
    modem_speed: u32,
    protocols: Vec<ExternalProtocol>,
    zmodem: Option<ExternalProtocol>,
}

impl ExternalDelegate {
    /// Delegate running programs in `work_dir`
    pub fn new(runner: Arc<dyn ExternalProcessRunner>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            work_dir: work_dir.into(),
            dsz_log: None,
            port: "0".to_string(),
            modem_speed: 0,
            protocols: Vec::new(),
            zmodem: None,
        }
    }

    /// Configured external protocols, in `ProtocolId::External` order
    #[must_use]
    pub fn with_protocols(mut self, protocols: Vec<ExternalProtocol>) -> Self {
        self.protocols = protocols;
        self
    }

    /// Commands of the ZMODEM engine
    #[must_use]
    pub fn with_zmodem(mut self, engine: Option<ExternalProtocol>) -> Self {
        self.zmodem = engine;
        self
    }

    /// Transfer log the programs write
    #[must_use]
    pub fn with_dsz_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.dsz_log = Some(path.into());
        self
    }

    /// Port substituted for `%2`
    #[must_use]
    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = port.into();
        self
    }

    /// Modem speed substituted for `%4`
    #[must_use]
    pub fn with_modem_speed(mut self, speed: u32) -> Self {
        self.modem_speed = speed;
        self
    }

    /// Registry of the native protocols plus everything configured here
    pub fn registry(&self) -> ProtocolRegistry {
        ProtocolRegistry::new(self.zmodem.as_ref(), &self.protocols)
    }

    /// Command set behind a delegated protocol
    pub fn protocol(&self, id: ProtocolId) -> Option<&ExternalProtocol> {
        match id {
            ProtocolId::Zmodem => self.zmodem.as_ref(),
            ProtocolId::External(index) => self.protocols.get(index),
            _ => None,
        }
    }

    fn template(&self, id: ProtocolId, kind: TransferKind) -> Result<(&ExternalProtocol, &str), ExternalError> {
        let unsupported = |protocol: String| ExternalError::Unsupported { protocol, kind };
        let protocol = self
            .protocol(id)
            .ok_or_else(|| unsupported(format!("{id:?}")))?;
        let template = protocol
            .template(kind)
            .ok_or_else(|| unsupported(protocol.name.clone()))?;
        Ok((protocol, template))
    }

    fn vars(&self, link_speed: u32) -> TemplateVars {
        TemplateVars {
            link_speed,
            port: self.port.clone(),
            modem_speed: if self.modem_speed == 0 { link_speed } else { self.modem_speed },
            ..TemplateVars::default()
        }
    }

    async fn execute(&self, command_line: &str) -> Result<i32, ExternalError> {
        let code = self
            .runner
            .run(command_line, &self.work_dir)
            .await
            .map_err(ExternalError::Spawn)?;
        tracing::info!(code, "External program finished");
        Ok(code)
    }

    /// Move one file with a delegated protocol
    pub async fn run_single(
        &self,
        id: ProtocolId,
        kind: TransferKind,
        file: &Path,
        link_speed: u32,
    ) -> Result<ExternalOutcome, ExternalError> {
        let (protocol, template) = self.template(id, kind)?;
        let vars = TemplateVars {
            file: file.to_string_lossy().into_owned(),
            ..self.vars(link_speed)
        };
        let code = self.execute(&expand_template(template, &vars)).await?;
        Ok(ExternalOutcome::from_exit_code(code, protocol.ok_code))
    }

    /// Send the admitted downloads of `queue`
    pub async fn send_batch(
        &self,
        id: ProtocolId,
        queue: &mut BatchQueue,
        policy: &dyn TransferPolicyProvider,
        store: &mut dyn FileStore,
    ) -> Result<BatchRun, ExternalError> {
        self.run_batch(id, TransferKind::DownloadBatch, queue, policy, store)
            .await
    }

    /// Receive the queued uploads into the store's staging area
    pub async fn receive_batch(
        &self,
        id: ProtocolId,
        queue: &mut BatchQueue,
        policy: &dyn TransferPolicyProvider,
        store: &mut dyn FileStore,
    ) -> Result<BatchRun, ExternalError> {
        self.run_batch(id, TransferKind::UploadBatch, queue, policy, store)
            .await
    }

    /// Both directions in one run
    pub async fn bidirectional_batch(
        &self,
        id: ProtocolId,
        queue: &mut BatchQueue,
        policy: &dyn TransferPolicyProvider,
        store: &mut dyn FileStore,
    ) -> Result<BatchRun, ExternalError> {
        self.run_batch(id, TransferKind::Bidirectional, queue, policy, store)
            .await
    }

    async fn run_batch(
        &self,
        id: ProtocolId,
        kind: TransferKind,
        queue: &mut BatchQueue,
        policy: &dyn TransferPolicyProvider,
        store: &mut dyn FileStore,
    ) -> Result<BatchRun, ExternalError> {
        let (protocol, template) = self.template(id, kind)?;
        let sends = matches!(kind, TransferKind::DownloadBatch | TransferKind::Bidirectional);
        let receives = matches!(kind, TransferKind::UploadBatch | TransferKind::Bidirectional);

        let admitted = |direction, wanted: bool| -> Vec<BatchEntry> {
            if wanted {
                queue.admitted(direction, policy).into_iter().cloned().collect()
            } else {
                Vec::new()
            }
        };
        let downloads = admitted(Direction::Download, sends);
        let uploads = admitted(Direction::Upload, receives);

        let manifest = |name: &str, entries: &[BatchEntry]| -> Result<ManifestGuard, ExternalError> {
            let paths: Vec<PathBuf> = entries.iter().filter_map(|e| store.locate(e)).collect();
            ManifestGuard::write(self.work_dir.join(name), &paths).map_err(ExternalError::Manifest)
        };
        let download_list = if sends { Some(manifest(DOWNLOAD_MANIFEST, &downloads)?) } else { None };
        let upload_list = if receives { Some(manifest(UPLOAD_MANIFEST, &uploads)?) } else { None };

        let list_path = |guard: &Option<ManifestGuard>| {
            guard
                .as_ref()
                .map(|g| g.path().to_string_lossy().into_owned())
                .unwrap_or_default()
        };
        let vars = TemplateVars {
            file: list_path(&download_list),
            upload_list: list_path(&upload_list),
            ..self.vars(queue.link_speed())
        };

        if let Some(log) = &self.dsz_log {
            remove_if_present(log).map_err(ExternalError::Manifest)?;
        }
        tracing::info!(
            protocol = %protocol.name,
            kind = %kind,
            downloads = downloads.len(),
            uploads = uploads.len(),
            "Starting external batch"
        );
        let code = self.execute(&expand_template(template, &vars)).await;
        drop(download_list);
        drop(upload_list);
        let outcome = ExternalOutcome::from_exit_code(code?, protocol.ok_code);

        let mut run = BatchRun {
            outcome,
            completed: Vec::new(),
            failed: Vec::new(),
        };
        match self.read_dsz_log().await? {
            Some(records) => reconcile(&records, queue, store, &mut run),
            None => {
                for entry in downloads.iter().chain(uploads.iter()) {
                    if outcome.is_sent() {
                        run.settle(queue.complete(entry.filename(), entry.direction(), store));
                    } else if let Some(failed) = queue.fail(entry.filename(), entry.direction(), store) {
                        run.failed.push(failed);
                    }
                }
            }
        }

        // Uploads the program never reported did not arrive
        for entry in &uploads {
            if let Some(failed) = queue.fail(entry.filename(), Direction::Upload, store) {
                run.failed.push(failed);
            }
        }
        Ok(run)
    }

    async fn read_dsz_log(&self) -> Result<Option<Vec<DszRecord>>, ExternalError> {
        let Some(path) = &self.dsz_log else {
            return Ok(None);
        };
        match tokio::fs::read(path).await {
            Ok(raw) => Ok(Some(parse_dsz_log(&String::from_utf8_lossy(&raw)))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ExternalError::Manifest(e)),
        }
    }
}

fn reconcile(records: &[DszRecord], queue: &mut BatchQueue, store: &mut dyn FileStore, run: &mut BatchRun) {
    for record in records {
        let direction = match record.status {
            DszStatus::Received => Direction::Upload,
            DszStatus::Sent => Direction::Download,
            DszStatus::Error => {
                tracing::warn!(file = %record.file_name, "External program reported an error");
                if let Some(failed) = queue
                    .fail(&record.file_name, Direction::Upload, store)
                    .or_else(|| queue.fail(&record.file_name, Direction::Download, store))
                {
                    run.failed.push(failed);
                }
                continue;
            }
        };
        let result = queue.complete(&record.file_name, direction, store);
        if let Ok(Some(entry)) = &result {
            tracing::info!(file = %entry.display_name(), cps = record.cps, "Transferred");
        }
        run.settle(result);
    }
}
