//! Batch transfer queue
//!
//! Files are queued for a later batch transfer. Admission is checked against
//! the caller's remaining connection time and transfer ratio, and the queue
//! keeps the file store informed when entries finish or fail.

use crate::core::context::{FileStore, TransferPolicyProvider};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Seconds per byte per bps, an empirical line-overhead factor
pub const DEFAULT_ETA_FACTOR: f64 = 12.656;

/// Default queue capacity
pub const DEFAULT_CAPACITY: usize = 50;

/// Required ratios at or below this are treated as "no requirement"
const RATIO_EPSILON: f64 = 0.0001;

/// Estimated seconds to move `bytes` at `speed_bps`; 0 when the speed is unknown
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn estimated_time(bytes: u64, speed_bps: u32, factor: f64) -> u64 {
    if speed_bps == 0 {
        return 0;
    }
    (factor * bytes as f64 / f64::from(speed_bps)).round().max(0.0) as u64
}

/// Normalize a file name to the padded, upper-case `NNNNNNNN.EEE` form
///
/// Names with path separators or device characters become the blank
/// pattern. `*` turns the rest of its field into `?` wildcards.
pub fn align_filename(name: &str) -> String {
    const BLANK: &str = "        .   ";

    if name.starts_with('.') || name.contains(&['\\', '/', ':', '<', '>', '|'][..]) {
        return BLANK.to_string();
    }

    let (stem, ext) = match name.rfind('.') {
        Some(dot) => (&name[..dot], &name[dot + 1..]),
        None => (name, ""),
    };

    let field = |part: &str, width: usize| -> String {
        let mut out = String::with_capacity(width);
        let mut fill = None;
        for c in part.chars().chain(std::iter::repeat(' ')).take(width) {
            let c = match fill {
                Some(f) => f,
                None => match c {
                    '*' => {
                        fill = Some('?');
                        '?'
                    }
                    ' ' => {
                        fill = Some(' ');
                        ' '
                    }
                    c => c.to_ascii_uppercase(),
                },
            };
            out.push(c);
        }
        out
    };

    format!("{}.{}", field(stem, 8), field(ext, 3))
}

/// Undo [`align_filename`] padding: `"README  .TXT"` becomes `"README.TXT"`
pub fn unalign_filename(aligned: &str) -> String {
    let (stem, ext) = aligned.split_once('.').unwrap_or((aligned, ""));
    let stem = stem.trim_end();
    let ext = ext.trim_end();
    if ext.is_empty() {
        stem.to_string()
    } else {
        format!("{stem}.{ext}")
    }
}

/// Transfer direction, seen from the remote user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// User sends, we receive
    Upload,
    /// We send, user receives
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => write!(f, "upload"),
            Direction::Download => write!(f, "download"),
        }
    }
}

/// File area an entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DirectoryId {
    /// A regular file area
    Area(u16),
    /// The per-session temporary area; never queueable
    Temporary,
}

impl DirectoryId {
    /// Whether entries from this directory may be queued
    pub fn is_queueable(self) -> bool {
        matches!(self, DirectoryId::Area(_))
    }
}

/// One queued file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchEntry {
    filename: String,
    directory: DirectoryId,
    length: u64,
    direction: Direction,
}

impl BatchEntry {
    /// Create an entry; the name is normalized with [`align_filename`]
    pub fn new(filename: &str, directory: DirectoryId, length: u64, direction: Direction) -> Self {
        Self {
            filename: align_filename(filename),
            directory,
            length,
            direction,
        }
    }

    /// Aligned file name
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Name without alignment padding
    pub fn display_name(&self) -> String {
        unalign_filename(&self.filename)
    }

    /// Owning directory
    pub fn directory(&self) -> DirectoryId {
        self.directory
    }

    /// Size in bytes
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Direction
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Estimated transfer time in seconds
    pub fn estimated_time(&self, speed_bps: u32, factor: f64) -> u64 {
        estimated_time(self.length, speed_bps, factor)
    }
}

/// Why an entry was refused
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdmissionDenied {
    /// Queue is at capacity
    #[error("No room left in batch queue ({capacity} entries)")]
    QueueFull {
        /// Configured capacity
        capacity: usize,
    },

    /// Not enough connection time left
    #[error("Not enough time left in queue: need {needed}s, have {remaining}s")]
    InsufficientTime {
        /// Queued time including the new entry
        needed: u64,
        /// Caller's remaining seconds
        remaining: i64,
    },

    /// Download would push the caller below the required ratio
    #[error("Ratio too low: {projected:.3} < {required:.3}")]
    RatioTooLow {
        /// Ratio after the queued downloads
        projected: f64,
        /// System requirement
        required: f64,
    },

    /// Entry lives in a pseudo-directory
    #[error("Can't add temporary file to batch queue")]
    NotQueueable,

    /// Same file already queued in the same direction
    #[error("{0} is already queued")]
    AlreadyQueued(String),
}

/// The file store refused a finished transfer
///
/// The entry is already out of the queue and, for uploads, its staged file
/// has been discarded.
#[derive(Debug, Error)]
#[error("Cannot commit {}: {source}", .entry.display_name())]
pub struct CommitError {
    /// Entry that was refused
    pub entry: BatchEntry,
    /// Store failure
    #[source]
    pub source: std::io::Error,
}

/// Commit `entry` to `store`, discarding a staged upload the store refuses
pub fn commit_entry(store: &mut dyn FileStore, entry: &BatchEntry) -> Result<(), CommitError> {
    store.commit(entry).map_err(|source| {
        tracing::error!(file = %entry.display_name(), direction = %entry.direction, "Commit refused: {}", source);
        if entry.direction == Direction::Upload {
            store.discard(entry);
        }
        CommitError {
            entry: entry.clone(),
            source,
        }
    })
}

/// Queue limits
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Maximum number of entries
    pub capacity: usize,
    /// Factor of the transfer time estimate
    pub eta_factor: f64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            eta_factor: DEFAULT_ETA_FACTOR,
        }
    }
}

/// Ordered list of pending transfers
#[derive(Debug, Clone)]
pub struct BatchQueue {
    entries: Vec<BatchEntry>,
    settings: BatchSettings,
    link_speed: u32,
}

impl BatchQueue {
    /// Create an empty queue
    pub fn new(settings: BatchSettings, link_speed: u32) -> Self {
        Self {
            entries: Vec::new(),
            settings,
            link_speed,
        }
    }

    /// Current link speed in bps
    pub fn link_speed(&self) -> u32 {
        self.link_speed
    }

    /// Change the link speed used for estimates
    pub fn set_link_speed(&mut self, speed_bps: u32) {
        self.link_speed = speed_bps;
    }

    /// Queue limits
    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in presentation order
    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    /// Entries going one way
    pub fn iter_direction(&self, direction: Direction) -> impl Iterator<Item = &BatchEntry> {
        self.entries.iter().filter(move |e| e.direction == direction)
    }

    /// Number of entries going one way
    pub fn count(&self, direction: Direction) -> usize {
        self.iter_direction(direction).count()
    }

    /// Bytes queued one way
    pub fn total_bytes(&self, direction: Direction) -> u64 {
        self.iter_direction(direction).map(|e| e.length).sum()
    }

    /// Estimated seconds for everything queued one way, at the current speed
    pub fn aggregate_time(&self, direction: Direction) -> u64 {
        self.iter_direction(direction)
            .map(|e| e.estimated_time(self.link_speed, self.settings.eta_factor))
            .sum()
    }

    /// Estimated seconds for one entry at the current speed
    pub fn entry_time(&self, entry: &BatchEntry) -> u64 {
        entry.estimated_time(self.link_speed, self.settings.eta_factor)
    }

    /// Position of a file queued in `direction`
    pub fn position(&self, filename: &str, direction: Direction) -> Option<usize> {
        let aligned = align_filename(filename);
        self.entries
            .iter()
            .position(|e| e.direction == direction && e.filename == aligned)
    }

    /// Queue an entry after the admission checks
    pub fn add(
        &mut self,
        entry: BatchEntry,
        policy: &dyn TransferPolicyProvider,
    ) -> Result<(), AdmissionDenied> {
        if self.position(&entry.filename, entry.direction).is_some() {
            return Err(AdmissionDenied::AlreadyQueued(entry.display_name()));
        }
        if !entry.directory.is_queueable() {
            return Err(AdmissionDenied::NotQueueable);
        }
        if self.entries.len() >= self.settings.capacity {
            return Err(AdmissionDenied::QueueFull {
                capacity: self.settings.capacity,
            });
        }

        if entry.direction == Direction::Download {
            check_ratio(policy, self.total_bytes(Direction::Download) + entry.length)?;
            let needed = self.aggregate_time(Direction::Download) + self.entry_time(&entry);
            check_time(policy, needed)?;
        }

        tracing::debug!(
            file = %entry.filename,
            direction = %entry.direction,
            bytes = entry.length,
            "Queued"
        );
        self.entries.push(entry);
        Ok(())
    }

    /// Remove the entry at `index`, keeping the others in order
    pub fn remove(&mut self, index: usize) -> Option<BatchEntry> {
        (index < self.entries.len()).then(|| self.entries.remove(index))
    }

    /// Remove every entry matching `predicate`, keeping the others in order
    pub fn remove_where(&mut self, mut predicate: impl FnMut(&BatchEntry) -> bool) -> Vec<BatchEntry> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| predicate(e));
        self.entries = kept;
        removed
    }

    /// A queued file was transferred: commit it and drop it from the queue
    ///
    /// `Ok(None)` when nothing by that name is queued. The entry leaves the
    /// queue even when the store refuses it.
    pub fn complete(
        &mut self,
        filename: &str,
        direction: Direction,
        store: &mut dyn FileStore,
    ) -> Result<Option<BatchEntry>, CommitError> {
        let Some(index) = self.position(filename, direction) else {
            return Ok(None);
        };
        let entry = self.entries.remove(index);
        commit_entry(store, &entry)?;
        tracing::info!(file = %entry.display_name(), direction = %direction, "Transfer committed");
        Ok(Some(entry))
    }

    /// A queued file failed: discard a partial upload and drop it from the queue
    pub fn fail(
        &mut self,
        filename: &str,
        direction: Direction,
        store: &mut dyn FileStore,
    ) -> Option<BatchEntry> {
        let index = self.position(filename, direction)?;
        let entry = self.entries.remove(index);
        if direction == Direction::Upload {
            store.discard(&entry);
        }
        tracing::warn!(file = %entry.display_name(), direction = %direction, "Transfer failed");
        Some(entry)
    }

    /// Empty the queue, discarding every pending upload
    pub fn clear(&mut self, store: &mut dyn FileStore) {
        for entry in self.entries.drain(..) {
            if entry.direction == Direction::Upload {
                store.discard(&entry);
            }
        }
    }

    /// Entries one way that still pass the cumulative time and ratio checks
    ///
    /// Uploads are always admitted. Downloads are walked in order; one that
    /// would overrun the budget is skipped and later, smaller ones may still
    /// fit.
    pub fn admitted(
        &self,
        direction: Direction,
        policy: &dyn TransferPolicyProvider,
    ) -> Vec<&BatchEntry> {
        if direction == Direction::Upload {
            return self.iter_direction(direction).collect();
        }

        let mut time = 0;
        let mut bytes = 0;
        let mut admitted = Vec::new();
        for entry in self.iter_direction(direction) {
            let entry_time = self.entry_time(entry);
            let verdict = check_time(policy, time + entry_time)
                .and_then(|()| check_ratio(policy, bytes + entry.length));
            match verdict {
                Ok(()) => {
                    time += entry_time;
                    bytes += entry.length;
                    admitted.push(entry);
                }
                Err(e) => tracing::warn!(file = %entry.display_name(), "Cannot download: {}", e),
            }
        }
        admitted
    }
}

/// Time budget check for `needed` seconds of downloads
pub fn check_time(policy: &dyn TransferPolicyProvider, needed: u64) -> Result<(), AdmissionDenied> {
    if policy.time_exempt() || policy.ratio_exempt() {
        return Ok(());
    }
    let remaining = policy.remaining_seconds();
    if remaining < i64::try_from(needed).unwrap_or(i64::MAX) {
        return Err(AdmissionDenied::InsufficientTime { needed, remaining });
    }
    Ok(())
}

/// Ratio check for `extra_bytes` of additional downloads
pub fn check_ratio(policy: &dyn TransferPolicyProvider, extra_bytes: u64) -> Result<(), AdmissionDenied> {
    let required = policy.required_ratio();
    if required <= RATIO_EPSILON || policy.ratio_exempt() {
        return Ok(());
    }
    let projected = policy.projected_ratio(extra_bytes);
    if projected < required {
        return Err(AdmissionDenied::RatioTooLow { projected, required });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::{MockFileStore, MockTransferPolicyProvider};

    fn policy(remaining: i64, projected: f64, required: f64, exempt: bool) -> MockTransferPolicyProvider {
        let mut policy = MockTransferPolicyProvider::new();
        policy.expect_remaining_seconds().return_const(remaining);
        policy.expect_ratio().return_const(projected);
        policy.expect_projected_ratio().returning(move |_| projected);
        policy.expect_required_ratio().return_const(required);
        policy.expect_ratio_exempt().return_const(exempt);
        policy.expect_time_exempt().return_const(false);
        policy
    }

    fn generous() -> MockTransferPolicyProvider {
        policy(i64::MAX, 10.0, 0.0, false)
    }

    fn download(name: &str, len: u64) -> BatchEntry {
        BatchEntry::new(name, DirectoryId::Area(1), len, Direction::Download)
    }

    fn upload(name: &str, len: u64) -> BatchEntry {
        BatchEntry::new(name, DirectoryId::Area(1), len, Direction::Upload)
    }

    #[test]
    fn test_estimated_time() {
        assert_eq!(estimated_time(0, 2400, DEFAULT_ETA_FACTOR), 0);
        assert_eq!(estimated_time(10_000, 0, DEFAULT_ETA_FACTOR), 0);
        assert_eq!(estimated_time(10_000, 2400, DEFAULT_ETA_FACTOR), 53);
        assert_eq!(estimated_time(20_000, 2400, DEFAULT_ETA_FACTOR), 105);
    }

    #[test]
    fn test_aggregate_time_two_downloads() {
        let mut queue = BatchQueue::new(BatchSettings::default(), 2400);
        queue.add(download("A.ZIP", 10_000), &generous()).unwrap();
        queue.add(download("B.ZIP", 20_000), &generous()).unwrap();
        queue.add(upload("C.ZIP", 50_000), &generous()).unwrap();

        let expected = (12.656f64 * 10_000.0 / 2400.0).round() + (12.656f64 * 20_000.0 / 2400.0).round();
        assert_eq!(queue.aggregate_time(Direction::Download), expected as u64);
        assert_eq!(queue.aggregate_time(Direction::Upload), 264);

        queue.set_link_speed(0);
        assert_eq!(queue.aggregate_time(Direction::Download), 0);
    }

    #[test]
    fn test_remove_preserves_order() {
        let mut queue = BatchQueue::new(BatchSettings::default(), 2400);
        for name in ["ONE.TXT", "TWO.TXT", "THREE.TXT"] {
            queue.add(download(name, 100), &generous()).unwrap();
        }

        let removed = queue.remove(1).unwrap();
        assert_eq!(removed.display_name(), "TWO.TXT");
        let names: Vec<String> = queue.entries().iter().map(BatchEntry::display_name).collect();
        assert_eq!(names, ["ONE.TXT", "THREE.TXT"]);
        assert!(queue.remove(5).is_none());
    }

    #[test]
    fn test_remove_where() {
        let mut queue = BatchQueue::new(BatchSettings::default(), 2400);
        queue.add(download("A", 1), &generous()).unwrap();
        queue.add(upload("B", 1), &generous()).unwrap();
        queue.add(download("C", 1), &generous()).unwrap();

        let removed = queue.remove_where(|e| e.direction() == Direction::Download);
        assert_eq!(removed.len(), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.entries()[0].display_name(), "B");
    }

    #[test]
    fn test_time_budget_is_strict() {
        // 10 000 bytes at 2400 bps is 53 seconds
        let mut queue = BatchQueue::new(BatchSettings::default(), 2400);
        queue.add(download("A", 10_000), &policy(53, 1.0, 0.0, false)).unwrap();

        let err = queue.add(download("B", 10_000), &policy(105, 1.0, 0.0, false)).unwrap_err();
        assert_eq!(err, AdmissionDenied::InsufficientTime { needed: 106, remaining: 105 });

        queue.add(download("B", 10_000), &policy(105, 1.0, 0.0, true)).unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_uploads_ignore_time_and_ratio() {
        let mut queue = BatchQueue::new(BatchSettings::default(), 300);
        queue.add(upload("BIG.ZIP", 10_000_000), &policy(0, 0.0, 1.0, false)).unwrap();
    }

    #[test]
    fn test_ratio_check() {
        let mut queue = BatchQueue::new(BatchSettings::default(), 2400);
        let err = queue.add(download("A", 10), &policy(1000, 0.2, 0.5, false)).unwrap_err();
        assert!(matches!(err, AdmissionDenied::RatioTooLow { .. }));

        // Tiny requirements mean no requirement
        queue.add(download("A", 10), &policy(1000, 0.0, 0.00001, false)).unwrap();

        queue.add(download("B", 10), &policy(1000, 0.2, 0.5, true)).unwrap();
    }

    #[test]
    fn test_projected_ratio_sees_queued_bytes() {
        let mut queue = BatchQueue::new(BatchSettings::default(), 0);
        queue.add(download("A", 1000), &generous()).unwrap();

        let mut policy = MockTransferPolicyProvider::new();
        policy.expect_required_ratio().return_const(0.5);
        policy.expect_ratio_exempt().return_const(false);
        policy.expect_time_exempt().return_const(false);
        policy.expect_remaining_seconds().return_const(1000i64);
        policy
            .expect_projected_ratio()
            .withf(|extra| *extra == 1500)
            .return_const(0.6);
        queue.add(download("B", 500), &policy).unwrap();
    }

    #[test]
    fn test_capacity_duplicates_and_temporary() {
        let settings = BatchSettings { capacity: 2, ..BatchSettings::default() };
        let mut queue = BatchQueue::new(settings, 2400);
        queue.add(download("a.zip", 1), &generous()).unwrap();

        assert_eq!(
            queue.add(download("A.ZIP", 1), &generous()),
            Err(AdmissionDenied::AlreadyQueued("A.ZIP".into()))
        );
        queue.add(upload("A.ZIP", 1), &generous()).unwrap();

        assert_eq!(
            queue.add(download("B.ZIP", 1), &generous()),
            Err(AdmissionDenied::QueueFull { capacity: 2 })
        );

        let temp = BatchEntry::new("T.ZIP", DirectoryId::Temporary, 1, Direction::Download);
        assert_eq!(queue.add(temp, &generous()), Err(AdmissionDenied::NotQueueable));
    }

    #[test]
    fn test_complete_and_fail_notify_store() {
        let mut queue = BatchQueue::new(BatchSettings::default(), 2400);
        queue.add(download("D.ZIP", 1), &generous()).unwrap();
        queue.add(upload("U.ZIP", 1), &generous()).unwrap();
        queue.add(download("X.ZIP", 1), &generous()).unwrap();

        let mut store = MockFileStore::new();
        store
            .expect_commit()
            .withf(|e| e.display_name() == "D.ZIP")
            .times(1)
            .returning(|_| Ok(()));
        store
            .expect_discard()
            .withf(|e| e.display_name() == "U.ZIP")
            .times(1)
            .return_const(());

        assert!(queue.complete("d.zip", Direction::Download, &mut store).unwrap().is_some());
        assert!(queue.fail("U.ZIP", Direction::Upload, &mut store).is_some());
        // Failed downloads leave nothing to clean up
        assert!(queue.fail("X.ZIP", Direction::Download, &mut store).is_some());
        assert!(queue.complete("D.ZIP", Direction::Download, &mut store).unwrap().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_refused_commit_evicts_and_discards_upload() {
        let mut queue = BatchQueue::new(BatchSettings::default(), 2400);
        queue.add(upload("U.ZIP", 1), &generous()).unwrap();
        queue.add(upload("V.ZIP", 1), &generous()).unwrap();

        let mut store = MockFileStore::new();
        store
            .expect_commit()
            .withf(|e| e.display_name() == "U.ZIP")
            .times(1)
            .returning(|_| Err(std::io::Error::new(std::io::ErrorKind::NotFound, "area gone")));
        store
            .expect_discard()
            .withf(|e| e.display_name() == "U.ZIP")
            .times(1)
            .return_const(());

        let err = queue.complete("U.ZIP", Direction::Upload, &mut store).unwrap_err();
        assert_eq!(err.entry.display_name(), "U.ZIP");
        assert_eq!(err.source.kind(), std::io::ErrorKind::NotFound);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.entries()[0].display_name(), "V.ZIP");
    }

    #[test]
    fn test_clear_discards_uploads() {
        let mut queue = BatchQueue::new(BatchSettings::default(), 2400);
        queue.add(upload("U1", 1), &generous()).unwrap();
        queue.add(download("D1", 1), &generous()).unwrap();
        queue.add(upload("U2", 1), &generous()).unwrap();

        let mut store = MockFileStore::new();
        store.expect_discard().times(2).return_const(());
        queue.clear(&mut store);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_admitted_skips_what_does_not_fit() {
        let mut queue = BatchQueue::new(BatchSettings::default(), 2400);
        queue.add(download("A", 10_000), &generous()).unwrap();
        queue.add(download("B", 20_000), &generous()).unwrap();
        queue.add(download("C", 1_000), &generous()).unwrap();

        // A = 53s, B = 105s, C = 5s
        let admitted = queue.admitted(Direction::Download, &policy(60, 1.0, 0.0, false));
        let names: Vec<String> = admitted.iter().map(|e| e.display_name()).collect();
        assert_eq!(names, ["A", "C"]);
    }

    #[test]
    fn test_align_filename() {
        assert_eq!(align_filename("readme.txt"), "README  .TXT");
        assert_eq!(align_filename("GAMES"), "GAMES   .   ");
        assert_eq!(align_filename("longfilename.text"), "LONGFILE.TEX");
        assert_eq!(align_filename("*.zip"), "????????.ZIP");
        assert_eq!(align_filename("ab*.z*"), "AB??????.Z??");
        assert_eq!(align_filename("../etc"), "        .   ");
        assert_eq!(align_filename("c:x.txt"), "        .   ");
    }

    #[test]
    fn test_unalign_filename() {
        assert_eq!(unalign_filename("README  .TXT"), "README.TXT");
        assert_eq!(unalign_filename("GAMES   .   "), "GAMES");
        assert_eq!(unalign_filename(&align_filename("x.c")), "X.C");
    }
}
