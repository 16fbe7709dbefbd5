//! Transfer settings

use super::ConfigError;
use crate::core::batch::BatchSettings;
use crate::core::external::ExternalProtocol;
use crate::core::transfer::TransferTuning;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct XferConfig {
    /// Protocol picked when none is given, by display name
    pub default_protocol: Option<String>,
    /// Native protocol timing and retries
    pub transfer: TransferSettings,
    /// Batch queue policy
    pub batch: BatchSettings,
    /// Time and ratio limits applied to CLI sessions
    pub policy: PolicySettings,
    /// Commands of the ZMODEM engine; ZMODEM is unavailable without them
    pub zmodem: Option<ExternalProtocol>,
    /// External protocols, in menu order
    pub external: Vec<ExternalProtocol>,
    /// Logging settings
    pub logging: LoggingConfig,
    /// Working directories
    pub paths: PathsConfig,
}

impl XferConfig {
    /// Load config from the platform config directory, or defaults if absent
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = super::config_dir()
            .ok_or(ConfigError::NoConfigDir)?
            .join(super::CONFIG_FILE);

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Save config to the platform config directory
    pub fn save(&self) -> Result<(), ConfigError> {
        let dir = super::config_dir().ok_or(ConfigError::NoConfigDir)?;
        std::fs::create_dir_all(&dir)?;
        self.save_to(&dir.join(super::CONFIG_FILE))
    }

    /// Save config to a file
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.transfer;
        if t.max_retries == 0 {
            return Err(ConfigError::Invalid("transfer.max_retries must be at least 1".into()));
        }
        if t.crc_fallback_after > t.start_attempts {
            return Err(ConfigError::Invalid(
                "transfer.crc_fallback_after exceeds transfer.start_attempts".into(),
            ));
        }
        if t.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("transfer.poll_interval_ms must be positive".into()));
        }
        if self.batch.capacity == 0 {
            return Err(ConfigError::Invalid("batch.capacity must be positive".into()));
        }
        if self.batch.eta_factor <= 0.0 {
            return Err(ConfigError::Invalid("batch.eta_factor must be positive".into()));
        }
        Ok(())
    }

    /// Directory for manifests and external runs
    pub fn work_dir(&self) -> PathBuf {
        self.paths
            .work_dir
            .clone()
            .or_else(super::work_dir)
            .unwrap_or_else(std::env::temp_dir)
    }
}

/// Native protocol timing and retries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Seconds a sender waits for the start request
    pub start_timeout_secs: u64,
    /// Seconds a sender waits for a block reply
    pub ack_timeout_secs: u64,
    /// Seconds a receiver waits for the next block
    pub block_timeout_secs: u64,
    /// Milliseconds allowed between bytes of one block
    pub byte_timeout_ms: u64,
    /// Start requests before a receiver gives up
    pub start_attempts: u32,
    /// Start requests sent as 'C' before falling back to NAK
    pub crc_fallback_after: u32,
    /// Retries after a failure; one more consecutive error aborts
    pub max_retries: u32,
    /// Milliseconds between channel polls
    pub poll_interval_ms: u64,
    /// Link speed used for time estimates, in bps
    pub link_speed: u32,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self::from(&TransferTuning::default())
    }
}

impl From<&TransferTuning> for TransferSettings {
    #[allow(clippy::cast_possible_truncation)]
    fn from(tuning: &TransferTuning) -> Self {
        Self {
            start_timeout_secs: tuning.start_timeout.as_secs(),
            ack_timeout_secs: tuning.ack_timeout.as_secs(),
            block_timeout_secs: tuning.block_timeout.as_secs(),
            byte_timeout_ms: tuning.byte_timeout.as_millis() as u64,
            start_attempts: tuning.start_attempts,
            crc_fallback_after: tuning.crc_fallback_after,
            max_retries: tuning.max_retries,
            poll_interval_ms: tuning.poll_interval.as_millis() as u64,
            link_speed: 57_600,
        }
    }
}

impl TransferSettings {
    /// Engine tuning for these settings
    pub fn to_tuning(&self) -> TransferTuning {
        TransferTuning {
            start_timeout: Duration::from_secs(self.start_timeout_secs),
            ack_timeout: Duration::from_secs(self.ack_timeout_secs),
            block_timeout: Duration::from_secs(self.block_timeout_secs),
            byte_timeout: Duration::from_millis(self.byte_timeout_ms),
            start_attempts: self.start_attempts,
            crc_fallback_after: self.crc_fallback_after,
            max_retries: self.max_retries,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

/// Time and ratio limits for a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    /// Minutes of connection time; unlimited when unset
    pub time_limit_mins: Option<u64>,
    /// Required upload/download ratio; 0 disables the check
    pub required_ratio: f64,
    /// Skip ratio and time checks
    pub ratio_exempt: bool,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    /// Emit JSON lines instead of text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Working directories
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Where manifests are written and external programs run
    pub work_dir: Option<PathBuf>,
    /// Transfer log written by external programs
    pub dsz_log: Option<PathBuf>,
    /// Where uploads wait until they are complete
    pub staging_dir: Option<PathBuf>,
    /// Port substituted into external command lines
    pub port: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_engine() {
        let config = XferConfig::default();
        assert_eq!(config.transfer.to_tuning(), TransferTuning::default());
        assert_eq!(config.batch.capacity, 50);
        assert!((config.batch.eta_factor - 12.656).abs() < f64::EPSILON);
        assert!(config.zmodem.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = XferConfig::default();
        config.transfer.max_retries = 4;
        config.external.push(ExternalProtocol {
            name: "DSZ".into(),
            send: Some("dsz sz %3".into()),
            ok_code: 0,
            ..ExternalProtocol::default()
        });
        config.save_to(&path).unwrap();

        let loaded = XferConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[batch]\ncapacity = 10\n\n[zmodem]\nname = \"ZMODEM\"\nsend_batch = \"sz %3\"\n",
        )
        .unwrap();

        let config = XferConfig::load_from(&path).unwrap();
        assert_eq!(config.batch.capacity, 10);
        assert!((config.batch.eta_factor - 12.656).abs() < f64::EPSILON);
        assert_eq!(config.transfer, TransferSettings::default());
        let zmodem = config.zmodem.unwrap();
        assert_eq!(zmodem.send_batch.as_deref(), Some("sz %3"));
        assert!(zmodem.receive.is_none());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[transfer]\nmax_retries = 0\n").unwrap();
        assert!(matches!(XferConfig::load_from(&path), Err(ConfigError::Invalid(_))));

        std::fs::write(&path, "[transfer\n").unwrap();
        assert!(matches!(XferConfig::load_from(&path), Err(ConfigError::Parse(_))));
    }
}
