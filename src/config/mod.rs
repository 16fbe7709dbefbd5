//! Configuration module
//!
//! Handles transfer tuning, batch policy and external protocol definitions

mod settings;

pub use settings::{LoggingConfig, PathsConfig, PolicySettings, TransferSettings, XferConfig};

use directories::ProjectDirs;
use std::path::PathBuf;
use thiserror::Error;

/// Name of the configuration file inside the config directory
pub const CONFIG_FILE: &str = "config.toml";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No platform config directory
    #[error("Could not determine config directory")]
    NoConfigDir,

    /// File could not be read or written
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid TOML for this schema
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Configuration could not be encoded
    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("org", "bbsxfer", "bbsxfer").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the application data directory
pub fn data_dir() -> Option<PathBuf> {
    ProjectDirs::from("org", "bbsxfer", "bbsxfer").map(|dirs| dirs.data_dir().to_path_buf())
}

/// Default directory for manifests and external program runs
pub fn work_dir() -> Option<PathBuf> {
    data_dir().map(|d| d.join("work"))
}

/// Initialize application directories
pub fn init_directories() -> std::io::Result<()> {
    if let Some(dir) = config_dir() {
        std::fs::create_dir_all(&dir)?;
    }
    if let Some(dir) = work_dir() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(())
}
