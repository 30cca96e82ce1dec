//! Configuration loading
//!
//! Parsed from a TOML file; every field has a default so a missing file or a
//! partial one still yields a usable configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("data/book-exchange.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

/// Lock policy: how long a lock lasts and how often it may be extended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_duration_hours")]
    pub default_duration_hours: u32,
    #[serde(default = "default_max_extensions")]
    pub max_extensions: usize,
    #[serde(default = "default_extension_hours")]
    pub default_extension_hours: u32,
    /// Upper bound on a lock's duration and on a single extension.
    #[serde(default = "default_max_duration_hours")]
    pub max_duration_hours: u32,
}

fn default_duration_hours() -> u32 {
    48
}

fn default_max_extensions() -> usize {
    2
}

fn default_extension_hours() -> u32 {
    24
}

fn default_max_duration_hours() -> u32 {
    720
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_duration_hours: default_duration_hours(),
            max_extensions: default_max_extensions(),
            default_extension_hours: default_extension_hours(),
            max_duration_hours: default_max_duration_hours(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecomputeMode {
    /// Recompute on the calling thread once the ledger write has committed.
    #[default]
    Inline,
    /// Hand the recompute to a detached thread.
    Background,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchingConfig {
    #[serde(default)]
    pub recompute: RecomputeMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
}

fn default_sweep_interval() -> u64 {
    300
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_filter() -> String {
    "book_exchange=info,tower_http=info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}
