//! Engine configuration with TOML file loading.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sequence allocator tuning.
    pub allocator: AllocatorConfig,
    /// TTL cache tuning.
    pub cache: CacheConfig,
    /// Location grid limits.
    pub grid: GridConfig,
}

/// Batch sizes and reconciliation limits of the sequence allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Identifiers reserved per round-trip for sample ids.
    pub sample_batch: u32,
    /// Identifiers reserved per round-trip for container ids.
    pub container_batch: u32,
    /// Identifiers reserved per round-trip for location codes.
    pub location_batch: u32,
    /// Largest tolerated distance between the stored counter and the
    /// observed maximum before the observed maximum wins.
    pub hole_threshold: u64,
    /// Width of the numeric run appended to patterns that have none.
    pub default_digits: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            sample_batch: 20,
            container_batch: 20,
            location_batch: 1,
            hole_threshold: 10_000,
            default_digits: 6,
        }
    }
}

/// Cache sizing and expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entry lifetime in milliseconds.
    pub ttl_ms: u64,
    /// Interval between background sweeps in milliseconds.
    pub sweep_interval_ms: u64,
    /// Number of independently locked shards.
    pub shards: usize,
    /// Total capacity across shards.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 5 * 60 * 1_000,
            sweep_interval_ms: 30 * 1_000,
            shards: 8,
            capacity: 4096,
        }
    }
}

impl CacheConfig {
    /// Entry lifetime.
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

/// Location hierarchy limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Maximum number of ancestors walked when checking a location's parent chain.
    pub max_depth: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self { max_depth: 16 }
    }
}

impl EngineConfig {
    /// Loads configuration from `explicit`, or from the default config path.
    ///
    /// A missing file yields the defaults.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        match explicit.or_else(default_config_path) {
            Some(path) if path.exists() => read_file(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Parses configuration from a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}

fn read_file(path: &Path) -> Result<EngineConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    EngineConfig::from_toml(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// Config file path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`EngineConfig`].
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// Config file path.
        path: PathBuf,
        /// Underlying parse error.
        source: toml::de::Error,
    },
}

/// Default location of the engine configuration file.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("biotrack").join("engine.toml"))
}
