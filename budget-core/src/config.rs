//! Configuration for the budget ledger

use crate::{line::OveragePolicy, types::HashAlgorithm};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Integrity sealing configuration
    pub integrity: IntegrityConfig,

    /// Execution tracking configuration
    pub execution: ExecutionConfig,

    /// Attempts made by the ledger for a conflicting write
    pub max_conflict_retries: u32,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/budget"),
            service_name: "budget-core".to_string(),
            integrity: IntegrityConfig::default(),
            execution: ExecutionConfig::default(),
            max_conflict_retries: 3,
            rocksdb: RocksDBConfig::default(),
        }
    }
}

/// Integrity sealing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    /// Algorithm for new seals; existing seals keep their own tag
    pub algorithm: HashAlgorithm,

    /// Record Prometheus metrics
    pub metrics_enabled: bool,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            algorithm: HashAlgorithm::Sha256V1,
            metrics_enabled: true,
        }
    }
}

/// Execution tracking configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// What happens when executed quantity passes the current quantity
    pub overage_policy: OveragePolicy,
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// fsync every write batch
    pub sync_writes: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            max_background_jobs: 2,
            sync_writes: true,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("BUDGET_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(tag) = std::env::var("BUDGET_HASH_ALGORITHM") {
            config.integrity.algorithm = HashAlgorithm::from_tag(&tag).ok_or_else(|| {
                crate::Error::Config(format!("Unknown hash algorithm: {}", tag))
            })?;
        }

        if let Ok(policy) = std::env::var("BUDGET_OVERAGE_POLICY") {
            config.execution.overage_policy = policy
                .parse::<OveragePolicy>()
                .map_err(|e| crate::Error::Config(e.to_string()))?;
        }

        Ok(config)
    }
}
