//! Configuration for the cache coordinator

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Coordinator configuration
///
/// Every field has a default so a bare `[Default::default]` instance is a
/// working configuration; `from_file` merges a TOML file over the defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Maximum time to wait for a contended lock, in milliseconds
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Timeout for acquiring a persistent-store transaction, in milliseconds
    #[serde(default = "default_txn_timeout_ms")]
    pub txn_timeout_ms: u64,

    /// Number of shards for the lock table (controls concurrency)
    #[serde(default = "default_num_key_shards")]
    pub num_key_shards: usize,

    /// Number of worker threads issuing eviction/downgrade callbacks
    #[serde(default = "default_num_callback_threads")]
    pub num_callback_threads: usize,

    /// How many times a binding range scan is re-locked before the call
    /// fails with a resource-exhaustion error
    #[serde(default = "default_max_range_retries")]
    pub max_range_retries: u32,

    /// How many times a commit is retried on transient store conflicts
    #[serde(default = "default_max_commit_retries")]
    pub max_commit_retries: u32,

    /// How many times a callback to a remote node is retried before it is
    /// abandoned (the lock then stays held until the owner releases it)
    #[serde(default = "default_max_callback_retries")]
    pub max_callback_retries: u32,

    /// Wait between retries of a failed callback or store operation, in
    /// milliseconds
    #[serde(default = "default_retry_wait_ms")]
    pub retry_wait_ms: u64,

    /// Number of node IDs to allocate from the store at once
    #[serde(default = "default_node_id_block_size")]
    pub node_id_block_size: u64,

    /// Whether to run cycle detection when a lock request blocks
    #[serde(default = "default_detect_deadlocks")]
    pub detect_deadlocks: bool,
}

fn default_lock_timeout_ms() -> u64 {
    1_000
}
fn default_txn_timeout_ms() -> u64 {
    5_000
}
fn default_num_key_shards() -> usize {
    8
}
fn default_num_callback_threads() -> usize {
    4
}
fn default_max_range_retries() -> u32 {
    100
}
fn default_max_commit_retries() -> u32 {
    100
}
fn default_max_callback_retries() -> u32 {
    3
}
fn default_retry_wait_ms() -> u64 {
    10
}
fn default_node_id_block_size() -> u64 {
    100
}
fn default_detect_deadlocks() -> bool {
    true
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            txn_timeout_ms: default_txn_timeout_ms(),
            num_key_shards: default_num_key_shards(),
            num_callback_threads: default_num_callback_threads(),
            max_range_retries: default_max_range_retries(),
            max_commit_retries: default_max_commit_retries(),
            max_callback_retries: default_max_callback_retries(),
            retry_wait_ms: default_retry_wait_ms(),
            node_id_block_size: default_node_id_block_size(),
            detect_deadlocks: default_detect_deadlocks(),
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from a TOML file, filling in defaults for
    /// unspecified fields.
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;
        let parsed: Self = cfg
            .try_deserialize()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Check field ranges.
    pub fn validate(&self) -> crate::Result<()> {
        if self.lock_timeout_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "lock_timeout_ms must be at least 1".into(),
            ));
        }
        if self.num_key_shards == 0 {
            return Err(crate::Error::InvalidConfig(
                "num_key_shards must be at least 1".into(),
            ));
        }
        if self.num_callback_threads == 0 {
            return Err(crate::Error::InvalidConfig(
                "num_callback_threads must be at least 1".into(),
            ));
        }
        if self.node_id_block_size == 0 {
            return Err(crate::Error::InvalidConfig(
                "node_id_block_size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn txn_timeout(&self) -> Duration {
        Duration::from_millis(self.txn_timeout_ms)
    }

    pub fn retry_wait(&self) -> Duration {
        Duration::from_millis(self.retry_wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let cfg = CoordinatorConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.num_key_shards, 8);
        assert_eq!(cfg.max_range_retries, 100);
    }

    #[test]
    fn test_from_file_merges_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coord.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "lock_timeout_ms = 250").unwrap();
        writeln!(f, "num_callback_threads = 2").unwrap();
        drop(f);

        let cfg = CoordinatorConfig::from_file(&path).unwrap();
        assert_eq!(cfg.lock_timeout_ms, 250);
        assert_eq!(cfg.num_callback_threads, 2);
        // untouched fields keep their defaults
        assert_eq!(cfg.node_id_block_size, 100);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let cfg = CoordinatorConfig {
            lock_timeout_ms: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
