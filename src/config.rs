//! Configuration for an [`IndexManager`](crate::manager::IndexManager).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::segment::SegmentEngineConfig;
use crate::error::{HoplonError, Result};
use crate::lifecycle::LifecycleOptions;
use crate::worker::WorkerConfig;

/// Top-level settings. Every key is optional in JSON and falls back to its
/// default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HoplonConfig {
    /// Most indexes kept open at once.
    pub max_open_indexes: usize,

    /// Worker threads draining the job queue.
    pub worker_threads: usize,

    /// How long a worker waits for a job before doing maintenance.
    pub poll_interval_ms: u64,

    /// Slice length of every bounded wait.
    pub wait_interval_ms: u64,

    /// Idle time after which an index is compacted.
    pub compact_after_ms: u64,

    /// Failed jobs remembered per index.
    pub max_errors_per_index: usize,

    /// Segments above this count mean a merge is pending.
    pub max_segments: usize,
}

impl Default for HoplonConfig {
    fn default() -> Self {
        HoplonConfig {
            max_open_indexes: 100,
            worker_threads: 1,
            poll_interval_ms: 1000,
            wait_interval_ms: 100,
            compact_after_ms: 30 * 60 * 1000,
            max_errors_per_index: 100,
            max_segments: 10,
        }
    }
}

impl HoplonConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: HoplonConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.max_open_indexes == 0, "max_open_indexes must be at least 1"),
            (self.worker_threads == 0, "worker_threads must be at least 1"),
            (self.poll_interval_ms == 0, "poll_interval_ms must be positive"),
            (self.wait_interval_ms == 0, "wait_interval_ms must be positive"),
            (self.compact_after_ms == 0, "compact_after_ms must be positive"),
            (self.max_segments == 0, "max_segments must be at least 1"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(HoplonError::invalid_config(*message)),
            None => Ok(()),
        }
    }

    pub fn lifecycle_options(&self) -> LifecycleOptions {
        LifecycleOptions {
            wait_interval: Duration::from_millis(self.wait_interval_ms),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            threads: self.worker_threads,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            compact_after: Duration::from_millis(self.compact_after_ms),
            max_errors_per_index: self.max_errors_per_index,
        }
    }

    pub fn engine_config(&self) -> SegmentEngineConfig {
        SegmentEngineConfig {
            max_segments: self.max_segments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = HoplonConfig::from_json_str(r#"{"max_open_indexes": 5}"#).unwrap();
        assert_eq!(config.max_open_indexes, 5);
        assert_eq!(config.worker_threads, 1);
        assert_eq!(config.compact_after_ms, 1_800_000);
    }

    #[test]
    fn test_validation_rejects_zero() {
        let err = HoplonConfig::from_json_str(r#"{"worker_threads": 0}"#).unwrap_err();
        assert!(matches!(err, HoplonError::InvalidConfig(_)));
        assert!(HoplonConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"poll_interval_ms": 50, "max_segments": 4}}"#).unwrap();

        let config = HoplonConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.poll_interval_ms, 50);
        assert_eq!(config.engine_config().max_segments, 4);
        assert_eq!(config.worker_config().poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_invalid_json_is_a_json_error() {
        let err = HoplonConfig::from_json_str("{").unwrap_err();
        assert!(matches!(err, HoplonError::Json(_)));
    }
}
