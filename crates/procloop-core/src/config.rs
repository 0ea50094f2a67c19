//! Centralized configuration for procloop.
//!
//! Engine constants live as associated consts on [`EngineConfig`]; the
//! per-pool tunables live in [`PoolConfig`], which can also be loaded from a
//! JSON file.

use crate::error::{ProcloopError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine-wide constants.
pub struct EngineConfig;

impl EngineConfig {
    // Buffers
    pub const DEFAULT_BUFFER_CAPACITY: usize = 65_536;
    pub const MIN_BUFFER_CAPACITY: usize = 16;

    // Event loop timing
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
    pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
    pub const DEFAULT_LINGER_TIME: Duration = Duration::from_millis(2500);
    pub const MIN_LINGER_TIME: Duration = Duration::from_millis(1000);
    // After a reap: how long a quiet pipe may stay open, and the hard limit.
    pub const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(100);
    pub const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

    // Event loop limits
    pub const EVENT_BATCH_SIZE: usize = 64;
    pub const MAX_STDIN_CHUNKS_PER_EVENT: usize = 16;
    pub const MAX_INTERRUPTED_WRITES: u32 = 8;
    pub const DRAIN_READ_LIMIT: usize = 64;

    pub const WORKER_THREAD_PREFIX: &'static str = "procloop-io";
}

/// Runtime configuration for a [`ProcessPool`](crate::ProcessPool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of event-loop workers.
    pub workers: usize,
    /// Capacity of each stdout/stderr/stdin buffer, in bytes.
    pub buffer_capacity: usize,
    /// Upper bound on one readiness wait.
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,
    /// How long an idle worker keeps its thread before retiring.
    #[serde(rename = "linger_time_ms", with = "duration_ms")]
    pub linger_time: Duration,
    /// Treat EOF on both stdout and stderr as a hint that the child is exiting.
    pub soft_exit_detection: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_worker_count(),
            buffer_capacity: EngineConfig::DEFAULT_BUFFER_CAPACITY,
            poll_interval: EngineConfig::DEFAULT_POLL_INTERVAL,
            linger_time: EngineConfig::DEFAULT_LINGER_TIME,
            soft_exit_detection: true,
        }
    }
}

impl PoolConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_linger_time(mut self, linger: Duration) -> Self {
        self.linger_time = linger;
        self
    }

    pub fn with_soft_exit_detection(mut self, enabled: bool) -> Self {
        self.soft_exit_detection = enabled;
        self
    }

    /// Number of consecutive idle poll ticks after which a worker retires.
    pub fn linger_iterations(&self) -> u32 {
        let poll = self.poll_interval.as_millis().max(1);
        u32::try_from(self.linger_time.as_millis() / poll).unwrap_or(u32::MAX)
    }

    /// Check that the configuration can drive a pool.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(config_error("workers must be at least 1"));
        }
        if self.buffer_capacity < EngineConfig::MIN_BUFFER_CAPACITY {
            return Err(config_error(format!(
                "buffer_capacity must be at least {} bytes",
                EngineConfig::MIN_BUFFER_CAPACITY
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(config_error("poll_interval must be greater than zero"));
        }
        if self.linger_time < self.poll_interval {
            return Err(config_error("linger_time must not be shorter than poll_interval"));
        }
        Ok(())
    }

    /// Pull user-supplied timings into the supported range.
    ///
    /// Linger is raised to at least [`EngineConfig::MIN_LINGER_TIME`]; the poll
    /// interval is kept between [`EngineConfig::MIN_POLL_INTERVAL`] and the
    /// linger time.
    pub fn clamped(mut self) -> Self {
        self.linger_time = self.linger_time.max(EngineConfig::MIN_LINGER_TIME);
        self.poll_interval = self
            .poll_interval
            .clamp(EngineConfig::MIN_POLL_INTERVAL, self.linger_time);
        self
    }

    /// Load a configuration from a JSON file.
    ///
    /// Missing fields take their defaults; timings are clamped before
    /// validation.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ProcloopError::Config {
            message: format!("failed to read {}: {}", path.display(), e),
        })?;
        let config: PoolConfig = serde_json::from_str(&text)?;
        let config = config.clamped();
        config.validate()?;
        Ok(config)
    }
}

/// Half of the available cores, never fewer than one.
pub fn default_worker_count() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores / 2).max(1)
}

fn config_error(message: impl Into<String>) -> ProcloopError {
    ProcloopError::Config {
        message: message.into(),
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert!(config.workers >= 1);
        assert_eq!(config.buffer_capacity, 65_536);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert!(config.soft_exit_detection);
        assert_eq!(config.linger_iterations(), 10);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(PoolConfig::default().with_workers(0).validate().is_err());
        assert!(PoolConfig::default().with_buffer_capacity(4).validate().is_err());
        assert!(PoolConfig::default()
            .with_poll_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(PoolConfig::default()
            .with_poll_interval(Duration::from_secs(5))
            .with_linger_time(Duration::from_secs(1))
            .validate()
            .is_err());
    }

    #[test]
    fn test_clamped() {
        let config = PoolConfig::default()
            .with_poll_interval(Duration::from_millis(5))
            .with_linger_time(Duration::from_millis(10))
            .clamped();
        assert_eq!(config.linger_time, EngineConfig::MIN_LINGER_TIME);
        assert_eq!(config.poll_interval, EngineConfig::MIN_POLL_INTERVAL);

        let config = PoolConfig::default()
            .with_poll_interval(Duration::from_secs(30))
            .clamped();
        assert_eq!(config.poll_interval, config.linger_time);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"workers": 3, "buffer_capacity": 1024, "poll_interval_ms": 50}}"#
        )
        .unwrap();

        let config = PoolConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.buffer_capacity, 1024);
        // Clamped up to the minimum.
        assert_eq!(config.poll_interval, EngineConfig::MIN_POLL_INTERVAL);
        assert_eq!(config.linger_time, EngineConfig::DEFAULT_LINGER_TIME);
    }

    #[test]
    fn test_from_json_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(
            PoolConfig::from_json_file(&missing),
            Err(ProcloopError::Config { .. })
        ));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        assert!(matches!(
            PoolConfig::from_json_file(&bad),
            Err(ProcloopError::Json { .. })
        ));
    }

    #[test]
    fn test_json_roundtrip_uses_millis() {
        let config = PoolConfig::default().with_workers(2);
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["poll_interval_ms"], 250);
        assert_eq!(json["linger_time_ms"], 2500);
        let back: PoolConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }
}
