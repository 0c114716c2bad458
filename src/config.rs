//! Runtime configuration.
//!
//! Every section has working defaults; a JSON file only needs to name what it
//! changes. Durations are written in milliseconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer::RetryPolicy;
use crate::error::{SyncResult, ValidationError};
use crate::store::DEFAULT_PROBE_QUERY;

/// Remote store endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SPARQL query endpoint (`ask`, `select`, probe).
    pub query_endpoint: String,
    /// SPARQL update endpoint.
    pub update_endpoint: String,
    /// Per-request transport timeout.
    pub request_timeout_ms: u64,
    /// Boolean query used by the connectivity probe.
    pub probe_query: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            query_endpoint: "http://localhost:3030/ontosync/query".to_string(),
            update_endpoint: "http://localhost:3030/ontosync/update".to_string(),
            request_timeout_ms: 5_000,
            probe_query: DEFAULT_PROBE_QUERY.to_string(),
        }
    }
}

impl StoreConfig {
    /// Per-request timeout as a `Duration`.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Delivery buffer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Interval between drain cycles while the store is healthy.
    pub tick_ms: u64,
    /// Queue length above which the oldest entries are evicted.
    pub max_pending: usize,
    /// First retry delay after a transient failure.
    pub retry_base_ms: u64,
    /// Upper bound of the retry delay.
    pub retry_max_ms: u64,
    /// Where the pending queue is persisted, if anywhere.
    pub journal_path: Option<PathBuf>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            tick_ms: 250,
            max_pending: 100_000,
            retry_base_ms: 500,
            retry_max_ms: 30_000,
            journal_path: None,
        }
    }
}

impl BufferConfig {
    /// Drain interval as a `Duration`.
    #[must_use]
    pub const fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Retry backoff between drain cycles.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_base_ms),
            Duration::from_millis(self.retry_max_ms),
        )
    }
}

/// Connectivity tracker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// Interval between probes.
    pub probe_interval_ms: u64,
    /// Longest silence since the last successful probe before the current
    /// phase is closed.
    pub tolerance_ms: u64,
    /// Closed phases kept in memory.
    pub history_limit: usize,
    /// Where the phase history is persisted, if anywhere.
    pub journal_path: Option<PathBuf>,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 5_000,
            tolerance_ms: 15_000,
            history_limit: 1_024,
            journal_path: None,
        }
    }
}

impl ConnectivityConfig {
    /// Probe interval as a `Duration`.
    #[must_use]
    pub const fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    /// Tolerance as a `Duration`.
    #[must_use]
    pub const fn tolerance(&self) -> Duration {
        Duration::from_millis(self.tolerance_ms)
    }
}

/// Change detector settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// First wait after a failed baseline fetch.
    pub baseline_retry_initial_ms: u64,
    /// Cap of the baseline retry backoff.
    pub baseline_retry_max_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            baseline_retry_initial_ms: 250,
            baseline_retry_max_ms: 5_000,
        }
    }
}

impl DetectorConfig {
    /// Backoff between failed baseline fetches.
    #[must_use]
    pub const fn baseline_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.baseline_retry_initial_ms),
            Duration::from_millis(self.baseline_retry_max_ms),
        )
    }
}

/// Trigger engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Max queued registration/deregistration requests.
    pub control_queue_capacity: usize,
    /// Evaluate a trigger right away when it is registered while connected.
    pub evaluate_on_register: bool,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            control_queue_capacity: 1024,
            evaluate_on_register: true,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Remote store endpoints.
    pub store: StoreConfig,
    /// Delivery buffer.
    pub buffer: BufferConfig,
    /// Connectivity tracker.
    pub connectivity: ConnectivityConfig,
    /// Change detector.
    pub detector: DetectorConfig,
    /// Trigger engine.
    pub triggers: TriggerConfig,
}

impl SyncConfig {
    /// Loads and validates a JSON configuration file.
    ///
    /// # Errors
    /// Fails if the file cannot be read, is not valid JSON, or does not
    /// validate.
    pub fn from_json_file(path: &Path) -> SyncResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::from_json_str(&raw)
    }

    /// Parses and validates a JSON configuration document.
    ///
    /// # Errors
    /// Fails on malformed JSON or invalid values.
    pub fn from_json_str(raw: &str) -> SyncResult<Self> {
        let config: Self = serde_json::from_str(raw).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("malformed config: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    /// Returns `InvalidConfig` describing the first violated constraint.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |reason: &str| -> Result<(), ValidationError> {
            Err(ValidationError::InvalidConfig {
                reason: reason.to_string(),
            })
        };

        if self.store.query_endpoint.trim().is_empty()
            || self.store.update_endpoint.trim().is_empty()
        {
            return invalid("store endpoints must be set");
        }
        if self.store.request_timeout_ms == 0 {
            return invalid("store.request_timeout_ms must be positive");
        }
        if self.store.probe_query.trim().is_empty() {
            return invalid("store.probe_query must be set");
        }
        if self.buffer.tick_ms == 0 {
            return invalid("buffer.tick_ms must be positive");
        }
        if self.buffer.max_pending == 0 {
            return invalid("buffer.max_pending must be positive");
        }
        if self.buffer.retry_base_ms == 0 || self.buffer.retry_max_ms < self.buffer.retry_base_ms {
            return invalid("buffer retry delays must satisfy 0 < retry_base_ms <= retry_max_ms");
        }
        if self.connectivity.probe_interval_ms == 0 {
            return invalid("connectivity.probe_interval_ms must be positive");
        }
        if self.connectivity.tolerance_ms < self.connectivity.probe_interval_ms {
            return invalid("connectivity.tolerance_ms must be at least one probe interval");
        }
        if self.detector.baseline_retry_initial_ms == 0
            || self.detector.baseline_retry_max_ms < self.detector.baseline_retry_initial_ms
        {
            return invalid("detector baseline retry delays are inconsistent");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        SyncConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_json_overrides_defaults() {
        let config = SyncConfig::from_json_str(
            r#"{"store": {"query_endpoint": "http://store/q", "update_endpoint": "http://store/u"},
                "connectivity": {"probe_interval_ms": 1000, "tolerance_ms": 3000}}"#,
        )
        .unwrap();
        assert_eq!(config.store.query_endpoint, "http://store/q");
        assert_eq!(config.store.request_timeout_ms, 5_000);
        assert_eq!(config.connectivity.tolerance(), Duration::from_secs(3));
        assert_eq!(config.buffer, BufferConfig::default());
    }

    #[test]
    fn tolerance_shorter_than_interval_is_rejected() {
        let err = SyncConfig::from_json_str(
            r#"{"connectivity": {"probe_interval_ms": 5000, "tolerance_ms": 1000}}"#,
        )
        .unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("tolerance_ms"));
    }

    #[test]
    fn malformed_json_is_a_validation_error() {
        assert!(SyncConfig::from_json_str("{").unwrap_err().is_validation());
    }
}
