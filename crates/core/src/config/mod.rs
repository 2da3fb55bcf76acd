use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::Result;

const DEFAULT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_PENDING: usize = 100;

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub worker: WorkerConfig,
    pub audio: AudioConfig,
}

impl AppConfig {
    /// Parses a JSON document; missing sections fall back to their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Loads a JSON configuration file from disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }
}

/// Settings of the worker dispatch service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Gate for worker availability.
    pub enabled: bool,
    /// Per-request deadline in milliseconds.
    #[serde(rename = "timeout")]
    pub timeout_ms: u64,
    /// Ceiling of in-flight requests before the oldest one is dropped.
    pub max_pending_requests: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_pending_requests: DEFAULT_MAX_PENDING,
        }
    }
}

impl WorkerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Effective queue ceiling. A ceiling of zero could never admit a request
    /// without exceeding it, so it is treated as one.
    pub fn queue_limit(&self) -> usize {
        self.max_pending_requests.max(1)
    }

    /// Merges the fields present in `update` into this config.
    pub fn apply(&mut self, update: &WorkerConfigUpdate) {
        if let Some(enabled) = update.enabled {
            self.enabled = enabled;
        }
        if let Some(timeout_ms) = update.timeout_ms {
            self.timeout_ms = timeout_ms;
        }
        if let Some(max_pending) = update.max_pending_requests {
            self.max_pending_requests = max_pending;
        }
    }
}

/// Partial update accepted by
/// [`AudioWorkerService::configure`](crate::AudioWorkerService::configure).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerConfigUpdate {
    pub enabled: Option<bool>,
    #[serde(rename = "timeout")]
    pub timeout_ms: Option<u64>,
    pub max_pending_requests: Option<usize>,
}

impl WorkerConfigUpdate {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn max_pending_requests(mut self, max_pending: usize) -> Self {
        self.max_pending_requests = Some(max_pending);
        self
    }
}

/// Parameters of the signals fed to the analysis operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub fft_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            fft_size: 2048,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let config = AppConfig::from_json_str(r#"{ "worker": { "timeout": 250 } }"#).unwrap();

        assert!(config.worker.enabled);
        assert_eq!(config.worker.timeout(), Duration::from_millis(250));
        assert_eq!(config.worker.max_pending_requests, 100);
        assert_eq!(config.audio.fft_size, 2048);
    }

    #[test]
    fn update_merges_only_present_fields() {
        let mut config = WorkerConfig::default();
        let update: WorkerConfigUpdate =
            serde_json::from_str(r#"{ "maxPendingRequests": 2 }"#).unwrap();
        config.apply(&update);

        assert_eq!(config.max_pending_requests, 2);
        assert_eq!(config.timeout_ms, 5_000);
        assert!(config.enabled);

        config.apply(&WorkerConfigUpdate::default().enabled(false));
        assert!(!config.enabled);
    }

    #[test]
    fn zero_ceiling_admits_one_request() {
        let config = WorkerConfig {
            max_pending_requests: 0,
            ..Default::default()
        };
        assert_eq!(config.queue_limit(), 1);
    }
}
