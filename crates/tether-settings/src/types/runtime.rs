//! Orchestrator and logging settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Dispatch loop, keep-alive, and event fan-out settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorSettings {
    /// Coarse fallback poll for the shutdown flag while waiting.
    pub poll_interval_ms: u64,
    /// Interval between keep-alive pulses to the transport.
    pub keep_alive_interval_ms: u64,
    /// Capacity of the orchestrator event channel.
    pub event_buffer: usize,
    /// Longest the dispatch loop waits on a backend cancel request.
    pub cancel_grace_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            keep_alive_interval_ms: 2_000,
            event_buffer: 256,
            cancel_grace_ms: 2_000,
        }
    }
}

impl OrchestratorSettings {
    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Keep-alive interval as a [`Duration`].
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    /// Cancel grace as a [`Duration`].
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of the compact format.
    pub json: bool,
    /// Log every raw backend record at `trace`.
    pub raw_events: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            raw_events: false,
        }
    }
}
