//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so partial JSON
//! files are accepted: missing fields keep their compiled default.

mod backend;
mod runtime;

pub use backend::*;
pub use runtime::*;

use serde::{Deserialize, Serialize};
use tether_core::{Mode, PermissionMode};

use crate::errors::{Result, SettingsError};

/// Which agent backend drives the session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKindSetting {
    /// One subprocess per prompt, NDJSON on stdout.
    #[default]
    Exec,
    /// Long-lived local HTTP server with an event stream.
    Server,
}

/// Root settings type.
///
/// ```json
/// {
///   "backend": "server",
///   "defaults": { "permissionMode": "safe-yolo" },
///   "server": { "port": 5000 }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// Settings schema version.
    pub version: String,
    /// Selected backend.
    pub backend: BackendKindSetting,
    /// Mode applied when the operator has not overridden it.
    pub defaults: ModeDefaults,
    /// Process-exec backend settings.
    pub exec: ExecSettings,
    /// Server-stream backend settings.
    pub server: ServerSettings,
    /// Dispatch loop and keep-alive settings.
    pub orchestrator: OrchestratorSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl Default for TetherSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            backend: BackendKindSetting::default(),
            defaults: ModeDefaults::default(),
            exec: ExecSettings::default(),
            server: ServerSettings::default(),
            orchestrator: OrchestratorSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl TetherSettings {
    /// Reject values that would make the orchestrator unusable.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 && self.server.base_url.is_none() {
            return Err(SettingsError::InvalidValue(
                "server.port must be non-zero when no baseUrl is set".into(),
            ));
        }
        if self.orchestrator.poll_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "orchestrator.pollIntervalMs must be positive".into(),
            ));
        }
        if self.orchestrator.event_buffer == 0 {
            return Err(SettingsError::InvalidValue(
                "orchestrator.eventBuffer must be positive".into(),
            ));
        }
        if self.exec.binary.trim().is_empty() || self.server.binary.trim().is_empty() {
            return Err(SettingsError::InvalidValue("backend binary must not be empty".into()));
        }
        Ok(())
    }
}

/// Default mode for prompts without overrides.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModeDefaults {
    /// Default permission mode.
    pub permission_mode: PermissionMode,
    /// Default model; `None` lets the backend pick.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ModeDefaults {
    /// The configured defaults as a [`Mode`] value.
    pub fn to_mode(&self) -> Mode {
        Mode::new(self.permission_mode, self.model.clone())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let settings: TetherSettings =
            serde_json::from_str(r#"{"backend": "server", "server": {"port": 5000}}"#).unwrap();
        assert_eq!(settings.backend, BackendKindSetting::Server);
        assert_eq!(settings.server.port, 5000);
        assert_eq!(settings.server.binary, "opencode");
        assert_eq!(settings.exec.binary, "droid");
    }

    #[test]
    fn defaults_to_mode() {
        let defaults = ModeDefaults {
            permission_mode: PermissionMode::SafeYolo,
            model: Some("sonnet".into()),
        };
        let mode = defaults.to_mode();
        assert_eq!(mode.permission_mode, PermissionMode::SafeYolo);
        assert_eq!(mode.model.as_deref(), Some("sonnet"));
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(TetherSettings::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_poll_interval() {
        let mut settings = TetherSettings::default();
        settings.orchestrator.poll_interval_ms = 0;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn validate_allows_zero_port_with_external_server() {
        let mut settings = TetherSettings::default();
        settings.server.port = 0;
        assert!(settings.validate().is_err());
        settings.server.base_url = Some("http://127.0.0.1:9000".into());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn serialized_keys_are_camel_case() {
        let value = serde_json::to_value(TetherSettings::default()).unwrap();
        assert!(value["orchestrator"].get("pollIntervalMs").is_some());
        assert!(value["server"].get("startupTimeoutMs").is_some());
        assert!(value["defaults"].get("permissionMode").is_some());
    }
}
