//! Permission modes and the per-prompt [`Mode`] value.
//!
//! A [`Mode`] is never mutated in place. Whenever the permission mode or the
//! model override changes, a new value is built and carried by the next queued
//! prompt. Two modes are "the same" for coalescing when their
//! [`Mode::fingerprint`] matches.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// How much autonomy the agent backend is granted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionMode {
    /// Ask before anything with side effects.
    #[default]
    Default,
    /// Never modify anything.
    ReadOnly,
    /// Auto-approve routine actions, keep confirmations for risky ones.
    SafeYolo,
    /// Auto-approve everything.
    Yolo,
}

impl PermissionMode {
    /// Wire name of the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::ReadOnly => "read-only",
            Self::SafeYolo => "safe-yolo",
            Self::Yolo => "yolo",
        }
    }

    /// Whether permission prompts must be confirmed by the remote operator.
    pub fn requires_confirmation(self) -> bool {
        matches!(self, Self::Default | Self::ReadOnly)
    }
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a permission mode string is not recognized.
#[derive(Debug, thiserror::Error)]
#[error("unknown permission mode: {0}")]
pub struct ModeParseError(pub String);

impl FromStr for PermissionMode {
    type Err = ModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "read-only" | "readonly" | "read_only" => Ok(Self::ReadOnly),
            "safe-yolo" | "safe_yolo" => Ok(Self::SafeYolo),
            "yolo" => Ok(Self::Yolo),
            other => Err(ModeParseError(other.to_string())),
        }
    }
}

/// Configuration applied to a single prompt.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mode {
    /// Autonomy granted to the backend.
    pub permission_mode: PermissionMode,
    /// Model override; `None` uses the backend's default model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Mode {
    /// Build a mode from its parts.
    pub fn new(permission_mode: PermissionMode, model: Option<String>) -> Self {
        Self {
            permission_mode,
            model,
        }
    }

    /// Copy of this mode with a different permission mode.
    #[must_use]
    pub fn with_permission_mode(&self, permission_mode: PermissionMode) -> Self {
        Self {
            permission_mode,
            model: self.model.clone(),
        }
    }

    /// Copy of this mode with a different model override.
    #[must_use]
    pub fn with_model(&self, model: Option<String>) -> Self {
        Self {
            permission_mode: self.permission_mode,
            model,
        }
    }

    /// Stable fingerprint over permission mode and model.
    ///
    /// Identical across processes and runs for equal modes.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.permission_mode.as_str().as_bytes());
        hasher.update([0u8]);
        if let Some(model) = &self.model {
            hasher.update(model.as_bytes());
        }
        let digest = hasher.finalize();
        digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
