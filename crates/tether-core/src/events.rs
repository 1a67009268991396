//! Canonical event model.
//!
//! Every backend translates its native stream into [`CanonicalEvent`]s.
//! Backend-specific shapes never travel past the translator that produced
//! them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle phase reported by a [`CanonicalEvent::Status`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusPhase {
    /// Invocation accepted, backend warming up.
    Starting,
    /// Backend is producing output.
    Running,
    /// Turn finished normally.
    Idle,
    /// Turn was cancelled.
    Stopped,
    /// Turn failed.
    Error,
}

impl StatusPhase {
    /// Whether this phase closes out an invocation.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Idle | Self::Stopped | Self::Error)
    }

    /// Wire name of the phase.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

/// Backend-neutral event emitted during an invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanonicalEvent {
    /// Assistant text, either incremental or complete.
    ModelOutput {
        /// Incremental text appended to the running response.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text_delta: Option<String>,
        /// Complete response text; supersedes accumulated deltas.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        full_text: Option<String>,
    },
    /// Lifecycle change.
    Status {
        /// New phase.
        phase: StatusPhase,
        /// Diagnostic detail, mainly for errors.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// The agent invoked a tool.
    ToolCall {
        /// Tool name as reported by the backend.
        name: String,
        /// Tool arguments.
        args: Value,
        /// Correlates the call with its result.
        call_id: String,
    },
    /// A tool finished.
    ToolResult {
        /// Tool name as reported by the backend.
        name: String,
        /// Tool output.
        result: Value,
        /// Correlates the result with its call.
        call_id: String,
    },
    /// A file was changed by the agent.
    FileEdit {
        /// Human-readable summary.
        description: String,
        /// Unified diff, when the backend reports one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diff: Option<String>,
    },
    /// Output of a shell command run by the agent.
    TerminalOutput {
        /// Captured output.
        data: String,
    },
    /// The agent needs the operator's approval.
    PermissionRequest {
        /// Backend permission identifier.
        id: String,
        /// Why approval is needed.
        reason: String,
        /// Backend-specific request details.
        payload: Value,
    },
    /// Usage summary for a completed turn.
    TokenUsage {
        /// Number of agent turns taken.
        turns: u32,
        /// Wall-clock duration reported by the backend.
        duration_ms: u64,
    },
}

impl CanonicalEvent {
    /// Status event without detail.
    pub fn status(phase: StatusPhase) -> Self {
        Self::Status {
            phase,
            detail: None,
        }
    }

    /// Terminal error status carrying a diagnostic.
    pub fn error(detail: impl Into<String>) -> Self {
        Self::Status {
            phase: StatusPhase::Error,
            detail: Some(detail.into()),
        }
    }

    /// Incremental assistant text.
    pub fn text_delta(text: impl Into<String>) -> Self {
        Self::ModelOutput {
            text_delta: Some(text.into()),
            full_text: None,
        }
    }

    /// Complete assistant text.
    pub fn full_text(text: impl Into<String>) -> Self {
        Self::ModelOutput {
            text_delta: None,
            full_text: Some(text.into()),
        }
    }

    /// The status phase, if this is a status event.
    pub fn phase(&self) -> Option<StatusPhase> {
        match self {
            Self::Status { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Incremental text carried by a `ModelOutput`, if any.
    pub fn delta(&self) -> Option<&str> {
        match self {
            Self::ModelOutput { text_delta, .. } => text_delta.as_deref(),
            _ => None,
        }
    }

    /// Whether this event closes out an invocation.
    pub fn is_terminal(&self) -> bool {
        self.phase().is_some_and(StatusPhase::is_terminal)
    }

    /// Whether this event carries content (anything other than a status).
    pub fn is_content(&self) -> bool {
        !matches!(self, Self::Status { .. })
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ModelOutput { .. } => "model_output",
            Self::Status { .. } => "status",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::FileEdit { .. } => "file_edit",
            Self::TerminalOutput { .. } => "terminal_output",
            Self::PermissionRequest { .. } => "permission_request",
            Self::TokenUsage { .. } => "token_usage",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
