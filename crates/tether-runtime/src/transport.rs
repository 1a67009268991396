//! Remote transport seam and its outbound vocabulary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_core::StatusPhase;

use crate::errors::TransportError;

/// A message for the remote operator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Lifecycle change of the current turn.
    Status {
        /// New phase.
        phase: StatusPhase,
        /// Diagnostic detail.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// Incremental assistant text.
    TextDelta {
        /// Text to append.
        text: String,
    },
    /// Complete assistant response for a finished turn.
    AssistantMessage {
        /// Response text.
        text: String,
    },
    /// The agent invoked a tool.
    ToolCall {
        /// Tool name.
        name: String,
        /// Tool arguments.
        args: Value,
        /// Correlation id.
        call_id: String,
    },
    /// A tool finished.
    ToolResult {
        /// Tool name.
        name: String,
        /// Tool output.
        result: Value,
        /// Correlation id.
        call_id: String,
    },
    /// A file changed.
    FileEdit {
        /// Summary.
        description: String,
        /// Unified diff, if known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diff: Option<String>,
    },
    /// Shell output.
    Terminal {
        /// Captured output.
        data: String,
    },
    /// The agent needs approval.
    Permission {
        /// Permission id to answer with.
        id: String,
        /// Why approval is needed.
        reason: String,
        /// Backend details.
        payload: Value,
    },
    /// Usage for the finished turn.
    Usage {
        /// Agent turns taken.
        turns: u32,
        /// Wall-clock duration.
        duration_ms: u64,
    },
    /// The turn failed.
    Error {
        /// Diagnostic.
        message: String,
    },
    /// Ready for the next prompt.
    Ready,
    /// An abort request was handled.
    TurnAborted,
    /// Liveness pulse.
    KeepAlive {
        /// Whether a turn is in flight.
        thinking: bool,
    },
}

impl OutboundMessage {
    /// Wire type name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::TextDelta { .. } => "text_delta",
            Self::AssistantMessage { .. } => "assistant_message",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::FileEdit { .. } => "file_edit",
            Self::Terminal { .. } => "terminal",
            Self::Permission { .. } => "permission",
            Self::Usage { .. } => "usage",
            Self::Error { .. } => "error",
            Self::Ready => "ready",
            Self::TurnAborted => "turn_aborted",
            Self::KeepAlive { .. } => "keep_alive",
        }
    }
}

/// Ordered, reliable channel to the remote operator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one message.
    async fn send(&self, message: OutboundMessage) -> Result<(), TransportError>;

    /// Flush and release the channel. Later sends fail with
    /// [`TransportError::Closed`].
    async fn close(&self) -> Result<(), TransportError>;
}
