//! Wire types for the agent server's HTTP API and event feed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_core::{Mode, PermissionMode};

use crate::permissions::PermissionDecision;

/// Agent used for read-only turns; it plans without touching files.
pub const READ_ONLY_AGENT: &str = "plan";

/// Session record as returned by `/session` endpoints.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    /// Server-side session id.
    pub id: String,
    /// Human-readable title, when the server has generated one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Creation/update timestamps, passed through as-is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<Value>,
}

#[derive(Debug, Default, Serialize)]
pub(crate) struct CreateSessionBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Provider/model pair the server expects.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelSpec {
    /// Provider id, e.g. `anthropic`.
    #[serde(rename = "providerID")]
    pub provider_id: String,
    /// Model id within the provider.
    #[serde(rename = "modelID")]
    pub model_id: String,
}

impl ModelSpec {
    /// Split `provider/model` at the first `/`; a bare model name gets
    /// `default_provider`. Empty input yields `None`.
    pub fn parse(model: &str, default_provider: &str) -> Option<Self> {
        let model = model.trim();
        if model.is_empty() {
            return None;
        }
        match model.split_once('/') {
            Some((provider, id)) if !provider.is_empty() && !id.is_empty() => Some(Self {
                provider_id: provider.to_string(),
                model_id: id.to_string(),
            }),
            _ => Some(Self {
                provider_id: default_provider.to_string(),
                model_id: model.trim_matches('/').to_string(),
            }),
        }
    }
}

/// Input part of a prompt.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PromptPart {
    /// Plain text.
    Text {
        /// The prompt text.
        text: String,
    },
}

/// Body for `/session/{id}/message` and `/session/{id}/prompt_async`.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct PromptBody {
    /// Input parts.
    pub parts: Vec<PromptPart>,
    /// Model override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelSpec>,
    /// Agent override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

impl PromptBody {
    /// Prompt for `text` under `mode`.
    pub fn new(text: &str, mode: &Mode, default_provider: &str) -> Self {
        Self {
            parts: vec![PromptPart::Text {
                text: text.to_string(),
            }],
            model: mode
                .model
                .as_deref()
                .and_then(|m| ModelSpec::parse(m, default_provider)),
            agent: (mode.permission_mode == PermissionMode::ReadOnly)
                .then(|| READ_ONLY_AGENT.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct PermissionReply {
    pub response: PermissionDecision,
}

/// Timing of a message.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct MessageTime {
    /// Epoch milliseconds at creation.
    #[serde(default)]
    pub created: Option<u64>,
    /// Epoch milliseconds at completion.
    #[serde(default)]
    pub completed: Option<u64>,
}

/// Message metadata.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct MessageInfo {
    /// Message id.
    #[serde(default)]
    pub id: String,
    /// `user` or `assistant`.
    #[serde(default)]
    pub role: Option<String>,
    /// Owning session.
    #[serde(default, rename = "sessionID")]
    pub session_id: Option<String>,
    /// Timing.
    #[serde(default)]
    pub time: Option<MessageTime>,
    /// Error the message ended with.
    #[serde(default)]
    pub error: Option<Value>,
}

/// State of a tool part.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ToolState {
    /// `pending`, `running`, `completed` or `error`.
    #[serde(default)]
    pub status: String,
    /// Tool arguments.
    #[serde(default)]
    pub input: Value,
    /// Tool output once completed.
    #[serde(default)]
    pub output: Option<Value>,
    /// Failure message once errored.
    #[serde(default)]
    pub error: Option<String>,
    /// Extra tool metadata such as a diff.
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// One part of a message: text, tool activity, or something we ignore.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Part {
    /// Part id.
    #[serde(default)]
    pub id: String,
    /// Owning session.
    #[serde(default, rename = "sessionID")]
    pub session_id: Option<String>,
    /// Owning message.
    #[serde(default, rename = "messageID")]
    pub message_id: Option<String>,
    /// Part kind: `text`, `tool`, `reasoning`, `step-start`, ...
    #[serde(default, rename = "type")]
    pub kind: String,
    /// Text content for text parts.
    #[serde(default)]
    pub text: Option<String>,
    /// Tool name for tool parts.
    #[serde(default)]
    pub tool: Option<String>,
    /// Tool call id.
    #[serde(default, rename = "callID")]
    pub call_id: Option<String>,
    /// Tool state.
    #[serde(default)]
    pub state: Option<ToolState>,
    /// Parts the server adds on its own, never shown as model output.
    #[serde(default)]
    pub synthetic: bool,
}

/// Response of a synchronous prompt.
#[derive(Clone, Debug, Deserialize)]
pub struct MessageResponse {
    /// Assistant message metadata.
    pub info: MessageInfo,
    /// Every part of the assistant message.
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// One frame of the `/event` feed.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ServerEvent {
    /// Event type, e.g. `message.part.updated`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Event payload.
    #[serde(default)]
    pub properties: Value,
}

impl ServerEvent {
    /// Session the event belongs to, wherever the payload keeps it.
    pub fn session_id(&self) -> Option<&str> {
        let props = &self.properties;
        props
            .get("sessionID")
            .or_else(|| props.get("part").and_then(|p| p.get("sessionID")))
            .or_else(|| props.get("info").and_then(|i| i.get("sessionID")))
            .and_then(Value::as_str)
    }
}
