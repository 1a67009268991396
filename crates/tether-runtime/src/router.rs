//! Inbound message routing.
//!
//! Turns transport messages into orchestrator calls. The router tracks the
//! operator's current [`Mode`] privately and stamps a copy onto every prompt
//! it queues; metadata that arrives without text only updates that copy.

use parking_lot::Mutex;
use serde::{Deserialize, Deserializer};
use tether_backend::PermissionDecision;
use tether_core::{Mode, PermissionMode};
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::RuntimeError;
use crate::orchestrator::OrchestratorHandle;

/// A message from the remote operator.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// A prompt, a mode change, or both.
    User {
        /// Prompt text; empty for metadata-only messages.
        #[serde(default)]
        text: String,
        /// Optional overrides.
        #[serde(default)]
        meta: MessageMeta,
    },
    /// Stop the current turn and drop everything queued.
    Abort,
    /// Answer to a forwarded permission request.
    Permission {
        /// Permission id from the request.
        id: String,
        /// The operator's answer.
        decision: PermissionDecision,
    },
}

/// Mode overrides attached to a user message.
///
/// Each field distinguishes "absent" (outer `None`, keep the current value)
/// from an explicit `null` (inner `None`, go back to the configured default).
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMeta {
    /// Permission mode override.
    #[serde(default, deserialize_with = "double_option")]
    pub permission_mode: Option<Option<PermissionMode>>,
    /// Model override.
    #[serde(default, deserialize_with = "double_option")]
    pub model: Option<Option<String>>,
}

impl MessageMeta {
    /// Whether any override is present.
    pub fn is_empty(&self) -> bool {
        self.permission_mode.is_none() && self.model.is_none()
    }
}

fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// What routing a message did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// A prompt was queued.
    Queued(Uuid),
    /// Only the current mode changed.
    ModeUpdated(Mode),
    /// An abort completed; `true` when something was cancelled.
    Aborted(bool),
    /// A permission answer was delivered (`false`: nobody was waiting).
    PermissionResolved(bool),
    /// Nothing to do.
    Ignored,
}

/// Routes [`InboundMessage`]s into an orchestrator.
pub struct InboundRouter {
    handle: OrchestratorHandle,
    defaults: Mode,
    current: Mutex<Mode>,
}

impl InboundRouter {
    /// Router starting from the configured default mode.
    pub fn new(handle: OrchestratorHandle, defaults: Mode) -> Self {
        Self {
            handle,
            current: Mutex::new(defaults.clone()),
            defaults,
        }
    }

    /// The mode the next prompt will carry.
    pub fn current_mode(&self) -> Mode {
        self.current.lock().clone()
    }

    /// Route one message.
    pub async fn route(&self, message: InboundMessage) -> Result<RouteOutcome, RuntimeError> {
        match message {
            InboundMessage::User { text, meta } => self.route_user(text, &meta),
            InboundMessage::Abort => self.handle.abort().await.map(RouteOutcome::Aborted),
            InboundMessage::Permission { id, decision } => {
                let delivered = self.handle.resolve_permission(&id, decision);
                debug!(permission_id = %id, decision = decision.as_str(), delivered, "permission answer");
                Ok(RouteOutcome::PermissionResolved(delivered))
            }
        }
    }

    fn route_user(&self, text: String, meta: &MessageMeta) -> Result<RouteOutcome, RuntimeError> {
        let mode = self.apply_meta(meta);
        if text.trim().is_empty() {
            if meta.is_empty() {
                debug!("ignoring empty user message");
                return Ok(RouteOutcome::Ignored);
            }
            info!(
                permission_mode = %mode.permission_mode,
                model = ?mode.model,
                "mode updated for the next prompt"
            );
            return Ok(RouteOutcome::ModeUpdated(mode));
        }
        self.handle.enqueue(text, mode).map(RouteOutcome::Queued)
    }

    /// Fold overrides into the current mode and return the result.
    fn apply_meta(&self, meta: &MessageMeta) -> Mode {
        let mut current = self.current.lock();
        let mut next = current.clone();
        if let Some(permission_mode) = meta.permission_mode {
            next = next.with_permission_mode(
                permission_mode.unwrap_or(self.defaults.permission_mode),
            );
        }
        if let Some(model) = &meta.model {
            next = next.with_model(model.clone().or_else(|| self.defaults.model.clone()));
        }
        *current = next.clone();
        next
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
