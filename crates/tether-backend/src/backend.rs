//! # Agent Backend Trait
//!
//! Core abstraction over agent tools. Each backend accepts a prompt and
//! returns an [`Invocation`]: a stream of [`CanonicalEvent`]s plus a channel
//! that yields the continuation token once the backend learns it.
//!
//! Contract for every invocation stream:
//! - the first event is `Status{starting}`
//! - exactly one terminal `Status{idle|error|stopped}` is the last event
//! - failures never surface as `Err`; they become `Status{error}`

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tether_core::{CanonicalEvent, Mode, PermissionMode};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::errors::BackendResult;
use crate::permissions::PermissionBroker;

/// Boxed stream of canonical events for one invocation.
pub type CanonicalEventStream = Pin<Box<dyn Stream<Item = CanonicalEvent> + Send>>;

/// Which concrete backend is in use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Subprocess per invocation, NDJSON on stdout.
    ProcessExec,
    /// Local HTTP server with an event stream.
    ServerStream,
}

impl BackendKind {
    /// Name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProcessExec => "process-exec",
            Self::ServerStream => "server-stream",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque continuation token owned by a backend.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendSession(String);

impl BackendSession {
    /// Wrap a backend-issued identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of an availability probe.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BackendInfo {
    /// Backend variant.
    pub kind: BackendKind,
    /// Version string reported by the tool, when known.
    pub version: Option<String>,
}

/// A prompt to run.
#[derive(Clone, Debug)]
pub struct InvokeRequest {
    /// Prompt text, passed through verbatim.
    pub prompt: String,
    /// Continuation token from a previous invocation.
    pub session: Option<BackendSession>,
}

impl InvokeRequest {
    /// Request without a continuation token.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            session: None,
        }
    }

    /// Continue an earlier conversation.
    #[must_use]
    pub fn with_session(mut self, session: Option<BackendSession>) -> Self {
        self.session = session;
        self
    }
}

/// A running invocation.
pub struct Invocation {
    /// Canonical events in translator order.
    pub events: CanonicalEventStream,
    /// Resolves with the continuation token once known. Dropped unresolved
    /// when the backend never learned one.
    pub session: oneshot::Receiver<BackendSession>,
}

impl Invocation {
    /// Build an invocation around a stream and its session receiver.
    pub fn new(events: CanonicalEventStream, session: oneshot::Receiver<BackendSession>) -> Self {
        Self { events, session }
    }

    /// An invocation that fails immediately with `detail`.
    pub fn failed(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let (_tx, rx) = oneshot::channel();
        let events = futures::stream::iter(vec![
            CanonicalEvent::status(tether_core::StatusPhase::Starting),
            CanonicalEvent::error(detail),
        ]);
        Self {
            events: Box::pin(events),
            session: rx,
        }
    }
}

/// Mode applied to the next invocation.
///
/// Updates land here and are snapshotted when `invoke` is called, so an
/// in-flight invocation never observes a later change.
#[derive(Debug, Default)]
pub struct ModeCell {
    inner: RwLock<Mode>,
}

impl ModeCell {
    /// Cell seeded with `mode`.
    pub fn new(mode: Mode) -> Self {
        Self {
            inner: RwLock::new(mode),
        }
    }

    /// Replace the model override.
    pub fn set_model(&self, model: Option<String>) {
        self.inner.write().model = model;
    }

    /// Replace the permission mode.
    pub fn set_permission_mode(&self, mode: PermissionMode) {
        self.inner.write().permission_mode = mode;
    }

    /// Current value.
    pub fn snapshot(&self) -> Mode {
        self.inner.read().clone()
    }
}

/// The invocation a backend is currently running.
pub(crate) struct ActiveTurn {
    pub(crate) id: u64,
    pub(crate) cancel: CancellationToken,
    /// Remote conversation the turn runs in, once known.
    pub(crate) remote: Option<String>,
}

pub(crate) type ActiveSlot = Arc<Mutex<Option<ActiveTurn>>>;

/// Make invocation `id` the active one, cancelling whatever it replaces.
pub(crate) fn claim_active(slot: &ActiveSlot, id: u64, cancel: CancellationToken) -> ActiveGuard {
    let previous = slot.lock().replace(ActiveTurn {
        id,
        cancel,
        remote: None,
    });
    if let Some(previous) = previous {
        warn!(
            invocation = previous.id,
            "new invocation while another was active, cancelling the old one"
        );
        previous.cancel.cancel();
    }
    ActiveGuard {
        slot: Arc::clone(slot),
        id,
    }
}

/// Clears the active slot when its invocation stream finishes or is dropped.
pub(crate) struct ActiveGuard {
    slot: ActiveSlot,
    id: u64,
}

impl ActiveGuard {
    /// Record the remote conversation of this invocation.
    pub(crate) fn set_remote(&self, remote: &str) {
        if let Some(active) = self.slot.lock().as_mut().filter(|a| a.id == self.id) {
            active.remote = Some(remote.to_string());
        }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|active| active.id == self.id) {
            *slot = None;
        }
    }
}

/// Uniform capability set over agent tools.
///
/// Implementors must be `Send + Sync`. The orchestrator holds one as
/// `Arc<dyn AgentBackend>` and is its only caller of `invoke` and `cancel`.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Which variant this is.
    fn kind(&self) -> BackendKind;

    /// Check the tool is installed and reachable. Fails closed.
    async fn probe(&self) -> BackendResult<BackendInfo>;

    /// Start an invocation. Configuration is snapshotted at call time.
    fn invoke(&self, request: InvokeRequest) -> Invocation;

    /// Best-effort cancellation of the in-flight invocation.
    ///
    /// Returns `false` when nothing was running.
    async fn cancel(&self) -> bool;

    /// Model for the next invocation; `None` restores the backend default.
    fn set_model(&self, model: Option<String>);

    /// Permission mode for the next invocation.
    fn set_permission_mode(&self, mode: PermissionMode);

    /// Release all resources. Safe to call more than once.
    async fn dispose(&self);

    /// Broker for permission requests forwarded to the operator, if the
    /// backend supports interactive permissions.
    fn permission_broker(&self) -> Option<Arc<PermissionBroker>> {
        None
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
