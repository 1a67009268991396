//! Permission request brokering.
//!
//! When the active mode requires confirmation, a backend forwards the
//! request upstream as a `PermissionRequest` event and parks a waiter here.
//! The operator's answer arrives through [`PermissionBroker::resolve`]. A
//! waiter that hears nothing within its deadline resolves to
//! [`PermissionDecision::Reject`].

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tether_core::PermissionMode;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Answer to a permission request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionDecision {
    /// Allow this one request.
    Once,
    /// Allow this and matching future requests.
    Always,
    /// Deny.
    Reject,
}

impl PermissionDecision {
    /// Wire name of the decision.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Always => "always",
            Self::Reject => "reject",
        }
    }

    /// Decision applied without asking, or `None` if the mode requires the
    /// operator to confirm.
    pub fn automatic_for(mode: PermissionMode) -> Option<Self> {
        match mode {
            PermissionMode::Yolo => Some(Self::Always),
            PermissionMode::SafeYolo => Some(Self::Once),
            PermissionMode::Default | PermissionMode::ReadOnly => None,
        }
    }
}

/// Pending permission requests keyed by backend permission id.
#[derive(Debug, Default)]
pub struct PermissionBroker {
    pending: Mutex<HashMap<String, oneshot::Sender<PermissionDecision>>>,
}

impl PermissionBroker {
    /// Empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a waiter for `id`. A second registration replaces the first.
    pub fn register(&self, id: &str) -> oneshot::Receiver<PermissionDecision> {
        let (tx, rx) = oneshot::channel();
        if self.pending.lock().insert(id.to_string(), tx).is_some() {
            debug!(permission_id = id, "replaced pending permission waiter");
        }
        rx
    }

    /// Deliver the operator's decision. Returns `false` for unknown ids.
    pub fn resolve(&self, id: &str, decision: PermissionDecision) -> bool {
        let Some(tx) = self.pending.lock().remove(id) else {
            warn!(permission_id = id, "no pending permission request with this id");
            return false;
        };
        tx.send(decision).is_ok()
    }

    /// Wait for the decision on `id`, denying when `timeout` elapses or the
    /// waiter is dropped.
    pub async fn wait(
        &self,
        id: &str,
        rx: oneshot::Receiver<PermissionDecision>,
        timeout: Duration,
    ) -> PermissionDecision {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) => {
                debug!(permission_id = id, "permission waiter dropped, denying");
                PermissionDecision::Reject
            }
            Err(_) => {
                let _ = self.pending.lock().remove(id);
                warn!(
                    permission_id = id,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "permission request timed out, denying"
                );
                PermissionDecision::Reject
            }
        }
    }

    /// Drop every pending waiter, which denies them.
    pub fn clear(&self) {
        let drained = std::mem::take(&mut *self.pending.lock());
        if !drained.is_empty() {
            debug!(count = drained.len(), "cleared pending permission requests");
        }
    }

    /// Number of requests awaiting a decision.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
