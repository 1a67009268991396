//! Cloneable front door to a running orchestrator.

use std::sync::Arc;

use tether_backend::{PermissionBroker, PermissionDecision};
use tether_core::{Mode, RunState};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::Control;
use crate::emitter::{EventEmitter, OrchestratorEvent};
use crate::errors::RuntimeError;
use crate::queue::MessageQueue;

/// Producer and observer access to the orchestrator.
///
/// Never writes the run state; only the dispatch loop does.
#[derive(Clone)]
pub struct OrchestratorHandle {
    queue: Arc<MessageQueue>,
    emitter: Arc<EventEmitter>,
    state: watch::Receiver<RunState>,
    control: mpsc::UnboundedSender<Control>,
    shutdown: CancellationToken,
    broker: Option<Arc<PermissionBroker>>,
}

impl OrchestratorHandle {
    pub(super) fn new(
        queue: Arc<MessageQueue>,
        emitter: Arc<EventEmitter>,
        state: watch::Receiver<RunState>,
        control: mpsc::UnboundedSender<Control>,
        shutdown: CancellationToken,
        broker: Option<Arc<PermissionBroker>>,
    ) -> Self {
        Self {
            queue,
            emitter,
            state,
            control,
            shutdown,
            broker,
        }
    }

    /// Queue a prompt to run under `mode`.
    pub fn enqueue(&self, prompt: impl Into<String>, mode: Mode) -> Result<Uuid, RuntimeError> {
        if self.shutdown.is_cancelled() {
            return Err(RuntimeError::ShuttingDown);
        }
        Ok(self.queue.push(prompt, mode))
    }

    /// Abort: drop everything queued, cancel the in-flight turn, and wait
    /// for the acknowledgement.
    ///
    /// Resolves to whether the backend reported something cancelled. One
    /// `TurnAborted` event is emitted per call either way.
    pub async fn abort(&self) -> Result<bool, RuntimeError> {
        let dropped = self.queue.reset();
        debug!(dropped, "abort requested");
        let (ack, rx) = oneshot::channel();
        self.control
            .send(Control::Abort { ack })
            .map_err(|_| RuntimeError::Stopped)?;
        rx.await.map_err(|_| RuntimeError::Stopped)
    }

    /// Receiver for orchestrator events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.emitter.subscribe()
    }

    /// Current run state.
    pub fn run_state(&self) -> RunState {
        self.state.borrow().clone()
    }

    /// Watch for run state changes.
    pub fn watch_state(&self) -> watch::Receiver<RunState> {
        self.state.clone()
    }

    /// Whether a backend invocation is in flight.
    pub fn is_thinking(&self) -> bool {
        self.state.borrow().is_active()
    }

    /// Number of prompts waiting.
    pub fn queue_len(&self) -> usize {
        self.queue.size()
    }

    /// Deliver the operator's answer to a forwarded permission request.
    ///
    /// Returns `false` when nothing was waiting on `id`.
    pub fn resolve_permission(&self, id: &str, decision: PermissionDecision) -> bool {
        match &self.broker {
            Some(broker) => broker.resolve(id, decision),
            None => {
                warn!(permission_id = id, "backend does not forward permission requests");
                false
            }
        }
    }

    /// Begin shutdown. The dispatch loop exits and disposes the backend.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
