//! # Session Orchestrator
//!
//! One dispatch loop per orchestrator owns the backend, the [`RunState`] and
//! the generation counter. Everything else talks to it through an
//! [`OrchestratorHandle`]: prompts go through the shared [`MessageQueue`],
//! aborts through a control channel, and observers read the state watch or
//! subscribe to the [`EventEmitter`]. The transport reads a separate bounded
//! channel that the loop never overruns: see [`Orchestrator::outbound`].
//!
//! [`RunState`]: tether_core::RunState

mod dispatch;
mod handle;
mod turn;

use std::sync::Arc;

use tether_backend::AgentBackend;
use tether_core::RunState;
use tether_settings::OrchestratorSettings;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::emitter::{EventEmitter, OrchestratorEvent};
use crate::queue::MessageQueue;

pub use handle::OrchestratorHandle;

/// Requests the dispatch loop answers between events.
#[derive(Debug)]
pub(crate) enum Control {
    /// Cancel the in-flight turn, if any. The ack carries whether the
    /// backend reported something cancelled.
    Abort { ack: oneshot::Sender<bool> },
}

/// Builder for a running orchestrator.
pub struct Orchestrator {
    backend: Arc<dyn AgentBackend>,
    settings: OrchestratorSettings,
    shutdown: CancellationToken,
    queue: Arc<MessageQueue>,
    emitter: Arc<EventEmitter>,
    outbound: Option<mpsc::Sender<OrchestratorEvent>>,
}

impl Orchestrator {
    /// Orchestrator over `backend` with its own shutdown token.
    pub fn new(backend: Arc<dyn AgentBackend>, settings: OrchestratorSettings) -> Self {
        let emitter = Arc::new(EventEmitter::with_capacity(settings.event_buffer));
        Self {
            backend,
            settings,
            shutdown: CancellationToken::new(),
            queue: Arc::new(MessageQueue::new()),
            emitter,
            outbound: None,
        }
    }

    /// Subscribe before the loop starts, so the first readiness
    /// announcement is not missed.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.emitter.subscribe()
    }

    /// Lossless event channel for the transport bridge.
    ///
    /// Bounded by `eventBuffer`. When it is full the dispatch loop waits, which
    /// in turn stops reading the backend stream. Calling this again replaces
    /// the channel and closes the earlier receiver.
    pub fn outbound(&mut self) -> mpsc::Receiver<OrchestratorEvent> {
        let (tx, rx) = mpsc::channel(self.settings.event_buffer.max(1));
        self.outbound = Some(tx);
        rx
    }

    /// Stop when `token` is cancelled instead of on a private token.
    #[must_use]
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Start the dispatch loop on the current runtime.
    ///
    /// The returned task finishes after shutdown, once the backend has been
    /// disposed.
    pub fn spawn(self) -> (OrchestratorHandle, JoinHandle<()>) {
        let (state_tx, state_rx) = watch::channel(RunState::Idle);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let handle = OrchestratorHandle::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.emitter),
            state_rx,
            control_tx,
            self.shutdown.clone(),
            self.backend.permission_broker(),
        );
        let dispatch = dispatch::DispatchLoop::new(
            self.backend,
            self.settings,
            self.queue,
            self.emitter,
            self.outbound,
            state_tx,
            control_rx,
            self.shutdown,
        );
        let task = tokio::spawn(dispatch.run());
        (handle, task)
    }
}
