//! The dispatch loop.
//!
//! Sole writer of the run state and sole caller of `invoke`/`cancel` on the
//! backend. Each invocation gets a fresh generation; its events reach the
//! loop through one long-lived channel, tagged, and anything tagged with an
//! older generation is dropped on arrival.
//!
//! Outbound delivery is lossless: when a transport channel is attached, the
//! loop waits for room in it before handling the next event, so a slow
//! transport slows the turn down instead of dropping messages. Broadcast
//! subscribers are best-effort.

use std::sync::Arc;

use chrono::Utc;
use tether_backend::{AgentBackend, BackendSession, InvokeRequest};
use tether_core::{CanonicalEvent, Mode, RunState, StatusPhase};
use tether_settings::OrchestratorSettings;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Control;
use super::turn::{self, ResponseBuffer, TaggedEvent};
use crate::emitter::{EventEmitter, OrchestratorEvent};
use crate::queue::{MessageQueue, QueueItem};

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnEnd {
    Completed,
    Failed,
    Aborted,
    Shutdown,
}

enum IdleStep {
    Shutdown,
    Control(Control),
    Item(QueueItem),
}

enum TurnStep {
    Shutdown,
    Control(Control),
    Event(TaggedEvent),
}

pub(super) struct DispatchLoop {
    backend: Arc<dyn AgentBackend>,
    settings: OrchestratorSettings,
    queue: Arc<MessageQueue>,
    emitter: Arc<EventEmitter>,
    outbound: Option<mpsc::Sender<OrchestratorEvent>>,
    state: watch::Sender<RunState>,
    control: mpsc::UnboundedReceiver<Control>,
    shutdown: CancellationToken,
    events_tx: mpsc::Sender<TaggedEvent>,
    events_rx: mpsc::Receiver<TaggedEvent>,
    generation: u64,
    session: Option<BackendSession>,
    applied_mode: Option<String>,
    buffer: ResponseBuffer,
}

impl DispatchLoop {
    pub(super) fn new(
        backend: Arc<dyn AgentBackend>,
        settings: OrchestratorSettings,
        queue: Arc<MessageQueue>,
        emitter: Arc<EventEmitter>,
        outbound: Option<mpsc::Sender<OrchestratorEvent>>,
        state: watch::Sender<RunState>,
        control: mpsc::UnboundedReceiver<Control>,
        shutdown: CancellationToken,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(settings.event_buffer.max(1));
        Self {
            backend,
            settings,
            queue,
            emitter,
            outbound,
            state,
            control,
            shutdown,
            events_tx,
            events_rx,
            generation: 0,
            session: None,
            applied_mode: None,
            buffer: ResponseBuffer::default(),
        }
    }

    pub(super) async fn run(mut self) {
        info!(backend = %self.backend.kind(), "dispatch loop started");
        self.announce_ready_if_idle().await;

        loop {
            let poll = self.settings.poll_interval();
            let step = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => IdleStep::Shutdown,
                Some(control) = self.control.recv() => IdleStep::Control(control),
                item = self.queue.wait_for_next(&self.shutdown, poll) => {
                    item.map_or(IdleStep::Shutdown, IdleStep::Item)
                }
            };

            match step {
                IdleStep::Shutdown => break,
                IdleStep::Control(Control::Abort { ack }) => self.abort_idle(ack).await,
                IdleStep::Item(item) => {
                    let end = self.run_turn(item).await;
                    debug!(generation = self.generation, outcome = ?end, "turn finished");
                    if end == TurnEnd::Shutdown {
                        break;
                    }
                    self.announce_ready_if_idle().await;
                }
            }
        }

        info!("dispatch loop stopping, disposing backend");
        self.backend.dispose().await;
        info!("dispatch loop stopped");
    }

    async fn run_turn(&mut self, item: QueueItem) -> TurnEnd {
        self.generation += 1;
        let generation = self.generation;
        self.apply_mode(&item.mode);
        self.set_state(RunState::Starting);

        let waited_ms = (Utc::now() - item.enqueued_at).num_milliseconds();
        info!(
            generation,
            item_id = %item.id,
            waited_ms,
            continues = self.session.is_some(),
            "starting turn"
        );

        let request = InvokeRequest::new(item.prompt).with_session(self.session.clone());
        let invocation = self.backend.invoke(request);
        let pump_cancel = self.shutdown.child_token();
        drop(tokio::spawn(turn::pump(
            generation,
            invocation.events,
            self.events_tx.clone(),
            pump_cancel.clone(),
        )));
        let mut session_rx = invocation.session;

        let end = loop {
            let step = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => TurnStep::Shutdown,
                Some(control) = self.control.recv() => TurnStep::Control(control),
                Some(tagged) = self.events_rx.recv() => TurnStep::Event(tagged),
            };

            match step {
                TurnStep::Shutdown => {
                    let _ = self.cancel_backend().await;
                    break TurnEnd::Shutdown;
                }
                TurnStep::Control(Control::Abort { ack }) => {
                    pump_cancel.cancel();
                    self.abort_turn(ack).await;
                    break TurnEnd::Aborted;
                }
                TurnStep::Event(tagged) if tagged.generation != generation => {
                    debug!(
                        generation,
                        stale = tagged.generation,
                        "discarding event from an earlier invocation"
                    );
                }
                TurnStep::Event(TaggedEvent {
                    event: Some(event), ..
                }) => {
                    if let Some(end) = self.on_event(event).await {
                        break end;
                    }
                }
                TurnStep::Event(TaggedEvent { event: None, .. }) => {
                    self.fail_turn("agent stream ended without a final status".to_string())
                        .await;
                    break TurnEnd::Failed;
                }
            }
        };

        pump_cancel.cancel();
        if let Ok(session) = session_rx.try_recv() {
            debug!(generation, session_id = %session, "continuation token stored");
            self.session = Some(session);
        }
        end
    }

    /// Handle one event of the current turn. Returns how the turn ended
    /// once a terminal status arrives.
    async fn on_event(&mut self, event: CanonicalEvent) -> Option<TurnEnd> {
        match event.phase() {
            Some(StatusPhase::Error) => {
                let detail = match &event {
                    CanonicalEvent::Status {
                        detail: Some(detail),
                        ..
                    } => detail.clone(),
                    _ => "agent reported an error".to_string(),
                };
                self.emit(event).await;
                self.fail_turn(detail).await;
                Some(TurnEnd::Failed)
            }
            Some(StatusPhase::Idle | StatusPhase::Stopped) => {
                self.emit(event).await;
                let text = self.buffer.take();
                self.set_state(RunState::Idle);
                info!(generation = self.generation, chars = text.len(), "turn completed");
                self.publish(OrchestratorEvent::TurnCompleted { text }).await;
                Some(TurnEnd::Completed)
            }
            Some(StatusPhase::Running) => {
                self.mark_running();
                self.emit(event).await;
                None
            }
            Some(StatusPhase::Starting) => {
                self.emit(event).await;
                None
            }
            None => {
                self.mark_running();
                self.buffer.apply(&event);
                self.emit(event).await;
                None
            }
        }
    }

    async fn fail_turn(&mut self, detail: String) {
        self.buffer.discard();
        warn!(generation = self.generation, error = %detail, "turn failed");
        self.set_state(RunState::Error(detail.clone()));
        self.publish(OrchestratorEvent::TurnFailed { message: detail })
            .await;
    }

    async fn abort_turn(&mut self, ack: oneshot::Sender<bool>) {
        self.set_state(RunState::Stopping);
        let cancelled = self.cancel_backend().await;
        self.buffer.discard();
        self.publish(OrchestratorEvent::TurnAborted).await;
        self.set_state(RunState::Idle);
        info!(generation = self.generation, cancelled, "turn aborted");
        let _ = ack.send(cancelled);
    }

    async fn abort_idle(&mut self, ack: oneshot::Sender<bool>) {
        let cancelled = self.cancel_backend().await;
        self.publish(OrchestratorEvent::TurnAborted).await;
        if !matches!(*self.state.borrow(), RunState::Idle) {
            self.set_state(RunState::Idle);
        }
        debug!(cancelled, "abort while idle acknowledged");
        let _ = ack.send(cancelled);
        self.announce_ready_if_idle().await;
    }

    /// Ask the backend to cancel, waiting at most the configured grace.
    async fn cancel_backend(&self) -> bool {
        let grace = self.settings.cancel_grace();
        if let Ok(cancelled) = tokio::time::timeout(grace, self.backend.cancel()).await {
            cancelled
        } else {
            warn!(
                grace_ms = self.settings.cancel_grace_ms,
                "backend cancel did not return in time"
            );
            false
        }
    }

    /// Push a mode to the backend if it differs from the last one applied.
    fn apply_mode(&mut self, mode: &Mode) {
        let fingerprint = mode.fingerprint();
        if self.applied_mode.as_deref() == Some(fingerprint.as_str()) {
            return;
        }
        debug!(
            permission_mode = %mode.permission_mode,
            model = ?mode.model,
            %fingerprint,
            "applying mode"
        );
        self.backend.set_permission_mode(mode.permission_mode);
        self.backend.set_model(mode.model.clone());
        self.applied_mode = Some(fingerprint);
    }

    fn mark_running(&self) {
        if matches!(*self.state.borrow(), RunState::Starting) {
            self.set_state(RunState::Running);
        }
    }

    fn set_state(&self, next: RunState) {
        let current = self.state.borrow().clone();
        if !current.can_transition_to(&next) {
            warn!(from = %current, to = %next, "unexpected run state transition");
        }
        debug!(from = %current, to = %next, "run state");
        let _ = self.state.send_replace(next);
    }

    async fn emit(&mut self, event: CanonicalEvent) {
        self.publish(OrchestratorEvent::Canonical { event }).await;
    }

    /// Deliver to the transport channel, waiting for room, then broadcast.
    ///
    /// Shutdown releases a blocked send; that event is then only broadcast.
    async fn publish(&mut self, event: OrchestratorEvent) {
        let receiver_gone = match &self.outbound {
            Some(outbound) => tokio::select! {
                biased;
                sent = outbound.send(event.clone()) => sent.is_err(),
                () = self.shutdown.cancelled() => {
                    debug!(event = event.kind(), "shutting down, outbound event not delivered");
                    false
                }
            },
            None => false,
        };
        if receiver_gone {
            warn!(event = event.kind(), "outbound receiver dropped, transport delivery stopped");
            self.outbound = None;
        }
        let _ = self.emitter.emit(event);
    }

    /// Announce readiness when nothing is running, streaming or queued.
    async fn announce_ready_if_idle(&mut self) {
        let ready = !self.shutdown.is_cancelled()
            && !self.state.borrow().is_active()
            && !self.buffer.in_progress()
            && self.queue.is_empty();
        if ready {
            debug!("ready for the next prompt");
            self.publish(OrchestratorEvent::Ready).await;
        }
    }
}
