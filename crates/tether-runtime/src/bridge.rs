//! Outbound bridge: orchestrator events to transport messages, plus the
//! keep-alive pulse.

use std::sync::Arc;
use std::time::Duration;

use tether_core::CanonicalEvent;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::emitter::OrchestratorEvent;
use crate::orchestrator::OrchestratorHandle;
use crate::transport::{OutboundMessage, Transport};

/// Forwards orchestrator events to a [`Transport`].
///
/// Reads the orchestrator's outbound channel, so every event is delivered in
/// order; a slow transport applies backpressure rather than losing events.
pub struct OutboundBridge {
    rx: mpsc::Receiver<OrchestratorEvent>,
    transport: Arc<dyn Transport>,
}

impl OutboundBridge {
    /// Bridge reading from `rx`, usually [`Orchestrator::outbound`].
    ///
    /// [`Orchestrator::outbound`]: crate::Orchestrator::outbound
    pub fn new(rx: mpsc::Receiver<OrchestratorEvent>, transport: Arc<dyn Transport>) -> Self {
        Self { rx, transport }
    }

    /// Run until `shutdown` fires or the orchestrator's sender is gone.
    ///
    /// A failed send is logged and delivery continues with the next event.
    /// Events already buffered when shutdown fires are still delivered.
    #[tracing::instrument(skip_all, name = "outbound_bridge")]
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let received = tokio::select! {
                () = shutdown.cancelled() => break,
                received = self.rx.recv() => received,
            };
            let Some(event) = received else {
                info!("orchestrator events closed, bridge exiting");
                return;
            };
            self.deliver(&event).await;
        }

        while let Ok(event) = self.rx.try_recv() {
            self.deliver(&event).await;
        }
        debug!("bridge drained after shutdown");
    }

    async fn deliver(&self, event: &OrchestratorEvent) {
        let Some(message) = to_outbound(event) else {
            trace!(event = event.kind(), "nothing to forward");
            return;
        };
        let kind = message.kind();
        if let Err(error) = self.transport.send(message).await {
            warn!(outbound = kind, error = %error, category = error.category(), "transport send failed");
        }
    }
}

/// Express an orchestrator event in the transport vocabulary.
///
/// Complete-text `ModelOutput` is not forwarded on its own: the finished
/// response travels as `AssistantMessage` when the turn completes.
pub fn to_outbound(event: &OrchestratorEvent) -> Option<OutboundMessage> {
    match event {
        OrchestratorEvent::Canonical { event } => canonical_to_outbound(event),
        OrchestratorEvent::TurnCompleted { text } if text.is_empty() => None,
        OrchestratorEvent::TurnCompleted { text } => {
            Some(OutboundMessage::AssistantMessage { text: text.clone() })
        }
        OrchestratorEvent::TurnFailed { message } => Some(OutboundMessage::Error {
            message: message.clone(),
        }),
        OrchestratorEvent::TurnAborted => Some(OutboundMessage::TurnAborted),
        OrchestratorEvent::Ready => Some(OutboundMessage::Ready),
    }
}

fn canonical_to_outbound(event: &CanonicalEvent) -> Option<OutboundMessage> {
    let message = match event {
        CanonicalEvent::ModelOutput { text_delta, .. } => OutboundMessage::TextDelta {
            text: text_delta.clone()?,
        },
        CanonicalEvent::Status { phase, detail } => OutboundMessage::Status {
            phase: *phase,
            detail: detail.clone(),
        },
        CanonicalEvent::ToolCall {
            name,
            args,
            call_id,
        } => OutboundMessage::ToolCall {
            name: name.clone(),
            args: args.clone(),
            call_id: call_id.clone(),
        },
        CanonicalEvent::ToolResult {
            name,
            result,
            call_id,
        } => OutboundMessage::ToolResult {
            name: name.clone(),
            result: result.clone(),
            call_id: call_id.clone(),
        },
        CanonicalEvent::FileEdit { description, diff } => OutboundMessage::FileEdit {
            description: description.clone(),
            diff: diff.clone(),
        },
        CanonicalEvent::TerminalOutput { data } => OutboundMessage::Terminal { data: data.clone() },
        CanonicalEvent::PermissionRequest {
            id,
            reason,
            payload,
        } => OutboundMessage::Permission {
            id: id.clone(),
            reason: reason.clone(),
            payload: payload.clone(),
        },
        CanonicalEvent::TokenUsage { turns, duration_ms } => OutboundMessage::Usage {
            turns: *turns,
            duration_ms: *duration_ms,
        },
    };
    Some(message)
}

/// Pulse `keep_alive(thinking)` every `interval` until `shutdown` fires.
pub async fn run_keep_alive(
    transport: Arc<dyn Transport>,
    handle: OrchestratorHandle,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let thinking = handle.is_thinking();
        if let Err(error) = transport.send(OutboundMessage::KeepAlive { thinking }).await {
            warn!(error = %error, "keep-alive send failed");
        }
    }
    debug!("keep-alive stopped");
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
