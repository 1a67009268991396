//! Broadcast-based fan-out of orchestrator events.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tether_core::CanonicalEvent;
use tokio::sync::broadcast;

/// Default broadcast channel capacity.
const DEFAULT_CAPACITY: usize = 256;

/// What the orchestrator tells its observers.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// A backend event for the current turn, in translator order.
    Canonical {
        /// The event as the backend's translator produced it.
        event: CanonicalEvent,
    },
    /// The turn finished normally with this assistant response.
    TurnCompleted {
        /// Accumulated response text; may be empty for tool-only turns.
        text: String,
    },
    /// The turn failed; any partial response was discarded.
    TurnFailed {
        /// Diagnostic for the operator.
        message: String,
    },
    /// Acknowledges one abort request.
    TurnAborted,
    /// Nothing is running or queued; the operator may send the next prompt.
    Ready,
}

impl OrchestratorEvent {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Canonical { event } => event.kind(),
            Self::TurnCompleted { .. } => "turn_completed",
            Self::TurnFailed { .. } => "turn_failed",
            Self::TurnAborted => "turn_aborted",
            Self::Ready => "ready",
        }
    }
}

/// Broadcast-based event emitter for best-effort observers.
///
/// `emit` never awaits. Slow receivers lag rather than block the dispatch
/// loop; the transport reads the orchestrator's outbound channel instead.
#[derive(Debug)]
pub struct EventEmitter {
    tx: broadcast::Sender<OrchestratorEvent>,
    emit_count: AtomicU64,
}

impl EventEmitter {
    /// Emitter with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Emitter with a custom capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            emit_count: AtomicU64::new(0),
        }
    }

    /// Send to every subscriber. Returns how many received it.
    pub fn emit(&self, event: OrchestratorEvent) -> usize {
        let _ = self.emit_count.fetch_add(1, Ordering::Relaxed);
        self.tx.send(event).unwrap_or(0)
    }

    /// Receiver for events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Total events emitted.
    pub fn emit_count(&self) -> u64 {
        self.emit_count.load(Ordering::Relaxed)
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_with_no_subscribers() {
        let emitter = EventEmitter::new();
        assert_eq!(emitter.emit(OrchestratorEvent::Ready), 0);
        assert_eq!(emitter.emit_count(), 1);
    }

    #[tokio::test]
    async fn every_subscriber_receives() {
        let emitter = EventEmitter::new();
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();
        assert_eq!(emitter.subscriber_count(), 2);

        let event = OrchestratorEvent::TurnCompleted { text: "done".into() };
        assert_eq!(emitter.emit(event.clone()), 2);
        assert_eq!(rx1.recv().await.unwrap(), event);
        assert_eq!(rx2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn slow_receiver_lags() {
        let emitter = EventEmitter::with_capacity(2);
        let mut rx = emitter.subscribe();
        for _ in 0..3 {
            let _ = emitter.emit(OrchestratorEvent::Ready);
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(1))
        ));
    }

    #[test]
    fn kind_delegates_for_canonical() {
        let event = OrchestratorEvent::Canonical {
            event: CanonicalEvent::text_delta("x"),
        };
        assert_eq!(event.kind(), "model_output");
        assert_eq!(OrchestratorEvent::TurnAborted.kind(), "turn_aborted");
    }

    #[test]
    fn serializes_with_kind_tag() {
        let json = serde_json::to_value(OrchestratorEvent::TurnFailed {
            message: "boom".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "turn_failed");
        assert_eq!(json["message"], "boom");
    }
}
