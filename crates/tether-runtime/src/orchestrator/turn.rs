//! Per-turn plumbing: generation-tagged event pumping and the response
//! buffer.

use futures::StreamExt;
use tether_backend::CanonicalEventStream;
use tether_core::CanonicalEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// An event from the invocation started as `generation`.
///
/// `event: None` means the backend stream ended without a terminal status.
#[derive(Debug)]
pub(crate) struct TaggedEvent {
    pub(crate) generation: u64,
    pub(crate) event: Option<CanonicalEvent>,
}

/// Forward one invocation's events into the dispatch loop's channel.
///
/// Stops after the terminal event, at stream end, or when `cancel` fires.
/// The stream is dropped on exit, which releases the backend's hold on the
/// invocation.
pub(crate) async fn pump(
    generation: u64,
    mut events: CanonicalEventStream,
    tx: mpsc::Sender<TaggedEvent>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = events.next() => next,
        };
        let done = next.as_ref().is_none_or(CanonicalEvent::is_terminal);
        let tagged = TaggedEvent {
            generation,
            event: next,
        };
        let sent = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            sent = tx.send(tagged) => sent.is_ok(),
        };
        if !sent || done {
            break;
        }
    }
    trace!(generation, "event pump finished");
}

/// Assistant text accumulated over one turn.
///
/// Deltas append. A complete text replaces whatever was accumulated.
#[derive(Debug, Default)]
pub(crate) struct ResponseBuffer {
    text: String,
    touched: bool,
}

impl ResponseBuffer {
    /// Fold a `ModelOutput` into the buffer; other events are ignored.
    pub(crate) fn apply(&mut self, event: &CanonicalEvent) {
        if let CanonicalEvent::ModelOutput {
            text_delta,
            full_text,
        } = event
        {
            if let Some(full) = full_text {
                self.text.clone_from(full);
                self.touched = true;
            } else if let Some(delta) = text_delta {
                self.text.push_str(delta);
                self.touched = true;
            }
        }
    }

    /// Whether a response has started arriving.
    pub(crate) fn in_progress(&self) -> bool {
        self.touched
    }

    /// Hand out the accumulated text and reset.
    pub(crate) fn take(&mut self) -> String {
        self.touched = false;
        std::mem::take(&mut self.text)
    }

    /// Drop the accumulated text.
    pub(crate) fn discard(&mut self) {
        self.text.clear();
        self.touched = false;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use tether_core::StatusPhase;

    use super::*;

    // ── ResponseBuffer ──

    #[test]
    fn deltas_accumulate() {
        let mut buffer = ResponseBuffer::default();
        assert!(!buffer.in_progress());
        buffer.apply(&CanonicalEvent::text_delta("Hel"));
        buffer.apply(&CanonicalEvent::text_delta("lo"));
        assert!(buffer.in_progress());
        assert_eq!(buffer.take(), "Hello");
        assert!(!buffer.in_progress());
    }

    #[test]
    fn full_text_replaces_deltas() {
        let mut buffer = ResponseBuffer::default();
        buffer.apply(&CanonicalEvent::text_delta("draft"));
        buffer.apply(&CanonicalEvent::full_text("final"));
        assert_eq!(buffer.take(), "final");
    }

    #[test]
    fn non_output_events_are_ignored() {
        let mut buffer = ResponseBuffer::default();
        buffer.apply(&CanonicalEvent::status(StatusPhase::Running));
        assert!(!buffer.in_progress());
    }

    #[test]
    fn discard_clears() {
        let mut buffer = ResponseBuffer::default();
        buffer.apply(&CanonicalEvent::text_delta("partial"));
        buffer.discard();
        assert!(!buffer.in_progress());
        assert_eq!(buffer.take(), "");
    }

    // ── pump ──

    fn stream_of(events: Vec<CanonicalEvent>) -> CanonicalEventStream {
        Box::pin(futures::stream::iter(events))
    }

    #[tokio::test]
    async fn pump_stops_after_terminal() {
        let (tx, mut rx) = mpsc::channel(8);
        pump(
            3,
            stream_of(vec![
                CanonicalEvent::text_delta("a"),
                CanonicalEvent::status(StatusPhase::Idle),
                CanonicalEvent::text_delta("after"),
            ]),
            tx,
            CancellationToken::new(),
        )
        .await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.generation, 3);
        assert_eq!(first.event, Some(CanonicalEvent::text_delta("a")));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.event, Some(CanonicalEvent::status(StatusPhase::Idle)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn pump_reports_unterminated_stream() {
        let (tx, mut rx) = mpsc::channel(8);
        pump(1, stream_of(vec![CanonicalEvent::text_delta("a")]), tx, CancellationToken::new())
            .await;
        assert!(rx.recv().await.unwrap().event.is_some());
        assert!(rx.recv().await.unwrap().event.is_none());
    }

    #[tokio::test]
    async fn cancelled_pump_forwards_nothing() {
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();
        pump(1, Box::pin(futures::stream::pending()), tx, cancel).await;
        assert!(rx.recv().await.is_none());
    }
}
