//! Pending-prompt queue.
//!
//! Every item carries the [`Mode`] it must run under. Items are never merged:
//! two prompts pushed under the same mode stay two items, in order. Mode-only
//! changes never become items of their own; the router folds them into the
//! mode of the next prompt it pushes.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tether_core::Mode;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// One pending prompt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueItem {
    /// Time-ordered identifier.
    pub id: Uuid,
    /// Prompt text, verbatim.
    pub prompt: String,
    /// Mode to apply before invoking the backend.
    pub mode: Mode,
    /// When the item was pushed.
    pub enqueued_at: DateTime<Utc>,
}

impl QueueItem {
    fn new(prompt: String, mode: Mode) -> Self {
        Self {
            id: Uuid::now_v7(),
            prompt,
            mode,
            enqueued_at: Utc::now(),
        }
    }
}

/// FIFO of [`QueueItem`]s shared by producers and the dispatch loop.
#[derive(Debug, Default)]
pub struct MessageQueue {
    items: Mutex<VecDeque<QueueItem>>,
    notify: Notify,
}

impl MessageQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a prompt and wake the waiter. Returns the new item's id.
    pub fn push(&self, prompt: impl Into<String>, mode: Mode) -> Uuid {
        let item = QueueItem::new(prompt.into(), mode);
        let id = item.id;
        let depth = {
            let mut items = self.items.lock();
            items.push_back(item);
            items.len()
        };
        debug!(%id, depth, "prompt queued");
        self.notify.notify_one();
        id
    }

    /// Pop the oldest item without waiting.
    pub fn try_next(&self) -> Option<QueueItem> {
        self.items.lock().pop_front()
    }

    /// Wait for the oldest item.
    ///
    /// Returns `None` once `cancel` fires. `poll` bounds how long a missed
    /// wake-up can go unnoticed. Dropping the future never loses an item.
    pub async fn wait_for_next(
        &self,
        cancel: &CancellationToken,
        poll: Duration,
    ) -> Option<QueueItem> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(item) = self.try_next() {
                return Some(item);
            }
            tokio::select! {
                () = self.notify.notified() => {}
                () = cancel.cancelled() => return None,
                () = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Discard every pending item. An item already handed out is unaffected.
    ///
    /// Returns how many items were dropped.
    pub fn reset(&self) -> usize {
        let dropped = {
            let mut items = self.items.lock();
            let dropped = items.len();
            items.clear();
            dropped
        };
        if dropped > 0 {
            debug!(dropped, "queue reset");
        }
        dropped
    }

    /// Number of pending items.
    pub fn size(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
