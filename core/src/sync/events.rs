//! Downstream sinks for sync output

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::message::MessagesCreated;

/// Event published to listeners while a user is being synced
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// Sync started for a user
    Started {
        /// User being synced
        user_id: String,
    },
    /// Sync progress
    Progress {
        /// User being synced
        user_id: String,
        /// Fraction done, in `0.0..=1.0`
        progress: f64,
        /// Time since sync start
        elapsed: Duration,
        /// Estimated time left
        remaining: Duration,
    },
    /// Sync finished for a user
    Finished {
        /// User being synced
        user_id: String,
    },
}

/// Receives batches of created messages, in order
pub trait UpdateSink: Send + Sync {
    /// Queue a batch for the protocol layer. Must not block.
    fn publish_update(&self, update: MessagesCreated);
}

/// Receives sync events
pub trait EventSink: Send + Sync {
    /// Publish an event. Must not block.
    fn publish(&self, event: SyncEvent);
}

impl UpdateSink for mpsc::UnboundedSender<MessagesCreated> {
    fn publish_update(&self, update: MessagesCreated) {
        if self.send(update).is_err() {
            debug!("Update receiver dropped, discarding batch");
        }
    }
}

impl EventSink for mpsc::UnboundedSender<SyncEvent> {
    fn publish(&self, event: SyncEvent) {
        if self.send(event).is_err() {
            debug!("Event receiver dropped, discarding event");
        }
    }
}

/// Build a progress event for `done` out of `total` items.
///
/// The remaining time is extrapolated from the average time spent per item so
/// far.
pub(crate) fn progress_event(user_id: &str, done: usize, total: usize, elapsed: Duration) -> SyncEvent {
    let progress = if total == 0 {
        1.0
    } else {
        (done as f64 / total as f64).min(1.0)
    };

    let remaining = if done == 0 || done >= total {
        Duration::ZERO
    } else {
        elapsed.mul_f64((total - done) as f64 / done as f64)
    };

    SyncEvent::Progress {
        user_id: user_id.to_string(),
        progress,
        elapsed,
        remaining,
    }
}
