//! Size-based batching of built messages

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::message::{MessageCreated, MessagesCreated};
use crate::sync::events::{progress_event, EventSink, UpdateSink};

/// Progress shared by every flusher of one sync
#[derive(Clone)]
pub struct FlushProgress {
    /// Where progress events go
    events: Arc<dyn EventSink>,
    /// User being synced
    user_id: String,
    /// Messages expected in this sync
    total: usize,
    /// Sync start
    started: Instant,
    /// Messages flushed so far, across all flushers
    flushed: Arc<AtomicUsize>,
}

impl FlushProgress {
    /// Start tracking progress for `total` messages
    pub fn new(events: Arc<dyn EventSink>, user_id: impl Into<String>, total: usize) -> Self {
        Self {
            events,
            user_id: user_id.into(),
            total,
            started: Instant::now(),
            flushed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Messages flushed so far
    pub fn flushed(&self) -> usize {
        self.flushed.load(Ordering::SeqCst)
    }

    /// Count messages that finished without being flushed, such as failed
    /// builds, so later progress events include them
    pub fn skip(&self, count: usize) {
        self.flushed.fetch_add(count, Ordering::SeqCst);
    }

    fn report(&self, count: usize) {
        let done = self.flushed.fetch_add(count, Ordering::SeqCst) + count;
        self.events
            .publish(progress_event(&self.user_id, done, self.total, self.started.elapsed()));
    }
}

#[derive(Default)]
struct FlushBatch {
    updates: Vec<MessageCreated>,
    size: usize,
}

/// Accumulates built messages and hands them downstream in batches
pub struct Flusher {
    updates: Arc<dyn UpdateSink>,
    chunk_size: usize,
    progress: Option<FlushProgress>,
    batch: Mutex<FlushBatch>,
}

impl Flusher {
    /// Create a flusher sending batches of about `chunk_size` bytes
    pub fn new(updates: Arc<dyn UpdateSink>, chunk_size: usize) -> Self {
        Self {
            updates,
            chunk_size: chunk_size.max(1),
            progress: None,
            batch: Mutex::new(FlushBatch::default()),
        }
    }

    /// Report progress on every flush
    pub fn with_progress(mut self, progress: FlushProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Add an update, flushing if the batch reached the chunk size
    pub fn push(&self, update: MessageCreated) {
        let mut batch = self.batch.lock();

        batch.size += update.size();
        batch.updates.push(update);

        if batch.size >= self.chunk_size {
            self.flush_locked(&mut batch);
        }
    }

    /// Send whatever is pending
    pub fn flush(&self) {
        let mut batch = self.batch.lock();
        self.flush_locked(&mut batch);
    }

    /// Bytes waiting to be flushed
    pub fn pending_size(&self) -> usize {
        self.batch.lock().size
    }

    // Sinks never block, so publishing under the lock keeps batches in push order.
    fn flush_locked(&self, batch: &mut FlushBatch) {
        if batch.updates.is_empty() {
            return;
        }

        let FlushBatch { updates, size } = std::mem::take(batch);
        let count = updates.len();

        debug!("Flushing {} messages ({} bytes)", count, size);
        self.updates.publish_update(MessagesCreated { messages: updates });

        if let Some(progress) = &self.progress {
            progress.report(count);
        }
    }
}
