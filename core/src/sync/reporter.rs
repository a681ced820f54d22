//! Time-throttled progress reporting

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::sync::events::{progress_event, EventSink};

struct ReporterState {
    count: usize,
    last_report: Instant,
}

/// Emits progress events at most once per interval
pub struct Reporter {
    events: Arc<dyn EventSink>,
    user_id: String,
    total: usize,
    interval: Duration,
    started: Instant,
    state: Mutex<ReporterState>,
}

impl Reporter {
    /// Create a reporter for `total` items
    pub fn new(events: Arc<dyn EventSink>, user_id: impl Into<String>, total: usize, interval: Duration) -> Self {
        let now = Instant::now();

        Self {
            events,
            user_id: user_id.into(),
            total,
            interval,
            started: now,
            state: Mutex::new(ReporterState {
                count: 0,
                last_report: now,
            }),
        }
    }

    /// Count `delta` more items as done
    pub fn add(&self, delta: usize) {
        let mut state = self.state.lock();
        state.count += delta;

        if state.last_report.elapsed() > self.interval {
            state.last_report = Instant::now();
            self.events.publish(progress_event(
                &self.user_id,
                state.count,
                self.total,
                self.started.elapsed(),
            ));
        }
    }

    /// Items counted so far
    pub fn count(&self) -> usize {
        self.state.lock().count
    }

    /// Report completion
    pub fn done(&self) {
        let mut state = self.state.lock();
        state.last_report = Instant::now();
        self.events
            .publish(progress_event(&self.user_id, self.total, self.total, self.started.elapsed()));
    }
}
