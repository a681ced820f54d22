//! Persistent sync markers

use std::collections::HashSet;

use parking_lot::Mutex;

use crate::error::BridgeResult;

/// Where a sync records how far it got
pub trait SyncStateStore: Send + Sync {
    /// ID of the last message handed downstream, if any
    fn last_message_id(&self) -> BridgeResult<Option<String>>;

    /// Record the last message handed downstream
    fn set_last_message_id(&self, message_id: &str) -> BridgeResult<()>;

    /// Remember a message that could not be built
    fn add_failed_message_id(&self, message_id: &str) -> BridgeResult<()>;

    /// Forget a message that was built after all
    fn remove_failed_message_id(&self, message_id: &str) -> BridgeResult<()>;
}

#[derive(Default)]
struct MemoryState {
    last_message_id: Option<String>,
    failed: HashSet<String>,
}

/// In-memory sync state
#[derive(Default)]
pub struct MemorySyncState {
    inner: Mutex<MemoryState>,
}

impl MemorySyncState {
    /// Create an empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a state that resumes after `message_id`
    pub fn resuming_after(message_id: impl Into<String>) -> Self {
        let state = Self::default();
        state.inner.lock().last_message_id = Some(message_id.into());
        state
    }

    /// Failed message IDs, sorted
    pub fn failed_message_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().failed.iter().cloned().collect();
        ids.sort();
        ids
    }
}

impl SyncStateStore for MemorySyncState {
    fn last_message_id(&self) -> BridgeResult<Option<String>> {
        Ok(self.inner.lock().last_message_id.clone())
    }

    fn set_last_message_id(&self, message_id: &str) -> BridgeResult<()> {
        self.inner.lock().last_message_id = Some(message_id.to_string());
        Ok(())
    }

    fn add_failed_message_id(&self, message_id: &str) -> BridgeResult<()> {
        self.inner.lock().failed.insert(message_id.to_string());
        Ok(())
    }

    fn remove_failed_message_id(&self, message_id: &str) -> BridgeResult<()> {
        self.inner.lock().failed.remove(message_id);
        Ok(())
    }
}
