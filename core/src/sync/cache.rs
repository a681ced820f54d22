//! Download cache for the sync pipeline

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::message::Message;

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Number of cached messages
    pub messages: usize,
    /// Number of cached attachments
    pub attachments: usize,
    /// Total attachment bytes held
    pub attachment_bytes: usize,
    /// Number of hits
    pub hits: usize,
    /// Number of misses
    pub misses: usize,
}

impl CacheStats {
    /// Cache hit ratio
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Default)]
struct CacheInner {
    messages: HashMap<String, Message>,
    attachments: HashMap<String, Bytes>,
    stats: CacheStats,
}

/// Process-local cache of already fetched messages and attachments.
///
/// Entries live until [`DownloadCache::clear`]; the cache only exists so that
/// retry rounds never fetch the same payload twice.
#[derive(Default)]
pub struct DownloadCache {
    inner: Mutex<CacheInner>,
}

impl DownloadCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Retrieve a message
    pub fn get_message(&self, message_id: &str) -> Option<Message> {
        let mut inner = self.inner.lock();
        let message = inner.messages.get(message_id).cloned();
        inner.record_lookup(message.is_some());
        message
    }

    /// Store a message under its own ID
    pub fn store_message(&self, message: Message) {
        let mut inner = self.inner.lock();
        if inner.messages.insert(message.id.clone(), message).is_none() {
            inner.stats.messages += 1;
        }
    }

    /// Retrieve attachment data
    pub fn get_attachment(&self, attachment_id: &str) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        let data = inner.attachments.get(attachment_id).cloned();
        inner.record_lookup(data.is_some());
        data
    }

    /// Store attachment data
    pub fn store_attachment(&self, attachment_id: &str, data: Bytes) {
        let mut inner = self.inner.lock();
        let len = data.len();
        let previous = inner.attachments.insert(attachment_id.to_string(), data);
        match previous {
            Some(previous) => {
                inner.stats.attachment_bytes -= previous.len();
            }
            None => {
                inner.stats.attachments += 1;
            }
        }
        inner.stats.attachment_bytes += len;
    }

    /// Check if a message is cached
    pub fn contains_message(&self, message_id: &str) -> bool {
        self.inner.lock().messages.contains_key(message_id)
    }

    /// Check if an attachment is cached
    pub fn contains_attachment(&self, attachment_id: &str) -> bool {
        self.inner.lock().attachments.contains_key(attachment_id)
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats.clone()
    }

    /// Drop every entry
    pub fn clear(&self) {
        *self.inner.lock() = CacheInner::default();
    }
}

impl CacheInner {
    fn record_lookup(&mut self, hit: bool) {
        if hit {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
        }
    }
}
