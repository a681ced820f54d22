//! Send deduplication
//!
//! Several client connections may submit the same outgoing message at once.
//! The recorder keeps one record per message hash and recipient set, so the
//! first submission sends and the others wait for it and reuse its result.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SendConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::send::hash::message_hash;

/// How long a send record stays valid
pub const SEND_ENTRY_EXPIRY: Duration = Duration::from_secs(30 * 60);

/// How long a duplicate send waits for the first one
pub const SEND_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Identifies one send record
pub type SendId = u64;

/// Result of [`SendRecorder::send_once`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// This call sent the message; carries the remote message ID
    Sent(String),
    /// Another call already sent the same message; carries its message ID
    Duplicate(String),
}

struct SendEntry {
    id: SendId,
    recipients: Vec<String>,
    expires: Instant,
    message_id: Option<String>,
    done: watch::Sender<bool>,
}

impl SendEntry {
    fn close(&self) {
        self.done.send_replace(true);
    }
}

#[derive(Default)]
struct RecorderInner {
    entries: HashMap<String, Vec<SendEntry>>,
    next_id: SendId,
}

impl RecorderInner {
    fn remove_expired(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, entries| {
            entries.retain(|entry| entry.expires > now);
            !entries.is_empty()
        });
    }

    fn find(&self, hash: &str, recipients: &[String]) -> Option<&SendEntry> {
        self.entries
            .get(hash)?
            .iter()
            .find(|entry| same_recipients(&entry.recipients, recipients))
    }

    fn find_by_id(&self, hash: &str, id: SendId) -> Option<&SendEntry> {
        self.entries.get(hash)?.iter().find(|entry| entry.id == id)
    }
}

struct Waiter {
    id: SendId,
    done: watch::Receiver<bool>,
    expires: Instant,
}

impl Waiter {
    fn new(entry: &SendEntry) -> Self {
        Self {
            id: entry.id,
            done: entry.done.subscribe(),
            expires: entry.expires,
        }
    }
}

enum WaitOutcome {
    Sent(String),
    Gone,
    TimedOut,
}

enum Insertion {
    Inserted(SendId),
    AlreadySent { id: SendId, message_id: String },
}

/// Record of messages being sent or recently sent
pub struct SendRecorder {
    expiry: Duration,
    wait_timeout: Duration,
    inner: Mutex<RecorderInner>,
}

impl Default for SendRecorder {
    fn default() -> Self {
        Self::new(SEND_ENTRY_EXPIRY)
    }
}

impl SendRecorder {
    /// Create a recorder whose records expire after `expiry`
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            wait_timeout: SEND_WAIT_TIMEOUT,
            inner: Mutex::new(RecorderInner::default()),
        }
    }

    /// Create a recorder from the `[send]` settings
    pub fn from_config(config: &SendConfig) -> Self {
        Self {
            wait_timeout: config.wait_timeout(),
            ..Self::new(config.entry_expiry())
        }
    }

    /// Deadline for a send submitted now
    pub fn deadline(&self) -> Instant {
        Instant::now() + self.wait_timeout
    }

    /// Try to claim the send of `hash` to `recipients`.
    ///
    /// Returns `false` with the existing record's ID when the same message to
    /// the same recipients is already recorded.
    pub fn try_insert(&self, hash: &str, recipients: &[String]) -> (SendId, bool) {
        match self.insert_or_wait(hash, recipients) {
            Ok(id) => (id, true),
            Err(waiter) => (waiter.id, false),
        }
    }

    fn insert_or_wait(&self, hash: &str, recipients: &[String]) -> Result<SendId, Waiter> {
        let mut inner = self.inner.lock();
        inner.remove_expired();

        if let Some(entry) = inner.find(hash, recipients) {
            return Err(Waiter::new(entry));
        }

        inner.next_id += 1;
        let id = inner.next_id;
        let (done, _) = watch::channel(false);

        inner.entries.entry(hash.to_string()).or_default().push(SendEntry {
            id,
            recipients: recipients.to_vec(),
            expires: Instant::now() + self.expiry,
            message_id: None,
            done,
        });

        Ok(id)
    }

    /// Claim the send, waiting for a concurrent identical send to resolve.
    ///
    /// Returns `(id, true)` once the send is claimed and `(id, false)` when the
    /// concurrent send succeeded. Reaching `deadline` is an error.
    pub async fn try_insert_wait(
        &self,
        token: &CancellationToken,
        hash: &str,
        recipients: &[String],
        deadline: Instant,
    ) -> BridgeResult<(SendId, bool)> {
        match self.insert_wait(token, hash, recipients, deadline).await? {
            Insertion::Inserted(id) => Ok((id, true)),
            Insertion::AlreadySent { id, .. } => Ok((id, false)),
        }
    }

    async fn insert_wait(
        &self,
        token: &CancellationToken,
        hash: &str,
        recipients: &[String],
        deadline: Instant,
    ) -> BridgeResult<Insertion> {
        loop {
            let waiter = match self.insert_or_wait(hash, recipients) {
                Ok(id) => return Ok(Insertion::Inserted(id)),
                Err(waiter) => waiter,
            };

            let id = waiter.id;
            debug!("Message {} is already being sent, waiting", hash);

            match self.wait(token, hash, waiter, deadline).await? {
                WaitOutcome::Sent(message_id) => return Ok(Insertion::AlreadySent { id, message_id }),
                WaitOutcome::Gone => continue,
                WaitOutcome::TimedOut => {
                    return Err(BridgeError::timeout("waiting for message to be sent"));
                }
            }
        }
    }

    /// Wait for a recorded send of `hash` to `recipients` and return its
    /// message ID.
    ///
    /// Returns `None` when nothing is recorded or `deadline` passes first.
    pub async fn has_entry_wait(
        &self,
        token: &CancellationToken,
        hash: &str,
        recipients: &[String],
        deadline: Instant,
    ) -> BridgeResult<Option<String>> {
        loop {
            let waiter = {
                let mut inner = self.inner.lock();
                inner.remove_expired();
                inner.find(hash, recipients).map(Waiter::new)
            };

            let Some(waiter) = waiter else {
                return Ok(None);
            };

            match self.wait(token, hash, waiter, deadline).await? {
                WaitOutcome::Sent(message_id) => return Ok(Some(message_id)),
                WaitOutcome::Gone => continue,
                WaitOutcome::TimedOut => return Ok(None),
            }
        }
    }

    /// Mark the record as sent with `message_id`. Repeated calls are ignored.
    pub fn signal_message_sent(&self, hash: &str, id: SendId, message_id: &str) {
        let mut inner = self.inner.lock();

        let entry = inner
            .entries
            .get_mut(hash)
            .and_then(|entries| entries.iter_mut().find(|entry| entry.id == id));

        match entry {
            Some(entry) => {
                if entry.message_id.is_none() {
                    entry.message_id = Some(message_id.to_string());
                }
                entry.close();
            }
            None => warn!("Cannot record message ID for send {}, it may have expired", id),
        }
    }

    /// Drop the record after a failed send so that a waiting duplicate can
    /// retry. Records already marked as sent are kept.
    pub fn remove_on_fail(&self, hash: &str, id: SendId) {
        let mut inner = self.inner.lock();

        let Some(entries) = inner.entries.get_mut(hash) else {
            return;
        };

        if let Some(index) = entries
            .iter()
            .position(|entry| entry.id == id && entry.message_id.is_none())
        {
            entries.remove(index).close();
        }

        if entries.is_empty() {
            inner.entries.remove(hash);
        }
    }

    /// Send `literal` unless the same message to the same recipients was
    /// already sent.
    ///
    /// `send` runs only when this call claims the send. It returns the remote
    /// message ID. If it fails, or the returned future is dropped, the claim
    /// is released so that a waiting duplicate can take over.
    pub async fn send_once<F, Fut>(
        &self,
        token: &CancellationToken,
        literal: &[u8],
        recipients: &[String],
        deadline: Instant,
        send: F,
    ) -> BridgeResult<SendOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BridgeResult<String>>,
    {
        let hash = message_hash(literal)?;

        let id = match self.insert_wait(token, &hash, recipients, deadline).await? {
            Insertion::Inserted(id) => id,
            Insertion::AlreadySent { message_id, .. } => {
                debug!("Message {} already sent as {}", hash, message_id);
                return Ok(SendOutcome::Duplicate(message_id));
            }
        };

        let mut claim = SendClaim {
            recorder: self,
            hash: &hash,
            id,
            resolved: false,
        };

        let result = send().await;
        claim.resolved = true;

        match result {
            Ok(message_id) => {
                self.signal_message_sent(&hash, id, &message_id);
                Ok(SendOutcome::Sent(message_id))
            }
            Err(err) => {
                self.remove_on_fail(&hash, id);
                Err(err)
            }
        }
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.remove_expired();
        inner.entries.values().map(Vec::len).sum()
    }

    /// Whether no record is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn wait(&self, token: &CancellationToken, hash: &str, waiter: Waiter, deadline: Instant) -> BridgeResult<WaitOutcome> {
        let Waiter { id, mut done, expires } = waiter;

        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(BridgeError::Cancelled),
            _ = resolved(&mut done) => {}
            _ = tokio::time::sleep_until(deadline) => return Ok(WaitOutcome::TimedOut),
            _ = tokio::time::sleep_until(expires) => {}
        }

        let inner = self.inner.lock();
        let message_id = inner.find_by_id(hash, id).and_then(|entry| entry.message_id.clone());

        Ok(match message_id {
            Some(message_id) => WaitOutcome::Sent(message_id),
            None => WaitOutcome::Gone,
        })
    }
}

async fn resolved(done: &mut watch::Receiver<bool>) {
    // A dropped sender means the record is gone, which also ends the wait.
    let _ = done.wait_for(|done| *done).await;
}

/// Releases an unresolved claim when `send_once` is dropped mid-send
struct SendClaim<'a> {
    recorder: &'a SendRecorder,
    hash: &'a str,
    id: SendId,
    resolved: bool,
}

impl Drop for SendClaim<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.recorder.remove_on_fail(self.hash, self.id);
        }
    }
}

fn same_recipients(a: &[String], b: &[String]) -> bool {
    a.len() == b.len() && a.iter().all(|r| b.contains(r)) && b.iter().all(|r| a.contains(r))
}
