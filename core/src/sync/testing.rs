//! Scripted test doubles for the sync pipeline

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{BridgeError, BridgeResult};
use crate::message::{AttachmentInfo, Message, MessageCreated, MessagesCreated};
use crate::sync::downloader::MessageDownloader;
use crate::sync::events::{EventSink, SyncEvent, UpdateSink};

/// Scripted reply. The last reply of a script repeats forever.
#[derive(Debug, Clone)]
pub(crate) enum Reply<T> {
    Ok(T),
    Status(u16),
}

#[derive(Default)]
struct Script<T> {
    replies: HashMap<String, Vec<Reply<T>>>,
    calls: HashMap<String, usize>,
}

impl<T: Clone> Script<T> {
    fn next(&mut self, id: &str) -> BridgeResult<T> {
        let calls = self.calls.entry(id.to_string()).or_insert(0);
        *calls += 1;

        let Some(replies) = self.replies.get(id) else {
            return Err(BridgeError::api(404, format!("{} not found", id)));
        };

        let index = (*calls - 1).min(replies.len().saturating_sub(1));
        match replies.get(index) {
            Some(Reply::Ok(value)) => Ok(value.clone()),
            Some(Reply::Status(status)) => Err(BridgeError::api(*status, "scripted failure")),
            None => Err(BridgeError::api(404, format!("{} not found", id))),
        }
    }

    fn calls(&self, id: &str) -> usize {
        self.calls.get(id).copied().unwrap_or(0)
    }
}

/// Downloader answering from per-id scripts and counting calls
#[derive(Default)]
pub(crate) struct ScriptedDownloader {
    messages: Mutex<Script<Message>>,
    attachments: Mutex<Script<Bytes>>,
    delay: Option<Duration>,
}

impl ScriptedDownloader {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn message_with_attachments(id: &str, attachment_ids: &[&str]) -> Message {
        Message {
            id: id.to_string(),
            address_id: "addr-1".to_string(),
            label_ids: vec!["0".to_string()],
            body: format!("body of {}", id),
            attachments: attachment_ids.iter().map(|a| AttachmentInfo::new(*a, 64)).collect(),
        }
    }

    pub(crate) fn message(self, message: Message) -> Self {
        let id = message.id.clone();
        self.message_replies(&id, vec![Reply::Ok(message)])
    }

    pub(crate) fn message_replies(self, id: &str, replies: Vec<Reply<Message>>) -> Self {
        self.messages.lock().replies.insert(id.to_string(), replies);
        self
    }

    pub(crate) fn message_status(self, id: &str, status: u16) -> Self {
        self.message_replies(id, vec![Reply::Status(status)])
    }

    pub(crate) fn attachment(self, id: &str, data: &'static [u8]) -> Self {
        self.attachment_replies(id, vec![Reply::Ok(Bytes::from_static(data))])
    }

    pub(crate) fn attachment_replies(self, id: &str, replies: Vec<Reply<Bytes>>) -> Self {
        self.attachments.lock().replies.insert(id.to_string(), replies);
        self
    }

    pub(crate) fn attachment_status(self, id: &str, status: u16) -> Self {
        self.attachment_replies(id, vec![Reply::Status(status)])
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn message_calls(&self, id: &str) -> usize {
        self.messages.lock().calls(id)
    }

    pub(crate) fn attachment_calls(&self, id: &str) -> usize {
        self.attachments.lock().calls(id)
    }
}

#[async_trait]
impl MessageDownloader for ScriptedDownloader {
    async fn get_message(&self, message_id: &str) -> BridgeResult<Message> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let reply = self.messages.lock().next(message_id);
        reply
    }

    async fn get_attachment_into(&self, attachment_id: &str, buf: &mut Vec<u8>) -> BridgeResult<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let data = self.attachments.lock().next(attachment_id)?;
        buf.extend_from_slice(&data);
        Ok(())
    }
}

/// Sink recording every batch and event it receives
#[derive(Default)]
pub(crate) struct RecordingSink {
    pub(crate) updates: Mutex<Vec<MessagesCreated>>,
    pub(crate) events: Mutex<Vec<SyncEvent>>,
}

impl RecordingSink {
    pub(crate) fn update_ids(&self) -> Vec<Vec<String>> {
        self.updates
            .lock()
            .iter()
            .map(|batch| batch.messages.iter().map(|m| m.message_id.clone()).collect())
            .collect()
    }

    pub(crate) fn progress(&self) -> Vec<f64> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                SyncEvent::Progress { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect()
    }
}

impl UpdateSink for RecordingSink {
    fn publish_update(&self, update: MessagesCreated) {
        self.updates.lock().push(update);
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: SyncEvent) {
        self.events.lock().push(event);
    }
}

pub(crate) fn created(id: &str, size: usize) -> MessageCreated {
    MessageCreated {
        message_id: id.to_string(),
        address_id: "addr-1".to_string(),
        mailbox_ids: vec!["0".to_string()],
        flags: Vec::new(),
        literal: Bytes::from(vec![b'x'; size]),
    }
}
