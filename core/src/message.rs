//! Message models shared by the sync pipeline

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Metadata listed for every remote message before it is downloaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Remote message ID
    pub id: String,
    /// Address the message belongs to
    pub address_id: String,
    /// Size in bytes as reported by the server
    pub size: u64,
}

impl MessageMetadata {
    /// Create new message metadata
    pub fn new(id: impl Into<String>, address_id: impl Into<String>, size: u64) -> Self {
        Self {
            id: id.into(),
            address_id: address_id.into(),
            size,
        }
    }
}

/// Attachment reference carried by a downloaded message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentInfo {
    /// Remote attachment ID
    pub id: String,
    /// Filename
    pub name: String,
    /// MIME type
    pub mime_type: String,
    /// Size in bytes, used as a buffer size hint
    pub size: u64,
}

impl AttachmentInfo {
    /// Create a new attachment reference
    pub fn new(id: impl Into<String>, size: u64) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            mime_type: "application/octet-stream".to_string(),
            size,
        }
    }
}

/// Remote message as returned by the API, still encrypted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Remote message ID
    pub id: String,
    /// Address the message belongs to
    pub address_id: String,
    /// Labels (mailboxes) the message is in
    pub label_ids: Vec<String>,
    /// Armored message body
    pub body: String,
    /// Attachments, in MIME order
    pub attachments: Vec<AttachmentInfo>,
}

impl Message {
    /// Number of attachments this message references
    pub fn num_attachments(&self) -> usize {
        self.attachments.len()
    }

    /// Sum of the attachment size hints
    pub fn attachments_size(&self) -> u64 {
        self.attachments.iter().map(|a| a.size).sum()
    }
}

/// A message together with the data of all of its attachments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullMessage {
    /// The message
    pub message: Message,
    /// Attachment data, index-aligned with `message.attachments`
    pub attachments: Vec<Bytes>,
}

impl FullMessage {
    /// Remote message ID
    pub fn id(&self) -> &str {
        &self.message.id
    }
}

/// Built message ready to be created in the local IMAP state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageCreated {
    /// Remote message ID
    pub message_id: String,
    /// Address the message belongs to
    pub address_id: String,
    /// Mailboxes the message must appear in
    pub mailbox_ids: Vec<String>,
    /// IMAP flags
    pub flags: Vec<String>,
    /// RFC 822 literal
    pub literal: Bytes,
}

impl MessageCreated {
    /// Byte length counted against the flush threshold
    pub fn size(&self) -> usize {
        self.literal.len()
    }
}

/// Ordered batch of created messages handed to the protocol layer at once
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagesCreated {
    /// Created messages in push order
    pub messages: Vec<MessageCreated>,
}

impl MessagesCreated {
    /// Number of messages in the batch
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the batch is empty
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
