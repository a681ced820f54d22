//! Splitting sync work into memory-bounded pieces

use crate::message::{FullMessage, MessageMetadata};
use crate::sync::stages::DownloadRequest;

/// Default maximum number of IDs in one download request
pub const DEFAULT_MAX_REQUEST_IDS: usize = 256;

/// Group message metadata into download requests.
///
/// A request is closed once adding the next message would reach
/// `max_request_mem` bytes, or once it already holds `max_ids` IDs. A single
/// message larger than the budget gets a request of its own.
pub fn chunk_download_requests(metadata: &[MessageMetadata], max_request_mem: u64, max_ids: usize) -> Vec<DownloadRequest> {
    let max_ids = max_ids.max(1);
    let mut requests = Vec::new();
    let mut current = DownloadRequest::new(Vec::new(), 0);

    for meta in metadata {
        let mut next_size = current.expected_size + meta.size;

        if !current.ids.is_empty() && (next_size >= max_request_mem || current.ids.len() >= max_ids) {
            requests.push(std::mem::replace(&mut current, DownloadRequest::new(Vec::new(), 0)));
            next_size = meta.size;
        }

        current.ids.push(meta.id.clone());
        current.expected_size = next_size;
    }

    if !current.ids.is_empty() {
        requests.push(current);
    }

    requests
}

/// Estimated memory needed to build a message.
///
/// Attachments count twice since decrypting them needs a second buffer.
pub fn estimated_build_memory(message: &FullMessage) -> u64 {
    message.message.attachments_size() * 2 + message.message.body.len() as u64
}

/// Split a downloaded batch into chunks whose estimated build memory stays
/// under `max_mem`. Order is preserved.
pub fn chunk_build_batch(batch: Vec<FullMessage>, max_mem: u64) -> Vec<Vec<FullMessage>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut expected: u64 = 0;

    for message in batch {
        let size = estimated_build_memory(&message);
        let next = expected + size;

        if next >= max_mem && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            expected = size;
        } else {
            expected = next;
        }

        current.push(message);
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}
