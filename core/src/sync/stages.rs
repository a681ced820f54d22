//! Two-stage message download
//!
//! Stage 1 downloads a whole request in parallel and records what happened to
//! each item without giving up on the others. Stage 2 then walks the items
//! that did not finish, one at a time, and keeps retrying the ones that were
//! rate limited until everything is downloaded. Every other error ends the
//! batch.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::message::{FullMessage, Message};
use crate::sync::cache::DownloadCache;
use crate::sync::downloader::{AttachmentDownloader, MessageDownloader};

/// Batch of message IDs to download together
#[derive(Debug)]
pub struct DownloadRequest {
    /// Message IDs, in sync order
    pub ids: Vec<String>,
    /// Expected download size in bytes
    pub expected_size: u64,
    /// Error raised while preparing the request
    pub error: Option<BridgeError>,
}

impl DownloadRequest {
    /// Create a new download request
    pub fn new(ids: Vec<String>, expected_size: u64) -> Self {
        Self {
            ids,
            expected_size,
            error: None,
        }
    }

    /// Create a request that only carries an upstream failure
    pub fn failed(error: BridgeError) -> Self {
        Self {
            ids: Vec::new(),
            expected_size: 0,
            error: Some(error),
        }
    }
}

/// How far the download of a message got
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DownloadState {
    /// Nothing downloaded yet
    Zero,
    /// Message downloaded, attachments missing
    HasMessage,
    /// Message and every attachment downloaded
    Finished,
}

/// Per-message download progress
#[derive(Debug)]
pub struct DownloadResult {
    /// Message ID
    pub id: String,
    /// Download state
    pub state: DownloadState,
    /// Downloaded message; default until `HasMessage`
    pub message: Message,
    /// Attachment data, index-aligned with `message.attachments`
    pub att_data: Vec<Option<Bytes>>,
    /// Last error seen for this message
    pub error: Option<BridgeError>,
}

impl DownloadResult {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: DownloadState::Zero,
            message: Message::default(),
            att_data: Vec::new(),
            error: None,
        }
    }

    fn set_message(&mut self, message: Message) {
        self.att_data = vec![None; message.num_attachments()];
        self.message = message;
        self.state = DownloadState::HasMessage;
    }

    fn into_full_message(self) -> FullMessage {
        FullMessage {
            message: self.message,
            attachments: self.att_data.into_iter().map(Option::unwrap_or_default).collect(),
        }
    }
}

/// Retry policy for rate-limited downloads
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Pause between two retry rounds
    pub cooldown: Duration,
    /// Maximum number of retry rounds; unbounded when `None`
    pub max_rounds: Option<u32>,
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new(cooldown: Duration, max_rounds: Option<u32>) -> Self {
        Self { cooldown, max_rounds }
    }
}

/// Run `fut` unless `token` is cancelled first
pub(crate) async fn cancellable<F: Future>(token: &CancellationToken, fut: F) -> BridgeResult<F::Output> {
    tokio::select! {
        _ = token.cancelled() => Err(BridgeError::Cancelled),
        output = fut => Ok(output),
    }
}

/// Download every message of a request, `parallel` at a time.
///
/// Per-message failures are recorded on the returned results, which are
/// index-aligned with `request.ids`.
pub async fn download_stage1(
    token: &CancellationToken,
    request: DownloadRequest,
    downloader: &dyn MessageDownloader,
    attachments: &AttachmentDownloader,
    cache: &DownloadCache,
    parallel: usize,
) -> BridgeResult<Vec<DownloadResult>> {
    if let Some(err) = request.error {
        return Err(err);
    }

    let results = stream::iter(request.ids)
        .map(|id| download_message(token, id, downloader, attachments, cache))
        .buffered(parallel.max(1))
        .collect::<Vec<_>>();

    let results = cancellable(token, results).await?;

    if token.is_cancelled() {
        return Err(BridgeError::Cancelled);
    }

    Ok(results)
}

async fn download_message(
    token: &CancellationToken,
    id: String,
    downloader: &dyn MessageDownloader,
    attachments: &AttachmentDownloader,
    cache: &DownloadCache,
) -> DownloadResult {
    let mut result = DownloadResult::new(id);

    let message = match cache.get_message(&result.id) {
        Some(message) => message,
        None => match downloader.get_message(&result.id).await {
            Ok(message) => {
                cache.store_message(message.clone());
                message
            }
            Err(err) => {
                error!("Failed to download message {}: {}", result.id, err);
                result.error = Some(err);
                return result;
            }
        },
    };

    result.set_message(message);

    let fetched = match attachments.get_attachments(token, &result.message.attachments).await {
        Ok(fetched) => fetched,
        Err(err) => {
            result.error = Some(err);
            return result;
        }
    };

    for (index, data) in fetched.into_iter().enumerate() {
        match data {
            Ok(data) => result.att_data[index] = Some(data),
            Err(err) => {
                let attachment_id = &result.message.attachments[index].id;
                error!("Failed to download attachment {} of {}: {}", attachment_id, result.id, err);
                if result.error.is_none() {
                    result.error = Some(BridgeError::attachment(attachment_id.clone(), err));
                }
            }
        }
    }

    if result.error.is_none() {
        result.state = DownloadState::Finished;
    }

    result
}

/// Retry rate-limited items until every message is finished.
///
/// Returns the first non rate-limit error found, or the last rate-limit error
/// once `policy.max_rounds` is exhausted.
pub async fn download_stage2(
    token: &CancellationToken,
    mut state: Vec<DownloadResult>,
    downloader: &dyn MessageDownloader,
    cache: &DownloadCache,
    policy: &RetryPolicy,
) -> BridgeResult<Vec<FullMessage>> {
    debug!("Entering download stage 2");

    let mut round: u32 = 0;

    loop {
        let mut retry = Vec::new();

        for (index, item) in state.iter_mut().enumerate() {
            if item.state == DownloadState::Finished {
                continue;
            }

            match item.error.take() {
                Some(err) if !err.is_rate_limited() => {
                    error!("Message {} failed with non-retryable error: {}", item.id, err);
                    return Err(err.into_root_cause());
                }
                Some(err) => item.error = Some(err),
                None => {}
            }

            retry.push(index);
        }

        if retry.is_empty() {
            break;
        }

        if let Some(max_rounds) = policy.max_rounds {
            if round >= max_rounds {
                warn!("Giving up on {} rate limited messages after {} rounds", retry.len(), round);
                let last = retry.last().and_then(|index| state[*index].error.take());
                return Err(last.map_or_else(BridgeError::rate_limited, BridgeError::into_root_cause));
            }
        }

        if round > 0 {
            debug!("Rate limited, cooling down for {:?}", policy.cooldown);
            cancellable(token, tokio::time::sleep(policy.cooldown)).await?;
        }

        round += 1;
        debug!("Retry round {}: {} messages", round, retry.len());

        for index in retry {
            retry_message(token, &mut state[index], downloader, cache).await?;
        }
    }

    Ok(state.into_iter().map(DownloadResult::into_full_message).collect())
}

async fn retry_message(
    token: &CancellationToken,
    item: &mut DownloadResult,
    downloader: &dyn MessageDownloader,
    cache: &DownloadCache,
) -> BridgeResult<()> {
    if item.state == DownloadState::Zero {
        match cancellable(token, downloader.get_message(&item.id)).await? {
            Ok(message) => {
                cache.store_message(message.clone());
                item.set_message(message);
            }
            Err(err) if err.is_rate_limited() => {
                debug!("Message {} still rate limited", item.id);
                item.error = Some(err);
                return Ok(());
            }
            Err(err) => return Err(err),
        }
    }

    let mut has_all = true;

    for index in 0..item.message.num_attachments() {
        if item.att_data[index].is_some() {
            continue;
        }

        let attachment = &item.message.attachments[index];
        let mut buf = Vec::with_capacity(attachment.size as usize);

        match cancellable(token, downloader.get_attachment_into(&attachment.id, &mut buf)).await? {
            Ok(()) => {
                let data = Bytes::from(buf);
                cache.store_attachment(&attachment.id, data.clone());
                item.att_data[index] = Some(data);
            }
            Err(err) if err.is_rate_limited() => {
                debug!("Attachment {} of {} still rate limited", attachment.id, item.id);
                item.error = Some(BridgeError::attachment(attachment.id.clone(), err));
                has_all = false;
            }
            Err(err) => {
                error!("Attachment {} of {} failed with non-retryable error: {}", attachment.id, item.id, err);
                return Err(err);
            }
        }
    }

    if has_all {
        item.state = DownloadState::Finished;
        item.error = None;
    }

    Ok(())
}
