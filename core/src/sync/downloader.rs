//! Message and attachment downloading
//!
//! [`MessageDownloader`] is the remote API as seen by the sync pipeline.
//! [`AttachmentDownloader`] puts a fixed set of workers in front of it so that
//! attachment traffic gets its own concurrency, independent from message
//! bodies. [`SyncDownloader`] is the long-running task that turns download
//! requests into fully assembled message batches.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{BridgeError, BridgeResult};
use crate::message::{AttachmentInfo, FullMessage, Message};
use crate::sync::cache::DownloadCache;
use crate::sync::limits::to_mb;
use crate::sync::stages::{download_stage1, download_stage2, DownloadRequest, RetryPolicy};

/// Remote API used to fetch message bodies and attachment data
#[async_trait]
pub trait MessageDownloader: Send + Sync {
    /// Fetch a message
    async fn get_message(&self, message_id: &str) -> BridgeResult<Message>;

    /// Fetch attachment data, appending it to `buf`
    async fn get_attachment_into(&self, attachment_id: &str, buf: &mut Vec<u8>) -> BridgeResult<()>;
}

struct AttachmentJob {
    id: String,
    size: u64,
    reply: oneshot::Sender<BridgeResult<Bytes>>,
}

type AttachmentQueue = Arc<tokio::sync::Mutex<mpsc::Receiver<AttachmentJob>>>;

/// Fixed pool of attachment download workers sitting behind the cache
pub struct AttachmentDownloader {
    /// Job queue shared by all workers
    jobs: mpsc::Sender<AttachmentJob>,
    /// Cancels every worker
    token: CancellationToken,
}

impl AttachmentDownloader {
    /// Start `workers` attachment workers.
    ///
    /// The workers stop when `token` is cancelled or the downloader is closed.
    pub fn new(
        token: &CancellationToken,
        downloader: Arc<dyn MessageDownloader>,
        cache: Arc<DownloadCache>,
        workers: usize,
    ) -> Self {
        let token = token.child_token();
        let workers = workers.max(1);
        let (jobs, queue) = mpsc::channel(workers);
        let queue: AttachmentQueue = Arc::new(tokio::sync::Mutex::new(queue));

        for index in 0..workers {
            tokio::spawn(attachment_worker(
                index,
                token.clone(),
                downloader.clone(),
                cache.clone(),
                queue.clone(),
            ));
        }

        Self { jobs, token }
    }

    /// Fetch all attachments of a message.
    ///
    /// One job is queued per attachment and the results come back in input
    /// order, each with its own outcome. The outer error only reports
    /// cancellation or a closed downloader.
    pub async fn get_attachments(
        &self,
        token: &CancellationToken,
        attachments: &[AttachmentInfo],
    ) -> BridgeResult<Vec<BridgeResult<Bytes>>> {
        let mut replies = Vec::with_capacity(attachments.len());

        for attachment in attachments {
            let (reply, reply_rx) = oneshot::channel();
            let job = AttachmentJob {
                id: attachment.id.clone(),
                size: attachment.size,
                reply,
            };

            tokio::select! {
                _ = token.cancelled() => return Err(BridgeError::Cancelled),
                sent = self.jobs.send(job) => {
                    sent.map_err(|_| BridgeError::invalid_state("attachment downloader is closed"))?;
                }
            }

            replies.push(reply_rx);
        }

        let mut results = Vec::with_capacity(replies.len());

        for reply_rx in replies {
            tokio::select! {
                _ = token.cancelled() => return Err(BridgeError::Cancelled),
                reply = reply_rx => {
                    let result = reply.map_err(|_| BridgeError::invalid_state("attachment downloader is closed"))?;
                    results.push(result);
                }
            }
        }

        Ok(results)
    }

    /// Stop all workers
    pub fn close(&self) {
        self.token.cancel();
    }
}

impl Drop for AttachmentDownloader {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn attachment_worker(
    index: usize,
    token: CancellationToken,
    downloader: Arc<dyn MessageDownloader>,
    cache: Arc<DownloadCache>,
    queue: AttachmentQueue,
) {
    loop {
        let job = tokio::select! {
            _ = token.cancelled() => break,
            job = next_attachment_job(&queue) => job,
        };

        let Some(job) = job else {
            break;
        };

        let result = match cache.get_attachment(&job.id) {
            Some(data) => Ok(data),
            None => {
                let mut buf = Vec::with_capacity(job.size as usize);

                let fetched = tokio::select! {
                    _ = token.cancelled() => break,
                    fetched = downloader.get_attachment_into(&job.id, &mut buf) => fetched,
                };

                fetched.map(|()| {
                    let data = Bytes::from(buf);
                    cache.store_attachment(&job.id, data.clone());
                    data
                })
            }
        };

        let _ = job.reply.send(result);
    }

    debug!("Attachment downloader {} exited", index);
}

async fn next_attachment_job(queue: &AttachmentQueue) -> Option<AttachmentJob> {
    queue.lock().await.recv().await
}

/// Long-running download stage of a sync
pub struct SyncDownloader {
    /// Remote API
    downloader: Arc<dyn MessageDownloader>,
    /// Download cache shared across retry rounds
    cache: Arc<DownloadCache>,
    /// Parallel message and attachment downloads
    parallel_downloads: usize,
    /// Rate-limit retry policy
    retry: RetryPolicy,
}

impl SyncDownloader {
    /// Create a new sync downloader
    pub fn new(
        downloader: Arc<dyn MessageDownloader>,
        cache: Arc<DownloadCache>,
        parallel_downloads: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            downloader,
            cache,
            parallel_downloads: parallel_downloads.max(1),
            retry,
        }
    }

    /// Spawn the download task.
    ///
    /// Downloaded batches are sent in request order. The join handle resolves
    /// once the request channel is exhausted, or with the first fatal error.
    pub fn start(
        self,
        token: CancellationToken,
        requests: mpsc::Receiver<DownloadRequest>,
    ) -> (mpsc::Receiver<Vec<FullMessage>>, JoinHandle<BridgeResult<()>>) {
        let (batch_tx, batch_rx) = mpsc::channel(1);

        let handle = tokio::spawn(async move {
            let attachments = AttachmentDownloader::new(
                &token,
                self.downloader.clone(),
                self.cache.clone(),
                self.parallel_downloads,
            );

            let result = self.run(&token, requests, &attachments, batch_tx).await;

            attachments.close();
            debug!("Sync downloader exit");

            result
        });

        (batch_rx, handle)
    }

    async fn run(
        &self,
        token: &CancellationToken,
        mut requests: mpsc::Receiver<DownloadRequest>,
        attachments: &AttachmentDownloader,
        batch_tx: mpsc::Sender<Vec<FullMessage>>,
    ) -> BridgeResult<()> {
        loop {
            let request = tokio::select! {
                _ = token.cancelled() => return Err(BridgeError::Cancelled),
                request = requests.recv() => request,
            };

            let Some(request) = request else {
                return Ok(());
            };

            debug!(
                "Download request: {} messages, {:.2} MB",
                request.ids.len(),
                to_mb(request.expected_size)
            );

            let results = download_stage1(
                token,
                request,
                self.downloader.as_ref(),
                attachments,
                &self.cache,
                self.parallel_downloads,
            )
            .await
            .map_err(|err| {
                error!("Download stage 1 failed: {}", err);
                err
            })?;

            if token.is_cancelled() {
                return Err(BridgeError::Cancelled);
            }

            let batch = download_stage2(token, results, self.downloader.as_ref(), &self.cache, &self.retry).await?;

            tokio::select! {
                _ = token.cancelled() => return Err(BridgeError::Cancelled),
                sent = batch_tx.send(batch) => {
                    if sent.is_err() {
                        debug!("Batch receiver dropped, stopping downloader");
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::ScriptedDownloader;
    use std::time::Duration;

    fn attachment(id: &str) -> AttachmentInfo {
        AttachmentInfo::new(id, 16)
    }

    #[tokio::test]
    async fn test_get_attachments_preserves_order() {
        let downloader = Arc::new(
            ScriptedDownloader::new()
                .attachment("a1", b"first")
                .attachment("a2", b"second")
                .attachment("a3", b"third"),
        );
        let cache = Arc::new(DownloadCache::new());
        let token = CancellationToken::new();
        let attachments = AttachmentDownloader::new(&token, downloader.clone(), cache.clone(), 3);

        let results = attachments
            .get_attachments(&token, &[attachment("a1"), attachment("a2"), attachment("a3")])
            .await
            .unwrap();

        let data: Vec<Bytes> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(data, vec![Bytes::from_static(b"first"), Bytes::from_static(b"second"), Bytes::from_static(b"third")]);
        assert!(cache.contains_attachment("a2"));
    }

    #[tokio::test]
    async fn test_get_attachments_reports_each_failure() {
        let downloader = Arc::new(
            ScriptedDownloader::new()
                .attachment("a1", b"first")
                .attachment_status("a2", 429),
        );
        let cache = Arc::new(DownloadCache::new());
        let token = CancellationToken::new();
        let attachments = AttachmentDownloader::new(&token, downloader, cache.clone(), 1);

        let results = attachments
            .get_attachments(&token, &[attachment("a1"), attachment("a2")])
            .await
            .unwrap();

        assert_eq!(results[0].as_ref().unwrap(), &Bytes::from_static(b"first"));
        assert!(results[1].as_ref().unwrap_err().is_rate_limited());
        assert!(!cache.contains_attachment("a2"));
    }

    #[tokio::test]
    async fn test_cached_attachment_is_not_fetched() {
        let downloader = Arc::new(ScriptedDownloader::new());
        let cache = Arc::new(DownloadCache::new());
        cache.store_attachment("a1", Bytes::from_static(b"cached"));

        let token = CancellationToken::new();
        let attachments = AttachmentDownloader::new(&token, downloader.clone(), cache, 2);

        let results = attachments.get_attachments(&token, &[attachment("a1")]).await.unwrap();

        assert_eq!(results[0].as_ref().unwrap(), &Bytes::from_static(b"cached"));
        assert_eq!(downloader.attachment_calls("a1"), 0);
    }

    #[tokio::test]
    async fn test_get_attachments_cancelled() {
        let downloader = Arc::new(ScriptedDownloader::new().attachment("a1", b"data").with_delay(Duration::from_secs(5)));
        let cache = Arc::new(DownloadCache::new());
        let token = CancellationToken::new();
        let attachments = AttachmentDownloader::new(&token, downloader, cache, 1);

        let caller = CancellationToken::new();
        let cancel = caller.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let err = attachments.get_attachments(&caller, &[attachment("a1")]).await.unwrap_err();
        assert!(matches!(err, BridgeError::Cancelled));
    }

    #[tokio::test]
    async fn test_closed_downloader_rejects_requests() {
        let downloader = Arc::new(ScriptedDownloader::new().attachment("a1", b"data"));
        let cache = Arc::new(DownloadCache::new());
        let token = CancellationToken::new();
        let attachments = AttachmentDownloader::new(&token, downloader, cache, 1);

        attachments.close();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = attachments.get_attachments(&token, &[attachment("a1")]).await;
        assert!(matches!(result, Err(BridgeError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_sync_downloader_emits_batches_in_order() {
        let downloader = Arc::new(
            ScriptedDownloader::new()
                .message(ScriptedDownloader::message_with_attachments("m1", &["a1"]))
                .message(ScriptedDownloader::message_with_attachments("m2", &[]))
                .message(ScriptedDownloader::message_with_attachments("m3", &[]))
                .attachment("a1", b"attachment"),
        );
        let cache = Arc::new(DownloadCache::new());
        let retry = RetryPolicy::new(Duration::from_millis(1), None);
        let sync_downloader = SyncDownloader::new(downloader, cache, 4, retry);

        let (request_tx, request_rx) = mpsc::channel(4);
        request_tx.send(DownloadRequest::new(vec!["m1".into(), "m2".into()], 100)).await.unwrap();
        request_tx.send(DownloadRequest::new(vec!["m3".into()], 10)).await.unwrap();
        drop(request_tx);

        let token = CancellationToken::new();
        let (mut batches, handle) = sync_downloader.start(token, request_rx);

        let first = batches.recv().await.unwrap();
        assert_eq!(first.iter().map(|m| m.id()).collect::<Vec<_>>(), vec!["m1", "m2"]);
        assert_eq!(first[0].attachments, vec![Bytes::from_static(b"attachment")]);

        let second = batches.recv().await.unwrap();
        assert_eq!(second[0].id(), "m3");

        assert!(batches.recv().await.is_none());
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_sync_downloader_stops_on_request_error() {
        let downloader = Arc::new(ScriptedDownloader::new());
        let cache = Arc::new(DownloadCache::new());
        let retry = RetryPolicy::new(Duration::from_millis(1), None);
        let sync_downloader = SyncDownloader::new(downloader, cache, 1, retry);

        let (request_tx, request_rx) = mpsc::channel(1);
        request_tx
            .send(DownloadRequest::failed(BridgeError::api(500, "metadata failed")))
            .await
            .unwrap();

        let (mut batches, handle) = sync_downloader.start(CancellationToken::new(), request_rx);

        assert!(batches.recv().await.is_none());
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::Api { status: 500, .. }));
    }
}
