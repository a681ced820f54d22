//! Sync manager driving the download, build and flush stages for one user

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::message::{FullMessage, MessageCreated, MessageMetadata};
use crate::pool::WorkerPool;
use crate::sync::batching::{chunk_build_batch, chunk_download_requests};
use crate::sync::cache::DownloadCache;
use crate::sync::downloader::{MessageDownloader, SyncDownloader};
use crate::sync::events::{EventSink, SyncEvent, UpdateSink};
use crate::sync::flusher::{FlushProgress, Flusher};
use crate::sync::limits::{to_mb, SyncLimits};
use crate::sync::reporter::Reporter;
use crate::sync::state::SyncStateStore;

/// Turns a downloaded message into an update for the local IMAP state.
///
/// Building is CPU bound and runs on the blocking thread pool.
pub trait MessageBuilder: Send + Sync + 'static {
    /// Build one message
    fn build(&self, message: &FullMessage) -> BridgeResult<MessageCreated>;
}

/// Outcome of a sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// Messages handed downstream
    pub synced: usize,
    /// Messages that failed to build
    pub failed: usize,
    /// Messages skipped because an earlier sync already handled them
    pub skipped: usize,
}

/// Sync manager for one user
pub struct SyncManager {
    /// User being synced
    user_id: String,
    /// Sync settings
    config: SyncConfig,
    /// Memory-derived limits
    limits: SyncLimits,
    /// Remote API
    downloader: Arc<dyn MessageDownloader>,
    /// Message builder
    builder: Arc<dyn MessageBuilder>,
    /// Checkpoint and failure markers
    state: Arc<dyn SyncStateStore>,
    /// Update sinks per address
    update_sinks: HashMap<String, Arc<dyn UpdateSink>>,
    /// Event listeners
    events: Arc<dyn EventSink>,
    /// Download cache kept for the session
    cache: Arc<DownloadCache>,
}

impl SyncManager {
    /// Create a new sync manager
    pub fn new(
        user_id: impl Into<String>,
        config: SyncConfig,
        limits: SyncLimits,
        downloader: Arc<dyn MessageDownloader>,
        builder: Arc<dyn MessageBuilder>,
        state: Arc<dyn SyncStateStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            config,
            limits,
            downloader,
            builder,
            state,
            update_sinks: HashMap::new(),
            events,
            cache: Arc::new(DownloadCache::new()),
        }
    }

    /// Create a sync manager whose limits follow `config` on a machine with
    /// `total_memory` bytes
    pub fn for_system(
        user_id: impl Into<String>,
        config: SyncConfig,
        total_memory: u64,
        downloader: Arc<dyn MessageDownloader>,
        builder: Arc<dyn MessageBuilder>,
        state: Arc<dyn SyncStateStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let limits = config.limits(total_memory);
        debug!(
            "Sync limits: {} parallel downloads, {} MB per request, {} MB per build chunk",
            limits.max_parallel_downloads,
            to_mb(limits.download_request_mem),
            to_mb(limits.message_build_mem)
        );

        Self::new(user_id, config, limits, downloader, builder, state, events)
    }

    /// Route updates for `address_id` to `sink`
    pub fn with_address(mut self, address_id: impl Into<String>, sink: Arc<dyn UpdateSink>) -> Self {
        self.update_sinks.insert(address_id.into(), sink);
        self
    }

    /// Download cache used by this manager
    pub fn cache(&self) -> &Arc<DownloadCache> {
        &self.cache
    }

    /// Sync `metadata`, oldest first, resuming after the last recorded message
    pub async fn sync(&self, token: &CancellationToken, metadata: Vec<MessageMetadata>) -> BridgeResult<SyncSummary> {
        let mut summary = SyncSummary::default();
        let metadata = self.skip_synced(metadata, &mut summary)?;

        info!(
            "Starting sync for user {}: {} messages ({} already synced)",
            self.user_id,
            metadata.len(),
            summary.skipped
        );

        self.events.publish(SyncEvent::Started {
            user_id: self.user_id.clone(),
        });

        let token = token.child_token();
        let _guard = token.clone().drop_guard();

        let builder = self.builder.clone();
        let pool: WorkerPool<Arc<FullMessage>, MessageCreated> =
            WorkerPool::new(self.config.build_workers, move |_token, message: Arc<FullMessage>| {
                let builder = builder.clone();
                async move {
                    match tokio::task::spawn_blocking(move || builder.build(&message)).await {
                        Ok(result) => result,
                        Err(err) => Err(BridgeError::build(format!("Build task failed: {}", err))),
                    }
                }
            });

        let result = self.run(&token, metadata, &pool, &mut summary).await;

        pool.close().await;

        match result {
            Ok(()) => {
                info!(
                    "Finished sync for user {}: {} synced, {} failed",
                    self.user_id, summary.synced, summary.failed
                );
                self.events.publish(SyncEvent::Finished {
                    user_id: self.user_id.clone(),
                });
                Ok(summary)
            }
            Err(err) => {
                error!("Sync failed for user {}: {}", self.user_id, err);
                Err(err)
            }
        }
    }

    fn skip_synced(&self, metadata: Vec<MessageMetadata>, summary: &mut SyncSummary) -> BridgeResult<Vec<MessageMetadata>> {
        let Some(last_id) = self.state.last_message_id()? else {
            return Ok(metadata);
        };

        match metadata.iter().position(|meta| meta.id == last_id) {
            Some(index) => {
                debug!("Resuming sync after message {}", last_id);
                summary.skipped = index + 1;
                Ok(metadata.into_iter().skip(index + 1).collect())
            }
            None => {
                warn!("Last synced message {} not listed, syncing everything", last_id);
                Ok(metadata)
            }
        }
    }

    async fn run(
        &self,
        token: &CancellationToken,
        metadata: Vec<MessageMetadata>,
        pool: &WorkerPool<Arc<FullMessage>, MessageCreated>,
        summary: &mut SyncSummary,
    ) -> BridgeResult<()> {
        let total = metadata.len();
        let progress = FlushProgress::new(self.events.clone(), self.user_id.clone(), total);
        let reporter = Reporter::new(
            self.events.clone(),
            self.user_id.clone(),
            total,
            self.config.progress_interval(),
        );

        let flushers: HashMap<&str, Flusher> = self
            .update_sinks
            .iter()
            .map(|(address_id, sink)| {
                let flusher = Flusher::new(sink.clone(), self.config.update_chunk_size).with_progress(progress.clone());
                (address_id.as_str(), flusher)
            })
            .collect();

        let requests = chunk_download_requests(&metadata, self.limits.download_request_mem, self.config.max_request_ids);
        debug!("Sync split into {} download requests", requests.len());

        let (request_tx, request_rx) = mpsc::channel(1);
        let feeder_token = token.clone();
        let feeder = tokio::spawn(async move {
            for request in requests {
                tokio::select! {
                    _ = feeder_token.cancelled() => return,
                    sent = request_tx.send(request) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        let downloader = SyncDownloader::new(
            self.downloader.clone(),
            self.cache.clone(),
            self.limits.max_parallel_downloads,
            self.config.retry_policy(),
        );
        let (mut batches, handle) = downloader.start(token.clone(), request_rx);

        let built = self
            .consume_batches(token, &mut batches, pool, &flushers, &progress, &reporter, summary)
            .await;

        if built.is_err() {
            token.cancel();
        }
        drop(batches);
        feeder.abort();

        let downloaded = handle
            .await
            .map_err(|err| BridgeError::sync(format!("Download task failed: {}", err)))?;

        for flusher in flushers.values() {
            flusher.flush();
        }

        built?;
        downloaded?;

        if token.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }

        reporter.done();
        Ok(())
    }

    async fn consume_batches(
        &self,
        token: &CancellationToken,
        batches: &mut mpsc::Receiver<Vec<FullMessage>>,
        pool: &WorkerPool<Arc<FullMessage>, MessageCreated>,
        flushers: &HashMap<&str, Flusher>,
        progress: &FlushProgress,
        reporter: &Reporter,
        summary: &mut SyncSummary,
    ) -> BridgeResult<()> {
        loop {
            let batch = tokio::select! {
                _ = token.cancelled() => return Err(BridgeError::Cancelled),
                batch = batches.recv() => batch,
            };

            let Some(batch) = batch else {
                return Ok(());
            };

            let Some(last_id) = batch.last().map(|message| message.id().to_string()) else {
                continue;
            };
            let count = batch.len();

            for chunk in chunk_build_batch(batch, self.limits.message_build_mem) {
                self.build_chunk(token, chunk, pool, flushers, progress, summary).await?;
            }

            for flusher in flushers.values() {
                flusher.flush();
            }

            self.state.set_last_message_id(&last_id)?;
            reporter.add(count);
        }
    }

    async fn build_chunk(
        &self,
        token: &CancellationToken,
        chunk: Vec<FullMessage>,
        pool: &WorkerPool<Arc<FullMessage>, MessageCreated>,
        flushers: &HashMap<&str, Flusher>,
        progress: &FlushProgress,
        summary: &mut SyncSummary,
    ) -> BridgeResult<()> {
        let chunk: Vec<Arc<FullMessage>> = chunk.into_iter().map(Arc::new).collect();
        let built = Mutex::new(HashMap::with_capacity(chunk.len()));

        pool.process(token, chunk.clone(), |message, result| match result {
            Ok(update) => {
                built.lock().insert(message.id().to_string(), update);
                Ok(())
            }
            Err(err) if err.is_cancellation() => Err(err),
            Err(err) => {
                error!("Failed to build message {}: {}", message.id(), err);
                Ok(())
            }
        })
        .await?;

        let mut built = built.into_inner();

        // Hand updates over in download order.
        for message in &chunk {
            let message_id = message.id();

            let Some(update) = built.remove(message_id) else {
                self.state.add_failed_message_id(message_id)?;
                progress.skip(1);
                summary.failed += 1;
                continue;
            };

            self.state.remove_failed_message_id(message_id)?;

            match flushers.get(update.address_id.as_str()) {
                Some(flusher) => {
                    flusher.push(update);
                    summary.synced += 1;
                }
                None => {
                    progress.skip(1);
                    warn!("No update sink for address {}, dropping message {}", update.address_id, message_id);
                }
            }
        }

        Ok(())
    }
}
