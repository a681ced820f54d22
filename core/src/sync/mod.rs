//! Mailbox synchronization engine
//!
//! Messages flow from the remote API through a two-stage downloader, get
//! built on a worker pool and are handed to the protocol layer in size-bounded
//! batches while progress is reported to listeners.

pub mod batching;
pub mod cache;
pub mod downloader;
pub mod events;
pub mod flusher;
pub mod limits;
pub mod reporter;
pub mod stages;
pub mod state;
pub mod sync_manager;

#[cfg(test)]
pub(crate) mod testing;

pub use batching::{chunk_build_batch, chunk_download_requests};
pub use cache::{CacheStats, DownloadCache};
pub use downloader::{AttachmentDownloader, MessageDownloader, SyncDownloader};
pub use events::{EventSink, SyncEvent, UpdateSink};
pub use flusher::{FlushProgress, Flusher};
pub use limits::SyncLimits;
pub use reporter::Reporter;
pub use stages::{download_stage1, download_stage2, DownloadRequest, DownloadResult, DownloadState, RetryPolicy};
pub use state::{MemorySyncState, SyncStateStore};
pub use sync_manager::{MessageBuilder, SyncManager, SyncSummary};
