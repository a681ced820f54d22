//! Asgard Bridge Core Library
//!
//! This crate contains the engine behind the Asgard Bridge, including:
//! - A bounded worker pool
//! - The mailbox sync pipeline (rate-limit aware downloads, building, batching)
//! - Progress reporting for sync listeners
//! - Send deduplication across concurrent client connections

pub mod config;
pub mod error;
pub mod logging;
pub mod message;
pub mod pool;
pub mod send;
pub mod sync;

// Re-export commonly used types
pub use config::{AppConfig, Config, SendConfig, SyncConfig};
pub use error::{BridgeError, BridgeResult};
pub use message::{AttachmentInfo, FullMessage, Message, MessageCreated, MessageMetadata, MessagesCreated};
pub use pool::{JobHandle, WorkerPool};
pub use send::{message_hash, SendOutcome, SendRecorder};
pub use sync::{
    DownloadCache, EventSink, MemorySyncState, MessageBuilder, MessageDownloader, SyncEvent, SyncManager,
    SyncStateStore, SyncSummary, UpdateSink,
};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Asgard Bridge";

/// Default configuration directory name
pub const CONFIG_DIR_NAME: &str = "asgard-bridge";

/// Initialize the core library
pub fn init(config: &Config) -> BridgeResult<()> {
    config.validate()?;
    logging::init_logging(&config.app)?;

    tracing::info!("Initializing Asgard Bridge Core v{}", VERSION);

    Ok(())
}
