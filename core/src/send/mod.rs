//! Outgoing message deduplication

pub mod hash;
pub mod recorder;

pub use hash::message_hash;
pub use recorder::{SendId, SendOutcome, SendRecorder, SEND_ENTRY_EXPIRY, SEND_WAIT_TIMEOUT};
