//! Error types for Asgard Bridge Core

/// Result type alias for Asgard Bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// HTTP status the remote API uses to ask us to slow down
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// Main error type for Asgard Bridge
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// A pool job was cancelled before the worker picked it up
    #[error("Job cancelled")]
    JobCancelled,

    /// The surrounding operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Remote API errors
    #[error("API error {status}: {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Message returned by the server
        message: String,
    },

    /// Network errors
    #[error("Network error: {0}")]
    Network(String),

    /// Failure downloading one attachment of a message
    #[error("Failed to get attachment {id}: {source}")]
    Attachment {
        /// Attachment ID
        id: String,
        /// Underlying error
        #[source]
        source: Box<BridgeError>,
    },

    /// Message build errors
    #[error("Message build error: {0}")]
    Build(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing errors
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// MIME parsing errors
    #[error("MIME parsing error: {0}")]
    Mime(#[from] mailparse::MailParseError),

    /// The worker pool no longer accepts jobs
    #[error("Worker pool is closed")]
    PoolClosed,

    /// Invalid state errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Sync errors
    #[error("Sync error: {0}")]
    Sync(String),
}

impl BridgeError {
    /// Create a new API error
    pub fn api(status: u16, msg: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: msg.into(),
        }
    }

    /// Create a new "429 Too Many Requests" API error
    pub fn rate_limited() -> Self {
        Self::api(STATUS_TOO_MANY_REQUESTS, "Too Many Requests")
    }

    /// Create a new network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new build error
    pub fn build(msg: impl Into<String>) -> Self {
        Self::Build(msg.into())
    }

    /// Create a new invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a new sync error
    pub fn sync(msg: impl Into<String>) -> Self {
        Self::Sync(msg.into())
    }

    /// Wrap an attachment download failure
    pub fn attachment(id: impl Into<String>, source: BridgeError) -> Self {
        Self::Attachment {
            id: id.into(),
            source: Box::new(source),
        }
    }

    /// Strip attachment context, leaving the error the remote returned
    pub fn into_root_cause(self) -> Self {
        match self {
            Self::Attachment { source, .. } => source.into_root_cause(),
            other => other,
        }
    }

    /// Check if the remote asked us to back off (HTTP 429).
    ///
    /// Only this class of error is retried by the download pipeline; everything
    /// else is fatal for the batch it occurs in.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::Api { status, .. } => *status == STATUS_TOO_MANY_REQUESTS,
            Self::Attachment { source, .. } => source.is_rate_limited(),
            _ => false,
        }
    }

    /// Check if this error is the result of a cancellation
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::JobCancelled | Self::Cancelled)
    }

    /// Check if this is a network-related error
    pub fn is_network_error(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_) | Self::Io(_))
    }
}
