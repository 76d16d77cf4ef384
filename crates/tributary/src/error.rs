//! Error types for tributary
//!
//! One error enum for the feeder runtime. Database errors keep their
//! [`tributary_rdbc::ErrorCategory`] so callers can still tell connection
//! problems from bad data.

use thiserror::Error;

/// Result type alias for tributary
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tributary
#[derive(Error, Debug)]
pub enum Error {
    /// Source database error (connection, query, type conversion)
    #[error(transparent)]
    Rdbc(#[from] tributary_rdbc::Error),

    /// Index server transport error (the whole request failed)
    #[error("transport error: {0}")]
    Transport(String),

    /// Index server rejected an admin request
    #[error("index server error: {0}")]
    IndexServer(String),

    /// Bulk client was closed, by shutdown or by an earlier transport failure
    #[error("client closed: {cause}")]
    ClientClosed {
        /// What closed the client
        cause: String,
    },

    /// Document cannot be rendered as a bulk action
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// Bulk client at its in-flight cap with the reject overflow policy
    #[error("backpressure: {0}")]
    Backpressure(String),

    /// Bulk requests still unacknowledged when the drain deadline passed
    #[error("bulk drain timed out after {timeout_ms}ms with {outstanding} request(s) in flight")]
    DrainTimeout {
        /// Requests still in flight
        outstanding: usize,
        /// Drain deadline
        timeout_ms: u64,
    },

    /// State store error
    #[error("state error: {0}")]
    State(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid schedule expression
    #[error("schedule error: {0}")]
    Schedule(String),

    /// Run interrupted through its cancellation token
    #[error("interrupted")]
    Interrupted,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP client error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create an invalid document error
    pub fn invalid_document(msg: impl Into<String>) -> Self {
        Self::InvalidDocument(msg.into())
    }

    /// Create a client closed error
    pub fn client_closed(cause: impl Into<String>) -> Self {
        Self::ClientClosed {
            cause: cause.into(),
        }
    }

    /// Whether a failed run should be rescheduled by the retry loop
    ///
    /// Interruptions and configuration mistakes are final; everything else
    /// gets another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Interrupted | Self::Config(_) | Self::Schedule(_) | Self::Yaml(_)
        )
    }

    /// Check if this is an interruption
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}
