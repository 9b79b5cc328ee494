//! Error types for courierq operations.

use thiserror::Error;

/// Result type used throughout courierq.
pub type CourierResult<T> = Result<T, CourierError>;

/// Main error type for courierq operations.
#[derive(Error, Debug)]
pub enum CourierError {
    /// Coordination store error (connection lost, command rejected, ...)
    #[error("Store error: {message}")]
    Store {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// Worker pool is already running
    #[error("Worker pool is already running")]
    AlreadyRunning,

    /// Worker pool is not running
    #[error("Worker pool is not running")]
    NotRunning,

    /// Redis error
    #[cfg(feature = "redis-queue")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Metrics registry error
    #[cfg(feature = "metrics")]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl CourierError {
    /// Create a new store error
    pub fn store<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Store {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a store error without an underlying cause
    pub fn store_msg(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether the error means the coordination store could not be reached.
    ///
    /// The producer degrades to direct delivery on these.
    pub fn is_store_unavailable(&self) -> bool {
        match self {
            Self::Store { .. } => true,
            #[cfg(feature = "redis-queue")]
            Self::Redis(_) => true,
            _ => false,
        }
    }
}

/// Error reported by a [`Transport`](crate::transport::Transport).
///
/// Every variant consumes one delivery attempt; the queue does not treat any of
/// them as permanent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Could not reach the mail server
    #[error("network error: {0}")]
    Network(String),

    /// The mail server refused our credentials
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The recipient was rejected by the provider
    #[error("recipient rejected: {0}")]
    Rejected(String),

    /// Anything else
    #[error("delivery failed: {0}")]
    Other(String),
}

impl TransportError {
    /// Short machine-friendly tag for logs and dead-letter context.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Auth(_) => "auth",
            Self::Rejected(_) => "rejected",
            Self::Other(_) => "other",
        }
    }
}
