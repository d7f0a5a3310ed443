//! Unified error handling for the offerflow crate
//!
//! This module provides a unified error type that consolidates all domain-specific
//! errors into a single `Error` enum, while maintaining the ability to use
//! domain-specific errors when needed.
//!
//! # Architecture
//!
//! - [`OfferflowErrorTrait`] - Common interface implemented by the unified error
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors
//!
//! # Usage
//!
//! ```rust,ignore
//! use offerflow::error::{Error, ErrorCategory, OfferflowErrorTrait};
//!
//! fn handle_error(err: Error) {
//!     if err.is_recoverable() {
//!         tracing::warn!(error = %err, "Retrying");
//!     } else {
//!         tracing::error!(error = %err, category = ?err.category(), "Fatal error");
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

// Re-export domain-specific errors for convenience
pub use crate::scheduler::error::SchedulerError;
pub use crate::utils::error::{
    ConfigError, FetchError, ProxyError, PublishError, StoreError, ValidationError,
};

/// Common trait for offerflow error types
pub trait OfferflowErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Expected contention for a lock or proxy; back off and retry later
    Contention,
    /// Network-related errors (HTTP, timeout, rate limit)
    Network,
    /// Malformed upstream records
    Validation,
    /// Shared store and I/O errors
    Storage,
    /// Outbound delivery errors
    Delivery,
    /// Configuration errors; fatal at startup
    Config,
    /// Scheduler and timing errors
    Scheduler,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contention => "contention",
            Self::Network => "network",
            Self::Validation => "validation",
            Self::Storage => "storage",
            Self::Delivery => "delivery",
            Self::Config => "config",
            Self::Scheduler => "scheduler",
            Self::Other => "other",
        }
    }
}

/// Unified error type for the offerflow crate
#[derive(Error, Debug)]
pub enum Error {
    /// Fetch-specific errors
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// A single record failed validation
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Shared store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Proxy list and pool errors
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// Outbound publishing errors
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    /// Scheduler and timing errors
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// A lock or proxy could not be obtained
    #[error("Resource contended: {0}")]
    Contended(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl OfferflowErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Fetch(e) => e.is_transient(),
            Self::Validation(_) => false,
            Self::Store(e) => !matches!(e, StoreError::Corrupt { .. }),
            Self::Proxy(e) => matches!(e, ProxyError::Store(_)),
            Self::Publish(e) => !matches!(e, PublishError::Serialize(_)),
            Self::Scheduler(e) => e.is_recoverable(),
            Self::Config(_) => false,
            Self::Contended(_) => true,
            Self::Io(_) => true, // I/O errors are often transient
            Self::Json(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Fetch(_) => ErrorCategory::Network,
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Store(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::Proxy(e) => match e {
                ProxyError::InvalidUri { .. } | ProxyError::InvalidLine { .. } => {
                    ErrorCategory::Config
                }
                ProxyError::Store(_) | ProxyError::Io(_) => ErrorCategory::Storage,
                ProxyError::Client { .. } => ErrorCategory::Network,
            },
            Self::Publish(_) => ErrorCategory::Delivery,
            Self::Scheduler(_) => ErrorCategory::Scheduler,
            Self::Config(_) => ErrorCategory::Config,
            Self::Contended(_) => ErrorCategory::Contention,
            Self::Json(_) => ErrorCategory::Validation,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a contention error
    pub fn contended(what: impl Into<String>) -> Self {
        Self::Contended(what.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

// Conversion from anyhow::Error
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: err.to_string(),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
