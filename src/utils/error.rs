//! Error types for the offerflow pipeline
//!
//! This module defines the per-domain error types used throughout the application.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while fetching a page from the marketplace API
#[derive(Error, Debug)]
pub enum FetchError {
    /// HTTP request error (connection refused, reset, TLS, ...)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Upstream answered 429
    #[error("Rate limited by upstream")]
    RateLimited {
        /// Server supplied `Retry-After`, when present
        retry_after: Option<Duration>,
    },

    /// Server error with status code
    #[error("Server error: {0}")]
    ServerError(u16),

    /// Client error that retrying cannot fix
    #[error("Request rejected with status {0}")]
    Rejected(u16),

    /// Request timeout
    #[error("Request timeout")]
    Timeout,

    /// Maximum retry attempts exceeded
    #[error("Maximum retry attempts exceeded: {last}")]
    MaxRetriesExceeded {
        /// Description of the final failure
        last: String,
    },

    /// Response body was not valid JSON in any accepted shape
    #[error("Decoding error: {0}")]
    Decode(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Request admission was closed by shutdown
    #[error("Fetch cancelled by shutdown")]
    Cancelled,

    /// The task lock or proxy lease could not be renewed
    #[error("Claim lost: {0}")]
    ClaimLost(String),
}

impl FetchError {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_connect() || e.is_timeout() || e.is_request() || e.is_body(),
            Self::RateLimited { .. } | Self::ServerError(_) | Self::Timeout => true,
            Self::Rejected(_)
            | Self::MaxRetriesExceeded { .. }
            | Self::Decode(_)
            | Self::InvalidUrl(_)
            | Self::Cancelled
            | Self::ClaimLost(_) => false,
        }
    }

    /// Whether the failure points at the proxy rather than the request
    pub fn blames_proxy(&self) -> bool {
        match self {
            Self::Http(e) => e.is_connect() || e.is_timeout(),
            Self::RateLimited { .. } | Self::Timeout => true,
            _ => false,
        }
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http(_) => "http",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError(_) => "server_error",
            Self::Rejected(_) => "rejected",
            Self::Timeout => "timeout",
            Self::MaxRetriesExceeded { .. } => "retries_exhausted",
            Self::Decode(_) => "decode",
            Self::InvalidUrl(_) => "invalid_url",
            Self::Cancelled => "cancelled",
            Self::ClaimLost(_) => "claim_lost",
        }
    }
}

/// A single malformed listing record
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Record is not a JSON object
    #[error("Record is not an object")]
    NotAnObject,

    /// Required field missing or empty
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// Price present but unusable
    #[error("Invalid price: {0}")]
    InvalidPrice(String),
}

/// Errors raised by the shared key-value store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Could not obtain a connection from the pool
    #[error("Store connection failed: {0}")]
    Connection(String),

    /// Command failed on the server
    #[error("Store command failed: {0}")]
    Command(#[from] redis::RedisError),

    /// Stored value could not be decoded
    #[error("Corrupt value at '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    /// Create a corrupt value error
    pub fn corrupt(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<deadpool_redis::PoolError> for StoreError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::Connection(err.to_string())
    }
}

/// Errors related to the proxy list and pool
#[derive(Error, Debug)]
pub enum ProxyError {
    /// A proxy URI could not be parsed
    #[error("Invalid proxy URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    /// A line of the proxy list file is invalid
    #[error("Invalid proxy on line {line}: {source}")]
    InvalidLine {
        line: usize,
        #[source]
        source: Box<ProxyError>,
    },

    /// Proxy list file unreadable
    #[error("Failed to read proxy list: {0}")]
    Io(#[from] std::io::Error),

    /// Shared store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// HTTP client for the proxy could not be built
    #[error("Failed to build client for proxy {proxy}: {reason}")]
    Client { proxy: String, reason: String },
}

impl ProxyError {
    /// Create an invalid URI error
    pub fn invalid_uri(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUri {
            uri: uri.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while publishing offers downstream
#[derive(Error, Debug)]
pub enum PublishError {
    /// Offer could not be serialized
    #[error("Serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Transport rejected or lost the message
    #[error("Transport failure: {0}")]
    Transport(String),

    /// All delivery attempts failed
    #[error("Delivery failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

/// Configuration errors, always fatal at startup
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Missing environment variable
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// Invalid value for a field
    #[error("Invalid value for '{0}': {1}")]
    InvalidValue(String, String),

    /// Config file unreadable
    #[error("Failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },

    /// Config file is not valid TOML for the schema
    #[error("Failed to parse config file {path}: {reason}")]
    Parse { path: String, reason: String },
}

impl ConfigError {
    /// Create an invalid value error
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue(field.into(), reason.into())
    }
}
