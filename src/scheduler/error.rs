//! Error types for the scheduler module

use std::fmt;

use crate::utils::error::StoreError;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduler-specific errors
#[derive(Debug)]
pub enum SchedulerError {
    /// Task definition rejected before it reached the store
    InvalidTask {
        task_key: String,
        reason: String,
    },

    /// No schedule stored under this key
    TaskNotFound {
        task_key: String,
    },

    /// Shared store failure
    StoreError {
        operation: String,
        reason: String,
    },

    /// Serialization/deserialization error
    SerializationError {
        reason: String,
    },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTask { task_key, reason } => {
                write!(f, "Invalid task '{}': {}", task_key, reason)
            }
            Self::TaskNotFound { task_key } => {
                write!(f, "Task not found: {}", task_key)
            }
            Self::StoreError { operation, reason } => {
                write!(f, "Store error during '{}': {}", operation, reason)
            }
            Self::SerializationError { reason } => {
                write!(f, "Serialization error: {}", reason)
            }
        }
    }
}

impl std::error::Error for SchedulerError {}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError {
            reason: err.to_string(),
        }
    }
}

impl From<StoreError> for SchedulerError {
    fn from(err: StoreError) -> Self {
        Self::StoreError {
            operation: "unknown".to_string(),
            reason: err.to_string(),
        }
    }
}

impl SchedulerError {
    /// Create an invalid task error
    pub fn invalid_task(task_key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTask {
            task_key: task_key.into(),
            reason: reason.into(),
        }
    }

    /// Create a task not found error
    pub fn task_not_found(task_key: impl Into<String>) -> Self {
        Self::TaskNotFound {
            task_key: task_key.into(),
        }
    }

    /// Create a store error with context
    pub fn store_error(operation: impl Into<String>, err: StoreError) -> Self {
        Self::StoreError {
            operation: operation.into(),
            reason: err.to_string(),
        }
    }

    /// Check if the error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::StoreError { .. })
    }
}
