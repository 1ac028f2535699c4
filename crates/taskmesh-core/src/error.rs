// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for taskmesh-core.
//!
//! Provides a unified error type that maps to structured error codes and
//! HTTP-equivalent status codes for the transport boundary.

use std::fmt;

/// Result type using HubError
pub type Result<T> = std::result::Result<T, HubError>;

/// Hub errors that can occur during command processing.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum HubError {
    /// The instance is advisory-locked by another processor.
    LockConflict {
        /// The instance that is locked.
        instance_id: String,
        /// The processor holding the lock.
        locked_by: String,
    },

    /// The per-minute update rate for this task was exceeded.
    RateLimitExceeded {
        /// The configured requests-per-minute ceiling.
        max_request_rate: u32,
    },

    /// The in-process mutex for a key is already held (try-lock path).
    AlreadyLocked {
        /// The contended key.
        key: String,
    },

    /// No active instance exists for the given id.
    InstanceNotFound {
        /// The instance id that was not found.
        instance_id: String,
    },

    /// The task id does not exist in the static task registry.
    UnknownTaskId {
        /// The unknown task id.
        task_id: String,
    },

    /// No handler is registered for the task's type.
    UnknownTaskType {
        /// The unregistered task type.
        task_type: String,
    },

    /// The hub envelope carries no command the pipeline can dispatch.
    UnknownCommand {
        /// Description of what was received.
        received: String,
    },

    /// A task carries an error but no ancestor error task exists.
    UnroutableTask {
        /// The id whose ancestry was searched.
        task_id: String,
    },

    /// Full-document hash disagreement between two replicas.
    HashMismatch {
        /// The instance whose replicas diverged.
        instance_id: String,
        /// Hash claimed by the remote replica.
        remote: u32,
        /// Hash of the locally stored document.
        local: u32,
    },

    /// The inbound document failed a structural check.
    Validation {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// A store operation failed.
    Store {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl HubError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::LockConflict { .. } => "LOCK_CONFLICT",
            Self::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Self::AlreadyLocked { .. } => "ALREADY_LOCKED",
            Self::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            Self::UnknownTaskId { .. } => "UNKNOWN_TASK_ID",
            Self::UnknownTaskType { .. } => "UNKNOWN_TASK_TYPE",
            Self::UnknownCommand { .. } => "UNKNOWN_COMMAND",
            Self::UnroutableTask { .. } => "UNROUTABLE_TASK",
            Self::HashMismatch { .. } => "HASH_MISMATCH",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Store { .. } => "STORE_ERROR",
        }
    }

    /// HTTP-equivalent status code surfaced to the immediate caller.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::LockConflict { .. } => 423,
            Self::RateLimitExceeded { .. } => 409,
            Self::AlreadyLocked { .. } => 409,
            Self::InstanceNotFound { .. } | Self::UnknownTaskId { .. } => 404,
            Self::Validation { .. } | Self::UnknownCommand { .. } => 400,
            _ => 500,
        }
    }
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LockConflict {
                instance_id,
                locked_by,
            } => {
                write!(f, "Task locked: instance '{}' held by '{}'", instance_id, locked_by)
            }
            Self::RateLimitExceeded { max_request_rate } => {
                write!(f, "Task update rate exceeded {} per minute", max_request_rate)
            }
            Self::AlreadyLocked { key } => {
                write!(f, "Cannot acquire lock for key '{}': already locked", key)
            }
            Self::InstanceNotFound { instance_id } => {
                write!(f, "No active instance '{}'", instance_id)
            }
            Self::UnknownTaskId { task_id } => {
                write!(f, "Task id '{}' not found in registry", task_id)
            }
            Self::UnknownTaskType { task_type } => {
                write!(f, "No handler registered for task type '{}'", task_type)
            }
            Self::UnknownCommand { received } => {
                write!(f, "Unknown command: {}", received)
            }
            Self::UnroutableTask { task_id } => {
                write!(f, "No error task found in the ancestry of '{}'", task_id)
            }
            Self::HashMismatch {
                instance_id,
                remote,
                local,
            } => {
                write!(
                    f,
                    "Task hash mismatch for instance '{}': remote {} local {}",
                    instance_id, remote, local
                )
            }
            Self::Validation { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::Store { operation, details } => {
                write!(f, "Store error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for HubError {}

impl From<sqlx::Error> for HubError {
    fn from(err: sqlx::Error) -> Self {
        HubError::Store {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        HubError::Store {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
