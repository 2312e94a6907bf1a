use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use shared_models::error::AppError;

use crate::models::Specialty;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Consultation request not found: {0}")]
    RequestNotFound(Uuid),

    #[error("Professional not found: {0}")]
    ProfessionalNotFound(Uuid),

    #[error("{message}")]
    Conflict { reason: ConflictReason, message: String },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Dispatcher for {0} is not running")]
    DispatcherStopped(Specialty),

    #[error("Redis connection error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Coarse classification surfaced to HTTP and realtime callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Validation,
    Unavailable,
    StoreUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictReason {
    AlreadyAssigned,
    NotAvailable,
    NotAssigned,
    NotAssignee,
    AlreadyTerminal,
    DuplicateActive,
    NotOwner,
    NotCancellable,
}

impl ConflictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictReason::AlreadyAssigned => "ALREADY_ASSIGNED",
            ConflictReason::NotAvailable => "NOT_AVAILABLE",
            ConflictReason::NotAssigned => "NOT_ASSIGNED",
            ConflictReason::NotAssignee => "NOT_ASSIGNEE",
            ConflictReason::AlreadyTerminal => "ALREADY_TERMINAL",
            ConflictReason::DuplicateActive => "DUPLICATE_ACTIVE",
            ConflictReason::NotOwner => "NOT_OWNER",
            ConflictReason::NotCancellable => "NOT_CANCELLABLE",
        }
    }
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl QueueError {
    pub fn conflict(reason: ConflictReason, message: impl Into<String>) -> Self {
        QueueError::Conflict {
            reason,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::RequestNotFound(_) | QueueError::ProfessionalNotFound(_) => ErrorKind::NotFound,
            QueueError::Conflict { .. } => ErrorKind::Conflict,
            QueueError::ValidationError(_) => ErrorKind::Validation,
            QueueError::DispatcherStopped(_) => ErrorKind::Unavailable,
            QueueError::StoreUnavailable(_)
            | QueueError::RedisError(_)
            | QueueError::SerializationError(_) => ErrorKind::StoreUnavailable,
        }
    }

    pub fn conflict_reason(&self) -> Option<ConflictReason> {
        match self {
            QueueError::Conflict { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

impl From<QueueError> for AppError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Conflict { reason, message } => AppError::Conflict {
                reason: reason.to_string(),
                message,
            },
            QueueError::RequestNotFound(_) | QueueError::ProfessionalNotFound(_) => {
                AppError::NotFound(e.to_string())
            }
            QueueError::ValidationError(msg) => AppError::ValidationError(msg),
            QueueError::DispatcherStopped(_) => AppError::ServiceUnavailable(e.to_string()),
            QueueError::StoreUnavailable(_) | QueueError::RedisError(_) => {
                AppError::ExternalService(e.to_string())
            }
            QueueError::SerializationError(_) => AppError::Internal(e.to_string()),
        }
    }
}
