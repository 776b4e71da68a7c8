//! Error taxonomy shared by the registry, task queue, and protocol surface.
//!
//! Every failure a caller can observe maps to one [`ErrorKind`]. Kinds are
//! stable strings so they can be stored on task records and echoed in
//! protocol responses.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable classification of a failure. Serialized as [`ErrorKind::as_str`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "&'static str", try_from = "String")]
pub enum ErrorKind {
    /// Malformed request or arguments, rejected before execution.
    Validation,
    /// Managed file already owned by another agent.
    Conflict,
    /// Unknown agent or task id.
    NotFound,
    /// Model output segment could not be salvaged.
    Parse,
    /// A tool handler failed while executing.
    Handler,
    /// Inference or a handler exceeded its time bound.
    Timeout,
    /// Missing, invalid, or expired session.
    Auth,
    /// Persisted registry state could not be read or written.
    Storage,
    /// Task was cancelled before it finished.
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 10] = [
        ErrorKind::Validation,
        ErrorKind::Conflict,
        ErrorKind::NotFound,
        ErrorKind::Parse,
        ErrorKind::Handler,
        ErrorKind::Timeout,
        ErrorKind::Auth,
        ErrorKind::Storage,
        ErrorKind::Cancelled,
        ErrorKind::Internal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::Conflict => "conflict_error",
            ErrorKind::NotFound => "not_found_error",
            ErrorKind::Parse => "parse_failure",
            ErrorKind::Handler => "handler_failure",
            ErrorKind::Timeout => "timeout_error",
            ErrorKind::Auth => "auth_error",
            ErrorKind::Storage => "storage_error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal_error",
        }
    }
}

impl From<ErrorKind> for &'static str {
    fn from(kind: ErrorKind) -> Self {
        kind.as_str()
    }
}

impl TryFrom<String> for ErrorKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ErrorKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| format!("unknown error kind '{}'", value))
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by registry, queue, and authenticator operations.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Managed file '{managed_file}' is already owned by agent {owner}")]
    Conflict { managed_file: String, owner: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Parse failure: {0}")]
    Parse(String),

    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FleetError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        FleetError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn agent_not_found(id: impl ToString) -> Self {
        FleetError::NotFound {
            entity: "Agent",
            id: id.to_string(),
        }
    }

    pub fn task_not_found(id: impl ToString) -> Self {
        FleetError::NotFound {
            entity: "Task",
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FleetError::Validation { .. } => ErrorKind::Validation,
            FleetError::Conflict { .. } => ErrorKind::Conflict,
            FleetError::NotFound { .. } => ErrorKind::NotFound,
            FleetError::Parse(_) => ErrorKind::Parse,
            FleetError::Timeout(_) => ErrorKind::Timeout,
            FleetError::Handler(_) => ErrorKind::Handler,
            FleetError::Auth(_) => ErrorKind::Auth,
            FleetError::Storage(_) => ErrorKind::Storage,
            FleetError::Cancelled(_) => ErrorKind::Cancelled,
            FleetError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<rusqlite::Error> for FleetError {
    fn from(e: rusqlite::Error) -> Self {
        FleetError::Storage(e.to_string())
    }
}

impl From<tokio::task::JoinError> for FleetError {
    fn from(e: tokio::task::JoinError) -> Self {
        FleetError::Internal(format!("Task join error: {}", e))
    }
}

pub type FleetResult<T> = Result<T, FleetError>;
