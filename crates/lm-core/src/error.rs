//! Unified error type for linkmirror.
//!
//! Every failure is funneled into [`Error`]. The variants double as the
//! failure taxonomy the task queue uses to decide between retrying an
//! operation and moving it to the dead-letter log, see [`Error::is_retryable`].

use std::fmt;

/// Unified error type covering all failure modes in linkmirror.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The source (remote API, mount, network) is temporarily unavailable.
    #[error("Transient source error: {0}")]
    TransientSource(String),

    /// The target path holds something we did not expect and may not touch.
    #[error("Conflict at {path}: {message}")]
    Conflict {
        /// Relative path of the conflicting entry.
        path: String,
        /// Human-readable description of what was found.
        message: String,
    },

    /// A persisted record could not be decoded.
    #[error("Integrity error at {path}: {message}")]
    Integrity {
        /// Relative path of the corrupt record.
        path: String,
        /// What was wrong with it.
        message: String,
    },

    /// Delivering a media-server notification failed.
    #[error("Notification error: {0}")]
    Notification(String),

    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "inventory entry", "dead letter").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// Request or configuration data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A database operation failed.
    #[error("Database error: {source}")]
    Database {
        /// The underlying database error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Work was abandoned because shutdown was requested.
    #[error("Operation cancelled")]
    Cancelled,

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether an operation that failed with this error should be retried
    /// with backoff rather than dead-lettered.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransientSource(_) | Error::Io { .. } | Error::Database { .. }
        )
    }

    /// Short, stable name of the error class, stored alongside dead letters.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::TransientSource(_) => "transient_source",
            Error::Conflict { .. } => "conflict",
            Error::Integrity { .. } => "integrity",
            Error::Notification(_) => "notification",
            Error::NotFound { .. } => "not_found",
            Error::Validation(_) => "validation",
            Error::Database { .. } => "database",
            Error::Io { .. } => "io",
            Error::Cancelled => "cancelled",
            Error::Internal(_) => "internal",
        }
    }

    /// Map this error to an appropriate HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::TransientSource(_) => 503,
            Error::Conflict { .. } => 409,
            Error::Integrity { .. } => 500,
            Error::Notification(_) => 502,
            Error::NotFound { .. } => 404,
            Error::Validation(_) => 400,
            Error::Database { .. } => 500,
            Error::Io { .. } => 500,
            Error::Cancelled => 503,
            Error::Internal(_) => 500,
        }
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Database`].
    pub fn database(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Database {
            source: source.into(),
        }
    }

    /// Convenience constructor for [`Error::Conflict`].
    pub fn conflict(path: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Conflict {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::Integrity`].
    pub fn integrity(path: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Integrity {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::TransientSource`].
    pub fn transient(message: impl Into<String>) -> Self {
        Error::TransientSource(message.into())
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
