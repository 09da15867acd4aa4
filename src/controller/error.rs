//! Error types for the controller.
//!
//! Every failure maps onto one of four kinds: `ArgumentError` for bad caller
//! input, `RuntimeError` for precondition and server-side failures,
//! `MetadataError` for an inaccessible or failed metadata update, and
//! `LogicError` for operations that make no sense in the current state.

use std::time::Duration;
use thiserror::Error;

use crate::client::ClientError;

/// Taxonomy of controller errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ArgumentError,
    RuntimeError,
    MetadataError,
    LogicError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::ArgumentError => write!(f, "ArgumentError"),
            ErrorKind::RuntimeError => write!(f, "RuntimeError"),
            ErrorKind::MetadataError => write!(f, "MetadataError"),
            ErrorKind::LogicError => write!(f, "LogicError"),
        }
    }
}

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or out-of-range caller input
    #[error("{0}")]
    Argument(String),

    /// Precondition failure, quorum loss or server-side failure
    #[error("{0}")]
    Runtime(String),

    /// Metadata schema inaccessible or update failed
    #[error("{0}")]
    Metadata(String),

    /// Operation meaningless in the current state
    #[error("{0}")]
    Logic(String),

    /// Waiting for a member timed out
    #[error("Timeout after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// Server communication error
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Position of this error in the taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Argument(_) => ErrorKind::ArgumentError,
            Error::Metadata(_) | Error::Client(ClientError::Metadata { .. }) => {
                ErrorKind::MetadataError
            }
            Error::Logic(_) => ErrorKind::LogicError,
            Error::Runtime(_) | Error::Timeout { .. } | Error::Client(_) => {
                ErrorKind::RuntimeError
            }
            Error::Serialization(_) => ErrorKind::RuntimeError,
        }
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout { .. } => true,
            Error::Client(e) => e.is_retryable(),
            Error::Argument(_)
            | Error::Runtime(_)
            | Error::Metadata(_)
            | Error::Logic(_)
            | Error::Serialization(_) => false,
        }
    }
}

/// Result type alias for controller operations
pub type Result<T, E = Error> = std::result::Result<T, E>;
