//! Error types for the sync engine.

use std::path::PathBuf;
use suitcase_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur during download, upload or reset.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A request exceeded its timeout.
    #[error("operation timed out")]
    Timeout,

    /// Server answered with a 5xx status.
    #[error("server error: {0}")]
    ServerError(String),

    /// Credentials were rejected.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// App, table or resource does not exist on the server.
    #[error("not found: {0}")]
    NotFound(String),

    /// Server schema is malformed, or a local file does not match it.
    #[error("schema error: {0}")]
    Schema(String),

    /// Server payload could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Supplied data version does not match the server's current version.
    #[error("data version conflict: supplied {supplied}, server is at {server}")]
    VersionConflict {
        /// Version supplied by the caller.
        supplied: String,
        /// Version reported by the server.
        server: String,
    },

    /// Upload or reset was requested without a data version.
    #[error("a data version is required for upload and reset")]
    MissingVersion,

    /// Server rejected a write because the table changed underneath it.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A single attachment could not be transferred.
    #[error("attachment {file_name}: {message}")]
    Attachment {
        /// File name from the manifest.
        file_name: String,
        /// Error message.
        message: String,
    },

    /// Local file system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV read or write error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Destination exists and overwriting was not requested.
    #[error("output already exists: {0} (use force to overwrite)")]
    OutputExists(PathBuf),

    /// Caller supplied invalid parameters.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Run was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Invalid state transition.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates an attachment error.
    pub fn attachment(file_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Attachment {
            file_name: file_name.into(),
            message: message.into(),
        }
    }

    /// Maps a non-success HTTP status to an error.
    ///
    /// 429 and 5xx are transient; every other 4xx is fatal.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        let message = if body.is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {body}")
        };
        match status {
            401 | 403 => SyncError::AuthenticationFailed(message),
            404 => SyncError::NotFound(message),
            409 | 412 => SyncError::Conflict(message),
            429 => SyncError::transport_retryable(message),
            500..=599 => SyncError::ServerError(message),
            _ => SyncError::transport_fatal(message),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::ServerError(_) => true,
            _ => false,
        }
    }

    /// Returns true if this error must abort the whole run even when it
    /// occurs while handling a single row or attachment.
    pub fn aborts_run(&self) -> bool {
        matches!(
            self,
            SyncError::AuthenticationFailed(_)
                | SyncError::VersionConflict { .. }
                | SyncError::MissingVersion
                | SyncError::Conflict(_)
                | SyncError::Cancelled
        )
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Json(e) => SyncError::Protocol(e.to_string()),
            ProtocolError::InvalidStructure(msg) => SyncError::Schema(msg),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout
        } else if err.is_decode() {
            SyncError::Protocol(err.to_string())
        } else if let Some(status) = err.status() {
            SyncError::from_status(status.as_u16(), String::new())
        } else if err.is_builder() {
            SyncError::transport_fatal(err.to_string())
        } else {
            SyncError::transport_retryable(err.to_string())
        }
    }
}
