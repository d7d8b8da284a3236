//! Error types for Paperstack core.

use crate::document::SyncState;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A token failed sync-identifier validation.
    #[error("invalid identifier: {token:?}")]
    InvalidIdentifier {
        /// The rejected token.
        token: String,
    },

    /// Document not found in the local store.
    #[error("document not found: {sync_id}")]
    NotFound {
        /// The identifier that was looked up.
        sync_id: String,
    },

    /// Attachment not found on the given document.
    #[error("attachment not found: {file_name:?} on document {sync_id}")]
    AttachmentNotFound {
        /// Owning document identifier.
        sync_id: String,
        /// Attachment file name.
        file_name: String,
    },

    /// A uniqueness or data invariant would be violated.
    #[error("constraint violated: {message}")]
    Constraint {
        /// Description of the violated invariant.
        message: String,
    },

    /// An edge not present in the sync state machine was attempted.
    #[error("invalid sync state transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// Current state.
        from: SyncState,
        /// Attempted target state.
        to: SyncState,
    },

    /// SQLite backend error.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Creates an invalid identifier error.
    pub fn invalid_identifier(token: impl Into<String>) -> Self {
        Self::InvalidIdentifier {
            token: token.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(sync_id: impl Into<String>) -> Self {
        Self::NotFound {
            sync_id: sync_id.into(),
        }
    }

    /// Creates an attachment not-found error.
    pub fn attachment_not_found(sync_id: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self::AttachmentNotFound {
            sync_id: sync_id.into(),
            file_name: file_name.into(),
        }
    }

    /// Creates a constraint violation error.
    pub fn constraint(message: impl Into<String>) -> Self {
        Self::Constraint {
            message: message.into(),
        }
    }
}
