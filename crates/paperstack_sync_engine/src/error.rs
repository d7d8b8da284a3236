//! Error types for the sync engine.

use paperstack_core::{CoreError, SyncId};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Bad identifier or input; never retried, surfaced to the caller.
    #[error("validation failed: {message}")]
    Validation {
        /// What was wrong with the input.
        message: String,
    },

    /// Network-level failure; retried with backoff before surfacing.
    #[error("transient network error: {message}")]
    TransientNetwork {
        /// Error message from the transport.
        message: String,
    },

    /// A remote call exceeded its per-call timeout.
    #[error("remote call timed out")]
    Timeout,

    /// The remote rejected the operation for a non-version reason.
    #[error("remote rejected the operation: {message}")]
    RemoteRejected {
        /// Rejection detail from the remote.
        message: String,
    },

    /// Optimistic-concurrency failure: the assumed base version no longer
    /// matches the remote's current version. Routed to the conflict
    /// resolver, never silently dropped.
    #[error(
        "version conflict on {sync_id}: local version {local_version}, \
         remote version {remote_version}"
    )]
    VersionConflict {
        /// The conflicting document.
        sync_id: SyncId,
        /// Version the client assumed.
        local_version: i64,
        /// Version the remote currently holds.
        remote_version: i64,
    },

    /// The entitlement provider could not be consulted. Always resolved
    /// fail-safe to a denial; never blocks local operations.
    #[error("entitlement check failed: {message}")]
    EntitlementCheck {
        /// Provider failure detail.
        message: String,
    },

    /// The sync cycle was cancelled cooperatively.
    #[error("sync cancelled")]
    Cancelled,

    /// Local store failure; the transaction was rolled back.
    #[error("store error: {0}")]
    Store(#[from] CoreError),
}

impl SyncError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a transient network error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientNetwork {
            message: message.into(),
        }
    }

    /// Creates a remote rejection error.
    pub fn remote_rejected(message: impl Into<String>) -> Self {
        Self::RemoteRejected {
            message: message.into(),
        }
    }

    /// Creates an entitlement check error.
    pub fn entitlement_check(message: impl Into<String>) -> Self {
        Self::EntitlementCheck {
            message: message.into(),
        }
    }

    /// Returns true if this error is eligible for backoff retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientNetwork { .. } | SyncError::Timeout)
    }
}
