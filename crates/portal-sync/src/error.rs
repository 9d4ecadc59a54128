// File: portal-sync/src/error.rs
// Purpose: Error taxonomy for queueing, syncing, undo and rate limiting

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::remote::RemoteRecord;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors surfaced by the sync subsystem
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network or server failure; retried with backoff inside the engine
    #[error("transient failure: {0}")]
    Transient(String),

    /// The backing store changed underneath a queued write
    #[error("version conflict on {entity_type}:{entity_id}")]
    VersionConflict {
        entity_type: String,
        entity_id: String,
    },

    /// Rejected before enqueue, never queued
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rate limit exceeded for '{key}', retry in {reset_in:?}")]
    RateLimitExceeded { key: String, reset_in: Duration },

    #[error("undo window expired for action {0}")]
    UndoExpired(Uuid),

    #[error("action {0} was already undone")]
    UndoAlreadyConsumed(Uuid),

    #[error("action not found: {0}")]
    ActionNotFound(Uuid),

    #[error("queue item not found: {0}")]
    ItemNotFound(Uuid),

    #[error("queue item {0} has no open conflict")]
    NoConflict(Uuid),

    /// A resolution map that does not cover the whole conflict set
    #[error("resolution covers {provided} of {expected} conflicts")]
    PartialResolution { expected: usize, provided: usize },

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether the engine should retry the failed operation on its own
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }
}

/// Failures reported by the backing store
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// The conditional write's expectation did not hold
    #[error("version mismatch")]
    VersionMismatch { current: Option<RemoteRecord> },

    #[error("transient remote failure: {0}")]
    Transient(String),

    /// Permanent refusal (e.g. server-side validation); not retried automatically
    #[error("write rejected: {0}")]
    Rejected(String),
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::VersionMismatch { current } => SyncError::VersionConflict {
                entity_type: current
                    .as_ref()
                    .map(|r| r.entity_type.clone())
                    .unwrap_or_default(),
                entity_id: current.map(|r| r.entity_id).unwrap_or_default(),
            },
            RemoteError::Transient(msg) => SyncError::Transient(msg),
            RemoteError::Rejected(msg) => SyncError::Validation(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::Transient("timeout".into()).is_transient());
        assert!(!SyncError::Validation("bad".into()).is_transient());
    }

    #[test]
    fn test_rate_limit_message_reports_reset() {
        let err = SyncError::RateLimitExceeded {
            key: "login".into(),
            reset_in: Duration::from_secs(60),
        };
        assert_eq!(err.to_string(), "rate limit exceeded for 'login', retry in 60s");
    }

    #[test]
    fn test_remote_error_conversion() {
        let err: SyncError = RemoteError::Transient("503".into()).into();
        assert!(err.is_transient());

        let err: SyncError = RemoteError::Rejected("grade out of range".into()).into();
        assert!(matches!(err, SyncError::Validation(_)));
    }
}
