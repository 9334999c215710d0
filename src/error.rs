//! Failure taxonomy for the sync pipeline.
//!
//! Every adapter, the reconciler, and the repository report failures as a
//! [`SyncError`]. The worker pools only need [`SyncError::is_retryable`] to
//! decide between scheduling another attempt and settling the job as failed.
//!
//! | Variant | Origin | Retried |
//! |---------|--------|---------|
//! | `Config` | unknown source type, malformed URL, missing credentials | no |
//! | `Fetch` | network / upstream API failure | yes |
//! | `Content` | upstream returned nothing usable (e.g. no transcript) | no |
//! | `Upsert` | content reconciler failed to store the page | yes |
//! | `Storage` | SQLite failure in the repository or queue | yes |
//! | `InsufficientCredits` | reconciler could not bill the stored page | no, the item is released |
//! | `NotFound` | trigger referenced an unknown group or item | no |

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("content error: {0}")]
    Content(String),

    #[error("upsert failed: {0}")]
    Upsert(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("insufficient credits for user {0}")]
    InsufficientCredits(String),

    #[error("not found: {0}")]
    NotFound(String),
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub fn config(msg: impl Into<String>) -> Self {
        SyncError::Config(msg.into())
    }

    pub fn fetch(msg: impl Into<String>) -> Self {
        SyncError::Fetch(msg.into())
    }

    pub fn content(msg: impl Into<String>) -> Self {
        SyncError::Content(msg.into())
    }

    /// Whether the queue should schedule another attempt for this failure.
    ///
    /// Configuration and content errors are deterministic: retrying them
    /// only burns attempts, so the job is settled on the first occurrence.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Fetch(_) | SyncError::Upsert(_) | SyncError::Storage(_)
        )
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Fetch(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Storage(format!("malformed payload: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(!SyncError::config("bad url").is_retryable());
        assert!(!SyncError::content("no transcript").is_retryable());
        assert!(SyncError::fetch("timeout").is_retryable());
        assert!(SyncError::Upsert("locked".into()).is_retryable());
        assert!(SyncError::Storage("busy".into()).is_retryable());
    }

    #[test]
    fn test_credit_exhaustion_is_not_retried() {
        let err = SyncError::InsufficientCredits("u1".into());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "insufficient credits for user u1");
    }

    #[test]
    fn test_upsert_distinct_from_fetch() {
        let upsert = SyncError::Upsert("disk full".into()).to_string();
        let fetch = SyncError::fetch("disk full").to_string();
        assert_ne!(upsert, fetch);
        assert!(upsert.starts_with("upsert failed"));
    }
}
