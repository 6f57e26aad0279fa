//! Classification of sync errors into the three failure kinds callers act on.

use crate::adapters::StoreError;
use crate::SyncError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Remote sync error text for a ciphertext the server could not parse.
const INVALID_CIPHERTEXT_ERROR: &str = "payload.ciphertext is not a Base64 string";

/// A sync failure, classified by what the caller should do about it.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum SyncFailure {
    /// Credentials were rejected. Fresh credentials are needed.
    #[error("Authentication rejected: {0}")]
    Auth(String),

    /// Transient failure. The whole cycle may be retried later.
    #[error("Temporary failure, try later: {0}")]
    TryLater(String),

    /// Corrupted data, a stale main key or a protocol mismatch.
    #[error("Unrecoverable failure: {0}")]
    Unrecoverable(String),
}

impl SyncFailure {
    /// Map a sync error onto exactly one failure kind.
    pub fn classify(err: &SyncError) -> Self {
        let message = err.to_string();
        match err {
            SyncError::Remote(transport) => match transport.status {
                Some(401) => Self::Auth(message),
                _ => Self::TryLater(message),
            },
            SyncError::Store(StoreError::StaleRevision { .. } | StoreError::Unavailable(_)) => {
                Self::TryLater(message)
            }
            SyncError::Checkpoint(_) => Self::TryLater(message),
            SyncError::Rejected { errors, .. } => {
                if errors.iter().any(|e| e == INVALID_CIPHERTEXT_ERROR) {
                    Self::Unrecoverable(message)
                } else {
                    Self::TryLater(message)
                }
            }
            SyncError::UnresolvedConflicts { .. } => Self::TryLater(message),
            _ => Self::Unrecoverable(message),
        }
    }

    /// Only transient failures may be retried with the same inputs.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TryLater(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Auth(m) | Self::TryLater(m) | Self::Unrecoverable(m) => m,
        }
    }
}

impl From<SyncError> for SyncFailure {
    fn from(err: SyncError) -> Self {
        Self::classify(&err)
    }
}
