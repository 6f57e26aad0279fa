//! Places Sync Core Library
//!
//! This library synchronizes browsing history and bookmarks with an
//! encrypted remote record collection: key derivation and record crypto,
//! the collection sync protocol, and the per-collection merge adapters.

pub mod adapters;
pub mod crypto;
pub mod sync;

pub use adapters::{
    BookmarksAdapter, HistoryAdapter, LocalChange, LocalStore, MemoryStore, PushAck,
    ReconciliationAdapter, StoreError,
};
pub use crypto::{BulkKeys, CryptoError, EncryptedRecord, KeyBundle, RecordCrypto};
pub use sync::{
    CheckpointStore, CollectionEngine, CollectionHandle, ConflictPolicy, CredentialBundle,
    EngineConfig, EngineState, SyncFailure, SyncManager, SyncReport, SyncState,
    SyncStateMachine,
};

use sync::checkpoint::CheckpointError;
use sync::remote::TransportError;
use thiserror::Error;

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// General error type for sync operations.
///
/// Every variant is mapped onto exactly one [`SyncFailure`] kind before it
/// leaves the engine.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Local store error: {0}")]
    Store(#[from] StoreError),

    #[error("Remote error: {0}")]
    Remote(#[from] TransportError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Incompatible storage version or storage version not recognized (found {found:?}, expected {expected})")]
    StorageVersionMismatch { found: Option<i64>, expected: i64 },

    #[error("Missing control record: {0}")]
    MissingControlRecord(String),

    #[error("Invalid record id: {0}")]
    InvalidRecordId(String),

    #[error("Inconsistent records: {0}")]
    InconsistentRecords(String),

    #[error("Sync of {collection} was not ok: {errors:?}")]
    Rejected {
        collection: String,
        errors: Vec<String>,
    },

    #[error("{count} conflicts in {collection} remain after resolution")]
    UnresolvedConflicts { collection: String, count: usize },

    #[error("Engine is not connected")]
    NotConnected,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Collection task failed: {0}")]
    Task(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
