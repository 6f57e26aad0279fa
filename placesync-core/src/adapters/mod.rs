//! Reconciliation adapters: merge decrypted remote records into a local
//! store and report local changes to push back.
//!
//! - `merge`: the shared pull/merge/push driver, generic over a record kind
//! - `history`: places keyed by URL, visits unioned
//! - `bookmarks`: bookmarks keyed by URL, folders and separators by id
//! - `memory`: an in-memory local store with revision tokens

pub mod bookmarks;
pub mod history;
pub mod memory;
pub mod merge;

pub use bookmarks::{Bookmark, BookmarkKind, BookmarksAdapter};
pub use history::{HistoryAdapter, Place};
pub use memory::MemoryStore;
pub use merge::{MergeAdapter, RecordKind};

use crate::sync::handle::CollectionHandle;
use crate::sync::models::DecodedConflict;
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Per-collection merge logic driven by the engine.
#[async_trait]
pub trait ReconciliationAdapter: Send + Sync {
    /// Merge remote records newer than the checkpoint into the local store.
    ///
    /// Returns whether local changes are waiting to be pushed.
    async fn update(&self, handle: &CollectionHandle) -> Result<bool>;

    /// Local changes to push, built from the store's current state.
    async fn local_changes(&self, handle: &CollectionHandle) -> Result<Vec<LocalChange>>;

    /// Record the remote ids assigned to pushed changes.
    async fn acknowledge(&self, handle: &CollectionHandle, acks: &[PushAck]) -> Result<()>;

    /// Pick the payload that wins a remote-reported conflict.
    async fn handle_conflict(&self, conflict: &DecodedConflict) -> Result<Value>;
}

/// A local change to publish.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalChange {
    /// Create (no remote id yet) or replace a remote record.
    Upsert {
        local_key: String,
        remote_id: Option<String>,
        payload: Value,
    },
    /// Replace a synced record with a tombstone.
    Delete { local_key: String, remote_id: String },
}

/// The engine's receipt for one pushed change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushAck {
    pub local_key: String,
    pub remote_id: String,
    pub deleted: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Stale revision: expected {expected}, store is at {actual}")]
    StaleRevision { expected: String, actual: String },

    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// One entry of a store's change log, collapsed to the latest state per key.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange<R> {
    Put { key: String, record: R },
    Remove { key: String },
}

impl<R> StoreChange<R> {
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Remove { key } => key,
        }
    }
}

/// Local persistent store for one record type.
///
/// Every write bumps an opaque revision token; `put` and `add` only succeed
/// when the caller's `expected_revision` is still current.
#[async_trait]
pub trait LocalStore<R>: Send + Sync
where
    R: Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> std::result::Result<Option<R>, StoreError>;

    /// Insert or replace `key`; returns the new revision.
    async fn put(
        &self,
        record: R,
        key: &str,
        expected_revision: &str,
    ) -> std::result::Result<String, StoreError>;

    /// Insert a new `key`; returns the new revision.
    async fn add(
        &self,
        record: R,
        key: &str,
        expected_revision: &str,
    ) -> std::result::Result<String, StoreError>;

    /// Remove `key`; returns whether it existed.
    async fn remove(&self, key: &str) -> std::result::Result<bool, StoreError>;

    async fn revision(&self) -> std::result::Result<String, StoreError>;

    /// Changes after `revision`, or every record when `None` or unknown.
    async fn changes_since(
        &self,
        revision: Option<&str>,
    ) -> std::result::Result<Vec<StoreChange<R>>, StoreError>;
}
