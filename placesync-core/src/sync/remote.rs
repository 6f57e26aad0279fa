//! Boundary to the remote collection-storage service.
//!
//! The engine never speaks HTTP itself. Embedders provide a [`RemoteClient`]
//! that hands out one [`RemoteCollection`] per collection name; each
//! collection keeps a local copy of the remote records, stages writes and
//! publishes them on `sync()`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Failure talking to the remote service.
///
/// `status` is the HTTP status when the server answered; `None` means the
/// request never completed (network error, timeout).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (status: {status:?})")]
pub struct TransportError {
    pub status: Option<u16>,
    pub message: String,
}

impl TransportError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(None, message)
    }
}

/// Connection parameters shared by every collection of one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSession {
    pub endpoint: String,
    pub bucket: String,
    pub headers: BTreeMap<String, String>,
}

impl RemoteSession {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// A record exactly as the remote collection stores it.
///
/// `payload` is the JSON text of an encrypted record for data collections,
/// or cleartext JSON for the `meta` and `crypto` control collections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<u64>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub payload: String,
}

impl WireRecord {
    pub fn new(id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            last_modified: None,
            deleted: false,
            payload: payload.into(),
        }
    }

    pub fn with_last_modified(mut self, last_modified: u64) -> Self {
        self.last_modified = Some(last_modified);
        self
    }
}

/// Local and remote versions of a record that were both changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireConflict {
    pub local: WireRecord,
    pub remote: WireRecord,
}

/// Result of one `sync()` round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub ok: bool,
    /// Records created, updated or deleted locally by the pull.
    pub pulled: usize,
    /// Staged writes the server accepted.
    pub pushed: usize,
    pub conflicts: Vec<WireConflict>,
    pub errors: Vec<String>,
}

impl SyncOutcome {
    pub fn ok() -> Self {
        Self {
            ok: true,
            ..Default::default()
        }
    }
}

/// One remote collection, with a local copy and staged writes.
#[async_trait]
pub trait RemoteCollection: Send + Sync {
    fn name(&self) -> &str;

    /// Publish staged writes, then pull remote changes into the local copy.
    async fn sync(&self) -> Result<SyncOutcome, TransportError>;

    /// All live records in the local copy, newest first.
    async fn list(&self) -> Result<Vec<WireRecord>, TransportError>;

    async fn get(&self, id: &str) -> Result<Option<WireRecord>, TransportError>;

    /// Stage a new record for the next sync.
    async fn create(&self, record: WireRecord) -> Result<(), TransportError>;

    /// Stage a replacement for an existing record.
    async fn update(&self, record: WireRecord) -> Result<(), TransportError>;

    /// Stage `resolution` as the winner of `conflict`; it overrides the
    /// remote version on the next sync.
    async fn resolve(
        &self,
        conflict: &WireConflict,
        resolution: WireRecord,
    ) -> Result<(), TransportError>;
}

/// Factory for remote collection handles.
pub trait RemoteClient: Send + Sync {
    fn collection(&self, session: &RemoteSession, name: &str) -> Arc<dyn RemoteCollection>;
}
