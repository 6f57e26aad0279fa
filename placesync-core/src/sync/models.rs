//! Sync data models: decoded records, conflicts and per-cycle reports.

use crate::sync::error::SyncFailure;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A remote record after its payload was decrypted and parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<u64>,
    #[serde(default)]
    pub deleted: bool,
    pub payload: Value,
}

impl RemoteRecord {
    pub fn new(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            last_modified: None,
            deleted: false,
            payload,
        }
    }

    /// Whether this record signals a deletion, either as a server-side
    /// deletion or as a payload carrying `deleted: true`.
    pub fn is_tombstone(&self) -> bool {
        self.deleted
            || self
                .payload
                .get("deleted")
                .and_then(Value::as_bool)
                .unwrap_or(false)
    }
}

/// A conflict with both sides decoded, handed to the adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedConflict {
    pub collection: String,
    pub local: RemoteRecord,
    pub remote: RemoteRecord,
}

/// Counters for one collection's successful cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSummary {
    pub pulled: usize,
    pub pushed: usize,
    pub conflicts_resolved: usize,
}

/// Outcome of one collection within a `sync_now` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStatus {
    pub collection: String,
    pub result: Result<CollectionSummary, SyncFailure>,
}

/// Aggregate result of a `sync_now` call, one status per registered
/// collection in registration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub collections: Vec<CollectionStatus>,
}

impl SyncReport {
    pub fn all_succeeded(&self) -> bool {
        self.collections.iter().all(|s| s.result.is_ok())
    }

    pub fn get(&self, collection: &str) -> Option<&CollectionStatus> {
        self.collections.iter().find(|s| s.collection == collection)
    }

    /// The first failure in registration order.
    pub fn first_failure(&self) -> Option<&SyncFailure> {
        self.collections
            .iter()
            .find_map(|s| s.result.as_ref().err())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &SyncFailure)> {
        self.collections
            .iter()
            .filter_map(|s| s.result.as_ref().err().map(|f| (s.collection.as_str(), f)))
    }
}
