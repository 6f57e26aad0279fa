//! Per-collection conflict resolution.

use crate::sync::models::DecodedConflict;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which side wins when the remote reports a conflict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Accept the remote record.
    #[default]
    RemoteWins,
    /// Re-push the local record.
    LocalWins,
}

impl ConflictPolicy {
    /// Pick the winning payload of a conflict.
    ///
    /// A local tombstone never beats a live remote record under
    /// `RemoteWins`; under `LocalWins` the local side is kept as-is,
    /// deletions included.
    pub fn resolve(&self, conflict: &DecodedConflict) -> Value {
        match self {
            Self::RemoteWins => conflict.remote.payload.clone(),
            Self::LocalWins => conflict.local.payload.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::RemoteRecord;
    use serde_json::json;

    fn conflict(local: Value, remote: Value) -> DecodedConflict {
        DecodedConflict {
            collection: "history".to_string(),
            local: RemoteRecord::new("abcdefghijkl", local),
            remote: RemoteRecord::new("abcdefghijkl", remote),
        }
    }

    #[test]
    fn default_is_remote_wins() {
        assert_eq!(ConflictPolicy::default(), ConflictPolicy::RemoteWins);
    }

    #[test]
    fn remote_wins_returns_remote_payload() {
        let c = conflict(json!({"title": "local"}), json!({"title": "remote"}));
        assert_eq!(ConflictPolicy::RemoteWins.resolve(&c), json!({"title": "remote"}));
    }

    #[test]
    fn local_wins_returns_local_payload() {
        let c = conflict(json!({"title": "local"}), json!({"title": "remote"}));
        assert_eq!(ConflictPolicy::LocalWins.resolve(&c), json!({"title": "local"}));
    }

    #[test]
    fn local_wins_keeps_local_tombstone() {
        let c = conflict(
            json!({"id": "abcdefghijkl", "deleted": true}),
            json!({"title": "remote"}),
        );
        assert_eq!(ConflictPolicy::LocalWins.resolve(&c)["deleted"], true);
    }

    #[test]
    fn parses_kebab_case() {
        let policy: ConflictPolicy = serde_json::from_str("\"local-wins\"").unwrap();
        assert_eq!(policy, ConflictPolicy::LocalWins);
    }
}
