//! History: places keyed by URL.

use crate::adapters::merge::{check_remote_id, MergeAdapter, RecordKind};
use crate::sync::models::RemoteRecord;
use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Visit type written for locally recorded visits (a followed link).
const LINK_VISIT: u32 = 1;

/// A visited URL as the local places store keeps it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Place {
    pub url: String,
    #[serde(default)]
    pub title: String,
    /// Visit times in milliseconds, newest first, without duplicates.
    #[serde(default)]
    pub visits: Vec<u64>,
    #[serde(rename = "fxsyncId", default, skip_serializing_if = "Option::is_none")]
    pub fxsync_id: Option<String>,
}

impl Place {
    pub fn new(url: impl Into<String>, title: impl Into<String>, visits: Vec<u64>) -> Self {
        let mut place = Self {
            url: url.into(),
            title: title.into(),
            visits,
            fxsync_id: None,
        };
        normalize_visits(&mut place.visits);
        place
    }

    pub fn newest_visit(&self) -> Option<u64> {
        self.visits.first().copied()
    }
}

fn normalize_visits(visits: &mut Vec<u64>) {
    visits.sort_unstable_by(|a, b| b.cmp(a));
    visits.dedup();
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryPayload {
    #[serde(default)]
    hist_uri: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    visits: Vec<Visit>,
}

#[derive(Debug, Deserialize)]
struct Visit {
    /// Microseconds since the epoch.
    date: u64,
}

/// Record kind of the `history` collection.
pub struct History;

impl RecordKind for History {
    type Local = Place;

    const COLLECTION: &'static str = "history";

    fn from_remote(record: &RemoteRecord) -> Option<(String, Place)> {
        let payload: HistoryPayload = serde_json::from_value(record.payload.clone()).ok()?;
        if payload.hist_uri.is_empty() || payload.visits.is_empty() {
            return None;
        }

        let mut visits: Vec<u64> = payload.visits.iter().map(|v| v.date / 1000).collect();
        normalize_visits(&mut visits);
        let place = Place {
            url: payload.hist_uri.clone(),
            title: payload.title.unwrap_or_default(),
            visits,
            fxsync_id: Some(record.id.clone()),
        };
        Some((payload.hist_uri, place))
    }

    fn merge(mut existing: Place, incoming: Place) -> Result<Place> {
        if existing.url != incoming.url {
            return Err(SyncError::InconsistentRecords(format!(
                "place {} cannot merge a record for {}",
                existing.url, incoming.url
            )));
        }
        check_remote_id(
            Self::COLLECTION,
            &existing.url,
            existing.fxsync_id.as_deref(),
            incoming.fxsync_id.as_deref(),
        )?;
        if existing.fxsync_id.is_none() {
            existing.fxsync_id = incoming.fxsync_id.clone();
        }

        if existing.visits.is_empty() {
            if !incoming.title.is_empty() {
                existing.title = incoming.title;
            }
        } else if incoming.newest_visit() >= existing.newest_visit() {
            existing.title = incoming.title;
        }

        existing.visits.extend(incoming.visits);
        normalize_visits(&mut existing.visits);
        Ok(existing)
    }

    fn to_payload(place: &Place, remote_id: Option<&str>) -> Value {
        let visits: Vec<Value> = place
            .visits
            .iter()
            .map(|ms| json!({ "date": ms.saturating_mul(1000), "type": LINK_VISIT }))
            .collect();
        let mut payload = json!({
            "histUri": place.url,
            "title": place.title,
            "visits": visits,
        });
        if let (Some(id), Some(obj)) = (remote_id, payload.as_object_mut()) {
            obj.insert("id".to_string(), json!(id));
        }
        payload
    }

    fn remote_id(place: &Place) -> Option<&str> {
        place.fxsync_id.as_deref()
    }

    fn set_remote_id(place: &mut Place, remote_id: Option<String>) {
        place.fxsync_id = remote_id;
    }
}

/// Merges the `history` collection into a places store.
pub type HistoryAdapter = MergeAdapter<History>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::test_support::{self, ACCOUNT};
    use crate::adapters::{
        LocalChange, LocalStore, MemoryStore, PushAck, ReconciliationAdapter, StoreError,
    };
    use crate::sync::checkpoint::{Checkpoint, CheckpointStore, MemoryCheckpointStore};
    use crate::sync::config::EngineConfig;
    use crate::sync::memory::MemoryRemote;
    use std::sync::Arc;

    fn history_payload(i: u64, base: u64) -> Value {
        json!({
            "id": format!("UNIQUE_ID_{:02}", i),
            "histUri": format!("http://example{}.com/", i),
            "title": format!("Example {} Title", i),
            "visits": [{ "date": (base + i * 10) * 1000, "type": 3 }],
        })
    }

    struct Fixture {
        remote: MemoryRemote,
        crypto: Arc<crate::crypto::RecordCrypto>,
        store: Arc<MemoryStore<Place>>,
        checkpoints: Arc<MemoryCheckpointStore>,
        adapter: HistoryAdapter,
    }

    impl Fixture {
        fn new(config: EngineConfig) -> Self {
            let store: Arc<MemoryStore<Place>> = Arc::new(MemoryStore::new());
            let checkpoints = Arc::new(MemoryCheckpointStore::new());
            let adapter = HistoryAdapter::new(store.clone(), checkpoints.clone(), &config);
            Self {
                remote: MemoryRemote::new(),
                crypto: test_support::crypto(),
                store,
                checkpoints,
                adapter,
            }
        }

        fn read_only() -> Self {
            Self::new(EngineConfig::default())
        }

        fn seed_range(&self, first: u64, count: u64, base: u64) {
            for i in first..first + count {
                test_support::seed(
                    &self.remote,
                    &self.crypto,
                    "history",
                    &format!("UNIQUE_ID_{:02}", i),
                    history_payload(i, base),
                    base + i * 10,
                );
            }
        }

        async fn pull(&self) -> bool {
            let handle = test_support::handle(&self.remote, "history", &self.crypto);
            handle.sync().await.unwrap();
            self.adapter.update(&handle).await.unwrap()
        }

        fn mtime(&self) -> u64 {
            Checkpoint::new(self.checkpoints.as_ref(), ACCOUNT, "history")
                .mtime()
                .unwrap()
        }
    }

    #[test]
    fn merge_unions_visits_and_takes_newer_title() {
        let mut local = Place::new(
            "http://www.mozilla.org/en-US/",
            "",
            vec![1_501_000_000_000, 1_502_000_000_000],
        );
        local.fxsync_id = None;
        let mut remote = Place::new(
            "http://www.mozilla.org/en-US/",
            "Mozilla",
            vec![1_502_000_000_000, 1_503_000_000_000],
        );
        remote.fxsync_id = Some("XXXXX_ID_XXX".to_string());

        let merged = History::merge(local, remote).unwrap();
        assert_eq!(merged.title, "Mozilla");
        assert_eq!(merged.fxsync_id.as_deref(), Some("XXXXX_ID_XXX"));
        assert_eq!(
            merged.visits,
            vec![1_503_000_000_000, 1_502_000_000_000, 1_501_000_000_000]
        );
    }

    #[test]
    fn merge_keeps_title_when_remote_is_older() {
        let local = Place::new("http://a.example/", "Local", vec![2000]);
        let remote = Place::new("http://a.example/", "Remote", vec![1000]);
        let merged = History::merge(local, remote).unwrap();
        assert_eq!(merged.title, "Local");
        assert_eq!(merged.visits, vec![2000, 1000]);
    }

    #[test]
    fn merge_without_local_visits_ignores_empty_remote_title() {
        let local = Place::new("http://a.example/", "Local", vec![]);
        let remote = Place::new("http://a.example/", "", vec![1000]);
        assert_eq!(History::merge(local, remote).unwrap().title, "Local");
    }

    #[test]
    fn merge_rejects_inconsistent_records() {
        let a = Place::new("http://a.example/", "", vec![1]);
        let b = Place::new("http://b.example/", "", vec![1]);
        assert!(matches!(
            History::merge(a, b),
            Err(SyncError::InconsistentRecords(_))
        ));

        let mut a = Place::new("http://a.example/", "", vec![1]);
        a.fxsync_id = Some("AAAAAAAAAAAA".to_string());
        let mut b = Place::new("http://a.example/", "", vec![1]);
        b.fxsync_id = Some("BBBBBBBBBBBB".to_string());
        assert!(matches!(
            History::merge(a, b),
            Err(SyncError::InconsistentRecords(_))
        ));
    }

    #[test]
    fn from_remote_converts_visit_dates() {
        let record = RemoteRecord::new(
            "_9sCUbahs0ay",
            json!({
                "id": "_9sCUbahs0ay",
                "histUri": "https://developer.mozilla.org/",
                "title": "MDN",
                "visits": [
                    { "date": 1_439_366_063_808_983u64, "type": 1 },
                    { "date": 1_439_366_063_809_999u64, "type": 1 },
                    { "date": 1_439_366_063_900_000u64, "type": 1 }
                ]
            }),
        );
        let (key, place) = History::from_remote(&record).unwrap();
        assert_eq!(key, "https://developer.mozilla.org/");
        assert_eq!(place.visits, vec![1_439_366_063_900, 1_439_366_063_809, 1_439_366_063_808]);
        assert_eq!(place.fxsync_id.as_deref(), Some("_9sCUbahs0ay"));
    }

    #[test]
    fn from_remote_skips_unusable_payloads() {
        let no_uri = RemoteRecord::new("a", json!({ "visits": [{ "date": 1, "type": 1 }] }));
        let no_visits = RemoteRecord::new("b", json!({ "histUri": "http://a.example/", "visits": [] }));
        assert!(History::from_remote(&no_uri).is_none());
        assert!(History::from_remote(&no_visits).is_none());
    }

    #[test]
    fn payload_carries_microsecond_visits() {
        let place = Place::new("http://a.example/", "A", vec![5, 7]);
        let payload = History::to_payload(&place, Some("AAAAAAAAAAAA"));
        assert_eq!(payload["id"], "AAAAAAAAAAAA");
        assert_eq!(payload["histUri"], "http://a.example/");
        assert_eq!(payload["visits"][0], json!({ "date": 7000, "type": 1 }));
        assert!(History::to_payload(&place, None).get("id").is_none());
    }

    #[test]
    fn payload_saturates_corrupt_visit_dates() {
        let place = Place::new("http://a.example/", "A", vec![u64::MAX, 7]);
        let payload = History::to_payload(&place, None);
        assert_eq!(payload["visits"][0]["date"], u64::MAX);
        assert_eq!(payload["visits"][1]["date"], 7000);
    }

    #[tokio::test]
    async fn update_with_empty_collection_changes_nothing() {
        let fx = Fixture::read_only();
        assert!(!fx.pull().await);
        assert_eq!(fx.mtime(), 0);
        assert!(fx.store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn update_applies_new_records() {
        let fx = Fixture::read_only();
        fx.seed_range(1, 5, 1_440_000_000);

        assert!(!fx.pull().await);
        assert_eq!(fx.mtime(), 1_440_000_050);
        assert_eq!(fx.store.len().unwrap(), 5);

        let place = fx.store.get("http://example5.com/").await.unwrap().unwrap();
        assert_eq!(place.title, "Example 5 Title");
        assert_eq!(place.visits, vec![1_440_000_050]);
        assert_eq!(place.fxsync_id.as_deref(), Some("UNIQUE_ID_05"));

        let checkpoint = Checkpoint::new(fx.checkpoints.as_ref(), ACCOUNT, "history");
        assert_eq!(
            checkpoint.local_key("UNIQUE_ID_03").unwrap().as_deref(),
            Some("http://example3.com/")
        );
    }

    #[tokio::test]
    async fn mtime_only_moves_forward() {
        let fx = Fixture::read_only();
        fx.seed_range(1, 5, 100);
        fx.pull().await;
        assert_eq!(fx.mtime(), 150);

        fx.seed_range(6, 5, 500);
        fx.pull().await;
        assert_eq!(fx.mtime(), 600);
        assert_eq!(fx.store.len().unwrap(), 10);

        // Nothing newer: the checkpoint stays put.
        fx.pull().await;
        assert_eq!(fx.mtime(), 600);
    }

    #[tokio::test]
    async fn replaying_an_update_is_idempotent() {
        let fx = Fixture::read_only();
        fx.seed_range(1, 3, 1_440_000_000);
        fx.pull().await;
        let first = fx.store.snapshot().unwrap();

        // Forget the high-water mark and merge the same records again.
        fx.checkpoints.remove(&format!("{}::history::mtime", ACCOUNT)).unwrap();
        fx.pull().await;
        assert_eq!(fx.store.snapshot().unwrap(), first);
    }

    #[tokio::test]
    async fn tombstone_removes_mapped_place() {
        let fx = Fixture::read_only();
        fx.seed_range(1, 3, 1_440_000_000);
        fx.pull().await;

        test_support::seed(
            &fx.remote,
            &fx.crypto,
            "history",
            "UNIQUE_ID_02",
            json!({ "id": "UNIQUE_ID_02", "deleted": true }),
            1_440_000_100,
        );
        test_support::seed(
            &fx.remote,
            &fx.crypto,
            "history",
            "NEVER_SEEN_1",
            json!({ "id": "NEVER_SEEN_1", "deleted": true }),
            1_440_000_110,
        );
        fx.pull().await;

        assert!(fx.store.get("http://example2.com/").await.unwrap().is_none());
        assert_eq!(fx.store.len().unwrap(), 2);
        assert_eq!(fx.mtime(), 1_440_000_110);
        let checkpoint = Checkpoint::new(fx.checkpoints.as_ref(), ACCOUNT, "history");
        assert_eq!(checkpoint.local_key("UNIQUE_ID_02").unwrap(), None);
    }

    #[tokio::test]
    async fn unusable_records_are_skipped() {
        let fx = Fixture::read_only();
        fx.seed_range(1, 2, 1_440_000_000);
        test_support::seed(
            &fx.remote,
            &fx.crypto,
            "history",
            "NO_VISITS_01",
            json!({ "id": "NO_VISITS_01", "histUri": "http://empty.example/", "visits": [] }),
            1_440_000_090,
        );
        fx.pull().await;

        assert_eq!(fx.store.len().unwrap(), 2);
        assert!(fx.store.get("http://empty.example/").await.unwrap().is_none());
        assert_eq!(fx.mtime(), 1_440_000_090);
    }

    #[tokio::test]
    async fn only_unusable_records_leave_checkpoint_alone() {
        let fx = Fixture::read_only();
        test_support::seed(
            &fx.remote,
            &fx.crypto,
            "history",
            "NO_VISITS_01",
            json!({ "id": "NO_VISITS_01", "histUri": "http://empty.example/", "visits": [] }),
            1_440_000_090,
        );
        fx.pull().await;
        assert_eq!(fx.mtime(), 0);
    }

    #[tokio::test]
    async fn inconsistent_local_record_fails_update() {
        let fx = Fixture::read_only();
        let mut local = Place::new("http://example1.com/", "Mine", vec![1]);
        local.fxsync_id = Some("OTHER_ID_001".to_string());
        fx.store.insert("http://example1.com/", local).unwrap();
        fx.seed_range(1, 1, 1_440_000_000);

        let handle = test_support::handle(&fx.remote, "history", &fx.crypto);
        handle.sync().await.unwrap();
        assert!(matches!(
            fx.adapter.update(&handle).await,
            Err(SyncError::InconsistentRecords(_))
        ));
        assert_eq!(fx.mtime(), 0);
    }

    #[tokio::test]
    async fn stale_revisions_are_retried() {
        let fx = Fixture::read_only();
        fx.seed_range(1, 1, 1_440_000_000);
        fx.store.interfere_with_next_writes(2).unwrap();

        fx.pull().await;
        assert_eq!(fx.store.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn persistent_staleness_gives_up() {
        let fx = Fixture::read_only();
        fx.seed_range(1, 1, 1_440_000_000);
        fx.store.interfere_with_next_writes(3).unwrap();

        let handle = test_support::handle(&fx.remote, "history", &fx.crypto);
        handle.sync().await.unwrap();
        assert!(matches!(
            fx.adapter.update(&handle).await,
            Err(SyncError::Store(StoreError::StaleRevision { .. }))
        ));
    }

    #[tokio::test]
    async fn read_only_never_reports_local_changes() {
        let fx = Fixture::read_only();
        fx.store
            .insert("http://local.example/", Place::new("http://local.example/", "L", vec![1]))
            .unwrap();

        let handle = test_support::handle(&fx.remote, "history", &fx.crypto);
        handle.sync().await.unwrap();
        assert!(!fx.adapter.update(&handle).await.unwrap());
        assert!(fx.adapter.local_changes(&handle).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_write_reports_and_acknowledges_local_changes() {
        let fx = Fixture::new(EngineConfig {
            read_only: false,
            ..EngineConfig::default()
        });
        fx.seed_range(1, 1, 1_440_000_000);
        let handle = test_support::handle(&fx.remote, "history", &fx.crypto);
        handle.sync().await.unwrap();
        fx.adapter.update(&handle).await.unwrap();

        // A user visit on a synced place and a brand new one.
        let mut synced = fx.store.get("http://example1.com/").await.unwrap().unwrap();
        synced.visits.insert(0, 1_440_000_999);
        fx.store.insert("http://example1.com/", synced).unwrap();
        fx.store
            .insert("http://new.example/", Place::new("http://new.example/", "New", vec![42]))
            .unwrap();

        assert!(fx.adapter.update(&handle).await.unwrap());
        let changes = fx.adapter.local_changes(&handle).await.unwrap();
        assert_eq!(changes.len(), 2);

        let mut acks = Vec::new();
        for change in changes {
            match change {
                LocalChange::Upsert {
                    local_key,
                    remote_id: Some(remote_id),
                    payload,
                } => {
                    assert_eq!(local_key, "http://example1.com/");
                    assert_eq!(remote_id, "UNIQUE_ID_01");
                    assert_eq!(payload["visits"][0]["date"], 1_440_000_999_000u64);
                    handle.update(&remote_id, payload).await.unwrap();
                    acks.push(PushAck {
                        local_key,
                        remote_id,
                        deleted: false,
                    });
                }
                LocalChange::Upsert {
                    local_key,
                    remote_id: None,
                    payload,
                } => {
                    assert_eq!(local_key, "http://new.example/");
                    let remote_id = handle.create(payload, None).await.unwrap();
                    acks.push(PushAck {
                        local_key,
                        remote_id,
                        deleted: false,
                    });
                }
                other => panic!("unexpected change {:?}", other),
            }
        }
        fx.adapter.acknowledge(&handle, &acks).await.unwrap();

        let created = fx.store.get("http://new.example/").await.unwrap().unwrap();
        let created_id = created.fxsync_id.unwrap();
        assert_eq!(created_id.len(), 12);
        let checkpoint = Checkpoint::new(fx.checkpoints.as_ref(), ACCOUNT, "history");
        assert_eq!(
            checkpoint.local_key(&created_id).unwrap().as_deref(),
            Some("http://new.example/")
        );

        // Our own writes are not local changes.
        assert!(!fx.adapter.update(&handle).await.unwrap());
    }

    #[tokio::test]
    async fn read_write_pushes_deletion_of_synced_place() {
        let fx = Fixture::new(EngineConfig {
            read_only: false,
            ..EngineConfig::default()
        });
        fx.seed_range(1, 2, 1_440_000_000);
        let handle = test_support::handle(&fx.remote, "history", &fx.crypto);
        handle.sync().await.unwrap();
        fx.adapter.update(&handle).await.unwrap();

        fx.store.delete("http://example2.com/").unwrap();
        assert!(fx.adapter.update(&handle).await.unwrap());
        assert_eq!(
            fx.adapter.local_changes(&handle).await.unwrap(),
            vec![LocalChange::Delete {
                local_key: "http://example2.com/".to_string(),
                remote_id: "UNIQUE_ID_02".to_string(),
            }]
        );
    }

    fn read_write() -> EngineConfig {
        EngineConfig {
            read_only: false,
            ..EngineConfig::default()
        }
    }

    const NEW_URL: &str = "http://new.example/";
    const NEW_ID: &str = "NEWRECORD001";

    fn new_place_ack() -> Vec<PushAck> {
        vec![PushAck {
            local_key: NEW_URL.to_string(),
            remote_id: NEW_ID.to_string(),
            deleted: false,
        }]
    }

    #[tokio::test]
    async fn failed_acknowledge_keeps_change_queued_across_restart() {
        let fx = Fixture::new(read_write());
        fx.store
            .insert(NEW_URL, Place::new(NEW_URL, "New", vec![42]))
            .unwrap();
        let handle = test_support::handle(&fx.remote, "history", &fx.crypto);
        handle.sync().await.unwrap();
        assert!(fx.adapter.update(&handle).await.unwrap());
        assert_eq!(fx.adapter.local_changes(&handle).await.unwrap().len(), 1);

        fx.store.interfere_with_next_writes(3).unwrap();
        assert!(matches!(
            fx.adapter.acknowledge(&handle, &new_place_ack()).await,
            Err(SyncError::Store(StoreError::StaleRevision { .. }))
        ));

        // A new adapter over the same checkpoints still pushes the place,
        // now under the id the server assigned.
        let restarted =
            HistoryAdapter::new(fx.store.clone(), fx.checkpoints.clone(), &read_write());
        assert!(restarted.update(&handle).await.unwrap());
        let place = fx.store.get(NEW_URL).await.unwrap().unwrap();
        assert_eq!(
            restarted.local_changes(&handle).await.unwrap(),
            vec![LocalChange::Upsert {
                local_key: NEW_URL.to_string(),
                remote_id: Some(NEW_ID.to_string()),
                payload: History::to_payload(&place, Some(NEW_ID)),
            }]
        );

        restarted.acknowledge(&handle, &new_place_ack()).await.unwrap();
        let place = fx.store.get(NEW_URL).await.unwrap().unwrap();
        assert_eq!(place.fxsync_id.as_deref(), Some(NEW_ID));
        assert!(!restarted.update(&handle).await.unwrap());
    }

    #[tokio::test]
    async fn edits_during_a_push_are_pushed_next_cycle() {
        let fx = Fixture::new(read_write());
        fx.store
            .insert(NEW_URL, Place::new(NEW_URL, "New", vec![42]))
            .unwrap();
        let handle = test_support::handle(&fx.remote, "history", &fx.crypto);
        handle.sync().await.unwrap();
        assert!(fx.adapter.update(&handle).await.unwrap());
        fx.adapter.local_changes(&handle).await.unwrap();

        // The user visits the place again before the push is acknowledged.
        fx.store
            .insert(NEW_URL, Place::new(NEW_URL, "Renamed", vec![43, 42]))
            .unwrap();
        fx.adapter.acknowledge(&handle, &new_place_ack()).await.unwrap();

        assert!(fx.adapter.update(&handle).await.unwrap());
        match fx.adapter.local_changes(&handle).await.unwrap().as_slice() {
            [LocalChange::Upsert {
                remote_id, payload, ..
            }] => {
                assert_eq!(remote_id.as_deref(), Some(NEW_ID));
                assert_eq!(payload["title"], "Renamed");
                assert_eq!(payload["visits"][0]["date"], 43_000);
            }
            other => panic!("unexpected changes {:?}", other),
        }
    }

    #[tokio::test]
    async fn local_changes_use_reverse_index() {
        let fx = Fixture::new(read_write());
        fx.seed_range(1, 1, 1_440_000_000);
        let handle = test_support::handle(&fx.remote, "history", &fx.crypto);
        handle.sync().await.unwrap();
        fx.adapter.update(&handle).await.unwrap();

        // A record that lost its id locally is still pushed as an update.
        let mut place = fx.store.get("http://example1.com/").await.unwrap().unwrap();
        place.fxsync_id = None;
        place.title = "Edited".to_string();
        fx.store.insert("http://example1.com/", place).unwrap();

        assert!(fx.adapter.update(&handle).await.unwrap());
        let changes = fx.adapter.local_changes(&handle).await.unwrap();
        assert!(matches!(
            changes.as_slice(),
            [LocalChange::Upsert { remote_id: Some(id), .. }] if id == "UNIQUE_ID_01"
        ));
    }
}
