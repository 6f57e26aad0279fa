//! In-memory local store with revision tokens and a change log.

use crate::adapters::{LocalStore, StoreChange, StoreError};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

type StoreResult<T> = std::result::Result<T, StoreError>;

struct Inner<R> {
    records: BTreeMap<String, R>,
    revision: u64,
    /// (revision, key) for every write.
    log: Vec<(u64, String)>,
    /// Writes that will fail as if another writer got there first.
    interfering_writes: u32,
    unavailable: bool,
}

/// A [`LocalStore`] kept in memory.
pub struct MemoryStore<R> {
    inner: Mutex<Inner<R>>,
}

impl<R> Default for MemoryStore<R> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: BTreeMap::new(),
                revision: 0,
                log: Vec::new(),
                interfering_writes: 0,
                unavailable: false,
            }),
        }
    }
}

fn token(revision: u64) -> String {
    format!("rev-{}", revision)
}

fn parse_token(token: &str) -> Option<u64> {
    token.strip_prefix("rev-")?.parse().ok()
}

impl<R: Clone> MemoryStore<R> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner<R>>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))?;
        if inner.unavailable {
            return Err(StoreError::Unavailable("store is offline".to_string()));
        }
        Ok(inner)
    }

    /// Write `record` unconditionally, as the local user would.
    pub fn insert(&self, key: &str, record: R) -> StoreResult<String> {
        let mut inner = self.lock()?;
        inner.records.insert(key.to_string(), record);
        Ok(Self::bump(&mut inner, key))
    }

    /// Remove `key` unconditionally, as the local user would.
    pub fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        let existed = inner.records.remove(key).is_some();
        if existed {
            Self::bump(&mut inner, key);
        }
        Ok(existed)
    }

    pub fn snapshot(&self) -> StoreResult<BTreeMap<String, R>> {
        Ok(self.lock()?.records.clone())
    }

    pub fn len(&self) -> StoreResult<usize> {
        Ok(self.lock()?.records.len())
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Make the next `count` conditional writes fail with a stale revision.
    pub fn interfere_with_next_writes(&self, count: u32) -> StoreResult<()> {
        self.lock()?.interfering_writes = count;
        Ok(())
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.unavailable = unavailable;
        }
    }

    fn bump(inner: &mut Inner<R>, key: &str) -> String {
        inner.revision += 1;
        let revision = inner.revision;
        inner.log.push((revision, key.to_string()));
        token(revision)
    }

    fn check_revision(inner: &mut Inner<R>, expected: &str) -> StoreResult<()> {
        if inner.interfering_writes > 0 {
            inner.interfering_writes -= 1;
            // Someone else wrote in between.
            inner.revision += 1;
        }
        let actual = token(inner.revision);
        if actual == expected {
            Ok(())
        } else {
            Err(StoreError::StaleRevision {
                expected: expected.to_string(),
                actual,
            })
        }
    }
}

#[async_trait]
impl<R> LocalStore<R> for MemoryStore<R>
where
    R: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> StoreResult<Option<R>> {
        Ok(self.lock()?.records.get(key).cloned())
    }

    async fn put(&self, record: R, key: &str, expected_revision: &str) -> StoreResult<String> {
        let mut inner = self.lock()?;
        Self::check_revision(&mut inner, expected_revision)?;
        inner.records.insert(key.to_string(), record);
        Ok(Self::bump(&mut inner, key))
    }

    async fn add(&self, record: R, key: &str, expected_revision: &str) -> StoreResult<String> {
        let mut inner = self.lock()?;
        Self::check_revision(&mut inner, expected_revision)?;
        if inner.records.contains_key(key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        inner.records.insert(key.to_string(), record);
        Ok(Self::bump(&mut inner, key))
    }

    async fn remove(&self, key: &str) -> StoreResult<bool> {
        self.delete(key)
    }

    async fn revision(&self) -> StoreResult<String> {
        Ok(token(self.lock()?.revision))
    }

    async fn changes_since(&self, revision: Option<&str>) -> StoreResult<Vec<StoreChange<R>>> {
        let inner = self.lock()?;
        let since = revision.and_then(parse_token);

        let keys: BTreeSet<String> = match since {
            Some(since) => inner
                .log
                .iter()
                .filter(|(rev, _)| *rev > since)
                .map(|(_, key)| key.clone())
                .collect(),
            None => inner.records.keys().cloned().collect(),
        };

        Ok(keys
            .into_iter()
            .map(|key| match inner.records.get(&key) {
                Some(record) => StoreChange::Put {
                    record: record.clone(),
                    key,
                },
                None => StoreChange::Remove { key },
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_requires_current_revision() {
        let store: MemoryStore<String> = MemoryStore::new();
        let rev = store.revision().await.unwrap();
        let next = store.add("a".to_string(), "k1", &rev).await.unwrap();
        assert_ne!(rev, next);

        let err = store.add("b".to_string(), "k2", &rev).await.unwrap_err();
        assert!(matches!(err, StoreError::StaleRevision { .. }));
    }

    #[tokio::test]
    async fn add_existing_key_fails() {
        let store: MemoryStore<String> = MemoryStore::new();
        store.insert("k", "a".to_string()).unwrap();
        let rev = store.revision().await.unwrap();
        assert_eq!(
            store.add("b".to_string(), "k", &rev).await.unwrap_err(),
            StoreError::AlreadyExists("k".to_string())
        );
    }

    #[tokio::test]
    async fn put_replaces() {
        let store: MemoryStore<String> = MemoryStore::new();
        store.insert("k", "a".to_string()).unwrap();
        let rev = store.revision().await.unwrap();
        store.put("b".to_string(), "k", &rev).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn changes_since_collapses_per_key() {
        let store: MemoryStore<String> = MemoryStore::new();
        store.insert("a", "1".to_string()).unwrap();
        let checkpoint = store.revision().await.unwrap();

        store.insert("b", "1".to_string()).unwrap();
        store.insert("b", "2".to_string()).unwrap();
        store.insert("c", "1".to_string()).unwrap();
        store.delete("c").unwrap();

        let changes = store.changes_since(Some(&checkpoint)).await.unwrap();
        assert_eq!(
            changes,
            vec![
                StoreChange::Put {
                    key: "b".to_string(),
                    record: "2".to_string()
                },
                StoreChange::Remove {
                    key: "c".to_string()
                },
            ]
        );

        let everything = store.changes_since(None).await.unwrap();
        assert_eq!(everything.len(), 2);
    }

    #[tokio::test]
    async fn interference_causes_stale_revision() {
        let store: MemoryStore<String> = MemoryStore::new();
        store.interfere_with_next_writes(1).unwrap();
        let rev = store.revision().await.unwrap();
        assert!(store.add("a".to_string(), "k", &rev).await.is_err());

        let rev = store.revision().await.unwrap();
        assert!(store.add("a".to_string(), "k", &rev).await.is_ok());
    }

    #[tokio::test]
    async fn unavailable_store_fails() {
        let store: MemoryStore<String> = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.revision().await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(false);
        assert!(store.revision().await.is_ok());
    }
}
