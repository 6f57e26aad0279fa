//! Pull/merge/push driver shared by the history and bookmarks adapters.
//!
//! A [`RecordKind`] describes how one collection's decrypted payloads map
//! onto local records; [`MergeAdapter`] does the rest:
//! - scans remote records newer than the checkpoint mtime, newest first
//! - applies tombstones through the id map, upserts everything else
//! - retries local writes that lose a revision race
//! - in read-write mode, turns the store's change log into pushes
//!
//! Local changes are queued in the checkpoint before anything is merged
//! and leave the queue only once the push was acknowledged, so a failed
//! push is retried on the next cycle, also after a restart. The saved
//! store revision only ever moves past the adapter's own writes.

use crate::adapters::{LocalChange, LocalStore, PushAck, ReconciliationAdapter, StoreError};
use crate::sync::checkpoint::{Checkpoint, CheckpointStore};
use crate::sync::config::EngineConfig;
use crate::sync::conflict::ConflictPolicy;
use crate::sync::handle::CollectionHandle;
use crate::sync::models::{DecodedConflict, RemoteRecord};
use crate::{Result, SyncError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How one collection's payloads map onto local records.
pub trait RecordKind: Send + Sync + 'static {
    type Local: Clone + Send + Sync + 'static;

    /// Collection name, used in log lines and error messages.
    const COLLECTION: &'static str;

    /// Natural local key and local record for a live remote record, or
    /// `None` when the payload is unusable.
    fn from_remote(record: &RemoteRecord) -> Option<(String, Self::Local)>;

    /// Merge an incoming remote version into the stored record.
    fn merge(existing: Self::Local, incoming: Self::Local) -> Result<Self::Local>;

    /// Payload to push for `local`, carrying `remote_id` when known.
    fn to_payload(local: &Self::Local, remote_id: Option<&str>) -> Value;

    fn remote_id(local: &Self::Local) -> Option<&str>;

    fn set_remote_id(local: &mut Self::Local, remote_id: Option<String>);
}

/// Fail when a record already bound to one remote id meets another.
pub fn check_remote_id(
    collection: &str,
    key: &str,
    existing: Option<&str>,
    incoming: Option<&str>,
) -> Result<()> {
    match (existing, incoming) {
        (Some(existing), Some(incoming)) if existing != incoming => {
            Err(SyncError::InconsistentRecords(format!(
                "{} record {} is synced as {}, remote sent {}",
                collection, key, existing, incoming
            )))
        }
        _ => Ok(()),
    }
}

/// A [`ReconciliationAdapter`] over a [`LocalStore`] of `K::Local`.
pub struct MergeAdapter<K: RecordKind> {
    store: Arc<dyn LocalStore<K::Local>>,
    checkpoints: Arc<dyn CheckpointStore>,
    read_only: bool,
    policy: ConflictPolicy,
    max_store_retries: u32,
    kind: PhantomData<fn() -> K>,
}

impl<K: RecordKind> MergeAdapter<K> {
    pub fn new(
        store: Arc<dyn LocalStore<K::Local>>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            checkpoints,
            read_only: config.read_only,
            policy: config.conflict_policy,
            max_store_retries: config.max_store_retries.max(1),
            kind: PhantomData,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn checkpoint<'a>(&'a self, handle: &CollectionHandle) -> Checkpoint<'a> {
        Checkpoint::new(self.checkpoints.as_ref(), handle.account(), handle.name())
    }

    /// Run `write` until it stops losing revision races, at most
    /// `max_store_retries` times.
    async fn with_retries<T, F, Fut>(&self, key: &str, mut write: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        let mut attempt = 1;
        loop {
            match write().await {
                Err(SyncError::Store(e)) if is_write_race(&e) && attempt < self.max_store_retries => {
                    warn!(
                        "{}: write of {} raced another writer ({}), retry {}/{}",
                        K::COLLECTION,
                        key,
                        e,
                        attempt,
                        self.max_store_retries - 1
                    );
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn try_upsert(&self, key: &str, incoming: K::Local) -> Result<()> {
        let revision = self.store.revision().await?;
        match self.store.get(key).await? {
            Some(existing) => {
                let merged = K::merge(existing, incoming)?;
                self.store.put(merged, key, &revision).await?;
            }
            None => {
                self.store.add(incoming, key, &revision).await?;
            }
        }
        Ok(())
    }

    /// Write `remote_id` into the local record; `false` when nothing had
    /// to be written.
    async fn try_attach_remote_id(&self, key: &str, remote_id: &str) -> Result<bool> {
        let revision = self.store.revision().await?;
        let Some(mut local) = self.store.get(key).await? else {
            return Ok(false);
        };
        if K::remote_id(&local) == Some(remote_id) {
            return Ok(false);
        }
        K::set_remote_id(&mut local, Some(remote_id.to_string()));
        self.store.put(local, key, &revision).await?;
        Ok(true)
    }

    async fn apply_tombstone(&self, checkpoint: &Checkpoint<'_>, remote_id: &str) -> Result<()> {
        match checkpoint.local_key(remote_id)? {
            Some(key) => {
                let existed = self.store.remove(&key).await?;
                checkpoint.unmap_id(remote_id)?;
                checkpoint.clear_pending(&key)?;
                debug!(
                    "{}: tombstone {} removed {} (present: {})",
                    K::COLLECTION,
                    remote_id,
                    key,
                    existed
                );
            }
            None => debug!("{}: tombstone {} has no local record", K::COLLECTION, remote_id),
        }
        Ok(())
    }

    /// Queue every key changed since the saved revision. Returns the
    /// revision the queue is complete up to.
    async fn collect_pending(&self, checkpoint: &Checkpoint<'_>) -> Result<String> {
        let saved = checkpoint.revision()?;
        let current = self.store.revision().await?;
        for change in self.store.changes_since(saved.as_deref()).await? {
            checkpoint.mark_pending(change.key())?;
        }
        Ok(current)
    }

    /// Move the saved revision past this adapter's writes to `own`,
    /// queueing every other key changed since `base`.
    async fn absorb_own_writes(
        &self,
        checkpoint: &Checkpoint<'_>,
        base: Option<&str>,
        own: &BTreeSet<String>,
    ) -> Result<()> {
        let end = self.store.revision().await?;
        for change in self.store.changes_since(base).await? {
            if !own.contains(change.key()) {
                checkpoint.mark_pending(change.key())?;
            }
        }
        checkpoint.set_revision(&end)?;
        Ok(())
    }
}

fn is_write_race(e: &StoreError) -> bool {
    matches!(
        e,
        StoreError::StaleRevision { .. } | StoreError::AlreadyExists(_)
    )
}

#[async_trait]
impl<K: RecordKind> ReconciliationAdapter for MergeAdapter<K> {
    async fn update(&self, handle: &CollectionHandle) -> Result<bool> {
        let checkpoint = self.checkpoint(handle);
        let since = checkpoint.mtime()?;

        let queued_up_to = if self.read_only {
            None
        } else {
            Some(self.collect_pending(&checkpoint).await?)
        };

        let records = handle.list().await?;
        let mut newest: Option<u64> = None;
        let mut applied = 0usize;
        let mut skipped = 0usize;
        let mut written = BTreeSet::new();

        for record in &records {
            let modified = match record.last_modified {
                Some(modified) if modified > since => modified,
                _ => break,
            };

            if record.is_tombstone() {
                if let Some(key) = checkpoint.local_key(&record.id)? {
                    written.insert(key);
                }
                self.apply_tombstone(&checkpoint, &record.id).await?;
                applied += 1;
            } else if let Some((key, local)) = K::from_remote(record) {
                let key_ref = key.as_str();
                self.with_retries(key_ref, move || self.try_upsert(key_ref, local.clone()))
                    .await?;
                checkpoint.map_id(&record.id, &key)?;
                written.insert(key);
                applied += 1;
            } else {
                warn!("{}: skipping unusable record {}", K::COLLECTION, record.id);
                skipped += 1;
            }
            newest = Some(newest.map_or(modified, |n| n.max(modified)));
        }

        // Skipped records only move the checkpoint along with applied ones.
        if let (Some(newest), true) = (newest, applied > 0) {
            checkpoint.set_mtime(newest)?;
        }

        let pending = match queued_up_to {
            Some(base) => {
                self.absorb_own_writes(&checkpoint, Some(base.as_str()), &written).await?;
                checkpoint.pending()?.len()
            }
            None => {
                if applied > 0 {
                    checkpoint.set_revision(&self.store.revision().await?)?;
                }
                0
            }
        };

        info!(
            "{}: applied {} remote records, skipped {}, {} local changes pending",
            K::COLLECTION,
            applied,
            skipped,
            pending
        );
        Ok(pending > 0)
    }

    async fn local_changes(&self, handle: &CollectionHandle) -> Result<Vec<LocalChange>> {
        if self.read_only {
            return Ok(Vec::new());
        }
        let checkpoint = self.checkpoint(handle);

        let mut changes = Vec::new();
        for key in checkpoint.pending()? {
            match self.store.get(&key).await? {
                Some(local) => {
                    let remote_id = match K::remote_id(&local) {
                        Some(id) => Some(id.to_string()),
                        None => checkpoint.remote_id(&key)?,
                    };
                    changes.push(LocalChange::Upsert {
                        payload: K::to_payload(&local, remote_id.as_deref()),
                        local_key: key,
                        remote_id,
                    });
                }
                None => match checkpoint.remote_id(&key)? {
                    Some(remote_id) => changes.push(LocalChange::Delete {
                        local_key: key,
                        remote_id,
                    }),
                    // Never synced, nothing to tell the server.
                    None => checkpoint.clear_pending(&key)?,
                },
            }
        }
        Ok(changes)
    }

    async fn acknowledge(&self, handle: &CollectionHandle, acks: &[PushAck]) -> Result<()> {
        let checkpoint = self.checkpoint(handle);
        let base = checkpoint.revision()?;

        // Edits made while the push was in flight go out next cycle.
        let edited: BTreeSet<String> = self
            .store
            .changes_since(base.as_deref())
            .await?
            .iter()
            .map(|change| change.key().to_string())
            .collect();
        for key in &edited {
            checkpoint.mark_pending(key)?;
        }

        let mut written = BTreeSet::new();
        for ack in acks {
            if ack.deleted {
                checkpoint.unmap_id(&ack.remote_id)?;
            } else {
                checkpoint.map_id(&ack.remote_id, &ack.local_key)?;
                let (key, remote_id) = (ack.local_key.as_str(), ack.remote_id.as_str());
                let attached = self
                    .with_retries(key, move || self.try_attach_remote_id(key, remote_id))
                    .await?;
                if attached {
                    written.insert(ack.local_key.clone());
                }
            }
            if !edited.contains(&ack.local_key) {
                checkpoint.clear_pending(&ack.local_key)?;
            }
        }

        self.absorb_own_writes(&checkpoint, base.as_deref(), &written).await?;
        debug!("{}: acknowledged {} pushed changes", K::COLLECTION, acks.len());
        Ok(())
    }

    async fn handle_conflict(&self, conflict: &DecodedConflict) -> Result<Value> {
        debug!(
            "{}: resolving conflict on {} with {:?}",
            K::COLLECTION,
            conflict.remote.id,
            self.policy
        );
        Ok(self.policy.resolve(conflict))
    }
}
