//! In-memory remote storage.
//!
//! Behaves like a collection-storage server plus the client-side copy each
//! collection handle keeps: writes are staged locally and published on
//! `sync()`, which also pulls every server change. A staged write whose
//! base version no longer matches the server is reported as a conflict
//! until it is resolved.

use crate::sync::remote::{
    RemoteClient, RemoteCollection, RemoteSession, SyncOutcome, TransportError, WireConflict,
    WireRecord,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// Server timestamps start here and advance by this step per write.
const CLOCK_START: u64 = 1_440_000_000_000;
const CLOCK_STEP: u64 = 10;

enum InjectedFailure {
    Transport(TransportError),
    Rejected(Vec<String>),
}

#[derive(Default)]
struct ServerState {
    clock: u64,
    collections: HashMap<String, BTreeMap<String, WireRecord>>,
    failures: HashMap<String, VecDeque<InjectedFailure>>,
    sessions: Vec<RemoteSession>,
}

impl ServerState {
    fn tick(&mut self) -> u64 {
        self.clock = self.clock.max(CLOCK_START) + CLOCK_STEP;
        self.clock
    }

    fn collection(&mut self, name: &str) -> &mut BTreeMap<String, WireRecord> {
        self.collections.entry(name.to_string()).or_default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, TransportError> {
    mutex
        .lock()
        .map_err(|_| TransportError::network("memory remote lock poisoned"))
}

fn newest_first(mut records: Vec<WireRecord>) -> Vec<WireRecord> {
    records.sort_by(|a, b| b.last_modified.cmp(&a.last_modified).then(a.id.cmp(&b.id)));
    records
}

/// In-memory stand-in for the remote storage service.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a record server-side, as another device would. Keeps the
    /// record's `last_modified` when set, else stamps the next tick.
    pub fn seed(&self, collection: &str, mut record: WireRecord) -> Result<u64, TransportError> {
        let mut state = lock(&self.state)?;
        let stamp = match record.last_modified {
            Some(stamp) => {
                state.clock = state.clock.max(stamp);
                stamp
            }
            None => state.tick(),
        };
        record.last_modified = Some(stamp);
        state.collection(collection).insert(record.id.clone(), record);
        Ok(stamp)
    }

    /// Server-side records of a collection, newest first.
    pub fn records(&self, collection: &str) -> Result<Vec<WireRecord>, TransportError> {
        let mut state = lock(&self.state)?;
        Ok(newest_first(
            state.collection(collection).values().cloned().collect(),
        ))
    }

    pub fn record(&self, collection: &str, id: &str) -> Result<Option<WireRecord>, TransportError> {
        let mut state = lock(&self.state)?;
        Ok(state.collection(collection).get(id).cloned())
    }

    /// Make the next `sync()` of `collection` fail with `error`.
    pub fn fail_next_sync(&self, collection: &str, error: TransportError) -> Result<(), TransportError> {
        let mut state = lock(&self.state)?;
        state
            .failures
            .entry(collection.to_string())
            .or_default()
            .push_back(InjectedFailure::Transport(error));
        Ok(())
    }

    /// Make the next `sync()` of `collection` complete but not ok.
    pub fn reject_next_sync(&self, collection: &str, errors: Vec<String>) -> Result<(), TransportError> {
        let mut state = lock(&self.state)?;
        state
            .failures
            .entry(collection.to_string())
            .or_default()
            .push_back(InjectedFailure::Rejected(errors));
        Ok(())
    }

    /// Sessions collection handles were opened with.
    pub fn sessions(&self) -> Result<Vec<RemoteSession>, TransportError> {
        Ok(lock(&self.state)?.sessions.clone())
    }
}

impl RemoteClient for MemoryRemote {
    fn collection(&self, session: &RemoteSession, name: &str) -> Arc<dyn RemoteCollection> {
        if let Ok(mut state) = self.state.lock() {
            state.sessions.push(session.clone());
        }
        Arc::new(MemoryCollection {
            name: name.to_string(),
            server: Arc::clone(&self.state),
            local: Mutex::new(LocalCopy::default()),
        })
    }
}

struct Staged {
    record: WireRecord,
    /// Server version the write was based on.
    base: Option<u64>,
    force: bool,
}

#[derive(Default)]
struct LocalCopy {
    records: HashMap<String, WireRecord>,
    staged: Vec<Staged>,
    conflicted: BTreeMap<String, Staged>,
}

/// One collection of a [`MemoryRemote`] with its client-side copy.
pub struct MemoryCollection {
    name: String,
    server: Arc<Mutex<ServerState>>,
    local: Mutex<LocalCopy>,
}

impl MemoryCollection {
    fn stage(&self, record: WireRecord, force: bool) -> Result<(), TransportError> {
        let mut local = lock(&self.local)?;
        let base = local.records.get(&record.id).and_then(|r| r.last_modified);
        local.conflicted.remove(&record.id);
        local.staged.retain(|s| s.record.id != record.id);
        local.staged.push(Staged {
            record,
            base,
            force,
        });
        Ok(())
    }
}

#[async_trait]
impl RemoteCollection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn sync(&self) -> Result<SyncOutcome, TransportError> {
        let mut server = lock(&self.server)?;
        match server.failures.get_mut(&self.name).and_then(VecDeque::pop_front) {
            Some(InjectedFailure::Transport(error)) => return Err(error),
            Some(InjectedFailure::Rejected(errors)) => {
                return Ok(SyncOutcome {
                    ok: false,
                    errors,
                    ..Default::default()
                })
            }
            None => {}
        }

        let mut local = lock(&self.local)?;
        let mut outcome = SyncOutcome::ok();

        // Publish.
        let staged = std::mem::take(&mut local.staged);
        for mut write in staged {
            let current = server.collection(&self.name).get(&write.record.id).cloned();
            let current_version = current.as_ref().and_then(|r| r.last_modified);
            if !write.force && current_version != write.base {
                if let Some(remote) = current {
                    outcome.conflicts.push(WireConflict {
                        local: write.record.clone(),
                        remote,
                    });
                    local.conflicted.insert(write.record.id.clone(), write);
                    continue;
                }
            }

            let stamp = server.tick();
            write.record.last_modified = Some(stamp);
            if write.record.deleted {
                server.collection(&self.name).remove(&write.record.id);
            } else {
                server
                    .collection(&self.name)
                    .insert(write.record.id.clone(), write.record);
            }
            outcome.pushed += 1;
        }

        // Conflicts not yet resolved are reported on every sync.
        for (id, write) in &local.conflicted {
            let already_reported = outcome.conflicts.iter().any(|c| &c.local.id == id);
            if already_reported {
                continue;
            }
            if let Some(remote) = server.collection(&self.name).get(id).cloned() {
                outcome.conflicts.push(WireConflict {
                    local: write.record.clone(),
                    remote,
                });
            }
        }

        // Pull.
        let server_records = server.collection(&self.name).clone();
        let before = local.records.len();
        local.records.retain(|id, _| server_records.contains_key(id));
        outcome.pulled += before - local.records.len();
        for (id, record) in server_records {
            let changed = local
                .records
                .get(&id)
                .map_or(true, |known| known.last_modified != record.last_modified);
            if changed {
                local.records.insert(id, record);
                outcome.pulled += 1;
            }
        }

        Ok(outcome)
    }

    async fn list(&self) -> Result<Vec<WireRecord>, TransportError> {
        let local = lock(&self.local)?;
        Ok(newest_first(
            local
                .records
                .values()
                .filter(|r| !r.deleted)
                .cloned()
                .collect(),
        ))
    }

    async fn get(&self, id: &str) -> Result<Option<WireRecord>, TransportError> {
        Ok(lock(&self.local)?.records.get(id).cloned())
    }

    async fn create(&self, record: WireRecord) -> Result<(), TransportError> {
        {
            let local = lock(&self.local)?;
            if local.records.contains_key(&record.id) {
                return Err(TransportError::new(
                    Some(412),
                    format!("Record {} already exists", record.id),
                ));
            }
        }
        self.stage(record, false)
    }

    async fn update(&self, record: WireRecord) -> Result<(), TransportError> {
        self.stage(record, false)
    }

    async fn resolve(
        &self,
        conflict: &WireConflict,
        mut resolution: WireRecord,
    ) -> Result<(), TransportError> {
        resolution.id = conflict.remote.id.clone();
        self.stage(resolution, true)
    }
}
