//! Persistent sync checkpoints.
//!
//! Adapters remember, per (account, collection):
//! - the newest remote modification time already merged
//! - the local store revision token at the end of the last cycle
//! - the remote id → local key mapping, with its reverse index
//! - local keys changed since the last acknowledged push
//!
//! Everything is kept as string values under scoped keys:
//! `{account}::{collection}::mtime`, `…::revision`, `…::idmap::{remote_id}`,
//! `…::local::{local_key}` and `…::pending::{local_key}`.

use rusqlite::{Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Corrupt checkpoint value for {key}: {value}")]
    Corrupt { key: String, value: String },
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Key/value storage for checkpoints.
pub trait CheckpointStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    /// All entries whose key starts with `prefix`, sorted by key.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;
}

/// Checkpoints held in memory for the life of the process.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| CheckpointError::LockPoisoned("memory checkpoints".to_string()))
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .lock()?
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Checkpoints in a SQLite table.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    /// Open (creating if needed) a checkpoint database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Create a new in-memory database for testing
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_checkpoints (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CheckpointError::LockPoisoned("sqlite checkpoints".to_string()))
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM sync_checkpoints WHERE key = ?1",
                [key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sync_checkpoints (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            rusqlite::params![key, value, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM sync_checkpoints WHERE key = ?1", [key])?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT key, value FROM sync_checkpoints
             WHERE substr(key, 1, length(?1)) = ?1
             ORDER BY key",
        )?;
        let rows = stmt
            .query_map([prefix], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<(String, String)>, _>>()?;
        Ok(rows)
    }
}

/// The checkpoint of one (account, collection) pair.
pub struct Checkpoint<'a> {
    store: &'a dyn CheckpointStore,
    prefix: String,
}

impl<'a> Checkpoint<'a> {
    pub fn new(store: &'a dyn CheckpointStore, account: &str, collection: &str) -> Self {
        Self {
            store,
            prefix: format!("{}::{}::", account, collection),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn idmap_key(&self, remote_id: &str) -> String {
        format!("{}{}", self.idmap_prefix(), remote_id)
    }

    fn idmap_prefix(&self) -> String {
        self.key("idmap::")
    }

    fn reverse_key(&self, local_key: &str) -> String {
        self.key(&format!("local::{}", local_key))
    }

    fn pending_prefix(&self) -> String {
        self.key("pending::")
    }

    /// Newest remote modification time already merged; 0 when never synced.
    pub fn mtime(&self) -> Result<u64> {
        let key = self.key("mtime");
        match self.store.get(&key)? {
            Some(value) => value
                .parse()
                .map_err(|_| CheckpointError::Corrupt { key, value }),
            None => Ok(0),
        }
    }

    pub fn set_mtime(&self, mtime: u64) -> Result<()> {
        self.store.set(&self.key("mtime"), &mtime.to_string())
    }

    pub fn revision(&self) -> Result<Option<String>> {
        self.store.get(&self.key("revision"))
    }

    pub fn set_revision(&self, revision: &str) -> Result<()> {
        self.store.set(&self.key("revision"), revision)
    }

    pub fn local_key(&self, remote_id: &str) -> Result<Option<String>> {
        self.store.get(&self.idmap_key(remote_id))
    }

    pub fn map_id(&self, remote_id: &str, local_key: &str) -> Result<()> {
        if let Some(previous) = self.local_key(remote_id)? {
            if previous != local_key {
                self.store.remove(&self.reverse_key(&previous))?;
            }
        }
        if let Some(stale) = self.remote_id(local_key)? {
            if stale != remote_id {
                self.store.remove(&self.idmap_key(&stale))?;
            }
        }
        self.store.set(&self.idmap_key(remote_id), local_key)?;
        self.store.set(&self.reverse_key(local_key), remote_id)
    }

    pub fn unmap_id(&self, remote_id: &str) -> Result<()> {
        if let Some(local_key) = self.local_key(remote_id)? {
            if self.remote_id(&local_key)?.as_deref() == Some(remote_id) {
                self.store.remove(&self.reverse_key(&local_key))?;
            }
        }
        self.store.remove(&self.idmap_key(remote_id))
    }

    /// Remote id mapped to `local_key`.
    pub fn remote_id(&self, local_key: &str) -> Result<Option<String>> {
        self.store.get(&self.reverse_key(local_key))
    }

    /// Remember that `local_key` has a change still to be pushed.
    pub fn mark_pending(&self, local_key: &str) -> Result<()> {
        self.store
            .set(&format!("{}{}", self.pending_prefix(), local_key), "")
    }

    pub fn clear_pending(&self, local_key: &str) -> Result<()> {
        self.store
            .remove(&format!("{}{}", self.pending_prefix(), local_key))
    }

    /// Local keys with unpushed changes, sorted.
    pub fn pending(&self) -> Result<Vec<String>> {
        let prefix = self.pending_prefix();
        Ok(self
            .store
            .scan_prefix(&prefix)?
            .into_iter()
            .map(|(key, _)| key[prefix.len()..].to_string())
            .collect())
    }

    /// Every (remote id, local key) pair, sorted by remote id.
    pub fn id_map(&self) -> Result<Vec<(String, String)>> {
        let prefix = self.idmap_prefix();
        Ok(self
            .store
            .scan_prefix(&prefix)?
            .into_iter()
            .map(|(key, value)| (key[prefix.len()..].to_string(), value))
            .collect())
    }
}
