//! Collection engine: orchestrates connect and the pull/merge/push cycle.

use crate::adapters::{LocalChange, PushAck, ReconciliationAdapter};
use crate::crypto::{EncryptedRecord, RecordCrypto};
use crate::sync::config::EngineConfig;
use crate::sync::credentials::CredentialBundle;
use crate::sync::error::SyncFailure;
use crate::sync::handle::CollectionHandle;
use crate::sync::models::{CollectionStatus, CollectionSummary, SyncReport};
use crate::sync::remote::{RemoteClient, RemoteCollection, RemoteSession, SyncOutcome, WireRecord};
use crate::sync::transformer::{SyncIdSchema, WebCryptoTransformer};
use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const META_COLLECTION: &str = "meta";
const CRYPTO_COLLECTION: &str = "crypto";
const META_GLOBAL_ID: &str = "global";
const CRYPTO_KEYS_ID: &str = "keys";

/// Lifecycle of the engine's connection to one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Disconnected,
    Connecting,
    Connected,
    Syncing,
    /// Last `sync_now` had at least one failed collection.
    Failed,
}

struct Registration {
    name: String,
    adapter: Arc<dyn ReconciliationAdapter>,
    /// Present while connected.
    handle: Option<CollectionHandle>,
}

/// Drives one account's collections through connect and sync cycles.
pub struct CollectionEngine {
    credentials: CredentialBundle,
    config: EngineConfig,
    client: Arc<dyn RemoteClient>,
    session: RemoteSession,
    meta: Arc<dyn RemoteCollection>,
    crypto_keys: Arc<dyn RemoteCollection>,
    crypto: Option<Arc<RecordCrypto>>,
    registrations: Vec<Registration>,
    state: EngineState,
}

impl CollectionEngine {
    /// Create an engine for the account described by `credentials`.
    ///
    /// Opens the `meta` and `crypto` control collections; nothing is
    /// fetched until [`connect`](Self::connect).
    pub fn new(
        credentials: CredentialBundle,
        client: Arc<dyn RemoteClient>,
        config: EngineConfig,
    ) -> Result<Self> {
        credentials.validate()?;

        let mut headers = BTreeMap::new();
        headers.insert(
            "Authorization".to_string(),
            format!("BrowserID {}", credentials.assertion),
        );
        headers.insert(
            "X-Client-State".to_string(),
            credentials.client_state.clone(),
        );
        let session = RemoteSession {
            endpoint: credentials.endpoint.clone(),
            bucket: config.bucket.clone(),
            headers,
        };

        let meta = client.collection(&session, META_COLLECTION);
        let crypto_keys = client.collection(&session, CRYPTO_COLLECTION);

        Ok(Self {
            credentials,
            config,
            client,
            session,
            meta,
            crypto_keys,
            crypto: None,
            registrations: Vec::new(),
            state: EngineState::Disconnected,
        })
    }

    /// Create an engine from untyped credential provider output.
    pub fn from_value(
        credentials: &serde_json::Value,
        client: Arc<dyn RemoteClient>,
        config: EngineConfig,
    ) -> Result<Self> {
        Self::new(CredentialBundle::from_value(credentials)?, client, config)
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn session(&self) -> &RemoteSession {
        &self.session
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn has_keys(&self) -> bool {
        self.crypto.is_some()
    }

    /// Registered data collections, in registration order.
    pub fn collections(&self) -> Vec<&str> {
        self.registrations.iter().map(|r| r.name.as_str()).collect()
    }

    /// Fetch the control records, check the storage version and unwrap the
    /// bulk keys with the main key derived from `kB`.
    pub async fn connect(&mut self) -> std::result::Result<(), SyncFailure> {
        info!("Connecting to {}", self.session.endpoint);
        self.state = EngineState::Connecting;

        let result = match self.fetch_keys().await {
            Ok(crypto) => {
                let crypto = Arc::new(crypto);
                self.rebind(&crypto).map(|_| crypto)
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(crypto) => {
                self.crypto = Some(crypto);
                self.state = EngineState::Connected;
                info!("Connected; {} collections registered", self.registrations.len());
                Ok(())
            }
            Err(e) => {
                self.drop_keys();
                let failure = SyncFailure::classify(&e);
                error!("Connect failed: {}", failure);
                Err(failure)
            }
        }
    }

    async fn fetch_keys(&self) -> Result<RecordCrypto> {
        checked_sync(META_COLLECTION, self.meta.as_ref()).await?;
        let meta_global = read_control_record(self.meta.as_ref(), META_GLOBAL_ID)
            .await?
            .ok_or_else(|| SyncError::MissingControlRecord("meta/global".to_string()))?;
        check_storage_version(&meta_global, self.config.storage_version)?;

        checked_sync(CRYPTO_COLLECTION, self.crypto_keys.as_ref()).await?;
        let keys_record = read_control_record(self.crypto_keys.as_ref(), CRYPTO_KEYS_ID)
            .await?
            .ok_or_else(|| SyncError::MissingControlRecord("crypto/keys".to_string()))?;
        let wrapped = EncryptedRecord::from_json(&keys_record.payload)?;

        let mut crypto = RecordCrypto::new();
        crypto.import_main_key(&self.credentials.kb)?;
        crypto.unwrap_bulk_keys(&wrapped)?;
        Ok(crypto)
    }

    /// Point every registered collection at a fresh handle using `crypto`.
    fn rebind(&mut self, crypto: &Arc<RecordCrypto>) -> Result<()> {
        let handles = self
            .registrations
            .iter()
            .map(|r| self.open_handle(&r.name, crypto))
            .collect::<Result<Vec<_>>>()?;
        for (registration, handle) in self.registrations.iter_mut().zip(handles) {
            registration.handle = Some(handle);
        }
        Ok(())
    }

    /// Forget the session keys, including the copies held by handles.
    fn drop_keys(&mut self) {
        self.crypto = None;
        for registration in &mut self.registrations {
            registration.handle = None;
        }
        self.state = EngineState::Disconnected;
    }

    fn open_handle(&self, name: &str, crypto: &Arc<RecordCrypto>) -> Result<CollectionHandle> {
        let transformer = WebCryptoTransformer::new(name, Arc::clone(crypto))?;
        Ok(CollectionHandle::new(
            name,
            self.credentials.account(),
            self.client.collection(&self.session, name),
            Arc::new(transformer),
            Arc::new(SyncIdSchema),
        ))
    }

    /// Attach `adapter` to the data collection `name`.
    ///
    /// Requires bulk keys, so only valid after a successful connect.
    /// Registering a name again replaces the previous adapter.
    pub fn register_adapter(
        &mut self,
        name: &str,
        adapter: Arc<dyn ReconciliationAdapter>,
    ) -> Result<()> {
        if name == META_COLLECTION || name == CRYPTO_COLLECTION {
            return Err(SyncError::InvalidConfiguration(format!(
                "{} is a control collection",
                name
            )));
        }
        let crypto = self.crypto.as_ref().ok_or_else(|| {
            SyncError::InvalidConfiguration(
                "Attempt to register Transformer with no bulk key bundle".to_string(),
            )
        })?;
        let handle = self.open_handle(name, crypto)?;

        match self.registrations.iter_mut().find(|r| r.name == name) {
            Some(existing) => {
                existing.adapter = adapter;
                existing.handle = Some(handle);
            }
            None => self.registrations.push(Registration {
                name: name.to_string(),
                adapter,
                handle: Some(handle),
            }),
        }
        debug!("Registered adapter for {}", name);
        Ok(())
    }

    /// Run one cycle for every registered collection concurrently.
    ///
    /// A failing collection does not stop its siblings; the report carries
    /// one status per collection in registration order.
    pub async fn sync_now(&mut self) -> std::result::Result<SyncReport, SyncFailure> {
        if self.crypto.is_none() {
            return Err(SyncFailure::classify(&SyncError::NotConnected));
        }

        info!("Syncing {} collections", self.registrations.len());
        self.state = EngineState::Syncing;

        let tasks: Vec<_> = self
            .registrations
            .iter()
            .map(|r| {
                let handle = r.handle.clone();
                let adapter = Arc::clone(&r.adapter);
                let task = tokio::spawn(async move {
                    match handle {
                        Some(handle) => sync_collection(handle, adapter).await,
                        None => Err(SyncError::NotConnected),
                    }
                });
                (r.name.clone(), task)
            })
            .collect();

        let mut report = SyncReport::default();
        for (name, task) in tasks {
            let result = match task.await {
                Ok(Ok(summary)) => {
                    info!(
                        "{}: pulled {}, pushed {}, resolved {} conflicts",
                        name, summary.pulled, summary.pushed, summary.conflicts_resolved
                    );
                    Ok(summary)
                }
                Ok(Err(e)) => {
                    let failure = SyncFailure::classify(&e);
                    warn!("{}: {}", name, failure);
                    Err(failure)
                }
                Err(join_error) => {
                    let failure = SyncFailure::classify(&SyncError::Task(join_error.to_string()));
                    error!("{}: {}", name, failure);
                    Err(failure)
                }
            };
            report.collections.push(CollectionStatus {
                collection: name,
                result,
            });
        }

        self.state = if report.all_succeeded() {
            EngineState::Connected
        } else {
            EngineState::Failed
        };
        Ok(report)
    }

    /// Drop the session keys.
    pub fn disconnect(&mut self) {
        self.drop_keys();
        info!("Disconnected");
    }
}

/// `sync()` a collection, turning a completed-but-not-ok outcome into an
/// error.
async fn checked_sync(name: &str, collection: &dyn RemoteCollection) -> Result<SyncOutcome> {
    let outcome = collection.sync().await?;
    if outcome.ok {
        Ok(outcome)
    } else {
        Err(SyncError::Rejected {
            collection: name.to_string(),
            errors: outcome.errors,
        })
    }
}

async fn checked_handle_sync(handle: &CollectionHandle) -> Result<SyncOutcome> {
    let outcome = handle.sync().await?;
    if outcome.ok {
        Ok(outcome)
    } else {
        Err(SyncError::Rejected {
            collection: handle.name().to_string(),
            errors: outcome.errors,
        })
    }
}

/// The record with the well-known `id`, else the newest record.
async fn read_control_record(
    collection: &dyn RemoteCollection,
    id: &str,
) -> Result<Option<WireRecord>> {
    if let Some(record) = collection.get(id).await? {
        return Ok(Some(record));
    }
    Ok(collection.list().await?.into_iter().next())
}

fn check_storage_version(meta_global: &WireRecord, expected: i64) -> Result<()> {
    let found = serde_json::from_str::<serde_json::Value>(&meta_global.payload)
        .ok()
        .and_then(|payload| payload.get("storageVersion").and_then(|v| v.as_i64()));
    if found == Some(expected) {
        Ok(())
    } else {
        Err(SyncError::StorageVersionMismatch { found, expected })
    }
}

/// Pull, merge, push and resolve conflicts for one collection.
async fn sync_collection(
    handle: CollectionHandle,
    adapter: Arc<dyn ReconciliationAdapter>,
) -> Result<CollectionSummary> {
    let mut summary = CollectionSummary::default();

    let outcome = checked_handle_sync(&handle).await?;
    summary.pulled += outcome.pulled;
    summary.pushed += outcome.pushed;
    let mut conflicts = outcome.conflicts;

    if adapter.update(&handle).await? {
        let changes = adapter.local_changes(&handle).await?;
        debug!("{}: pushing {} local changes", handle.name(), changes.len());
        let acks = push_changes(&handle, changes).await?;
        adapter.acknowledge(&handle, &acks).await?;

        let outcome = checked_handle_sync(&handle).await?;
        summary.pulled += outcome.pulled;
        summary.pushed += outcome.pushed;
        for conflict in outcome.conflicts {
            if !conflicts.iter().any(|c| c.remote.id == conflict.remote.id) {
                conflicts.push(conflict);
            }
        }
    }

    if conflicts.is_empty() {
        return Ok(summary);
    }

    for conflict in &conflicts {
        let decoded = handle.decode_conflict(conflict)?;
        let winner = adapter.handle_conflict(&decoded).await?;
        handle.resolve(conflict, winner).await?;
    }
    let outcome = checked_handle_sync(&handle).await?;
    summary.pulled += outcome.pulled;
    summary.pushed += outcome.pushed;
    if !outcome.conflicts.is_empty() {
        return Err(SyncError::UnresolvedConflicts {
            collection: handle.name().to_string(),
            count: outcome.conflicts.len(),
        });
    }
    summary.conflicts_resolved = conflicts.len();
    Ok(summary)
}

async fn push_changes(handle: &CollectionHandle, changes: Vec<LocalChange>) -> Result<Vec<PushAck>> {
    let mut acks = Vec::with_capacity(changes.len());
    for change in changes {
        match change {
            LocalChange::Upsert {
                local_key,
                remote_id: Some(remote_id),
                payload,
            } => {
                handle.update(&remote_id, payload).await?;
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
                let remote_id = handle.create(payload, None).await?;
                acks.push(PushAck {
                    local_key,
                    remote_id,
                    deleted: false,
                });
            }
            LocalChange::Delete {
                local_key,
                remote_id,
            } => {
                handle.delete(&remote_id).await?;
                acks.push(PushAck {
                    local_key,
                    remote_id,
                    deleted: true,
                });
            }
        }
    }
    Ok(acks)
}
