//! Decoding handle over one remote data collection.

use crate::sync::models::{DecodedConflict, RemoteRecord};
use crate::sync::remote::{RemoteCollection, SyncOutcome, WireConflict};
use crate::sync::transformer::{IdSchema, RemoteTransformer};
use crate::{Result, SyncError};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// What adapters see of a data collection: records come out decrypted and
/// go in encrypted, with ids checked against the collection's id schema.
#[derive(Clone)]
pub struct CollectionHandle {
    name: String,
    account: String,
    remote: Arc<dyn RemoteCollection>,
    transformer: Arc<dyn RemoteTransformer>,
    id_schema: Arc<dyn IdSchema>,
}

impl CollectionHandle {
    pub fn new(
        name: &str,
        account: &str,
        remote: Arc<dyn RemoteCollection>,
        transformer: Arc<dyn RemoteTransformer>,
        id_schema: Arc<dyn IdSchema>,
    ) -> Self {
        Self {
            name: name.to_string(),
            account: account.to_string(),
            remote,
            transformer,
            id_schema,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Account the collection belongs to, used to scope checkpoints.
    pub fn account(&self) -> &str {
        &self.account
    }

    pub async fn sync(&self) -> Result<SyncOutcome> {
        Ok(self.remote.sync().await?)
    }

    /// Every live record, decrypted, newest first.
    pub async fn list(&self) -> Result<Vec<RemoteRecord>> {
        let records = self.remote.list().await?;
        debug!("Decoding {} records of {}", records.len(), self.name);
        records
            .into_iter()
            .map(|record| self.transformer.decode(record))
            .collect()
    }

    pub async fn get(&self, id: &str) -> Result<Option<RemoteRecord>> {
        match self.remote.get(id).await? {
            Some(record) => Ok(Some(self.transformer.decode(record)?)),
            None => Ok(None),
        }
    }

    /// Stage a new record, generating an id unless one is forced.
    ///
    /// The id is written into the payload's `id` field as well.
    pub async fn create(&self, mut payload: Value, forced_id: Option<&str>) -> Result<String> {
        let id = match forced_id {
            Some(id) => {
                self.check_id(id)?;
                id.to_string()
            }
            None => self.id_schema.generate(),
        };
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("id".to_string(), json!(id));
        }

        let wire = self.transformer.encode(RemoteRecord::new(id.clone(), payload))?;
        self.remote.create(wire).await?;
        Ok(id)
    }

    /// Stage a new version of an existing record.
    pub async fn update(&self, id: &str, payload: Value) -> Result<()> {
        self.check_id(id)?;
        let wire = self.transformer.encode(RemoteRecord::new(id, payload))?;
        self.remote.update(wire).await?;
        Ok(())
    }

    /// Stage an encrypted `{id, deleted: true}` tombstone.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.update(id, json!({ "id": id, "deleted": true })).await
    }

    pub fn decode_conflict(&self, conflict: &WireConflict) -> Result<DecodedConflict> {
        Ok(DecodedConflict {
            collection: self.name.clone(),
            local: self.transformer.decode(conflict.local.clone())?,
            remote: self.transformer.decode(conflict.remote.clone())?,
        })
    }

    /// Stage the encrypted winner of a conflict.
    pub async fn resolve(&self, conflict: &WireConflict, payload: Value) -> Result<()> {
        let id = conflict.remote.id.clone();
        let wire = self.transformer.encode(RemoteRecord::new(id, payload))?;
        self.remote.resolve(conflict, wire).await?;
        Ok(())
    }

    fn check_id(&self, id: &str) -> Result<()> {
        if self.id_schema.validate(id) {
            Ok(())
        } else {
            Err(SyncError::InvalidRecordId(format!(
                "{} is not a valid id for {}",
                id, self.name
            )))
        }
    }
}

impl std::fmt::Debug for CollectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionHandle")
            .field("name", &self.name)
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}
