//! Record transformers and id schemas attached to data collections.

use crate::crypto::{EncryptedRecord, RecordCrypto};
use crate::sync::models::RemoteRecord;
use crate::sync::remote::WireRecord;
use crate::{Result, SyncError};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{rngs::OsRng, RngCore};
use serde_json::json;
use std::sync::Arc;

/// Converts records between their decoded form and the wire form.
pub trait RemoteTransformer: Send + Sync {
    fn encode(&self, record: RemoteRecord) -> Result<WireRecord>;
    fn decode(&self, record: WireRecord) -> Result<RemoteRecord>;
}

/// Encrypts payloads with the collection's bulk key on the way out and
/// verifies/decrypts them on the way in.
pub struct WebCryptoTransformer {
    collection: String,
    crypto: Arc<RecordCrypto>,
}

impl WebCryptoTransformer {
    pub fn new(collection: &str, crypto: Arc<RecordCrypto>) -> Result<Self> {
        if !crypto.has_bulk_keys() {
            return Err(SyncError::InvalidConfiguration(
                "Attempt to register Transformer with no bulk key bundle".to_string(),
            ));
        }
        Ok(Self {
            collection: collection.to_string(),
            crypto,
        })
    }
}

impl RemoteTransformer for WebCryptoTransformer {
    fn encode(&self, record: RemoteRecord) -> Result<WireRecord> {
        let encrypted = self.crypto.encrypt(&record.payload, &self.collection)?;
        Ok(WireRecord {
            id: record.id,
            last_modified: record.last_modified,
            deleted: record.deleted,
            payload: encrypted.to_json()?,
        })
    }

    fn decode(&self, record: WireRecord) -> Result<RemoteRecord> {
        // Server-side deletions carry no payload to decrypt.
        if record.deleted && record.payload.is_empty() {
            return Ok(RemoteRecord {
                payload: json!({ "id": record.id, "deleted": true }),
                id: record.id,
                last_modified: record.last_modified,
                deleted: true,
            });
        }

        let encrypted = EncryptedRecord::from_json(&record.payload)?;
        let payload = self.crypto.decrypt(&encrypted, &self.collection)?;
        Ok(RemoteRecord {
            id: record.id,
            last_modified: record.last_modified,
            deleted: record.deleted,
            payload,
        })
    }
}

/// Generates and validates record ids.
pub trait IdSchema: Send + Sync {
    fn generate(&self) -> String;
    fn validate(&self, id: &str) -> bool;
}

/// Ids used by sync clients: 12 characters of the URL-safe base64 alphabet,
/// or one of the well-known reserved ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncIdSchema;

impl SyncIdSchema {
    pub const ID_LENGTH: usize = 12;

    pub const RESERVED_IDS: [&'static str; 7] = [
        "global", "keys", "menu", "toolbar", "unfiled", "mobile", "places",
    ];
}

impl IdSchema for SyncIdSchema {
    fn generate(&self) -> String {
        // 9 random bytes encode to exactly 12 unpadded characters
        let mut bytes = [0u8; 9];
        OsRng.fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    fn validate(&self, id: &str) -> bool {
        if Self::RESERVED_IDS.contains(&id) {
            return true;
        }
        id.len() == Self::ID_LENGTH
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{BulkKeys, CryptoError, KeyBundle};
    use serde_json::json;

    fn crypto() -> Arc<RecordCrypto> {
        let mut crypto = RecordCrypto::new();
        crypto.set_bulk_keys(BulkKeys::new(KeyBundle::generate()));
        Arc::new(crypto)
    }

    #[test]
    fn generated_ids_validate() {
        let schema = SyncIdSchema;
        for _ in 0..100 {
            let id = schema.generate();
            assert_eq!(id.len(), 12);
            assert!(schema.validate(&id), "{}", id);
        }
    }

    #[test]
    fn reserved_ids_validate() {
        let schema = SyncIdSchema;
        for id in SyncIdSchema::RESERVED_IDS {
            assert!(schema.validate(id));
        }
    }

    #[test]
    fn rejects_malformed_ids() {
        let schema = SyncIdSchema;
        assert!(!schema.validate(""));
        assert!(!schema.validate("short"));
        assert!(!schema.validate("thirteen-char"));
        assert!(!schema.validate("has space 12"));
        assert!(!schema.validate("slash/in/id!"));
        assert!(schema.validate("_9sCUbahs0ay"));
    }

    #[test]
    fn transformer_requires_bulk_keys() {
        let result = WebCryptoTransformer::new("history", Arc::new(RecordCrypto::new()));
        assert!(matches!(result, Err(SyncError::InvalidConfiguration(_))));
    }

    #[test]
    fn encode_then_decode() {
        let transformer = WebCryptoTransformer::new("history", crypto()).unwrap();
        let record = RemoteRecord::new("abcdefghijkl", json!({"id": "abcdefghijkl", "title": "t"}));

        let wire = transformer.encode(record.clone()).unwrap();
        assert!(wire.payload.contains("\"IV\""));
        assert!(!wire.payload.contains("title"));

        let decoded = transformer.decode(wire).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn decode_non_json_payload_is_malformed() {
        let transformer = WebCryptoTransformer::new("history", crypto()).unwrap();
        let err = transformer
            .decode(WireRecord::new("abcdefghijkl", "not json"))
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Crypto(CryptoError::MalformedPayload(_))
        ));
    }

    #[test]
    fn server_deletion_decodes_to_tombstone() {
        let transformer = WebCryptoTransformer::new("history", crypto()).unwrap();
        let mut wire = WireRecord::new("abcdefghijkl", "");
        wire.deleted = true;
        let decoded = transformer.decode(wire).unwrap();
        assert!(decoded.is_tombstone());
        assert_eq!(decoded.payload["id"], "abcdefghijkl");
    }
}
