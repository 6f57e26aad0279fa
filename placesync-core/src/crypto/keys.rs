//! Key bundles: the main sync key and the bulk keys it unwraps.
//!
//! Key hierarchy:
//! kB → HKDF → main sync key → verifies/decrypts crypto/keys → bulk keys

use crate::crypto::encoding::{base64_to_bytes, bytes_to_base64};
use crate::crypto::{CryptoError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

const KEY_LENGTH: usize = 32;

/// An AES-256 key paired with an HMAC-SHA256 key.
///
/// Held in memory only for the duration of a connected session.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyBundle {
    aes: [u8; KEY_LENGTH],
    hmac: [u8; KEY_LENGTH],
}

impl KeyBundle {
    pub fn new(aes: [u8; KEY_LENGTH], hmac: [u8; KEY_LENGTH]) -> Self {
        Self { aes, hmac }
    }

    /// Build a bundle from raw slices, checking both are 32 bytes.
    pub fn from_slices(aes: &[u8], hmac: &[u8]) -> Result<Self> {
        let aes: [u8; KEY_LENGTH] = aes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_LENGTH,
            got: aes.len(),
        })?;
        let hmac: [u8; KEY_LENGTH] =
            hmac.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: KEY_LENGTH,
                got: hmac.len(),
            })?;
        Ok(Self { aes, hmac })
    }

    /// Build a bundle from the `[aes_b64, hmac_b64]` pair used in crypto/keys.
    pub fn from_base64_pair(pair: &[String; 2]) -> Result<Self> {
        let mut aes = base64_to_bytes("bulk AES key", &pair[0])?;
        let mut hmac = base64_to_bytes("bulk HMAC key", &pair[1])?;
        let bundle = Self::from_slices(&aes, &hmac);
        aes.zeroize();
        hmac.zeroize();
        bundle
    }

    /// Generate a random bundle from the OS RNG.
    pub fn generate() -> Self {
        use rand::{rngs::OsRng, RngCore};

        let mut aes = [0u8; KEY_LENGTH];
        let mut hmac = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut aes);
        OsRng.fill_bytes(&mut hmac);
        Self { aes, hmac }
    }

    pub fn to_base64_pair(&self) -> [String; 2] {
        [bytes_to_base64(&self.aes), bytes_to_base64(&self.hmac)]
    }

    pub fn aes_key(&self) -> &[u8; KEY_LENGTH] {
        &self.aes
    }

    pub fn hmac_key(&self) -> &[u8; KEY_LENGTH] {
        &self.hmac
    }
}

impl fmt::Debug for KeyBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyBundle { .. }")
    }
}

/// Plaintext shape of the crypto/keys record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoKeysPayload {
    pub default: [String; 2],
    #[serde(default)]
    pub collections: HashMap<String, [String; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// The set of bulk key bundles unwrapped from crypto/keys.
#[derive(Debug, Clone)]
pub struct BulkKeys {
    default: KeyBundle,
    collections: HashMap<String, KeyBundle>,
}

impl BulkKeys {
    pub fn new(default: KeyBundle) -> Self {
        Self {
            default,
            collections: HashMap::new(),
        }
    }

    /// Import every key pair in a decrypted crypto/keys payload.
    pub fn from_payload(payload: &CryptoKeysPayload) -> Result<Self> {
        let default = KeyBundle::from_base64_pair(&payload.default)?;
        let mut collections = HashMap::with_capacity(payload.collections.len());
        for (name, pair) in &payload.collections {
            collections.insert(name.clone(), KeyBundle::from_base64_pair(pair)?);
        }
        Ok(Self {
            default,
            collections,
        })
    }

    pub fn with_collection(mut self, name: &str, bundle: KeyBundle) -> Self {
        self.collections.insert(name.to_string(), bundle);
        self
    }

    /// Pick the bundle for a collection, falling back to the default.
    pub fn select(&self, collection: &str) -> &KeyBundle {
        self.collections.get(collection).unwrap_or(&self.default)
    }

    /// Names of the collections that carry their own key bundle.
    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn to_payload(&self) -> CryptoKeysPayload {
        CryptoKeysPayload {
            default: self.default.to_base64_pair(),
            collections: self
                .collections
                .iter()
                .map(|(name, bundle)| (name.clone(), bundle.to_base64_pair()))
                .collect(),
            collection: Some("crypto".to_string()),
            id: Some("keys".to_string()),
        }
    }
}
