//! AES-256-CBC + HMAC-SHA256 record encryption.
//!
//! Wire format is a JSON object with exactly three fields:
//! - `ciphertext`: base64 AES-256-CBC (PKCS#7) output
//! - `IV`: base64, 16 bytes
//! - `hmac`: hex HMAC-SHA256
//!
//! The HMAC is computed over the bytes of the base64 ciphertext *string*,
//! not over the raw ciphertext. Other sync clients do the same, so this must
//! not change.

use crate::crypto::encoding::{base64_to_bytes, bytes_to_base64, bytes_to_hex, hex_to_bytes};
use crate::crypto::kdf::derive_main_key;
use crate::crypto::keys::{BulkKeys, CryptoKeysPayload, KeyBundle};
use crate::crypto::{CryptoError, Result};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

const IV_LENGTH: usize = 16;

/// An encrypted record body as stored remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedRecord {
    pub ciphertext: String,
    #[serde(rename = "IV")]
    pub iv: String,
    pub hmac: String,
}

impl EncryptedRecord {
    /// Parse the JSON text of an encrypted record.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            CryptoError::MalformedPayload(format!("Encrypted record is not valid JSON: {}", e))
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| CryptoError::EncryptionFailed(format!("Serialize record: {}", e)))
    }
}

/// Holds the session's main sync key and bulk keys.
///
/// Built fresh for every connected session and dropped (zeroizing all keys)
/// when the session ends.
#[derive(Debug, Default)]
pub struct RecordCrypto {
    main_key: Option<KeyBundle>,
    bulk_keys: Option<BulkKeys>,
}

impl RecordCrypto {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive and import the main sync key from the hex root secret.
    pub fn import_main_key(&mut self, kb_hex: &str) -> Result<()> {
        let mut kb = hex_to_bytes("kB", kb_hex)
            .map_err(|e| CryptoError::InvalidSecret(e.to_string()))?;
        let bundle = derive_main_key(&kb);
        kb.zeroize();
        self.main_key = Some(bundle?);
        Ok(())
    }

    /// Verify and decrypt the crypto/keys record with the main key, then
    /// import every bulk key bundle it carries.
    ///
    /// Fails with `IntegrityFailure` when the main key does not match the
    /// one the record was signed with. Nothing is imported on failure.
    pub fn unwrap_bulk_keys(&mut self, wrapped: &EncryptedRecord) -> Result<()> {
        let main_key = self
            .main_key
            .as_ref()
            .ok_or_else(|| CryptoError::MissingKeys("main sync key not imported".to_string()))?;

        verify_hmac(main_key, wrapped).map_err(|_| {
            CryptoError::IntegrityFailure(
                "crypto/keys HMAC could not be verified with current main key".to_string(),
            )
        })?;

        let mut plaintext = decrypt_verified(main_key, wrapped)?;
        let parsed: std::result::Result<CryptoKeysPayload, _> = serde_json::from_slice(&plaintext);
        plaintext.zeroize();
        let payload = parsed.map_err(|e| {
            CryptoError::MalformedPayload(format!("Deciphered crypto keys, but not JSON: {}", e))
        })?;

        self.bulk_keys = Some(BulkKeys::from_payload(&payload)?);
        Ok(())
    }

    /// Wrap a bulk key set under the main key, producing a crypto/keys record.
    pub fn wrap_bulk_keys(&self, keys: &BulkKeys) -> Result<EncryptedRecord> {
        let main_key = self
            .main_key
            .as_ref()
            .ok_or_else(|| CryptoError::MissingKeys("main sync key not imported".to_string()))?;
        let mut cleartext = serde_json::to_vec(&keys.to_payload())
            .map_err(|e| CryptoError::EncryptionFailed(format!("Serialize crypto keys: {}", e)))?;
        let record = encrypt_and_sign(main_key, &cleartext);
        cleartext.zeroize();
        record
    }

    /// Install bulk keys directly, bypassing crypto/keys.
    pub fn set_bulk_keys(&mut self, keys: BulkKeys) {
        self.bulk_keys = Some(keys);
    }

    pub fn has_bulk_keys(&self) -> bool {
        self.bulk_keys.is_some()
    }

    pub fn bulk_keys(&self) -> Option<&BulkKeys> {
        self.bulk_keys.as_ref()
    }

    /// Drop all key material.
    pub fn clear(&mut self) {
        self.main_key.take();
        self.bulk_keys.take();
    }

    fn select_key_bundle(&self, collection: &str) -> Result<&KeyBundle> {
        self.bulk_keys
            .as_ref()
            .map(|keys| keys.select(collection))
            .ok_or_else(|| {
                CryptoError::MissingKeys(format!(
                    "No key bundle found for {} - were the bulk keys unwrapped?",
                    collection
                ))
            })
    }

    /// Verify and decrypt a record of `collection` into its JSON payload.
    ///
    /// The HMAC covers the base64 ciphertext only. A modified IV passes
    /// verification and alters the first 16 plaintext bytes, so callers
    /// get either a `MalformedPayload` or a payload differing in that block.
    pub fn decrypt(&self, record: &EncryptedRecord, collection: &str) -> Result<serde_json::Value> {
        let bundle = self.select_key_bundle(collection)?;

        verify_hmac(bundle, record)?;

        let plaintext = decrypt_verified(bundle, record)?;
        serde_json::from_slice(&plaintext).map_err(|e| {
            CryptoError::MalformedPayload(format!(
                "Deciphered {} record, but not JSON: {}",
                collection, e
            ))
        })
    }

    /// Serialize, encrypt and sign a payload for `collection`.
    pub fn encrypt(&self, payload: &serde_json::Value, collection: &str) -> Result<EncryptedRecord> {
        let bundle = self.select_key_bundle(collection)?;
        let cleartext = serde_json::to_vec(payload)
            .map_err(|e| CryptoError::EncryptionFailed(format!("Serialize payload: {}", e)))?;
        encrypt_and_sign(bundle, &cleartext)
    }
}

fn new_mac(bundle: &KeyBundle) -> Result<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(bundle.hmac_key()).map_err(|_| {
        CryptoError::InvalidKeyLength {
            expected: 32,
            got: bundle.hmac_key().len(),
        }
    })
}

/// Constant-time check of the record's HMAC over its base64 ciphertext string.
fn verify_hmac(bundle: &KeyBundle, record: &EncryptedRecord) -> Result<()> {
    let signature = hex_to_bytes("hmac", &record.hmac)?;

    let mut mac = new_mac(bundle)?;
    mac.update(record.ciphertext.as_bytes());
    mac.verify_slice(&signature).map_err(|_| {
        CryptoError::IntegrityFailure("Record verification failed with current HMAC key".to_string())
    })
}

fn decrypt_verified(bundle: &KeyBundle, record: &EncryptedRecord) -> Result<Vec<u8>> {
    let ciphertext = base64_to_bytes("ciphertext", &record.ciphertext)?;
    let iv = base64_to_bytes("IV", &record.iv)?;
    if iv.len() != IV_LENGTH {
        return Err(CryptoError::DecodeFailure(format!(
            "IV must be {} bytes, got {}",
            IV_LENGTH,
            iv.len()
        )));
    }

    let decryptor = Aes256CbcDec::new_from_slices(bundle.aes_key(), &iv).map_err(|_| {
        CryptoError::InvalidKeyLength {
            expected: 32,
            got: bundle.aes_key().len(),
        }
    })?;
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| {
            CryptoError::IntegrityFailure(
                "Could not decrypt record using AES part of key bundle".to_string(),
            )
        })
}

fn encrypt_and_sign(bundle: &KeyBundle, cleartext: &[u8]) -> Result<EncryptedRecord> {
    let mut iv = [0u8; IV_LENGTH];
    OsRng.fill_bytes(&mut iv);

    let encryptor = Aes256CbcEnc::new_from_slices(bundle.aes_key(), &iv)
        .map_err(|e| CryptoError::EncryptionFailed(format!("Invalid key or IV: {}", e)))?;
    let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(cleartext);
    let ciphertext_b64 = bytes_to_base64(&ciphertext);

    let mut mac = new_mac(bundle)?;
    mac.update(ciphertext_b64.as_bytes());
    let tag = mac.finalize().into_bytes();

    Ok(EncryptedRecord {
        ciphertext: ciphertext_b64,
        iv: bytes_to_base64(&iv),
        hmac: bytes_to_hex(&tag),
    })
}
