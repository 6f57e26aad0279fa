//! Cryptographic primitives for record sync.
//!
//! This module provides:
//! - Hex/base64 conversions used by the wire format
//! - HKDF-SHA256 key derivation
//! - AES-256-CBC + HMAC-SHA256 key bundles
//! - Record encryption, decryption and authentication

pub mod encoding;
pub mod kdf;
pub mod keys;
pub mod record;

pub use kdf::{derive, derive_main_key, HKDF_INFO};
pub use keys::{BulkKeys, KeyBundle};
pub use record::{EncryptedRecord, RecordCrypto};

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid root secret: {0}")]
    InvalidSecret(String),

    #[error("Integrity check failed: {0}")]
    IntegrityFailure(String),

    #[error("Decode failed: {0}")]
    DecodeFailure(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("No key bundle available: {0}")]
    MissingKeys(String),

    #[error("Key derivation failed: {0}")]
    KdfFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
}

impl CryptoError {
    /// Whether the error means the data (or the key that should verify it)
    /// cannot be trusted.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::IntegrityFailure(_))
    }
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;
