//! HKDF-SHA256 key derivation for the sync key hierarchy.
//!
//! The main sync key is derived from the account root secret (`kB`):
//! - Info string: `identity.mozilla.com/picl/v1/oldsync`
//! - Salt: 64 zero bytes
//! - Output: 64 bytes, split into a 32-byte AES key and a 32-byte HMAC key

use crate::crypto::keys::KeyBundle;
use crate::crypto::{CryptoError, Result};
use hkdf::Hkdf;
use sha2::Sha256;

/// Protocol info string for the main sync key.
pub const HKDF_INFO: &[u8] = b"identity.mozilla.com/picl/v1/oldsync";

/// Length of one HMAC-SHA256 block.
const HASH_LENGTH: usize = 32;

/// Derive `output_len` bytes from `secret`.
///
/// PRK = HMAC(salt, secret), then blocks T(i) = HMAC(PRK, T(i-1) || info || i)
/// starting at i = 1 with an empty T(0), concatenated and truncated.
pub fn derive(secret: &[u8], info: &[u8], salt: &[u8], output_len: usize) -> Result<Vec<u8>> {
    if output_len > 255 * HASH_LENGTH {
        return Err(CryptoError::KdfFailed(format!(
            "Requested {} bytes, HKDF-SHA256 yields at most {}",
            output_len,
            255 * HASH_LENGTH
        )));
    }

    let hkdf = Hkdf::<Sha256>::new(Some(salt), secret);
    let mut okm = vec![0u8; output_len];
    hkdf.expand(info, &mut okm)
        .map_err(|e| CryptoError::KdfFailed(format!("HKDF expand failed: {}", e)))?;
    Ok(okm)
}

/// Derive the main sync key bundle from the raw root secret.
pub fn derive_main_key(kb: &[u8]) -> Result<KeyBundle> {
    if kb.is_empty() {
        return Err(CryptoError::InvalidSecret("Root secret is empty".to_string()));
    }

    // (256 bits for AES + 256 bits for HMAC) / 8
    let mut output = derive(kb, HKDF_INFO, &[0u8; 64], 64)?;
    let bundle = KeyBundle::from_slices(&output[..32], &output[32..]);
    zeroize::Zeroize::zeroize(&mut output);
    bundle
}
