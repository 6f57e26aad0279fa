//! String/byte conversions for the record wire format.

use crate::crypto::{CryptoError, Result};
use base64::{engine::general_purpose::STANDARD, Engine};

/// Decode a hex string. The input must have an even number of hex digits.
pub fn hex_to_bytes(field: &str, hex_str: &str) -> Result<Vec<u8>> {
    if hex_str.len() % 2 != 0 {
        return Err(CryptoError::DecodeFailure(format!(
            "{} must have an even number of hex digits",
            field
        )));
    }
    hex::decode(hex_str)
        .map_err(|e| CryptoError::DecodeFailure(format!("{} is not a hex string: {}", field, e)))
}

/// Lower-case, zero-padded hex.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Decode a standard-alphabet base64 string whose length is a multiple of 4.
pub fn base64_to_bytes(field: &str, b64: &str) -> Result<Vec<u8>> {
    if b64.len() % 4 != 0 {
        return Err(CryptoError::DecodeFailure(format!(
            "{} is not a Base64 string (length must be a multiple of 4)",
            field
        )));
    }
    STANDARD
        .decode(b64)
        .map_err(|e| CryptoError::DecodeFailure(format!("{} is not a Base64 string: {}", field, e)))
}

pub fn bytes_to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}
