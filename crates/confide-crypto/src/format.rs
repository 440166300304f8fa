//! Shared format constants and base64 helpers.

use base64::Engine;

use crate::error::{E2eError, E2eResult};

/// Version string embedded in field AAD and record metadata.
pub const ENCRYPTION_VERSION: &str = "1.0";

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// Minimum decoded length of an encrypted field: nonce + AAD length prefix.
pub const MIN_FIELD_LEN: usize = NONCE_LEN + 2;

/// Encode bytes as standard base64.
pub fn base64_encode(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Decode a standard base64 string to bytes.
pub fn base64_decode(data: &str) -> E2eResult<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| E2eError::Decrypt(format!("Invalid base64: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_roundtrip() {
        let original = [42u8; 32];
        let encoded = base64_encode(&original);
        let decoded = base64_decode(&encoded).unwrap();
        assert_eq!(original.as_slice(), decoded.as_slice());
    }

    #[test]
    fn test_base64_decode_invalid() {
        let result = base64_decode("not valid base64!!!");
        assert!(matches!(result, Err(E2eError::Decrypt(_))));
    }

    #[test]
    fn test_min_field_len() {
        assert_eq!(MIN_FIELD_LEN, 14);
    }
}
