//! AES-256-GCM field encryption with authenticated metadata.
//!
//! Every encrypted value is framed as:
//!
//! ```text
//! +------------------+
//! | Nonce            | 12 bytes (random per call)
//! +------------------+
//! | AAD Length       | 2 bytes (big-endian)
//! +------------------+
//! | AAD (JSON)       | {"timestamp": ..., "version": "1.0"}
//! +------------------+
//! | Ciphertext + Tag | Variable (16-byte auth tag appended)
//! +------------------+
//! ```
//!
//! The whole frame is base64-encoded for storage and transport.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{E2eError, E2eResult};
use crate::format::{base64_decode, base64_encode, ENCRYPTION_VERSION, MIN_FIELD_LEN, NONCE_LEN};

/// Generate cryptographically secure random bytes.
pub fn generate_random<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Generate a random nonce (12 bytes).
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    generate_random()
}

/// A 256-bit symmetric key with automatic zeroization.
///
/// Key material is zeroized when dropped and redacted from `Debug`
/// output. Serialization encodes the key as base64 for the registry
/// file; it must never appear in logs.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; 32]);

impl SymmetricKey {
    /// Generate a new random 256-bit key.
    pub fn generate() -> Self {
        Self(generate_random())
    }

    /// Create a key from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create a key from a slice, validating the length.
    pub fn from_slice(bytes: &[u8]) -> E2eResult<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| E2eError::InvalidKey(format!("Expected 32 bytes, got {}", bytes.len())))?;
        Ok(Self(arr))
    }

    /// Get the raw bytes of the key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Clone for SymmetricKey {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl Serialize for SymmetricKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&base64_encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for SymmetricKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = base64_decode(&s).map_err(serde::de::Error::custom)?;
        if bytes.len() != 32 {
            return Err(serde::de::Error::custom("invalid symmetric key length"));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

/// A base64-encoded encrypted field in the framed format above.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptedField(String);

impl EncryptedField {
    /// Wrap an already-encoded field value.
    pub fn from_base64(encoded: String) -> Self {
        Self(encoded)
    }

    /// The base64 string form for storage.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the base64 string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

/// Authenticated metadata bound to every encrypted field.
#[derive(Debug, Serialize, Deserialize)]
struct FieldAad {
    timestamp: String,
    version: String,
}

/// Encrypt a plaintext blob under a symmetric key.
///
/// A fresh random nonce is generated on every call; nonces are never
/// reused under a given key. The field AAD carries the encryption
/// timestamp and format version and is covered by the auth tag.
pub fn encrypt_field(plaintext: &[u8], key: &SymmetricKey) -> E2eResult<EncryptedField> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| E2eError::Encrypt(e.to_string()))?;

    let nonce_bytes = generate_nonce();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let aad = serde_json::to_vec(&FieldAad {
        timestamp: Utc::now().to_rfc3339(),
        version: ENCRYPTION_VERSION.to_string(),
    })?;
    let aad_len = u16::try_from(aad.len())
        .map_err(|_| E2eError::Encrypt("AAD exceeds 65535 bytes".to_string()))?;

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|_| E2eError::Encrypt("AES-GCM encryption failed".to_string()))?;

    let mut combined = Vec::with_capacity(NONCE_LEN + 2 + aad.len() + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&aad_len.to_be_bytes());
    combined.extend_from_slice(&aad);
    combined.extend_from_slice(&ciphertext);

    Ok(EncryptedField(base64_encode(&combined)))
}

/// Decrypt an encrypted field under a symmetric key.
///
/// Fails if the base64 envelope is malformed, the frame is truncated,
/// or the authentication tag does not verify. On tag failure the
/// decryption is retried once without AAD, for records written before
/// AAD support; a second failure is final.
pub fn decrypt_field(field: &EncryptedField, key: &SymmetricKey) -> E2eResult<Vec<u8>> {
    let combined = base64_decode(field.as_str())?;

    if combined.len() < MIN_FIELD_LEN {
        return Err(E2eError::Decrypt("Encrypted field too short".to_string()));
    }

    let nonce = Nonce::from_slice(&combined[..NONCE_LEN]);
    let aad_len = u16::from_be_bytes([combined[NONCE_LEN], combined[NONCE_LEN + 1]]) as usize;

    if combined.len() < MIN_FIELD_LEN + aad_len {
        return Err(E2eError::Decrypt(
            "Encrypted field corrupt (AAD truncated)".to_string(),
        ));
    }

    let aad = &combined[MIN_FIELD_LEN..MIN_FIELD_LEN + aad_len];
    let ciphertext = &combined[MIN_FIELD_LEN + aad_len..];

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| E2eError::Decrypt(e.to_string()))?;

    match cipher.decrypt(
        nonce,
        Payload {
            msg: ciphertext,
            aad,
        },
    ) {
        Ok(plaintext) => Ok(plaintext),
        // Legacy records predate AAD support; retry once without it.
        Err(_) => cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: &[],
                },
            )
            .map_err(|_| E2eError::Decrypt("AES-GCM authentication failed".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_nonce_random() {
        let nonce1 = generate_nonce();
        let nonce2 = generate_nonce();

        assert_eq!(nonce1.len(), 12);
        assert_ne!(nonce1, nonce2); // Should be random
    }

    #[test]
    fn test_symmetric_key_generate_unique() {
        let k1 = SymmetricKey::generate();
        let k2 = SymmetricKey::generate();
        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_symmetric_key_from_slice_wrong_length() {
        let result = SymmetricKey::from_slice(&[0u8; 16]);
        assert!(matches!(result, Err(E2eError::InvalidKey(_))));
    }

    #[test]
    fn test_symmetric_key_debug_redacted() {
        let key = SymmetricKey::from_bytes([7u8; 32]);
        let debug = format!("{:?}", key);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains('7'));
    }

    #[test]
    fn test_symmetric_key_serde_roundtrip() {
        let key = SymmetricKey::generate();
        let json = serde_json::to_string(&key).unwrap();
        let parsed: SymmetricKey = serde_json::from_str(&json).unwrap();
        assert_eq!(key.as_bytes(), parsed.as_bytes());
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = SymmetricKey::generate();
        let plaintext = b"Hello, World!";

        let field = encrypt_field(plaintext, &key).unwrap();
        let decrypted = decrypt_field(&field, &key).unwrap();

        assert_eq!(plaintext.as_slice(), decrypted.as_slice());
    }

    #[test]
    fn test_encrypt_empty_plaintext() {
        let key = SymmetricKey::generate();

        let field = encrypt_field(b"", &key).unwrap();
        let decrypted = decrypt_field(&field, &key).unwrap();

        assert!(decrypted.is_empty());
    }

    #[test]
    fn test_decrypt_wrong_key() {
        let key1 = SymmetricKey::from_bytes([42u8; 32]);
        let key2 = SymmetricKey::from_bytes([99u8; 32]);

        let field = encrypt_field(b"Secret data", &key1).unwrap();
        let result = decrypt_field(&field, &key2);

        assert!(matches!(result, Err(E2eError::Decrypt(_))));
    }

    #[test]
    fn test_decrypt_invalid_base64() {
        let key = SymmetricKey::generate();
        let field = EncryptedField::from_base64("not valid base64!!!".to_string());

        let result = decrypt_field(&field, &key);
        assert!(matches!(result, Err(E2eError::Decrypt(_))));
    }

    #[test]
    fn test_decrypt_too_short() {
        let key = SymmetricKey::generate();
        let field = EncryptedField::from_base64(base64_encode(&[0u8; 10]));

        let result = decrypt_field(&field, &key);
        assert!(matches!(result, Err(E2eError::Decrypt(_))));
    }

    #[test]
    fn test_decrypt_aad_length_overruns_buffer() {
        let key = SymmetricKey::generate();

        // Valid nonce, then an AAD length far past the end of the buffer.
        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&u16::MAX.to_be_bytes());
        frame.extend_from_slice(&[1, 2, 3]);
        let field = EncryptedField::from_base64(base64_encode(&frame));

        let result = decrypt_field(&field, &key);
        assert!(matches!(result, Err(E2eError::Decrypt(_))));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let key = SymmetricKey::generate();
        let field = encrypt_field(b"Secret data", &key).unwrap();

        let mut combined = base64_decode(field.as_str()).unwrap();
        let last = combined.len() - 1;
        combined[last] ^= 0xFF;
        let tampered = EncryptedField::from_base64(base64_encode(&combined));

        let result = decrypt_field(&tampered, &key);
        assert!(matches!(result, Err(E2eError::Decrypt(_))));
    }

    #[test]
    fn test_every_ciphertext_byte_tamper_detected() {
        let key = SymmetricKey::generate();
        let field = encrypt_field(b"integrity", &key).unwrap();
        let combined = base64_decode(field.as_str()).unwrap();

        let aad_len = u16::from_be_bytes([combined[12], combined[13]]) as usize;
        let ct_start = 14 + aad_len;

        for i in ct_start..combined.len() {
            let mut copy = combined.clone();
            copy[i] ^= 0x01;
            let tampered = EncryptedField::from_base64(base64_encode(&copy));
            assert!(
                decrypt_field(&tampered, &key).is_err(),
                "flipped byte {} went undetected",
                i
            );
        }
    }

    #[test]
    fn test_legacy_field_without_aad() {
        use aes_gcm::aead::{Aead, KeyInit};
        use aes_gcm::{Aes256Gcm, Nonce};

        let key = SymmetricKey::generate();
        let nonce_bytes = generate_nonce();

        // Simulate a migrated legacy record: the frame carries AAD bytes
        // but the ciphertext was produced without any associated data, so
        // the first attempt fails tag verification and the no-AAD retry
        // must recover the plaintext.
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).unwrap();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), b"old message".as_slice())
            .unwrap();

        let aad = br#"{"version":"0.9"}"#;
        let mut combined = Vec::new();
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&(aad.len() as u16).to_be_bytes());
        combined.extend_from_slice(aad);
        combined.extend_from_slice(&ciphertext);
        let field = EncryptedField::from_base64(base64_encode(&combined));

        let decrypted = decrypt_field(&field, &key).unwrap();
        assert_eq!(decrypted, b"old message");
    }

    #[test]
    fn test_same_plaintext_distinct_ciphertexts() {
        let key = SymmetricKey::generate();

        let f1 = encrypt_field(b"Same message", &key).unwrap();
        let f2 = encrypt_field(b"Same message", &key).unwrap();

        // Fresh nonce per call
        assert_ne!(f1, f2);
    }

    #[test]
    fn test_aad_carries_version() {
        let key = SymmetricKey::generate();
        let field = encrypt_field(b"x", &key).unwrap();
        let combined = base64_decode(field.as_str()).unwrap();

        let aad_len = u16::from_be_bytes([combined[12], combined[13]]) as usize;
        let aad: FieldAad = serde_json::from_slice(&combined[14..14 + aad_len]).unwrap();
        assert_eq!(aad.version, ENCRYPTION_VERSION);
    }
}
