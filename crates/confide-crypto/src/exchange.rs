//! RSA-OAEP key wrapping for per-user symmetric keys.
//!
//! Symmetric keys are exchanged by encrypting them under the recipient's
//! RSA public key with OAEP padding (SHA-256 for both the hash and the
//! MGF1 mask function, no label). This module is stateless.

use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::cipher::SymmetricKey;
use crate::error::{E2eError, E2eResult};
use crate::format::{base64_decode, base64_encode};

/// PEM marker expected at the start of a SubjectPublicKeyInfo key.
pub const PUBLIC_KEY_MARKER: &str = "-----BEGIN PUBLIC KEY-----";

/// Parse an RSA public key from PEM, checking the header marker first
/// so a malformed key fails with a clear error.
pub fn public_key_from_pem(pem: &str) -> E2eResult<RsaPublicKey> {
    if !pem.trim_start().starts_with(PUBLIC_KEY_MARKER) {
        return Err(E2eError::InvalidKey(
            "Public key PEM missing BEGIN PUBLIC KEY marker".to_string(),
        ));
    }
    RsaPublicKey::from_public_key_pem(pem)
        .map_err(|e| E2eError::InvalidKey(format!("Invalid public key PEM: {}", e)))
}

/// Wrap a symmetric key under a recipient's RSA public key.
///
/// Returns the wrapped key as base64.
pub fn wrap_key(key: &SymmetricKey, recipient: &RsaPublicKey) -> E2eResult<String> {
    let mut rng = rand::thread_rng();
    let wrapped = recipient
        .encrypt(&mut rng, Oaep::new::<Sha256>(), key.as_bytes())
        .map_err(|e| E2eError::Wrap(e.to_string()))?;
    Ok(base64_encode(&wrapped))
}

/// Unwrap a base64 wrapped key with an RSA private key.
///
/// Returns the recovered 32-byte symmetric key.
pub fn unwrap_key(wrapped: &str, private: &RsaPrivateKey) -> E2eResult<SymmetricKey> {
    let wrapped_bytes = base64_decode(wrapped)
        .map_err(|e| E2eError::Unwrap(format!("Invalid wrapped key encoding: {}", e)))?;
    let key_bytes = private
        .decrypt(Oaep::new::<Sha256>(), &wrapped_bytes)
        .map_err(|e| E2eError::Unwrap(e.to_string()))?;
    SymmetricKey::from_slice(&key_bytes)
        .map_err(|_| E2eError::Unwrap("Unwrapped key is not 32 bytes".to_string()))
}
