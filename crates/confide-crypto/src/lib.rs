//! # confide-crypto
//!
//! Per-user end-to-end encryption for stored conversation records.
//!
//! Each registered user is assigned a private 256-bit symmetric key,
//! exchanged under an RSA keypair owned by the service. Conversation
//! content is encrypted field-by-field with AES-256-GCM before it
//! reaches the conversation store. The subsystem also owns the key
//! lifecycle: generation, scheduled rotation, a bounded history of
//! retired keys so older records stay recoverable, and an on-demand
//! self-diagnostic.
//!
//! ## Cryptographic Primitives
//!
//! - **Symmetric cipher**: AES-256-GCM (AEAD)
//! - **Key exchange**: RSA-4096 with OAEP (SHA-256 + MGF1-SHA256)
//! - **Random generation**: OS-seeded CSPRNG
//!
//! ## Encrypted Field Format
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │ Nonce (12 bytes, random per call)               │
//! ├─────────────────────────────────────────────────┤
//! │ AAD Length: u16 BE (2 bytes)                    │
//! ├─────────────────────────────────────────────────┤
//! │ AAD (JSON with timestamp, version)              │
//! ├─────────────────────────────────────────────────┤
//! │ Ciphertext + Auth Tag (AES-256-GCM)             │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! The whole frame is base64-encoded for storage.
//!
//! ## Examples
//!
//! ### Encrypt a Single Field
//!
//! ```rust
//! use confide_crypto::{decrypt_field, encrypt_field, SymmetricKey};
//!
//! let key = SymmetricKey::generate();
//! let field = encrypt_field(b"private note", &key).unwrap();
//! let plaintext = decrypt_field(&field, &key).unwrap();
//! assert_eq!(plaintext, b"private note");
//! ```
//!
//! ### Initialize the Subsystem
//!
//! ```rust,no_run
//! use confide_crypto::{E2eConfig, E2eService, ConversationRecord, Message};
//!
//! let service = E2eService::open(
//!     E2eConfig::default().with_key_directory("/var/lib/confide/keys"),
//! )?;
//!
//! // Supplied by the identity/onboarding collaborator:
//! # let user_public_key_pem = String::new();
//! service.register_user("u1", &user_public_key_pem)?;
//!
//! let record = ConversationRecord {
//!     messages: vec![Message::user("hello")],
//!     ..Default::default()
//! };
//! let encrypted = service.encrypt_conversation("u1", &record)?;
//! let outcome = service.decrypt_conversation("u1", &encrypted)?;
//! assert!(outcome.warning.is_none());
//! # Ok::<(), confide_crypto::E2eError>(())
//! ```

pub mod cipher;
pub mod detect;
pub mod encryptor;
pub mod error;
pub mod exchange;
pub mod format;
pub mod keystore;
pub mod registry;
pub mod rotation;
pub mod service;
pub mod verify;

// Re-export commonly used types
pub use cipher::{decrypt_field, encrypt_field, EncryptedField, SymmetricKey};
pub use detect::{looks_encrypted_text, looks_still_encrypted};
pub use encryptor::{
    ConversationEncryptor, ConversationRecord, DecryptOutcome, EncryptionStamp, Message,
    PartialDecryptionWarning,
};
pub use error::{E2eError, E2eResult};
pub use exchange::{public_key_from_pem, unwrap_key, wrap_key};
pub use format::{base64_decode, base64_encode, ENCRYPTION_VERSION};
pub use keystore::{ServiceKeyPair, ServiceKeyStore, PRIVATE_KEY_FILE, PUBLIC_KEY_FILE};
pub use registry::{RetiredKey, UserKeyRecord, UserKeyRegistry, MAX_PREVIOUS_KEYS};
pub use rotation::{RotationReport, RotationScheduler, DEFAULT_ROTATION_DAYS};
pub use service::{E2eConfig, E2eService};
pub use verify::{DiagnosticReport, DiagnosticStatus, IntegrityVerifier};

#[cfg(test)]
mod integration_tests {
    use super::*;
    use rsa::pkcs8::{EncodePublicKey, LineEnding};
    use rsa::{RsaPrivateKey, RsaPublicKey};
    use std::sync::Arc;
    use tempfile::tempdir;

    /// Test the wrap/unwrap and field-cipher layers together, the way
    /// registration composes them.
    #[test]
    fn test_key_exchange_feeds_field_cipher() {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let public = RsaPublicKey::from(&private);
        let pem = public.to_public_key_pem(LineEnding::LF).unwrap();

        let key = SymmetricKey::generate();
        let wrapped = wrap_key(&key, &public_key_from_pem(&pem).unwrap()).unwrap();
        let unwrapped = unwrap_key(&wrapped, &private).unwrap();

        let field = encrypt_field(b"cross-layer message", &key).unwrap();
        let plaintext = decrypt_field(&field, &unwrapped).unwrap();
        assert_eq!(plaintext, b"cross-layer message");
    }

    /// Registry + encryptor working over the same key directory.
    #[test]
    fn test_registry_backed_record_roundtrip() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(UserKeyRegistry::load(dir.path()).unwrap());

        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let pem = RsaPublicKey::from(&private)
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        registry.register("u1", &pem).unwrap();

        let encryptor = ConversationEncryptor::new(Arc::clone(&registry));
        let record = ConversationRecord {
            messages: vec![Message::user("are you open on Tuesday?")],
            ..Default::default()
        };

        let encrypted = encryptor.encrypt("u1", &record).unwrap();
        assert!(looks_still_encrypted(&encrypted));

        let outcome = encryptor.decrypt("u1", &encrypted).unwrap();
        assert!(outcome.warning.is_none());
        assert_eq!(outcome.record.messages, record.messages);
    }
}
