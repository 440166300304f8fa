//! Error types for the encryption subsystem.

use thiserror::Error;

/// Errors produced by the encryption and key-lifecycle subsystem.
#[derive(Error, Debug)]
pub enum E2eError {
    /// Service keypair generation, loading, or permission failure.
    /// Fatal at startup.
    #[error("Key store error: {0}")]
    KeyStore(String),

    /// Operation referenced a user id with no registered key.
    #[error("User not registered: {0}")]
    UserNotFound(String),

    /// `register` was called twice for the same user id.
    #[error("User already registered: {0}")]
    DuplicateRegistration(String),

    /// A supplied key was malformed (wrong length, bad PEM, bad base64).
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Symmetric encryption failed.
    #[error("Encryption failed: {0}")]
    Encrypt(String),

    /// Symmetric decryption failed - wrong key, truncated, or tampered data.
    #[error("Decryption failed: {0}")]
    Decrypt(String),

    /// RSA-OAEP key wrapping failed.
    #[error("Key wrap failed: {0}")]
    Wrap(String),

    /// RSA-OAEP key unwrapping failed.
    #[error("Key unwrap failed: {0}")]
    Unwrap(String),

    /// Registry could not be persisted; in-memory state was rolled back
    /// to the last-known-good record set.
    #[error("Registry persistence failed: {0}")]
    RegistryPersistence(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for subsystem operations.
pub type E2eResult<T> = Result<T, E2eError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_not_found_display() {
        let err = E2eError::UserNotFound("u42".into());
        assert!(err.to_string().contains("u42"));
    }

    #[test]
    fn test_duplicate_registration_display() {
        let err = E2eError::DuplicateRegistration("u1".into());
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn test_io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: E2eError = io_err.into();
        assert!(matches!(err, E2eError::Io(_)));
    }

    #[test]
    fn test_json_error_from() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: E2eError = json_err.into();
        assert!(matches!(err, E2eError::Json(_)));
    }
}
