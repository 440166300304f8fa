//! Field-level encryption of conversation records.
//!
//! Applies the symmetric cipher to each message's `content` and any
//! present sensitive fields (`name`, `email`, `phone`, `personal_info`)
//! under the owning user's current key. Decryption falls back across
//! the user's retired keys when the current key does not clear the
//! still-encrypted heuristic, and degrades to a best-effort partial
//! result instead of failing a whole record on individual bad fields.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cipher::{decrypt_field, encrypt_field, EncryptedField, SymmetricKey};
use crate::detect::looks_still_encrypted;
use crate::error::E2eResult;
use crate::format::ENCRYPTION_VERSION;
use crate::registry::UserKeyRegistry;

/// One message within a conversation record.
///
/// Unknown fields round-trip untouched through `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Speaker role ("user", "assistant", ...). Not encrypted.
    #[serde(default)]
    pub role: String,
    /// Message body; encrypted at rest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Sensitive metadata; encrypted at rest when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personal_info: Option<String>,
    /// Passthrough for fields this subsystem does not own.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Message {
    /// A plain user message with the given content.
    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content.to_string()),
            ..Self::default()
        }
    }

    /// A plain assistant message with the given content.
    pub fn assistant(content: &str) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Some(content.to_string()),
            ..Self::default()
        }
    }

    /// Every field of this message subject to encryption, content first.
    fn protected_fields_mut(&mut self) -> [&mut Option<String>; 5] {
        [
            &mut self.content,
            &mut self.name,
            &mut self.email,
            &mut self.phone,
            &mut self.personal_info,
        ]
    }
}

/// Encryption metadata stamped on a record, serialized as `_encryption`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncryptionStamp {
    /// Whether the record's fields are currently ciphertext.
    pub encrypted: bool,
    /// When the record was encrypted.
    pub timestamp: DateTime<Utc>,
    /// Owning user id.
    pub user_id: String,
    /// Field format version.
    pub version: String,
    /// Set on a successful decryption pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decrypted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decryption_timestamp: Option<DateTime<Utc>>,
}

/// A conversation record as exchanged with the conversation store.
///
/// Owned by the store; this subsystem only rewrites message fields and
/// the `_encryption` stamp, passing everything else through.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConversationRecord {
    /// Ordered messages.
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Encryption stamp; absent on plaintext records.
    #[serde(rename = "_encryption", default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionStamp>,
    /// Passthrough for record fields this subsystem does not own.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Non-fatal warning returned when a record could not be fully
/// decrypted with any available key.
#[derive(Debug, Clone)]
pub struct PartialDecryptionWarning {
    /// The user whose keys were exhausted.
    pub user_id: String,
    /// Fields left as ciphertext in the returned record.
    pub failed_fields: usize,
    /// Keys attempted (current plus retired).
    pub keys_tried: usize,
}

impl std::fmt::Display for PartialDecryptionWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Record for user {} only partially decrypted: {} field(s) unreadable after {} key(s)",
            self.user_id, self.failed_fields, self.keys_tried
        )
    }
}

/// Result of a decryption pass: the best-effort record plus an optional
/// partial-decryption warning.
#[derive(Debug, Clone)]
pub struct DecryptOutcome {
    /// The decrypted (possibly partially) record.
    pub record: ConversationRecord,
    /// Present when some fields remain ciphertext.
    pub warning: Option<PartialDecryptionWarning>,
}

/// Applies field-level encryption to conversation records using keys
/// from the registry. Never mutates the registry.
pub struct ConversationEncryptor {
    registry: Arc<UserKeyRegistry>,
}

impl ConversationEncryptor {
    /// Create an encryptor over the given registry.
    pub fn new(registry: Arc<UserKeyRegistry>) -> Self {
        Self { registry }
    }

    /// Encrypt a record's message fields under the user's current key.
    ///
    /// The input is not mutated; a stamped, encrypted clone is
    /// returned. A record with no messages succeeds as a no-op (plus
    /// the stamp). Any field failing to encrypt fails the whole call:
    /// a half-encrypted record must never reach the store looking
    /// valid.
    pub fn encrypt(&self, user_id: &str, record: &ConversationRecord) -> E2eResult<ConversationRecord> {
        let key = self.registry.current_key(user_id)?;

        let mut encrypted = record.clone();
        encrypted.encryption = Some(EncryptionStamp {
            encrypted: true,
            timestamp: Utc::now(),
            user_id: user_id.to_string(),
            version: ENCRYPTION_VERSION.to_string(),
            decrypted: None,
            decryption_timestamp: None,
        });

        let mut field_count = 0usize;
        for message in &mut encrypted.messages {
            for field in message.protected_fields_mut() {
                if let Some(value) = field.take() {
                    *field = Some(encrypt_field(value.as_bytes(), &key)?.into_inner());
                    field_count += 1;
                }
            }
        }

        debug!(user_id, field_count, "Conversation record encrypted");
        Ok(encrypted)
    }

    /// Decrypt a record's message fields.
    ///
    /// A record without an `encrypted: true` stamp is returned
    /// unchanged. Decryption first uses the user's current key; if the
    /// result still looks encrypted, each retired key is tried from
    /// most recently retired backwards, stopping at the first that
    /// clears the heuristic. Individual field failures never abort the
    /// record: after exhausting every key the best-effort result is
    /// returned with a [`PartialDecryptionWarning`].
    pub fn decrypt(&self, user_id: &str, record: &ConversationRecord) -> E2eResult<DecryptOutcome> {
        let is_encrypted = record
            .encryption
            .as_ref()
            .map(|s| s.encrypted)
            .unwrap_or(false);
        if !is_encrypted {
            debug!(user_id, "Record is not encrypted, returning unchanged");
            return Ok(DecryptOutcome {
                record: record.clone(),
                warning: None,
            });
        }

        let current = self.registry.current_key(user_id)?;
        let (mut best, mut failed_fields) = decrypt_with_key(record, &current);
        let mut keys_tried = 1;

        if looks_still_encrypted(&best) {
            info!(user_id, "Current key did not decrypt record, trying retired keys");
            for retired in self.registry.previous_keys_of(user_id)? {
                keys_tried += 1;
                let (candidate, candidate_failures) = decrypt_with_key(record, &retired);
                if !looks_still_encrypted(&candidate) {
                    debug!(user_id, keys_tried, "Record decrypted with retired key");
                    best = candidate;
                    failed_fields = candidate_failures;
                    break;
                }
            }
        }

        if looks_still_encrypted(&best) {
            warn!(
                user_id,
                keys_tried, failed_fields, "Record remains partially encrypted after all keys"
            );
            return Ok(DecryptOutcome {
                record: best,
                warning: Some(PartialDecryptionWarning {
                    user_id: user_id.to_string(),
                    failed_fields,
                    keys_tried,
                }),
            });
        }

        if let Some(stamp) = &mut best.encryption {
            stamp.decrypted = Some(true);
            stamp.decryption_timestamp = Some(Utc::now());
        }
        Ok(DecryptOutcome {
            record: best,
            warning: None,
        })
    }
}

/// Decrypt every protected field of a cloned record with one key,
/// leaving fields that fail as-is and counting them.
fn decrypt_with_key(record: &ConversationRecord, key: &SymmetricKey) -> (ConversationRecord, usize) {
    let mut decrypted = record.clone();
    let mut failures = 0usize;

    for message in &mut decrypted.messages {
        for field in message.protected_fields_mut() {
            if let Some(value) = field.as_ref() {
                let encrypted = EncryptedField::from_base64(value.clone());
                match decrypt_field(&encrypted, key)
                    .map_err(|e| e.to_string())
                    .and_then(|bytes| String::from_utf8(bytes).map_err(|e| e.to_string()))
                {
                    Ok(plaintext) => *field = Some(plaintext),
                    Err(_) => failures += 1,
                }
            }
        }
    }

    (decrypted, failures)
}
