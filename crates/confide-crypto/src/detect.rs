//! Heuristic detection of still-encrypted conversation content.
//!
//! Used by the decrypt fallback to decide whether a pass with a given
//! key actually produced plaintext. This is approximate, not a
//! cryptographic guarantee: short plaintext that happens to be valid
//! base64 of binary data is misjudged, and encrypted content shorter
//! than the sampling threshold slips through. An explicit format
//! version byte on every field would make detection exact, at the cost
//! of breaking on-disk compatibility.

use crate::encryptor::ConversationRecord;
use crate::format::base64_decode;

/// Messages sampled from the front of a record when judging it.
const SAMPLE_MESSAGES: usize = 5;

/// Decoded prefix inspected for non-printable bytes.
const PROBE_BYTES: usize = 20;

/// Judge whether a single text field still looks like an encrypted
/// frame: decodes as base64 to more than a nonce's worth of bytes whose
/// leading bytes are not all printable ASCII.
pub fn looks_encrypted_text(content: &str) -> bool {
    if content.len() <= PROBE_BYTES {
        return false;
    }
    if !content
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
    {
        return false;
    }
    match base64_decode(content) {
        Ok(decoded) => {
            decoded.len() > 12
                && !decoded
                    .iter()
                    .take(PROBE_BYTES)
                    .all(|&b| (32..=126).contains(&b))
        }
        Err(_) => false,
    }
}

/// Judge whether a record still carries encrypted message content after
/// a decryption pass, sampling up to the first five messages.
pub fn looks_still_encrypted(record: &ConversationRecord) -> bool {
    record
        .messages
        .iter()
        .take(SAMPLE_MESSAGES)
        .any(|m| m.content.as_deref().map(looks_encrypted_text).unwrap_or(false))
}
