//! Per-user key records: registration, rotation, and persistence.
//!
//! The registry is the one piece of mutable shared state in the
//! subsystem. Mutations (`register`, `rotate`) serialize behind a single
//! writer lock and persist through a backup-then-replace write, so a
//! crash mid-write never destroys the prior state. Reads clone from a
//! consistent snapshot.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cipher::SymmetricKey;
use crate::error::{E2eError, E2eResult};
use crate::exchange;

/// Registry file name within the key directory.
pub const USER_KEYS_FILE: &str = "user_keys.json";

/// Retired keys kept per user; the oldest beyond this is evicted.
pub const MAX_PREVIOUS_KEYS: usize = 5;

/// A retired symmetric key and the window in which it was current.
#[derive(Debug, Clone)]
pub struct RetiredKey {
    /// The retired 32-byte key, kept for decrypting older records.
    pub key: SymmetricKey,
    /// When this key became current.
    pub valid_from: DateTime<Utc>,
    /// When this key was rotated out.
    pub valid_until: DateTime<Utc>,
}

/// One registered user's key state.
#[derive(Debug, Clone)]
pub struct UserKeyRecord {
    /// Opaque unique user id.
    pub user_id: String,
    /// The user's public key PEM, supplied once at registration.
    pub user_public_key: String,
    /// The active 32-byte symmetric key.
    pub current_symmetric_key: SymmetricKey,
    /// The current key wrapped under `user_public_key`, stored for
    /// audit/recovery. Not used on the decrypt path.
    pub wrapped_symmetric_key: String,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// Last rotation time (equals `created_at` until the first rotation).
    pub last_rotation: DateTime<Utc>,
    /// Retired keys, most recently retired first, at most
    /// [`MAX_PREVIOUS_KEYS`].
    pub previous_keys: Vec<RetiredKey>,
}

/// On-disk form of a retired key. Timestamps are RFC 3339 strings so an
/// unparsable value can be repaired instead of failing the whole load.
#[derive(Serialize, Deserialize)]
struct StoredRetiredKey {
    key: SymmetricKey,
    valid_from: String,
    valid_until: String,
}

/// On-disk form of a user record, keyed by user id in the registry file.
#[derive(Serialize, Deserialize)]
struct StoredUser {
    user_public_key: String,
    current_symmetric_key: SymmetricKey,
    wrapped_symmetric_key: String,
    created_at: String,
    last_rotation: String,
    #[serde(default)]
    previous_keys: Vec<StoredRetiredKey>,
}

impl StoredUser {
    fn from_record(record: &UserKeyRecord) -> Self {
        Self {
            user_public_key: record.user_public_key.clone(),
            current_symmetric_key: record.current_symmetric_key.clone(),
            wrapped_symmetric_key: record.wrapped_symmetric_key.clone(),
            created_at: record.created_at.to_rfc3339(),
            last_rotation: record.last_rotation.to_rfc3339(),
            previous_keys: record
                .previous_keys
                .iter()
                .map(|k| StoredRetiredKey {
                    key: k.key.clone(),
                    valid_from: k.valid_from.to_rfc3339(),
                    valid_until: k.valid_until.to_rfc3339(),
                })
                .collect(),
        }
    }

    fn into_record(self, user_id: &str) -> UserKeyRecord {
        UserKeyRecord {
            user_id: user_id.to_string(),
            user_public_key: self.user_public_key,
            current_symmetric_key: self.current_symmetric_key,
            wrapped_symmetric_key: self.wrapped_symmetric_key,
            created_at: parse_timestamp(&self.created_at, user_id, "created_at"),
            last_rotation: parse_timestamp(&self.last_rotation, user_id, "last_rotation"),
            previous_keys: self
                .previous_keys
                .into_iter()
                .map(|k| RetiredKey {
                    valid_from: parse_timestamp(&k.valid_from, user_id, "valid_from"),
                    valid_until: parse_timestamp(&k.valid_until, user_id, "valid_until"),
                    key: k.key,
                })
                .collect(),
        }
    }
}

/// Parse an RFC 3339 timestamp, repairing unparsable values to `now`
/// rather than failing the whole registry load.
fn parse_timestamp(value: &str, user_id: &str, field: &str) -> DateTime<Utc> {
    match DateTime::parse_from_rfc3339(value) {
        Ok(ts) => ts.with_timezone(&Utc),
        Err(_) => {
            warn!(user_id, field, "Unparsable timestamp in registry, repairing to now");
            Utc::now()
        }
    }
}

/// Owns all per-user key records and their durable storage.
pub struct UserKeyRegistry {
    path: PathBuf,
    users: RwLock<HashMap<String, UserKeyRecord>>,
}

impl UserKeyRegistry {
    /// Load the registry from `user_keys.json` in the key directory.
    ///
    /// A missing file yields an empty registry. An unparsable file is
    /// moved aside to a timestamped `.bak` and the registry starts
    /// empty; records missing required fields are skipped with a
    /// warning. The load itself never fails on bad content.
    pub fn load(key_directory: impl AsRef<Path>) -> E2eResult<Self> {
        let path = key_directory.as_ref().join(USER_KEYS_FILE);
        let users = Self::load_users(&path)?;
        info!(user_count = users.len(), "User key registry loaded");
        Ok(Self {
            path,
            users: RwLock::new(users),
        })
    }

    fn load_users(path: &Path) -> E2eResult<HashMap<String, UserKeyRecord>> {
        if !path.exists() {
            debug!(path = %path.display(), "No registry file, starting empty");
            return Ok(HashMap::new());
        }

        let contents = fs::read_to_string(path)?;
        let raw: HashMap<String, serde_json::Value> = match serde_json::from_str(&contents) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Registry file is corrupt, quarantining and starting empty");
                Self::quarantine_corrupt_file(path);
                return Ok(HashMap::new());
            }
        };

        let mut users = HashMap::with_capacity(raw.len());
        for (user_id, value) in raw {
            match serde_json::from_value::<StoredUser>(value) {
                Ok(stored) => {
                    users.insert(user_id.clone(), stored.into_record(&user_id));
                }
                Err(e) => {
                    warn!(user_id, error = %e, "Skipping registry record with missing or invalid fields");
                }
            }
        }
        Ok(users)
    }

    fn quarantine_corrupt_file(path: &Path) {
        let backup = path.with_extension(format!("json.bak.{}", Utc::now().timestamp()));
        match fs::rename(path, &backup) {
            Ok(()) => info!(backup = %backup.display(), "Corrupt registry file backed up"),
            Err(e) => warn!(error = %e, "Could not back up corrupt registry file"),
        }
    }

    /// Register a new user with their public key PEM.
    ///
    /// Generates a fresh symmetric key and wraps it under the supplied
    /// public key. Registering an already-known user id is rejected;
    /// replacing a key must be an explicit `rotate`, never a silent
    /// overwrite that would orphan already-encrypted data.
    pub fn register(&self, user_id: &str, user_public_key_pem: &str) -> E2eResult<UserKeyRecord> {
        let public_key = exchange::public_key_from_pem(user_public_key_pem)?;

        let mut users = self.write_lock();
        if users.contains_key(user_id) {
            return Err(E2eError::DuplicateRegistration(user_id.to_string()));
        }

        let key = SymmetricKey::generate();
        let wrapped = exchange::wrap_key(&key, &public_key)?;
        let now = Utc::now();
        let record = UserKeyRecord {
            user_id: user_id.to_string(),
            user_public_key: user_public_key_pem.to_string(),
            current_symmetric_key: key,
            wrapped_symmetric_key: wrapped,
            created_at: now,
            last_rotation: now,
            previous_keys: Vec::new(),
        };

        users.insert(user_id.to_string(), record.clone());
        if let Err(e) = self.save(&users) {
            users.remove(user_id);
            return Err(e);
        }

        info!(user_id, "User key registered");
        Ok(record)
    }

    /// The user's active symmetric key.
    pub fn current_key(&self, user_id: &str) -> E2eResult<SymmetricKey> {
        self.read_lock()
            .get(user_id)
            .map(|r| r.current_symmetric_key.clone())
            .ok_or_else(|| E2eError::UserNotFound(user_id.to_string()))
    }

    /// The user's retired keys, most recently retired first. Used only
    /// by the conversation decrypt fallback.
    pub fn previous_keys_of(&self, user_id: &str) -> E2eResult<Vec<SymmetricKey>> {
        self.read_lock()
            .get(user_id)
            .map(|r| r.previous_keys.iter().map(|k| k.key.clone()).collect())
            .ok_or_else(|| E2eError::UserNotFound(user_id.to_string()))
    }

    /// Retire the user's current key and generate a new one.
    ///
    /// The retired key moves to the front of `previous_keys` with its
    /// active window; the history is truncated to
    /// [`MAX_PREVIOUS_KEYS`], evicting the oldest. On a persistence
    /// failure the in-memory record rolls back to its prior state.
    pub fn rotate(&self, user_id: &str) -> E2eResult<UserKeyRecord> {
        let mut users = self.write_lock();
        let previous = users
            .get(user_id)
            .cloned()
            .ok_or_else(|| E2eError::UserNotFound(user_id.to_string()))?;

        let public_key = exchange::public_key_from_pem(&previous.user_public_key)?;
        let new_key = SymmetricKey::generate();
        let wrapped = exchange::wrap_key(&new_key, &public_key)?;
        let now = Utc::now();

        let mut record = previous.clone();
        record.previous_keys.insert(
            0,
            RetiredKey {
                key: previous.current_symmetric_key.clone(),
                valid_from: previous.last_rotation,
                valid_until: now,
            },
        );
        record.previous_keys.truncate(MAX_PREVIOUS_KEYS);
        record.current_symmetric_key = new_key;
        record.wrapped_symmetric_key = wrapped;
        record.last_rotation = now;

        users.insert(user_id.to_string(), record.clone());
        if let Err(e) = self.save(&users) {
            users.insert(user_id.to_string(), previous);
            return Err(e);
        }

        info!(user_id, history = record.previous_keys.len(), "User key rotated");
        Ok(record)
    }

    /// Snapshot of one user's record.
    pub fn record(&self, user_id: &str) -> Option<UserKeyRecord> {
        self.read_lock().get(user_id).cloned()
    }

    /// Snapshot of every record, for the rotation scan and diagnostics.
    pub fn records(&self) -> Vec<UserKeyRecord> {
        self.read_lock().values().cloned().collect()
    }

    /// Whether a user id is registered.
    pub fn contains(&self, user_id: &str) -> bool {
        self.read_lock().contains_key(user_id)
    }

    /// Number of registered users.
    pub fn len(&self) -> usize {
        self.read_lock().len()
    }

    /// Whether no users are registered.
    pub fn is_empty(&self) -> bool {
        self.read_lock().is_empty()
    }

    /// Persist the full record set: copy the existing file to `.bak`,
    /// then overwrite. A failed backup is logged but does not block the
    /// save; a failed write surfaces as `RegistryPersistence` and the
    /// caller rolls back in-memory state.
    fn save(&self, users: &HashMap<String, UserKeyRecord>) -> E2eResult<()> {
        if self.path.exists() {
            let backup = self.path.with_extension("json.bak");
            if let Err(e) = fs::copy(&self.path, &backup) {
                warn!(error = %e, "Could not write registry backup");
            }
        }

        let stored: HashMap<&String, StoredUser> = users
            .iter()
            .map(|(id, record)| (id, StoredUser::from_record(record)))
            .collect();
        let json = serde_json::to_string_pretty(&stored)
            .map_err(|e| E2eError::RegistryPersistence(e.to_string()))?;
        fs::write(&self.path, json)
            .map_err(|e| E2eError::RegistryPersistence(e.to_string()))?;
        restrict_permissions(&self.path);

        debug!(user_count = users.len(), "User key registry saved");
        Ok(())
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, UserKeyRecord>> {
        self.users.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, UserKeyRecord>> {
        self.users.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        warn!(error = %e, "Could not restrict registry file permissions");
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}
