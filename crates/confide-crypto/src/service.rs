//! Subsystem context: configuration and the top-level service handle.
//!
//! One [`E2eService`] is constructed at process start and passed by
//! reference to callers; there is no ambient global instance.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::encryptor::{ConversationEncryptor, ConversationRecord, DecryptOutcome};
use crate::error::E2eResult;
use crate::keystore::ServiceKeyStore;
use crate::registry::{UserKeyRecord, UserKeyRegistry};
use crate::rotation::{RotationReport, RotationScheduler, DEFAULT_ROTATION_DAYS};
use crate::verify::{DiagnosticReport, IntegrityVerifier};

/// Configuration for the encryption subsystem.
#[derive(Debug, Clone)]
pub struct E2eConfig {
    /// Directory holding the service keypair and user key registry.
    pub key_directory: PathBuf,
    /// Key age, in days, before rotation.
    pub rotation_days: u32,
}

impl Default for E2eConfig {
    fn default() -> Self {
        Self {
            key_directory: PathBuf::from("keys"),
            rotation_days: DEFAULT_ROTATION_DAYS,
        }
    }
}

impl E2eConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `CONFIDE_KEY_DIR` | `keys` | Key directory path |
    /// | `CONFIDE_ROTATION_DAYS` | `90` | Days between key rotations |
    pub fn from_env() -> Self {
        let key_directory = std::env::var("CONFIDE_KEY_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("keys"));

        let rotation_days = std::env::var("CONFIDE_ROTATION_DAYS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(DEFAULT_ROTATION_DAYS)
            .max(1);

        Self {
            key_directory,
            rotation_days,
        }
    }

    /// Set the key directory.
    pub fn with_key_directory(mut self, dir: impl AsRef<Path>) -> Self {
        self.key_directory = dir.as_ref().to_path_buf();
        self
    }

    /// Set the rotation threshold in days.
    pub fn with_rotation_days(mut self, days: u32) -> Self {
        self.rotation_days = days;
        self
    }
}

/// The end-to-end encryption subsystem, fully initialized.
///
/// Opening the service ensures the service keypair exists, loads the
/// user key registry, and runs one rotation scan so stale keys are
/// retired before any records are touched.
pub struct E2eService {
    config: E2eConfig,
    keystore: ServiceKeyStore,
    registry: Arc<UserKeyRegistry>,
    encryptor: ConversationEncryptor,
}

impl E2eService {
    /// Initialize the subsystem from configuration.
    pub fn open(config: E2eConfig) -> E2eResult<Self> {
        let keystore = ServiceKeyStore::ensure_keypair(&config.key_directory)?;
        let registry = Arc::new(UserKeyRegistry::load(&config.key_directory)?);

        let scheduler = RotationScheduler::new(Arc::clone(&registry), config.rotation_days);
        let report = scheduler.run_once(Utc::now());
        if !report.errors.is_empty() {
            warn!(errors = report.errors.len(), "Startup rotation scan had failures");
        }

        let encryptor = ConversationEncryptor::new(Arc::clone(&registry));
        info!(
            key_directory = %config.key_directory.display(),
            rotation_days = config.rotation_days,
            user_count = registry.len(),
            "Encryption subsystem initialized"
        );

        Ok(Self {
            config,
            keystore,
            registry,
            encryptor,
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &E2eConfig {
        &self.config
    }

    /// The service keypair store.
    pub fn keystore(&self) -> &ServiceKeyStore {
        &self.keystore
    }

    /// The user key registry.
    pub fn registry(&self) -> &UserKeyRegistry {
        &self.registry
    }

    /// Register a user's public key, provisioning their symmetric key.
    pub fn register_user(&self, user_id: &str, public_key_pem: &str) -> E2eResult<UserKeyRecord> {
        self.registry.register(user_id, public_key_pem)
    }

    /// Explicitly rotate one user's key.
    pub fn rotate_user(&self, user_id: &str) -> E2eResult<UserKeyRecord> {
        self.registry.rotate(user_id)
    }

    /// Encrypt a conversation record for storage.
    pub fn encrypt_conversation(
        &self,
        user_id: &str,
        record: &ConversationRecord,
    ) -> E2eResult<ConversationRecord> {
        self.encryptor.encrypt(user_id, record)
    }

    /// Decrypt a stored conversation record.
    pub fn decrypt_conversation(
        &self,
        user_id: &str,
        record: &ConversationRecord,
    ) -> E2eResult<DecryptOutcome> {
        self.encryptor.decrypt(user_id, record)
    }

    /// Run one rotation scan, for an external timer or cron trigger.
    pub fn run_rotation(&self) -> RotationReport {
        RotationScheduler::new(Arc::clone(&self.registry), self.config.rotation_days)
            .run_once(Utc::now())
    }

    /// Run the self-diagnostic.
    pub fn check(&self) -> DiagnosticReport {
        IntegrityVerifier::new(
            &self.config.key_directory,
            Arc::clone(&self.registry),
            self.config.rotation_days,
        )
        .check()
    }
}
