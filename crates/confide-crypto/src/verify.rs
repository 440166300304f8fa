//! Run-on-demand self-test of the encryption subsystem.
//!
//! Produces a machine-readable diagnostic report suitable for
//! health-check endpoints or the operator CLI.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::cipher::{decrypt_field, encrypt_field, SymmetricKey};
use crate::keystore::{ServiceKeyStore, PRIVATE_KEY_FILE};
use crate::registry::UserKeyRegistry;

/// Overall health of the subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticStatus {
    /// Everything checked out.
    Ok,
    /// Degraded but functional; see `issues`.
    Warning,
    /// Broken; encryption cannot be trusted.
    Error,
}

/// Diagnostic report from [`IntegrityVerifier::check`].
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    /// Worst severity observed.
    pub status: DiagnosticStatus,
    /// Human-readable findings.
    pub issues: Vec<String>,
    /// Suggested operator actions, aligned with `issues`.
    pub recommendations: Vec<String>,
    /// Key directory checked.
    pub key_directory: PathBuf,
    /// Configured rotation threshold in days.
    pub rotation_days: u32,
    /// Registered users at check time.
    pub user_count: usize,
}

impl DiagnosticReport {
    fn raise(&mut self, status: DiagnosticStatus) {
        // Error outranks Warning outranks Ok.
        if severity(status) > severity(self.status) {
            self.status = status;
        }
    }

    fn issue(&mut self, status: DiagnosticStatus, issue: &str, recommendation: &str) {
        self.raise(status);
        self.issues.push(issue.to_string());
        self.recommendations.push(recommendation.to_string());
    }
}

fn severity(status: DiagnosticStatus) -> u8 {
    match status {
        DiagnosticStatus::Ok => 0,
        DiagnosticStatus::Warning => 1,
        DiagnosticStatus::Error => 2,
    }
}

/// Exercises the keypair, registry, and cipher, reporting actionable
/// diagnostics.
pub struct IntegrityVerifier {
    key_directory: PathBuf,
    registry: Arc<UserKeyRegistry>,
    rotation_days: u32,
}

impl IntegrityVerifier {
    /// Create a verifier over a key directory and registry.
    pub fn new(
        key_directory: impl AsRef<Path>,
        registry: Arc<UserKeyRegistry>,
        rotation_days: u32,
    ) -> Self {
        Self {
            key_directory: key_directory.as_ref().to_path_buf(),
            registry,
            rotation_days,
        }
    }

    /// Run every check and aggregate the findings.
    ///
    /// Verifies that the service keypair loads, that the private key
    /// file carries owner-only permissions (POSIX), that users are
    /// registered and none is past the rotation threshold, and that a
    /// live encrypt/decrypt round-trip under a fresh key returns the
    /// plaintext unchanged.
    pub fn check(&self) -> DiagnosticReport {
        let mut report = DiagnosticReport {
            status: DiagnosticStatus::Ok,
            issues: Vec::new(),
            recommendations: Vec::new(),
            key_directory: self.key_directory.clone(),
            rotation_days: self.rotation_days,
            user_count: self.registry.len(),
        };

        self.check_keypair(&mut report);
        self.check_user_keys(&mut report);
        self.check_round_trip(&mut report);

        debug!(status = ?report.status, issues = report.issues.len(), "Integrity check complete");
        report
    }

    fn check_keypair(&self, report: &mut DiagnosticReport) {
        match ServiceKeyStore::ensure_keypair(&self.key_directory) {
            Ok(store) => {
                #[cfg(unix)]
                match store.private_key_mode() {
                    Ok(0o600) => {}
                    Ok(mode) => report.issue(
                        DiagnosticStatus::Warning,
                        &format!("Insecure private key permissions: {:o}", mode),
                        &format!("Run: chmod 600 {}", self.key_directory.join(PRIVATE_KEY_FILE).display()),
                    ),
                    Err(e) => report.issue(
                        DiagnosticStatus::Warning,
                        &format!("Cannot read private key permissions: {}", e),
                        "Check key directory ownership",
                    ),
                }
                #[cfg(not(unix))]
                let _ = store;
            }
            Err(e) => report.issue(
                DiagnosticStatus::Error,
                &format!("Service keypair failed to load: {}", e),
                "Restore the key directory from backup or regenerate the service keypair",
            ),
        }
    }

    fn check_user_keys(&self, report: &mut DiagnosticReport) {
        let records = self.registry.records();
        if records.is_empty() {
            report.issue(
                DiagnosticStatus::Warning,
                "No user keys registered",
                "Register users before encrypting conversations",
            );
            return;
        }

        let now = Utc::now();
        for record in records {
            let days = (now - record.last_rotation).num_days();
            if days > i64::from(self.rotation_days) {
                report.issue(
                    DiagnosticStatus::Warning,
                    &format!("Key for user {} is stale: {} days since rotation", record.user_id, days),
                    &format!("Rotate the key for user {}", record.user_id),
                );
            }
        }
    }

    fn check_round_trip(&self, report: &mut DiagnosticReport) {
        let plaintext = format!("integrity probe {}", Utc::now().to_rfc3339());
        let key = SymmetricKey::generate();

        let survived = encrypt_field(plaintext.as_bytes(), &key)
            .and_then(|field| decrypt_field(&field, &key))
            .map(|decrypted| decrypted == plaintext.as_bytes());

        match survived {
            Ok(true) => {}
            Ok(false) => report.issue(
                DiagnosticStatus::Error,
                "Encrypt/decrypt round-trip altered the plaintext",
                "Do not persist new records until the cipher is fixed",
            ),
            Err(e) => report.issue(
                DiagnosticStatus::Error,
                &format!("Encrypt/decrypt round-trip failed: {}", e),
                "Do not persist new records until the cipher is fixed",
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::{EncodePublicKey, LineEnding};
    use rsa::{RsaPrivateKey, RsaPublicKey};
    use tempfile::tempdir;

    fn user_public_key_pem() -> String {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        RsaPublicKey::from(&private)
            .to_public_key_pem(LineEnding::LF)
            .unwrap()
    }

    #[test]
    fn test_fresh_directory_zero_users_warns() {
        let dir = tempdir().unwrap();
        ServiceKeyStore::ensure_keypair(dir.path()).unwrap();
        let registry = Arc::new(UserKeyRegistry::load(dir.path()).unwrap());

        let verifier = IntegrityVerifier::new(dir.path(), registry, 90);
        let report = verifier.check();

        assert_eq!(report.status, DiagnosticStatus::Warning);
        assert!(report
            .issues
            .iter()
            .any(|i| i.contains("No user keys registered")));
        assert_eq!(report.user_count, 0);

        // Healthy population clears the warning.
        let registry = Arc::new(UserKeyRegistry::load(dir.path()).unwrap());
        registry.register("u1", &user_public_key_pem()).unwrap();
        let verifier = IntegrityVerifier::new(dir.path(), registry, 90);
        let report = verifier.check();
        assert_eq!(report.status, DiagnosticStatus::Ok);
        assert_eq!(report.user_count, 1);
    }

    #[test]
    fn test_missing_keypair_is_error() {
        let dir = tempdir().unwrap();
        // Garbage private key: ensure_keypair will fail to parse it.
        std::fs::write(dir.path().join(PRIVATE_KEY_FILE), "junk").unwrap();
        let registry = Arc::new(UserKeyRegistry::load(dir.path()).unwrap());

        let verifier = IntegrityVerifier::new(dir.path(), registry, 90);
        let report = verifier.check();

        assert_eq!(report.status, DiagnosticStatus::Error);
        assert!(report.issues.iter().any(|i| i.contains("keypair")));
    }

    #[test]
    fn test_report_serializes_for_health_endpoints() {
        let dir = tempdir().unwrap();
        ServiceKeyStore::ensure_keypair(dir.path()).unwrap();
        let registry = Arc::new(UserKeyRegistry::load(dir.path()).unwrap());

        let verifier = IntegrityVerifier::new(dir.path(), registry, 90);
        let json = serde_json::to_value(verifier.check()).unwrap();

        assert_eq!(json["status"], "warning");
        assert!(json["issues"].is_array());
        assert!(json["recommendations"].is_array());
        assert_eq!(json["rotation_days"], 90);
    }
}
