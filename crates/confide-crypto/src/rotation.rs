//! Scheduled rotation of user keys past their configured age.
//!
//! Stateless between invocations: an external timer or cron calls
//! [`RotationScheduler::run_once`] (typically daily) and acts on the
//! returned report.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::registry::UserKeyRegistry;

/// Default key age, in days, before rotation.
pub const DEFAULT_ROTATION_DAYS: u32 = 90;

/// Fraction of the rotation threshold at which a key is flagged as
/// nearing expiry.
const WARN_FRACTION: f64 = 0.8;

/// Outcome of one rotation scan.
#[derive(Debug, Clone, Default)]
pub struct RotationReport {
    /// Users examined.
    pub checked: usize,
    /// Users whose keys were rotated.
    pub rotated: Vec<String>,
    /// Users whose keys are nearing expiry (not rotated).
    pub warned: Vec<String>,
    /// Per-user rotation failures; one failure never stops the scan.
    pub errors: Vec<(String, String)>,
}

/// Scans the registry and rotates keys older than the threshold.
pub struct RotationScheduler {
    registry: Arc<UserKeyRegistry>,
    rotation_days: u32,
}

impl RotationScheduler {
    /// Create a scheduler with the given key-age threshold in days.
    pub fn new(registry: Arc<UserKeyRegistry>, rotation_days: u32) -> Self {
        Self {
            registry,
            rotation_days,
        }
    }

    /// The configured key-age threshold in days.
    pub fn rotation_days(&self) -> u32 {
        self.rotation_days
    }

    /// Examine every user once, as of `now`.
    ///
    /// Keys older than the threshold are rotated; keys past 80% of it
    /// are reported as nearing expiry. A failure rotating one user is
    /// recorded in the report and the scan continues.
    pub fn run_once(&self, now: DateTime<Utc>) -> RotationReport {
        let mut report = RotationReport::default();

        for record in self.registry.records() {
            report.checked += 1;
            let days_since_rotation = (now - record.last_rotation).num_days();

            if days_since_rotation > i64::from(self.rotation_days) {
                info!(
                    user_id = %record.user_id,
                    days_since_rotation,
                    "Key past rotation threshold, rotating"
                );
                match self.registry.rotate(&record.user_id) {
                    Ok(_) => report.rotated.push(record.user_id),
                    Err(e) => {
                        error!(user_id = %record.user_id, error = %e, "Key rotation failed");
                        report.errors.push((record.user_id, e.to_string()));
                    }
                }
            } else if days_since_rotation as f64 > f64::from(self.rotation_days) * WARN_FRACTION {
                warn!(
                    user_id = %record.user_id,
                    days_since_rotation,
                    "Key nearing rotation threshold"
                );
                report.warned.push(record.user_id);
            }
        }

        if !report.rotated.is_empty() {
            info!(rotated = report.rotated.len(), "Rotation scan complete");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
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
    fn test_fresh_keys_untouched() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(UserKeyRegistry::load(dir.path()).unwrap());
        registry.register("u1", &user_public_key_pem()).unwrap();

        let scheduler = RotationScheduler::new(Arc::clone(&registry), 90);
        let report = scheduler.run_once(Utc::now());

        assert_eq!(report.checked, 1);
        assert!(report.rotated.is_empty());
        assert!(report.warned.is_empty());
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_stale_key_rotated() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(UserKeyRegistry::load(dir.path()).unwrap());
        let record = registry.register("u1", &user_public_key_pem()).unwrap();

        let scheduler = RotationScheduler::new(Arc::clone(&registry), 90);
        let report = scheduler.run_once(Utc::now() + Duration::days(91));

        assert_eq!(report.rotated, vec!["u1".to_string()]);

        let rotated = registry.record("u1").unwrap();
        assert_ne!(
            rotated.current_symmetric_key.as_bytes(),
            record.current_symmetric_key.as_bytes()
        );
        assert_eq!(rotated.previous_keys.len(), 1);
    }

    #[test]
    fn test_nearing_expiry_warned_not_rotated() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(UserKeyRegistry::load(dir.path()).unwrap());
        let record = registry.register("u1", &user_public_key_pem()).unwrap();

        let scheduler = RotationScheduler::new(Arc::clone(&registry), 90);
        // 80 days: past 80% of 90 (72), below the threshold itself.
        let report = scheduler.run_once(Utc::now() + Duration::days(80));

        assert!(report.rotated.is_empty());
        assert_eq!(report.warned, vec!["u1".to_string()]);

        let unchanged = registry.record("u1").unwrap();
        assert_eq!(
            unchanged.current_symmetric_key.as_bytes(),
            record.current_symmetric_key.as_bytes()
        );
    }

    #[test]
    fn test_scan_covers_all_users_and_settles() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(UserKeyRegistry::load(dir.path()).unwrap());
        registry.register("u1", &user_public_key_pem()).unwrap();
        registry.register("u2", &user_public_key_pem()).unwrap();

        let scheduler = RotationScheduler::new(Arc::clone(&registry), 90);
        let report = scheduler.run_once(Utc::now() + Duration::days(91));

        assert_eq!(report.checked, 2);
        assert_eq!(report.rotated.len(), 2);

        // Freshly rotated keys rest on the next scan.
        let second = scheduler.run_once(Utc::now());
        assert!(second.rotated.is_empty());
        assert!(second.warned.is_empty());
    }
}
