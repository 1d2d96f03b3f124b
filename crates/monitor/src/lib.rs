pub mod monitor;

pub use monitor::{SweepSummary, VerificationMonitor};

use chancery_audit::AuditError;
use chancery_encrypt::EncryptError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

/// Errors raised by the verification monitor.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("monitor database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Encrypt(#[from] EncryptError),
    #[error("audit ledger error: {0}")]
    Audit(#[from] AuditError),
    #[error("monitor storage error: {0}")]
    Io(#[from] std::io::Error),
    #[error("monitor lock poisoned")]
    Poisoned,
}

/// Verification verdict for a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Encrypted,
    Unencrypted,
    VerificationFailed,
    KeyMissing,
    Corrupted,
    PendingEncryption,
}

impl DocumentStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::Encrypted => "encrypted",
            DocumentStatus::Unencrypted => "unencrypted",
            DocumentStatus::VerificationFailed => "verification_failed",
            DocumentStatus::KeyMissing => "key_missing",
            DocumentStatus::Corrupted => "corrupted",
            DocumentStatus::PendingEncryption => "pending_encryption",
        }
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verification depth, cheapest first.
///
/// * `Basic`: container and metadata exist, declared key present and not
///   revoked.
/// * `Standard`: `Basic` plus container schema validation.
/// * `Comprehensive`: `Standard` plus a full decryption.
/// * `Forensic`: `Comprehensive` plus recomputed-digest comparison against
///   the inventory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationLevel {
    Basic,
    Standard,
    Comprehensive,
    Forensic,
}

impl VerificationLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            VerificationLevel::Basic => "basic",
            VerificationLevel::Standard => "standard",
            VerificationLevel::Comprehensive => "comprehensive",
            VerificationLevel::Forensic => "forensic",
        }
    }
}

impl std::fmt::Display for VerificationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of verifying one document.
#[derive(Debug, Clone)]
pub struct VerificationRecord {
    pub document_id: String,
    pub file_path: String,
    pub status: DocumentStatus,
    pub level: VerificationLevel,
    pub verified_at: OffsetDateTime,
    pub duration_ms: u128,
    pub issues: Vec<String>,
    pub metadata_valid: bool,
    pub decryption_successful: bool,
    pub integrity_verified: bool,
}

/// Per-document failure bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct FailureEntry {
    pub document_id: String,
    pub failure_count: u64,
    pub first_failure_at: Option<String>,
    pub last_failure_at: Option<String>,
    pub last_success_at: Option<String>,
    pub remediation_attempts: u64,
}

/// Remediation collaborators invoked on verification failures. Returning
/// `true` reports the condition as repaired.
pub trait RemediationHooks: Send + Sync {
    fn recover_key(&self, document_id: &str, key_id: &str) -> bool;
    fn restore_from_backup(&self, document_id: &str) -> bool;
}

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// SQLite database for verification results and failure tracking.
    pub db_path: PathBuf,
    /// Seconds between standard sweeps.
    pub verification_interval_secs: u64,
    /// Hours between comprehensive sweeps.
    pub comprehensive_check_interval_hours: u64,
    /// Sweep failure rate above which a security alert is raised.
    pub alert_threshold_failure_rate: f64,
    /// Whether failures dispatch remediation automatically.
    pub auto_remediation_enabled: bool,
    /// Remediation attempts allowed per document inside the window.
    pub max_remediation_attempts: u64,
    /// Window (hours) after which the attempt counter resets.
    pub remediation_window_hours: u64,
}

impl MonitorConfig {
    #[must_use]
    pub fn under_root(root: &Path) -> Self {
        Self {
            db_path: root.join("monitoring").join("verification.db"),
            verification_interval_secs: 300,
            comprehensive_check_interval_hours: 24,
            alert_threshold_failure_rate: 0.05,
            auto_remediation_enabled: true,
            max_remediation_attempts: 3,
            remediation_window_hours: 24,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_ordered_by_cost() {
        assert!(VerificationLevel::Basic < VerificationLevel::Standard);
        assert!(VerificationLevel::Standard < VerificationLevel::Comprehensive);
        assert!(VerificationLevel::Comprehensive < VerificationLevel::Forensic);
    }

    #[test]
    fn test_default_config_thresholds() {
        let config = MonitorConfig::under_root(Path::new("/tmp/x"));
        assert_eq!(config.verification_interval_secs, 300);
        assert_eq!(config.comprehensive_check_interval_hours, 24);
        assert!((config.alert_threshold_failure_rate - 0.05).abs() < f64::EPSILON);
        assert!(config.auto_remediation_enabled);
    }
}
