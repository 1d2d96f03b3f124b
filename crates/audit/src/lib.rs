pub mod ledger;
pub mod report;

pub use ledger::{AuditLedger, AuditStatistics, DecryptionActivity, EventScope, SearchCriteria};
pub use report::ComplianceReport;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use time::OffsetDateTime;

/// Errors raised by the audit ledger.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("ledger database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("ledger storage error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger lock poisoned")]
    Poisoned,
}

/// The closed set of auditable event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    // Encryption operations
    DocumentEncrypted,
    DocumentDecrypted,
    EncryptionFailed,
    DecryptionFailed,
    // Key management
    KeyCreated,
    KeyAccessed,
    KeyRotated,
    KeyDeprecated,
    KeyRevoked,
    // Backup operations
    BackupEncrypted,
    BackupDecrypted,
    BackupVerified,
    // Security events
    UnauthorizedAccessAttempt,
    KeyCompromiseSuspected,
    VerificationFailure,
    SecurityAlert,
    // Compliance events
    ComplianceCheck,
    RetentionPolicyApplied,
    DataExportRequest,
    // System events
    SystemStartup,
    SystemShutdown,
    ConfigurationChange,
}

impl AuditEventType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            AuditEventType::DocumentEncrypted => "document_encrypted",
            AuditEventType::DocumentDecrypted => "document_decrypted",
            AuditEventType::EncryptionFailed => "encryption_failed",
            AuditEventType::DecryptionFailed => "decryption_failed",
            AuditEventType::KeyCreated => "key_created",
            AuditEventType::KeyAccessed => "key_accessed",
            AuditEventType::KeyRotated => "key_rotated",
            AuditEventType::KeyDeprecated => "key_deprecated",
            AuditEventType::KeyRevoked => "key_revoked",
            AuditEventType::BackupEncrypted => "backup_encrypted",
            AuditEventType::BackupDecrypted => "backup_decrypted",
            AuditEventType::BackupVerified => "backup_verified",
            AuditEventType::UnauthorizedAccessAttempt => "unauthorized_access_attempt",
            AuditEventType::KeyCompromiseSuspected => "key_compromise_suspected",
            AuditEventType::VerificationFailure => "verification_failure",
            AuditEventType::SecurityAlert => "security_alert",
            AuditEventType::ComplianceCheck => "compliance_check",
            AuditEventType::RetentionPolicyApplied => "retention_policy_applied",
            AuditEventType::DataExportRequest => "data_export_request",
            AuditEventType::SystemStartup => "system_startup",
            AuditEventType::SystemShutdown => "system_shutdown",
            AuditEventType::ConfigurationChange => "configuration_change",
        }
    }

    /// Parses a stored tag back into its event type.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        ALL_EVENT_TYPES.iter().copied().find(|t| t.as_str() == tag)
    }

    /// Whether this type belongs to the security incident set.
    #[must_use]
    pub const fn is_security_incident(self) -> bool {
        matches!(
            self,
            AuditEventType::UnauthorizedAccessAttempt
                | AuditEventType::KeyCompromiseSuspected
                | AuditEventType::SecurityAlert
        )
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const ALL_EVENT_TYPES: &[AuditEventType] = &[
    AuditEventType::DocumentEncrypted,
    AuditEventType::DocumentDecrypted,
    AuditEventType::EncryptionFailed,
    AuditEventType::DecryptionFailed,
    AuditEventType::KeyCreated,
    AuditEventType::KeyAccessed,
    AuditEventType::KeyRotated,
    AuditEventType::KeyDeprecated,
    AuditEventType::KeyRevoked,
    AuditEventType::BackupEncrypted,
    AuditEventType::BackupDecrypted,
    AuditEventType::BackupVerified,
    AuditEventType::UnauthorizedAccessAttempt,
    AuditEventType::KeyCompromiseSuspected,
    AuditEventType::VerificationFailure,
    AuditEventType::SecurityAlert,
    AuditEventType::ComplianceCheck,
    AuditEventType::RetentionPolicyApplied,
    AuditEventType::DataExportRequest,
    AuditEventType::SystemStartup,
    AuditEventType::SystemShutdown,
    AuditEventType::ConfigurationChange,
];

/// Severity attached to an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
    Critical,
    Security,
}

impl EventLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EventLevel::Info => "info",
            EventLevel::Warning => "warning",
            EventLevel::Error => "error",
            EventLevel::Critical => "critical",
            EventLevel::Security => "security",
        }
    }

    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "info" => Some(EventLevel::Info),
            "warning" => Some(EventLevel::Warning),
            "error" => Some(EventLevel::Error),
            "critical" => Some(EventLevel::Critical),
            "security" => Some(EventLevel::Security),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compliance tag attached to events by deterministic predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplianceFlag {
    AttorneyClientPrivilege,
    PersonalData,
    DocumentRetention,
    SecurityIncident,
}

/// Host/process context captured on every event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityContext {
    pub process_id: u32,
    pub thread: String,
    pub hostname: String,
}

impl SecurityContext {
    #[must_use]
    pub fn capture() -> Self {
        let thread = std::thread::current();
        Self {
            process_id: std::process::id(),
            thread: thread
                .name()
                .map_or_else(|| format!("{:?}", thread.id()), str::to_string),
            hostname: std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("COMPUTERNAME"))
                .unwrap_or_else(|_| "unknown".to_string()),
        }
    }
}

/// One immutable entry of the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub event_type: AuditEventType,
    pub event_level: EventLevel,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub user_id: Option<String>,
    pub client_id: Option<String>,
    pub matter_id: Option<String>,
    pub document_id: Option<String>,
    pub key_id: Option<String>,
    pub source_service: String,
    pub source_function: String,
    pub details: serde_json::Value,
    pub security_context: SecurityContext,
    pub compliance_flags: Vec<ComplianceFlag>,
    #[serde(with = "time::serde::rfc3339")]
    pub retention_until: OffsetDateTime,
}

/// Audit ledger configuration.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// SQLite database backing the ledger.
    pub db_path: PathBuf,
    /// Buffered events are flushed once this many accumulate.
    pub max_buffer_size: usize,
    /// The background worker also flushes on this period.
    pub flush_interval_secs: u64,
    /// Per-event-type retention overrides, in days.
    pub retention_overrides: HashMap<AuditEventType, i64>,
    /// Substrings that mark details as containing personal data.
    pub pii_markers: Vec<String>,
}

impl AuditConfig {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self {
            db_path,
            max_buffer_size: 1000,
            flush_interval_secs: 60,
            retention_overrides: HashMap::new(),
            pii_markers: vec!["personal_data".to_string()],
        }
    }
}

/// Retention window in days for an event, derived purely from its type and
/// level: security material keeps for ten years, key lifecycle and document
/// operations for seven, compliance events for ten, everything else three.
#[must_use]
pub fn retention_days(event_type: AuditEventType, level: EventLevel) -> i64 {
    if level == EventLevel::Security || event_type.is_security_incident() {
        return 3650;
    }
    match event_type {
        AuditEventType::KeyCreated | AuditEventType::KeyRotated | AuditEventType::KeyRevoked => {
            2555
        }
        AuditEventType::DocumentEncrypted | AuditEventType::DocumentDecrypted => 2555,
        AuditEventType::ComplianceCheck | AuditEventType::DataExportRequest => 3650,
        _ => 1095,
    }
}

/// Derives the compliance flags for an event from its type and details.
#[must_use]
pub fn compliance_flags(
    event_type: AuditEventType,
    details: &serde_json::Value,
    pii_markers: &[String],
) -> Vec<ComplianceFlag> {
    let mut flags = Vec::new();

    if details
        .get("compliance_level")
        .and_then(serde_json::Value::as_str)
        .is_some_and(|level| level.eq_ignore_ascii_case("attorney_client"))
    {
        flags.push(ComplianceFlag::AttorneyClientPrivilege);
    }

    if !pii_markers.is_empty() {
        let haystack = details.to_string().to_lowercase();
        if pii_markers.iter().any(|m| haystack.contains(&m.to_lowercase())) {
            flags.push(ComplianceFlag::PersonalData);
        }
    }

    if matches!(
        event_type,
        AuditEventType::DocumentEncrypted | AuditEventType::DocumentDecrypted
    ) {
        flags.push(ComplianceFlag::DocumentRetention);
    }

    if event_type.is_security_incident() {
        flags.push(ComplianceFlag::SecurityIncident);
    }

    flags
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_event_type_tags_roundtrip() {
        assert_eq!(ALL_EVENT_TYPES.len(), 22);
        for event_type in ALL_EVENT_TYPES {
            assert_eq!(AuditEventType::from_tag(event_type.as_str()), Some(*event_type));
        }
        assert_eq!(AuditEventType::from_tag("coffee_break"), None);
    }

    #[test]
    fn test_retention_table() {
        use AuditEventType as T;
        use EventLevel as L;

        // Security material: ten years regardless of path.
        assert_eq!(retention_days(T::KeyCompromiseSuspected, L::Warning), 3650);
        assert_eq!(retention_days(T::UnauthorizedAccessAttempt, L::Info), 3650);
        assert_eq!(retention_days(T::SecurityAlert, L::Security), 3650);
        assert_eq!(retention_days(T::DocumentEncrypted, L::Security), 3650);

        // Key lifecycle and document operations: seven years.
        assert_eq!(retention_days(T::KeyCreated, L::Info), 2555);
        assert_eq!(retention_days(T::KeyRotated, L::Info), 2555);
        assert_eq!(retention_days(T::KeyRevoked, L::Warning), 2555);
        assert_eq!(retention_days(T::DocumentEncrypted, L::Info), 2555);
        assert_eq!(retention_days(T::DocumentDecrypted, L::Info), 2555);

        // Compliance: ten years.
        assert_eq!(retention_days(T::ComplianceCheck, L::Info), 3650);
        assert_eq!(retention_days(T::DataExportRequest, L::Info), 3650);

        // Everything else: three years.
        assert_eq!(retention_days(T::SystemStartup, L::Info), 1095);
        assert_eq!(retention_days(T::BackupEncrypted, L::Info), 1095);
        assert_eq!(retention_days(T::KeyDeprecated, L::Info), 1095);
    }

    #[test]
    fn test_compliance_flag_predicates() {
        let markers = vec!["personal_data".to_string()];

        let details = serde_json::json!({ "compliance_level": "attorney_client" });
        let flags = compliance_flags(AuditEventType::DocumentEncrypted, &details, &markers);
        assert!(flags.contains(&ComplianceFlag::AttorneyClientPrivilege));
        assert!(flags.contains(&ComplianceFlag::DocumentRetention));

        let details = serde_json::json!({ "note": "contains PERSONAL_DATA export" });
        let flags = compliance_flags(AuditEventType::SystemStartup, &details, &markers);
        assert_eq!(flags, vec![ComplianceFlag::PersonalData]);

        let flags = compliance_flags(
            AuditEventType::SecurityAlert,
            &serde_json::json!({}),
            &markers,
        );
        assert_eq!(flags, vec![ComplianceFlag::SecurityIncident]);

        let flags = compliance_flags(
            AuditEventType::SystemShutdown,
            &serde_json::json!({}),
            &markers,
        );
        assert!(flags.is_empty());
    }

    #[test]
    fn test_compliance_flag_serde_tags() {
        let json = serde_json::to_string(&ComplianceFlag::AttorneyClientPrivilege).unwrap();
        assert_eq!(json, "\"ATTORNEY_CLIENT_PRIVILEGE\"");
    }

    #[test]
    fn test_security_context_capture() {
        let ctx = SecurityContext::capture();
        assert_eq!(ctx.process_id, std::process::id());
        assert!(!ctx.hostname.is_empty());
    }
}
