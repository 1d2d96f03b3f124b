use anyhow::{anyhow, Context, Result};
use chancery_audit::{
    AuditConfig, AuditEventType, AuditLedger, ComplianceReport, EventLevel, EventScope,
};
use chancery_backup::{BackupConfig, BackupEncryptor, BackupKind, BackupOutcome, RestorationReport};
use chancery_encrypt::{DocumentEncryptor, EncryptionOutcome, EncryptorConfig};
use chancery_monitor::{MonitorConfig, VerificationLevel, VerificationMonitor};
use chancery_vault::{KeyCreation, KeyStore, KeyStoreConfig, LocalKeyVault};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{info, warn};

/// Overall platform health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SystemHealth {
    Healthy,
    Degraded,
    Critical,
}

impl std::fmt::Display for SystemHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SystemHealth::Healthy => "HEALTHY",
            SystemHealth::Degraded => "DEGRADED",
            SystemHealth::Critical => "CRITICAL",
        })
    }
}

/// Aggregated platform status.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub total_encrypted_documents: usize,
    pub total_backup_archives: usize,
    pub total_managed_keys: usize,
    pub verification_success_rate: f64,
    pub keys_due_for_rotation: usize,
    pub keys_overdue: usize,
    pub audit_events_total: u64,
    pub security_events_7d: u64,
    pub monitoring_active: bool,
    pub health: SystemHealth,
    pub recommendations: Vec<String>,
}

/// Bundle returned by [`Platform::perform_comprehensive_audit`].
#[derive(Debug, Clone, Serialize)]
pub struct ComprehensiveAudit {
    pub report: ComplianceReport,
    pub status: SystemStatus,
}

/// Platform-wide configuration, one section per subsystem.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub data_root: PathBuf,
    pub key_store: KeyStoreConfig,
    pub encryptor: EncryptorConfig,
    pub backup: BackupConfig,
    pub audit: AuditConfig,
    pub monitor: MonitorConfig,
}

impl PlatformConfig {
    /// Standard layout with every subsystem under one data root.
    #[must_use]
    pub fn under_root(root: &Path) -> Self {
        Self {
            data_root: root.to_path_buf(),
            key_store: KeyStoreConfig::default(),
            encryptor: EncryptorConfig::under_root(root),
            backup: BackupConfig::under_root(root),
            audit: AuditConfig::new(root.join("audit").join("ledger.db")),
            monitor: MonitorConfig::under_root(root),
        }
    }
}

/// The integration facade: owns every subsystem and composes the
/// end-to-end flows.
///
/// Construction order is fixed (master key, then key store consumers,
/// then the audit ledger, then the verification monitor) and
/// [`Platform::shutdown`] unwinds it: no background worker outlives the
/// facade. This is also the only layer that composes human-readable error
/// strings; everything beneath it returns typed kinds.
pub struct Platform {
    keys: Arc<KeyStore>,
    documents: Arc<DocumentEncryptor>,
    backups: BackupEncryptor,
    ledger: Arc<AuditLedger>,
    monitor: Arc<VerificationMonitor>,
}

impl Platform {
    /// Opens (or initializes) a platform instance at the configured data
    /// root and records `SYSTEM_STARTUP`.
    ///
    /// # Errors
    /// Fails when any subsystem cannot be brought up.
    pub fn open(config: PlatformConfig) -> Result<Self> {
        let vault = LocalKeyVault::open(config.data_root.join("secure_vault"))
            .context("failed to open key vault")?;
        let keys = Arc::new(KeyStore::new(Arc::new(vault), config.key_store));
        keys.ensure_master().context("failed to ensure master key")?;

        let documents = Arc::new(
            DocumentEncryptor::new(Arc::clone(&keys), config.encryptor)
                .context("failed to initialize document encryptor")?,
        );
        let backups = BackupEncryptor::new(Arc::clone(&keys), config.backup)
            .context("failed to initialize backup encryptor")?;

        let ledger =
            Arc::new(AuditLedger::open(config.audit).context("failed to open audit ledger")?);
        Arc::clone(&ledger).start_flush_worker();

        let monitor = Arc::new(
            VerificationMonitor::open(
                Arc::clone(&documents),
                Arc::clone(&keys),
                Arc::clone(&ledger),
                config.monitor,
            )
            .context("failed to open verification monitor")?,
        );

        ledger.log_event(
            AuditEventType::SystemStartup,
            EventLevel::Info,
            serde_json::json!({ "data_root": config.data_root.display().to_string() }),
            EventScope::new("platform", "open"),
        )?;
        info!(data_root = %config.data_root.display(), "platform initialized");

        Ok(Self {
            keys,
            documents,
            backups,
            ledger,
            monitor,
        })
    }

    /// Starts the continuous verification scheduler.
    pub fn start_monitoring(&self) {
        Arc::clone(&self.monitor).start();
    }

    /// Records `SYSTEM_SHUTDOWN`, stops the verification scheduler and the
    /// audit flush worker, and flushes remaining events.
    ///
    /// # Errors
    /// Fails when the final ledger flush cannot reach the store.
    pub fn shutdown(&self) -> Result<()> {
        self.ledger.log_event(
            AuditEventType::SystemShutdown,
            EventLevel::Info,
            serde_json::json!({ "monitoring_active": self.monitor.is_running() }),
            EventScope::new("platform", "shutdown"),
        )?;
        self.monitor.stop();
        self.ledger.stop().context("failed to flush audit ledger")?;
        info!("platform shut down");
        Ok(())
    }

    /// Encrypts a file for a client matter: ensures the tenant key exists,
    /// records the key access, encrypts, audits `DOCUMENT_ENCRYPTED`, and
    /// runs an initial verification of the fresh container.
    ///
    /// # Errors
    /// Failures are audited (`ENCRYPTION_FAILED`) and returned with
    /// context.
    pub fn encrypt_client_document(
        &self,
        path: &Path,
        client_id: &str,
        matter_id: &str,
        compliance_level: &str,
    ) -> Result<EncryptionOutcome> {
        let plaintext = std::fs::read(path)
            .with_context(|| format!("failed to read document {}", path.display()))?;
        let document_id = new_document_id(client_id, matter_id);
        let original_filename = path.file_name().and_then(|n| n.to_str());

        let (key_id, creation) = self
            .keys
            .create_client_matter_key(client_id, matter_id, compliance_level)
            .context("failed to resolve tenant key")?;
        if creation == KeyCreation::Created {
            self.ledger.log_event(
                AuditEventType::KeyCreated,
                EventLevel::Info,
                serde_json::json!({
                    "key_id": &key_id,
                    "compliance_level": compliance_level,
                    "algorithm": "AES-256-GCM",
                }),
                EventScope::new("platform", "encrypt_client_document")
                    .tenant(client_id, matter_id)
                    .key(&key_id),
            )?;
        }
        self.ledger.log_key_access(
            &key_id,
            "DOCUMENT_ENCRYPTION",
            None,
            Some(client_id),
            Some(matter_id),
            true,
            None,
        )?;

        match self.documents.encrypt_document(
            &plaintext,
            &document_id,
            client_id,
            matter_id,
            compliance_level,
            original_filename,
        ) {
            Ok(outcome) => {
                self.ledger.log_event(
                    AuditEventType::DocumentEncrypted,
                    EventLevel::Info,
                    serde_json::json!({
                        "document_id": &document_id,
                        "compliance_level": compliance_level,
                        "file_size": plaintext.len(),
                        "encryption_algorithm": &outcome.record.algorithm,
                    }),
                    EventScope::new("platform", "encrypt_client_document")
                        .tenant(client_id, matter_id)
                        .document(&document_id)
                        .key(&key_id),
                )?;

                // The encryption event is already sequenced in the ledger,
                // so any verification event for this document orders after
                // it.
                let _ = self
                    .monitor
                    .verify_document(&document_id, VerificationLevel::Standard);

                Ok(outcome)
            }
            Err(e) => {
                self.ledger.log_failed_operation(
                    "document_encryption",
                    Some(&document_id),
                    Some(&key_id),
                    &e.to_string(),
                )?;
                Err(anyhow!(e)).with_context(|| format!("failed to encrypt document {document_id}"))
            }
        }
    }

    /// Decrypts a document for a client matter. Key access and the outcome
    /// are audited either way; decryption activity for the document is
    /// re-evaluated afterwards so bursts of failures raise alerts. The
    /// plaintext is returned to the caller and never logged.
    ///
    /// # Errors
    /// Failures are audited (`DECRYPTION_FAILED` / denied key access) and
    /// returned with context.
    pub fn decrypt_client_document(
        &self,
        document_id: &str,
        client_id: &str,
        matter_id: &str,
        user_id: Option<&str>,
    ) -> Result<Vec<u8>> {
        let key_id = match self.keys.get_client_matter_key(client_id, matter_id) {
            Ok((_, key_id)) => {
                self.ledger.log_key_access(
                    &key_id,
                    "DOCUMENT_DECRYPTION",
                    user_id,
                    Some(client_id),
                    Some(matter_id),
                    true,
                    None,
                )?;
                Some(key_id)
            }
            Err(e) => {
                self.ledger.log_key_access(
                    "unknown",
                    "DOCUMENT_DECRYPTION",
                    user_id,
                    Some(client_id),
                    Some(matter_id),
                    false,
                    Some(&e.to_string()),
                )?;
                None
            }
        };

        let result = self
            .documents
            .decrypt_document(document_id, client_id, matter_id);

        match result {
            Ok(plaintext) => {
                let compliance_level = self
                    .documents
                    .document_record(document_id)
                    .ok()
                    .flatten()
                    .map(|r| r.compliance_level);
                self.ledger.log_event(
                    AuditEventType::DocumentDecrypted,
                    EventLevel::Info,
                    serde_json::json!({
                        "document_id": document_id,
                        "compliance_level": compliance_level,
                        "requested_by": user_id,
                        "file_size": plaintext.len(),
                    }),
                    {
                        let mut scope = EventScope::new("platform", "decrypt_client_document")
                            .tenant(client_id, matter_id)
                            .document(document_id);
                        scope.user_id = user_id.map(str::to_string);
                        scope.key_id = key_id;
                        scope
                    },
                )?;
                self.ledger.track_decryption_attempts(document_id, 60)?;
                Ok(plaintext)
            }
            Err(e) => {
                warn!(document_id, client_id, matter_id, error = %e, "decryption failed");
                self.ledger.log_failed_operation(
                    "document_decryption",
                    Some(document_id),
                    key_id.as_deref(),
                    &e.to_string(),
                )?;
                self.ledger.track_decryption_attempts(document_id, 60)?;
                Err(anyhow!(e))
                    .with_context(|| format!("failed to decrypt document {document_id}"))
            }
        }
    }

    /// Creates an encrypted backup, immediately runs the restoration
    /// self-test, and audits both steps.
    ///
    /// # Errors
    /// Creation failures are audited and returned with context.
    pub fn create_encrypted_backup(
        &self,
        kind: BackupKind,
        source: &str,
    ) -> Result<(BackupOutcome, RestorationReport)> {
        let outcome = match self.backups.create_backup(kind, source) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.ledger.log_failed_operation(
                    "backup_encryption",
                    None,
                    None,
                    &e.to_string(),
                )?;
                return Err(anyhow!(e)).context("failed to create backup");
            }
        };

        self.ledger.log_event(
            AuditEventType::BackupEncrypted,
            EventLevel::Info,
            serde_json::json!({
                "backup_id": &outcome.backup_id,
                "backup_type": &outcome.record.backup_type,
                "original_size": outcome.record.original_size,
                "compressed_size": outcome.record.compressed_size,
                "compression": &outcome.record.compression,
            }),
            EventScope::new("platform", "create_encrypted_backup").key(&outcome.record.key_id),
        )?;

        let report = self
            .backups
            .test_restoration(&outcome.backup_id)
            .context("restoration self-test failed to run")?;
        self.ledger.log_event(
            AuditEventType::BackupVerified,
            if report.success {
                EventLevel::Info
            } else {
                EventLevel::Warning
            },
            serde_json::json!({
                "backup_id": &outcome.backup_id,
                "test_successful": report.success,
                "errors": &report.errors,
            }),
            EventScope::new("platform", "create_encrypted_backup"),
        )?;

        Ok((outcome, report))
    }

    /// Rotates the active key of a client matter and audits `KEY_ROTATED`
    /// with the rotation reason.
    ///
    /// # Errors
    /// Rotation refusals (`RotationNotDue`, `ApprovalRequired`) and vault
    /// failures are returned with context; the typed kind is preserved as
    /// the error source.
    pub fn rotate_keys_for_client_matter(
        &self,
        client_id: &str,
        matter_id: &str,
        force: bool,
    ) -> Result<String> {
        let (_, old_key_id) = self
            .keys
            .get_client_matter_key(client_id, matter_id)
            .context("no active key for client matter")?;

        let new_key_id = match self.keys.rotate(&old_key_id, force) {
            Ok(id) => id,
            Err(e) => {
                return Err(anyhow!(e))
                    .with_context(|| format!("failed to rotate key {old_key_id}"))
            }
        };

        self.ledger.log_event(
            AuditEventType::KeyRotated,
            EventLevel::Info,
            serde_json::json!({
                "old_key_id": &old_key_id,
                "new_key_id": &new_key_id,
                "rotation_reason": if force { "forced" } else { "scheduled" },
            }),
            EventScope::new("platform", "rotate_keys_for_client_matter")
                .tenant(client_id, matter_id)
                .key(&new_key_id),
        )?;
        self.ledger.log_event(
            AuditEventType::KeyDeprecated,
            EventLevel::Info,
            serde_json::json!({ "key_id": &old_key_id, "replaced_by": &new_key_id }),
            EventScope::new("platform", "rotate_keys_for_client_matter")
                .tenant(client_id, matter_id)
                .key(&old_key_id),
        )?;
        Ok(new_key_id)
    }

    /// Marks a key compromised and audits `KEY_COMPROMISE_SUSPECTED` at
    /// security level.
    ///
    /// # Errors
    /// Fails when the key does not exist or the ledger rejects the event.
    pub fn report_key_compromise(&self, key_id: &str, reason: &str) -> Result<()> {
        self.keys
            .mark_compromised(key_id, reason)
            .with_context(|| format!("failed to mark key {key_id} compromised"))?;
        self.ledger.log_event(
            AuditEventType::KeyCompromiseSuspected,
            EventLevel::Security,
            serde_json::json!({ "key_id": key_id, "reason": reason }),
            EventScope::new("platform", "report_key_compromise").key(key_id),
        )?;
        Ok(())
    }

    /// Revokes a key and audits `KEY_REVOKED`.
    ///
    /// # Errors
    /// Fails when the key does not exist or the ledger rejects the event.
    pub fn revoke_key(&self, key_id: &str, reason: &str) -> Result<()> {
        self.keys
            .revoke(key_id, reason)
            .with_context(|| format!("failed to revoke key {key_id}"))?;
        self.ledger.log_event(
            AuditEventType::KeyRevoked,
            EventLevel::Warning,
            serde_json::json!({ "key_id": key_id, "reason": reason }),
            EventScope::new("platform", "revoke_key").key(key_id),
        )?;
        Ok(())
    }

    /// Aggregates counts and health across every subsystem.
    ///
    /// # Errors
    /// Fails when a subsystem's statistics cannot be read.
    pub fn system_status(&self) -> Result<SystemStatus> {
        let documents = self.documents.list_documents()?;
        let backups = self.backups.list_backups()?;
        let total_managed_keys = self.keys.key_count()?;
        let rotation_due = self.keys.list_due_for_rotation()?;
        let overdue = rotation_due.iter().filter(|d| d.overdue).count();
        let audit_stats = self.ledger.statistics()?;
        let verification = self.monitor.statistics()?;

        let verified_total: u64 = verification.values().sum();
        let verified_ok = verification.get("encrypted").copied().unwrap_or(0);
        let verification_success_rate = if verified_total == 0 {
            1.0
        } else {
            verified_ok as f64 / verified_total as f64
        };

        let mut health = SystemHealth::Healthy;
        let mut recommendations = Vec::new();

        if verification_success_rate < 0.95 {
            health = SystemHealth::Degraded;
            recommendations.push(format!(
                "Verification success rate is low: {:.1}%",
                verification_success_rate * 100.0
            ));
        }
        if !rotation_due.is_empty() {
            if health == SystemHealth::Healthy {
                health = SystemHealth::Degraded;
            }
            recommendations.push(format!("{} keys are due for rotation", rotation_due.len()));
        }
        if overdue > 5 {
            health = SystemHealth::Critical;
            recommendations.push(format!("{overdue} keys are overdue for rotation"));
        }
        if audit_stats.security_events_7d > 10 {
            if health != SystemHealth::Critical {
                health = SystemHealth::Degraded;
            }
            recommendations.push(format!(
                "High number of security events: {}",
                audit_stats.security_events_7d
            ));
        }

        Ok(SystemStatus {
            total_encrypted_documents: documents.len(),
            total_backup_archives: backups.len(),
            total_managed_keys,
            verification_success_rate,
            keys_due_for_rotation: rotation_due.len(),
            keys_overdue: overdue,
            audit_events_total: audit_stats.total_events,
            security_events_7d: audit_stats.security_events_7d,
            monitoring_active: self.monitor.is_running(),
            health,
            recommendations,
        })
    }

    /// Generates a compliance report over the period and bundles it with
    /// the current system status.
    ///
    /// # Errors
    /// Fails on ledger or status errors.
    pub fn perform_comprehensive_audit(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
        client_id: Option<&str>,
    ) -> Result<ComprehensiveAudit> {
        let report = self
            .ledger
            .generate_compliance_report("COMPREHENSIVE_AUDIT", start, end, client_id, None)
            .context("failed to generate compliance report")?;
        let status = self.system_status()?;
        Ok(ComprehensiveAudit { report, status })
    }

    /// Direct access to the subsystems for advanced callers and tests.
    #[must_use]
    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    #[must_use]
    pub fn documents(&self) -> &Arc<DocumentEncryptor> {
        &self.documents
    }

    #[must_use]
    pub fn backups(&self) -> &BackupEncryptor {
        &self.backups
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<AuditLedger> {
        &self.ledger
    }

    #[must_use]
    pub fn monitor(&self) -> &Arc<VerificationMonitor> {
        &self.monitor
    }
}

fn new_document_id(client_id: &str, matter_id: &str) -> String {
    let stamp = OffsetDateTime::now_utc()
        .format(format_description!("[year][month][day]_[hour][minute][second]"))
        .unwrap_or_else(|_| "00000000_000000".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("client_{client_id}_matter_{matter_id}_{stamp}_{}", &suffix[..8])
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_document_id_shape() {
        let id = new_document_id("c1", "m1");
        assert!(id.starts_with("client_c1_matter_m1_"));
        let other = new_document_id("c1", "m1");
        assert_ne!(id, other);
    }
}
