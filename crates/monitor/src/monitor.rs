use crate::{
    DocumentStatus, FailureEntry, MonitorConfig, MonitorError, RemediationHooks,
    VerificationLevel, VerificationRecord,
};
use chancery_audit::{AuditEventType, AuditLedger, EventLevel, EventScope};
use chancery_crypto::{constant_time_eq, sha256_hex};
use chancery_encrypt::{DocumentEncryptor, DocumentRecord, EncryptError};
use chancery_vault::{KeyStore, KeyStatus, KmsError};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{error, info, warn};

/// Aggregate result of one verification sweep.
#[derive(Debug, Clone)]
pub struct SweepSummary {
    pub level: VerificationLevel,
    pub total_documents: usize,
    pub encrypted: usize,
    pub failed: usize,
    pub failure_rate: f64,
    pub duration_ms: u128,
    pub alert_raised: bool,
}

type FailureCallback = Box<dyn Fn(&VerificationRecord) + Send + Sync>;
type AlertCallback = Box<dyn Fn(&str, &serde_json::Value) + Send + Sync>;

/// Continuous, tiered verification of the encrypted document inventory.
///
/// A background worker runs standard sweeps on a fixed interval and
/// promotes to comprehensive sweeps once per configured period; every
/// non-encrypted outcome is tracked per document, audited, and (when
/// enabled) handed to the registered remediation hooks with a bounded
/// number of attempts per window.
pub struct VerificationMonitor {
    encryptor: Arc<DocumentEncryptor>,
    keys: Arc<KeyStore>,
    ledger: Arc<AuditLedger>,
    config: MonitorConfig,
    conn: Mutex<Connection>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    hooks: Mutex<Option<Arc<dyn RemediationHooks>>>,
    failure_callbacks: Mutex<Vec<FailureCallback>>,
    alert_callbacks: Mutex<Vec<AlertCallback>>,
}

impl VerificationMonitor {
    /// Opens the monitor store and wires the collaborators.
    ///
    /// # Errors
    /// Fails when the monitor database cannot be opened or migrated.
    pub fn open(
        encryptor: Arc<DocumentEncryptor>,
        keys: Arc<KeyStore>,
        ledger: Arc<AuditLedger>,
        config: MonitorConfig,
    ) -> Result<Self, MonitorError> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&config.db_path)?;
        let monitor = Self {
            encryptor,
            keys,
            ledger,
            config,
            conn: Mutex::new(conn),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            hooks: Mutex::new(None),
            failure_callbacks: Mutex::new(Vec::new()),
            alert_callbacks: Mutex::new(Vec::new()),
        };
        monitor.migrate()?;
        Ok(monitor)
    }

    fn migrate(&self) -> Result<(), MonitorError> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            r"
        PRAGMA journal_mode=WAL;

        CREATE TABLE IF NOT EXISTS verification_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id TEXT NOT NULL,
            file_path TEXT NOT NULL,
            status TEXT NOT NULL,
            verification_level TEXT NOT NULL,
            verified_at TEXT NOT NULL,
            duration_ms REAL,
            issues TEXT NOT NULL,
            metadata_valid BOOLEAN NOT NULL,
            decryption_successful BOOLEAN NOT NULL,
            integrity_verified BOOLEAN NOT NULL
        );

        CREATE TABLE IF NOT EXISTS failure_tracking (
            document_id TEXT PRIMARY KEY,
            failure_count INTEGER DEFAULT 0,
            first_failure_at TEXT,
            last_failure_at TEXT,
            last_success_at TEXT,
            remediation_attempts INTEGER DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_verification_document_id
        ON verification_results(document_id);

        CREATE INDEX IF NOT EXISTS idx_verification_status
        ON verification_results(status);

        CREATE INDEX IF NOT EXISTS idx_verification_verified_at
        ON verification_results(verified_at);
        ",
        )?;
        Ok(())
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, MonitorError> {
        self.conn.lock().map_err(|_| MonitorError::Poisoned)
    }

    /// Registers the remediation collaborators.
    pub fn set_remediation_hooks(&self, hooks: Arc<dyn RemediationHooks>) {
        if let Ok(mut slot) = self.hooks.lock() {
            *slot = Some(hooks);
        }
    }

    /// Registers a callback invoked on every failed verification.
    pub fn on_failure(&self, callback: FailureCallback) {
        if let Ok(mut callbacks) = self.failure_callbacks.lock() {
            callbacks.push(callback);
        }
    }

    /// Registers a callback invoked when a sweep raises an alert.
    pub fn on_alert(&self, callback: AlertCallback) {
        if let Ok(mut callbacks) = self.alert_callbacks.lock() {
            callbacks.push(callback);
        }
    }

    /// Verifies one document at the requested level and records the result.
    ///
    /// # Errors
    /// Fails only on monitor-store errors; verification findings are
    /// reported in the returned record.
    pub fn verify_document(
        &self,
        document_id: &str,
        level: VerificationLevel,
    ) -> Result<VerificationRecord, MonitorError> {
        self.verify_inner(document_id, level, self.config.auto_remediation_enabled)
    }

    fn verify_inner(
        &self,
        document_id: &str,
        level: VerificationLevel,
        allow_remediation: bool,
    ) -> Result<VerificationRecord, MonitorError> {
        let started = Instant::now();
        let verified_at = OffsetDateTime::now_utc();
        let mut issues: Vec<String> = Vec::new();
        let mut metadata_valid = false;
        let mut decryption_successful = false;
        let mut integrity_verified = false;
        let mut file_path = String::new();

        // Basic tier: inventory record, container presence, key health.
        let record: Option<DocumentRecord> = match self.encryptor.document_record(document_id) {
            Ok(Some(record)) => {
                metadata_valid = true;
                file_path = record.container_path.display().to_string();
                Some(record)
            }
            Ok(None) => {
                issues.push("document metadata not found".to_string());
                None
            }
            Err(e) => {
                issues.push(format!("document metadata unreadable: {e}"));
                None
            }
        };

        if let Some(record) = &record {
            if !record.container_path.exists() {
                issues.push("encrypted container not found".to_string());
            }
            match self.keys.key_record(&record.key_id) {
                Ok(key) if key.status == KeyStatus::Revoked || key.status == KeyStatus::Compromised => {
                    issues.push(format!("key {} is {}", record.key_id, key.status));
                }
                Ok(_) => {}
                Err(KmsError::NotFound(_)) => {
                    issues.push(format!("key {} not found in vault", record.key_id));
                }
                Err(e) => issues.push(format!("key lookup failed: {e}")),
            }

            // Standard tier: container schema.
            if issues.is_empty() && level >= VerificationLevel::Standard {
                match self.encryptor.load_container(document_id) {
                    Ok(container) => {
                        if container.salt.len() != 16 || container.nonce.len() != 12 {
                            issues.push("container has malformed salt or nonce".to_string());
                        }
                        if container.plaintext_hash.len() != 32 {
                            issues.push("container has malformed plaintext hash".to_string());
                        }
                        if chancery_crypto::Algorithm::from_tag(&container.algorithm).is_none() {
                            issues.push(format!("unknown container algorithm {}", container.algorithm));
                        }
                    }
                    Err(EncryptError::UnsupportedContainer(v)) => {
                        issues.push(format!("unsupported container version {v}"));
                    }
                    Err(e) => issues.push(format!("invalid container format: {e}")),
                }
            }

            // Comprehensive tier: full decryption.
            if issues.is_empty() && level >= VerificationLevel::Comprehensive {
                match self
                    .encryptor
                    .decrypt_document(document_id, &record.client_id, &record.matter_id)
                {
                    Ok(plaintext) => {
                        decryption_successful = true;
                        // Forensic tier: recomputed digest against the
                        // inventory record.
                        if level == VerificationLevel::Forensic {
                            let digest = sha256_hex(&plaintext);
                            if constant_time_eq(
                                digest.as_bytes(),
                                record.plaintext_sha256.as_bytes(),
                            ) {
                                integrity_verified = true;
                            } else {
                                issues.push("recorded digest does not match plaintext".to_string());
                            }
                        }
                    }
                    Err(e) => issues.push(format!("decryption failed: {e}")),
                }
            }
        }

        let status = classify(&issues, metadata_valid);
        let verification = VerificationRecord {
            document_id: document_id.to_string(),
            file_path,
            status,
            level,
            verified_at,
            duration_ms: started.elapsed().as_millis(),
            issues,
            metadata_valid,
            decryption_successful,
            integrity_verified,
        };

        self.store_result(&verification)?;

        if status == DocumentStatus::Encrypted {
            self.record_success(document_id)?;
        } else {
            warn!(document_id, %status, issues = ?verification.issues, "verification failed");
            self.record_failure(document_id)?;
            self.ledger.log_event(
                AuditEventType::VerificationFailure,
                EventLevel::Security,
                serde_json::json!({
                    "document_id": document_id,
                    "status": status.as_str(),
                    "verification_level": level.as_str(),
                    "issues": &verification.issues,
                }),
                EventScope::new("verification_monitor", "verify_document").document(document_id),
            )?;
            self.notify_failure(&verification);
            if allow_remediation {
                self.remediate(&verification, record.as_ref())?;
            }
        }

        Ok(verification)
    }

    /// Runs one verification sweep over the whole document inventory and
    /// raises `PATTERN_HIGH_FAILURE_RATE` when the failure rate exceeds the
    /// configured threshold.
    ///
    /// # Errors
    /// Fails on inventory or monitor-store errors.
    pub fn sweep(&self, level: VerificationLevel) -> Result<SweepSummary, MonitorError> {
        let started = Instant::now();
        let documents = self.encryptor.list_documents()?;

        let mut encrypted = 0usize;
        let mut failed = 0usize;
        for record in &documents {
            let result = self.verify_document(&record.document_id, level)?;
            if result.status == DocumentStatus::Encrypted {
                encrypted += 1;
            } else {
                failed += 1;
            }
        }

        let total = documents.len();
        let failure_rate = if total == 0 {
            0.0
        } else {
            failed as f64 / total as f64
        };

        let mut alert_raised = false;
        if failure_rate > self.config.alert_threshold_failure_rate {
            alert_raised = true;
            let details = serde_json::json!({
                "alert_type": "PATTERN_HIGH_FAILURE_RATE",
                "failure_rate": failure_rate,
                "threshold": self.config.alert_threshold_failure_rate,
                "failed_count": failed,
                "total_count": total,
                "verification_level": level.as_str(),
            });
            self.ledger.log_event(
                AuditEventType::SecurityAlert,
                EventLevel::Security,
                details.clone(),
                EventScope::new("verification_monitor", "sweep"),
            )?;
            if let Ok(callbacks) = self.alert_callbacks.lock() {
                for callback in callbacks.iter() {
                    callback("PATTERN_HIGH_FAILURE_RATE", &details);
                }
            }
        }

        let summary = SweepSummary {
            level,
            total_documents: total,
            encrypted,
            failed,
            failure_rate,
            duration_ms: started.elapsed().as_millis(),
            alert_raised,
        };
        info!(
            level = %level,
            total,
            encrypted,
            failed,
            "verification sweep completed"
        );
        Ok(summary)
    }

    /// Starts the background scheduler: standard sweeps every configured
    /// interval, promoted to comprehensive once per comprehensive period.
    pub fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("verification monitor already running");
            return;
        }
        let monitor = Arc::clone(&self);
        let running = Arc::clone(&self.running);
        let interval = Duration::from_secs(self.config.verification_interval_secs.max(1));
        let comprehensive_every =
            Duration::from_secs(self.config.comprehensive_check_interval_hours.max(1) * 3600);

        let handle = std::thread::Builder::new()
            .name("verification-monitor".to_string())
            .spawn(move || {
                let mut last_comprehensive = Instant::now();
                while running.load(Ordering::SeqCst) {
                    let level = if last_comprehensive.elapsed() >= comprehensive_every {
                        last_comprehensive = Instant::now();
                        VerificationLevel::Comprehensive
                    } else {
                        VerificationLevel::Standard
                    };
                    if let Err(e) = monitor.sweep(level) {
                        error!(error = %e, "verification sweep failed");
                    }

                    // Sleep in short steps so stop() is prompt.
                    let step = Duration::from_millis(250);
                    let mut slept = Duration::ZERO;
                    while slept < interval && running.load(Ordering::SeqCst) {
                        std::thread::sleep(step);
                        slept += step;
                    }
                }
            });
        match handle {
            Ok(handle) => {
                if let Ok(mut worker) = self.worker.lock() {
                    *worker = Some(handle);
                }
                info!("verification monitor started");
            }
            Err(e) => error!(error = %e, "failed to start verification monitor"),
        }
    }

    /// Signals the scheduler to stop and waits for the active sweep to
    /// finish.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
        info!("verification monitor stopped");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Failure-tracking entry for a document, if any.
    ///
    /// # Errors
    /// Fails on monitor-store errors.
    pub fn failure_entry(&self, document_id: &str) -> Result<Option<FailureEntry>, MonitorError> {
        let conn = self.lock_conn()?;
        let entry = conn
            .query_row(
                "SELECT document_id, failure_count, first_failure_at, last_failure_at,
                        last_success_at, remediation_attempts
                 FROM failure_tracking WHERE document_id = ?",
                params![document_id],
                |r| {
                    Ok(FailureEntry {
                        document_id: r.get(0)?,
                        failure_count: r.get(1)?,
                        first_failure_at: r.get(2)?,
                        last_failure_at: r.get(3)?,
                        last_success_at: r.get(4)?,
                        remediation_attempts: r.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    /// Status breakdown of verifications over the last 24 hours.
    ///
    /// # Errors
    /// Fails on monitor-store errors.
    pub fn statistics(&self) -> Result<HashMap<String, u64>, MonitorError> {
        let day_ago = format_ts(OffsetDateTime::now_utc() - time::Duration::hours(24));
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM verification_results
             WHERE verified_at > ? GROUP BY status",
        )?;
        let rows = stmt.query_map(params![day_ago], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, u64>(1)?))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (status, count) = row?;
            out.insert(status, count);
        }
        Ok(out)
    }

    fn store_result(&self, record: &VerificationRecord) -> Result<(), MonitorError> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO verification_results
             (document_id, file_path, status, verification_level, verified_at, duration_ms,
              issues, metadata_valid, decryption_successful, integrity_verified)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.document_id,
                record.file_path,
                record.status.as_str(),
                record.level.as_str(),
                format_ts(record.verified_at),
                record.duration_ms as f64,
                serde_json::to_string(&record.issues).unwrap_or_else(|_| "[]".to_string()),
                record.metadata_valid,
                record.decryption_successful,
                record.integrity_verified
            ],
        )?;
        Ok(())
    }

    fn record_failure(&self, document_id: &str) -> Result<(), MonitorError> {
        let now = format_ts(OffsetDateTime::now_utc());
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE failure_tracking
             SET failure_count = failure_count + 1, last_failure_at = ?
             WHERE document_id = ?",
            params![now, document_id],
        )?;
        if updated == 0 {
            conn.execute(
                "INSERT INTO failure_tracking
                 (document_id, failure_count, first_failure_at, last_failure_at)
                 VALUES (?, 1, ?, ?)",
                params![document_id, now, now],
            )?;
        }
        Ok(())
    }

    fn record_success(&self, document_id: &str) -> Result<(), MonitorError> {
        let now = format_ts(OffsetDateTime::now_utc());
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE failure_tracking SET last_success_at = ? WHERE document_id = ?",
            params![now, document_id],
        )?;
        Ok(())
    }

    fn notify_failure(&self, record: &VerificationRecord) {
        if let Ok(callbacks) = self.failure_callbacks.lock() {
            for callback in callbacks.iter() {
                callback(record);
            }
        }
    }

    // Dispatches remediation by failure class, bounded per document per
    // window.
    fn remediate(
        &self,
        verification: &VerificationRecord,
        record: Option<&DocumentRecord>,
    ) -> Result<(), MonitorError> {
        if !self.claim_remediation_slot(&verification.document_id)? {
            return Ok(());
        }

        match verification.status {
            DocumentStatus::KeyMissing => {
                if let (Some(record), Ok(hooks)) = (record, self.hooks.lock()) {
                    if let Some(hooks) = hooks.as_ref() {
                        let recovered = hooks.recover_key(&verification.document_id, &record.key_id);
                        info!(
                            document_id = %verification.document_id,
                            recovered,
                            "key recovery attempted"
                        );
                    }
                }
            }
            DocumentStatus::Corrupted => {
                if let Ok(hooks) = self.hooks.lock() {
                    if let Some(hooks) = hooks.as_ref() {
                        let restored = hooks.restore_from_backup(&verification.document_id);
                        info!(
                            document_id = %verification.document_id,
                            restored,
                            "backup restoration attempted"
                        );
                    }
                }
            }
            DocumentStatus::VerificationFailed => {
                // One re-verification, with remediation disabled so a
                // persistent failure cannot recurse.
                let _ = self.verify_inner(&verification.document_id, verification.level, false)?;
            }
            _ => {}
        }
        Ok(())
    }

    // Enforces the remediation budget: attempts inside the window are
    // capped; a quiet period resets the counter.
    fn claim_remediation_slot(&self, document_id: &str) -> Result<bool, MonitorError> {
        let now = OffsetDateTime::now_utc();
        let window = time::Duration::hours(self.config.remediation_window_hours as i64);
        let conn = self.lock_conn()?;

        let row: Option<(u64, Option<String>)> = conn
            .query_row(
                "SELECT remediation_attempts, last_failure_at FROM failure_tracking
                 WHERE document_id = ?",
                params![document_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((attempts, last_failure_at)) = row else {
            return Ok(false);
        };

        let stale = last_failure_at
            .and_then(|ts| OffsetDateTime::parse(&ts, &Rfc3339).ok())
            .is_some_and(|ts| now - ts > window);
        let effective_attempts = if stale { 0 } else { attempts };

        if effective_attempts >= self.config.max_remediation_attempts {
            warn!(document_id, attempts, "remediation budget exhausted");
            return Ok(false);
        }

        conn.execute(
            "UPDATE failure_tracking SET remediation_attempts = ? WHERE document_id = ?",
            params![effective_attempts + 1, document_id],
        )?;
        Ok(true)
    }
}

impl Drop for VerificationMonitor {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn classify(issues: &[String], metadata_valid: bool) -> DocumentStatus {
    if issues.is_empty() {
        return DocumentStatus::Encrypted;
    }
    if !metadata_valid {
        return DocumentStatus::Unencrypted;
    }
    let joined = issues.join(" ");
    if joined.contains("key") {
        DocumentStatus::KeyMissing
    } else if joined.contains("decryption failed") {
        DocumentStatus::VerificationFailed
    } else {
        DocumentStatus::Corrupted
    }
}

fn format_ts(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use chancery_audit::{AuditConfig, SearchCriteria};
    use chancery_encrypt::EncryptorConfig;
    use chancery_vault::{KeyStoreConfig, LocalKeyVault};
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    const PLAINTEXT: &[u8] = b"Privileged verification fixture";

    struct Fixture {
        keys: Arc<KeyStore>,
        encryptor: Arc<DocumentEncryptor>,
        ledger: Arc<AuditLedger>,
        monitor: Arc<VerificationMonitor>,
    }

    fn fixture(dir: &TempDir) -> Fixture {
        let vault = LocalKeyVault::open(dir.path().join("vault")).unwrap();
        let keys = Arc::new(KeyStore::new(Arc::new(vault), KeyStoreConfig::default()));
        keys.ensure_master().unwrap();
        keys.create_client_matter_key("c1", "m1", "attorney_client")
            .unwrap();

        let mut encrypt_config = EncryptorConfig::under_root(dir.path());
        encrypt_config.kdf_iterations = 32;
        let encryptor =
            Arc::new(DocumentEncryptor::new(Arc::clone(&keys), encrypt_config).unwrap());

        let ledger =
            Arc::new(AuditLedger::open(AuditConfig::new(dir.path().join("ledger.db"))).unwrap());

        let monitor = Arc::new(
            VerificationMonitor::open(
                Arc::clone(&encryptor),
                Arc::clone(&keys),
                Arc::clone(&ledger),
                MonitorConfig::under_root(dir.path()),
            )
            .unwrap(),
        );

        Fixture {
            keys,
            encryptor,
            ledger,
            monitor,
        }
    }

    fn encrypt_doc(fx: &Fixture, document_id: &str) {
        fx.encryptor
            .encrypt_document(PLAINTEXT, document_id, "c1", "m1", "attorney_client", None)
            .unwrap();
    }

    #[test]
    fn test_healthy_document_passes_all_tiers() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir);
        encrypt_doc(&fx, "doc-ok");

        for level in [
            VerificationLevel::Basic,
            VerificationLevel::Standard,
            VerificationLevel::Comprehensive,
            VerificationLevel::Forensic,
        ] {
            let result = fx.monitor.verify_document("doc-ok", level).unwrap();
            assert_eq!(result.status, DocumentStatus::Encrypted, "{level}");
            assert!(result.metadata_valid);
            assert!(result.issues.is_empty());
        }

        let forensic = fx
            .monitor
            .verify_document("doc-ok", VerificationLevel::Forensic)
            .unwrap();
        assert!(forensic.decryption_successful);
        assert!(forensic.integrity_verified);
    }

    #[test]
    fn test_unknown_document_is_unencrypted() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir);
        let result = fx
            .monitor
            .verify_document("ghost", VerificationLevel::Standard)
            .unwrap();
        assert_eq!(result.status, DocumentStatus::Unencrypted);
        assert!(!result.metadata_valid);
    }

    #[test]
    fn test_revoked_key_is_key_missing() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir);
        encrypt_doc(&fx, "doc-revoked");

        let (_, key_id) = fx.keys.get_client_matter_key("c1", "m1").unwrap();
        fx.keys.revoke(&key_id, "incident response").unwrap();

        let result = fx
            .monitor
            .verify_document("doc-revoked", VerificationLevel::Basic)
            .unwrap();
        assert_eq!(result.status, DocumentStatus::KeyMissing);

        let entry = fx.monitor.failure_entry("doc-revoked").unwrap().unwrap();
        assert_eq!(entry.failure_count, 1);
    }

    #[test]
    fn test_tampered_document_fails_comprehensive_and_audits() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir);
        encrypt_doc(&fx, "doc-tampered");

        let mut container = fx.encryptor.load_container("doc-tampered").unwrap();
        container.ciphertext[0] ^= 0x01;
        std::fs::write(
            fx.encryptor.container_path("doc-tampered"),
            serde_json::to_vec(&container).unwrap(),
        )
        .unwrap();

        // Standard tier only checks the schema, which is intact.
        let standard = fx
            .monitor
            .verify_document("doc-tampered", VerificationLevel::Standard)
            .unwrap();
        assert_eq!(standard.status, DocumentStatus::Encrypted);

        let result = fx
            .monitor
            .verify_document("doc-tampered", VerificationLevel::Comprehensive)
            .unwrap();
        assert_eq!(result.status, DocumentStatus::VerificationFailed);
        assert!(!result.decryption_successful);

        let events = fx
            .ledger
            .search(
                &SearchCriteria {
                    event_type: Some(AuditEventType::VerificationFailure),
                    document_id: Some("doc-tampered".to_string()),
                    ..SearchCriteria::default()
                },
                10,
            )
            .unwrap();
        assert!(!events.is_empty());
    }

    #[test]
    fn test_missing_container_is_corrupted() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir);
        encrypt_doc(&fx, "doc-gone");
        std::fs::remove_file(fx.encryptor.container_path("doc-gone")).unwrap();

        let result = fx
            .monitor
            .verify_document("doc-gone", VerificationLevel::Standard)
            .unwrap();
        assert_eq!(result.status, DocumentStatus::Corrupted);
    }

    #[test]
    fn test_failure_callbacks_fire() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir);
        encrypt_doc(&fx, "doc-cb");
        std::fs::remove_file(fx.encryptor.container_path("doc-cb")).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        fx.monitor.on_failure(Box::new(move |record| {
            assert_eq!(record.document_id, "doc-cb");
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        fx.monitor
            .verify_document("doc-cb", VerificationLevel::Basic)
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    struct CountingHooks {
        key_recoveries: AtomicUsize,
        restores: AtomicUsize,
    }

    impl RemediationHooks for CountingHooks {
        fn recover_key(&self, _document_id: &str, _key_id: &str) -> bool {
            self.key_recoveries.fetch_add(1, Ordering::SeqCst);
            false
        }
        fn restore_from_backup(&self, _document_id: &str) -> bool {
            self.restores.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    #[test]
    fn test_remediation_dispatch_and_budget() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir);
        encrypt_doc(&fx, "doc-remed");

        let (_, key_id) = fx.keys.get_client_matter_key("c1", "m1").unwrap();
        fx.keys.revoke(&key_id, "drill").unwrap();

        let hooks = Arc::new(CountingHooks {
            key_recoveries: AtomicUsize::new(0),
            restores: AtomicUsize::new(0),
        });
        let dyn_hooks: Arc<dyn RemediationHooks> = hooks.clone() as Arc<dyn RemediationHooks>;
        fx.monitor.set_remediation_hooks(dyn_hooks);

        // The budget allows three attempts; further failures stop
        // dispatching.
        for _ in 0..5 {
            fx.monitor
                .verify_document("doc-remed", VerificationLevel::Basic)
                .unwrap();
        }
        assert_eq!(hooks.key_recoveries.load(Ordering::SeqCst), 3);
        assert_eq!(hooks.restores.load(Ordering::SeqCst), 0);

        let entry = fx.monitor.failure_entry("doc-remed").unwrap().unwrap();
        assert_eq!(entry.failure_count, 5);
        assert_eq!(entry.remediation_attempts, 3);
    }

    #[test]
    fn test_sweep_raises_alert_above_threshold() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir);
        encrypt_doc(&fx, "doc-a");
        encrypt_doc(&fx, "doc-b");
        std::fs::remove_file(fx.encryptor.container_path("doc-b")).unwrap();

        let alerts = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&alerts);
        fx.monitor.on_alert(Box::new(move |alert_type, _| {
            assert_eq!(alert_type, "PATTERN_HIGH_FAILURE_RATE");
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let summary = fx.monitor.sweep(VerificationLevel::Standard).unwrap();
        assert_eq!(summary.total_documents, 2);
        assert_eq!(summary.failed, 1);
        assert!(summary.alert_raised);
        assert_eq!(alerts.load(Ordering::SeqCst), 1);

        let events = fx
            .ledger
            .search(
                &SearchCriteria {
                    event_type: Some(AuditEventType::SecurityAlert),
                    ..SearchCriteria::default()
                },
                10,
            )
            .unwrap();
        assert!(events.iter().any(|e| {
            e.details.get("alert_type").and_then(|v| v.as_str())
                == Some("PATTERN_HIGH_FAILURE_RATE")
        }));
    }

    #[test]
    fn test_clean_sweep_raises_no_alert() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir);
        encrypt_doc(&fx, "doc-a");
        encrypt_doc(&fx, "doc-b");

        let summary = fx.monitor.sweep(VerificationLevel::Comprehensive).unwrap();
        assert_eq!(summary.failed, 0);
        assert!(!summary.alert_raised);

        let stats = fx.monitor.statistics().unwrap();
        assert_eq!(stats.get("encrypted"), Some(&2));
    }

    #[test]
    fn test_scheduler_runs_and_stops() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir);
        encrypt_doc(&fx, "doc-sched");

        let mut config = MonitorConfig::under_root(dir.path());
        config.db_path = dir.path().join("monitoring").join("sched.db");
        config.verification_interval_secs = 1;
        let monitor = Arc::new(
            VerificationMonitor::open(
                Arc::clone(&fx.encryptor),
                Arc::clone(&fx.keys),
                Arc::clone(&fx.ledger),
                config,
            )
            .unwrap(),
        );

        Arc::clone(&monitor).start();
        assert!(monitor.is_running());
        // A second start is a no-op.
        Arc::clone(&monitor).start();

        std::thread::sleep(Duration::from_millis(400));
        monitor.stop();
        assert!(!monitor.is_running());

        let stats = monitor.statistics().unwrap();
        assert!(stats.get("encrypted").copied().unwrap_or(0) >= 1);
    }
}
