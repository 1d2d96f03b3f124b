use crate::{
    compliance_flags, retention_days, AuditConfig, AuditError, AuditEvent, AuditEventType,
    ComplianceFlag, EventLevel, SecurityContext,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{error, info, warn};

/// Attribution carried by an event: who did it, where in the system, and
/// which entities it touches.
#[derive(Debug, Clone, Default)]
pub struct EventScope {
    pub user_id: Option<String>,
    pub client_id: Option<String>,
    pub matter_id: Option<String>,
    pub document_id: Option<String>,
    pub key_id: Option<String>,
    pub source_service: String,
    pub source_function: String,
}

impl EventScope {
    #[must_use]
    pub fn new(source_service: &str, source_function: &str) -> Self {
        Self {
            source_service: source_service.to_string(),
            source_function: source_function.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    #[must_use]
    pub fn tenant(mut self, client_id: &str, matter_id: &str) -> Self {
        self.client_id = Some(client_id.to_string());
        self.matter_id = Some(matter_id.to_string());
        self
    }

    #[must_use]
    pub fn document(mut self, document_id: &str) -> Self {
        self.document_id = Some(document_id.to_string());
        self
    }

    #[must_use]
    pub fn key(mut self, key_id: &str) -> Self {
        self.key_id = Some(key_id.to_string());
        self
    }
}

/// Search filter; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct SearchCriteria {
    pub event_type: Option<AuditEventType>,
    pub event_level: Option<EventLevel>,
    pub start: Option<OffsetDateTime>,
    pub end: Option<OffsetDateTime>,
    pub client_id: Option<String>,
    pub matter_id: Option<String>,
    pub document_id: Option<String>,
    pub key_id: Option<String>,
    pub source_service: Option<String>,
}

/// Aggregated decryption activity for one document inside a time window.
#[derive(Debug, Clone)]
pub struct DecryptionActivity {
    pub document_id: String,
    pub window_minutes: i64,
    pub total_attempts: u64,
    pub failed_attempts: u64,
    pub unique_sources: u64,
    pub security_alert: bool,
}

/// Ledger-wide aggregate counters consumed by health checks.
#[derive(Debug, Clone)]
pub struct AuditStatistics {
    pub total_events: u64,
    pub events_by_type_30d: HashMap<String, u64>,
    pub security_events_7d: u64,
    pub key_access_granted_7d: u64,
    pub key_access_denied_7d: u64,
    pub failed_operations_7d: u64,
    pub buffered: usize,
}

struct BufferState {
    events: Vec<AuditEvent>,
    next_seq: u64,
}

/// Append-only, buffered, indexed audit ledger.
///
/// Events are appended to an in-memory buffer under its own lock; event ids
/// are assigned there, so the sequence numbers embedded in them give a total
/// order. The buffer is swapped out (never written in place) when it
/// reaches the configured threshold or when the background flush worker
/// fires, and the batch insert happens outside the buffer lock. A crash
/// loses only buffered events.
pub struct AuditLedger {
    conn: Mutex<Connection>,
    buffer: Mutex<BufferState>,
    config: AuditConfig,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AuditLedger {
    /// Opens (or creates) the ledger store and prepares the schema.
    ///
    /// # Errors
    /// Fails when the database cannot be opened or migrated.
    pub fn open(config: AuditConfig) -> Result<Self, AuditError> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&config.db_path)?;
        let ledger = Self {
            conn: Mutex::new(conn),
            buffer: Mutex::new(BufferState {
                events: Vec::new(),
                next_seq: 1,
            }),
            config,
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        };
        ledger.migrate()?;
        ledger.restore_sequence()?;
        Ok(ledger)
    }

    fn migrate(&self) -> Result<(), AuditError> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            r"
        PRAGMA journal_mode=WAL;

        CREATE TABLE IF NOT EXISTS audit_events (
            event_id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            event_level TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            user_id TEXT,
            client_id TEXT,
            matter_id TEXT,
            document_id TEXT,
            key_id TEXT,
            source_service TEXT NOT NULL,
            source_function TEXT NOT NULL,
            details TEXT NOT NULL,
            security_context TEXT NOT NULL,
            compliance_flags TEXT NOT NULL,
            retention_until TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS key_access_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            key_id TEXT NOT NULL,
            access_type TEXT NOT NULL,
            accessed_by TEXT,
            accessed_at TEXT NOT NULL,
            client_id TEXT,
            matter_id TEXT,
            access_granted BOOLEAN NOT NULL,
            failure_reason TEXT
        );

        CREATE TABLE IF NOT EXISTS failed_operations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            operation_type TEXT NOT NULL,
            document_id TEXT,
            key_id TEXT,
            failure_reason TEXT NOT NULL,
            failed_at TEXT NOT NULL,
            retry_count INTEGER DEFAULT 0,
            resolved BOOLEAN DEFAULT FALSE
        );

        CREATE TABLE IF NOT EXISTS compliance_reports (
            report_id TEXT PRIMARY KEY,
            report_type TEXT NOT NULL,
            generated_at TEXT NOT NULL,
            period_start TEXT NOT NULL,
            period_end TEXT NOT NULL,
            report_data TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_events(timestamp);
        CREATE INDEX IF NOT EXISTS idx_audit_event_type ON audit_events(event_type);
        CREATE INDEX IF NOT EXISTS idx_audit_client_matter ON audit_events(client_id, matter_id);
        CREATE INDEX IF NOT EXISTS idx_audit_document_id ON audit_events(document_id);
        CREATE INDEX IF NOT EXISTS idx_audit_key_id ON audit_events(key_id);
        CREATE INDEX IF NOT EXISTS idx_key_access_key_id ON key_access_log(key_id);
        CREATE INDEX IF NOT EXISTS idx_key_access_time ON key_access_log(accessed_at);
        ",
        )?;
        Ok(())
    }

    // Event ids are zero-padded, so MAX() over them recovers the highest
    // sequence across restarts.
    fn restore_sequence(&self) -> Result<(), AuditError> {
        let max_id: Option<String> = {
            let conn = self.lock_conn()?;
            conn.query_row("SELECT MAX(event_id) FROM audit_events", [], |r| r.get(0))
                .optional()?
                .flatten()
        };
        if let Some(max_id) = max_id {
            if let Some(seq) = max_id
                .strip_prefix("evt_")
                .and_then(|rest| rest.split('_').next())
                .and_then(|digits| digits.parse::<u64>().ok())
            {
                let mut buffer = self.lock_buffer()?;
                buffer.next_seq = seq + 1;
            }
        }
        Ok(())
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, AuditError> {
        self.conn.lock().map_err(|_| AuditError::Poisoned)
    }

    fn lock_buffer(&self) -> Result<MutexGuard<'_, BufferState>, AuditError> {
        self.buffer.lock().map_err(|_| AuditError::Poisoned)
    }

    /// Records an audit event and returns its id.
    ///
    /// The event is stamped, its retention window derived from the
    /// retention table (with per-type config overrides), its compliance
    /// flags computed, and the result appended to the buffer. When the
    /// buffer reaches the configured threshold it is swapped out under the
    /// lock and persisted in one batch outside it.
    ///
    /// # Errors
    /// Fails only when a threshold flush cannot reach the store.
    pub fn log_event(
        &self,
        event_type: AuditEventType,
        event_level: EventLevel,
        details: serde_json::Value,
        scope: EventScope,
    ) -> Result<String, AuditError> {
        let now = OffsetDateTime::now_utc();
        let days = self
            .config
            .retention_overrides
            .get(&event_type)
            .copied()
            .unwrap_or_else(|| retention_days(event_type, event_level));
        let flags = compliance_flags(event_type, &details, &self.config.pii_markers);

        let (event_id, to_flush) = {
            let mut buffer = self.lock_buffer()?;
            let seq = buffer.next_seq;
            buffer.next_seq += 1;
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            let event_id = format!("evt_{seq:012}_{}", &suffix[..8]);

            buffer.events.push(AuditEvent {
                event_id: event_id.clone(),
                event_type,
                event_level,
                timestamp: now,
                user_id: scope.user_id,
                client_id: scope.client_id,
                matter_id: scope.matter_id,
                document_id: scope.document_id,
                key_id: scope.key_id,
                source_service: scope.source_service,
                source_function: scope.source_function,
                details,
                security_context: SecurityContext::capture(),
                compliance_flags: flags,
                retention_until: now + time::Duration::days(days),
            });

            let to_flush = if buffer.events.len() >= self.config.max_buffer_size {
                std::mem::take(&mut buffer.events)
            } else {
                Vec::new()
            };
            (event_id, to_flush)
        };

        if !to_flush.is_empty() {
            self.insert_batch(&to_flush)?;
        }

        match event_level {
            EventLevel::Info => info!(event = %event_type, %event_id, "audit event"),
            EventLevel::Warning => warn!(event = %event_type, %event_id, "audit event"),
            EventLevel::Error | EventLevel::Critical | EventLevel::Security => {
                error!(event = %event_type, %event_id, "audit event");
            }
        }
        Ok(event_id)
    }

    /// Flushes all buffered events to the store; returns how many were
    /// written. The buffer is swapped under its lock and the batch insert
    /// happens outside it.
    ///
    /// # Errors
    /// Fails when the store rejects the batch.
    pub fn flush(&self) -> Result<usize, AuditError> {
        let to_flush = {
            let mut buffer = self.lock_buffer()?;
            std::mem::take(&mut buffer.events)
        };
        if to_flush.is_empty() {
            return Ok(0);
        }
        self.insert_batch(&to_flush)?;
        Ok(to_flush.len())
    }

    fn insert_batch(&self, events: &[AuditEvent]) -> Result<(), AuditError> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO audit_events
                 (event_id, event_type, event_level, timestamp, user_id, client_id, matter_id,
                  document_id, key_id, source_service, source_function, details,
                  security_context, compliance_flags, retention_until)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            for event in events {
                stmt.execute(params![
                    event.event_id,
                    event.event_type.as_str(),
                    event.event_level.as_str(),
                    format_ts(event.timestamp),
                    event.user_id,
                    event.client_id,
                    event.matter_id,
                    event.document_id,
                    event.key_id,
                    event.source_service,
                    event.source_function,
                    event.details.to_string(),
                    serde_json::to_string(&event.security_context)?,
                    serde_json::to_string(&event.compliance_flags)?,
                    format_ts(event.retention_until),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Starts the background flush worker. Call [`AuditLedger::stop`] to
    /// shut it down; the worker never outlives the ledger's owner.
    pub fn start_flush_worker(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return; // Already running
        }
        let ledger = Arc::clone(&self);
        let running = Arc::clone(&self.running);
        let interval = Duration::from_secs(self.config.flush_interval_secs.max(1));

        let handle = std::thread::Builder::new()
            .name("audit-flush".to_string())
            .spawn(move || {
                let step = Duration::from_millis(250);
                let mut elapsed = Duration::ZERO;
                while running.load(Ordering::SeqCst) {
                    std::thread::sleep(step);
                    elapsed += step;
                    if elapsed >= interval {
                        elapsed = Duration::ZERO;
                        if let Err(e) = ledger.flush() {
                            error!(error = %e, "audit buffer flush failed");
                        }
                    }
                }
            });
        match handle {
            Ok(handle) => {
                if let Ok(mut worker) = self.worker.lock() {
                    *worker = Some(handle);
                }
            }
            Err(e) => error!(error = %e, "failed to start audit flush worker"),
        }
    }

    /// Stops the flush worker (if running) and performs a final flush.
    ///
    /// # Errors
    /// Fails when the final flush cannot reach the store.
    pub fn stop(&self) -> Result<(), AuditError> {
        self.running.store(false, Ordering::SeqCst);
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
        self.flush()?;
        Ok(())
    }

    /// Records a key access attempt in the key access log and mirrors it as
    /// a `KeyAccessed` event (`Security` level when denied).
    ///
    /// # Errors
    /// Fails when the store rejects the row.
    #[allow(clippy::too_many_arguments)]
    pub fn log_key_access(
        &self,
        key_id: &str,
        access_type: &str,
        accessed_by: Option<&str>,
        client_id: Option<&str>,
        matter_id: Option<&str>,
        granted: bool,
        failure_reason: Option<&str>,
    ) -> Result<String, AuditError> {
        {
            let conn = self.lock_conn()?;
            conn.execute(
                "INSERT INTO key_access_log
                 (key_id, access_type, accessed_by, accessed_at, client_id, matter_id,
                  access_granted, failure_reason)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    key_id,
                    access_type,
                    accessed_by,
                    format_ts(OffsetDateTime::now_utc()),
                    client_id,
                    matter_id,
                    granted,
                    failure_reason
                ],
            )?;
        }

        let mut scope = EventScope::new("key_store", "log_key_access").key(key_id);
        scope.user_id = accessed_by.map(str::to_string);
        scope.client_id = client_id.map(str::to_string);
        scope.matter_id = matter_id.map(str::to_string);

        self.log_event(
            AuditEventType::KeyAccessed,
            if granted {
                EventLevel::Info
            } else {
                EventLevel::Security
            },
            serde_json::json!({
                "key_id": key_id,
                "access_type": access_type,
                "access_granted": granted,
                "failure_reason": failure_reason,
            }),
            scope,
        )
    }

    /// Records a failed encrypt/decrypt operation and mirrors it as an
    /// `EncryptionFailed`/`DecryptionFailed` event. Returns the failure row
    /// id.
    ///
    /// # Errors
    /// Fails when the store rejects the row.
    pub fn log_failed_operation(
        &self,
        operation_type: &str,
        document_id: Option<&str>,
        key_id: Option<&str>,
        failure_reason: &str,
    ) -> Result<i64, AuditError> {
        let failure_id = {
            let conn = self.lock_conn()?;
            conn.execute(
                "INSERT INTO failed_operations
                 (operation_type, document_id, key_id, failure_reason, failed_at)
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    operation_type,
                    document_id,
                    key_id,
                    failure_reason,
                    format_ts(OffsetDateTime::now_utc())
                ],
            )?;
            conn.last_insert_rowid()
        };

        let event_type = if operation_type.to_lowercase().contains("decrypt") {
            AuditEventType::DecryptionFailed
        } else {
            AuditEventType::EncryptionFailed
        };

        let mut scope = EventScope::new("encryption_service", "log_failed_operation");
        scope.document_id = document_id.map(str::to_string);
        scope.key_id = key_id.map(str::to_string);

        self.log_event(
            event_type,
            EventLevel::Error,
            serde_json::json!({
                "operation_type": operation_type,
                "failure_reason": failure_reason,
                "failure_id": failure_id,
            }),
            scope,
        )?;

        Ok(failure_id)
    }

    /// Searches stored events, newest first. The buffer is flushed first so
    /// just-logged events are visible.
    ///
    /// # Errors
    /// Fails on store errors.
    pub fn search(
        &self,
        criteria: &SearchCriteria,
        limit: usize,
    ) -> Result<Vec<AuditEvent>, AuditError> {
        self.flush()?;

        let mut conditions: Vec<&str> = Vec::new();
        let mut values: Vec<String> = Vec::new();

        if let Some(t) = criteria.event_type {
            conditions.push("event_type = ?");
            values.push(t.as_str().to_string());
        }
        if let Some(l) = criteria.event_level {
            conditions.push("event_level = ?");
            values.push(l.as_str().to_string());
        }
        if let Some(start) = criteria.start {
            conditions.push("timestamp >= ?");
            values.push(format_ts(start));
        }
        if let Some(end) = criteria.end {
            conditions.push("timestamp <= ?");
            values.push(format_ts(end));
        }
        if let Some(v) = &criteria.client_id {
            conditions.push("client_id = ?");
            values.push(v.clone());
        }
        if let Some(v) = &criteria.matter_id {
            conditions.push("matter_id = ?");
            values.push(v.clone());
        }
        if let Some(v) = &criteria.document_id {
            conditions.push("document_id = ?");
            values.push(v.clone());
        }
        if let Some(v) = &criteria.key_id {
            conditions.push("key_id = ?");
            values.push(v.clone());
        }
        if let Some(v) = &criteria.source_service {
            conditions.push("source_service = ?");
            values.push(v.clone());
        }

        let where_clause = if conditions.is_empty() {
            "1=1".to_string()
        } else {
            conditions.join(" AND ")
        };
        let sql = format!(
            "SELECT event_id, event_type, event_level, timestamp, user_id, client_id, matter_id,
                    document_id, key_id, source_service, source_function, details,
                    security_context, compliance_flags, retention_until
             FROM audit_events
             WHERE {where_clause}
             ORDER BY timestamp DESC, event_id DESC
             LIMIT {limit}"
        );

        let raw_rows = {
            let conn = self.lock_conn()?;
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), RawEvent::from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };

        // Decode outside the row mapper so serde errors surface as
        // AuditError rather than being shoehorned into rusqlite's.
        raw_rows.into_iter().map(RawEvent::decode).collect()
    }

    /// Aggregates decryption activity for a document inside a sliding
    /// window and raises `SecurityAlert` events when thresholds are
    /// crossed: more than 10 failures, or more than 5 distinct accessors.
    ///
    /// # Errors
    /// Fails on store errors.
    pub fn track_decryption_attempts(
        &self,
        document_id: &str,
        window_minutes: i64,
    ) -> Result<DecryptionActivity, AuditError> {
        self.flush()?;
        let window_start = format_ts(OffsetDateTime::now_utc() - time::Duration::minutes(window_minutes));

        let (total_attempts, failed_attempts, unique_sources) = {
            let conn = self.lock_conn()?;
            let total: u64 = conn.query_row(
                "SELECT COUNT(*) FROM audit_events
                 WHERE document_id = ? AND event_type = ? AND timestamp > ?",
                params![
                    document_id,
                    AuditEventType::DocumentDecrypted.as_str(),
                    window_start
                ],
                |r| r.get(0),
            )?;
            let failed: u64 = conn.query_row(
                "SELECT COUNT(*) FROM failed_operations
                 WHERE document_id = ? AND operation_type LIKE '%decrypt%' AND failed_at > ?",
                params![document_id, window_start],
                |r| r.get(0),
            )?;
            let sources: u64 = conn.query_row(
                "SELECT COUNT(*) FROM (
                     SELECT DISTINCT COALESCE(user_id, ''), source_service FROM audit_events
                     WHERE document_id = ? AND event_type IN (?, ?) AND timestamp > ?
                 )",
                params![
                    document_id,
                    AuditEventType::DocumentDecrypted.as_str(),
                    AuditEventType::DecryptionFailed.as_str(),
                    window_start
                ],
                |r| r.get(0),
            )?;
            (total, failed, sources)
        };

        let mut security_alert = false;

        if failed_attempts > 10 {
            security_alert = true;
            self.log_event(
                AuditEventType::SecurityAlert,
                EventLevel::Security,
                serde_json::json!({
                    "alert_type": "HIGH_DECRYPTION_FAILURE_RATE",
                    "document_id": document_id,
                    "failed_attempts": failed_attempts,
                    "time_window_minutes": window_minutes,
                }),
                EventScope::new("audit_ledger", "track_decryption_attempts").document(document_id),
            )?;
        }

        if unique_sources > 5 {
            security_alert = true;
            self.log_event(
                AuditEventType::SecurityAlert,
                EventLevel::Security,
                serde_json::json!({
                    "alert_type": "MULTIPLE_ACCESS_SOURCES",
                    "document_id": document_id,
                    "unique_sources": unique_sources,
                    "time_window_minutes": window_minutes,
                }),
                EventScope::new("audit_ledger", "track_decryption_attempts").document(document_id),
            )?;
        }

        Ok(DecryptionActivity {
            document_id: document_id.to_string(),
            window_minutes,
            total_attempts,
            failed_attempts,
            unique_sources,
            security_alert,
        })
    }

    /// Aggregate counters for health reporting.
    ///
    /// # Errors
    /// Fails on store errors.
    pub fn statistics(&self) -> Result<AuditStatistics, AuditError> {
        self.flush()?;
        let now = OffsetDateTime::now_utc();
        let thirty_days_ago = format_ts(now - time::Duration::days(30));
        let seven_days_ago = format_ts(now - time::Duration::days(7));

        let conn = self.lock_conn()?;
        let total_events: u64 =
            conn.query_row("SELECT COUNT(*) FROM audit_events", [], |r| r.get(0))?;

        let mut events_by_type_30d = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT event_type, COUNT(*) FROM audit_events
                 WHERE timestamp > ? GROUP BY event_type",
            )?;
            let rows = stmt.query_map(params![thirty_days_ago], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, u64>(1)?))
            })?;
            for row in rows {
                let (event_type, count) = row?;
                events_by_type_30d.insert(event_type, count);
            }
        }

        let security_events_7d: u64 = conn.query_row(
            "SELECT COUNT(*) FROM audit_events WHERE timestamp > ? AND event_level = ?",
            params![seven_days_ago, EventLevel::Security.as_str()],
            |r| r.get(0),
        )?;
        let key_access_granted_7d: u64 = conn.query_row(
            "SELECT COUNT(*) FROM key_access_log WHERE accessed_at > ? AND access_granted",
            params![seven_days_ago],
            |r| r.get(0),
        )?;
        let key_access_denied_7d: u64 = conn.query_row(
            "SELECT COUNT(*) FROM key_access_log WHERE accessed_at > ? AND NOT access_granted",
            params![seven_days_ago],
            |r| r.get(0),
        )?;
        let failed_operations_7d: u64 = conn.query_row(
            "SELECT COUNT(*) FROM failed_operations WHERE failed_at > ?",
            params![seven_days_ago],
            |r| r.get(0),
        )?;
        drop(conn);

        let buffered = self.lock_buffer()?.events.len();
        Ok(AuditStatistics {
            total_events,
            events_by_type_30d,
            security_events_7d,
            key_access_granted_7d,
            key_access_denied_7d,
            failed_operations_7d,
            buffered,
        })
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, AuditError>,
    ) -> Result<T, AuditError> {
        let conn = self.lock_conn()?;
        f(&conn)
    }
}

impl Drop for AuditLedger {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.flush();
    }
}

pub(crate) fn format_ts(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_default()
}

struct RawEvent {
    event_id: String,
    event_type: String,
    event_level: String,
    timestamp: String,
    user_id: Option<String>,
    client_id: Option<String>,
    matter_id: Option<String>,
    document_id: Option<String>,
    key_id: Option<String>,
    source_service: String,
    source_function: String,
    details: String,
    security_context: String,
    compliance_flags: String,
    retention_until: String,
}

impl RawEvent {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            event_id: row.get(0)?,
            event_type: row.get(1)?,
            event_level: row.get(2)?,
            timestamp: row.get(3)?,
            user_id: row.get(4)?,
            client_id: row.get(5)?,
            matter_id: row.get(6)?,
            document_id: row.get(7)?,
            key_id: row.get(8)?,
            source_service: row.get(9)?,
            source_function: row.get(10)?,
            details: row.get(11)?,
            security_context: row.get(12)?,
            compliance_flags: row.get(13)?,
            retention_until: row.get(14)?,
        })
    }

    fn decode(self) -> Result<AuditEvent, AuditError> {
        let flags: Vec<ComplianceFlag> = serde_json::from_str(&self.compliance_flags)?;
        Ok(AuditEvent {
            event_type: AuditEventType::from_tag(&self.event_type)
                .unwrap_or(AuditEventType::ConfigurationChange),
            event_level: EventLevel::from_tag(&self.event_level).unwrap_or(EventLevel::Info),
            timestamp: OffsetDateTime::parse(&self.timestamp, &Rfc3339)
                .unwrap_or(OffsetDateTime::UNIX_EPOCH),
            retention_until: OffsetDateTime::parse(&self.retention_until, &Rfc3339)
                .unwrap_or(OffsetDateTime::UNIX_EPOCH),
            details: serde_json::from_str(&self.details)?,
            security_context: serde_json::from_str(&self.security_context)?,
            compliance_flags: flags,
            event_id: self.event_id,
            user_id: self.user_id,
            client_id: self.client_id,
            matter_id: self.matter_id,
            document_id: self.document_id,
            key_id: self.key_id,
            source_service: self.source_service,
            source_function: self.source_function,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use tempfile::TempDir;

    fn ledger(dir: &TempDir) -> AuditLedger {
        AuditLedger::open(AuditConfig::new(dir.path().join("audit").join("ledger.db"))).unwrap()
    }

    fn scope() -> EventScope {
        EventScope::new("test_service", "test_fn")
    }

    #[test]
    fn test_log_and_search_roundtrip() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);

        let event_id = ledger
            .log_event(
                AuditEventType::DocumentEncrypted,
                EventLevel::Info,
                serde_json::json!({ "compliance_level": "attorney_client" }),
                scope().tenant("c1", "m1").document("doc-1"),
            )
            .unwrap();
        assert!(event_id.starts_with("evt_"));

        let results = ledger
            .search(
                &SearchCriteria {
                    document_id: Some("doc-1".to_string()),
                    ..SearchCriteria::default()
                },
                100,
            )
            .unwrap();
        assert_eq!(results.len(), 1);
        let event = &results[0];
        assert_eq!(event.event_id, event_id);
        assert_eq!(event.event_type, AuditEventType::DocumentEncrypted);
        assert!(event
            .compliance_flags
            .contains(&ComplianceFlag::AttorneyClientPrivilege));
        assert!(event
            .compliance_flags
            .contains(&ComplianceFlag::DocumentRetention));
        // Seven-year retention for document operations.
        assert_eq!((event.retention_until - event.timestamp).whole_days(), 2555);
    }

    #[test]
    fn test_event_ids_are_monotonic_and_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let first_ids: Vec<String>;
        {
            let ledger = ledger(&dir);
            first_ids = (0..5)
                .map(|_| {
                    ledger
                        .log_event(
                            AuditEventType::SystemStartup,
                            EventLevel::Info,
                            serde_json::json!({}),
                            scope(),
                        )
                        .unwrap()
                })
                .collect();
            let mut sorted = first_ids.clone();
            sorted.sort();
            assert_eq!(sorted, first_ids);
            ledger.flush().unwrap();
        }

        let ledger = ledger(&dir);
        let next = ledger
            .log_event(
                AuditEventType::SystemStartup,
                EventLevel::Info,
                serde_json::json!({}),
                scope(),
            )
            .unwrap();
        assert!(next.as_str() > first_ids.last().unwrap().as_str());
    }

    #[test]
    fn test_buffer_flushes_at_threshold() {
        let dir = TempDir::new().unwrap();
        let mut config = AuditConfig::new(dir.path().join("ledger.db"));
        config.max_buffer_size = 5;
        let ledger = AuditLedger::open(config).unwrap();

        for _ in 0..4 {
            ledger
                .log_event(
                    AuditEventType::SystemStartup,
                    EventLevel::Info,
                    serde_json::json!({}),
                    scope(),
                )
                .unwrap();
        }
        // Nothing persisted yet: four events sit in the buffer.
        let persisted: u64 = ledger
            .with_conn(|c| Ok(c.query_row("SELECT COUNT(*) FROM audit_events", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(persisted, 0);

        ledger
            .log_event(
                AuditEventType::SystemStartup,
                EventLevel::Info,
                serde_json::json!({}),
                scope(),
            )
            .unwrap();
        let persisted: u64 = ledger
            .with_conn(|c| Ok(c.query_row("SELECT COUNT(*) FROM audit_events", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(persisted, 5);
    }

    #[test]
    fn test_flush_worker_persists_periodically() {
        let dir = TempDir::new().unwrap();
        let mut config = AuditConfig::new(dir.path().join("ledger.db"));
        config.flush_interval_secs = 1;
        let ledger = Arc::new(AuditLedger::open(config).unwrap());
        Arc::clone(&ledger).start_flush_worker();

        ledger
            .log_event(
                AuditEventType::SystemStartup,
                EventLevel::Info,
                serde_json::json!({}),
                scope(),
            )
            .unwrap();

        std::thread::sleep(Duration::from_millis(1600));
        let persisted: u64 = ledger
            .with_conn(|c| Ok(c.query_row("SELECT COUNT(*) FROM audit_events", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(persisted, 1);

        ledger.stop().unwrap();
    }

    #[test]
    fn test_key_access_log_and_denied_is_security() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);

        ledger
            .log_key_access("key-1", "DOCUMENT_ENCRYPTION", Some("alice"), Some("c1"), Some("m1"), true, None)
            .unwrap();
        ledger
            .log_key_access(
                "key-1",
                "DOCUMENT_DECRYPTION",
                Some("mallory"),
                Some("c1"),
                Some("m1"),
                false,
                Some("no active key"),
            )
            .unwrap();

        let denied = ledger
            .search(
                &SearchCriteria {
                    event_type: Some(AuditEventType::KeyAccessed),
                    event_level: Some(EventLevel::Security),
                    ..SearchCriteria::default()
                },
                10,
            )
            .unwrap();
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].user_id.as_deref(), Some("mallory"));

        let stats = ledger.statistics().unwrap();
        assert_eq!(stats.key_access_granted_7d, 1);
        assert_eq!(stats.key_access_denied_7d, 1);
    }

    #[test]
    fn test_failed_operation_maps_to_event_type() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);

        ledger
            .log_failed_operation("document_decryption", Some("doc-1"), None, "tag mismatch")
            .unwrap();
        ledger
            .log_failed_operation("document_encryption", Some("doc-2"), None, "missing key")
            .unwrap();

        let decrypt_failures = ledger
            .search(
                &SearchCriteria {
                    event_type: Some(AuditEventType::DecryptionFailed),
                    ..SearchCriteria::default()
                },
                10,
            )
            .unwrap();
        assert_eq!(decrypt_failures.len(), 1);
        assert_eq!(decrypt_failures[0].document_id.as_deref(), Some("doc-1"));

        let encrypt_failures = ledger
            .search(
                &SearchCriteria {
                    event_type: Some(AuditEventType::EncryptionFailed),
                    ..SearchCriteria::default()
                },
                10,
            )
            .unwrap();
        assert_eq!(encrypt_failures.len(), 1);
    }

    #[test]
    fn test_decryption_burst_raises_alert() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);

        for i in 0..11 {
            ledger
                .log_failed_operation(
                    "document_decryption",
                    Some("doc-hot"),
                    None,
                    &format!("attempt {i} failed"),
                )
                .unwrap();
        }

        let activity = ledger.track_decryption_attempts("doc-hot", 60).unwrap();
        assert_eq!(activity.failed_attempts, 11);
        assert!(activity.security_alert);

        let alerts = ledger
            .search(
                &SearchCriteria {
                    event_type: Some(AuditEventType::SecurityAlert),
                    ..SearchCriteria::default()
                },
                10,
            )
            .unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(
            alerts[0].details.get("alert_type").and_then(|v| v.as_str()),
            Some("HIGH_DECRYPTION_FAILURE_RATE")
        );
    }

    #[test]
    fn test_quiet_document_raises_no_alert() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        ledger
            .log_event(
                AuditEventType::DocumentDecrypted,
                EventLevel::Info,
                serde_json::json!({}),
                scope().document("doc-calm"),
            )
            .unwrap();

        let activity = ledger.track_decryption_attempts("doc-calm", 60).unwrap();
        assert_eq!(activity.total_attempts, 1);
        assert_eq!(activity.failed_attempts, 0);
        assert!(!activity.security_alert);
    }

    #[test]
    fn test_retention_override() {
        let dir = TempDir::new().unwrap();
        let mut config = AuditConfig::new(dir.path().join("ledger.db"));
        config
            .retention_overrides
            .insert(AuditEventType::SystemStartup, 30);
        let ledger = AuditLedger::open(config).unwrap();

        ledger
            .log_event(
                AuditEventType::SystemStartup,
                EventLevel::Info,
                serde_json::json!({}),
                scope(),
            )
            .unwrap();
        let events = ledger.search(&SearchCriteria::default(), 10).unwrap();
        assert_eq!((events[0].retention_until - events[0].timestamp).whole_days(), 30);
    }

    #[test]
    fn test_search_newest_first_with_limit() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        let mut last_id = String::new();
        for _ in 0..5 {
            last_id = ledger
                .log_event(
                    AuditEventType::SystemStartup,
                    EventLevel::Info,
                    serde_json::json!({}),
                    scope(),
                )
                .unwrap();
        }

        let events = ledger.search(&SearchCriteria::default(), 3).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_id, last_id);
    }
}
