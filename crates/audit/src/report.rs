use crate::ledger::{format_ts, EventScope};
use crate::{AuditError, AuditEventType, AuditLedger, EventLevel};
use rusqlite::params_from_iter;
use serde::Serialize;
use std::collections::HashMap;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::info;

/// Aggregated compliance view over a reporting period.
#[derive(Debug, Clone, Serialize)]
pub struct ComplianceReport {
    pub report_id: String,
    pub report_type: String,
    pub generated_at: String,
    pub period_start: String,
    pub period_end: String,
    pub total_events: u64,
    pub encryption_operations: u64,
    pub key_operations: u64,
    pub security_events: u64,
    /// Events carrying at least one compliance flag.
    pub compliance_violations: u64,
    pub event_breakdown: HashMap<String, u64>,
    pub failure_breakdown: HashMap<String, u64>,
    pub recommendations: Vec<String>,
    pub client_scope: Option<String>,
    pub matter_scope: Option<String>,
}

impl AuditLedger {
    /// Generates (and persists) a compliance report over `[start, end]`,
    /// optionally scoped to a client and matter.
    ///
    /// Recommendations are derived from fixed thresholds: any flagged
    /// events, security events above 10% of the total, or failures above
    /// 5% of encryption operations.
    ///
    /// # Errors
    /// Fails on store errors.
    pub fn generate_compliance_report(
        &self,
        report_type: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
        client_id: Option<&str>,
        matter_id: Option<&str>,
    ) -> Result<ComplianceReport, AuditError> {
        self.flush()?;

        let start_ts = format_ts(start);
        let end_ts = format_ts(end);

        let mut conditions = vec!["timestamp BETWEEN ? AND ?"];
        let mut values = vec![start_ts.clone(), end_ts.clone()];
        if let Some(client) = client_id {
            conditions.push("client_id = ?");
            values.push(client.to_string());
        }
        if let Some(matter) = matter_id {
            conditions.push("matter_id = ?");
            values.push(matter.to_string());
        }
        let where_clause = conditions.join(" AND ");

        let (
            total_events,
            encryption_operations,
            key_operations,
            security_events,
            compliance_violations,
            event_breakdown,
            failure_breakdown,
        ) = self.with_conn(|conn| {
            let count = |sql: &str, extra: &[&str]| -> Result<u64, AuditError> {
                let mut all = values.clone();
                all.extend(extra.iter().map(|s| (*s).to_string()));
                Ok(conn.query_row(sql, params_from_iter(all.iter()), |r| r.get(0))?)
            };

            let total = count(
                &format!("SELECT COUNT(*) FROM audit_events WHERE {where_clause}"),
                &[],
            )?;
            let encryption = count(
                &format!(
                    "SELECT COUNT(*) FROM audit_events WHERE {where_clause} AND event_type IN (?, ?)"
                ),
                &[
                    AuditEventType::DocumentEncrypted.as_str(),
                    AuditEventType::DocumentDecrypted.as_str(),
                ],
            )?;
            let keys = count(
                &format!(
                    "SELECT COUNT(*) FROM audit_events WHERE {where_clause} AND event_type LIKE 'key_%'"
                ),
                &[],
            )?;
            let security = count(
                &format!(
                    "SELECT COUNT(*) FROM audit_events WHERE {where_clause} AND event_level = ?"
                ),
                &[EventLevel::Security.as_str()],
            )?;
            let violations = count(
                &format!(
                    "SELECT COUNT(*) FROM audit_events WHERE {where_clause} AND compliance_flags != '[]'"
                ),
                &[],
            )?;

            let mut event_breakdown = HashMap::new();
            {
                let mut stmt = conn.prepare(&format!(
                    "SELECT event_type, COUNT(*) FROM audit_events WHERE {where_clause}
                     GROUP BY event_type ORDER BY COUNT(*) DESC"
                ))?;
                let rows = stmt.query_map(params_from_iter(values.iter()), |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, u64>(1)?))
                })?;
                for row in rows {
                    let (event_type, count) = row?;
                    event_breakdown.insert(event_type, count);
                }
            }

            let mut failure_breakdown = HashMap::new();
            {
                let mut stmt = conn.prepare(
                    "SELECT operation_type, COUNT(*) FROM failed_operations
                     WHERE failed_at BETWEEN ? AND ? GROUP BY operation_type",
                )?;
                let rows = stmt.query_map([&start_ts, &end_ts], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, u64>(1)?))
                })?;
                for row in rows {
                    let (operation, count) = row?;
                    failure_breakdown.insert(operation, count);
                }
            }

            Ok((
                total,
                encryption,
                keys,
                security,
                violations,
                event_breakdown,
                failure_breakdown,
            ))
        })?;

        let mut recommendations = Vec::new();
        if compliance_violations > 0 {
            recommendations.push(format!(
                "Review and address {compliance_violations} compliance violations"
            ));
        }
        if total_events > 0 && security_events * 10 > total_events {
            recommendations.push(
                "High number of security events detected - review security posture".to_string(),
            );
        }
        let total_failures: u64 = failure_breakdown.values().sum();
        if total_failures * 20 > encryption_operations {
            recommendations.push(
                "Encryption failure rate is high - investigate system reliability".to_string(),
            );
        }

        let day = format_description!("[year][month][day]");
        let report = ComplianceReport {
            report_id: format!(
                "{report_type}_{}_{}",
                start.format(&day).unwrap_or_default(),
                end.format(&day).unwrap_or_default()
            ),
            report_type: report_type.to_string(),
            generated_at: format_ts(OffsetDateTime::now_utc()),
            period_start: start_ts.clone(),
            period_end: end_ts.clone(),
            total_events,
            encryption_operations,
            key_operations,
            security_events,
            compliance_violations,
            event_breakdown,
            failure_breakdown,
            recommendations,
            client_scope: client_id.map(str::to_string),
            matter_scope: matter_id.map(str::to_string),
        };

        let report_json = serde_json::to_string(&report)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO compliance_reports
                 (report_id, report_type, generated_at, period_start, period_end, report_data)
                 VALUES (?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    report.report_id,
                    report.report_type,
                    report.generated_at,
                    report.period_start,
                    report.period_end,
                    report_json
                ],
            )?;
            Ok(())
        })?;

        self.log_event(
            AuditEventType::ComplianceCheck,
            EventLevel::Info,
            serde_json::json!({
                "report_id": &report.report_id,
                "report_type": &report.report_type,
                "total_events": report.total_events,
                "compliance_violations": report.compliance_violations,
            }),
            EventScope::new("audit_ledger", "generate_compliance_report"),
        )?;

        info!(report_id = %report.report_id, total_events, "compliance report generated");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::{AuditConfig, SearchCriteria};
    use tempfile::TempDir;

    fn seeded_ledger(dir: &TempDir) -> AuditLedger {
        let ledger =
            AuditLedger::open(AuditConfig::new(dir.path().join("ledger.db"))).unwrap();
        let scope = || EventScope::new("test", "seed").tenant("c1", "m1");

        for _ in 0..4 {
            ledger
                .log_event(
                    AuditEventType::DocumentEncrypted,
                    EventLevel::Info,
                    serde_json::json!({ "compliance_level": "attorney_client" }),
                    scope().document("doc-1"),
                )
                .unwrap();
        }
        ledger
            .log_event(
                AuditEventType::DocumentDecrypted,
                EventLevel::Info,
                serde_json::json!({}),
                scope().document("doc-1"),
            )
            .unwrap();
        ledger
            .log_event(
                AuditEventType::KeyCreated,
                EventLevel::Info,
                serde_json::json!({}),
                scope().key("key-1"),
            )
            .unwrap();
        ledger
            .log_event(
                AuditEventType::SecurityAlert,
                EventLevel::Security,
                serde_json::json!({ "alert_type": "HIGH_DECRYPTION_FAILURE_RATE" }),
                scope(),
            )
            .unwrap();
        ledger
            .log_failed_operation("document_decryption", Some("doc-1"), None, "tag mismatch")
            .unwrap();
        ledger
    }

    #[test]
    fn test_report_aggregates() {
        let dir = TempDir::new().unwrap();
        let ledger = seeded_ledger(&dir);

        let now = OffsetDateTime::now_utc();
        let report = ledger
            .generate_compliance_report(
                "QUARTERLY",
                now - time::Duration::days(1),
                now + time::Duration::days(1),
                None,
                None,
            )
            .unwrap();

        // 4 encrypted + 1 decrypted + 1 key_created + 1 alert + 1
        // decryption_failed mirror + 1 key_accessed-free = 8 events.
        assert!(report.total_events >= 8);
        assert_eq!(report.encryption_operations, 5);
        assert!(report.key_operations >= 1);
        assert_eq!(report.security_events, 1);
        assert!(report.compliance_violations >= 5);
        assert_eq!(report.failure_breakdown.get("document_decryption"), Some(&1));
        assert!(report
            .event_breakdown
            .contains_key("document_encrypted"));

        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("compliance violations")));
        // 1 failure over 5 encryption operations is a 20% failure rate.
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("Encryption failure rate is high")));
    }

    #[test]
    fn test_report_scoped_to_tenant() {
        let dir = TempDir::new().unwrap();
        let ledger = seeded_ledger(&dir);
        ledger
            .log_event(
                AuditEventType::DocumentEncrypted,
                EventLevel::Info,
                serde_json::json!({}),
                EventScope::new("test", "seed").tenant("other", "tenant"),
            )
            .unwrap();

        let now = OffsetDateTime::now_utc();
        let scoped = ledger
            .generate_compliance_report(
                "TENANT",
                now - time::Duration::days(1),
                now + time::Duration::days(1),
                Some("other"),
                Some("tenant"),
            )
            .unwrap();
        assert_eq!(scoped.total_events, 1);
        assert_eq!(scoped.client_scope.as_deref(), Some("other"));
    }

    #[test]
    fn test_report_is_persisted_and_audited() {
        let dir = TempDir::new().unwrap();
        let ledger = seeded_ledger(&dir);
        let now = OffsetDateTime::now_utc();
        let report = ledger
            .generate_compliance_report(
                "ANNUAL",
                now - time::Duration::days(1),
                now + time::Duration::days(1),
                None,
                None,
            )
            .unwrap();

        let stored: u64 = ledger
            .with_conn(|c| {
                Ok(c.query_row(
                    "SELECT COUNT(*) FROM compliance_reports WHERE report_id = ?",
                    [&report.report_id],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(stored, 1);

        let checks = ledger
            .search(
                &SearchCriteria {
                    event_type: Some(AuditEventType::ComplianceCheck),
                    ..SearchCriteria::default()
                },
                10,
            )
            .unwrap();
        assert_eq!(checks.len(), 1);
    }
}
