use anyhow::{anyhow, Context, Result};
use chancery_backup::BackupKind;
use chancery_monitor::VerificationLevel;
use chancery_platform::{Platform, PlatformConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use time::OffsetDateTime;

#[derive(Parser, Debug)]
#[command(
    name = "chancery",
    about = "At-rest encryption platform for legal documents with per-tenant key isolation",
    long_about = "Chancery encrypts legal documents and backups at rest with per-client-matter \
                  key isolation, lifecycle-managed key material, continuous verification, and a \
                  tamper-evident audit trail with compliance retention.\n\n\
                  Features:\n\
                  • AES-256-GCM document encryption with per-document derived keys\n\
                  • ChaCha20-Poly1305 backup archives in a separate key hierarchy\n\
                  • Automatic key rotation with per-type policies\n\
                  • Tiered verification sweeps (basic through forensic)\n\
                  • Indexed audit ledger with compliance reports\n\n\
                  Quick start:\n\
                  1. chancery encrypt -f brief.pdf -c acme -m 2026-041\n\
                  2. chancery status\n\
                  3. chancery report --days 30"
)]
pub struct Cli {
    /// Platform data directory (defaults to the OS data dir).
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Encrypt a document for a client matter
    Encrypt {
        /// Path of the file to encrypt
        #[arg(short, long)]
        file: PathBuf,
        /// Client identifier
        #[arg(short, long)]
        client: String,
        /// Matter identifier
        #[arg(short, long)]
        matter: String,
        /// Compliance level tag bound into the container
        #[arg(long, default_value = "attorney_client")]
        compliance: String,
    },

    /// Decrypt a document and write the plaintext to a file
    Decrypt {
        /// Document identifier returned at encryption time
        #[arg(short, long)]
        document_id: String,
        #[arg(short, long)]
        client: String,
        #[arg(short, long)]
        matter: String,
        /// Acting user recorded in the audit trail
        #[arg(short, long)]
        user: Option<String>,
        /// Output path for the plaintext
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Encrypt every supported document under a directory
    EncryptDir {
        #[arg(short = 'p', long)]
        path: PathBuf,
        #[arg(short, long)]
        client: String,
        #[arg(short, long)]
        matter: String,
        #[arg(long, default_value = "attorney_client")]
        compliance: String,
    },

    /// Create an encrypted backup and run its restoration self-test
    Backup {
        /// Backup kind: database, documents, or system
        #[arg(short, long, default_value = "database")]
        kind: String,
        /// Source locator (SQLite file, postgresql:// URL, or archive file)
        #[arg(short, long)]
        source: String,
    },

    /// Rotate the active key of a client matter
    Rotate {
        #[arg(short, long)]
        client: String,
        #[arg(short, long)]
        matter: String,
        /// Rotate even if not yet due (required for approval-gated keys)
        #[arg(long)]
        force: bool,
    },

    /// Revoke a key; encrypted data under it becomes unreadable
    Revoke {
        #[arg(short, long)]
        key_id: String,
        #[arg(short, long)]
        reason: String,
    },

    /// List keys inside their rotation warning window
    RotationDue,

    /// Verify one document (or sweep the whole inventory)
    Verify {
        /// Document to verify; omit to sweep everything
        #[arg(short, long)]
        document_id: Option<String>,
        /// Verification level: basic, standard, comprehensive, forensic
        #[arg(short, long, default_value = "standard")]
        level: String,
    },

    /// Show platform health and counters
    Status,

    /// Generate a compliance report over the trailing period
    Report {
        /// Days of history to cover
        #[arg(long, default_value = "30")]
        days: i64,
        /// Restrict to one client
        #[arg(long)]
        client: Option<String>,
    },
}

/// Resolves the data directory: explicit flag, or `<os data dir>/chancery`.
///
/// # Errors
/// Fails when no OS data directory can be determined.
pub fn resolve_data_dir(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = flag {
        return Ok(dir);
    }
    let base = dirs::data_dir().ok_or_else(|| anyhow!("no data directory available"))?;
    Ok(base.join("chancery"))
}

fn parse_backup_kind(kind: &str) -> Result<BackupKind> {
    match kind.to_lowercase().as_str() {
        "database" | "db" => Ok(BackupKind::Database),
        "documents" | "docs" => Ok(BackupKind::Documents),
        "system" | "full" | "full_system" => Ok(BackupKind::FullSystem),
        other => Err(anyhow!("unknown backup kind: {other}")),
    }
}

fn parse_level(level: &str) -> Result<VerificationLevel> {
    match level.to_lowercase().as_str() {
        "basic" => Ok(VerificationLevel::Basic),
        "standard" => Ok(VerificationLevel::Standard),
        "comprehensive" => Ok(VerificationLevel::Comprehensive),
        "forensic" => Ok(VerificationLevel::Forensic),
        other => Err(anyhow!("unknown verification level: {other}")),
    }
}

/// Executes one CLI command against a platform instance rooted at
/// `data_dir`.
///
/// # Errors
/// Propagates platform failures; this is the outermost layer, so messages
/// here are composed for humans.
pub fn handle_command(command: Commands, data_dir: PathBuf) -> Result<()> {
    let platform = Platform::open(PlatformConfig::under_root(&data_dir))
        .with_context(|| format!("failed to open platform at {}", data_dir.display()))?;

    let result = run(&platform, command);
    platform.shutdown()?;
    result
}

fn run(platform: &Platform, command: Commands) -> Result<()> {
    match command {
        Commands::Encrypt {
            file,
            client,
            matter,
            compliance,
        } => {
            let outcome = platform.encrypt_client_document(&file, &client, &matter, &compliance)?;
            println!("Encrypted {} -> {}", file.display(), outcome.document_id);
            println!("Container: {}", outcome.container_path.display());
        }

        Commands::Decrypt {
            document_id,
            client,
            matter,
            user,
            output,
        } => {
            let plaintext =
                platform.decrypt_client_document(&document_id, &client, &matter, user.as_deref())?;
            std::fs::write(&output, plaintext)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("Decrypted {document_id} -> {}", output.display());
        }

        Commands::EncryptDir {
            path,
            client,
            matter,
            compliance,
        } => {
            let results = platform
                .documents()
                .encrypt_directory(&path, &client, &matter, &compliance)?;
            let ok = results.iter().filter(|r| r.outcome.is_ok()).count();
            println!("Encrypted {ok}/{} files", results.len());
            for entry in results.iter().filter(|r| r.outcome.is_err()) {
                if let Err(e) = &entry.outcome {
                    eprintln!("  failed: {} ({e})", entry.source.display());
                }
            }
        }

        Commands::Backup { kind, source } => {
            let kind = parse_backup_kind(&kind)?;
            let (outcome, report) = platform.create_encrypted_backup(kind, &source)?;
            println!("Backup created: {}", outcome.backup_id);
            println!(
                "  {} -> {} bytes ({}), restoration test: {}",
                outcome.record.original_size,
                outcome.record.encrypted_size,
                outcome.record.compression,
                if report.success { "passed" } else { "FAILED" }
            );
            if !report.errors.is_empty() {
                for error in &report.errors {
                    eprintln!("  issue: {error}");
                }
            }
        }

        Commands::Rotate {
            client,
            matter,
            force,
        } => {
            let new_key_id = platform.rotate_keys_for_client_matter(&client, &matter, force)?;
            println!("Rotated key for {client}/{matter} -> {new_key_id}");
        }

        Commands::Revoke { key_id, reason } => {
            platform.revoke_key(&key_id, &reason)?;
            println!("Revoked {key_id}");
        }

        Commands::RotationDue => {
            let due = platform.keys().list_due_for_rotation()?;
            if due.is_empty() {
                println!("No keys due for rotation");
            }
            for entry in due {
                println!(
                    "{} ({}) age {}d, due in {}d{}",
                    entry.key_id,
                    entry.key_type,
                    entry.age_days,
                    entry.days_until_rotation,
                    if entry.overdue { " [OVERDUE]" } else { "" }
                );
            }
        }

        Commands::Verify { document_id, level } => {
            let level = parse_level(&level)?;
            match document_id {
                Some(document_id) => {
                    let record = platform.monitor().verify_document(&document_id, level)?;
                    println!("{document_id}: {}", record.status);
                    for issue in &record.issues {
                        println!("  issue: {issue}");
                    }
                }
                None => {
                    let summary = platform.monitor().sweep(level)?;
                    println!(
                        "Sweep ({}): {}/{} encrypted, failure rate {:.1}%",
                        summary.level,
                        summary.encrypted,
                        summary.total_documents,
                        summary.failure_rate * 100.0
                    );
                }
            }
        }

        Commands::Status => {
            let status = platform.system_status()?;
            println!("Health: {}", status.health);
            println!("Encrypted documents: {}", status.total_encrypted_documents);
            println!("Backup archives:     {}", status.total_backup_archives);
            println!("Managed keys:        {}", status.total_managed_keys);
            println!(
                "Verification rate:   {:.1}%",
                status.verification_success_rate * 100.0
            );
            println!("Keys due/overdue:    {}/{}", status.keys_due_for_rotation, status.keys_overdue);
            println!("Audit events:        {}", status.audit_events_total);
            for recommendation in &status.recommendations {
                println!("  note: {recommendation}");
            }
        }

        Commands::Report { days, client } => {
            let now = OffsetDateTime::now_utc();
            let audit = platform.perform_comprehensive_audit(
                now - time::Duration::days(days),
                now,
                client.as_deref(),
            )?;
            let report = &audit.report;
            println!("Report {} ({} days)", report.report_id, days);
            println!("  total events:          {}", report.total_events);
            println!("  encryption operations: {}", report.encryption_operations);
            println!("  key operations:        {}", report.key_operations);
            println!("  security events:       {}", report.security_events);
            println!("  compliance violations: {}", report.compliance_violations);
            for recommendation in &report.recommendations {
                println!("  recommendation: {recommendation}");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_backup_kind() {
        assert_eq!(parse_backup_kind("database").unwrap(), BackupKind::Database);
        assert_eq!(parse_backup_kind("DOCS").unwrap(), BackupKind::Documents);
        assert_eq!(parse_backup_kind("full").unwrap(), BackupKind::FullSystem);
        assert!(parse_backup_kind("tape").is_err());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("basic").unwrap(), VerificationLevel::Basic);
        assert_eq!(parse_level("FORENSIC").unwrap(), VerificationLevel::Forensic);
        assert!(parse_level("paranoid").is_err());
    }

    #[test]
    fn test_resolve_data_dir_prefers_flag() {
        let dir = TempDir::new().unwrap();
        let resolved = resolve_data_dir(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(resolved, dir.path());
    }

    #[test]
    fn test_encrypt_and_status_commands() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("data");
        let file = dir.path().join("brief.txt");
        std::fs::write(&file, b"privileged text").unwrap();

        handle_command(
            Commands::Encrypt {
                file,
                client: "acme".into(),
                matter: "2026-041".into(),
                compliance: "attorney_client".into(),
            },
            data_dir.clone(),
        )
        .unwrap();

        handle_command(Commands::Status, data_dir).unwrap();
    }
}
