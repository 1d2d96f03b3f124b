use crate::BackupError;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, error};

enum SourceKind<'a> {
    Sqlite(&'a str),
    Postgres(&'a str),
}

fn classify(source: &str) -> Result<SourceKind<'_>, BackupError> {
    if source.starts_with("postgresql://") || source.starts_with("postgres://") {
        return Ok(SourceKind::Postgres(source));
    }
    let path = source.strip_prefix("file://").unwrap_or(source);
    if path.ends_with(".db") || path.ends_with(".sqlite") || path.ends_with(".sqlite3") {
        return Ok(SourceKind::Sqlite(path));
    }
    Err(BackupError::UnsupportedSource(source.to_string()))
}

/// Produces a SQL dump of `source` at `dest`.
///
/// Recognized source forms:
/// * `file://` URLs or plain paths ending in `.db`/`.sqlite`/`.sqlite3`,
///   dumped in-process.
/// * `postgresql://` / `postgres://` URLs, dumped through the external
///   `pg_dump` collaborator, which is killed after `timeout`.
///
/// # Errors
/// * `BackupError::UnsupportedSource` for any other locator.
/// * `BackupError::DumpFailed` when the dump tool fails or times out.
pub fn create_dump(source: &str, dest: &Path, timeout: Duration) -> Result<(), BackupError> {
    match classify(source)? {
        SourceKind::Sqlite(path) => sqlite_dump(Path::new(path), dest),
        SourceKind::Postgres(conn) => postgres_dump(conn, dest, timeout),
    }
}

/// Dumps a SQLite database as executable SQL: schema statements from
/// `sqlite_master` followed by one INSERT per row.
fn sqlite_dump(db_path: &Path, dest: &Path) -> Result<(), BackupError> {
    if !db_path.exists() {
        return Err(BackupError::DumpFailed(format!(
            "database not found: {}",
            db_path.display()
        )));
    }
    let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let mut out = BufWriter::new(File::create(dest)?);

    writeln!(out, "BEGIN TRANSACTION;")?;

    let mut tables: Vec<(String, String)> = Vec::new();
    {
        let mut stmt = conn.prepare(
            "SELECT name, sql FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND sql IS NOT NULL
             ORDER BY name",
        )?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
        for row in rows {
            tables.push(row?);
        }
    }

    for (name, sql) in &tables {
        writeln!(out, "{sql};")?;
        dump_table_rows(&conn, name, &mut out)?;
    }

    // Indexes and triggers after the data they cover.
    let mut stmt = conn.prepare(
        "SELECT sql FROM sqlite_master
         WHERE type IN ('index', 'trigger', 'view') AND sql IS NOT NULL
         ORDER BY name",
    )?;
    let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
    for row in rows {
        writeln!(out, "{};", row?)?;
    }

    writeln!(out, "COMMIT;")?;
    out.flush()?;
    debug!(db = %db_path.display(), dump = %dest.display(), "sqlite dump written");
    Ok(())
}

fn dump_table_rows(
    conn: &Connection,
    table: &str,
    out: &mut BufWriter<File>,
) -> Result<(), BackupError> {
    let quoted = table.replace('"', "\"\"");
    let mut stmt = conn.prepare(&format!("SELECT * FROM \"{quoted}\""))?;
    let column_count = stmt.column_count();

    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            values.push(sql_literal(row.get_ref(i)?));
        }
        writeln!(
            out,
            "INSERT INTO \"{quoted}\" VALUES ({});",
            values.join(", ")
        )?;
    }
    Ok(())
}

fn sql_literal(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => {
            let text = String::from_utf8_lossy(t).replace('\'', "''");
            format!("'{text}'")
        }
        ValueRef::Blob(b) => format!("X'{}'", chancery_crypto::to_hex(b)),
    }
}

/// Runs `pg_dump` with a poll-and-kill timeout; stderr is captured for the
/// failure message, never the dumped data.
fn postgres_dump(conn_str: &str, dest: &Path, timeout: Duration) -> Result<(), BackupError> {
    let mut child = Command::new("pg_dump")
        .arg(conn_str)
        .arg("--no-password")
        .arg("--file")
        .arg(dest)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| BackupError::DumpFailed(format!("failed to launch pg_dump: {e}")))?;

    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if started.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    error!(timeout_secs = timeout.as_secs(), "pg_dump timed out");
                    return Err(BackupError::DumpFailed(format!(
                        "pg_dump exceeded {}s timeout",
                        timeout.as_secs()
                    )));
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                return Err(BackupError::DumpFailed(format!(
                    "failed waiting for pg_dump: {e}"
                )))
            }
        }
    };

    if !status.success() {
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        return Err(BackupError::DumpFailed(format!(
            "pg_dump exited with {status}: {}",
            stderr.trim()
        )));
    }
    Ok(())
}
