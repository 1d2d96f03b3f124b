use crate::{KeyRecord, KeyType};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use time::OffsetDateTime;
use zeroize::Zeroizing;

/// Errors raised by vault backends.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("vault I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("vault database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("vault record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("vault lock poisoned")]
    Poisoned,
}

/// Opaque persistent storage for key bytes and their metadata records.
///
/// The key store treats the stored bytes as opaque: interpretation (length,
/// algorithm binding) happens above this trait. Implementations must be safe
/// for concurrent use.
pub trait KeyVault: Send + Sync {
    /// Stores or replaces a key and its metadata record.
    fn put(&self, key_id: &str, key_bytes: &[u8], record: &KeyRecord) -> Result<(), VaultError>;

    /// Retrieves key bytes and metadata.
    fn get(&self, key_id: &str) -> Result<(Zeroizing<Vec<u8>>, KeyRecord), VaultError>;

    /// Retrieves only the metadata record.
    fn get_record(&self, key_id: &str) -> Result<KeyRecord, VaultError>;

    /// Replaces only the metadata record, leaving key bytes untouched.
    fn put_record(&self, record: &KeyRecord) -> Result<(), VaultError>;

    /// Destroys a key. Backends persisting to local storage must overwrite
    /// the key bytes with CSPRNG output before unlinking the file.
    fn delete(&self, key_id: &str) -> Result<(), VaultError>;

    /// Lists key ids, optionally filtered by type.
    fn list(&self, key_type: Option<KeyType>) -> Result<Vec<String>, VaultError>;
}

/// Local filesystem vault: one file per key plus a SQLite metadata index.
///
/// Layout under the vault root (mode 0700):
/// * `key_vault.db`: metadata index
/// * `<key_id>.key`: raw key bytes, mode 0600
#[derive(Debug)]
pub struct LocalKeyVault {
    root: PathBuf,
    conn: Mutex<Connection>,
}

impl LocalKeyVault {
    /// Opens a vault at `root`, creating the directory and metadata
    /// database if absent.
    ///
    /// # Errors
    /// Returns an error when the directory cannot be created, permissions
    /// cannot be applied, or the metadata database cannot be opened or
    /// migrated.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, VaultError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        set_dir_private(&root)?;

        let conn = Connection::open(root.join("key_vault.db"))?;
        let vault = Self {
            root,
            conn: Mutex::new(conn),
        };
        vault.migrate()?;
        Ok(vault)
    }

    fn migrate(&self) -> Result<(), VaultError> {
        let conn = self.lock()?;
        conn.execute_batch(
            r"
        PRAGMA journal_mode=WAL;
        PRAGMA foreign_keys=ON;

        CREATE TABLE IF NOT EXISTS key_vault (
            key_id TEXT PRIMARY KEY,
            key_file TEXT NOT NULL,
            key_type TEXT NOT NULL,
            created_at TEXT NOT NULL,
            record TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_key_vault_type ON key_vault(key_type);
        ",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, VaultError> {
        self.conn.lock().map_err(|_| VaultError::Poisoned)
    }

    fn key_path(&self, key_id: &str) -> PathBuf {
        self.root.join(format!("{key_id}.key"))
    }
}

impl KeyVault for LocalKeyVault {
    fn put(&self, key_id: &str, key_bytes: &[u8], record: &KeyRecord) -> Result<(), VaultError> {
        let record_json = serde_json::to_string(record)?;
        let now = OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_default();
        let key_file = self.key_path(key_id);

        // Hold the index lock across the file write so concurrent writers
        // to the same key_id are serialized.
        let conn = self.lock()?;
        fs::write(&key_file, key_bytes)?;
        set_file_private(&key_file)?;
        conn.execute(
            "INSERT OR REPLACE INTO key_vault (key_id, key_file, key_type, created_at, record)
             VALUES (?, ?, ?, ?, ?)",
            params![
                key_id,
                key_file.to_string_lossy(),
                record.key_type.as_str(),
                now,
                record_json
            ],
        )?;
        Ok(())
    }

    fn get(&self, key_id: &str) -> Result<(Zeroizing<Vec<u8>>, KeyRecord), VaultError> {
        let (key_file, record_json) = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT key_file, record FROM key_vault WHERE key_id = ?",
                params![key_id],
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
            )
            .optional()?
            .ok_or_else(|| VaultError::NotFound(key_id.to_string()))?
        };

        let record: KeyRecord = serde_json::from_str(&record_json)?;
        let path = Path::new(&key_file);
        if !path.exists() {
            return Err(VaultError::NotFound(key_id.to_string()));
        }
        let bytes = Zeroizing::new(fs::read(path)?);
        Ok((bytes, record))
    }

    fn get_record(&self, key_id: &str) -> Result<KeyRecord, VaultError> {
        let record_json = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT record FROM key_vault WHERE key_id = ?",
                params![key_id],
                |r| r.get::<_, String>(0),
            )
            .optional()?
            .ok_or_else(|| VaultError::NotFound(key_id.to_string()))?
        };
        Ok(serde_json::from_str(&record_json)?)
    }

    fn put_record(&self, record: &KeyRecord) -> Result<(), VaultError> {
        let record_json = serde_json::to_string(record)?;
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE key_vault SET record = ? WHERE key_id = ?",
            params![record_json, record.key_id],
        )?;
        if updated == 0 {
            return Err(VaultError::NotFound(record.key_id.clone()));
        }
        Ok(())
    }

    fn delete(&self, key_id: &str) -> Result<(), VaultError> {
        let conn = self.lock()?;
        let key_file: Option<String> = conn
            .query_row(
                "SELECT key_file FROM key_vault WHERE key_id = ?",
                params![key_id],
                |r| r.get(0),
            )
            .optional()?;

        if let Some(key_file) = key_file {
            let path = Path::new(&key_file);
            if path.exists() {
                // Overwrite with random bytes before unlink so the key
                // material does not survive on disk.
                let len = fs::metadata(path)?.len() as usize;
                let mut scrub = vec![0u8; len.max(1)];
                if getrandom::fill(&mut scrub).is_err() {
                    scrub.fill(0);
                }
                fs::write(path, &scrub)?;
                fs::remove_file(path)?;
            }
            conn.execute("DELETE FROM key_vault WHERE key_id = ?", params![key_id])?;
        }
        Ok(())
    }

    fn list(&self, key_type: Option<KeyType>) -> Result<Vec<String>, VaultError> {
        let conn = self.lock()?;
        let mut out = Vec::new();
        match key_type {
            Some(kt) => {
                let mut stmt = conn
                    .prepare("SELECT key_id FROM key_vault WHERE key_type = ? ORDER BY key_id")?;
                let rows = stmt.query_map(params![kt.as_str()], |r| r.get::<_, String>(0))?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare("SELECT key_id FROM key_vault ORDER BY key_id")?;
                let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(unix)]
fn set_file_private(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_file_private(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_dir_private(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn set_dir_private(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::KeyStatus;
    use chancery_crypto::Algorithm;
    use tempfile::TempDir;

    fn test_record(key_id: &str, key_type: KeyType) -> KeyRecord {
        let now = OffsetDateTime::now_utc();
        KeyRecord {
            key_id: key_id.to_string(),
            key_type,
            status: KeyStatus::Active,
            algorithm: Algorithm::Aes256Gcm,
            client_id: None,
            matter_id: None,
            created_at: now,
            last_used_at: now,
            rotation_due_at: now + time::Duration::days(90),
            access_count: 0,
            derived_from: None,
            compliance_level: "confidential".into(),
            status_reason: None,
        }
    }

    #[test]
    fn test_put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let vault = LocalKeyVault::open(dir.path().join("vault")).unwrap();

        let record = test_record("k-1", KeyType::Master);
        vault.put("k-1", &[0xAB; 32], &record).unwrap();

        let (bytes, loaded) = vault.get("k-1").unwrap();
        assert_eq!(bytes.as_slice(), &[0xAB; 32]);
        assert_eq!(loaded.key_id, "k-1");
        assert_eq!(loaded.key_type, KeyType::Master);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let vault = LocalKeyVault::open(dir.path().join("vault")).unwrap();
        assert!(matches!(vault.get("nope"), Err(VaultError::NotFound(_))));
        assert!(matches!(
            vault.get_record("nope"),
            Err(VaultError::NotFound(_))
        ));
    }

    #[test]
    fn test_put_record_updates_metadata_only() {
        let dir = TempDir::new().unwrap();
        let vault = LocalKeyVault::open(dir.path().join("vault")).unwrap();

        let mut record = test_record("k-2", KeyType::ClientMatter);
        vault.put("k-2", &[1; 32], &record).unwrap();

        record.status = KeyStatus::Deprecated;
        record.access_count = 7;
        vault.put_record(&record).unwrap();

        let (bytes, loaded) = vault.get("k-2").unwrap();
        assert_eq!(bytes.as_slice(), &[1; 32]);
        assert_eq!(loaded.status, KeyStatus::Deprecated);
        assert_eq!(loaded.access_count, 7);
    }

    #[test]
    fn test_put_record_missing_key_fails() {
        let dir = TempDir::new().unwrap();
        let vault = LocalKeyVault::open(dir.path().join("vault")).unwrap();
        let record = test_record("ghost", KeyType::Backup);
        assert!(matches!(
            vault.put_record(&record),
            Err(VaultError::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_removes_file_and_row() {
        let dir = TempDir::new().unwrap();
        let vault = LocalKeyVault::open(dir.path().join("vault")).unwrap();

        vault
            .put("gone", &[9; 32], &test_record("gone", KeyType::Backup))
            .unwrap();
        let key_file = dir.path().join("vault").join("gone.key");
        assert!(key_file.exists());

        vault.delete("gone").unwrap();
        assert!(!key_file.exists());
        assert!(matches!(vault.get("gone"), Err(VaultError::NotFound(_))));

        // Deleting again is a no-op.
        vault.delete("gone").unwrap();
    }

    #[test]
    fn test_list_filters_by_type() {
        let dir = TempDir::new().unwrap();
        let vault = LocalKeyVault::open(dir.path().join("vault")).unwrap();

        vault
            .put("m-1", &[1; 32], &test_record("m-1", KeyType::Master))
            .unwrap();
        vault
            .put("b-1", &[2; 32], &test_record("b-1", KeyType::Backup))
            .unwrap();
        vault
            .put("b-2", &[3; 32], &test_record("b-2", KeyType::Backup))
            .unwrap();

        assert_eq!(vault.list(Some(KeyType::Backup)).unwrap(), vec!["b-1", "b-2"]);
        assert_eq!(vault.list(Some(KeyType::Master)).unwrap(), vec!["m-1"]);
        assert_eq!(vault.list(None).unwrap().len(), 3);
        assert!(vault.list(Some(KeyType::Document)).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let vault_dir = dir.path().join("vault");
        let vault = LocalKeyVault::open(&vault_dir).unwrap();
        vault
            .put("perm", &[4; 32], &test_record("perm", KeyType::Master))
            .unwrap();

        let dir_mode = fs::metadata(&vault_dir).unwrap().permissions().mode() & 0o777;
        let file_mode = fs::metadata(vault_dir.join("perm.key"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
        assert_eq!(file_mode, 0o600);
    }
}
