use crate::dump::create_dump;
use crate::{
    BackupConfig, BackupContainer, BackupError, BackupKind, BackupRecord, VerificationStatus,
    BACKUP_CONTAINER_VERSION,
};
use chancery_crypto::{
    aead_decrypt, aead_encrypt, constant_time_eq, derive_key, key_digest, random_nonce,
    random_salt, sha256, to_hex, Algorithm, CryptoError,
};
use chancery_vault::KeyStore;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{info, warn};

/// Result of a successful backup creation.
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub backup_id: String,
    pub container_path: PathBuf,
    pub record: BackupRecord,
}

/// Findings of a restoration self-test.
#[derive(Debug, Clone)]
pub struct RestorationReport {
    pub backup_id: String,
    pub metadata_valid: bool,
    pub decryption_successful: bool,
    pub integrity_verified: bool,
    pub data_readable: bool,
    /// Only populated for database backups: whether the decrypted bytes
    /// look like SQL.
    pub sql_valid: Option<bool>,
    pub duration_ms: u128,
    pub errors: Vec<String>,
    pub success: bool,
}

// Staging intermediates (dumps, gzip files) must not survive the backup
// operation on any exit path.
struct StagingGuard {
    paths: Vec<PathBuf>,
}

impl StagingGuard {
    fn track(&mut self, path: PathBuf) -> PathBuf {
        self.paths.push(path.clone());
        path
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        for path in &self.paths {
            if path.exists() {
                let _ = fs::remove_file(path);
            }
        }
    }
}

/// Builds the associated data authenticated alongside a backup payload.
#[must_use]
pub fn backup_aad(
    backup_id: &str,
    backup_type: &str,
    created_at: &str,
    payload_hash_hex: &str,
) -> Vec<u8> {
    let mut aad = Vec::with_capacity(
        backup_id.len() + backup_type.len() + created_at.len() + payload_hash_hex.len() + 3,
    );
    aad.extend_from_slice(backup_id.as_bytes());
    aad.push(0x1f);
    aad.extend_from_slice(backup_type.as_bytes());
    aad.push(0x1f);
    aad.extend_from_slice(created_at.as_bytes());
    aad.push(0x1f);
    aad.extend_from_slice(payload_hash_hex.as_bytes());
    aad
}

/// Creates and restores ChaCha20-Poly1305 encrypted backup archives.
///
/// Backups live in a key hierarchy disjoint from document encryption: keys
/// come from the backup namespace of the key store and use a different
/// cipher and iteration count than tenant documents.
pub struct BackupEncryptor {
    keys: Arc<KeyStore>,
    config: BackupConfig,
}

impl BackupEncryptor {
    /// Creates the encryptor, preparing backup directories with owner-only
    /// permissions.
    ///
    /// # Errors
    /// Fails when a directory cannot be created.
    pub fn new(keys: Arc<KeyStore>, config: BackupConfig) -> Result<Self, BackupError> {
        for dir in [&config.backup_dir, &config.metadata_dir, &config.staging_dir] {
            fs::create_dir_all(dir)?;
            set_dir_private(dir)?;
        }
        Ok(Self { keys, config })
    }

    #[must_use]
    pub fn container_path(&self, backup_id: &str) -> PathBuf {
        self.config.backup_dir.join(format!("{backup_id}.encrypted"))
    }

    #[must_use]
    pub fn record_path(&self, backup_id: &str) -> PathBuf {
        self.config
            .metadata_dir
            .join(format!("{backup_id}_backup_metadata.json"))
    }

    /// Creates an encrypted backup of `source`.
    ///
    /// For `BackupKind::Database` the source locator selects the dump
    /// strategy (`.db`/`.sqlite` files in-process, `postgresql://` through
    /// `pg_dump`); for the other kinds the source must be an existing file
    /// whose bytes are archived as-is. The payload is optionally gzipped,
    /// hashed, and sealed with the kind's backup key; dump and compression
    /// intermediates are deleted on every exit path.
    ///
    /// # Errors
    /// * `BackupError::UnsupportedSource` for unrecognized locators.
    /// * `BackupError::DumpFailed` when the dump tool fails or times out.
    /// * Key, crypto, and storage failures propagate with their kinds.
    pub fn create_backup(
        &self,
        kind: BackupKind,
        source: &str,
    ) -> Result<BackupOutcome, BackupError> {
        let backup_id = new_backup_id(kind);
        info!(%backup_id, kind = %kind, "starting backup");

        let mut staging = StagingGuard { paths: Vec::new() };

        let payload_path = match kind {
            BackupKind::Database => {
                let dump_path = staging.track(self.config.staging_dir.join(format!("{backup_id}.sql")));
                create_dump(
                    source,
                    &dump_path,
                    Duration::from_secs(self.config.pg_dump_timeout_secs),
                )?;
                dump_path
            }
            BackupKind::Documents | BackupKind::FullSystem => {
                let path = Path::new(source.strip_prefix("file://").unwrap_or(source));
                if !path.is_file() {
                    return Err(BackupError::UnsupportedSource(source.to_string()));
                }
                let copy = staging.track(self.config.staging_dir.join(format!("{backup_id}.raw")));
                fs::copy(path, &copy)?;
                copy
            }
        };

        let original_size = fs::metadata(&payload_path)?.len();

        let (final_path, compression) = if self.config.compression_enabled {
            let gz_path = staging.track(self.config.staging_dir.join(format!("{backup_id}.gz")));
            gzip_file(&payload_path, &gz_path)?;
            (gz_path, "gzip")
        } else {
            (payload_path.clone(), "none")
        };
        let compressed_size = fs::metadata(&final_path)?.len();

        let payload = fs::read(&final_path)?;
        let payload_hash = sha256(&payload);
        let payload_hash_hex = to_hex(&payload_hash);

        let (backup_key, key_id) = self.keys.backup_key(kind.key_subtype())?;
        let salt = random_salt()?;
        let dek = derive_key(
            &salt,
            &backup_key,
            backup_id.as_bytes(),
            self.config.kdf_iterations,
        )?;
        let nonce = random_nonce()?;
        let created_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|e| BackupError::Malformed(e.to_string()))?;
        let aad = backup_aad(&backup_id, kind.as_str(), &created_at, &payload_hash_hex);

        let ciphertext = aead_encrypt(Algorithm::ChaCha20Poly1305, &dek, &nonce, &aad, &payload)?;

        let container = BackupContainer {
            version: BACKUP_CONTAINER_VERSION,
            algorithm: Algorithm::ChaCha20Poly1305.as_str().to_string(),
            backup_id: backup_id.clone(),
            backup_type: kind.as_str().to_string(),
            compression: compression.to_string(),
            salt: salt.to_vec(),
            nonce: nonce.to_vec(),
            aad,
            ciphertext,
            payload_hash: payload_hash.to_vec(),
            created_at: created_at.clone(),
            key_id_digest: key_digest(&dek),
        };

        let container_path = self.container_path(&backup_id);
        write_private_atomic(
            &container_path,
            &serde_json::to_vec(&container).map_err(|e| BackupError::Malformed(e.to_string()))?,
        )?;
        let encrypted_size = fs::metadata(&container_path)?.len();

        let retention_until = (OffsetDateTime::now_utc()
            + time::Duration::days(self.config.retention_days))
        .format(&Rfc3339)
        .map_err(|e| BackupError::Malformed(e.to_string()))?;

        let record = BackupRecord {
            backup_id: backup_id.clone(),
            backup_type: kind.as_str().to_string(),
            created_at,
            original_size,
            compressed_size,
            encrypted_size,
            payload_sha256: payload_hash_hex,
            key_id,
            key_id_digest: container.key_id_digest.clone(),
            algorithm: container.algorithm.clone(),
            compression: compression.to_string(),
            retention_until,
            verification_status: VerificationStatus::Pending,
        };
        self.write_record(&record)?;

        info!(%backup_id, original_size, compressed_size, encrypted_size, "backup sealed");
        Ok(BackupOutcome {
            backup_id,
            container_path,
            record,
        })
    }

    /// Decrypts a backup and returns the restored (decompressed) payload.
    ///
    /// The key is resolved from the backup namespace only: the container's
    /// subtype key first, its deprecated predecessors next, the archive key
    /// last. Tenant keys are never consulted.
    ///
    /// # Errors
    /// * `BackupError::ContainerMissing` / `Malformed` /
    ///   `UnsupportedContainer` for unreadable containers.
    /// * `BackupError::Crypto(CryptoError::AuthTagMismatch)` when no backup
    ///   key verifies the tag.
    /// * `BackupError::IntegrityFailure` when the payload digest mismatches.
    pub fn decrypt_backup(&self, backup_id: &str) -> Result<Vec<u8>, BackupError> {
        let container = self.load_container(backup_id)?;
        let algorithm = Algorithm::from_tag(&container.algorithm).ok_or_else(|| {
            BackupError::Malformed(format!("unknown algorithm {}", container.algorithm))
        })?;

        let subtype = BackupKind::subtype_for_tag(&container.backup_type);
        let candidates = self.keys.backup_decryption_keys(subtype)?;

        for (backup_key, _key_id) in &candidates {
            let dek = derive_key(
                &container.salt,
                backup_key,
                container.backup_id.as_bytes(),
                self.config.kdf_iterations,
            )?;
            match aead_decrypt(
                algorithm,
                &dek,
                &container.nonce,
                &container.aad,
                &container.ciphertext,
            ) {
                Ok(payload) => {
                    if !constant_time_eq(&sha256(&payload), &container.payload_hash) {
                        warn!(backup_id, "payload digest mismatch after decrypt");
                        return Err(BackupError::IntegrityFailure);
                    }
                    let restored = if container.compression == "gzip" {
                        gunzip_bytes(&payload)?
                    } else {
                        payload
                    };
                    info!(backup_id, "backup decrypted");
                    return Ok(restored);
                }
                Err(CryptoError::AuthTagMismatch) => continue,
                Err(other) => return Err(other.into()),
            }
        }

        Err(BackupError::Crypto(CryptoError::AuthTagMismatch))
    }

    /// Runs the read-back restoration test on a backup: decrypt, verify the
    /// payload digest, decompress, and (for database backups) confirm the
    /// bytes parse as SQL. The outcome is persisted on the metadata record.
    ///
    /// # Errors
    /// Fails only when the metadata record cannot be rewritten; test
    /// findings themselves are reported in the returned record.
    pub fn test_restoration(&self, backup_id: &str) -> Result<RestorationReport, BackupError> {
        let started = Instant::now();
        let mut report = RestorationReport {
            backup_id: backup_id.to_string(),
            metadata_valid: false,
            decryption_successful: false,
            integrity_verified: false,
            data_readable: false,
            sql_valid: None,
            duration_ms: 0,
            errors: Vec::new(),
            success: false,
        };

        let record = match self.backup_record(backup_id)? {
            Some(record) => {
                report.metadata_valid = true;
                Some(record)
            }
            None => {
                report.errors.push("metadata record not found".to_string());
                None
            }
        };

        match self.decrypt_backup(backup_id) {
            Ok(restored) => {
                report.decryption_successful = true;
                report.integrity_verified = true;
                if restored.is_empty() {
                    report.errors.push("restored payload is empty".to_string());
                } else {
                    report.data_readable = true;
                }

                if record.as_ref().map(|r| r.backup_type.as_str()) == Some("DATABASE") {
                    let text = String::from_utf8_lossy(&restored);
                    let looks_like_sql =
                        text.contains("CREATE TABLE") || text.contains("INSERT INTO");
                    report.sql_valid = Some(looks_like_sql);
                    if !looks_like_sql {
                        report
                            .errors
                            .push("restored data does not look like SQL".to_string());
                    }
                }
            }
            Err(e) => report.errors.push(format!("decryption failed: {e}")),
        }

        report.success = report.metadata_valid
            && report.decryption_successful
            && report.integrity_verified
            && report.data_readable
            && report.sql_valid.unwrap_or(true);
        report.duration_ms = started.elapsed().as_millis();

        if let Some(mut record) = record {
            record.verification_status = if report.success {
                VerificationStatus::Verified
            } else {
                VerificationStatus::Failed
            };
            self.write_record(&record)?;
        }

        info!(backup_id, success = report.success, "restoration test completed");
        Ok(report)
    }

    /// Loads and version-checks a stored backup container.
    ///
    /// # Errors
    /// As documented on [`BackupEncryptor::decrypt_backup`].
    pub fn load_container(&self, backup_id: &str) -> Result<BackupContainer, BackupError> {
        let path = self.container_path(backup_id);
        if !path.exists() {
            return Err(BackupError::ContainerMissing(backup_id.to_string()));
        }
        let raw = fs::read(&path)?;
        let value: serde_json::Value =
            serde_json::from_slice(&raw).map_err(|e| BackupError::Malformed(e.to_string()))?;
        let version = value
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| BackupError::Malformed("missing version field".to_string()))?;
        if version != u64::from(BACKUP_CONTAINER_VERSION) {
            return Err(BackupError::UnsupportedContainer(version as u32));
        }
        serde_json::from_value(value).map_err(|e| BackupError::Malformed(e.to_string()))
    }

    /// Loads a backup's metadata record, if present.
    ///
    /// # Errors
    /// Storage and decoding failures propagate.
    pub fn backup_record(&self, backup_id: &str) -> Result<Option<BackupRecord>, BackupError> {
        let path = self.record_path(backup_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path)?;
        let record =
            serde_json::from_slice(&raw).map_err(|e| BackupError::Malformed(e.to_string()))?;
        Ok(Some(record))
    }

    /// Lists every backup in the metadata directory, newest first.
    ///
    /// # Errors
    /// Fails when the metadata directory cannot be read.
    pub fn list_backups(&self) -> Result<Vec<BackupRecord>, BackupError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.config.metadata_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path).map_err(BackupError::from).and_then(|raw| {
                serde_json::from_slice::<BackupRecord>(&raw)
                    .map_err(|e| BackupError::Malformed(e.to_string()))
            }) {
                Ok(record) => out.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable record"),
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    fn write_record(&self, record: &BackupRecord) -> Result<(), BackupError> {
        write_private_atomic(
            &self.record_path(&record.backup_id),
            &serde_json::to_vec_pretty(record).map_err(|e| BackupError::Malformed(e.to_string()))?,
        )?;
        Ok(())
    }
}

fn new_backup_id(kind: BackupKind) -> String {
    let stamp = OffsetDateTime::now_utc()
        .format(format_description!("[year][month][day]_[hour][minute][second]"))
        .unwrap_or_else(|_| "00000000_000000".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_backup_{stamp}_{}", kind.key_subtype(), &suffix[..8])
}

fn gzip_file(input: &Path, output: &Path) -> Result<(), BackupError> {
    let mut reader = BufReader::new(File::open(input)?);
    let mut encoder = flate2::write::GzEncoder::new(File::create(output)?, flate2::Compression::default());
    std::io::copy(&mut reader, &mut encoder)?;
    encoder.finish()?;
    Ok(())
}

fn gunzip_bytes(data: &[u8]) -> Result<Vec<u8>, BackupError> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn write_private_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    fs::write(&tmp, data)?;
    set_file_private(&tmp)?;
    fs::rename(&tmp, path)
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
