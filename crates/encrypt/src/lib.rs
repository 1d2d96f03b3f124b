use chancery_crypto::{
    aead_decrypt, aead_encrypt, constant_time_eq, derive_key, key_digest, random_nonce,
    random_salt, sha256, to_hex, Algorithm, CryptoError, DOCUMENT_KDF_ITERATIONS,
};
use chancery_vault::{KeyStore, KmsError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, warn};

/// Current on-disk container schema version.
pub const CONTAINER_VERSION: u32 = 1;

/// Errors raised by document encryption and decryption.
#[derive(Debug, thiserror::Error)]
pub enum EncryptError {
    /// No usable tenant key could be resolved.
    #[error("tenant key unavailable: {0}")]
    MissingKey(#[source] KmsError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("container storage error: {0}")]
    Storage(#[from] std::io::Error),
    #[error("encrypted container not found for document {0}")]
    ContainerMissing(String),
    #[error("malformed container: {0}")]
    Malformed(String),
    #[error("unsupported container version {0}")]
    UnsupportedContainer(u32),
    /// The AEAD tag verified but the recomputed plaintext digest did not
    /// match the stored one: the container's hash field was tampered with.
    #[error("plaintext integrity verification failed")]
    IntegrityFailure,
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<KmsError> for EncryptError {
    fn from(err: KmsError) -> Self {
        EncryptError::MissingKey(err)
    }
}

/// Self-describing encrypted document record written to storage.
///
/// Binary fields serialize as byte arrays; `version` gates parsing and must
/// stay the first consulted field when loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentContainer {
    pub version: u32,
    pub algorithm: String,
    pub document_id: String,
    pub compliance_level: String,
    pub salt: Vec<u8>,
    pub nonce: Vec<u8>,
    pub aad: Vec<u8>,
    pub ciphertext: Vec<u8>,
    /// SHA-256 over the plaintext, checked again after every decryption.
    pub plaintext_hash: Vec<u8>,
    pub created_at: String,
    /// First 128 bits of SHA-256 over the derived document key, hex.
    /// An identifier only, never an authenticator.
    pub key_id_digest: String,
}

/// Inventory record kept next to each container; this is what the
/// verification monitor sweeps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: String,
    pub container_path: PathBuf,
    pub algorithm: String,
    /// Id of the tenant key that was active at encryption time.
    pub key_id: String,
    pub client_id: String,
    pub matter_id: String,
    pub compliance_level: String,
    pub plaintext_len: u64,
    pub plaintext_sha256: String,
    pub encrypted_at: String,
    pub original_filename: Option<String>,
}

/// Result of a successful encryption.
#[derive(Debug, Clone)]
pub struct EncryptionOutcome {
    pub document_id: String,
    pub container_path: PathBuf,
    pub record: DocumentRecord,
}

/// Per-file outcome of a directory sweep.
#[derive(Debug)]
pub struct DirectoryEntry {
    pub source: PathBuf,
    pub document_id: String,
    pub outcome: Result<EncryptionOutcome, EncryptError>,
}

/// Document encryptor configuration.
#[derive(Debug, Clone)]
pub struct EncryptorConfig {
    /// Directory holding `<document_id>.encrypted` containers.
    pub storage_dir: PathBuf,
    /// Directory holding `<document_id>_metadata.json` inventory records.
    pub metadata_dir: PathBuf,
    /// PBKDF2 iteration count for document key derivation.
    pub kdf_iterations: u32,
    /// Extension whitelist for directory sweeps (lowercase, no dot).
    pub document_extensions: Vec<String>,
}

impl EncryptorConfig {
    /// Standard layout under a platform data root.
    #[must_use]
    pub fn under_root(root: &Path) -> Self {
        Self {
            storage_dir: root.join("encrypted_documents"),
            metadata_dir: root.join("encryption_metadata"),
            kdf_iterations: DOCUMENT_KDF_ITERATIONS,
            document_extensions: [
                "pdf", "docx", "doc", "txt", "rtf", "odt", "html", "xml", "json", "csv", "xlsx",
                "xls",
            ]
            .iter()
            .map(|s| (*s).to_string())
            .collect(),
        }
    }
}

/// Builds the associated data authenticated alongside a document.
///
/// Fields are joined with a 0x1f separator so the encoding is deterministic
/// and unambiguous; any mutation of document id, compliance level, creation
/// time, or original filename invalidates the AEAD tag.
#[must_use]
pub fn document_aad(
    document_id: &str,
    compliance_level: &str,
    created_at: &str,
    original_filename: Option<&str>,
) -> Vec<u8> {
    let mut aad = Vec::with_capacity(
        document_id.len() + compliance_level.len() + created_at.len() + 3,
    );
    aad.extend_from_slice(document_id.as_bytes());
    aad.push(0x1f);
    aad.extend_from_slice(compliance_level.as_bytes());
    aad.push(0x1f);
    aad.extend_from_slice(created_at.as_bytes());
    if let Some(name) = original_filename {
        aad.push(0x1f);
        aad.extend_from_slice(name.as_bytes());
    }
    aad
}

/// Encrypts documents under tenant-scoped derived keys and persists
/// integrity-tagged containers.
pub struct DocumentEncryptor {
    keys: Arc<KeyStore>,
    config: EncryptorConfig,
}

impl DocumentEncryptor {
    /// Creates the encryptor, preparing the storage and metadata
    /// directories with owner-only permissions.
    ///
    /// # Errors
    /// Fails when either directory cannot be created.
    pub fn new(keys: Arc<KeyStore>, config: EncryptorConfig) -> Result<Self, EncryptError> {
        fs::create_dir_all(&config.storage_dir)?;
        fs::create_dir_all(&config.metadata_dir)?;
        set_dir_private(&config.storage_dir)?;
        set_dir_private(&config.metadata_dir)?;
        Ok(Self { keys, config })
    }

    #[must_use]
    pub fn container_path(&self, document_id: &str) -> PathBuf {
        self.config.storage_dir.join(format!("{document_id}.encrypted"))
    }

    #[must_use]
    pub fn record_path(&self, document_id: &str) -> PathBuf {
        self.config
            .metadata_dir
            .join(format!("{document_id}_metadata.json"))
    }

    /// Encrypts a document for a tenant.
    ///
    /// A fresh data-encryption key is derived per document from the active
    /// tenant key (`PBKDF2(salt, tenant_key || document_id)`); derived keys
    /// are never persisted. The container write is atomic: a temp file is
    /// renamed into place, so readers never observe a partial container.
    ///
    /// # Arguments
    /// * `plaintext` - The document bytes.
    /// * `document_id` - Stable identifier; must not contain path
    ///   separators.
    /// * `client_id` / `matter_id` - Tenant scope.
    /// * `compliance_level` - Opaque compliance tag carried in the AAD.
    /// * `original_filename` - Bound into the AAD when present.
    ///
    /// # Errors
    /// * `EncryptError::InvalidInput` for empty or unsafe document ids.
    /// * `EncryptError::MissingKey` when the tenant has no active key.
    /// * Crypto and storage failures propagate with their kinds intact.
    pub fn encrypt_document(
        &self,
        plaintext: &[u8],
        document_id: &str,
        client_id: &str,
        matter_id: &str,
        compliance_level: &str,
        original_filename: Option<&str>,
    ) -> Result<EncryptionOutcome, EncryptError> {
        validate_document_id(document_id)?;

        let (tenant_key, key_id) = self.keys.get_client_matter_key(client_id, matter_id)?;

        let salt = random_salt()?;
        // KDF runs outside the key-store critical section.
        let dek = derive_key(
            &salt,
            &tenant_key,
            document_id.as_bytes(),
            self.config.kdf_iterations,
        )?;

        let plaintext_hash = sha256(plaintext);
        let nonce = random_nonce()?;
        let created_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|e| EncryptError::InvalidInput(e.to_string()))?;
        let aad = document_aad(document_id, compliance_level, &created_at, original_filename);

        let ciphertext = aead_encrypt(Algorithm::Aes256Gcm, &dek, &nonce, &aad, plaintext)?;

        let container = DocumentContainer {
            version: CONTAINER_VERSION,
            algorithm: Algorithm::Aes256Gcm.as_str().to_string(),
            document_id: document_id.to_string(),
            compliance_level: compliance_level.to_string(),
            salt: salt.to_vec(),
            nonce: nonce.to_vec(),
            aad,
            ciphertext,
            plaintext_hash: plaintext_hash.to_vec(),
            created_at: created_at.clone(),
            key_id_digest: key_digest(&dek),
        };

        let container_path = self.container_path(document_id);
        write_private_atomic(&container_path, &serde_json::to_vec(&container).map_err(io_invalid)?)?;

        let record = DocumentRecord {
            document_id: document_id.to_string(),
            container_path: container_path.clone(),
            algorithm: container.algorithm.clone(),
            key_id,
            client_id: client_id.to_string(),
            matter_id: matter_id.to_string(),
            compliance_level: compliance_level.to_string(),
            plaintext_len: plaintext.len() as u64,
            plaintext_sha256: to_hex(&plaintext_hash),
            encrypted_at: created_at,
            original_filename: original_filename.map(str::to_string),
        };
        if let Err(e) = write_private_atomic(
            &self.record_path(document_id),
            &serde_json::to_vec_pretty(&record).map_err(io_invalid)?,
        ) {
            // Keep success atomic: without its inventory record the
            // container must not become visible.
            let _ = fs::remove_file(&container_path);
            return Err(e.into());
        }

        info!(document_id, client_id, matter_id, "document encrypted");
        Ok(EncryptionOutcome {
            document_id: document_id.to_string(),
            container_path,
            record,
        })
    }

    /// Decrypts a document for a tenant.
    ///
    /// The DEK is re-derived from the stored salt against the tenant's
    /// current active key; containers written before a rotation fall back
    /// to the tenant's deprecated keys. After the AEAD tag verifies, the
    /// plaintext SHA-256 is recomputed and compared in constant time.
    ///
    /// # Errors
    /// * `EncryptError::ContainerMissing` / `Malformed` /
    ///   `UnsupportedContainer` for unreadable containers.
    /// * `EncryptError::Crypto(CryptoError::AuthTagMismatch)` when no tenant
    ///   key verifies the tag (tampering or wrong tenant).
    /// * `EncryptError::IntegrityFailure` when the tag verified but the
    ///   plaintext digest does not match.
    /// * `EncryptError::MissingKey` when the tenant has no usable key.
    pub fn decrypt_document(
        &self,
        document_id: &str,
        client_id: &str,
        matter_id: &str,
    ) -> Result<Vec<u8>, EncryptError> {
        validate_document_id(document_id)?;
        let container = self.load_container(document_id)?;
        let algorithm = Algorithm::from_tag(&container.algorithm)
            .ok_or_else(|| EncryptError::Malformed(format!("unknown algorithm {}", container.algorithm)))?;

        let candidates = self.keys.tenant_decryption_keys(client_id, matter_id)?;

        for (tenant_key, _key_id) in &candidates {
            let dek = derive_key(
                &container.salt,
                tenant_key,
                document_id.as_bytes(),
                self.config.kdf_iterations,
            )?;
            match aead_decrypt(
                algorithm,
                &dek,
                &container.nonce,
                &container.aad,
                &container.ciphertext,
            ) {
                Ok(plaintext) => {
                    if !constant_time_eq(&sha256(&plaintext), &container.plaintext_hash) {
                        warn!(document_id, "plaintext digest mismatch after decrypt");
                        return Err(EncryptError::IntegrityFailure);
                    }
                    info!(document_id, client_id, matter_id, "document decrypted");
                    return Ok(plaintext);
                }
                Err(CryptoError::AuthTagMismatch) => continue,
                Err(other) => return Err(other.into()),
            }
        }

        Err(EncryptError::Crypto(CryptoError::AuthTagMismatch))
    }

    /// Loads and version-checks a stored container.
    ///
    /// # Errors
    /// * `EncryptError::ContainerMissing` when no container exists.
    /// * `EncryptError::UnsupportedContainer` for unknown versions.
    /// * `EncryptError::Malformed` for undecodable JSON or missing fields.
    pub fn load_container(&self, document_id: &str) -> Result<DocumentContainer, EncryptError> {
        let path = self.container_path(document_id);
        if !path.exists() {
            return Err(EncryptError::ContainerMissing(document_id.to_string()));
        }
        let raw = fs::read(&path)?;
        let value: serde_json::Value =
            serde_json::from_slice(&raw).map_err(|e| EncryptError::Malformed(e.to_string()))?;

        // The version gates everything else about the schema.
        let version = value
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| EncryptError::Malformed("missing version field".to_string()))?;
        if version != u64::from(CONTAINER_VERSION) {
            return Err(EncryptError::UnsupportedContainer(version as u32));
        }

        serde_json::from_value(value).map_err(|e| EncryptError::Malformed(e.to_string()))
    }

    /// Loads the inventory record for a document, if one exists.
    ///
    /// # Errors
    /// Storage and decoding failures propagate; a missing record is `None`.
    pub fn document_record(&self, document_id: &str) -> Result<Option<DocumentRecord>, EncryptError> {
        let path = self.record_path(document_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path)?;
        let record =
            serde_json::from_slice(&raw).map_err(|e| EncryptError::Malformed(e.to_string()))?;
        Ok(Some(record))
    }

    /// Lists every document in the inventory.
    ///
    /// Undecodable records are skipped with a warning rather than failing
    /// the whole listing.
    ///
    /// # Errors
    /// Fails when the metadata directory cannot be read.
    pub fn list_documents(&self) -> Result<Vec<DocumentRecord>, EncryptError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.config.metadata_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path)
                .map_err(EncryptError::from)
                .and_then(|raw| {
                    serde_json::from_slice::<DocumentRecord>(&raw)
                        .map_err(|e| EncryptError::Malformed(e.to_string()))
                }) {
                Ok(record) => out.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable record"),
            }
        }
        out.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        Ok(out)
    }

    /// Encrypts every whitelisted file under `dir`, continuing past
    /// individual failures.
    ///
    /// Document ids are derived from the path relative to `dir` with
    /// separators and dots flattened to underscores, so the mapping is
    /// reproducible across runs.
    ///
    /// # Errors
    /// Fails only when the directory itself cannot be walked; per-file
    /// failures are reported in the returned entries.
    pub fn encrypt_directory(
        &self,
        dir: &Path,
        client_id: &str,
        matter_id: &str,
        compliance_level: &str,
    ) -> Result<Vec<DirectoryEntry>, EncryptError> {
        if !dir.is_dir() {
            return Err(EncryptError::InvalidInput(format!(
                "not a directory: {}",
                dir.display()
            )));
        }

        let mut files = Vec::new();
        collect_files(dir, &mut files)?;
        files.retain(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| {
                    let ext = ext.to_lowercase();
                    self.config.document_extensions.iter().any(|w| *w == ext)
                })
        });
        files.sort();

        let mut results = Vec::with_capacity(files.len());
        for path in files {
            let relative = path.strip_prefix(dir).unwrap_or(&path);
            let document_id = relative
                .to_string_lossy()
                .replace(std::path::MAIN_SEPARATOR, "_")
                .replace('.', "_");
            let original_filename = path.file_name().and_then(|n| n.to_str()).map(str::to_string);

            let outcome = fs::read(&path).map_err(EncryptError::from).and_then(|data| {
                self.encrypt_document(
                    &data,
                    &document_id,
                    client_id,
                    matter_id,
                    compliance_level,
                    original_filename.as_deref(),
                )
            });
            if let Err(e) = &outcome {
                warn!(path = %path.display(), error = %e, "file encryption failed");
            }
            results.push(DirectoryEntry {
                source: path,
                document_id,
                outcome,
            });
        }
        Ok(results)
    }
}

fn validate_document_id(document_id: &str) -> Result<(), EncryptError> {
    if document_id.is_empty() {
        return Err(EncryptError::InvalidInput("empty document id".to_string()));
    }
    if document_id.contains(['/', '\\']) || document_id.contains("..") {
        return Err(EncryptError::InvalidInput(format!(
            "document id must not contain path separators: {document_id}"
        )));
    }
    Ok(())
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

// Writes go to a temp sibling and rename into place so a crash mid-write
// never leaves a partial container visible.
fn write_private_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    fs::write(&tmp, data)?;
    set_file_private(&tmp)?;
    fs::rename(&tmp, path)
}

fn io_invalid(err: serde_json::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, err)
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
