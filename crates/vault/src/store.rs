use crate::backend::{KeyVault, VaultError};
use crate::policy::rotation_policies;
use crate::{KeyRecord, KeyStatus, KeyType};
use chancery_crypto::{Algorithm, CryptoError, KeyMaterial};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{info, warn};
use zeroize::Zeroizing;

/// Errors raised by the key store.
#[derive(Debug, thiserror::Error)]
pub enum KmsError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("no active key for client {client_id} matter {matter_id}")]
    NoActiveKey { client_id: String, matter_id: String },
    #[error("key {key_id} is {status} and cannot be used")]
    KeyUnusable { key_id: String, status: KeyStatus },
    #[error("rotation not due for key {key_id}")]
    RotationNotDue { key_id: String },
    #[error("manual approval required to rotate key {key_id}")]
    ApprovalRequired { key_id: String },
    #[error("no rotation policy for key type {0}")]
    NoRotationPolicy(KeyType),
    #[error("expected a {expected} key, found {actual}")]
    WrongKeyType { expected: KeyType, actual: KeyType },
    #[error(transparent)]
    Vault(VaultError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("key store lock poisoned")]
    Poisoned,
}

impl From<VaultError> for KmsError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::NotFound(id) => KmsError::NotFound(id),
            other => KmsError::Vault(other),
        }
    }
}

/// Key store configuration.
#[derive(Debug, Clone)]
pub struct KeyStoreConfig {
    /// Seconds a retrieved tenant key stays usable from the in-memory
    /// cache before the vault is consulted again.
    pub cache_ttl_seconds: u64,
    /// Master switch for retrieval-time auto-rotation.
    pub auto_rotation_enabled: bool,
    /// Identifier of the initial master key.
    pub master_key_id: String,
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: 300,
            auto_rotation_enabled: true,
            master_key_id: "master_key_v1".to_string(),
        }
    }
}

/// Outcome of `create_client_matter_key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCreation {
    Created,
    AlreadyExists,
}

/// One entry of the rotation worklist.
#[derive(Debug, Clone)]
pub struct RotationDue {
    pub key_id: String,
    pub key_type: KeyType,
    pub age_days: i64,
    pub days_until_rotation: i64,
    pub overdue: bool,
    pub client_id: Option<String>,
    pub matter_id: Option<String>,
    pub compliance_level: String,
}

struct CachedKey {
    key_id: String,
    bytes: Zeroizing<Vec<u8>>,
    fetched_at: Instant,
}

/// Lifecycle-managed key store over a pluggable vault backend.
///
/// All mutation (create, retrieve, rotate, revoke) runs under one lock so
/// that the "at most one active key per (type, tenant)" invariant holds and
/// a rotation is linearizable with subsequent retrievals. Key derivation is
/// intentionally not performed here: callers take the tenant key bytes and
/// run the KDF outside the critical section.
pub struct KeyStore {
    vault: Arc<dyn KeyVault>,
    config: KeyStoreConfig,
    cache: Mutex<HashMap<String, CachedKey>>,
}

impl KeyStore {
    #[must_use]
    pub fn new(vault: Arc<dyn KeyVault>, config: KeyStoreConfig) -> Self {
        Self {
            vault,
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, CachedKey>>, KmsError> {
        self.cache.lock().map_err(|_| KmsError::Poisoned)
    }

    /// Ensures the master key exists, creating a ChaCha20-Poly1305 key on
    /// first use. Idempotent.
    ///
    /// # Errors
    /// Fails when the vault cannot be read or written, or the CSPRNG is
    /// unavailable.
    pub fn ensure_master(&self) -> Result<String, KmsError> {
        let _guard = self.lock()?;
        if let Some((key_id, _)) = self.find_active(KeyType::Master, None)? {
            return Ok(key_id);
        }

        let key = KeyMaterial::generate()?;
        let now = OffsetDateTime::now_utc();
        let record = KeyRecord {
            key_id: self.config.master_key_id.clone(),
            key_type: KeyType::Master,
            status: KeyStatus::Active,
            algorithm: Algorithm::ChaCha20Poly1305,
            client_id: None,
            matter_id: None,
            created_at: now,
            last_used_at: now,
            rotation_due_at: now + time::Duration::days(365),
            access_count: 0,
            derived_from: None,
            compliance_level: "CRITICAL".to_string(),
            status_reason: None,
        };
        self.vault
            .put(&self.config.master_key_id, key.as_bytes(), &record)?;
        info!(key_id = %self.config.master_key_id, "master key generated");
        Ok(self.config.master_key_id.clone())
    }

    /// Creates an AES-256-GCM key for a client matter, or reports the
    /// existing active key.
    ///
    /// At most one active key exists per tenant: when an active match is
    /// found its id is returned with `KeyCreation::AlreadyExists` and no new
    /// key is minted.
    ///
    /// # Errors
    /// Fails on vault or CSPRNG errors.
    pub fn create_client_matter_key(
        &self,
        client_id: &str,
        matter_id: &str,
        compliance_level: &str,
    ) -> Result<(String, KeyCreation), KmsError> {
        let _guard = self.lock()?;
        if let Some((key_id, _)) =
            self.find_active(KeyType::ClientMatter, Some((client_id, matter_id)))?
        {
            warn!(client_id, matter_id, %key_id, "active tenant key already exists");
            return Ok((key_id, KeyCreation::AlreadyExists));
        }

        let key = KeyMaterial::generate()?;
        let key_id = tenant_key_id(client_id, matter_id);
        let now = OffsetDateTime::now_utc();
        let interval = rotation_policies(KeyType::ClientMatter)
            .map_or(90, |p| p.rotation_interval_days);
        let record = KeyRecord {
            key_id: key_id.clone(),
            key_type: KeyType::ClientMatter,
            status: KeyStatus::Active,
            algorithm: Algorithm::Aes256Gcm,
            client_id: Some(client_id.to_string()),
            matter_id: Some(matter_id.to_string()),
            created_at: now,
            last_used_at: now,
            rotation_due_at: now + time::Duration::days(interval),
            access_count: 0,
            derived_from: None,
            compliance_level: compliance_level.to_string(),
            status_reason: None,
        };
        self.vault.put(&key_id, key.as_bytes(), &record)?;
        info!(client_id, matter_id, %key_id, "client matter key created");
        Ok((key_id, KeyCreation::Created))
    }

    /// Retrieves the active tenant key for encryption.
    ///
    /// The key is served from the in-memory cache within its TTL; otherwise
    /// it is loaded from the vault, `last_used_at` and `access_count` are
    /// updated, and the key becomes eligible for retrieval-time
    /// auto-rotation when it is past due and its policy allows it. When
    /// auto-rotation fires, the bytes returned belong to the new active key.
    ///
    /// # Errors
    /// * `KmsError::NoActiveKey` when the tenant has no active key.
    /// * Vault and CSPRNG failures propagate.
    pub fn get_client_matter_key(
        &self,
        client_id: &str,
        matter_id: &str,
    ) -> Result<(Zeroizing<Vec<u8>>, String), KmsError> {
        let mut cache = self.lock()?;
        let cache_key = cache_key(client_id, matter_id);
        let ttl = Duration::from_secs(self.config.cache_ttl_seconds);
        if let Some(entry) = cache.get(&cache_key) {
            if entry.fetched_at.elapsed() < ttl {
                return Ok((entry.bytes.clone(), entry.key_id.clone()));
            }
        }

        let found = self.find_active(KeyType::ClientMatter, Some((client_id, matter_id)))?;
        let Some((key_id, _)) = found else {
            let failure = self.tenant_lookup_failure(client_id, matter_id)?;
            return Err(failure);
        };
        let (mut bytes, mut record) = self.vault.get(&key_id)?;

        if self.auto_rotation_due(&record) {
            let new_id = self.rotate_locked(&mut cache, record.clone(), "scheduled")?;
            let fetched = self.vault.get(&new_id)?;
            bytes = fetched.0;
            record = fetched.1;
        }

        record.last_used_at = OffsetDateTime::now_utc();
        record.access_count += 1;
        self.vault.put_record(&record)?;

        cache.insert(
            cache_key,
            CachedKey {
                key_id: record.key_id.clone(),
                bytes: bytes.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok((bytes, record.key_id))
    }

    /// Returns every key of the tenant that is still allowed to decrypt,
    /// active key first, then deprecated keys newest-first.
    ///
    /// Containers written before a rotation decrypt against the deprecated
    /// predecessor; revoked and compromised keys are excluded.
    ///
    /// # Errors
    /// * `KmsError::KeyUnusable` when keys exist for the tenant but every
    ///   one of them is revoked or compromised.
    /// * `KmsError::NoActiveKey` when the tenant has no keys at all.
    pub fn tenant_decryption_keys(
        &self,
        client_id: &str,
        matter_id: &str,
    ) -> Result<Vec<(Zeroizing<Vec<u8>>, String)>, KmsError> {
        let _guard = self.lock()?;
        let mut usable: Vec<KeyRecord> = Vec::new();
        let mut denied: Option<KeyRecord> = None;

        for key_id in self.vault.list(Some(KeyType::ClientMatter))? {
            let record = self.vault.get_record(&key_id)?;
            if record.tenant() != Some((client_id, matter_id)) {
                continue;
            }
            if record.status.can_decrypt() {
                usable.push(record);
            } else {
                denied = Some(record);
            }
        }

        if usable.is_empty() {
            return match denied {
                Some(record) => Err(KmsError::KeyUnusable {
                    key_id: record.key_id,
                    status: record.status,
                }),
                None => Err(KmsError::NoActiveKey {
                    client_id: client_id.to_string(),
                    matter_id: matter_id.to_string(),
                }),
            };
        }

        usable.sort_by(|a, b| {
            let rank = |r: &KeyRecord| u8::from(r.status != KeyStatus::Active);
            rank(a).cmp(&rank(b)).then(b.created_at.cmp(&a.created_at))
        });

        let mut out = Vec::with_capacity(usable.len());
        for record in usable {
            let (bytes, _) = self.vault.get(&record.key_id)?;
            out.push((bytes, record.key_id));
        }
        Ok(out)
    }

    /// Provisions (idempotently) and retrieves the backup-namespace key for
    /// a subtype (`database`, `documents`, `system`, `archive`).
    ///
    /// Backup keys are ChaCha20-Poly1305 and are never reachable through the
    /// tenant retrieval paths.
    ///
    /// # Errors
    /// * `KmsError::WrongKeyType` if the resolved key is not backup-typed.
    /// * Vault and CSPRNG failures propagate.
    pub fn backup_key(&self, subtype: &str) -> Result<(Zeroizing<Vec<u8>>, String), KmsError> {
        let _guard = self.lock()?;
        if let Some(key_id) = self.find_active_backup(subtype)? {
            let (bytes, record) = self.vault.get(&key_id)?;
            if record.key_type != KeyType::Backup {
                return Err(KmsError::WrongKeyType {
                    expected: KeyType::Backup,
                    actual: record.key_type,
                });
            }
            return Ok((bytes, key_id));
        }

        let key = KeyMaterial::generate()?;
        let key_id = format!("backup_{subtype}");
        let now = OffsetDateTime::now_utc();
        let interval = rotation_policies(KeyType::Backup).map_or(90, |p| p.rotation_interval_days);
        let record = KeyRecord {
            key_id: key_id.clone(),
            key_type: KeyType::Backup,
            status: KeyStatus::Active,
            algorithm: Algorithm::ChaCha20Poly1305,
            client_id: None,
            matter_id: None,
            created_at: now,
            last_used_at: now,
            rotation_due_at: now + time::Duration::days(interval),
            access_count: 0,
            derived_from: None,
            compliance_level: "CRITICAL".to_string(),
            status_reason: None,
        };
        self.vault.put(&key_id, key.as_bytes(), &record)?;
        info!(%key_id, "backup key generated");
        Ok((Zeroizing::new(key.as_bytes().to_vec()), key_id))
    }

    /// Returns backup keys usable for decrypting a subtype's archives:
    /// the active subtype key, deprecated subtype keys newest-first, then
    /// the active `archive` key as the final fallback.
    ///
    /// # Errors
    /// * `KmsError::NotFound` when the subtype has no usable key at all.
    pub fn backup_decryption_keys(
        &self,
        subtype: &str,
    ) -> Result<Vec<(Zeroizing<Vec<u8>>, String)>, KmsError> {
        let _guard = self.lock()?;
        let prefix = format!("backup_{subtype}");
        let mut records: Vec<KeyRecord> = Vec::new();
        for key_id in self.vault.list(Some(KeyType::Backup))? {
            if !key_id.starts_with(&prefix) {
                continue;
            }
            let record = self.vault.get_record(&key_id)?;
            if record.status.can_decrypt() {
                records.push(record);
            }
        }
        records.sort_by(|a, b| {
            let rank = |r: &KeyRecord| u8::from(r.status != KeyStatus::Active);
            rank(a).cmp(&rank(b)).then(b.created_at.cmp(&a.created_at))
        });

        let mut out = Vec::with_capacity(records.len() + 1);
        for record in records {
            let (bytes, _) = self.vault.get(&record.key_id)?;
            out.push((bytes, record.key_id));
        }

        if subtype != "archive" {
            if let Some(archive_id) = self.find_active_backup("archive")? {
                let (bytes, _) = self.vault.get(&archive_id)?;
                out.push((bytes, archive_id));
            }
        }

        if out.is_empty() {
            return Err(KmsError::NotFound(prefix));
        }
        Ok(out)
    }

    /// Read-only metadata accessor.
    ///
    /// # Errors
    /// `KmsError::NotFound` when the key does not exist.
    pub fn key_record(&self, key_id: &str) -> Result<KeyRecord, KmsError> {
        Ok(self.vault.get_record(key_id)?)
    }

    /// Rotates a key: the old key transitions `Active → Rotating →
    /// Deprecated` and a successor of the same type, algorithm, and tenant
    /// becomes the new active key with `derived_from` pointing at its
    /// predecessor.
    ///
    /// # Errors
    /// * `KmsError::RotationNotDue` when `force` is false and the due date
    ///   has not passed.
    /// * `KmsError::ApprovalRequired` when `force` is false and the policy
    ///   demands manual approval.
    /// * `KmsError::KeyUnusable` when the key is not active.
    /// * `KmsError::NoRotationPolicy` for unmanaged key types.
    pub fn rotate(&self, key_id: &str, force: bool) -> Result<String, KmsError> {
        let mut cache = self.lock()?;
        let record = self.vault.get_record(key_id)?;
        let policy = rotation_policies(record.key_type)
            .ok_or(KmsError::NoRotationPolicy(record.key_type))?;

        if record.status != KeyStatus::Active {
            return Err(KmsError::KeyUnusable {
                key_id: key_id.to_string(),
                status: record.status,
            });
        }

        if !force {
            if OffsetDateTime::now_utc() < record.rotation_due_at {
                return Err(KmsError::RotationNotDue {
                    key_id: key_id.to_string(),
                });
            }
            if policy.require_manual_approval {
                return Err(KmsError::ApprovalRequired {
                    key_id: key_id.to_string(),
                });
            }
        }

        let reason = if force { "forced" } else { "scheduled" };
        self.rotate_locked(&mut cache, record, reason)
    }

    /// Revokes a key. Reachable from any state; idempotent for keys already
    /// revoked. The tenant cache is invalidated wholesale.
    ///
    /// # Errors
    /// `KmsError::NotFound` when the key does not exist.
    pub fn revoke(&self, key_id: &str, reason: &str) -> Result<(), KmsError> {
        self.terminate(key_id, KeyStatus::Revoked, reason)
    }

    /// Marks a key compromised. Reachable from any state.
    ///
    /// # Errors
    /// `KmsError::NotFound` when the key does not exist.
    pub fn mark_compromised(&self, key_id: &str, reason: &str) -> Result<(), KmsError> {
        self.terminate(key_id, KeyStatus::Compromised, reason)
    }

    /// Returns keys inside their rotation warning window, most urgent first.
    ///
    /// # Errors
    /// Vault failures propagate.
    pub fn list_due_for_rotation(&self) -> Result<Vec<RotationDue>, KmsError> {
        let _guard = self.lock()?;
        let now = OffsetDateTime::now_utc();
        let mut due = Vec::new();

        for key_type in [
            KeyType::Master,
            KeyType::ClientMatter,
            KeyType::Document,
            KeyType::Backup,
        ] {
            let Some(policy) = rotation_policies(key_type) else {
                continue;
            };
            for key_id in self.vault.list(Some(key_type))? {
                let record = self.vault.get_record(&key_id)?;
                if record.status != KeyStatus::Active {
                    continue;
                }
                let days_until = (record.rotation_due_at - now).whole_days();
                if days_until <= policy.rotation_warning_days {
                    due.push(RotationDue {
                        key_id,
                        key_type,
                        age_days: record.age_days(now),
                        days_until_rotation: days_until,
                        overdue: days_until < 0,
                        client_id: record.client_id,
                        matter_id: record.matter_id,
                        compliance_level: record.compliance_level,
                    });
                }
            }
        }

        due.sort_by_key(|d| d.days_until_rotation);
        Ok(due)
    }

    /// Total number of managed keys.
    ///
    /// # Errors
    /// Vault failures propagate.
    pub fn key_count(&self) -> Result<usize, KmsError> {
        Ok(self.vault.list(None)?.len())
    }

    /// Drops every cached tenant key, zeroizing the cached bytes.
    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    fn terminate(&self, key_id: &str, status: KeyStatus, reason: &str) -> Result<(), KmsError> {
        let mut cache = self.lock()?;
        let mut record = self.vault.get_record(key_id)?;
        record.status = status;
        record.status_reason = Some(reason.to_string());
        self.vault.put_record(&record)?;
        cache.clear();
        warn!(%key_id, %status, reason, "key terminated");
        Ok(())
    }

    fn auto_rotation_due(&self, record: &KeyRecord) -> bool {
        if !self.config.auto_rotation_enabled || record.status != KeyStatus::Active {
            return false;
        }
        let Some(policy) = rotation_policies(record.key_type) else {
            return false;
        };
        if !policy.auto_rotation_enabled || policy.require_manual_approval {
            return false;
        }
        let past_due = OffsetDateTime::now_utc() > record.rotation_due_at;
        let over_used = policy
            .max_usage_count
            .is_some_and(|max| record.access_count >= max);
        past_due || over_used
    }

    // Performs the rotation while the cache lock is held by the caller.
    fn rotate_locked(
        &self,
        cache: &mut HashMap<String, CachedKey>,
        mut old: KeyRecord,
        reason: &str,
    ) -> Result<String, KmsError> {
        let policy = rotation_policies(old.key_type).ok_or(KmsError::NoRotationPolicy(old.key_type))?;

        old.status = KeyStatus::Rotating;
        self.vault.put_record(&old)?;

        let key = KeyMaterial::generate()?;
        let new_id = successor_key_id(&old);
        let now = OffsetDateTime::now_utc();
        let new_record = KeyRecord {
            key_id: new_id.clone(),
            key_type: old.key_type,
            status: KeyStatus::Active,
            algorithm: old.algorithm,
            client_id: old.client_id.clone(),
            matter_id: old.matter_id.clone(),
            created_at: now,
            last_used_at: now,
            rotation_due_at: now + time::Duration::days(policy.rotation_interval_days),
            access_count: 0,
            derived_from: Some(old.key_id.clone()),
            compliance_level: old.compliance_level.clone(),
            status_reason: None,
        };
        self.vault.put(&new_id, key.as_bytes(), &new_record)?;

        old.status = KeyStatus::Deprecated;
        self.vault.put_record(&old)?;

        cache.clear();
        info!(old_key_id = %old.key_id, new_key_id = %new_id, reason, "key rotated");
        Ok(new_id)
    }

    fn find_active(
        &self,
        key_type: KeyType,
        tenant: Option<(&str, &str)>,
    ) -> Result<Option<(String, KeyRecord)>, KmsError> {
        for key_id in self.vault.list(Some(key_type))? {
            let record = self.vault.get_record(&key_id)?;
            if record.status != KeyStatus::Active {
                continue;
            }
            match tenant {
                Some(pair) if record.tenant() != Some(pair) => continue,
                _ => return Ok(Some((key_id, record))),
            }
        }
        Ok(None)
    }

    // Distinguishes "tenant was never keyed" from "tenant key was revoked":
    // encryption under a revoked or compromised tenant surfaces the
    // termination rather than a generic miss.
    fn tenant_lookup_failure(
        &self,
        client_id: &str,
        matter_id: &str,
    ) -> Result<KmsError, KmsError> {
        for key_id in self.vault.list(Some(KeyType::ClientMatter))? {
            let record = self.vault.get_record(&key_id)?;
            if record.tenant() == Some((client_id, matter_id))
                && matches!(record.status, KeyStatus::Revoked | KeyStatus::Compromised)
            {
                return Ok(KmsError::KeyUnusable {
                    key_id,
                    status: record.status,
                });
            }
        }
        Ok(KmsError::NoActiveKey {
            client_id: client_id.to_string(),
            matter_id: matter_id.to_string(),
        })
    }

    fn find_active_backup(&self, subtype: &str) -> Result<Option<String>, KmsError> {
        let prefix = format!("backup_{subtype}");
        for key_id in self.vault.list(Some(KeyType::Backup))? {
            if !key_id.starts_with(&prefix) {
                continue;
            }
            let record = self.vault.get_record(&key_id)?;
            if record.status == KeyStatus::Active {
                return Ok(Some(key_id));
            }
        }
        Ok(None)
    }
}

fn cache_key(client_id: &str, matter_id: &str) -> String {
    format!("{client_id}\u{1f}{matter_id}")
}

fn date_stamp() -> String {
    OffsetDateTime::now_utc()
        .format(format_description!("[year][month][day]"))
        .unwrap_or_else(|_| "00000000".to_string())
}

fn short_suffix() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

fn tenant_key_id(client_id: &str, matter_id: &str) -> String {
    format!(
        "client_{client_id}_matter_{matter_id}_{}_{}",
        date_stamp(),
        short_suffix()
    )
}

fn successor_key_id(old: &KeyRecord) -> String {
    match (&old.client_id, &old.matter_id) {
        (Some(client), Some(matter)) => tenant_key_id(client, matter),
        _ => match old.key_type {
            KeyType::Master => format!("master_key_{}_{}", date_stamp(), short_suffix()),
            _ => {
                // Keep the namespace prefix (e.g. backup_database) so lookup
                // by subtype continues to resolve rotated keys.
                let base = old.key_id.split("_r_").next().unwrap_or(&old.key_id);
                format!("{base}_r_{}_{}", date_stamp(), short_suffix())
            }
        },
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::backend::LocalKeyVault;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> KeyStore {
        let vault = LocalKeyVault::open(dir.path().join("vault")).unwrap();
        KeyStore::new(Arc::new(vault), KeyStoreConfig::default())
    }

    fn backdate_rotation(store: &KeyStore, key_id: &str, days: i64) {
        let mut record = store.key_record(key_id).unwrap();
        record.rotation_due_at = OffsetDateTime::now_utc() - time::Duration::days(days);
        store.vault.put_record(&record).unwrap();
    }

    #[test]
    fn test_ensure_master_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let first = store.ensure_master().unwrap();
        let second = store.ensure_master().unwrap();
        assert_eq!(first, second);

        let record = store.key_record(&first).unwrap();
        assert_eq!(record.key_type, KeyType::Master);
        assert_eq!(record.algorithm, Algorithm::ChaCha20Poly1305);
        assert_eq!(record.tenant(), None);
    }

    #[test]
    fn test_create_client_matter_key_once_per_tenant() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let (id1, created) = store
            .create_client_matter_key("c1", "m1", "attorney_client")
            .unwrap();
        assert_eq!(created, KeyCreation::Created);

        let (id2, again) = store
            .create_client_matter_key("c1", "m1", "attorney_client")
            .unwrap();
        assert_eq!(again, KeyCreation::AlreadyExists);
        assert_eq!(id1, id2);

        // A different matter gets its own key.
        let (id3, created) = store
            .create_client_matter_key("c1", "m2", "attorney_client")
            .unwrap();
        assert_eq!(created, KeyCreation::Created);
        assert_ne!(id1, id3);

        let record = store.key_record(&id1).unwrap();
        assert_eq!(record.algorithm, Algorithm::Aes256Gcm);
        assert_eq!(record.tenant(), Some(("c1", "m1")));
    }

    #[test]
    fn test_get_updates_usage_and_caches() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let (key_id, _) = store.create_client_matter_key("c", "m", "confidential").unwrap();

        let (bytes1, id1) = store.get_client_matter_key("c", "m").unwrap();
        assert_eq!(id1, key_id);
        assert_eq!(bytes1.len(), 32);
        assert_eq!(store.key_record(&key_id).unwrap().access_count, 1);

        // Second retrieval is served from cache and leaves the counter
        // untouched.
        let (bytes2, id2) = store.get_client_matter_key("c", "m").unwrap();
        assert_eq!(id2, key_id);
        assert_eq!(bytes1.as_slice(), bytes2.as_slice());
        assert_eq!(store.key_record(&key_id).unwrap().access_count, 1);

        // After a cache clear the vault is consulted again.
        store.clear_cache();
        store.get_client_matter_key("c", "m").unwrap();
        assert_eq!(store.key_record(&key_id).unwrap().access_count, 2);
    }

    #[test]
    fn test_get_without_key_is_no_active_key() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(matches!(
            store.get_client_matter_key("nobody", "nothing"),
            Err(KmsError::NoActiveKey { .. })
        ));
    }

    #[test]
    fn test_forced_rotation_deprecates_and_links() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let (old_id, _) = store.create_client_matter_key("c", "m", "attorney_client").unwrap();

        let new_id = store.rotate(&old_id, true).unwrap();
        assert_ne!(new_id, old_id);

        let old = store.key_record(&old_id).unwrap();
        let new = store.key_record(&new_id).unwrap();
        assert_eq!(old.status, KeyStatus::Deprecated);
        assert_eq!(new.status, KeyStatus::Active);
        assert_eq!(new.derived_from.as_deref(), Some(old_id.as_str()));
        assert_eq!(new.tenant(), Some(("c", "m")));

        // Retrieval now observes the successor.
        let (_, current) = store.get_client_matter_key("c", "m").unwrap();
        assert_eq!(current, new_id);
    }

    #[test]
    fn test_rotation_not_due_without_force() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let (key_id, _) = store.create_client_matter_key("c", "m", "confidential").unwrap();

        assert!(matches!(
            store.rotate(&key_id, false),
            Err(KmsError::RotationNotDue { .. })
        ));
    }

    #[test]
    fn test_master_rotation_requires_approval() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let master = store.ensure_master().unwrap();
        backdate_rotation(&store, &master, 1);

        assert!(matches!(
            store.rotate(&master, false),
            Err(KmsError::ApprovalRequired { .. })
        ));

        // Forced rotation bypasses the approval gate.
        let new_master = store.rotate(&master, true).unwrap();
        assert_eq!(store.key_record(&master).unwrap().status, KeyStatus::Deprecated);
        assert_eq!(
            store.key_record(&new_master).unwrap().derived_from.as_deref(),
            Some(master.as_str())
        );
    }

    #[test]
    fn test_rotating_non_active_key_fails() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let (key_id, _) = store.create_client_matter_key("c", "m", "confidential").unwrap();
        store.rotate(&key_id, true).unwrap();

        assert!(matches!(
            store.rotate(&key_id, true),
            Err(KmsError::KeyUnusable { .. })
        ));
    }

    #[test]
    fn test_auto_rotation_on_retrieval() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let (old_id, _) = store.create_client_matter_key("c", "m", "confidential").unwrap();
        backdate_rotation(&store, &old_id, 1);

        let (_, current) = store.get_client_matter_key("c", "m").unwrap();
        assert_ne!(current, old_id);
        assert_eq!(store.key_record(&old_id).unwrap().status, KeyStatus::Deprecated);
        assert_eq!(
            store.key_record(&current).unwrap().derived_from.as_deref(),
            Some(old_id.as_str())
        );
    }

    #[test]
    fn test_revoke_blocks_retrieval_and_clears_cache() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let (key_id, _) = store.create_client_matter_key("c", "m", "confidential").unwrap();
        store.get_client_matter_key("c", "m").unwrap();

        store.revoke(&key_id, "counsel request").unwrap();

        let record = store.key_record(&key_id).unwrap();
        assert_eq!(record.status, KeyStatus::Revoked);
        assert_eq!(record.status_reason.as_deref(), Some("counsel request"));
        // A revoked tenant surfaces the revocation, not a generic miss.
        assert!(matches!(
            store.get_client_matter_key("c", "m"),
            Err(KmsError::KeyUnusable {
                status: KeyStatus::Revoked,
                ..
            })
        ));
        assert!(matches!(
            store.tenant_decryption_keys("c", "m"),
            Err(KmsError::KeyUnusable { .. })
        ));
    }

    #[test]
    fn test_decryption_keys_include_deprecated_predecessors() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let (old_id, _) = store.create_client_matter_key("c", "m", "confidential").unwrap();
        let new_id = store.rotate(&old_id, true).unwrap();

        let keys = store.tenant_decryption_keys("c", "m").unwrap();
        let ids: Vec<&str> = keys.iter().map(|(_, id)| id.as_str()).collect();
        assert_eq!(ids, vec![new_id.as_str(), old_id.as_str()]);
    }

    #[test]
    fn test_at_most_one_active_per_tenant_after_rotations() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let (mut current, _) = store.create_client_matter_key("c", "m", "confidential").unwrap();
        for _ in 0..3 {
            current = store.rotate(&current, true).unwrap();
        }

        let mut active = 0;
        for key_id in store.vault.list(Some(KeyType::ClientMatter)).unwrap() {
            if store.key_record(&key_id).unwrap().status == KeyStatus::Active {
                active += 1;
            }
        }
        assert_eq!(active, 1);
    }

    #[test]
    fn test_backup_keys_are_separate_namespace() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.create_client_matter_key("c", "m", "confidential").unwrap();

        let (bytes, backup_id) = store.backup_key("database").unwrap();
        assert_eq!(bytes.len(), 32);
        assert_eq!(backup_id, "backup_database");

        let record = store.key_record(&backup_id).unwrap();
        assert_eq!(record.key_type, KeyType::Backup);
        assert_eq!(record.algorithm, Algorithm::ChaCha20Poly1305);

        // Idempotent: same key on second request.
        let (bytes2, id2) = store.backup_key("database").unwrap();
        assert_eq!(backup_id, id2);
        assert_eq!(bytes.as_slice(), bytes2.as_slice());

        // The tenant path never sees backup keys.
        let keys = store.tenant_decryption_keys("c", "m").unwrap();
        assert!(keys.iter().all(|(_, id)| !id.starts_with("backup_")));
    }

    #[test]
    fn test_backup_decryption_falls_back_to_archive() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.backup_key("documents").unwrap();
        store.backup_key("archive").unwrap();

        let keys = store.backup_decryption_keys("documents").unwrap();
        let ids: Vec<&str> = keys.iter().map(|(_, id)| id.as_str()).collect();
        assert_eq!(ids, vec!["backup_documents", "backup_archive"]);
    }

    #[test]
    fn test_list_due_for_rotation_flags_overdue() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let (due_id, _) = store.create_client_matter_key("c", "m", "confidential").unwrap();
        let (fresh_id, _) = store.create_client_matter_key("c", "m2", "confidential").unwrap();
        backdate_rotation(&store, &due_id, 3);

        let due = store.list_due_for_rotation().unwrap();
        let entry = due.iter().find(|d| d.key_id == due_id).expect("due entry");
        assert!(entry.overdue);
        assert!(entry.days_until_rotation < 0);
        assert_eq!(entry.client_id.as_deref(), Some("c"));
        assert!(!due.iter().any(|d| d.key_id == fresh_id));
    }
}
