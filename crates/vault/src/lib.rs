pub mod backend;
pub mod policy;
pub mod store;

// Re-export commonly used types for easier access
pub use backend::{KeyVault, LocalKeyVault, VaultError};
pub use policy::{rotation_policies, RotationPolicy};
pub use store::{KeyCreation, KeyStore, KeyStoreConfig, KmsError, RotationDue};

use chancery_crypto::Algorithm;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// The role a managed key plays in the platform.
///
/// Backup-typed keys live in a namespace disjoint from tenant keys: a
/// `Backup` key never encrypts a document container and a `ClientMatter`
/// key never encrypts an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    Master,
    ClientMatter,
    Document,
    Backup,
    Archive,
    System,
}

impl KeyType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            KeyType::Master => "master",
            KeyType::ClientMatter => "client_matter",
            KeyType::Document => "document",
            KeyType::Backup => "backup",
            KeyType::Archive => "archive",
            KeyType::System => "system",
        }
    }

    #[must_use]
    pub const fn all() -> &'static [KeyType] {
        &[
            KeyType::Master,
            KeyType::ClientMatter,
            KeyType::Document,
            KeyType::Backup,
            KeyType::Archive,
            KeyType::System,
        ]
    }
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a managed key.
///
/// `Active` is the only state that may encrypt. `Deprecated` keys still
/// decrypt (old containers remain readable after rotation); `Revoked` and
/// `Compromised` keys fail both directions and are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Rotating,
    Deprecated,
    Revoked,
    Compromised,
}

impl KeyStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Rotating => "rotating",
            KeyStatus::Deprecated => "deprecated",
            KeyStatus::Revoked => "revoked",
            KeyStatus::Compromised => "compromised",
        }
    }

    /// Whether a key in this state may decrypt existing ciphertexts.
    #[must_use]
    pub const fn can_decrypt(self) -> bool {
        matches!(self, KeyStatus::Active | KeyStatus::Rotating | KeyStatus::Deprecated)
    }

    /// Whether a key in this state may encrypt new data.
    #[must_use]
    pub const fn can_encrypt(self) -> bool {
        matches!(self, KeyStatus::Active)
    }

    /// States a key never returns to active duty from. A deprecated key
    /// may still be revoked; none of these ever encrypt again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            KeyStatus::Deprecated | KeyStatus::Revoked | KeyStatus::Compromised
        )
    }
}

impl std::fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata persisted alongside every key in the vault.
///
/// The key bytes themselves are stored separately and never appear here;
/// this record is what `list`/`get` style queries and audit trails see.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key_id: String,
    pub key_type: KeyType,
    pub status: KeyStatus,
    pub algorithm: Algorithm,
    /// Tenant scope; both parts are required for `ClientMatter` keys and
    /// absent for `Master` keys.
    pub client_id: Option<String>,
    pub matter_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_used_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub rotation_due_at: OffsetDateTime,
    pub access_count: u64,
    /// Predecessor in the rotation chain, if this key replaced another.
    pub derived_from: Option<String>,
    pub compliance_level: String,
    /// Operator-supplied reason recorded on revocation or compromise.
    pub status_reason: Option<String>,
}

impl KeyRecord {
    /// Tenant pair accessor; `None` unless both halves are present.
    #[must_use]
    pub fn tenant(&self) -> Option<(&str, &str)> {
        match (self.client_id.as_deref(), self.matter_id.as_deref()) {
            (Some(c), Some(m)) => Some((c, m)),
            _ => None,
        }
    }

    /// Age of the key in whole days at `now`.
    #[must_use]
    pub fn age_days(&self, now: OffsetDateTime) -> i64 {
        (now - self.created_at).whole_days()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use time::Duration;

    fn record(key_type: KeyType, status: KeyStatus) -> KeyRecord {
        let now = OffsetDateTime::now_utc();
        KeyRecord {
            key_id: "k1".into(),
            key_type,
            status,
            algorithm: Algorithm::Aes256Gcm,
            client_id: Some("c1".into()),
            matter_id: Some("m1".into()),
            created_at: now - Duration::days(10),
            last_used_at: now,
            rotation_due_at: now + Duration::days(80),
            access_count: 0,
            derived_from: None,
            compliance_level: "attorney_client".into(),
            status_reason: None,
        }
    }

    #[test]
    fn test_status_capabilities() {
        assert!(KeyStatus::Active.can_encrypt());
        assert!(KeyStatus::Active.can_decrypt());
        assert!(!KeyStatus::Deprecated.can_encrypt());
        assert!(KeyStatus::Deprecated.can_decrypt());
        for terminal in [KeyStatus::Revoked, KeyStatus::Compromised] {
            assert!(!terminal.can_encrypt());
            assert!(!terminal.can_decrypt());
            assert!(terminal.is_terminal());
        }
    }

    #[test]
    fn test_tenant_requires_both_halves() {
        let mut r = record(KeyType::ClientMatter, KeyStatus::Active);
        assert_eq!(r.tenant(), Some(("c1", "m1")));
        r.matter_id = None;
        assert_eq!(r.tenant(), None);
    }

    #[test]
    fn test_record_serde_roundtrip() {
        let r = record(KeyType::ClientMatter, KeyStatus::Active);
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains("\"client_matter\""));
        assert!(json.contains("\"active\""));
        let back: KeyRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.key_id, r.key_id);
        assert_eq!(back.key_type, r.key_type);
        assert_eq!(back.created_at, r.created_at);
    }

    #[test]
    fn test_age_days() {
        let r = record(KeyType::ClientMatter, KeyStatus::Active);
        assert_eq!(r.age_days(OffsetDateTime::now_utc()), 10);
    }
}
