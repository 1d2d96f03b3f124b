use crate::KeyType;

/// Rotation policy applied per key type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub key_type: KeyType,
    /// Days between scheduled rotations.
    pub rotation_interval_days: i64,
    /// Hard ceiling on key age before rotation is considered overdue.
    pub max_key_age_days: i64,
    /// Whether retrieval may rotate the key automatically once due.
    pub auto_rotation_enabled: bool,
    /// Days before the due date at which the key appears in rotation
    /// warnings.
    pub rotation_warning_days: i64,
    /// Usage ceiling; `None` means unlimited.
    pub max_usage_count: Option<u64>,
    /// Whether rotation needs an operator decision (`force = true`).
    pub require_manual_approval: bool,
}

/// Returns the rotation policy for a key type, or `None` for types that are
/// not lifecycle-managed (derived document keys are never persisted, so
/// `Document` policy applies to their parent material bookkeeping only).
#[must_use]
pub fn rotation_policies(key_type: KeyType) -> Option<RotationPolicy> {
    match key_type {
        KeyType::Master => Some(RotationPolicy {
            key_type,
            rotation_interval_days: 365,
            max_key_age_days: 400,
            auto_rotation_enabled: false,
            rotation_warning_days: 30,
            max_usage_count: None,
            require_manual_approval: true,
        }),
        KeyType::ClientMatter => Some(RotationPolicy {
            key_type,
            rotation_interval_days: 90,
            max_key_age_days: 120,
            auto_rotation_enabled: true,
            rotation_warning_days: 14,
            max_usage_count: Some(10_000),
            require_manual_approval: false,
        }),
        KeyType::Document => Some(RotationPolicy {
            key_type,
            rotation_interval_days: 30,
            max_key_age_days: 45,
            auto_rotation_enabled: true,
            rotation_warning_days: 7,
            max_usage_count: Some(1_000),
            require_manual_approval: false,
        }),
        KeyType::Backup => Some(RotationPolicy {
            key_type,
            rotation_interval_days: 90,
            max_key_age_days: 120,
            auto_rotation_enabled: true,
            rotation_warning_days: 14,
            max_usage_count: None,
            require_manual_approval: false,
        }),
        KeyType::Archive | KeyType::System => None,
    }
}
