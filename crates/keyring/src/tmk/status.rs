use chrono::{DateTime, Utc};
use common::protocol::TmkStatusResponse;
use serde::Serialize;

use crate::store::TmkRecord;

/// Age report for a tenant's active TMK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TmkStatus {
    pub tenant_id: String,
    pub key_version: u32,
    /// When the active version was created, i.e. the last rotation.
    pub created_at: DateTime<Utc>,
    pub age_days: i64,
    pub rotation_recommended: bool,
}

impl TmkStatus {
    /// Rotation is recommended once the active version is older than `threshold`.
    pub fn evaluate(record: &TmkRecord, now: DateTime<Utc>, threshold: chrono::Duration) -> Self {
        let age = now.signed_duration_since(record.created_at);
        Self {
            tenant_id: record.tenant_id.clone(),
            key_version: record.key_version,
            created_at: record.created_at,
            age_days: age.num_days().max(0),
            rotation_recommended: age > threshold,
        }
    }
}

impl From<&TmkStatus> for TmkStatusResponse {
    fn from(status: &TmkStatus) -> Self {
        Self {
            tenant_id: status.tenant_id.clone(),
            key_version: status.key_version,
            created_at: status.created_at,
            age_days: status.age_days,
            rotation_recommended: status.rotation_recommended,
        }
    }
}
