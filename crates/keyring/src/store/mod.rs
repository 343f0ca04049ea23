//! Relational persistence for TMK rows, the audit log and re-wrap jobs.
//!
//! The traits are the seams the services depend on; [`SqliteStore`]
//! implements all three against one pool.

pub mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::protocol::TmkResponse;
use uuid::Uuid;

use crate::audit::KeyAuditEntry;
use crate::error::KeyResult;
use crate::rewrap::RewrapJob;

/// A TMK row. `encrypted_key` is the KMS ciphertext of the 32-byte TMK.
#[derive(Clone, PartialEq, Eq)]
pub struct TmkRecord {
    pub id: Uuid,
    pub tenant_id: String,
    pub encrypted_key: Vec<u8>,
    pub kms_key_id: String,
    pub key_version: u32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
    pub created_by: String,
}

impl TmkRecord {
    /// Audit and log label for this version, e.g. `tmk-acme-v2`.
    pub fn label(&self) -> String {
        format!("tmk-{}-v{}", self.tenant_id, self.key_version)
    }
}

impl std::fmt::Debug for TmkRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TmkRecord")
            .field("id", &self.id)
            .field("tenant_id", &self.tenant_id)
            .field("encrypted_key_len", &self.encrypted_key.len())
            .field("kms_key_id", &self.kms_key_id)
            .field("key_version", &self.key_version)
            .field("is_active", &self.is_active)
            .field("created_at", &self.created_at)
            .field("rotated_at", &self.rotated_at)
            .finish()
    }
}

impl From<&TmkRecord> for TmkResponse {
    fn from(record: &TmkRecord) -> Self {
        Self {
            tenant_id: record.tenant_id.clone(),
            key_version: record.key_version,
            kms_key_id: record.kms_key_id.clone(),
            is_active: record.is_active,
            created_at: record.created_at,
            rotated_at: record.rotated_at,
            created_by: record.created_by.clone(),
        }
    }
}

/// Input for a new TMK version; the store assigns id, version and timestamps.
#[derive(Debug, Clone)]
pub struct NewTmk {
    pub tenant_id: String,
    pub encrypted_key: Vec<u8>,
    pub kms_key_id: String,
    pub created_by: String,
}

/// Result of a committed rotation.
#[derive(Debug, Clone)]
pub struct Rotation {
    pub previous: TmkRecord,
    pub current: TmkRecord,
}

#[async_trait]
pub trait TmkStore: Send + Sync {
    /// Insert version 1 for a tenant with no TMK rows.
    ///
    /// Fails with `TmkAlreadyExists` if any row exists for the tenant.
    async fn insert_first(&self, tmk: NewTmk) -> KeyResult<TmkRecord>;

    /// Atomically deactivate the active row and insert `active + 1`.
    ///
    /// Fails with `NoActiveTmk` if the tenant has no active row.
    async fn rotate(&self, tmk: NewTmk) -> KeyResult<Rotation>;

    async fn active(&self, tenant_id: &str) -> KeyResult<Option<TmkRecord>>;

    async fn version(&self, tenant_id: &str, version: u32) -> KeyResult<Option<TmkRecord>>;

    /// Every version for the tenant, oldest first.
    async fn versions(&self, tenant_id: &str) -> KeyResult<Vec<TmkRecord>>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, entry: &KeyAuditEntry) -> KeyResult<()>;

    /// Most recent entries for a tenant, newest first.
    async fn recent(&self, tenant_id: &str, limit: u32) -> KeyResult<Vec<KeyAuditEntry>>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or replace the snapshot of `job`.
    async fn save_job(&self, job: &RewrapJob) -> KeyResult<()>;

    async fn load_job(&self, id: Uuid) -> KeyResult<Option<RewrapJob>>;

    /// Jobs whose persisted status is still `running`.
    async fn running_jobs(&self) -> KeyResult<Vec<RewrapJob>>;
}
