//! Request and response types exchanged with the operator admin API.
//!
//! None of these types ever carries plaintext key material: TMK responses
//! describe key metadata only, and backups carry the KMS-wrapped form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Tenant master keys
// ---------------------------------------------------------------------------

/// Request body for `POST /tenants/:tenant/tmk`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTmkRequest {
    /// Operator creating the key; recorded on the TMK row and in the audit log.
    pub created_by: String,
}

/// Request body for `POST /tenants/:tenant/tmk/rotate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateTmkRequest {
    /// Operator performing the rotation.
    pub rotated_by: String,
}

/// Request body for `POST /tenants/:tenant/tmk/export`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportTmkRequest {
    /// Operator requesting the backup export.
    pub requested_by: String,
}

/// Public view of one TMK version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TmkResponse {
    pub tenant_id: String,
    pub key_version: u32,
    pub kms_key_id: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
    pub created_by: String,
}

/// Response body for `POST /tenants/:tenant/tmk/rotate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateTmkResponse {
    /// The newly active TMK version.
    pub tmk: TmkResponse,
    /// The re-wrap job scheduled for the rotation.
    pub job: JobResponse,
}

/// Response body for `GET /tenants/:tenant/tmk/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TmkStatusResponse {
    pub tenant_id: String,
    pub key_version: u32,
    pub created_at: DateTime<Utc>,
    pub age_days: i64,
    pub rotation_recommended: bool,
}

/// Response body for `POST /tenants/:tenant/tmk/export`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportTmkResponse {
    /// Opaque encoded backup containing the still-wrapped key material.
    pub backup: String,
}

// ---------------------------------------------------------------------------
// Re-wrap jobs
// ---------------------------------------------------------------------------

/// One itemised per-artifact re-wrap failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobErrorResponse {
    pub artifact_id: String,
    pub error: String,
    pub retryable: bool,
}

/// Progress snapshot of a re-wrap job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    pub id: Uuid,
    pub tenant_id: String,
    pub source_version: u32,
    pub target_version: u32,
    /// One of `running`, `completed`, `failed`, `cancelled`.
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub cursor: Option<String>,
    pub job_error: Option<String>,
    pub errors: Vec<JobErrorResponse>,
}

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

/// Standard error response body returned on any non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short machine-readable error code (e.g. `"not_found"`).
    pub code: String,
    /// Human-readable description safe to expose to callers.
    pub message: String,
}

impl ErrorResponse {
    /// Construct an [`ErrorResponse`] from a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&crate::ServiceError> for ErrorResponse {
    fn from(err: &crate::ServiceError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Response body for `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall service status: `"ok"` or `"degraded"`.
    pub status: String,
    /// Whether the relational key store answered a probe query.
    pub store_ready: bool,
    /// Number of plaintext keys currently held in the key cache.
    pub cached_keys: usize,
    /// Number of re-wrap jobs currently running.
    pub running_jobs: usize,
}
