//! Core error type for the keyring.
//!
//! Low-level KMS, storage and I/O errors are wrapped with the operation they
//! interrupted and never swallowed. [`KeyError::is_retryable`] is the single
//! place that decides whether a failure may succeed on a later attempt.

use std::path::PathBuf;

use common::ServiceError;
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::CipherError;
use crate::kms::KmsError;

/// Convenience alias used throughout the crate.
pub type KeyResult<T> = Result<T, KeyError>;

#[derive(Debug, Error)]
pub enum KeyError {
    /// The tenant has no active TMK (never created).
    #[error("no active tenant master key for tenant {0}")]
    NoActiveTmk(String),

    /// A specific historical TMK version does not exist.
    #[error("tenant master key v{version} not found for tenant {tenant}")]
    TmkVersionNotFound { tenant: String, version: u32 },

    /// Creation was requested for a tenant that already has TMK rows.
    #[error("tenant {0} already has a tenant master key")]
    TmkAlreadyExists(String),

    #[error("re-wrap job {0} not found")]
    JobNotFound(Uuid),

    /// A tenant may have at most one running re-wrap job.
    #[error("re-wrap job {job_id} is already running for tenant {tenant}")]
    RewrapInProgress { tenant: String, job_id: Uuid },

    #[error("key metadata not found for artifact {artifact} of tenant {tenant}")]
    MetadataNotFound { tenant: String, artifact: String },

    /// A tenant, repository or artifact identifier cannot be used as a path component.
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),

    /// AEAD failure, bad key length or malformed wrapped key. Never retried.
    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    Kms(#[from] KmsError),

    #[error("storage error during {op}: {source}")]
    Storage {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("metadata I/O error at {}: {source}", path.display())]
    MetadataIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A persisted record could not be decoded.
    #[error("malformed record: {0}")]
    Malformed(String),
}

impl KeyError {
    pub(crate) fn storage(op: &'static str) -> impl FnOnce(sqlx::Error) -> KeyError {
        move |source| KeyError::Storage { op, source }
    }

    /// Whether the same operation could succeed if attempted again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            KeyError::Kms(e) => e.is_retryable(),
            KeyError::Storage { source, .. } => is_transient_sqlx(source),
            KeyError::MetadataIo { .. } => true,
            _ => false,
        }
    }

    /// Whether this is an authenticated-decryption failure.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, KeyError::Cipher(CipherError::AuthenticationFailed))
    }
}

fn is_transient_sqlx(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            let msg = db_err.message().to_lowercase();
            msg.contains("busy") || msg.contains("locked") || msg.contains("timeout")
        }
        _ => false,
    }
}

impl From<KeyError> for ServiceError {
    fn from(err: KeyError) -> Self {
        let message = err.to_string();
        match err {
            KeyError::NoActiveTmk(_)
            | KeyError::TmkVersionNotFound { .. }
            | KeyError::JobNotFound(_)
            | KeyError::MetadataNotFound { .. } => ServiceError::NotFound(message),
            KeyError::TmkAlreadyExists(_) | KeyError::RewrapInProgress { .. } => {
                ServiceError::Conflict(message)
            }
            KeyError::InvalidIdentifier(_) => ServiceError::BadRequest(message),
            KeyError::Cipher(_) => ServiceError::IntegrityFailure(message),
            ref e if e.is_retryable() => ServiceError::Unavailable(message),
            _ => ServiceError::Internal(message),
        }
    }
}
