//! Key Management Service boundary.
//!
//! The KMS wraps and unwraps opaque byte blobs under a named root key and can
//! mint random data keys. Root keys never leave the KMS. Two implementations:
//!
//! - [`AwsKms`]: AWS KMS through the AWS SDK.
//! - [`MemoryKms`]: in-process root keys with fault injection, for tests and
//!   local development.
//!
//! No caching, batching or retry lives behind this trait; callers decide.
//! Errors are classified so that a re-wrap job can tell a transient outage
//! (retryable) from a missing or forbidden key (not retryable).

pub mod aws;
pub mod memory;

pub use aws::AwsKms;
pub use memory::MemoryKms;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use zeroize::Zeroizing;

/// Errors surfaced by a [`KmsClient`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KmsError {
    /// The root key reference does not resolve to a key.
    #[error("KMS key not found: {0}")]
    KeyNotFound(String),

    /// The caller may not use the key, or the key is disabled.
    #[error("KMS access denied: {0}")]
    AccessDenied(String),

    /// The ciphertext was not produced under this key or has been altered.
    #[error("KMS rejected ciphertext: {0}")]
    InvalidCiphertext(String),

    /// The KMS answered without the expected fields.
    #[error("KMS returned an invalid response: {0}")]
    InvalidResponse(String),

    /// Network failure, throttling or a KMS-side internal error.
    #[error("transient KMS failure: {0}")]
    Transient(String),
}

impl KmsError {
    /// Whether retrying the same call later could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KmsError::Transient(_))
    }
}

/// A freshly generated data key in both plaintext and KMS-wrapped form.
pub struct DataKey {
    pub plaintext: Zeroizing<Vec<u8>>,
    pub ciphertext: Vec<u8>,
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataKey")
            .field("plaintext", &"[REDACTED]")
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}

/// Wrap/unwrap operations under a root key held by an external KMS.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KmsClient: Send + Sync {
    /// Encrypt `plaintext` under the root key `key_id`.
    async fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, KmsError>;

    /// Decrypt a blob previously produced by [`KmsClient::encrypt`] under `key_id`.
    async fn decrypt(&self, key_id: &str, ciphertext: &[u8])
        -> Result<Zeroizing<Vec<u8>>, KmsError>;

    /// Generate a random 256-bit data key, returned both plain and wrapped.
    async fn generate_data_key(&self, key_id: &str) -> Result<DataKey, KmsError>;
}
