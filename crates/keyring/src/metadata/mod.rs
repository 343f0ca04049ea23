//! Per-artifact key metadata.
//!
//! One small record per encrypted artifact mirrors the envelope's wrapped DEK,
//! KEK label and TMK version. The re-wrap job rewrites only this record; the
//! artifact ciphertext stays where the caller stored it.

pub mod file;

pub use file::FileMetadataStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{KeyError, KeyResult};

/// Key bookkeeping for one encrypted artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactKeyMetadata {
    pub tenant_id: String,
    pub artifact_id: String,
    pub repository_id: String,
    /// DEK wrapped under the KEK named by `kek_label`.
    #[serde(with = "b64")]
    pub wrapped_dek: Vec<u8>,
    pub kek_label: String,
    pub tmk_version: u32,
    pub algorithm: String,
    /// Nonce of the artifact payload ciphertext.
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_rewrapped_at: Option<DateTime<Utc>>,
}

/// Storage for [`ArtifactKeyMetadata`], addressed by tenant and artifact id.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Create or replace a record. Readers observe either the old or the new
    /// record, never a partial one.
    async fn put(&self, meta: &ArtifactKeyMetadata) -> KeyResult<()>;

    /// Fails with [`KeyError::MetadataNotFound`] if no record exists.
    async fn get(&self, tenant_id: &str, artifact_id: &str) -> KeyResult<ArtifactKeyMetadata>;

    async fn count(&self, tenant_id: &str) -> KeyResult<u64>;

    /// Up to `limit` artifact ids in ascending order, strictly after `after`.
    async fn page(
        &self,
        tenant_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> KeyResult<Vec<String>>;
}

/// Reject identifiers that cannot safely be used as a single path component.
pub fn validate_identifier(id: &str) -> KeyResult<()> {
    let ok = !id.is_empty()
        && id.len() <= 200
        && !id.starts_with('.')
        && !id.contains(['/', '\\', '\0']);
    if ok {
        Ok(())
    } else {
        Err(KeyError::InvalidIdentifier(id.to_owned()))
    }
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
