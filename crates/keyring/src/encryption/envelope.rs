use serde::{Deserialize, Serialize};

use crate::crypto::{CipherError, NONCE_LEN};
use crate::metadata::ArtifactKeyMetadata;

/// How the DEK of an envelope is protected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KekReference {
    /// Wrapped directly by the KMS under this root key.
    Kms { key_id: String },
    /// Wrapped under the KEK derived from the tenant's TMK for this repository.
    Repository { repository: String },
}

impl KekReference {
    pub fn kms(key_id: impl Into<String>) -> Self {
        KekReference::Kms { key_id: key_id.into() }
    }

    pub fn repository(repository: impl Into<String>) -> Self {
        KekReference::Repository { repository: repository.into() }
    }
}

/// Result of one artifact encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub tenant_id: String,
    /// AEAD output including the 16-byte tag.
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub wrapped_dek: Vec<u8>,
    pub algorithm: String,
    /// TMK version the DEK is wrapped under (1 for KMS-wrapped DEKs).
    pub key_version: u32,
    /// `kek-<repository>-v<version>`, or the root key id for KMS-wrapped DEKs.
    pub kek_label: String,
}

impl Envelope {
    /// Rebuild an envelope from a metadata record and the stored ciphertext.
    pub fn from_metadata(meta: &ArtifactKeyMetadata, ciphertext: Vec<u8>) -> Result<Self, CipherError> {
        let nonce: [u8; NONCE_LEN] = meta
            .nonce
            .as_slice()
            .try_into()
            .map_err(|_| CipherError::InvalidFormat("metadata nonce must be 12 bytes"))?;
        Ok(Self {
            tenant_id: meta.tenant_id.clone(),
            ciphertext,
            nonce,
            wrapped_dek: meta.wrapped_dek.clone(),
            algorithm: meta.algorithm.clone(),
            key_version: meta.tmk_version,
            kek_label: meta.kek_label.clone(),
        })
    }
}
