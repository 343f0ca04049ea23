//! Artifact envelope encryption.
//!
//! Each artifact is sealed under a fresh random DEK. The DEK is then wrapped
//! either directly by the KMS ([`KekReference::Kms`]) or under a KEK derived
//! from the tenant's active TMK for the artifact's repository
//! ([`KekReference::Repository`]). Repository envelopes record the TMK version
//! they were wrapped under, so they stay decryptable after any number of
//! rotations.

pub mod envelope;

pub use envelope::{Envelope, KekReference};

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument};

use crate::crypto::{self, cipher, CipherError, KeyBytes, ALGORITHM};
use crate::error::{KeyError, KeyResult};
use crate::kms::{KmsClient, KmsError};
use crate::metadata::{validate_identifier, ArtifactKeyMetadata, MetadataStore};
use crate::tmk::TmkService;

/// Addresses one stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactRef {
    pub tenant_id: String,
    pub repository_id: String,
    pub artifact_id: String,
}

impl ArtifactRef {
    pub fn new(
        tenant_id: impl Into<String>,
        repository_id: impl Into<String>,
        artifact_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            repository_id: repository_id.into(),
            artifact_id: artifact_id.into(),
        }
    }
}

#[derive(Clone)]
pub struct EncryptionService {
    kms: Arc<dyn KmsClient>,
    tmk: TmkService,
    metadata: Arc<dyn MetadataStore>,
}

impl EncryptionService {
    pub fn new(kms: Arc<dyn KmsClient>, tmk: TmkService, metadata: Arc<dyn MetadataStore>) -> Self {
        Self { kms, tmk, metadata }
    }

    /// Deterministic KEK derivation; see [`crypto::derive_kek`].
    pub fn derive_kek(tmk: &KeyBytes, context: &str) -> KeyResult<KeyBytes> {
        Ok(crypto::derive_kek(tmk, context)?)
    }

    /// Seal `plaintext` under a fresh DEK protected as `kek` describes.
    #[instrument(skip(self, plaintext), fields(len = plaintext.len()))]
    pub async fn encrypt_artifact(
        &self,
        tenant: &str,
        plaintext: &[u8],
        kek: &KekReference,
    ) -> KeyResult<Envelope> {
        validate_identifier(tenant)?;
        match kek {
            KekReference::Kms { key_id } => {
                let data_key = self.kms.generate_data_key(key_id).await?;
                let dek = KeyBytes::from_slice(&data_key.plaintext)?;
                let sealed = cipher::seal(&dek, plaintext)?;
                Ok(Envelope {
                    tenant_id: tenant.to_owned(),
                    ciphertext: sealed.ciphertext,
                    nonce: sealed.nonce,
                    wrapped_dek: data_key.ciphertext,
                    algorithm: ALGORITHM.to_owned(),
                    key_version: 1,
                    kek_label: key_id.clone(),
                })
            }
            KekReference::Repository { repository } => {
                validate_identifier(repository)?;
                let (version, tmk) = self.tmk.active_tmk_with_version(tenant).await?;
                let kek = crypto::derive_kek(&tmk, &crypto::kek_context(repository))?;
                drop(tmk);

                let dek = KeyBytes::generate();
                let sealed = cipher::seal(&dek, plaintext)?;
                let wrapped_dek = cipher::wrap_key(&kek, &dek)?;
                Ok(Envelope {
                    tenant_id: tenant.to_owned(),
                    ciphertext: sealed.ciphertext,
                    nonce: sealed.nonce,
                    wrapped_dek,
                    algorithm: ALGORITHM.to_owned(),
                    key_version: version,
                    kek_label: crypto::kek_label(repository, version),
                })
            }
        }
    }

    /// Unwrap the envelope's DEK and authenticate-decrypt its ciphertext.
    ///
    /// Any alteration of the ciphertext, nonce or wrapped DEK fails with an
    /// integrity error.
    #[instrument(skip(self, envelope), fields(tenant = %envelope.tenant_id, version = envelope.key_version))]
    pub async fn decrypt_artifact(&self, envelope: &Envelope, kek: &KekReference) -> KeyResult<Vec<u8>> {
        if envelope.algorithm != ALGORITHM {
            return Err(CipherError::InvalidFormat("unsupported envelope algorithm").into());
        }
        let dek = match kek {
            KekReference::Kms { key_id } => {
                let plaintext = self
                    .kms
                    .decrypt(key_id, &envelope.wrapped_dek)
                    .await
                    .map_err(|e| match e {
                        KmsError::InvalidCiphertext(_) => {
                            KeyError::Cipher(CipherError::AuthenticationFailed)
                        }
                        other => KeyError::Kms(other),
                    })?;
                KeyBytes::from_slice(&plaintext)?
            }
            KekReference::Repository { repository } => {
                let tmk = self
                    .tmk
                    .tmk_version(&envelope.tenant_id, envelope.key_version)
                    .await?;
                let kek = crypto::derive_kek(&tmk, &crypto::kek_context(repository))?;
                drop(tmk);
                cipher::unwrap_key(&kek, &envelope.wrapped_dek)?
            }
        };
        Ok(cipher::open(&dek, &envelope.nonce, &envelope.ciphertext)?)
    }

    /// Encrypt under the repository KEK and record the artifact's key metadata.
    ///
    /// The caller stores `envelope.ciphertext`; everything needed to decrypt
    /// it later lives in the metadata record.
    #[instrument(skip(self, plaintext), fields(tenant = %artifact.tenant_id, artifact = %artifact.artifact_id))]
    pub async fn seal_artifact(&self, artifact: &ArtifactRef, plaintext: &[u8]) -> KeyResult<Envelope> {
        validate_identifier(&artifact.artifact_id)?;
        let envelope = self
            .encrypt_artifact(
                &artifact.tenant_id,
                plaintext,
                &KekReference::repository(&artifact.repository_id),
            )
            .await?;

        self.metadata
            .put(&ArtifactKeyMetadata {
                tenant_id: artifact.tenant_id.clone(),
                artifact_id: artifact.artifact_id.clone(),
                repository_id: artifact.repository_id.clone(),
                wrapped_dek: envelope.wrapped_dek.clone(),
                kek_label: envelope.kek_label.clone(),
                tmk_version: envelope.key_version,
                algorithm: envelope.algorithm.clone(),
                nonce: envelope.nonce.to_vec(),
                created_at: Utc::now(),
                last_rewrapped_at: None,
            })
            .await?;
        debug!(version = envelope.key_version, "artifact sealed");
        Ok(envelope)
    }

    /// Decrypt a sealed artifact's stored ciphertext using its current
    /// metadata record, which may have been re-wrapped since sealing.
    #[instrument(skip(self, ciphertext), fields(tenant = %artifact.tenant_id, artifact = %artifact.artifact_id))]
    pub async fn open_artifact(&self, artifact: &ArtifactRef, ciphertext: &[u8]) -> KeyResult<Vec<u8>> {
        let meta = self
            .metadata
            .get(&artifact.tenant_id, &artifact.artifact_id)
            .await?;
        if meta.repository_id != artifact.repository_id {
            return Err(KeyError::Malformed(format!(
                "artifact {} belongs to repository {}, not {}",
                artifact.artifact_id, meta.repository_id, artifact.repository_id
            )));
        }
        let envelope = Envelope::from_metadata(&meta, ciphertext.to_vec())?;
        self.decrypt_artifact(&envelope, &KekReference::repository(meta.repository_id))
            .await
    }
}

impl std::fmt::Debug for EncryptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionService").finish_non_exhaustive()
    }
}
