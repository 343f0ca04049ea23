//! Tenant master key lifecycle: create, fetch, rotate, report, export.
//!
//! # State machine
//!
//! ```text
//! NO_TMK ──create──▶ ACTIVE(v1) ──rotate──▶ ACTIVE(v2) ──rotate──▶ …
//! ```
//!
//! TMKs are persisted only in KMS-wrapped form. Plaintext lives in the
//! [`KeyCache`] (active version only) and in short-lived [`KeyBytes`] buffers
//! that zero themselves on drop. Superseded versions stay in the store
//! forever so artifacts wrapped under them remain decryptable.

pub mod backup;
pub mod status;

pub use backup::TmkBackup;
pub use status::TmkStatus;

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, instrument};

use crate::audit::{AuditLogger, KeyAuditEntry, KeyOperation};
use crate::cache::{cache_key, KeyCache};
use crate::crypto::{KeyBytes, KeyType};
use crate::error::{KeyError, KeyResult};
use crate::kms::KmsClient;
use crate::metadata::validate_identifier;
use crate::store::{NewTmk, TmkRecord, TmkStore};

/// Owns every tenant's TMK versions.
#[derive(Clone)]
pub struct TmkService {
    store: Arc<dyn TmkStore>,
    kms: Arc<dyn KmsClient>,
    cache: KeyCache,
    audit: AuditLogger,
    rotation_threshold: chrono::Duration,
}

impl TmkService {
    pub fn new(
        store: Arc<dyn TmkStore>,
        kms: Arc<dyn KmsClient>,
        cache: KeyCache,
        audit: AuditLogger,
    ) -> Self {
        Self {
            store,
            kms,
            cache,
            audit,
            rotation_threshold: chrono::Duration::days(90),
        }
    }

    /// Override the age after which [`TmkStatus::rotation_recommended`] is set.
    pub fn with_rotation_threshold(mut self, threshold: chrono::Duration) -> Self {
        self.rotation_threshold = threshold;
        self
    }

    pub fn cache(&self) -> &KeyCache {
        &self.cache
    }

    /// Generate version 1 of `tenant`'s TMK, wrapped under `root_key_id`.
    #[instrument(skip(self))]
    pub async fn create_tmk(
        &self,
        tenant: &str,
        created_by: &str,
        root_key_id: &str,
    ) -> KeyResult<TmkRecord> {
        validate_identifier(tenant)?;
        let started = Instant::now();

        let result = async {
            let key = KeyBytes::generate();
            let encrypted_key = self.kms.encrypt(root_key_id, key.as_bytes()).await?;
            let record = self
                .store
                .insert_first(NewTmk {
                    tenant_id: tenant.to_owned(),
                    encrypted_key,
                    kms_key_id: root_key_id.to_owned(),
                    created_by: created_by.to_owned(),
                })
                .await?;
            // The cached copy becomes the only plaintext.
            self.cache
                .set(cache_key(KeyType::Tmk, tenant, record.key_version), key)
                .await;
            Ok::<_, KeyError>(record)
        }
        .await;

        self.audit.log(
            KeyAuditEntry::new(
                tenant,
                KeyType::Tmk,
                record_label(tenant, &result),
                KeyOperation::Generate,
            )
            .by(created_by)
            .outcome(&result)
            .took(started.elapsed()),
        );
        if let Ok(record) = &result {
            info!(tenant, version = record.key_version, "tenant master key created");
        }
        result
    }

    /// The active TMK row, without touching the KMS.
    pub async fn active_record(&self, tenant: &str) -> KeyResult<TmkRecord> {
        self.store
            .active(tenant)
            .await?
            .ok_or_else(|| KeyError::NoActiveTmk(tenant.to_owned()))
    }

    /// Plaintext of the active TMK.
    pub async fn active_tmk(&self, tenant: &str) -> KeyResult<KeyBytes> {
        Ok(self.active_tmk_with_version(tenant).await?.1)
    }

    /// Plaintext of the active TMK together with its version.
    ///
    /// Cache-first; a miss decrypts the stored row through the KMS, caches the
    /// result and audits the access with its duration.
    #[instrument(skip(self))]
    pub async fn active_tmk_with_version(&self, tenant: &str) -> KeyResult<(u32, KeyBytes)> {
        let record = self.active_record(tenant).await?;
        let slot = cache_key(KeyType::Tmk, tenant, record.key_version);
        if let Some(key) = self.cache.get(&slot).await {
            return Ok((record.key_version, key));
        }

        let key = self.unwrap_audited(&record).await?;
        self.cache_active(&record, slot, key.clone()).await?;
        Ok((record.key_version, key))
    }

    /// Plaintext of a specific TMK version.
    ///
    /// Only the active version is cached; superseded versions are decrypted on
    /// every call and the returned buffer is the only copy.
    #[instrument(skip(self))]
    pub async fn tmk_version(&self, tenant: &str, version: u32) -> KeyResult<KeyBytes> {
        let record = self
            .store
            .version(tenant, version)
            .await?
            .ok_or_else(|| KeyError::TmkVersionNotFound {
                tenant: tenant.to_owned(),
                version,
            })?;

        if !record.is_active {
            return self.unwrap_audited(&record).await;
        }
        let slot = cache_key(KeyType::Tmk, tenant, version);
        if let Some(key) = self.cache.get(&slot).await {
            return Ok(key);
        }
        let key = self.unwrap_audited(&record).await?;
        self.cache_active(&record, slot, key.clone()).await?;
        Ok(key)
    }

    /// Cache the plaintext of `record`, then evict it again if a rotation
    /// superseded the version meanwhile.
    ///
    /// Rotation commits before it deletes the old entry, so whichever of the
    /// two runs last removes a stale insert.
    async fn cache_active(
        &self,
        record: &TmkRecord,
        slot: String,
        key: KeyBytes,
    ) -> KeyResult<()> {
        self.cache.set(slot.clone(), key).await;
        let still_active = self
            .store
            .active(&record.tenant_id)
            .await?
            .is_some_and(|active| active.key_version == record.key_version);
        if !still_active {
            self.cache.delete(&slot).await;
            debug!(
                tenant = %record.tenant_id,
                version = record.key_version,
                "TMK superseded during fetch; not cached"
            );
        }
        Ok(())
    }

    async fn unwrap_audited(&self, record: &TmkRecord) -> KeyResult<KeyBytes> {
        let started = Instant::now();
        let result = async {
            let plaintext = self
                .kms
                .decrypt(&record.kms_key_id, &record.encrypted_key)
                .await?;
            Ok::<_, KeyError>(KeyBytes::from_slice(&plaintext)?)
        }
        .await;

        let mut entry = KeyAuditEntry::new(
            &record.tenant_id,
            KeyType::Tmk,
            record.label(),
            KeyOperation::Access,
        )
        .outcome(&result)
        .took(started.elapsed());
        if !record.is_active {
            entry = entry.with_details("superseded version");
        }
        self.audit.log(entry);
        result
    }

    /// Supersede the active TMK with a new version wrapped under `root_key_id`.
    ///
    /// Artifact data is untouched; only new encryptions move to the new
    /// version. Returns the new active row.
    #[instrument(skip(self))]
    pub async fn rotate_tmk(
        &self,
        tenant: &str,
        rotated_by: &str,
        root_key_id: &str,
    ) -> KeyResult<TmkRecord> {
        let started = Instant::now();

        let result = async {
            // Fail before spending a KMS call; the transaction re-checks.
            self.active_record(tenant).await?;

            let key = KeyBytes::generate();
            let encrypted_key = self.kms.encrypt(root_key_id, key.as_bytes()).await?;
            let rotation = self
                .store
                .rotate(NewTmk {
                    tenant_id: tenant.to_owned(),
                    encrypted_key,
                    kms_key_id: root_key_id.to_owned(),
                    created_by: rotated_by.to_owned(),
                })
                .await?;

            self.cache
                .delete(&cache_key(KeyType::Tmk, tenant, rotation.previous.key_version))
                .await;
            self.cache
                .set(cache_key(KeyType::Tmk, tenant, rotation.current.key_version), key)
                .await;
            Ok::<_, KeyError>(rotation)
        }
        .await;

        let mut entry = KeyAuditEntry::new(
            tenant,
            KeyType::Tmk,
            record_label(tenant, &result.as_ref().map(|r| &r.current)),
            KeyOperation::Rotate,
        )
        .by(rotated_by)
        .outcome(&result)
        .took(started.elapsed());
        if let Ok(rotation) = &result {
            entry = entry.with_details(format!(
                "v{} -> v{}",
                rotation.previous.key_version, rotation.current.key_version
            ));
            info!(
                tenant,
                from = rotation.previous.key_version,
                to = rotation.current.key_version,
                "tenant master key rotated"
            );
        }
        self.audit.log(entry);

        result.map(|rotation| rotation.current)
    }

    /// Version, age and rotation recommendation for the active TMK.
    pub async fn tmk_status(&self, tenant: &str) -> KeyResult<TmkStatus> {
        let record = self.active_record(tenant).await?;
        Ok(TmkStatus::evaluate(&record, Utc::now(), self.rotation_threshold))
    }

    /// Encoded backup of the active TMK in its KMS-wrapped form.
    #[instrument(skip(self))]
    pub async fn export_tmk(&self, tenant: &str, requested_by: &str) -> KeyResult<String> {
        let started = Instant::now();
        let result = async {
            let record = self.active_record(tenant).await?;
            let encoded = TmkBackup::from_record(&record).encode()?;
            Ok::<_, KeyError>((record, encoded))
        }
        .await;

        self.audit.log(
            KeyAuditEntry::new(
                tenant,
                KeyType::Tmk,
                record_label(tenant, &result.as_ref().map(|(r, _)| r)),
                KeyOperation::Export,
            )
            .by(requested_by)
            .outcome(&result)
            .took(started.elapsed()),
        );
        result.map(|(_, encoded)| encoded)
    }
}

impl std::fmt::Debug for TmkService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TmkService")
            .field("cache", &self.cache)
            .field("rotation_threshold_days", &self.rotation_threshold.num_days())
            .finish()
    }
}

/// Audit label of the record in `result`, or the bare tenant label on failure.
fn record_label<R, E>(tenant: &str, result: &Result<R, E>) -> String
where
    R: std::borrow::Borrow<TmkRecord>,
{
    match result {
        Ok(record) => record.borrow().label(),
        Err(_) => format!("tmk-{tenant}"),
    }
}
