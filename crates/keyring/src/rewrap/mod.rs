//! Background migration of wrapped DEKs after a TMK rotation.
//!
//! A job lists a tenant's remaining artifact ids once, in ascending order,
//! and works through them one batch at a time. For each artifact still below the target TMK version it
//! unwraps the DEK under the old repository KEK and re-wraps it under the KEK
//! derived from the target version, then atomically replaces the metadata
//! record. Artifact ciphertext is never read or written.
//!
//! # Failure semantics
//!
//! - A per-artifact failure is recorded (text plus retryable flag) and the
//!   walk continues with the next artifact.
//! - Failing to count or list the tenant's artifacts, or to fetch the target
//!   TMK, aborts the job with a job-level error since the cursor cannot
//!   safely advance.
//! - Artifacts already at or above the target version are skipped, so
//!   re-running a job is harmless.
//!
//! # Concurrency
//!
//! The registry lock is held only for a lookup or a single mutation, never
//! across a KMS, metadata or database call. Scheduling is serialised by a
//! separate mutex so a rotation is only committed once its job is sure to
//! start. Each job owns a [`CancellationToken`] checked between artifacts
//! and raced against the inter-batch delay.

pub mod job;

pub use job::{ArtifactFailure, JobStatus, RewrapJob};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::audit::{AuditLogger, KeyAuditEntry, KeyOperation};
use crate::crypto::{self, cipher, KeyBytes, KeyType};
use crate::error::{KeyError, KeyResult};
use crate::metadata::{validate_identifier, ArtifactKeyMetadata, MetadataStore};
use crate::settings::KeyringSettings;
use crate::store::{JobStore, TmkRecord};
use crate::tmk::TmkService;

struct JobEntry {
    job: RewrapJob,
    cancel: CancellationToken,
    /// Cancelled by the worker once it has written its final state.
    done: CancellationToken,
}

enum Outcome {
    Skipped,
    Rewrapped {
        from_version: u32,
        old_label: String,
        new_label: String,
    },
}

struct Inner {
    tmk: TmkService,
    metadata: Arc<dyn MetadataStore>,
    jobs: Option<Arc<dyn JobStore>>,
    audit: AuditLogger,
    batch_size: usize,
    batch_delay: Duration,
    max_errors: usize,
    registry: RwLock<HashMap<Uuid, JobEntry>>,
    /// Held from the running-job check until the new job is registered.
    scheduling: Mutex<()>,
}

/// Schedules and tracks re-wrap jobs.
#[derive(Clone)]
pub struct RewrapService {
    inner: Arc<Inner>,
}

impl RewrapService {
    /// `jobs` makes job state durable; without it jobs live in memory only.
    pub fn new(
        tmk: TmkService,
        metadata: Arc<dyn MetadataStore>,
        jobs: Option<Arc<dyn JobStore>>,
        audit: AuditLogger,
        settings: &KeyringSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                tmk,
                metadata,
                jobs,
                audit,
                batch_size: settings.rewrap_batch_size.max(1),
                batch_delay: settings.rewrap_batch_delay(),
                max_errors: settings.max_job_errors,
                registry: RwLock::new(HashMap::new()),
                scheduling: Mutex::new(()),
            }),
        }
    }

    /// Rotate `tenant`'s TMK, then schedule the re-wrap job for the new version.
    ///
    /// Fails with [`KeyError::RewrapInProgress`] without rotating while the
    /// tenant already has a running job. The job is only scheduled once the
    /// rotation has committed.
    pub async fn rotate_and_rewrap(
        &self,
        tenant: &str,
        rotated_by: &str,
        root_key_id: &str,
    ) -> KeyResult<(TmkRecord, RewrapJob)> {
        validate_identifier(tenant)?;
        let _scheduling = self.inner.scheduling.lock().await;
        self.inner.ensure_idle(tenant).await?;
        let current = self.inner.tmk.rotate_tmk(tenant, rotated_by, root_key_id).await?;
        let job = self.schedule(tenant, Some(rotated_by)).await?;
        Ok((current, job))
    }

    /// Start a job migrating every artifact of `tenant` to the active TMK version.
    ///
    /// Returns immediately with the initial job record. Fails with
    /// [`KeyError::RewrapInProgress`] while the tenant already has a running job.
    #[instrument(skip(self))]
    pub async fn start_job(&self, tenant: &str, triggered_by: Option<&str>) -> KeyResult<RewrapJob> {
        validate_identifier(tenant)?;
        let _scheduling = self.inner.scheduling.lock().await;
        self.inner.ensure_idle(tenant).await?;
        self.schedule(tenant, triggered_by).await
    }

    /// Register and spawn a job. Callers hold the scheduling lock and have
    /// checked that the tenant is idle.
    async fn schedule(&self, tenant: &str, triggered_by: Option<&str>) -> KeyResult<RewrapJob> {
        let active = self.inner.tmk.active_record(tenant).await?;
        let target = active.key_version;
        let job = RewrapJob::new(tenant, target.saturating_sub(1), target);
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();

        {
            let mut registry = self.inner.registry.write().await;
            registry.insert(
                job.id,
                JobEntry {
                    job: job.clone(),
                    cancel: cancel.clone(),
                    done: done.clone(),
                },
            );
        }

        let mut entry = KeyAuditEntry::new(
            tenant,
            KeyType::Tmk,
            active.label(),
            KeyOperation::RewrapStarted,
        )
        .with_details(format!("job={} target=v{target}", job.id));
        if let Some(user) = triggered_by {
            entry = entry.by(user);
        }
        self.inner.audit.log(entry);

        info!(job = %job.id, tenant, target, "re-wrap job scheduled");
        tokio::spawn(Arc::clone(&self.inner).run(job.id, cancel, done));
        Ok(job)
    }

    /// Snapshot of a job. Falls back to the job store for jobs from earlier runs.
    pub async fn job_status(&self, id: Uuid) -> KeyResult<RewrapJob> {
        if let Some(entry) = self.inner.registry.read().await.get(&id) {
            return Ok(entry.job.clone());
        }
        if let Some(jobs) = &self.inner.jobs {
            if let Some(job) = jobs.load_job(id).await? {
                return Ok(job);
            }
        }
        Err(KeyError::JobNotFound(id))
    }

    /// Request cancellation of a running job.
    ///
    /// The status flips to `cancelled` at once; the worker stops before its
    /// next artifact. Terminal jobs are returned unchanged.
    #[instrument(skip(self))]
    pub async fn cancel_job(&self, id: Uuid) -> KeyResult<RewrapJob> {
        let cancelled = {
            let mut registry = self.inner.registry.write().await;
            match registry.get_mut(&id) {
                Some(entry) if entry.job.status == JobStatus::Running => {
                    entry.job.status = JobStatus::Cancelled;
                    entry.cancel.cancel();
                    info!(job = %id, tenant = %entry.job.tenant_id, "re-wrap job cancelled");
                    Some(entry.job.clone())
                }
                _ => None,
            }
        };
        match cancelled {
            Some(job) => {
                self.inner.persist(&job).await;
                Ok(job)
            }
            None => self.job_status(id).await,
        }
    }

    /// All jobs known to this process, oldest first.
    pub async fn list_jobs(&self) -> Vec<RewrapJob> {
        let mut jobs: Vec<_> = self
            .inner
            .registry
            .read()
            .await
            .values()
            .map(|e| e.job.clone())
            .collect();
        jobs.sort_by_key(|j| j.started_at);
        jobs
    }

    /// Number of jobs currently running.
    pub async fn running_jobs(&self) -> usize {
        self.inner
            .registry
            .read()
            .await
            .values()
            .filter(|e| e.job.status == JobStatus::Running)
            .count()
    }

    /// Wait until the job's worker has finished and return its final state.
    pub async fn wait(&self, id: Uuid) -> KeyResult<RewrapJob> {
        let done = self
            .inner
            .registry
            .read()
            .await
            .get(&id)
            .map(|e| e.done.clone());
        if let Some(done) = done {
            done.cancelled().await;
        }
        self.job_status(id).await
    }

    /// Continue every job the store still records as running.
    ///
    /// Each resumes from its saved cursor with its saved counters. Returns
    /// the ids of the resumed jobs.
    pub async fn resume_incomplete(&self) -> KeyResult<Vec<Uuid>> {
        let Some(jobs) = &self.inner.jobs else {
            return Ok(Vec::new());
        };
        let pending = jobs.running_jobs().await?;

        let mut resumed = Vec::with_capacity(pending.len());
        for job in pending {
            let cancel = CancellationToken::new();
            let done = CancellationToken::new();
            {
                let mut registry = self.inner.registry.write().await;
                if registry.contains_key(&job.id) {
                    continue;
                }
                registry.insert(
                    job.id,
                    JobEntry {
                        job: job.clone(),
                        cancel: cancel.clone(),
                        done: done.clone(),
                    },
                );
            }
            info!(
                job = %job.id,
                tenant = %job.tenant_id,
                cursor = job.cursor.as_deref().unwrap_or(""),
                "resuming re-wrap job"
            );
            tokio::spawn(Arc::clone(&self.inner).run(job.id, cancel, done));
            resumed.push(job.id);
        }
        Ok(resumed)
    }
}

impl std::fmt::Debug for RewrapService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RewrapService")
            .field("batch_size", &self.inner.batch_size)
            .field("batch_delay", &self.inner.batch_delay)
            .field("durable", &self.inner.jobs.is_some())
            .finish()
    }
}

impl Inner {
    async fn ensure_idle(&self, tenant: &str) -> KeyResult<()> {
        let registry = self.registry.read().await;
        match registry
            .values()
            .find(|e| e.job.tenant_id == tenant && e.job.status == JobStatus::Running)
        {
            Some(running) => Err(KeyError::RewrapInProgress {
                tenant: tenant.to_owned(),
                job_id: running.job.id,
            }),
            None => Ok(()),
        }
    }

    /// Apply `f` to the registry copy of job `id` and return the new snapshot.
    async fn update(&self, id: Uuid, f: impl FnOnce(&mut RewrapJob)) -> Option<RewrapJob> {
        let mut registry = self.registry.write().await;
        let entry = registry.get_mut(&id)?;
        f(&mut entry.job);
        Some(entry.job.clone())
    }

    async fn snapshot(&self, id: Uuid) -> Option<RewrapJob> {
        self.registry.read().await.get(&id).map(|e| e.job.clone())
    }

    async fn persist(&self, job: &RewrapJob) {
        if let Some(jobs) = &self.jobs {
            if let Err(e) = jobs.save_job(job).await {
                warn!(job = %job.id, error = %e, "failed to persist re-wrap job state");
            }
        }
    }

    async fn run(self: Arc<Self>, id: Uuid, cancel: CancellationToken, done: CancellationToken) {
        let result = self.walk(id, &cancel).await;
        let final_state = self
            .update(id, |job| match &result {
                Ok(()) => job.finish(),
                Err(e) => job.abort(e),
            })
            .await;

        if let Some(job) = final_state {
            self.persist(&job).await;
            match &result {
                Ok(()) => info!(
                    job = %job.id,
                    tenant = %job.tenant_id,
                    status = %job.status,
                    succeeded = job.succeeded,
                    failed = job.failed,
                    skipped = job.skipped,
                    "re-wrap job finished"
                ),
                Err(e) => warn!(job = %job.id, tenant = %job.tenant_id, error = %e, "re-wrap job aborted"),
            }
        }
        done.cancel();
    }

    /// The batch loop. `Err` is a job-level failure.
    async fn walk(&self, id: Uuid, cancel: &CancellationToken) -> KeyResult<()> {
        let Some(job) = self.snapshot(id).await else {
            return Ok(());
        };
        self.persist(&job).await;

        let tenant = job.tenant_id.clone();
        let target = job.target_version;

        let total = self.metadata.count(&tenant).await?;
        self.update(id, |job| job.total = total).await;

        let new_tmk = self.tmk.tmk_version(&tenant, target).await?;

        if cancel.is_cancelled() {
            return Ok(());
        }
        // Artifacts created after this listing are sealed under the target
        // version already.
        let remaining = self
            .metadata
            .page(&tenant, job.cursor.as_deref(), usize::MAX)
            .await?;

        let mut batches = remaining.chunks(self.batch_size).peekable();
        while let Some(batch) = batches.next() {
            for artifact_id in batch {
                if cancel.is_cancelled() {
                    break;
                }
                let outcome = self.rewrap_one(&tenant, artifact_id, target, &new_tmk).await;
                self.record(id, &tenant, artifact_id, outcome).await;
            }

            if let Some(job) = self.snapshot(id).await {
                self.persist(&job).await;
            }
            if batches.peek().is_none() || cancel.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.batch_delay) => {}
            }
        }
        Ok(())
    }

    async fn rewrap_one(
        &self,
        tenant: &str,
        artifact_id: &str,
        target: u32,
        new_tmk: &KeyBytes,
    ) -> KeyResult<Outcome> {
        let meta = self.metadata.get(tenant, artifact_id).await?;
        if meta.tmk_version >= target {
            return Ok(Outcome::Skipped);
        }

        let context = crypto::kek_context(&meta.repository_id);
        let old_kek = {
            let old_tmk = self.tmk.tmk_version(tenant, meta.tmk_version).await?;
            crypto::derive_kek(&old_tmk, &context)?
        };
        let dek = cipher::unwrap_key(&old_kek, &meta.wrapped_dek)?;
        let new_kek = crypto::derive_kek(new_tmk, &context)?;
        let wrapped_dek = cipher::wrap_key(&new_kek, &dek)?;

        let from_version = meta.tmk_version;
        let old_label = meta.kek_label.clone();
        let new_label = crypto::kek_label(&meta.repository_id, target);
        self.metadata
            .put(&ArtifactKeyMetadata {
                wrapped_dek,
                kek_label: new_label.clone(),
                tmk_version: target,
                last_rewrapped_at: Some(Utc::now()),
                ..meta
            })
            .await?;
        Ok(Outcome::Rewrapped {
            from_version,
            old_label,
            new_label,
        })
    }

    /// Fold one artifact outcome into the job and audit it.
    async fn record(&self, id: Uuid, tenant: &str, artifact_id: &str, outcome: KeyResult<Outcome>) {
        let max_errors = self.max_errors;
        match outcome {
            Ok(Outcome::Skipped) => {
                self.update(id, |job| job.record_skip(artifact_id)).await;
            }
            Ok(Outcome::Rewrapped {
                from_version,
                old_label,
                new_label,
            }) => {
                self.update(id, |job| job.record_success(artifact_id, from_version))
                    .await;
                self.audit.log(
                    KeyAuditEntry::new(tenant, KeyType::Dek, artifact_id, KeyOperation::Rewrap)
                        .with_details(format!("old_kek={old_label} new_kek={new_label}")),
                );
            }
            Err(e) => {
                let failure = ArtifactFailure {
                    artifact_id: artifact_id.to_owned(),
                    error: e.to_string(),
                    retryable: e.is_retryable(),
                };
                warn!(
                    job = %id,
                    tenant,
                    artifact = artifact_id,
                    retryable = failure.retryable,
                    error = %e,
                    "artifact re-wrap failed"
                );
                self.audit.log(
                    KeyAuditEntry::new(tenant, KeyType::Dek, artifact_id, KeyOperation::RewrapFailed)
                        .failed(&e),
                );
                self.update(id, |job| job.record_failure(failure, max_errors)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::KeyCache;
    use crate::encryption::{ArtifactRef, EncryptionService};
    use crate::kms::MemoryKms;
    use crate::metadata::FileMetadataStore;
    use crate::store::SqliteStore;
    use crate::test_support::CollectingSink;

    const ROOT: &str = "alias/root";

    struct Fixture {
        rewrap: RewrapService,
        encryption: EncryptionService,
        tmk: TmkService,
        metadata: Arc<FileMetadataStore>,
        kms: Arc<MemoryKms>,
        sink: Arc<CollectingSink>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(batch_size: usize) -> Fixture {
        fixture_with_delay(batch_size, 1).await
    }

    async fn fixture_with_delay(batch_size: usize, delay_ms: u64) -> Fixture {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        store.migrate().await.unwrap();
        let kms = Arc::new(MemoryKms::new().with_root_key(ROOT));
        let sink = Arc::new(CollectingSink::default());
        let audit = AuditLogger::spawn(sink.clone(), 1024);
        let tmk = TmkService::new(
            store.clone(),
            kms.clone(),
            KeyCache::new(Duration::from_secs(300)),
            audit.clone(),
        );
        let dir = tempfile::tempdir().unwrap();
        let metadata = Arc::new(FileMetadataStore::new(dir.path()));
        let encryption = EncryptionService::new(kms.clone(), tmk.clone(), metadata.clone());
        let settings = KeyringSettings {
            rewrap_batch_size: batch_size,
            rewrap_batch_delay_ms: delay_ms,
            max_job_errors: 2,
            ..KeyringSettings::default()
        };
        let rewrap = RewrapService::new(tmk.clone(), metadata.clone(), Some(store), audit, &settings);
        tmk.create_tmk("acme", "alice", ROOT).await.unwrap();
        Fixture { rewrap, encryption, tmk, metadata, kms, sink, _dir: dir }
    }

    async fn seal(f: &Fixture, ids: &[&str]) -> Vec<Vec<u8>> {
        let mut ciphertexts = Vec::new();
        for id in ids {
            let artifact = ArtifactRef::new("acme", "npm", *id);
            let env = f.encryption.seal_artifact(&artifact, id.as_bytes()).await.unwrap();
            ciphertexts.push(env.ciphertext);
        }
        ciphertexts
    }

    #[tokio::test]
    async fn rewraps_every_artifact_to_target_version() {
        let f = fixture(2).await;
        let ids = ["a1", "a2", "a3", "a4", "a5"];
        let ciphertexts = seal(&f, &ids).await;
        let before = f.metadata.get("acme", "a1").await.unwrap();

        let (current, job) = f.rewrap.rotate_and_rewrap("acme", "bob", ROOT).await.unwrap();
        assert_eq!(current.key_version, 2);
        assert_eq!((job.source_version, job.target_version), (1, 2));

        let job = f.rewrap.wait(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.total, 5);
        assert_eq!(job.succeeded, 5);
        assert_eq!(job.processed, 5);
        assert_eq!(job.cursor.as_deref(), Some("a5"));

        for (id, ct) in ids.iter().zip(&ciphertexts) {
            let meta = f.metadata.get("acme", id).await.unwrap();
            assert_eq!(meta.tmk_version, 2);
            assert_eq!(meta.kek_label, "kek-npm-v2");
            assert!(meta.last_rewrapped_at.is_some());
            let plain = f
                .encryption
                .open_artifact(&ArtifactRef::new("acme", "npm", *id), ct)
                .await
                .unwrap();
            assert_eq!(plain, id.as_bytes());
        }

        let after = f.metadata.get("acme", "a1").await.unwrap();
        assert_ne!(after.wrapped_dek, before.wrapped_dek);
        assert_eq!(after.nonce, before.nonce);
        assert_eq!(after.created_at, before.created_at);

        // generate, rotate, started, then an old-TMK access and a rewrap per artifact
        let entries = f.sink.wait_for(13).await;
        let rewraps: Vec<_> = entries
            .iter()
            .filter(|e| e.operation == KeyOperation::Rewrap)
            .collect();
        assert_eq!(rewraps.len(), 5);
        assert_eq!(
            rewraps[0].details.as_deref(),
            Some("old_kek=kek-npm-v1 new_kek=kek-npm-v2")
        );
        assert_eq!(
            entries
                .iter()
                .filter(|e| e.operation == KeyOperation::RewrapStarted)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn second_run_skips_everything() {
        let f = fixture(10).await;
        seal(&f, &["a1", "a2", "a3"]).await;
        f.tmk.rotate_tmk("acme", "bob", ROOT).await.unwrap();

        let first = f.rewrap.start_job("acme", None).await.unwrap();
        let first = f.rewrap.wait(first.id).await.unwrap();
        assert_eq!(first.succeeded, 3);
        let snapshot = f.metadata.get("acme", "a2").await.unwrap();

        let second = f.rewrap.start_job("acme", None).await.unwrap();
        let second = f.rewrap.wait(second.id).await.unwrap();
        assert_eq!(second.status, JobStatus::Completed);
        assert_eq!(second.processed, 0);
        assert_eq!(second.skipped, 3);
        assert_eq!(f.metadata.get("acme", "a2").await.unwrap(), snapshot);
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_the_rest() {
        let f = fixture(10).await;
        seal(&f, &["a1", "a2", "a3"]).await;
        f.tmk.rotate_tmk("acme", "bob", ROOT).await.unwrap();
        // First old-TMK decrypt of the job (for a1) fails transiently.
        f.kms.fail_next_decrypts(1);

        let job = f.rewrap.start_job("acme", None).await.unwrap();
        let job = f.rewrap.wait(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failed, 1);
        assert_eq!(job.succeeded, 2);
        assert_eq!(job.processed, job.succeeded + job.failed);
        assert_eq!(job.errors.len(), 1);
        assert_eq!(job.errors[0].artifact_id, "a1");
        assert!(job.errors[0].retryable);

        assert_eq!(f.metadata.get("acme", "a1").await.unwrap().tmk_version, 1);
        assert_eq!(f.metadata.get("acme", "a2").await.unwrap().tmk_version, 2);

        // A re-run picks up only the failed artifact.
        let retry = f.rewrap.start_job("acme", None).await.unwrap();
        let retry = f.rewrap.wait(retry.id).await.unwrap();
        assert_eq!(retry.status, JobStatus::Completed);
        assert_eq!((retry.succeeded, retry.skipped), (1, 2));
    }

    #[tokio::test]
    async fn tampered_wrapped_dek_is_a_permanent_failure() {
        let f = fixture(10).await;
        seal(&f, &["a1", "a2"]).await;
        let mut meta = f.metadata.get("acme", "a1").await.unwrap();
        meta.wrapped_dek[20] ^= 0xff;
        f.metadata.put(&meta).await.unwrap();
        f.tmk.rotate_tmk("acme", "bob", ROOT).await.unwrap();

        let job = f.rewrap.start_job("acme", None).await.unwrap();
        let job = f.rewrap.wait(job.id).await.unwrap();
        assert_eq!(job.failed, 1);
        assert!(!job.errors[0].retryable);
        assert_eq!(job.succeeded, 1);
    }

    #[tokio::test]
    async fn error_list_is_capped() {
        let f = fixture(10).await;
        seal(&f, &["a1", "a2", "a3", "a4"]).await;
        f.tmk.rotate_tmk("acme", "bob", ROOT).await.unwrap();
        f.kms.fail_next_decrypts(4);

        let job = f.rewrap.start_job("acme", None).await.unwrap();
        let job = f.rewrap.wait(job.id).await.unwrap();
        assert_eq!(job.failed, 4);
        assert_eq!(job.errors.len(), 2);
    }

    #[tokio::test]
    async fn only_one_running_job_per_tenant() {
        let f = fixture(1).await;
        seal(&f, &["a1", "a2", "a3"]).await;
        f.tmk.rotate_tmk("acme", "bob", ROOT).await.unwrap();

        let first = f.rewrap.start_job("acme", None).await.unwrap();
        let err = f.rewrap.start_job("acme", None).await.unwrap_err();
        assert!(matches!(err, KeyError::RewrapInProgress { job_id, .. } if job_id == first.id));
        f.rewrap.wait(first.id).await.unwrap();
        assert_eq!(f.rewrap.running_jobs().await, 0);
    }

    #[tokio::test]
    async fn rotation_is_refused_while_a_job_runs() {
        let f = fixture_with_delay(1, 200).await;
        seal(&f, &["a1", "a2", "a3", "a4", "a5"]).await;

        let (_, first) = f.rewrap.rotate_and_rewrap("acme", "bob", ROOT).await.unwrap();
        let err = f.rewrap.rotate_and_rewrap("acme", "bob", ROOT).await.unwrap_err();
        assert!(matches!(err, KeyError::RewrapInProgress { job_id, .. } if job_id == first.id));
        assert_eq!(f.tmk.active_record("acme").await.unwrap().key_version, 2);
        assert_eq!(f.rewrap.list_jobs().await.len(), 1);

        let first = f.rewrap.wait(first.id).await.unwrap();
        assert_eq!(first.status, JobStatus::Completed);

        let (current, second) = f.rewrap.rotate_and_rewrap("acme", "bob", ROOT).await.unwrap();
        assert_eq!(current.key_version, 3);
        assert_eq!(second.target_version, 3);
        let second = f.rewrap.wait(second.id).await.unwrap();
        assert_eq!(second.succeeded, 5);
        for id in ["a1", "a2", "a3", "a4", "a5"] {
            assert_eq!(f.metadata.get("acme", id).await.unwrap().tmk_version, 3);
        }
    }

    #[tokio::test]
    async fn source_version_is_the_oldest_version_migrated() {
        let f = fixture(10).await;
        seal(&f, &["a1", "a2"]).await;
        f.tmk.rotate_tmk("acme", "bob", ROOT).await.unwrap();
        seal(&f, &["a3"]).await;
        f.tmk.rotate_tmk("acme", "bob", ROOT).await.unwrap();

        let job = f.rewrap.start_job("acme", None).await.unwrap();
        assert_eq!((job.source_version, job.target_version), (2, 3));
        let job = f.rewrap.wait(job.id).await.unwrap();
        assert_eq!(job.succeeded, 3);
        assert_eq!(job.source_version, 1);
        assert_eq!(f.metadata.get("acme", "a1").await.unwrap().tmk_version, 3);
    }

    /// Counts directory listings made against the wrapped store.
    struct CountingMetadata {
        inner: Arc<FileMetadataStore>,
        listings: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl MetadataStore for CountingMetadata {
        async fn put(&self, meta: &ArtifactKeyMetadata) -> KeyResult<()> {
            self.inner.put(meta).await
        }

        async fn get(&self, tenant_id: &str, artifact_id: &str) -> KeyResult<ArtifactKeyMetadata> {
            self.inner.get(tenant_id, artifact_id).await
        }

        async fn count(&self, tenant_id: &str) -> KeyResult<u64> {
            self.inner.count(tenant_id).await
        }

        async fn page(
            &self,
            tenant_id: &str,
            after: Option<&str>,
            limit: usize,
        ) -> KeyResult<Vec<String>> {
            self.listings.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.page(tenant_id, after, limit).await
        }
    }

    #[tokio::test]
    async fn artifacts_are_listed_once_per_job() {
        let f = fixture(2).await;
        seal(&f, &["a1", "a2", "a3", "a4", "a5"]).await;
        f.tmk.rotate_tmk("acme", "bob", ROOT).await.unwrap();

        let counting = Arc::new(CountingMetadata {
            inner: f.metadata.clone(),
            listings: std::sync::atomic::AtomicUsize::new(0),
        });
        let settings = KeyringSettings {
            rewrap_batch_size: 2,
            rewrap_batch_delay_ms: 1,
            ..KeyringSettings::default()
        };
        let rewrap = RewrapService::new(
            f.tmk.clone(),
            counting.clone(),
            None,
            AuditLogger::spawn(Arc::new(CollectingSink::default()), 64),
            &settings,
        );

        let job = rewrap.start_job("acme", None).await.unwrap();
        let job = rewrap.wait(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.succeeded, 5);
        assert_eq!(job.cursor.as_deref(), Some("a5"));
        assert_eq!(counting.listings.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_stops_between_batches() {
        let f = fixture(1).await;
        let ids: Vec<String> = (0..20).map(|i| format!("a{i:02}")).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        seal(&f, &refs).await;
        f.tmk.rotate_tmk("acme", "bob", ROOT).await.unwrap();

        let job = f.rewrap.start_job("acme", None).await.unwrap();
        let cancelled = f.rewrap.cancel_job(job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        let job = f.rewrap.wait(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.completed_at.is_some());
        assert!(job.processed < 20, "cancelled job processed everything");

        // Cancelling a finished job is a no-op.
        assert_eq!(f.rewrap.cancel_job(job.id).await.unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let f = fixture(10).await;
        let id = Uuid::new_v4();
        assert!(matches!(f.rewrap.job_status(id).await, Err(KeyError::JobNotFound(j)) if j == id));
        assert!(matches!(f.rewrap.cancel_job(id).await, Err(KeyError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn start_without_tmk_fails() {
        let f = fixture(10).await;
        let err = f.rewrap.start_job("globex", None).await.unwrap_err();
        assert!(matches!(err, KeyError::NoActiveTmk(_)));
    }

    #[tokio::test]
    async fn tenant_without_artifacts_completes_immediately() {
        let f = fixture(10).await;
        f.tmk.rotate_tmk("acme", "bob", ROOT).await.unwrap();
        let job = f.rewrap.start_job("acme", Some("bob")).await.unwrap();
        let job = f.rewrap.wait(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.total, 0);
        assert_eq!(f.rewrap.list_jobs().await.len(), 1);
    }
}
