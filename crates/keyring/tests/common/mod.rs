#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use keyring::audit::StoreAuditSink;
use keyring::kms::MemoryKms;
use keyring::store::AuditStore;
use keyring::{
    ArtifactRef, AuditLogger, EncryptionService, FileMetadataStore, KeyAuditEntry, KeyCache,
    KeyringSettings, RewrapService, SqliteStore, TmkService,
};
use tempfile::TempDir;

pub const ROOT_KEY: &str = "alias/keyring-root";

pub struct Harness {
    pub store: Arc<SqliteStore>,
    pub kms: Arc<MemoryKms>,
    pub metadata: Arc<FileMetadataStore>,
    pub audit: AuditLogger,
    pub tmk: TmkService,
    pub encryption: EncryptionService,
    pub rewrap: RewrapService,
    pub settings: KeyringSettings,
    _dir: TempDir,
}

pub fn fast_settings(batch_size: usize) -> KeyringSettings {
    KeyringSettings {
        rewrap_batch_size: batch_size,
        rewrap_batch_delay_ms: 1,
        ..KeyringSettings::default()
    }
}

pub async fn harness(settings: KeyringSettings) -> Harness {
    let store = Arc::new(SqliteStore::in_memory().await.expect("open sqlite"));
    store.migrate().await.expect("migrate");
    let kms = Arc::new(MemoryKms::new().with_root_key(ROOT_KEY));
    let dir = tempfile::tempdir().expect("tempdir");
    let metadata = Arc::new(FileMetadataStore::new(dir.path()));
    let audit = AuditLogger::spawn(
        Arc::new(StoreAuditSink::new(store.clone())),
        settings.audit_queue_capacity,
    );
    let tmk = TmkService::new(
        store.clone(),
        kms.clone(),
        KeyCache::new(settings.cache_ttl()),
        audit.clone(),
    )
    .with_rotation_threshold(settings.rotation_threshold());
    let encryption = EncryptionService::new(kms.clone(), tmk.clone(), metadata.clone());
    let rewrap = RewrapService::new(
        tmk.clone(),
        metadata.clone(),
        Some(store.clone()),
        audit.clone(),
        &settings,
    );

    Harness {
        store,
        kms,
        metadata,
        audit,
        tmk,
        encryption,
        rewrap,
        settings,
        _dir: dir,
    }
}

impl Harness {
    /// A second re-wrap service over the same stores, as after a restart.
    pub fn restarted_rewrap(&self) -> RewrapService {
        RewrapService::new(
            self.tmk.clone(),
            self.metadata.clone(),
            Some(self.store.clone()),
            self.audit.clone(),
            &self.settings,
        )
    }

    /// Seal one small artifact per id under repository `repo`; returns the ciphertexts.
    pub async fn seal_all(&self, tenant: &str, repo: &str, ids: &[String]) -> Vec<Vec<u8>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let env = self
                .encryption
                .seal_artifact(&ArtifactRef::new(tenant, repo, id.as_str()), id.as_bytes())
                .await
                .expect("seal artifact");
            out.push(env.ciphertext);
        }
        out
    }

    /// Audit rows for `tenant`, polling until at least `n` are stored.
    pub async fn audit_rows(&self, tenant: &str, n: usize) -> Vec<KeyAuditEntry> {
        for _ in 0..400 {
            let rows = self.store.recent(tenant, 1000).await.expect("audit query");
            if rows.len() >= n {
                return rows;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.store.recent(tenant, 1000).await.expect("audit query")
    }
}

pub fn artifact_ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("artifact-{i:03}")).collect()
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
