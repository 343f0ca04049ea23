//! JSON metadata records on the local filesystem.
//!
//! Layout: `<root>/<tenant>/<artifact>.keymeta.json`. Writes go to a hidden
//! temporary file in the same directory, are fsynced, then renamed over the
//! target, so a reader sees either the previous record or the new one. The
//! directory is fsynced after the rename so the new entry survives a crash.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{validate_identifier, ArtifactKeyMetadata, MetadataStore};
use crate::error::{KeyError, KeyResult};

const SUFFIX: &str = ".keymeta.json";

#[derive(Debug, Clone)]
pub struct FileMetadataStore {
    root: PathBuf,
}

impl FileMetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tenant_dir(&self, tenant_id: &str) -> KeyResult<PathBuf> {
        validate_identifier(tenant_id)?;
        Ok(self.root.join(tenant_id))
    }

    /// Path of the record for `artifact_id` of `tenant_id`.
    pub fn record_path(&self, tenant_id: &str, artifact_id: &str) -> KeyResult<PathBuf> {
        validate_identifier(artifact_id)?;
        Ok(self.tenant_dir(tenant_id)?.join(format!("{artifact_id}{SUFFIX}")))
    }

    /// Sorted artifact ids for a tenant; empty if the tenant has no directory.
    async fn artifact_ids(&self, tenant_id: &str) -> KeyResult<Vec<String>> {
        let dir = self.tenant_dir(tenant_id)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(KeyError::MetadataIo { path: dir, source }),
        };

        let mut ids = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => return Err(KeyError::MetadataIo { path: dir, source }),
            };
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if let Some(id) = name.strip_suffix(SUFFIX) {
                ids.push(id.to_owned());
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

/// Flush a directory's entries, making a completed rename durable.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir).await?.sync_all().await
}

/// Directories cannot be opened for syncing here; the rename is left to the
/// filesystem.
#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl MetadataStore for FileMetadataStore {
    async fn put(&self, meta: &ArtifactKeyMetadata) -> KeyResult<()> {
        let path = self.record_path(&meta.tenant_id, &meta.artifact_id)?;
        let dir = self.tenant_dir(&meta.tenant_id)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| KeyError::MetadataIo { path: dir.clone(), source })?;

        let body = serde_json::to_vec_pretty(meta)
            .map_err(|e| KeyError::Malformed(format!("encode key metadata: {e}")))?;

        let tmp = dir.join(format!(".{}{SUFFIX}.{}.tmp", meta.artifact_id, Uuid::new_v4()));
        if let Err(source) = write_synced(&tmp, &body).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(KeyError::MetadataIo { path: tmp, source });
        }
        if let Err(source) = fs::rename(&tmp, &path).await {
            if let Err(e) = fs::remove_file(&tmp).await {
                warn!(path = %tmp.display(), error = %e, "failed to remove temporary metadata file");
            }
            return Err(KeyError::MetadataIo { path, source });
        }
        sync_dir(&dir)
            .await
            .map_err(|source| KeyError::MetadataIo { path: dir.clone(), source })?;

        debug!(
            tenant = %meta.tenant_id,
            artifact = %meta.artifact_id,
            tmk_version = meta.tmk_version,
            "key metadata written"
        );
        Ok(())
    }

    async fn get(&self, tenant_id: &str, artifact_id: &str) -> KeyResult<ArtifactKeyMetadata> {
        let path = self.record_path(tenant_id, artifact_id)?;
        let body = match fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(KeyError::MetadataNotFound {
                    tenant: tenant_id.to_owned(),
                    artifact: artifact_id.to_owned(),
                })
            }
            Err(source) => return Err(KeyError::MetadataIo { path, source }),
        };
        serde_json::from_slice(&body)
            .map_err(|e| KeyError::Malformed(format!("{}: {e}", path.display())))
    }

    async fn count(&self, tenant_id: &str) -> KeyResult<u64> {
        Ok(self.artifact_ids(tenant_id).await?.len() as u64)
    }

    async fn page(
        &self,
        tenant_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> KeyResult<Vec<String>> {
        let ids = self.artifact_ids(tenant_id).await?;
        let start = match after {
            Some(cursor) => ids.partition_point(|id| id.as_str() <= cursor),
            None => 0,
        };
        Ok(ids.into_iter().skip(start).take(limit).collect())
    }
}
