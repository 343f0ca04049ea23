//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use keyring::{RewrapService, SqliteStore, TmkService};

/// Application state shared across all request handlers.
///
/// All fields are cheaply cloneable (`Arc`-backed service handles) so that
/// Axum can clone the state for each request without copying expensive data.
#[derive(Clone)]
pub struct AppState {
    pub tmk: TmkService,
    pub rewrap: RewrapService,
    /// Probed by `/health`.
    pub store: Arc<SqliteStore>,
    /// Root KMS key new TMK versions are wrapped under.
    pub root_key_id: Arc<String>,
}

impl AppState {
    pub fn new(
        tmk: TmkService,
        rewrap: RewrapService,
        store: Arc<SqliteStore>,
        root_key_id: impl Into<String>,
    ) -> Self {
        Self {
            tmk,
            rewrap,
            store,
            root_key_id: Arc::new(root_key_id.into()),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use keyring::kms::MemoryKms;
    use keyring::{
        AuditLogger, FileMetadataStore, KeyCache, KeyringSettings, RewrapService, SqliteStore,
        TmkService,
    };

    use super::AppState;

    pub const ROOT_KEY: &str = "alias/keyring-root";

    /// State over in-memory SQLite, an in-memory KMS and a temporary metadata root.
    pub async fn state() -> (AppState, tempfile::TempDir) {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        store.migrate().await.unwrap();
        let kms = Arc::new(MemoryKms::new().with_root_key(ROOT_KEY));
        let dir = tempfile::tempdir().unwrap();
        let metadata = Arc::new(FileMetadataStore::new(dir.path()));
        let settings = KeyringSettings::default();
        let audit = AuditLogger::disabled();
        let tmk = TmkService::new(
            store.clone(),
            kms,
            KeyCache::new(settings.cache_ttl()),
            audit.clone(),
        );
        let rewrap = RewrapService::new(tmk.clone(), metadata, Some(store.clone()), audit, &settings);
        (AppState::new(tmk, rewrap, store, ROOT_KEY), dir)
    }
}
