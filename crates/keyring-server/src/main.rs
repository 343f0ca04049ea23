//! `keyring-server`: operator admin service entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise the telemetry pipeline (tracing + optional OTLP).
//! 3. Open the SQLite key store and apply migrations.
//! 4. Build the KMS client (AWS or in-memory).
//! 5. Wire the key cache, audit pipeline and key services.
//! 6. Resume re-wrap jobs interrupted by the previous shutdown.
//! 7. Build the Axum router and serve until SIGINT.

mod config;
mod server;
mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use keyring::audit::StoreAuditSink;
use keyring::kms::{AwsKms, MemoryKms};
use keyring::{
    cache, AuditLogger, FileMetadataStore, KeyCache, KmsClient, RewrapService, SqliteStore,
    TmkService,
};
use tracing::{info, warn};

use config::{Config, KmsBackend};
use server::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;
    let settings = cfg.keyring_settings();

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init_telemetry(cfg.otel_exporter_otlp_endpoint.as_deref(), &cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen_port = cfg.listen_port,
        kms_backend = ?cfg.kms_backend,
        "keyring-server starting"
    );

    // -----------------------------------------------------------------------
    // 3. Key store
    // -----------------------------------------------------------------------
    let store = Arc::new(
        SqliteStore::connect(&cfg.database_url)
            .await
            .context("failed to open key store")?,
    );
    store.migrate().await.context("failed to migrate key store")?;

    tokio::fs::create_dir_all(&cfg.metadata_root)
        .await
        .with_context(|| format!("failed to create metadata root {}", cfg.metadata_root))?;
    let metadata = Arc::new(FileMetadataStore::new(&cfg.metadata_root));

    // -----------------------------------------------------------------------
    // 4. KMS client
    // -----------------------------------------------------------------------
    let kms: Arc<dyn KmsClient> = match cfg.kms_backend {
        KmsBackend::Aws => Arc::new(AwsKms::init(cfg.kms_endpoint.as_deref()).await),
        KmsBackend::Memory => {
            warn!("in-memory KMS selected; wrapped keys will not survive a restart");
            Arc::new(MemoryKms::new().with_root_key(cfg.kms_key_id.clone()))
        }
    };

    // -----------------------------------------------------------------------
    // 5. Services and background tasks
    // -----------------------------------------------------------------------
    let key_cache = KeyCache::new(settings.cache_ttl());
    let _sweeper = cache::sweep_task(key_cache.clone(), settings.cache_sweep_interval());

    let audit = AuditLogger::spawn(
        Arc::new(StoreAuditSink::new(store.clone())),
        settings.audit_queue_capacity,
    );
    let tmk = TmkService::new(store.clone(), kms, key_cache, audit.clone())
        .with_rotation_threshold(settings.rotation_threshold());
    let rewrap = RewrapService::new(
        tmk.clone(),
        metadata,
        Some(store.clone()),
        audit.clone(),
        &settings,
    );

    // -----------------------------------------------------------------------
    // 6. Interrupted jobs
    // -----------------------------------------------------------------------
    let resumed = rewrap
        .resume_incomplete()
        .await
        .context("failed to load interrupted re-wrap jobs")?;
    if !resumed.is_empty() {
        info!(count = resumed.len(), "resumed interrupted re-wrap jobs");
    }

    // -----------------------------------------------------------------------
    // 7. HTTP server
    // -----------------------------------------------------------------------
    let state = AppState::new(tmk, rewrap, store, cfg.kms_key_id.clone());
    let router = server::router::build(state);

    let addr: std::net::SocketAddr = ([0, 0, 0, 0], cfg.listen_port).into();
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if audit.dropped() > 0 {
        warn!(dropped = audit.dropped(), "audit entries were dropped under load");
    }
    telemetry::shutdown_telemetry();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
