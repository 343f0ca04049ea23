//! Configuration loading and validation for the keyring admin service.
//!
//! All values are read from environment variables at startup. The process will
//! exit with a clear error message if any required variable is missing or invalid.

use anyhow::{Context, Result};
use keyring::KeyringSettings;
use serde::Deserialize;

/// Which KMS implementation wraps tenant master keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KmsBackend {
    Aws,
    /// Process-local root keys. Key material is lost on restart; local use only.
    Memory,
}

/// Validated service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// SQLite URL of the key store, e.g. `sqlite:///var/lib/keyring/keys.db`.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Directory holding per-artifact key metadata records. **Required.**
    pub metadata_root: String,

    /// Root KMS key id or alias wrapping every TMK. **Required.**
    pub kms_key_id: String,

    #[serde(default = "default_kms_backend")]
    pub kms_backend: KmsBackend,

    /// Explicit KMS endpoint (VPC endpoint or local emulator).
    #[serde(default)]
    pub kms_endpoint: Option<String>,

    /// Port the admin HTTP server listens on.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// OTLP/gRPC collector endpoint. Spans are only exported when set.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_cache_sweep_interval")]
    pub cache_sweep_interval_secs: u64,

    #[serde(default = "default_rotation_threshold")]
    pub rotation_threshold_days: i64,

    #[serde(default = "default_rewrap_batch_size")]
    pub rewrap_batch_size: usize,

    #[serde(default = "default_rewrap_batch_delay")]
    pub rewrap_batch_delay_ms: u64,

    #[serde(default = "default_max_job_errors")]
    pub max_job_errors: usize,

    #[serde(default = "default_audit_queue_capacity")]
    pub audit_queue_capacity: usize,
}

fn default_database_url() -> String {
    "sqlite://keyring.db".into()
}
fn default_kms_backend() -> KmsBackend {
    KmsBackend::Aws
}
fn default_listen_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".into()
}
fn default_cache_ttl() -> u64 {
    KeyringSettings::default().cache_ttl_secs
}
fn default_cache_sweep_interval() -> u64 {
    KeyringSettings::default().cache_sweep_interval_secs
}
fn default_rotation_threshold() -> i64 {
    KeyringSettings::default().rotation_threshold_days
}
fn default_rewrap_batch_size() -> usize {
    KeyringSettings::default().rewrap_batch_size
}
fn default_rewrap_batch_delay() -> u64 {
    KeyringSettings::default().rewrap_batch_delay_ms
}
fn default_max_job_errors() -> usize {
    KeyringSettings::default().max_job_errors
}
fn default_audit_queue_capacity() -> usize {
    KeyringSettings::default().audit_queue_capacity
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any required variable is absent or cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default().try_parsing(true))
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Tunables handed to the key services.
    pub fn keyring_settings(&self) -> KeyringSettings {
        KeyringSettings {
            cache_ttl_secs: self.cache_ttl_secs,
            cache_sweep_interval_secs: self.cache_sweep_interval_secs,
            rotation_threshold_days: self.rotation_threshold_days,
            rewrap_batch_size: self.rewrap_batch_size,
            rewrap_batch_delay_ms: self.rewrap_batch_delay_ms,
            max_job_errors: self.max_job_errors,
            audit_queue_capacity: self.audit_queue_capacity,
        }
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.database_url, "DATABASE_URL")?;
        ensure_non_empty(&self.metadata_root, "METADATA_ROOT")?;
        ensure_non_empty(&self.kms_key_id, "KMS_KEY_ID")?;
        if let Some(endpoint) = &self.otel_exporter_otlp_endpoint {
            ensure_non_empty(endpoint, "OTEL_EXPORTER_OTLP_ENDPOINT")?;
        }

        if self.cache_sweep_interval_secs == 0 {
            anyhow::bail!("CACHE_SWEEP_INTERVAL_SECS must be > 0");
        }
        if self.rotation_threshold_days <= 0 {
            anyhow::bail!("ROTATION_THRESHOLD_DAYS must be > 0");
        }
        if self.rewrap_batch_size == 0 {
            anyhow::bail!("REWRAP_BATCH_SIZE must be > 0");
        }
        if self.audit_queue_capacity == 0 {
            anyhow::bail!("AUDIT_QUEUE_CAPACITY must be > 0");
        }
        Ok(())
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}
