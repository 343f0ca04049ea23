//! Tunables for the key services.
//!
//! The core reads no environment itself; the embedding binary deserialises or
//! builds a [`KeyringSettings`] and hands it over.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KeyringSettings {
    /// Lifetime of a cached plaintext key.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// How often expired cache entries are purged.
    #[serde(default = "default_cache_sweep_interval")]
    pub cache_sweep_interval_secs: u64,

    /// Age after which a TMK rotation is recommended.
    #[serde(default = "default_rotation_threshold")]
    pub rotation_threshold_days: i64,

    /// Artifacts per re-wrap page.
    #[serde(default = "default_rewrap_batch_size")]
    pub rewrap_batch_size: usize,

    /// Pause between re-wrap pages, bounding the KMS request rate.
    #[serde(default = "default_rewrap_batch_delay")]
    pub rewrap_batch_delay_ms: u64,

    /// Per-artifact failures kept in a job record.
    #[serde(default = "default_max_job_errors")]
    pub max_job_errors: usize,

    /// Pending audit entries held before the oldest is dropped.
    #[serde(default = "default_audit_queue_capacity")]
    pub audit_queue_capacity: usize,
}

fn default_cache_ttl() -> u64 {
    300
}
fn default_cache_sweep_interval() -> u64 {
    60
}
fn default_rotation_threshold() -> i64 {
    90
}
fn default_rewrap_batch_size() -> usize {
    100
}
fn default_rewrap_batch_delay() -> u64 {
    100
}
fn default_max_job_errors() -> usize {
    100
}
fn default_audit_queue_capacity() -> usize {
    1024
}

impl Default for KeyringSettings {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl(),
            cache_sweep_interval_secs: default_cache_sweep_interval(),
            rotation_threshold_days: default_rotation_threshold(),
            rewrap_batch_size: default_rewrap_batch_size(),
            rewrap_batch_delay_ms: default_rewrap_batch_delay(),
            max_job_errors: default_max_job_errors(),
            audit_queue_capacity: default_audit_queue_capacity(),
        }
    }
}

impl KeyringSettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_interval_secs)
    }

    pub fn rotation_threshold(&self) -> chrono::Duration {
        chrono::Duration::days(self.rotation_threshold_days)
    }

    pub fn rewrap_batch_delay(&self) -> Duration {
        Duration::from_millis(self.rewrap_batch_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_policy() {
        let s = KeyringSettings::default();
        assert_eq!(s.cache_ttl(), Duration::from_secs(300));
        assert_eq!(s.rotation_threshold(), chrono::Duration::days(90));
        assert_eq!(s.rewrap_batch_size, 100);
        assert_eq!(s.rewrap_batch_delay(), Duration::from_millis(100));
        assert_eq!(s.max_job_errors, 100);
        assert_eq!(s.audit_queue_capacity, 1024);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let s: KeyringSettings = serde_json::from_str(r#"{"rewrap_batch_size": 10}"#).unwrap();
        assert_eq!(s.rewrap_batch_size, 10);
        assert_eq!(s.cache_sweep_interval_secs, 60);
    }
}
