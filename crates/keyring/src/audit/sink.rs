//! Audit sinks: where the writer task delivers entries.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::KeyAuditEntry;
use crate::error::KeyResult;
use crate::store::AuditStore;

/// Destination for audit entries.
#[async_trait]
pub trait AuditSink: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, entry: &KeyAuditEntry) -> KeyResult<()>;
}

/// Appends entries to the `key_audit_log` table.
pub struct StoreAuditSink {
    store: Arc<dyn AuditStore>,
}

impl StoreAuditSink {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AuditSink for StoreAuditSink {
    fn name(&self) -> &str {
        "store"
    }

    async fn publish(&self, entry: &KeyAuditEntry) -> KeyResult<()> {
        self.store.append(entry).await
    }
}

/// Emits each entry as a structured `tracing` event on the `keyring::audit` target.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn publish(&self, entry: &KeyAuditEntry) -> KeyResult<()> {
        info!(
            target: "keyring::audit",
            audit_id = %entry.id,
            tenant = %entry.tenant_id,
            user = entry.user_id.as_deref().unwrap_or("system"),
            key_type = %entry.key_type,
            key_id = %entry.key_id,
            operation = %entry.operation,
            success = entry.success,
            error = entry.error.as_deref(),
            details = entry.details.as_deref(),
            duration_ms = entry.duration_ms,
            "key operation"
        );
        Ok(())
    }
}
