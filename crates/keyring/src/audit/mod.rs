//! Append-only audit trail of key operations.
//!
//! Every generate, access, rotate, export and re-wrap produces a
//! [`KeyAuditEntry`]. Entries are handed to an [`AuditLogger`], which never
//! blocks the operation it describes: the entry is queued and a single writer
//! task forwards it to the configured [`AuditSink`].
//!
//! Audit records identify keys by label and version only. They never contain
//! key material, wrapped or plain.

pub mod logger;
pub mod sink;

pub use logger::AuditLogger;
pub use sink::{AuditSink, StoreAuditSink, TracingAuditSink};

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::KeyType;

/// Kind of key operation being audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyOperation {
    Generate,
    Access,
    Rotate,
    Export,
    RewrapStarted,
    Rewrap,
    RewrapFailed,
}

impl KeyOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyOperation::Generate => "generate",
            KeyOperation::Access => "access",
            KeyOperation::Rotate => "rotate",
            KeyOperation::Export => "export",
            KeyOperation::RewrapStarted => "rewrap_started",
            KeyOperation::Rewrap => "rewrap",
            KeyOperation::RewrapFailed => "rewrap_failed",
        }
    }
}

impl fmt::Display for KeyOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "generate" => KeyOperation::Generate,
            "access" => KeyOperation::Access,
            "rotate" => KeyOperation::Rotate,
            "export" => KeyOperation::Export,
            "rewrap_started" => KeyOperation::RewrapStarted,
            "rewrap" => KeyOperation::Rewrap,
            "rewrap_failed" => KeyOperation::RewrapFailed,
            other => return Err(format!("unknown key operation: {other}")),
        })
    }
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyAuditEntry {
    pub id: Uuid,
    pub tenant_id: String,
    /// `None` for system-initiated actions (cache misses, re-wrap workers).
    pub user_id: Option<String>,
    pub key_type: KeyType,
    pub key_id: String,
    pub operation: KeyOperation,
    pub success: bool,
    pub error: Option<String>,
    /// Free-form context such as `old_kek=… new_kek=…`.
    pub details: Option<String>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl KeyAuditEntry {
    /// A successful entry with no user, details or duration yet.
    pub fn new(
        tenant_id: impl Into<String>,
        key_type: KeyType,
        key_id: impl Into<String>,
        operation: KeyOperation,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            user_id: None,
            key_type,
            key_id: key_id.into(),
            operation,
            success: true,
            error: None,
            details: None,
            duration_ms: 0,
            created_at: Utc::now(),
        }
    }

    pub fn by(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn failed(mut self, error: impl fmt::Display) -> Self {
        self.success = false;
        self.error = Some(error.to_string());
        self
    }

    /// Record the outcome of `result`: failure text on `Err`, success otherwise.
    pub fn outcome<T, E: fmt::Display>(self, result: &Result<T, E>) -> Self {
        match result {
            Ok(_) => self,
            Err(e) => self.failed(e),
        }
    }

    pub fn took(mut self, elapsed: Duration) -> Self {
        self.duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let entry = KeyAuditEntry::new("acme", KeyType::Tmk, "tmk-acme-v1", KeyOperation::Rotate)
            .by("alice")
            .took(Duration::from_millis(42))
            .with_details("v1 -> v2");
        assert!(entry.success);
        assert_eq!(entry.user_id.as_deref(), Some("alice"));
        assert_eq!(entry.duration_ms, 42);
        assert_eq!(entry.details.as_deref(), Some("v1 -> v2"));
    }

    #[test]
    fn outcome_records_error_text() {
        let res: Result<(), String> = Err("kms unreachable".into());
        let entry = KeyAuditEntry::new("acme", KeyType::Tmk, "k", KeyOperation::Access).outcome(&res);
        assert!(!entry.success);
        assert_eq!(entry.error.as_deref(), Some("kms unreachable"));
    }

    #[test]
    fn operation_round_trips_through_str() {
        for op in [
            KeyOperation::Generate,
            KeyOperation::Access,
            KeyOperation::Rotate,
            KeyOperation::Export,
            KeyOperation::RewrapStarted,
            KeyOperation::Rewrap,
            KeyOperation::RewrapFailed,
        ] {
            assert_eq!(op.as_str().parse::<KeyOperation>().unwrap(), op);
        }
    }

    #[test]
    fn operation_serialises_snake_case() {
        let json = serde_json::to_string(&KeyOperation::RewrapStarted).unwrap();
        assert_eq!(json, "\"rewrap_started\"");
    }
}
