//! Disaster-recovery export of a TMK in its KMS-wrapped form.
//!
//! The encoded string is URL-safe base64 of a JSON document. It carries the
//! wrapped key, its version and the root key reference needed to unwrap it;
//! it never carries plaintext.

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{KeyError, KeyResult};
use crate::store::TmkRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TmkBackup {
    pub tenant_id: String,
    pub key_version: u32,
    pub kms_key_id: String,
    /// Standard base64 of the KMS ciphertext.
    pub encrypted_key: String,
    pub exported_at: DateTime<Utc>,
}

impl TmkBackup {
    pub fn from_record(record: &TmkRecord) -> Self {
        Self {
            tenant_id: record.tenant_id.clone(),
            key_version: record.key_version,
            kms_key_id: record.kms_key_id.clone(),
            encrypted_key: STANDARD.encode(&record.encrypted_key),
            exported_at: Utc::now(),
        }
    }

    pub fn encode(&self) -> KeyResult<String> {
        let json = serde_json::to_vec(self)
            .map_err(|e| KeyError::Malformed(format!("encode tmk backup: {e}")))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Parse a string produced by [`TmkBackup::encode`].
    pub fn decode(encoded: &str) -> KeyResult<Self> {
        let json = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| KeyError::Malformed(format!("tmk backup encoding: {e}")))?;
        serde_json::from_slice(&json)
            .map_err(|e| KeyError::Malformed(format!("tmk backup body: {e}")))
    }

    /// The KMS ciphertext, ready to hand back to the KMS for unwrapping.
    pub fn wrapped_key(&self) -> KeyResult<Vec<u8>> {
        STANDARD
            .decode(&self.encrypted_key)
            .map_err(|e| KeyError::Malformed(format!("tmk backup key: {e}")))
    }
}
