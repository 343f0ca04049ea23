//! In-memory KMS for tests and local development.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use zeroize::Zeroizing;

use super::{DataKey, KmsClient, KmsError};
use crate::crypto::cipher::{self, NONCE_LEN};
use crate::crypto::KeyBytes;

/// [`KmsClient`] backed by root keys held in process memory.
///
/// Ciphertexts are `nonce || AES-256-GCM-SIV(root key, plaintext)`, so a blob
/// decrypted under the wrong root key fails authentication just as it would in
/// a real KMS. Fault switches let tests simulate outages and revoked access.
#[derive(Debug, Default)]
pub struct MemoryKms {
    keys: RwLock<HashMap<String, KeyBytes>>,
    denied: RwLock<HashSet<String>>,
    unavailable: AtomicBool,
    failing_decrypts: AtomicUsize,
    encrypt_calls: AtomicUsize,
    decrypt_calls: AtomicUsize,
}

impl MemoryKms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`MemoryKms::add_root_key`].
    pub fn with_root_key(mut self, key_id: impl Into<String>) -> Self {
        self.keys.get_mut().insert(key_id.into(), KeyBytes::generate());
        self
    }

    /// Create a new random root key under `key_id`, replacing any existing one.
    pub async fn add_root_key(&self, key_id: impl Into<String>) {
        self.keys
            .write()
            .await
            .insert(key_id.into(), KeyBytes::generate());
    }

    /// While `true`, every call fails with [`KmsError::Transient`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make the next `count` decrypt calls fail with [`KmsError::Transient`].
    pub fn fail_next_decrypts(&self, count: usize) {
        self.failing_decrypts.store(count, Ordering::SeqCst);
    }

    /// Deny all use of `key_id` until [`MemoryKms::restore_access`] is called.
    pub async fn deny_access(&self, key_id: &str) {
        self.denied.write().await.insert(key_id.to_owned());
    }

    pub async fn restore_access(&self, key_id: &str) {
        self.denied.write().await.remove(key_id);
    }

    pub fn encrypt_calls(&self) -> usize {
        self.encrypt_calls.load(Ordering::SeqCst)
    }

    pub fn decrypt_calls(&self) -> usize {
        self.decrypt_calls.load(Ordering::SeqCst)
    }

    async fn root_key(&self, key_id: &str) -> Result<KeyBytes, KmsError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(KmsError::Transient("memory KMS marked unavailable".into()));
        }
        if self.denied.read().await.contains(key_id) {
            return Err(KmsError::AccessDenied(key_id.to_owned()));
        }
        self.keys
            .read()
            .await
            .get(key_id)
            .cloned()
            .ok_or_else(|| KmsError::KeyNotFound(key_id.to_owned()))
    }

    fn take_injected_decrypt_failure(&self) -> bool {
        self.failing_decrypts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl KmsClient for MemoryKms {
    async fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, KmsError> {
        self.encrypt_calls.fetch_add(1, Ordering::SeqCst);
        let root = self.root_key(key_id).await?;
        let sealed = cipher::seal(&root, plaintext)
            .map_err(|e| KmsError::InvalidResponse(e.to_string()))?;
        let mut blob = Vec::with_capacity(NONCE_LEN + sealed.ciphertext.len());
        blob.extend_from_slice(&sealed.nonce);
        blob.extend_from_slice(&sealed.ciphertext);
        Ok(blob)
    }

    async fn decrypt(
        &self,
        key_id: &str,
        ciphertext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, KmsError> {
        self.decrypt_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_injected_decrypt_failure() {
            return Err(KmsError::Transient("injected decrypt failure".into()));
        }
        let root = self.root_key(key_id).await?;
        if ciphertext.len() < NONCE_LEN {
            return Err(KmsError::InvalidCiphertext("blob shorter than nonce".into()));
        }
        let (nonce, body) = ciphertext.split_at(NONCE_LEN);
        cipher::open(&root, nonce, body)
            .map(Zeroizing::new)
            .map_err(|_| KmsError::InvalidCiphertext(format!("not decryptable under {key_id}")))
    }

    async fn generate_data_key(&self, key_id: &str) -> Result<DataKey, KmsError> {
        let key = KeyBytes::generate();
        let ciphertext = self.encrypt(key_id, key.as_bytes()).await?;
        Ok(DataKey {
            plaintext: Zeroizing::new(key.as_bytes().to_vec()),
            ciphertext,
        })
    }
}
