//! Symmetric primitives for the key hierarchy.
//!
//! This module is free of KMS, storage and async dependencies. It provides:
//!
//! - [`KeyBytes`]: zero-on-drop 32-byte key buffers and [`KeyType`] tags.
//! - [`cipher`]: AES-256-GCM-SIV sealing of payloads and wrapping of keys.
//! - [`kdf`]: HKDF-SHA256 derivation of KEKs from a TMK.
//!
//! # Hierarchy
//!
//! ```text
//! root KMS key ──wraps──▶ TMK (per tenant, versioned)
//!                           │ HKDF(context = repository)
//!                           ▼
//!                          KEK ──wraps──▶ DEK (per artifact) ──seals──▶ payload
//! ```

pub mod cipher;
pub mod kdf;
pub mod keys;

pub use cipher::{CipherError, ALGORITHM, NONCE_LEN};
pub use kdf::{derive_kek, kek_context, kek_label};
pub use keys::{KeyBytes, KeyType, KEY_LEN};
