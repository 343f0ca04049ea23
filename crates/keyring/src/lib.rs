//! Tenant envelope encryption and key lifecycle.
//!
//! Three-tier hierarchy: a root key held by the KMS wraps each tenant's
//! master key (TMK); per-repository KEKs are derived from the TMK; each
//! artifact is sealed under its own random DEK wrapped by a KEK. Rotating a
//! TMK never re-encrypts artifact bytes: the [`rewrap`] service only rewrites
//! each artifact's small key metadata record.
//!
//! # Modules
//!
//! | module | role |
//! |---|---|
//! | [`kms`] | KMS boundary (`KmsClient`), AWS and in-memory implementations |
//! | [`cache`] | TTL cache of plaintext keys |
//! | [`crypto`] | AES-256-GCM-SIV sealing/wrapping, HKDF KEK derivation |
//! | [`encryption`] | Artifact envelope encryption |
//! | [`tmk`] | TMK create / fetch / rotate / status / export |
//! | [`rewrap`] | Background re-wrap jobs |
//! | [`metadata`] | Per-artifact key metadata records |
//! | [`store`] | SQLite persistence for TMKs, audit log and jobs |
//! | [`audit`] | Non-blocking audit pipeline |

pub mod audit;
pub mod cache;
pub mod crypto;
pub mod encryption;
pub mod error;
pub mod kms;
pub mod metadata;
pub mod rewrap;
pub mod settings;
pub mod store;
pub mod tmk;

pub use audit::{AuditLogger, AuditSink, KeyAuditEntry, KeyOperation};
pub use cache::KeyCache;
pub use crypto::{KeyBytes, KeyType};
pub use encryption::{ArtifactRef, EncryptionService, Envelope, KekReference};
pub use error::{KeyError, KeyResult};
pub use kms::{KmsClient, KmsError};
pub use metadata::{ArtifactKeyMetadata, FileMetadataStore, MetadataStore};
pub use rewrap::{JobStatus, RewrapJob, RewrapService};
pub use settings::KeyringSettings;
pub use store::{SqliteStore, TmkRecord};
pub use tmk::{TmkBackup, TmkService, TmkStatus};
