//! vault-core: encrypted, queue-driven entity vault
//!
//! # Layout
//! One directory per collection, one JSON record per entity, each record's
//! payload sealed with XChaCha20-Poly1305 (or AES-256-GCM on the standard
//! tier) under a single vault key. Every durable write goes through a
//! staging file and an atomic rename.
//!
//! # Flow
//! Callers enqueue updates; a drain pass checksums, encrypts and persists
//! them in order, then drops an immutable mirror checkpoint per write.
//! Whole entities can be exported as fork bundles and re-imported under a
//! new id, on this vault or another one.

pub mod bundle;
pub mod checkpoint;
pub mod crypto;
pub mod dispatcher;
pub mod engine;
pub mod error;
mod fsutil;
pub mod journal;
pub mod paths;
pub mod profile;
pub mod settings;
pub mod store;

pub use bundle::{ComponentCheckpointError, ExportBundle, ExportOptions, ImportOutcome};
pub use crypto::{CipherAlgorithm, CryptoCodec, EncryptedPayload, VaultKey};
pub use dispatcher::{DrainSummary, EnqueueReceipt, SyncItem};
pub use engine::{KeySource, VaultEngine};
pub use error::{Result, VaultError};
pub use paths::{Collection, VaultLayout};
pub use profile::{PlatformProfile, ProfileOverrides};
pub use settings::EngineSettings;

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
