use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("decryption failed (authentication tag mismatch, wrong key or truncated data)")]
    DecryptionFailure,

    #[error("encryption failed: {0}")]
    EncryptionFailure(String),

    #[error("corrupt record at {path}: {reason}")]
    CorruptRecord { path: PathBuf, reason: String },

    #[error("record not found: {collection}/{entity_id}")]
    NotFound {
        collection: String,
        entity_id: String,
    },

    #[error("invalid bundle format: {0}")]
    InvalidBundleFormat(String),

    #[error("encryption key unavailable or does not match this vault: {0}")]
    KeyLoss(String),

    #[error("invalid entity id {0:?}")]
    InvalidEntityId(String),

    #[error("unknown collection {0:?}")]
    UnknownCollection(String),

    #[error("collection {0} is managed internally and cannot be written directly")]
    ReservedCollection(String),

    #[error("unknown platform profile {0:?}")]
    UnknownProfile(String),

    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    #[error("serialisation error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Task(String),
}

impl VaultError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        VaultError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for errors that mean "there is nothing readable here", which
    /// export treats as an absent component.
    pub fn is_absent(&self) -> bool {
        matches!(
            self,
            VaultError::NotFound { .. } | VaultError::CorruptRecord { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;

/// Attach a path to a raw `std::io::Error`.
pub(crate) trait IoContext<T> {
    fn at(self, path: &std::path::Path) -> Result<T>;
}

impl<T> IoContext<T> for std::result::Result<T, std::io::Error> {
    fn at(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|e| VaultError::io(path, e))
    }
}
