//! Per-collection, per-entity encrypted records and their collection indexes.
//!
//! Writes go record first, index second, each through an atomic rename. An
//! index entry therefore never points at a record that failed to land; a
//! crash between the two leaves an unindexed record, which `rebuild_index`
//! (run on every open) picks up again.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::crypto::{CryptoCodec, EncryptedPayload};
use crate::error::{IoContext, Result, VaultError};
use crate::fsutil::{
    cleanup_staging_dir, read_json, restrict_dir_permissions, write_json_atomic, write_json_new,
};
use crate::now_millis;
use crate::paths::{validate_entity_id, Collection, VaultLayout, INDEX_FILE};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VaultRecord {
    pub last_updated: i64,
    pub entity_id: String,
    pub encrypted: EncryptedPayload,
    /// Checksum of the plaintext payload.
    pub checksum: String,
    #[serde(default)]
    pub protected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_bundle: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl VaultRecord {
    /// Overlay `incoming` on `existing`. The encrypted block and checksum are
    /// always taken whole from `incoming`; provenance survives unless the
    /// new write brings its own.
    fn merge(existing: Option<VaultRecord>, mut incoming: VaultRecord) -> VaultRecord {
        let Some(old) = existing else {
            return incoming;
        };
        if incoming.imported_from.is_none() {
            incoming.imported_from = old.imported_from;
            incoming.imported_at = old.imported_at;
            incoming.source_bundle = old.source_bundle;
        }
        let mut metadata = old.metadata;
        metadata.append(&mut incoming.metadata);
        incoming.metadata = metadata;
        incoming
    }

    pub fn provenance(&self) -> Option<Provenance> {
        let imported_from = self.imported_from.clone()?;
        Some(Provenance {
            imported_from,
            imported_at: self.imported_at.unwrap_or_default(),
            source_bundle: self.source_bundle.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub imported_from: String,
    pub imported_at: i64,
    pub source_bundle: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub protected: bool,
    pub provenance: Option<Provenance>,
    pub metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub last_sync: i64,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionIndex {
    pub created: i64,
    #[serde(rename = "type")]
    pub kind: Collection,
    pub entries: BTreeMap<String, IndexEntry>,
}

impl CollectionIndex {
    fn new(kind: Collection) -> Self {
        Self {
            created: now_millis(),
            kind,
            entries: BTreeMap::new(),
        }
    }
}

/// A record together with its decrypted payload.
#[derive(Debug, Clone)]
pub struct DecryptedRecord {
    pub collection: Collection,
    pub record: VaultRecord,
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub added: Vec<String>,
    pub dropped: Vec<String>,
}

impl RebuildReport {
    pub fn is_clean(&self) -> bool {
        self.added.is_empty() && self.dropped.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProblemKind {
    MissingRecord,
    Corrupt,
    Undecryptable,
    ChecksumMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyProblem {
    pub collection: Collection,
    pub entity_id: String,
    pub kind: ProblemKind,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub checked: usize,
    pub problems: Vec<VerifyProblem>,
}

pub struct VaultStore {
    layout: VaultLayout,
    codec: Arc<CryptoCodec>,
    index_lock: Mutex<()>,
}

impl VaultStore {
    pub fn new(layout: VaultLayout, codec: Arc<CryptoCodec>) -> Self {
        Self {
            layout,
            codec,
            index_lock: Mutex::new(()),
        }
    }

    pub fn layout(&self) -> &VaultLayout {
        &self.layout
    }

    pub fn codec(&self) -> &Arc<CryptoCodec> {
        &self.codec
    }

    /// Hold the index lock so writes stall after their record lands.
    #[cfg(test)]
    pub(crate) fn lock_index(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.index_lock.lock()
    }

    /// Create collection directories and empty indexes. Existing indexes are
    /// left alone, so this is safe to run on every start.
    pub fn init(&self) -> Result<()> {
        let root = self.layout.root();
        fs::create_dir_all(root).at(root)?;
        restrict_dir_permissions(root);
        for dir in [
            self.layout.staging_dir(),
            self.layout.exports_dir(),
            self.layout.imports_dir(),
        ] {
            fs::create_dir_all(&dir).at(&dir)?;
        }
        let orphans = cleanup_staging_dir(&self.layout.staging_dir());
        if orphans > 0 {
            info!(orphans, "cleaned staging area from interrupted writes");
        }
        for collection in Collection::ALL {
            let dir = self.layout.collection_dir(collection);
            fs::create_dir_all(&dir).at(&dir)?;
            let index_path = self.layout.index(collection);
            if !index_path.exists() {
                match write_json_new(&index_path, &CollectionIndex::new(collection)) {
                    Ok(()) => debug!(%collection, "created collection index"),
                    // Lost a race with another initialiser; theirs stands.
                    Err(VaultError::Io { source, .. })
                        if source.kind() == std::io::ErrorKind::AlreadyExists => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    pub fn put(
        &self,
        collection: Collection,
        entity_id: &str,
        payload: &Value,
        options: WriteOptions,
    ) -> Result<VaultRecord> {
        Self::check_writable(collection, entity_id)?;
        let checksum = self.codec.checksum(payload)?;
        let encrypted = self.codec.encrypt_value(payload)?;
        self.write_record(collection, entity_id, encrypted, checksum, options)
    }

    /// Persist an already-sealed payload, e.g. an encrypted bundle component.
    pub fn put_sealed(
        &self,
        collection: Collection,
        entity_id: &str,
        encrypted: EncryptedPayload,
        checksum: String,
        options: WriteOptions,
    ) -> Result<VaultRecord> {
        Self::check_writable(collection, entity_id)?;
        self.write_record(collection, entity_id, encrypted, checksum, options)
    }

    fn check_writable(collection: Collection, entity_id: &str) -> Result<()> {
        if !collection.is_data() {
            return Err(VaultError::ReservedCollection(collection.to_string()));
        }
        validate_entity_id(entity_id)
    }

    fn write_record(
        &self,
        collection: Collection,
        entity_id: &str,
        encrypted: EncryptedPayload,
        checksum: String,
        options: WriteOptions,
    ) -> Result<VaultRecord> {
        let existing = match self.read_record(collection, entity_id) {
            Ok(record) => Some(record),
            Err(VaultError::NotFound { .. }) => None,
            Err(VaultError::CorruptRecord { path, reason }) => {
                warn!(path = %path.display(), %reason, "existing record is corrupt, preserving it aside");
                self.quarantine(&path)?;
                None
            }
            Err(e) => return Err(e),
        };

        let (imported_from, imported_at, source_bundle) = match options.provenance {
            Some(p) => (Some(p.imported_from), Some(p.imported_at), p.source_bundle),
            None => (None, None, None),
        };
        let incoming = VaultRecord {
            last_updated: now_millis(),
            entity_id: entity_id.to_string(),
            encrypted,
            checksum,
            protected: options.protected,
            imported_from,
            imported_at,
            source_bundle,
            metadata: options.metadata,
        };
        let merged = VaultRecord::merge(existing, incoming);

        let path = self.layout.record(collection, entity_id);
        write_json_atomic(&self.layout.staging_dir(), &path, &merged)?;
        self.update_index(collection, |index| {
            index.entries.insert(
                entity_id.to_string(),
                IndexEntry {
                    last_sync: merged.last_updated,
                    checksum: merged.checksum.clone(),
                },
            );
        })?;
        debug!(%collection, entity_id, checksum = %merged.checksum, "record persisted");
        Ok(merged)
    }

    fn quarantine(&self, path: &std::path::Path) -> Result<()> {
        let mut aside = path.as_os_str().to_owned();
        aside.push(format!(".corrupt-{}", now_millis()));
        fs::rename(path, &aside).at(path)
    }

    /// The stored record, still encrypted.
    pub fn read_record(&self, collection: Collection, entity_id: &str) -> Result<VaultRecord> {
        validate_entity_id(entity_id)?;
        let path = self.layout.record(collection, entity_id);
        if !path.exists() {
            return Err(VaultError::NotFound {
                collection: collection.to_string(),
                entity_id: entity_id.to_string(),
            });
        }
        read_json(&path)
    }

    pub fn get(&self, collection: Collection, entity_id: &str) -> Result<DecryptedRecord> {
        if !collection.is_data() {
            return Err(VaultError::ReservedCollection(collection.to_string()));
        }
        let record = self.read_record(collection, entity_id)?;
        let data = self.codec.decrypt_value(&record.encrypted)?;
        Ok(DecryptedRecord {
            collection,
            record,
            data,
        })
    }

    pub fn index(&self, collection: Collection) -> Result<CollectionIndex> {
        let path = self.layout.index(collection);
        if !path.exists() {
            return Ok(CollectionIndex::new(collection));
        }
        read_json(&path)
    }

    pub fn list(&self, collection: Collection) -> Result<Vec<String>> {
        Ok(self.index(collection)?.entries.into_keys().collect())
    }

    fn update_index<F>(&self, collection: Collection, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut CollectionIndex),
    {
        let _guard = self.index_lock.lock();
        let mut index = match self.index(collection) {
            Ok(index) => index,
            Err(VaultError::CorruptRecord { path, reason }) => {
                warn!(path = %path.display(), %reason, "collection index corrupt, set aside and restarted empty");
                self.quarantine(&path)?;
                CollectionIndex::new(collection)
            }
            Err(e) => return Err(e),
        };
        mutate(&mut index);
        write_json_atomic(
            &self.layout.staging_dir(),
            &self.layout.index(collection),
            &index,
        )
    }

    /// Reconcile an index with the record files actually on disk.
    pub fn rebuild_index(&self, collection: Collection) -> Result<RebuildReport> {
        if !collection.is_data() {
            return Err(VaultError::ReservedCollection(collection.to_string()));
        }
        let dir = self.layout.collection_dir(collection);
        let mut on_disk: BTreeMap<String, IndexEntry> = BTreeMap::new();
        let mut unreadable: Vec<String> = Vec::new();
        for entry in fs::read_dir(&dir).at(&dir)?.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == INDEX_FILE {
                continue;
            }
            let Some(entity_id) = name.strip_suffix(".json") else {
                continue;
            };
            if validate_entity_id(entity_id).is_err() {
                continue;
            }
            match read_json::<VaultRecord>(&entry.path()) {
                Ok(record) => {
                    on_disk.insert(
                        entity_id.to_string(),
                        IndexEntry {
                            last_sync: record.last_updated,
                            checksum: record.checksum,
                        },
                    );
                }
                Err(e) => {
                    warn!(%collection, entity_id, error = %e, "skipping unreadable record during rebuild");
                    unreadable.push(entity_id.to_string());
                }
            }
        }

        let mut report = RebuildReport::default();
        self.update_index(collection, |index| {
            index.entries.retain(|id, _| {
                let keep = on_disk.contains_key(id) || unreadable.contains(id);
                if !keep {
                    report.dropped.push(id.clone());
                }
                keep
            });
            for (id, entry) in on_disk {
                if index.entries.get(&id) != Some(&entry) {
                    if !index.entries.contains_key(&id) {
                        report.added.push(id.clone());
                    }
                    index.entries.insert(id, entry);
                }
            }
        })?;
        if !report.is_clean() {
            info!(%collection, added = report.added.len(), dropped = report.dropped.len(), "collection index reconciled");
        }
        Ok(report)
    }

    /// Check every indexed entry: record present, parseable, decryptable and
    /// matching its checksum.
    pub fn verify(&self) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();
        for collection in Collection::DATA {
            let index = self.index(collection)?;
            for (entity_id, entry) in &index.entries {
                report.checked += 1;
                let kind = match self.get(collection, entity_id) {
                    Ok(decrypted) => {
                        let actual = self.codec.checksum(&decrypted.data)?;
                        if actual != decrypted.record.checksum || actual != entry.checksum {
                            Some(ProblemKind::ChecksumMismatch)
                        } else {
                            None
                        }
                    }
                    Err(VaultError::NotFound { .. }) => Some(ProblemKind::MissingRecord),
                    Err(VaultError::CorruptRecord { .. }) => Some(ProblemKind::Corrupt),
                    Err(VaultError::DecryptionFailure) | Err(VaultError::Serialization(_)) => {
                        Some(ProblemKind::Undecryptable)
                    }
                    Err(e) => return Err(e),
                };
                if let Some(kind) = kind {
                    report.problems.push(VerifyProblem {
                        collection,
                        entity_id: entity_id.clone(),
                        kind,
                    });
                }
            }
        }
        Ok(report)
    }
}
