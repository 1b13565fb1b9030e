//! `VaultEngine`: the one handle callers hold. Owns every component and
//! wires profile changes through to them.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::bundle::{
    ExportImportService, ExportOptions, ImportOutcome, ImportProvenance, ComponentCheckpointError,
};
use crate::checkpoint::{CheckpointManager, CleanupReport, MirrorCheckpoint};
use crate::crypto::{generate_salt, CipherAlgorithm, CryptoCodec, EncryptedPayload, VaultKey};
use crate::dispatcher::{
    DispatchSettings, DrainSummary, EnqueueReceipt, SyncDispatcher, SyncItem, SyncedItem,
};
use crate::error::{IoContext, Result, VaultError};
use crate::fsutil::{read_json, write_json_atomic, write_json_new};
use crate::journal::{AuditJournal, JournalEvent};
use crate::now_millis;
use crate::paths::{Collection, VaultLayout};
use crate::profile::{AppliedProfile, PlatformProfile, ProfileManager, ProfileOverrides};
use crate::settings::EngineSettings;
use crate::store::{DecryptedRecord, RebuildReport, VaultStore, VerifyReport};

pub const MANIFEST_VERSION: u32 = 1;

/// Where the vault key comes from.
pub enum KeySource {
    Key(VaultKey),
    /// Stretched with Argon2id and the salt stored in the vault manifest.
    Password(Zeroizing<String>),
}

impl KeySource {
    fn resolve(self, salt: &[u8]) -> Result<VaultKey> {
        match self {
            KeySource::Key(key) => Ok(key),
            KeySource::Password(password) => VaultKey::derive(&password, salt),
        }
    }
}

/// `vault-manifest.json`: written once when the vault is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultManifest {
    pub version: u32,
    pub created: i64,
    pub algorithm: CipherAlgorithm,
    pub mirror_layer: bool,
    pub entity_owned: bool,
    /// Hex-encoded Argon2id salt for password-derived keys.
    pub kdf_salt: String,
    pub key_check: EncryptedPayload,
}

/// `sync-manifest.json`: what the most recent pass committed, for an
/// external transport to pick up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncManifest {
    pub generated: i64,
    pub last_sync_timestamp: Option<i64>,
    pub items: Vec<SyncedItem>,
}

pub struct VaultEngine {
    layout: VaultLayout,
    settings: EngineSettings,
    profiles: ProfileManager,
    store: Arc<VaultStore>,
    checkpoints: Arc<CheckpointManager>,
    dispatcher: SyncDispatcher,
    bundles: ExportImportService,
    journal: AuditJournal,
    active: RwLock<PlatformProfile>,
}

impl VaultEngine {
    /// Open (or create) the vault at `root`. A key that does not match an
    /// existing vault is `KeyLoss` and nothing is written.
    pub fn open(root: impl Into<PathBuf>, key: KeySource, settings: EngineSettings) -> Result<Self> {
        let layout = VaultLayout::new(root);
        let profiles = ProfileManager::new(&settings.profiles)?;
        let profile = profiles.get(&settings.default_profile)?.clone();
        let algorithm = profile.encryption_strength.algorithm();

        let codec = Arc::new(Self::unlock(&layout, key, algorithm)?);
        let store = Arc::new(VaultStore::new(layout.clone(), Arc::clone(&codec)));
        store.init()?;
        for collection in Collection::DATA {
            store.rebuild_index(collection)?;
        }

        let checkpoints = Arc::new(CheckpointManager::new(
            layout.clone(),
            profile.checkpoints_enabled,
            profile.archival_retention,
        ));
        let dispatcher = SyncDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&checkpoints),
            DispatchSettings {
                sync_interval: profile.sync_interval(),
                item_timeout: settings.item_timeout(),
                max_queue_len: settings.max_queue_len,
                protect_records: profile.protects_records(),
            },
        );
        let bundles = ExportImportService::new(Arc::clone(&store));
        bundles.set_protect_records(profile.protects_records());
        let journal = Self::open_journal(&layout, settings.journal_max_bytes)?;

        info!(root = %layout.root().display(), profile = %profile.name, %algorithm, "vault opened");
        Ok(Self {
            layout,
            settings,
            profiles,
            store,
            checkpoints,
            dispatcher,
            bundles,
            journal,
            active: RwLock::new(profile),
        })
    }

    /// A journal broken mid-file is set aside as `<name>.corrupt-<millis>` and
    /// a new chain started; the records it describes are unaffected.
    fn open_journal(layout: &VaultLayout, max_bytes: u64) -> Result<AuditJournal> {
        let path = layout.journal();
        match AuditJournal::open(&path, max_bytes) {
            Err(VaultError::CorruptRecord { reason, .. }) => {
                let mut name = path.file_name().unwrap_or_default().to_owned();
                name.push(format!(".corrupt-{}", now_millis()));
                let aside = path.with_file_name(name);
                std::fs::rename(&path, &aside).at(&path)?;
                warn!(aside = %aside.display(), %reason, "audit journal unreadable, set aside and restarted");
                AuditJournal::open(&path, max_bytes)
            }
            other => other,
        }
    }

    fn unlock(layout: &VaultLayout, key: KeySource, algorithm: CipherAlgorithm) -> Result<CryptoCodec> {
        let root = layout.root();
        std::fs::create_dir_all(root).at(root)?;
        let manifest_path = layout.manifest();

        if manifest_path.exists() {
            let manifest: VaultManifest = read_json(&manifest_path)?;
            let salt = hex::decode(&manifest.kdf_salt)
                .map_err(|_| VaultError::KeyLoss("manifest salt is not valid hex".into()))?;
            let codec = CryptoCodec::new(key.resolve(&salt)?, algorithm);
            codec.verify_key_check(&manifest.key_check)?;
            return Ok(codec);
        }

        let salt = generate_salt();
        let codec = CryptoCodec::new(key.resolve(&salt)?, algorithm);
        let manifest = VaultManifest {
            version: MANIFEST_VERSION,
            created: now_millis(),
            algorithm,
            mirror_layer: true,
            entity_owned: true,
            kdf_salt: hex::encode(salt),
            key_check: codec.seal_key_check()?,
        };
        write_json_new(&manifest_path, &manifest)?;
        info!(path = %manifest_path.display(), "vault manifest created");
        Ok(codec)
    }

    pub fn layout(&self) -> &VaultLayout {
        &self.layout
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn profiles(&self) -> &ProfileManager {
        &self.profiles
    }

    pub fn journal(&self) -> &AuditJournal {
        &self.journal
    }

    pub fn active_profile(&self) -> PlatformProfile {
        self.active.read().clone()
    }

    pub fn sync_interval(&self) -> Duration {
        self.dispatcher.sync_interval()
    }

    pub fn queue_len(&self) -> usize {
        self.dispatcher.queue_len()
    }

    pub fn enqueue(
        &self,
        entity_id: impl Into<String>,
        collection: Collection,
        payload: Value,
    ) -> EnqueueReceipt {
        self.dispatcher
            .enqueue(SyncItem::new(entity_id, collection, payload))
    }

    pub fn enqueue_item(&self, item: SyncItem) -> EnqueueReceipt {
        self.dispatcher.enqueue(item)
    }

    /// Run one drain pass. Journal and sync-manifest failures are logged;
    /// they never turn a committed pass into an error.
    pub async fn drain_now(&self) -> DrainSummary {
        let summary = self.dispatcher.drain_now().await;
        if summary.skipped || summary.is_idle() {
            return summary;
        }

        if !summary.synced.is_empty() {
            let manifest = SyncManifest {
                generated: now_millis(),
                last_sync_timestamp: summary.last_sync_timestamp,
                items: summary.synced.clone(),
            };
            if let Err(e) = write_json_atomic(
                &self.layout.staging_dir(),
                &self.layout.sync_manifest(),
                &manifest,
            ) {
                warn!(error = %e, "failed to write sync manifest");
            }
        }
        self.audit(
            JournalEvent::DrainCompleted,
            json!({
                "processed": summary.processed,
                "errors": summary.errors.len(),
                "stalled": summary.stalled.as_ref().map(|s| s.item_id),
                "lastSyncTimestamp": summary.last_sync_timestamp,
            }),
        );
        summary
    }

    pub fn get(&self, collection: Collection, entity_id: &str) -> Result<DecryptedRecord> {
        self.store.get(collection, entity_id)
    }

    pub fn list(&self, collection: Collection) -> Result<Vec<String>> {
        self.store.list(collection)
    }

    pub fn export(&self, entity_id: &str, options: &ExportOptions) -> Result<PathBuf> {
        let path = self.bundles.export(entity_id, options)?;
        self.audit(
            JournalEvent::BundleExported,
            json!({
                "entityId": entity_id,
                "bundle": path.display().to_string(),
                "encrypted": options.keep_encrypted,
            }),
        );
        Ok(path)
    }

    /// Import a bundle under `new_entity_id`. Each imported component also
    /// gets a mirror checkpoint when checkpoints are enabled.
    pub fn import(&self, bundle_path: &Path, new_entity_id: &str) -> Result<ImportOutcome> {
        let mut outcome = self.bundles.import(bundle_path, new_entity_id)?;
        for collection in outcome.collections.clone() {
            let checkpoint = self
                .store
                .read_record(collection, new_entity_id)
                .and_then(|record| self.checkpoints.record(new_entity_id, collection, &record.checksum));
            if let Err(e) = checkpoint {
                warn!(new_entity_id, %collection, error = %e, "imported record committed without mirror checkpoint");
                outcome.checkpoint_errors.push(ComponentCheckpointError {
                    collection,
                    error: e.to_string(),
                });
            }
        }
        self.audit(
            JournalEvent::BundleImported,
            json!({
                "newEntityId": new_entity_id,
                "bundle": bundle_path.display().to_string(),
                "components": outcome.components_imported,
                "checkpointErrors": outcome.checkpoint_errors.len(),
            }),
        );
        Ok(outcome)
    }

    pub fn import_provenance(&self, new_entity_id: &str) -> Result<Option<ImportProvenance>> {
        self.bundles.provenance(new_entity_id)
    }

    /// Switch to a named profile. Only future writes are affected; existing
    /// records keep their algorithm and protection flag.
    pub fn apply_profile(&self, name: &str, overrides: &ProfileOverrides) -> Result<PlatformProfile> {
        let profile = self.profiles.resolve(name, overrides)?;
        let applied = AppliedProfile {
            profile: profile.clone(),
            overrides: overrides.clone(),
            applied_at: now_millis(),
        };
        write_json_atomic(
            &self.layout.staging_dir(),
            &self.layout.platform_config(&profile.name),
            &applied,
        )?;

        self.store
            .codec()
            .set_algorithm(profile.encryption_strength.algorithm());
        self.checkpoints.set_enabled(profile.checkpoints_enabled);
        self.checkpoints.set_archival(profile.archival_retention);
        self.dispatcher.configure(|s| {
            s.sync_interval = profile.sync_interval();
            s.protect_records = profile.protects_records();
        });
        self.bundles.set_protect_records(profile.protects_records());
        *self.active.write() = profile.clone();

        self.journal
            .append(JournalEvent::ProfileApplied, serde_json::to_value(&applied)?)?;
        info!(profile = %profile.name, interval_secs = profile.sync_interval_secs, "platform profile applied");
        Ok(profile)
    }

    pub fn checkpoints(&self, entity_id: &str) -> Result<Vec<MirrorCheckpoint>> {
        self.checkpoints.list(entity_id)
    }

    /// Apply retention to one entity, or to every entity when `entity_id`
    /// is `None`. `keep` defaults to the configured retention.
    pub fn cleanup_checkpoints(
        &self,
        entity_id: Option<&str>,
        keep: Option<usize>,
    ) -> Result<CleanupReport> {
        let keep = keep.unwrap_or(self.settings.retention);
        let report = match entity_id {
            Some(id) => self.checkpoints.cleanup(id, keep)?,
            None => self.checkpoints.cleanup_all(keep)?,
        };
        if report.removed + report.archived > 0 {
            self.audit(
                JournalEvent::CheckpointsPruned,
                json!({
                    "entityId": entity_id,
                    "keep": keep,
                    "removed": report.removed,
                    "archived": report.archived,
                }),
            );
        }
        Ok(report)
    }

    pub fn rebuild_index(&self, collection: Collection) -> Result<RebuildReport> {
        self.store.rebuild_index(collection)
    }

    pub fn verify(&self) -> Result<VerifyReport> {
        self.store.verify()
    }

    fn audit(&self, event: JournalEvent, data: Value) {
        if let Err(e) = self.journal.append(event.clone(), data) {
            warn!(?event, error = %e, "failed to append audit journal entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn manifest_written_once_with_key_check() {
        let dir = tempdir().unwrap();
        let key = VaultKey::generate();
        let hex = key.to_hex();
        VaultEngine::open(dir.path(), KeySource::Key(key), EngineSettings::default()).unwrap();

        let manifest: VaultManifest = read_json(&dir.path().join("vault-manifest.json")).unwrap();
        assert_eq!(manifest.version, MANIFEST_VERSION);
        assert!(manifest.mirror_layer);
        assert_eq!(manifest.algorithm, CipherAlgorithm::XChaCha20Poly1305);

        let again = VaultKey::from_hex(&hex).unwrap();
        VaultEngine::open(dir.path(), KeySource::Key(again), EngineSettings::default()).unwrap();
        let reread: VaultManifest = read_json(&dir.path().join("vault-manifest.json")).unwrap();
        assert_eq!(reread.created, manifest.created);
    }

    #[test]
    fn unknown_default_profile_refuses_to_open() {
        let dir = tempdir().unwrap();
        let settings = EngineSettings {
            default_profile: "turbo".into(),
            ..Default::default()
        };
        assert!(matches!(
            VaultEngine::open(dir.path(), KeySource::Key(VaultKey::generate()), settings),
            Err(VaultError::UnknownProfile(_))
        ));
        assert!(!dir.path().join("vault-manifest.json").exists());
    }

    #[test]
    fn torn_journal_tail_does_not_block_open() {
        let dir = tempdir().unwrap();
        let hex = VaultKey::generate().to_hex();
        let open = || {
            VaultEngine::open(
                dir.path(),
                KeySource::Key(VaultKey::from_hex(&hex).unwrap()),
                EngineSettings::default(),
            )
        };
        open()
            .unwrap()
            .apply_profile("audit", &ProfileOverrides::default())
            .unwrap();
        let journal_path = dir.path().join("audit.jsonl");
        let mut file = std::fs::OpenOptions::new().append(true).open(&journal_path).unwrap();
        std::io::Write::write_all(&mut file, b"{\"seq\":2,\"timest").unwrap();
        drop(file);

        let engine = open().unwrap();
        engine.apply_profile("default", &ProfileOverrides::default()).unwrap();
        assert_eq!(engine.journal().verify_chain().unwrap(), 2);
        assert_eq!(engine.journal().read_recent(Some(1)).unwrap()[0].seq, 2);
        let torn = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .any(|e| e.file_name().to_string_lossy().starts_with("audit.jsonl.torn-"));
        assert!(torn);
    }

    #[test]
    fn journal_broken_mid_file_is_set_aside() {
        let dir = tempdir().unwrap();
        let hex = VaultKey::generate().to_hex();
        let open = || {
            VaultEngine::open(
                dir.path(),
                KeySource::Key(VaultKey::from_hex(&hex).unwrap()),
                EngineSettings::default(),
            )
        };
        open()
            .unwrap()
            .apply_profile("audit", &ProfileOverrides::default())
            .unwrap();
        let journal_path = dir.path().join("audit.jsonl");
        let intact = std::fs::read_to_string(&journal_path).unwrap();
        std::fs::write(&journal_path, format!("garbage\n{intact}")).unwrap();

        let engine = open().unwrap();
        assert_eq!(engine.journal().verify_chain().unwrap(), 0);
        assert!(!journal_path.exists());
    }

    #[tokio::test]
    async fn import_commits_even_when_checkpoints_fail() {
        let dir = tempdir().unwrap();
        let engine =
            VaultEngine::open(dir.path(), KeySource::Key(VaultKey::generate()), EngineSettings::default())
                .unwrap();
        engine.enqueue("a1", Collection::AgentStates, json!({"health": 100}));
        engine.drain_now().await;
        let bundle = engine.export("a1", &ExportOptions::default()).unwrap();

        let checkpoints_dir = dir.path().join("mirror-checkpoints");
        std::fs::remove_dir_all(&checkpoints_dir).unwrap();
        std::fs::write(&checkpoints_dir, b"not a directory").unwrap();

        let outcome = engine.import(&bundle, "a1-fork").unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.checkpoint_errors.len(), outcome.components_imported);
        assert_eq!(
            engine.get(Collection::AgentStates, "a1-fork").unwrap().data,
            json!({"health": 100})
        );
        let recent = engine.journal().read_recent(Some(1)).unwrap();
        assert_eq!(recent[0].event, JournalEvent::BundleImported);
    }

    #[tokio::test]
    async fn drain_writes_sync_manifest_and_journal() {
        let dir = tempdir().unwrap();
        let engine =
            VaultEngine::open(dir.path(), KeySource::Key(VaultKey::generate()), EngineSettings::default())
                .unwrap();
        engine.enqueue("a1", Collection::AgentStates, json!({"health": 100}));
        engine.enqueue("a2", Collection::VibeHistory, json!(["calm"]));
        let summary = engine.drain_now().await;
        assert_eq!(summary.processed, 2);

        let manifest: SyncManifest = read_json(&engine.layout().sync_manifest()).unwrap();
        assert_eq!(manifest.items.len(), 2);
        assert_eq!(manifest.last_sync_timestamp, summary.last_sync_timestamp);
        assert!(manifest
            .items
            .iter()
            .all(|item| item.enqueued_at > 0 && item.enqueued_at <= item.synced_at));

        let recent = engine.journal().read_recent(Some(1)).unwrap();
        assert_eq!(recent[0].event, JournalEvent::DrainCompleted);
        assert_eq!(recent[0].data["processed"], 2);

        // An empty pass leaves no trace.
        engine.drain_now().await;
        assert_eq!(engine.journal().verify_chain().unwrap(), 1);
    }
}
