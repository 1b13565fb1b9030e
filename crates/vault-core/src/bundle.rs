//! Fork bundles: a portable snapshot of one entity across collections, and
//! its re-import under a new entity id.
//!
//! Import is all-or-nothing at the validation stage: the whole bundle is
//! parsed and every component checked before the first record is written.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::crypto::EncryptedPayload;
use crate::error::{IoContext, Result, VaultError};
use crate::fsutil::{read_json, write_json_atomic};
use crate::now_millis;
use crate::paths::{validate_entity_id, Collection, INDEX_FILE};
use crate::profile::AppliedProfile;
use crate::store::{Provenance, VaultStore, WriteOptions};

pub const BUNDLE_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleComponent {
    pub last_updated: i64,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<EncryptedPayload>,
    pub checksum: String,
    #[serde(default)]
    pub protected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportBundle {
    pub version: String,
    pub exported: i64,
    pub agent_id: String,
    pub components: BTreeMap<String, BundleComponent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_configs: Option<BTreeMap<String, AppliedProfile>>,
}

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Collections to include; `None` means every data collection.
    pub collections: Option<Vec<Collection>>,
    pub keep_encrypted: bool,
    pub include_platform_configs: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
    pub success: bool,
    pub components_imported: usize,
    pub collections: Vec<Collection>,
    /// Components whose records committed but whose mirror checkpoint failed.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub checkpoint_errors: Vec<ComponentCheckpointError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentCheckpointError {
    pub collection: Collection,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImportEvent {
    pub imported_from: String,
    pub source_bundle: String,
    pub imported_at: i64,
    pub bundle_exported: i64,
    pub collections: Vec<Collection>,
}

/// Contents of `imports/<newEntityId>-import.json`. Repeated imports under
/// the same id append; earlier events are never dropped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImportProvenance {
    pub new_entity_id: String,
    pub imports: Vec<ImportEvent>,
}

/// Keeps an explicit `"data": null` distinct from an absent field.
fn present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

fn invalid(reason: impl Into<String>) -> VaultError {
    VaultError::InvalidBundleFormat(reason.into())
}

/// Parse and shape-check a bundle file without touching the vault.
pub fn read_bundle(path: &Path) -> Result<ExportBundle> {
    let bytes = fs::read(path).at(path)?;
    let raw: Value =
        serde_json::from_slice(&bytes).map_err(|e| invalid(format!("not JSON: {e}")))?;

    match raw.get("version").and_then(Value::as_str) {
        Some(BUNDLE_VERSION) => {}
        Some(other) => return Err(invalid(format!("unsupported version {other:?}"))),
        None => return Err(invalid("missing version")),
    }
    if !raw.get("components").map_or(false, Value::is_object) {
        return Err(invalid("missing components map"));
    }
    serde_json::from_value(raw).map_err(|e| invalid(e.to_string()))
}

pub struct ExportImportService {
    store: Arc<VaultStore>,
    protect_records: AtomicBool,
}

impl ExportImportService {
    pub fn new(store: Arc<VaultStore>) -> Self {
        Self {
            store,
            protect_records: AtomicBool::new(false),
        }
    }

    pub fn set_protect_records(&self, protect: bool) {
        self.protect_records.store(protect, Ordering::SeqCst);
    }

    /// Assemble a bundle in memory. Collections with no readable record are
    /// left out.
    pub fn build(&self, entity_id: &str, options: &ExportOptions) -> Result<ExportBundle> {
        validate_entity_id(entity_id)?;
        let collections = options
            .collections
            .clone()
            .unwrap_or_else(|| Collection::DATA.to_vec());

        let mut components = BTreeMap::new();
        for collection in collections {
            if !collection.is_data() {
                return Err(VaultError::ReservedCollection(collection.to_string()));
            }
            let record = match self.store.read_record(collection, entity_id) {
                Ok(record) => record,
                Err(e) if e.is_absent() => {
                    if matches!(e, VaultError::CorruptRecord { .. }) {
                        warn!(entity_id, %collection, error = %e, "corrupt record left out of export");
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            let (data, encrypted) = if options.keep_encrypted {
                (None, Some(record.encrypted))
            } else {
                (Some(self.store.codec().decrypt_value(&record.encrypted)?), None)
            };
            components.insert(
                collection.to_string(),
                BundleComponent {
                    last_updated: record.last_updated,
                    data,
                    encrypted,
                    checksum: record.checksum,
                    protected: record.protected,
                },
            );
        }

        let platform_configs = if options.include_platform_configs {
            Some(self.platform_configs()?)
        } else {
            None
        };

        Ok(ExportBundle {
            version: BUNDLE_VERSION.to_string(),
            exported: now_millis(),
            agent_id: entity_id.to_string(),
            components,
            platform_configs,
        })
    }

    fn platform_configs(&self) -> Result<BTreeMap<String, AppliedProfile>> {
        let dir = self.store.layout().collection_dir(Collection::PlatformConfigs);
        let mut out = BTreeMap::new();
        if !dir.exists() {
            return Ok(out);
        }
        for entry in fs::read_dir(&dir).at(&dir)?.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == INDEX_FILE {
                continue;
            }
            let Some(profile_name) = name.strip_suffix(".json") else {
                continue;
            };
            match read_json::<AppliedProfile>(&entry.path()) {
                Ok(applied) => {
                    out.insert(profile_name.to_string(), applied);
                }
                Err(e) => warn!(profile = profile_name, error = %e, "skipping unreadable platform config"),
            }
        }
        Ok(out)
    }

    /// Write a bundle to `exports/<entityId>-<timestamp>.json` and return its path.
    pub fn export(&self, entity_id: &str, options: &ExportOptions) -> Result<PathBuf> {
        let mut bundle = self.build(entity_id, options)?;
        let layout = self.store.layout();
        let mut path = layout.export(entity_id, bundle.exported);
        while path.exists() {
            bundle.exported += 1;
            path = layout.export(entity_id, bundle.exported);
        }
        write_json_atomic(&layout.staging_dir(), &path, &bundle)?;
        info!(
            entity_id,
            components = bundle.components.len(),
            encrypted = options.keep_encrypted,
            path = %path.display(),
            "bundle exported"
        );
        Ok(path)
    }

    /// Check every component of `bundle` and return the writes to perform.
    fn validate(&self, bundle: &ExportBundle) -> Result<Vec<(Collection, BundleComponent)>> {
        if bundle.agent_id.is_empty() {
            return Err(invalid("empty agentId"));
        }
        let codec = self.store.codec();
        let mut plan = Vec::with_capacity(bundle.components.len());
        for (name, component) in &bundle.components {
            let collection: Collection = name
                .parse()
                .map_err(|_| invalid(format!("unknown collection {name:?}")))?;
            if !collection.is_data() {
                return Err(invalid(format!("collection {name} cannot be imported")));
            }
            let payload = match (&component.data, &component.encrypted) {
                (Some(data), None) => data.clone(),
                (None, Some(sealed)) => codec.decrypt_value(sealed).map_err(|_| {
                    invalid(format!("component {name} is sealed under a different key"))
                })?,
                _ => {
                    return Err(invalid(format!(
                        "component {name} must carry exactly one of data or encrypted"
                    )))
                }
            };
            if codec.checksum(&payload)? != component.checksum {
                return Err(invalid(format!("component {name} fails its checksum")));
            }
            plan.push((collection, component.clone()));
        }
        Ok(plan)
    }

    pub fn import(&self, bundle_path: &Path, new_entity_id: &str) -> Result<ImportOutcome> {
        validate_entity_id(new_entity_id)?;
        let bundle = read_bundle(bundle_path)?;
        let plan = self.validate(&bundle)?;

        let imported_at = now_millis();
        let source_bundle = bundle_path.display().to_string();
        let protect = self.protect_records.load(Ordering::SeqCst);
        let mut collections = Vec::with_capacity(plan.len());

        for (collection, component) in plan {
            let options = WriteOptions {
                protected: component.protected || protect,
                provenance: Some(Provenance {
                    imported_from: bundle.agent_id.clone(),
                    imported_at,
                    source_bundle: Some(source_bundle.clone()),
                }),
                ..Default::default()
            };
            match (component.data, component.encrypted) {
                (Some(data), _) => {
                    self.store.put(collection, new_entity_id, &data, options)?;
                }
                (None, Some(sealed)) => {
                    self.store.put_sealed(
                        collection,
                        new_entity_id,
                        sealed,
                        component.checksum,
                        options,
                    )?;
                }
                (None, None) => continue,
            }
            debug!(%collection, new_entity_id, "component imported");
            collections.push(collection);
        }

        self.record_provenance(
            new_entity_id,
            ImportEvent {
                imported_from: bundle.agent_id.clone(),
                source_bundle,
                imported_at,
                bundle_exported: bundle.exported,
                collections: collections.clone(),
            },
        )?;
        info!(
            from = %bundle.agent_id,
            to = new_entity_id,
            components = collections.len(),
            "bundle imported"
        );
        Ok(ImportOutcome {
            success: true,
            components_imported: collections.len(),
            collections,
            checkpoint_errors: Vec::new(),
        })
    }

    fn record_provenance(&self, new_entity_id: &str, event: ImportEvent) -> Result<()> {
        let layout = self.store.layout();
        let path = layout.import_provenance(new_entity_id);
        let mut provenance = if path.exists() {
            read_json::<ImportProvenance>(&path)?
        } else {
            ImportProvenance {
                new_entity_id: new_entity_id.to_string(),
                imports: Vec::new(),
            }
        };
        provenance.imports.push(event);
        write_json_atomic(&layout.staging_dir(), &path, &provenance)
    }

    pub fn provenance(&self, new_entity_id: &str) -> Result<Option<ImportProvenance>> {
        validate_entity_id(new_entity_id)?;
        let path = self.store.layout().import_provenance(new_entity_id);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CipherAlgorithm, CryptoCodec, VaultKey};
    use crate::paths::VaultLayout;
    use serde_json::json;
    use tempfile::tempdir;

    fn service(root: &Path, key: VaultKey) -> ExportImportService {
        let codec = Arc::new(CryptoCodec::new(key, CipherAlgorithm::XChaCha20Poly1305));
        let store = Arc::new(VaultStore::new(VaultLayout::new(root), codec));
        store.init().unwrap();
        ExportImportService::new(store)
    }

    fn seed(svc: &ExportImportService) {
        svc.store
            .put(Collection::AgentStates, "a1", &json!({"health": 100}), WriteOptions::default())
            .unwrap();
        svc.store
            .put(Collection::CareerTrees, "a1", &json!({"rank": ["scout", "ranger"]}), WriteOptions::default())
            .unwrap();
    }

    #[test]
    fn plaintext_export_omits_missing_components() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path(), VaultKey::generate());
        seed(&svc);

        let path = svc.export("a1", &ExportOptions::default()).unwrap();
        assert!(path.starts_with(dir.path().join("exports")));
        let bundle = read_bundle(&path).unwrap();
        assert_eq!(bundle.agent_id, "a1");
        assert_eq!(bundle.components.len(), 2);
        assert_eq!(bundle.components["agent-states"].data, Some(json!({"health": 100})));
        assert!(bundle.components["agent-states"].encrypted.is_none());
        assert!(!bundle.components.contains_key("vibe-history"));
        assert!(bundle.platform_configs.is_none());

        let raw: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["agentId"], "a1");
        assert_eq!(raw["version"], BUNDLE_VERSION);
    }

    #[test]
    fn sealed_bundle_needs_the_same_key() {
        let dir = tempdir().unwrap();
        let key = VaultKey::generate();
        let hex = key.to_hex();
        let svc = service(dir.path(), key);
        seed(&svc);
        let options = ExportOptions {
            keep_encrypted: true,
            ..Default::default()
        };
        let path = svc.export("a1", &options).unwrap();
        assert!(!fs::read_to_string(&path).unwrap().contains("ranger"));

        let same = tempdir().unwrap();
        let same_key = service(same.path(), VaultKey::from_hex(&hex).unwrap());
        let outcome = same_key.import(&path, "a2").unwrap();
        assert_eq!(outcome.components_imported, 2);
        assert_eq!(
            same_key.store.get(Collection::CareerTrees, "a2").unwrap().data,
            json!({"rank": ["scout", "ranger"]})
        );

        let other = tempdir().unwrap();
        let foreign = service(other.path(), VaultKey::generate());
        assert!(matches!(
            foreign.import(&path, "a2"),
            Err(VaultError::InvalidBundleFormat(_))
        ));
        assert!(foreign.store.list(Collection::AgentStates).unwrap().is_empty());
    }

    #[test]
    fn import_is_all_or_nothing() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path(), VaultKey::generate());
        seed(&svc);
        let path = svc.export("a1", &ExportOptions::default()).unwrap();

        let mut bundle: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        bundle["components"]["career-trees"]["checksum"] = json!("0000");
        let tampered = dir.path().join("tampered.json");
        fs::write(&tampered, serde_json::to_vec(&bundle).unwrap()).unwrap();

        assert!(matches!(
            svc.import(&tampered, "b1"),
            Err(VaultError::InvalidBundleFormat(_))
        ));
        assert!(matches!(
            svc.store.get(Collection::AgentStates, "b1"),
            Err(VaultError::NotFound { .. })
        ));
        assert!(svc.provenance("b1").unwrap().is_none());
    }

    #[test]
    fn malformed_bundles_are_rejected() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path(), VaultKey::generate());
        let cases = [
            ("garbage", "not json at all".to_string()),
            ("no-version", json!({"agentId": "a1", "exported": 1, "components": {}}).to_string()),
            ("future", json!({"version": "2.0.0", "agentId": "a1", "exported": 1, "components": {}}).to_string()),
            ("no-components", json!({"version": "1.0.0", "agentId": "a1", "exported": 1}).to_string()),
            (
                "bad-collection",
                json!({"version": "1.0.0", "agentId": "a1", "exported": 1,
                    "components": {"inventory": {"lastUpdated": 1, "data": 1, "checksum": "x"}}})
                .to_string(),
            ),
        ];
        for (name, body) in cases {
            let path = dir.path().join(format!("{name}.json"));
            fs::write(&path, body).unwrap();
            assert!(
                matches!(svc.import(&path, "b1"), Err(VaultError::InvalidBundleFormat(_))),
                "{name} accepted"
            );
        }
    }

    #[test]
    fn repeated_imports_append_provenance() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path(), VaultKey::generate());
        seed(&svc);
        let path = svc.export("a1", &ExportOptions::default()).unwrap();
        svc.import(&path, "a1-fork").unwrap();
        svc.import(&path, "a1-fork").unwrap();

        let provenance = svc.provenance("a1-fork").unwrap().unwrap();
        assert_eq!(provenance.imports.len(), 2);
        assert_eq!(provenance.imports[0].imported_from, "a1");
        assert_eq!(
            provenance.imports[1].collections,
            vec![Collection::AgentStates, Collection::CareerTrees]
        );

        let record = svc.store.read_record(Collection::AgentStates, "a1-fork").unwrap();
        assert_eq!(record.imported_from.as_deref(), Some("a1"));
        assert_eq!(record.source_bundle, Some(path.display().to_string()));
    }
}
