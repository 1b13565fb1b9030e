use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "darklock";
pub const APP_NAME: &str = "vault-sync";
pub const ROOT_ENV: &str = "VAULT_SYNC_ROOT";

pub const MANIFEST_FILE: &str = "vault-manifest.json";
pub const INDEX_FILE: &str = "index.json";
pub const JOURNAL_FILE: &str = "audit.jsonl";
pub const SYNC_MANIFEST_FILE: &str = "sync-manifest.json";

/// Default vault root: `$VAULT_SYNC_ROOT`, else the platform data directory.
pub fn default_root() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var(ROOT_ENV) {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME).ok_or_else(|| {
        VaultError::io(
            PathBuf::new(),
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "cannot determine data directory",
            ),
        )
    })?;
    Ok(dirs.data_dir().join("vault"))
}

/// The fixed collection set of every vault.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum Collection {
    AgentStates,
    CareerTrees,
    ReflectionLogs,
    VibeHistory,
    WhisperArchive,
    PlatformConfigs,
    MirrorCheckpoints,
}

impl Collection {
    pub const ALL: [Collection; 7] = [
        Collection::AgentStates,
        Collection::CareerTrees,
        Collection::ReflectionLogs,
        Collection::VibeHistory,
        Collection::WhisperArchive,
        Collection::PlatformConfigs,
        Collection::MirrorCheckpoints,
    ];

    /// Collections holding entity records written through the store.
    pub const DATA: [Collection; 5] = [
        Collection::AgentStates,
        Collection::CareerTrees,
        Collection::ReflectionLogs,
        Collection::VibeHistory,
        Collection::WhisperArchive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::AgentStates => "agent-states",
            Collection::CareerTrees => "career-trees",
            Collection::ReflectionLogs => "reflection-logs",
            Collection::VibeHistory => "vibe-history",
            Collection::WhisperArchive => "whisper-archive",
            Collection::PlatformConfigs => "platform-configs",
            Collection::MirrorCheckpoints => "mirror-checkpoints",
        }
    }

    pub fn is_data(&self) -> bool {
        Collection::DATA.contains(self)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        Collection::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| VaultError::UnknownCollection(s.to_string()))
    }
}

/// Entity ids become file names, so they must not escape their directory.
pub fn validate_entity_id(id: &str) -> Result<()> {
    let bad = id.is_empty()
        || id.len() > 128
        || id.starts_with('.')
        || id == INDEX_FILE.trim_end_matches(".json")
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | ':'));
    if bad || id.contains("..") {
        return Err(VaultError::InvalidEntityId(id.to_string()));
    }
    Ok(())
}

/// Every path the engine touches, derived from one root.
#[derive(Debug, Clone)]
pub struct VaultLayout {
    root: PathBuf,
}

impl VaultLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn collection_dir(&self, collection: Collection) -> PathBuf {
        self.root.join(collection.as_str())
    }

    pub fn index(&self, collection: Collection) -> PathBuf {
        self.collection_dir(collection).join(INDEX_FILE)
    }

    pub fn record(&self, collection: Collection, entity_id: &str) -> PathBuf {
        self.collection_dir(collection)
            .join(format!("{entity_id}.json"))
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.collection_dir(Collection::MirrorCheckpoints)
    }

    pub fn checkpoint_archive_dir(&self) -> PathBuf {
        self.checkpoints_dir().join("archive")
    }

    pub fn checkpoint(&self, entity_id: &str, timestamp: i64) -> PathBuf {
        self.checkpoints_dir()
            .join(format!("{entity_id}-{timestamp}.json"))
    }

    pub fn exports_dir(&self) -> PathBuf {
        self.root.join("exports")
    }

    pub fn export(&self, entity_id: &str, timestamp: i64) -> PathBuf {
        self.exports_dir()
            .join(format!("{entity_id}-{timestamp}.json"))
    }

    pub fn imports_dir(&self) -> PathBuf {
        self.root.join("imports")
    }

    pub fn import_provenance(&self, new_entity_id: &str) -> PathBuf {
        self.imports_dir()
            .join(format!("{new_entity_id}-import.json"))
    }

    pub fn platform_config(&self, profile_name: &str) -> PathBuf {
        self.collection_dir(Collection::PlatformConfigs)
            .join(format!("{profile_name}.json"))
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(".staging")
    }

    pub fn journal(&self) -> PathBuf {
        self.root.join(JOURNAL_FILE)
    }

    pub fn sync_manifest(&self) -> PathBuf {
        self.root.join(SYNC_MANIFEST_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_names_roundtrip() {
        for c in Collection::ALL {
            assert_eq!(c.as_str().parse::<Collection>().unwrap(), c);
            assert_eq!(serde_json::to_value(c).unwrap(), c.as_str());
        }
        assert!(matches!(
            "inventory".parse::<Collection>(),
            Err(VaultError::UnknownCollection(_))
        ));
    }

    #[test]
    fn entity_ids_cannot_escape() {
        for ok in ["a1", "a1-fork", "agent_42", "user@host", "v1.2"] {
            validate_entity_id(ok).unwrap();
        }
        for bad in ["", "../a1", "a/b", "a\\b", ".hidden", "a..b", "index", "a b"] {
            assert!(validate_entity_id(bad).is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn layout_matches_on_disk_contract() {
        let layout = VaultLayout::new("/v");
        assert_eq!(
            layout.record(Collection::AgentStates, "a1"),
            PathBuf::from("/v/agent-states/a1.json")
        );
        assert_eq!(
            layout.index(Collection::CareerTrees),
            PathBuf::from("/v/career-trees/index.json")
        );
        assert_eq!(
            layout.checkpoint("a1", 1710000000000),
            PathBuf::from("/v/mirror-checkpoints/a1-1710000000000.json")
        );
        assert_eq!(
            layout.import_provenance("a1-fork"),
            PathBuf::from("/v/imports/a1-fork-import.json")
        );
        assert_eq!(
            layout.platform_config("default"),
            PathBuf::from("/v/platform-configs/default.json")
        );
    }
}
