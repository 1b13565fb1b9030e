use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checkpoint::DEFAULT_RETENTION;
use crate::error::Result;
use crate::fsutil::read_json;
use crate::journal::DEFAULT_MAX_BYTES;
use crate::profile::PlatformProfile;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineSettings {
    /// Checkpoints kept per entity by retention cleanup.
    pub retention: usize,
    /// Upper bound on one queued item's write.
    pub item_timeout_ms: u64,
    pub max_queue_len: usize,
    pub default_profile: String,
    pub journal_max_bytes: u64,
    pub profiles: Vec<PlatformProfile>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
            item_timeout_ms: 5_000,
            max_queue_len: 10_000,
            default_profile: "default".into(),
            journal_max_bytes: DEFAULT_MAX_BYTES,
            profiles: vec![],
        }
    }
}

impl EngineSettings {
    /// Load from a JSON file; absent keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        read_json(path)
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_millis(self.item_timeout_ms)
    }
}
