//! Mirror checkpoints: one immutable audit record per successful write.
//!
//! Files are named `<entityId>-<timestamp>.json`. Timestamps handed out by a
//! manager strictly increase, so names for one entity sort chronologically
//! and two writes in the same millisecond never collide.

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{IoContext, Result, VaultError};
use crate::fsutil::{read_json, write_json_new};
use crate::now_millis;
use crate::paths::{validate_entity_id, Collection, VaultLayout};

pub const CHECKPOINT_PROTOCOL: &str = "mirror-v1";
pub const DEFAULT_RETENTION: usize = 10;
const MAX_NAME_ATTEMPTS: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MirrorCheckpoint {
    pub timestamp: i64,
    pub entity_id: String,
    pub data_type: Collection,
    pub checksum: String,
    pub protocol: String,
    pub entity_owned: bool,
    pub immutable: bool,
    pub encrypted_at_rest: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub removed: usize,
    pub archived: usize,
}

impl CleanupReport {
    fn absorb(&mut self, other: CleanupReport) {
        self.removed += other.removed;
        self.archived += other.archived;
    }
}

pub struct CheckpointManager {
    layout: VaultLayout,
    enabled: AtomicBool,
    archival: AtomicBool,
    last_timestamp: Mutex<i64>,
}

impl CheckpointManager {
    pub fn new(layout: VaultLayout, enabled: bool, archival: bool) -> Self {
        Self {
            layout,
            enabled: AtomicBool::new(enabled),
            archival: AtomicBool::new(archival),
            last_timestamp: Mutex::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_archival(&self) -> bool {
        self.archival.load(Ordering::SeqCst)
    }

    pub fn set_archival(&self, archival: bool) {
        self.archival.store(archival, Ordering::SeqCst);
    }

    fn next_timestamp(&self) -> i64 {
        let mut last = self.last_timestamp.lock();
        let ts = now_millis().max(*last + 1);
        *last = ts;
        ts
    }

    /// Append a checkpoint for a persisted write. Returns `None` when
    /// checkpointing is disabled.
    pub fn record(
        &self,
        entity_id: &str,
        data_type: Collection,
        checksum: &str,
    ) -> Result<Option<MirrorCheckpoint>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        validate_entity_id(entity_id)?;
        let dir = self.layout.checkpoints_dir();
        fs::create_dir_all(&dir).at(&dir)?;
        for _ in 0..MAX_NAME_ATTEMPTS {
            let timestamp = self.next_timestamp();
            let path = self.layout.checkpoint(entity_id, timestamp);
            let checkpoint = MirrorCheckpoint {
                timestamp,
                entity_id: entity_id.to_string(),
                data_type,
                checksum: checksum.to_string(),
                protocol: CHECKPOINT_PROTOCOL.to_string(),
                entity_owned: true,
                immutable: true,
                encrypted_at_rest: true,
            };
            match write_json_new(&path, &checkpoint) {
                Ok(()) => {
                    debug!(entity_id, timestamp, %data_type, "mirror checkpoint recorded");
                    return Ok(Some(checkpoint));
                }
                // Left behind by an earlier process in the same millisecond.
                Err(VaultError::Io { source, .. })
                    if source.kind() == std::io::ErrorKind::AlreadyExists && path.is_file() => {}
                Err(e) => return Err(e),
            }
        }
        Err(VaultError::io(
            dir,
            std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("no free checkpoint name for {entity_id} after {MAX_NAME_ATTEMPTS} attempts"),
            ),
        ))
    }

    fn files_for(&self, entity_id: Option<&str>) -> Result<Vec<(String, i64, PathBuf)>> {
        let dir = self.layout.checkpoints_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir).at(&dir)?.flatten() {
            if !entry.path().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let Some((owner, timestamp)) = parse_checkpoint_name(&name) else {
                continue;
            };
            if entity_id.map_or(true, |id| id == owner) {
                out.push((owner.to_string(), timestamp, entry.path()));
            }
        }
        out.sort_by_key(|(_, ts, _)| *ts);
        Ok(out)
    }

    /// Checkpoints for `entity_id`, oldest first.
    pub fn list(&self, entity_id: &str) -> Result<Vec<MirrorCheckpoint>> {
        self.files_for(Some(entity_id))?
            .into_iter()
            .map(|(_, _, path)| read_json(&path))
            .collect()
    }

    /// Keep the newest `keep` checkpoints for `entity_id`; older ones are
    /// deleted, or moved to the archive when archival retention is on.
    pub fn cleanup(&self, entity_id: &str, keep: usize) -> Result<CleanupReport> {
        let files = self.files_for(Some(entity_id))?;
        let mut report = CleanupReport::default();
        if files.len() <= keep {
            return Ok(report);
        }
        let excess = files.len() - keep;
        let archival = self.is_archival();
        if archival {
            let archive = self.layout.checkpoint_archive_dir();
            fs::create_dir_all(&archive).at(&archive)?;
        }
        for (_, _, path) in files.into_iter().take(excess) {
            if archival {
                let name = path.file_name().map(|n| n.to_owned()).unwrap_or_default();
                let dest = self.layout.checkpoint_archive_dir().join(name);
                fs::rename(&path, &dest).at(&path)?;
                report.archived += 1;
            } else {
                fs::remove_file(&path).at(&path)?;
                report.removed += 1;
            }
        }
        info!(entity_id, keep, removed = report.removed, archived = report.archived, "checkpoint retention applied");
        Ok(report)
    }

    pub fn cleanup_all(&self, keep: usize) -> Result<CleanupReport> {
        let owners: BTreeSet<String> = self
            .files_for(None)?
            .into_iter()
            .map(|(owner, _, _)| owner)
            .collect();
        let mut total = CleanupReport::default();
        for owner in owners {
            total.absorb(self.cleanup(&owner, keep)?);
        }
        Ok(total)
    }
}

/// Split `<entityId>-<timestamp>.json`; entity ids may themselves contain `-`.
fn parse_checkpoint_name(name: &str) -> Option<(&str, i64)> {
    let stem = name.strip_suffix(".json")?;
    let (owner, ts) = stem.rsplit_once('-')?;
    if owner.is_empty() || ts.is_empty() || !ts.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((owner, ts.parse().ok()?))
}
