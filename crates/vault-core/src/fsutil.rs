//! Crash-safe file primitives shared by every component.
//!
//! All durable writes go staging file -> fsync -> rename over the target, so
//! a reader only ever observes the old or the new content of a file.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::error::{IoContext, Result, VaultError};

pub(crate) fn write_atomic(staging_root: &Path, dest: &Path, bytes: &[u8]) -> Result<()> {
    fs::create_dir_all(staging_root).at(staging_root)?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }
    let staging_path = staging_root.join(format!("{}.staging", Uuid::new_v4()));
    {
        let mut file = File::create(&staging_path).at(&staging_path)?;
        file.write_all(bytes).at(&staging_path)?;
        file.sync_all().at(&staging_path)?;
    }
    if let Err(e) = fs::rename(&staging_path, dest) {
        let _ = fs::remove_file(&staging_path);
        return Err(VaultError::io(dest, e));
    }
    if let Some(parent) = dest.parent() {
        fsync_dir(parent)?;
    }
    Ok(())
}

pub(crate) fn write_json_atomic<T: Serialize>(
    staging_root: &Path,
    dest: &Path,
    value: &T,
) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(staging_root, dest, &json)
}

/// Create-only write; fails if `dest` already exists.
pub(crate) fn write_json_new<T: Serialize>(dest: &Path, value: &T) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }
    let json = serde_json::to_vec_pretty(value)?;
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dest)
        .at(dest)?;
    file.write_all(&json).at(dest)?;
    file.sync_all().at(dest)?;
    Ok(())
}

/// Read and parse `path`. A parse failure is `CorruptRecord`; the file is
/// left untouched.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).at(path)?;
    serde_json::from_slice(&bytes).map_err(|e| VaultError::CorruptRecord {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

pub(crate) fn fsync_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = OpenOptions::new().read(true).open(path).at(path)?;
        dir.sync_all().at(path)?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

pub(crate) fn restrict_dir_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o700)) {
            warn!("cannot restrict permissions on {}: {}", path.display(), e);
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

/// Remove leftover `.staging` files from a previous crash.
pub(crate) fn cleanup_staging_dir(staging_root: &Path) -> usize {
    let mut removed = 0;
    if let Ok(entries) = fs::read_dir(staging_root) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(".staging") {
                warn!(path = %entry.path().display(), "removing orphaned staging file");
                if fs::remove_file(entry.path()).is_ok() {
                    removed += 1;
                }
            }
        }
    }
    removed
}
