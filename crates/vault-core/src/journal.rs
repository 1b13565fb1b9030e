//! Append-only, hash-chained audit journal (`audit.jsonl`).
//!
//! Each line commits to the previous one through `prev_hash`, so a removed or
//! edited line breaks the chain. The file rotates once it passes `max_bytes`;
//! the chain restarts in the new file while `seq` keeps counting.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{IoContext, Result, VaultError};
use crate::now_millis;

const CHAIN_START: &str = "CHAIN_START";
const MAX_ROTATIONS: usize = 5;
pub const DEFAULT_MAX_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JournalEvent {
    ProfileApplied,
    BundleExported,
    BundleImported,
    DrainCompleted,
    CheckpointsPruned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event: JournalEvent,
    pub data: serde_json::Value,
    pub prev_hash: String,
    pub hash: String,
}

#[derive(Debug)]
struct ChainState {
    last_seq: u64,
    last_hash: String,
}

pub struct AuditJournal {
    path: PathBuf,
    inner: Mutex<ChainState>,
    max_bytes: u64,
}

impl AuditJournal {
    pub fn open<P: AsRef<Path>>(path: P, max_bytes: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (last_seq, last_hash) = Self::load_state(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(ChainState {
                last_seq,
                last_hash,
            }),
            max_bytes,
        })
    }

    /// Walk the live file to find where the chain ends. A torn final line
    /// from an interrupted append is moved to `<name>.torn-<millis>` and cut
    /// off so the chain continues from the last complete entry.
    fn load_state(path: &Path) -> Result<(u64, String)> {
        let mut last_seq = 0;
        let mut last_hash = CHAIN_START.to_string();
        if !path.exists() {
            return Ok((last_seq, last_hash));
        }
        let bytes = fs::read(path).at(path)?;
        let mut offset = 0;
        let mut needs_newline = false;
        for line in bytes.split_inclusive(|b| *b == b'\n') {
            let start = offset;
            offset += line.len();
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<JournalEntry>(line) {
                Ok(entry) => {
                    last_seq = entry.seq;
                    last_hash = entry.hash;
                    needs_newline = !line.ends_with(b"\n");
                }
                Err(e) if offset == bytes.len() => {
                    Self::cut_torn_tail(path, &bytes[start..], start as u64, &e)?;
                }
                Err(e) => {
                    return Err(VaultError::CorruptRecord {
                        path: path.to_path_buf(),
                        reason: e.to_string(),
                    })
                }
            }
        }
        if needs_newline {
            // Entry landed but its newline did not.
            let mut file = OpenOptions::new().append(true).open(path).at(path)?;
            writeln!(file).at(path)?;
        }
        Ok((last_seq, last_hash))
    }

    fn cut_torn_tail(path: &Path, tail: &[u8], keep: u64, cause: &serde_json::Error) -> Result<()> {
        let mut name = path.file_name().unwrap_or_default().to_owned();
        name.push(format!(".torn-{}", now_millis()));
        let aside = path.with_file_name(name);
        fs::write(&aside, tail).at(&aside)?;
        let file = OpenOptions::new().write(true).open(path).at(path)?;
        file.set_len(keep).at(path)?;
        file.sync_all().at(path)?;
        warn!(
            path = %path.display(),
            aside = %aside.display(),
            error = %cause,
            "audit journal ended in a partial entry, set it aside"
        );
        Ok(())
    }

    fn read_entries(path: &Path) -> Result<Vec<JournalEntry>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(path).at(path)?;
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.at(path)?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: JournalEntry =
                serde_json::from_str(&line).map_err(|e| VaultError::CorruptRecord {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    fn compute_hash(entry_without_hash: &serde_json::Value) -> String {
        blake3::hash(entry_without_hash.to_string().as_bytes())
            .to_hex()
            .to_string()
    }

    pub fn append(&self, event: JournalEvent, data: serde_json::Value) -> Result<JournalEntry> {
        let mut state = self.inner.lock();
        self.rotate_if_needed(&mut state)?;
        let seq = state.last_seq + 1;
        let mut value = serde_json::json!({
            "seq": seq,
            "timestamp": Utc::now(),
            "event": event,
            "data": data,
            "prev_hash": state.last_hash,
        });
        let hash = Self::compute_hash(&value);
        value["hash"] = serde_json::Value::String(hash.clone());
        let entry: JournalEntry = serde_json::from_value(value)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .at(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(&entry)?).at(&self.path)?;
        file.sync_data().at(&self.path)?;

        state.last_seq = seq;
        state.last_hash = hash;
        Ok(entry)
    }

    fn rotate_if_needed(&self, state: &mut ChainState) -> Result<()> {
        match fs::metadata(&self.path) {
            Ok(meta) if meta.len() >= self.max_bytes => {}
            _ => return Ok(()),
        }
        for i in (1..=MAX_ROTATIONS).rev() {
            let rotated = self.path_with_suffix(i);
            if rotated.exists() {
                if i == MAX_ROTATIONS {
                    fs::remove_file(&rotated).at(&rotated)?;
                } else {
                    let next = self.path_with_suffix(i + 1);
                    fs::rename(&rotated, &next).at(&rotated)?;
                }
            }
        }
        let first = self.path_with_suffix(1);
        fs::rename(&self.path, &first).at(&self.path)?;
        state.last_hash = CHAIN_START.to_string();
        Ok(())
    }

    fn path_with_suffix(&self, index: usize) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_owned();
        name.push(format!(".{index}"));
        self.path.with_file_name(name)
    }

    /// Entries of the live file, newest first.
    pub fn read_recent(&self, limit: Option<usize>) -> Result<Vec<JournalEntry>> {
        let mut entries = Self::read_entries(&self.path)?;
        entries.reverse();
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// Re-walk the live file and check every link. Returns the number of
    /// entries verified.
    pub fn verify_chain(&self) -> Result<usize> {
        let entries = Self::read_entries(&self.path)?;
        let mut prev = CHAIN_START.to_string();
        for entry in &entries {
            let mut value = serde_json::to_value(entry)?;
            if let Some(map) = value.as_object_mut() {
                map.remove("hash");
            }
            if entry.prev_hash != prev || Self::compute_hash(&value) != entry.hash {
                return Err(VaultError::CorruptRecord {
                    path: self.path.clone(),
                    reason: format!("journal chain broken at seq {}", entry.seq),
                });
            }
            prev = entry.hash.clone();
        }
        Ok(entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn chain_verifies_and_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let journal = AuditJournal::open(&path, DEFAULT_MAX_BYTES).unwrap();
            for i in 0..3 {
                journal
                    .append(JournalEvent::DrainCompleted, serde_json::json!({"i": i}))
                    .unwrap();
            }
        }
        let journal = AuditJournal::open(&path, DEFAULT_MAX_BYTES).unwrap();
        let e = journal
            .append(JournalEvent::ProfileApplied, serde_json::json!({"name": "default"}))
            .unwrap();
        assert_eq!(e.seq, 4);
        assert_eq!(journal.verify_chain().unwrap(), 4);
        assert_eq!(journal.read_recent(Some(1)).unwrap()[0].seq, 4);
    }

    #[test]
    fn edited_line_breaks_chain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let journal = AuditJournal::open(&path, DEFAULT_MAX_BYTES).unwrap();
        journal
            .append(JournalEvent::BundleImported, serde_json::json!({"newEntityId": "b"}))
            .unwrap();
        journal
            .append(JournalEvent::DrainCompleted, serde_json::json!({"processed": 1}))
            .unwrap();
        let tampered = fs::read_to_string(&path)
            .unwrap()
            .replace("\"processed\":1", "\"processed\":9");
        fs::write(&path, tampered).unwrap();
        assert!(journal.verify_chain().is_err());
    }

    #[test]
    fn rotation_keeps_sequence_monotonic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let journal = AuditJournal::open(&path, 512).unwrap();
        for i in 0..40 {
            let e = journal
                .append(JournalEvent::DrainCompleted, serde_json::json!({"i": i}))
                .unwrap();
            assert_eq!(e.seq as usize, i + 1);
        }
        assert!(dir.path().join("audit.jsonl.1").exists());
        journal.verify_chain().unwrap();
    }
}
