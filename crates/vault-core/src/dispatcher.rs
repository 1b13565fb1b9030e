//! Ordered queue of pending state updates, drained one pass at a time.
//!
//! A pass takes a snapshot of the queue, then writes each item in enqueue
//! order on the blocking pool under a per-item timeout. One failing item is
//! recorded and the pass carries on with the next. Only one pass runs at a
//! time; a second `drain_now` while one is running returns immediately with
//! nothing processed, and anything enqueued meanwhile waits for the next pass.
//!
//! An item is synced once its record and index entry are written. A missing
//! mirror checkpoint is reported on the synced item, never as a failure.
//!
//! A blocking write cannot be cancelled. When one outlives the item timeout
//! it stays in flight: the pass stops, the rest of the batch goes back to the
//! front of the queue, and later passes wait on that write before touching
//! anything else.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::checkpoint::{CheckpointManager, MirrorCheckpoint};
use crate::error::{Result, VaultError};
use crate::now_millis;
use crate::paths::Collection;
use crate::store::{VaultRecord, VaultStore, WriteOptions};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncItem {
    pub id: Uuid,
    pub entity_id: String,
    pub collection: Collection,
    pub timestamp: i64,
    pub payload: Value,
}

impl SyncItem {
    pub fn new(entity_id: impl Into<String>, collection: Collection, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id: entity_id.into(),
            collection,
            timestamp: now_millis(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueReceipt {
    pub queued: bool,
    pub queue_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFailure {
    pub item_id: Uuid,
    pub entity_id: String,
    pub collection: Collection,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedItem {
    pub item_id: Uuid,
    pub entity_id: String,
    pub collection: Collection,
    pub checksum: String,
    /// Logical timestamp the item was enqueued with.
    pub enqueued_at: i64,
    pub synced_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<i64>,
    /// Set when the record committed but its mirror checkpoint could not be
    /// written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainSummary {
    pub processed: usize,
    pub errors: Vec<ItemFailure>,
    pub synced: Vec<SyncedItem>,
    pub last_sync_timestamp: Option<i64>,
    /// Set when another pass was already running and this call did nothing.
    pub skipped: bool,
    /// An item whose write is still running after the item timeout. Its
    /// outcome is reported by a later pass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stalled: Option<ItemFailure>,
}

impl DrainSummary {
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn synced_ids(&self) -> Vec<Uuid> {
        self.synced.iter().map(|s| s.item_id).collect()
    }

    /// True when the pass neither settled nor stalled any item.
    pub fn is_idle(&self) -> bool {
        self.processed == 0 && self.errors.is_empty() && self.stalled.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub sync_interval: Duration,
    pub item_timeout: Duration,
    pub max_queue_len: usize,
    pub protect_records: bool,
}

struct ItemWrite {
    record: VaultRecord,
    checkpoint: Result<Option<MirrorCheckpoint>>,
}

struct InFlight {
    item_id: Uuid,
    entity_id: String,
    collection: Collection,
    enqueued_at: i64,
    task: JoinHandle<Result<ItemWrite>>,
}

impl InFlight {
    fn failure(&self, error: &VaultError) -> ItemFailure {
        ItemFailure {
            item_id: self.item_id,
            entity_id: self.entity_id.clone(),
            collection: self.collection,
            error: error.to_string(),
        }
    }
}

pub struct SyncDispatcher {
    store: Arc<VaultStore>,
    checkpoints: Arc<CheckpointManager>,
    queue: Mutex<VecDeque<SyncItem>>,
    drain_guard: tokio::sync::Mutex<()>,
    in_flight: Mutex<Option<InFlight>>,
    settings: RwLock<DispatchSettings>,
    last_sync: Mutex<Option<i64>>,
}

impl SyncDispatcher {
    pub fn new(
        store: Arc<VaultStore>,
        checkpoints: Arc<CheckpointManager>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            checkpoints,
            queue: Mutex::new(VecDeque::new()),
            drain_guard: tokio::sync::Mutex::new(()),
            in_flight: Mutex::new(None),
            settings: RwLock::new(settings),
            last_sync: Mutex::new(None),
        }
    }

    pub fn enqueue(&self, item: SyncItem) -> EnqueueReceipt {
        let max = self.settings.read().max_queue_len;
        let mut queue = self.queue.lock();
        if queue.len() >= max {
            warn!(entity_id = %item.entity_id, queue_length = queue.len(), "sync queue full, item rejected");
            return EnqueueReceipt {
                queued: false,
                queue_length: queue.len(),
                item_id: None,
            };
        }
        let item_id = item.id;
        queue.push_back(item);
        EnqueueReceipt {
            queued: true,
            queue_length: queue.len(),
            item_id: Some(item_id),
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_draining(&self) -> bool {
        self.drain_guard.try_lock().is_err()
    }

    pub fn sync_interval(&self) -> Duration {
        self.settings.read().sync_interval
    }

    pub fn last_sync_timestamp(&self) -> Option<i64> {
        *self.last_sync.lock()
    }

    pub fn configure<F: FnOnce(&mut DispatchSettings)>(&self, update: F) {
        update(&mut self.settings.write());
    }

    pub async fn drain_now(&self) -> DrainSummary {
        let Ok(_guard) = self.drain_guard.try_lock() else {
            debug!("drain already in progress, skipping");
            return DrainSummary {
                skipped: true,
                last_sync_timestamp: self.last_sync_timestamp(),
                ..Default::default()
            };
        };

        let settings = self.settings.read().clone();
        let mut summary = DrainSummary::default();

        let pending = self.in_flight.lock().take();
        if let Some(pending) = pending {
            if !self.settle(pending, &settings, &mut summary).await {
                return self.finish(summary);
            }
        }

        let batch: Vec<SyncItem> = self.queue.lock().drain(..).collect();
        let mut batch = batch.into_iter();
        while let Some(item) = batch.next() {
            let pending = self.spawn_write(item, &settings);
            if !self.settle(pending, &settings, &mut summary).await {
                let mut queue = self.queue.lock();
                for rest in batch.rev() {
                    queue.push_front(rest);
                }
                break;
            }
        }

        self.finish(summary)
    }

    fn spawn_write(&self, item: SyncItem, settings: &DispatchSettings) -> InFlight {
        let store = Arc::clone(&self.store);
        let checkpoints = Arc::clone(&self.checkpoints);
        let options = WriteOptions {
            protected: settings.protect_records,
            ..Default::default()
        };
        let item_id = item.id;
        let entity_id = item.entity_id.clone();
        let collection = item.collection;
        let enqueued_at = item.timestamp;
        let task = tokio::task::spawn_blocking(move || {
            let record = store.put(item.collection, &item.entity_id, &item.payload, options)?;
            // The record is committed from here on.
            let checkpoint = checkpoints.record(&item.entity_id, item.collection, &record.checksum);
            Ok(ItemWrite { record, checkpoint })
        });
        InFlight {
            item_id,
            entity_id,
            collection,
            enqueued_at,
            task,
        }
    }

    /// Wait for one write and fold its outcome into `summary`. Returns false
    /// when the write is still running after the item timeout; it is then
    /// parked as in flight.
    async fn settle(
        &self,
        mut pending: InFlight,
        settings: &DispatchSettings,
        summary: &mut DrainSummary,
    ) -> bool {
        let waited = tokio::time::timeout(settings.item_timeout, &mut pending.task).await;
        let outcome = match waited {
            Err(_) => {
                let error = VaultError::Timeout(settings.item_timeout.as_millis() as u64);
                warn!(
                    item_id = %pending.item_id,
                    entity_id = %pending.entity_id,
                    collection = %pending.collection,
                    error = %error,
                    "sync item still writing, queue paused until it settles"
                );
                summary.stalled = Some(pending.failure(&error));
                *self.in_flight.lock() = Some(pending);
                return false;
            }
            Ok(Err(join)) => Err(VaultError::Task(join.to_string())),
            Ok(Ok(result)) => result,
        };

        match outcome {
            Ok(write) => {
                let (checkpoint, checkpoint_error) = match write.checkpoint {
                    Ok(checkpoint) => (checkpoint.map(|c| c.timestamp), None),
                    Err(e) => {
                        warn!(
                            item_id = %pending.item_id,
                            entity_id = %pending.entity_id,
                            error = %e,
                            "record committed without mirror checkpoint"
                        );
                        (None, Some(e.to_string()))
                    }
                };
                summary.processed += 1;
                summary.synced.push(SyncedItem {
                    item_id: pending.item_id,
                    entity_id: pending.entity_id,
                    collection: pending.collection,
                    checksum: write.record.checksum,
                    enqueued_at: pending.enqueued_at,
                    synced_at: write.record.last_updated,
                    checkpoint,
                    checkpoint_error,
                });
            }
            Err(e) => {
                warn!(
                    item_id = %pending.item_id,
                    entity_id = %pending.entity_id,
                    collection = %pending.collection,
                    error = %e,
                    "sync item failed"
                );
                summary.errors.push(pending.failure(&e));
            }
        }
        true
    }

    fn finish(&self, mut summary: DrainSummary) -> DrainSummary {
        let mut last_sync = self.last_sync.lock();
        if let Some(latest) = summary.synced.iter().map(|s| s.synced_at).max() {
            *last_sync = Some(latest);
        }
        summary.last_sync_timestamp = *last_sync;
        drop(last_sync);

        if !summary.is_idle() {
            info!(
                processed = summary.processed,
                errors = summary.errors.len(),
                stalled = summary.stalled.is_some(),
                "drain pass complete"
            );
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CipherAlgorithm, CryptoCodec, VaultKey};
    use crate::paths::VaultLayout;
    use serde_json::json;
    use tempfile::tempdir;

    fn dispatcher(root: &std::path::Path, max_queue_len: usize) -> SyncDispatcher {
        dispatcher_with_timeout(root, max_queue_len, Duration::from_secs(5))
    }

    fn dispatcher_with_timeout(
        root: &std::path::Path,
        max_queue_len: usize,
        item_timeout: Duration,
    ) -> SyncDispatcher {
        let layout = VaultLayout::new(root);
        let codec = Arc::new(CryptoCodec::new(
            VaultKey::generate(),
            CipherAlgorithm::XChaCha20Poly1305,
        ));
        let store = Arc::new(VaultStore::new(layout.clone(), codec));
        store.init().unwrap();
        let checkpoints = Arc::new(CheckpointManager::new(layout, true, false));
        SyncDispatcher::new(
            store,
            checkpoints,
            DispatchSettings {
                sync_interval: Duration::from_secs(30),
                item_timeout,
                max_queue_len,
                protect_records: false,
            },
        )
    }

    #[tokio::test]
    async fn drains_in_enqueue_order() {
        let dir = tempdir().unwrap();
        let d = dispatcher(dir.path(), 100);
        for v in 1..=5 {
            let r = d.enqueue(SyncItem::new("a1", Collection::AgentStates, json!({"v": v})));
            assert!(r.queued);
            assert_eq!(r.queue_length, v as usize);
        }
        let summary = d.drain_now().await;
        assert_eq!(summary.processed, 5);
        assert_eq!(summary.error_count(), 0);
        assert_eq!(d.queue_len(), 0);
        assert!(summary.synced.windows(2).all(|w| w[0].synced_at <= w[1].synced_at));
        assert!(summary.synced.windows(2).all(|w| w[0].enqueued_at <= w[1].enqueued_at));
        assert_eq!(d.store.get(Collection::AgentStates, "a1").unwrap().data, json!({"v": 5}));
        assert_eq!(d.checkpoints.list("a1").unwrap().len(), 5);
        assert_eq!(summary.last_sync_timestamp, summary.synced.last().map(|s| s.synced_at));
    }

    #[tokio::test]
    async fn failing_item_does_not_halt_pass() {
        let dir = tempdir().unwrap();
        let d = dispatcher(dir.path(), 100);
        d.enqueue(SyncItem::new("a1", Collection::AgentStates, json!(1)));
        let bad = d.enqueue(SyncItem::new("../escape", Collection::AgentStates, json!(2)));
        d.enqueue(SyncItem::new("a2", Collection::MirrorCheckpoints, json!(3)));
        d.enqueue(SyncItem::new("a3", Collection::CareerTrees, json!(4)));

        let summary = d.drain_now().await;
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.error_count(), 2);
        assert_eq!(Some(summary.errors[0].item_id), bad.item_id);
        assert!(summary.errors[1].error.contains("managed internally"));
        assert!(d.store.get(Collection::CareerTrees, "a3").is_ok());
    }

    #[tokio::test]
    async fn concurrent_drain_is_a_noop() {
        let dir = tempdir().unwrap();
        let d = dispatcher(dir.path(), 100);
        d.enqueue(SyncItem::new("a1", Collection::AgentStates, json!(1)));

        let held = d.drain_guard.lock().await;
        assert!(d.is_draining());
        let skipped = d.drain_now().await;
        assert!(skipped.skipped);
        assert_eq!(skipped.processed, 0);
        assert_eq!(d.queue_len(), 1);
        drop(held);

        let ran = d.drain_now().await;
        assert!(!ran.skipped);
        assert_eq!(ran.processed, 1);
    }

    #[tokio::test]
    async fn full_queue_rejects() {
        let dir = tempdir().unwrap();
        let d = dispatcher(dir.path(), 2);
        assert!(d.enqueue(SyncItem::new("a", Collection::VibeHistory, json!(1))).queued);
        assert!(d.enqueue(SyncItem::new("b", Collection::VibeHistory, json!(2))).queued);
        let rejected = d.enqueue(SyncItem::new("c", Collection::VibeHistory, json!(3)));
        assert!(!rejected.queued);
        assert_eq!(rejected.queue_length, 2);
        assert!(rejected.item_id.is_none());
    }

    #[tokio::test]
    async fn protected_flag_follows_settings() {
        let dir = tempdir().unwrap();
        let d = dispatcher(dir.path(), 10);
        d.configure(|s| s.protect_records = true);
        d.enqueue(SyncItem::new("a1", Collection::WhisperArchive, json!({"w": "hi"})));
        d.drain_now().await;
        assert!(d.store.get(Collection::WhisperArchive, "a1").unwrap().record.protected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn items_enqueued_mid_pass_wait_for_next_pass() {
        let dir = tempdir().unwrap();
        let d = Arc::new(dispatcher(dir.path(), 100));
        let first_id = d
            .enqueue(SyncItem::new("a1", Collection::AgentStates, json!({"v": 1})))
            .item_id;

        // Park the first write on the index lock so the pass stays open.
        let held = d.store.lock_index();
        let running = {
            let d = Arc::clone(&d);
            tokio::spawn(async move { d.drain_now().await })
        };
        while d.queue_len() > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(d.is_draining());
        let late_id = d
            .enqueue(SyncItem::new("a2", Collection::AgentStates, json!({"v": 2})))
            .item_id;
        drop(held);

        let first = running.await.unwrap();
        assert_eq!(first.synced_ids(), vec![first_id.unwrap()]);
        assert_eq!(d.queue_len(), 1);

        let second = d.drain_now().await;
        assert_eq!(second.synced_ids(), vec![late_id.unwrap()]);
        assert_eq!(d.queue_len(), 0);
    }

    #[tokio::test]
    async fn stalled_write_pauses_queue_until_it_settles() {
        let dir = tempdir().unwrap();
        let d = dispatcher_with_timeout(dir.path(), 100, Duration::from_millis(50));
        let first = d.enqueue(SyncItem::new("a1", Collection::AgentStates, json!({"v": 1})));
        let second = d.enqueue(SyncItem::new("a1", Collection::AgentStates, json!({"v": 2})));

        let held = d.store.lock_index();
        let paused = d.drain_now().await;
        assert_eq!(paused.processed, 0);
        assert!(paused.errors.is_empty());
        let stalled = paused.stalled.as_ref().unwrap();
        assert_eq!(Some(stalled.item_id), first.item_id);
        assert!(stalled.error.contains("timed out after 50 ms"));
        assert_eq!(d.queue_len(), 1);

        // The second item must not run alongside the unfinished first one.
        let still_paused = d.drain_now().await;
        assert!(still_paused.synced.is_empty());
        assert!(still_paused.stalled.is_some());
        assert_eq!(d.queue_len(), 1);

        drop(held);
        d.configure(|s| s.item_timeout = Duration::from_secs(5));
        let resumed = d.drain_now().await;
        assert!(resumed.stalled.is_none());
        assert_eq!(
            resumed.synced_ids(),
            vec![first.item_id.unwrap(), second.item_id.unwrap()]
        );
        assert_eq!(d.store.get(Collection::AgentStates, "a1").unwrap().data, json!({"v": 2}));
        assert_eq!(d.checkpoints.list("a1").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn checkpoint_failure_still_reports_committed_record() {
        let dir = tempdir().unwrap();
        let d = dispatcher(dir.path(), 10);
        let checkpoints_dir = dir.path().join("mirror-checkpoints");
        std::fs::remove_dir_all(&checkpoints_dir).unwrap();
        std::fs::write(&checkpoints_dir, b"not a directory").unwrap();

        let item = d.enqueue(SyncItem::new("a1", Collection::AgentStates, json!({"health": 100})));
        let summary = d.drain_now().await;
        assert_eq!(summary.processed, 1);
        assert!(summary.errors.is_empty());
        assert_eq!(summary.synced_ids(), vec![item.item_id.unwrap()]);
        assert!(summary.synced[0].checkpoint.is_none());
        assert!(summary.synced[0].checkpoint_error.is_some());
        assert_eq!(
            d.store.get(Collection::AgentStates, "a1").unwrap().data,
            json!({"health": 100})
        );
    }
}
