//! Background drain loop for `vault-sync run`.
//!
//! Sleeps for the active profile's sync interval (re-read every cycle, so a
//! profile change takes effect on the next pass), drains, then applies
//! checkpoint retention. Shutdown runs one final pass so nothing accepted
//! from stdin is left queued.

use std::sync::Arc;

use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};
use vault_core::VaultEngine;

pub struct SyncLoopHandle {
    /// Wake the loop early, e.g. when the queue is full.
    pub wake: Arc<Notify>,
    /// Send `true` to drain once more and stop.
    pub shutdown_tx: watch::Sender<bool>,
}

pub fn spawn_sync_loop(engine: Arc<VaultEngine>) -> (tokio::task::JoinHandle<()>, SyncLoopHandle) {
    let wake = Arc::new(Notify::new());
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let wake_clone = wake.clone();

    let handle = tokio::spawn(async move {
        info!(
            interval_secs = engine.sync_interval().as_secs(),
            "sync loop started"
        );
        loop {
            let mut stopping = false;
            tokio::select! {
                _ = tokio::time::sleep(engine.sync_interval()) => {}
                _ = wake_clone.notified() => {
                    debug!("sync loop woken early");
                }
                changed = shutdown_rx.changed() => {
                    // A dropped sender also means stop.
                    stopping = changed.is_err() || *shutdown_rx.borrow();
                }
            }

            run_pass(&engine).await;

            if stopping {
                info!("sync loop stopped");
                return;
            }
        }
    });

    (handle, SyncLoopHandle { wake, shutdown_tx })
}

async fn run_pass(engine: &Arc<VaultEngine>) {
    let summary = engine.drain_now().await;
    if summary.skipped || summary.is_idle() {
        return;
    }
    for failure in &summary.errors {
        warn!(
            item_id = %failure.item_id,
            entity_id = %failure.entity_id,
            collection = %failure.collection,
            error = %failure.error,
            "item left unsynced"
        );
    }
    if summary.processed == 0 {
        return;
    }
    let engine = Arc::clone(engine);
    match tokio::task::spawn_blocking(move || engine.cleanup_checkpoints(None, None)).await {
        Ok(Ok(report)) if report.removed + report.archived > 0 => {
            debug!(removed = report.removed, archived = report.archived, "retention applied");
        }
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!(error = %e, "checkpoint retention failed"),
        Err(e) => warn!(error = %e, "checkpoint retention task panicked"),
    }
}
