//! Persistence service — background flush of live canvas changes.
//!
//! DESIGN
//! ======
//! A background task flushes dirty and removed objects, then waits one
//! interval before the next cycle. Mutations never touch Postgres on the
//! request path.
//!
//! ERROR HANDLING
//! ==============
//! Flags are cleared only after successful writes, and a dirty flag stays
//! if the object moved to a newer version during the write. Repeated upserts
//! are acceptable; silent loss is not. A canvas whose final flush on part
//! failed is evicted here once a retry succeeds and it has no viewers.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::state::AppState;

use super::bus::canvas_topic;
use super::canvas::PendingWrites;

/// Spawn the background persistence task. Returns a handle for shutdown.
pub fn spawn_persistence_task(state: AppState) -> JoinHandle<()> {
    let flush_interval_ms = state.config.object_flush_interval_ms;
    info!(flush_interval_ms, "object persistence flush configured");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(flush_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            flush_all_dirty(&state).await;
        }
    })
}

/// Totals from one flush pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub upserted: usize,
    pub deleted: usize,
    pub failed_canvases: usize,
    pub evicted: usize,
}

/// Write every canvas's pending changes once.
pub async fn flush_all_dirty(state: &AppState) -> FlushReport {
    // PHASE: SNAPSHOT UNDER LOCK
    let batches: Vec<PendingWrites> = {
        let canvases = state.canvases.read().await;
        canvases
            .iter()
            .map(|(canvas_id, canvas)| PendingWrites::snapshot(*canvas_id, canvas))
            .filter(|pending| !pending.is_empty())
            .collect()
    };

    // PHASE: WRITE WITHOUT LOCK, THEN ACK
    let mut report = FlushReport::default();
    for batch in batches {
        match batch.write(&state.pool).await {
            Ok(()) => {
                report.upserted += batch.objects.len();
                report.deleted += batch.removed.len();
                if acknowledge_flush(state, &batch).await {
                    report.evicted += 1;
                }
            }
            Err(e) => {
                report.failed_canvases += 1;
                error!(
                    error = %e,
                    canvas_id = %batch.canvas_id,
                    upserts = batch.objects.len(),
                    deletes = batch.removed.len(),
                    "persistence flush failed"
                );
            }
        }
    }
    report
}

/// Clear flags for a written batch. Evicts the canvas when nothing is left
/// pending and nobody is watching it, which only happens after a failed
/// final flush on part. Returns true if the canvas was evicted.
async fn acknowledge_flush(state: &AppState, batch: &PendingWrites) -> bool {
    let mut canvases = state.canvases.write().await;
    let Some(canvas) = canvases.get_mut(&batch.canvas_id) else {
        return false;
    };
    batch.acknowledge(canvas);
    if !canvas.dirty.is_empty() || !canvas.removed.is_empty() {
        return false;
    }
    if state.bus.subscriber_count(&canvas_topic(batch.canvas_id)).await > 0 {
        return false;
    }
    canvases.remove(&batch.canvas_id);
    info!(canvas_id = %batch.canvas_id, "evicted unwatched canvas after flush");
    true
}
