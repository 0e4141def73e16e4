//! Canvas service — CRUD, join/part, and state hydration.
//!
//! DESIGN
//! ======
//! Canvases are created, listed and deleted straight against Postgres.
//! Canvas state is hydrated on first join and kept in memory while any
//! viewer is subscribed to the canvas topic. Undo histories for the canvas
//! are loaded on join as well; they stay in memory after the canvas leaves.
//!
//! ERROR HANDLING
//! ==============
//! On last-viewer part, dirty and removed objects are flushed before
//! eviction. If that flush fails, the canvas stays in memory with its
//! pending sets intact so the persistence task can retry; that task evicts
//! it once a flush succeeds and nobody has rejoined.

use std::collections::HashMap;

use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::frame::{ErrorCode, Frame};
use crate::state::{AppState, CanvasObject, CanvasState};

use super::bus::canvas_topic;
use super::history;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CanvasError {
    #[error("canvas not found: {0}")]
    NotFound(Uuid),
    #[error("canvas name must not be empty")]
    EmptyName,
    #[error("broadcast bus unavailable: {0}")]
    Bus(#[from] super::bus::BusError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ErrorCode for CanvasError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_CANVAS_NOT_FOUND",
            Self::EmptyName => "E_VALIDATION",
            Self::Bus(e) => e.error_code(),
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// Row returned from canvas queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanvasRow {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Option<Uuid>,
}

// =============================================================================
// CRUD
// =============================================================================

/// Create a new canvas owned by `owner_id`.
///
/// # Errors
///
/// Returns `EmptyName` for a blank name or a database error.
pub async fn create_canvas(pool: &PgPool, name: &str, owner_id: Uuid) -> Result<CanvasRow, CanvasError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(CanvasError::EmptyName);
    }
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO canvases (id, name, owner_id) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(name)
        .bind(owner_id)
        .execute(pool)
        .await?;

    info!(%id, %owner_id, "canvas created");
    Ok(CanvasRow { id, name: name.to_owned(), owner_id: Some(owner_id) })
}

/// List canvases visible to `actor_id`: their own plus unowned ones.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn list_canvases(pool: &PgPool, actor_id: Uuid) -> Result<Vec<CanvasRow>, CanvasError> {
    let rows = sqlx::query_as::<_, (Uuid, String, Option<Uuid>)>(
        "SELECT id, name, owner_id
         FROM canvases
         WHERE owner_id = $1 OR owner_id IS NULL
         ORDER BY created_at DESC",
    )
    .bind(actor_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(id, name, owner_id)| CanvasRow { id, name, owner_id })
        .collect())
}

/// Delete a canvas. Objects and histories cascade in Postgres; the live
/// copy and in-memory histories are dropped too.
///
/// # Errors
///
/// Returns `NotFound` if no canvas owned by `actor_id` matched, or a
/// database error.
pub async fn delete_canvas(state: &AppState, canvas_id: Uuid, actor_id: Uuid) -> Result<(), CanvasError> {
    let result = sqlx::query("DELETE FROM canvases WHERE id = $1 AND (owner_id = $2 OR owner_id IS NULL)")
        .bind(canvas_id)
        .bind(actor_id)
        .execute(&state.pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(CanvasError::NotFound(canvas_id));
    }

    forget_canvas(state, canvas_id).await;
    info!(%canvas_id, %actor_id, "canvas deleted");
    Ok(())
}

/// Drop every in-memory trace of a canvas.
pub(crate) async fn forget_canvas(state: &AppState, canvas_id: Uuid) {
    state.canvases.write().await.remove(&canvas_id);
    let mut histories = state.histories.write().await;
    histories.retain(|key, _| {
        let keep = key.canvas_id != canvas_id;
        if !keep {
            state.history_saves.cancel(key);
        }
        keep
    });
}

// =============================================================================
// JOIN / PART
// =============================================================================

/// Join a canvas: hydrate it if it isn't live, load undo histories, and
/// subscribe `subscriber` to the canvas topic. Returns the current objects
/// in stacking order.
///
/// # Errors
///
/// Returns `NotFound` if the canvas doesn't exist, or a database error.
pub async fn join_canvas(
    state: &AppState,
    canvas_id: Uuid,
    subscriber: Uuid,
    tx: mpsc::Sender<Frame>,
) -> Result<Vec<CanvasObject>, CanvasError> {
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM canvases WHERE id = $1)")
        .bind(canvas_id)
        .fetch_one(&state.pool)
        .await?;
    if !exists {
        return Err(CanvasError::NotFound(canvas_id));
    }

    let loaded = history::load_histories(&state.pool, canvas_id).await?;
    let installed = history::install_histories(state, loaded).await;

    let mut snapshot = None;
    let mut canvases = loop {
        if snapshot.is_none() && !state.canvases.read().await.contains_key(&canvas_id) {
            snapshot = Some(hydrate_objects(&state.pool, canvas_id).await?);
        }
        let canvases = state.canvases.write().await;
        if snapshot.is_some() || canvases.contains_key(&canvas_id) {
            break canvases;
        }
        // Evicted between the check and the write lock; hydrate again.
    };
    let canvas = canvases.entry(canvas_id).or_insert_with(|| {
        let objects = snapshot.unwrap_or_default();
        info!(%canvas_id, count = objects.len(), histories = installed, "hydrated canvas from database");
        CanvasState { objects, ..CanvasState::default() }
    });

    // Subscribe under the canvas lock; part checks the count under it too.
    state.bus.subscribe(&canvas_topic(canvas_id), subscriber, tx).await?;

    let mut objects: Vec<CanvasObject> = canvas.objects.values().cloned().collect();
    objects.sort_by_key(|o| (o.z_index, o.id));
    info!(%canvas_id, %subscriber, "viewer joined canvas");
    Ok(objects)
}

/// Leave a canvas. If this was the last subscriber, flush pending writes
/// and evict the canvas from memory.
pub async fn part_canvas(state: &AppState, canvas_id: Uuid, subscriber: Uuid) {
    let topic = canvas_topic(canvas_id);
    let remaining = state.bus.unsubscribe(&topic, subscriber).await;
    info!(%canvas_id, %subscriber, remaining, "viewer left canvas");
    if remaining > 0 {
        return;
    }

    let pending = {
        let mut canvases = state.canvases.write().await;
        if state.bus.subscriber_count(&topic).await > 0 {
            return;
        }
        let Some(canvas) = canvases.get(&canvas_id) else {
            return;
        };
        if canvas.dirty.is_empty() && canvas.removed.is_empty() {
            canvases.remove(&canvas_id);
            info!(%canvas_id, "evicted canvas from memory");
            return;
        }
        PendingWrites::snapshot(canvas_id, canvas)
    };

    let result = pending.write(&state.pool).await;

    let mut canvases = state.canvases.write().await;
    if state.bus.subscriber_count(&topic).await > 0 {
        if let Some(canvas) = canvases.get_mut(&canvas_id) {
            if result.is_ok() {
                pending.acknowledge(canvas);
            }
        }
        return;
    }
    let Some(canvas) = canvases.get_mut(&canvas_id) else {
        return;
    };

    match result {
        Ok(()) => {
            pending.acknowledge(canvas);
            if canvas.dirty.is_empty() && canvas.removed.is_empty() {
                canvases.remove(&canvas_id);
                info!(%canvas_id, "evicted canvas from memory");
            } else {
                warn!(%canvas_id, remaining_dirty = canvas.dirty.len(), "retaining canvas after final flush because newer writes exist");
            }
        }
        Err(e) => {
            error!(error = %e, %canvas_id, "final flush failed; canvas retained for retry");
        }
    }
}

// =============================================================================
// PENDING WRITES
// =============================================================================

/// Snapshot of one canvas's unflushed work, taken under the lock and
/// written without it.
#[derive(Debug)]
pub(crate) struct PendingWrites {
    pub(crate) canvas_id: Uuid,
    pub(crate) objects: Vec<CanvasObject>,
    pub(crate) removed: Vec<Uuid>,
}

impl PendingWrites {
    pub(crate) fn snapshot(canvas_id: Uuid, canvas: &CanvasState) -> Self {
        let objects = canvas
            .dirty
            .iter()
            .filter_map(|id| canvas.objects.get(id).cloned())
            .collect();
        Self { canvas_id, objects, removed: canvas.removed.iter().copied().collect() }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.removed.is_empty()
    }

    pub(crate) async fn write(&self, pool: &PgPool) -> Result<(), sqlx::Error> {
        flush_objects(pool, &self.objects).await?;
        delete_removed(pool, &self.removed).await
    }

    /// Clear flags for what was written. A dirty flag survives if the object
    /// moved on to a newer version since the snapshot.
    pub(crate) fn acknowledge(&self, canvas: &mut CanvasState) {
        for flushed in &self.objects {
            let current = canvas.objects.get(&flushed.id).map(|o| o.version);
            if current.is_none_or(|v| v == flushed.version) {
                canvas.dirty.remove(&flushed.id);
            }
        }
        for id in &self.removed {
            canvas.removed.remove(id);
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

type ObjectRow = (
    Uuid,
    Uuid,
    String,
    f64,
    f64,
    i32,
    Option<Uuid>,
    Option<Uuid>,
    serde_json::Value,
    Option<Uuid>,
    Option<i64>,
    Option<Uuid>,
    i32,
);

async fn hydrate_objects(pool: &PgPool, canvas_id: Uuid) -> Result<HashMap<Uuid, CanvasObject>, sqlx::Error> {
    let rows = sqlx::query_as::<_, ObjectRow>(
        "SELECT id, canvas_id, kind, x, y, z_index, group_id, component_id, data, \
                locked_by, locked_at, created_by, version \
         FROM canvas_objects WHERE canvas_id = $1",
    )
    .bind(canvas_id)
    .fetch_all(pool)
    .await?;

    let mut objects = HashMap::with_capacity(rows.len());
    for (id, canvas_id, kind, x, y, z_index, group_id, component_id, data, locked_by, locked_at, created_by, version) in rows {
        objects.insert(
            id,
            CanvasObject {
                id,
                canvas_id,
                kind,
                x,
                y,
                z_index,
                group_id,
                component_id,
                data,
                locked_by,
                locked_at,
                created_by,
                version,
            },
        );
    }
    Ok(objects)
}

/// Upsert objects to Postgres.
///
/// # Errors
///
/// Returns the first database error.
pub async fn flush_objects(pool: &PgPool, objects: &[CanvasObject]) -> Result<(), sqlx::Error> {
    for obj in objects {
        sqlx::query(
            "INSERT INTO canvas_objects (id, canvas_id, kind, x, y, z_index, group_id, component_id, data, \
                                         locked_by, locked_at, created_by, version, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, now()) \
             ON CONFLICT (id) DO UPDATE SET \
                 kind = EXCLUDED.kind, x = EXCLUDED.x, y = EXCLUDED.y, z_index = EXCLUDED.z_index, \
                 group_id = EXCLUDED.group_id, component_id = EXCLUDED.component_id, data = EXCLUDED.data, \
                 locked_by = EXCLUDED.locked_by, locked_at = EXCLUDED.locked_at, \
                 version = EXCLUDED.version, updated_at = now()",
        )
        .bind(obj.id)
        .bind(obj.canvas_id)
        .bind(&obj.kind)
        .bind(obj.x)
        .bind(obj.y)
        .bind(obj.z_index)
        .bind(obj.group_id)
        .bind(obj.component_id)
        .bind(&obj.data)
        .bind(obj.locked_by)
        .bind(obj.locked_at)
        .bind(obj.created_by)
        .bind(obj.version)
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Delete rows for objects removed from a live canvas.
///
/// # Errors
///
/// Returns a database error if the delete fails.
pub async fn delete_removed(pool: &PgPool, ids: &[Uuid]) -> Result<(), sqlx::Error> {
    if ids.is_empty() {
        return Ok(());
    }
    sqlx::query("DELETE FROM canvas_objects WHERE id = ANY($1)")
        .bind(ids)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
#[path = "canvas_test.rs"]
mod tests;
