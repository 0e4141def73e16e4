//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor and
//! handed to every service. It holds the database pool, the live canvases
//! (objects plus dirty/removed sets for the persistence task), the per-actor
//! undo histories, the broadcast bus, and the debounced history writer.
//!
//! Live canvases and histories sit behind separate locks so a history push
//! never waits on an object write and vice versa.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::services::bus::{Broadcast, ChannelBus};
use crate::services::debounce::Debouncer;
use crate::services::history::{HistoryKey, UndoHistory};

/// Bounding size used when an object carries no width/height.
pub const DEFAULT_OBJECT_SIZE: f64 = 100.0;

// =============================================================================
// CANVAS OBJECT
// =============================================================================

/// In-memory representation of a canvas object. Mirrors `canvas_objects`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasObject {
    pub id: Uuid,
    pub canvas_id: Uuid,
    pub kind: String,
    pub x: f64,
    pub y: f64,
    pub z_index: i32,
    pub group_id: Option<Uuid>,
    pub component_id: Option<Uuid>,
    /// Shape attributes: width, height, fill, stroke, ...
    pub data: serde_json::Value,
    pub locked_by: Option<Uuid>,
    /// Milliseconds since Unix epoch. Set iff `locked_by` is set.
    pub locked_at: Option<i64>,
    pub created_by: Option<Uuid>,
    pub version: i32,
}

impl CanvasObject {
    /// Bounding width and height read from the shape payload.
    #[must_use]
    pub fn size(&self) -> (f64, f64) {
        let dim = |key: &str| self.data.get(key).and_then(serde_json::Value::as_f64);
        let diameter = dim("radius").map(|r| r * 2.0);
        let width = dim("width").or(diameter).unwrap_or(DEFAULT_OBJECT_SIZE);
        let height = dim("height").or(diameter).unwrap_or(width);
        (width, height)
    }

    /// True when the shape-defining fields match, ignoring lock state and version.
    #[cfg(test)]
    #[must_use]
    pub fn same_shape(&self, other: &Self) -> bool {
        self.id == other.id
            && self.kind == other.kind
            && (self.x - other.x).abs() < 1e-9
            && (self.y - other.y).abs() < 1e-9
            && self.z_index == other.z_index
            && self.group_id == other.group_id
            && self.component_id == other.component_id
            && self.data == other.data
    }
}

// =============================================================================
// CANVAS STATE
// =============================================================================

/// Per-canvas live state, flushed to Postgres by the persistence task.
#[derive(Debug, Default)]
pub struct CanvasState {
    pub objects: HashMap<Uuid, CanvasObject>,
    /// Object IDs modified since last flush.
    pub dirty: HashSet<Uuid>,
    /// Object IDs deleted since last flush.
    pub removed: HashSet<Uuid>,
}

impl CanvasState {
    /// Next stacking position: one above the current top object.
    #[must_use]
    pub fn next_z_index(&self) -> i32 {
        self.objects
            .values()
            .map(|o| o.z_index)
            .max()
            .map_or(0, |z| z.saturating_add(1))
    }
}

// =============================================================================
// APP STATE
// =============================================================================

/// Clone is required by Axum; all inner fields are Arc-wrapped or Copy.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub canvases: Arc<RwLock<HashMap<Uuid, CanvasState>>>,
    pub histories: Arc<RwLock<HashMap<HistoryKey, UndoHistory>>>,
    pub bus: Arc<dyn Broadcast>,
    pub history_saves: Debouncer<HistoryKey>,
    pub config: SyncConfig,
}

impl AppState {
    #[must_use]
    pub fn new(pool: PgPool, bus: Arc<dyn Broadcast>, config: SyncConfig) -> Self {
        Self {
            pool,
            canvases: Arc::new(RwLock::new(HashMap::new())),
            histories: Arc::new(RwLock::new(HashMap::new())),
            bus,
            history_saves: Debouncer::new(),
            config,
        }
    }

    /// State wired to the in-process channel bus.
    #[must_use]
    pub fn with_channel_bus(pool: PgPool, config: SyncConfig) -> Self {
        Self::new(pool, Arc::new(ChannelBus::new()), config)
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================
