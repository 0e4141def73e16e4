//! Object store — create, read, update, delete for live canvas objects.
//!
//! DESIGN
//! ======
//! Mutations apply to the in-memory canvas immediately, bump the object
//! version, and mark the object dirty (or removed) for the persistence task.
//! Every single-object write goes through [`modify_object`], which works on
//! a draft and commits only if the caller's closure succeeds, so a rejected
//! edit never leaves a half-applied object behind.
//!
//! Batch creation validates items one by one and keeps every success even
//! when later items fail. There is no rollback.

use std::collections::HashSet;

use serde::Deserialize;
use uuid::Uuid;

use crate::frame::Data;
use crate::state::{AppState, CanvasObject};

/// Object kinds accepted on creation.
pub const KNOWN_KINDS: &[&str] =
    &["rectangle", "circle", "ellipse", "text", "line", "frame", "group", "component_instance"];

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ObjectError {
    #[error("object not found: {0}")]
    NotFound(Uuid),
    #[error("canvas not loaded: {0}")]
    CanvasNotLoaded(Uuid),
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("batch of {count} objects exceeds the limit of {limit}")]
    BatchTooLarge { count: usize, limit: usize },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl crate::frame::ErrorCode for ObjectError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_NOT_FOUND",
            Self::CanvasNotLoaded(_) => "E_CANVAS_NOT_LOADED",
            Self::Invalid(_) | Self::BatchTooLarge { .. } => "E_VALIDATION",
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// A committed change, in the shape broadcast to viewers.
#[derive(Debug, Clone)]
pub enum Mutation {
    Created(CanvasObject),
    Updated(CanvasObject),
    Deleted(Uuid),
}

/// Attributes for a new object.
#[derive(Debug, Clone, Deserialize)]
pub struct NewObject {
    pub kind: String,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub z_index: Option<i32>,
    #[serde(default)]
    pub group_id: Option<Uuid>,
    #[serde(default)]
    pub component_id: Option<Uuid>,
    #[serde(default = "empty_data")]
    pub data: serde_json::Value,
}

fn empty_data() -> serde_json::Value {
    serde_json::json!({})
}

impl NewObject {
    #[must_use]
    pub fn new(kind: impl Into<String>, x: f64, y: f64, data: serde_json::Value) -> Self {
        Self { kind: kind.into(), x, y, z_index: None, group_id: None, component_id: None, data }
    }

    /// # Errors
    ///
    /// Returns `Invalid` for an unknown kind, non-finite coordinates, a
    /// non-object payload, or a non-positive width/height.
    pub fn validate(&self) -> Result<(), ObjectError> {
        if !KNOWN_KINDS.contains(&self.kind.as_str()) {
            return Err(ObjectError::Invalid(format!("unknown object kind: {:?}", self.kind)));
        }
        if !self.x.is_finite() || !self.y.is_finite() {
            return Err(ObjectError::Invalid("position must be finite".into()));
        }
        validate_payload(&self.data)
    }
}

/// Shape payloads must be objects; `width`, `height` and `radius`, when
/// present, must be positive finite numbers.
fn validate_payload(data: &serde_json::Value) -> Result<(), ObjectError> {
    let Some(payload) = data.as_object() else {
        return Err(ObjectError::Invalid("data must be an object".into()));
    };
    for key in ["width", "height", "radius"] {
        let Some(value) = payload.get(key) else {
            continue;
        };
        match value.as_f64() {
            Some(v) if v.is_finite() && v > 0.0 => {}
            _ => return Err(ObjectError::Invalid(format!("{key} must be a positive number"))),
        }
    }
    Ok(())
}

// =============================================================================
// READ
// =============================================================================

/// # Errors
///
/// Returns `CanvasNotLoaded` or `NotFound`.
pub async fn get_object(state: &AppState, canvas_id: Uuid, object_id: Uuid) -> Result<CanvasObject, ObjectError> {
    let canvases = state.canvases.read().await;
    let canvas = canvases
        .get(&canvas_id)
        .ok_or(ObjectError::CanvasNotLoaded(canvas_id))?;
    canvas
        .objects
        .get(&object_id)
        .cloned()
        .ok_or(ObjectError::NotFound(object_id))
}

/// Resolve ids to objects in request order. Missing and repeated ids are
/// dropped silently.
///
/// # Errors
///
/// Returns `CanvasNotLoaded` if the canvas isn't in memory.
pub async fn get_objects(state: &AppState, canvas_id: Uuid, ids: &[Uuid]) -> Result<Vec<CanvasObject>, ObjectError> {
    let canvases = state.canvases.read().await;
    let canvas = canvases
        .get(&canvas_id)
        .ok_or(ObjectError::CanvasNotLoaded(canvas_id))?;
    let mut seen = HashSet::with_capacity(ids.len());
    Ok(ids
        .iter()
        .filter(|id| seen.insert(**id))
        .filter_map(|id| canvas.objects.get(id).cloned())
        .collect())
}

// =============================================================================
// CREATE
// =============================================================================

/// # Errors
///
/// Returns `CanvasNotLoaded` or a validation error.
pub async fn create_object(
    state: &AppState,
    canvas_id: Uuid,
    new: NewObject,
    created_by: Option<Uuid>,
) -> Result<CanvasObject, ObjectError> {
    new.validate()?;
    let mut canvases = state.canvases.write().await;
    let canvas = canvases
        .get_mut(&canvas_id)
        .ok_or(ObjectError::CanvasNotLoaded(canvas_id))?;
    Ok(insert_new(canvas, canvas_id, new, created_by))
}

fn insert_new(
    canvas: &mut crate::state::CanvasState,
    canvas_id: Uuid,
    new: NewObject,
    created_by: Option<Uuid>,
) -> CanvasObject {
    let obj = CanvasObject {
        id: Uuid::new_v4(),
        canvas_id,
        kind: new.kind,
        x: new.x,
        y: new.y,
        z_index: new.z_index.unwrap_or_else(|| canvas.next_z_index()),
        group_id: new.group_id,
        component_id: new.component_id,
        data: new.data,
        locked_by: None,
        locked_at: None,
        created_by,
        version: 1,
    };
    canvas.dirty.insert(obj.id);
    canvas.objects.insert(obj.id, obj.clone());
    obj
}

/// Create many objects in one pass. Each item succeeds or fails on its own;
/// successes stay in place whatever happens to the rest.
///
/// # Errors
///
/// Returns `BatchTooLarge` above the configured cap, or `CanvasNotLoaded`.
/// Per-item validation failures are reported in the returned list.
pub async fn batch_create(
    state: &AppState,
    canvas_id: Uuid,
    items: Vec<NewObject>,
    created_by: Option<Uuid>,
) -> Result<Vec<Result<CanvasObject, ObjectError>>, ObjectError> {
    let limit = state.config.batch_create_limit;
    if items.len() > limit {
        return Err(ObjectError::BatchTooLarge { count: items.len(), limit });
    }

    let mut canvases = state.canvases.write().await;
    let canvas = canvases
        .get_mut(&canvas_id)
        .ok_or(ObjectError::CanvasNotLoaded(canvas_id))?;

    Ok(items
        .into_iter()
        .map(|item| {
            item.validate()?;
            Ok(insert_new(canvas, canvas_id, item, created_by))
        })
        .collect())
}

/// Put a previously deleted object back under its original id.
///
/// # Errors
///
/// Returns `CanvasNotLoaded` if the canvas isn't in memory.
pub async fn insert_object(state: &AppState, canvas_id: Uuid, mut obj: CanvasObject) -> Result<CanvasObject, ObjectError> {
    let mut canvases = state.canvases.write().await;
    let canvas = canvases
        .get_mut(&canvas_id)
        .ok_or(ObjectError::CanvasNotLoaded(canvas_id))?;

    obj.canvas_id = canvas_id;
    obj.version = canvas
        .objects
        .get(&obj.id)
        .map_or(obj.version, |current| current.version.max(obj.version))
        + 1;
    canvas.removed.remove(&obj.id);
    canvas.dirty.insert(obj.id);
    canvas.objects.insert(obj.id, obj.clone());
    Ok(obj)
}

// =============================================================================
// UPDATE
// =============================================================================

/// Run `edit` against a draft of the object and commit it on success,
/// bumping the version and marking it dirty. Returns the closure's value
/// and the committed object.
///
/// # Errors
///
/// Returns `CanvasNotLoaded`, `NotFound`, or whatever `edit` rejects with.
pub async fn modify_object<T, E, F>(state: &AppState, canvas_id: Uuid, object_id: Uuid, edit: F) -> Result<(T, CanvasObject), E>
where
    F: FnOnce(&mut CanvasObject) -> Result<T, E>,
    E: From<ObjectError>,
{
    let mut canvases = state.canvases.write().await;
    let canvas = canvases
        .get_mut(&canvas_id)
        .ok_or(ObjectError::CanvasNotLoaded(canvas_id))?;
    let current = canvas
        .objects
        .get_mut(&object_id)
        .ok_or(ObjectError::NotFound(object_id))?;

    let mut draft = current.clone();
    let out = edit(&mut draft)?;
    draft.id = current.id;
    draft.canvas_id = current.canvas_id;
    draft.version = current.version + 1;
    *current = draft.clone();
    canvas.dirty.insert(object_id);
    Ok((out, draft))
}

/// Apply a partial update from a data map. Recognized keys: `x`, `y`,
/// `z_index`, `group_id`, `component_id` (null clears), `data` (replaces).
///
/// # Errors
///
/// Returns `Invalid` for non-finite coordinates, a malformed reference, or
/// a payload with a non-positive width/height/radius.
fn apply_updates(obj: &mut CanvasObject, updates: &Data) -> Result<(), ObjectError> {
    for key in ["x", "y"] {
        let Some(value) = updates.get(key) else {
            continue;
        };
        let Some(v) = value.as_f64().filter(|v| v.is_finite()) else {
            return Err(ObjectError::Invalid(format!("{key} must be a finite number")));
        };
        if key == "x" {
            obj.x = v;
        } else {
            obj.y = v;
        }
    }
    if let Some(z) = updates.get("z_index") {
        let z = z
            .as_i64()
            .and_then(|z| i32::try_from(z).ok())
            .ok_or_else(|| ObjectError::Invalid("z_index must be an integer".into()))?;
        obj.z_index = z;
    }
    if let Some(value) = updates.get("group_id") {
        obj.group_id = parse_reference("group_id", value)?;
    }
    if let Some(value) = updates.get("component_id") {
        obj.component_id = parse_reference("component_id", value)?;
    }
    if let Some(data) = updates.get("data") {
        validate_payload(data)?;
        obj.data = data.clone();
    }
    Ok(())
}

fn parse_reference(key: &str, value: &serde_json::Value) -> Result<Option<Uuid>, ObjectError> {
    if value.is_null() {
        return Ok(None);
    }
    value
        .as_str()
        .and_then(|s| s.parse().ok())
        .map(Some)
        .ok_or_else(|| ObjectError::Invalid(format!("{key} must be a uuid or null")))
}

/// Apply a partial update if `check` accepts the current object; returns
/// the object before and after. The check and the write happen under one
/// write lock.
///
/// # Errors
///
/// Returns `CanvasNotLoaded`, `NotFound`, `Invalid`, or whatever `check`
/// rejects with.
pub async fn update_object<E, F>(
    state: &AppState,
    canvas_id: Uuid,
    object_id: Uuid,
    updates: &Data,
    check: F,
) -> Result<(CanvasObject, CanvasObject), E>
where
    F: FnOnce(&CanvasObject) -> Result<(), E>,
    E: From<ObjectError>,
{
    modify_object(state, canvas_id, object_id, |obj| {
        check(obj)?;
        let before = obj.clone();
        apply_updates(obj, updates)?;
        Ok(before)
    })
    .await
}

/// Move an object; returns the object before and after.
///
/// # Errors
///
/// Returns `CanvasNotLoaded` or `NotFound`.
pub async fn set_position(
    state: &AppState,
    canvas_id: Uuid,
    object_id: Uuid,
    x: f64,
    y: f64,
) -> Result<(CanvasObject, CanvasObject), ObjectError> {
    modify_object(state, canvas_id, object_id, |obj| {
        let before = obj.clone();
        obj.x = x;
        obj.y = y;
        Ok::<_, ObjectError>(before)
    })
    .await
}

/// Reapply a snapshot's shape fields. Lock fields stay as they are now.
///
/// # Errors
///
/// Returns `CanvasNotLoaded` or `NotFound`.
pub async fn restore_object(state: &AppState, canvas_id: Uuid, snapshot: &CanvasObject) -> Result<CanvasObject, ObjectError> {
    let ((), restored) = modify_object(state, canvas_id, snapshot.id, |obj| {
        obj.kind.clone_from(&snapshot.kind);
        obj.x = snapshot.x;
        obj.y = snapshot.y;
        obj.z_index = snapshot.z_index;
        obj.group_id = snapshot.group_id;
        obj.component_id = snapshot.component_id;
        obj.data = snapshot.data.clone();
        Ok::<_, ObjectError>(())
    })
    .await?;
    Ok(restored)
}

// =============================================================================
// DELETE
// =============================================================================

/// Remove an object from the canvas. The row is deleted by the next flush.
///
/// # Errors
///
/// Returns `CanvasNotLoaded` or `NotFound`.
pub async fn delete_object(state: &AppState, canvas_id: Uuid, object_id: Uuid) -> Result<CanvasObject, ObjectError> {
    remove_object_if(state, canvas_id, object_id, |_| Ok(())).await
}

/// Remove an object only if `check` accepts its current state. The check
/// and the removal happen under one write lock.
///
/// # Errors
///
/// Returns `CanvasNotLoaded`, `NotFound`, or whatever `check` rejects with.
pub async fn remove_object_if<E, F>(state: &AppState, canvas_id: Uuid, object_id: Uuid, check: F) -> Result<CanvasObject, E>
where
    F: FnOnce(&CanvasObject) -> Result<(), E>,
    E: From<ObjectError>,
{
    let mut canvases = state.canvases.write().await;
    let canvas = canvases
        .get_mut(&canvas_id)
        .ok_or(ObjectError::CanvasNotLoaded(canvas_id))?;
    let current = canvas
        .objects
        .get(&object_id)
        .ok_or(ObjectError::NotFound(object_id))?;
    check(current)?;
    let removed = canvas
        .objects
        .remove(&object_id)
        .ok_or(ObjectError::NotFound(object_id))?;
    canvas.dirty.remove(&object_id);
    canvas.removed.insert(object_id);
    Ok(removed)
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
