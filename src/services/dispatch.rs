//! Tool dispatcher — structured commands from the assistant or the UI.
//!
//! Tool syscalls arrive as `Frame` messages of the form `tool:<name>` with
//! the command input under `data.input`. The dispatcher parses the input
//! into a closed [`ToolCommand`], runs it against the layout engine, lock
//! manager and object store, records one undo action for the actor, and
//! publishes one change event per object it touched.
//!
//! DESIGN
//! ======
//! Arrangement is a sequence of independent position writes, not a
//! transaction. A failure partway through leaves earlier writes in place and
//! is reported in aggregate as `PartialUpdate`. The undo record covers
//! whatever was applied, so a partial arrangement can still be undone.
//!
//! Arrangement does not consult locks; single-object deletes do.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::{Data, ErrorCode, Frame};
use crate::layout::{self, Alignment, LayoutError, LayoutItem, LayoutKind, LayoutParams, Placement};
use crate::state::{AppState, CanvasObject};

use super::bus::{self, object_to_data};
use super::history::{self, Action};
use super::lock::{self, LockError};
use super::store::{self, Mutation, NewObject, ObjectError};

pub const TOOL_ARRANGE_OBJECTS: &str = "arrange_objects";
pub const TOOL_CREATE_SHAPE: &str = "create_shape";
pub const TOOL_DELETE_OBJECT: &str = "delete_object";

const TOOL_NAMES: &[&str] = &[TOOL_ARRANGE_OBJECTS, TOOL_CREATE_SHAPE, TOOL_DELETE_OBJECT];

const DEFAULT_FILL: &str = "#4CAF50";
const DEFAULT_STROKE: &str = "#1F2937";
const DEFAULT_STROKE_WIDTH: f64 = 1.0;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid tool input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error("none of the requested objects exist")]
    NoObjectsFound,
    #[error("arrangement partially applied: {updated} updated, {failed} failed")]
    PartialUpdate { updated: usize, failed: usize },
    #[error(transparent)]
    Object(#[from] ObjectError),
    #[error(transparent)]
    Lock(#[from] LockError),
}

impl ErrorCode for DispatchError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownTool(_) | Self::InvalidInput(_) => "E_VALIDATION",
            Self::Layout(e) => e.error_code(),
            Self::NoObjectsFound => "E_NO_OBJECTS_FOUND",
            Self::PartialUpdate { .. } => "E_PARTIAL_UPDATE",
            Self::Object(e) => e.error_code(),
            Self::Lock(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::PartialUpdate { .. } => true,
            Self::Object(e) => e.retryable(),
            Self::Lock(e) => e.retryable(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ArrangeInput {
    pub object_ids: Vec<Uuid>,
    pub layout_type: String,
    #[serde(default)]
    pub spacing: Option<f64>,
    #[serde(default)]
    pub columns: Option<usize>,
    #[serde(default)]
    pub radius: Option<f64>,
    #[serde(default)]
    pub alignment: Option<String>,
}

impl ArrangeInput {
    /// Resolve the string fields into a layout kind and parameters.
    ///
    /// # Errors
    ///
    /// Returns `UnknownLayout`/`UnknownAlignment` for unrecognized names, or
    /// a range error from parameter validation.
    pub fn resolve(&self) -> Result<(LayoutKind, LayoutParams), LayoutError> {
        let kind: LayoutKind = self.layout_type.parse()?;
        let alignment = self.alignment.as_deref().map(str::parse::<Alignment>).transpose()?;
        let params = LayoutParams { spacing: self.spacing, columns: self.columns, radius: self.radius, alignment };
        params.validate()?;
        Ok((kind, params))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeKind {
    Rectangle,
    Circle,
}

impl ShapeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rectangle => "rectangle",
            Self::Circle => "circle",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ShapeInput {
    #[serde(rename = "type")]
    pub kind: ShapeKind,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    #[serde(default)]
    pub height: Option<f64>,
    #[serde(default)]
    pub fill: Option<String>,
    #[serde(default)]
    pub stroke: Option<String>,
    #[serde(default)]
    pub stroke_width: Option<f64>,
}

impl ShapeInput {
    fn into_new_object(self) -> NewObject {
        let height = self.height.unwrap_or(self.width);
        let data = json!({
            "width": self.width,
            "height": height,
            "fill": self.fill.unwrap_or_else(|| DEFAULT_FILL.to_owned()),
            "stroke": self.stroke.unwrap_or_else(|| DEFAULT_STROKE.to_owned()),
            "stroke_width": self.stroke_width.unwrap_or(DEFAULT_STROKE_WIDTH),
        });
        NewObject::new(self.kind.as_str(), self.x, self.y, data)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeleteInput {
    pub object_id: Uuid,
}

/// A parsed tool command.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "tool", content = "input", rename_all = "snake_case")]
pub enum ToolCommand {
    ArrangeObjects(ArrangeInput),
    CreateShape(ShapeInput),
    DeleteObject(DeleteInput),
}

impl ToolCommand {
    /// # Errors
    ///
    /// Returns `UnknownTool` for a name outside the tool set, or
    /// `InvalidInput` when the input doesn't match the tool's shape.
    pub fn parse(tool: &str, input: serde_json::Value) -> Result<Self, DispatchError> {
        if !TOOL_NAMES.contains(&tool) {
            return Err(DispatchError::UnknownTool(tool.to_owned()));
        }
        serde_json::from_value(json!({ "tool": tool, "input": input }))
            .map_err(|e| DispatchError::InvalidInput(e.to_string()))
    }
}

/// Result of a fully applied arrangement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArrangeReport {
    pub updated_count: usize,
    pub layout_type: LayoutKind,
    pub duration_ms: u64,
}

// =============================================================================
// ARRANGE
// =============================================================================

/// Arrange existing objects with one of the layout algorithms.
///
/// # Errors
///
/// Returns a layout validation error, `NoObjectsFound` when no id
/// resolves, or `PartialUpdate` when some writes failed after others
/// succeeded.
pub async fn arrange_objects(
    state: &AppState,
    canvas_id: Uuid,
    actor: Uuid,
    input: &ArrangeInput,
) -> Result<ArrangeReport, DispatchError> {
    let started = Instant::now();
    let (kind, params) = input.resolve()?;

    let objects = store::get_objects(state, canvas_id, &input.object_ids).await?;
    if objects.is_empty() {
        return Err(DispatchError::NoObjectsFound);
    }

    let items: Vec<LayoutItem> = objects.iter().map(LayoutItem::from).collect();
    let placements = layout::arrange(kind, &items, &params)?;
    let applied = apply_placements(state, canvas_id, actor, kind, &placements).await;

    let duration = started.elapsed();
    let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    if duration > state.config.arrange_warn_after() {
        warn!(
            %canvas_id,
            layout_type = kind.as_str(),
            duration_ms,
            count = placements.len(),
            target_ms = state.config.arrange_warn_ms,
            "arrangement exceeded latency target"
        );
    }

    if applied.failed > 0 {
        warn!(%canvas_id, updated = applied.updated, failed = applied.failed, "arrangement partially applied");
        return Err(DispatchError::PartialUpdate { updated: applied.updated, failed: applied.failed });
    }

    info!(%canvas_id, %actor, layout_type = kind.as_str(), updated = applied.updated, duration_ms, "objects arranged");
    Ok(ArrangeReport { updated_count: applied.updated, layout_type: kind, duration_ms })
}

/// Counts from writing a set of placements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedPlacements {
    pub updated: usize,
    pub failed: usize,
}

/// Write placements in order, publish each success, and record one batch
/// undo action covering the writes that landed.
pub async fn apply_placements(
    state: &AppState,
    canvas_id: Uuid,
    actor: Uuid,
    kind: LayoutKind,
    placements: &[Placement],
) -> AppliedPlacements {
    let mut applied = AppliedPlacements::default();
    let mut actions = Vec::with_capacity(placements.len());

    for placement in placements {
        match store::set_position(state, canvas_id, placement.id, placement.x, placement.y).await {
            Ok((before, after)) => {
                applied.updated += 1;
                bus::publish_mutation(state, canvas_id, &Mutation::Updated(after.clone())).await;
                actions.push(Action::Update { before, after });
            }
            Err(e) => {
                applied.failed += 1;
                warn!(error = %e, %canvas_id, object_id = %placement.id, "placement write failed");
            }
        }
    }

    history::record(state, actor, canvas_id, Action::Batch { label: format!("arrange {kind}"), actions }).await;
    applied
}

// =============================================================================
// SINGLE-OBJECT TOOLS
// =============================================================================

/// Create a rectangle or circle.
///
/// # Errors
///
/// Returns a store validation error for a non-positive size.
pub async fn create_shape(
    state: &AppState,
    canvas_id: Uuid,
    actor: Uuid,
    input: ShapeInput,
) -> Result<CanvasObject, DispatchError> {
    let obj = store::create_object(state, canvas_id, input.into_new_object(), Some(actor)).await?;
    history::record(state, actor, canvas_id, Action::Create { object: obj.clone() }).await;
    bus::publish_mutation(state, canvas_id, &Mutation::Created(obj.clone())).await;
    Ok(obj)
}

/// Delete one object, honoring other actors' locks.
///
/// # Errors
///
/// Returns `LockConflict` or `NotFound`.
pub async fn delete_object(state: &AppState, canvas_id: Uuid, actor: Uuid, input: &DeleteInput) -> Result<Uuid, DispatchError> {
    let removed = lock::delete_as(state, canvas_id, input.object_id, actor).await?;
    history::record(state, actor, canvas_id, Action::Delete { object: removed }).await;
    bus::publish_mutation(state, canvas_id, &Mutation::Deleted(input.object_id)).await;
    Ok(input.object_id)
}

// =============================================================================
// FRAME ENTRY POINT
// =============================================================================

/// Parse a `tool:<name>` frame, run it, and build the `done` payload.
/// A `tool_use_id` in the request is echoed back.
///
/// # Errors
///
/// Returns any parse, validation, lock or store error from the tool.
pub async fn dispatch_tool_frame(state: &AppState, canvas_id: Uuid, actor: Uuid, req: &Frame) -> Result<Data, DispatchError> {
    let input = req
        .data
        .get("input")
        .cloned()
        .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));
    let command = ToolCommand::parse(req.op().trim(), input)?;

    let mut done = Data::new();
    if let Some(tool_use_id) = req.data.get("tool_use_id") {
        done.insert("tool_use_id".into(), tool_use_id.clone());
    }

    match command {
        ToolCommand::ArrangeObjects(input) => {
            let report = arrange_objects(state, canvas_id, actor, &input).await?;
            done.insert(
                "content".into(),
                json!(format!("arranged {} objects ({})", report.updated_count, report.layout_type)),
            );
            done.insert("updated_count".into(), json!(report.updated_count));
            done.insert("layout_type".into(), json!(report.layout_type));
            done.insert("duration_ms".into(), json!(report.duration_ms));
        }
        ToolCommand::CreateShape(input) => {
            let obj = create_shape(state, canvas_id, actor, input).await?;
            done.insert("content".into(), json!(format!("created {} {}", obj.kind, obj.id)));
            done.insert("object".into(), json!(object_to_data(&obj)));
        }
        ToolCommand::DeleteObject(input) => {
            let id = delete_object(state, canvas_id, actor, &input).await?;
            done.insert("content".into(), json!(format!("deleted {id}")));
            done.insert("id".into(), json!(id));
        }
    }
    Ok(done)
}

// =============================================================================
// TOOL SCHEMA
// =============================================================================

/// Tool descriptor in the shape assistants expect.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// The tool set exposed to the assistant.
#[must_use]
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: TOOL_ARRANGE_OBJECTS.into(),
            description: "Arrange existing objects in a horizontal, vertical, grid, circular or stack layout, optionally aligned."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "object_ids": { "type": "array", "items": { "type": "string", "format": "uuid" }, "description": "Objects to arrange, in order" },
                    "layout_type": { "type": "string", "enum": ["horizontal", "vertical", "grid", "circular", "stack"] },
                    "spacing": { "type": "number", "minimum": 0, "description": "Gap between objects in pixels" },
                    "columns": { "type": "integer", "minimum": 1, "description": "Grid columns" },
                    "radius": { "type": "number", "exclusiveMinimum": 0, "description": "Circle radius in pixels" },
                    "alignment": { "type": "string", "enum": ["left", "center", "right", "top", "middle", "bottom"] }
                },
                "required": ["object_ids", "layout_type"]
            }),
        },
        ToolDefinition {
            name: TOOL_CREATE_SHAPE.into(),
            description: "Create a rectangle or circle on the canvas.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "type": { "type": "string", "enum": ["rectangle", "circle"] },
                    "x": { "type": "number", "description": "X position on canvas" },
                    "y": { "type": "number", "description": "Y position on canvas" },
                    "width": { "type": "number", "description": "Width in pixels" },
                    "height": { "type": "number", "description": "Height in pixels (defaults to width)" },
                    "fill": { "type": "string", "description": "Fill color (hex)" },
                    "stroke": { "type": "string", "description": "Stroke color (hex)" },
                    "stroke_width": { "type": "number", "description": "Stroke width in pixels" }
                },
                "required": ["type", "x", "y", "width"]
            }),
        },
        ToolDefinition {
            name: TOOL_DELETE_OBJECT.into(),
            description: "Delete an object from the canvas.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "object_id": { "type": "string", "format": "uuid" }
                },
                "required": ["object_id"]
            }),
        },
    ]
}

#[cfg(test)]
#[path = "dispatch_test.rs"]
mod tests;
