//! Canvas management and tool schema routes.

use axum::extract::{FromRequestParts, Path, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::Json;
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::services::canvas::{self, CanvasError, CanvasRow};
use crate::services::dispatch::{ToolDefinition, tool_definitions};
use crate::state::AppState;

/// Header carrying the authenticated actor, set by the upstream gateway.
pub const ACTOR_HEADER: &str = "x-actor-id";

// =============================================================================
// ACTOR EXTRACTOR
// =============================================================================

/// Authenticated actor resolved from [`ACTOR_HEADER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActorId(pub Uuid);

impl ActorId {
    pub(crate) fn from_headers(headers: &axum::http::HeaderMap) -> Option<Self> {
        headers
            .get(ACTOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse().ok())
            .map(Self)
    }
}

impl<S> FromRequestParts<S> for ActorId
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Self::from_headers(&parts.headers).ok_or(StatusCode::UNAUTHORIZED)
    }
}

// =============================================================================
// HANDLERS
// =============================================================================

#[derive(Deserialize)]
pub struct CreateCanvasBody {
    pub name: String,
}

/// `POST /api/canvas` — create a canvas owned by the caller.
pub async fn create_canvas(
    State(state): State<AppState>,
    ActorId(actor): ActorId,
    Json(body): Json<CreateCanvasBody>,
) -> Result<(StatusCode, Json<CanvasRow>), StatusCode> {
    let row = canvas::create_canvas(&state.pool, &body.name, actor)
        .await
        .map_err(canvas_error_to_status)?;
    Ok((StatusCode::CREATED, Json(row)))
}

/// `GET /api/canvas` — list canvases visible to the caller.
pub async fn list_canvases(
    State(state): State<AppState>,
    ActorId(actor): ActorId,
) -> Result<Json<Vec<CanvasRow>>, StatusCode> {
    let rows = canvas::list_canvases(&state.pool, actor)
        .await
        .map_err(canvas_error_to_status)?;
    Ok(Json(rows))
}

/// `DELETE /api/canvas/{id}` — delete a canvas and everything on it.
pub async fn delete_canvas(
    State(state): State<AppState>,
    ActorId(actor): ActorId,
    Path(canvas_id): Path<Uuid>,
) -> Result<StatusCode, StatusCode> {
    canvas::delete_canvas(&state, canvas_id, actor)
        .await
        .map_err(canvas_error_to_status)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/tools` — tool descriptors for assistant integrations.
pub async fn list_tools() -> Json<Vec<ToolDefinition>> {
    Json(tool_definitions())
}

pub(crate) fn canvas_error_to_status(err: CanvasError) -> StatusCode {
    match err {
        CanvasError::NotFound(_) => StatusCode::NOT_FOUND,
        CanvasError::EmptyName => StatusCode::BAD_REQUEST,
        CanvasError::Bus(_) => StatusCode::SERVICE_UNAVAILABLE,
        CanvasError::Database(e) => {
            warn!(error = %e, "canvas route database error");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
#[path = "canvases_test.rs"]
mod tests;
