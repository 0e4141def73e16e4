//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! This module binds the REST endpoints for canvas management and the tool
//! schema, plus the websocket endpoint viewers use for live editing, under a
//! single Axum router. Actor identity arrives from the upstream gateway in
//! the `x-actor-id` header.

pub mod canvases;
pub mod ws;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{delete, get};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the application router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/canvas", get(canvases::list_canvases).post(canvases::create_canvas))
        .route("/api/canvas/{id}", delete(canvases::delete_canvas))
        .route("/api/tools", get(canvases::list_tools))
        .route("/api/ws", get(ws::handle_ws))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
