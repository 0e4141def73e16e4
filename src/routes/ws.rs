//! WebSocket handler — bidirectional frame relay.
//!
//! DESIGN
//! ======
//! On upgrade, generates a client ID and enters a `select!` loop:
//! - Incoming client frames → parse + dispatch by syscall prefix
//! - Change events from the canvas topic → forward to client
//!
//! Handler functions validate, call into services, and return an `Outcome`.
//! The dispatch layer owns outbound concerns: the reply to the sender and
//! publication of change events on the canvas topic. The sender receives
//! its own events too; clients correlate replies through `parent_id`.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → send `session:connected` with `client_id` and `actor_id`
//! 2. Client sends frames → dispatch → handler returns Outcome
//! 3. Dispatch applies Outcome (reply, then publish)
//! 4. Close → part the current canvas

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::{Data, ErrorCode, Frame, Status};
use crate::routes::canvases::ActorId;
use crate::services::bus::{self, object_to_data};
use crate::services::history::{self, Action};
use crate::services::store::{self, Mutation, NewObject, ObjectError};
use crate::services::{canvas, dispatch, lock};
use crate::state::AppState;

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions. The dispatch layer uses this to
/// decide what goes where; handlers never send frames directly.
enum Outcome {
    /// Send done+data to sender only.
    Reply(Data),
    /// Send empty done to sender only.
    Done,
    /// Reply to sender, then publish the mutations on the canvas topic.
    Mutated { reply: Data, mutations: Vec<Mutation> },
}

/// Per-connection state.
struct Session {
    client_id: Uuid,
    actor_id: Uuid,
    canvas_id: Option<Uuid>,
    tx: mpsc::Sender<Frame>,
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(State(state): State<AppState>, ActorId(actor_id): ActorId, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_ws(socket, state, actor_id))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, actor_id: Uuid) {
    let client_id = Uuid::new_v4();

    // Per-connection channel for change events from the canvas topic.
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(state.config.subscriber_queue_capacity.max(1));
    let mut session = Session { client_id, actor_id, canvas_id: None, tx: client_tx };

    let welcome = Frame::request("session:connected", Data::new())
        .with_data("client_id", client_id.to_string())
        .with_data("actor_id", actor_id.to_string());
    if send_frame(&mut socket, &welcome).await.is_err() {
        return;
    }

    info!(%client_id, %actor_id, "ws: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let replies = process_inbound_text(&state, &mut session, &text).await;
                        for frame in replies {
                            let _ = send_frame(&mut socket, &frame).await;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(frame) = client_rx.recv() => {
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(canvas_id) = session.canvas_id.take() {
        canvas::part_canvas(&state, canvas_id, client_id).await;
    }
    info!(%client_id, "ws: client disconnected");
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return frames for the sender.
///
/// Kept apart from the socket so tests can drive frame handling directly.
async fn process_inbound_text(state: &AppState, session: &mut Session, text: &str) -> Vec<Frame> {
    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(client_id = %session.client_id, error = %e, "ws: invalid inbound frame");
            let err = Frame::request("gateway:error", Data::new()).with_data("message", format!("invalid json: {e}"));
            return vec![err];
        }
    };

    // Stamp the authenticated actor as `from`.
    req.from = Some(session.actor_id.to_string());
    info!(client_id = %session.client_id, id = %req.id, syscall = %req.syscall, "ws: recv frame");

    let result = match req.prefix() {
        "canvas" => handle_canvas(state, session, &req).await,
        "object" => handle_object(state, session, &req).await,
        "lock" => handle_lock(state, session, &req).await,
        "history" => handle_history(state, session, &req).await,
        "tool" => handle_tool(state, session, &req).await,
        prefix => Err(req.error(format!("unknown prefix: {prefix}"))),
    };

    match result {
        Ok(Outcome::Reply(data)) => vec![req.done_with(data)],
        Ok(Outcome::Done) => vec![req.done()],
        Ok(Outcome::Mutated { reply, mutations }) => {
            if let Some(canvas_id) = session.canvas_id {
                bus::publish_mutations(state, canvas_id, &mutations).await;
            }
            vec![req.done_with(reply)]
        }
        Err(err_frame) => vec![err_frame],
    }
}

/// Canvas named by the frame header, falling back to `data.canvas_id`.
fn requested_canvas(req: &Frame) -> Option<Uuid> {
    req.canvas_id.or_else(|| req.data_uuid("canvas_id"))
}

fn joined_canvas(session: &Session, req: &Frame) -> Result<Uuid, Frame> {
    session.canvas_id.ok_or_else(|| req.error("must join a canvas first"))
}

// =============================================================================
// CANVAS HANDLERS
// =============================================================================

async fn handle_canvas(state: &AppState, session: &mut Session, req: &Frame) -> Result<Outcome, Frame> {
    match req.op() {
        "join" => {
            let Some(canvas_id) = requested_canvas(req) else {
                return Err(req.error("canvas_id required"));
            };

            if let Some(old) = session.canvas_id.take() {
                canvas::part_canvas(state, old, session.client_id).await;
            }

            let objects = canvas::join_canvas(state, canvas_id, session.client_id, session.tx.clone())
                .await
                .map_err(|e| req.error_from(&e))?;
            session.canvas_id = Some(canvas_id);

            let mut reply = Data::new();
            reply.insert("canvas_id".into(), json!(canvas_id));
            reply.insert("objects".into(), serde_json::to_value(&objects).unwrap_or_default());
            Ok(Outcome::Reply(reply))
        }
        "part" => {
            if let Some(canvas_id) = session.canvas_id.take() {
                canvas::part_canvas(state, canvas_id, session.client_id).await;
            }
            Ok(Outcome::Done)
        }
        "create" => {
            let name = req
                .data
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("Untitled Canvas");
            let row = canvas::create_canvas(&state.pool, name, session.actor_id)
                .await
                .map_err(|e| req.error_from(&e))?;
            let mut data = Data::new();
            data.insert("id".into(), json!(row.id));
            data.insert("name".into(), json!(row.name));
            Ok(Outcome::Reply(data))
        }
        "list" => {
            let rows = canvas::list_canvases(&state.pool, session.actor_id)
                .await
                .map_err(|e| req.error_from(&e))?;
            let mut data = Data::new();
            data.insert("canvases".into(), serde_json::to_value(&rows).unwrap_or_default());
            Ok(Outcome::Reply(data))
        }
        "delete" => {
            let Some(canvas_id) = requested_canvas(req) else {
                return Err(req.error("canvas_id required"));
            };
            canvas::delete_canvas(state, canvas_id, session.actor_id)
                .await
                .map_err(|e| req.error_from(&e))?;
            if session.canvas_id == Some(canvas_id) {
                session.canvas_id = None;
                state.bus.unsubscribe(&bus::canvas_topic(canvas_id), session.client_id).await;
            }
            Ok(Outcome::Done)
        }
        op => Err(req.error(format!("unknown canvas op: {op}"))),
    }
}

// =============================================================================
// OBJECT HANDLERS
// =============================================================================

async fn handle_object(state: &AppState, session: &Session, req: &Frame) -> Result<Outcome, Frame> {
    let canvas_id = joined_canvas(session, req)?;
    let actor = session.actor_id;

    match req.op() {
        "create" => {
            let new = parse_new_object(data_value(&req.data)).map_err(|e| req.error_from(&e))?;
            let obj = store::create_object(state, canvas_id, new, Some(actor))
                .await
                .map_err(|e| req.error_from(&e))?;
            history::record(state, actor, canvas_id, Action::Create { object: obj.clone() }).await;
            Ok(Outcome::Mutated { reply: object_to_data(&obj), mutations: vec![Mutation::Created(obj)] })
        }
        "update" => {
            let Some(object_id) = req.data_uuid("id") else {
                return Err(req.error("id required"));
            };
            let (before, after) = lock::update_as(state, canvas_id, object_id, actor, &req.data)
                .await
                .map_err(|e| req.error_from(&e))?;
            history::record(state, actor, canvas_id, Action::Update { before, after: after.clone() }).await;
            Ok(Outcome::Mutated { reply: object_to_data(&after), mutations: vec![Mutation::Updated(after)] })
        }
        "delete" => {
            let Some(object_id) = req.data_uuid("id") else {
                return Err(req.error("id required"));
            };
            let removed = lock::delete_as(state, canvas_id, object_id, actor)
                .await
                .map_err(|e| req.error_from(&e))?;
            history::record(state, actor, canvas_id, Action::Delete { object: removed }).await;
            let mut reply = Data::new();
            reply.insert("id".into(), json!(object_id));
            Ok(Outcome::Mutated { reply, mutations: vec![Mutation::Deleted(object_id)] })
        }
        "batch_create" => batch_create(state, canvas_id, actor, req).await,
        op => Err(req.error(format!("unknown object op: {op}"))),
    }
}

/// Create every item that validates and report the rest by index.
async fn batch_create(state: &AppState, canvas_id: Uuid, actor: Uuid, req: &Frame) -> Result<Outcome, Frame> {
    let Some(items) = req.data.get("items").and_then(|v| v.as_array()) else {
        return Err(req.error("items required"));
    };
    let limit = state.config.batch_create_limit;
    if items.len() > limit {
        return Err(req.error_from(&ObjectError::BatchTooLarge { count: items.len(), limit }));
    }

    // Items that don't even parse are reported without reaching the store.
    let parsed: Vec<Result<NewObject, ObjectError>> = items.iter().cloned().map(parse_new_object).collect();
    let valid: Vec<NewObject> = parsed.iter().filter_map(|p| p.as_ref().ok().cloned()).collect();
    let mut stored = store::batch_create(state, canvas_id, valid, Some(actor))
        .await
        .map_err(|e| req.error_from(&e))?
        .into_iter();

    let mut created = Vec::new();
    let mut errors = Vec::new();
    for (index, item) in parsed.into_iter().enumerate() {
        let outcome = match item {
            Ok(_) => stored
                .next()
                .unwrap_or_else(|| Err(ObjectError::Invalid("missing batch result".into()))),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(obj) => created.push(obj),
            Err(e) => errors.push(json!({
                "index": index,
                "code": e.error_code(),
                "message": e.to_string(),
            })),
        }
    }

    info!(%canvas_id, created = created.len(), failed = errors.len(), "batch create applied");
    let actions = created.iter().map(|obj| Action::Create { object: obj.clone() }).collect();
    history::record(state, actor, canvas_id, Action::Batch { label: "batch create".into(), actions }).await;

    let mut reply = Data::new();
    reply.insert("created_count".into(), json!(created.len()));
    reply.insert("failed_count".into(), json!(errors.len()));
    reply.insert("created".into(), json!(created.iter().map(object_to_data).collect::<Vec<_>>()));
    reply.insert("errors".into(), json!(errors));
    Ok(Outcome::Mutated { reply, mutations: created.into_iter().map(Mutation::Created).collect() })
}

fn data_value(data: &Data) -> serde_json::Value {
    serde_json::Value::Object(data.clone().into_iter().collect())
}

fn parse_new_object(value: serde_json::Value) -> Result<NewObject, ObjectError> {
    serde_json::from_value(value).map_err(|e| ObjectError::Invalid(e.to_string()))
}

// =============================================================================
// LOCK HANDLERS
// =============================================================================

async fn handle_lock(state: &AppState, session: &Session, req: &Frame) -> Result<Outcome, Frame> {
    let canvas_id = joined_canvas(session, req)?;
    let Some(object_id) = req.data_uuid("id") else {
        return Err(req.error("id required"));
    };

    // Lock services publish their own events.
    let obj = match req.op() {
        "acquire" => lock::acquire_lock(state, canvas_id, object_id, session.actor_id).await,
        "release" => lock::release_lock(state, canvas_id, object_id, session.actor_id).await,
        op => return Err(req.error(format!("unknown lock op: {op}"))),
    }
    .map_err(|e| req.error_from(&e))?;
    Ok(Outcome::Reply(object_to_data(&obj)))
}

// =============================================================================
// HISTORY HANDLERS
// =============================================================================

async fn handle_history(state: &AppState, session: &Session, req: &Frame) -> Result<Outcome, Frame> {
    let canvas_id = joined_canvas(session, req)?;

    // Replays publish their own events.
    let action = match req.op() {
        "undo" => history::undo(state, session.actor_id, canvas_id).await,
        "redo" => history::redo(state, session.actor_id, canvas_id).await,
        op => return Err(req.error(format!("unknown history op: {op}"))),
    }
    .map_err(|e| req.error_from(&e))?;

    let mut reply = Data::new();
    reply.insert("action".into(), serde_json::to_value(&action).unwrap_or_default());
    Ok(Outcome::Reply(reply))
}

// =============================================================================
// TOOL HANDLER
// =============================================================================

async fn handle_tool(state: &AppState, session: &Session, req: &Frame) -> Result<Outcome, Frame> {
    let canvas_id = joined_canvas(session, req)?;
    let reply = dispatch::dispatch_tool_frame(state, canvas_id, session.actor_id, req)
        .await
        .map_err(|e| {
            let mut frame = req.error_from(&e);
            if let Some(tool_use_id) = req.data.get("tool_use_id") {
                frame.data.insert("tool_use_id".into(), tool_use_id.clone());
            }
            frame
        })?;
    Ok(Outcome::Reply(reply))
}

// =============================================================================
// HELPERS
// =============================================================================

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if frame.status == Status::Error {
        let code = frame
            .data
            .get("code")
            .and_then(|v| v.as_str())
            .unwrap_or("-");
        let message = frame
            .data
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("-");
        warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
    } else {
        info!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
    }
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
