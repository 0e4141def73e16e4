use super::*;
use crate::config::SyncConfig;
use crate::frame::Status;
use crate::services::bus::canvas_topic;
use crate::state::test_helpers;
use tokio::time::{Duration, timeout};

/// A session already joined to a seeded canvas and subscribed to its topic.
async fn joined_session(state: &AppState, canvas_id: Uuid) -> (Session, mpsc::Receiver<Frame>) {
    let (tx, rx) = mpsc::channel(64);
    let client_id = Uuid::new_v4();
    state
        .bus
        .subscribe(&canvas_topic(canvas_id), client_id, tx.clone())
        .await
        .expect("subscribe should succeed");
    let session = Session { client_id, actor_id: Uuid::new_v4(), canvas_id: Some(canvas_id), tx };
    (session, rx)
}

fn request_text(syscall: &str, data: serde_json::Value) -> String {
    let data: Data = serde_json::from_value(data).expect("data should be a map");
    serde_json::to_string(&Frame::request(syscall, data)).expect("frame should serialize")
}

async fn send(state: &AppState, session: &mut Session, syscall: &str, data: serde_json::Value) -> Frame {
    let mut replies = process_inbound_text(state, session, &request_text(syscall, data)).await;
    assert_eq!(replies.len(), 1, "expected exactly one reply");
    replies.remove(0)
}

async fn recv_event(rx: &mut mpsc::Receiver<Frame>) -> Frame {
    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("event receive timed out")
        .expect("event channel closed unexpectedly")
}

fn assert_no_event(rx: &mut mpsc::Receiver<Frame>) {
    assert!(rx.try_recv().is_err(), "expected no event frame");
}

fn error_code(frame: &Frame) -> &str {
    assert_eq!(frame.status, Status::Error, "expected error frame, got {frame:?}");
    frame.data.get("code").and_then(|v| v.as_str()).unwrap_or("-")
}

// =============================================================================
// PARSING AND ROUTING
// =============================================================================

#[tokio::test]
async fn invalid_json_yields_gateway_error() {
    let state = test_helpers::test_app_state();
    let canvas_id = test_helpers::seed_canvas(&state).await;
    let (mut session, _rx) = joined_session(&state, canvas_id).await;

    let replies = process_inbound_text(&state, &mut session, "{not json").await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].syscall, "gateway:error");
}

#[tokio::test]
async fn unknown_prefix_is_rejected() {
    let state = test_helpers::test_app_state();
    let canvas_id = test_helpers::seed_canvas(&state).await;
    let (mut session, _rx) = joined_session(&state, canvas_id).await;

    let reply = send(&state, &mut session, "teleport:now", json!({})).await;
    assert_eq!(reply.status, Status::Error);
    assert!(reply.data["message"].as_str().is_some_and(|m| m.contains("teleport")));
}

#[tokio::test]
async fn object_ops_require_a_joined_canvas() {
    let state = test_helpers::test_app_state();
    let (tx, _rx) = mpsc::channel(8);
    let mut session = Session { client_id: Uuid::new_v4(), actor_id: Uuid::new_v4(), canvas_id: None, tx };

    let reply = send(&state, &mut session, "object:create", json!({"kind": "rectangle"})).await;
    assert_eq!(reply.status, Status::Error);
    assert_eq!(reply.data["message"], "must join a canvas first");
}

#[tokio::test]
async fn part_without_join_is_done() {
    let state = test_helpers::test_app_state();
    let (tx, _rx) = mpsc::channel(8);
    let mut session = Session { client_id: Uuid::new_v4(), actor_id: Uuid::new_v4(), canvas_id: None, tx };

    let reply = send(&state, &mut session, "canvas:part", json!({})).await;
    assert_eq!(reply.status, Status::Done);
}

#[tokio::test]
async fn replies_correlate_through_parent_id() {
    let state = test_helpers::test_app_state();
    let canvas_id = test_helpers::seed_canvas(&state).await;
    let (mut session, _rx) = joined_session(&state, canvas_id).await;
    let req = Frame::request("history:undo", Data::new());
    let text = serde_json::to_string(&req).expect("frame should serialize");

    let replies = process_inbound_text(&state, &mut session, &text).await;
    assert_eq!(replies[0].parent_id, Some(req.id));
}

// =============================================================================
// OBJECTS
// =============================================================================

#[tokio::test]
async fn object_create_replies_and_publishes() {
    let state = test_helpers::test_app_state();
    let canvas_id = test_helpers::seed_canvas(&state).await;
    let (mut session, mut rx) = joined_session(&state, canvas_id).await;

    let reply = send(
        &state,
        &mut session,
        "object:create",
        json!({"kind": "rectangle", "x": 10, "y": 20, "data": {"width": 30, "height": 40}}),
    )
    .await;
    assert_eq!(reply.status, Status::Done);
    assert_eq!(reply.data["kind"], "rectangle");

    let event = recv_event(&mut rx).await;
    assert_eq!(event.syscall, "object:created");
    assert_eq!(event.data.get("id"), reply.data.get("id"));
}

#[tokio::test]
async fn object_create_rejects_unknown_kind() {
    let state = test_helpers::test_app_state();
    let canvas_id = test_helpers::seed_canvas(&state).await;
    let (mut session, mut rx) = joined_session(&state, canvas_id).await;

    let reply = send(&state, &mut session, "object:create", json!({"kind": "hexagon"})).await;
    assert_eq!(error_code(&reply), "E_VALIDATION");
    assert_no_event(&mut rx);
}

#[tokio::test]
async fn object_update_honors_other_actors_lock() {
    let state = test_helpers::test_app_state();
    let obj = test_helpers::dummy_object();
    let canvas_id = test_helpers::seed_canvas_with_objects(&state, vec![obj.clone()]).await;
    let (mut holder, _rx_holder) = joined_session(&state, canvas_id).await;
    let (mut other, _rx_other) = joined_session(&state, canvas_id).await;

    let reply = send(&state, &mut holder, "lock:acquire", json!({"id": obj.id})).await;
    assert_eq!(reply.status, Status::Done);

    let reply = send(&state, &mut other, "object:update", json!({"id": obj.id, "x": 99.0})).await;
    assert_eq!(error_code(&reply), "E_LOCK_CONFLICT");
    assert_eq!(reply.data["retryable"], true);

    let reply = send(&state, &mut holder, "object:update", json!({"id": obj.id, "x": 99.0})).await;
    assert_eq!(reply.status, Status::Done);
    assert_eq!(reply.data["x"], json!(99.0));
}

#[tokio::test]
async fn object_update_then_undo_restores_position() {
    let state = test_helpers::test_app_state();
    let obj = test_helpers::sized_object(5.0, 6.0, 10.0, 10.0);
    let canvas_id = test_helpers::seed_canvas_with_objects(&state, vec![obj.clone()]).await;
    let (mut session, mut rx) = joined_session(&state, canvas_id).await;

    send(&state, &mut session, "object:update", json!({"id": obj.id, "x": 50.0, "y": 60.0})).await;
    assert_eq!(recv_event(&mut rx).await.syscall, "object:updated");

    let reply = send(&state, &mut session, "history:undo", json!({})).await;
    assert_eq!(reply.status, Status::Done);
    assert_eq!(reply.data["action"]["type"], "update");
    assert_eq!(recv_event(&mut rx).await.syscall, "object:updated");

    let restored = test_helpers::object_snapshot(&state, canvas_id, obj.id).await.unwrap();
    assert!((restored.x - 5.0).abs() < f64::EPSILON);
    assert!((restored.y - 6.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn object_delete_requires_id_and_publishes() {
    let state = test_helpers::test_app_state();
    let obj = test_helpers::dummy_object();
    let canvas_id = test_helpers::seed_canvas_with_objects(&state, vec![obj.clone()]).await;
    let (mut session, mut rx) = joined_session(&state, canvas_id).await;

    let reply = send(&state, &mut session, "object:delete", json!({})).await;
    assert_eq!(reply.status, Status::Error);

    let reply = send(&state, &mut session, "object:delete", json!({"id": obj.id})).await;
    assert_eq!(reply.status, Status::Done);
    let event = recv_event(&mut rx).await;
    assert_eq!(event.syscall, "object:deleted");
    assert_eq!(event.data_uuid("id"), Some(obj.id));
    assert!(test_helpers::object_snapshot(&state, canvas_id, obj.id).await.is_none());
}

#[tokio::test]
async fn batch_create_reports_failures_by_index() {
    let state = test_helpers::test_app_state();
    let canvas_id = test_helpers::seed_canvas(&state).await;
    let (mut session, mut rx) = joined_session(&state, canvas_id).await;

    let reply = send(
        &state,
        &mut session,
        "object:batch_create",
        json!({"items": [
            {"kind": "rectangle", "x": 0, "y": 0},
            {"kind": "rectangle", "x": 0, "y": 0, "data": {"width": -5}},
            {"x": 1, "y": 1},
            {"kind": "circle", "x": 5, "y": 5, "data": {"radius": 10}}
        ]}),
    )
    .await;

    assert_eq!(reply.status, Status::Done);
    assert_eq!(reply.data["created_count"], 2);
    assert_eq!(reply.data["failed_count"], 2);
    let failed: Vec<u64> = reply.data["errors"]
        .as_array()
        .expect("errors should be an array")
        .iter()
        .filter_map(|e| e["index"].as_u64())
        .collect();
    assert_eq!(failed, vec![1, 2]);

    assert_eq!(recv_event(&mut rx).await.syscall, "object:created");
    assert_eq!(recv_event(&mut rx).await.syscall, "object:created");
    assert_no_event(&mut rx);
    assert_eq!(state.canvases.read().await[&canvas_id].objects.len(), 2);

    // One undo removes the whole batch.
    let reply = send(&state, &mut session, "history:undo", json!({})).await;
    assert_eq!(reply.data["action"]["type"], "batch");
    assert!(state.canvases.read().await[&canvas_id].objects.is_empty());
}

#[tokio::test]
async fn batch_create_above_limit_is_rejected_whole() {
    let config = SyncConfig { batch_create_limit: 2, ..SyncConfig::default() };
    let state = test_helpers::test_app_state_with_config(config);
    let canvas_id = test_helpers::seed_canvas(&state).await;
    let (mut session, _rx) = joined_session(&state, canvas_id).await;

    let items: Vec<_> = (0..3).map(|i| json!({"kind": "text", "x": i, "y": 0})).collect();
    let reply = send(&state, &mut session, "object:batch_create", json!({ "items": items })).await;

    assert_eq!(error_code(&reply), "E_VALIDATION");
    assert!(state.canvases.read().await[&canvas_id].objects.is_empty());
}

// =============================================================================
// LOCKS, HISTORY, TOOLS
// =============================================================================

#[tokio::test]
async fn lock_acquire_and_release_publish_events() {
    let state = test_helpers::test_app_state();
    let obj = test_helpers::dummy_object();
    let canvas_id = test_helpers::seed_canvas_with_objects(&state, vec![obj.clone()]).await;
    let (mut session, mut rx) = joined_session(&state, canvas_id).await;

    let reply = send(&state, &mut session, "lock:acquire", json!({"id": obj.id})).await;
    assert_eq!(reply.data["locked_by"], json!(session.actor_id));
    assert_eq!(recv_event(&mut rx).await.syscall, "lock:acquired");

    let reply = send(&state, &mut session, "lock:release", json!({"id": obj.id})).await;
    assert_eq!(reply.status, Status::Done);
    assert!(reply.data["locked_by"].is_null());
    assert_eq!(recv_event(&mut rx).await.syscall, "lock:released");
}

#[tokio::test]
async fn undo_with_empty_stack_is_an_error() {
    let state = test_helpers::test_app_state();
    let canvas_id = test_helpers::seed_canvas(&state).await;
    let (mut session, _rx) = joined_session(&state, canvas_id).await;

    let reply = send(&state, &mut session, "history:undo", json!({})).await;
    assert_eq!(error_code(&reply), "E_EMPTY_STACK");

    let reply = send(&state, &mut session, "history:redo", json!({})).await;
    assert_eq!(error_code(&reply), "E_EMPTY_STACK");
}

#[tokio::test]
async fn tool_arrange_replies_with_report() {
    let state = test_helpers::test_app_state();
    let a = test_helpers::sized_object(0.0, 0.0, 10.0, 10.0);
    let b = test_helpers::sized_object(100.0, 40.0, 10.0, 10.0);
    let canvas_id = test_helpers::seed_canvas_with_objects(&state, vec![a.clone(), b.clone()]).await;
    let (mut session, mut rx) = joined_session(&state, canvas_id).await;

    let reply = send(
        &state,
        &mut session,
        "tool:arrange_objects",
        json!({"tool_use_id": "toolu_9", "input": {"object_ids": [a.id, b.id], "layout_type": "horizontal", "spacing": 0}}),
    )
    .await;

    assert_eq!(reply.status, Status::Done);
    assert_eq!(reply.data["tool_use_id"], "toolu_9");
    assert_eq!(reply.data["updated_count"], 2);
    assert_eq!(recv_event(&mut rx).await.syscall, "object:updated");
    assert_eq!(recv_event(&mut rx).await.syscall, "object:updated");
}

#[tokio::test]
async fn tool_error_echoes_tool_use_id() {
    let state = test_helpers::test_app_state();
    let canvas_id = test_helpers::seed_canvas(&state).await;
    let (mut session, _rx) = joined_session(&state, canvas_id).await;

    let reply = send(
        &state,
        &mut session,
        "tool:arrange_objects",
        json!({"tool_use_id": "toolu_2", "input": {"object_ids": [Uuid::new_v4()], "layout_type": "grid"}}),
    )
    .await;

    assert_eq!(error_code(&reply), "E_NO_OBJECTS_FOUND");
    assert_eq!(reply.data["tool_use_id"], "toolu_2");
}
