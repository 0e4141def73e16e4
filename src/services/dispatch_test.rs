use super::*;
use crate::config::SyncConfig;
use crate::services::bus::canvas_topic;
use crate::state::test_helpers;
use tokio::sync::mpsc;

fn arrange_input(ids: &[Uuid], layout_type: &str) -> ArrangeInput {
    ArrangeInput {
        object_ids: ids.to_vec(),
        layout_type: layout_type.into(),
        spacing: None,
        columns: None,
        radius: None,
        alignment: None,
    }
}

async fn position(state: &AppState, canvas_id: Uuid, id: Uuid) -> (f64, f64) {
    let obj = test_helpers::object_snapshot(state, canvas_id, id)
        .await
        .expect("object should exist");
    (obj.x, obj.y)
}

fn assert_close(actual: (f64, f64), expected: (f64, f64)) {
    assert!(
        (actual.0 - expected.0).abs() < 1e-6 && (actual.1 - expected.1).abs() < 1e-6,
        "expected {expected:?}, got {actual:?}"
    );
}

// =============================================================================
// PARSING
// =============================================================================

#[test]
fn parse_rejects_unknown_tool() {
    let err = ToolCommand::parse("teleport", json!({})).unwrap_err();
    assert!(matches!(err, DispatchError::UnknownTool(ref name) if name == "teleport"));
    assert_eq!(err.error_code(), "E_VALIDATION");
}

#[test]
fn parse_rejects_malformed_input() {
    let err = ToolCommand::parse(TOOL_ARRANGE_OBJECTS, json!({"layout_type": "grid"})).unwrap_err();
    assert!(matches!(err, DispatchError::InvalidInput(_)));

    let err = ToolCommand::parse(TOOL_CREATE_SHAPE, json!({"type": "triangle", "x": 0, "y": 0, "width": 5})).unwrap_err();
    assert!(matches!(err, DispatchError::InvalidInput(_)));
}

#[test]
fn parse_builds_each_command() {
    let id = Uuid::new_v4();
    let arrange = ToolCommand::parse(
        TOOL_ARRANGE_OBJECTS,
        json!({"object_ids": [id], "layout_type": "grid", "columns": 2, "alignment": "left"}),
    )
    .unwrap();
    let ToolCommand::ArrangeObjects(input) = arrange else {
        panic!("expected arrange");
    };
    assert_eq!(input.object_ids, vec![id]);
    assert_eq!(input.columns, Some(2));

    let shape = ToolCommand::parse(TOOL_CREATE_SHAPE, json!({"type": "circle", "x": 1, "y": 2, "width": 30})).unwrap();
    assert!(matches!(shape, ToolCommand::CreateShape(ShapeInput { kind: ShapeKind::Circle, height: None, .. })));

    let delete = ToolCommand::parse(TOOL_DELETE_OBJECT, json!({"object_id": id})).unwrap();
    assert_eq!(delete, ToolCommand::DeleteObject(DeleteInput { object_id: id }));
}

#[test]
fn resolve_rejects_unknown_names_and_bad_ranges() {
    let ids = [Uuid::new_v4()];
    let err = arrange_input(&ids, "spiral").resolve().unwrap_err();
    assert_eq!(err, LayoutError::UnknownLayout("spiral".into()));

    let mut input = arrange_input(&ids, "grid");
    input.alignment = Some("diagonal".into());
    assert_eq!(input.resolve().unwrap_err(), LayoutError::UnknownAlignment("diagonal".into()));

    let mut input = arrange_input(&ids, "horizontal");
    input.spacing = Some(-1.0);
    assert!(matches!(input.resolve().unwrap_err(), LayoutError::InvalidSpacing(_)));

    let mut input = arrange_input(&ids, "circular");
    input.radius = Some(0.0);
    assert!(matches!(input.resolve().unwrap_err(), LayoutError::InvalidRadius(_)));
}

#[test]
fn error_codes_and_retryability() {
    assert_eq!(DispatchError::NoObjectsFound.error_code(), "E_NO_OBJECTS_FOUND");
    let partial = DispatchError::PartialUpdate { updated: 3, failed: 1 };
    assert_eq!(partial.error_code(), "E_PARTIAL_UPDATE");
    assert!(partial.retryable());
    assert_eq!(DispatchError::Layout(LayoutError::InvalidColumns(0)).error_code(), "E_VALIDATION");
    assert!(!DispatchError::NoObjectsFound.retryable());
}

// =============================================================================
// ARRANGE
// =============================================================================

#[tokio::test]
async fn arrange_grid_places_rows_of_columns() {
    let state = test_helpers::test_app_state();
    let objects: Vec<CanvasObject> = (0..6)
        .map(|i| test_helpers::sized_object(100.0 + f64::from(i) * 7.0, 300.0 + f64::from(i), 50.0, 50.0))
        .collect();
    let ids: Vec<Uuid> = objects.iter().map(|o| o.id).collect();
    let canvas_id = test_helpers::seed_canvas_with_objects(&state, objects).await;

    let mut input = arrange_input(&ids, "grid");
    input.columns = Some(3);
    input.spacing = Some(20.0);
    let report = arrange_objects(&state, canvas_id, Uuid::new_v4(), &input).await.unwrap();

    assert_eq!(report.updated_count, 6);
    assert_eq!(report.layout_type, LayoutKind::Grid);
    assert_close(position(&state, canvas_id, ids[0]).await, (100.0, 300.0));
    assert_close(position(&state, canvas_id, ids[1]).await, (170.0, 300.0));
    assert_close(position(&state, canvas_id, ids[3]).await, (100.0, 370.0));
    assert_close(position(&state, canvas_id, ids[5]).await, (240.0, 370.0));
}

#[tokio::test]
async fn arrange_circular_uses_submission_order() {
    let state = test_helpers::test_app_state();
    // 20x20 objects whose centers average to the origin.
    let centers = [(100.0, 0.0), (0.0, 100.0), (-100.0, 0.0), (0.0, -100.0)];
    let objects: Vec<CanvasObject> = centers
        .iter()
        .map(|(cx, cy)| test_helpers::sized_object(cx - 10.0, cy - 10.0, 20.0, 20.0))
        .collect();
    let ids: Vec<Uuid> = objects.iter().map(|o| o.id).collect();
    let canvas_id = test_helpers::seed_canvas_with_objects(&state, objects).await;

    let mut input = arrange_input(&ids, "circular");
    input.radius = Some(200.0);
    arrange_objects(&state, canvas_id, Uuid::new_v4(), &input).await.unwrap();

    let expected = [(200.0, 0.0), (0.0, 200.0), (-200.0, 0.0), (0.0, -200.0)];
    for (id, (cx, cy)) in ids.iter().zip(expected) {
        assert_close(position(&state, canvas_id, *id).await, (cx - 10.0, cy - 10.0));
    }
}

#[tokio::test]
async fn arrange_drops_missing_ids_silently() {
    let state = test_helpers::test_app_state();
    let a = test_helpers::sized_object(0.0, 0.0, 10.0, 10.0);
    let b = test_helpers::sized_object(40.0, 0.0, 10.0, 10.0);
    let canvas_id = test_helpers::seed_canvas_with_objects(&state, vec![a.clone(), b.clone()]).await;

    let ids = [a.id, Uuid::new_v4(), b.id];
    let mut input = arrange_input(&ids, "horizontal");
    input.spacing = Some(5.0);
    let report = arrange_objects(&state, canvas_id, Uuid::new_v4(), &input).await.unwrap();

    assert_eq!(report.updated_count, 2);
    assert_close(position(&state, canvas_id, b.id).await, (15.0, 0.0));
}

#[tokio::test]
async fn arrange_with_nothing_resolved_fails() {
    let state = test_helpers::test_app_state();
    let canvas_id = test_helpers::seed_canvas_with_objects(&state, vec![test_helpers::dummy_object()]).await;

    let err = arrange_objects(&state, canvas_id, Uuid::new_v4(), &arrange_input(&[Uuid::new_v4()], "grid"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NoObjectsFound));

    let err = arrange_objects(&state, canvas_id, Uuid::new_v4(), &arrange_input(&[], "grid"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NoObjectsFound));
}

#[tokio::test]
async fn arrange_unknown_layout_is_rejected_before_writes() {
    let state = test_helpers::test_app_state();
    let obj = test_helpers::dummy_object();
    let canvas_id = test_helpers::seed_canvas_with_objects(&state, vec![obj.clone()]).await;

    let err = arrange_objects(&state, canvas_id, Uuid::new_v4(), &arrange_input(&[obj.id], "zigzag"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Layout(LayoutError::UnknownLayout(_))));
    let untouched = test_helpers::object_snapshot(&state, canvas_id, obj.id).await.unwrap();
    assert!(untouched.same_shape(&obj));
    assert_eq!(untouched.version, obj.version);
}

#[tokio::test]
async fn arrange_publishes_one_event_per_object() {
    let state = test_helpers::test_app_state();
    let objects: Vec<CanvasObject> = (0..4).map(|i| test_helpers::sized_object(f64::from(i) * 13.0, 0.0, 10.0, 10.0)).collect();
    let ids: Vec<Uuid> = objects.iter().map(|o| o.id).collect();
    let canvas_id = test_helpers::seed_canvas_with_objects(&state, objects).await;
    let (tx, mut rx) = mpsc::channel(16);
    state.bus.subscribe(&canvas_topic(canvas_id), Uuid::new_v4(), tx).await.unwrap();

    arrange_objects(&state, canvas_id, Uuid::new_v4(), &arrange_input(&ids, "vertical")).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        assert_eq!(frame.syscall, "object:updated");
        seen.push(frame.data_uuid("id").expect("event should carry id"));
    }
    assert_eq!(seen, ids);
}

#[tokio::test]
async fn arrange_is_one_undo_step() {
    let state = test_helpers::test_app_state();
    let objects: Vec<CanvasObject> = (0..3)
        .map(|i| test_helpers::sized_object(f64::from(i) * 31.0, f64::from(i) * 17.0, 10.0, 10.0))
        .collect();
    let originals: Vec<(Uuid, (f64, f64))> = objects.iter().map(|o| (o.id, (o.x, o.y))).collect();
    let ids: Vec<Uuid> = objects.iter().map(|o| o.id).collect();
    let canvas_id = test_helpers::seed_canvas_with_objects(&state, objects).await;
    let actor = Uuid::new_v4();

    let mut input = arrange_input(&ids, "stack");
    input.alignment = Some("right".into());
    arrange_objects(&state, canvas_id, actor, &input).await.unwrap();

    let undone = history::undo(&state, actor, canvas_id).await.unwrap();
    assert!(matches!(undone, Action::Batch { ref actions, .. } if actions.len() == 3));
    for (id, original) in originals {
        assert_close(position(&state, canvas_id, id).await, original);
    }
}

#[tokio::test]
async fn slow_arrangement_still_succeeds() {
    let config = SyncConfig { arrange_warn_ms: 0, ..SyncConfig::default() };
    let state = test_helpers::test_app_state_with_config(config);
    let obj = test_helpers::dummy_object();
    let canvas_id = test_helpers::seed_canvas_with_objects(&state, vec![obj.clone()]).await;

    let report = arrange_objects(&state, canvas_id, Uuid::new_v4(), &arrange_input(&[obj.id], "grid")).await;
    assert!(report.is_ok());
}

#[tokio::test]
async fn partial_placement_failure_keeps_applied_writes() {
    let state = test_helpers::test_app_state();
    let a = test_helpers::sized_object(0.0, 0.0, 10.0, 10.0);
    let b = test_helpers::sized_object(0.0, 0.0, 10.0, 10.0);
    let canvas_id = test_helpers::seed_canvas_with_objects(&state, vec![a.clone(), b.clone()]).await;
    let actor = Uuid::new_v4();

    let placements = [
        Placement { id: a.id, x: 5.0, y: 5.0 },
        Placement { id: Uuid::new_v4(), x: 9.0, y: 9.0 },
        Placement { id: b.id, x: 50.0, y: 5.0 },
    ];
    let applied = apply_placements(&state, canvas_id, actor, LayoutKind::Horizontal, &placements).await;

    assert_eq!(applied, AppliedPlacements { updated: 2, failed: 1 });
    assert_close(position(&state, canvas_id, a.id).await, (5.0, 5.0));
    assert_close(position(&state, canvas_id, b.id).await, (50.0, 5.0));

    let undone = history::undo(&state, actor, canvas_id).await.unwrap();
    assert!(matches!(undone, Action::Batch { ref actions, .. } if actions.len() == 2));
    assert_close(position(&state, canvas_id, a.id).await, (0.0, 0.0));
}

// =============================================================================
// SINGLE-OBJECT TOOLS
// =============================================================================

#[tokio::test]
async fn create_shape_defaults_height_and_style() {
    let state = test_helpers::test_app_state();
    let canvas_id = test_helpers::seed_canvas(&state).await;
    let actor = Uuid::new_v4();

    let input = ShapeInput {
        kind: ShapeKind::Circle,
        x: 10.0,
        y: 20.0,
        width: 80.0,
        height: None,
        fill: Some("#FF0000".into()),
        stroke: None,
        stroke_width: None,
    };
    let obj = create_shape(&state, canvas_id, actor, input).await.unwrap();

    assert_eq!(obj.kind, "circle");
    assert_eq!(obj.size(), (80.0, 80.0));
    assert_eq!(obj.data["fill"], "#FF0000");
    assert_eq!(obj.data["stroke"], DEFAULT_STROKE);
    assert_eq!(obj.data["stroke_width"], json!(DEFAULT_STROKE_WIDTH));
    assert_eq!(obj.created_by, Some(actor));

    history::undo(&state, actor, canvas_id).await.unwrap();
    assert!(test_helpers::object_snapshot(&state, canvas_id, obj.id).await.is_none());
}

#[tokio::test]
async fn create_shape_rejects_non_positive_width() {
    let state = test_helpers::test_app_state();
    let canvas_id = test_helpers::seed_canvas(&state).await;
    let input = ShapeInput {
        kind: ShapeKind::Rectangle,
        x: 0.0,
        y: 0.0,
        width: 0.0,
        height: Some(10.0),
        fill: None,
        stroke: None,
        stroke_width: None,
    };

    let err = create_shape(&state, canvas_id, Uuid::new_v4(), input).await.unwrap_err();
    assert!(matches!(err, DispatchError::Object(ObjectError::Invalid(_))));
    assert_eq!(err.error_code(), "E_VALIDATION");
}

#[tokio::test]
async fn delete_object_honors_locks_and_is_undoable() {
    let state = test_helpers::test_app_state();
    let obj = test_helpers::dummy_object();
    let canvas_id = test_helpers::seed_canvas_with_objects(&state, vec![obj.clone()]).await;
    let (holder, other) = (Uuid::new_v4(), Uuid::new_v4());
    lock::acquire_lock(&state, canvas_id, obj.id, holder).await.unwrap();

    let err = delete_object(&state, canvas_id, other, &DeleteInput { object_id: obj.id })
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "E_LOCK_CONFLICT");
    assert!(err.retryable());

    let deleted = delete_object(&state, canvas_id, holder, &DeleteInput { object_id: obj.id })
        .await
        .unwrap();
    assert_eq!(deleted, obj.id);
    assert!(test_helpers::object_snapshot(&state, canvas_id, obj.id).await.is_none());

    history::undo(&state, holder, canvas_id).await.unwrap();
    let restored = test_helpers::object_snapshot(&state, canvas_id, obj.id).await.unwrap();
    assert!(restored.same_shape(&obj));
}

// =============================================================================
// FRAME ENTRY POINT
// =============================================================================

#[tokio::test]
async fn dispatch_tool_frame_echoes_tool_use_id() {
    let state = test_helpers::test_app_state();
    let obj = test_helpers::dummy_object();
    let canvas_id = test_helpers::seed_canvas_with_objects(&state, vec![obj.clone()]).await;

    let mut data = Data::new();
    data.insert("tool_use_id".into(), json!("toolu_1"));
    data.insert("input".into(), json!({"object_ids": [obj.id], "layout_type": "grid"}));
    let req = Frame::request("tool:arrange_objects", data);

    let done = dispatch_tool_frame(&state, canvas_id, Uuid::new_v4(), &req).await.unwrap();
    assert_eq!(done.get("tool_use_id"), Some(&json!("toolu_1")));
    assert_eq!(done.get("updated_count"), Some(&json!(1)));
    assert_eq!(done.get("layout_type"), Some(&json!("grid")));
    assert!(done.contains_key("content"));
}

#[tokio::test]
async fn dispatch_tool_frame_creates_shape() {
    let state = test_helpers::test_app_state();
    let canvas_id = test_helpers::seed_canvas(&state).await;

    let mut data = Data::new();
    data.insert("input".into(), json!({"type": "rectangle", "x": 5, "y": 6, "width": 40, "height": 20}));
    let req = Frame::request("tool:create_shape", data);

    let done = dispatch_tool_frame(&state, canvas_id, Uuid::new_v4(), &req).await.unwrap();
    let object = done.get("object").expect("done should carry object");
    assert_eq!(object["kind"], "rectangle");
    assert_eq!(object["data"]["height"], json!(20.0));
}

#[tokio::test]
async fn dispatch_tool_frame_rejects_unknown_tool() {
    let state = test_helpers::test_app_state();
    let canvas_id = test_helpers::seed_canvas(&state).await;
    let req = Frame::request("tool:fly", Data::new());

    let err = dispatch_tool_frame(&state, canvas_id, Uuid::new_v4(), &req).await.unwrap_err();
    assert!(matches!(err, DispatchError::UnknownTool(_)));
}

#[test]
fn tool_definitions_cover_every_tool() {
    let defs = tool_definitions();
    let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, TOOL_NAMES);
    for def in &defs {
        assert_eq!(def.input_schema["type"], "object");
        assert!(def.input_schema["required"].as_array().is_some_and(|r| !r.is_empty()));
    }
}
