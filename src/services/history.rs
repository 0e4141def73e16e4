//! Undo/redo history — per-actor, per-canvas stacks of reversible actions.
//!
//! DESIGN
//! ======
//! Each action stores full before/after snapshots, so undo and redo replay
//! snapshots through the object store rather than diffing. Stacks are capped
//! and the oldest entry falls off first. A new action clears the redo stack.
//!
//! Histories are independent per actor. Undo does not reconcile against
//! other actors' later edits: replaying a snapshot can overwrite a newer
//! change by someone else. Replay tolerates objects that are already gone:
//! deleting a missing object counts as done and updating one is skipped, so
//! a stale entry never pins the stack.
//!
//! The history lock is not held while a step replays. Every `record` bumps a
//! generation counter; a step that finishes after a newer action was
//! recorded does not put anything back on the redo stack.
//!
//! PERSISTENCE
//! ===========
//! Every change arms a debounced save keyed by (actor, canvas). Histories
//! are loaded when a canvas is joined and stay in memory afterwards.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::types::Json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::frame::ErrorCode;
use crate::state::{AppState, CanvasObject};

use super::bus;
use super::store::{self, Mutation, ObjectError};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("nothing to {0}")]
    EmptyStack(&'static str),
    #[error(transparent)]
    Object(#[from] ObjectError),
}

impl ErrorCode for HistoryError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::EmptyStack(_) => "E_EMPTY_STACK",
            Self::Object(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::EmptyStack(_) => false,
            Self::Object(e) => e.retryable(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HistoryKey {
    pub actor_id: Uuid,
    pub canvas_id: Uuid,
}

impl HistoryKey {
    #[must_use]
    pub fn new(actor_id: Uuid, canvas_id: Uuid) -> Self {
        Self { actor_id, canvas_id }
    }
}

/// A reversible mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Create { object: CanvasObject },
    Update { before: CanvasObject, after: CanvasObject },
    Delete { object: CanvasObject },
    Batch { label: String, actions: Vec<Action> },
}

impl Action {
    /// The action that undoes this one.
    #[must_use]
    pub fn inverse(&self) -> Self {
        match self {
            Self::Create { object } => Self::Delete { object: object.clone() },
            Self::Delete { object } => Self::Create { object: object.clone() },
            Self::Update { before, after } => Self::Update { before: after.clone(), after: before.clone() },
            Self::Batch { label, actions } => {
                Self::Batch { label: label.clone(), actions: actions.iter().rev().map(Self::inverse).collect() }
            }
        }
    }

    /// True for a batch with nothing inside it.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Batch { actions, .. } => actions.iter().all(Self::is_empty),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UndoHistory {
    pub undo_stack: Vec<Action>,
    pub redo_stack: Vec<Action>,
    /// Bumped by every `record`. Not persisted.
    #[serde(skip)]
    pub generation: u64,
}

impl UndoHistory {
    /// Record a fresh action: push onto undo and drop all forward history.
    pub fn record(&mut self, action: Action, max_depth: usize) {
        push_capped(&mut self.undo_stack, action, max_depth);
        self.redo_stack.clear();
        self.generation = self.generation.wrapping_add(1);
    }

    /// Pop the newest action for `direction`, with the generation it was taken at.
    fn take(&mut self, direction: Direction) -> Option<(Action, u64)> {
        let popped = match direction {
            Direction::Undo => self.undo_stack.pop(),
            Direction::Redo => self.redo_stack.pop(),
        };
        popped.map(|action| (action, self.generation))
    }

    /// File a stepped action. An applied undo moves to redo and an applied
    /// redo moves to undo; a failed step returns to its source stack. When
    /// something was recorded since `taken_at`, redo stays cleared and a
    /// failed step is dropped.
    fn settle(&mut self, direction: Direction, action: Action, taken_at: u64, applied: bool, max_depth: usize) {
        let stale = self.generation != taken_at;
        let target = match (direction, applied, stale) {
            (Direction::Redo, true, _) | (Direction::Undo, false, false) => Some(&mut self.undo_stack),
            (Direction::Undo, true, false) | (Direction::Redo, false, false) => Some(&mut self.redo_stack),
            (_, _, true) => None,
        };
        if let Some(stack) = target {
            push_capped(stack, action, max_depth);
        }
    }
}

fn push_capped(stack: &mut Vec<Action>, action: Action, max_depth: usize) {
    stack.push(action);
    if stack.len() > max_depth {
        let excess = stack.len() - max_depth;
        stack.drain(..excess);
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Undo,
    Redo,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Undo => "undo",
            Self::Redo => "redo",
        }
    }
}

// =============================================================================
// OPERATIONS
// =============================================================================

/// Append an action to the actor's undo stack and clear redo.
pub async fn record(state: &AppState, actor_id: Uuid, canvas_id: Uuid, action: Action) {
    if action.is_empty() {
        return;
    }
    let key = HistoryKey::new(actor_id, canvas_id);
    {
        let mut histories = state.histories.write().await;
        histories
            .entry(key)
            .or_default()
            .record(action, state.config.history_max_depth);
    }
    schedule_save(state, key);
}

/// Pop the newest undo action, apply its inverse, and move it to redo.
///
/// # Errors
///
/// Returns `EmptyStack` when there is nothing to undo, or the store error
/// that stopped the replay. On error the action goes back on the undo stack.
/// Objects that no longer exist are not an error.
pub async fn undo(state: &AppState, actor_id: Uuid, canvas_id: Uuid) -> Result<Action, HistoryError> {
    step(state, HistoryKey::new(actor_id, canvas_id), Direction::Undo).await
}

/// Pop the newest redo action, reapply it, and move it back to undo.
///
/// # Errors
///
/// Returns `EmptyStack` when there is nothing to redo, or the store error
/// that stopped the replay. On error the action goes back on the redo stack.
/// Objects that no longer exist are not an error.
pub async fn redo(state: &AppState, actor_id: Uuid, canvas_id: Uuid) -> Result<Action, HistoryError> {
    step(state, HistoryKey::new(actor_id, canvas_id), Direction::Redo).await
}

async fn step(state: &AppState, key: HistoryKey, direction: Direction) -> Result<Action, HistoryError> {
    let max_depth = state.config.history_max_depth;
    let (action, taken_at) = {
        let mut histories = state.histories.write().await;
        let popped = histories.get_mut(&key).and_then(|h| h.take(direction));
        popped.ok_or(HistoryError::EmptyStack(direction.as_str()))?
    };

    let replay = match direction {
        Direction::Undo => action.inverse(),
        Direction::Redo => action.clone(),
    };
    let mut mutations = Vec::new();
    let result = apply_action(state, key.canvas_id, &replay, &mut mutations).await;
    bus::publish_mutations(state, key.canvas_id, &mutations).await;

    {
        let mut histories = state.histories.write().await;
        histories
            .entry(key)
            .or_default()
            .settle(direction, action.clone(), taken_at, result.is_ok(), max_depth);
    }
    schedule_save(state, key);

    match result {
        Ok(()) => {
            info!(actor_id = %key.actor_id, canvas_id = %key.canvas_id, direction = direction.as_str(), applied = mutations.len(), "history step applied");
            Ok(action)
        }
        Err(e) => Err(e.into()),
    }
}

/// Replay `action` against the store in order, collecting committed
/// mutations. Deleting a missing object is a no-op and updating one is
/// skipped. Stops at the first other failure; earlier writes stay applied.
async fn apply_action(
    state: &AppState,
    canvas_id: Uuid,
    action: &Action,
    mutations: &mut Vec<Mutation>,
) -> Result<(), ObjectError> {
    match action {
        Action::Create { object } => {
            let obj = store::insert_object(state, canvas_id, object.clone()).await?;
            mutations.push(Mutation::Created(obj));
        }
        Action::Update { after, .. } => match store::restore_object(state, canvas_id, after).await {
            Ok(obj) => mutations.push(Mutation::Updated(obj)),
            Err(ObjectError::NotFound(object_id)) => {
                warn!(%canvas_id, %object_id, "history replay skipped update of a missing object");
            }
            Err(e) => return Err(e),
        },
        Action::Delete { object } => match store::delete_object(state, canvas_id, object.id).await {
            Ok(_) => mutations.push(Mutation::Deleted(object.id)),
            Err(ObjectError::NotFound(_)) => {}
            Err(e) => return Err(e),
        },
        Action::Batch { actions, .. } => {
            for child in actions {
                Box::pin(apply_action(state, canvas_id, child, mutations)).await?;
            }
        }
    }
    Ok(())
}

// =============================================================================
// PERSISTENCE
// =============================================================================

fn schedule_save(state: &AppState, key: HistoryKey) {
    let task_state = state.clone();
    state
        .history_saves
        .schedule(key, state.config.history_save_debounce(), async move {
            save_now(&task_state, key).await;
        });
}

async fn save_now(state: &AppState, key: HistoryKey) {
    let snapshot = {
        let histories = state.histories.read().await;
        histories.get(&key).cloned()
    };
    let Some(history) = snapshot else {
        return;
    };
    if let Err(e) = save_history(&state.pool, key, &history).await {
        error!(error = %e, actor_id = %key.actor_id, canvas_id = %key.canvas_id, "history save failed");
    }
}

/// Write every history with a save still pending. Used at shutdown.
pub async fn flush_pending(state: &AppState) -> usize {
    let keys = state.history_saves.drain();
    for key in &keys {
        save_now(state, *key).await;
    }
    keys.len()
}

/// Upsert one history row.
///
/// # Errors
///
/// Returns a database error if the write fails.
pub async fn save_history(pool: &PgPool, key: HistoryKey, history: &UndoHistory) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO undo_histories (actor_id, canvas_id, undo_stack, redo_stack, updated_at) \
         VALUES ($1, $2, $3, $4, now()) \
         ON CONFLICT (actor_id, canvas_id) DO UPDATE SET \
             undo_stack = EXCLUDED.undo_stack, redo_stack = EXCLUDED.redo_stack, updated_at = now()",
    )
    .bind(key.actor_id)
    .bind(key.canvas_id)
    .bind(Json(&history.undo_stack))
    .bind(Json(&history.redo_stack))
    .execute(pool)
    .await?;
    Ok(())
}

/// Load all stored histories for a canvas.
///
/// # Errors
///
/// Returns a database error if the query or JSON decoding fails.
pub async fn load_histories(pool: &PgPool, canvas_id: Uuid) -> Result<Vec<(HistoryKey, UndoHistory)>, sqlx::Error> {
    let rows = sqlx::query_as::<_, (Uuid, Json<Vec<Action>>, Json<Vec<Action>>)>(
        "SELECT actor_id, undo_stack, redo_stack FROM undo_histories WHERE canvas_id = $1",
    )
    .bind(canvas_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(actor_id, Json(undo_stack), Json(redo_stack))| {
            (HistoryKey::new(actor_id, canvas_id), UndoHistory { undo_stack, redo_stack, generation: 0 })
        })
        .collect())
}

/// Install loaded histories. Entries already in memory are newer and win.
pub async fn install_histories(state: &AppState, loaded: Vec<(HistoryKey, UndoHistory)>) -> usize {
    let mut histories = state.histories.write().await;
    let mut installed = 0;
    for (key, history) in loaded {
        if let std::collections::hash_map::Entry::Vacant(slot) = histories.entry(key) {
            slot.insert(history);
            installed += 1;
        }
    }
    installed
}

#[cfg(test)]
#[path = "history_test.rs"]
mod tests;
