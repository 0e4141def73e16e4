//! Lock manager — exclusive, TTL-bounded editing claims on single objects.
//!
//! DESIGN
//! ======
//! The lock lives on the object itself (`locked_by` + `locked_at`). The
//! transition rules live here, in [`LockState`], as pure functions of the
//! current time and TTL. Expiry is evaluated lazily when someone asks; there
//! is no background sweep.
//!
//! Acquire never blocks. A conflict comes back immediately with the current
//! holder so the caller can show who is editing.

use tracing::info;
use uuid::Uuid;

use crate::frame::{Data, ErrorCode, now_ms};
use crate::state::{AppState, CanvasObject};

use super::bus::{self, EventKind};
use super::store::{self, ObjectError};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("object {object_id} is being edited by {holder}")]
    Conflict { object_id: Uuid, holder: Uuid },
    #[error("object {object_id} is locked by {holder}, not by the caller")]
    NotHolder { object_id: Uuid, holder: Uuid },
    #[error(transparent)]
    Object(#[from] ObjectError),
}

impl ErrorCode for LockError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Conflict { .. } => "E_LOCK_CONFLICT",
            Self::NotHolder { .. } => "E_NOT_HOLDER",
            Self::Object(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::NotHolder { .. } => false,
            Self::Object(e) => e.retryable(),
        }
    }
}

/// Lock state of one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Locked { holder: Uuid, since: i64 },
}

impl LockState {
    #[must_use]
    pub fn of(obj: &CanvasObject) -> Self {
        match (obj.locked_by, obj.locked_at) {
            (Some(holder), Some(since)) => Self::Locked { holder, since },
            _ => Self::Unlocked,
        }
    }

    /// Holder of a lock that has not yet expired at `now`.
    #[must_use]
    pub fn live_holder(self, now: i64, ttl_ms: i64) -> Option<Uuid> {
        match self {
            Self::Locked { holder, since } if now.saturating_sub(since) < ttl_ms => Some(holder),
            _ => None,
        }
    }

    /// Claim the lock for `actor`. Succeeds when unlocked, already held by
    /// `actor` (refreshing `since`), or expired.
    ///
    /// # Errors
    ///
    /// Returns the live holder on conflict.
    pub fn acquire(self, actor: Uuid, now: i64, ttl_ms: i64) -> Result<Self, Uuid> {
        match self.live_holder(now, ttl_ms) {
            Some(holder) if holder != actor => Err(holder),
            _ => Ok(Self::Locked { holder: actor, since: now }),
        }
    }

    /// Drop the lock. Idempotent on an unlocked object; anyone may clear an
    /// expired lock.
    ///
    /// # Errors
    ///
    /// Returns the live holder when it isn't `actor`.
    pub fn release(self, actor: Uuid, now: i64, ttl_ms: i64) -> Result<Self, Uuid> {
        match self.live_holder(now, ttl_ms) {
            Some(holder) if holder != actor => Err(holder),
            _ => Ok(Self::Unlocked),
        }
    }

    /// Write this state back onto the object's lock fields.
    pub fn write_to(self, obj: &mut CanvasObject) {
        match self {
            Self::Unlocked => {
                obj.locked_by = None;
                obj.locked_at = None;
            }
            Self::Locked { holder, since } => {
                obj.locked_by = Some(holder);
                obj.locked_at = Some(since);
            }
        }
    }
}

/// Reject an interactive edit when another actor holds a live lock.
///
/// # Errors
///
/// Returns `Conflict` naming the holder.
pub fn ensure_editable(obj: &CanvasObject, actor: Uuid, now: i64, ttl_ms: i64) -> Result<(), LockError> {
    match LockState::of(obj).live_holder(now, ttl_ms) {
        Some(holder) if holder != actor => Err(LockError::Conflict { object_id: obj.id, holder }),
        _ => Ok(()),
    }
}

// =============================================================================
// OPERATIONS
// =============================================================================

fn lock_event_data(obj: &CanvasObject) -> Data {
    let mut data = Data::new();
    data.insert("id".into(), serde_json::json!(obj.id));
    data.insert("locked_by".into(), serde_json::json!(obj.locked_by));
    data.insert("locked_at".into(), serde_json::json!(obj.locked_at));
    data.insert("version".into(), serde_json::json!(obj.version));
    data
}

/// Acquire the editing lock on an object for `actor` and announce it.
///
/// # Errors
///
/// Returns `Conflict` if another actor holds a live lock, or a store error.
pub async fn acquire_lock(state: &AppState, canvas_id: Uuid, object_id: Uuid, actor: Uuid) -> Result<CanvasObject, LockError> {
    let ttl = state.config.lock_ttl_ms;
    let ((), obj) = store::modify_object(state, canvas_id, object_id, |obj| {
        let next = LockState::of(obj)
            .acquire(actor, now_ms(), ttl)
            .map_err(|holder| LockError::Conflict { object_id, holder })?;
        next.write_to(obj);
        Ok::<_, LockError>(())
    })
    .await?;

    info!(%canvas_id, %object_id, %actor, "lock acquired");
    bus::publish_event(state, canvas_id, EventKind::LockAcquired, lock_event_data(&obj)).await;
    Ok(obj)
}

/// Release the editing lock on an object and announce it. Releasing an
/// unlocked object is a quiet no-op.
///
/// # Errors
///
/// Returns `NotHolder` if another actor holds a live lock, or a store error.
pub async fn release_lock(state: &AppState, canvas_id: Uuid, object_id: Uuid, actor: Uuid) -> Result<CanvasObject, LockError> {
    let current = store::get_object(state, canvas_id, object_id).await?;
    if LockState::of(&current) == LockState::Unlocked {
        return Ok(current);
    }

    let ttl = state.config.lock_ttl_ms;
    let ((), obj) = store::modify_object(state, canvas_id, object_id, |obj| {
        let next = LockState::of(obj)
            .release(actor, now_ms(), ttl)
            .map_err(|holder| LockError::NotHolder { object_id, holder })?;
        next.write_to(obj);
        Ok::<_, LockError>(())
    })
    .await?;

    info!(%canvas_id, %object_id, %actor, "lock released");
    bus::publish_event(state, canvas_id, EventKind::LockReleased, lock_event_data(&obj)).await;
    Ok(obj)
}

/// Partial update that honors other actors' locks. Returns before/after.
///
/// # Errors
///
/// Returns `Conflict` or a store error.
pub async fn update_as(
    state: &AppState,
    canvas_id: Uuid,
    object_id: Uuid,
    actor: Uuid,
    updates: &Data,
) -> Result<(CanvasObject, CanvasObject), LockError> {
    let ttl = state.config.lock_ttl_ms;
    store::update_object(state, canvas_id, object_id, updates, |obj| ensure_editable(obj, actor, now_ms(), ttl)).await
}

/// Delete that honors other actors' locks. Returns the removed object.
///
/// # Errors
///
/// Returns `Conflict` or a store error.
pub async fn delete_as(state: &AppState, canvas_id: Uuid, object_id: Uuid, actor: Uuid) -> Result<CanvasObject, LockError> {
    let ttl = state.config.lock_ttl_ms;
    store::remove_object_if(state, canvas_id, object_id, |obj| ensure_editable(obj, actor, now_ms(), ttl)).await
}

#[cfg(test)]
#[path = "lock_test.rs"]
mod tests;
