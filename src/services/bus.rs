//! Broadcast bus — canvas-scoped fan-out of change events.
//!
//! DESIGN
//! ======
//! The bus is an injected [`Broadcast`] trait object rather than ambient
//! global state. It lives for the whole process: built in `main`, handed to
//! `AppState`, and shut down after the server stops accepting traffic.
//!
//! Delivery is best-effort. Each subscriber owns a bounded queue; a full
//! queue skips the frame for that subscriber, a closed queue prunes it.
//! Viewers that miss events reconcile by re-joining (full state reload).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::frame::{Data, FRAME_EVENT, Frame};
use crate::state::{AppState, CanvasObject};

use super::store::Mutation;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BusError {
    #[error("broadcast bus is shut down")]
    Closed,
}

impl crate::frame::ErrorCode for BusError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Closed => "E_BUS_CLOSED",
        }
    }
}

/// Change events published on a canvas topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ObjectCreated,
    ObjectUpdated,
    ObjectDeleted,
    LockAcquired,
    LockReleased,
}

impl EventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ObjectCreated => "object_created",
            Self::ObjectUpdated => "object_updated",
            Self::ObjectDeleted => "object_deleted",
            Self::LockAcquired => "lock_acquired",
            Self::LockReleased => "lock_released",
        }
    }

    /// Syscall used on the wire for this event.
    #[must_use]
    pub fn syscall(self) -> &'static str {
        match self {
            Self::ObjectCreated => "object:created",
            Self::ObjectUpdated => "object:updated",
            Self::ObjectDeleted => "object:deleted",
            Self::LockAcquired => "lock:acquired",
            Self::LockReleased => "lock:released",
        }
    }
}

#[must_use]
pub fn canvas_topic(canvas_id: Uuid) -> String {
    format!("canvas:{canvas_id}")
}

/// Publish/subscribe seam between services and connected viewers.
#[async_trait::async_trait]
pub trait Broadcast: Send + Sync {
    /// Fan `frame` out to every subscriber of `topic`; returns how many
    /// subscribers accepted it.
    async fn publish(&self, topic: &str, frame: Frame) -> Result<usize, BusError>;

    async fn subscribe(&self, topic: &str, subscriber: Uuid, tx: mpsc::Sender<Frame>) -> Result<(), BusError>;

    /// Returns the number of subscribers left on the topic.
    async fn unsubscribe(&self, topic: &str, subscriber: Uuid) -> usize;

    async fn subscriber_count(&self, topic: &str) -> usize;

    /// Drop every subscriber and refuse further traffic.
    async fn shutdown(&self);
}

// =============================================================================
// CHANNEL BUS
// =============================================================================

/// In-process bus backed by per-subscriber `mpsc` queues.
#[derive(Default)]
pub struct ChannelBus {
    topics: RwLock<HashMap<String, HashMap<Uuid, mpsc::Sender<Frame>>>>,
    closed: AtomicBool,
}

impl ChannelBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Broadcast for ChannelBus {
    async fn publish(&self, topic: &str, frame: Frame) -> Result<usize, BusError> {
        self.ensure_open()?;

        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let topics = self.topics.read().await;
            let Some(subscribers) = topics.get(topic) else {
                return Ok(0);
            };
            for (subscriber, tx) in subscribers {
                match tx.try_send(frame.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(%subscriber, topic, syscall = %frame.syscall, "bus: subscriber queue full; skipping frame");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*subscriber),
                }
            }
        }

        if !dead.is_empty() {
            let mut topics = self.topics.write().await;
            if let Some(subscribers) = topics.get_mut(topic) {
                for subscriber in &dead {
                    subscribers.remove(subscriber);
                }
                if subscribers.is_empty() {
                    topics.remove(topic);
                }
            }
            debug!(topic, pruned = dead.len(), "bus: pruned closed subscribers");
        }

        Ok(delivered)
    }

    async fn subscribe(&self, topic: &str, subscriber: Uuid, tx: mpsc::Sender<Frame>) -> Result<(), BusError> {
        self.ensure_open()?;
        let mut topics = self.topics.write().await;
        topics.entry(topic.to_owned()).or_default().insert(subscriber, tx);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str, subscriber: Uuid) -> usize {
        let mut topics = self.topics.write().await;
        let Some(subscribers) = topics.get_mut(topic) else {
            return 0;
        };
        subscribers.remove(&subscriber);
        let remaining = subscribers.len();
        if remaining == 0 {
            topics.remove(topic);
        }
        remaining
    }

    async fn subscriber_count(&self, topic: &str) -> usize {
        let topics = self.topics.read().await;
        topics.get(topic).map_or(0, HashMap::len)
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let mut topics = self.topics.write().await;
        topics.clear();
    }
}

// =============================================================================
// EVENT PUBLISHING
// =============================================================================

/// Publish one change event on the canvas topic. Fire-and-forget: failures
/// are logged and never reach the caller, whose mutation already committed.
pub async fn publish_event(state: &AppState, canvas_id: Uuid, kind: EventKind, mut data: Data) {
    data.insert(FRAME_EVENT.into(), serde_json::json!(kind.as_str()));
    let frame = Frame::request(kind.syscall(), data).with_canvas_id(canvas_id);
    if let Err(e) = state.bus.publish(&canvas_topic(canvas_id), frame).await {
        warn!(error = %e, %canvas_id, event = kind.as_str(), "bus: publish failed");
    }
}

/// Publish the event matching a store mutation.
pub async fn publish_mutation(state: &AppState, canvas_id: Uuid, mutation: &Mutation) {
    let (kind, data) = match mutation {
        Mutation::Created(obj) => (EventKind::ObjectCreated, object_to_data(obj)),
        Mutation::Updated(obj) => (EventKind::ObjectUpdated, object_to_data(obj)),
        Mutation::Deleted(id) => {
            let mut data = Data::new();
            data.insert("id".into(), serde_json::json!(id));
            (EventKind::ObjectDeleted, data)
        }
    };
    publish_event(state, canvas_id, kind, data).await;
}

pub async fn publish_mutations(state: &AppState, canvas_id: Uuid, mutations: &[Mutation]) {
    for mutation in mutations {
        publish_mutation(state, canvas_id, mutation).await;
    }
}

#[must_use]
pub fn object_to_data(obj: &CanvasObject) -> Data {
    let mut data = Data::new();
    data.insert("id".into(), serde_json::json!(obj.id));
    data.insert("canvas_id".into(), serde_json::json!(obj.canvas_id));
    data.insert("kind".into(), serde_json::json!(obj.kind));
    data.insert("x".into(), serde_json::json!(obj.x));
    data.insert("y".into(), serde_json::json!(obj.y));
    data.insert("z_index".into(), serde_json::json!(obj.z_index));
    data.insert("group_id".into(), serde_json::json!(obj.group_id));
    data.insert("component_id".into(), serde_json::json!(obj.component_id));
    data.insert("data".into(), obj.data.clone());
    data.insert("locked_by".into(), serde_json::json!(obj.locked_by));
    data.insert("locked_at".into(), serde_json::json!(obj.locked_at));
    data.insert("version".into(), serde_json::json!(obj.version));
    data
}
