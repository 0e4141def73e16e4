//! Debounced task scheduler keyed by actor + resource.
//!
//! DESIGN
//! ======
//! `schedule` cancels whatever is pending for the key and arms a fresh
//! delayed task, so a burst of inputs collapses into one run after the
//! quiet period. Each armed task carries a generation number; a task only
//! clears its own map entry, never a newer one armed while it slept.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

struct Pending {
    generation: u64,
    handle: JoinHandle<()>,
}

struct Inner<K> {
    next_generation: u64,
    pending: HashMap<K, Pending>,
}

#[derive(Clone)]
pub struct Debouncer<K> {
    inner: Arc<Mutex<Inner<K>>>,
}

impl<K> Default for Debouncer<K> {
    fn default() -> Self {
        Self { inner: Arc::new(Mutex::new(Inner { next_generation: 0, pending: HashMap::new() })) }
    }
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `task` to run after `delay`, replacing any pending task for `key`.
    pub fn schedule<F>(&self, key: K, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.next_generation += 1;
        let generation = inner.next_generation;

        let registry = Arc::clone(&self.inner);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut inner = registry.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                if inner.pending.get(&task_key).is_some_and(|p| p.generation == generation) {
                    inner.pending.remove(&task_key);
                }
            }
            task.await;
        });

        if let Some(previous) = inner.pending.insert(key, Pending { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// Cancel the pending task for `key`. Returns whether one was pending.
    pub fn cancel(&self, key: &K) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match inner.pending.remove(key) {
            Some(pending) => {
                pending.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel everything pending and return the keys that were armed, so a
    /// caller shutting down can run the work inline.
    pub fn drain(&self) -> Vec<K> {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner
            .pending
            .drain()
            .map(|(key, pending)| {
                pending.handle.abort();
                key
            })
            .collect()
    }

    /// Number of armed tasks that have not started yet.
    #[must_use]
    pub fn pending(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.pending.len()
    }
}
