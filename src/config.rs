//! Runtime configuration loaded from environment variables.
//!
//! DESIGN
//! ======
//! Every knob has a compiled-in default so a bare `DATABASE_URL` is enough to
//! boot. Values that fail to parse fall back to the default rather than
//! aborting startup; `main` logs the effective configuration once.

use std::time::Duration;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_LOCK_TTL_MS: i64 = 30_000;
const DEFAULT_ARRANGE_WARN_MS: u64 = 500;
const DEFAULT_BATCH_CREATE_LIMIT: usize = 600;
const DEFAULT_HISTORY_MAX_DEPTH: usize = 100;
const DEFAULT_HISTORY_SAVE_DEBOUNCE_MS: u64 = 1000;
const DEFAULT_OBJECT_FLUSH_INTERVAL_MS: u64 = 100;
const DEFAULT_SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// Parse an environment variable, falling back to `default` when it is
/// missing or malformed.
pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Tuning knobs shared by every service through `AppState`.
#[derive(Debug, Clone, Copy)]
pub struct SyncConfig {
    pub port: u16,
    pub db_max_connections: u32,
    /// Age in milliseconds after which a held lock may be taken by anyone.
    pub lock_ttl_ms: i64,
    /// Soft latency target for a single arrangement.
    pub arrange_warn_ms: u64,
    /// Hard ceiling on items accepted by one `batch_create`.
    pub batch_create_limit: usize,
    /// Maximum entries kept on each undo/redo stack.
    pub history_max_depth: usize,
    /// Quiet period before an actor's history is written to Postgres.
    pub history_save_debounce_ms: u64,
    pub object_flush_interval_ms: u64,
    /// Bounded queue size for each socket subscriber.
    pub subscriber_queue_capacity: usize,
}

impl SyncConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            lock_ttl_ms: env_parse("LOCK_TTL_MS", DEFAULT_LOCK_TTL_MS),
            arrange_warn_ms: env_parse("ARRANGE_WARN_MS", DEFAULT_ARRANGE_WARN_MS),
            batch_create_limit: env_parse("BATCH_CREATE_LIMIT", DEFAULT_BATCH_CREATE_LIMIT),
            history_max_depth: env_parse("HISTORY_MAX_DEPTH", DEFAULT_HISTORY_MAX_DEPTH),
            history_save_debounce_ms: env_parse("HISTORY_SAVE_DEBOUNCE_MS", DEFAULT_HISTORY_SAVE_DEBOUNCE_MS),
            object_flush_interval_ms: env_parse("OBJECT_FLUSH_INTERVAL_MS", DEFAULT_OBJECT_FLUSH_INTERVAL_MS),
            subscriber_queue_capacity: env_parse("SUBSCRIBER_QUEUE_CAPACITY", DEFAULT_SUBSCRIBER_QUEUE_CAPACITY),
        }
    }

    #[must_use]
    pub fn arrange_warn_after(&self) -> Duration {
        Duration::from_millis(self.arrange_warn_ms)
    }

    #[must_use]
    pub fn history_save_debounce(&self) -> Duration {
        Duration::from_millis(self.history_save_debounce_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            db_max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            lock_ttl_ms: DEFAULT_LOCK_TTL_MS,
            arrange_warn_ms: DEFAULT_ARRANGE_WARN_MS,
            batch_create_limit: DEFAULT_BATCH_CREATE_LIMIT,
            history_max_depth: DEFAULT_HISTORY_MAX_DEPTH,
            history_save_debounce_ms: DEFAULT_HISTORY_SAVE_DEBOUNCE_MS,
            object_flush_interval_ms: DEFAULT_OBJECT_FLUSH_INTERVAL_MS,
            subscriber_queue_capacity: DEFAULT_SUBSCRIBER_QUEUE_CAPACITY,
        }
    }
}
