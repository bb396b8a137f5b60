//! Engine configuration.

use crate::CollectionName;
use std::collections::HashMap;

/// Tunables for queueing, retry, and synchronization behavior.
///
/// The defaults are sensible for interactive clients; embedders override
/// individual fields as needed.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Retry attempts before an operation is flagged as failed.
    pub retry_ceiling: u32,
    /// Base delay for exponential backoff, in milliseconds.
    pub backoff_base_ms: u64,
    /// Upper bound on the backoff delay, in milliseconds.
    pub backoff_cap_ms: u64,
    /// Window within which an equivalent Create is treated as a duplicate.
    pub dedup_window_ms: u64,
    /// How long synced operations are retained before cleanup.
    pub retention_ms: u64,
    /// Delay after an offline-to-online transition before draining.
    pub settle_delay_ms: u64,
    /// Interval between periodic drains while online.
    pub drain_interval_ms: u64,
    /// Fields forming the natural key of a collection, for Create dedup.
    /// Collections without an entry never deduplicate Creates.
    pub natural_keys: HashMap<CollectionName, Vec<String>>,
    /// Buffer capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: 5,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            dedup_window_ms: 5_000,
            retention_ms: 24 * 60 * 60 * 1_000,
            settle_delay_ms: 1_000,
            drain_interval_ms: 30_000,
            natural_keys: HashMap::new(),
            event_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Register the natural-key fields of a collection.
    pub fn with_natural_key<I, S>(mut self, collection: impl Into<CollectionName>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.natural_keys
            .insert(collection.into(), fields.into_iter().map(Into::into).collect());
        self
    }
}
