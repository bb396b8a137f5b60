//! Public facade over the queue, mirror, and dispatcher.
//!
//! Mutations apply to the local mirror immediately and enqueue a durable
//! operation for later synchronization. Reads never touch the network.

use crate::config::SyncConfig;
use crate::dedup::DedupFilter;
use crate::dispatcher::{DrainReport, Dispatcher};
use crate::error::{Error, Result};
use crate::events::{EventBus, SyncEvent};
use crate::mirror::{temp_record_id, MirrorRecord, MirrorStore};
use crate::monitor::{ConnectivityMonitor, SyncStatus};
use crate::operation::QueuedOperation;
use crate::queue::MutationQueue;
use crate::remote::RemoteStore;
use crate::storage::DurableKeyValueStore;
use crate::{clock, RecordId};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tracing::info;

pub(crate) struct EngineState {
    pub(crate) queue: MutationQueue,
    pub(crate) mirror: MirrorStore,
}

/// Offline-first mutation queue and synchronization engine.
pub struct SyncEngine {
    state: Arc<Mutex<EngineState>>,
    events: EventBus,
    config: SyncConfig,
    dispatcher: Dispatcher,
    online_tx: watch::Sender<bool>,
    online_rx: watch::Receiver<bool>,
    kick: Arc<Notify>,
}

impl SyncEngine {
    /// Build an engine over durable storage and a remote store. Queue
    /// and mirror state from a previous run is loaded back in.
    pub fn new(
        storage: Arc<dyn DurableKeyValueStore>,
        remote: Arc<dyn RemoteStore>,
        config: SyncConfig,
    ) -> Result<Self> {
        let dedup = DedupFilter::from_config(&config);
        let queue = MutationQueue::load(storage.clone(), dedup)?;
        let mirror = MirrorStore::load(storage)?;
        let state = Arc::new(Mutex::new(EngineState { queue, mirror }));
        let events = EventBus::new(config.event_capacity);
        let (online_tx, online_rx) = watch::channel(false);
        let dispatcher = Dispatcher::new(
            state.clone(),
            remote,
            events.clone(),
            config.clone(),
        );

        Ok(Self {
            state,
            events,
            config,
            dispatcher,
            online_tx,
            online_rx,
            kick: Arc::new(Notify::new()),
        })
    }

    /// Create a record optimistically. Returns the temporary identifier
    /// the record is reachable under until the remote assigns the real
    /// one. A duplicate submission returns the identifier of the
    /// already-pending create instead of enqueueing.
    pub async fn create(&self, collection: &str, fields: Value) -> Result<RecordId> {
        if !fields.is_object() {
            return Err(Error::InvalidPayload(
                "create payload must be a JSON object".into(),
            ));
        }

        let now = clock::now_ms();
        let temp_id = temp_record_id();
        let mut document = fields.clone();
        if let Some(map) = document.as_object_mut() {
            map.insert("id".into(), Value::String(temp_id.clone()));
        }
        let op = QueuedOperation::create(collection, document, now);

        let mut guard = self.state.lock().await;
        if let Some(existing) = guard.queue.find_duplicate(&op, now) {
            let existing_id = existing
                .local_record_id()
                .unwrap_or(temp_id.as_str())
                .to_string();
            return Ok(existing_id);
        }

        guard.mirror.upsert(
            collection,
            MirrorRecord {
                id: temp_id.clone(),
                fields,
                pending: true,
            },
        )?;
        let token = guard.queue.enqueue(op, now)?;
        let pending = guard.queue.pending_count(self.config.retry_ceiling);
        drop(guard);

        if let Some(token) = token {
            self.events.emit(SyncEvent::OperationEnqueued {
                token,
                collection: collection.to_string(),
            });
            self.events.emit(SyncEvent::QueueSizeChanged { pending });
        }
        self.kick_if_online();
        Ok(temp_id)
    }

    /// Patch a record's fields optimistically. The patch is shallow:
    /// top-level keys replace, everything else is untouched.
    pub async fn update(&self, collection: &str, id: &str, patch: Value) -> Result<()> {
        if !patch.is_object() {
            return Err(Error::InvalidPayload(
                "update patch must be a JSON object".into(),
            ));
        }

        let now = clock::now_ms();
        let mut guard = self.state.lock().await;
        guard.mirror.apply_patch(collection, id, &patch)?;
        let op = QueuedOperation::update(collection, id, patch, now);
        let token = guard.queue.enqueue(op, now)?;
        let pending = guard.queue.pending_count(self.config.retry_ceiling);
        drop(guard);

        if let Some(token) = token {
            self.events.emit(SyncEvent::OperationEnqueued {
                token,
                collection: collection.to_string(),
            });
            self.events.emit(SyncEvent::QueueSizeChanged { pending });
        }
        self.kick_if_online();
        Ok(())
    }

    /// Delete a record optimistically. The mirror entry disappears at
    /// once; the remote copy goes when the operation syncs.
    pub async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let now = clock::now_ms();
        let mut guard = self.state.lock().await;
        guard.mirror.remove(collection, id)?;
        let op = QueuedOperation::delete(collection, id, now);
        let token = guard.queue.enqueue(op, now)?;
        let pending = guard.queue.pending_count(self.config.retry_ceiling);
        drop(guard);

        if let Some(token) = token {
            self.events.emit(SyncEvent::OperationEnqueued {
                token,
                collection: collection.to_string(),
            });
            self.events.emit(SyncEvent::QueueSizeChanged { pending });
        }
        self.kick_if_online();
        Ok(())
    }

    /// Read a record from the mirror.
    pub async fn get(&self, collection: &str, id: &str) -> Option<MirrorRecord> {
        let guard = self.state.lock().await;
        guard.mirror.get(collection, id).cloned()
    }

    /// All mirror records of a collection whose fields satisfy the
    /// predicate.
    pub async fn query<F>(&self, collection: &str, predicate: F) -> Vec<MirrorRecord>
    where
        F: Fn(&Value) -> bool,
    {
        let guard = self.state.lock().await;
        guard
            .mirror
            .query(collection, predicate)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Run one drain pass now, regardless of connectivity state.
    pub async fn drain(&self) -> DrainReport {
        self.dispatcher.drain().await
    }

    /// Put operations that exhausted their retries back into rotation.
    /// Returns how many were reset.
    pub async fn retry_failed(&self) -> Result<usize> {
        let mut guard = self.state.lock().await;
        let reset = guard.queue.retry_failed(self.config.retry_ceiling)?;
        drop(guard);
        if reset > 0 {
            info!(reset, "failed operations requeued");
            self.kick_if_online();
        }
        Ok(reset)
    }

    /// Number of operations still waiting to sync.
    pub async fn pending_count(&self) -> usize {
        let guard = self.state.lock().await;
        guard.queue.pending_count(self.config.retry_ceiling)
    }

    /// Number of operations that hit the retry ceiling.
    pub async fn failed_count(&self) -> usize {
        let guard = self.state.lock().await;
        guard.queue.failed_count(self.config.retry_ceiling)
    }

    /// Snapshot connectivity and queue state.
    pub async fn status(&self) -> SyncStatus {
        let guard = self.state.lock().await;
        SyncStatus {
            is_online: *self.online_rx.borrow(),
            is_syncing: self.dispatcher.is_draining(),
            pending_count: guard.queue.pending_count(self.config.retry_ceiling),
            failed_count: guard.queue.failed_count(self.config.retry_ceiling),
        }
    }

    /// Report a connectivity change. Going online wakes the monitor.
    pub fn set_online(&self, online: bool) {
        let changed = self.online_tx.send_if_modified(|current| {
            if *current != online {
                *current = online;
                true
            } else {
                false
            }
        });
        if changed {
            info!(online, "connectivity reported");
        }
    }

    /// App came to the foreground; drain soon if the link is up.
    pub fn notify_foreground(&self) {
        self.kick_if_online();
    }

    /// Subscribe to engine events. Slow readers miss events rather than
    /// block the engine.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Drive the background loop. Runs until the engine is dropped from
    /// every other handle; spawn it on its own task.
    pub async fn run(&self) {
        let monitor = ConnectivityMonitor::new(
            self.dispatcher.clone(),
            self.online_rx.clone(),
            self.kick.clone(),
            self.config.settle_delay_ms,
            self.config.drain_interval_ms,
        );
        monitor.run().await;
    }

    fn kick_if_online(&self) {
        if *self.online_rx.borrow() {
            self.kick.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn engine_with(config: SyncConfig) -> (SyncEngine, Arc<MemoryRemote>) {
        let remote = Arc::new(MemoryRemote::new());
        let engine = SyncEngine::new(Arc::new(MemoryStore::new()), remote.clone(), config).unwrap();
        (engine, remote)
    }

    fn engine() -> (SyncEngine, Arc<MemoryRemote>) {
        engine_with(SyncConfig::default())
    }

    #[tokio::test]
    async fn create_lands_in_mirror_and_queue() {
        let (engine, _) = engine();
        let id = engine
            .create("orders", json!({"sku": "A-1"}))
            .await
            .unwrap();

        let record = engine.get("orders", &id).await.unwrap();
        assert_eq!(record.fields, json!({"sku": "A-1"}));
        assert!(record.pending);
        assert_eq!(engine.pending_count().await, 1);
    }

    #[tokio::test]
    async fn duplicate_create_returns_existing_id() {
        let config = SyncConfig::default().with_natural_key("orders", ["sku"]);
        let (engine, _) = engine_with(config);

        let first = engine
            .create("orders", json!({"sku": "A-1"}))
            .await
            .unwrap();
        let second = engine
            .create("orders", json!({"sku": "A-1"}))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(engine.pending_count().await, 1);
        assert_eq!(engine.query("orders", |_| true).await.len(), 1);
    }

    #[tokio::test]
    async fn update_coalesces_into_pending_patch() {
        let (engine, _) = engine();
        let id = engine
            .create("orders", json!({"sku": "A-1", "qty": 1}))
            .await
            .unwrap();

        engine.update("orders", &id, json!({"qty": 2})).await.unwrap();
        engine.update("orders", &id, json!({"qty": 5})).await.unwrap();

        let record = engine.get("orders", &id).await.unwrap();
        assert_eq!(record.fields, json!({"sku": "A-1", "qty": 5}));
        // one create plus one coalesced update
        assert_eq!(engine.pending_count().await, 2);
    }

    #[tokio::test]
    async fn non_object_payloads_are_rejected() {
        let (engine, _) = engine();
        let created = engine.create("orders", json!([1, 2])).await;
        assert!(matches!(created, Err(Error::InvalidPayload(_))));

        let id = engine.create("orders", json!({"sku": "A"})).await.unwrap();
        let updated = engine.update("orders", &id, json!("nope")).await;
        assert!(matches!(updated, Err(Error::InvalidPayload(_))));
    }

    #[tokio::test]
    async fn update_missing_record_errors() {
        let (engine, _) = engine();
        let result = engine.update("orders", "ghost", json!({"qty": 1})).await;
        assert!(matches!(result, Err(Error::RecordNotFound(_))));
    }

    #[tokio::test]
    async fn delete_removes_from_mirror_immediately() {
        let (engine, _) = engine();
        let id = engine.create("orders", json!({"sku": "A"})).await.unwrap();
        engine.delete("orders", &id).await.unwrap();
        assert!(engine.get("orders", &id).await.is_none());
    }

    #[tokio::test]
    async fn status_reflects_connectivity_and_counts() {
        let (engine, _) = engine();
        engine.create("orders", json!({"sku": "A"})).await.unwrap();

        let status = engine.status().await;
        assert!(!status.is_online);
        assert!(!status.is_syncing);
        assert_eq!(status.pending_count, 1);
        assert_eq!(status.failed_count, 0);

        engine.set_online(true);
        assert!(engine.status().await.is_online);
    }

    #[tokio::test]
    async fn events_emitted_on_enqueue() {
        let (engine, _) = engine();
        let mut events = engine.subscribe();

        engine.create("orders", json!({"sku": "A"})).await.unwrap();

        let first = events.try_recv().unwrap();
        assert_eq!(first.event_type(), "OperationEnqueued");
        let second = events.try_recv().unwrap();
        assert_eq!(second, SyncEvent::QueueSizeChanged { pending: 1 });
    }
}
