//! Offline mutation queue and synchronization engine for local-first
//! clients.
//!
//! Mutations apply to a local mirror immediately and are queued durably;
//! a background dispatcher replays them against a remote store whenever
//! connectivity allows, with exponential backoff, duplicate suppression,
//! and temporary-to-authoritative identifier reconciliation.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use tether_engine::{MemoryRemote, MemoryStore, SyncConfig, SyncEngine};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> tether_engine::Result<()> {
//! let engine = SyncEngine::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MemoryRemote::new()),
//!     SyncConfig::default(),
//! )?;
//!
//! // Works offline: the record is readable at once under a temporary id.
//! let id = engine.create("orders", json!({"sku": "A-1", "qty": 2})).await?;
//! assert!(tether_engine::is_temporary_id(&id));
//! assert_eq!(engine.pending_count().await, 1);
//!
//! // Once online, a drain pushes the queue to the remote store.
//! engine.set_online(true);
//! let report = engine.drain().await;
//! assert_eq!(report.synced, 1);
//! assert_eq!(engine.pending_count().await, 0);
//! # Ok(())
//! # }
//! ```
//!
//! Long-running hosts spawn [`SyncEngine::run`] on its own task and feed
//! connectivity changes through [`SyncEngine::set_online`]; the engine
//! then drains on reconnect, on foreground kicks, and on a periodic
//! timer.

mod clock;

pub mod config;
pub mod dedup;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod mirror;
pub mod monitor;
pub mod operation;
pub mod queue;
pub mod reconcile;
pub mod remote;
pub mod storage;

pub use config::SyncConfig;
pub use dedup::{DedupDecision, DedupFilter};
pub use dispatcher::{DrainReport, Dispatcher};
pub use engine::SyncEngine;
pub use error::{Error, Result};
pub use events::{EventBus, SyncEvent};
pub use mirror::{is_temporary_id, temp_record_id, MirrorRecord, MirrorStore, TEMP_ID_PREFIX};
pub use monitor::{ConnectivityMonitor, SyncStatus};
pub use operation::{Action, OpToken, QueuedOperation};
pub use queue::MutationQueue;
pub use reconcile::{reconcile, references_temporary, rewrite_value, RewriteSummary};
pub use remote::{MemoryRemote, RemoteError, RemoteStore};
pub use storage::{DurableKeyValueStore, MemoryStore, StorageError};

/// Identifier of a record, temporary or authoritative.
pub type RecordId = String;

/// Name of a remote collection.
pub type CollectionName = String;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;
