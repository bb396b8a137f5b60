//! Remote document store contract.
//!
//! The engine replays queued mutations against whatever backend the host
//! injects. Implementations own their transport, authentication, and
//! timeouts; the dispatcher only needs the error taxonomy below to decide
//! between retrying and giving up.

use crate::RecordId;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

/// Failure of a remote call, classified for retry decisions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    #[error("remote timeout after {0} ms")]
    Timeout(u64),

    #[error("document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("rejected by remote: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// Transient failures are retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Unavailable(_) | RemoteError::Timeout(_))
    }

    /// A missing document; mutations against it are treated as applied.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound { .. })
    }
}

/// The remote document store the queue is drained against.
///
/// `create` returns the authoritative identifier the store assigned;
/// the engine then rewrites the temporary identifier everywhere.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn create(&self, collection: &str, document: &Value) -> Result<RecordId, RemoteError>;
    async fn update(&self, collection: &str, id: &str, patch: &Value) -> Result<(), RemoteError>;
    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError>;
}

#[derive(Debug, Default)]
struct RemoteInner {
    documents: HashMap<String, HashMap<String, Value>>,
    journal: Vec<String>,
    next_id: u64,
    failure: Option<RemoteError>,
}

/// In-memory remote store for tests and embedders without a backend.
///
/// Assigns sequential authoritative identifiers (`r1`, `r2`, ...) and
/// applies patches as shallow object merges. A failure can be injected
/// with [`MemoryRemote::fail_with`] to simulate outages.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    inner: Mutex<RemoteInner>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `err`; `None` restores service.
    pub async fn fail_with(&self, err: Option<RemoteError>) {
        self.inner.lock().await.failure = err;
    }

    /// Fetch a stored document.
    pub async fn document(&self, collection: &str, id: &str) -> Option<Value> {
        self.inner
            .lock()
            .await
            .documents
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned()
    }

    /// Number of documents in a collection.
    pub async fn collection_size(&self, collection: &str) -> usize {
        self.inner
            .lock()
            .await
            .documents
            .get(collection)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    /// Drop a document out from under the engine, simulating an external
    /// deletion.
    pub async fn remove_document(&self, collection: &str, id: &str) {
        if let Some(c) = self.inner.lock().await.documents.get_mut(collection) {
            c.remove(id);
        }
    }

    /// Chronological log of applied calls, e.g. `"create:orders:r1"`.
    pub async fn journal(&self) -> Vec<String> {
        self.inner.lock().await.journal.clone()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn create(&self, collection: &str, document: &Value) -> Result<RecordId, RemoteError> {
        let mut inner = self.inner.lock().await;
        if let Some(err) = inner.failure.clone() {
            return Err(err);
        }
        inner.next_id += 1;
        let id = format!("r{}", inner.next_id);
        let mut doc = document.clone();
        if let Some(map) = doc.as_object_mut() {
            // The store assigns identity; a client-side id is discarded.
            map.remove("id");
        }
        inner
            .documents
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), doc);
        inner.journal.push(format!("create:{collection}:{id}"));
        Ok(id)
    }

    async fn update(&self, collection: &str, id: &str, patch: &Value) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock().await;
        if let Some(err) = inner.failure.clone() {
            return Err(err);
        }
        let doc = inner
            .documents
            .get_mut(collection)
            .and_then(|c| c.get_mut(id))
            .ok_or_else(|| RemoteError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        if let (Some(base), Some(delta)) = (doc.as_object_mut(), patch.as_object()) {
            for (key, value) in delta {
                base.insert(key.clone(), value.clone());
            }
        }
        inner.journal.push(format!("update:{collection}:{id}"));
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock().await;
        if let Some(err) = inner.failure.clone() {
            return Err(err);
        }
        let removed = inner
            .documents
            .get_mut(collection)
            .and_then(|c| c.remove(id));
        if removed.is_none() {
            return Err(RemoteError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        inner.journal.push(format!("delete:{collection}:{id}"));
        Ok(())
    }
}
