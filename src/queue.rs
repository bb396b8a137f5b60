//! Durable FIFO mutation queue.
//!
//! Append-only, stable insertion order. Every mutating call persists the
//! whole queue through the durable store before returning, so a crash
//! never loses an accepted write.

use crate::dedup::{coalesce_patch, DedupDecision, DedupFilter};
use crate::error::Result;
use crate::operation::{OpToken, QueuedOperation};
use crate::reconcile::rewrite_value;
use crate::storage::DurableKeyValueStore;
use crate::{Error, Timestamp};
use std::sync::Arc;
use tracing::debug;

const QUEUE_KEY: &str = "tether::queue";

/// The durable, ordered log of pending write operations.
pub struct MutationQueue {
    storage: Arc<dyn DurableKeyValueStore>,
    dedup: DedupFilter,
    ops: Vec<QueuedOperation>,
}

impl MutationQueue {
    /// Load the queue from durable storage, or start empty.
    pub fn load(storage: Arc<dyn DurableKeyValueStore>, dedup: DedupFilter) -> Result<Self> {
        let ops = match storage.get(QUEUE_KEY) {
            Some(json) => serde_json::from_str(&json)?,
            None => Vec::new(),
        };
        Ok(Self {
            storage,
            dedup,
            ops,
        })
    }

    /// Append an operation, unless it duplicates a pending one.
    ///
    /// Returns the token of the newly queued operation, or `None` when
    /// the candidate was suppressed or coalesced.
    pub fn enqueue(&mut self, op: QueuedOperation, now: Timestamp) -> Result<Option<OpToken>> {
        match self.dedup.check(&self.ops, &op, now) {
            DedupDecision::Fresh => {
                let token = op.token.clone();
                debug!(token = %token, collection = %op.collection, action = ?op.action, "operation enqueued");
                self.ops.push(op);
                self.persist()?;
                Ok(Some(token))
            }
            DedupDecision::Duplicate(existing) => {
                debug!(existing = %existing, "duplicate operation suppressed");
                Ok(None)
            }
            DedupDecision::Coalesce(existing) => {
                if let Some(pending) = self.ops.iter_mut().find(|o| o.token == existing) {
                    coalesce_patch(&mut pending.payload, &op.payload);
                }
                debug!(existing = %existing, "patch coalesced into pending operation");
                self.persist()?;
                Ok(None)
            }
        }
    }

    /// The pending operation a candidate would duplicate, if any.
    pub fn find_duplicate(
        &self,
        candidate: &QueuedOperation,
        now: Timestamp,
    ) -> Option<&QueuedOperation> {
        match self.dedup.check(&self.ops, candidate, now) {
            DedupDecision::Duplicate(token) | DedupDecision::Coalesce(token) => self.get(&token),
            DedupDecision::Fresh => None,
        }
    }

    /// All unsynced operations, in enqueue order.
    pub fn list_pending(&self) -> Vec<QueuedOperation> {
        self.ops.iter().filter(|op| !op.synced).cloned().collect()
    }

    /// Look up an operation by token.
    pub fn get(&self, token: &str) -> Option<&QueuedOperation> {
        self.ops.iter().find(|op| op.token == token)
    }

    /// Flag an operation as acknowledged by the remote store. The entry
    /// stays in the log until retention cleanup purges it.
    pub fn mark_synced(&mut self, token: &str) -> Result<()> {
        let op = self
            .ops
            .iter_mut()
            .find(|op| op.token == token)
            .ok_or_else(|| Error::OperationNotFound(token.to_string()))?;
        op.synced = true;
        self.persist()
    }

    /// Record a delivery attempt.
    pub fn increment_retry(&mut self, token: &str, now: Timestamp) -> Result<()> {
        let op = self
            .ops
            .iter_mut()
            .find(|op| op.token == token)
            .ok_or_else(|| Error::OperationNotFound(token.to_string()))?;
        op.retry_count += 1;
        op.last_retry_at = Some(now);
        self.persist()
    }

    /// Remove an operation outright.
    pub fn remove(&mut self, token: &str) -> Result<()> {
        let before = self.ops.len();
        self.ops.retain(|op| op.token != token);
        if self.ops.len() == before {
            return Err(Error::OperationNotFound(token.to_string()));
        }
        self.persist()
    }

    /// Purge synced operations older than the retention window. Returns
    /// the number purged.
    pub fn cleanup(&mut self, retention_ms: u64, now: Timestamp) -> Result<usize> {
        let before = self.ops.len();
        self.ops
            .retain(|op| !op.synced || now.saturating_sub(op.enqueued_at) <= retention_ms);
        let purged = before - self.ops.len();
        if purged > 0 {
            self.persist()?;
        }
        Ok(purged)
    }

    /// Reset the retry bookkeeping of every failed operation, making it
    /// eligible for the next drain. Returns the number reset.
    pub fn retry_failed(&mut self, retry_ceiling: u32) -> Result<usize> {
        let mut reset = 0;
        for op in self
            .ops
            .iter_mut()
            .filter(|op| op.is_failed(retry_ceiling))
        {
            op.retry_count = 0;
            op.last_retry_at = None;
            reset += 1;
        }
        if reset > 0 {
            self.persist()?;
        }
        Ok(reset)
    }

    /// Unsynced operations still below the retry ceiling.
    pub fn pending_count(&self, retry_ceiling: u32) -> usize {
        self.ops
            .iter()
            .filter(|op| !op.synced && op.retry_count < retry_ceiling)
            .count()
    }

    /// Unsynced operations at or above the retry ceiling.
    pub fn failed_count(&self, retry_ceiling: u32) -> usize {
        self.ops.iter().filter(|op| op.is_failed(retry_ceiling)).count()
    }

    /// Whether any unsynced operation still concerns `id`.
    pub fn references_record(&self, collection: &str, id: &str) -> bool {
        self.ops
            .iter()
            .filter(|op| !op.synced && op.collection == collection)
            .any(|op| op.local_record_id() == Some(id))
    }

    /// Rewrite `temp_id` to `auth_id` in the targets and payloads of all
    /// unsynced operations. Returns the number rewritten.
    pub fn rewrite_references(&mut self, temp_id: &str, auth_id: &str) -> Result<usize> {
        let mut rewritten = 0;
        for op in self.ops.iter_mut().filter(|op| !op.synced) {
            let mut changed = false;
            if op.target_id.as_deref() == Some(temp_id) {
                op.target_id = Some(auth_id.to_string());
                changed = true;
            }
            if rewrite_value(&mut op.payload, temp_id, auth_id) > 0 {
                changed = true;
            }
            if changed {
                rewritten += 1;
            }
        }
        if rewritten > 0 {
            self.persist()?;
        }
        Ok(rewritten)
    }

    fn persist(&self) -> Result<()> {
        let json = serde_json::to_string(&self.ops)?;
        self.storage.set(QUEUE_KEY, &json).map_err(Error::from)
    }
}
