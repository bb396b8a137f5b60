//! Duplicate detection at enqueue time.
//!
//! Retry-happy UIs submit the same mutation more than once. The filter
//! compares a candidate against the pending queue: duplicate Creates are
//! suppressed, duplicate Updates are coalesced into the pending patch,
//! duplicate Deletes are dropped.

use crate::config::SyncConfig;
use crate::operation::{Action, OpToken, QueuedOperation};
use crate::{CollectionName, Timestamp};
use serde_json::Value;
use std::collections::HashMap;

/// Outcome of checking a candidate operation against the pending queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupDecision {
    /// Not a duplicate; enqueue it.
    Fresh,
    /// Semantically equivalent to the named pending operation; drop it.
    Duplicate(OpToken),
    /// An Update against a record with a pending Update; merge the patch
    /// into the named operation instead of enqueueing.
    Coalesce(OpToken),
}

/// Stateless duplicate detector, configured per collection.
#[derive(Debug, Clone)]
pub struct DedupFilter {
    window_ms: u64,
    natural_keys: HashMap<CollectionName, Vec<String>>,
}

impl DedupFilter {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            window_ms: config.dedup_window_ms,
            natural_keys: config.natural_keys.clone(),
        }
    }

    /// Decide whether `candidate` duplicates a pending operation.
    ///
    /// `ops` is the full queue; synced entries are ignored.
    pub fn check(
        &self,
        ops: &[QueuedOperation],
        candidate: &QueuedOperation,
        now: Timestamp,
    ) -> DedupDecision {
        let pending = ops
            .iter()
            .filter(|op| !op.synced && op.collection == candidate.collection);

        match candidate.action {
            Action::Create => {
                let keys = match self.natural_keys.get(&candidate.collection) {
                    Some(keys) if !keys.is_empty() => keys,
                    _ => return DedupDecision::Fresh,
                };
                for op in pending.filter(|op| op.action == Action::Create) {
                    if now.saturating_sub(op.enqueued_at) <= self.window_ms
                        && natural_key_matches(keys, &op.payload, &candidate.payload)
                    {
                        return DedupDecision::Duplicate(op.token.clone());
                    }
                }
                DedupDecision::Fresh
            }
            Action::Update => {
                for op in pending.filter(|op| op.action == Action::Update) {
                    if op.target_id == candidate.target_id {
                        return DedupDecision::Coalesce(op.token.clone());
                    }
                }
                DedupDecision::Fresh
            }
            Action::Delete => {
                for op in pending.filter(|op| op.action == Action::Delete) {
                    if op.target_id == candidate.target_id {
                        return DedupDecision::Duplicate(op.token.clone());
                    }
                }
                DedupDecision::Fresh
            }
        }
    }
}

fn natural_key_matches(keys: &[String], a: &Value, b: &Value) -> bool {
    keys.iter().all(|key| match (a.get(key), b.get(key)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    })
}

/// Shallow object merge of `patch` into `base`; later keys win.
pub(crate) fn coalesce_patch(base: &mut Value, patch: &Value) {
    if let (Some(target), Some(delta)) = (base.as_object_mut(), patch.as_object()) {
        for (key, value) in delta {
            target.insert(key.clone(), value.clone());
        }
    }
}
