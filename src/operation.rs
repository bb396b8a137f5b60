//! Queued operation types.
//!
//! Mutations are expressed as durable queue entries, not direct remote
//! calls. This is what lets the engine accept writes while offline and
//! replay them later in order.

use crate::{CollectionName, RecordId, Timestamp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a queued operation. Never reused.
pub type OpToken = String;

/// The kind of mutation an operation carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

/// One durable record per pending mutation.
///
/// `payload` is the full document for a Create (including the temporary
/// id under `"id"`), a partial patch for an Update, and `null` for a
/// Delete. `target_id` is absent for Creates; it may hold a temporary
/// identifier until reconciliation rewrites it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    /// Operation token, generated at enqueue
    pub token: OpToken,
    /// Target collection
    pub collection: CollectionName,
    /// Mutation kind
    pub action: Action,
    /// Record this operation targets (Update/Delete only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<RecordId>,
    /// Document or patch
    pub payload: serde_json::Value,
    /// When the operation was enqueued
    pub enqueued_at: Timestamp,
    /// Whether the remote store has acknowledged it
    pub synced: bool,
    /// Delivery attempts so far
    pub retry_count: u32,
    /// When the last attempt was made
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_retry_at: Option<Timestamp>,
}

fn new_token() -> OpToken {
    Uuid::new_v4().to_string()
}

impl QueuedOperation {
    /// Build a Create operation. The payload must carry the record's
    /// temporary id under `"id"`.
    pub fn create(
        collection: impl Into<CollectionName>,
        payload: serde_json::Value,
        enqueued_at: Timestamp,
    ) -> Self {
        Self {
            token: new_token(),
            collection: collection.into(),
            action: Action::Create,
            target_id: None,
            payload,
            enqueued_at,
            synced: false,
            retry_count: 0,
            last_retry_at: None,
        }
    }

    /// Build an Update operation carrying a partial patch.
    pub fn update(
        collection: impl Into<CollectionName>,
        target_id: impl Into<RecordId>,
        patch: serde_json::Value,
        enqueued_at: Timestamp,
    ) -> Self {
        Self {
            token: new_token(),
            collection: collection.into(),
            action: Action::Update,
            target_id: Some(target_id.into()),
            payload: patch,
            enqueued_at,
            synced: false,
            retry_count: 0,
            last_retry_at: None,
        }
    }

    /// Build a Delete operation.
    pub fn delete(
        collection: impl Into<CollectionName>,
        target_id: impl Into<RecordId>,
        enqueued_at: Timestamp,
    ) -> Self {
        Self {
            token: new_token(),
            collection: collection.into(),
            action: Action::Delete,
            target_id: Some(target_id.into()),
            payload: serde_json::Value::Null,
            enqueued_at,
            synced: false,
            retry_count: 0,
            last_retry_at: None,
        }
    }

    /// The local record this operation concerns: the payload's `"id"` for
    /// a Create, the target otherwise.
    pub fn local_record_id(&self) -> Option<&str> {
        match self.action {
            Action::Create => self.payload.get("id").and_then(serde_json::Value::as_str),
            Action::Update | Action::Delete => self.target_id.as_deref(),
        }
    }

    /// Whether this operation has reached the retry ceiling without
    /// syncing.
    pub fn is_failed(&self, retry_ceiling: u32) -> bool {
        !self.synced && self.retry_count >= retry_ceiling
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_op() {
        let op = QueuedOperation::create("orders", json!({"id": "tmp_a", "sku": "A"}), 1000);
        assert_eq!(op.action, Action::Create);
        assert_eq!(op.collection, "orders");
        assert_eq!(op.target_id, None);
        assert_eq!(op.local_record_id(), Some("tmp_a"));
        assert!(!op.synced);
        assert_eq!(op.retry_count, 0);
    }

    #[test]
    fn update_op() {
        let op = QueuedOperation::update("orders", "r1", json!({"qty": 2}), 2000);
        assert_eq!(op.action, Action::Update);
        assert_eq!(op.target_id.as_deref(), Some("r1"));
        assert_eq!(op.local_record_id(), Some("r1"));
    }

    #[test]
    fn delete_op() {
        let op = QueuedOperation::delete("orders", "r1", 3000);
        assert_eq!(op.action, Action::Delete);
        assert_eq!(op.payload, serde_json::Value::Null);
        assert_eq!(op.local_record_id(), Some("r1"));
    }

    #[test]
    fn tokens_are_unique() {
        let a = QueuedOperation::create("orders", json!({}), 0);
        let b = QueuedOperation::create("orders", json!({}), 0);
        assert_ne!(a.token, b.token);
    }

    #[test]
    fn failed_flag_is_derived() {
        let mut op = QueuedOperation::delete("orders", "r1", 0);
        assert!(!op.is_failed(5));
        op.retry_count = 5;
        assert!(op.is_failed(5));
        op.synced = true;
        assert!(!op.is_failed(5));
    }

    #[test]
    fn serialization_camel_case() {
        let op = QueuedOperation::update("orders", "r1", json!({"qty": 2}), 2000);
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"action\":\"update\""));
        assert!(json.contains("\"targetId\":\"r1\""));
        assert!(json.contains("\"enqueuedAt\":2000"));
        assert!(json.contains("\"retryCount\":0"));
        assert!(!json.contains("lastRetryAt"));

        let parsed: QueuedOperation = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, op);
    }
}
