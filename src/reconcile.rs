//! Temporary-to-authoritative identifier reconciliation.
//!
//! When a Create reaches the remote store, the store assigns the real
//! identifier. Every trace of the temporary one (the mirror record's
//! key, foreign references in other records' fields, targets and
//! payloads of still-pending operations) is rewritten in one logical
//! step, so no caller ever observes a half-reconciled state.

use crate::error::Result;
use crate::mirror::{is_temporary_id, MirrorStore};
use crate::queue::MutationQueue;
use serde_json::Value;
use tracing::debug;

/// Counts of what a reconciliation pass rewrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteSummary {
    pub records_rewritten: usize,
    pub ops_rewritten: usize,
}

/// Rewrite `temp_id` to `auth_id` across the mirror and the queue.
pub fn reconcile(
    queue: &mut MutationQueue,
    mirror: &mut MirrorStore,
    collection: &str,
    temp_id: &str,
    auth_id: &str,
) -> Result<RewriteSummary> {
    let records_rewritten = mirror.rewrite_references(collection, temp_id, auth_id)?;
    let ops_rewritten = queue.rewrite_references(temp_id, auth_id)?;
    debug!(
        collection,
        from = temp_id,
        to = auth_id,
        records = records_rewritten,
        ops = ops_rewritten,
        "reconciled temporary identifier"
    );
    Ok(RewriteSummary {
        records_rewritten,
        ops_rewritten,
    })
}

/// Replace every string equal to `from` with `to`, recursively through
/// objects and arrays. Returns the number of replacements.
pub fn rewrite_value(value: &mut Value, from: &str, to: &str) -> usize {
    match value {
        Value::String(s) if s == from => {
            *s = to.to_string();
            1
        }
        Value::Array(items) => items.iter_mut().map(|v| rewrite_value(v, from, to)).sum(),
        Value::Object(map) => map.values_mut().map(|v| rewrite_value(v, from, to)).sum(),
        _ => 0,
    }
}

/// Whether `value` contains a temporary identifier, ignoring `allowed`
/// (an operation's own id does not block its dispatch).
pub fn references_temporary(value: &Value, allowed: Option<&str>) -> bool {
    match value {
        Value::String(s) => is_temporary_id(s) && allowed != Some(s.as_str()),
        Value::Array(items) => items.iter().any(|v| references_temporary(v, allowed)),
        Value::Object(map) => map.values().any(|v| references_temporary(v, allowed)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::dedup::DedupFilter;
    use crate::mirror::MirrorRecord;
    use crate::operation::QueuedOperation;
    use crate::storage::MemoryStore;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn rewrite_walks_nested_shapes() {
        let mut value = json!({
            "order": "tmp_a",
            "items": ["tmp_a", "other", {"ref": "tmp_a"}],
            "count": 3
        });
        let replaced = rewrite_value(&mut value, "tmp_a", "r1");
        assert_eq!(replaced, 3);
        assert_eq!(
            value,
            json!({"order": "r1", "items": ["r1", "other", {"ref": "r1"}], "count": 3})
        );
    }

    #[test]
    fn rewrite_leaves_substrings_alone() {
        let mut value = json!({"note": "tmp_a is referenced elsewhere", "ref": "tmp_ab"});
        assert_eq!(rewrite_value(&mut value, "tmp_a", "r1"), 0);
    }

    #[test]
    fn temporary_detection_honors_allowance() {
        let value = json!({"id": "tmp_self", "parent": "tmp_other"});
        assert!(references_temporary(&value, None));
        assert!(references_temporary(&value, Some("tmp_self")));

        let own_only = json!({"id": "tmp_self", "parent": "r1"});
        assert!(!references_temporary(&own_only, Some("tmp_self")));
    }

    #[test]
    fn reconcile_covers_mirror_and_queue() {
        let storage = Arc::new(MemoryStore::new());
        let config = SyncConfig::default();
        let mut queue =
            MutationQueue::load(storage.clone(), DedupFilter::from_config(&config)).unwrap();
        let mut mirror = MirrorStore::load(storage).unwrap();

        mirror
            .upsert(
                "orders",
                MirrorRecord {
                    id: "tmp_o".into(),
                    fields: json!({"sku": "A"}),
                    pending: true,
                },
            )
            .unwrap();
        mirror
            .upsert(
                "shipments",
                MirrorRecord {
                    id: "tmp_s".into(),
                    fields: json!({"order": "tmp_o"}),
                    pending: true,
                },
            )
            .unwrap();
        queue
            .enqueue(QueuedOperation::update("orders", "tmp_o", json!({"qty": 2}), 1), 1)
            .unwrap();

        let summary = reconcile(&mut queue, &mut mirror, "orders", "tmp_o", "r1").unwrap();
        assert_eq!(summary.records_rewritten, 2);
        assert_eq!(summary.ops_rewritten, 1);

        assert!(mirror.get("orders", "tmp_o").is_none());
        assert!(mirror.get("orders", "r1").is_some());
        assert_eq!(
            mirror.get("shipments", "tmp_s").unwrap().fields,
            json!({"order": "r1"})
        );
        assert_eq!(queue.list_pending()[0].target_id.as_deref(), Some("r1"));
    }

    fn arb_fields() -> impl Strategy<Value = serde_json::Value> {
        let leaf = prop_oneof![
            Just(serde_json::Value::String("tmp_target".into())),
            "[a-z]{1,8}".prop_map(serde_json::Value::String),
            any::<i64>().prop_map(|n| serde_json::Value::Number(n.into())),
            any::<bool>().prop_map(serde_json::Value::Bool),
            Just(serde_json::Value::Null),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(serde_json::Value::Array),
                prop::collection::hash_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| serde_json::Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn no_temporary_reference_survives_rewrite(mut fields in arb_fields()) {
            rewrite_value(&mut fields, "tmp_target", "r1");
            prop_assert!(!references_temporary(&fields, None));
        }

        #[test]
        fn rewrite_count_matches_reference_count(fields in arb_fields()) {
            let mut rewritten = fields.clone();
            let count = rewrite_value(&mut rewritten, "tmp_target", "r1");
            if count == 0 {
                prop_assert_eq!(fields, rewritten);
            } else {
                prop_assert!(references_temporary(&fields, None));
            }
        }
    }
}
