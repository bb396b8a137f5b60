//! Local mirror of remote collections.
//!
//! Mutations land here optimistically before synchronization. Reads are
//! served from memory; every write is persisted through the durable
//! store before the call returns.

use crate::error::Result;
use crate::reconcile::rewrite_value;
use crate::storage::DurableKeyValueStore;
use crate::{CollectionName, Error, RecordId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Prefix marking an identifier as locally generated.
pub const TEMP_ID_PREFIX: &str = "tmp_";

const COLLECTIONS_KEY: &str = "tether::collections";

fn collection_key(name: &str) -> String {
    format!("tether::mirror::{name}")
}

/// Whether an identifier is temporary (not yet assigned by the remote
/// store).
pub fn is_temporary_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Generate a fresh temporary record identifier.
pub fn temp_record_id() -> RecordId {
    format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4().simple())
}

/// One locally cached record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorRecord {
    /// Temporary or authoritative identifier
    pub id: RecordId,
    /// Document body, without the identifier
    pub fields: Value,
    /// True while an unsynced queued operation references this record
    pub pending: bool,
}

/// Per-collection optimistic cache, persisted one collection per key.
pub struct MirrorStore {
    storage: Arc<dyn DurableKeyValueStore>,
    collections: HashMap<CollectionName, HashMap<RecordId, MirrorRecord>>,
}

impl MirrorStore {
    /// Load the mirror from durable storage, or start empty.
    pub fn load(storage: Arc<dyn DurableKeyValueStore>) -> Result<Self> {
        let names: Vec<CollectionName> = match storage.get(COLLECTIONS_KEY) {
            Some(json) => serde_json::from_str(&json)?,
            None => Vec::new(),
        };

        let mut collections = HashMap::new();
        for name in names {
            let records: Vec<MirrorRecord> = match storage.get(&collection_key(&name)) {
                Some(json) => serde_json::from_str(&json)?,
                None => Vec::new(),
            };
            collections.insert(
                name,
                records.into_iter().map(|r| (r.id.clone(), r)).collect(),
            );
        }

        Ok(Self {
            storage,
            collections,
        })
    }

    /// Insert or replace a record.
    pub fn upsert(&mut self, collection: &str, record: MirrorRecord) -> Result<()> {
        let is_new_collection = !self.collections.contains_key(collection);
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(record.id.clone(), record);
        if is_new_collection {
            self.persist_index()?;
        }
        self.persist_collection(collection)
    }

    /// Shallow-merge a patch into a record's fields and mark it pending.
    pub fn apply_patch(&mut self, collection: &str, id: &str, patch: &Value) -> Result<()> {
        let record = self
            .collections
            .get_mut(collection)
            .and_then(|c| c.get_mut(id))
            .ok_or_else(|| Error::RecordNotFound(id.to_string()))?;

        if let (Some(base), Some(delta)) = (record.fields.as_object_mut(), patch.as_object()) {
            for (key, value) in delta {
                base.insert(key.clone(), value.clone());
            }
        }
        record.pending = true;
        self.persist_collection(collection)
    }

    /// Remove a record.
    pub fn remove(&mut self, collection: &str, id: &str) -> Result<()> {
        let removed = self
            .collections
            .get_mut(collection)
            .and_then(|c| c.remove(id));
        if removed.is_none() {
            return Err(Error::RecordNotFound(id.to_string()));
        }
        self.persist_collection(collection)
    }

    /// Get a record by id.
    pub fn get(&self, collection: &str, id: &str) -> Option<&MirrorRecord> {
        self.collections.get(collection).and_then(|c| c.get(id))
    }

    /// All records of a collection matching a predicate over their
    /// fields.
    pub fn query<F>(&self, collection: &str, predicate: F) -> Vec<&MirrorRecord>
    where
        F: Fn(&Value) -> bool,
    {
        self.collections
            .get(collection)
            .map(|c| c.values().filter(|r| predicate(&r.fields)).collect())
            .unwrap_or_default()
    }

    /// Flip a record's pending flag. A missing record is a no-op: it may
    /// have been deleted locally while its operation was in flight.
    pub fn set_pending(&mut self, collection: &str, id: &str, pending: bool) -> Result<()> {
        match self
            .collections
            .get_mut(collection)
            .and_then(|c| c.get_mut(id))
        {
            Some(record) => {
                record.pending = pending;
                self.persist_collection(collection)
            }
            None => Ok(()),
        }
    }

    /// Re-key the record owning `temp_id` to `auth_id` and rewrite every
    /// reference to `temp_id` in all collections. Returns the number of
    /// records touched.
    pub fn rewrite_references(
        &mut self,
        collection: &str,
        temp_id: &str,
        auth_id: &str,
    ) -> Result<usize> {
        let mut touched: Vec<CollectionName> = Vec::new();
        let mut records_changed = 0;

        if let Some(records) = self.collections.get_mut(collection) {
            if let Some(mut record) = records.remove(temp_id) {
                record.id = auth_id.to_string();
                records.insert(auth_id.to_string(), record);
                records_changed += 1;
                touched.push(collection.to_string());
            }
        }

        for (name, records) in self.collections.iter_mut() {
            for record in records.values_mut() {
                if rewrite_value(&mut record.fields, temp_id, auth_id) > 0 {
                    records_changed += 1;
                    touched.push(name.clone());
                }
            }
        }

        touched.sort();
        touched.dedup();
        for name in &touched {
            self.persist_collection(name)?;
        }
        if records_changed > 0 {
            debug!(
                collection,
                from = temp_id,
                to = auth_id,
                records = records_changed,
                "rewrote mirror references"
            );
        }
        Ok(records_changed)
    }

    fn persist_index(&self) -> Result<()> {
        let mut names: Vec<&CollectionName> = self.collections.keys().collect();
        names.sort();
        let json = serde_json::to_string(&names)?;
        self.storage
            .set(COLLECTIONS_KEY, &json)
            .map_err(Error::from)
    }

    fn persist_collection(&self, name: &str) -> Result<()> {
        let records: Vec<&MirrorRecord> = self
            .collections
            .get(name)
            .map(|c| c.values().collect())
            .unwrap_or_default();
        let json = serde_json::to_string(&records)?;
        self.storage
            .set(&collection_key(name), &json)
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn mirror() -> (MirrorStore, Arc<MemoryStore>) {
        let storage = Arc::new(MemoryStore::new());
        let mirror = MirrorStore::load(storage.clone()).unwrap();
        (mirror, storage)
    }

    fn record(id: &str, fields: Value) -> MirrorRecord {
        MirrorRecord {
            id: id.to_string(),
            fields,
            pending: true,
        }
    }

    #[test]
    fn temp_ids_are_distinguishable() {
        let id = temp_record_id();
        assert!(is_temporary_id(&id));
        assert!(!is_temporary_id("r42"));
    }

    #[test]
    fn upsert_and_get() {
        let (mut mirror, _) = mirror();
        mirror
            .upsert("orders", record("tmp_a", json!({"sku": "A"})))
            .unwrap();

        let found = mirror.get("orders", "tmp_a").unwrap();
        assert_eq!(found.fields, json!({"sku": "A"}));
        assert!(found.pending);
        assert!(mirror.get("orders", "missing").is_none());
    }

    #[test]
    fn apply_patch_merges_and_marks_pending() {
        let (mut mirror, _) = mirror();
        mirror
            .upsert(
                "orders",
                MirrorRecord {
                    id: "r1".into(),
                    fields: json!({"sku": "A", "qty": 1}),
                    pending: false,
                },
            )
            .unwrap();

        mirror
            .apply_patch("orders", "r1", &json!({"qty": 3}))
            .unwrap();

        let found = mirror.get("orders", "r1").unwrap();
        assert_eq!(found.fields, json!({"sku": "A", "qty": 3}));
        assert!(found.pending);
    }

    #[test]
    fn patch_missing_record_errors() {
        let (mut mirror, _) = mirror();
        let result = mirror.apply_patch("orders", "ghost", &json!({"qty": 3}));
        assert!(matches!(result, Err(Error::RecordNotFound(_))));
    }

    #[test]
    fn remove_record() {
        let (mut mirror, _) = mirror();
        mirror
            .upsert("orders", record("tmp_a", json!({"sku": "A"})))
            .unwrap();
        mirror.remove("orders", "tmp_a").unwrap();
        assert!(mirror.get("orders", "tmp_a").is_none());

        let result = mirror.remove("orders", "tmp_a");
        assert!(matches!(result, Err(Error::RecordNotFound(_))));
    }

    #[test]
    fn query_filters_on_fields() {
        let (mut mirror, _) = mirror();
        mirror
            .upsert("orders", record("a", json!({"qty": 1})))
            .unwrap();
        mirror
            .upsert("orders", record("b", json!({"qty": 5})))
            .unwrap();

        let big = mirror.query("orders", |fields| {
            fields.get("qty").and_then(Value::as_i64).unwrap_or(0) > 2
        });
        assert_eq!(big.len(), 1);
        assert_eq!(big[0].id, "b");

        assert!(mirror.query("ghosts", |_| true).is_empty());
    }

    #[test]
    fn rewrite_rekeys_and_fixes_references() {
        let (mut mirror, _) = mirror();
        mirror
            .upsert("customers", record("tmp_c", json!({"name": "Ada"})))
            .unwrap();
        mirror
            .upsert("orders", record("tmp_o", json!({"customer": "tmp_c"})))
            .unwrap();

        let changed = mirror
            .rewrite_references("customers", "tmp_c", "r1")
            .unwrap();
        assert_eq!(changed, 2);

        assert!(mirror.get("customers", "tmp_c").is_none());
        assert_eq!(mirror.get("customers", "r1").unwrap().fields, json!({"name": "Ada"}));
        assert_eq!(
            mirror.get("orders", "tmp_o").unwrap().fields,
            json!({"customer": "r1"})
        );
    }

    #[test]
    fn persistence_round_trip() {
        let (mut mirror, storage) = mirror();
        mirror
            .upsert("orders", record("tmp_a", json!({"sku": "A"})))
            .unwrap();
        mirror
            .upsert("customers", record("tmp_c", json!({"name": "Ada"})))
            .unwrap();

        let reloaded = MirrorStore::load(storage).unwrap();
        assert_eq!(
            reloaded.get("orders", "tmp_a").unwrap().fields,
            json!({"sku": "A"})
        );
        assert_eq!(
            reloaded.get("customers", "tmp_c").unwrap().fields,
            json!({"name": "Ada"})
        );
    }
}
