//! Durable key-value persistence boundary.
//!
//! The engine never touches the filesystem directly. Hosts inject a
//! [`DurableKeyValueStore`] backed by whatever the platform offers
//! (SQLite, browser storage, a flat file). Writes must be durable before
//! the call returns: queued operations and mirror records are load-bearing.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Failure of the durable storage backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("storage backend failure: {0}")]
pub struct StorageError(pub String);

/// Synchronous durable key-value persistence.
///
/// Reads are infallible (a missing key is `None`); writes report failure,
/// which the engine surfaces to the calling mutation.
pub trait DurableKeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// In-memory store for tests and embedders without platform persistence.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableKeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_remove() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k"), None);

        store.set("k", "v").unwrap();
        assert_eq!(store.get("k"), Some("v".to_string()));

        store.set("k", "v2").unwrap();
        assert_eq!(store.get("k"), Some("v2".to_string()));

        store.remove("k").unwrap();
        assert_eq!(store.get("k"), None);
    }

    #[test]
    fn remove_missing_is_ok() {
        let store = MemoryStore::new();
        assert!(store.remove("absent").is_ok());
    }
}
