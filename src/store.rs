//! Persisted key-value storage for session options and per-collection
//! local caches.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{Result, SyncError};

/// A named-slot store. Implementations are expected to be cheap enough
/// to call on every sync round.
pub trait LocalStore: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<String>>;
    fn set(&self, name: &str, value: &str) -> Result<()>;
    fn delete(&self, name: &str) -> Result<()>;
}

/// Serializes `value` as JSON into the named slot.
pub fn set_json<T: Serialize>(store: &dyn LocalStore, name: &str, value: &T) -> Result<()> {
    let text = serde_json::to_string(value).map_err(|e| SyncError::Store(e.to_string()))?;
    store.set(name, &text)
}

/// Reads and parses the named slot, `None` if absent.
pub fn get_json<T: DeserializeOwned>(store: &dyn LocalStore, name: &str) -> Result<Option<T>> {
    match store.get(name)? {
        Some(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| SyncError::Store(e.to_string())),
        None => Ok(None),
    }
}

/// In-memory store, used by tests and short-lived sessions.
#[derive(Default)]
pub struct MemoryStore {
    slots: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, name: &str) -> Result<Option<String>> {
        let slots = self
            .slots
            .lock()
            .map_err(|_| SyncError::Store("store lock poisoned".into()))?;
        Ok(slots.get(name).cloned())
    }

    fn set(&self, name: &str, value: &str) -> Result<()> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| SyncError::Store("store lock poisoned".into()))?;
        slots.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| SyncError::Store("store lock poisoned".into()))?;
        slots.remove(name);
        Ok(())
    }
}
