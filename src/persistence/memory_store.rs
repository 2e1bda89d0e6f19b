use std::collections::HashMap;
use std::sync::Mutex;

use super::KeyValueStore;
use crate::error::{BridgeError, Result};

/// Volatile store, for tests and hosts that persist elsewhere
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn with_entries(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            entries: Mutex::new(entries.into_iter().collect()),
        }
    }
}

impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| BridgeError::Persistence(format!("Store lock poisoned: {e}")))?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| BridgeError::Persistence(format!("Store lock poisoned: {e}")))?;
        entries.insert(key.to_string(), value);
        Ok(())
    }
}
