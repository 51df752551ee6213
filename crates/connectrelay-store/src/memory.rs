//! In-memory store, used by tests and as a scratch store when no data dir is set.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::kv::{ChangeNotifier, KeyValueStore};
use crate::types::{PersistedState, StorageChange, StorageKey};
use connectrelay_core::Result;

pub struct MemoryStore {
    entries: Mutex<HashMap<StorageKey, Value>>,
    notifier: ChangeNotifier,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            notifier: ChangeNotifier::new(),
        }
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, keys: &[StorageKey]) -> Result<PersistedState> {
        let found: Vec<(StorageKey, Value)> = {
            let entries = self.entries.lock();
            keys.iter()
                .filter_map(|k| entries.get(k).map(|v| (*k, v.clone())))
                .collect()
        };
        PersistedState::from_entries(found)
    }

    async fn set(&self, state: PersistedState) -> Result<()> {
        let updates = state.to_entries()?;
        let changes: Vec<StorageChange> = {
            let mut entries = self.entries.lock();
            updates
                .into_iter()
                .map(|(key, value)| StorageChange {
                    key,
                    had_old: entries.insert(key, value).is_some(),
                    has_new: true,
                })
                .collect()
        };
        self.notifier.publish(changes);
        Ok(())
    }

    async fn remove(&self, keys: &[StorageKey]) -> Result<()> {
        let changes: Vec<StorageChange> = {
            let mut entries = self.entries.lock();
            keys.iter()
                .map(|key| StorageChange {
                    key: *key,
                    had_old: entries.remove(key).is_some(),
                    has_new: false,
                })
                .collect()
        };
        self.notifier.publish(changes);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.notifier.subscribe()
    }
}
