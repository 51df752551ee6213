//! Key-value store trait and change notification plumbing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::types::{PersistedState, StorageChange, StorageKey};
use connectrelay_core::Result;

/// Capacity of the change channel; slow observers see `Lagged` and resync.
const CHANGE_CHANNEL_CAPACITY: usize = 128;

/// Async key-value store backing the relay's persisted state.
///
/// Writes are per-key: two concurrent `set` calls on disjoint keys both land.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the requested keys. Absent keys stay `None`.
    async fn get(&self, keys: &[StorageKey]) -> Result<PersistedState>;

    /// Write every `Some` field of `state`, replacing each key's value.
    async fn set(&self, state: PersistedState) -> Result<()>;

    /// Delete the given keys.
    async fn remove(&self, keys: &[StorageKey]) -> Result<()>;

    /// Subscribe to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

pub type SharedStore = Arc<dyn KeyValueStore>;

/// Broadcast fan-out for [`StorageChange`] events.
pub struct ChangeNotifier {
    tx: broadcast::Sender<StorageChange>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.tx.subscribe()
    }

    /// Publish changes; having no observers is not an error.
    pub fn publish(&self, changes: impl IntoIterator<Item = StorageChange>) {
        for change in changes {
            let _ = self.tx.send(change);
        }
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}
