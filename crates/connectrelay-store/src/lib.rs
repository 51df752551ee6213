//! ConnectRelay Store — durable key-value state shared by the relay and its UI.
//!
//! The relay is the sole writer. Every write is a per-key upsert and emits a
//! [`StorageChange`] so observers can follow auth-state transitions without polling.

pub mod kv;
pub mod memory;
pub mod schema;
pub mod sqlite;
pub mod types;

pub use kv::{ChangeNotifier, KeyValueStore, SharedStore};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::*;
