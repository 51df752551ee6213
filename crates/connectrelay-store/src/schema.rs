//! Database schema SQL for the durable key-value store.

/// One row per persisted key; values are stored as JSON text.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS kv_entries (
    key TEXT PRIMARY KEY,
    value_json TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;
