//! Persisted state types — key names match what the extension UI reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use connectrelay_core::{Error, Result};

/// Keys of the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StorageKey {
    Token,
    AuthToken,
    UserInfo,
    UserProfile,
    TokenSource,
    LastAuthCheck,
    LastSync,
    ApiUrl,
    PendingSync,
}

impl StorageKey {
    pub fn all() -> &'static [StorageKey] {
        &[
            Self::Token,
            Self::AuthToken,
            Self::UserInfo,
            Self::UserProfile,
            Self::TokenSource,
            Self::LastAuthCheck,
            Self::LastSync,
            Self::ApiUrl,
            Self::PendingSync,
        ]
    }

    /// Keys written by a profile sync and dropped by a token clear.
    pub fn auth_keys() -> &'static [StorageKey] {
        &[
            Self::Token,
            Self::AuthToken,
            Self::UserInfo,
            Self::UserProfile,
            Self::TokenSource,
            Self::LastAuthCheck,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::AuthToken => "authToken",
            Self::UserInfo => "userInfo",
            Self::UserProfile => "userProfile",
            Self::TokenSource => "tokenSource",
            Self::LastAuthCheck => "lastAuthCheck",
            Self::LastSync => "lastSync",
            Self::ApiUrl => "apiUrl",
            Self::PendingSync => "pendingSync",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|k| k.name() == name)
    }
}

impl std::fmt::Display for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Which surface supplied the current auth token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenSource {
    WebApp,
    Extension,
}

/// Partial view of the durable store. `None` means "absent" on reads and
/// "leave untouched" on writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_profile: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_source: Option<TokenSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_auth_check: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    /// Number of records in flight for the current batch send.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_sync: Option<u64>,
}

impl PersistedState {
    /// Split into per-key JSON values, skipping absent fields.
    pub fn to_entries(&self) -> Result<Vec<(StorageKey, Value)>> {
        let map = match serde_json::to_value(self)? {
            Value::Object(map) => map,
            other => {
                return Err(Error::Storage(format!(
                    "persisted state serialized to non-object: {}",
                    other
                )))
            }
        };
        map.into_iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(name, value)| {
                StorageKey::from_name(&name)
                    .map(|key| (key, value))
                    .ok_or_else(|| Error::Storage(format!("unknown storage key: {}", name)))
            })
            .collect()
    }

    /// Rebuild a partial state from per-key JSON values.
    pub fn from_entries(entries: impl IntoIterator<Item = (StorageKey, Value)>) -> Result<Self> {
        let map: Map<String, Value> = entries
            .into_iter()
            .map(|(key, value)| (key.name().to_string(), value))
            .collect();
        Ok(serde_json::from_value(Value::Object(map))?)
    }

    /// The stored auth token, whichever of the two token keys carries it.
    pub fn effective_token(&self) -> Option<&str> {
        self.token
            .as_deref()
            .filter(|t| !t.is_empty())
            .or_else(|| self.auth_token.as_deref().filter(|t| !t.is_empty()))
    }
}

/// Change notification emitted for every key a write touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageChange {
    pub key: StorageKey,
    pub had_old: bool,
    pub has_new: bool,
}
