//! Relay types shared by the dispatcher, forwarder and tab watcher.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Browser tab identifier.
pub type TabId = i64;

/// One external contact. Required keys (`first_name`, `last_name`, `url`)
/// are enforced by the CRM API, not here.
pub type ConnectionRecord = Map<String, Value>;

/// Who sent an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageSender {
    /// Content script running in a tab.
    Tab { id: TabId, url: Option<String> },
    /// Extension popup or other extension page without a tab.
    Popup,
    /// Allow-listed web application.
    External { origin: String },
}

impl MessageSender {
    pub fn tab_id(&self) -> Option<TabId> {
        match self {
            Self::Tab { id, .. } => Some(*id),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tab { id, .. } => write!(f, "tab {}", id),
            Self::Popup => write!(f, "popup"),
            Self::External { origin } => write!(f, "origin {}", origin),
        }
    }
}

/// Which entry point a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Internal,
    External,
}

/// Navigation status reported for a tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabStatus {
    Loading,
    Complete,
}

/// Progress messages the content script forwards to the popup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Status,
    Progress,
    Complete,
    Error,
}

impl StatusKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Progress => "progress",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

/// A forwarded status message as published to observers.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub kind: StatusKind,
    #[serde(skip_serializing_if = "Option::is_none", rename = "tabId")]
    pub tab_id: Option<TabId>,
    pub payload: Map<String, Value>,
}

/// Aggregate outcome of a batch send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}
