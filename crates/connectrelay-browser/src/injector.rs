//! Tab injection watcher — best-effort content script delivery.
//!
//! Per tab: `Idle -> Injecting -> {Injected | RetryPending} -> {Injected | GaveUp}`.
//! A failed injection is retried exactly once after a fixed delay. The content
//! script also announces itself, so a missed injection is not fatal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use regex::Regex;
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RelaySettings;
use crate::types::{TabId, TabStatus};
use connectrelay_core::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionState {
    Idle,
    Injecting,
    RetryPending,
    Injected,
    GaveUp,
}

impl InjectionState {
    fn in_flight(&self) -> bool {
        matches!(self, Self::Injecting | Self::RetryPending)
    }
}

/// Something that can place a script into a tab's active frame.
#[async_trait]
pub trait ScriptInjector: Send + Sync {
    async fn inject(&self, tab_id: TabId, file: &str) -> Result<()>;
}

/// Asks the extension shim to run the injection.
pub struct HttpInjector {
    client: Client,
    endpoint: String,
}

impl HttpInjector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ScriptInjector for HttpInjector {
    async fn inject(&self, tab_id: TabId, file: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "tabId": tab_id, "files": [file] }))
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(Error::Http {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            body: response.text().await.unwrap_or_default(),
        })
    }
}

/// Tracked state of one tab. `attempt` identifies the injection task that
/// owns the entry; a task only moves the state while it still owns it.
#[derive(Debug, Clone, Copy)]
struct TabEntry {
    state: InjectionState,
    attempt: u64,
}

pub struct TabWatcher {
    injector: Arc<dyn ScriptInjector>,
    pattern: Regex,
    script: String,
    retry_delay: Duration,
    tabs: DashMap<TabId, TabEntry>,
    attempts: AtomicU64,
}

impl TabWatcher {
    pub fn new(injector: Arc<dyn ScriptInjector>, settings: &RelaySettings) -> Result<Self> {
        Ok(Self {
            injector,
            pattern: settings.url_pattern()?,
            script: settings.content_script.clone(),
            retry_delay: settings.injection_retry_delay(),
            tabs: DashMap::new(),
            attempts: AtomicU64::new(0),
        })
    }

    pub fn matches(&self, url: &str) -> bool {
        self.pattern.is_match(url)
    }

    pub fn state(&self, tab_id: TabId) -> InjectionState {
        self.tabs
            .get(&tab_id)
            .map(|entry| entry.state)
            .unwrap_or(InjectionState::Idle)
    }

    /// Navigation event. Starts an injection when the load completed on a
    /// matching URL and no injection is already running for the tab.
    pub fn on_tab_updated(
        self: &Arc<Self>,
        tab_id: TabId,
        status: TabStatus,
        url: Option<&str>,
    ) -> Option<JoinHandle<InjectionState>> {
        if status != TabStatus::Complete {
            return None;
        }
        let url = url?;
        if !self.matches(url) {
            return None;
        }

        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let fresh = TabEntry {
            state: InjectionState::Injecting,
            attempt,
        };
        match self.tabs.entry(tab_id) {
            Entry::Occupied(mut entry) => {
                if entry.get().state.in_flight() {
                    debug!("Tab {}: injection already in progress", tab_id);
                    return None;
                }
                entry.insert(fresh);
            }
            Entry::Vacant(entry) => {
                entry.insert(fresh);
            }
        }

        info!("Tab {}: injecting {} into {}", tab_id, self.script, url);
        let watcher = self.clone();
        Some(tokio::spawn(async move { watcher.run_injection(tab_id, attempt).await }))
    }

    /// Tab closed: forget everything about it.
    pub fn on_tab_removed(&self, tab_id: TabId) {
        if self.tabs.remove(&tab_id).is_some() {
            debug!("Tab {}: state dropped", tab_id);
        }
    }

    /// The content script announced itself; it is running regardless of how
    /// the injection went. Any in-flight attempt loses ownership of the tab.
    pub fn mark_ready(&self, tab_id: TabId) {
        self.tabs.insert(
            tab_id,
            TabEntry {
                state: InjectionState::Injected,
                attempt: 0,
            },
        );
    }

    async fn run_injection(&self, tab_id: TabId, attempt: u64) -> InjectionState {
        let first = match self.injector.inject(tab_id, &self.script).await {
            Ok(()) => {
                self.transition(tab_id, attempt, InjectionState::Injecting, InjectionState::Injected);
                return self.state(tab_id);
            }
            Err(e) => e,
        };
        if !self.transition(tab_id, attempt, InjectionState::Injecting, InjectionState::RetryPending) {
            debug!("Tab {}: first attempt failed after losing the tab ({})", tab_id, first);
            return self.state(tab_id);
        }
        warn!(
            "Tab {}: injection failed ({}), retrying in {:?}",
            tab_id, first, self.retry_delay
        );

        tokio::time::sleep(self.retry_delay).await;

        // Closed, renavigated or self-announced while we waited.
        if !self.owns(tab_id, attempt, InjectionState::RetryPending) {
            return self.state(tab_id);
        }

        match self.injector.inject(tab_id, &self.script).await {
            Ok(()) => {
                self.transition(tab_id, attempt, InjectionState::RetryPending, InjectionState::Injected);
            }
            Err(e) => {
                if self.transition(tab_id, attempt, InjectionState::RetryPending, InjectionState::GaveUp) {
                    warn!("Tab {}: injection retry failed ({}), giving up", tab_id, e);
                }
            }
        }
        self.state(tab_id)
    }

    fn owns(&self, tab_id: TabId, attempt: u64, expected: InjectionState) -> bool {
        self.tabs
            .get(&tab_id)
            .is_some_and(|entry| entry.attempt == attempt && entry.state == expected)
    }

    /// Compare-and-set: move `from -> to` only if `attempt` still owns the tab
    /// and it is in `from`. Closed tabs stay untracked.
    fn transition(&self, tab_id: TabId, attempt: u64, from: InjectionState, to: InjectionState) -> bool {
        match self.tabs.get_mut(&tab_id) {
            Some(mut entry) if entry.attempt == attempt && entry.state == from => {
                entry.state = to;
                true
            }
            _ => false,
        }
    }
}
