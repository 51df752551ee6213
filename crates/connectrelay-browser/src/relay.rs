//! Message relay — routes extension and web-app messages to their handlers.
//!
//! Two entry points share one handler table: [`Relay::handle_internal`] for
//! the extension's own pages and content scripts, and [`Relay::handle_external`]
//! for the allow-listed web app, which only reaches the auth handlers.
//! Every call returns exactly one [`ResponseEnvelope`].

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::RelaySettings;
use crate::envelope::ResponseEnvelope;
use crate::forwarder::{ApiForwarder, ApiTarget};
use crate::guard::run_guarded;
use crate::injector::TabWatcher;
use crate::message::{ContentScriptLoaded, ForwardedStatus, Message, ProfileSync, SendBatch, SendSingle};
use crate::types::{Channel, MessageSender, StatusEvent, StatusKind};
use connectrelay_core::{Error, Result};
use connectrelay_store::{PersistedState, SharedStore, StorageKey, TokenSource};

const STATUS_CHANNEL_CAPACITY: usize = 64;

pub struct Relay {
    settings: RelaySettings,
    store: SharedStore,
    forwarder: ApiForwarder,
    watcher: Option<Arc<TabWatcher>>,
    status_tx: broadcast::Sender<StatusEvent>,
}

impl Relay {
    pub fn new(settings: RelaySettings, store: SharedStore) -> Self {
        let forwarder = ApiForwarder::from_settings(&settings);
        let (status_tx, _rx) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            settings,
            store,
            forwarder,
            watcher: None,
            status_tx,
        }
    }

    /// Attach the tab watcher so self-announcing content scripts update it.
    pub fn with_watcher(mut self, watcher: Arc<TabWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn watcher(&self) -> Option<&Arc<TabWatcher>> {
        self.watcher.as_ref()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status_tx.subscribe()
    }

    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        self.settings.is_origin_allowed(origin)
    }

    /// Startup hook: seed the CRM endpoint if nothing is stored yet.
    pub async fn on_installed(&self) -> Result<()> {
        let state = self.store.get(&[StorageKey::ApiUrl]).await?;
        if state.api_url.is_none() {
            self.store
                .set(PersistedState {
                    api_url: Some(self.settings.default_api_url.clone()),
                    ..Default::default()
                })
                .await?;
            info!("Seeded apiUrl with {}", self.settings.default_api_url);
        }
        info!(
            "Relay ready: {} allowed origins",
            self.settings.allowed_origins.len()
        );
        Ok(())
    }

    // ---------------------------------------------------------------
    // Entry points
    // ---------------------------------------------------------------

    /// Same-extension senders: content scripts and the popup.
    pub async fn handle_internal(self: &Arc<Self>, raw: Value, sender: MessageSender) -> ResponseEnvelope {
        self.dispatch(raw, Channel::Internal, sender).await
    }

    /// Allow-listed web app. Anything but the auth handlers is refused.
    pub async fn handle_external(self: &Arc<Self>, raw: Value, origin: &str) -> ResponseEnvelope {
        if !self.is_origin_allowed(origin) {
            warn!("Rejected message from origin {}", origin);
            return ResponseEnvelope::from_error(&Error::OriginNotAllowed(origin.to_string()));
        }
        let sender = MessageSender::External {
            origin: origin.to_string(),
        };
        self.dispatch(raw, Channel::External, sender).await
    }

    async fn dispatch(self: &Arc<Self>, raw: Value, channel: Channel, sender: MessageSender) -> ResponseEnvelope {
        let label = discriminator_of(&raw);
        info!("Message {} from {}", label, sender);

        let message = match Message::parse(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("Unroutable message from {}: {}", sender, e);
                return ResponseEnvelope::from_error(&e);
            }
        };

        let kind = message.kind();
        if !kind.allowed_on(channel) {
            warn!("Refused {} on {:?} channel from {}", kind.name(), channel, sender);
            return ResponseEnvelope::from_error(&Error::unhandled());
        }

        let relay = self.clone();
        run_guarded(kind.name(), None, async move {
            match relay.handle(message, channel, sender).await {
                Ok(envelope) => envelope,
                Err(e) => ResponseEnvelope::from_error(&e),
            }
        })
        .await
    }

    async fn handle(&self, message: Message, channel: Channel, sender: MessageSender) -> Result<ResponseEnvelope> {
        match message {
            Message::Ping => Ok(ResponseEnvelope::with_message("pong")),
            Message::ContentScriptLoaded(loaded) => Ok(self.content_script_loaded(loaded, &sender)),
            Message::ProfileSync(sync) => self.profile_sync(sync, channel).await,
            Message::TokenStatusQuery => self.token_status().await,
            Message::TokenClear => self.token_clear().await,
            Message::SendSingle(send) => self.send_single(send).await,
            Message::SendBatch(batch) => self.send_batch(batch).await,
            Message::ForwardedStatus(status) => Ok(self.forward_status(status, &sender).await),
        }
    }

    // ---------------------------------------------------------------
    // Handlers
    // ---------------------------------------------------------------

    fn content_script_loaded(&self, loaded: ContentScriptLoaded, sender: &MessageSender) -> ResponseEnvelope {
        let url = loaded.url.as_deref().unwrap_or("?");
        let at = loaded.timestamp.unwrap_or(Value::Null);
        info!("Content script loaded in {} (url={}, at={})", sender, url, at);
        if let (Some(watcher), Some(tab_id)) = (&self.watcher, sender.tab_id()) {
            watcher.mark_ready(tab_id);
        }
        ResponseEnvelope::with_message("Content script registered")
    }

    async fn profile_sync(&self, sync: ProfileSync, channel: Channel) -> Result<ResponseEnvelope> {
        let token = sync
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Validation("No auth token provided".into()))?;

        let source = match channel {
            Channel::External => TokenSource::WebApp,
            Channel::Internal => TokenSource::Extension,
        };
        self.store
            .set(PersistedState {
                token: Some(token.clone()),
                auth_token: Some(token),
                user_info: sync.profile.clone(),
                user_profile: sync.profile,
                token_source: Some(source),
                last_auth_check: Some(Utc::now()),
                ..Default::default()
            })
            .await?;

        info!("Profile synced from {:?}", source);
        Ok(ResponseEnvelope::with_message("Profile data saved"))
    }

    async fn token_status(&self) -> Result<ResponseEnvelope> {
        let state = self.store.get(StorageKey::auth_keys()).await?;
        if state.effective_token().is_none() {
            return Ok(ResponseEnvelope::ok().has_token(false));
        }
        let details = json!({
            "tokenSource": state.token_source,
            "lastAuthCheck": state.last_auth_check,
            "userProfile": state.user_profile,
        });
        Ok(ResponseEnvelope::with_data(details).has_token(true))
    }

    async fn token_clear(&self) -> Result<ResponseEnvelope> {
        self.store.remove(StorageKey::auth_keys()).await?;
        info!("Auth token cleared");
        Ok(ResponseEnvelope::with_message("Token cleared"))
    }

    async fn send_single(&self, send: SendSingle) -> Result<ResponseEnvelope> {
        let target = self.resolve_target(send.jwt_token, send.api_url).await?;
        let forwarder = self.forwarder.clone();
        let store = self.store.clone();
        let record = send.connection_data;

        let envelope = run_guarded("sendToAPI", Some(forwarder.single_timeout()), async move {
            match forwarder.send_one(&target, &record).await {
                Ok(data) => {
                    stamp_last_sync(&store).await;
                    ResponseEnvelope::with_data(data)
                }
                Err(e) => {
                    warn!("Connection failed to save: {}", e);
                    ResponseEnvelope::from_error(&e)
                }
            }
        })
        .await;
        Ok(envelope)
    }

    async fn send_batch(&self, batch: SendBatch) -> Result<ResponseEnvelope> {
        let target = self.resolve_target(batch.jwt_token, batch.api_url).await?;
        let forwarder = self.forwarder.clone();
        let store = self.store.clone();
        let records = batch.connections_batch;

        let envelope = run_guarded("sendBatchToAPI", Some(forwarder.batch_timeout()), async move {
            let total = records.len();
            if let Err(e) = store
                .set(PersistedState {
                    pending_sync: Some(total as u64),
                    ..Default::default()
                })
                .await
            {
                warn!("Failed to record pending sync: {}", e);
            }

            let summary = forwarder.send_batch(&target, records).await;
            info!(
                "Batch settled: {}/{} saved",
                summary.successful, summary.total
            );

            if let Err(e) = store.remove(&[StorageKey::PendingSync]).await {
                warn!("Failed to clear pending sync: {}", e);
            }
            if summary.successful > 0 {
                stamp_last_sync(&store).await;
            }
            summary.into_envelope()
        })
        .await;
        Ok(envelope)
    }

    async fn forward_status(&self, status: ForwardedStatus, sender: &MessageSender) -> ResponseEnvelope {
        if status.kind == StatusKind::Complete {
            stamp_last_sync(&self.store).await;
        }
        let event = StatusEvent {
            kind: status.kind,
            tab_id: sender.tab_id(),
            payload: status.payload,
        };
        // No popup open is the common case.
        let _ = self.status_tx.send(event);
        ResponseEnvelope::ok()
    }

    /// Message fields win, then stored values, then the configured default URL.
    /// A stored token is only ever sent to the stored or default endpoint.
    async fn resolve_target(&self, jwt_token: Option<String>, api_url: Option<String>) -> Result<ApiTarget> {
        let jwt_token = jwt_token.filter(|t| !t.is_empty());
        let api_url = api_url.filter(|u| !u.is_empty());

        let stored = if jwt_token.is_some() && api_url.is_some() {
            PersistedState::default()
        } else {
            self.store
                .get(&[StorageKey::Token, StorageKey::AuthToken, StorageKey::ApiUrl])
                .await?
        };

        let token = match jwt_token {
            Some(token) => token,
            None => {
                let token = stored
                    .effective_token()
                    .map(str::to_string)
                    .ok_or_else(|| Error::Validation("No auth token available".into()))?;
                if let Some(requested) = api_url.as_deref() {
                    if !self.is_known_endpoint(requested, stored.api_url.as_deref()) {
                        warn!("Refusing to send the stored token to {}", requested);
                        return Err(Error::Validation(
                            "jwtToken is required for an unconfigured apiUrl".into(),
                        ));
                    }
                }
                token
            }
        };
        let url = api_url
            .or(stored.api_url)
            .unwrap_or_else(|| self.settings.default_api_url.clone());

        Ok(ApiTarget { url, token })
    }

    fn is_known_endpoint(&self, url: &str, stored: Option<&str>) -> bool {
        stored == Some(url) || url == self.settings.default_api_url
    }
}

async fn stamp_last_sync(store: &SharedStore) {
    let update = PersistedState {
        last_sync: Some(Utc::now()),
        ..Default::default()
    };
    if let Err(e) = store.set(update).await {
        warn!("Failed to record last sync: {}", e);
    }
}

/// Best-effort label for logging before validation.
fn discriminator_of(raw: &Value) -> String {
    raw.get("type")
        .or_else(|| raw.get("action"))
        .and_then(Value::as_str)
        .unwrap_or("<untyped>")
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use connectrelay_store::{KeyValueStore, MemoryStore, StorageChange};

    use super::*;
    use crate::injector::{InjectionState, ScriptInjector};
    use crate::types::TabId;

    const WEB_APP: &str = "http://localhost:3000";

    /// Local CRM double: 400 for `first_name == "Bad"`, 500 for "Broken",
    /// sleeps for "Slow", 201 otherwise. Counts every request.
    async fn spawn_crm() -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/api/connections/",
            post(move |Json(body): Json<Value>| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    match body["first_name"].as_str() {
                        Some("Bad") => (StatusCode::BAD_REQUEST, "missing url".to_string()),
                        Some("Broken") => (StatusCode::INTERNAL_SERVER_ERROR, "server error".to_string()),
                        Some("Slow") => {
                            tokio::time::sleep(Duration::from_millis(2500)).await;
                            (StatusCode::CREATED, json!({"id": 99}).to_string())
                        }
                        _ => (StatusCode::CREATED, json!({"id": 1}).to_string()),
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/api/connections/", addr), hits)
    }

    fn relay_with(settings: RelaySettings) -> (Arc<Relay>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let relay = Relay::new(settings, store.clone());
        (Arc::new(relay), store)
    }

    fn relay() -> (Arc<Relay>, Arc<MemoryStore>) {
        relay_with(RelaySettings::default())
    }

    fn tab(id: TabId) -> MessageSender {
        MessageSender::Tab { id, url: None }
    }

    fn person(first_name: &str) -> Value {
        json!({
            "first_name": first_name,
            "last_name": "Hopper",
            "url": format!("https://www.linkedin.com/in/{}", first_name.to_lowercase())
        })
    }

    #[tokio::test]
    async fn test_ping() {
        let (relay, _) = relay();
        let env = relay.handle_internal(json!({"type": "PING"}), MessageSender::Popup).await;
        assert!(env.success);
        assert_eq!(env.message.as_deref(), Some("pong"));
    }

    #[tokio::test]
    async fn test_unmatched_message_gets_fallback() {
        let (relay, _) = relay();
        let env = relay
            .handle_internal(json!({"type": "SOMETHING_ELSE"}), MessageSender::Popup)
            .await;
        assert_eq!(env, ResponseEnvelope::failure("Unhandled message type"));

        let env = relay.handle_internal(json!([1, 2, 3]), MessageSender::Popup).await;
        assert!(!env.success);
    }

    #[tokio::test]
    async fn test_token_status_follows_profile_sync() {
        let (relay, store) = relay();

        let env = relay
            .handle_external(json!({"type": "CHECK_TOKEN_STATUS"}), WEB_APP)
            .await;
        assert!(env.success);
        assert_eq!(env.has_token, Some(false));

        let env = relay
            .handle_external(
                json!({
                    "type": "SEND_PROFILE_DATA",
                    "profile": {"name": "Grace", "email": "grace@example.com"},
                    "token": "jwt-abc"
                }),
                WEB_APP,
            )
            .await;
        assert!(env.success, "{:?}", env);

        let env = relay
            .handle_internal(json!({"type": "CHECK_TOKEN_STATUS"}), MessageSender::Popup)
            .await;
        assert!(env.success);
        assert_eq!(env.has_token, Some(true));
        let data = env.data.unwrap();
        assert_eq!(data["tokenSource"], "web_app");
        assert_eq!(data["userProfile"]["name"], "Grace");

        let state = store.get(StorageKey::auth_keys()).await.unwrap();
        assert_eq!(state.token.as_deref(), Some("jwt-abc"));
        assert_eq!(state.auth_token.as_deref(), Some("jwt-abc"));
        assert!(state.last_auth_check.is_some());
    }

    #[tokio::test]
    async fn test_profile_sync_without_token_writes_nothing() {
        let (relay, store) = relay();
        let env = relay
            .handle_internal(
                json!({"type": "SEND_PROFILE_DATA", "profile": {"name": "Grace"}, "token": ""}),
                MessageSender::Popup,
            )
            .await;
        assert!(!env.success);
        assert_eq!(env.message.as_deref(), Some("No auth token provided"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_token_clear_drops_auth_keys_only() {
        let (relay, store) = relay();
        store
            .set(PersistedState {
                token: Some("jwt".into()),
                user_profile: Some(json!({"name": "Grace"})),
                api_url: Some("https://crm.test".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let env = relay.handle_external(json!({"type": "CLEAR_TOKEN"}), WEB_APP).await;
        assert_eq!(env.message.as_deref(), Some("Token cleared"));

        let state = store.get(StorageKey::all()).await.unwrap();
        assert!(state.token.is_none());
        assert!(state.user_profile.is_none());
        assert_eq!(state.api_url.as_deref(), Some("https://crm.test"));
    }

    #[tokio::test]
    async fn test_external_send_is_refused_without_http() {
        let (url, hits) = spawn_crm().await;
        let (relay, _) = relay();

        let env = relay
            .handle_external(
                json!({
                    "action": "sendToAPI",
                    "connectionData": person("Ada"),
                    "jwtToken": "jwt",
                    "apiUrl": url
                }),
                WEB_APP,
            )
            .await;
        assert!(!env.success);
        assert_eq!(env.error.as_deref(), Some("Unhandled message type"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unlisted_origin_is_rejected() {
        let (relay, store) = relay();
        let env = relay
            .handle_external(
                json!({"type": "SEND_PROFILE_DATA", "profile": {}, "token": "jwt"}),
                "https://evil.example",
            )
            .await;
        assert!(!env.success);
        assert!(env.error.unwrap().contains("Origin not allowed"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_single_send_success_stamps_last_sync() {
        let (url, hits) = spawn_crm().await;
        let (relay, store) = relay();

        let env = relay
            .handle_internal(
                json!({
                    "action": "sendToAPI",
                    "connectionData": person("Ada"),
                    "jwtToken": "jwt",
                    "apiUrl": url
                }),
                tab(1),
            )
            .await;
        assert!(env.success, "{:?}", env);
        assert_eq!(env.data.unwrap(), json!({"id": 1}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let state = store.get(&[StorageKey::LastSync]).await.unwrap();
        assert!(state.last_sync.is_some());
    }

    #[tokio::test]
    async fn test_single_send_server_error() {
        let (url, _) = spawn_crm().await;
        let (relay, store) = relay();

        let env = relay
            .handle_internal(
                json!({
                    "action": "sendToAPI",
                    "connectionData": person("Broken"),
                    "jwtToken": "jwt",
                    "apiUrl": url
                }),
                tab(1),
            )
            .await;
        assert!(!env.success);
        let error = env.error.unwrap();
        assert!(error.contains("500"));
        assert!(error.contains("server error"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_single_send_uses_stored_token_and_url() {
        let (url, hits) = spawn_crm().await;
        let (relay, store) = relay();
        store
            .set(PersistedState {
                auth_token: Some("stored-jwt".into()),
                api_url: Some(url),
                ..Default::default()
            })
            .await
            .unwrap();

        let env = relay
            .handle_internal(
                json!({"action": "sendToAPI", "connectionData": person("Ada")}),
                tab(1),
            )
            .await;
        assert!(env.success, "{:?}", env);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_send_without_any_token() {
        let (relay, _) = relay();
        let env = relay
            .handle_internal(
                json!({"action": "sendToAPI", "connectionData": person("Ada")}),
                tab(1),
            )
            .await;
        assert!(!env.success);
        assert_eq!(env.message.as_deref(), Some("No auth token available"));
    }

    #[tokio::test]
    async fn test_stored_token_never_goes_to_message_url() {
        let (url, hits) = spawn_crm().await;
        let (relay, store) = relay();
        store
            .set(PersistedState {
                token: Some("secret-jwt".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        for action in ["sendToAPI", "sendBatchToAPI"] {
            let env = relay
                .handle_internal(
                    json!({
                        "action": action,
                        "connectionData": person("Ada"),
                        "connectionsBatch": [person("Ada")],
                        "apiUrl": url
                    }),
                    tab(1),
                )
                .await;
            assert!(!env.success, "{}: {:?}", action, env);
            assert_eq!(
                env.message.as_deref(),
                Some("jwtToken is required for an unconfigured apiUrl")
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        // Naming the stored endpoint explicitly is fine.
        store
            .set(PersistedState {
                api_url: Some(url.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        let env = relay
            .handle_internal(
                json!({"action": "sendToAPI", "connectionData": person("Ada"), "apiUrl": url}),
                tab(1),
            )
            .await;
        assert!(env.success, "{:?}", env);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_send_timeout_discards_late_result() {
        let (url, hits) = spawn_crm().await;
        let (relay, store) = relay_with(RelaySettings {
            single_timeout_secs: 1,
            ..Default::default()
        });

        let env = relay
            .handle_internal(
                json!({
                    "action": "sendToAPI",
                    "connectionData": person("Slow"),
                    "jwtToken": "jwt",
                    "apiUrl": url
                }),
                tab(1),
            )
            .await;
        assert!(!env.success);
        assert_eq!(env.error.as_deref(), Some("Request timed out after 1 seconds"));

        // The request itself keeps going and its bookkeeping still lands.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let state = store.get(&[StorageKey::LastSync]).await.unwrap();
        assert!(state.last_sync.is_some());
    }

    #[tokio::test]
    async fn test_batch_partial_failure_reports_success_with_warning() {
        let (url, hits) = spawn_crm().await;
        let (relay, store) = relay();
        let mut changes = store.subscribe();

        let env = relay
            .handle_internal(
                json!({
                    "action": "sendBatchToAPI",
                    "connectionsBatch": [person("Ada"), person("Bad"), person("Grace")],
                    "jwtToken": "jwt",
                    "apiUrl": url
                }),
                tab(1),
            )
            .await;

        assert!(env.success);
        assert_eq!(env.data.unwrap(), json!({"total": 3, "successful": 2, "failed": 1}));
        assert_eq!(env.warning.as_deref(), Some("1 connections failed to save"));
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        let state = store
            .get(&[StorageKey::PendingSync, StorageKey::LastSync])
            .await
            .unwrap();
        assert!(state.pending_sync.is_none());
        assert!(state.last_sync.is_some());

        let first = changes.recv().await.unwrap();
        assert_eq!(
            first,
            StorageChange {
                key: StorageKey::PendingSync,
                had_old: false,
                has_new: true
            }
        );
    }

    #[tokio::test]
    async fn test_batch_records_are_sent_concurrently() {
        let (url, hits) = spawn_crm().await;
        // Three slow records back to back would take well over the guard.
        let (relay, _) = relay_with(RelaySettings {
            batch_timeout_secs: 4,
            ..Default::default()
        });

        let env = relay
            .handle_internal(
                json!({
                    "action": "sendBatchToAPI",
                    "connectionsBatch": [person("Slow"), person("Slow"), person("Slow")],
                    "jwtToken": "jwt",
                    "apiUrl": url
                }),
                tab(1),
            )
            .await;
        assert!(env.success, "{:?}", env);
        assert_eq!(env.data.unwrap(), json!({"total": 3, "successful": 3, "failed": 0}));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_batch_timeout_discards_late_summary() {
        let (url, hits) = spawn_crm().await;
        let (relay, store) = relay_with(RelaySettings {
            batch_timeout_secs: 1,
            ..Default::default()
        });

        let env = relay
            .handle_internal(
                json!({
                    "action": "sendBatchToAPI",
                    "connectionsBatch": [person("Ada"), person("Slow")],
                    "jwtToken": "jwt",
                    "apiUrl": url
                }),
                tab(1),
            )
            .await;
        assert!(!env.success);
        assert_eq!(env.error.as_deref(), Some("Request timed out after 1 seconds"));
        assert!(env.data.is_none());

        let state = store.get(&[StorageKey::PendingSync]).await.unwrap();
        assert_eq!(state.pending_sync, Some(2));

        // The batch settles in the background and clears its bookkeeping.
        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        let state = store
            .get(&[StorageKey::PendingSync, StorageKey::LastSync])
            .await
            .unwrap();
        assert!(state.pending_sync.is_none());
        assert!(state.last_sync.is_some());
    }

    #[tokio::test]
    async fn test_batch_all_succeed_has_no_warning() {
        let (url, _) = spawn_crm().await;
        let (relay, _) = relay();

        let env = relay
            .handle_internal(
                json!({
                    "action": "sendBatchToAPI",
                    "connectionsBatch": [person("Ada"), person("Grace")],
                    "jwtToken": "jwt",
                    "apiUrl": url
                }),
                tab(1),
            )
            .await;
        assert!(env.success);
        assert_eq!(env.data.unwrap()["failed"], 0);
        assert!(env.warning.is_none());
    }

    #[tokio::test]
    async fn test_batch_all_fail_still_succeeds() {
        let (url, _) = spawn_crm().await;
        let (relay, store) = relay();

        let env = relay
            .handle_internal(
                json!({
                    "action": "sendBatchToAPI",
                    "connectionsBatch": [person("Bad"), person("Broken")],
                    "jwtToken": "jwt",
                    "apiUrl": url
                }),
                tab(1),
            )
            .await;
        assert!(env.success);
        assert_eq!(env.data.unwrap(), json!({"total": 2, "successful": 0, "failed": 2}));
        assert_eq!(env.warning.as_deref(), Some("2 connections failed to save"));

        let state = store.get(&[StorageKey::LastSync]).await.unwrap();
        assert!(state.last_sync.is_none());
    }

    #[tokio::test]
    async fn test_malformed_batch_is_unroutable() {
        let (url, hits) = spawn_crm().await;
        let (relay, _) = relay();

        let env = relay
            .handle_internal(
                json!({"action": "sendBatchToAPI", "connectionsBatch": 5, "jwtToken": "jwt", "apiUrl": url}),
                tab(1),
            )
            .await;
        assert!(!env.success);
        assert!(env.error.unwrap().starts_with("Unhandled message type"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_forwarded_status_reaches_observers() {
        let (relay, store) = relay();
        let mut events = relay.subscribe_status();

        let env = relay
            .handle_internal(json!({"action": "progress", "current": 4, "total": 9}), tab(8))
            .await;
        assert_eq!(env, ResponseEnvelope::ok());

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, StatusKind::Progress);
        assert_eq!(event.tab_id, Some(8));
        assert_eq!(event.payload.get("current"), Some(&json!(4)));
        assert!(store.is_empty());

        relay
            .handle_internal(json!({"action": "complete", "saved": 9}), tab(8))
            .await;
        let state = store.get(&[StorageKey::LastSync]).await.unwrap();
        assert!(state.last_sync.is_some());
    }

    #[tokio::test]
    async fn test_on_installed_seeds_api_url_once() {
        let (relay, store) = relay();
        relay.on_installed().await.unwrap();
        let state = store.get(&[StorageKey::ApiUrl]).await.unwrap();
        assert_eq!(state.api_url, Some(RelaySettings::default().default_api_url));

        store
            .set(PersistedState {
                api_url: Some("https://crm.test".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        relay.on_installed().await.unwrap();
        let state = store.get(&[StorageKey::ApiUrl]).await.unwrap();
        assert_eq!(state.api_url.as_deref(), Some("https://crm.test"));
    }

    struct NeverInjector;

    #[async_trait]
    impl ScriptInjector for NeverInjector {
        async fn inject(&self, _tab_id: TabId, _file: &str) -> Result<()> {
            Err(Error::Internal("no frame".into()))
        }
    }

    #[tokio::test]
    async fn test_content_script_announcement_marks_tab() {
        let settings = RelaySettings::default();
        let watcher = Arc::new(TabWatcher::new(Arc::new(NeverInjector), &settings).unwrap());
        let store = Arc::new(MemoryStore::new());
        let relay = Arc::new(Relay::new(settings, store).with_watcher(watcher.clone()));

        let env = relay
            .handle_internal(
                json!({
                    "type": "CONTENT_SCRIPT_LOADED",
                    "url": "https://www.linkedin.com/mynetwork/invite-connect/connections/",
                    "timestamp": 1700000000000u64
                }),
                tab(12),
            )
            .await;
        assert!(env.success);
        assert_eq!(watcher.state(12), InjectionState::Injected);
    }

    /// Store whose reads blow up, to exercise the panic path.
    struct PanickingStore;

    #[async_trait]
    impl KeyValueStore for PanickingStore {
        async fn get(&self, _keys: &[StorageKey]) -> Result<PersistedState> {
            panic!("disk on fire");
        }
        async fn set(&self, _state: PersistedState) -> Result<()> {
            Ok(())
        }
        async fn remove(&self, _keys: &[StorageKey]) -> Result<()> {
            Ok(())
        }
        fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
            broadcast::channel(1).1
        }
    }

    #[tokio::test]
    async fn test_handler_panic_still_answers_once() {
        let relay = Arc::new(Relay::new(RelaySettings::default(), Arc::new(PanickingStore)));
        let env = relay
            .handle_internal(json!({"type": "CHECK_TOKEN_STATUS"}), MessageSender::Popup)
            .await;
        assert!(!env.success);
        assert!(env.error.unwrap().starts_with("Handler failed"));
    }

    #[tokio::test]
    async fn test_store_errors_become_envelopes() {
        struct FailingStore;

        #[async_trait]
        impl KeyValueStore for FailingStore {
            async fn get(&self, _keys: &[StorageKey]) -> Result<PersistedState> {
                Err(Error::Storage("quota exceeded".into()))
            }
            async fn set(&self, _state: PersistedState) -> Result<()> {
                Err(Error::Storage("quota exceeded".into()))
            }
            async fn remove(&self, _keys: &[StorageKey]) -> Result<()> {
                Err(Error::Storage("quota exceeded".into()))
            }
            fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
                broadcast::channel(1).1
            }
        }

        let relay = Arc::new(Relay::new(RelaySettings::default(), Arc::new(FailingStore)));
        let env = relay.handle_external(json!({"type": "CLEAR_TOKEN"}), WEB_APP).await;
        assert!(!env.success);
        assert_eq!(env.error.as_deref(), Some("Storage error: quota exceeded"));
    }
}
