//! Relay message routes — internal and external channels, status stream.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::state::AppState;
use connectrelay_browser::{MessageSender, ResponseEnvelope, TabId};
use connectrelay_core::Error;

type SseStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/relay/message", post(internal_message))
        .route("/relay/external", post(external_message))
        .route("/relay/status-events", get(status_events))
}

/// Sender tab, as reported by the extension shim.
const TAB_ID_HEADER: &str = "x-tab-id";
const TAB_URL_HEADER: &str = "x-tab-url";

fn sender_from_headers(headers: &HeaderMap) -> MessageSender {
    let tab_id = headers
        .get(TAB_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<TabId>().ok());
    match tab_id {
        Some(id) => MessageSender::Tab {
            id,
            url: headers
                .get(TAB_URL_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        },
        None => MessageSender::Popup,
    }
}

/// Unparseable bodies still get an envelope; they route nowhere.
fn parse_body(body: &Bytes) -> Value {
    serde_json::from_slice(body).unwrap_or(Value::Null)
}

fn origin_of(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::ORIGIN).map(|v| v.to_str().unwrap_or_default())
}

/// Internal channel. Callers without an `Origin` header are the native shim;
/// browser callers must be the extension itself.
async fn internal_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<ResponseEnvelope>) {
    if let Some(origin) = origin_of(&headers) {
        if !state.relay.settings().is_extension_origin(origin) {
            warn!("Internal message refused for origin {:?}", origin);
            let envelope = ResponseEnvelope::from_error(&Error::OriginNotAllowed(origin.to_string()));
            return (StatusCode::FORBIDDEN, Json(envelope));
        }
    }

    let sender = sender_from_headers(&headers);
    let envelope = state.relay.handle_internal(parse_body(&body), sender).await;
    (StatusCode::OK, Json(envelope))
}

async fn external_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<ResponseEnvelope>) {
    let origin = origin_of(&headers).unwrap_or_default();

    if !state.relay.is_origin_allowed(origin) {
        warn!("External message refused for origin {:?}", origin);
        let envelope = ResponseEnvelope::from_error(&Error::OriginNotAllowed(origin.to_string()));
        return (StatusCode::FORBIDDEN, Json(envelope));
    }

    let envelope = state.relay.handle_external(parse_body(&body), origin).await;
    (StatusCode::OK, Json(envelope))
}

async fn status_events(State(state): State<Arc<AppState>>) -> Sse<KeepAliveStream<SseStream>> {
    let mut rx = state.relay.subscribe_status();
    let stream: SseStream = Box::pin(async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => match Event::default().event(event.kind.name()).json_data(&event) {
                    Ok(sse) => yield Ok(sse),
                    Err(e) => warn!("Failed to encode status event: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Status stream lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
