//! Persisted state routes for the companion UI.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use axum::routing::get;
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::state::AppState;
use connectrelay_store::StorageKey;

type SseStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/storage", get(read_storage))
        .route("/storage/changes", get(storage_changes))
}

#[derive(Debug, Deserialize)]
struct StorageQuery {
    /// Comma-separated key names; all keys when absent.
    keys: Option<String>,
}

fn parse_keys(raw: Option<&str>) -> Result<Vec<StorageKey>, String> {
    let Some(raw) = raw else {
        return Ok(StorageKey::all().to_vec());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| StorageKey::from_name(name).ok_or_else(|| format!("Unknown storage key: {}", name)))
        .collect()
}

async fn read_storage(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StorageQuery>,
) -> (StatusCode, Json<Value>) {
    let keys = match parse_keys(query.keys.as_deref()) {
        Ok(keys) => keys,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": e }))),
    };

    match state.store.get(&keys).await {
        Ok(persisted) => match serde_json::to_value(&persisted) {
            Ok(value) => (StatusCode::OK, Json(value)),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            ),
        },
        Err(e) => {
            warn!("Storage read failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

async fn storage_changes(State(state): State<Arc<AppState>>) -> Sse<KeepAliveStream<SseStream>> {
    let mut rx = state.store.subscribe();
    let stream: SseStream = Box::pin(async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(change) => match Event::default().event("change").json_data(&change) {
                    Ok(sse) => yield Ok(sse),
                    Err(e) => warn!("Failed to encode storage change: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Storage change stream lagged, {} changes skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
