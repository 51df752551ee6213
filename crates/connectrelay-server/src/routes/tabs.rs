//! Tab lifecycle routes — navigation events feeding the injection watcher.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::state::AppState;
use connectrelay_browser::{InjectionState, TabId, TabStatus};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tabs/updated", post(tab_updated))
        .route("/tabs/removed", post(tab_removed))
        .route("/tabs/{id}/injection", get(injection_state))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TabUpdated {
    tab_id: TabId,
    status: TabStatus,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TabRemoved {
    tab_id: TabId,
}

async fn tab_updated(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TabUpdated>,
) -> Json<Value> {
    let Some(watcher) = state.watcher() else {
        debug!("Tab {} update ignored, injection disabled", req.tab_id);
        return Json(json!({
            "tabId": req.tab_id,
            "injecting": false,
            "state": InjectionState::Idle,
        }));
    };

    // The injection runs in the background; callers poll the state route.
    let started = watcher
        .on_tab_updated(req.tab_id, req.status, req.url.as_deref())
        .is_some();

    Json(json!({
        "tabId": req.tab_id,
        "injecting": started,
        "state": watcher.state(req.tab_id),
    }))
}

async fn tab_removed(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TabRemoved>,
) -> Json<Value> {
    if let Some(watcher) = state.watcher() {
        watcher.on_tab_removed(req.tab_id);
    }
    Json(json!({ "tabId": req.tab_id, "removed": true }))
}

async fn injection_state(
    State(state): State<Arc<AppState>>,
    Path(tab_id): Path<TabId>,
) -> Json<Value> {
    let current = state
        .watcher()
        .map(|w| w.state(tab_id))
        .unwrap_or(InjectionState::Idle);
    Json(json!({ "tabId": tab_id, "state": current }))
}
