//! HTTP route handlers — the surface the extension shim and web app post to.

pub mod relay;
pub mod storage;
pub mod tabs;

use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::state::AppState;

/// Build the main Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let settings = state.relay.settings();
    let origins: Vec<&str> = settings
        .allowed_origins
        .iter()
        .chain(&settings.extension_origins)
        .map(String::as_str)
        .collect();
    let cors = cors_layer(&origins);
    Router::new()
        .nest("/api", api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .merge(relay::routes())
        .merge(tabs::routes())
        .merge(storage::routes())
}

/// Browsers only get CORS access from the web app and the extension; the
/// store holds the auth token.
fn cors_layer(origins: &[&str]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring unusable origin {:?}: {}", origin, e);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
