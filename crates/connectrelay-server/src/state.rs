//! Shared application state.

use std::sync::Arc;

use connectrelay_browser::{HttpInjector, Relay, RelaySettings, TabWatcher};
use connectrelay_core::{RelayConfig, Result};
use connectrelay_store::SharedStore;
use tracing::info;

/// Shared application state accessible from all route handlers.
pub struct AppState {
    pub config: RelayConfig,
    pub store: SharedStore,
    pub relay: Arc<Relay>,
}

impl AppState {
    pub fn new(config: RelayConfig, settings: RelaySettings, store: SharedStore) -> Result<Self> {
        let watcher = match settings.injector_endpoint.as_deref() {
            Some(endpoint) => {
                info!("Tab injection via {}", endpoint);
                let injector = Arc::new(HttpInjector::new(endpoint));
                Some(Arc::new(TabWatcher::new(injector, &settings)?))
            }
            None => {
                info!("Tab injection disabled (no injectorEndpoint)");
                None
            }
        };

        let mut relay = Relay::new(settings, store.clone());
        if let Some(watcher) = watcher {
            relay = relay.with_watcher(watcher);
        }

        Ok(Self {
            config,
            store,
            relay: Arc::new(relay),
        })
    }

    pub fn watcher(&self) -> Option<&Arc<TabWatcher>> {
        self.relay.watcher()
    }
}
