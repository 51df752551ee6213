//! Extension relay — message dispatch, CRM API forwarding, tab script injection.
//!
//! Receives typed messages from the companion Chrome extension and the
//! allow-listed web app, persists auth state, and forwards scraped
//! connection records to the CRM API.

pub mod config;
pub mod envelope;
pub mod forwarder;
pub mod guard;
pub mod injector;
pub mod message;
pub mod relay;
pub mod types;

pub use config::RelaySettings;
pub use envelope::ResponseEnvelope;
pub use forwarder::{ApiForwarder, ApiTarget};
pub use injector::{HttpInjector, InjectionState, ScriptInjector, TabWatcher};
pub use message::{Message, MessageKind};
pub use relay::Relay;
pub use types::*;
