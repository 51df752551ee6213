//! ConnectRelay Core — error taxonomy, data paths, configuration.

pub mod config;
pub mod error;

pub use config::{DataPaths, RelayConfig};
pub use error::{Error, Result};
