//! Relay settings persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use connectrelay_core::{Error, Result};

/// Persisted relay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelaySettings {
    /// Origins allowed on the external message channel.
    #[serde(default = "default_origins")]
    pub allowed_origins: Vec<String>,
    /// Browser origins of the extension itself (`chrome-extension://<id>`).
    /// Internal-channel requests carrying any other `Origin` are refused;
    /// requests without one come from the native shim.
    #[serde(default)]
    pub extension_origins: Vec<String>,
    /// CRM endpoint used when neither the message nor the store names one.
    #[serde(default = "default_api_url")]
    pub default_api_url: String,
    #[serde(default = "default_single_timeout")]
    pub single_timeout_secs: u64,
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout_secs: u64,
    #[serde(default = "default_retry_delay")]
    pub injection_retry_delay_ms: u64,
    /// Tabs whose URL matches this pattern get the content script.
    #[serde(default = "default_url_pattern")]
    pub injection_url_pattern: String,
    #[serde(default = "default_content_script")]
    pub content_script: String,
    /// Extension-side endpoint that performs script injection. Injection is
    /// disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub injector_endpoint: Option<String>,
    /// Path to settings file (not serialized).
    #[serde(skip)]
    pub settings_path: PathBuf,
}

fn default_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".into(),
        "http://localhost:5173".into(),
    ]
}
fn default_api_url() -> String {
    "http://localhost:8000/api/connections/".into()
}
fn default_single_timeout() -> u64 {
    30
}
fn default_batch_timeout() -> u64 {
    60
}
fn default_retry_delay() -> u64 {
    1000
}
fn default_url_pattern() -> String {
    r"^https://(www\.)?linkedin\.com/mynetwork/invite-connect/connections".into()
}
fn default_content_script() -> String {
    "content.js".into()
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            allowed_origins: default_origins(),
            extension_origins: Vec::new(),
            default_api_url: default_api_url(),
            single_timeout_secs: default_single_timeout(),
            batch_timeout_secs: default_batch_timeout(),
            injection_retry_delay_ms: default_retry_delay(),
            injection_url_pattern: default_url_pattern(),
            content_script: default_content_script(),
            injector_endpoint: None,
            settings_path: PathBuf::new(),
        }
    }
}

impl RelaySettings {
    /// Load settings from a JSON file, or return defaults.
    pub fn load(settings_path: &Path) -> Self {
        let mut settings: RelaySettings = std::fs::read_to_string(settings_path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        settings.settings_path = settings_path.to_path_buf();
        settings
    }

    /// Save settings to disk.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn single_timeout(&self) -> Duration {
        Duration::from_secs(self.single_timeout_secs)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }

    pub fn injection_retry_delay(&self) -> Duration {
        Duration::from_millis(self.injection_retry_delay_ms)
    }

    /// Exact origin match; a trailing slash on either side is ignored.
    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        origin_listed(&self.allowed_origins, origin)
    }

    /// Whether a browser request with this `Origin` may use the internal channel.
    pub fn is_extension_origin(&self, origin: &str) -> bool {
        origin_listed(&self.extension_origins, origin)
    }

    pub fn url_pattern(&self) -> Result<Regex> {
        Regex::new(&self.injection_url_pattern).map_err(|e| {
            Error::Config(format!(
                "invalid injection URL pattern {:?}: {}",
                self.injection_url_pattern, e
            ))
        })
    }
}

fn origin_listed(list: &[String], origin: &str) -> bool {
    let origin = origin.trim_end_matches('/');
    list.iter().any(|allowed| allowed.trim_end_matches('/') == origin)
}
