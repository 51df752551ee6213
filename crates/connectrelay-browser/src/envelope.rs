//! Uniform response envelope returned to every message sender.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use connectrelay_core::Error;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_token: Option<bool>,
}

impl ResponseEnvelope {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn with_data(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Validation failures go out as `message`, everything else as `error`.
    pub fn from_error(err: &Error) -> Self {
        if err.is_validation() {
            Self {
                success: false,
                message: Some(err.to_string()),
                ..Default::default()
            }
        } else {
            Self::failure(err.to_string())
        }
    }

    pub fn warning(mut self, warning: impl Into<String>) -> Self {
        self.warning = Some(warning.into());
        self
    }

    pub fn has_token(mut self, has_token: bool) -> Self {
        self.has_token = Some(has_token);
        self
    }
}
