//! Inbound message model and validation at the dispatcher boundary.
//!
//! Messages arrive as loose JSON discriminated by a `type` or an `action`
//! string. [`Message::parse`] picks the first matching route, then decodes
//! that variant's fields; anything that fails either step is unroutable.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::types::{Channel, ConnectionRecord, StatusKind};
use connectrelay_core::{Error, Result};

/// Discriminated message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    ContentScriptLoaded,
    Ping,
    ProfileSync,
    TokenStatusQuery,
    TokenClear,
    SendSingle,
    SendBatch,
    ForwardedStatus(StatusKind),
}

#[derive(Debug, Clone, Copy)]
enum Field {
    Type,
    Action,
}

impl Field {
    fn key(self) -> &'static str {
        match self {
            Self::Type => "type",
            Self::Action => "action",
        }
    }
}

/// Ordered route table; the first entry whose field carries the value wins.
const ROUTES: &[(Field, &str, MessageKind)] = &[
    (Field::Type, "CONTENT_SCRIPT_LOADED", MessageKind::ContentScriptLoaded),
    (Field::Type, "PING", MessageKind::Ping),
    (Field::Type, "SEND_PROFILE_DATA", MessageKind::ProfileSync),
    (Field::Type, "CHECK_TOKEN_STATUS", MessageKind::TokenStatusQuery),
    (Field::Type, "CLEAR_TOKEN", MessageKind::TokenClear),
    (Field::Action, "sendToAPI", MessageKind::SendSingle),
    (Field::Action, "sendBatchToAPI", MessageKind::SendBatch),
    (Field::Action, "status", MessageKind::ForwardedStatus(StatusKind::Status)),
    (Field::Action, "progress", MessageKind::ForwardedStatus(StatusKind::Progress)),
    (Field::Action, "complete", MessageKind::ForwardedStatus(StatusKind::Complete)),
    (Field::Action, "error", MessageKind::ForwardedStatus(StatusKind::Error)),
];

impl MessageKind {
    /// Wire discriminator value.
    pub fn name(&self) -> &'static str {
        ROUTES
            .iter()
            .find(|(_, _, kind)| kind == self)
            .map(|(_, name, _)| *name)
            .unwrap_or("unknown")
    }

    /// Find the route for a raw message object.
    pub fn route(obj: &Map<String, Value>) -> Option<Self> {
        ROUTES.iter().find_map(|(field, value, kind)| {
            (obj.get(field.key()).and_then(Value::as_str) == Some(*value)).then_some(*kind)
        })
    }

    /// The external channel only reaches the auth handlers; everything else,
    /// API forwarding in particular, stays internal.
    pub fn allowed_on(&self, channel: Channel) -> bool {
        match channel {
            Channel::Internal => true,
            Channel::External => matches!(
                self,
                Self::ProfileSync | Self::TokenStatusQuery | Self::TokenClear
            ),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentScriptLoaded {
    #[serde(default)]
    pub url: Option<String>,
    /// Sent as epoch millis or an ISO string depending on the page.
    #[serde(default)]
    pub timestamp: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileSync {
    #[serde(default)]
    pub profile: Option<Value>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendSingle {
    pub connection_data: ConnectionRecord,
    #[serde(default)]
    pub jwt_token: Option<String>,
    #[serde(default)]
    pub api_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendBatch {
    pub connections_batch: Vec<ConnectionRecord>,
    #[serde(default)]
    pub jwt_token: Option<String>,
    #[serde(default)]
    pub api_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ForwardedStatus {
    pub kind: StatusKind,
    /// Every field except the discriminators.
    pub payload: Map<String, Value>,
}

/// A validated inbound message. Exactly one variant per message.
#[derive(Debug, Clone)]
pub enum Message {
    ContentScriptLoaded(ContentScriptLoaded),
    Ping,
    ProfileSync(ProfileSync),
    TokenStatusQuery,
    TokenClear,
    SendSingle(SendSingle),
    SendBatch(SendBatch),
    ForwardedStatus(ForwardedStatus),
}

impl Message {
    /// Route and decode a raw message.
    pub fn parse(raw: Value) -> Result<Self> {
        let obj = match raw {
            Value::Object(obj) => obj,
            _ => return Err(Error::unhandled()),
        };
        let kind = MessageKind::route(&obj).ok_or_else(Error::unhandled)?;

        let message = match kind {
            MessageKind::ContentScriptLoaded => {
                Self::ContentScriptLoaded(decode(kind, obj)?)
            }
            MessageKind::Ping => Self::Ping,
            MessageKind::ProfileSync => Self::ProfileSync(decode(kind, obj)?),
            MessageKind::TokenStatusQuery => Self::TokenStatusQuery,
            MessageKind::TokenClear => Self::TokenClear,
            MessageKind::SendSingle => Self::SendSingle(decode(kind, obj)?),
            MessageKind::SendBatch => Self::SendBatch(decode(kind, obj)?),
            MessageKind::ForwardedStatus(status) => {
                let mut payload = obj;
                payload.remove("type");
                payload.remove("action");
                Self::ForwardedStatus(ForwardedStatus {
                    kind: status,
                    payload,
                })
            }
        };
        Ok(message)
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::ContentScriptLoaded(_) => MessageKind::ContentScriptLoaded,
            Self::Ping => MessageKind::Ping,
            Self::ProfileSync(_) => MessageKind::ProfileSync,
            Self::TokenStatusQuery => MessageKind::TokenStatusQuery,
            Self::TokenClear => MessageKind::TokenClear,
            Self::SendSingle(_) => MessageKind::SendSingle,
            Self::SendBatch(_) => MessageKind::SendBatch,
            Self::ForwardedStatus(status) => MessageKind::ForwardedStatus(status.kind),
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(kind: MessageKind, obj: Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(obj))
        .map_err(|e| Error::Unroutable(format!("malformed {} payload ({})", kind.name(), e)))
}
