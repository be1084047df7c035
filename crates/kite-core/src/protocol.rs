//! Wire shapes exchanged between the procedure server, the sidekick relay and
//! clients.
//!
//! Every message is JSON. Tagged enums use the field names clients expect:
//! procedure responses are tagged by `status`, connect results and relay
//! messages by `type`.

use crate::config::ProtocolConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Concrete channel parameter values, keyed by parameter name.
///
/// A `BTreeMap` so the topic key derived from it is independent of insertion
/// order.
pub type Params = BTreeMap<String, String>;

// ============================================================================
// Faults
// ============================================================================

/// Who is responsible for an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fault {
    Client,
    Server,
    Sidekick,
}

impl Fault {
    pub fn as_str(&self) -> &'static str {
        match self {
            Fault::Client => "client",
            Fault::Server => "server",
            Fault::Sidekick => "sidekick",
        }
    }

    /// HTTP status used when a fault crosses an HTTP hop.
    pub fn status_code(&self) -> u16 {
        match self {
            Fault::Client => 400,
            Fault::Server => 500,
            Fault::Sidekick => 502,
        }
    }

    /// Inverse of [`Fault::status_code`], used when reading an error response.
    pub fn from_status(status: u16) -> Self {
        match status {
            400..=499 => Fault::Client,
            502 => Fault::Sidekick,
            _ => Fault::Server,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error surfaced to clients for anything channel related.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelError {
    pub channel: String,
    #[serde(default)]
    pub params: Params,
    pub fault: Fault,
    pub message: String,
}

impl ChannelError {
    pub fn new(
        channel: impl Into<String>,
        params: Params,
        fault: Fault,
        message: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            params,
            fault,
            message: message.into(),
        }
    }

    /// Error not tied to a known channel, e.g. a malformed relay frame.
    pub fn detached(fault: Fault, message: impl Into<String>) -> Self {
        Self::new("", Params::new(), fault, message)
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.channel.is_empty() {
            write!(f, "{} fault: {}", self.fault, self.message)
        } else {
            write!(
                f,
                "{} fault on channel {}: {}",
                self.fault, self.channel, self.message
            )
        }
    }
}

impl std::error::Error for ChannelError {}

// ============================================================================
// Procedure calls
// ============================================================================

/// Procedure call envelope: `{procedure, inputs}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureRequest {
    pub procedure: String,
    #[serde(default)]
    pub inputs: Value,
}

impl ProcedureRequest {
    pub fn new(procedure: impl Into<String>, inputs: Value) -> Self {
        Self {
            procedure: procedure.into(),
            inputs,
        }
    }
}

/// Error body of a failed procedure call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallError {
    pub message: String,
    pub code: u16,
}

/// Procedure call response: data and resources, or an error. Never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum ProcedureResponse {
    #[serde(rename = "OK")]
    Ok { data: Value, resources: Vec<String> },
    #[serde(rename = "ERR")]
    Err { error: CallError },
}

impl ProcedureResponse {
    pub fn success(data: Value, resources: Vec<String>) -> Self {
        ProcedureResponse::Ok { data, resources }
    }

    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ProcedureResponse::Err {
            error: CallError {
                message: message.into(),
                code,
            },
        }
    }

    /// HTTP status matching the response; error codes outside 400..=599 map to 500.
    pub fn status_code(&self) -> u16 {
        match self {
            ProcedureResponse::Ok { .. } => 200,
            ProcedureResponse::Err { error } if (400..=599).contains(&error.code) => error.code,
            ProcedureResponse::Err { .. } => 500,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ProcedureResponse::Ok { .. })
    }
}

// ============================================================================
// Channel connection (HTTP half)
// ============================================================================

/// Channel connect request: `{channel, params, data}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub channel: String,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConnectResult {
    #[serde(rename = "OK")]
    Ok { token: String },
    #[serde(rename = "ERROR")]
    Error { error: ChannelError },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub channel: String,
    pub params: Params,
    pub result: ConnectResult,
}

impl ConnectResponse {
    pub fn accepted(channel: impl Into<String>, params: Params, token: String) -> Self {
        Self {
            channel: channel.into(),
            params,
            result: ConnectResult::Ok { token },
        }
    }

    pub fn rejected(error: ChannelError) -> Self {
        Self {
            channel: error.channel.clone(),
            params: error.params.clone(),
            result: ConnectResult::Error { error },
        }
    }

    pub fn status_code(&self) -> u16 {
        match &self.result {
            ConnectResult::Ok { .. } => 200,
            ConnectResult::Error { error } => error.fault.status_code(),
        }
    }
}

// ============================================================================
// Sidekick control plane (server → relay) and forwarding (relay → server)
// ============================================================================

/// Accepted connection waiting for its token to be redeemed at the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionPayload {
    pub token: String,
    pub channel: String,
    pub params: Params,
    pub context: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceBatch {
    pub resources: Vec<String>,
}

/// Server broadcast to every subscriber of `(channel, params)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelBroadcast {
    pub channel: String,
    pub params: Params,
    pub data: Value,
}

/// Client message forwarded by the relay, with the connection context attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelForward {
    pub channel: String,
    pub params: Params,
    pub data: Value,
    pub context: Value,
}

// ============================================================================
// Sidekick client plane (persistent connection)
// ============================================================================

/// Frames a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayInbound {
    Listen {
        resources: Vec<String>,
    },
    Unlisten {
        resources: Vec<String>,
    },
    Subscribe {
        token: String,
    },
    Unsubscribe {
        token: String,
    },
    Send {
        token: String,
        channel: String,
        #[serde(default)]
        params: Params,
        #[serde(default)]
        data: Value,
    },
}

/// Frames the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayOutbound {
    Listening { resources: Vec<String> },
    Unlistening { resources: Vec<String> },
    Subscribed { channel: String, params: Params },
    Unsubscribed { channel: String, params: Params },
    Updated { resource: String },
    Message { channel: String, params: Params, data: Value },
    Error { error: ChannelError },
}

// ============================================================================
// Topics
// ============================================================================

/// Pub/sub address inside the relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Resource(String),
    Channel { name: String, params: Params },
}

impl Topic {
    pub fn resource(tag: impl Into<String>) -> Self {
        Topic::Resource(tag.into())
    }

    pub fn channel(name: impl Into<String>, params: &Params) -> Self {
        Topic::Channel {
            name: name.into(),
            params: params.clone(),
        }
    }

    /// String key: `resource:<tag>` or `channel:<name>:<k=v&...>`.
    ///
    /// Parameter names and values are percent-encoded, so two different
    /// parameter maps never produce the same key.
    pub fn key(&self) -> String {
        match self {
            Topic::Resource(tag) => format!("{}{}", ProtocolConfig::RESOURCE_TOPIC_PREFIX, tag),
            Topic::Channel { name, params } => {
                let encoded: Vec<String> = params
                    .iter()
                    .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
                    .collect();
                format!(
                    "{}{}:{}",
                    ProtocolConfig::CHANNEL_TOPIC_PREFIX,
                    urlencoding::encode(name),
                    encoded.join("&")
                )
            }
        }
    }

    /// Resource tag carried by a resource topic key, if it is one.
    pub fn resource_tag(key: &str) -> Option<&str> {
        key.strip_prefix(ProtocolConfig::RESOURCE_TOPIC_PREFIX)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}
