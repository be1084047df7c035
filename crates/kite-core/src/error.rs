//! Error types for Kite.
//!
//! Every error knows the HTTP status it maps to and which party is at fault,
//! so the procedure server, the relay and clients can all report the same
//! attribution.

use crate::protocol::{ChannelError, Fault, Params};
use thiserror::Error;

/// Main error type for Kite.
#[derive(Debug, Error)]
pub enum KiteError {
    // Lookup errors
    #[error("Procedure not found: {name}")]
    ProcedureNotFound { name: String },

    #[error("Channel not found: {name}")]
    ChannelNotFound { name: String },

    // Validation errors
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Invalid output: {message}")]
    InvalidOutput { message: String },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("Invalid connection context: {message}")]
    InvalidContext { message: String },

    #[error("Malformed request: {message}")]
    MalformedRequest { message: String },

    // Handler-raised errors
    #[error("{message}")]
    Failed { message: String, code: u16 },

    #[error("{message}")]
    Rejected { message: String, fault: Fault },

    #[error("Internal error: {message}")]
    Internal { message: String },

    // Relay errors
    #[error("Sidekick error: {message}")]
    Relay {
        message: String,
        status_code: Option<u16>,
    },

    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for Kite operations.
pub type Result<T> = std::result::Result<T, KiteError>;

impl From<serde_json::Error> for KiteError {
    fn from(err: serde_json::Error) -> Self {
        KiteError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for KiteError {
    fn from(err: reqwest::Error) -> Self {
        KiteError::Network {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl KiteError {
    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            KiteError::ProcedureNotFound { .. } | KiteError::ChannelNotFound { .. } => 404,

            KiteError::InvalidInput { .. }
            | KiteError::InvalidParams { .. }
            | KiteError::MalformedRequest { .. } => 400,

            KiteError::Unauthorized { .. } => 401,

            KiteError::Failed { code, .. } if (400..=599).contains(code) => *code,

            KiteError::Rejected { fault, .. } => fault.status_code(),

            KiteError::Relay { .. } | KiteError::Network { .. } => 502,

            KiteError::InvalidOutput { .. }
            | KiteError::InvalidContext { .. }
            | KiteError::Internal { .. }
            | KiteError::Failed { .. }
            | KiteError::Json { .. }
            | KiteError::Config { .. } => 500,
        }
    }

    /// Which party is responsible for this error.
    pub fn fault(&self) -> Fault {
        match self {
            KiteError::Rejected { fault, .. } => *fault,
            KiteError::Relay { .. } | KiteError::Network { .. } => Fault::Sidekick,
            other if (400..500).contains(&other.status_code()) => Fault::Client,
            _ => Fault::Server,
        }
    }

    /// Whether the message may contain internals that should not reach clients.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            KiteError::Internal { .. } | KiteError::Json { .. } | KiteError::InvalidOutput { .. }
        )
    }

    /// Attach channel coordinates, producing the client-facing error shape.
    pub fn into_channel_error(self, channel: &str, params: &Params) -> ChannelError {
        ChannelError::new(channel, params.clone(), self.fault(), self.to_string())
    }
}
