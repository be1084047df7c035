//! Error types for the Kite client.

use kite_core::{ChannelError, Fault};
use thiserror::Error;

/// Client-side error. Failed calls come back as values of this type; the
/// client never panics on a bad response.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server answered with an error response.
    #[error("{message}")]
    Call { message: String, code: u16 },

    /// The response data did not match the requested output type.
    #[error("Invalid output: {message}")]
    InvalidOutput { message: String },

    /// A channel connection was rejected, or the relay reported an error.
    #[error("{0}")]
    Channel(ChannelError),

    #[error("No sidekick relay configured")]
    NoRelay,

    #[error("Relay error: {message}")]
    Relay { message: String },

    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

pub type Result<T> = std::result::Result<T, ClientError>;

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Network {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl ClientError {
    /// Status code carried by a call error.
    pub fn code(&self) -> Option<u16> {
        match self {
            ClientError::Call { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Which party is responsible.
    pub fn fault(&self) -> Fault {
        match self {
            ClientError::Call { code, .. } => Fault::from_status(*code),
            ClientError::Channel(error) => error.fault,
            ClientError::InvalidOutput { .. } | ClientError::Json { .. } => Fault::Server,
            ClientError::NoRelay | ClientError::Relay { .. } => Fault::Sidekick,
            ClientError::Network { .. } => Fault::Server,
        }
    }
}
