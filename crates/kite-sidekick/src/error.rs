//! Error types for the sidekick relay.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use kite_core::{ChannelError, Fault, Params};
use serde_json::json;
use thiserror::Error;

use crate::broker::ConnectionId;

#[derive(Debug, Error)]
pub enum SidekickError {
    /// Unknown, expired, consumed, or owned by another connection. The
    /// message is the same in every case.
    #[error("Invalid or already-used token")]
    InvalidToken,

    #[error("Token was issued for {expected}, not {requested}")]
    TokenMismatch { expected: String, requested: String },

    #[error("Already subscribed to {topic}")]
    AlreadySubscribed { topic: String },

    #[error("Not subscribed to {topic}")]
    NotSubscribed { topic: String },

    #[error("Token already registered")]
    DuplicateToken,

    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("Malformed frame: {message}")]
    MalformedFrame { message: String },

    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

pub type Result<T> = std::result::Result<T, SidekickError>;

impl SidekickError {
    /// HTTP status for control-plane responses.
    pub fn status_code(&self) -> StatusCode {
        match self {
            SidekickError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            SidekickError::DuplicateToken => StatusCode::CONFLICT,
            SidekickError::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Relay errors reaching a client are always attributed to the relay.
    pub fn fault(&self) -> Fault {
        Fault::Sidekick
    }

    pub fn into_channel_error(self, channel: &str, params: &Params) -> ChannelError {
        ChannelError::new(channel, params.clone(), self.fault(), self.to_string())
    }
}

impl IntoResponse for SidekickError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}
