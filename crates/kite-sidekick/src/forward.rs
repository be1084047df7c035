//! Relay → procedure server forwarding of client channel messages.

use async_trait::async_trait;
use kite_core::{ChannelError, ChannelForward, Fault, ProtocolConfig};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Delivers a client message, with its connection context, to the handler
/// that owns the channel.
#[async_trait]
pub trait Forwarder: Send + Sync + 'static {
    async fn forward(&self, message: &ChannelForward) -> Result<(), ChannelError>;
}

/// Forwards to `POST {server_url}/channel/message`.
pub struct HttpForwarder {
    client: Client,
    url: String,
    secret: String,
}

impl HttpForwarder {
    pub fn new(server_url: &str, secret: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("{}/channel/message", server_url.trim_end_matches('/')),
            secret: secret.to_string(),
        })
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, message: &ChannelForward) -> Result<(), ChannelError> {
        let coordinates = |fault, text: String| {
            ChannelError::new(&message.channel, message.params.clone(), fault, text)
        };

        let response = self
            .client
            .post(&self.url)
            .header(ProtocolConfig::SECRET_HEADER, &self.secret)
            .json(message)
            .send()
            .await
            .map_err(|e| {
                coordinates(
                    Fault::Sidekick,
                    format!("Procedure server unreachable: {}", e),
                )
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        debug!("Forward to {} returned {}: {}", self.url, status, body);
        match serde_json::from_str::<ChannelError>(&body) {
            Ok(error) => Err(error),
            Err(_) => Err(coordinates(
                Fault::from_status(status.as_u16()),
                format!("Procedure server returned {}", status),
            )),
        }
    }
}

/// Used when the relay runs without a procedure server; every `send` fails.
pub struct NoForwarder;

#[async_trait]
impl Forwarder for NoForwarder {
    async fn forward(&self, message: &ChannelForward) -> Result<(), ChannelError> {
        Err(ChannelError::new(
            &message.channel,
            message.params.clone(),
            Fault::Sidekick,
            "No procedure server configured",
        ))
    }
}
