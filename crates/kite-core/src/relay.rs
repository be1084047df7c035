//! Control-plane client for the sidekick relay.
//!
//! The procedure server never talks to clients for realtime traffic. It hands
//! accepted connections, resource updates and channel broadcasts to the relay
//! through [`RelayPublisher`]. [`SidekickClient`] is the HTTP implementation;
//! [`NoRelay`] lets a server run without any relay at all.

use crate::config::{NetworkConfig, ProtocolConfig};
use crate::protocol::{ChannelBroadcast, ConnectionPayload, ResourceBatch};
use crate::{KiteError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Server → relay control plane.
#[async_trait]
pub trait RelayPublisher: Send + Sync + 'static {
    /// Register an accepted connection whose token has not been redeemed yet.
    async fn register_connection(&self, payload: &ConnectionPayload) -> Result<()>;

    /// Notify subscribers of every resource covered by the batch.
    async fn publish_resources(&self, batch: &ResourceBatch) -> Result<()>;

    /// Deliver a message to every subscriber of `(channel, params)`.
    async fn publish_message(&self, broadcast: &ChannelBroadcast) -> Result<()>;
}

/// Publisher used when no relay is deployed.
///
/// Resource pushes are dropped; channels cannot work without a relay, so
/// connection registration fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRelay;

#[async_trait]
impl RelayPublisher for NoRelay {
    async fn register_connection(&self, _payload: &ConnectionPayload) -> Result<()> {
        Err(KiteError::Relay {
            message: "No sidekick relay is configured".to_string(),
            status_code: None,
        })
    }

    async fn publish_resources(&self, batch: &ResourceBatch) -> Result<()> {
        debug!(
            "No relay configured, dropping {} resource updates",
            batch.resources.len()
        );
        Ok(())
    }

    async fn publish_message(&self, _broadcast: &ChannelBroadcast) -> Result<()> {
        Err(KiteError::Relay {
            message: "No sidekick relay is configured".to_string(),
            status_code: None,
        })
    }
}

/// Settings for [`SidekickClient`].
#[derive(Debug, Clone)]
pub struct SidekickClientConfig {
    /// Base URL of the relay, e.g. `http://127.0.0.1:7890`.
    pub base_url: String,
    /// Shared secret sent on every control-plane request.
    pub secret: String,
    pub timeout: Duration,
}

impl SidekickClientConfig {
    pub fn new(base_url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            secret: secret.into(),
            timeout: NetworkConfig::REQUEST_TIMEOUT,
        }
    }
}

/// HTTP client for the relay's control plane.
#[derive(Debug, Clone)]
pub struct SidekickClient {
    client: Client,
    base_url: String,
    secret: String,
}

impl SidekickClient {
    pub fn new(config: SidekickClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| KiteError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                source: Some(e),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            secret: config.secret,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .header(ProtocolConfig::SECRET_HEADER, &self.secret)
            .json(body)
            .send()
            .await
            .map_err(|e| KiteError::Network {
                message: format!("POST {} failed: {}", url, e),
                source: Some(e),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        Err(KiteError::Relay {
            message: format!("POST {} returned {}: {}", url, status, text),
            status_code: Some(status.as_u16()),
        })
    }
}

#[async_trait]
impl RelayPublisher for SidekickClient {
    async fn register_connection(&self, payload: &ConnectionPayload) -> Result<()> {
        debug!(
            "Registering pending connection for channel {}",
            payload.channel
        );
        self.post("/connection", payload).await
    }

    async fn publish_resources(&self, batch: &ResourceBatch) -> Result<()> {
        self.post("/resources", batch).await
    }

    async fn publish_message(&self, broadcast: &ChannelBroadcast) -> Result<()> {
        self.post("/message", broadcast).await
    }
}
