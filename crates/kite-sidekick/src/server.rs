//! HTTP/WebSocket surface of the relay.
//!
//! - `GET  /health` - liveness plus broker counters
//! - `GET  /ws` - client plane (persistent connection)
//! - `POST /connection`, `/resources`, `/message` - control plane, reachable
//!   only with the shared secret

use crate::broker::Broker;
use crate::connection::handle_connection;
use crate::error::SidekickError;
use crate::forward::{Forwarder, HttpForwarder, NoForwarder};
use axum::{
    extract::{rejection::JsonRejection, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use kite_core::{
    ChannelBroadcast, ConnectionPayload, NetworkConfig, ProtocolConfig, RelayConfig,
    ResourceBatch,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Runtime settings for the relay.
#[derive(Debug, Clone)]
pub struct SidekickSettings {
    /// Shared secret the procedure server presents on control-plane calls.
    pub secret: String,
    /// Base URL of the procedure server that receives forwarded messages.
    pub server_url: Option<String>,
    pub queue_capacity: usize,
    /// `None` keeps unredeemed tokens until the relay restarts.
    pub pending_ttl: Option<Duration>,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub forward_timeout: Duration,
}

impl SidekickSettings {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            server_url: None,
            queue_capacity: RelayConfig::OUTBOUND_QUEUE_CAPACITY,
            pending_ttl: Some(RelayConfig::PENDING_TOKEN_TTL),
            heartbeat_interval: RelayConfig::HEARTBEAT_INTERVAL,
            idle_timeout: RelayConfig::CLIENT_IDLE_TIMEOUT,
            forward_timeout: NetworkConfig::FORWARD_TIMEOUT,
        }
    }

    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = Some(url.into());
        self
    }
}

/// State shared by every connection and control handler.
pub struct SidekickState {
    pub broker: Arc<Broker>,
    pub forwarder: Arc<dyn Forwarder>,
    pub settings: SidekickSettings,
}

impl SidekickState {
    /// Build state with the forwarder implied by `settings.server_url`.
    pub fn new(settings: SidekickSettings) -> anyhow::Result<Arc<Self>> {
        if settings.secret.is_empty() {
            return Err(SidekickError::Config {
                message: "sidekick secret must not be empty".to_string(),
            }
            .into());
        }
        let forwarder: Arc<dyn Forwarder> = match &settings.server_url {
            Some(url) => Arc::new(HttpForwarder::new(
                url,
                &settings.secret,
                settings.forward_timeout,
            )?),
            None => {
                warn!("No procedure server URL configured; channel sends will fail");
                Arc::new(NoForwarder)
            }
        };
        Ok(Self::with_forwarder(settings, forwarder))
    }

    pub fn with_forwarder(settings: SidekickSettings, forwarder: Arc<dyn Forwarder>) -> Arc<Self> {
        Arc::new(Self {
            broker: Broker::new(settings.queue_capacity, settings.pending_ttl),
            forwarder,
            settings,
        })
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), SidekickError> {
        let presented = headers
            .get(ProtocolConfig::SECRET_HEADER)
            .and_then(|v| v.to_str().ok());
        if presented == Some(self.settings.secret.as_str()) {
            Ok(())
        } else {
            warn!("Rejected control-plane request with missing or wrong secret");
            Err(SidekickError::Unauthorized {
                message: "missing or wrong sidekick secret".to_string(),
            })
        }
    }
}

pub fn router(state: Arc<SidekickState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/ws", get(handle_ws))
        .route("/connection", post(handle_register))
        .route("/resources", post(handle_resources))
        .route("/message", post(handle_broadcast))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on an already-bound listener and start the pending-token sweeper.
pub async fn serve(listener: TcpListener, state: Arc<SidekickState>) -> anyhow::Result<SocketAddr> {
    let actual_addr = listener.local_addr()?;

    if let Some(ttl) = state.settings.pending_ttl {
        let broker = state.broker.clone();
        let period = ttl.min(RelayConfig::PENDING_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let removed = broker.sweep_expired().await;
                if removed > 0 {
                    debug!("Swept {} expired pending token(s)", removed);
                }
            }
        });
    }

    let app = router(state);
    info!("Sidekick listening on {}", actual_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Sidekick server error: {}", e);
        }
    });

    Ok(actual_addr)
}

/// Start the relay.
///
/// Returns the actual address the relay is bound to (useful when port=0).
pub async fn start_sidekick(
    settings: SidekickSettings,
    host: &str,
    port: u16,
) -> anyhow::Result<SocketAddr> {
    let state = SidekickState::new(settings)?;
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state).await
}

// ============================================================================
// Handlers
// ============================================================================

async fn handle_health(State(state): State<Arc<SidekickState>>) -> impl IntoResponse {
    let stats = state.broker.stats().await;
    Json(json!({"status": "ok", "broker": stats}))
}

async fn handle_ws(ws: WebSocketUpgrade, State(state): State<Arc<SidekickState>>) -> Response {
    ws.max_message_size(RelayConfig::MAX_FRAME_SIZE)
        .on_upgrade(move |socket| handle_connection(socket, state))
}

/// Body of a control-plane call, read only after the caller is authorized.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, SidekickError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| SidekickError::MalformedFrame {
            message: rejection.body_text(),
        })
}

async fn handle_register(
    State(state): State<Arc<SidekickState>>,
    headers: HeaderMap,
    payload: Result<Json<ConnectionPayload>, JsonRejection>,
) -> Result<StatusCode, SidekickError> {
    state.authorize(&headers)?;
    let payload = json_body(payload)?;
    state.broker.register_pending(payload).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_resources(
    State(state): State<Arc<SidekickState>>,
    headers: HeaderMap,
    payload: Result<Json<ResourceBatch>, JsonRejection>,
) -> Result<Json<serde_json::Value>, SidekickError> {
    state.authorize(&headers)?;
    let batch = json_body(payload)?;
    let delivered = state.broker.publish_resources(&batch.resources).await;
    Ok(Json(json!({ "delivered": delivered })))
}

async fn handle_broadcast(
    State(state): State<Arc<SidekickState>>,
    headers: HeaderMap,
    payload: Result<Json<ChannelBroadcast>, JsonRejection>,
) -> Result<Json<serde_json::Value>, SidekickError> {
    state.authorize(&headers)?;
    let broadcast = json_body(payload)?;
    let delivered = state.broker.publish_message(broadcast).await;
    Ok(Json(json!({ "delivered": delivered })))
}
