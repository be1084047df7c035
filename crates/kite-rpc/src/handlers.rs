//! Request handlers for the procedure server.

use crate::server::AppState;
use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use kite_core::{
    ChannelError, ChannelForward, ConnectRequest, ConnectResponse, ContextProvider, Fault,
    ProcedureRequest, ProcedureResponse, ProtocolConfig, RequestParts,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Convert transport headers into the gateway's request view.
fn request_parts(headers: &HeaderMap, remote: Option<ConnectInfo<SocketAddr>>) -> RequestParts {
    let mut parts = RequestParts::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            parts = parts.with_header(name.as_str(), value);
        }
    }
    parts.remote_addr = remote.map(|ConnectInfo(addr)| addr);
    parts
}

fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Health check endpoint.
pub async fn handle_health<P: ContextProvider>(
    State(state): State<Arc<AppState<P>>>,
) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "procedures": state.gateway.procedure_names().len(),
        "channels": state.gateway.channel_names().len(),
    }))
}

/// Procedure call endpoint.
pub async fn handle_rpc<P: ContextProvider>(
    State(state): State<Arc<AppState<P>>>,
    remote: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Result<Json<ProcedureRequest>, JsonRejection>,
) -> Response {
    let call = match payload {
        Ok(Json(call)) => call,
        Err(rejection) => {
            debug!("Rejected malformed procedure call: {}", rejection.body_text());
            let response = ProcedureResponse::error(
                400,
                format!("Malformed request: {}", rejection.body_text()),
            );
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };

    let parts = request_parts(&headers, remote);
    let response = state.gateway.call(&parts, call).await;
    (status(response.status_code()), Json(response)).into_response()
}

/// Channel handshake endpoint.
pub async fn handle_connect<P: ContextProvider>(
    State(state): State<Arc<AppState<P>>>,
    remote: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Result<Json<ConnectRequest>, JsonRejection>,
) -> Response {
    let connect = match payload {
        Ok(Json(connect)) => connect,
        Err(rejection) => {
            let response = ConnectResponse::rejected(ChannelError::detached(
                Fault::Client,
                format!("Malformed request: {}", rejection.body_text()),
            ));
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };

    let parts = request_parts(&headers, remote);
    let response = state.gateway.connect(&parts, connect).await;
    (status(response.status_code()), Json(response)).into_response()
}

/// Client message forwarded by the sidekick relay.
///
/// Every forward must carry the configured sidekick secret; without one
/// configured, all forwards are refused. Responds 204 on success, otherwise a `ChannelError` body with the status
/// mapped from its fault.
pub async fn handle_message<P: ContextProvider>(
    State(state): State<Arc<AppState<P>>>,
    headers: HeaderMap,
    payload: Result<Json<ChannelForward>, JsonRejection>,
) -> Response {
    let expected = match state.options.sidekick_secret.as_deref() {
        Some(secret) if !secret.is_empty() => secret,
        _ => {
            warn!("Rejected channel forward: no sidekick secret configured");
            let error = ChannelError::detached(
                Fault::Sidekick,
                "Channel forwarding requires a sidekick secret",
            );
            return (StatusCode::UNAUTHORIZED, Json(error)).into_response();
        }
    };
    let presented = headers
        .get(ProtocolConfig::SECRET_HEADER)
        .and_then(|v| v.to_str().ok());
    if presented != Some(expected) {
        warn!("Rejected channel forward with missing or wrong sidekick secret");
        let error = ChannelError::detached(Fault::Sidekick, "Sidekick secret mismatch");
        return (StatusCode::UNAUTHORIZED, Json(error)).into_response();
    }

    let forward = match payload {
        Ok(Json(forward)) => forward,
        Err(rejection) => {
            let error = ChannelError::detached(
                Fault::Sidekick,
                format!("Malformed forward: {}", rejection.body_text()),
            );
            return (status(Fault::Sidekick.status_code()), Json(error)).into_response();
        }
    };

    match state.gateway.handle_message(forward).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => (status(error.fault.status_code()), Json(error)).into_response(),
    }
}
