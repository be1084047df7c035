//! HTTP server implementation using Axum.

use crate::handlers::{handle_connect, handle_health, handle_message, handle_rpc};
use axum::{
    routing::{get, post},
    Router,
};
use kite_core::{ContextProvider, Gateway};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Runtime options for the procedure server.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Shared secret the sidekick must present when forwarding channel
    /// messages. `None` refuses every forward.
    pub sidekick_secret: Option<String>,
}

/// Application state shared across handlers.
pub struct AppState<P: ContextProvider> {
    pub gateway: Arc<Gateway<P>>,
    pub options: ServerOptions,
}

/// Build the router without binding a socket.
pub fn router<P: ContextProvider>(gateway: Arc<Gateway<P>>, options: ServerOptions) -> Router {
    let state = Arc::new(AppState { gateway, options });

    // Browsers call the procedure server directly
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health::<P>))
        .route("/rpc", post(handle_rpc::<P>))
        .route("/channel/connect", post(handle_connect::<P>))
        .route("/channel/message", post(handle_message::<P>))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

/// Serve on an already-bound listener.
///
/// Returns the address the listener is bound to.
pub async fn serve<P: ContextProvider>(
    listener: TcpListener,
    gateway: Arc<Gateway<P>>,
    options: ServerOptions,
) -> anyhow::Result<SocketAddr> {
    let actual_addr = listener.local_addr()?;
    let app = router(gateway, options);

    info!("RPC server listening on {}", actual_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        {
            error!("RPC server error: {}", e);
        }
    });

    Ok(actual_addr)
}

/// Start the procedure server.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_server<P: ContextProvider>(
    gateway: Arc<Gateway<P>>,
    options: ServerOptions,
    host: &str,
    port: u16,
) -> anyhow::Result<SocketAddr> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    serve(listener, gateway, options).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use kite_core::{NoContext, NoRelay, ProcedureDeclaration};

    #[tokio::test]
    async fn test_server_starts() {
        let gateway = Gateway::builder(NoContext, NoRelay)
            .declare(ProcedureDeclaration::query("ping"))
            .implement("ping", |_| async { Ok("pong") }, |_| vec![])
            .build()
            .unwrap();

        let addr = start_server(Arc::new(gateway), ServerOptions::default(), "127.0.0.1", 0)
            .await
            .unwrap();
        assert!(addr.port() > 0);
    }
}
