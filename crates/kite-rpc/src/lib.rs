//! Kite RPC - HTTP surface for a procedure server.
//!
//! Mounts a [`kite_core::Gateway`] on an axum router:
//!
//! - `GET  /health` - liveness plus registry sizes
//! - `POST /rpc` - procedure calls
//! - `POST /channel/connect` - channel handshake (token issuance)
//! - `POST /channel/message` - client messages forwarded by the sidekick relay
//!
//! ```rust,ignore
//! let gateway = Arc::new(build_gateway()?);
//! let addr = kite_rpc::start_server(gateway, ServerOptions::default(), "127.0.0.1", 0).await?;
//! println!("RPC_PORT={}", addr.port());
//! ```

mod handlers;
mod server;

pub use server::{router, serve, start_server, AppState, ServerOptions};
