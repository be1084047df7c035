//! Kite Core - typed procedures, realtime channels and resource invalidation.
//!
//! This crate holds everything the procedure server needs and nothing that
//! touches a live transport:
//!
//! - [`matcher`]: resource pattern matching used for cache invalidation
//! - [`gateway`]: procedure registry/dispatcher and channel state machine
//! - [`relay`]: the control-plane client used to reach the sidekick relay
//! - [`protocol`]: every wire shape exchanged between server, relay and client
//!
//! HTTP surfaces live in `kite-rpc` (procedure server) and `kite-sidekick`
//! (relay). The client library lives in `kite-client`.
//!
//! # Example
//!
//! ```rust,ignore
//! use kite_core::{fail, Gateway, NoContext, NoRelay, ProcedureDeclaration};
//!
//! let gateway = Gateway::builder(NoContext, NoRelay)
//!     .declare(ProcedureDeclaration::query("ping"))
//!     .implement("ping", |_call| async { Ok("pong") }, |_args| vec![])
//!     .build()?;
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod matcher;
pub mod protocol;
pub mod relay;
pub mod validator;

pub use config::{NetworkConfig, ProtocolConfig, RelayConfig};
pub use context::{ContextProvider, NoContext, RequestParts};
pub use error::{KiteError, Result};
pub use gateway::{
    fail, reject, Broadcaster, ChannelDeclaration, ConnectArgs, Failure, Gateway,
    GatewayBuilder, MessageArgs, ProcedureArgs, ProcedureDeclaration, ProcedureKind,
    Rejection, ResourceArgs,
};
pub use matcher::{matches, was_affected};
pub use protocol::{
    ChannelBroadcast, ChannelError, ChannelForward, ConnectRequest, ConnectResponse,
    ConnectResult, ConnectionPayload, Fault, Params, ProcedureRequest, ProcedureResponse,
    RelayInbound, RelayOutbound, ResourceBatch, Topic,
};
pub use relay::{NoRelay, RelayPublisher, SidekickClient, SidekickClientConfig};
pub use validator::{validator_fn, AnyValue, Issue, Schema, SharedValidator, Validator};
