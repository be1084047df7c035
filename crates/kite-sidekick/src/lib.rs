//! Kite Sidekick - realtime relay between clients and a procedure server.
//!
//! The sidekick is the only process holding live client connections. It
//! keeps every pub/sub table in one [`Broker`]:
//!
//! - `resource:<tag>` topics, joined with `listen`, notified after mutations
//! - `channel:<name>:<params>` topics, joined by redeeming a one-time token
//!   issued by the procedure server during the channel handshake
//!
//! Client `send` frames are forwarded to the procedure server together with
//! the connection context the token was issued with.

pub mod broker;
pub mod connection;
pub mod error;
pub mod forward;
pub mod queue;
pub mod server;

pub use broker::{Broker, BrokerStats, ConnectionId};
pub use error::{Result, SidekickError};
pub use forward::{Forwarder, HttpForwarder, NoForwarder};
pub use queue::OutboundQueue;
pub use server::{router, serve, start_sidekick, SidekickSettings, SidekickState};
