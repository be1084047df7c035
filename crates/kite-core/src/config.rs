//! Centralized configuration for Kite.
//!
//! Compile-time defaults for the wire protocol, the sidekick relay, and the
//! HTTP hops between server and relay. Runtime overrides are carried by
//! `SidekickClientConfig` and the sidekick's own settings.

use std::time::Duration;

/// Wire protocol constants shared by server, relay and client.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Header carrying the shared secret on control-plane requests.
    pub const SECRET_HEADER: &'static str = "x-sidekick-secret";
    pub const RESOURCE_TOPIC_PREFIX: &'static str = "resource:";
    pub const CHANNEL_TOPIC_PREFIX: &'static str = "channel:";
    /// Message substituted for internal errors when masking is enabled.
    pub const GENERIC_SERVER_ERROR: &'static str = "Internal server error";
}

/// Sidekick relay configuration.
pub struct RelayConfig;

impl RelayConfig {
    pub const DEFAULT_PORT: u16 = 7890;
    pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
    pub const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
    pub const PENDING_TOKEN_TTL: Duration = Duration::from_secs(300);
    pub const PENDING_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
    pub const MAX_FRAME_SIZE: usize = 1_048_576; // 1MB
}

/// Network-related configuration for server ↔ relay hops.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);
    pub const USER_AGENT: &'static str = "Kite/0.1";
}
