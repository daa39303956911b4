//! Client configuration.

use crate::policy::TargetPolicy;
use natter_core::{RelayTimings, DEFAULT_MAX_FRAME_LEN};
use std::time::Duration;

/// Default broker connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for a Listening Client.
#[derive(Debug, Clone)]
pub struct ListenConfig {
    /// Name to register under.
    pub name: String,
    /// Broker address as `host:port`.
    pub broker_addr: String,
    /// Bound on connecting to the broker and on waiting for `RegisterAck`.
    pub connect_timeout: Duration,
    /// Bound on dialing a forwarded target.
    pub dial_timeout: Duration,
    /// Heartbeat period on the control and data connections. Zero is
    /// raised to a small minimum.
    pub heartbeat_interval: Duration,
    /// Silence from the broker longer than this ends the connection.
    pub idle_timeout: Duration,
    pub max_frame_len: usize,
    /// Which targets and commands forwarders may open here.
    pub policy: TargetPolicy,
}

impl ListenConfig {
    /// Defaults for everything but the name and broker.
    pub fn new(name: &str, broker_addr: &str) -> Self {
        let timings = RelayTimings::default();
        Self {
            name: name.to_string(),
            broker_addr: broker_addr.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            dial_timeout: Duration::from_secs(5),
            heartbeat_interval: timings.heartbeat_interval,
            idle_timeout: timings.idle_timeout,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            policy: TargetPolicy::default(),
        }
    }

    pub fn timings(&self) -> RelayTimings {
        RelayTimings {
            heartbeat_interval: self.heartbeat_interval,
            idle_timeout: self.idle_timeout,
        }
    }
}

/// Configuration for a Forwarding Client.
#[derive(Debug, Clone)]
pub struct ForwardConfig {
    /// Name of this client, sent as the request's source.
    pub self_name: String,
    /// Broker address as `host:port`.
    pub broker_addr: String,
    /// Local address to accept connections on, e.g. `127.0.0.1:9000`.
    /// An empty host binds all interfaces.
    pub local_bind: String,
    /// Registered name of the Listening Client to reach.
    pub peer_name: String,
    /// Target address on the peer; `:22` means the peer's localhost.
    pub peer_target_addr: String,
    /// Command to run on the peer instead of dialing `peer_target_addr`.
    pub target_command: Vec<String>,
    /// Serve exactly one local connection, then return its outcome.
    pub listen_once: bool,
    /// Bound on connecting to the broker and on waiting for `ForwardAck`.
    pub connect_timeout: Duration,
    /// Zero is raised to a small minimum.
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub max_frame_len: usize,
}

impl ForwardConfig {
    pub fn new(
        self_name: &str,
        broker_addr: &str,
        local_bind: &str,
        peer_name: &str,
        peer_target_addr: &str,
    ) -> Self {
        let timings = RelayTimings::default();
        Self {
            self_name: self_name.to_string(),
            broker_addr: broker_addr.to_string(),
            local_bind: local_bind.to_string(),
            peer_name: peer_name.to_string(),
            peer_target_addr: peer_target_addr.to_string(),
            target_command: Vec::new(),
            listen_once: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_interval: timings.heartbeat_interval,
            idle_timeout: timings.idle_timeout,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn timings(&self) -> RelayTimings {
        RelayTimings {
            heartbeat_interval: self.heartbeat_interval,
            idle_timeout: self.idle_timeout,
        }
    }

    /// Bind address with an empty host expanded to all interfaces.
    pub fn bind_addr(&self) -> String {
        match self.local_bind.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}"),
            None => self.local_bind.clone(),
        }
    }
}
