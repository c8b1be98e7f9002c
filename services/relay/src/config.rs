//! Relay tunables.
//!
//! Defaults match the wire contract (port 6500, 5 s probes, 30 s reload
//! grace, 60 s idempotency window, 30 s request deadline).  Integration
//! tests construct shortened configs instead of waiting wall-clock time.

use std::net::SocketAddr;
use std::time::Duration;

use relay_protocol::DEFAULT_PORT;

/// Queue bound used when queueing is enabled without an explicit capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Loopback-only listen address.  Port 0 binds an ephemeral port.
    pub bind_addr: SocketAddr,
    /// Per-instance FIFO overflow bound.  0 disables queueing: a BUSY
    /// instance rejects new dispatches with `INSTANCE_BUSY` immediately.
    pub queue_capacity: usize,
    /// Liveness probe interval negotiated with each editor.
    pub heartbeat_interval: Duration,
    /// Consecutive unanswered probes before an instance is declared lost.
    pub probe_loss_limit: u32,
    /// How long a RELOADING instance may stay away before its in-flight and
    /// queued requests fail with `INSTANCE_DISCONNECTED`.
    pub reload_grace: Duration,
    /// Idempotency window for cached success replies.
    pub cache_ttl: Duration,
    /// Request deadline applied when a REQUEST carries no `timeout_ms`.
    pub default_deadline: Duration,
    /// How long a fresh connection may stay silent before its first frame.
    pub handshake_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            queue_capacity: 0,
            heartbeat_interval: Duration::from_secs(5),
            probe_loss_limit: 3,
            reload_grace: Duration::from_secs(30),
            cache_ttl: Duration::from_secs(60),
            default_deadline: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl RelayConfig {
    /// Ephemeral-port config for in-process tests.
    pub fn for_tests() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Self::default()
        }
    }
}
