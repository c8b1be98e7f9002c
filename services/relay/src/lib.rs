//! Always-on broker between command-line clients and long-lived editor
//! instances: registry, at-most-once routing, liveness, reload grace and
//! bounded overflow queueing over the framed TCP protocol.

pub mod cache;
pub mod client_session;
pub mod config;
pub mod editor_session;
pub mod registry;
pub mod server;

pub use cache::IdempotencyCache;
pub use config::{DEFAULT_QUEUE_CAPACITY, RelayConfig};
pub use registry::Registry;
pub use server::{Relay, RelayHandle, RelayState};
