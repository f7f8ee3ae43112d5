//! Networking layer: legs, coordinator, admission control

pub mod client;
pub mod connection;
pub mod jsonrpc;
pub mod proxy;
pub mod rate_limit;
pub mod server;

// Re-exports
pub use client::{AcceptError, ClientLeg, ClientLegState};
pub use connection::{run_connection, ConnectionCounters};
pub use proxy::{Proxy, ProxyError, ProxyStats};
pub use rate_limit::{RateDecision, RateLimiter};
pub use server::{
    SendStatus, ServerLeg, ServerLegError, ServerLegState, KEEPALIVE_INTERVAL_SECS,
};
