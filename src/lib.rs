pub mod config;
pub mod events;
pub mod filter;
pub mod net;
pub mod secrets;

pub use config::{Config, ConfigError};
pub use events::{EventDetails, EventSender, SecurityEvent, SecurityEventKind};
pub use filter::{Direction, SanitizeOutcome, Sanitizer, SharedFilters};
pub use net::{Proxy, ProxyError, ProxyStats, RateDecision, RateLimiter};
pub use secrets::{SecretDetector, SecretVault, VaultError, VaultKey};
