//! Credential detection and vaulting

pub mod detector;
pub mod vault;

// Re-exports
pub use detector::{shannon_entropy, SecretDetector, SecretMatch};
pub use vault::{
    RetrieveOutcome, SecretVault, VaultError, VaultKey, PLACEHOLDER_PATTERN, PLACEHOLDER_PREFIX,
    SWEEP_INTERVAL_SECS, VAULT_SECRET_ENV,
};
