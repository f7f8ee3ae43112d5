//! Content filtering pipeline

pub mod ansi;
pub mod patterns;
pub mod sanitizer;
pub mod whitelist;

// Re-exports
pub use ansi::{AnsiFilter, AnsiOutput};
pub use patterns::{default_rules, PatternCheck, PatternHit, PatternMatcher};
pub use sanitizer::{
    Direction, SanitizeError, SanitizeOutcome, Sanitizer, SharedFilters, MAX_DEPTH,
};
pub use whitelist::{CharacterWhitelist, WhitelistOutput, WhitelistViolation};
