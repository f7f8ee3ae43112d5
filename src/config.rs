//! Proxy configuration
//!
//! The full option tree is deserialized from a YAML file with serde
//! defaults, so a partial file (or none at all) yields a working proxy.
//! Everything that can be rejected at startup is rejected at startup:
//! pattern rules that fail to compile, inverted code-point ranges, and a
//! bad tool-name regex are fatal configuration errors, never runtime ones.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default downstream server URL.
pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:3000";

/// Handshake / connect timeout in seconds.
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 10;

/// Maximum inbound frame size (1 MB). Oversized frames are rejected
/// before JSON parsing — an attacker cannot make the proxy buffer
/// arbitrary amounts of text.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Outbound queue bound while the server leg is down.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 100;

/// Vault TTL for stored secrets in seconds.
pub const DEFAULT_SECRET_TTL_SECS: u64 = 3600;

/// Distinct placeholders a single connection may own.
pub const DEFAULT_MAX_KEYS_PER_CONNECTION: usize = 100;

/// Minimum match length for secret detection.
pub const DEFAULT_MIN_KEY_LENGTH: usize = 20;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("pattern rule '{name}' does not compile: {message}")]
    InvalidRule { name: String, message: String },
    #[error("custom secret pattern '{name}' does not compile: {message}")]
    InvalidSecretPattern { name: String, message: String },
    #[error("invalid code point range [{lo:#x}, {hi:#x}]")]
    InvalidRange { lo: u32, hi: u32 },
    #[error("tool name pattern '{pattern}' does not compile: {message}")]
    InvalidFieldPattern { pattern: String, message: String },
}

/// Action taken on strings containing ANSI escape sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AnsiAction {
    #[default]
    Strip,
    Reject,
    Encode,
}

/// Action taken when a pattern rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Reject,
    Strip,
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnsiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub action: AnsiAction,
}

impl Default for AnsiConfig {
    fn default() -> Self {
        Self { enabled: true, action: AnsiAction::Strip }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Inclusive code point ranges. Tab/LF/CR are NOT in the default
    /// range — list them explicitly to pass them through.
    #[serde(default = "default_ranges")]
    pub allowed_ranges: Vec<[u32; 2]>,
    /// Always-removed code points, subtracted from the ranges.
    #[serde(default = "default_blacklist")]
    pub blacklist: Vec<u32>,
}

fn default_ranges() -> Vec<[u32; 2]> {
    vec![[0x20, 0x7E]]
}

fn default_blacklist() -> Vec<u32> {
    vec![0x1B, 0x7F]
}

impl Default for WhitelistConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_ranges: default_ranges(),
            blacklist: default_blacklist(),
        }
    }
}

/// One configured pattern rule. The regex is compiled case-insensitive
/// at construction; a rule that fails to compile refuses startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    pub pattern: String,
    pub action: RuleAction,
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// When absent, the built-in rule set is used (command injection,
    /// path traversal, SQL injection, script injection).
    #[serde(default)]
    pub rules: Option<Vec<RuleConfig>>,
}

impl Default for PatternsConfig {
    fn default() -> Self {
        Self { enabled: true, rules: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolNameConfig {
    #[serde(default = "default_tool_name_pattern")]
    pub pattern: String,
}

fn default_tool_name_pattern() -> String {
    r"^[a-zA-Z0-9_/.-]+$".to_string()
}

impl Default for ToolNameConfig {
    fn default() -> Self {
        Self { pattern: default_tool_name_pattern() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParamsConfig {
    #[serde(default)]
    pub strip_html: bool,
    #[serde(default = "default_true")]
    pub strip_scripts: bool,
}

impl Default for ToolParamsConfig {
    fn default() -> Self {
        Self { strip_html: false, strip_scripts: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FieldsConfig {
    #[serde(default)]
    pub tool_name: ToolNameConfig,
    #[serde(default)]
    pub tool_params: ToolParamsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_max_prompt_length")]
    pub max_prompt_length: usize,
    #[serde(default = "default_max_tool_name_length")]
    pub max_tool_name_length: usize,
    #[serde(default = "default_max_param_value_length")]
    pub max_param_value_length: usize,
    #[serde(default)]
    pub fields: FieldsConfig,
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_max_prompt_length() -> usize {
    10_000
}

fn default_max_tool_name_length() -> usize {
    128
}

fn default_max_param_value_length() -> usize {
    10_000
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            max_prompt_length: default_max_prompt_length(),
            max_tool_name_length: default_max_tool_name_length(),
            max_param_value_length: default_max_param_value_length(),
            fields: FieldsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SanitizationConfig {
    #[serde(default)]
    pub ansi_escapes: AnsiConfig,
    #[serde(default)]
    pub character_whitelist: WhitelistConfig,
    #[serde(default)]
    pub patterns: PatternsConfig,
    /// When set, recorded violations become hard rejections.
    #[serde(default)]
    pub strict_mode: bool,
    #[serde(default)]
    pub validation: ValidationConfig,
}

/// A user-supplied secret pattern appended to the built-in catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomSecretPattern {
    pub name: String,
    pub pattern: String,
    /// Entropy gate in bits/char; omit to accept any match.
    #[serde(default)]
    pub entropy_threshold: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretDetectionConfig {
    #[serde(default = "default_true")]
    pub builtin_patterns: bool,
    #[serde(default)]
    pub custom_patterns: Vec<CustomSecretPattern>,
    #[serde(default = "default_min_key_length")]
    pub minimum_key_length: usize,
}

fn default_min_key_length() -> usize {
    DEFAULT_MIN_KEY_LENGTH
}

impl Default for SecretDetectionConfig {
    fn default() -> Self {
        Self {
            builtin_patterns: true,
            custom_patterns: Vec::new(),
            minimum_key_length: DEFAULT_MIN_KEY_LENGTH,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretStorageConfig {
    /// AEAD-encrypt stored secrets. Disabling keeps plaintext in memory.
    #[serde(default = "default_true")]
    pub encryption: bool,
    /// Seconds a stored secret stays retrievable.
    #[serde(default = "default_secret_ttl")]
    pub ttl: u64,
    #[serde(default = "default_max_keys")]
    pub max_keys_per_connection: usize,
}

fn default_secret_ttl() -> u64 {
    DEFAULT_SECRET_TTL_SECS
}

fn default_max_keys() -> usize {
    DEFAULT_MAX_KEYS_PER_CONNECTION
}

impl Default for SecretStorageConfig {
    fn default() -> Self {
        Self {
            encryption: true,
            ttl: DEFAULT_SECRET_TTL_SECS,
            max_keys_per_connection: DEFAULT_MAX_KEYS_PER_CONNECTION,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyProtectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub detection: SecretDetectionConfig,
    #[serde(default)]
    pub storage: SecretStorageConfig,
}

impl Default for ApiKeyProtectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            detection: SecretDetectionConfig::default(),
            storage: SecretStorageConfig::default(),
        }
    }
}

/// Requests admitted per scope per window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateWindowConfig {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_global_rate")]
    pub global: RateWindowConfig,
    #[serde(default = "default_client_rate")]
    pub per_client: RateWindowConfig,
    /// Method name → limits. Only listed methods get a method-scope bucket.
    #[serde(default)]
    pub per_method: HashMap<String, RateWindowConfig>,
}

fn default_global_rate() -> RateWindowConfig {
    RateWindowConfig { requests_per_minute: 1000, requests_per_hour: 20_000 }
}

fn default_client_rate() -> RateWindowConfig {
    RateWindowConfig { requests_per_minute: 100, requests_per_hour: 2000 }
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            global: default_global_rate(),
            per_client: default_client_rate(),
            per_method: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_server_url")]
    pub mcp_server_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_max_queue")]
    pub max_queue_size: usize,
    /// Handshake and connect timeout in seconds.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    /// Delay before the first reconnect attempt, in seconds. Doubles
    /// per attempt.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_initial_delay: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_max_attempts: u32,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

fn default_max_connections() -> usize {
    100
}

fn default_max_queue() -> usize {
    DEFAULT_MAX_QUEUE_SIZE
}

fn default_connection_timeout() -> u64 {
    DEFAULT_CONNECTION_TIMEOUT_SECS
}

fn default_reconnect_delay() -> u64 {
    1
}

fn default_reconnect_attempts() -> u32 {
    5
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: DEFAULT_PORT,
            mcp_server_url: default_server_url(),
            max_connections: default_max_connections(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT_SECS,
            auto_reconnect: true,
            reconnect_initial_delay: 1,
            reconnect_max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub sanitization: SanitizationConfig,
    #[serde(default)]
    pub api_key_protection: ApiKeyProtectionConfig,
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

impl Config {
    /// Load from a YAML file and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Config = serde_yaml::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Startup validation. Every rejected input here would otherwise
    /// surface as a runtime failure inside a connection task.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(rules) = &self.sanitization.patterns.rules {
            for rule in rules {
                if let Err(e) = regex::RegexBuilder::new(&rule.pattern)
                    .case_insensitive(true)
                    .build()
                {
                    return Err(ConfigError::InvalidRule {
                        name: rule.name.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
        for custom in &self.api_key_protection.detection.custom_patterns {
            if let Err(e) = regex::Regex::new(&custom.pattern) {
                return Err(ConfigError::InvalidSecretPattern {
                    name: custom.name.clone(),
                    message: e.to_string(),
                });
            }
        }
        for range in &self.sanitization.character_whitelist.allowed_ranges {
            if range[0] > range[1] || range[1] > 0x10FFFF {
                return Err(ConfigError::InvalidRange { lo: range[0], hi: range[1] });
            }
        }
        let pattern = &self.sanitization.validation.fields.tool_name.pattern;
        if let Err(e) = regex::Regex::new(pattern) {
            return Err(ConfigError::InvalidFieldPattern {
                pattern: pattern.clone(),
                message: e.to_string(),
            });
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.proxy.host, self.proxy.port)
    }
}

fn default_true() -> bool {
    true
}
