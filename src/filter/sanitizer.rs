//! Sanitization pipeline
//!
//! One Sanitizer per client connection. It walks arbitrary JSON trees
//! and applies, in order: secret substitution (client→server only),
//! then per-string ANSI filtering, character whitelisting, pattern
//! rules, and field validation. Object keys are sanitized too; a key
//! reduced to nothing drops its entry.
//!
//! Secrets flow one way: substitution happens on ingress, placeholders
//! are swapped back by the server leg on egress. Nothing derived from
//! the sanitized representation ever contains a raw secret.

use crate::config::{Config, RuleAction};
use crate::events::{EventDetails, EventSender, SecurityEvent, SecurityEventKind};
use crate::filter::ansi::AnsiFilter;
use crate::filter::patterns::PatternMatcher;
use crate::filter::whitelist::CharacterWhitelist;
use crate::secrets::detector::SecretDetector;
use crate::secrets::vault::{
    RetrieveOutcome, SecretVault, VaultError, VaultKey, PLACEHOLDER_PATTERN, PLACEHOLDER_PREFIX,
};
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Recursion bound for attacker-controlled JSON trees.
pub const MAX_DEPTH: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SanitizeError {
    #[error("message nesting exceeds depth {MAX_DEPTH}")]
    DepthExceeded,
}

#[derive(Debug, Clone)]
pub struct SanitizeOutcome {
    pub safe: bool,
    pub modified: bool,
    pub message: Value,
    pub violations: Vec<String>,
    pub modifications: Vec<String>,
    pub had_secrets: bool,
}

/// Filters shared read-only across every connection.
pub struct SharedFilters {
    pub ansi: AnsiFilter,
    pub whitelist: CharacterWhitelist,
    pub patterns: PatternMatcher,
    pub detector: SecretDetector,
}

impl SharedFilters {
    pub fn from_config(config: &Config) -> Result<Self, crate::config::ConfigError> {
        Ok(Self {
            ansi: AnsiFilter::new(&config.sanitization.ansi_escapes),
            whitelist: CharacterWhitelist::new(&config.sanitization.character_whitelist),
            patterns: PatternMatcher::new(&config.sanitization.patterns)?,
            detector: SecretDetector::new(&config.api_key_protection.detection)?,
        })
    }
}

pub struct Sanitizer {
    connection_id: String,
    strict_mode: bool,
    secret_protection: bool,
    max_prompt_length: usize,
    max_param_value_length: usize,
    max_tool_name_length: usize,
    tool_name_re: Regex,
    strip_html: bool,
    strip_scripts: bool,
    html_re: Regex,
    script_re: Regex,
    filters: Arc<SharedFilters>,
    vault: SecretVault,
    placeholder_re: Regex,
    events: EventSender,
}

impl Sanitizer {
    pub fn new(
        config: &Config,
        connection_id: &str,
        filters: Arc<SharedFilters>,
        vault_key: Arc<VaultKey>,
        events: EventSender,
    ) -> Self {
        let storage = &config.api_key_protection.storage;
        let validation = &config.sanitization.validation;
        let vault = SecretVault::new(
            vault_key,
            storage.encryption,
            Duration::from_secs(storage.ttl),
            storage.max_keys_per_connection,
        );
        Self {
            connection_id: connection_id.to_string(),
            strict_mode: config.sanitization.strict_mode,
            secret_protection: config.api_key_protection.enabled,
            max_prompt_length: validation.max_prompt_length,
            max_param_value_length: validation.max_param_value_length,
            max_tool_name_length: validation.max_tool_name_length,
            tool_name_re: Regex::new(&validation.fields.tool_name.pattern)
                .expect("tool name pattern validated at startup"),
            strip_html: validation.fields.tool_params.strip_html,
            strip_scripts: validation.fields.tool_params.strip_scripts,
            html_re: Regex::new(r"(?s)<[^>]+>").expect("static regex"),
            script_re: Regex::new(r"(?is)<\s*script[^>]*>.*?<\s*/\s*script\s*>|<\s*script[^>]*/?>")
                .expect("static regex"),
            filters,
            vault,
            placeholder_re: Regex::new(PLACEHOLDER_PATTERN).expect("static regex"),
            events,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Full pipeline pass over one message.
    pub fn sanitize_message(
        &mut self,
        msg: &Value,
        direction: Direction,
    ) -> Result<SanitizeOutcome, SanitizeError> {
        let mut violations: Vec<String> = Vec::new();
        let mut modifications: Vec<String> = Vec::new();
        let mut had_secrets = false;

        // Step 1: secret substitution, ingress only. The server's
        // outbound text is never mined for new secrets.
        let mut working = msg.clone();
        if direction == Direction::ClientToServer && self.secret_protection {
            let method = method_of(msg);
            let substituted = self.substitute_secrets(&working, method.as_deref(), 0)?;
            if substituted.changed {
                had_secrets = true;
                push_unique(&mut modifications, "secrets_substituted");
            }
            working = substituted.value;
        }

        // Step 2: deep sanitize every string leaf and object key.
        let mut walk = Walk {
            violations: &mut violations,
            modifications: &mut modifications,
            changed: false,
        };
        let sanitized = self.deep_sanitize(&working, None, 0, &mut walk)?;
        let mut modified = walk.changed || had_secrets;

        // Method name validation happens on the assembled message so the
        // checked name is the one that will be forwarded.
        if let Some(method) = method_of(&sanitized) {
            if method.chars().count() > self.max_tool_name_length
                || !self.tool_name_re.is_match(&method)
            {
                push_unique(&mut violations, "invalid_method_name");
                modified = true;
            }
        }

        // Step 3: safety decision.
        let safe = violations.is_empty() || !self.strict_mode;
        Ok(SanitizeOutcome {
            safe,
            modified,
            message: sanitized,
            violations,
            modifications,
            had_secrets,
        })
    }

    /// Swap placeholders back to originals. Applied by the server leg
    /// immediately before transmission downstream. Foreign and expired
    /// placeholders stay literal.
    pub fn resubstitute(&mut self, msg: &Value) -> (Value, bool) {
        let mut changed = false;
        let value = self.resubstitute_value(msg, 0, &mut changed);
        (value, changed)
    }

    /// Connection teardown: drop this connection's vault records.
    pub fn cleanup(&mut self) {
        self.vault.remove_all(&self.connection_id);
    }

    /// Periodic TTL sweep, driven by the connection task timer.
    pub fn sweep_vault(&mut self) -> usize {
        self.vault.sweep()
    }

    pub fn vault(&mut self) -> &mut SecretVault {
        &mut self.vault
    }

    fn substitute_secrets(
        &mut self,
        value: &Value,
        method: Option<&str>,
        depth: usize,
    ) -> Result<Substituted, SanitizeError> {
        if depth > MAX_DEPTH {
            return Err(SanitizeError::DepthExceeded);
        }
        match value {
            Value::String(s) => {
                let detector = Arc::clone(&self.filters);
                let connection_id = self.connection_id.clone();
                let mut changed = false;
                let replaced = detector.detector.replace(s, |secret, secret_type| {
                    match self.vault.store(secret, &connection_id, Some(secret_type)) {
                        Ok(placeholder) => {
                            changed = true;
                            self.events.emit(SecurityEvent::new(
                                SecurityEventKind::SecretSubstituted,
                                &connection_id,
                                EventDetails {
                                    method: method.map(|m| m.to_string()),
                                    placeholder: Some(placeholder.clone()),
                                    secret_type: Some(secret_type.to_string()),
                                    ..Default::default()
                                },
                            ));
                            Some(placeholder)
                        }
                        Err(VaultError::CapacityExceeded { .. }) => {
                            // Fail closed: refuse the substitution. The
                            // plaintext continues through the filter
                            // chain like any other string.
                            warn!(
                                connection_id = %connection_id,
                                secret_type,
                                "vault capacity exceeded; substitution refused"
                            );
                            self.events.emit(SecurityEvent::new(
                                SecurityEventKind::SecretSubstituted,
                                &connection_id,
                                EventDetails {
                                    method: method.map(|m| m.to_string()),
                                    secret_type: Some(secret_type.to_string()),
                                    note: Some("substitution refused: capacity exceeded".into()),
                                    ..Default::default()
                                },
                            ));
                            None
                        }
                        Err(e) => {
                            warn!(connection_id = %connection_id, error = %e, "vault store failed");
                            None
                        }
                    }
                });
                Ok(Substituted { value: Value::String(replaced), changed })
            }
            Value::Array(items) => {
                let mut changed = false;
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    let sub = self.substitute_secrets(item, method, depth + 1)?;
                    changed |= sub.changed;
                    out.push(sub.value);
                }
                Ok(Substituted { value: Value::Array(out), changed })
            }
            Value::Object(map) => {
                let mut changed = false;
                let mut out = serde_json::Map::new();
                for (key, item) in map {
                    let sub = self.substitute_secrets(item, method, depth + 1)?;
                    changed |= sub.changed;
                    out.insert(key.clone(), sub.value);
                }
                Ok(Substituted { value: Value::Object(out), changed })
            }
            other => Ok(Substituted { value: other.clone(), changed: false }),
        }
    }

    fn deep_sanitize(
        &self,
        value: &Value,
        key_hint: Option<&str>,
        depth: usize,
        walk: &mut Walk<'_>,
    ) -> Result<Value, SanitizeError> {
        if depth > MAX_DEPTH {
            return Err(SanitizeError::DepthExceeded);
        }
        match value {
            Value::String(s) => {
                let out = self.sanitize_text(s, key_hint, true, walk);
                Ok(Value::String(out))
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.deep_sanitize(item, key_hint, depth + 1, walk)?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (key, item) in map {
                    let clean_key = self.sanitize_text(key, None, false, walk);
                    if clean_key.is_empty() {
                        // A key erased by filtering takes its value with it.
                        push_unique(walk.modifications, "empty_key_dropped");
                        walk.changed = true;
                        continue;
                    }
                    let clean_value = self.deep_sanitize(item, Some(&clean_key), depth + 1, walk)?;
                    out.insert(clean_key, clean_value);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Per-string chain: ANSI → whitelist → pattern rules → field
    /// validation. `truncate` is false for object keys.
    fn sanitize_text(
        &self,
        s: &str,
        key_hint: Option<&str>,
        truncate: bool,
        walk: &mut Walk<'_>,
    ) -> String {
        let mut text = s.to_string();

        let ansi = self.filters.ansi.filter(&text);
        if ansi.removed {
            push_unique(walk.violations, "ansi_sequences_removed");
            push_unique(walk.modifications, "ansi_sequences_removed");
            walk.changed = true;
        }
        text = ansi.out;

        let wl = self.filters.whitelist.filter(&text);
        for violation in &wl.violations {
            push_unique(walk.violations, violation.as_str());
            push_unique(walk.modifications, violation.as_str());
            walk.changed = true;
        }
        text = wl.out;

        let check = self.filters.patterns.check(&text, key_hint);
        for hit in &check.matches {
            match hit.action {
                RuleAction::Reject => {
                    push_unique(walk.violations, &hit.name);
                }
                RuleAction::Strip => {
                    push_unique(walk.modifications, &hit.name);
                }
                RuleAction::Log => {
                    self.events.emit(SecurityEvent::new(
                        SecurityEventKind::PatternMatch,
                        &self.connection_id,
                        EventDetails {
                            method: key_hint.map(|k| k.to_string()),
                            violations: vec![hit.name.clone()],
                            ..Default::default()
                        },
                    ));
                }
            }
        }
        if check.sanitized != text {
            walk.changed = true;
            text = check.sanitized;
        }

        if self.strip_scripts {
            let stripped = self.script_re.replace_all(&text, "");
            if stripped != text {
                push_unique(walk.modifications, "scripts_stripped");
                walk.changed = true;
                text = stripped.into_owned();
            }
        }
        if self.strip_html {
            let stripped = self.html_re.replace_all(&text, "");
            if stripped != text {
                push_unique(walk.modifications, "html_stripped");
                walk.changed = true;
                text = stripped.into_owned();
            }
        }

        if truncate {
            let limit = if key_hint == Some("prompt") {
                self.max_prompt_length
            } else {
                self.max_param_value_length
            };
            if text.chars().count() > limit {
                text = text.chars().take(limit).collect();
                push_unique(walk.modifications, "value_truncated");
                walk.changed = true;
            }
        }

        text
    }

    fn resubstitute_value(&mut self, value: &Value, depth: usize, changed: &mut bool) -> Value {
        if depth > MAX_DEPTH {
            return value.clone();
        }
        match value {
            Value::String(s) => {
                if SecretVault::is_placeholder(s) {
                    match self.lookup(s) {
                        Some(secret) => {
                            *changed = true;
                            Value::String(secret)
                        }
                        None => value.clone(),
                    }
                } else if s.contains(PLACEHOLDER_PREFIX) {
                    let re = self.placeholder_re.clone();
                    let out = re.replace_all(s, |caps: &regex::Captures<'_>| {
                        let placeholder = caps.get(0).map(|m| m.as_str()).unwrap_or("");
                        match self.lookup(placeholder) {
                            Some(secret) => {
                                *changed = true;
                                secret
                            }
                            None => placeholder.to_string(),
                        }
                    });
                    Value::String(out.into_owned())
                } else {
                    value.clone()
                }
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.resubstitute_value(item, depth + 1, changed))
                    .collect(),
            ),
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (key, item) in map {
                    out.insert(key.clone(), self.resubstitute_value(item, depth + 1, changed));
                }
                Value::Object(out)
            }
            other => other.clone(),
        }
    }

    fn lookup(&mut self, placeholder: &str) -> Option<String> {
        let connection_id = self.connection_id.clone();
        match self.vault.retrieve_checked(placeholder, &connection_id) {
            RetrieveOutcome::Found(secret) => Some(secret),
            RetrieveOutcome::WrongConnection => {
                self.events.emit(SecurityEvent::new(
                    SecurityEventKind::UnauthorizedVaultAccess,
                    &connection_id,
                    EventDetails {
                        placeholder: Some(placeholder.to_string()),
                        ..Default::default()
                    },
                ));
                None
            }
            RetrieveOutcome::DecryptFailed => {
                // Fail closed; the literal placeholder goes downstream.
                warn!(placeholder, "resubstitution decrypt failure");
                None
            }
            RetrieveOutcome::Unknown | RetrieveOutcome::Expired => None,
        }
    }
}

struct Substituted {
    value: Value,
    changed: bool,
}

struct Walk<'a> {
    violations: &'a mut Vec<String>,
    modifications: &'a mut Vec<String>,
    changed: bool,
}

fn method_of(msg: &Value) -> Option<String> {
    msg.get("method").and_then(|m| m.as_str()).map(|m| m.to_string())
}

fn push_unique(list: &mut Vec<String>, tag: &str) {
    if !list.iter().any(|t| t == tag) {
        list.push(tag.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_channel;
    use serde_json::json;

    fn sanitizer_with(config: Config) -> Sanitizer {
        let filters = Arc::new(SharedFilters::from_config(&config).unwrap());
        let key = Arc::new(VaultKey::derive(b"sanitizer-test-secret").unwrap());
        let (events, _rx) = event_channel();
        Sanitizer::new(&config, "conn-1", filters, key, events)
    }

    fn default_sanitizer() -> Sanitizer {
        sanitizer_with(Config::default())
    }

    const KEY: &str = "sk-aBc123XyZ456DefGhi789JklMno012PqrStu345VwxYz678";

    #[test]
    fn ansi_stripped_from_params() {
        let mut sanitizer = default_sanitizer();
        let msg = json!({"jsonrpc":"2.0","method":"echo","params":{"t":"\u{1b}[31mRED\u{1b}[0m"},"id":1});
        let outcome = sanitizer.sanitize_message(&msg, Direction::ClientToServer).unwrap();
        assert_eq!(outcome.message["params"]["t"], "RED");
        assert!(outcome.modified);
        assert!(outcome.safe);
        assert_eq!(outcome.violations, vec!["ansi_sequences_removed"]);
    }

    #[test]
    fn sanitize_is_idempotent() {
        let mut sanitizer = default_sanitizer();
        let msg = json!({"jsonrpc":"2.0","method":"echo","params":{"t":"\u{1b}[31mRED\u{1b}[0m x\u{200B}y"},"id":1});
        let once = sanitizer.sanitize_message(&msg, Direction::ClientToServer).unwrap();
        let twice = sanitizer
            .sanitize_message(&once.message, Direction::ClientToServer)
            .unwrap();
        assert_eq!(once.message, twice.message);
        assert!(!twice.modified);
    }

    #[test]
    fn strict_mode_blocks_command_injection() {
        let mut config = Config::default();
        config.sanitization.strict_mode = true;
        let mut sanitizer = sanitizer_with(config);
        let msg = json!({"jsonrpc":"2.0","method":"tools/execute","params":{"input":"ls; cat /etc/passwd"},"id":7});
        let outcome = sanitizer.sanitize_message(&msg, Direction::ClientToServer).unwrap();
        assert!(!outcome.safe);
        assert!(outcome.violations.iter().any(|v| v == "command_injection"));
    }

    #[test]
    fn non_strict_records_but_allows() {
        let mut sanitizer = default_sanitizer();
        let msg = json!({"jsonrpc":"2.0","method":"tools/execute","params":{"input":"ls; cat /etc/passwd"},"id":7});
        let outcome = sanitizer.sanitize_message(&msg, Direction::ClientToServer).unwrap();
        assert!(outcome.safe);
        assert!(outcome.violations.iter().any(|v| v == "command_injection"));
    }

    #[test]
    fn secret_substituted_and_round_tripped() {
        let mut sanitizer = default_sanitizer();
        let msg = json!({"jsonrpc":"2.0","method":"call","params":{"k":KEY},"id":2});
        let outcome = sanitizer.sanitize_message(&msg, Direction::ClientToServer).unwrap();
        assert!(outcome.had_secrets);
        let substituted = outcome.message["params"]["k"].as_str().unwrap();
        assert!(SecretVault::is_placeholder(substituted));

        let (restored, changed) = sanitizer.resubstitute(&outcome.message);
        assert!(changed);
        assert_eq!(restored["params"]["k"], KEY);
    }

    #[test]
    fn same_secret_twice_gets_stable_placeholder() {
        let mut sanitizer = default_sanitizer();
        let msg = json!({"jsonrpc":"2.0","method":"call","params":{"a":KEY,"b":KEY},"id":3});
        let outcome = sanitizer.sanitize_message(&msg, Direction::ClientToServer).unwrap();
        assert_eq!(
            outcome.message["params"]["a"],
            outcome.message["params"]["b"]
        );
    }

    #[test]
    fn server_to_client_never_stores_secrets() {
        let mut sanitizer = default_sanitizer();
        let msg = json!({"jsonrpc":"2.0","result":{"data":KEY},"id":4});
        let outcome = sanitizer.sanitize_message(&msg, Direction::ServerToClient).unwrap();
        assert!(!outcome.had_secrets);
        assert_eq!(outcome.message["result"]["data"], KEY);
        assert_eq!(sanitizer.vault().len(), 0);
    }

    #[test]
    fn placeholder_embedded_in_text_is_resubstituted() {
        let mut sanitizer = default_sanitizer();
        let msg = json!({"jsonrpc":"2.0","method":"call","params":{"k":KEY},"id":5});
        let outcome = sanitizer.sanitize_message(&msg, Direction::ClientToServer).unwrap();
        let placeholder = outcome.message["params"]["k"].as_str().unwrap().to_string();

        let wrapped = json!({"note": format!("use {placeholder} here")});
        let (restored, changed) = sanitizer.resubstitute(&wrapped);
        assert!(changed);
        assert_eq!(
            restored["note"].as_str().unwrap(),
            format!("use {KEY} here")
        );
    }

    #[test]
    fn unknown_placeholder_left_literal() {
        let mut sanitizer = default_sanitizer();
        let msg = json!({"k":"MCPROXY_KEY_0123456789ABCDEF0123456789ABCDEF"});
        let (restored, changed) = sanitizer.resubstitute(&msg);
        assert!(!changed);
        assert_eq!(restored, msg);
    }

    #[test]
    fn zero_width_and_unicode_removed() {
        let mut sanitizer = default_sanitizer();
        let msg = json!({"jsonrpc":"2.0","method":"echo","params":{"t":"a\u{200B}b \u{4E2D}"},"id":6});
        let outcome = sanitizer.sanitize_message(&msg, Direction::ClientToServer).unwrap();
        assert_eq!(outcome.message["params"]["t"], "ab ");
        assert!(outcome.violations.iter().any(|v| v == "zero_width_removed"));
        assert!(outcome.violations.iter().any(|v| v == "unicode_removed"));
    }

    #[test]
    fn emptied_key_drops_entry() {
        let mut sanitizer = default_sanitizer();
        let msg = json!({"jsonrpc":"2.0","method":"echo","params":{"\u{200B}\u{200C}":"gone","ok":"kept"},"id":8});
        let outcome = sanitizer.sanitize_message(&msg, Direction::ClientToServer).unwrap();
        let params = outcome.message["params"].as_object().unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params["ok"], "kept");
        assert!(outcome.modifications.iter().any(|m| m == "empty_key_dropped"));
    }

    #[test]
    fn depth_overflow_is_rejected() {
        let mut sanitizer = default_sanitizer();
        let mut msg = json!("leaf");
        for _ in 0..(MAX_DEPTH + 2) {
            msg = json!([msg]);
        }
        assert!(matches!(
            sanitizer.sanitize_message(&msg, Direction::ClientToServer),
            Err(SanitizeError::DepthExceeded)
        ));
    }

    #[test]
    fn long_param_value_truncated() {
        let mut config = Config::default();
        config.sanitization.validation.max_param_value_length = 16;
        let mut sanitizer = sanitizer_with(config);
        let msg = json!({"jsonrpc":"2.0","method":"echo","params":{"t":"x".repeat(64)},"id":9});
        let outcome = sanitizer.sanitize_message(&msg, Direction::ClientToServer).unwrap();
        assert_eq!(outcome.message["params"]["t"].as_str().unwrap().len(), 16);
        assert!(outcome.modifications.iter().any(|m| m == "value_truncated"));
    }

    #[test]
    fn bad_method_name_is_a_violation() {
        let mut config = Config::default();
        config.sanitization.strict_mode = true;
        let mut sanitizer = sanitizer_with(config);
        let msg = json!({"jsonrpc":"2.0","method":"rm -rf *","params":{},"id":10});
        let outcome = sanitizer.sanitize_message(&msg, Direction::ClientToServer).unwrap();
        assert!(outcome.violations.iter().any(|v| v == "invalid_method_name"));
        assert!(!outcome.safe);
    }

    #[test]
    fn script_fragment_stripped_from_params() {
        let mut sanitizer = default_sanitizer();
        let msg = json!({"jsonrpc":"2.0","method":"echo","params":{"t":"hi<script>alert(1)</script>!"},"id":11});
        let outcome = sanitizer.sanitize_message(&msg, Direction::ClientToServer).unwrap();
        assert_eq!(outcome.message["params"]["t"], "hi!");
    }

    #[test]
    fn cleanup_empties_the_vault() {
        let mut sanitizer = default_sanitizer();
        let msg = json!({"jsonrpc":"2.0","method":"call","params":{"k":KEY},"id":12});
        let outcome = sanitizer.sanitize_message(&msg, Direction::ClientToServer).unwrap();
        let placeholder = outcome.message["params"]["k"].as_str().unwrap().to_string();
        sanitizer.cleanup();
        let (restored, changed) = sanitizer.resubstitute(&json!({ "k": placeholder }));
        assert!(!changed);
        assert!(SecretVault::is_placeholder(restored["k"].as_str().unwrap()));
    }
}
