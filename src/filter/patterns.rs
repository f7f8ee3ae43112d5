//! Configurable pattern rules
//!
//! An ordered rule list, each rule a case-insensitive regex with an
//! action: `reject` marks the string disallowed, `strip` removes the
//! matched text, `log` records the match and preserves the text. Rules
//! that fail to compile are construction errors — at runtime a rule
//! either matches or it does not, it never aborts.

use crate::config::{ConfigError, PatternsConfig, RuleAction, RuleConfig, Severity};
use regex::{Regex, RegexBuilder};
use tracing::debug;

/// One recorded rule match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternHit {
    pub name: String,
    pub severity: Severity,
    pub action: RuleAction,
}

#[derive(Debug, Clone)]
pub struct PatternCheck {
    pub allowed: bool,
    pub matches: Vec<PatternHit>,
    pub sanitized: String,
}

struct CompiledRule {
    name: String,
    regex: Regex,
    action: RuleAction,
    severity: Severity,
}

/// Read-only after construction; shared across connections.
pub struct PatternMatcher {
    enabled: bool,
    rules: Vec<CompiledRule>,
}

impl PatternMatcher {
    pub fn new(config: &PatternsConfig) -> Result<Self, ConfigError> {
        let rule_configs = match &config.rules {
            Some(rules) => rules.clone(),
            None => default_rules(),
        };
        let mut rules = Vec::with_capacity(rule_configs.len());
        for rc in &rule_configs {
            let regex = RegexBuilder::new(&rc.pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| ConfigError::InvalidRule {
                    name: rc.name.clone(),
                    message: e.to_string(),
                })?;
            rules.push(CompiledRule {
                name: rc.name.clone(),
                regex,
                action: rc.action,
                severity: rc.severity,
            });
        }
        Ok(Self { enabled: config.enabled, rules })
    }

    /// Evaluate all rules in order against `s`. Strip rules apply to the
    /// progressively sanitized text, so later rules see earlier edits.
    pub fn check(&self, s: &str, context: Option<&str>) -> PatternCheck {
        let mut result = PatternCheck {
            allowed: true,
            matches: Vec::new(),
            sanitized: s.to_string(),
        };
        if !self.enabled {
            return result;
        }
        for rule in &self.rules {
            let count = rule.regex.find_iter(&result.sanitized).count();
            if count == 0 {
                continue;
            }
            debug!(
                rule = %rule.name,
                matches = count,
                context = context.unwrap_or(""),
                "pattern rule matched"
            );
            for _ in 0..count {
                result.matches.push(PatternHit {
                    name: rule.name.clone(),
                    severity: rule.severity,
                    action: rule.action,
                });
            }
            match rule.action {
                RuleAction::Reject => result.allowed = false,
                RuleAction::Strip => {
                    result.sanitized = rule.regex.replace_all(&result.sanitized, "").into_owned();
                }
                RuleAction::Log => {}
            }
        }
        result
    }
}

/// Built-in rule set, used when no rules are configured.
pub fn default_rules() -> Vec<RuleConfig> {
    vec![
        RuleConfig {
            name: "command_injection".to_string(),
            pattern: r"[;&|`]\s*(?:cat|ls|rm|mv|cp|chmod|chown|curl|wget|nc|netcat|bash|sh|zsh|python|perl|ruby|php|powershell|cmd)\b|\$\([^)]*\)".to_string(),
            action: RuleAction::Reject,
            severity: Severity::Critical,
        },
        RuleConfig {
            name: "path_traversal".to_string(),
            pattern: r"(?:\.\.[/\\])+".to_string(),
            action: RuleAction::Reject,
            severity: Severity::High,
        },
        RuleConfig {
            name: "sql_injection".to_string(),
            pattern: r"\b(?:union\s+(?:all\s+)?select|insert\s+into|drop\s+(?:table|database)|delete\s+from|update\s+\w+\s+set)\b".to_string(),
            action: RuleAction::Strip,
            severity: Severity::High,
        },
        RuleConfig {
            name: "script_injection".to_string(),
            pattern: r"<\s*script[^>]*>(?s:.*?)<\s*/\s*script\s*>|<\s*script[^>]*>|javascript\s*:|\bon(?:error|load|click|mouseover)\s*=".to_string(),
            action: RuleAction::Strip,
            severity: Severity::High,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PatternsConfig;

    fn default_matcher() -> PatternMatcher {
        PatternMatcher::new(&PatternsConfig::default()).unwrap()
    }

    #[test]
    fn clean_text_allowed() {
        let check = default_matcher().check("read the file please", None);
        assert!(check.allowed);
        assert!(check.matches.is_empty());
        assert_eq!(check.sanitized, "read the file please");
    }

    #[test]
    fn command_injection_rejected() {
        let check = default_matcher().check("ls; cat /etc/passwd", None);
        assert!(!check.allowed);
        assert!(check.matches.iter().any(|m| m.name == "command_injection"));
        // Reject preserves the text; the caller decides what to do.
        assert_eq!(check.sanitized, "ls; cat /etc/passwd");
    }

    #[test]
    fn subshell_rejected() {
        let check = default_matcher().check("echo $(whoami)", None);
        assert!(!check.allowed);
    }

    #[test]
    fn path_traversal_rejected() {
        let check = default_matcher().check("open ../../etc/shadow", None);
        assert!(!check.allowed);
        assert!(check.matches.iter().any(|m| m.name == "path_traversal"));
    }

    #[test]
    fn sql_injection_stripped() {
        let check = default_matcher().check("x' UNION SELECT password FROM users", None);
        assert!(check.allowed);
        assert!(!check.sanitized.to_lowercase().contains("union select"));
        assert!(check.matches.iter().any(|m| m.name == "sql_injection"));
    }

    #[test]
    fn script_tag_stripped() {
        let check = default_matcher().check("hi<script>alert(1)</script>there", None);
        assert!(check.allowed);
        assert_eq!(check.sanitized, "hithere");
    }

    #[test]
    fn case_insensitive_matching() {
        let check = default_matcher().check("LS; CAT /etc/passwd", None);
        assert!(!check.allowed);
    }

    #[test]
    fn log_action_preserves_text() {
        let config = PatternsConfig {
            enabled: true,
            rules: Some(vec![RuleConfig {
                name: "watchword".to_string(),
                pattern: r"\bsudo\b".to_string(),
                action: RuleAction::Log,
                severity: Severity::Low,
            }]),
        };
        let matcher = PatternMatcher::new(&config).unwrap();
        let check = matcher.check("please sudo make me a sandwich", None);
        assert!(check.allowed);
        assert_eq!(check.sanitized, "please sudo make me a sandwich");
        assert_eq!(check.matches.len(), 1);
    }

    #[test]
    fn invalid_rule_fails_construction() {
        let config = PatternsConfig {
            enabled: true,
            rules: Some(vec![RuleConfig {
                name: "broken".to_string(),
                pattern: "(oops".to_string(),
                action: RuleAction::Log,
                severity: Severity::Low,
            }]),
        };
        assert!(PatternMatcher::new(&config).is_err());
    }

    #[test]
    fn disabled_matcher_passes_everything() {
        let config = PatternsConfig { enabled: false, rules: None };
        let matcher = PatternMatcher::new(&config).unwrap();
        let check = matcher.check("ls; cat /etc/passwd", None);
        assert!(check.allowed);
        assert!(check.matches.is_empty());
    }
}
