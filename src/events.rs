//! Security events
//!
//! Every recovered policy decision (rate limit, sanitization block,
//! secret substitution, vault denial, pattern match) is reported to the
//! coordinator over a typed channel. Event details carry scrubbed
//! context only — method names, violation tags, placeholders. Raw
//! secrets never enter an event.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    RateLimitExceeded,
    SanitizationBlocked,
    SecretSubstituted,
    UnauthorizedVaultAccess,
    PatternMatch,
}

impl SecurityEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventKind::RateLimitExceeded => "rate_limit_exceeded",
            SecurityEventKind::SanitizationBlocked => "sanitization_blocked",
            SecurityEventKind::SecretSubstituted => "secret_substituted",
            SecurityEventKind::UnauthorizedVaultAccess => "unauthorized_vault_access",
            SecurityEventKind::PatternMatch => "pattern_match",
        }
    }
}

/// Scrubbed event context. All fields optional; absent fields are
/// omitted from the serialized record.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<String>,
    /// The placeholder involved, never the secret behind it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    pub kind: SecurityEventKind,
    pub connection_id: String,
    pub timestamp: DateTime<Utc>,
    pub details: EventDetails,
}

impl SecurityEvent {
    pub fn new(kind: SecurityEventKind, connection_id: &str, details: EventDetails) -> Self {
        Self {
            kind,
            connection_id: connection_id.to_string(),
            timestamp: Utc::now(),
            details,
        }
    }
}

/// Cloneable sender handed to every connection task. Unbounded because
/// events are emitted from synchronous pipeline code that must not
/// block; the sink drains continuously.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<SecurityEvent>,
}

impl EventSender {
    pub fn emit(&self, event: SecurityEvent) {
        // Receiver gone only during shutdown; losing late events is fine.
        let _ = self.tx.send(event);
    }
}

/// Create the event channel. The receiver side belongs to the
/// coordinator's sink task.
pub fn event_channel() -> (EventSender, mpsc::UnboundedReceiver<SecurityEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}

/// Default sink: structured warn-level log per event.
pub async fn run_event_sink(mut rx: mpsc::UnboundedReceiver<SecurityEvent>) {
    while let Some(event) = rx.recv().await {
        let details = serde_json::to_string(&event.details).unwrap_or_default();
        warn!(
            kind = event.kind.as_str(),
            connection_id = %event.connection_id,
            timestamp = %event.timestamp.to_rfc3339(),
            details = %details,
            "security event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_flow_through_channel() {
        let (tx, mut rx) = event_channel();
        tx.emit(SecurityEvent::new(
            SecurityEventKind::RateLimitExceeded,
            "conn-1",
            EventDetails {
                method: Some("tools/call".to_string()),
                scope: Some("client:minute".to_string()),
                ..Default::default()
            },
        ));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, SecurityEventKind::RateLimitExceeded);
        assert_eq!(event.connection_id, "conn-1");
        assert_eq!(event.details.method.as_deref(), Some("tools/call"));
    }

    #[test]
    fn details_serialization_omits_empty_fields() {
        let details = EventDetails {
            placeholder: Some("MCPROXY_KEY_0123456789ABCDEF0123456789ABCDEF".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&details).unwrap();
        assert!(json.contains("placeholder"));
        assert!(!json.contains("method"));
        assert!(!json.contains("violations"));
    }
}
