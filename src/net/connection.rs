//! Per-connection task
//!
//! One task drives both legs of a proxied session. Keeping the pump in
//! a single task gives the ordering guarantees for free: a client
//! message is fully forwarded (or dropped) before the next one is
//! looked at, and the sanitizer's vault is only ever touched from
//! here, so substitution and re-substitution need no locking.
//!
//! Suspension points: transport reads, transport writes, the reconnect
//! backoff timer, the keep-alive timer, and the vault sweep timer.
//! Everything else is synchronous.

use crate::config::Config;
use crate::events::{EventDetails, EventSender, SecurityEvent, SecurityEventKind};
use crate::filter::{Direction, SanitizeError, Sanitizer, SharedFilters};
use crate::net::client::ClientLeg;
use crate::net::jsonrpc;
use crate::net::rate_limit::{RateDecision, RateLimiter};
use crate::net::server::{SendStatus, ServerLeg, ServerLegError, KEEPALIVE_INTERVAL_SECS};
use crate::secrets::vault::{VaultKey, SWEEP_INTERVAL_SECS};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

/// Traffic counters shared with the coordinator's connection table.
#[derive(Debug, Default)]
pub struct ConnectionCounters {
    pub messages_in: AtomicU64,
    pub messages_out: AtomicU64,
    pub violations: AtomicU64,
    pub secrets_substituted: AtomicU64,
}

impl ConnectionCounters {
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.messages_in.load(Ordering::Relaxed),
            self.messages_out.load(Ordering::Relaxed),
            self.violations.load(Ordering::Relaxed),
            self.secrets_substituted.load(Ordering::Relaxed),
        )
    }
}

/// Drive one proxied session to completion.
#[allow(clippy::too_many_arguments)]
pub async fn run_connection(
    connection_id: String,
    stream: TcpStream,
    config: Arc<Config>,
    filters: Arc<SharedFilters>,
    vault_key: Arc<VaultKey>,
    limiter: Arc<RateLimiter>,
    events: EventSender,
    counters: Arc<ConnectionCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    let handshake_timeout = Duration::from_secs(config.proxy.connection_timeout);
    let mut client = match ClientLeg::accept(
        stream,
        &connection_id,
        handshake_timeout,
        config.proxy.max_message_size,
    )
    .await
    {
        Ok(client) => client,
        Err(e) => {
            warn!(connection_id = %connection_id, error = %e, "client accept failed");
            return;
        }
    };

    let mut sanitizer = Sanitizer::new(&config, &connection_id, filters, vault_key, events.clone());
    let mut server = ServerLeg::new(&config.proxy, &connection_id);
    server.connect().await;

    let mut sweep = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    sweep.tick().await; // first tick fires immediately; skip it
    let mut keepalive = tokio::time::interval(Duration::from_secs(KEEPALIVE_INTERVAL_SECS));
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keepalive.tick().await;

    info!(connection_id = %connection_id, "session forwarding");

    loop {
        if server.is_closed() {
            // Reconnect attempts exhausted: tear the session down.
            let reply = jsonrpc::error_response(
                Value::Null,
                jsonrpc::INTERNAL_ERROR,
                jsonrpc::MSG_SERVER_UNAVAILABLE,
            );
            let _ = client.send_value(&reply).await;
            break;
        }

        let server_connected = server.is_connected();
        let retry_at = server.retry_deadline();
        let retry_deadline =
            retry_at.unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            _ = shutdown.changed() => {
                debug!(connection_id = %connection_id, "shutdown signal");
                break;
            }

            frame = client.next_frame() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_client_text(
                            &text,
                            &connection_id,
                            &config,
                            &mut client,
                            &mut server,
                            &mut sanitizer,
                            &limiter,
                            &events,
                            &counters,
                        )
                        .await;
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        // One JSON-RPC message per text frame; binary is
                        // a protocol violation.
                        let _ = client.send_value(&jsonrpc::parse_error()).await;
                    }
                    Some(Ok(WsMessage::Ping(payload))) => client.pong(payload).await,
                    Some(Ok(WsMessage::Pong(_))) | Some(Ok(WsMessage::Frame(_))) => {}
                    Some(Ok(WsMessage::Close(_))) | None => {
                        debug!(connection_id = %connection_id, "client closed");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(connection_id = %connection_id, error = %e, "client read error");
                        break;
                    }
                }
            }

            frame = server.next_frame(), if server_connected => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_server_text(
                            &text,
                            &connection_id,
                            &mut client,
                            &mut sanitizer,
                            &events,
                            &counters,
                        )
                        .await;
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        warn!(connection_id = %connection_id, "binary frame from server dropped");
                    }
                    Some(Ok(WsMessage::Ping(payload))) => server.pong(payload).await,
                    Some(Ok(WsMessage::Pong(_))) | Some(Ok(WsMessage::Frame(_))) => {}
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!(connection_id = %connection_id, "server closed unexpectedly");
                        server.on_disconnect();
                    }
                    Some(Err(e)) => {
                        warn!(connection_id = %connection_id, error = %e, "server read error");
                        server.on_disconnect();
                    }
                }
            }

            _ = tokio::time::sleep_until(retry_deadline), if retry_at.is_some() => {
                server.reconnect().await;
            }

            _ = sweep.tick() => {
                sanitizer.sweep_vault();
            }

            _ = keepalive.tick() => {
                server.keepalive().await;
            }
        }
    }

    // Teardown: close both legs, then drop this connection's vault
    // records so its key material dies with the session.
    client.close().await;
    server.close().await;
    sanitizer.cleanup();
    info!(connection_id = %connection_id, "session closed");
}

#[allow(clippy::too_many_arguments)]
async fn handle_client_text(
    text: &str,
    connection_id: &str,
    config: &Config,
    client: &mut ClientLeg,
    server: &mut ServerLeg,
    sanitizer: &mut Sanitizer,
    limiter: &RateLimiter,
    events: &EventSender,
    counters: &ConnectionCounters,
) {
    counters.messages_in.fetch_add(1, Ordering::Relaxed);
    client.messages_in += 1;

    if text.len() > config.sanitization.validation.max_message_size {
        warn!(
            connection_id,
            size = text.len(),
            limit = config.sanitization.validation.max_message_size,
            "oversized message rejected"
        );
        let _ = client.send_value(&jsonrpc::invalid_message(Value::Null)).await;
        return;
    }

    let parsed: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => {
            let _ = client.send_value(&jsonrpc::parse_error()).await;
            return;
        }
    };

    if jsonrpc::validate(&parsed).is_err() {
        let reply = jsonrpc::invalid_message(jsonrpc::recoverable_id(&parsed));
        let _ = client.send_value(&reply).await;
        return;
    }

    let id = jsonrpc::recoverable_id(&parsed);
    let method = jsonrpc::method(&parsed).map(|m| m.to_string());

    if let RateDecision::Throttled { scope } = limiter.check(connection_id, method.as_deref()) {
        events.emit(SecurityEvent::new(
            SecurityEventKind::RateLimitExceeded,
            connection_id,
            EventDetails {
                method: method.clone(),
                scope: Some(scope),
                ..Default::default()
            },
        ));
        let reply =
            jsonrpc::error_response(id, jsonrpc::INTERNAL_ERROR, jsonrpc::MSG_RATE_LIMITED);
        let _ = client.send_value(&reply).await;
        return;
    }

    let outcome = match sanitizer.sanitize_message(&parsed, Direction::ClientToServer) {
        Ok(outcome) => outcome,
        Err(SanitizeError::DepthExceeded) => {
            let reply = jsonrpc::invalid_message(id);
            let _ = client.send_value(&reply).await;
            return;
        }
    };

    if outcome.had_secrets {
        counters.secrets_substituted.fetch_add(1, Ordering::Relaxed);
    }
    if !outcome.violations.is_empty() {
        client.violations += outcome.violations.len() as u64;
        counters
            .violations
            .fetch_add(outcome.violations.len() as u64, Ordering::Relaxed);
        if !outcome.safe {
            events.emit(SecurityEvent::new(
                SecurityEventKind::SanitizationBlocked,
                connection_id,
                EventDetails {
                    method,
                    violations: outcome.violations.clone(),
                    ..Default::default()
                },
            ));
            let reply =
                jsonrpc::error_response(id, jsonrpc::INTERNAL_ERROR, jsonrpc::MSG_FORBIDDEN);
            let _ = client.send_value(&reply).await;
            return;
        }
        // Non-strict mode: recorded, reported, forwarded anyway.
        events.emit(SecurityEvent::new(
            SecurityEventKind::PatternMatch,
            connection_id,
            EventDetails {
                method: method.clone(),
                violations: outcome.violations.clone(),
                ..Default::default()
            },
        ));
    }

    match server.send(sanitizer, &outcome.message).await {
        Ok(SendStatus::Sent) => {
            counters.messages_out.fetch_add(1, Ordering::Relaxed);
        }
        Ok(SendStatus::Queued) => {
            debug!(connection_id, queued = server.queue_len(), "message queued");
        }
        Ok(SendStatus::Dropped) => {}
        Err(ServerLegError::Closed) => {
            let reply = jsonrpc::error_response(
                id,
                jsonrpc::INTERNAL_ERROR,
                jsonrpc::MSG_SERVER_UNAVAILABLE,
            );
            let _ = client.send_value(&reply).await;
        }
    }
}

async fn handle_server_text(
    text: &str,
    connection_id: &str,
    client: &mut ClientLeg,
    sanitizer: &mut Sanitizer,
    events: &EventSender,
    counters: &ConnectionCounters,
) {
    let parsed: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!(connection_id, error = %e, "invalid JSON from server dropped");
            return;
        }
    };
    if jsonrpc::validate(&parsed).is_err() {
        warn!(connection_id, "invalid JSON-RPC from server dropped");
        return;
    }

    // Server output runs the full filter chain too; placeholders pass
    // through untouched because they match no dangerous pattern, and
    // this direction never mines for new secrets.
    let outcome = match sanitizer.sanitize_message(&parsed, Direction::ServerToClient) {
        Ok(outcome) => outcome,
        Err(SanitizeError::DepthExceeded) => {
            warn!(connection_id, "over-deep message from server dropped");
            return;
        }
    };
    if !outcome.violations.is_empty() {
        counters
            .violations
            .fetch_add(outcome.violations.len() as u64, Ordering::Relaxed);
        events.emit(SecurityEvent::new(
            SecurityEventKind::PatternMatch,
            connection_id,
            EventDetails {
                violations: outcome.violations.clone(),
                ..Default::default()
            },
        ));
    }

    if client.send_value(&outcome.message).await {
        counters.messages_out.fetch_add(1, Ordering::Relaxed);
    }
}
