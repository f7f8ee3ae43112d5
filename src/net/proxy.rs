//! Proxy coordinator
//!
//! Owns the listener, mints connection ids, enforces the connection
//! cap, and fans security events into the log sink. Each accepted
//! session runs as an independent task registered in the connection
//! table; shutdown flips a watch flag that every task observes.

use crate::config::{Config, ConfigError};
use crate::events::{event_channel, run_event_sink, EventSender};
use crate::filter::SharedFilters;
use crate::net::client::ClientLeg;
use crate::net::connection::{run_connection, ConnectionCounters};
use crate::net::rate_limit::RateLimiter;
use crate::secrets::vault::{VaultError, VaultKey};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

/// Interval for stats logging, limiter GC, and table reaping.
const HOUSEKEEPING_INTERVAL_SECS: u64 = 60;

/// How long shutdown waits for connection tasks to finish.
const SHUTDOWN_GRACE_SECS: u64 = 5;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Vault(#[from] VaultError),
}

/// Point-in-time aggregate over all connections.
#[derive(Debug, Clone, Default)]
pub struct ProxyStats {
    pub active_connections: usize,
    pub total_connections: u64,
    pub messages_in: u64,
    pub messages_out: u64,
    pub violations: u64,
    pub secrets_substituted: u64,
}

struct ConnectionRecord {
    counters: Arc<ConnectionCounters>,
    created_at: Instant,
}

pub struct Proxy {
    config: Arc<Config>,
    filters: Arc<SharedFilters>,
    vault_key: Arc<VaultKey>,
    limiter: Arc<RateLimiter>,
    connections: Arc<Mutex<HashMap<String, ConnectionRecord>>>,
    /// Counters absorbed from connections that have already closed.
    lifetime: Arc<ConnectionCounters>,
    next_id: AtomicU64,
    total_accepted: AtomicU64,
    events: EventSender,
    events_rx: Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<crate::events::SecurityEvent>>>,
}

impl Proxy {
    /// Fatal-at-startup work happens here: config validation, pattern
    /// compilation, and AEAD key derivation.
    pub fn new(config: Config) -> Result<Self, ProxyError> {
        config.validate()?;
        let filters = Arc::new(SharedFilters::from_config(&config)?);
        let vault_key = Arc::new(VaultKey::from_env_or_random()?);
        let limiter = Arc::new(RateLimiter::new(&config.rate_limiting));
        let (events, events_rx) = event_channel();
        Ok(Self {
            config: Arc::new(config),
            filters,
            vault_key,
            limiter,
            connections: Arc::new(Mutex::new(HashMap::new())),
            lifetime: Arc::new(ConnectionCounters::default()),
            next_id: AtomicU64::new(0),
            total_accepted: AtomicU64::new(0),
            events,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), ProxyError> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr).await.map_err(|source| ProxyError::Bind {
            addr: addr.clone(),
            source,
        })?;
        info!(addr = %addr, "proxy listening");
        self.serve(listener, shutdown).await
    }

    /// Serve on an already-bound listener (lets tests use an ephemeral
    /// port).
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ProxyError> {
        if let Some(events_rx) = self.events_rx.lock().expect("events lock").take() {
            tokio::spawn(run_event_sink(events_rx));
        }

        let mut housekeeping =
            tokio::time::interval(Duration::from_secs(HOUSEKEEPING_INTERVAL_SECS));
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        housekeeping.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("shutdown requested");
                    break;
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let active = self.connections.lock().expect("table lock").len();
                            if active >= self.config.proxy.max_connections {
                                warn!(%peer, active, "connection limit reached; rejecting");
                                tokio::spawn(ClientLeg::reject(stream, "connection limit reached"));
                                continue;
                            }
                            self.spawn_connection(stream, shutdown.clone());
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    }
                }

                _ = housekeeping.tick() => {
                    let reclaimed = self.limiter.gc();
                    let stats = self.stats();
                    info!(
                        active = stats.active_connections,
                        total = stats.total_connections,
                        messages_in = stats.messages_in,
                        messages_out = stats.messages_out,
                        violations = stats.violations,
                        secrets = stats.secrets_substituted,
                        buckets_reclaimed = reclaimed,
                        "proxy stats"
                    );
                }
            }
        }

        self.drain_connections().await;
        let stats = self.stats();
        info!(
            total = stats.total_connections,
            messages_in = stats.messages_in,
            messages_out = stats.messages_out,
            violations = stats.violations,
            secrets = stats.secrets_substituted,
            "proxy stopped"
        );
        Ok(())
    }

    fn spawn_connection(&self, stream: tokio::net::TcpStream, shutdown: watch::Receiver<bool>) {
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let connection_id = format!("conn-{seq}");
        self.total_accepted.fetch_add(1, Ordering::Relaxed);

        let counters = Arc::new(ConnectionCounters::default());
        self.connections.lock().expect("table lock").insert(
            connection_id.clone(),
            ConnectionRecord { counters: Arc::clone(&counters), created_at: Instant::now() },
        );
        info!(connection_id = %connection_id, "connection accepted");

        let config = Arc::clone(&self.config);
        let filters = Arc::clone(&self.filters);
        let vault_key = Arc::clone(&self.vault_key);
        let limiter = Arc::clone(&self.limiter);
        let events = self.events.clone();
        let connections = Arc::clone(&self.connections);
        let lifetime = Arc::clone(&self.lifetime);
        tokio::spawn(async move {
            run_connection(
                connection_id.clone(),
                stream,
                config,
                filters,
                vault_key,
                limiter,
                events,
                Arc::clone(&counters),
                shutdown,
            )
            .await;
            let (msgs_in, msgs_out, violations, secrets) = counters.snapshot();
            lifetime.messages_in.fetch_add(msgs_in, Ordering::Relaxed);
            lifetime.messages_out.fetch_add(msgs_out, Ordering::Relaxed);
            lifetime.violations.fetch_add(violations, Ordering::Relaxed);
            lifetime
                .secrets_substituted
                .fetch_add(secrets, Ordering::Relaxed);
            connections.lock().expect("table lock").remove(&connection_id);
        });
    }

    /// Wait for connection tasks to observe shutdown and deregister.
    async fn drain_connections(&self) {
        let deadline = Instant::now() + Duration::from_secs(SHUTDOWN_GRACE_SECS);
        loop {
            let active = self.connections.lock().expect("table lock").len();
            if active == 0 {
                return;
            }
            if Instant::now() >= deadline {
                warn!(active, "shutdown grace period expired");
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub fn stats(&self) -> ProxyStats {
        let table = self.connections.lock().expect("table lock");
        let (msgs_in, msgs_out, violations, secrets) = self.lifetime.snapshot();
        let mut stats = ProxyStats {
            active_connections: table.len(),
            total_connections: self.total_accepted.load(Ordering::Relaxed),
            messages_in: msgs_in,
            messages_out: msgs_out,
            violations,
            secrets_substituted: secrets,
        };
        for record in table.values() {
            let (msgs_in, msgs_out, violations, secrets) = record.counters.snapshot();
            stats.messages_in += msgs_in;
            stats.messages_out += msgs_out;
            stats.violations += violations;
            stats.secrets_substituted += secrets;
        }
        stats
    }

    /// Age of the oldest live connection, for diagnostics.
    pub fn oldest_connection_age(&self) -> Option<Duration> {
        let table = self.connections.lock().expect("table lock");
        table.values().map(|r| r.created_at.elapsed()).max()
    }
}
