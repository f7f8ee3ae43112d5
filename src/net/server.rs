//! Outbound leg to the downstream server
//!
//! State machine: Idle → Connecting → Connected → Reconnecting →
//! Closed. While the socket is down, outbound messages queue in a
//! bounded FIFO; the queue drains in order on reconnect before any new
//! send. Queue overflow drops the arriving message, never an older
//! one — the downstream sees a prefix of the stream, not a gapped
//! middle.
//!
//! Placeholders are swapped back to their original secrets here,
//! immediately before transmission. This is the only point where
//! vaulted plaintext leaves the process.

use crate::config::ProxyConfig;
use crate::filter::Sanitizer;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type ServerSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Keep-alive ping cadence toward the downstream server.
pub const KEEPALIVE_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerLegState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ServerLegError {
    #[error("downstream server connection closed")]
    Closed,
}

/// Outcome of a `send` while the leg may be down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Sent,
    Queued,
    /// Queue full: this message was dropped.
    Dropped,
}

pub struct ServerLeg {
    url: String,
    connection_id: String,
    state: ServerLegState,
    socket: Option<ServerSocket>,
    queue: VecDeque<Value>,
    max_queue_size: usize,
    connect_timeout: Duration,
    auto_reconnect: bool,
    initial_delay: Duration,
    max_attempts: u32,
    attempt: u32,
    retry_at: Option<Instant>,
    last_activity: Instant,
}

impl ServerLeg {
    pub fn new(config: &ProxyConfig, connection_id: &str) -> Self {
        Self {
            url: config.mcp_server_url.clone(),
            connection_id: connection_id.to_string(),
            state: ServerLegState::Idle,
            socket: None,
            queue: VecDeque::new(),
            max_queue_size: config.max_queue_size,
            connect_timeout: Duration::from_secs(config.connection_timeout),
            auto_reconnect: config.auto_reconnect,
            initial_delay: Duration::from_secs(config.reconnect_initial_delay),
            max_attempts: config.reconnect_max_attempts,
            attempt: 0,
            retry_at: None,
            last_activity: Instant::now(),
        }
    }

    pub fn state(&self) -> ServerLegState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ServerLegState::Connected && self.socket.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state == ServerLegState::Closed
    }

    /// Deadline of the pending reconnect attempt, if one is scheduled.
    pub fn retry_deadline(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Establish the downstream session. On success the queue drains in
    /// FIFO order before the call returns; on failure a reconnect is
    /// scheduled (or the leg closes when attempts are exhausted).
    pub async fn connect(&mut self) -> bool {
        if self.state == ServerLegState::Closed {
            return false;
        }
        self.state = ServerLegState::Connecting;
        debug!(connection_id = %self.connection_id, url = %self.url, "connecting downstream");
        match tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str())).await {
            Ok(Ok((socket, _response))) => {
                info!(
                    connection_id = %self.connection_id,
                    url = %self.url,
                    "downstream connected"
                );
                self.socket = Some(socket);
                self.state = ServerLegState::Connected;
                self.attempt = 0;
                self.retry_at = None;
                self.last_activity = Instant::now();
                self.drain_queue().await;
                self.is_connected()
            }
            Ok(Err(e)) => {
                warn!(connection_id = %self.connection_id, error = %e, "downstream connect failed");
                self.schedule_retry();
                false
            }
            Err(_) => {
                warn!(
                    connection_id = %self.connection_id,
                    timeout_secs = self.connect_timeout.as_secs(),
                    "downstream connect timed out"
                );
                self.schedule_retry();
                false
            }
        }
    }

    /// Retry when the scheduled backoff deadline fires.
    pub async fn reconnect(&mut self) -> bool {
        self.retry_at = None;
        self.state = ServerLegState::Reconnecting;
        self.connect().await
    }

    /// Send one sanitized message downstream. Placeholders are restored
    /// first; a disconnected leg queues, a closed leg errors.
    pub async fn send(
        &mut self,
        sanitizer: &mut Sanitizer,
        msg: &Value,
    ) -> Result<SendStatus, ServerLegError> {
        if self.state == ServerLegState::Closed {
            return Err(ServerLegError::Closed);
        }
        let (restored, _modified) = sanitizer.resubstitute(msg);
        if self.is_connected() {
            if self.transmit(&restored).await {
                return Ok(SendStatus::Sent);
            }
            // Transmit failure disconnected the leg; fall through to
            // queueing unless the failure closed it for good.
            if self.state == ServerLegState::Closed {
                return Err(ServerLegError::Closed);
            }
        }
        if self.queue.len() >= self.max_queue_size {
            warn!(
                connection_id = %self.connection_id,
                queue = self.queue.len(),
                "outbound queue full; dropping newest message"
            );
            return Ok(SendStatus::Dropped);
        }
        self.queue.push_back(restored);
        Ok(SendStatus::Queued)
    }

    async fn drain_queue(&mut self) {
        while let Some(msg) = self.queue.pop_front() {
            if !self.transmit(&msg).await {
                // Undelivered: back to the head so order is preserved
                // for the next reconnect.
                self.queue.push_front(msg);
                break;
            }
        }
    }

    async fn transmit(&mut self, msg: &Value) -> bool {
        let Some(socket) = self.socket.as_mut() else {
            return false;
        };
        match socket.send(WsMessage::Text(msg.to_string())).await {
            Ok(()) => true,
            Err(e) => {
                warn!(connection_id = %self.connection_id, error = %e, "downstream send failed");
                self.socket = None;
                self.schedule_retry();
                false
            }
        }
    }

    /// Next frame from the downstream socket. Only call while connected.
    pub async fn next_frame(&mut self) -> Option<Result<WsMessage, tokio_tungstenite::tungstenite::Error>> {
        match self.socket.as_mut() {
            Some(socket) => {
                let frame = socket.next().await;
                if frame.is_some() {
                    self.last_activity = Instant::now();
                }
                frame
            }
            None => None,
        }
    }

    /// Unexpected remote close or read error.
    pub fn on_disconnect(&mut self) {
        self.socket = None;
        self.schedule_retry();
    }

    /// Keep-alive tick: disconnect a stale session, otherwise ping it.
    pub async fn keepalive(&mut self) {
        if !self.is_connected() {
            return;
        }
        let stale = self.last_activity.elapsed()
            > Duration::from_secs(KEEPALIVE_INTERVAL_SECS * 2);
        if stale {
            warn!(connection_id = %self.connection_id, "downstream unresponsive; reconnecting");
            if let Some(mut socket) = self.socket.take() {
                let _ = socket.close(None).await;
            }
            self.schedule_retry();
            return;
        }
        if let Some(socket) = self.socket.as_mut() {
            if let Err(e) = socket.send(WsMessage::Ping(Vec::new())).await {
                warn!(connection_id = %self.connection_id, error = %e, "downstream ping failed");
                self.socket = None;
                self.schedule_retry();
            }
        }
    }

    pub async fn pong(&mut self, payload: Vec<u8>) {
        if let Some(socket) = self.socket.as_mut() {
            let _ = socket.send(WsMessage::Pong(payload)).await;
        }
    }

    /// Explicit close: no reconnect.
    pub async fn close(&mut self) {
        self.state = ServerLegState::Closed;
        self.retry_at = None;
        self.queue.clear();
        if let Some(mut socket) = self.socket.take() {
            let frame = CloseFrame { code: CloseCode::Normal, reason: "shutdown".into() };
            let _ = socket.close(Some(frame)).await;
        }
    }

    /// Exponential backoff: initial_delay * 2^(attempt-1), bounded by
    /// max_attempts. Exhaustion closes the leg; the client leg tears
    /// down when it observes the closed state.
    fn schedule_retry(&mut self) {
        if !self.auto_reconnect {
            info!(connection_id = %self.connection_id, "auto-reconnect disabled; closing leg");
            self.state = ServerLegState::Closed;
            self.retry_at = None;
            return;
        }
        self.attempt += 1;
        if self.attempt > self.max_attempts {
            warn!(
                connection_id = %self.connection_id,
                attempts = self.max_attempts,
                "reconnect attempts exhausted"
            );
            self.state = ServerLegState::Closed;
            self.retry_at = None;
            return;
        }
        let delay = self.initial_delay * 2u32.saturating_pow(self.attempt - 1);
        info!(
            connection_id = %self.connection_id,
            attempt = self.attempt,
            delay_secs = delay.as_secs(),
            "reconnect scheduled"
        );
        self.state = ServerLegState::Reconnecting;
        self.retry_at = Some(Instant::now() + delay);
    }
}
