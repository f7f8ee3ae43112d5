//! Inbound leg from an untrusted client
//!
//! State machine: Accepted → Handshaking → Forwarding → Closing →
//! Closed. The leg owns the client WebSocket and the per-connection
//! traffic counters; the pipeline decisions (parse, validate, admit,
//! sanitize) live in the connection task that drives it.

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientLegState {
    Accepted,
    Handshaking,
    Forwarding,
    Closing,
    Closed,
}

#[derive(Error, Debug)]
pub enum AcceptError {
    #[error("client handshake timed out")]
    Timeout,
    #[error("client handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),
}

pub struct ClientLeg {
    connection_id: String,
    state: ClientLegState,
    socket: WebSocketStream<TcpStream>,
    pub messages_in: u64,
    pub messages_out: u64,
    pub violations: u64,
}

impl ClientLeg {
    /// Complete the WebSocket handshake within the configured timeout.
    pub async fn accept(
        stream: TcpStream,
        connection_id: &str,
        handshake_timeout: Duration,
        max_message_size: usize,
    ) -> Result<Self, AcceptError> {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(max_message_size);
        config.max_frame_size = Some(max_message_size);
        let socket = tokio::time::timeout(
            handshake_timeout,
            tokio_tungstenite::accept_async_with_config(stream, Some(config)),
        )
        .await
        .map_err(|_| AcceptError::Timeout)??;
        debug!(connection_id, "client handshake complete");
        Ok(Self {
            connection_id: connection_id.to_string(),
            state: ClientLegState::Forwarding,
            socket,
            messages_in: 0,
            messages_out: 0,
            violations: 0,
        })
    }

    /// Handshake then immediately close. Used when the proxy is at
    /// max_connections: the close code tells the client why.
    pub async fn reject(stream: TcpStream, reason: &str) {
        if let Ok(mut socket) = tokio_tungstenite::accept_async(stream).await {
            let frame = CloseFrame { code: CloseCode::Policy, reason: reason.to_string().into() };
            let _ = socket.close(Some(frame)).await;
        }
    }

    pub fn state(&self) -> ClientLegState {
        self.state
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub async fn next_frame(
        &mut self,
    ) -> Option<Result<WsMessage, tokio_tungstenite::tungstenite::Error>> {
        self.socket.next().await
    }

    /// Serialize and send one JSON value as a text frame.
    pub async fn send_value(&mut self, msg: &Value) -> bool {
        match self.socket.send(WsMessage::Text(msg.to_string())).await {
            Ok(()) => {
                self.messages_out += 1;
                true
            }
            Err(e) => {
                warn!(connection_id = %self.connection_id, error = %e, "client send failed");
                self.state = ClientLegState::Closed;
                false
            }
        }
    }

    pub async fn pong(&mut self, payload: Vec<u8>) {
        let _ = self.socket.send(WsMessage::Pong(payload)).await;
    }

    /// Graceful close with normal closure code.
    pub async fn close(&mut self) {
        if self.state == ClientLegState::Closed {
            return;
        }
        self.state = ClientLegState::Closing;
        let frame = CloseFrame { code: CloseCode::Normal, reason: "shutdown".into() };
        let _ = self.socket.close(Some(frame)).await;
        self.state = ClientLegState::Closed;
    }
}
