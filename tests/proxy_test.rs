//! End-to-end proxy tests
//!
//! Each test stands up a fake downstream WebSocket server and a full
//! proxy on ephemeral ports, then drives real client sessions through
//! both.
//!
//! Run with: cargo test --test proxy_test

use futures_util::{SinkExt, StreamExt};
use mcproxy::config::{Config, RateWindowConfig};
use mcproxy::net::Proxy;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream, WebSocketStream};

type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

const KEY: &str = "sk-aBc123XyZ456DefGhi789JklMno012PqrStu345VwxYz678";

// =============================================================================
// HARNESS
// =============================================================================

struct Downstream {
    addr: SocketAddr,
    received: mpsc::UnboundedReceiver<Value>,
    kill: mpsc::UnboundedSender<()>,
}

/// Fake downstream server: records every message and answers requests
/// with an echo result. A kill command drops the current session while
/// the listener keeps accepting.
async fn start_downstream() -> Downstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, received) = mpsc::unbounded_channel();
    let (kill, mut kill_rx) = mpsc::unbounded_channel::<()>();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            let Ok(mut ws) = accept_async(stream).await else { continue };
            loop {
                tokio::select! {
                    frame = ws.next() => match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            let Ok(msg) = serde_json::from_str::<Value>(&text) else { continue };
                            let _ = tx.send(msg.clone());
                            if msg.get("method").is_some() {
                                if let Some(id) = msg.get("id") {
                                    let reply = json!({
                                        "jsonrpc": "2.0",
                                        "id": id,
                                        "result": { "echo": msg.get("params").cloned().unwrap_or(Value::Null) }
                                    });
                                    let _ = ws.send(WsMessage::Text(reply.to_string())).await;
                                }
                            }
                        }
                        Some(Ok(WsMessage::Ping(p))) => {
                            let _ = ws.send(WsMessage::Pong(p)).await;
                        }
                        Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                        _ => {}
                    },
                    _ = kill_rx.recv() => {
                        let _ = ws.close(None).await;
                        break;
                    }
                }
            }
        }
    });
    Downstream { addr, received, kill }
}

async fn start_proxy(mut config: Config, downstream: &Downstream) -> (SocketAddr, watch::Sender<bool>) {
    config.proxy.mcp_server_url = format!("ws://{}", downstream.addr);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let proxy = Proxy::new(config).unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = proxy.serve(listener, shutdown_rx).await;
    });
    (addr, shutdown_tx)
}

async fn connect_client(addr: SocketAddr) -> ClientSocket {
    let (socket, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    socket
}

async fn send_json(client: &mut ClientSocket, msg: &Value) {
    client.send(WsMessage::Text(msg.to_string())).await.unwrap();
}

async fn recv_json(client: &mut ClientSocket) -> Value {
    loop {
        let frame = timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for reply")
            .expect("connection closed")
            .expect("read error");
        match frame {
            WsMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn recv_downstream(downstream: &mut Downstream) -> Value {
    timeout(RECV_TIMEOUT, downstream.received.recv())
        .await
        .expect("timed out waiting for downstream message")
        .expect("downstream channel closed")
}

// =============================================================================
// SCENARIOS
// =============================================================================

#[tokio::test]
async fn test_ansi_stripped_before_forwarding() {
    let mut downstream = start_downstream().await;
    let (addr, _shutdown) = start_proxy(Config::default(), &downstream).await;
    let mut client = connect_client(addr).await;

    let msg = json!({
        "jsonrpc": "2.0",
        "method": "echo",
        "params": { "t": "\u{1b}[31mRED\u{1b}[0m" },
        "id": 1
    });
    send_json(&mut client, &msg).await;

    let forwarded = recv_downstream(&mut downstream).await;
    assert_eq!(forwarded["jsonrpc"], "2.0");
    assert_eq!(forwarded["method"], "echo");
    assert_eq!(forwarded["id"], 1);
    assert_eq!(forwarded["params"]["t"], "RED");

    // The echo response flows back through the server→client path.
    let reply = recv_json(&mut client).await;
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["result"]["echo"]["t"], "RED");
}

#[tokio::test]
async fn test_strict_mode_rejects_command_injection() {
    let mut config = Config::default();
    config.sanitization.strict_mode = true;
    let mut downstream = start_downstream().await;
    let (addr, _shutdown) = start_proxy(config, &downstream).await;
    let mut client = connect_client(addr).await;

    let msg = json!({
        "jsonrpc": "2.0",
        "method": "tools/execute",
        "params": { "input": "ls; cat /etc/passwd" },
        "id": 7
    });
    send_json(&mut client, &msg).await;

    let reply = recv_json(&mut client).await;
    assert_eq!(
        reply,
        json!({
            "jsonrpc": "2.0",
            "id": 7,
            "error": { "code": -32603, "message": "Message contains forbidden content" }
        })
    );

    // Nothing was forwarded.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(downstream.received.try_recv().is_err());
}

#[tokio::test]
async fn test_secret_round_trips_to_downstream() {
    let mut downstream = start_downstream().await;
    let (addr, _shutdown) = start_proxy(Config::default(), &downstream).await;
    let mut client = connect_client(addr).await;

    let msg = json!({
        "jsonrpc": "2.0",
        "method": "call",
        "params": { "k": KEY },
        "id": 2
    });
    send_json(&mut client, &msg).await;

    // Downstream sees the original secret: substituted on ingress,
    // restored on egress.
    let forwarded = recv_downstream(&mut downstream).await;
    assert_eq!(forwarded["params"]["k"], KEY);
    assert_eq!(forwarded["id"], 2);
}

#[tokio::test]
async fn test_rate_limit_allows_two_rejects_third() {
    let mut config = Config::default();
    config.rate_limiting.per_client = RateWindowConfig {
        requests_per_minute: 2,
        requests_per_hour: 0,
    };
    let mut downstream = start_downstream().await;
    let (addr, _shutdown) = start_proxy(config, &downstream).await;
    let mut client = connect_client(addr).await;

    for id in 1..=3 {
        let msg = json!({"jsonrpc":"2.0","method":"ping","params":{},"id":id});
        send_json(&mut client, &msg).await;
    }

    let mut echoes = 0;
    let mut throttled = 0;
    for _ in 0..3 {
        let reply = recv_json(&mut client).await;
        if reply.get("result").is_some() {
            echoes += 1;
        } else {
            assert_eq!(reply["error"]["code"], -32603);
            assert_eq!(reply["error"]["message"], "Rate limit exceeded");
            throttled += 1;
        }
    }
    assert_eq!(echoes, 2);
    assert_eq!(throttled, 1);

    assert!(recv_downstream(&mut downstream).await.get("id").is_some());
    assert!(recv_downstream(&mut downstream).await.get("id").is_some());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(downstream.received.try_recv().is_err());
}

#[tokio::test]
async fn test_reconnect_drains_queue_in_order() {
    let mut downstream = start_downstream().await;
    let (addr, _shutdown) = start_proxy(Config::default(), &downstream).await;
    let mut client = connect_client(addr).await;

    // Warm the downstream link up.
    send_json(&mut client, &json!({"jsonrpc":"2.0","method":"warmup","params":{},"id":100})).await;
    let warmup = recv_downstream(&mut downstream).await;
    assert_eq!(warmup["id"], 100);

    // Drop the downstream session; the proxy schedules a reconnect.
    downstream.kill.send(()).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // These three arrive while the server leg is down and must queue.
    for id in 1..=3 {
        send_json(&mut client, &json!({"jsonrpc":"2.0","method":"queued","params":{},"id":id})).await;
    }

    // After the backoff the queue drains FIFO into the new session.
    for expected in 1..=3 {
        let msg = recv_downstream(&mut downstream).await;
        assert_eq!(msg["id"], expected, "queue drained out of order");
    }
}

// =============================================================================
// WIRE CONTRACT
// =============================================================================

#[tokio::test]
async fn test_invalid_json_gets_parse_error() {
    let downstream = start_downstream().await;
    let (addr, _shutdown) = start_proxy(Config::default(), &downstream).await;
    let mut client = connect_client(addr).await;

    client.send(WsMessage::Text("this is not json{{{".to_string())).await.unwrap();
    let reply = recv_json(&mut client).await;
    assert_eq!(reply["error"]["code"], -32700);
    assert_eq!(reply["error"]["message"], "Invalid JSON format");
    assert_eq!(reply["id"], Value::Null);
}

#[tokio::test]
async fn test_invalid_jsonrpc_gets_invalid_message_error() {
    let downstream = start_downstream().await;
    let (addr, _shutdown) = start_proxy(Config::default(), &downstream).await;
    let mut client = connect_client(addr).await;

    send_json(&mut client, &json!({"jsonrpc":"1.0","method":"x","id":5})).await;
    let reply = recv_json(&mut client).await;
    assert_eq!(reply["error"]["code"], -32600);
    assert_eq!(reply["error"]["message"], "Invalid JSON-RPC message");
    assert_eq!(reply["id"], 5);
}

#[tokio::test]
async fn test_binary_frame_rejected_with_parse_error() {
    let downstream = start_downstream().await;
    let (addr, _shutdown) = start_proxy(Config::default(), &downstream).await;
    let mut client = connect_client(addr).await;

    client.send(WsMessage::Binary(vec![0x01, 0x02, 0x03])).await.unwrap();
    let reply = recv_json(&mut client).await;
    assert_eq!(reply["error"]["code"], -32700);
}

#[tokio::test]
async fn test_connection_limit_rejected_with_policy_close() {
    let mut config = Config::default();
    config.proxy.max_connections = 1;
    let mut downstream = start_downstream().await;
    let (addr, _shutdown) = start_proxy(config, &downstream).await;

    // First client occupies the only slot.
    let mut first = connect_client(addr).await;
    send_json(&mut first, &json!({"jsonrpc":"2.0","method":"hold","params":{},"id":1})).await;
    recv_downstream(&mut downstream).await;

    // Second client is handshaken then closed with 1008.
    let mut second = connect_client(addr).await;
    let frame = timeout(RECV_TIMEOUT, second.next())
        .await
        .expect("timed out waiting for close")
        .expect("connection ended without close frame");
    match frame {
        Ok(WsMessage::Close(Some(close))) => assert_eq!(close.code, CloseCode::Policy),
        other => panic!("expected policy close, got {other:?}"),
    }
}

#[tokio::test]
async fn test_shutdown_closes_clients_normally() {
    let mut downstream = start_downstream().await;
    let (addr, shutdown) = start_proxy(Config::default(), &downstream).await;
    let mut client = connect_client(addr).await;

    send_json(&mut client, &json!({"jsonrpc":"2.0","method":"hold","params":{},"id":1})).await;
    recv_downstream(&mut downstream).await;

    shutdown.send(true).unwrap();

    loop {
        let frame = timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for close");
        match frame {
            Some(Ok(WsMessage::Close(Some(close)))) => {
                assert_eq!(close.code, CloseCode::Normal);
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => break,
        }
    }
}
