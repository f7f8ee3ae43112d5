//! MCProxy — security-enforcing JSON-RPC 2.0 proxy
//!
//! Sits between untrusted WebSocket clients and a trusted downstream
//! server, sanitizing every message that crosses it: ANSI escapes,
//! invisible characters, injection payloads, and leaked credentials.

use anyhow::Context;
use clap::Parser;
use mcproxy::config::Config;
use mcproxy::net::Proxy;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "mcproxy", version, about = "Security-enforcing JSON-RPC 2.0 proxy")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Downstream server WebSocket URL (overrides config)
    #[arg(short = 's', long)]
    server_url: Option<String>,

    /// Enable strict mode: sanitization violations reject the message
    #[arg(long)]
    strict: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mcproxy=info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(port) = args.port {
        config.proxy.port = port;
    }
    if let Some(host) = args.host {
        config.proxy.host = host;
    }
    if let Some(url) = args.server_url {
        config.proxy.mcp_server_url = url;
    }
    if args.strict {
        config.sanitization.strict_mode = true;
    }

    info!("mcproxy v{VERSION}");
    info!(
        listen = %config.listen_addr(),
        downstream = %config.proxy.mcp_server_url,
        strict = config.sanitization.strict_mode,
        "starting"
    );

    let proxy = Proxy::new(config).context("proxy startup failed")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    if let Err(e) = proxy.run(shutdown_rx).await {
        error!(error = %e, "proxy failed");
        return Err(e.into());
    }
    Ok(())
}
