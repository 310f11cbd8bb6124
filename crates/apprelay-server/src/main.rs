//! apprelay: browser session relay.
//!
//! Accepts WebSocket connections for remote desktop, terminal and file
//! sessions and relays them to their targets through the relay hop.

use apprelay_server::config::{ConfigOverrides, ServerConfig};
use apprelay_server::{Capabilities, EngineContext, RelayServer};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// apprelay: browser session relay
#[derive(Parser, Debug)]
#[command(name = "apprelay", version, about = "Browser session relay")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.apprelay/config.toml")]
    config: String,

    /// Base URL of the relay hop (ws://host:port)
    #[arg(long)]
    hop_url: Option<String>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Seconds allowed for an upstream to become ready
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting apprelay");

    let config_path = PathBuf::from(&cli.config);
    let overrides = ConfigOverrides {
        port: cli.port,
        hop_url: cli.hop_url,
        max_sessions: cli.max_sessions,
        connect_timeout: cli.connect_timeout,
    };
    let config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    // Upstream protocol clients are linked in by embedders; the stock
    // binary serves none and refuses every flavor with `sessionerror`.
    let capabilities = Capabilities::default();
    if capabilities.available().is_empty() {
        warn!("no upstream capabilities linked, all sessions will be refused");
    }

    let ctx = match EngineContext::from_config(&config, capabilities) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            error!(error = %e, "failed to create engine context");
            std::process::exit(1);
        }
    };
    let server = RelayServer::new(ctx, config.bind_addr);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    server.shutdown().await;
    info!("apprelay stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
