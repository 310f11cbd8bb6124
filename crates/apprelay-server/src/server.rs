//! Downstream listener: accepts browser WebSockets and routes each one to a
//! relay session by request path.

use crate::context::EngineContext;
use crate::session::{self, Flavor};
use crate::transport::websocket::{self, WebSocketConnection};
use apprelay_core::{CloseMode, RelayResult};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long shutdown waits for sessions to finish their teardown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Flavor selected by the last path segment.
pub fn flavor_for(path: &str) -> Option<Flavor> {
    let path = path.split('?').next().unwrap_or_default();
    match path.rsplit('/').next()? {
        "mstscrelay.ashx" => Some(Flavor::RemoteDesktop),
        "sshterminalrelay.ashx" => Some(Flavor::ShellTerminal),
        "sshfilesrelay.ashx" => Some(Flavor::FileTransfer),
        _ => None,
    }
}

/// Value of a query parameter, if present.
pub fn query_param<'a>(path: &'a str, name: &str) -> Option<&'a str> {
    let (_, query) = path.split_once('?')?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

pub struct RelayServer {
    ctx: Arc<EngineContext>,
    bind_addr: SocketAddr,
}

impl RelayServer {
    pub fn new(ctx: Arc<EngineContext>, bind_addr: SocketAddr) -> Self {
        Self { ctx, bind_addr }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Bind the listener and spawn the accept loop.
    pub async fn start(&self) -> RelayResult<(SocketAddr, JoinHandle<()>)> {
        let (addr, rx) = websocket::start_listener(self.bind_addr).await?;
        info!(
            addr = %addr,
            flavors = ?self.ctx.capabilities.available(),
            max_sessions = self.ctx.registry.max_sessions(),
            "relay listening"
        );
        let handle = tokio::spawn(accept_loop(self.ctx.clone(), rx));
        Ok((addr, handle))
    }

    /// Serve until the listener stops.
    pub async fn run(&self) -> RelayResult<()> {
        let (_, handle) = self.start().await?;
        let _ = handle.await;
        Ok(())
    }

    /// Ask every session to close and wait briefly for them to finish.
    pub async fn shutdown(&self) {
        let remaining = self.ctx.registry.list().await;
        for info in &remaining {
            info!(
                session_id = %info.id,
                flavor = ?info.flavor,
                target = info.target.as_deref().unwrap_or("-"),
                started_at = %info.started_at.to_rfc3339(),
                age_secs = info.age_secs,
                "closing session"
            );
        }
        self.ctx.shutdown();

        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while self.ctx.registry.count().await > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = self.ctx.registry.count().await,
                "sessions still open after shutdown timeout"
            );
        }
    }
}

async fn accept_loop(ctx: Arc<EngineContext>, mut rx: mpsc::Receiver<WebSocketConnection>) {
    while let Some(conn) = rx.recv().await {
        tokio::spawn(handle_connection(ctx.clone(), conn));
    }
    debug!("accept loop ended");
}

async fn handle_connection(ctx: Arc<EngineContext>, mut conn: WebSocketConnection) {
    let Some(flavor) = flavor_for(&conn.path) else {
        debug!(remote = %conn.remote_addr, path = %conn.path.split('?').next().unwrap_or_default(), "unknown relay path");
        let _ = conn.frames.sink.close(CloseMode::Soft).await;
        return;
    };

    let route = match flavor {
        Flavor::RemoteDesktop => None,
        _ => query_param(&conn.path, "auth").and_then(|cookie| ctx.cookies.decode(cookie)),
    };
    debug!(remote = %conn.remote_addr, ?flavor, routed = route.is_some(), "relay connection");
    session::serve(ctx, flavor, conn.frames, route).await;
}
