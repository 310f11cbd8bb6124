//! Relay sessions: one per downstream connection.
//!
//! Every flavor shares the same lifecycle and teardown rules, kept in
//! [`SessionCore`]. The flavor modules own the upstream capability and the
//! message grammar.

pub mod desktop;
pub mod files;
pub mod registry;
pub mod shell;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;

use crate::bridge::{self, BridgeOutcome, BRIDGE_CHUNK};
use crate::context::EngineContext;
use crate::store::{node_targets, AuditEvent, Credentials};
use crate::transport::hop::{hop_url, HopConnector};
use crate::upstream::UpstreamResult;
use apprelay_core::{CloseMode, Frame, FramePair, FrameSink, Notice, RelayError, RelayResult, RouteInfo};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use registry::{SessionInfo, SessionRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flavor {
    RemoteDesktop,
    ShellTerminal,
    FileTransfer,
}

/// Session states, in the only order they may be entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Created,
    AwaitingCredentials,
    ConnectingUpstream,
    Active,
    Closing,
    Closed,
}

/// Shared per-session bookkeeping: state, downstream sink, spawned tasks
/// and the connect deadline.
pub(crate) struct SessionCore {
    pub id: String,
    state: SessionState,
    sink: Box<dyn FrameSink>,
    tasks: Vec<JoinHandle<()>>,
    deadline: Option<Instant>,
}

impl SessionCore {
    pub fn new(id: String, sink: Box<dyn FrameSink>) -> Self {
        Self {
            id,
            state: SessionState::Created,
            sink,
            tasks: Vec::new(),
            deadline: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move forward to `next`. Returns false, leaving the state unchanged,
    /// when `next` is not later than the current state.
    pub fn advance(&mut self, next: SessionState) -> bool {
        if next <= self.state {
            return false;
        }
        debug!(session_id = %self.id, from = ?self.state, to = ?next, "session state");
        self.state = next;
        true
    }

    pub fn is_closing(&self) -> bool {
        self.state >= SessionState::Closing
    }

    pub async fn send(&mut self, frame: Frame) -> RelayResult<()> {
        if self.is_closing() {
            return Err(RelayError::Closed);
        }
        self.sink.send(frame).await
    }

    pub async fn send_notice(&mut self, notice: Notice) -> RelayResult<()> {
        self.send(Frame::Text(notice.to_json())).await
    }

    /// Downstream sink for handlers that write directly. Not usable once
    /// closing has begun.
    pub fn sink(&mut self) -> RelayResult<&mut dyn FrameSink> {
        if self.is_closing() {
            return Err(RelayError::Closed);
        }
        Ok(self.sink.as_mut())
    }

    /// Spawn a task owned by this session; it is aborted on close.
    pub fn spawn<F>(&mut self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(tokio::spawn(fut));
    }

    pub fn arm_deadline(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    pub fn disarm_deadline(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// First half of teardown. Returns false if a close already started;
    /// the caller must then skip its own teardown.
    pub fn begin_close(&mut self) -> bool {
        if !self.advance(SessionState::Closing) {
            return false;
        }
        self.deadline = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        true
    }

    /// Second half of teardown: close the downstream transport.
    pub async fn finish_close(&mut self, mode: CloseMode) {
        if let Err(e) = self.sink.close(mode).await {
            debug!(session_id = %self.id, error = %e, "downstream close failed");
        }
        self.advance(SessionState::Closed);
        info!(session_id = %self.id, ?mode, "session closed");
    }
}

/// Receive from an optional channel; pending forever when absent.
pub(crate) async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Sleep until an optional deadline; pending forever when absent.
pub(crate) async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Progress of the upstream link, posted by session-owned tasks.
pub(crate) enum Link<T> {
    /// Hop connected and sent its ready signal.
    HopReady(FramePair),
    HopFailed(RelayError),
    /// The upstream capability finished its handshake.
    Connected(UpstreamResult<T>),
    BridgeEnded(BridgeOutcome),
}

/// Encode a fresh routing cookie for `route` and build the hop URL.
pub(crate) fn hop_target(ctx: &EngineContext, route: &RouteInfo, protocol: u8) -> RelayResult<String> {
    let cookie = ctx.cookies.encode(route)?;
    Ok(hop_url(
        &ctx.settings.hop_url,
        &ctx.settings.domain,
        route,
        protocol,
        &cookie,
    ))
}

/// Connect to the hop and wait for its ready signal.
pub(crate) async fn open_hop(hop: &dyn HopConnector, url: &str) -> RelayResult<FramePair> {
    let endpoint = url.split('?').next().unwrap_or_default();
    debug!(endpoint, "connecting relay hop");
    let mut pair = hop.connect(url).await?;
    bridge::wait_ready(pair.source.as_mut()).await?;
    debug!(endpoint, "relay hop ready");
    Ok(pair)
}

/// Spawn the hop connection; posts `HopReady` or `HopFailed`.
pub(crate) fn spawn_hop<T: Send + 'static>(
    core: &mut SessionCore,
    hop: Arc<dyn HopConnector>,
    url: String,
    tx: mpsc::Sender<Link<T>>,
) {
    core.spawn(async move {
        let link = match open_hop(hop.as_ref(), &url).await {
            Ok(pair) => Link::HopReady(pair),
            Err(e) => Link::HopFailed(e),
        };
        let _ = tx.send(link).await;
    });
}

/// Spawn the byte bridge between the hop and a stream; posts `BridgeEnded`.
pub(crate) fn spawn_bridge<T, S>(core: &mut SessionCore, hop: FramePair, stream: S, tx: mpsc::Sender<Link<T>>)
where
    T: Send + 'static,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    core.spawn(async move {
        let outcome = bridge::run(hop, stream, BRIDGE_CHUNK).await;
        let _ = tx.send(Link::BridgeEnded(outcome)).await;
    });
}

/// Persist credentials after a successful login. The change event is only
/// published the first time credentials are stored for a target.
pub(crate) async fn save_credentials(ctx: &EngineContext, route: &RouteInfo, credentials: Credentials) {
    match ctx.credentials.set(&route.node_id, credentials).await {
        Ok(None) => {
            info!(node = %route.node_id, "credentials stored");
            ctx.events
                .publish(&node_targets(route), AuditEvent::credentials_changed(route));
        }
        Ok(Some(_)) => debug!(node = %route.node_id, "credentials updated"),
        Err(e) => warn!(node = %route.node_id, error = %e, "failed to store credentials"),
    }
}

/// Stored credentials for a target. Store failures count as none.
pub(crate) async fn stored_credentials(ctx: &EngineContext, route: &RouteInfo) -> Option<Credentials> {
    match ctx.credentials.get(&route.node_id).await {
        Ok(found) => found,
        Err(e) => {
            warn!(node = %route.node_id, error = %e, "credential lookup failed");
            None
        }
    }
}

/// Serve one downstream connection as the given flavor.
///
/// `route` is the decoded `auth` cookie for terminal and file sessions;
/// desktop sessions receive theirs in the first message.
pub async fn serve(ctx: Arc<EngineContext>, flavor: Flavor, frames: FramePair, route: Option<RouteInfo>) {
    if flavor != Flavor::RemoteDesktop && route.is_none() {
        warn!(?flavor, "missing or invalid routing cookie");
        refuse(frames).await;
        return;
    }

    let available = match flavor {
        Flavor::RemoteDesktop => ctx.capabilities.desktop.is_some(),
        Flavor::ShellTerminal => ctx.capabilities.shell.is_some(),
        Flavor::FileTransfer => ctx.capabilities.files.is_some(),
    };
    if !available {
        warn!(?flavor, "no upstream capability for flavor");
        refuse(frames).await;
        return;
    }

    let target = route.as_ref().map(|r| r.node_id.clone());
    let id = match ctx.registry.register(flavor, target).await {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "session refused");
            refuse(frames).await;
            return;
        }
    };

    match (flavor, route) {
        (Flavor::RemoteDesktop, _) => {
            desktop::DesktopRelay::new(ctx.clone(), id.clone(), frames)
                .run()
                .await
        }
        (Flavor::ShellTerminal, Some(route)) => {
            shell::ShellRelay::new(ctx.clone(), id.clone(), frames, route)
                .run()
                .await
        }
        (Flavor::FileTransfer, Some(route)) => {
            files::FileRelay::new(ctx.clone(), id.clone(), frames, route)
                .run()
                .await
        }
        _ => {}
    }

    ctx.registry.unregister(&id).await;
}

/// Tell the client the session cannot be served, then close.
async fn refuse(mut frames: FramePair) {
    let _ = frames
        .sink
        .send(Frame::Text(Notice::Sessionerror.to_json()))
        .await;
    let _ = frames.sink.close(CloseMode::Soft).await;
}
