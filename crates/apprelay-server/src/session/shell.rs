//! Web terminal relay.
//!
//! Text frames starting with `~` are terminal input; everything else is a
//! JSON control message. Shell output goes back as `~`-prefixed text.

use super::{
    hop_target, recv_opt, save_credentials, sleep_opt, spawn_bridge, spawn_hop, stored_credentials,
    Link, SessionCore, SessionState,
};
use crate::context::EngineContext;
use crate::loopback;
use crate::store::Credentials;
use crate::transport::hop::PROTOCOL_SSH;
use crate::upstream::{ShellControl, ShellEvent, ShellSession, UpstreamError, UpstreamResult};
use apprelay_core::codec::{shell_input, ShellOutput, READY_SIGNAL};
use apprelay_core::messages::ShellRequest;
use apprelay_core::{
    parse_control, CloseMode, Frame, FramePair, FrameSource, Notice, RelayResult, RouteInfo,
    TerminalSize,
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Buffer size of the in-process pipe between the shell client and the hop.
const PIPE_CAPACITY: usize = 64 * 1024;

enum Step {
    Downstream(RelayResult<Option<Frame>>),
    Link(Link<ShellSession>),
    Shell(Option<ShellEvent>),
    Timeout,
    Shutdown,
}

pub struct ShellRelay {
    ctx: Arc<EngineContext>,
    core: SessionCore,
    source: Box<dyn FrameSource>,
    route: RouteInfo,
    link_tx: mpsc::Sender<Link<ShellSession>>,
    link_rx: mpsc::Receiver<Link<ShellSession>>,
    shutdown: broadcast::Receiver<()>,
    size: TerminalSize,
    /// Credentials found in the store, used on the client's `sshautoauth`.
    stored: Option<Credentials>,
    /// Credentials of the login in progress.
    login: Option<Credentials>,
    keep: bool,
    control: Option<Box<dyn ShellControl>>,
    output: Option<mpsc::Receiver<ShellEvent>>,
    text: ShellOutput,
}

impl ShellRelay {
    pub fn new(ctx: Arc<EngineContext>, id: String, frames: FramePair, route: RouteInfo) -> Self {
        let (link_tx, link_rx) = mpsc::channel(8);
        let shutdown = ctx.subscribe_shutdown();
        Self {
            core: SessionCore::new(id, frames.sink),
            source: frames.source,
            ctx,
            route,
            link_tx,
            link_rx,
            shutdown,
            size: TerminalSize::default(),
            stored: None,
            login: None,
            keep: false,
            control: None,
            output: None,
            text: ShellOutput::new(),
        }
    }

    pub async fn run(mut self) {
        info!(session_id = %self.core.id, node = %self.route.node_id, "terminal session started");
        self.start().await;

        while !self.core.is_closing() {
            let step = tokio::select! {
                frame = self.source.recv() => Step::Downstream(frame),
                Some(link) = self.link_rx.recv() => Step::Link(link),
                event = recv_opt(&mut self.output) => Step::Shell(event),
                _ = sleep_opt(self.core.deadline()) => Step::Timeout,
                _ = self.shutdown.recv() => Step::Shutdown,
            };

            match step {
                Step::Downstream(Ok(Some(frame))) => self.on_frame(frame).await,
                Step::Downstream(Ok(None)) => {
                    debug!(session_id = %self.core.id, "client disconnected");
                    self.close(CloseMode::Soft).await;
                }
                Step::Downstream(Err(e)) => {
                    warn!(session_id = %self.core.id, error = %e, "downstream transport error");
                    self.close(CloseMode::Hard).await;
                }
                Step::Link(link) => self.on_link(link).await,
                Step::Shell(Some(ShellEvent::Data(data))) => {
                    let Some(frame) = self.text.frame(&data) else {
                        continue;
                    };
                    if self.core.send(frame).await.is_err() {
                        self.close(CloseMode::Soft).await;
                    }
                }
                Step::Shell(Some(ShellEvent::Closed) | None) => {
                    debug!(session_id = %self.core.id, "shell ended");
                    self.close(CloseMode::Soft).await;
                }
                Step::Timeout => {
                    warn!(session_id = %self.core.id, "connect timed out");
                    self.fail(Notice::Sessiontimeout).await;
                }
                Step::Shutdown => self.close(CloseMode::Soft).await,
            }
        }
    }

    async fn start(&mut self) {
        let notice = match stored_credentials(&self.ctx, &self.route).await {
            Some(credentials) => {
                debug!(session_id = %self.core.id, "stored credentials found");
                self.stored = Some(credentials);
                Notice::Sshautoauth
            }
            None => {
                self.core.advance(SessionState::AwaitingCredentials);
                Notice::Sshauth
            }
        };
        if self.core.send_notice(notice).await.is_err() {
            self.close(CloseMode::Soft).await;
        }
    }

    async fn on_frame(&mut self, frame: Frame) {
        if let Frame::Text(text) = &frame {
            if let Some(input) = shell_input(text) {
                self.on_input(input.as_bytes()).await;
                return;
            }
        }

        let request = match parse_control::<ShellRequest>(&frame.into_bytes()) {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!(session_id = %self.core.id, "ignoring unknown control message");
                return;
            }
            Err(e) => {
                warn!(session_id = %self.core.id, error = %e, "protocol violation");
                self.close(CloseMode::Soft).await;
                return;
            }
        };

        match request {
            ShellRequest::Sshauth(login) => {
                let keep = login.keep == Some(true);
                self.size = login.size();
                self.begin_login(Credentials::new(login.username, login.password), keep)
                    .await;
            }
            ShellRequest::Connect(login) => {
                self.size = login.size();
                self.begin_login(Credentials::new(login.username, login.password), false)
                    .await;
            }
            ShellRequest::Sshautoauth(size) => {
                let Some(credentials) = self.stored.take() else {
                    debug!(session_id = %self.core.id, "sshautoauth without stored credentials");
                    return;
                };
                self.size = size;
                self.begin_login(credentials, false).await;
            }
            ShellRequest::Resize(size) => {
                self.size = size;
                if let Some(control) = self.control.as_mut() {
                    if let Err(e) = control.set_window(size).await {
                        warn!(session_id = %self.core.id, error = %e, "resize failed");
                    }
                }
            }
        }
    }

    async fn on_input(&mut self, data: &[u8]) {
        let Some(control) = self.control.as_mut() else {
            return;
        };
        if let Err(e) = control.write(data).await {
            warn!(session_id = %self.core.id, error = %e, "shell write failed");
            self.close(CloseMode::Soft).await;
        }
    }

    async fn begin_login(&mut self, credentials: Credentials, keep: bool) {
        if self.core.state() >= SessionState::ConnectingUpstream {
            debug!(session_id = %self.core.id, "login already in progress");
            return;
        }
        let url = match hop_target(&self.ctx, &self.route, PROTOCOL_SSH) {
            Ok(url) => url,
            Err(e) => {
                warn!(session_id = %self.core.id, error = %e, "cannot build relay cookie");
                self.fail(Notice::Connectionerror).await;
                return;
            }
        };
        info!(session_id = %self.core.id, user = %credentials.username, "connecting shell");
        self.stored = None;
        self.login = Some(credentials);
        self.keep = keep;
        self.core.advance(SessionState::ConnectingUpstream);
        self.core.arm_deadline(self.ctx.settings.connect_timeout);
        spawn_hop(&mut self.core, self.ctx.hop.clone(), url, self.link_tx.clone());
    }

    async fn on_link(&mut self, link: Link<ShellSession>) {
        match link {
            Link::HopReady(hop) => {
                let (Some(connector), Some(credentials)) =
                    (self.ctx.capabilities.shell.clone(), self.login.clone())
                else {
                    self.fail(Notice::Connectionerror).await;
                    return;
                };
                let (client_io, relay_io) = loopback::pipe(PIPE_CAPACITY);
                spawn_bridge(&mut self.core, hop, relay_io, self.link_tx.clone());

                let size = self.size;
                let tx = self.link_tx.clone();
                self.core.spawn(async move {
                    let result = connector.connect(client_io, credentials, size).await;
                    let _ = tx.send(Link::Connected(result)).await;
                });
            }
            Link::HopFailed(e) => {
                warn!(session_id = %self.core.id, error = %e, "relay hop failed");
                self.fail(Notice::Connectionerror).await;
            }
            Link::Connected(result) => self.on_connected(result).await,
            Link::BridgeEnded(outcome) => {
                debug!(
                    session_id = %self.core.id,
                    ended_by = ?outcome.ended_by,
                    error = ?outcome.error,
                    "relay hop bridge ended"
                );
                if self.core.state() < SessionState::Active {
                    self.fail(Notice::Connectionerror).await;
                } else {
                    self.close(CloseMode::Soft).await;
                }
            }
        }
    }

    async fn on_connected(&mut self, result: UpstreamResult<ShellSession>) {
        let credentials = self.login.take();
        let shell = match result {
            Ok(shell) => shell,
            Err(e) => {
                warn!(session_id = %self.core.id, error = %e, "shell connect failed");
                let notice = match e {
                    UpstreamError::Auth => Notice::Autherror,
                    UpstreamError::Timeout => Notice::Sessiontimeout,
                    _ => Notice::Connectionerror,
                };
                self.fail(notice).await;
                return;
            }
        };

        self.core.disarm_deadline();
        if self.keep {
            if let Some(credentials) = credentials {
                save_credentials(&self.ctx, &self.route, credentials).await;
            }
        }
        self.control = Some(shell.control);
        self.output = Some(shell.events);
        self.core.advance(SessionState::Active);
        info!(session_id = %self.core.id, rows = self.size.rows, cols = self.size.cols, "shell ready");
        if self.core.send(Frame::Text(READY_SIGNAL.to_string())).await.is_err() {
            self.close(CloseMode::Soft).await;
        }
    }

    /// Report a failure to the client, then close.
    async fn fail(&mut self, notice: Notice) {
        let _ = self.core.send_notice(notice).await;
        self.close(CloseMode::Soft).await;
    }

    async fn close(&mut self, mode: CloseMode) {
        if !self.core.begin_close() {
            return;
        }
        self.login = None;
        self.stored = None;
        if let Some(mut control) = self.control.take() {
            control.close().await;
        }
        self.output = None;
        self.core.finish_close(mode).await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::{serve, Flavor};
    use crate::store::{CredentialStore, Credentials};
    use crate::transport::memory;
    use apprelay_core::Frame;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn sshauth(password: &str, keep: bool) -> serde_json::Value {
        json!({
            "action": "sshauth",
            "username": USERNAME,
            "password": password,
            "rows": 24, "cols": 80, "height": 480, "width": 640,
            "keep": keep
        })
    }

    #[tokio::test]
    async fn login_echo_and_keep() {
        let harness = Harness::new();
        let ctx = harness.context(CapabilitySet::all());
        let (server_side, mut client) = memory::pair(32);
        let session = tokio::spawn(serve(ctx.clone(), Flavor::ShellTerminal, server_side, Some(route())));

        assert_eq!(recv_json(&mut client).await["action"], "sshauth");
        send_json(&mut client, sshauth(PASSWORD, true)).await;
        assert_eq!(recv_frame(&mut client).await, Frame::Text("c".into()));
        assert_eq!(recv_frame(&mut client).await, Frame::Text("~$ ".into()));

        client.sink.send(Frame::Text("~ls\r".into())).await.unwrap();
        assert_eq!(recv_frame(&mut client).await, Frame::Text("~ls\r".into()));

        send_json(&mut client, json!({"action":"resize","rows":50,"cols":132,"height":0,"width":0})).await;
        client.sink.send(Frame::Text("~exit".into())).await.unwrap();
        expect_closed(&mut client).await;
        session.await.unwrap();

        let windows = harness.shell.windows.lock().unwrap().clone();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[1].cols, 132);
        assert!(harness.shell.closed.load(Ordering::SeqCst));

        let stored = harness.credentials.get(&route().node_id).await.unwrap();
        assert_eq!(stored.unwrap().username, USERNAME);
        let events = harness.events.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1.action, "changenode");
        assert_eq!(ctx.registry.count().await, 0);

        let urls = harness.hop.urls.lock().unwrap().clone();
        assert!(urls[0].contains("meshrelay.ashx?noping=1&p=11&auth="));
    }

    #[tokio::test]
    async fn wrong_password_is_autherror() {
        let harness = Harness::new();
        let ctx = harness.context(CapabilitySet::all());
        let (server_side, mut client) = memory::pair(32);
        let session = tokio::spawn(serve(ctx, Flavor::ShellTerminal, server_side, Some(route())));

        recv_json(&mut client).await;
        send_json(&mut client, sshauth("wrong", true)).await;
        assert_eq!(recv_json(&mut client).await, json!({"action":"autherror"}));
        expect_closed(&mut client).await;
        session.await.unwrap();

        assert_eq!(harness.shell.started.load(Ordering::SeqCst), 0);
        assert!(harness.credentials.get(&route().node_id).await.unwrap().is_none());
        assert!(harness.events.events().is_empty());
    }

    #[tokio::test]
    async fn stored_credentials_wait_for_autoauth() {
        let harness = Harness::new();
        harness
            .credentials
            .set(&route().node_id, Credentials::new(USERNAME, PASSWORD))
            .await
            .unwrap();
        let ctx = harness.context(CapabilitySet::all());
        let (server_side, mut client) = memory::pair(32);
        let session = tokio::spawn(serve(ctx, Flavor::ShellTerminal, server_side, Some(route())));

        assert_eq!(recv_json(&mut client).await["action"], "sshautoauth");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(harness.hop_connects(), 0);

        send_json(&mut client, json!({"action":"sshautoauth","rows":30,"cols":100,"height":0,"width":0})).await;
        assert_eq!(recv_frame(&mut client).await, Frame::Text("c".into()));
        assert_eq!(harness.shell.windows.lock().unwrap()[0].cols, 100);

        drop(client);
        session.await.unwrap();
        assert!(harness.shell.closed.load(Ordering::SeqCst));
        // Credentials were already stored: no change event.
        assert!(harness.events.events().is_empty());
    }

    #[tokio::test]
    async fn hop_refused_is_connectionerror() {
        let harness = Harness::with_hop(HopMode::Refuse);
        let ctx = harness.context(CapabilitySet::all());
        let (server_side, mut client) = memory::pair(32);
        tokio::spawn(serve(ctx, Flavor::ShellTerminal, server_side, Some(route())));

        recv_json(&mut client).await;
        send_json(&mut client, sshauth(PASSWORD, false)).await;
        assert_eq!(recv_json(&mut client).await["action"], "connectionerror");
        expect_closed(&mut client).await;
    }

    #[tokio::test]
    async fn silent_hop_times_out() {
        let mut harness = Harness::with_hop(HopMode::Silent);
        harness.settings.connect_timeout = Duration::from_millis(100);
        let ctx = harness.context(CapabilitySet::all());
        let (server_side, mut client) = memory::pair(32);
        tokio::spawn(serve(ctx.clone(), Flavor::ShellTerminal, server_side, Some(route())));

        recv_json(&mut client).await;
        send_json(&mut client, sshauth(PASSWORD, false)).await;
        assert_eq!(recv_json(&mut client).await["action"], "sessiontimeout");
        expect_closed(&mut client).await;
        assert_eq!(harness.shell.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_json_closes_without_notice() {
        let harness = Harness::new();
        let ctx = harness.context(CapabilitySet::all());
        let (server_side, mut client) = memory::pair(32);
        tokio::spawn(serve(ctx, Flavor::ShellTerminal, server_side, Some(route())));

        recv_json(&mut client).await;
        // Unknown actions are ignored.
        send_json(&mut client, json!({"action":"dance"})).await;
        client.sink.send(Frame::Text("{not json".into())).await.unwrap();
        let next = client.source.recv().await.unwrap();
        assert!(next.is_none());
        assert_eq!(harness.hop_connects(), 0);
    }

    #[tokio::test]
    async fn shutdown_closes_active_shell() {
        let harness = Harness::new();
        let ctx = harness.context(CapabilitySet::all());
        let (server_side, mut client) = memory::pair(32);
        let session = tokio::spawn(serve(ctx.clone(), Flavor::ShellTerminal, server_side, Some(route())));

        recv_json(&mut client).await;
        send_json(&mut client, sshauth(PASSWORD, false)).await;
        assert_eq!(recv_frame(&mut client).await, Frame::Text("c".into()));
        ctx.shutdown();
        expect_closed(&mut client).await;
        session.await.unwrap();
        assert!(harness.shell.closed.load(Ordering::SeqCst));
        assert_eq!(ctx.registry.count().await, 0);
    }
}
