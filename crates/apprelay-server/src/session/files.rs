//! Web file transfer relay.
//!
//! Control JSON arrives as text or as a binary frame starting with `{`;
//! any other binary frame is an upload chunk.

use super::transfer::{FileTransferHandler, TransferLimits};
use super::{
    hop_target, save_credentials, sleep_opt, spawn_bridge, spawn_hop, stored_credentials, Link,
    SessionCore, SessionState,
};
use crate::context::EngineContext;
use crate::loopback;
use crate::store::Credentials;
use crate::transport::hop::PROTOCOL_SSH;
use crate::upstream::{FileChannel, UpstreamError, UpstreamResult};
use apprelay_core::codec::{is_json_control, READY_SIGNAL};
use apprelay_core::messages::FileRequest;
use apprelay_core::{parse_control, CloseMode, Frame, FramePair, FrameSource, Notice, RelayResult, RouteInfo};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

const PIPE_CAPACITY: usize = 64 * 1024;

type Channel = Box<dyn FileChannel>;

enum Step {
    Downstream(RelayResult<Option<Frame>>),
    Link(Link<Channel>),
    Timeout,
    Shutdown,
}

pub struct FileRelay {
    ctx: Arc<EngineContext>,
    core: SessionCore,
    source: Box<dyn FrameSource>,
    route: RouteInfo,
    link_tx: mpsc::Sender<Link<Channel>>,
    link_rx: mpsc::Receiver<Link<Channel>>,
    shutdown: broadcast::Receiver<()>,
    login: Option<Credentials>,
    keep: bool,
    handler: Option<FileTransferHandler>,
}

impl FileRelay {
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
            login: None,
            keep: false,
            handler: None,
        }
    }

    pub async fn run(mut self) {
        info!(session_id = %self.core.id, node = %self.route.node_id, "file session started");
        self.start().await;

        while !self.core.is_closing() {
            let step = tokio::select! {
                frame = self.source.recv() => Step::Downstream(frame),
                Some(link) = self.link_rx.recv() => Step::Link(link),
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
                Step::Timeout => {
                    warn!(session_id = %self.core.id, "connect timed out");
                    self.fail(Notice::Sessiontimeout).await;
                }
                Step::Shutdown => self.close(CloseMode::Soft).await,
            }
        }
    }

    async fn start(&mut self) {
        match stored_credentials(&self.ctx, &self.route).await {
            Some(credentials) => {
                if self.core.send_notice(Notice::Sshautoauth).await.is_err() {
                    self.close(CloseMode::Soft).await;
                    return;
                }
                self.begin_login(credentials, false).await;
            }
            None => {
                self.core.advance(SessionState::AwaitingCredentials);
                if self.core.send_notice(Notice::Sshauth).await.is_err() {
                    self.close(CloseMode::Soft).await;
                }
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame) {
        let data = match frame {
            Frame::Binary(data) if !is_json_control(&data) => {
                self.on_chunk(&data).await;
                return;
            }
            other => other.into_bytes(),
        };

        let request = match parse_control::<FileRequest>(&data) {
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

        if let FileRequest::Sshauth(login) = request {
            let keep = login.keep == Some(true);
            self.begin_login(Credentials::new(login.username, login.password), keep)
                .await;
            return;
        }

        let Some(handler) = self.handler.as_mut() else {
            debug!(session_id = %self.core.id, "file request before the channel is ready");
            return;
        };
        let Ok(sink) = self.core.sink() else {
            return;
        };
        if let Err(e) = handler.handle(request, sink).await {
            debug!(session_id = %self.core.id, error = %e, "reply failed");
            self.close(CloseMode::Soft).await;
        }
    }

    async fn on_chunk(&mut self, data: &[u8]) {
        let Some(handler) = self.handler.as_mut() else {
            return;
        };
        let Ok(sink) = self.core.sink() else {
            return;
        };
        if let Err(e) = handler.upload_chunk(data, sink).await {
            debug!(session_id = %self.core.id, error = %e, "reply failed");
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
        info!(session_id = %self.core.id, user = %credentials.username, "connecting file channel");
        self.login = Some(credentials);
        self.keep = keep;
        self.core.advance(SessionState::ConnectingUpstream);
        self.core.arm_deadline(self.ctx.settings.connect_timeout);
        spawn_hop(&mut self.core, self.ctx.hop.clone(), url, self.link_tx.clone());
    }

    async fn on_link(&mut self, link: Link<Channel>) {
        match link {
            Link::HopReady(hop) => {
                let (Some(connector), Some(credentials)) =
                    (self.ctx.capabilities.files.clone(), self.login.clone())
                else {
                    self.fail(Notice::Connectionerror).await;
                    return;
                };
                let (client_io, relay_io) = loopback::pipe(PIPE_CAPACITY);
                spawn_bridge(&mut self.core, hop, relay_io, self.link_tx.clone());

                let tx = self.link_tx.clone();
                self.core.spawn(async move {
                    let result = connector.connect(client_io, credentials).await;
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

    async fn on_connected(&mut self, result: UpstreamResult<Channel>) {
        let credentials = self.login.take();
        let channel = match result {
            Ok(channel) => channel,
            Err(e) => {
                warn!(session_id = %self.core.id, error = %e, "file channel connect failed");
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
        let settings = &self.ctx.settings;
        let limits = TransferLimits {
            block_size: settings.block_size,
            default_window: settings.default_window,
            max_window: settings.max_window,
        };
        self.handler = Some(FileTransferHandler::new(
            channel,
            limits,
            self.route.clone(),
            self.ctx.events.clone(),
        ));
        self.core.advance(SessionState::Active);
        info!(session_id = %self.core.id, "file channel ready");
        if self.core.send(Frame::Text(READY_SIGNAL.to_string())).await.is_err() {
            self.close(CloseMode::Soft).await;
        }
    }

    async fn fail(&mut self, notice: Notice) {
        let _ = self.core.send_notice(notice).await;
        self.close(CloseMode::Soft).await;
    }

    async fn close(&mut self, mode: CloseMode) {
        if !self.core.begin_close() {
            return;
        }
        self.login = None;
        if let Some(mut handler) = self.handler.take() {
            handler.release().await;
        }
        self.core.finish_close(mode).await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::{serve, Flavor};
    use crate::store::{CredentialStore, Credentials};
    use crate::transport::memory;
    use apprelay_core::{decode_block, BlockStatus, Frame};
    use serde_json::json;

    fn sshauth(password: &str) -> serde_json::Value {
        json!({"action":"sshauth","username":USERNAME,"password":password,"keep":true})
    }

    #[tokio::test]
    async fn login_then_list_upload_download() {
        let harness = Harness::new();
        std::fs::create_dir(harness.files_root.path().join("home")).unwrap();
        std::fs::write(harness.files_root.path().join("home/notes.txt"), vec![b'n'; 100]).unwrap();
        let ctx = harness.context(CapabilitySet::all());
        let (server_side, mut client) = memory::pair(64);
        let session = tokio::spawn(serve(ctx.clone(), Flavor::FileTransfer, server_side, Some(route())));

        assert_eq!(recv_json(&mut client).await["action"], "sshauth");
        // Requests before login are ignored.
        send_json(&mut client, json!({"action":"ls","path":"/home","reqid":0})).await;
        send_json(&mut client, sshauth(PASSWORD)).await;
        assert_eq!(recv_frame(&mut client).await, Frame::Text("c".into()));

        // Control JSON in a binary frame.
        let ls = json!({"action":"ls","path":"/home","reqid":1}).to_string();
        client.sink.send(Frame::Binary(ls.into_bytes())).await.unwrap();
        let listing = recv_json(&mut client).await;
        assert_eq!(listing["reqid"], 1);
        assert_eq!(listing["dir"][0]["s"], 100);

        send_json(&mut client, json!({"action":"upload","path":"/home","name":"up.bin","size":3,"reqid":2})).await;
        assert_eq!(recv_json(&mut client).await["action"], "uploadstart");
        client.sink.send(Frame::Binary(vec![0, 1, 2, 3])).await.unwrap();
        assert_eq!(recv_json(&mut client).await["action"], "uploadack");
        send_json(&mut client, json!({"action":"uploaddone","reqid":2})).await;
        assert_eq!(recv_json(&mut client).await["action"], "uploaddone");
        assert_eq!(
            std::fs::read(harness.files_root.path().join("home/up.bin")).unwrap(),
            vec![1, 2, 3]
        );

        // Block size 64: 100 bytes arrive as 60 + 40.
        send_json(&mut client, json!({"action":"download","sub":"start","path":"/home/notes.txt","id":3})).await;
        assert_eq!(recv_json(&mut client).await["sub"], "start");
        send_json(&mut client, json!({"action":"download","sub":"startack","id":3})).await;
        let first = recv_frame(&mut client).await.into_bytes();
        let second = recv_frame(&mut client).await.into_bytes();
        assert_eq!(decode_block(&first).unwrap().0, BlockStatus::More);
        let (status, payload) = decode_block(&second).unwrap();
        assert_eq!(status, BlockStatus::Final);
        assert_eq!(payload.len(), 40);

        drop(client);
        session.await.unwrap();
        assert_eq!(ctx.registry.count().await, 0);
        assert!(harness.credentials.get(&route().node_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stored_credentials_connect_immediately() {
        let harness = Harness::new();
        harness
            .credentials
            .set(&route().node_id, Credentials::new(USERNAME, PASSWORD))
            .await
            .unwrap();
        let ctx = harness.context(CapabilitySet::all());
        let (server_side, mut client) = memory::pair(64);
        tokio::spawn(serve(ctx, Flavor::FileTransfer, server_side, Some(route())));

        assert_eq!(recv_json(&mut client).await["action"], "sshautoauth");
        assert_eq!(recv_frame(&mut client).await, Frame::Text("c".into()));
        assert_eq!(harness.hop_connects(), 1);
    }

    #[tokio::test]
    async fn wrong_password_is_autherror() {
        let harness = Harness::new();
        let ctx = harness.context(CapabilitySet::all());
        let (server_side, mut client) = memory::pair(64);
        tokio::spawn(serve(ctx, Flavor::FileTransfer, server_side, Some(route())));

        recv_json(&mut client).await;
        send_json(&mut client, sshauth("nope")).await;
        assert_eq!(recv_json(&mut client).await, json!({"action":"autherror"}));
        expect_closed(&mut client).await;
        assert!(harness.credentials.get(&route().node_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn hop_closing_ends_session() {
        let harness = Harness::new();
        let ctx = harness.context(CapabilitySet::all());
        let (server_side, mut client) = memory::pair(64);
        tokio::spawn(serve(ctx, Flavor::FileTransfer, server_side, Some(route())));

        recv_json(&mut client).await;
        send_json(&mut client, sshauth(PASSWORD)).await;
        assert_eq!(recv_frame(&mut client).await, Frame::Text("c".into()));
        drop(harness.hop.take_far().await);
        expect_closed(&mut client).await;
    }

    #[tokio::test]
    async fn text_that_is_not_json_closes() {
        let harness = Harness::new();
        let ctx = harness.context(CapabilitySet::all());
        let (server_side, mut client) = memory::pair(64);
        tokio::spawn(serve(ctx, Flavor::FileTransfer, server_side, Some(route())));

        recv_json(&mut client).await;
        client.sink.send(Frame::Text("hello".into())).await.unwrap();
        assert!(client.source.recv().await.unwrap().is_none());
    }
}
