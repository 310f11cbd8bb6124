//! Web remote desktop relay.
//!
//! The client opens with `["infos", {...}]`, whose `ip` field carries the
//! routing cookie. The desktop client dials a loopback socket; its single
//! connection is bridged to the relay hop.

use super::{hop_target, open_hop, recv_opt, sleep_opt, Link, SessionCore, SessionState};
use crate::bridge::{self, BRIDGE_CHUNK};
use crate::context::EngineContext;
use crate::loopback::LoopbackAdapter;
use crate::store::Credentials;
use crate::transport::hop::PROTOCOL_DESKTOP;
use crate::upstream::{DesktopControl, DesktopEvent, DesktopInput, DesktopParams};
use apprelay_core::messages::{
    desktop_bitmap, desktop_closed, desktop_connected, desktop_error, DesktopInfos, DesktopRequest,
};
use apprelay_core::{CloseMode, Frame, FramePair, FrameSource, Notice, RelayError, RelayResult};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

enum Step {
    Downstream(RelayResult<Option<Frame>>),
    Link(Link<()>),
    Desktop(Option<DesktopEvent>),
    Timeout,
    Shutdown,
}

pub struct DesktopRelay {
    ctx: Arc<EngineContext>,
    core: SessionCore,
    source: Box<dyn FrameSource>,
    link_tx: mpsc::Sender<Link<()>>,
    link_rx: mpsc::Receiver<Link<()>>,
    shutdown: broadcast::Receiver<()>,
    control: Option<Box<dyn DesktopControl>>,
    events: Option<mpsc::Receiver<DesktopEvent>>,
}

impl DesktopRelay {
    pub fn new(ctx: Arc<EngineContext>, id: String, frames: FramePair) -> Self {
        let (link_tx, link_rx) = mpsc::channel(4);
        let shutdown = ctx.subscribe_shutdown();
        Self {
            core: SessionCore::new(id, frames.sink),
            source: frames.source,
            ctx,
            link_tx,
            link_rx,
            shutdown,
            control: None,
            events: None,
        }
    }

    pub async fn run(mut self) {
        info!(session_id = %self.core.id, "desktop session started");

        while !self.core.is_closing() {
            let step = tokio::select! {
                frame = self.source.recv() => Step::Downstream(frame),
                Some(link) = self.link_rx.recv() => Step::Link(link),
                event = recv_opt(&mut self.events) => Step::Desktop(event),
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
                Step::Link(Link::HopFailed(e)) => {
                    // Posted only while the hop was never ready, so the
                    // target was not reached.
                    warn!(session_id = %self.core.id, error = %e, "relay link failed");
                    let _ = self.core.send_notice(Notice::Connectionerror).await;
                    self.close(CloseMode::Soft).await;
                }
                Step::Link(Link::BridgeEnded(outcome)) => {
                    debug!(
                        session_id = %self.core.id,
                        ended_by = ?outcome.ended_by,
                        to_hop = outcome.stats.to_frames,
                        from_hop = outcome.stats.to_stream,
                        "relay link ended"
                    );
                    self.close(CloseMode::Soft).await;
                }
                Step::Link(Link::HopReady(_) | Link::Connected(_)) => {}
                Step::Desktop(Some(event)) => self.on_event(event).await,
                Step::Desktop(None) => self.close(CloseMode::Soft).await,
                Step::Timeout => {
                    warn!(session_id = %self.core.id, "connect timed out");
                    let _ = self.core.send_notice(Notice::Sessiontimeout).await;
                    self.close(CloseMode::Soft).await;
                }
                Step::Shutdown => self.close(CloseMode::Soft).await,
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame) {
        let request = match DesktopRequest::parse(&frame.into_bytes()) {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                warn!(session_id = %self.core.id, error = %e, "protocol violation");
                self.close(CloseMode::Soft).await;
                return;
            }
        };

        let input = match request {
            DesktopRequest::Infos(infos) => {
                if self.core.state() >= SessionState::ConnectingUpstream {
                    debug!(session_id = %self.core.id, "duplicate infos ignored");
                } else {
                    self.on_infos(infos.0).await;
                }
                return;
            }
            DesktopRequest::Disconnect => {
                self.close(CloseMode::Soft).await;
                return;
            }
            DesktopRequest::Mouse { x, y, button, down } => DesktopInput::Pointer { x, y, button, down },
            DesktopRequest::Wheel {
                x,
                y,
                step,
                negative,
                horizontal,
            } => DesktopInput::Wheel {
                x,
                y,
                step,
                negative,
                horizontal,
            },
            DesktopRequest::Scancode { code, down } => DesktopInput::Scancode { code, down },
            DesktopRequest::Unicode { code, down } => DesktopInput::Unicode { code, down },
        };

        let Some(control) = self.control.as_mut() else {
            return;
        };
        if let Err(e) = control.send(input).await {
            warn!(session_id = %self.core.id, error = %e, "desktop input failed");
        }
    }

    async fn on_infos(&mut self, infos: DesktopInfos) {
        let Some(route) = self.ctx.cookies.decode(&infos.ip) else {
            warn!(session_id = %self.core.id, "invalid routing cookie in infos");
            self.close(CloseMode::Soft).await;
            return;
        };
        let Some(connector) = self.ctx.capabilities.desktop.clone() else {
            self.close(CloseMode::Soft).await;
            return;
        };
        self.ctx
            .registry
            .set_target(&self.core.id, route.node_id.clone())
            .await;

        let prepared = match hop_target(&self.ctx, &route, PROTOCOL_DESKTOP) {
            Ok(url) => LoopbackAdapter::bind().await.map(|adapter| (url, adapter)),
            Err(e) => Err(e),
        };
        let (url, adapter) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(session_id = %self.core.id, error = %e, "cannot prepare relay link");
                let _ = self.core.send(Frame::Text(desktop_error(&e.to_string()))).await;
                self.close(CloseMode::Soft).await;
                return;
            }
        };
        let addr = adapter.local_addr();
        info!(session_id = %self.core.id, node = %route.node_id, loopback = %addr, "starting desktop client");

        self.core.advance(SessionState::ConnectingUpstream);
        self.core.arm_deadline(self.ctx.settings.connect_timeout);

        let hop = self.ctx.hop.clone();
        let tx = self.link_tx.clone();
        self.core.spawn(async move {
            let link = async {
                let stream = adapter.accept_one().await?;
                let pair = open_hop(hop.as_ref(), &url).await?;
                Ok::<_, RelayError>((pair, stream))
            }
            .await;
            let message = match link {
                Ok((pair, stream)) => Link::BridgeEnded(bridge::run(pair, stream, BRIDGE_CHUNK).await),
                Err(e) => Link::HopFailed(e),
            };
            let _ = tx.send(message).await;
        });

        let params = DesktopParams {
            domain: infos.domain,
            credentials: Credentials::new(infos.username, infos.password),
            screen: infos.screen,
            locale: infos.locale,
        };
        match connector.start(addr, params).await {
            Ok(client) => {
                self.control = Some(client.control);
                self.events = Some(client.events);
            }
            Err(e) => {
                warn!(session_id = %self.core.id, error = %e, "desktop client failed to start");
                let _ = self.core.send(Frame::Text(desktop_error(&e.to_string()))).await;
                self.close(CloseMode::Soft).await;
            }
        }
    }

    async fn on_event(&mut self, event: DesktopEvent) {
        let sent = match event {
            DesktopEvent::Connected => {
                self.core.disarm_deadline();
                self.core.advance(SessionState::Active);
                info!(session_id = %self.core.id, "desktop connected");
                self.core.send(Frame::Text(desktop_connected())).await
            }
            DesktopEvent::Bitmap { data, meta } => {
                match self.core.send(Frame::Binary(data)).await {
                    Ok(()) => self.core.send(Frame::Text(desktop_bitmap(&meta))).await,
                    Err(e) => Err(e),
                }
            }
            DesktopEvent::Closed => {
                let _ = self.core.send(Frame::Text(desktop_closed())).await;
                self.close(CloseMode::Soft).await;
                return;
            }
            DesktopEvent::Error(message) => {
                warn!(session_id = %self.core.id, error = %message, "desktop client error");
                self.core.send(Frame::Text(desktop_error(&message))).await
            }
        };
        if sent.is_err() {
            self.close(CloseMode::Soft).await;
        }
    }

    async fn close(&mut self, mode: CloseMode) {
        if !self.core.begin_close() {
            return;
        }
        if let Some(mut control) = self.control.take() {
            control.close().await;
        }
        self.events = None;
        self.core.finish_close(mode).await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::{serve, Flavor};
    use super::*;
    use crate::transport::memory;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn infos(cookie: &str) -> serde_json::Value {
        json!(["infos", {
            "ip": cookie,
            "domain": "",
            "username": USERNAME,
            "password": PASSWORD,
            "screen": {"width": 800, "height": 600},
            "locale": "en-US"
        }])
    }

    #[tokio::test]
    async fn bridges_loopback_to_hop() {
        let harness = Harness::new();
        let ctx = harness.context(CapabilitySet::all());
        let (server_side, mut client) = memory::pair(32);
        let session = tokio::spawn(serve(ctx.clone(), Flavor::RemoteDesktop, server_side, None));

        // Input before infos has nowhere to go.
        send_json(&mut client, json!(["mouse", 1, 1, 0, 0])).await;
        send_json(&mut client, infos(&harness.cookie())).await;

        assert_eq!(recv_json(&mut client).await, json!(["rdp-connect"]));
        assert_eq!(recv_frame(&mut client).await, Frame::Binary(vec![1, 2, 3]));
        let bitmap = recv_json(&mut client).await;
        assert_eq!(bitmap[0], "rdp-bitmap");
        assert_eq!(bitmap[1]["w"], 1);

        let mut far = harness.hop.take_far().await;
        let mut received = Vec::new();
        while received.len() < b"rdp-hello".len() {
            let frame = far.source.recv().await.unwrap().unwrap();
            received.extend(frame.into_bytes());
        }
        assert_eq!(received, b"rdp-hello");

        send_json(&mut client, json!(["mouse", 10, 20, 1, 1])).await;
        send_json(&mut client, json!(["scancode", 30, true])).await;
        send_json(&mut client, json!(["disconnect"])).await;
        expect_closed(&mut client).await;
        session.await.unwrap();

        let inputs = harness.desktop.inputs.lock().unwrap().clone();
        assert_eq!(
            inputs,
            vec![
                DesktopInput::Pointer { x: 10, y: 20, button: 1, down: true },
                DesktopInput::Scancode { code: 30, down: true },
            ]
        );
        assert!(harness.desktop.closed.load(Ordering::SeqCst));
        assert_eq!(harness.desktop.params.lock().unwrap()[0].screen.width, 800);
        assert!(harness.hop.urls.lock().unwrap()[0].contains("&p=10&"));
        assert_eq!(ctx.registry.count().await, 0);
    }

    #[tokio::test]
    async fn bad_cookie_closes() {
        let harness = Harness::new();
        let ctx = harness.context(CapabilitySet::all());
        let (server_side, mut client) = memory::pair(32);
        tokio::spawn(serve(ctx, Flavor::RemoteDesktop, server_side, None));

        send_json(&mut client, infos("not-a-cookie")).await;
        assert!(client.source.recv().await.unwrap().is_none());
        assert_eq!(harness.hop_connects(), 0);
        assert!(harness.desktop.params.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn hop_refusal_sends_connectionerror() {
        let harness = Harness::with_hop(HopMode::Refuse);
        let ctx = harness.context(CapabilitySet::all());
        let (server_side, mut client) = memory::pair(32);
        let session = tokio::spawn(serve(ctx, Flavor::RemoteDesktop, server_side, None));

        send_json(&mut client, infos(&harness.cookie())).await;
        let mut notices = Vec::new();
        let drained = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while let Ok(Some(frame)) = client.source.recv().await {
                if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&frame.into_bytes()) {
                    notices.push(value);
                }
            }
        })
        .await;
        assert!(drained.is_ok(), "session did not close");
        assert!(notices.contains(&json!({"action": "connectionerror"})));
        session.await.unwrap();
        assert_eq!(harness.hop_connects(), 1);
        assert!(harness.desktop.closed.load(Ordering::SeqCst));
    }
}
