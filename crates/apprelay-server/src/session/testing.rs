//! Scripted collaborators for session tests.

use crate::context::{Capabilities, EngineContext, EngineSettings};
use crate::store::{Credentials, MemoryCredentialStore, MemoryDispatch};
use crate::transport::hop::HopConnector;
use crate::transport::memory;
use crate::upstream::local_fs::LocalFileConnector;
use crate::upstream::{
    DesktopClient, DesktopConnector, DesktopControl, DesktopEvent, DesktopInput, DesktopParams,
    ShellConnector, ShellControl, ShellEvent, ShellSession, UpstreamError, UpstreamResult,
    UpstreamStream,
};
use apprelay_core::{
    BoxFuture, CookieCodec, Frame, FramePair, HmacCookieCodec, RelayError, RelayResult, RouteInfo,
    TerminalSize,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

pub(crate) const USERNAME: &str = "alice";
pub(crate) const PASSWORD: &str = "secret";

pub(crate) fn route() -> RouteInfo {
    RouteInfo {
        user_id: "user/corp/alice".into(),
        domain_id: "corp".into(),
        node_id: "node/corp/n1".into(),
        tcp_port: 22,
        local: false,
        groups: vec!["corp".into()],
    }
}

/// Next frame from the client side, failing the test after a few seconds.
pub(crate) async fn recv_frame(client: &mut FramePair) -> Frame {
    tokio::time::timeout(Duration::from_secs(5), client.source.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("transport error")
        .expect("transport closed")
}

pub(crate) async fn recv_json(client: &mut FramePair) -> Value {
    let frame = recv_frame(client).await;
    serde_json::from_slice(&frame.into_bytes()).expect("frame is not JSON")
}

/// Wait for the server side to close, skipping frames still in flight.
pub(crate) async fn expect_closed(client: &mut FramePair) {
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Ok(Some(_)) = client.source.recv().await {}
    })
    .await;
    assert!(closed.is_ok(), "session did not close");
}

pub(crate) async fn send_json(client: &mut FramePair, value: Value) {
    client.sink.send(Frame::Text(value.to_string())).await.unwrap();
}

// ── Relay hop ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HopMode {
    /// Connects and sends the ready signal.
    Ready,
    /// Connects but never signals ready.
    Silent,
    /// Refuses the connection.
    Refuse,
}

/// In-memory hop. Keeps the far end of every connection for inspection.
pub(crate) struct MemoryHop {
    pub connects: AtomicUsize,
    pub urls: Mutex<Vec<String>>,
    mode: HopMode,
    far: tokio::sync::Mutex<Vec<FramePair>>,
}

impl MemoryHop {
    pub fn new(mode: HopMode) -> Self {
        Self {
            connects: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
            mode,
            far: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Far end of the first open connection, waiting for one to appear.
    pub async fn take_far(&self) -> FramePair {
        for _ in 0..500 {
            if let Some(far) = self.far.lock().await.pop() {
                return far;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no hop connection was made");
    }
}

impl HopConnector for MemoryHop {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, RelayResult<FramePair>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().unwrap().push(url.to_string());
            if self.mode == HopMode::Refuse {
                return Err(RelayError::Transport("connection refused".into()));
            }
            let (near, mut far) = memory::pair(64);
            if self.mode == HopMode::Ready {
                far.sink.send(Frame::Text("c".into())).await?;
            }
            self.far.lock().await.push(far);
            Ok(near)
        })
    }
}

// ── Shell ────────────────────────────────────────────────────────────

/// Shell that checks the password, greets with `$ ` and echoes input.
/// Writing `exit` ends it.
#[derive(Default)]
pub(crate) struct ScriptedShell {
    pub started: Arc<AtomicUsize>,
    pub windows: Arc<Mutex<Vec<TerminalSize>>>,
    pub closed: Arc<AtomicBool>,
    /// Never finish the handshake.
    pub hang: AtomicBool,
}

struct EchoShell {
    tx: Option<mpsc::Sender<ShellEvent>>,
    windows: Arc<Mutex<Vec<TerminalSize>>>,
    closed: Arc<AtomicBool>,
    _io: UpstreamStream,
}

impl ShellConnector for ScriptedShell {
    fn connect(
        &self,
        io: UpstreamStream,
        credentials: Credentials,
        size: TerminalSize,
    ) -> BoxFuture<'_, UpstreamResult<ShellSession>> {
        Box::pin(async move {
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if credentials != Credentials::new(USERNAME, PASSWORD) {
                return Err(UpstreamError::Auth);
            }
            self.started.fetch_add(1, Ordering::SeqCst);
            self.windows.lock().unwrap().push(size);
            let (tx, rx) = mpsc::channel(16);
            let _ = tx.send(ShellEvent::Data(b"$ ".to_vec())).await;
            Ok(ShellSession {
                control: Box::new(EchoShell {
                    tx: Some(tx),
                    windows: self.windows.clone(),
                    closed: self.closed.clone(),
                    _io: io,
                }),
                events: rx,
            })
        })
    }
}

impl ShellControl for EchoShell {
    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, UpstreamResult<()>> {
        Box::pin(async move {
            let Some(tx) = &self.tx else {
                return Err(UpstreamError::Other("shell closed".into()));
            };
            let event = if data == b"exit" {
                ShellEvent::Closed
            } else {
                ShellEvent::Data(data.to_vec())
            };
            tx.send(event)
                .await
                .map_err(|_| UpstreamError::Other("shell closed".into()))
        })
    }

    fn set_window(&mut self, size: TerminalSize) -> BoxFuture<'_, UpstreamResult<()>> {
        Box::pin(async move {
            self.windows.lock().unwrap().push(size);
            Ok(())
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.tx = None;
            self.closed.store(true, Ordering::SeqCst);
        })
    }
}

// ── Remote desktop ───────────────────────────────────────────────────

/// Desktop client that dials the loopback address, writes `rdp-hello`,
/// reports a connection and one bitmap, and records input.
#[derive(Default)]
pub(crate) struct ScriptedDesktop {
    pub inputs: Arc<Mutex<Vec<DesktopInput>>>,
    pub params: Arc<Mutex<Vec<DesktopParams>>>,
    pub closed: Arc<AtomicBool>,
}

struct DesktopScript {
    inputs: Arc<Mutex<Vec<DesktopInput>>>,
    closed: Arc<AtomicBool>,
}

impl DesktopConnector for ScriptedDesktop {
    fn start(&self, addr: SocketAddr, params: DesktopParams) -> BoxFuture<'_, UpstreamResult<DesktopClient>> {
        Box::pin(async move {
            self.params.lock().unwrap().push(params);
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                let mut stream = match TcpStream::connect(addr).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = tx.send(DesktopEvent::Error(e.to_string())).await;
                        return;
                    }
                };
                let _ = stream.write_all(b"rdp-hello").await;
                let _ = tx.send(DesktopEvent::Connected).await;
                let _ = tx
                    .send(DesktopEvent::Bitmap {
                        data: vec![1, 2, 3],
                        meta: json!({"x": 0, "y": 0, "w": 1, "h": 1}),
                    })
                    .await;
                tx.closed().await;
            });
            Ok(DesktopClient {
                control: Box::new(DesktopScript {
                    inputs: self.inputs.clone(),
                    closed: self.closed.clone(),
                }),
                events: rx,
            })
        })
    }
}

impl DesktopControl for DesktopScript {
    fn send(&mut self, input: DesktopInput) -> BoxFuture<'_, UpstreamResult<()>> {
        Box::pin(async move {
            self.inputs.lock().unwrap().push(input);
            Ok(())
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
        })
    }
}

// ── Harness ──────────────────────────────────────────────────────────

/// Which capabilities a test context links.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CapabilitySet {
    desktop: bool,
    shell: bool,
    files: bool,
}

impl CapabilitySet {
    pub fn none() -> Self {
        Self {
            desktop: false,
            shell: false,
            files: false,
        }
    }

    pub fn all() -> Self {
        Self {
            desktop: true,
            shell: true,
            files: true,
        }
    }
}

pub(crate) struct Harness {
    pub hop: Arc<MemoryHop>,
    pub credentials: Arc<MemoryCredentialStore>,
    pub events: Arc<MemoryDispatch>,
    pub cookies: Arc<HmacCookieCodec>,
    pub shell: Arc<ScriptedShell>,
    pub desktop: Arc<ScriptedDesktop>,
    pub files_root: tempfile::TempDir,
    pub settings: EngineSettings,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_hop(HopMode::Ready)
    }

    pub fn with_hop(mode: HopMode) -> Self {
        Self {
            hop: Arc::new(MemoryHop::new(mode)),
            credentials: Arc::new(MemoryCredentialStore::new()),
            events: Arc::new(MemoryDispatch::new()),
            cookies: Arc::new(HmacCookieCodec::new(&[7u8; 32], 3600)),
            shell: Arc::new(ScriptedShell::default()),
            desktop: Arc::new(ScriptedDesktop::default()),
            files_root: tempfile::tempdir().unwrap(),
            settings: EngineSettings {
                connect_timeout: Duration::from_secs(5),
                block_size: 64,
                ..EngineSettings::default()
            },
        }
    }

    pub fn context(&self, caps: CapabilitySet) -> Arc<EngineContext> {
        self.context_with_limit(caps, 16)
    }

    pub fn context_with_limit(&self, caps: CapabilitySet, max_sessions: usize) -> Arc<EngineContext> {
        let mut capabilities = Capabilities::default();
        if caps.desktop {
            capabilities.desktop = Some(self.desktop.clone());
        }
        if caps.shell {
            capabilities.shell = Some(self.shell.clone());
        }
        if caps.files {
            let files = LocalFileConnector::new(self.files_root.path())
                .with_credentials(Credentials::new(USERNAME, PASSWORD));
            capabilities.files = Some(Arc::new(files));
        }
        Arc::new(EngineContext::new(
            self.settings.clone(),
            self.cookies.clone(),
            self.credentials.clone(),
            self.events.clone(),
            self.hop.clone(),
            capabilities,
            max_sessions,
        ))
    }

    /// A routing cookie for [`route`].
    pub fn cookie(&self) -> String {
        self.cookies.encode(&route()).unwrap()
    }

    pub fn hop_connects(&self) -> usize {
        self.hop.connects.load(Ordering::SeqCst)
    }
}
