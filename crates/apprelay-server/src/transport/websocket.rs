//! WebSocket transport using tokio-tungstenite.
//!
//! The listener accepts browser connections and records the request path,
//! which selects the relay flavor. Accepted streams are split into a
//! [`FrameSink`]/[`FrameSource`] pair; the same adapters wrap client
//! connections to the relay hop.

use apprelay_core::{BoxFuture, CloseMode, Frame, FramePair, FrameSink, FrameSource, RelayError, RelayResult};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Maximum frame size for WebSocket messages (1 MiB).
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub frames: FramePair,
    /// Request path including the query string.
    pub path: String,
    /// Remote address.
    pub remote_addr: SocketAddr,
}

/// Start the WebSocket listener.
///
/// Returns the bound address and a receiver that yields accepted
/// connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> RelayResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| RelayError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match accept_with_path(stream).await {
                            Ok((ws_stream, path)) => {
                                debug!(remote = %addr, path = %path, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    frames: split(ws_stream),
                                    path,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

async fn accept_with_path(
    stream: TcpStream,
) -> Result<(WebSocketStream<TcpStream>, String), tokio_tungstenite::tungstenite::Error> {
    let mut path = String::new();
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| req.uri().path().to_string());
        Ok(resp)
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    Ok((ws_stream, path))
}

/// Split a WebSocket into frame transport halves.
pub fn split<S>(ws: WebSocketStream<S>) -> FramePair
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    FramePair {
        sink: Box::new(WsSink { inner: Some(sink) }),
        source: Box::new(WsSource { inner: stream }),
    }
}

pub struct WsSink<S> {
    inner: Option<SplitSink<WebSocketStream<S>, Message>>,
}

impl<S> FrameSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn send<'a>(&'a mut self, frame: Frame) -> BoxFuture<'a, RelayResult<()>> {
        Box::pin(async move {
            let sink = self.inner.as_mut().ok_or(RelayError::Closed)?;
            let msg = match frame {
                Frame::Text(text) => Message::Text(text),
                Frame::Binary(data) => Message::Binary(data),
            };
            sink.send(msg)
                .await
                .map_err(|e| RelayError::Transport(format!("WS send failed: {e}")))
        })
    }

    fn close(&mut self, mode: CloseMode) -> BoxFuture<'_, RelayResult<()>> {
        Box::pin(async move {
            let Some(mut sink) = self.inner.take() else {
                return Ok(());
            };
            match mode {
                CloseMode::Soft => sink
                    .close()
                    .await
                    .map_err(|e| RelayError::Transport(format!("WS close failed: {e}"))),
                // No close frame; the socket goes away with the last half.
                CloseMode::Hard => Ok(()),
            }
        })
    }
}

pub struct WsSource<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

impl<S> FrameSource for WsSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Control frames are skipped; pings are answered by tungstenite.
    fn recv(&mut self) -> BoxFuture<'_, RelayResult<Option<Frame>>> {
        Box::pin(async move {
            loop {
                let msg = match self.inner.next().await {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        return Err(RelayError::Transport(format!("WS recv failed: {e}")))
                    }
                    None => return Ok(None),
                };
                if msg.len() > MAX_WS_FRAME_SIZE {
                    return Err(RelayError::InvalidMessage(format!(
                        "WS frame too large: {} bytes (max {})",
                        msg.len(),
                        MAX_WS_FRAME_SIZE
                    )));
                }
                match msg {
                    Message::Text(text) => return Ok(Some(Frame::Text(text))),
                    Message::Binary(data) => return Ok(Some(Frame::Binary(data))),
                    Message::Close(_) => return Ok(None),
                    _ => continue,
                }
            }
        })
    }
}
