//! Single-connection loopback socket for socket-only upstream clients.
//!
//! The remote desktop client insists on dialing a socket address. The
//! adapter binds an ephemeral port on 127.0.0.1, accepts exactly one
//! connection and closes the listener immediately afterwards, so any later
//! dial is refused. Stream-only clients use [`pipe`] instead.

use apprelay_core::{RelayError, RelayResult};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

pub struct LoopbackAdapter {
    listener: TcpListener,
    addr: SocketAddr,
}

impl LoopbackAdapter {
    pub async fn bind() -> RelayResult<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|e| RelayError::Transport(format!("loopback bind failed: {e}")))?;
        let addr = listener.local_addr()?;
        debug!(addr = %addr, "loopback listener bound");
        Ok(Self { listener, addr })
    }

    /// Address the upstream client should dial.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accept the single connection. The listener is dropped on return.
    pub async fn accept_one(self) -> RelayResult<TcpStream> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        debug!(addr = %self.addr, peer = %peer, "loopback connection accepted, listener closed");
        Ok(stream)
    }
}

/// In-process byte pipe for stream-only clients.
pub fn pipe(capacity: usize) -> (tokio::io::DuplexStream, tokio::io::DuplexStream) {
    tokio::io::duplex(capacity)
}
