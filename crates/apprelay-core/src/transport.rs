//! Abstract message-framed transports for apprelay.
//!
//! Both the browser-facing connection and the relay hop are message
//! oriented: every frame is either text (JSON control, terminal data) or
//! binary (pixels, file blocks). Sessions only talk to these traits.

use crate::error::RelayResult;
use std::future::Future;
use std::pin::Pin;

/// Boxed future used by the object-safe traits in this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A single transport message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(t) => t.len(),
            Frame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consume the frame, returning its raw bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Frame::Text(t) => t.into_bytes(),
            Frame::Binary(b) => b,
        }
    }

    /// Whether this is the one-byte text frame `c`.
    ///
    /// Relay hops send it once the far side is attached, and terminal
    /// sessions send it to the browser when the remote shell is up.
    pub fn is_ready_signal(&self) -> bool {
        match self {
            Frame::Text(t) => t == crate::codec::READY_SIGNAL,
            Frame::Binary(b) => b.as_slice() == crate::codec::READY_SIGNAL.as_bytes(),
        }
    }
}

/// How a transport should be shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloseMode {
    /// Graceful close handshake.
    #[default]
    Soft,
    /// Drop the underlying connection without a close handshake.
    Hard,
}

/// Outbound half of a message transport.
pub trait FrameSink: Send {
    /// Send one frame. Resolves once the transport accepted it, which is
    /// the completion the relay uses for flow control.
    fn send<'a>(&'a mut self, frame: Frame) -> BoxFuture<'a, RelayResult<()>>;

    /// Close the transport. Calling this more than once is a no-op.
    fn close(&mut self, mode: CloseMode) -> BoxFuture<'_, RelayResult<()>>;
}

/// Inbound half of a message transport.
pub trait FrameSource: Send {
    /// Receive the next frame. `Ok(None)` means the peer closed.
    fn recv(&mut self) -> BoxFuture<'_, RelayResult<Option<Frame>>>;
}

/// Both halves of a connected transport.
pub struct FramePair {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}
