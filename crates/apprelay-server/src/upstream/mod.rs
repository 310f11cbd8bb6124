//! Upstream client capabilities.
//!
//! The relay never speaks SSH or RDP itself. It hands a byte stream (or,
//! for remote desktop, a loopback socket address) to one of these
//! capabilities and drives it through a narrow contract: structured
//! commands in, structured events out.

pub mod local_fs;

use crate::store::Credentials;
use apprelay_core::messages::ScreenSize;
use apprelay_core::{BoxFuture, TerminalSize};
use serde_json::Value;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::mpsc;

/// Byte stream handed to stream-oriented capabilities. The other end is
/// bridged to the relay hop.
pub type UpstreamStream = tokio::io::DuplexStream;

/// Failures reported by an upstream capability.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("authentication failed")]
    Auth,

    #[error("upstream timed out")]
    Timeout,

    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type UpstreamResult<T> = Result<T, UpstreamError>;

// ── Terminal ─────────────────────────────────────────────────────────

/// Output from a remote shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Data(Vec<u8>),
    Closed,
}

/// Commands accepted by a running shell.
pub trait ShellControl: Send {
    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, UpstreamResult<()>>;
    fn set_window(&mut self, size: TerminalSize) -> BoxFuture<'_, UpstreamResult<()>>;
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// An authenticated shell with its output channel.
pub struct ShellSession {
    pub control: Box<dyn ShellControl>,
    pub events: mpsc::Receiver<ShellEvent>,
}

/// Opens an interactive shell over a byte stream.
///
/// Resolves once authentication succeeded and the shell is running with
/// the given window size.
pub trait ShellConnector: Send + Sync {
    fn connect(
        &self,
        io: UpstreamStream,
        credentials: Credentials,
        size: TerminalSize,
    ) -> BoxFuture<'_, UpstreamResult<ShellSession>>;
}

// ── Files ────────────────────────────────────────────────────────────

/// Opaque handle owned by a [`FileChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Create or truncate.
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    /// Modification time, seconds since the Unix epoch.
    pub modified: i64,
}

/// Remote file system operations.
pub trait FileChannel: Send + Sync {
    fn open<'a>(&'a self, path: &'a str, mode: OpenMode) -> BoxFuture<'a, UpstreamResult<FileHandle>>;
    /// Read up to `len` bytes at `offset`. A short result means end of file.
    fn read(&self, handle: FileHandle, offset: u64, len: usize) -> BoxFuture<'_, UpstreamResult<Vec<u8>>>;
    fn write(&self, handle: FileHandle, offset: u64, data: Vec<u8>) -> BoxFuture<'_, UpstreamResult<()>>;
    fn close(&self, handle: FileHandle) -> BoxFuture<'_, UpstreamResult<()>>;
    fn readdir<'a>(&'a self, path: &'a str) -> BoxFuture<'a, UpstreamResult<Vec<DirEntry>>>;
    fn mkdir<'a>(&'a self, path: &'a str) -> BoxFuture<'a, UpstreamResult<()>>;
    fn unlink<'a>(&'a self, path: &'a str) -> BoxFuture<'a, UpstreamResult<()>>;
    fn rmdir<'a>(&'a self, path: &'a str) -> BoxFuture<'a, UpstreamResult<()>>;
    fn rename<'a>(&'a self, from: &'a str, to: &'a str) -> BoxFuture<'a, UpstreamResult<()>>;
    /// Tear the channel down. Handles still open are released.
    fn end(&self) -> BoxFuture<'_, ()>;
}

/// Opens a file channel over a byte stream.
pub trait FileConnector: Send + Sync {
    fn connect(
        &self,
        io: UpstreamStream,
        credentials: Credentials,
    ) -> BoxFuture<'_, UpstreamResult<Box<dyn FileChannel>>>;
}

// ── Remote desktop ───────────────────────────────────────────────────

/// Parameters from the client's `infos` message.
#[derive(Clone)]
pub struct DesktopParams {
    pub domain: String,
    pub credentials: Credentials,
    pub screen: ScreenSize,
    pub locale: String,
}

impl fmt::Debug for DesktopParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DesktopParams")
            .field("domain", &self.domain)
            .field("credentials", &self.credentials)
            .field("screen", &self.screen)
            .field("locale", &self.locale)
            .finish()
    }
}

/// Input forwarded to a remote desktop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesktopInput {
    Pointer { x: i32, y: i32, button: i32, down: bool },
    Wheel { x: i32, y: i32, step: i32, negative: bool, horizontal: bool },
    Scancode { code: u32, down: bool },
    Unicode { code: u32, down: bool },
}

/// Events emitted by a remote desktop client.
#[derive(Debug, Clone, PartialEq)]
pub enum DesktopEvent {
    Connected,
    Bitmap { data: Vec<u8>, meta: Value },
    Closed,
    Error(String),
}

pub trait DesktopControl: Send {
    fn send(&mut self, input: DesktopInput) -> BoxFuture<'_, UpstreamResult<()>>;
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

pub struct DesktopClient {
    pub control: Box<dyn DesktopControl>,
    pub events: mpsc::Receiver<DesktopEvent>,
}

/// Starts a remote desktop client that connects to `addr` on its own.
pub trait DesktopConnector: Send + Sync {
    fn start(&self, addr: SocketAddr, params: DesktopParams) -> BoxFuture<'_, UpstreamResult<DesktopClient>>;
}

impl<T: FileChannel + ?Sized> FileChannel for std::sync::Arc<T> {
    fn open<'a>(&'a self, path: &'a str, mode: OpenMode) -> BoxFuture<'a, UpstreamResult<FileHandle>> {
        (**self).open(path, mode)
    }
    fn read(&self, handle: FileHandle, offset: u64, len: usize) -> BoxFuture<'_, UpstreamResult<Vec<u8>>> {
        (**self).read(handle, offset, len)
    }
    fn write(&self, handle: FileHandle, offset: u64, data: Vec<u8>) -> BoxFuture<'_, UpstreamResult<()>> {
        (**self).write(handle, offset, data)
    }
    fn close(&self, handle: FileHandle) -> BoxFuture<'_, UpstreamResult<()>> {
        (**self).close(handle)
    }
    fn readdir<'a>(&'a self, path: &'a str) -> BoxFuture<'a, UpstreamResult<Vec<DirEntry>>> {
        (**self).readdir(path)
    }
    fn mkdir<'a>(&'a self, path: &'a str) -> BoxFuture<'a, UpstreamResult<()>> {
        (**self).mkdir(path)
    }
    fn unlink<'a>(&'a self, path: &'a str) -> BoxFuture<'a, UpstreamResult<()>> {
        (**self).unlink(path)
    }
    fn rmdir<'a>(&'a self, path: &'a str) -> BoxFuture<'a, UpstreamResult<()>> {
        (**self).rmdir(path)
    }
    fn rename<'a>(&'a self, from: &'a str, to: &'a str) -> BoxFuture<'a, UpstreamResult<()>> {
        (**self).rename(from, to)
    }
    fn end(&self) -> BoxFuture<'_, ()> {
        (**self).end()
    }
}
