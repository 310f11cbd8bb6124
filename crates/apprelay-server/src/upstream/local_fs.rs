//! File channel backed by a local directory.
//!
//! Remote paths are normalized and resolved under `root`, so `..` can never
//! escape it.

use super::{
    DirEntry, EntryKind, FileChannel, FileConnector, FileHandle, OpenMode, UpstreamError,
    UpstreamResult, UpstreamStream,
};
use crate::store::Credentials;
use apprelay_core::codec::normalize_dir;
use apprelay_core::BoxFuture;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::UNIX_EPOCH;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

/// Connects [`LocalFileChannel`]s rooted at one directory.
///
/// With `expected` set, only those credentials are accepted.
#[derive(Debug, Clone)]
pub struct LocalFileConnector {
    root: PathBuf,
    expected: Option<Credentials>,
}

impl LocalFileConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            expected: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.expected = Some(credentials);
        self
    }
}

impl FileConnector for LocalFileConnector {
    fn connect(
        &self,
        io: UpstreamStream,
        credentials: Credentials,
    ) -> BoxFuture<'_, UpstreamResult<Box<dyn FileChannel>>> {
        Box::pin(async move {
            if let Some(expected) = &self.expected {
                if *expected != credentials {
                    return Err(UpstreamError::Auth);
                }
            }
            let channel = LocalFileChannel::new(&self.root).with_stream(io);
            Ok(Box::new(channel) as Box<dyn FileChannel>)
        })
    }
}

pub struct LocalFileChannel {
    root: PathBuf,
    handles: Mutex<HashMap<u64, File>>,
    next_handle: AtomicU64,
    /// Kept open for the channel's lifetime so the far side sees no EOF.
    stream: Mutex<Option<UpstreamStream>>,
}

impl LocalFileChannel {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            stream: Mutex::new(None),
        }
    }

    fn with_stream(self, io: UpstreamStream) -> Self {
        Self {
            stream: Mutex::new(Some(io)),
            ..self
        }
    }

    fn resolve(&self, remote: &str) -> PathBuf {
        let normalized = normalize_dir(remote);
        self.root.join(normalized.trim_start_matches('/'))
    }

    /// Number of handles currently open.
    pub async fn open_handles(&self) -> usize {
        self.handles.lock().await.len()
    }
}

fn unknown_handle(handle: FileHandle) -> UpstreamError {
    UpstreamError::Other(format!("unknown file handle {}", handle.0))
}

impl FileChannel for LocalFileChannel {
    fn open<'a>(&'a self, path: &'a str, mode: OpenMode) -> BoxFuture<'a, UpstreamResult<FileHandle>> {
        Box::pin(async move {
            let local = self.resolve(path);
            let file = match mode {
                OpenMode::Read => File::open(&local).await?,
                OpenMode::Write => {
                    OpenOptions::new()
                        .write(true)
                        .create(true)
                        .truncate(true)
                        .open(&local)
                        .await?
                }
            };
            let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
            self.handles.lock().await.insert(id, file);
            debug!(path = %local.display(), handle = id, ?mode, "opened local file");
            Ok(FileHandle(id))
        })
    }

    fn read(&self, handle: FileHandle, offset: u64, len: usize) -> BoxFuture<'_, UpstreamResult<Vec<u8>>> {
        Box::pin(async move {
            let mut handles = self.handles.lock().await;
            let file = handles.get_mut(&handle.0).ok_or_else(|| unknown_handle(handle))?;
            file.seek(std::io::SeekFrom::Start(offset)).await?;
            let mut buf = vec![0u8; len];
            let mut filled = 0;
            while filled < len {
                let n = file.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            buf.truncate(filled);
            Ok(buf)
        })
    }

    fn write(&self, handle: FileHandle, offset: u64, data: Vec<u8>) -> BoxFuture<'_, UpstreamResult<()>> {
        Box::pin(async move {
            let mut handles = self.handles.lock().await;
            let file = handles.get_mut(&handle.0).ok_or_else(|| unknown_handle(handle))?;
            file.seek(std::io::SeekFrom::Start(offset)).await?;
            file.write_all(&data).await?;
            Ok(())
        })
    }

    fn close(&self, handle: FileHandle) -> BoxFuture<'_, UpstreamResult<()>> {
        Box::pin(async move {
            let file = self.handles.lock().await.remove(&handle.0);
            match file {
                Some(mut file) => {
                    file.flush().await?;
                    Ok(())
                }
                None => Err(unknown_handle(handle)),
            }
        })
    }

    fn readdir<'a>(&'a self, path: &'a str) -> BoxFuture<'a, UpstreamResult<Vec<DirEntry>>> {
        Box::pin(async move {
            let mut dir = tokio::fs::read_dir(self.resolve(path)).await?;
            let mut entries = Vec::new();
            while let Some(entry) = dir.next_entry().await? {
                let meta = entry.metadata().await?;
                let modified = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                entries.push(DirEntry {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    kind: if meta.is_dir() {
                        EntryKind::Directory
                    } else {
                        EntryKind::File
                    },
                    size: meta.len(),
                    modified,
                });
            }
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(entries)
        })
    }

    fn mkdir<'a>(&'a self, path: &'a str) -> BoxFuture<'a, UpstreamResult<()>> {
        Box::pin(async move { Ok(tokio::fs::create_dir(self.resolve(path)).await?) })
    }

    fn unlink<'a>(&'a self, path: &'a str) -> BoxFuture<'a, UpstreamResult<()>> {
        Box::pin(async move { Ok(tokio::fs::remove_file(self.resolve(path)).await?) })
    }

    fn rmdir<'a>(&'a self, path: &'a str) -> BoxFuture<'a, UpstreamResult<()>> {
        Box::pin(async move { Ok(tokio::fs::remove_dir(self.resolve(path)).await?) })
    }

    fn rename<'a>(&'a self, from: &'a str, to: &'a str) -> BoxFuture<'a, UpstreamResult<()>> {
        Box::pin(async move { Ok(tokio::fs::rename(self.resolve(from), self.resolve(to)).await?) })
    }

    fn end(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let released = {
                let mut handles = self.handles.lock().await;
                let n = handles.len();
                handles.clear();
                n
            };
            self.stream.lock().await.take();
            debug!(released, "local file channel ended");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let channel = LocalFileChannel::new(dir.path());
        let h = channel.open("/a.bin", OpenMode::Write).await.unwrap();
        channel.write(h, 0, b"hello".to_vec()).await.unwrap();
        channel.write(h, 5, b" world".to_vec()).await.unwrap();
        channel.close(h).await.unwrap();

        let h = channel.open("a.bin", OpenMode::Read).await.unwrap();
        assert_eq!(channel.read(h, 0, 5).await.unwrap(), b"hello");
        assert_eq!(channel.read(h, 6, 100).await.unwrap(), b"world");
        assert!(channel.read(h, 11, 100).await.unwrap().is_empty());
        channel.close(h).await.unwrap();
        assert!(channel.close(h).await.is_err());
    }

    #[tokio::test]
    async fn paths_cannot_escape_root() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("root");
        std::fs::create_dir(&root).unwrap();
        let channel = LocalFileChannel::new(&root);
        channel.mkdir("/../../escape").await.unwrap();
        assert!(root.join("escape").is_dir());
        assert!(!outer.path().join("escape").exists());
    }

    #[tokio::test]
    async fn readdir_reports_kinds_and_sizes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), vec![b'x'; 500]).unwrap();
        let channel = LocalFileChannel::new(dir.path());
        let entries = channel.readdir("/").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "docs");
        assert_eq!(entries[0].kind, EntryKind::Directory);
        assert_eq!(entries[1].kind, EntryKind::File);
        assert_eq!(entries[1].size, 500);
        assert!(entries[1].modified > 0);
    }

    #[tokio::test]
    async fn end_releases_handles() {
        let dir = tempfile::tempdir().unwrap();
        let channel = LocalFileChannel::new(dir.path());
        channel.open("/x", OpenMode::Write).await.unwrap();
        assert_eq!(channel.open_handles().await, 1);
        channel.end().await;
        assert_eq!(channel.open_handles().await, 0);
    }

    #[tokio::test]
    async fn connector_checks_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let connector = LocalFileConnector::new(dir.path())
            .with_credentials(Credentials::new("root", "pw"));
        let (io, _peer) = tokio::io::duplex(64);
        let err = connector
            .connect(io, Credentials::new("root", "nope"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, UpstreamError::Auth));
        let (io, _peer) = tokio::io::duplex(64);
        assert!(connector.connect(io, Credentials::new("root", "pw")).await.is_ok());
    }
}
