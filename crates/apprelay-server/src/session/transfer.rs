//! File transfer sub-protocol.
//!
//! One handler per file session, created once the file channel is up. At
//! most one transfer (upload or download) is active at a time; directory
//! operations run alongside it.
//!
//! Replies are JSON in binary frames, except the download `start` notice
//! which is a text frame. Download blocks carry a 4-byte status header.

use crate::store::{
    user_targets, AuditEvent, EventDispatch, MSGID_DELETE, MSGID_DOWNLOAD, MSGID_MKDIR,
    MSGID_RENAME, MSGID_UPLOAD,
};
use crate::upstream::{EntryKind, FileChannel, FileHandle, OpenMode, UpstreamResult};
use apprelay_core::codec::{join_remote, normalize_dir, strip_upload_marker, BLOCK_HEADER_LEN};
use apprelay_core::messages::{
    DirListing, DownloadNotice, DownloadRequest, FileRequest, ListingEntry, ENTRY_DIRECTORY,
    ENTRY_FILE,
};
use apprelay_core::{encode_block, BlockStatus, Frame, FrameSink, Notice, RelayResult, RouteInfo};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Download tuning.
#[derive(Debug, Clone, Copy)]
pub struct TransferLimits {
    /// Block size including the status header.
    pub block_size: usize,
    pub default_window: u32,
    pub max_window: u32,
}

impl TransferLimits {
    /// Payload bytes per download block.
    pub fn capacity(&self) -> usize {
        self.block_size.saturating_sub(BLOCK_HEADER_LEN).max(1)
    }

    /// Window requested by a `startack`, clamped to `[1, max_window]`.
    fn window(&self, ack: Option<&Value>) -> u32 {
        let requested = ack
            .and_then(Value::as_i64)
            .filter(|n| *n > 0)
            .map(|n| n.min(u32::MAX as i64) as u32)
            .unwrap_or(self.default_window);
        requested.clamp(1, self.max_window.max(1))
    }
}

#[derive(Debug)]
struct Upload {
    path: String,
    handle: FileHandle,
    reqid: Value,
    size: Option<u64>,
    position: u64,
}

#[derive(Debug)]
struct Download {
    path: String,
    handle: FileHandle,
    id: Value,
    position: u64,
    /// Reads allowed before the client must acknowledge.
    pending: u32,
    window: u32,
    /// Block already read but not yet sent.
    ahead: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
enum Transfer {
    #[default]
    Idle,
    Upload(Upload),
    Download(Download),
}

pub struct FileTransferHandler {
    channel: Box<dyn FileChannel>,
    transfer: Transfer,
    limits: TransferLimits,
    route: RouteInfo,
    events: Arc<dyn EventDispatch>,
}

impl FileTransferHandler {
    pub fn new(
        channel: Box<dyn FileChannel>,
        limits: TransferLimits,
        route: RouteInfo,
        events: Arc<dyn EventDispatch>,
    ) -> Self {
        Self {
            channel,
            transfer: Transfer::Idle,
            limits,
            route,
            events,
        }
    }

    /// Whether an upload or download is in progress.
    pub fn busy(&self) -> bool {
        !matches!(self.transfer, Transfer::Idle)
    }

    /// Outstanding download reads, if a download is active.
    pub fn pending_window(&self) -> Option<u32> {
        match &self.transfer {
            Transfer::Download(d) => Some(d.pending),
            _ => None,
        }
    }

    /// Dispatch one control request. Login requests are not handled here.
    ///
    /// Only downstream send failures are returned; file system failures are
    /// reported to the client.
    pub async fn handle(&mut self, request: FileRequest, out: &mut dyn FrameSink) -> RelayResult<()> {
        match request {
            FileRequest::Ls { path, reqid } => self.ls(&path, reqid, out).await,
            FileRequest::Mkdir { path, reqid } => self.mkdir(&path, reqid, out).await,
            FileRequest::Rm {
                path,
                delfiles,
                rec,
                reqid,
            } => self.rm(&path, &delfiles, rec, reqid, out).await,
            FileRequest::Rename {
                path,
                oldname,
                newname,
                reqid,
            } => self.rename(&path, &oldname, &newname, reqid, out).await,
            FileRequest::Upload {
                path,
                name,
                size,
                reqid,
            } => self.upload_start(&path, &name, size, reqid, out).await,
            FileRequest::Uploaddone { .. } => self.upload_done(out).await,
            FileRequest::Uploadcancel { .. } => self.upload_cancel(out).await,
            FileRequest::Download(sub) => self.download(sub, out).await,
            FileRequest::Sshauth(_) => Ok(()),
        }
    }

    // ── Directory operations ─────────────────────────────────────────

    async fn ls(&mut self, path: &str, reqid: Value, out: &mut dyn FrameSink) -> RelayResult<()> {
        let path = normalize_dir(path);
        let entries = match self.channel.readdir(&path).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %path, error = %e, "ls failed");
                return send_json(out, &file_error("ls", &path, reqid)).await;
            }
        };
        let dir = entries
            .into_iter()
            .map(|entry| match entry.kind {
                EntryKind::Directory => ListingEntry {
                    t: ENTRY_DIRECTORY,
                    n: entry.name,
                    d: iso_time(entry.modified),
                    s: None,
                },
                EntryKind::File => ListingEntry {
                    t: ENTRY_FILE,
                    n: entry.name,
                    d: iso_time(entry.modified),
                    s: Some(entry.size),
                },
            })
            .collect();
        send_json(out, &DirListing { path, reqid, dir }).await
    }

    async fn mkdir(&mut self, path: &str, reqid: Value, out: &mut dyn FrameSink) -> RelayResult<()> {
        let path = normalize_dir(path);
        let result = self.channel.mkdir(&path).await;
        self.audit(
            MSGID_MKDIR,
            vec![json!(path)],
            format!("Create folder: \"{path}\""),
        );
        if let Err(e) = result {
            warn!(path = %path, error = %e, "mkdir failed");
            return send_json(out, &file_error("mkdir", &path, reqid)).await;
        }
        Ok(())
    }

    async fn rm(
        &mut self,
        path: &str,
        names: &[String],
        recursive: bool,
        reqid: Value,
        out: &mut dyn FrameSink,
    ) -> RelayResult<()> {
        let dir = normalize_dir(path);
        let mut failed = false;
        for name in names {
            let target = join_remote(&dir, name);
            let unlinked = self.channel.unlink(&target).await;
            let removed = if recursive {
                self.channel.rmdir(&target).await.is_ok()
            } else {
                false
            };
            if unlinked.is_err() && !removed {
                debug!(path = %target, "rm failed");
                failed = true;
            }
            self.audit(
                MSGID_DELETE,
                vec![json!(target)],
                format!("Delete: \"{target}\""),
            );
        }
        if failed {
            return send_json(out, &file_error("rm", &dir, reqid)).await;
        }
        Ok(())
    }

    async fn rename(
        &mut self,
        path: &str,
        old_name: &str,
        new_name: &str,
        reqid: Value,
        out: &mut dyn FrameSink,
    ) -> RelayResult<()> {
        let dir = normalize_dir(path);
        let from = join_remote(&dir, old_name);
        let to = join_remote(&dir, new_name);
        let result = self.channel.rename(&from, &to).await;
        self.audit(
            MSGID_RENAME,
            vec![json!(from), json!(new_name)],
            format!("Rename: \"{from}\" to \"{new_name}\""),
        );
        if let Err(e) = result {
            warn!(from = %from, to = %to, error = %e, "rename failed");
            return send_json(out, &file_error("rename", &from, reqid)).await;
        }
        Ok(())
    }

    // ── Upload ───────────────────────────────────────────────────────

    async fn upload_start(
        &mut self,
        dir: &str,
        name: &str,
        size: Option<u64>,
        reqid: Value,
        out: &mut dyn FrameSink,
    ) -> RelayResult<()> {
        if self.busy() {
            warn!("upload rejected, another transfer is active");
            return send_json(out, &Notice::Uploaderror { reqid }).await;
        }
        let path = join_remote(&normalize_dir(dir), name);
        let handle = match self.channel.open(&path, OpenMode::Write).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(path = %path, error = %e, "upload open failed");
                return send_json(out, &Notice::Uploaderror { reqid }).await;
            }
        };
        info!(path = %path, ?size, "upload started");
        self.audit(
            MSGID_UPLOAD,
            vec![json!(path), json!(size)],
            format!(
                "Upload: {path}, Size: {}",
                size.map(|s| s.to_string()).unwrap_or_default()
            ),
        );
        self.transfer = Transfer::Upload(Upload {
            path,
            handle,
            reqid: reqid.clone(),
            size,
            position: 0,
        });
        send_json(out, &Notice::Uploadstart { reqid }).await
    }

    /// Write one upload chunk. Chunks outside an upload are dropped.
    pub async fn upload_chunk(&mut self, data: &[u8], out: &mut dyn FrameSink) -> RelayResult<()> {
        let Transfer::Upload(upload) = &mut self.transfer else {
            debug!(len = data.len(), "binary frame outside an upload, dropped");
            return Ok(());
        };
        let payload = strip_upload_marker(data).to_vec();
        let len = payload.len() as u64;
        match self.channel.write(upload.handle, upload.position, payload).await {
            Ok(()) => {
                upload.position += len;
                let reqid = upload.reqid.clone();
                send_json(out, &Notice::Uploadack { reqid }).await
            }
            Err(e) => {
                warn!(path = %upload.path, error = %e, "upload write failed");
                let handle = upload.handle;
                let reqid = upload.reqid.clone();
                self.transfer = Transfer::Idle;
                let _ = self.channel.close(handle).await;
                send_json(out, &Notice::Uploaderror { reqid }).await
            }
        }
    }

    async fn upload_done(&mut self, out: &mut dyn FrameSink) -> RelayResult<()> {
        if !matches!(self.transfer, Transfer::Upload(_)) {
            return Ok(());
        }
        let Transfer::Upload(upload) = std::mem::take(&mut self.transfer) else {
            return Ok(());
        };
        if let Err(e) = self.channel.close(upload.handle).await {
            debug!(error = %e, "upload close failed");
        }
        if upload.size.is_some_and(|s| s != upload.position) {
            warn!(path = %upload.path, expected = ?upload.size, written = upload.position, "upload size mismatch");
        }
        info!(path = %upload.path, bytes = upload.position, "upload finished");
        send_json(out, &Notice::Uploaddone { reqid: upload.reqid }).await
    }

    async fn upload_cancel(&mut self, out: &mut dyn FrameSink) -> RelayResult<()> {
        if !matches!(self.transfer, Transfer::Upload(_)) {
            return Ok(());
        }
        let Transfer::Upload(upload) = std::mem::take(&mut self.transfer) else {
            return Ok(());
        };
        let _ = self.channel.close(upload.handle).await;
        if let Err(e) = self.channel.unlink(&upload.path).await {
            debug!(path = %upload.path, error = %e, "partial upload not removed");
        }
        info!(path = %upload.path, "upload cancelled");
        send_json(out, &Notice::Uploadcancel { reqid: upload.reqid }).await
    }

    // ── Download ─────────────────────────────────────────────────────

    async fn download(&mut self, request: DownloadRequest, out: &mut dyn FrameSink) -> RelayResult<()> {
        match request {
            DownloadRequest::Start { path, id } => self.download_start(&path, id, out).await,
            DownloadRequest::Startack { id, ack } => {
                let window = self.limits.window(ack.as_ref());
                let Some(download) = self.active_download(&id) else {
                    return Ok(());
                };
                download.window = window;
                download.pending = window;
                self.pump(out).await
            }
            DownloadRequest::Ack { id } => {
                let Some(download) = self.active_download(&id) else {
                    return Ok(());
                };
                if download.pending > 0 {
                    return Ok(());
                }
                download.pending = 1;
                self.pump(out).await
            }
            DownloadRequest::Stop { id } => {
                if self.active_download(&id).is_some() {
                    if let Transfer::Download(download) = std::mem::take(&mut self.transfer) {
                        let _ = self.channel.close(download.handle).await;
                        info!(path = %download.path, sent = download.position, "download stopped");
                    }
                }
                Ok(())
            }
        }
    }

    fn active_download(&mut self, id: &Value) -> Option<&mut Download> {
        match &mut self.transfer {
            Transfer::Download(d) if d.id == *id => Some(d),
            _ => None,
        }
    }

    async fn download_start(&mut self, path: &str, id: Value, out: &mut dyn FrameSink) -> RelayResult<()> {
        let cancel = Notice::Download {
            sub: DownloadNotice::Cancel,
            id: id.clone(),
        };
        if self.busy() {
            warn!("download rejected, another transfer is active");
            return send_json(out, &cancel).await;
        }
        let path = normalize_dir(path);
        let handle = match self.channel.open(&path, OpenMode::Read).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(path = %path, error = %e, "download open failed");
                return send_json(out, &cancel).await;
            }
        };
        info!(path = %path, "download started");
        self.audit(
            MSGID_DOWNLOAD,
            vec![json!(path)],
            format!("Download: {path}"),
        );
        self.transfer = Transfer::Download(Download {
            path,
            handle,
            id: id.clone(),
            position: 0,
            pending: 0,
            window: self.limits.default_window,
            ahead: None,
        });
        let start = Notice::Download {
            sub: DownloadNotice::Start,
            id,
        };
        out.send(Frame::Text(start.to_json())).await
    }

    /// Read and send blocks while the window allows.
    ///
    /// Full blocks are held until the following read returns, so the last
    /// block with data carries the final status.
    async fn pump(&mut self, out: &mut dyn FrameSink) -> RelayResult<()> {
        let capacity = self.limits.capacity();
        loop {
            let Transfer::Download(download) = &mut self.transfer else {
                return Ok(());
            };
            if download.pending == 0 {
                return Ok(());
            }
            let (data, last) = match next_block(&*self.channel, download, capacity).await {
                Ok(block) => block,
                Err(e) => {
                    warn!(path = %download.path, error = %e, "download read failed");
                    let cancel = Notice::Download {
                        sub: DownloadNotice::Cancel,
                        id: download.id.clone(),
                    };
                    let handle = download.handle;
                    self.transfer = Transfer::Idle;
                    let _ = self.channel.close(handle).await;
                    return send_json(out, &cancel).await;
                }
            };
            download.pending -= 1;
            if last {
                let handle = download.handle;
                info!(
                    path = %download.path,
                    bytes = download.position,
                    window = download.window,
                    "download finished"
                );
                self.transfer = Transfer::Idle;
                let _ = self.channel.close(handle).await;
                return out
                    .send(Frame::Binary(encode_block(BlockStatus::Final, &data)))
                    .await;
            }
            out.send(Frame::Binary(encode_block(BlockStatus::More, &data)))
                .await?;
        }
    }

    /// Release the open handle, if any, and end the channel.
    pub async fn release(&mut self) {
        match std::mem::take(&mut self.transfer) {
            Transfer::Idle => {}
            Transfer::Upload(Upload { handle, .. }) | Transfer::Download(Download { handle, .. }) => {
                let _ = self.channel.close(handle).await;
            }
        }
        self.channel.end().await;
    }

    fn audit(&self, msg_id: u32, args: Vec<Value>, msg: String) {
        let event = AuditEvent::agent_log(&self.route, msg_id, args, msg);
        self.events.publish(&user_targets(&self.route), event);
    }
}

async fn read_block(
    channel: &dyn FileChannel,
    download: &mut Download,
    capacity: usize,
) -> UpstreamResult<Vec<u8>> {
    let data = channel.read(download.handle, download.position, capacity).await?;
    download.position += data.len() as u64;
    Ok(data)
}

/// Next block to send and whether it is the last one. An empty block is
/// only returned for an empty file.
async fn next_block(
    channel: &dyn FileChannel,
    download: &mut Download,
    capacity: usize,
) -> UpstreamResult<(Vec<u8>, bool)> {
    let block = match download.ahead.take() {
        Some(block) => block,
        None => read_block(channel, download, capacity).await?,
    };
    if block.len() < capacity {
        return Ok((block, true));
    }
    let ahead = read_block(channel, download, capacity).await?;
    if ahead.is_empty() {
        return Ok((block, true));
    }
    download.ahead = Some(ahead);
    Ok((block, false))
}

fn file_error(op: &str, path: &str, reqid: Value) -> Notice {
    Notice::Fileerror {
        op: op.to_string(),
        path: path.to_string(),
        reqid,
    }
}

async fn send_json<T: Serialize>(out: &mut dyn FrameSink, value: &T) -> RelayResult<()> {
    out.send(Frame::Binary(serde_json::to_vec(value)?)).await
}

fn iso_time(secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}
