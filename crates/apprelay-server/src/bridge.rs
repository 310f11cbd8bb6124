//! Flow-controlled byte bridge between a frame transport and a byte stream.
//!
//! Each direction reads one chunk, awaits its write on the other side, and
//! only then reads again, so at most one write is outstanding per
//! direction and a fast producer is paused by a slow consumer. The two
//! directions run concurrently; the bridge ends when either side closes.

use apprelay_core::{CloseMode, Frame, FramePair, FrameSource, RelayError, RelayResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Read size for the stream side.
pub const BRIDGE_CHUNK: usize = 16 * 1024;

/// Which side ended the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeSide {
    Frames,
    Stream,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BridgeStats {
    /// Bytes written into the stream.
    pub to_stream: u64,
    /// Bytes sent as frames.
    pub to_frames: u64,
}

#[derive(Debug)]
pub struct BridgeOutcome {
    pub ended_by: BridgeSide,
    pub stats: BridgeStats,
    /// Set when the bridge ended on an error rather than a clean close.
    pub error: Option<RelayError>,
}

/// Consume frames until the relay hop's ready signal.
///
/// Anything arriving before it is discarded. Fails with
/// [`RelayError::Closed`] if the hop goes away first.
pub async fn wait_ready(source: &mut dyn FrameSource) -> RelayResult<()> {
    loop {
        match source.recv().await? {
            Some(frame) if frame.is_ready_signal() => return Ok(()),
            Some(frame) => {
                debug!(len = frame.len(), "discarding frame before ready signal");
            }
            None => return Err(RelayError::Closed),
        }
    }
}

/// Relay bytes between `frames` and `stream` until either side closes.
pub async fn run<S>(frames: FramePair, stream: S, chunk: usize) -> BridgeOutcome
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let FramePair {
        mut sink,
        mut source,
    } = frames;
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut to_stream = 0u64;
    let mut to_frames = 0u64;

    let frames_to_stream = async {
        loop {
            let Some(frame) = source.recv().await? else {
                let _ = writer.shutdown().await;
                return Ok::<(), RelayError>(());
            };
            let bytes = frame.into_bytes();
            if bytes.is_empty() {
                continue;
            }
            writer.write_all(&bytes).await?;
            to_stream += bytes.len() as u64;
        }
    };

    let stream_to_frames = async {
        let mut buf = vec![0u8; chunk.max(1)];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                let _ = sink.close(CloseMode::Soft).await;
                return Ok::<(), RelayError>(());
            }
            sink.send(Frame::Binary(buf[..n].to_vec())).await?;
            to_frames += n as u64;
        }
    };

    let (ended_by, result) = tokio::select! {
        r = frames_to_stream => (BridgeSide::Frames, r),
        r = stream_to_frames => (BridgeSide::Stream, r),
    };

    let stats = BridgeStats {
        to_stream,
        to_frames,
    };
    debug!(?ended_by, to_stream, to_frames, "bridge ended");
    BridgeOutcome {
        ended_by,
        stats,
        error: result.err(),
    }
}
