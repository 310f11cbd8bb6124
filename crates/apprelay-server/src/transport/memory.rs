//! In-process frame transport backed by bounded channels.

use apprelay_core::{BoxFuture, CloseMode, Frame, FramePair, FrameSink, FrameSource, RelayError, RelayResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Create two connected transports. Frames sent on one side arrive at the
/// other; closing a sink ends the peer's source.
pub fn pair(capacity: usize) -> (FramePair, FramePair) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        FramePair {
            sink: Box::new(MemorySink::new(a_tx)),
            source: Box::new(MemorySource { rx: b_rx }),
        },
        FramePair {
            sink: Box::new(MemorySink::new(b_tx)),
            source: Box::new(MemorySource { rx: a_rx }),
        },
    )
}

pub struct MemorySink {
    tx: Option<mpsc::Sender<Frame>>,
    closed: Arc<AtomicBool>,
}

impl MemorySink {
    pub fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self {
            tx: Some(tx),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag set once `close` has been called.
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }
}

impl FrameSink for MemorySink {
    fn send<'a>(&'a mut self, frame: Frame) -> BoxFuture<'a, RelayResult<()>> {
        Box::pin(async move {
            let tx = self.tx.as_ref().ok_or(RelayError::Closed)?;
            tx.send(frame).await.map_err(|_| RelayError::Closed)
        })
    }

    fn close(&mut self, _mode: CloseMode) -> BoxFuture<'_, RelayResult<()>> {
        Box::pin(async move {
            self.tx = None;
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}

pub struct MemorySource {
    rx: mpsc::Receiver<Frame>,
}

impl MemorySource {
    pub fn new(rx: mpsc::Receiver<Frame>) -> Self {
        Self { rx }
    }
}

impl FrameSource for MemorySource {
    fn recv(&mut self) -> BoxFuture<'_, RelayResult<Option<Frame>>> {
        Box::pin(async move { Ok(self.rx.recv().await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cross_and_close_ends_peer() {
        let (mut a, mut b) = pair(4);
        a.sink.send(Frame::Text("hi".into())).await.unwrap();
        assert_eq!(b.source.recv().await.unwrap(), Some(Frame::Text("hi".into())));
        b.sink.send(Frame::Binary(vec![9])).await.unwrap();
        assert_eq!(a.source.recv().await.unwrap(), Some(Frame::Binary(vec![9])));

        a.sink.close(CloseMode::Soft).await.unwrap();
        assert_eq!(b.source.recv().await.unwrap(), None);
        assert!(a.sink.send(Frame::Text("late".into())).await.is_err());
    }
}
