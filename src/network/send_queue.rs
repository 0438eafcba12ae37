use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn, Instrument, Span};

use crate::util::error::SendError;

/// Serializes writes to a single transport: any number of callers can enqueue frames, and a
///  single writer task writes them strictly in the order they were enqueued.
///
/// The queue is bounded, and enqueueing does not wait for capacity: if the peer can not keep up,
///  [SendQueue::enqueue] fails with [SendError::QueueFull]. That way a slow peer can neither
///  consume unbounded memory nor stall whoever is sending to it (most notably the router, which
///  sends while holding its registry lock).
pub struct SendQueue {
    sender: mpsc::Sender<Bytes>,
    writer_task: JoinHandle<()>,
}

impl SendQueue {
    /// spawns the writer task, so this must be called from inside a tokio runtime
    pub fn new<W>(writer: W, capacity: usize, span: Span) -> SendQueue
    where W: AsyncWrite + Send + Unpin + 'static
    {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let writer_task = tokio::spawn(write_loop(writer, receiver).instrument(span));

        SendQueue {
            sender,
            writer_task,
        }
    }

    pub fn enqueue(&self, frame: Bytes) -> Result<(), SendError> {
        match self.sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SendError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Stops the writer task. Frames that were not written yet are discarded.
    pub fn close(&self) {
        self.writer_task.abort();
    }

    /// true if the writer task terminated, either because of [SendQueue::close] or because
    ///  writing to the transport failed
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl Drop for SendQueue {
    fn drop(&mut self) {
        self.writer_task.abort();
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(mut writer: W, mut receiver: mpsc::Receiver<Bytes>) {
    while let Some(frame) = receiver.recv().await {
        trace!("writing {} bytes", frame.len());
        if let Err(e) = writer.write_all(&frame).await {
            warn!("error writing to transport, stopping writer: {}", e);
            return;
        }

        if receiver.is_empty() {
            if let Err(e) = writer.flush().await {
                warn!("error flushing transport, stopping writer: {}", e);
                return;
            }
        }
    }

    debug!("send queue closed");
    let _ = writer.shutdown().await;
}
