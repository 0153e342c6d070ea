//! Writer task for outbound frames.
//!
//! Replies, chunks and push events for one connection are produced by many tasks
//! at once. Instead of sharing the socket behind a lock, they hand frames to a
//! single writer task through an mpsc channel:
//!
//! ```text
//! request task 1 ─┐
//! request task 2 ─┼─► mpsc::Sender<OutboundFrame> ─► writer task ─► socket
//! event forwarder ┘
//! ```
//!
//! The task drains whatever is queued and writes it with one vectored write. A
//! pending-frame counter provides backpressure: senders wait (up to a timeout)
//! while too many frames are queued, and wake when the writer drains a batch.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Result, WireError};
use crate::protocol::{Frame, Header, HEADER_SIZE};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written to the socket.
#[derive(Debug)]
pub struct OutboundFrame {
    pub header: [u8; HEADER_SIZE],
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Create a new outbound frame.
    #[inline]
    pub fn new(header: &Header, payload: Bytes) -> Self {
        Self {
            header: header.encode(),
            payload,
        }
    }

    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

impl From<Frame> for OutboundFrame {
    fn from(frame: Frame) -> Self {
        Self::new(&frame.header, frame.payload)
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// How long a sender waits for backpressure to clear.
    pub backpressure_timeout_ms: u64,
}

impl WriterConfig {
    pub fn backpressure_timeout(&self) -> Duration {
        Duration::from_millis(self.backpressure_timeout_ms)
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout_ms: DEFAULT_BACKPRESSURE_TIMEOUT.as_millis() as u64,
        }
    }
}

/// Frames handed to the writer but not yet written.
#[derive(Debug, Default)]
struct Backlog {
    count: AtomicUsize,
    drained: Notify,
}

impl Backlog {
    #[cfg(test)]
    fn with_count(count: usize) -> Self {
        Self {
            count: AtomicUsize::new(count),
            drained: Notify::new(),
        }
    }

    #[inline]
    fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    fn release(&self, frames: usize) {
        self.count.fetch_sub(frames, Ordering::AcqRel);
        self.drained.notify_waiters();
    }
}

/// Handle for sending frames to the writer task. Cheap to clone.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    backlog: Arc<Backlog>,
    max_pending: usize,
    /// Backpressure timeout.
    timeout: Duration,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<OutboundFrame>,
        backlog: Arc<Backlog>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            backlog,
            max_pending,
            timeout,
        }
    }

    /// Queue a frame, waiting while backpressure is active.
    pub async fn send(&self, frame: impl Into<OutboundFrame>) -> Result<()> {
        if self.backlog.len() >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        // Count before sending so the writer never decrements below zero.
        self.backlog.count.fetch_add(1, Ordering::AcqRel);

        self.tx.send(frame.into()).await.map_err(|_| {
            self.backlog.release(1);
            WireError::ConnectionClosed
        })
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let deadline = Instant::now() + self.timeout;

        loop {
            let drained = self.backlog.drained.notified();
            tokio::pin!(drained);
            // Registered before the check so a release in between still wakes us.
            drained.as_mut().enable();

            if self.backlog.len() < self.max_pending {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                return Err(WireError::BackpressureTimeout);
            }
        }
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.backlog.len() >= self.max_pending
    }

    /// Get current pending frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.backlog.len()
    }

    /// Queue a frame without waiting; fails with `BackpressureTimeout` at capacity.
    pub fn try_send(&self, frame: impl Into<OutboundFrame>) -> Result<()> {
        if self.backlog.len() >= self.max_pending {
            return Err(WireError::BackpressureTimeout);
        }

        self.backlog.count.fetch_add(1, Ordering::AcqRel);

        self.tx.try_send(frame.into()).map_err(|e| {
            self.backlog.release(1);
            match e {
                mpsc::error::TrySendError::Full(_) => WireError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => WireError::ConnectionClosed,
            }
        })
    }
}

/// Spawn the writer task over `writer` (usually a socket write half).
///
/// The task ends cleanly once every [`WriterHandle`] is dropped, or with an
/// error when a write fails.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let backlog = Arc::new(Backlog::default());

    let handle = WriterHandle::new(
        tx,
        backlog.clone(),
        config.max_pending_frames,
        config.backpressure_timeout(),
    );

    let task = tokio::spawn(writer_loop(rx, writer, backlog));

    (handle, task)
}

/// Receive frames and write them in batches.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    backlog: Arc<Backlog>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(f) => f,
            None => {
                debug!("Writer channel closed");
                writer.shutdown().await.ok();
                return Ok(());
            }
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        let written = write_batch(&mut writer, &batch).await;
        backlog.release(batch_size);
        if let Err(e) = written {
            warn!(error = %e, frames = batch_size, "Frame write failed");
            return Err(e);
        }
    }
}

/// Write a batch of frames with `write_vectored`, continuing after partial writes.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(batch.len() * 2);

    for frame in batch {
        slices.push(IoSlice::new(&frame.header));
        if !frame.payload.is_empty() {
            slices.push(IoSlice::new(&frame.payload));
        }
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();

    let written = writer.write_vectored(&slices).await?;

    if written == total_size {
        writer.flush().await?;
        return Ok(());
    }

    if written == 0 {
        return Err(WireError::Io(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "write_vectored returned 0",
        )));
    }

    // Partial write: rebuild the slices past what already went out.
    let mut total_written = written;

    while total_written < total_size {
        let remaining_slices = build_remaining_slices(batch, total_written);
        if remaining_slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&remaining_slices).await?;
        if written == 0 {
            return Err(WireError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }

        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for remaining data after partial write.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut skipped = 0;

    for frame in batch {
        let header_start = skipped;
        let header_end = skipped + HEADER_SIZE;

        if skip_bytes < header_end {
            let start_in_header = skip_bytes.saturating_sub(header_start);
            slices.push(IoSlice::new(&frame.header[start_in_header..]));
        }
        skipped = header_end;

        if !frame.payload.is_empty() {
            let payload_start = skipped;
            let payload_end = skipped + frame.payload.len();

            if skip_bytes < payload_end {
                let start_in_payload = skip_bytes.saturating_sub(payload_start);
                slices.push(IoSlice::new(&frame.payload[start_in_payload..]));
            }
            skipped = payload_end;
        }
    }

    slices
}
