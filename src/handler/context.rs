//! Per-invocation context for command handlers.
//!
//! Provides:
//! - call identity (`trace_id`, `source`)
//! - a cancellation token the caller (or the transport) may trigger
//! - `progress` / `progress_steps` / `data` for streaming commands
//!
//! # Example
//!
//! ```ignore
//! async fn import(rows: Vec<Row>, ctx: CommandContext) -> Result<usize, CommandError> {
//!     for (i, row) in rows.iter().enumerate() {
//!         if ctx.is_cancelled() {
//!             return Err(CommandError::cancelled("import aborted"));
//!         }
//!         store(row).await?;
//!         ctx.progress_steps(100.0 * (i + 1) as f64 / rows.len() as f64, "importing", i as u32 + 1, rows.len() as u32);
//!     }
//!     Ok(rows.len())
//! }
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::stream::{StreamChunk, StreamOptions};

/// Receiving end of the chunks a handler emits.
#[derive(Debug)]
pub struct ChunkReceiver {
    rx: mpsc::UnboundedReceiver<StreamChunk>,
    buffered: Arc<AtomicUsize>,
}

impl ChunkReceiver {
    pub async fn recv(&mut self) -> Option<StreamChunk> {
        let chunk = self.rx.recv().await?;
        self.consumed(&chunk);
        Some(chunk)
    }

    pub fn try_recv(&mut self) -> Result<StreamChunk, TryRecvError> {
        let chunk = self.rx.try_recv()?;
        self.consumed(&chunk);
        Ok(chunk)
    }

    fn consumed(&self, chunk: &StreamChunk) {
        if matches!(chunk, StreamChunk::Data(_)) {
            self.buffered.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[derive(Debug, Clone)]
struct ChunkSink {
    tx: mpsc::UnboundedSender<StreamChunk>,
    /// `data` chunks sent but not yet received.
    buffered: Arc<AtomicUsize>,
}

/// Applies [`StreamOptions`] to the chunks of one invocation.
#[derive(Debug)]
struct StreamGate {
    options: StreamOptions,
    last_progress: Mutex<Option<Instant>>,
}

impl StreamGate {
    fn admit(&self, chunk: &StreamChunk, buffered: usize) -> bool {
        match chunk {
            StreamChunk::Progress(p) => {
                if !self.options.report_progress {
                    return false;
                }
                let now = Instant::now();
                let mut last = self.last_progress.lock();
                let due = p.progress >= 100.0
                    || last.map_or(true, |t| now.duration_since(t) >= self.options.progress_interval());
                if due {
                    *last = Some(now);
                }
                due
            }
            StreamChunk::Data(_) => {
                self.options.emit_partial_data
                    && self.options.buffer_size.map_or(true, |max| buffered < max)
            }
            _ => true,
        }
    }
}

/// Context passed to command handlers.
///
/// `CommandContext` is `Clone`; clones share the cancellation token, the chunk
/// sink and the progress throttle. Without a sink attached, the streaming methods
/// are no-ops.
#[derive(Clone, Default)]
pub struct CommandContext {
    trace_id: Option<String>,
    source: Option<String>,
    cancel: CancellationToken,
    sink: Option<ChunkSink>,
    gate: Option<Arc<StreamGate>>,
}

impl CommandContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Free-form caller identity, e.g. `"agent"` or a peer name.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Filter emitted chunks through `options`.
    pub fn with_stream_options(mut self, options: StreamOptions) -> Self {
        self.gate = Some(Arc::new(StreamGate {
            options,
            last_progress: Mutex::new(None),
        }));
        self
    }

    /// Attach a fresh chunk sink and return its receiving end.
    pub fn attach_stream(&mut self) -> ChunkReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        self.sink = Some(ChunkSink {
            tx,
            buffered: buffered.clone(),
        });
        ChunkReceiver { rx, buffered }
    }

    #[inline]
    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    #[inline]
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the call is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// True when someone is listening for chunks.
    pub fn is_streaming(&self) -> bool {
        self.sink.as_ref().is_some_and(|s| !s.tx.is_closed())
    }

    /// Report progress (clamped to `[0, 100]`).
    pub fn progress(&self, progress: f64, message: impl Into<String>) {
        self.emit(StreamChunk::progress(progress, message));
    }

    /// Report progress with step counters.
    pub fn progress_steps(
        &self,
        progress: f64,
        message: impl Into<String>,
        current_step: u32,
        total_steps: u32,
    ) {
        self.emit(StreamChunk::progress_steps(
            progress,
            message,
            current_step,
            total_steps,
        ));
    }

    /// Emit a partial result.
    pub fn data(&self, data: Value) {
        self.emit(StreamChunk::data(data, false));
    }

    /// Emit the last partial result before the handler returns.
    pub fn final_data(&self, data: Value) {
        self.emit(StreamChunk::data(data, true));
    }

    /// Send a chunk to the sink. Terminal chunks are reserved for the dispatcher.
    pub(crate) fn emit(&self, chunk: StreamChunk) {
        let Some(sink) = &self.sink else {
            return;
        };
        if let Some(gate) = &self.gate {
            if !gate.admit(&chunk, sink.buffered.load(Ordering::Acquire)) {
                trace!(trace_id = ?self.trace_id, "Chunk filtered by stream options");
                return;
            }
        }
        let partial = matches!(chunk, StreamChunk::Data(_));
        if partial {
            sink.buffered.fetch_add(1, Ordering::AcqRel);
        }
        // Receiver gone means nobody cares anymore.
        if sink.tx.send(chunk).is_err() && partial {
            sink.buffered.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Drop the sink so the receiver sees end-of-stream once the handler's clones
    /// are gone.
    pub(crate) fn detach_stream(&mut self) {
        self.sink = None;
    }
}

impl std::fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext")
            .field("trace_id", &self.trace_id)
            .field("source", &self.source)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("streaming", &self.sink.is_some())
            .field("stream_options", &self.gate.as_ref().map(|g| &g.options))
            .finish()
    }
}
