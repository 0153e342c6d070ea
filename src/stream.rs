//! Progressive output for streaming commands.
//!
//! A streaming command emits any number of `progress` and `data` chunks followed by
//! exactly one terminal chunk (`complete` or `error`). Nothing follows a terminal
//! chunk.
//!
//! On the wire each chunk carries a per-request sequence number. The
//! [`ChunkSequencer`] restores send order when the channel delivers chunks out of
//! order, and rejects duplicates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::{failure, success, CommandError, ResultEnvelope};

/// Default number of out-of-order chunks buffered per request.
pub const DEFAULT_MAX_REORDER_BUFFER: usize = 1024;

/// Progress report. `progress` is a percentage in `[0, 100]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressChunk {
    pub progress: f64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
}

/// Partial result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataChunk {
    pub data: Value,
    #[serde(default)]
    pub is_final: bool,
}

/// Terminal success carrying the final result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteChunk {
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Terminal failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorChunk {
    pub error: CommandError,
    #[serde(default)]
    pub recoverable: bool,
}

/// One unit of progressive output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamChunk {
    Progress(ProgressChunk),
    Data(DataChunk),
    Complete(CompleteChunk),
    Error(ErrorChunk),
}

impl StreamChunk {
    /// Progress chunk; the percentage is clamped to `[0, 100]`.
    pub fn progress(progress: f64, message: impl Into<String>) -> Self {
        StreamChunk::Progress(ProgressChunk {
            progress: clamp_percent(progress),
            message: message.into(),
            current_step: None,
            total_steps: None,
        })
    }

    /// Progress chunk with step counters.
    pub fn progress_steps(
        progress: f64,
        message: impl Into<String>,
        current_step: u32,
        total_steps: u32,
    ) -> Self {
        StreamChunk::Progress(ProgressChunk {
            progress: clamp_percent(progress),
            message: message.into(),
            current_step: Some(current_step),
            total_steps: Some(total_steps),
        })
    }

    pub fn data(data: Value, is_final: bool) -> Self {
        StreamChunk::Data(DataChunk { data, is_final })
    }

    pub fn complete(data: Value, duration_ms: Option<u64>) -> Self {
        StreamChunk::Complete(CompleteChunk { data, duration_ms })
    }

    pub fn error(error: CommandError, recoverable: bool) -> Self {
        StreamChunk::Error(ErrorChunk { error, recoverable })
    }

    /// Terminal chunk matching the outcome of an envelope.
    pub fn terminal_for(envelope: &ResultEnvelope, duration_ms: Option<u64>) -> Self {
        match (envelope.data(), envelope.error()) {
            (Some(data), _) => StreamChunk::complete(data.clone(), duration_ms),
            (None, Some(error)) => StreamChunk::error(error.clone(), error.retryable),
            (None, None) => StreamChunk::error(
                CommandError::internal("Envelope has neither data nor error"),
                false,
            ),
        }
    }

    /// `complete` and `error` end a stream.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamChunk::Complete(_) | StreamChunk::Error(_))
    }

    /// Envelope for a terminal chunk; `None` for progress and data chunks.
    pub fn into_envelope(self) -> Option<ResultEnvelope> {
        match self {
            StreamChunk::Complete(chunk) => Some(success(chunk.data)),
            StreamChunk::Error(chunk) => Some(failure(chunk.error)),
            _ => None,
        }
    }
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

/// How a command's progressive output is filtered before it reaches the caller.
///
/// Attached to a descriptor with
/// [`CommandDescriptor::with_stream_options`](crate::handler::CommandDescriptor::with_stream_options).
/// Commands without options stream every chunk they emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamOptions {
    /// Forward `progress` chunks at all.
    pub report_progress: bool,
    /// Minimum spacing between two forwarded `progress` chunks. A report of 100%
    /// always goes through.
    pub progress_interval_ms: u64,
    /// Forward `data` chunks at all.
    pub emit_partial_data: bool,
    /// Maximum number of `data` chunks emitted but not yet consumed; further
    /// chunks are dropped until the consumer catches up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<usize>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            report_progress: true,
            progress_interval_ms: 100,
            emit_partial_data: false,
            buffer_size: None,
        }
    }
}

impl StreamOptions {
    pub fn with_progress_interval(mut self, interval: std::time::Duration) -> Self {
        self.progress_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_partial_data(mut self) -> Self {
        self.emit_partial_data = true;
        self
    }

    pub fn without_progress(mut self) -> Self {
        self.report_progress = false;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    pub fn progress_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.progress_interval_ms)
    }
}

/// Data carried by `data` and `complete` chunks, in order.
pub fn collect_stream_data(chunks: &[StreamChunk]) -> Vec<Value> {
    chunks
        .iter()
        .filter_map(|chunk| match chunk {
            StreamChunk::Data(c) => Some(c.data.clone()),
            StreamChunk::Complete(c) => Some(c.data.clone()),
            _ => None,
        })
        .collect()
}

type Callback<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Caller-registered observers for a streaming call.
#[derive(Default)]
pub struct StreamCallbacks {
    on_progress: Option<Callback<ProgressChunk>>,
    on_data: Option<Callback<DataChunk>>,
    on_complete: Option<Callback<CompleteChunk>>,
    on_error: Option<Callback<ErrorChunk>>,
}

impl StreamCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(&ProgressChunk) + Send + Sync + 'static,
    {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn on_data<F>(mut self, f: F) -> Self
    where
        F: Fn(&DataChunk) + Send + Sync + 'static,
    {
        self.on_data = Some(Box::new(f));
        self
    }

    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(&CompleteChunk) + Send + Sync + 'static,
    {
        self.on_complete = Some(Box::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&ErrorChunk) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Route a chunk to the matching callback.
    pub fn dispatch(&self, chunk: &StreamChunk) {
        match chunk {
            StreamChunk::Progress(c) => {
                if let Some(f) = &self.on_progress {
                    f(c)
                }
            }
            StreamChunk::Data(c) => {
                if let Some(f) = &self.on_data {
                    f(c)
                }
            }
            StreamChunk::Complete(c) => {
                if let Some(f) = &self.on_complete {
                    f(c)
                }
            }
            StreamChunk::Error(c) => {
                if let Some(f) = &self.on_error {
                    f(c)
                }
            }
        }
    }
}

impl std::fmt::Debug for StreamCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCallbacks")
            .field("on_progress", &self.on_progress.is_some())
            .field("on_data", &self.on_data.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Why a chunk was not accepted by a [`ChunkSequencer`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequenceError {
    /// Sequence number already delivered or already buffered.
    #[error("duplicate chunk sequence {0}")]
    Duplicate(u64),
    /// The stream already ended.
    #[error("chunk sequence {0} arrived after the terminal chunk")]
    AfterTerminal(u64),
    /// Too many chunks are waiting for a gap to fill.
    #[error("reorder buffer exceeded {0} chunks")]
    Overflow(usize),
}

/// Restores send order for the chunks of one request.
///
/// Sequence numbers start at 0 and increase by one per chunk.
#[derive(Debug)]
pub struct ChunkSequencer {
    next: u64,
    buffered: BTreeMap<u64, StreamChunk>,
    max_buffered: usize,
    finished: bool,
}

impl ChunkSequencer {
    pub fn new(max_buffered: usize) -> Self {
        Self {
            next: 0,
            buffered: BTreeMap::new(),
            max_buffered,
            finished: false,
        }
    }

    /// Accept a chunk and return every chunk that is now deliverable, in order.
    pub fn push(&mut self, seq: u64, chunk: StreamChunk) -> Result<Vec<StreamChunk>, SequenceError> {
        if self.finished {
            return Err(SequenceError::AfterTerminal(seq));
        }
        if seq < self.next || self.buffered.contains_key(&seq) {
            return Err(SequenceError::Duplicate(seq));
        }
        if seq > self.next && self.buffered.len() >= self.max_buffered {
            return Err(SequenceError::Overflow(self.max_buffered));
        }

        self.buffered.insert(seq, chunk);

        let mut ready = Vec::new();
        while let Some(chunk) = self.buffered.remove(&self.next) {
            self.next += 1;
            let terminal = chunk.is_terminal();
            ready.push(chunk);
            if terminal {
                self.finished = true;
                self.buffered.clear();
                break;
            }
        }
        Ok(ready)
    }

    /// True once a terminal chunk has been released.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of chunks waiting for a gap to fill.
    pub fn pending(&self) -> usize {
        self.buffered.len()
    }
}

impl Default for ChunkSequencer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REORDER_BUFFER)
    }
}
