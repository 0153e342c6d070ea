//! Transport module - how a call reaches a registry.
//!
//! Provides:
//! - [`DirectTransport`] - in-process, no serialization
//! - [`RequestTransport`] - one request, one reply, over a [`RequestChannel`]
//! - [`StreamingTransport`] - persistent multiplexed connection with reconnection
//! - Unix socket plumbing ([`PipeListener`], [`UnixConnector`], [`UnixRequestChannel`])
//!
//! Every transport resolves every call to a [`ResultEnvelope`]. Wire and I/O
//! failures become `TIMEOUT`, `CANCELLED` or `INTERNAL_ERROR` envelopes; nothing
//! above a transport ever sees a raw error.

mod direct;
#[cfg(unix)]
mod pipe;
mod reconnect;
mod request;
mod streaming;

pub use direct::DirectTransport;
#[cfg(unix)]
pub use pipe::{generate_pipe_path, PipeListener, PipeStream, UnixConnector, UnixRequestChannel};
pub use reconnect::ReconnectPolicy;
pub use request::{LoopbackChannel, RequestChannel, RequestTransport};
pub use streaming::{Connector, DuplexStream, LoopbackConnector, StreamingTransport};

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::envelope::{CommandError, ResultEnvelope};
use crate::stream::StreamCallbacks;

/// Which transport a client is using.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Direct,
    Request,
    Streaming,
}

/// Per-call knobs.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the transport's default call timeout.
    pub timeout: Option<Duration>,
    /// Cancels the call when triggered.
    pub cancel: Option<CancellationToken>,
    /// Propagated to the handler's context.
    pub trace_id: Option<String>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Resolves when the caller cancels; never resolves without a token.
    pub(crate) async fn cancelled(&self) {
        match &self.cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    }
}

/// Lifecycle of a persistent connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal.
    Closed,
}

/// Observable transport events.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    /// A reconnect attempt failed; `attempt` counts failures so far.
    Reconnecting { attempt: u32, max_attempts: u32 },
    /// Reconnection gave up; pending calls were cancelled.
    Disconnected { reason: String },
    /// Server push event.
    Push { event: String, data: Value },
}

impl TransportEvent {
    /// Name a listener subscribes to; push events go by their own name.
    pub fn name(&self) -> &str {
        match self {
            TransportEvent::StateChanged(_) => "stateChanged",
            TransportEvent::Reconnecting { .. } => "reconnecting",
            TransportEvent::Disconnected { .. } => "disconnected",
            TransportEvent::Push { event, .. } => event,
        }
    }
}

/// How a client reaches a registry.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Execute a command and wait for its envelope.
    async fn call(&self, name: &str, input: Value, opts: CallOptions) -> ResultEnvelope;

    /// Execute a command, feeding progressive output to `callbacks` until the
    /// terminal chunk arrives.
    async fn call_stream(
        &self,
        name: &str,
        input: Value,
        callbacks: &StreamCallbacks,
        opts: CallOptions,
    ) -> ResultEnvelope;

    /// Establish the underlying connection ahead of the first call.
    async fn connect(&self) -> Result<(), CommandError> {
        Ok(())
    }

    /// Connectionless transports are always connected.
    fn state(&self) -> ConnectionState {
        ConnectionState::Connected
    }

    /// Lifecycle and push events, for transports that have any.
    fn subscribe(&self) -> Option<broadcast::Receiver<TransportEvent>> {
        None
    }

    /// Release connection resources and cancel pending calls.
    async fn close(&self) {}
}
