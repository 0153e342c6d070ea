//! Request/response transport.
//!
//! Each call is one request frame and exactly one reply frame over a
//! [`RequestChannel`]. No state is kept between calls beyond the channel and an
//! id counter. A call fails with:
//! - `TIMEOUT` when no reply arrives in time (never retried)
//! - `CANCELLED` when the caller's token fires first
//! - `INTERNAL_ERROR` for channel failures, transport faults and malformed replies

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{CallOptions, Transport, TransportKind};
use crate::batch::{BatchRequest, BatchResult};
use crate::codec::WireCodec;
use crate::config::DEFAULT_CALL_TIMEOUT;
use crate::envelope::{failure, CommandError, ResultEnvelope};
use crate::error::Result;
use crate::protocol::{ExecuteParams, Frame, FrameKind, WireCall, WireId, WireReply, WireRequest};
use crate::server::Server;
use crate::stream::{StreamCallbacks, StreamChunk};

/// Carries one request frame to a server and returns its reply frame.
#[async_trait]
pub trait RequestChannel: Send + Sync + 'static {
    async fn round_trip(&self, request: Frame) -> Result<Frame>;
}

/// In-memory channel to a [`Server`] in the same process. The request still goes
/// through encoding and framing, exactly as over a socket.
#[derive(Debug, Clone)]
pub struct LoopbackChannel {
    server: Arc<Server>,
}

impl LoopbackChannel {
    pub fn new(server: Arc<Server>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl RequestChannel for LoopbackChannel {
    async fn round_trip(&self, request: Frame) -> Result<Frame> {
        Ok(self.server.handle_frame(request).await)
    }
}

/// Single-shot transport over a [`RequestChannel`].
pub struct RequestTransport {
    channel: Arc<dyn RequestChannel>,
    codec: WireCodec,
    timeout: Duration,
    next_id: AtomicU64,
}

impl RequestTransport {
    pub fn new(channel: impl RequestChannel) -> Self {
        Self {
            channel: Arc::new(channel),
            codec: WireCodec::default(),
            timeout: DEFAULT_CALL_TIMEOUT,
            next_id: AtomicU64::new(0),
        }
    }

    pub fn with_codec(mut self, codec: WireCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Timeout for calls that do not pass their own.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn next_id(&self) -> WireId {
        WireId::Num(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Send a whole batch in one round trip; the server runs it.
    pub async fn execute_remote_batch(&self, request: BatchRequest, opts: CallOptions) -> BatchResult {
        let started_at = Utc::now();
        let wire = WireRequest::batch(self.next_id(), request.items, request.options);

        match self.exchange::<BatchResult>(&wire, "batch", &opts).await {
            Ok(result) => result,
            Err(error) => BatchResult::failed(error, started_at),
        }
    }

    async fn exchange<T: DeserializeOwned>(
        &self,
        request: &WireRequest,
        operation: &str,
        opts: &CallOptions,
    ) -> std::result::Result<T, CommandError> {
        let limit = opts.timeout.unwrap_or(self.timeout);
        let frame = Frame::encode(FrameKind::Request, self.codec, false, request)
            .map_err(|e| CommandError::internal(format!("Could not encode request: {}", e)))?;

        debug!(id = %request.id, operation = %operation, "Sending request");
        let round_trip = tokio::time::timeout(limit, self.channel.round_trip(frame));

        let reply = tokio::select! {
            biased;
            _ = opts.cancelled() => {
                return Err(CommandError::cancelled(format!("Call to '{}' was cancelled", operation)));
            }
            outcome = round_trip => match outcome {
                Err(_) => {
                    debug!(id = %request.id, "Request timed out");
                    return Err(CommandError::timeout(operation, limit.as_millis() as u64));
                }
                Ok(Err(e)) => {
                    warn!(id = %request.id, error = %e, "Request channel failed");
                    return Err(CommandError::internal(format!("Transport failure: {}", e))
                        .with_retryable(true));
                }
                Ok(Ok(frame)) => frame,
            },
        };

        if reply.kind() != Some(FrameKind::Reply) {
            return Err(CommandError::internal(format!(
                "Malformed reply: expected a reply frame, got {:?}",
                reply.kind()
            )));
        }
        let reply: WireReply = reply
            .decode()
            .map_err(|e| CommandError::internal(format!("Malformed reply: {}", e)))?;
        if reply.id != request.id {
            warn!(expected = %request.id, got = %reply.id, "Reply id mismatch");
            return Err(CommandError::internal(format!(
                "Malformed reply: id {} does not match request {}",
                reply.id, request.id
            )));
        }

        reply.into_outcome()
    }
}

impl std::fmt::Debug for RequestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestTransport")
            .field("codec", &self.codec)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl Transport for RequestTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Request
    }

    async fn call(&self, name: &str, input: Value, opts: CallOptions) -> ResultEnvelope {
        let request = WireRequest {
            id: self.next_id(),
            call: WireCall::Execute(ExecuteParams {
                name: name.to_string(),
                input,
                stream: false,
                trace_id: opts.trace_id.clone(),
            }),
        };

        self.exchange::<ResultEnvelope>(&request, name, &opts)
            .await
            .unwrap_or_else(failure)
    }

    /// A single reply carries no progressive output: the callbacks only see the
    /// terminal chunk.
    async fn call_stream(
        &self,
        name: &str,
        input: Value,
        callbacks: &StreamCallbacks,
        opts: CallOptions,
    ) -> ResultEnvelope {
        let started = Instant::now();
        let envelope = self.call(name, input, opts).await;
        let elapsed = started.elapsed().as_millis() as u64;
        callbacks.dispatch(&StreamChunk::terminal_for(&envelope, Some(elapsed)));
        envelope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{codes, success};
    use crate::error::WireError;
    use crate::handler::{CommandDescriptor, CommandRegistry};
    use serde_json::json;

    /// Answers every request with a fixed reply frame.
    struct Canned(Frame);

    #[async_trait]
    impl RequestChannel for Canned {
        async fn round_trip(&self, _request: Frame) -> Result<Frame> {
            Ok(self.0.clone())
        }
    }

    struct Silent;

    #[async_trait]
    impl RequestChannel for Silent {
        async fn round_trip(&self, _request: Frame) -> Result<Frame> {
            std::future::pending().await
        }
    }

    struct Broken;

    #[async_trait]
    impl RequestChannel for Broken {
        async fn round_trip(&self, _request: Frame) -> Result<Frame> {
            Err(WireError::ConnectionClosed)
        }
    }

    fn server() -> Arc<Server> {
        let registry = CommandRegistry::new();
        registry
            .register(CommandDescriptor::new("echo", |input: Value, _ctx| async move {
                Ok::<_, CommandError>(input)
            }))
            .unwrap();
        Arc::new(Server::new(Arc::new(registry)))
    }

    #[tokio::test]
    async fn test_loopback_call() {
        for codec in [WireCodec::Json, WireCodec::MsgPack] {
            let transport = RequestTransport::new(LoopbackChannel::new(server())).with_codec(codec);

            let result = transport.call("echo", json!({"v": 1}), CallOptions::new()).await;
            assert_eq!(result.data(), Some(&json!({"v": 1})));

            let result = transport.call("ghost", json!({}), CallOptions::new()).await;
            assert_eq!(result.error_code(), Some(codes::NOT_FOUND));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let transport = RequestTransport::new(Silent).with_timeout(Duration::from_millis(100));
        let result = transport.call("echo", json!(1), CallOptions::new()).await;

        let error = result.error().unwrap();
        assert_eq!(error.code, codes::TIMEOUT);
        assert_eq!(error.detail("timeoutMs"), Some(&json!(100)));
    }

    #[tokio::test]
    async fn test_channel_failure_is_internal() {
        let transport = RequestTransport::new(Broken);
        let result = transport.call("echo", json!(1), CallOptions::new()).await;
        assert_eq!(result.error_code(), Some(codes::INTERNAL_ERROR));
        assert!(result.error().unwrap().retryable);
    }

    #[tokio::test]
    async fn test_malformed_replies() {
        let wrong_id = WireReply::result(WireId::Num(99), &success(json!(1)));
        let frame = Frame::encode(FrameKind::Reply, WireCodec::Json, true, &wrong_id).unwrap();
        let transport = RequestTransport::new(Canned(frame));
        let result = transport.call("echo", json!(1), CallOptions::new()).await;
        assert_eq!(result.error_code(), Some(codes::INTERNAL_ERROR));

        let garbage = Frame::encode(FrameKind::Reply, WireCodec::Json, true, &json!("nope")).unwrap();
        let transport = RequestTransport::new(Canned(garbage));
        let result = transport.call("echo", json!(1), CallOptions::new()).await;
        assert_eq!(result.error_code(), Some(codes::INTERNAL_ERROR));
    }

    #[tokio::test]
    async fn test_remote_batch() {
        let transport = RequestTransport::new(LoopbackChannel::new(server()));
        let request = BatchRequest::from_pairs([
            ("echo", json!({"v": 1})),
            ("ghost", json!({})),
            ("echo", json!({"v": 2})),
        ]);

        let result = transport.execute_remote_batch(request, CallOptions::new()).await;
        assert_eq!(result.summary.succeeded, 2);
        assert_eq!(result.summary.failed, 1);
        assert_eq!(result.results[1].result.error_code(), Some(codes::NOT_FOUND));
    }

    #[tokio::test]
    async fn test_remote_batch_channel_failure() {
        let transport = RequestTransport::new(Broken);
        let result = transport
            .execute_remote_batch(BatchRequest::from_pairs([("echo", json!(1))]), CallOptions::new())
            .await;
        assert!(!result.success);
        assert_eq!(
            result.error.map(|e| e.code),
            Some(codes::INTERNAL_ERROR.to_string())
        );
    }
}
