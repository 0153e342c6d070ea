//! Client facade.
//!
//! A [`Client`] owns exactly one transport and presents the same surface for all
//! of them: every call resolves to a [`ResultEnvelope`], batches resolve to a
//! [`BatchResult`], pipelines to a [`PipelineResult`], and connection lifecycle plus server push events are
//! observable through [`Client::on`].
//!
//! # Example
//!
//! ```ignore
//! use cmdwire::{Client, CommandDescriptor, CommandRegistry};
//!
//! let registry = Arc::new(CommandRegistry::new());
//! registry.register(CommandDescriptor::new("echo", |input: Value, _ctx| async move {
//!     Ok::<_, CommandError>(input)
//! }))?;
//!
//! // Same process
//! let client = Client::builder().direct(registry.clone());
//!
//! // Over a persistent connection
//! let client = Client::builder()
//!     .call_timeout(Duration::from_secs(5))
//!     .streaming(UnixConnector::new(&path));
//!
//! let result = client.call("echo", json!({"v": 1})).await;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::batch::{execute_batch, BatchRequest, BatchResult};
use crate::pipeline::{execute_pipeline, PipelineRequest, PipelineResult};
use crate::codec::WireCodec;
use crate::config::ClientConfig;
use crate::envelope::{failure, CommandError, ResultEnvelope};
use crate::handler::CommandRegistry;
use crate::stream::{StreamCallbacks, StreamChunk};
use crate::transport::{
    CallOptions, ConnectionState, Connector, DirectTransport, ReconnectPolicy, RequestChannel,
    RequestTransport, StreamingTransport, Transport, TransportEvent, TransportKind,
};

/// Subscribes a listener to every event.
pub const ALL_EVENTS: &str = "*";

/// Builder for a [`Client`]. The terminal methods pick the transport.
#[derive(Debug, Clone, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a loaded configuration.
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Default per-call timeout for the remote transports.
    ///
    /// Default: 30 seconds
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Codec for outgoing requests.
    ///
    /// Default: JSON
    pub fn codec(mut self, codec: WireCodec) -> Self {
        self.config.codec = codec;
        self
    }

    pub fn auto_connect(mut self, enabled: bool) -> Self {
        self.config.streaming.auto_connect = enabled;
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.streaming.auto_reconnect = enabled;
        self
    }

    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.config.streaming.reconnect = policy;
        self
    }

    /// Name sent to the server in the handshake.
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.config.streaming.client_name = Some(name.into());
        self
    }

    /// Parallelism for batches that do not set their own.
    ///
    /// Default: 8
    pub fn batch_concurrency(mut self, max: usize) -> Self {
        self.config.batch.max_concurrency = max;
        self
    }

    /// Client over an in-process registry.
    pub fn direct(self, registry: Arc<CommandRegistry>) -> Client {
        Client::new(DirectTransport::new(registry), self.config)
    }

    /// Client sending one request per call over `channel`.
    pub fn request(self, channel: impl RequestChannel) -> Client {
        let transport = RequestTransport::new(channel)
            .with_codec(self.config.codec)
            .with_timeout(self.config.call_timeout());
        Client::new(transport, self.config)
    }

    /// Client multiplexing calls over persistent connections from `connector`.
    pub fn streaming(self, connector: impl Connector) -> Client {
        let transport = StreamingTransport::with_config(connector, &self.config);
        Client::new(transport, self.config)
    }

    /// Client over a caller-supplied transport.
    pub fn transport(self, transport: impl Transport + 'static) -> Client {
        Client::new(transport, self.config)
    }
}

/// Calls commands through one transport.
pub struct Client {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    closed: AtomicBool,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    fn new(transport: impl Transport + 'static, config: ClientConfig) -> Self {
        Self {
            transport: Arc::new(transport),
            config,
            closed: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_closed() {
            return ConnectionState::Closed;
        }
        self.transport.state()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Connect ahead of the first call. A no-op for connectionless transports.
    pub async fn connect(&self) -> Result<(), CommandError> {
        if self.is_closed() {
            return Err(client_closed());
        }
        self.transport.connect().await
    }

    pub async fn call(&self, name: &str, input: Value) -> ResultEnvelope {
        self.call_with(name, input, CallOptions::new()).await
    }

    pub async fn call_with(&self, name: &str, input: Value, opts: CallOptions) -> ResultEnvelope {
        if self.is_closed() {
            return failure(client_closed());
        }
        debug!(command = %name, transport = ?self.kind(), "Call");
        self.transport.call(name, input, opts).await
    }

    /// Call a streaming command. `callbacks` see every chunk in send order and
    /// always end with exactly one terminal chunk.
    pub async fn call_stream(
        &self,
        name: &str,
        input: Value,
        callbacks: &StreamCallbacks,
        opts: CallOptions,
    ) -> ResultEnvelope {
        if self.is_closed() {
            let envelope = failure(client_closed());
            callbacks.dispatch(&StreamChunk::terminal_for(&envelope, None));
            return envelope;
        }
        self.transport.call_stream(name, input, callbacks, opts).await
    }

    /// Run a batch. Options the request leaves unset come from the client's
    /// batch defaults.
    pub async fn execute_batch(&self, mut request: BatchRequest) -> BatchResult {
        if request.options.max_concurrency.is_none() {
            request.options.max_concurrency = Some(self.config.batch.max_concurrency);
        }
        request.options.fail_fast |= self.config.batch.fail_fast;

        if self.is_closed() {
            return BatchResult::failed(client_closed(), chrono::Utc::now());
        }
        execute_batch(self.transport.as_ref(), request).await
    }

    /// Run a pipeline, one step after another.
    pub async fn execute_pipeline(&self, request: PipelineRequest) -> PipelineResult {
        if self.is_closed() {
            return PipelineResult::failed(request, client_closed());
        }
        execute_pipeline(self.transport.as_ref(), request).await
    }

    /// Raw event stream; `None` for transports without connection events.
    pub fn events(&self) -> Option<broadcast::Receiver<TransportEvent>> {
        self.transport.subscribe()
    }

    /// Run `handler` for every event named `event` (or every event for
    /// [`ALL_EVENTS`]). Lifecycle events are named `stateChanged`,
    /// `reconnecting` and `disconnected`; push events use their own name.
    ///
    /// Returns `None` when the transport has no events. The listener stops when
    /// the transport is dropped or the handle is aborted.
    pub fn on<F>(&self, event: &str, handler: F) -> Option<JoinHandle<()>>
    where
        F: Fn(&TransportEvent) + Send + 'static,
    {
        let mut events = self.transport.subscribe()?;
        let filter = event.to_string();

        Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if filter == ALL_EVENTS || event.name() == filter {
                            handler(&event);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, listener = %filter, "Event listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    }

    /// Close the transport. Pending calls resolve `CANCELLED`, as do later ones.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.transport.close().await;
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("kind", &self.kind())
            .field("state", &self.state())
            .finish()
    }
}

fn client_closed() -> CommandError {
    CommandError::cancelled("Client is closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::codes;
    use crate::handler::{CommandContext, CommandDescriptor};
    use crate::server::Server;
    use crate::transport::{LoopbackChannel, LoopbackConnector};
    use parking_lot::Mutex;
    use serde_json::json;

    fn registry() -> Arc<CommandRegistry> {
        let registry = CommandRegistry::new();
        registry
            .register(CommandDescriptor::new("echo", |input: Value, _ctx| async move {
                Ok::<_, CommandError>(input)
            }))
            .unwrap();
        registry
            .register(CommandDescriptor::new("fail", |_: Value, _ctx| async move {
                Err::<Value, _>(CommandError::conflict("nope"))
            }))
            .unwrap();
        registry
            .register(
                CommandDescriptor::new("ticks", |n: u64, ctx: CommandContext| async move {
                    for i in 0..n {
                        ctx.progress((i + 1) as f64 * 100.0 / n as f64, "tick");
                    }
                    Ok::<_, CommandError>(json!("done"))
                })
                .streaming(),
            )
            .unwrap();
        Arc::new(registry)
    }

    #[test]
    fn test_builder_configuration() {
        let builder = Client::builder()
            .call_timeout(Duration::from_secs(3))
            .codec(WireCodec::MsgPack)
            .auto_reconnect(false)
            .client_name("tests")
            .batch_concurrency(2);

        assert_eq!(builder.config.call_timeout_ms, 3000);
        assert_eq!(builder.config.codec, WireCodec::MsgPack);
        assert!(!builder.config.streaming.auto_reconnect);
        assert_eq!(builder.config.streaming.client_name.as_deref(), Some("tests"));
        assert_eq!(builder.config.batch.max_concurrency, 2);
    }

    #[tokio::test]
    async fn test_same_envelope_on_every_transport() {
        let registry = registry();
        let server = Arc::new(Server::new(registry.clone()));
        let clients = [
            Client::builder().direct(registry),
            Client::builder().request(LoopbackChannel::new(server.clone())),
            Client::builder().streaming(LoopbackConnector::new(server)),
        ];

        for client in &clients {
            let ok = client.call("echo", json!({"v": 1})).await;
            assert_eq!(ok.data(), Some(&json!({"v": 1})), "{:?}", client.kind());

            let err = client.call("fail", json!(null)).await;
            assert_eq!(err.error_code(), Some(codes::CONFLICT), "{:?}", client.kind());

            let missing = client.call("ghost", json!(null)).await;
            assert_eq!(missing.error_code(), Some(codes::NOT_FOUND), "{:?}", client.kind());
        }
    }

    #[tokio::test]
    async fn test_batch_defaults_apply() {
        let client = Client::builder()
            .with_config(ClientConfig {
                batch: crate::config::BatchDefaults {
                    max_concurrency: 1,
                    fail_fast: true,
                },
                ..ClientConfig::default()
            })
            .direct(registry());

        let result = client
            .execute_batch(BatchRequest::from_pairs([
                ("echo", json!(1)),
                ("fail", json!(null)),
                ("echo", json!(2)),
            ]))
            .await;

        assert_eq!(result.summary.succeeded, 1);
        assert_eq!(result.summary.failed, 1);
        assert_eq!(result.summary.skipped, 1);
        assert!(result.results[2].is_skipped());
    }

    #[tokio::test]
    async fn test_pipeline_over_streaming() {
        use crate::pipeline::{Condition, PipelineStep, StepStatus};

        let client = Client::builder().streaming(LoopbackConnector::new(Arc::new(Server::new(registry()))));
        client.connect().await.unwrap();
        let result = client
            .execute_pipeline(
                PipelineRequest::new(vec![
                    PipelineStep::new("echo").with_input(json!({"n": 3})).alias("start"),
                    PipelineStep::new("ticks")
                        .with_input(json!("$prev.n"))
                        .when(Condition::Exists("$steps.start.n".into())),
                    PipelineStep::new("fail").when(Condition::Eq("$prev".into(), json!("nope"))),
                ]),
            )
            .await;

        assert!(result.is_success());
        assert_eq!(result.data, Some(json!("done")));
        assert_eq!(result.steps[2].status, StepStatus::Skipped);

        client.close().await;
        let closed = client
            .execute_pipeline(PipelineRequest::new(vec![PipelineStep::new("echo")]))
            .await;
        assert_eq!(
            closed.steps[0].error.as_ref().map(|e| e.code.as_str()),
            Some(codes::CANCELLED)
        );
    }

    #[tokio::test]
    async fn test_progress_through_client() {
        let client = Client::builder().streaming(LoopbackConnector::new(Arc::new(Server::new(registry()))));
        let progress = Arc::new(Mutex::new(Vec::new()));
        let callbacks = {
            let progress = progress.clone();
            StreamCallbacks::new().on_progress(move |c| progress.lock().push(c.progress))
        };

        let result = client
            .call_stream("ticks", json!(4), &callbacks, CallOptions::new())
            .await;
        assert_eq!(result.data(), Some(&json!("done")));
        assert_eq!(*progress.lock(), vec![25.0, 50.0, 75.0, 100.0]);
    }

    #[tokio::test]
    async fn test_on_push_event() {
        let server = Arc::new(Server::new(registry()));
        let client = Client::builder().streaming(LoopbackConnector::new(server.clone()));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let listener = client
            .on("build.done", move |event| {
                let _ = tx.send(event.clone());
            })
            .unwrap();

        client.connect().await.unwrap();
        // One round trip so the server session is fully running.
        assert!(client.call("echo", json!(1)).await.is_success());

        assert_eq!(server.emit("build.done", json!({"ok": true})), 1);
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            TransportEvent::Push {
                event: "build.done".into(),
                data: json!({"ok": true})
            }
        );
        listener.abort();
    }

    #[tokio::test]
    async fn test_direct_has_no_events() {
        let client = Client::builder().direct(registry());
        assert!(client.on(ALL_EVENTS, |_| {}).is_none());
        assert_eq!(client.state(), ConnectionState::Connected);
        assert!(client.connect().await.is_ok());
    }

    #[tokio::test]
    async fn test_close() {
        let client = Client::builder().streaming(LoopbackConnector::new(Arc::new(Server::new(registry()))));
        client.connect().await.unwrap();
        client.close().await;

        assert_eq!(client.state(), ConnectionState::Closed);
        let result = client.call("echo", json!(1)).await;
        assert_eq!(result.error_code(), Some(codes::CANCELLED));
        assert!(client.connect().await.is_err());

        let batch = client
            .execute_batch(BatchRequest::from_pairs([("echo", json!(1))]))
            .await;
        assert!(!batch.success);
    }
}
