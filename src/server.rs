//! Serving a registry to remote callers.
//!
//! A [`Server`] is the peer of both remote transports:
//!
//! - [`Server::handle_frame`] answers one request frame with one reply frame
//!   (what a [`RequestChannel`](crate::transport::RequestChannel) needs)
//! - [`Server::serve_connection`] runs a byte stream. A connection that opens with
//!   a `hello` control frame is persistent: requests run concurrently (bounded by
//!   a semaphore), streaming calls send chunk frames, `cancel` aborts a running
//!   handler, and push events flow to the client. A connection that opens with a
//!   request frame is served one request at a time.
//!
//! # Example
//!
//! ```ignore
//! let server = Arc::new(Server::new(registry));
//! let listener = PipeListener::bind(&path).await?;
//! server.serve_listener(listener).await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::{execute_batch, BatchRequest};
use crate::codec::WireCodec;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::handler::{CommandContext, CommandRegistry, RegistryChange};
use crate::protocol::handshake::{accept_hello, Welcome};
use crate::protocol::message::{INVALID_REQUEST, SERVER_BUSY};
use crate::protocol::{
    peek_id, write_frame, BatchParams, ExecuteParams, Frame, FrameBuffer, FrameKind, FrameReader,
    Header, TransportFault, WireCall, WireChunk, WireEvent, WireId, WireReply, WireRequest,
};
use crate::stream::StreamChunk;
use crate::transport::DirectTransport;
use crate::writer::{spawn_writer_task, WriterHandle};

/// Push event sent to every persistent connection when the command set changes.
pub const COMMANDS_CHANGED_EVENT: &str = "commands.changed";

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Serves a [`CommandRegistry`] over frames.
pub struct Server {
    registry: Arc<CommandRegistry>,
    config: ServerConfig,
    events: broadcast::Sender<WireEvent>,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(registry: Arc<CommandRegistry>) -> Self {
        Self::with_config(registry, ServerConfig::default())
    }

    pub fn with_config(registry: Arc<CommandRegistry>, config: ServerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            registry,
            config,
            events,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Push an event to every persistent connection.
    ///
    /// Returns the number of connections it was queued for.
    pub fn emit(&self, event: impl Into<String>, data: Value) -> usize {
        let event = WireEvent {
            event: event.into(),
            data,
        };
        self.events.send(event).unwrap_or(0)
    }

    /// Stop accepting, close persistent connections and abort their handlers.
    pub fn shutdown(&self) {
        info!("Server shutting down");
        self.shutdown.cancel();
    }

    /// Answer one request without a persistent connection.
    ///
    /// `cancel` needs a connection to refer to and is refused here.
    pub async fn handle_request(&self, request: WireRequest) -> WireReply {
        let WireRequest { id, call } = request;
        match call {
            WireCall::Execute(params) => {
                let ctx = context_for(&params, "request", CancellationToken::new());
                let envelope = self
                    .registry
                    .execute_with(&params.name, params.input, ctx)
                    .await;
                WireReply::result(id, &envelope)
            }
            WireCall::Batch(params) => WireReply::result(id, &self.run_batch(params).await),
            WireCall::Cancel(_) => WireReply::fault(
                id,
                TransportFault::new(INVALID_REQUEST, "cancel requires a persistent connection"),
            ),
        }
    }

    /// Answer one request frame with one reply frame.
    pub async fn handle_frame(&self, frame: Frame) -> Frame {
        let reply = match (frame.kind(), frame.decode::<WireRequest>()) {
            (Some(FrameKind::Request), Ok(request)) => self.handle_request(request).await,
            (Some(FrameKind::Request), Err(e)) => {
                debug!(error = %e, "Malformed request");
                let id = peek_id(frame.codec(), frame.payload()).unwrap_or(WireId::Num(0));
                WireReply::fault(
                    id,
                    TransportFault::new(INVALID_REQUEST, format!("Malformed request: {}", e)),
                )
            }
            (kind, _) => WireReply::fault(
                WireId::Num(0),
                TransportFault::new(INVALID_REQUEST, format!("Expected a request frame, got {:?}", kind)),
            ),
        };
        reply_frame(self.config.codec, &reply)
    }

    async fn run_batch(&self, params: BatchParams) -> crate::batch::BatchResult {
        let direct = DirectTransport::new(self.registry.clone());
        let request = BatchRequest {
            items: params.items,
            options: params.options,
        };
        execute_batch(&direct, request).await
    }

    /// Serve one connection until the peer closes it or the server shuts down.
    pub async fn serve_connection<S>(self: Arc<Self>, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = FrameReader::with_buffer(
            read_half,
            FrameBuffer::with_max_payload(self.config.max_payload_size),
        );

        let first = match reader.next_frame().await? {
            Some(frame) => frame,
            None => return Ok(()),
        };

        if first.kind() == Some(FrameKind::Request) {
            let mut frame = first;
            loop {
                let reply = self.handle_frame(frame).await;
                write_frame(&mut write_half, &reply).await?;
                frame = match reader.next_frame().await? {
                    Some(frame) => frame,
                    None => return Ok(()),
                };
            }
        }

        let welcome =
            Welcome::new(self.registry.list()).with_max_payload_size(self.config.max_payload_size);
        let hello = accept_hello(&first, &mut write_half, self.config.codec, welcome).await?;
        info!(client = ?hello.client, "Client connected");

        let (writer, _writer_task) = spawn_writer_task(write_half, self.config.writer.clone());
        let session = Session {
            server: self.clone(),
            writer,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(self.config.max_concurrent_handlers)),
        };

        let mut changes = self.registry.subscribe();
        let mut events = self.events.subscribe();
        let (mut changes_open, mut events_open) = (true, true);

        let result = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                frame = reader.next_frame() => match frame {
                    Ok(Some(frame)) => session.on_frame(frame),
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                },
                change = changes.recv(), if changes_open => match change {
                    Ok(change) => session.push(&change_event(&change)),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Registry changes lagged");
                        session.push(&WireEvent {
                            event: COMMANDS_CHANGED_EVENT.to_string(),
                            data: json!({"action": "resync"}),
                        });
                    }
                    Err(RecvError::Closed) => changes_open = false,
                },
                event = events.recv(), if events_open => match event {
                    Ok(event) => session.push(&event),
                    Err(RecvError::Lagged(missed)) => warn!(missed, "Push events lagged"),
                    Err(RecvError::Closed) => events_open = false,
                },
            }
        };

        session.abort_all();
        info!(client = ?hello.client, "Client disconnected");
        result
    }

    /// Accept connections until shutdown.
    #[cfg(unix)]
    pub async fn serve_listener(self: Arc<Self>, listener: crate::transport::PipeListener) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(stream) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.serve_connection(stream).await {
                                warn!(error = %e, "Connection ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
            }
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

fn context_for(params: &ExecuteParams, source: &str, token: CancellationToken) -> CommandContext {
    let ctx = CommandContext::new()
        .with_source(source)
        .with_cancellation(token);
    match &params.trace_id {
        Some(trace_id) => ctx.with_trace_id(trace_id.clone()),
        None => ctx,
    }
}

fn change_event(change: &RegistryChange) -> WireEvent {
    let data = match change {
        RegistryChange::Registered(name) => json!({"action": "registered", "name": name}),
        RegistryChange::Unregistered(name) => json!({"action": "unregistered", "name": name}),
    };
    WireEvent {
        event: COMMANDS_CHANGED_EVENT.to_string(),
        data,
    }
}

fn reply_frame(codec: WireCodec, reply: &WireReply) -> Frame {
    Frame::encode(FrameKind::Reply, codec, true, reply).unwrap_or_else(|e| {
        error!(id = %reply.id, error = %e, "Could not encode reply");
        Frame::new(Header::compose(FrameKind::Reply, codec, true, 0), Default::default())
    })
}

/// One persistent connection.
#[derive(Clone)]
struct Session {
    server: Arc<Server>,
    writer: WriterHandle,
    in_flight: Arc<Mutex<HashMap<WireId, CancellationToken>>>,
    permits: Arc<Semaphore>,
}

impl Session {
    fn codec(&self) -> WireCodec {
        self.server.config.codec
    }

    fn on_frame(&self, frame: Frame) {
        if frame.kind() != Some(FrameKind::Request) {
            warn!(kind = ?frame.kind(), "Ignoring unexpected frame");
            return;
        }

        let request = match frame.decode::<WireRequest>() {
            Ok(request) => request,
            Err(e) => {
                match peek_id(frame.codec(), frame.payload()) {
                    Some(id) => self.fault(
                        id,
                        TransportFault::new(INVALID_REQUEST, format!("Malformed request: {}", e)),
                    ),
                    None => warn!(error = %e, "Dropping request without an id"),
                }
                return;
            }
        };

        let WireRequest { id, call } = request;
        if let WireCall::Cancel(params) = &call {
            match self.in_flight.lock().remove(&id) {
                Some(token) => {
                    debug!(id = %id, reason = ?params.reason, "Cancelling request");
                    token.cancel();
                }
                None => debug!(id = %id, "Cancel for unknown request"),
            }
            return;
        }

        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(id = %id, "Too many concurrent requests");
                self.fault(id, TransportFault::new(SERVER_BUSY, "Server is at capacity"));
                return;
            }
        };

        let token = CancellationToken::new();
        {
            let mut in_flight = self.in_flight.lock();
            if in_flight.contains_key(&id) {
                drop(in_flight);
                self.fault(
                    id,
                    TransportFault::new(INVALID_REQUEST, "Request id is already in flight"),
                );
                return;
            }
            in_flight.insert(id.clone(), token.clone());
        }

        let session = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            tokio::select! {
                biased;
                _ = token.cancelled() => debug!(id = %id, "Request aborted"),
                _ = session.run(id.clone(), call, token.clone()) => {}
            }
            session.in_flight.lock().remove(&id);
        });
    }

    async fn run(&self, id: WireId, call: WireCall, token: CancellationToken) {
        match call {
            WireCall::Execute(params) if params.stream => self.run_streaming(id, params, token).await,
            WireCall::Execute(params) => {
                let ctx = context_for(&params, "stream", token);
                let envelope = self
                    .server
                    .registry
                    .execute_with(&params.name, params.input, ctx)
                    .await;
                self.send(FrameKind::Reply, &WireReply::result(id, &envelope)).await;
            }
            WireCall::Batch(params) => {
                let result = self.server.run_batch(params).await;
                self.send(FrameKind::Reply, &WireReply::result(id, &result)).await;
            }
            WireCall::Cancel(_) => {}
        }
    }

    /// Forward the handler's chunks, numbered from 0, then the terminal chunk.
    async fn run_streaming(&self, id: WireId, params: ExecuteParams, token: CancellationToken) {
        let started = Instant::now();
        let mut ctx = context_for(&params, "stream", token);
        let mut chunks = ctx.attach_stream();

        let run = self.server.registry.execute_with(&params.name, params.input, ctx);
        tokio::pin!(run);

        let mut seq = 0u64;
        let envelope = loop {
            tokio::select! {
                biased;
                Some(chunk) = chunks.recv() => {
                    self.send_chunk(&id, &mut seq, chunk).await;
                }
                envelope = &mut run => break envelope,
            }
        };
        while let Ok(chunk) = chunks.try_recv() {
            self.send_chunk(&id, &mut seq, chunk).await;
        }

        let elapsed = started.elapsed().as_millis() as u64;
        let terminal = StreamChunk::terminal_for(&envelope, Some(elapsed));
        self.send_chunk(&id, &mut seq, terminal).await;
    }

    async fn send_chunk(&self, id: &WireId, seq: &mut u64, chunk: StreamChunk) {
        let message = WireChunk {
            id: id.clone(),
            seq: *seq,
            chunk,
        };
        *seq += 1;
        self.send(FrameKind::Chunk, &message).await;
    }

    async fn send<T: Serialize>(&self, kind: FrameKind, message: &T) {
        let frame = match Frame::encode(kind, self.codec(), true, message) {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, ?kind, "Could not encode frame");
                return;
            }
        };
        if let Err(e) = self.writer.send(frame).await {
            debug!(error = %e, "Connection gone, dropping frame");
        }
    }

    /// Queue a reply without waiting; used from the connection loop.
    fn fault(&self, id: WireId, fault: TransportFault) {
        let frame = reply_frame(self.codec(), &WireReply::fault(id, fault));
        if let Err(e) = self.writer.try_send(frame) {
            warn!(error = %e, "Dropping fault reply");
        }
    }

    fn push(&self, event: &WireEvent) {
        match Frame::encode(FrameKind::Event, self.codec(), true, event) {
            Ok(frame) => {
                if let Err(e) = self.writer.try_send(frame) {
                    warn!(event = %event.event, error = %e, "Dropping push event");
                }
            }
            Err(e) => error!(event = %event.event, error = %e, "Could not encode event"),
        }
    }

    fn abort_all(&self) {
        for (_, token) in self.in_flight.lock().drain() {
            token.cancel();
        }
    }
}
