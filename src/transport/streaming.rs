//! Persistent streaming transport.
//!
//! One long-lived connection carries many concurrent calls. The transport is a
//! state machine over [`ConnectionState`] plus a table of pending calls:
//!
//! ```text
//! Disconnected --connect--> Connecting --welcome--> Connected
//! Connected --drop--> Reconnecting (auto_reconnect) | Disconnected
//! Reconnecting --attempt ok--> Connected
//! Reconnecting --attempts exhausted--> Disconnected
//! any --close--> Closed
//! ```
//!
//! Every successful connect starts a new epoch. Request ids are `"{epoch}-{n}"`
//! and a reply or chunk only resolves a call sent in the same epoch, so a late
//! reply from a superseded connection can never satisfy a newer call.
//!
//! While connecting or reconnecting, calls are queued and flushed in order once
//! connected. Calls sent on a connection that drops resolve `CANCELLED`; so do
//! queued calls when reconnection gives up. Deadlines are enforced by a periodic
//! sweep, whatever the connection is doing.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CallOptions, ConnectionState, Transport, TransportEvent, TransportKind};
use crate::codec::WireCodec;
use crate::config::{ClientConfig, StreamingConfig};
use crate::envelope::{failure, CommandError, ResultEnvelope};
use crate::error::{Result, WireError};
use crate::handler::CommandInfo;
use crate::protocol::handshake::client_handshake;
use crate::protocol::{
    peek_id, ExecuteParams, Frame, FrameBuffer, FrameKind, FrameReader, WireCall, WireChunk,
    WireEvent, WireId, WireReply, WireRequest,
};
use crate::server::Server;
use crate::stream::{ChunkSequencer, StreamCallbacks, StreamChunk};
use crate::writer::{spawn_writer_task, WriterHandle};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A bidirectional byte stream.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Opens a fresh connection for each connect or reconnect attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn DuplexStream>>;
}

/// In-memory connections to a [`Server`] in the same process.
#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    server: Arc<Server>,
}

impl LoopbackConnector {
    pub fn new(server: Arc<Server>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self) -> Result<Box<dyn DuplexStream>> {
        let (client, server_side) = tokio::io::duplex(64 * 1024);
        let server = self.server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve_connection(server_side).await {
                debug!(error = %e, "Loopback connection ended");
            }
        });
        Ok(Box::new(client))
    }
}

type Reader = FrameReader<ReadHalf<Box<dyn DuplexStream>>>;

fn wire_id(epoch: u64, key: u64) -> WireId {
    WireId::Str(format!("{}-{}", epoch, key))
}

fn parse_wire_id(id: &WireId) -> Option<(u64, u64)> {
    match id {
        WireId::Str(s) => {
            let (epoch, key) = s.split_once('-')?;
            Some((epoch.parse().ok()?, key.parse().ok()?))
        }
        WireId::Num(_) => None,
    }
}

/// One call in the pending table.
struct PendingCall {
    name: String,
    /// Present until the request is sent.
    params: Option<ExecuteParams>,
    /// Epoch the request was sent in; `None` while queued.
    epoch: Option<u64>,
    deadline: Instant,
    timeout_ms: u64,
    /// Cancelled after sending: the caller has its answer, a late reply is dropped.
    cancelled: bool,
    done: Option<oneshot::Sender<ResultEnvelope>>,
    chunks: Option<mpsc::UnboundedSender<StreamChunk>>,
    sequencer: Option<ChunkSequencer>,
}

impl PendingCall {
    fn resolve(&mut self, envelope: ResultEnvelope) {
        if let Some(done) = self.done.take() {
            let _ = done.send(envelope);
        }
        self.chunks = None;
    }
}

struct Shared {
    state: ConnectionState,
    epoch: u64,
    pending: HashMap<u64, PendingCall>,
    queue: VecDeque<u64>,
    writer: Option<WriterHandle>,
    commands: Vec<CommandInfo>,
    /// Request payload limit announced by the server.
    peer_max_payload: Option<u32>,
    last_error: Option<String>,
}

impl Shared {
    /// Pending-table key for a message received on `epoch`'s connection.
    fn key_for(&self, epoch: u64, id: &WireId) -> Option<u64> {
        let Some((id_epoch, key)) = parse_wire_id(id) else {
            warn!(id = %id, "Discarding message with a foreign id");
            return None;
        };
        if id_epoch != epoch || epoch != self.epoch {
            warn!(id = %id, epoch = self.epoch, "Discarding message from a previous connection");
            return None;
        }
        match self.pending.get(&key) {
            Some(call) if call.epoch == Some(epoch) => Some(key),
            Some(_) => {
                warn!(id = %id, "Discarding message for a call sent on another connection");
                None
            }
            None => {
                debug!(id = %id, "No pending call for message");
                None
            }
        }
    }
}

enum Admission {
    Send(WriterHandle, Frame),
    Queued,
    Connect,
    Rejected(ResultEnvelope),
}

struct Inner {
    connector: Box<dyn Connector>,
    config: StreamingConfig,
    codec: WireCodec,
    call_timeout: Duration,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<TransportEvent>,
    next_key: AtomicU64,
    sweeper_started: AtomicBool,
    shutdown: CancellationToken,
}

/// Multiplexed transport over a persistent connection.
pub struct StreamingTransport {
    inner: Arc<Inner>,
}

impl StreamingTransport {
    pub fn new(connector: impl Connector) -> Self {
        Self::with_config(connector, &ClientConfig::default())
    }

    pub fn with_config(connector: impl Connector, config: &ClientConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                connector: Box::new(connector),
                config: config.streaming.clone(),
                codec: config.codec,
                call_timeout: config.call_timeout(),
                shared: Mutex::new(Shared {
                    state: ConnectionState::Disconnected,
                    epoch: 0,
                    pending: HashMap::new(),
                    queue: VecDeque::new(),
                    writer: None,
                    commands: Vec::new(),
                    peer_max_payload: None,
                    last_error: None,
                }),
                state_tx,
                events,
                next_key: AtomicU64::new(0),
                sweeper_started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Connect (or wait for an attempt in progress) until connected or given up.
    pub async fn connect(&self) -> std::result::Result<(), CommandError> {
        self.inner.connect().await
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.lock().state
    }

    /// Current connection generation; 0 before the first connect.
    pub fn epoch(&self) -> u64 {
        self.inner.shared.lock().epoch
    }

    /// Commands announced by the server in the last handshake.
    pub fn commands(&self) -> Vec<CommandInfo> {
        self.inner.shared.lock().commands.clone()
    }

    /// Calls queued or awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.shared.lock().pending.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    /// Cancel every pending call and stop for good.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for StreamingTransport {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl std::fmt::Debug for StreamingTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.inner.shared.lock();
        f.debug_struct("StreamingTransport")
            .field("state", &shared.state)
            .field("epoch", &shared.epoch)
            .field("pending", &shared.pending.len())
            .finish()
    }
}

#[async_trait]
impl Transport for StreamingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Streaming
    }

    async fn call(&self, name: &str, input: Value, opts: CallOptions) -> ResultEnvelope {
        self.inner.call(name, input, None, opts).await
    }

    async fn call_stream(
        &self,
        name: &str,
        input: Value,
        callbacks: &StreamCallbacks,
        opts: CallOptions,
    ) -> ResultEnvelope {
        self.inner.call(name, input, Some(callbacks), opts).await
    }

    async fn connect(&self) -> std::result::Result<(), CommandError> {
        self.inner.connect().await
    }

    fn state(&self) -> ConnectionState {
        StreamingTransport::state(self)
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<TransportEvent>> {
        Some(self.inner.events.subscribe())
    }

    async fn close(&self) {
        self.inner.close();
    }
}

async fn next_chunk(rx: &mut Option<mpsc::UnboundedReceiver<StreamChunk>>) -> Option<StreamChunk> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Inner {
    fn set_state(&self, shared: &mut Shared, state: ConnectionState) {
        if shared.state == state {
            return;
        }
        info!(from = ?shared.state, to = ?state, epoch = shared.epoch, "Connection state changed");
        shared.state = state;
        self.state_tx.send_replace(state);
        let _ = self.events.send(TransportEvent::StateChanged(state));
    }

    async fn call(
        self: &Arc<Self>,
        name: &str,
        input: Value,
        callbacks: Option<&StreamCallbacks>,
        opts: CallOptions,
    ) -> ResultEnvelope {
        let started = Instant::now();
        let (envelope, saw_terminal) = self.round_trip(name, input, callbacks, &opts).await;

        if let Some(callbacks) = callbacks {
            if !saw_terminal {
                let elapsed = started.elapsed().as_millis() as u64;
                callbacks.dispatch(&StreamChunk::terminal_for(&envelope, Some(elapsed)));
            }
        }
        envelope
    }

    /// Run one call; also reports whether a terminal chunk reached the callbacks.
    async fn round_trip(
        self: &Arc<Self>,
        name: &str,
        input: Value,
        callbacks: Option<&StreamCallbacks>,
        opts: &CallOptions,
    ) -> (ResultEnvelope, bool) {
        if opts.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            return (failure(cancelled_by_caller(name)), false);
        }

        let timeout = opts.timeout.unwrap_or(self.call_timeout);
        let key = self.next_key.fetch_add(1, Ordering::Relaxed) + 1;
        let (done_tx, mut done_rx) = oneshot::channel();
        let (chunk_tx, mut chunk_rx) = match callbacks {
            Some(_) => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };

        let call = PendingCall {
            name: name.to_string(),
            params: Some(ExecuteParams {
                name: name.to_string(),
                input,
                stream: callbacks.is_some(),
                trace_id: opts.trace_id.clone(),
            }),
            epoch: None,
            deadline: Instant::now() + timeout,
            timeout_ms: timeout.as_millis() as u64,
            cancelled: false,
            done: Some(done_tx),
            chunks: chunk_tx,
            sequencer: callbacks.map(|_| ChunkSequencer::new(self.config.max_reorder_buffer)),
        };

        match self.admit(key, call) {
            Admission::Rejected(envelope) => return (envelope, false),
            Admission::Send(writer, frame) => {
                if let Err(e) = writer.send(frame).await {
                    self.fail(
                        key,
                        CommandError::internal(format!("Could not send request: {}", e))
                            .with_retryable(true),
                    );
                }
            }
            Admission::Queued => debug!(command = %name, key, "Call queued"),
            Admission::Connect => {
                debug!(command = %name, key, "Call queued, connecting");
                tokio::spawn(self.clone().establish());
            }
        }
        self.ensure_sweeper();

        let mut saw_terminal = false;
        let envelope = loop {
            tokio::select! {
                biased;
                Some(chunk) = next_chunk(&mut chunk_rx) => {
                    saw_terminal |= chunk.is_terminal();
                    if let Some(callbacks) = callbacks {
                        callbacks.dispatch(&chunk);
                    }
                }
                outcome = &mut done_rx => {
                    break outcome.unwrap_or_else(|_| failure(CommandError::cancelled("Call was dropped by the transport")));
                }
                _ = opts.cancelled() => self.cancel_call(key, name),
            }
        };

        if let Some(rx) = chunk_rx.as_mut() {
            while let Ok(chunk) = rx.try_recv() {
                saw_terminal |= chunk.is_terminal();
                if let Some(callbacks) = callbacks {
                    callbacks.dispatch(&chunk);
                }
            }
        }
        (envelope, saw_terminal)
    }

    fn admit(&self, key: u64, mut call: PendingCall) -> Admission {
        let mut shared = self.shared.lock();
        match shared.state {
            ConnectionState::Closed => {
                Admission::Rejected(failure(CommandError::cancelled("Transport is closed")))
            }
            ConnectionState::Connected => {
                let Some(writer) = shared.writer.clone() else {
                    shared.pending.insert(key, call);
                    shared.queue.push_back(key);
                    return Admission::Queued;
                };
                let epoch = shared.epoch;
                let limit = self.payload_limit(&shared);
                match self.request_frame(epoch, key, &mut call, limit) {
                    Ok(frame) => {
                        shared.pending.insert(key, call);
                        Admission::Send(writer, frame)
                    }
                    Err(envelope) => Admission::Rejected(envelope),
                }
            }
            ConnectionState::Disconnected if !self.config.auto_connect => Admission::Rejected(
                failure(
                    CommandError::cancelled("Not connected")
                        .with_suggestion("Call connect() first or enable auto_connect"),
                ),
            ),
            ConnectionState::Disconnected => {
                shared.pending.insert(key, call);
                shared.queue.push_back(key);
                self.set_state(&mut shared, ConnectionState::Connecting);
                Admission::Connect
            }
            _ => {
                shared.pending.insert(key, call);
                shared.queue.push_back(key);
                Admission::Queued
            }
        }
    }

    /// Largest request payload the current connection takes.
    fn payload_limit(&self, shared: &Shared) -> usize {
        let peer = shared.peer_max_payload.unwrap_or(u32::MAX);
        self.config.max_payload_size.min(peer) as usize
    }

    /// Encode the request for `call`, marking it sent in `epoch`.
    ///
    /// A request over `limit` fails on its own; the peer would drop the whole
    /// connection for it.
    fn request_frame(
        &self,
        epoch: u64,
        key: u64,
        call: &mut PendingCall,
        limit: usize,
    ) -> std::result::Result<Frame, ResultEnvelope> {
        let Some(params) = call.params.take() else {
            return Err(failure(CommandError::internal("Request was already sent")));
        };
        call.epoch = Some(epoch);
        let request = WireRequest {
            id: wire_id(epoch, key),
            call: WireCall::Execute(params),
        };
        let frame = Frame::encode(FrameKind::Request, self.codec, false, &request).map_err(|e| {
            failure(CommandError::internal(format!("Could not encode request: {}", e)))
        })?;

        if frame.payload_len() > limit {
            warn!(command = %call.name, size = frame.payload_len(), limit, "Request too large");
            return Err(failure(
                CommandError::validation(format!(
                    "Request for '{}' is {} bytes; the connection accepts at most {}",
                    call.name,
                    frame.payload_len(),
                    limit
                ))
                .with_suggestion("Send a smaller input")
                .with_detail("payloadSize", serde_json::json!(frame.payload_len()))
                .with_detail("maxPayloadSize", serde_json::json!(limit)),
            ));
        }
        Ok(frame)
    }

    fn fail(&self, key: u64, error: CommandError) {
        let mut shared = self.shared.lock();
        if let Some(mut call) = shared.pending.remove(&key) {
            shared.queue.retain(|k| *k != key);
            call.resolve(failure(error));
        }
    }

    fn cancel_call(&self, key: u64, name: &str) {
        let notify = {
            let mut shared = self.shared.lock();
            let Some(call) = shared.pending.get_mut(&key) else {
                return;
            };
            match call.epoch {
                None => {
                    if let Some(mut call) = shared.pending.remove(&key) {
                        call.resolve(failure(cancelled_by_caller(name)));
                    }
                    shared.queue.retain(|k| *k != key);
                    debug!(command = %name, key, "Queued call cancelled");
                    None
                }
                Some(epoch) => {
                    call.cancelled = true;
                    call.sequencer = None;
                    call.resolve(failure(cancelled_by_caller(name)));
                    debug!(command = %name, key, "In-flight call cancelled");
                    if epoch == shared.epoch {
                        shared.writer.clone().map(|w| (w, wire_id(epoch, key)))
                    } else {
                        None
                    }
                }
            }
        };

        if let Some((writer, id)) = notify {
            self.send_cancel(&writer, id);
        }
    }

    /// Best-effort: ask the server to abort a request.
    fn send_cancel(&self, writer: &WriterHandle, id: WireId) {
        let request = WireRequest::cancel(id, Some("cancelled by caller".to_string()));
        match Frame::encode(FrameKind::Request, self.codec, false, &request) {
            Ok(frame) => {
                if let Err(e) = writer.try_send(frame) {
                    debug!(error = %e, "Could not send cancel");
                }
            }
            Err(e) => debug!(error = %e, "Could not encode cancel"),
        }
    }

    async fn connect(self: &Arc<Self>) -> std::result::Result<(), CommandError> {
        let start = {
            let mut shared = self.shared.lock();
            match shared.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closed => {
                    return Err(CommandError::cancelled("Transport is closed"))
                }
                ConnectionState::Disconnected => {
                    self.set_state(&mut shared, ConnectionState::Connecting);
                    true
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting => false,
            }
        };
        let mut state_rx = self.state_tx.subscribe();
        if start {
            tokio::spawn(self.clone().establish());
        }
        self.ensure_sweeper();

        let settled = state_rx
            .wait_for(|s| {
                matches!(
                    s,
                    ConnectionState::Connected | ConnectionState::Disconnected | ConnectionState::Closed
                )
            })
            .await
            .map(|s| *s);

        match settled {
            Ok(ConnectionState::Connected) => Ok(()),
            Ok(ConnectionState::Disconnected) => {
                let reason = self
                    .shared
                    .lock()
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "connection failed".to_string());
                Err(CommandError::internal(format!("Could not connect: {}", reason))
                    .with_retryable(true))
            }
            _ => Err(CommandError::cancelled("Transport is closed")),
        }
    }

    /// First connection attempt; falls back to the reconnect loop.
    async fn establish(self: Arc<Self>) {
        match self.open().await {
            Ok(()) => return,
            Err(e) => {
                warn!(error = %e, "Connect failed");
                self.shared.lock().last_error = Some(e.to_string());
            }
        }

        if self.config.auto_reconnect {
            self.reconnect().await;
        } else {
            let mut shared = self.shared.lock();
            let reason = shared
                .last_error
                .clone()
                .unwrap_or_else(|| "connect failed".to_string());
            self.give_up(&mut shared, reason);
        }
    }

    async fn reconnect(self: Arc<Self>) {
        {
            let mut shared = self.shared.lock();
            if shared.state == ConnectionState::Closed {
                return;
            }
            self.set_state(&mut shared, ConnectionState::Reconnecting);
        }

        let policy = self.config.reconnect;
        for (attempt, delay) in (1..).zip(policy.delays()) {
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Waiting to reconnect");
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.open().await {
                Ok(()) => return,
                Err(e) => {
                    warn!(attempt, max_attempts = policy.max_attempts, error = %e, "Reconnect attempt failed");
                    self.shared.lock().last_error = Some(e.to_string());
                    let _ = self.events.send(TransportEvent::Reconnecting {
                        attempt,
                        max_attempts: policy.max_attempts,
                    });
                }
            }
        }

        let mut shared = self.shared.lock();
        self.give_up(
            &mut shared,
            format!("Gave up after {} reconnect attempts", policy.max_attempts),
        );
    }

    /// Cancel everything pending and settle in `Disconnected`.
    fn give_up(&self, shared: &mut Shared, reason: String) {
        if shared.state == ConnectionState::Closed {
            return;
        }
        warn!(reason = %reason, pending = shared.pending.len(), "Disconnected");
        for (_, mut call) in shared.pending.drain() {
            call.resolve(failure(CommandError::cancelled(format!(
                "Disconnected: {}",
                reason
            ))));
        }
        shared.queue.clear();
        shared.writer = None;
        shared.last_error = Some(reason.clone());
        self.set_state(shared, ConnectionState::Disconnected);
        let _ = self.events.send(TransportEvent::Disconnected { reason });
    }

    /// Connect, handshake, start a new epoch and flush the queue.
    async fn open(self: &Arc<Self>) -> Result<()> {
        let attempt = async {
            let stream = self.connector.connect().await?;
            let (read_half, mut write_half) = tokio::io::split(stream);
            let mut reader = FrameReader::with_buffer(
                read_half,
                FrameBuffer::with_max_payload(self.config.max_payload_size),
            );
            let welcome = client_handshake(
                &mut reader,
                &mut write_half,
                self.codec,
                self.config.client_name.as_deref(),
            )
            .await?;
            Ok::<_, WireError>((reader, write_half, welcome))
        };

        let (reader, write_half, welcome) =
            tokio::time::timeout(self.config.handshake_timeout(), attempt)
                .await
                .map_err(|_| WireError::Handshake("Timed out".to_string()))??;
        let (writer, _writer_task) = spawn_writer_task(write_half, self.config.writer.clone());

        let (epoch, flush) = {
            let mut shared = self.shared.lock();
            if shared.state == ConnectionState::Closed {
                return Ok(());
            }
            shared.epoch += 1;
            let epoch = shared.epoch;
            shared.writer = Some(writer.clone());
            shared.peer_max_payload = welcome.max_payload_size;
            shared.commands = welcome.commands;
            let limit = self.payload_limit(&shared);
            shared.last_error = None;

            let mut frames = Vec::with_capacity(shared.queue.len());
            while let Some(key) = shared.queue.pop_front() {
                let Some(call) = shared.pending.get_mut(&key) else {
                    continue;
                };
                match self.request_frame(epoch, key, call, limit) {
                    Ok(frame) => frames.push(frame),
                    Err(envelope) => {
                        if let Some(mut call) = shared.pending.remove(&key) {
                            call.resolve(envelope);
                        }
                    }
                }
            }
            self.set_state(&mut shared, ConnectionState::Connected);
            (epoch, frames)
        };

        info!(epoch, flushed = flush.len(), "Connected");
        tokio::spawn(self.clone().read_loop(epoch, reader));

        for frame in flush {
            if writer.send(frame).await.is_err() {
                // The read loop sees the same failure and cancels what was sent.
                break;
            }
        }
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, epoch: u64, mut reader: Reader) {
        let reason = loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                frame = reader.next_frame() => frame,
            };
            match frame {
                Ok(Some(frame)) => self.on_frame(epoch, frame),
                Ok(None) => break "connection closed by peer".to_string(),
                Err(e) => break e.to_string(),
            }
        };
        self.on_connection_lost(epoch, reason);
    }

    fn on_frame(&self, epoch: u64, frame: Frame) {
        match frame.kind() {
            Some(FrameKind::Reply) => match frame.decode::<WireReply>() {
                Ok(reply) => self.on_reply(epoch, reply),
                Err(e) => self.on_malformed(epoch, &frame, e),
            },
            Some(FrameKind::Chunk) => match frame.decode::<WireChunk>() {
                Ok(chunk) => self.on_chunk(epoch, chunk),
                Err(e) => self.on_malformed(epoch, &frame, e),
            },
            Some(FrameKind::Event) => match frame.decode::<WireEvent>() {
                Ok(event) => {
                    debug!(event = %event.event, "Push event");
                    let _ = self.events.send(TransportEvent::Push {
                        event: event.event,
                        data: event.data,
                    });
                }
                Err(e) => warn!(error = %e, "Dropping undecodable event"),
            },
            kind => warn!(?kind, "Ignoring unexpected frame"),
        }
    }

    /// A reply or chunk that does not decode fails its call, if it names one.
    fn on_malformed(&self, epoch: u64, frame: &Frame, error: WireError) {
        let Some(id) = peek_id(frame.codec(), frame.payload()) else {
            warn!(error = %error, "Dropping undecodable frame");
            return;
        };
        let mut shared = self.shared.lock();
        let Some(key) = shared.key_for(epoch, &id) else {
            return;
        };
        if let Some(mut call) = shared.pending.remove(&key) {
            warn!(id = %id, error = %error, "Malformed reply");
            call.resolve(failure(CommandError::internal(format!(
                "Malformed reply: {}",
                error
            ))));
        }
    }

    fn on_reply(&self, epoch: u64, reply: WireReply) {
        let mut shared = self.shared.lock();
        let Some(key) = shared.key_for(epoch, &reply.id) else {
            return;
        };
        let Some(mut call) = shared.pending.remove(&key) else {
            return;
        };
        if call.cancelled {
            warn!(id = %reply.id, "Discarding reply for a cancelled call");
            return;
        }
        debug!(id = %reply.id, "Reply");
        call.resolve(reply.into_outcome::<ResultEnvelope>().unwrap_or_else(failure));
    }

    fn on_chunk(&self, epoch: u64, chunk: WireChunk) {
        let WireChunk { id, seq, chunk } = chunk;
        let notify = {
            let mut shared = self.shared.lock();
            let Some(key) = shared.key_for(epoch, &id) else {
                return;
            };
            let Some(call) = shared.pending.get_mut(&key) else {
                return;
            };
            if call.cancelled {
                debug!(id = %id, seq, "Discarding chunk for a cancelled call");
                if chunk.is_terminal() {
                    shared.pending.remove(&key);
                }
                return;
            }
            let Some(sequencer) = call.sequencer.as_mut() else {
                warn!(id = %id, seq, "Discarding chunk for a non-streaming call");
                return;
            };

            match sequencer.push(seq, chunk) {
                Ok(ready) => {
                    let mut outcome = None;
                    for chunk in ready {
                        if chunk.is_terminal() {
                            outcome = chunk.clone().into_envelope();
                        }
                        if let Some(tx) = &call.chunks {
                            let _ = tx.send(chunk);
                        }
                    }
                    if let Some(envelope) = outcome {
                        if let Some(mut call) = shared.pending.remove(&key) {
                            call.resolve(envelope);
                        }
                    }
                    None
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "Rejecting stream");
                    if let Some(mut call) = shared.pending.remove(&key) {
                        call.resolve(failure(CommandError::internal(format!(
                            "Stream out of order: {}",
                            e
                        ))));
                    }
                    shared.writer.clone()
                }
            }
        };

        if let Some(writer) = notify {
            self.send_cancel(&writer, id);
        }
    }

    fn on_connection_lost(self: &Arc<Self>, epoch: u64, reason: String) {
        let mut shared = self.shared.lock();
        if shared.epoch != epoch || shared.state != ConnectionState::Connected {
            return;
        }
        warn!(epoch, reason = %reason, "Connection lost");
        shared.writer = None;
        shared.last_error = Some(reason.clone());

        let sent: Vec<u64> = shared
            .pending
            .iter()
            .filter(|(_, call)| call.epoch.is_some())
            .map(|(key, _)| *key)
            .collect();
        for key in sent {
            if let Some(mut call) = shared.pending.remove(&key) {
                call.resolve(failure(CommandError::cancelled(format!(
                    "Connection lost: {}",
                    reason
                ))));
            }
        }

        if self.config.auto_reconnect {
            self.set_state(&mut shared, ConnectionState::Reconnecting);
            drop(shared);
            tokio::spawn(self.clone().reconnect());
        } else {
            self.give_up(&mut shared, reason);
        }
    }

    fn ensure_sweeper(self: &Arc<Self>) {
        if self.sweeper_started.swap(true, Ordering::AcqRel) {
            return;
        }
        tokio::spawn(sweep_loop(
            Arc::downgrade(self),
            self.config.sweep_interval(),
            self.shutdown.clone(),
        ));
    }

    /// Time out every call past its deadline.
    fn sweep(&self, now: Instant) {
        let (writer, expired_ids) = {
            let mut shared = self.shared.lock();
            let expired: Vec<u64> = shared
                .pending
                .iter()
                .filter(|(_, call)| call.deadline <= now)
                .map(|(key, _)| *key)
                .collect();
            if expired.is_empty() {
                return;
            }

            let current = shared.epoch;
            let mut ids = Vec::new();
            for key in expired {
                let Some(mut call) = shared.pending.remove(&key) else {
                    continue;
                };
                shared.queue.retain(|k| *k != key);
                if call.cancelled {
                    continue;
                }
                debug!(command = %call.name, key, "Call timed out");
                call.resolve(failure(CommandError::timeout(&call.name, call.timeout_ms)));
                if call.epoch == Some(current) {
                    ids.push(wire_id(current, key));
                }
            }
            (shared.writer.clone(), ids)
        };

        if let Some(writer) = writer {
            for id in expired_ids {
                self.send_cancel(&writer, id);
            }
        }
    }

    fn close(&self) {
        {
            let mut shared = self.shared.lock();
            if shared.state == ConnectionState::Closed {
                return;
            }
            for (_, mut call) in shared.pending.drain() {
                call.resolve(failure(CommandError::cancelled("Transport is closed")));
            }
            shared.queue.clear();
            shared.writer = None;
            self.set_state(&mut shared, ConnectionState::Closed);
        }
        self.shutdown.cancel();
    }
}

async fn sweep_loop(inner: Weak<Inner>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match inner.upgrade() {
            Some(inner) => inner.sweep(Instant::now()),
            None => return,
        }
    }
}

fn cancelled_by_caller(name: &str) -> CommandError {
    CommandError::cancelled(format!("Call to '{}' was cancelled", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::envelope::codes;
    use crate::handler::{CommandContext, CommandDescriptor, CommandRegistry};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn server() -> Arc<Server> {
        server_with(ServerConfig::default())
    }

    fn server_with(config: ServerConfig) -> Arc<Server> {
        let registry = CommandRegistry::new();
        registry
            .register(CommandDescriptor::new("echo", |input: Value, _ctx| async move {
                Ok::<_, CommandError>(input)
            }))
            .unwrap();
        registry
            .register(CommandDescriptor::new("hang", |_: Value, ctx: CommandContext| async move {
                ctx.cancelled().await;
                Ok::<_, CommandError>(Value::Null)
            }))
            .unwrap();
        registry
            .register(
                CommandDescriptor::new("count", |n: u64, ctx: CommandContext| async move {
                    for i in 0..n {
                        ctx.data(json!(i));
                    }
                    Ok::<_, CommandError>(n)
                })
                .streaming(),
            )
            .unwrap();
        Arc::new(Server::with_config(Arc::new(registry), config))
    }

    /// Holds every connect until released.
    struct Gated {
        gate: Arc<Notify>,
        inner: LoopbackConnector,
    }

    #[async_trait]
    impl Connector for Gated {
        async fn connect(&self) -> Result<Box<dyn DuplexStream>> {
            self.gate.notified().await;
            self.inner.connect().await
        }
    }

    struct Refusing(Arc<AtomicUsize>);

    #[async_trait]
    impl Connector for Refusing {
        async fn connect(&self) -> Result<Box<dyn DuplexStream>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into())
        }
    }

    #[tokio::test]
    async fn test_auto_connect_and_call() {
        let transport = StreamingTransport::new(LoopbackConnector::new(server()));
        assert_eq!(transport.state(), ConnectionState::Disconnected);

        let result = transport.call("echo", json!({"v": 1}), CallOptions::new()).await;
        assert_eq!(result.data(), Some(&json!({"v": 1})));
        assert_eq!(transport.state(), ConnectionState::Connected);
        assert_eq!(transport.epoch(), 1);
        assert_eq!(transport.commands().len(), 3);
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_without_auto_connect() {
        let mut config = ClientConfig::default();
        config.streaming.auto_connect = false;
        let transport = StreamingTransport::with_config(LoopbackConnector::new(server()), &config);

        let result = transport.call("echo", json!(1), CallOptions::new()).await;
        assert_eq!(result.error_code(), Some(codes::CANCELLED));

        transport.connect().await.unwrap();
        let result = transport.call("echo", json!(1), CallOptions::new()).await;
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_concurrent_calls_correlate() {
        let transport = Arc::new(StreamingTransport::new(LoopbackConnector::new(server())));
        transport.connect().await.unwrap();

        let calls: Vec<_> = (0..20)
            .map(|i| {
                let transport = transport.clone();
                tokio::spawn(async move { transport.call("echo", json!(i), CallOptions::new()).await })
            })
            .collect();
        for (i, call) in calls.into_iter().enumerate() {
            assert_eq!(call.await.unwrap().data(), Some(&json!(i)));
        }
    }

    #[tokio::test]
    async fn test_streaming_call() {
        let transport = StreamingTransport::new(LoopbackConnector::new(server()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let callbacks = {
            let (data, done) = (seen.clone(), seen.clone());
            StreamCallbacks::new()
                .on_data(move |c| data.lock().push(c.data.clone()))
                .on_complete(move |c| done.lock().push(json!({"complete": c.data})))
        };

        let result = transport
            .call_stream("count", json!(3), &callbacks, CallOptions::new())
            .await;
        assert_eq!(result.data(), Some(&json!(3)));
        assert_eq!(
            *seen.lock(),
            vec![json!(0), json!(1), json!(2), json!({"complete": 3})]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_times_out() {
        let transport = StreamingTransport::new(LoopbackConnector::new(server()));
        let opts = CallOptions::new().with_timeout(Duration::from_millis(250));

        let result = transport.call("hang", json!(null), opts).await;
        assert_eq!(result.error_code(), Some(codes::TIMEOUT));
        assert_eq!(transport.pending_count(), 0);

        // The connection is still healthy.
        let result = transport.call("echo", json!(1), CallOptions::new()).await;
        assert!(result.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_request_fails_alone() {
        let config = ServerConfig {
            max_payload_size: 1024,
            ..ServerConfig::default()
        };
        let transport = Arc::new(StreamingTransport::new(LoopbackConnector::new(server_with(config))));
        transport.connect().await.unwrap();

        let slow = {
            let transport = transport.clone();
            let opts = CallOptions::new().with_timeout(Duration::from_millis(300));
            tokio::spawn(async move { transport.call("hang", json!(null), opts).await })
        };
        while transport.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        let big = transport
            .call("echo", json!("x".repeat(4096)), CallOptions::new())
            .await;
        let error = big.error().unwrap();
        assert_eq!(error.code, codes::VALIDATION_ERROR);
        assert_eq!(error.detail("maxPayloadSize"), Some(&json!(1024)));

        // Neither the connection nor the other call noticed.
        assert!(transport.call("echo", json!("small"), CallOptions::new()).await.is_success());
        assert_eq!(slow.await.unwrap().error_code(), Some(codes::TIMEOUT));
        assert_eq!(transport.epoch(), 1);
        assert_eq!(transport.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_queued_call_is_cancelled() {
        let gate = Arc::new(Notify::new());
        let transport = Arc::new(StreamingTransport::new(Gated {
            gate: gate.clone(),
            inner: LoopbackConnector::new(server()),
        }));
        let token = CancellationToken::new();

        let call = {
            let transport = transport.clone();
            let opts = CallOptions::new().with_cancel(token.clone());
            tokio::spawn(async move { transport.call("echo", json!(1), opts).await })
        };
        while transport.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(transport.state(), ConnectionState::Connecting);

        token.cancel();
        assert_eq!(call.await.unwrap().error_code(), Some(codes::CANCELLED));
        assert_eq!(transport.pending_count(), 0);

        // The connect still completes for later calls.
        gate.notify_one();
        let result = transport.call("echo", json!(2), CallOptions::new()).await;
        assert_eq!(result.data(), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_queued_calls_flush_in_order() {
        let gate = Arc::new(Notify::new());
        let transport = Arc::new(StreamingTransport::new(Gated {
            gate: gate.clone(),
            inner: LoopbackConnector::new(server()),
        }));

        let mut calls = Vec::new();
        for i in 0..3 {
            let caller = transport.clone();
            calls.push(tokio::spawn(async move {
                caller.call("echo", json!(i), CallOptions::new()).await
            }));
            while transport.pending_count() <= i {
                tokio::task::yield_now().await;
            }
        }

        gate.notify_one();
        for (i, call) in calls.into_iter().enumerate() {
            assert_eq!(call.await.unwrap().data(), Some(&json!(i)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut config = ClientConfig::default();
        config.streaming.reconnect.max_attempts = 3;
        let transport = StreamingTransport::with_config(Refusing(attempts.clone()), &config);
        let mut events = transport.subscribe();

        let result = transport.call("echo", json!(1), CallOptions::new()).await;
        assert_eq!(result.error_code(), Some(codes::CANCELLED));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        // Initial attempt plus three retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 4);

        let mut reconnecting = Vec::new();
        let mut disconnected = false;
        while let Ok(event) = events.try_recv() {
            match event {
                TransportEvent::Reconnecting { attempt, max_attempts } => {
                    assert_eq!(max_attempts, 3);
                    reconnecting.push(attempt);
                }
                TransportEvent::Disconnected { .. } => disconnected = true,
                _ => {}
            }
        }
        assert_eq!(reconnecting, vec![1, 2, 3]);
        assert!(disconnected);
    }

    #[tokio::test]
    async fn test_close_cancels_and_rejects() {
        let transport = Arc::new(StreamingTransport::new(LoopbackConnector::new(server())));
        transport.connect().await.unwrap();

        let pending = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.call("hang", json!(null), CallOptions::new()).await })
        };
        while transport.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        transport.close();
        assert_eq!(pending.await.unwrap().error_code(), Some(codes::CANCELLED));
        assert_eq!(transport.state(), ConnectionState::Closed);

        let result = transport.call("echo", json!(1), CallOptions::new()).await;
        assert_eq!(result.error_code(), Some(codes::CANCELLED));
        assert!(transport.connect().await.is_err());
    }

    #[test]
    fn test_wire_ids() {
        assert_eq!(wire_id(3, 12), WireId::Str("3-12".into()));
        assert_eq!(parse_wire_id(&wire_id(3, 12)), Some((3, 12)));
        assert_eq!(parse_wire_id(&WireId::Num(7)), None);
        assert_eq!(parse_wire_id(&WireId::Str("x-1".into())), None);
    }
}
