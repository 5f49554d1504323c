//! # Control Connection Manager
//!
//! Owns the persistent connection to a signaling server.
//!
//! ## Architecture
//!
//! ```text
//! ConnectionManager ──up()──► ControlConnection ──► supervisor task
//!                                                     │
//!                                    ┌────────────────┼──────────────┐
//!                                    ▼                ▼              ▼
//!                               reader task      writer task     reconnect
//!                               (route frames)   (drain queue)   (backoff)
//! ```
//!
//! Each live socket gets a fresh [`Session`]: the outbound frame queue, the
//! pending-acknowledgement table and the named byte channels opened on it.
//! When the socket drops, the session is shut down (pending requests fail,
//! channel readers see EOF, writers see `BrokenPipe`) and the supervisor
//! reconnects with exponential backoff, publishing [`ConnectionEvent`]s.
//!
//! ## Queues
//!
//! | Queue | Bound | When full |
//! |-------|-------|-----------|
//! | Outbound frames | `outbound_queue_size` | data writers wait; control frames are handed to a task that waits |
//! | Inbound chunks, per channel | `channel_buffer_size` | the channel is ended and the reader sees EOF |
//!
//! The transport underneath is pluggable through [`Connector`]; the default
//! is plain TCP.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::task::{Context, Poll, ready};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::{SendError, TrySendError};
use tokio::sync::mpsc::OwnedPermit;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::{ListenerConfig, MAX_PAYLOAD_SIZE};
use crate::dispatcher::{Dispatcher, Inbound, PendingRequest, Responder};
use crate::error::{Result, SignalingError};
use crate::messages::{read_frame, write_frame, Arg, Frame};

// ============================================================================
// Transport seam
// ============================================================================

/// Byte stream carrying frames to and from a signaling server.
pub trait ControlIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ControlIo for T {}

pub type BoxedIo = Box<dyn ControlIo>;

/// Opens raw byte streams to a signaling server endpoint (`host:port`).
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &str) -> std::io::Result<BoxedIo>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &str) -> std::io::Result<BoxedIo> {
        let stream = TcpStream::connect(endpoint).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

// ============================================================================
// Events
// ============================================================================

/// Lifecycle of a control connection. `generation` names the session the
/// event is about; generations are unique within the process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected { endpoint: String, generation: u64 },
    /// The session `generation` lost its socket.
    Disconnected { generation: u64, reason: String },
    /// A new session `generation` replaced the lost one.
    Reconnected { endpoint: String, generation: u64 },
    /// The reconnect policy ran out of attempts after losing session
    /// `generation`; the connection is dead.
    ReconnectFailed { generation: u64, attempts: u32 },
    /// `down()` was called.
    Closed,
}

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ============================================================================
// Session
// ============================================================================

/// State bound to one live socket.
pub struct Session {
    generation: u64,
    out_tx: mpsc::Sender<Frame>,
    channel_capacity: usize,
    channels: StdMutex<HashMap<String, mpsc::Sender<Bytes>>>,
    pending: StdMutex<HashMap<u64, oneshot::Sender<Vec<Arg>>>>,
    next_ack: AtomicU64,
    closed: AtomicBool,
}

impl Session {
    /// `channel_capacity` bounds the chunks buffered per inbound channel.
    pub(crate) fn new(generation: u64, out_tx: mpsc::Sender<Frame>, channel_capacity: usize) -> Self {
        Self {
            generation,
            out_tx,
            channel_capacity: channel_capacity.max(1),
            channels: StdMutex::new(HashMap::new()),
            pending: StdMutex::new(HashMap::new()),
            next_ack: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Unique per socket; a reconnect yields a higher generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Requests still waiting for their acknowledgement.
    pub fn pending_requests(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Queue `frame`, waiting for room in the outbound queue.
    async fn send(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(SignalingError::Closed);
        }
        self.out_tx.send(frame).await.map_err(|_| SignalingError::Closed)
    }

    /// Queue a control frame without waiting. On a full queue the frame is
    /// handed to a task that waits for room.
    fn send_now(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(SignalingError::Closed);
        }
        match self.out_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(SignalingError::Closed),
            Err(TrySendError::Full(frame)) => {
                let runtime = tokio::runtime::Handle::try_current().map_err(|_| SignalingError::Closed)?;
                trace!(frame = frame.label(), "outbound queue full, deferring control frame");
                let tx = self.out_tx.clone();
                runtime.spawn(async move {
                    let _ = tx.send(frame).await;
                });
                Ok(())
            }
        }
    }

    /// Fire-and-forget named message.
    pub fn emit(&self, name: &str, args: Vec<Arg>) -> Result<()> {
        self.send_now(Frame::Event {
            name: name.to_string(),
            args,
            ack: None,
        })
    }

    /// Named message expecting exactly one acknowledgement.
    ///
    /// Dropping the returned request (or this future) forgets the pending
    /// entry, so abandoned requests do not accumulate.
    pub async fn request(self: &Arc<Self>, name: &str, args: Vec<Arg>) -> Result<PendingRequest> {
        let id = self.next_ack.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        let pending = PendingRequest::new(id, rx, Arc::downgrade(self));

        self.send(Frame::Event {
            name: name.to_string(),
            args,
            ack: Some(id),
        })
        .await?;
        Ok(pending)
    }

    pub(crate) fn forget_request(&self, id: u64) {
        lock(&self.pending).remove(&id);
    }

    pub(crate) fn send_ack(&self, id: u64, args: Vec<Arg>) -> Result<()> {
        self.send_now(Frame::Ack { id, args })
    }

    /// Register a readable byte channel. A later registration under the same
    /// name replaces this one.
    pub fn create_source(self: &Arc<Self>, channel: &str) -> ChannelSource {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let mut channels = lock(&self.channels);
        if self.is_closed() {
            // Dropping `tx` right away: the source reads EOF.
            drop(tx);
        } else if channels.insert(channel.to_string(), tx).is_some() {
            debug!(channel, "replaced existing byte channel");
        }
        ChannelSource {
            channel: channel.to_string(),
            rx,
            session: Arc::downgrade(self),
        }
    }

    pub fn create_sink(self: &Arc<Self>, channel: &str) -> ChannelSink {
        ChannelSink {
            channel: channel.to_string(),
            session: self.clone(),
            finished: AtomicBool::new(false),
            reserving: StdMutex::new(None),
        }
    }

    /// Deliver one inbound frame.
    pub(crate) fn route(self: &Arc<Self>, frame: Frame, dispatcher: &Dispatcher) {
        match frame {
            Frame::Event { name, args, ack } => {
                let responder = ack.map(|id| Responder::new(id, self.clone()));
                dispatcher.dispatch(Inbound {
                    name,
                    args,
                    responder,
                    session: self.clone(),
                });
            }
            Frame::Ack { id, args } => match lock(&self.pending).remove(&id) {
                Some(tx) => {
                    let _ = tx.send(args);
                }
                None => trace!(ack = id, "ignoring unknown or duplicate acknowledgement"),
            },
            Frame::Data { channel, payload } => {
                let mut channels = lock(&self.channels);
                let Some(tx) = channels.get(&channel) else {
                    trace!(channel = %channel, "data for unknown channel dropped");
                    return;
                };
                match tx.try_send(Bytes::from(payload)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            channel = %channel,
                            capacity = self.channel_capacity,
                            "reader fell behind, ending byte channel"
                        );
                        channels.remove(&channel);
                    }
                    Err(TrySendError::Closed(_)) => {
                        channels.remove(&channel);
                    }
                }
            }
            Frame::End { channel } => {
                lock(&self.channels).remove(&channel);
            }
        }
    }

    /// Fail all pending requests and end every channel. Idempotent.
    pub(crate) fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let pending = std::mem::take(&mut *lock(&self.pending));
        let channels = std::mem::take(&mut *lock(&self.channels));
        debug!(
            generation = self.generation,
            pending = pending.len(),
            channels = channels.len(),
            "session shut down"
        );
    }

    fn release_channel(&self, channel: &str) {
        let mut channels = lock(&self.channels);
        if channels.get(channel).is_some_and(|tx| tx.is_closed()) {
            channels.remove(channel);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("generation", &self.generation)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Readable end of a named byte channel.
#[derive(Debug)]
pub struct ChannelSource {
    channel: String,
    rx: mpsc::Receiver<Bytes>,
    session: Weak<Session>,
}

impl ChannelSource {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next chunk, or `None` once the remote ended the channel or the
    /// session died.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ChannelSource {
    fn drop(&mut self) {
        self.rx.close();
        if let Some(session) = self.session.upgrade() {
            session.release_channel(&self.channel);
        }
    }
}

type ReserveFuture =
    Pin<Box<dyn Future<Output = std::result::Result<OwnedPermit<Frame>, SendError<()>>> + Send>>;

/// Writable end of a named byte channel.
pub struct ChannelSink {
    channel: String,
    session: Arc<Session>,
    finished: AtomicBool,
    /// Outbound queue slot being waited for by [`poll_send`](Self::poll_send).
    reserving: StdMutex<Option<ReserveFuture>>,
}

impl ChannelSink {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_finished() || self.session.is_closed() {
            return Err(SignalingError::Closed);
        }
        Ok(())
    }

    fn data_frame(&self, chunk: &[u8]) -> Frame {
        Frame::Data {
            channel: self.channel.clone(),
            payload: chunk.to_vec(),
        }
    }

    /// Queue `payload`, split into frames of at most [`MAX_PAYLOAD_SIZE`],
    /// waiting whenever the outbound queue is full.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        for chunk in payload.chunks(MAX_PAYLOAD_SIZE) {
            self.check_open()?;
            self.session.send(self.data_frame(chunk)).await?;
        }
        Ok(())
    }

    /// Queue at most one frame's worth of `buf` once the outbound queue has
    /// room. Returns the number of bytes taken.
    pub fn poll_send(&mut self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize>> {
        let open = self.check_open();
        let reserving = match self.reserving.get_mut() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = open {
            *reserving = None;
            return Poll::Ready(Err(e));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let tx = &self.session.out_tx;
        let future = reserving.get_or_insert_with(|| Box::pin(tx.clone().reserve_owned()));
        let permit = ready!(future.as_mut().poll(cx));
        *reserving = None;

        let Ok(permit) = permit else {
            return Poll::Ready(Err(SignalingError::Closed));
        };
        let n = buf.len().min(MAX_PAYLOAD_SIZE);
        permit.send(self.data_frame(&buf[..n]));
        Poll::Ready(Ok(n))
    }

    /// Tell the remote reader no more data follows. Idempotent.
    pub fn finish(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.session.send_now(Frame::End {
            channel: self.channel.clone(),
        });
    }
}

impl std::fmt::Debug for ChannelSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSink")
            .field("channel", &self.channel)
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

impl Drop for ChannelSink {
    fn drop(&mut self) {
        self.finish();
    }
}

// ============================================================================
// ControlConnection (one endpoint, reconnecting)
// ============================================================================

struct Shared {
    endpoint: String,
    connector: Arc<dyn Connector>,
    dispatcher: Arc<Dispatcher>,
    config: ListenerConfig,
    events: broadcast::Sender<ConnectionEvent>,
    current: StdMutex<Option<Arc<Session>>>,
}

impl Shared {
    fn clear_current(&self, generation: u64) {
        let mut current = lock(&self.current);
        if current.as_ref().is_some_and(|s| s.generation() == generation) {
            *current = None;
        }
    }
}

/// Socket tasks of one session. Dropping aborts both tasks.
struct LiveSession {
    session: Arc<Session>,
    reader: JoinHandle<String>,
    writer: JoinHandle<()>,
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
        self.session.shutdown();
    }
}

pub struct ControlConnection {
    shared: Arc<Shared>,
    supervisor: JoinHandle<()>,
}

impl ControlConnection {
    /// Connect once; on success the returned connection keeps itself alive
    /// according to the reconnect policy until dropped.
    pub async fn connect(
        endpoint: &str,
        connector: Arc<dyn Connector>,
        dispatcher: Arc<Dispatcher>,
        config: ListenerConfig,
        events: broadcast::Sender<ConnectionEvent>,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            endpoint: endpoint.to_string(),
            connector,
            dispatcher,
            config,
            events,
            current: StdMutex::new(None),
        });

        let live = open_session(&shared).await?;
        info!(endpoint, "connected to signaling server");
        let _ = shared.events.send(ConnectionEvent::Connected {
            endpoint: endpoint.to_string(),
            generation: live.session.generation(),
        });

        let supervisor = tokio::spawn(supervise(shared.clone(), live));
        Ok(Self { shared, supervisor })
    }

    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    /// The live session, or `None` while reconnecting.
    pub fn session(&self) -> Option<Arc<Session>> {
        lock(&self.shared.current).clone()
    }
}

impl Drop for ControlConnection {
    fn drop(&mut self) {
        self.supervisor.abort();
        if let Some(session) = lock(&self.shared.current).take() {
            session.shutdown();
        }
    }
}

async fn open_session(shared: &Arc<Shared>) -> Result<LiveSession> {
    let connect_error = |reason: String| SignalingError::Connection {
        endpoint: shared.endpoint.clone(),
        reason,
    };

    let io = tokio::time::timeout(
        shared.config.connect_timeout,
        shared.connector.connect(&shared.endpoint),
    )
    .await
    .map_err(|_| connect_error("connect timed out".to_string()))?
    .map_err(|e| connect_error(e.to_string()))?;

    let (read_half, write_half) = tokio::io::split(io);
    let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
    let (out_tx, out_rx) = mpsc::channel(shared.config.outbound_queue_size.max(1));
    let session = Arc::new(Session::new(generation, out_tx, shared.config.channel_buffer_size));

    let writer = tokio::spawn(write_loop(write_half, out_rx));
    let reader = tokio::spawn(read_loop(
        read_half,
        session.clone(),
        shared.dispatcher.clone(),
        shared.config.max_frame_size,
    ));

    *lock(&shared.current) = Some(session.clone());
    debug!(endpoint = %shared.endpoint, generation, "control session opened");

    Ok(LiveSession {
        session,
        reader,
        writer,
    })
}

async fn read_loop(
    mut reader: ReadHalf<BoxedIo>,
    session: Arc<Session>,
    dispatcher: Arc<Dispatcher>,
    limit: u64,
) -> String {
    loop {
        match read_frame(&mut reader, limit).await {
            Ok(Some(frame)) => {
                trace!(frame = frame.label(), "received frame");
                session.route(frame, &dispatcher);
            }
            Ok(None) => return "connection closed by server".to_string(),
            Err(e) => return e.to_string(),
        }
    }
}

async fn write_loop(mut writer: WriteHalf<BoxedIo>, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!(error = %e, frame = frame.label(), "control write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn supervise(shared: Arc<Shared>, mut live: LiveSession) {
    loop {
        let reason = tokio::select! {
            result = &mut live.reader => match result {
                Ok(reason) => reason,
                Err(e) => format!("reader task failed: {}", e),
            },
            _ = &mut live.writer => "write failed".to_string(),
        };

        let lost = live.session.generation();
        shared.clear_current(lost);
        live.session.shutdown();
        warn!(endpoint = %shared.endpoint, generation = lost, reason = %reason, "control connection lost");
        let _ = shared.events.send(ConnectionEvent::Disconnected {
            generation: lost,
            reason,
        });

        let policy = &shared.config.reconnect;
        let mut attempt = 0u32;
        live = loop {
            if !policy.allows(attempt) {
                warn!(endpoint = %shared.endpoint, attempts = attempt, "giving up on signaling server");
                let _ = shared.events.send(ConnectionEvent::ReconnectFailed {
                    generation: lost,
                    attempts: attempt,
                });
                return;
            }
            tokio::time::sleep(policy.delay_for(attempt)).await;

            match open_session(&shared).await {
                Ok(next) => {
                    info!(endpoint = %shared.endpoint, attempt, "reconnected to signaling server");
                    let _ = shared.events.send(ConnectionEvent::Reconnected {
                        endpoint: shared.endpoint.clone(),
                        generation: next.session.generation(),
                    });
                    break next;
                }
                Err(e) => {
                    debug!(endpoint = %shared.endpoint, attempt, error = %e, "reconnect attempt failed");
                    attempt += 1;
                }
            }
        };
    }
}

// ============================================================================
// ConnectionManager
// ============================================================================

/// Brings the control connection up and down.
///
/// `up` and `down` are idempotent. The dispatcher is installed on every
/// session before `up` returns, so no inbound message is missed.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    dispatcher: Arc<Dispatcher>,
    config: ListenerConfig,
    events: broadcast::Sender<ConnectionEvent>,
    control: Option<ControlConnection>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, dispatcher: Arc<Dispatcher>, config: ListenerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_size.max(1));
        Self {
            connector,
            dispatcher,
            config,
            events,
            control: None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn is_up(&self) -> bool {
        self.control.is_some()
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.control.as_ref().map(|c| c.endpoint())
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.control.as_ref().and_then(|c| c.session())
    }

    /// Connect to `endpoint` unless already up.
    pub async fn up(&mut self, endpoint: &str) -> Result<()> {
        if let Some(control) = &self.control {
            if control.endpoint() != endpoint {
                debug!(current = control.endpoint(), requested = endpoint, "already connected elsewhere");
            }
            return Ok(());
        }
        let control = ControlConnection::connect(
            endpoint,
            self.connector.clone(),
            self.dispatcher.clone(),
            self.config.clone(),
            self.events.clone(),
        )
        .await?;
        self.control = Some(control);
        Ok(())
    }

    /// Tear the connection down. Returns false if it was already down.
    pub fn down(&mut self) -> bool {
        let Some(control) = self.control.take() else {
            return false;
        };
        info!(endpoint = control.endpoint(), "closing control connection");
        drop(control);
        let _ = self.events.send(ConnectionEvent::Closed);
        true
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.down();
    }
}
