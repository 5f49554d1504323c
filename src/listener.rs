//! # Listener
//!
//! Ties the control connection, join handshake and stream multiplexer into
//! the public listen/dial surface.
//!
//! ## Architecture
//!
//! ```text
//! Listener (handle, Clone) ──cmd_tx──► ListenerActor (owns manager + handshake)
//!        │                                   │
//!        └──── subscribe() ◄── events ◄──────┤
//!                                            ▼
//!                         reader task ──► Dispatcher ──► ss-incomming / ws-peer
//! ```
//!
//! The actor only does short, ordered work (connect, join, start a dial).
//! Waiting for a dial acknowledgement happens in the caller's task, so
//! concurrent dials never serialize behind each other.
//!
//! ## Events
//!
//! | Event | When |
//! |-------|------|
//! | `Listening` | `listen` succeeded |
//! | `Reconnected` | the control connection came back and the re-join succeeded |
//! | `Connection` | a remote peer dialed us |
//! | `Peer` | the server announced another peer |
//! | `Error` | listen or re-join failed |
//! | `Closed` | the listener stopped listening |

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::address::SignalAddr;
use crate::config::ListenerConfig;
use crate::connection::{ConnectionEvent, ConnectionManager, Connector, TcpConnector};
use crate::dispatcher::{ack_error, ArgShape, Dispatcher, Inbound, PendingRequest};
use crate::error::{Result, SignalingError};
use crate::handshake::JoinHandshake;
use crate::identity::ChallengeSigner;
use crate::messages::{Arg, ArgKind, SS_DIAL, SS_INCOMING, WS_PEER};
use crate::stream::{self, ChannelPair, Connection, DialId, Direction};
use crate::transport::{DiscoveredPeer, ListenerRegistry};

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Invoked once per inbound connection, on the control connection's reader
/// task. Spawn for anything slow.
pub type ConnectionHandler = Arc<dyn Fn(Connection) + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListenerEvent {
    Listening(SignalAddr),
    Reconnected(SignalAddr),
    Connection { dial_id: DialId, remote: SignalAddr },
    Peer(SignalAddr),
    Error(String),
    Closed,
}

#[derive(Clone, Debug, Default)]
pub struct DialOptions {
    /// Give up waiting for the dial acknowledgement after this long.
    pub timeout: Option<Duration>,
}

impl DialOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// Hooks into a [`StarTransport`](crate::transport::StarTransport).
#[derive(Clone)]
pub(crate) struct TransportHooks {
    pub registry: Arc<ListenerRegistry>,
    pub discovery: broadcast::Sender<DiscoveredPeer>,
}

enum ListenerCommand {
    Listen {
        addr: SignalAddr,
        reply: oneshot::Sender<Result<()>>,
    },
    Dial {
        remote: SignalAddr,
        reply: oneshot::Sender<Result<OutboundDial>>,
    },
    GetAddrs {
        reply: oneshot::Sender<Vec<SignalAddr>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// A dial the actor has started; the caller finishes it.
struct OutboundDial {
    dial_id: DialId,
    pair: ChannelPair,
    pending: PendingRequest,
}

// ============================================================================
// Listener handle
// ============================================================================

#[derive(Clone)]
pub struct Listener {
    id: u64,
    cmd_tx: mpsc::Sender<ListenerCommand>,
    events: broadcast::Sender<ListenerEvent>,
}

/// Non-owning reference to a listener; does not keep its actor alive.
#[derive(Clone)]
pub(crate) struct WeakListener {
    id: u64,
    cmd_tx: mpsc::WeakSender<ListenerCommand>,
    events: broadcast::Sender<ListenerEvent>,
}

impl WeakListener {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn upgrade(&self) -> Option<Listener> {
        Some(Listener {
            id: self.id,
            cmd_tx: self.cmd_tx.upgrade()?,
            events: self.events.clone(),
        })
    }
}

impl Listener {
    /// Create a listener over plain TCP. `handler` receives every inbound
    /// connection. Must be called within a Tokio runtime.
    pub fn new<F>(config: ListenerConfig, identity: Option<Arc<dyn ChallengeSigner>>, handler: F) -> Self
    where
        F: Fn(Connection) + Send + Sync + 'static,
    {
        Self::with_connector(config, identity, Arc::new(TcpConnector), handler)
    }

    pub fn with_connector<F>(
        config: ListenerConfig,
        identity: Option<Arc<dyn ChallengeSigner>>,
        connector: Arc<dyn Connector>,
        handler: F,
    ) -> Self
    where
        F: Fn(Connection) + Send + Sync + 'static,
    {
        Self::spawn(config, identity, connector, Arc::new(handler), None)
    }

    pub(crate) fn spawn(
        config: ListenerConfig,
        identity: Option<Arc<dyn ChallengeSigner>>,
        connector: Arc<dyn Connector>,
        handler: ConnectionHandler,
        hooks: Option<TransportHooks>,
    ) -> Self {
        let id = NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed);
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_channel_size.max(1));
        let (events, _) = broadcast::channel(config.event_channel_size.max(1));

        let dispatcher = Arc::new(Dispatcher::new());
        install_handlers(
            &dispatcher,
            events.clone(),
            handler,
            hooks.as_ref().map(|h| h.discovery.clone()),
        );

        let manager = ConnectionManager::new(connector, dispatcher, config.clone());
        let connection_events = manager.subscribe();

        let listener = Self { id, cmd_tx, events };
        let actor = ListenerActor {
            config,
            manager,
            handshake: JoinHandshake::new(identity),
            address: None,
            generation: None,
            events: listener.events.clone(),
            hooks,
            weak_self: listener.downgrade(),
        };
        tokio::spawn(actor.run(cmd_rx, connection_events));

        listener
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ListenerEvent> {
        self.events.subscribe()
    }

    /// Connect to the server `addr` lives on and join it under `addr`.
    ///
    /// On failure the listener is left not listening and `Error` then
    /// `Closed` are emitted.
    pub async fn listen(&self, addr: &SignalAddr) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ListenerCommand::Listen {
                addr: addr.clone(),
                reply,
            })
            .await
            .map_err(|_| SignalingError::Closed)?;
        rx.await.map_err(|_| SignalingError::Closed)?
    }

    /// Open a virtual stream to `addr` through the signaling server.
    ///
    /// Dropping the returned future abandons the dial.
    pub async fn dial(&self, addr: &SignalAddr, options: DialOptions) -> Result<Connection> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ListenerCommand::Dial {
                remote: addr.clone(),
                reply,
            })
            .await
            .map_err(|_| SignalingError::NotListening)?;
        let OutboundDial {
            dial_id,
            pair,
            pending,
        } = rx.await.map_err(|_| SignalingError::NotListening)??;

        let ack = match options.timeout {
            Some(limit) => tokio::time::timeout(limit, pending)
                .await
                .map_err(|_| SignalingError::DialTimeout {
                    dial_id: dial_id.to_string(),
                })?,
            None => pending.await,
        }?;

        if let Some(reason) = ack_error(&ack) {
            debug!(dial_id = %dial_id, reason = %reason, "dial rejected");
            return Err(SignalingError::DialAcknowledgement {
                dial_id: dial_id.to_string(),
                reason,
            });
        }

        debug!(dial_id = %dial_id, remote = %addr, "dial established");
        Ok(Connection::new(dial_id, Direction::Outbound, addr.clone(), pair))
    }

    /// The address this listener is registered under; empty when not
    /// listening.
    pub async fn get_addrs(&self) -> Vec<SignalAddr> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(ListenerCommand::GetAddrs { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Stop listening and drop the control connection. Idempotent.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(ListenerCommand::Close { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub(crate) fn downgrade(&self) -> WeakListener {
        WeakListener {
            id: self.id,
            cmd_tx: self.cmd_tx.downgrade(),
            events: self.events.clone(),
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").field("id", &self.id).finish_non_exhaustive()
    }
}

// ============================================================================
// Inbound message handlers
// ============================================================================

fn install_handlers(
    dispatcher: &Dispatcher,
    events: broadcast::Sender<ListenerEvent>,
    handler: ConnectionHandler,
    discovery: Option<broadcast::Sender<DiscoveredPeer>>,
) {
    let incoming_events = events.clone();
    dispatcher.add_handler(
        SS_INCOMING,
        ArgShape::new([ArgKind::Str, ArgKind::Addr]).with_ack(),
        move |inbound| accept_incoming(inbound, &incoming_events, &handler),
    );

    dispatcher.add_handler(WS_PEER, ArgShape::new([ArgKind::Addr]), move |inbound| {
        let Some(addr) = inbound.args.first().and_then(Arg::as_str) else {
            return;
        };
        let Ok(addr) = addr.parse::<SignalAddr>() else {
            return;
        };
        debug!(peer = %addr, "peer announced");
        if let Some(discovery) = &discovery {
            let _ = discovery.send(DiscoveredPeer::new(addr.clone()));
        }
        let _ = events.send(ListenerEvent::Peer(addr));
    });
}

fn accept_incoming(inbound: Inbound, events: &broadcast::Sender<ListenerEvent>, handler: &ConnectionHandler) {
    let Inbound {
        args,
        responder,
        session,
        ..
    } = inbound;
    let [Arg::Str(dial_id), Arg::Str(from)] = args.as_slice() else {
        return;
    };
    let remote: SignalAddr = match from.parse() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(error = %e, "incoming dial with bad remote address");
            return;
        }
    };

    let dial_id = DialId::from(dial_id.as_str());
    let pair = stream::open_as_responder(&session, &dial_id);
    if let Some(responder) = responder {
        responder.respond(Vec::new());
    }

    debug!(dial_id = %dial_id, remote = %remote, "accepted incoming dial");
    let _ = events.send(ListenerEvent::Connection {
        dial_id: dial_id.clone(),
        remote: remote.clone(),
    });
    handler(Connection::new(dial_id, Direction::Inbound, remote, pair));
}

// ============================================================================
// ListenerActor (owns all state, processes commands sequentially)
// ============================================================================

struct ListenerActor {
    config: ListenerConfig,
    manager: ConnectionManager,
    handshake: JoinHandshake,
    address: Option<SignalAddr>,
    /// Session the current address was last joined on.
    generation: Option<u64>,
    events: broadcast::Sender<ListenerEvent>,
    hooks: Option<TransportHooks>,
    weak_self: WeakListener,
}

impl ListenerActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<ListenerCommand>,
        mut connection_events: broadcast::Receiver<ConnectionEvent>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ListenerCommand::Listen { addr, reply }) => {
                            let result = self.listen(addr).await;
                            let _ = reply.send(result);
                        }
                        Some(ListenerCommand::Dial { remote, reply }) => {
                            let _ = reply.send(self.start_dial(&remote).await);
                        }
                        Some(ListenerCommand::GetAddrs { reply }) => {
                            let _ = reply.send(self.address.iter().cloned().collect());
                        }
                        Some(ListenerCommand::Close { reply }) => {
                            self.close();
                            let _ = reply.send(());
                        }
                        None => {
                            debug!(listener = self.weak_self.id(), "listener actor shutting down");
                            self.close();
                            break;
                        }
                    }
                }

                event = connection_events.recv() => {
                    match event {
                        Ok(event) => self.on_connection_event(event).await,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "listener lagged behind connection events");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }
    }

    fn emit(&self, event: ListenerEvent) {
        let _ = self.events.send(event);
    }

    async fn listen(&mut self, addr: SignalAddr) -> Result<()> {
        if self.manager.is_up() {
            // Mid-reconnect there is no live session to be listening on.
            if self.address.as_ref() == Some(&addr) && self.manager.session().is_some() {
                return Ok(());
            }
            self.close();
        }

        match self.bring_up(&addr).await {
            Ok(()) => {
                info!(addr = %addr, "listening");
                self.register(&addr);
                self.address = Some(addr.clone());
                self.emit(ListenerEvent::Listening(addr));
                Ok(())
            }
            Err(e) => {
                warn!(addr = %addr, error = %e, "listen failed");
                self.manager.down();
                self.handshake.reset();
                self.emit(ListenerEvent::Error(e.to_string()));
                self.emit(ListenerEvent::Closed);
                Err(e)
            }
        }
    }

    async fn bring_up(&mut self, addr: &SignalAddr) -> Result<()> {
        self.manager.up(&addr.server_endpoint()).await?;
        self.handshake.on_connected();
        self.join(addr).await
    }

    async fn join(&mut self, addr: &SignalAddr) -> Result<()> {
        let session = self.manager.session().ok_or(SignalingError::Closed)?;
        tokio::time::timeout(self.config.join_timeout, self.handshake.run(&session, addr))
            .await
            .map_err(|_| SignalingError::handshake("timed out waiting for join acknowledgement"))??;
        self.generation = Some(session.generation());
        Ok(())
    }

    async fn start_dial(&self, remote: &SignalAddr) -> Result<OutboundDial> {
        let (Some(local), Some(session)) = (&self.address, self.manager.session()) else {
            return Err(SignalingError::NotListening);
        };

        let dial_id = DialId::generate()?;
        // Open our channels before the request so early bytes are not lost.
        let pair = stream::open_as_initiator(&session, &dial_id);
        let pending = session
            .request(
                SS_DIAL,
                vec![
                    Arg::from(local.to_string()),
                    Arg::from(remote.to_string()),
                    Arg::from(dial_id.as_str()),
                ],
            )
            .await?;

        debug!(dial_id = %dial_id, remote = %remote, "dialing");
        Ok(OutboundDial {
            dial_id,
            pair,
            pending,
        })
    }

    async fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Disconnected { generation, reason } => {
                if self.is_stale(generation) {
                    return;
                }
                debug!(generation, reason = %reason, "control connection dropped");
                self.handshake.on_disconnected();
            }
            ConnectionEvent::Reconnected { generation, .. } => {
                let current = self.manager.session().map(|s| s.generation());
                if current != Some(generation) {
                    debug!(generation, ?current, "ignoring stale reconnect");
                    return;
                }
                let Some(addr) = self.address.clone() else {
                    return;
                };
                self.generation = Some(generation);
                self.handshake.on_connected();
                match self.join(&addr).await {
                    Ok(()) => {
                        info!(addr = %addr, "re-joined after reconnect");
                        self.register(&addr);
                        self.emit(ListenerEvent::Reconnected(addr));
                    }
                    Err(e) => {
                        warn!(addr = %addr, error = %e, "re-join after reconnect failed");
                        self.emit(ListenerEvent::Error(format!("re-join failed: {}", e)));
                    }
                }
            }
            ConnectionEvent::ReconnectFailed { generation, attempts } => {
                if self.is_stale(generation) {
                    return;
                }
                if self.address.is_some() {
                    self.emit(ListenerEvent::Error(format!(
                        "signaling server unreachable after {} attempts",
                        attempts
                    )));
                    self.close();
                }
            }
            ConnectionEvent::Connected { .. } | ConnectionEvent::Closed => {}
        }
    }

    /// Generations only grow, so anything older than the session we are on
    /// belongs to a connection that has already been replaced or closed.
    fn is_stale(&self, generation: u64) -> bool {
        self.generation.is_none_or(|current| generation < current)
    }

    fn close(&mut self) {
        let was_up = self.manager.down();
        self.handshake.reset();
        self.generation = None;
        if let Some(addr) = self.address.take() {
            if let Some(hooks) = &self.hooks {
                hooks.registry.deregister(&addr.server_endpoint(), self.weak_self.id());
            }
            info!(addr = %addr, "stopped listening");
        }
        if was_up {
            self.emit(ListenerEvent::Closed);
        }
    }

    fn register(&self, addr: &SignalAddr) {
        if let Some(hooks) = &self.hooks {
            hooks
                .registry
                .register(addr.server_endpoint(), self.weak_self.clone());
        }
    }
}
