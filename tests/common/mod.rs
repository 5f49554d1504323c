//! Shared helpers for integration tests: tracing setup, timeouts and an
//! in-process signaling server speaking the sigstar wire protocol.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Once};
use std::time::Duration;

use sigstar::config::MAX_FRAME_SIZE;
use sigstar::messages::{read_frame, write_frame, Arg, Frame, SS_DIAL, SS_INCOMING, SS_JOIN, WS_PEER};
use sigstar::{Connection, Identity, Keypair, ListenerEvent, PeerId, SignalAddr};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// One-time tracing initialization
static INIT: Once = Once::new();

/// Initialize tracing for tests.
/// Use RUST_LOG=debug or RUST_LOG=trace for verbose output.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("info")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Deterministic peer id for a test participant name.
pub fn peer_id(name: &str) -> PeerId {
    let mut seed = [0u8; 32];
    for (slot, byte) in seed.iter_mut().zip(name.bytes()) {
        *slot = byte;
    }
    Keypair::from_secret_key_bytes(&seed)
        .identity()
        .peer_id()
        .expect("ed25519 key converts to a peer id")
}

fn identity_from_hex(s: &str) -> Option<Identity> {
    let bytes: [u8; 32] = hex::decode(s).ok()?.try_into().ok()?;
    Some(Identity::from(bytes))
}

/// Wait for the first event matching `pred`, skipping others.
pub async fn wait_for_event<F>(rx: &mut broadcast::Receiver<ListenerEvent>, mut pred: F) -> ListenerEvent
where
    F: FnMut(&ListenerEvent) -> bool,
{
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("listener event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for listener event")
}

/// Connection handler that forwards inbound streams to the returned receiver.
pub fn inbound_queue() -> (
    impl Fn(Connection) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<Connection>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |conn| {
            let _ = tx.send(conn);
        },
        rx,
    )
}

pub async fn next_inbound(rx: &mut mpsc::UnboundedReceiver<Connection>) -> Connection {
    tokio::time::timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for inbound connection")
        .expect("inbound queue closed")
}

/// Read chunks until `expected.len()` bytes arrived.
pub async fn recv_exact(conn: &mut Connection, expected: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    tokio::time::timeout(TEST_TIMEOUT, async {
        while buf.len() < expected {
            match conn.recv().await {
                Some(chunk) => buf.extend_from_slice(&chunk),
                None => break,
            }
        }
    })
    .await
    .expect("timed out reading from stream");
    buf
}

// ============================================================================
// Test signaling server
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Every `ss-join` received.
    pub joins: usize,
    /// Challenges handed out.
    pub challenges: usize,
    /// Joins accepted on a previously verified signature.
    pub cached_joins: usize,
}

struct ConnEntry {
    out: mpsc::UnboundedSender<Frame>,
    kick: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct ServerState {
    strict: bool,
    hold_dials: bool,
    reject_joins: bool,
    next_conn: u64,
    next_ack: u64,
    conns: HashMap<u64, ConnEntry>,
    peers: HashMap<String, u64>,
    challenges: HashMap<String, (String, String)>,
    signatures: HashMap<String, String>,
    routes: HashMap<(u64, String), u64>,
    /// (target conn, server ack id) -> (dialer conn, dialer ack id)
    pending: HashMap<(u64, u64), (u64, u64)>,
    stats: ServerStats,
}

impl ServerState {
    fn send(&self, conn: u64, frame: Frame) {
        if let Some(entry) = self.conns.get(&conn) {
            let _ = entry.out.send(frame);
        }
    }

    fn handle(&mut self, conn: u64, frame: Frame) {
        match frame {
            Frame::Event { name, args, ack: Some(id) } if name == SS_JOIN => {
                let reply = self.join(conn, &args);
                self.send(conn, Frame::Ack { id, args: reply });
            }
            Frame::Event { name, args, ack: Some(id) } if name == SS_DIAL => {
                self.dial(conn, &args, id);
            }
            Frame::Event { .. } => {}
            Frame::Ack { id, .. } => {
                if let Some((dialer, dialer_ack)) = self.pending.remove(&(conn, id)) {
                    self.send(dialer, Frame::Ack { id: dialer_ack, args: vec![Arg::Null] });
                }
            }
            Frame::Data { channel, payload } => {
                if let Some(&to) = self.routes.get(&(conn, channel.clone())) {
                    self.send(to, Frame::Data { channel, payload });
                }
            }
            Frame::End { channel } => {
                if let Some(&to) = self.routes.get(&(conn, channel.clone())) {
                    self.send(to, Frame::End { channel });
                }
            }
        }
    }

    fn join(&mut self, conn: u64, args: &[Arg]) -> Vec<Arg> {
        let [Arg::Str(addr), Arg::Str(credential)] = args else {
            return vec![Arg::from("malformed join")];
        };
        self.stats.joins += 1;

        if self.reject_joins {
            return vec![Arg::from("join rejected")];
        }

        if !self.strict {
            self.register(addr, conn);
            return vec![Arg::Null, Arg::Null];
        }

        // Signatures are 64 bytes, hex-encoded; public keys are 32.
        if credential.len() == 128 {
            let fresh = self.challenges.get(addr).is_some_and(|(pubkey, challenge)| {
                let Some(identity) = identity_from_hex(pubkey) else {
                    return false;
                };
                hex::decode(credential).is_ok_and(|sig| identity.verify(challenge.as_bytes(), &sig))
            });
            if fresh {
                self.challenges.remove(addr);
                self.signatures.insert(addr.clone(), credential.clone());
                self.register(addr, conn);
                return vec![Arg::Null, Arg::Null];
            }
            if self.signatures.get(addr) == Some(credential) {
                self.stats.cached_joins += 1;
                self.register(addr, conn);
                return vec![Arg::Null, Arg::Bool(false)];
            }
            return vec![Arg::Null, Arg::Bool(true)];
        }

        let mut nonce = [0u8; 16];
        getrandom::getrandom(&mut nonce).expect("os rng");
        let challenge = hex::encode(nonce);
        self.stats.challenges += 1;
        self.challenges.insert(addr.clone(), (credential.clone(), challenge.clone()));
        vec![Arg::Null, Arg::from(challenge)]
    }

    fn register(&mut self, addr: &str, conn: u64) {
        self.peers.insert(addr.to_string(), conn);
        for (&other, entry) in &self.conns {
            if other != conn {
                let _ = entry.out.send(Frame::Event {
                    name: WS_PEER.to_string(),
                    args: vec![Arg::from(addr)],
                    ack: None,
                });
            }
        }
    }

    fn dial(&mut self, conn: u64, args: &[Arg], id: u64) {
        if self.hold_dials {
            return;
        }
        let [Arg::Str(from), Arg::Str(to), Arg::Str(dial_id)] = args else {
            self.send(conn, Frame::Ack { id, args: vec![Arg::from("malformed dial")] });
            return;
        };
        let Some(&target) = self.peers.get(to) else {
            self.send(conn, Frame::Ack { id, args: vec![Arg::from("peer not found")] });
            return;
        };

        self.routes.insert((conn, format!("{}.dialer", dial_id)), target);
        self.routes.insert((target, format!("{}.listener", dial_id)), conn);

        self.next_ack += 1;
        let server_ack = self.next_ack;
        self.pending.insert((target, server_ack), (conn, id));
        self.send(
            target,
            Frame::Event {
                name: SS_INCOMING.to_string(),
                args: vec![Arg::from(dial_id.as_str()), Arg::from(from.as_str())],
                ack: Some(server_ack),
            },
        );
    }

    fn disconnect(&mut self, conn: u64) {
        self.conns.remove(&conn);
        self.peers.retain(|_, c| *c != conn);
        self.routes.retain(|(from, _), to| *from != conn && *to != conn);
        let orphaned: Vec<(u64, u64)> = self
            .pending
            .iter()
            .filter(|((target, _), _)| *target == conn)
            .map(|(_, dialer)| *dialer)
            .collect();
        self.pending.retain(|(target, _), _| *target != conn);
        for (dialer, dialer_ack) in orphaned {
            self.send(dialer, Frame::Ack { id: dialer_ack, args: vec![Arg::from("peer disconnected")] });
        }
    }
}

fn lock(state: &Mutex<ServerState>) -> MutexGuard<'_, ServerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct TestServer {
    local_addr: SocketAddr,
    state: Arc<Mutex<ServerState>>,
    accept_task: JoinHandle<()>,
}

impl TestServer {
    /// Server that accepts every join without a challenge.
    pub async fn start() -> Self {
        Self::start_with(false).await
    }

    /// Server that challenges every first join.
    pub async fn start_strict() -> Self {
        Self::start_with(true).await
    }

    async fn start_with(strict: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test server");
        let local_addr = listener.local_addr().expect("local addr");
        let state = Arc::new(Mutex::new(ServerState {
            strict,
            ..ServerState::default()
        }));

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_connection(accept_state.clone(), stream));
            }
        });

        Self {
            local_addr,
            state,
            accept_task,
        }
    }

    pub fn endpoint(&self) -> String {
        self.local_addr.to_string()
    }

    /// Rendezvous address for the participant `name` on this server.
    pub fn addr(&self, name: &str) -> SignalAddr {
        format!(
            "/ip4/127.0.0.1/tcp/{}/ws/p2p-websocket-star/p2p/{}",
            self.local_addr.port(),
            peer_id(name)
        )
        .parse()
        .expect("valid test address")
    }

    pub fn is_joined(&self, addr: &SignalAddr) -> bool {
        lock(&self.state).peers.contains_key(&addr.to_string())
    }

    /// Drop the control connection of the peer joined as `addr`.
    pub fn kick(&self, addr: &SignalAddr) -> bool {
        let mut state = lock(&self.state);
        let Some(&conn) = state.peers.get(&addr.to_string()) else {
            return false;
        };
        let kick = state.conns.get_mut(&conn).and_then(|entry| entry.kick.take());
        kick.is_some_and(|tx| tx.send(()).is_ok())
    }

    /// Forget accepted signatures so cached re-joins need a new challenge.
    pub fn forget_signatures(&self) {
        lock(&self.state).signatures.clear();
    }

    /// Answer every join with an error.
    pub fn reject_joins(&self, reject: bool) {
        lock(&self.state).reject_joins = reject;
    }

    /// Stop answering dial requests.
    pub fn hold_dials(&self, hold: bool) {
        lock(&self.state).hold_dials = hold;
    }

    pub fn stats(&self) -> ServerStats {
        lock(&self.state).stats.clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        let kicks: Vec<oneshot::Sender<()>> = lock(&self.state)
            .conns
            .values_mut()
            .filter_map(|entry| entry.kick.take())
            .collect();
        for kick in kicks {
            let _ = kick.send(());
        }
    }
}

async fn serve_connection(state: Arc<Mutex<ServerState>>, stream: TcpStream) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let (kick_tx, mut kick_rx) = oneshot::channel();

    let conn = {
        let mut state = lock(&state);
        state.next_conn += 1;
        let conn = state.next_conn;
        state.conns.insert(
            conn,
            ConnEntry {
                out: out_tx,
                kick: Some(kick_tx),
            },
        );
        conn
    };

    let write_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if write_frame(&mut writer, &frame).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut kick_rx => break,
            frame = read_frame(&mut reader, MAX_FRAME_SIZE) => match frame {
                Ok(Some(frame)) => lock(&state).handle(conn, frame),
                _ => break,
            },
        }
    }

    lock(&state).disconnect(conn);
    write_task.abort();
}
