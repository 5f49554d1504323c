//! # Star Transport
//!
//! Facade over any number of [`Listener`]s, one per signaling server.
//!
//! - Listeners created here register themselves under their server's
//!   `host:port` endpoint when they start listening (and again after every
//!   successful re-join), and deregister on close.
//! - [`StarTransport::dial`] picks the listener registered for the target
//!   address's server; without one the dial fails with
//!   [`SignalingError::NoListenerForServer`].
//! - Peer announcements from every listener are merged into one discovery
//!   stream.

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};

use libp2p_identity::PeerId;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::address::SignalAddr;
use crate::config::ListenerConfig;
use crate::connection::{Connector, TcpConnector};
use crate::error::{Result, SignalingError};
use crate::identity::ChallengeSigner;
use crate::listener::{DialOptions, Listener, TransportHooks, WeakListener};
use crate::stream::Connection;

/// A peer announced by a signaling server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub addr: SignalAddr,
}

impl DiscoveredPeer {
    pub fn new(addr: SignalAddr) -> Self {
        Self { addr }
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.addr.peer_id()
    }
}

/// Listeners keyed by server endpoint. Holds them weakly: a listener whose
/// handles are all gone disappears from the registry.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: StdRwLock<HashMap<String, WeakListener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, endpoint: String, listener: WeakListener) {
        let mut listeners = match self.listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        debug!(endpoint = %endpoint, listener = listener.id(), "listener registered");
        listeners.insert(endpoint, listener);
    }

    /// Remove the entry for `endpoint` if it still belongs to `listener_id`.
    pub(crate) fn deregister(&self, endpoint: &str, listener_id: u64) {
        let mut listeners = match self.listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if listeners.get(endpoint).is_some_and(|l| l.id() == listener_id) {
            listeners.remove(endpoint);
            debug!(endpoint, listener = listener_id, "listener deregistered");
        }
    }

    pub fn get(&self, endpoint: &str) -> Option<Listener> {
        let listener = {
            let listeners = match self.listeners.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            listeners.get(endpoint)?.upgrade()
        };
        if listener.is_none() {
            trace!(endpoint, "pruning dropped listener");
            let mut listeners = match self.listeners.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if listeners.get(endpoint).is_some_and(|l| l.upgrade().is_none()) {
                listeners.remove(endpoint);
            }
        }
        listener
    }

    pub fn endpoints(&self) -> Vec<String> {
        let listeners = match self.listeners.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut endpoints: Vec<String> = listeners.keys().cloned().collect();
        endpoints.sort();
        endpoints
    }

    pub fn len(&self) -> usize {
        match self.listeners.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct StarTransport {
    config: ListenerConfig,
    identity: Option<Arc<dyn ChallengeSigner>>,
    connector: Arc<dyn Connector>,
    registry: Arc<ListenerRegistry>,
    discovery: broadcast::Sender<DiscoveredPeer>,
}

impl StarTransport {
    pub fn new(config: ListenerConfig, identity: Option<Arc<dyn ChallengeSigner>>) -> Self {
        let (discovery, _) = broadcast::channel(config.event_channel_size.max(1));
        Self {
            config,
            identity,
            connector: Arc::new(TcpConnector),
            registry: Arc::new(ListenerRegistry::new()),
            discovery,
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// New listener sharing this transport's identity, registry and
    /// discovery stream.
    pub fn create_listener<F>(&self, handler: F) -> Listener
    where
        F: Fn(Connection) + Send + Sync + 'static,
    {
        Listener::spawn(
            self.config.clone(),
            self.identity.clone(),
            self.connector.clone(),
            Arc::new(handler),
            Some(TransportHooks {
                registry: self.registry.clone(),
                discovery: self.discovery.clone(),
            }),
        )
    }

    /// Dial `addr` through the listener registered for its server.
    pub async fn dial(&self, addr: &SignalAddr, options: DialOptions) -> Result<Connection> {
        let endpoint = addr.server_endpoint();
        let listener = self
            .registry
            .get(&endpoint)
            .ok_or(SignalingError::NoListenerForServer(endpoint))?;
        listener.dial(addr, options).await
    }

    /// Keep only the rendezvous addresses among `addrs`.
    pub fn filter<I, S>(&self, addrs: I) -> Vec<SignalAddr>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        addrs
            .into_iter()
            .filter_map(|a| a.as_ref().parse().ok())
            .collect()
    }

    pub fn discovery(&self) -> broadcast::Receiver<DiscoveredPeer> {
        self.discovery.subscribe()
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }
}
