//! Rendezvous addresses.
//!
//! A peer's rendezvous address is a multiaddress naming the signaling server
//! it registered with and, optionally, the peer itself:
//!
//! ```text
//! /ip4/127.0.0.1/tcp/15555/ws/p2p-websocket-star/p2p/<peer-id>
//! └─ host ──────┘ └ port ─┘ └ scheme + protocol ┘ └─ optional ─┘
//! ```
//!
//! Parsing and formatting are delegated to [`Multiaddr`]; this module only
//! checks the component layout and derives the server endpoint. The
//! canonical string form (`Display`) is the wire representation used in
//! every signaling message.

use std::fmt;
use std::str::FromStr;

use libp2p_identity::PeerId;
use multiaddr::{Multiaddr, Protocol};

use crate::error::SignalingError;

/// Protocol component identifying a rendezvous address.
pub const PROTOCOL_NAME: &str = "p2p-websocket-star";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SignalAddr {
    addr: Multiaddr,
    endpoint: String,
    secure: bool,
    peer_id: Option<PeerId>,
}

impl SignalAddr {
    /// Same server address, with `/p2p/<peer_id>` replacing any existing
    /// peer component.
    pub fn with_peer_id(self, peer_id: PeerId) -> Self {
        let mut addr = self.addr;
        if self.peer_id.is_some() {
            addr.pop();
        }
        addr.push(Protocol::P2p(peer_id));
        Self {
            addr,
            endpoint: self.endpoint,
            secure: self.secure,
            peer_id: Some(peer_id),
        }
    }

    pub fn multiaddr(&self) -> &Multiaddr {
        &self.addr
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer_id
    }

    /// The `host:port` endpoint of the signaling server this address lives on.
    ///
    /// Two addresses on the same server yield the same endpoint regardless of
    /// their peer ids, which is what the listener registry keys on.
    pub fn server_endpoint(&self) -> String {
        self.endpoint.clone()
    }

    /// Returns true if `s` parses as a rendezvous address.
    pub fn matches(s: &str) -> bool {
        s.parse::<SignalAddr>().is_ok()
    }
}

impl fmt::Display for SignalAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.addr, f)
    }
}

impl TryFrom<Multiaddr> for SignalAddr {
    type Error = SignalingError;

    fn try_from(addr: Multiaddr) -> Result<Self, Self::Error> {
        let (endpoint, secure, peer_id) = {
            let invalid = |reason: &str| SignalingError::invalid_address(addr.to_string(), reason);
            let components: Vec<Protocol<'_>> = addr.iter().collect();

            let [host, Protocol::Tcp(port), scheme, Protocol::P2pWebSocketStar, tail @ ..] =
                components.as_slice()
            else {
                return Err(invalid("expected <host>/tcp/<port>/<ws|wss>/p2p-websocket-star"));
            };

            let host = match host {
                Protocol::Ip4(ip) => ip.to_string(),
                Protocol::Ip6(ip) => format!("[{}]", ip),
                Protocol::Dns(name) | Protocol::Dns4(name) | Protocol::Dns6(name) => name.to_string(),
                _ => return Err(invalid("unsupported host component")),
            };
            let secure = match scheme {
                Protocol::Ws(_) => false,
                Protocol::Wss(_) => true,
                _ => return Err(invalid("expected ws or wss component")),
            };
            let peer_id = match tail {
                [] => None,
                [Protocol::P2p(peer_id)] => Some(*peer_id),
                _ => return Err(invalid("unexpected trailing components")),
            };
            (format!("{}:{}", host, port), secure, peer_id)
        };

        Ok(Self {
            addr,
            endpoint,
            secure,
            peer_id,
        })
    }
}

impl FromStr for SignalAddr {
    type Err = SignalingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr: Multiaddr = s
            .parse()
            .map_err(|e: multiaddr::Error| SignalingError::invalid_address(s, e.to_string()))?;
        Self::try_from(addr)
    }
}

impl From<SignalAddr> for Multiaddr {
    fn from(addr: SignalAddr) -> Self {
        addr.addr
    }
}
