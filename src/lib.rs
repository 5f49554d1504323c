//! # Sigstar - Signaling Relay Transport
//!
//! Sigstar lets peers that cannot reach each other directly exchange bytes
//! through a shared signaling server:
//!
//! - **Listen**: keep a persistent control connection to the server and join
//!   it under a rendezvous address, proving identity through an Ed25519
//!   challenge when the server asks for one
//! - **Dial**: ask the server to relay a connection to another joined peer;
//!   the result is a byte stream multiplexed over both control connections
//! - **Discover**: receive the server's announcements of other peers
//!
//! ## Architecture
//!
//! The codebase uses the **Actor Pattern** for stateful components:
//! - [`Listener`] is a cheap-to-clone handle talking to a private actor
//! - The actor owns the control connection and the join handshake
//! - The control connection runs its own reader, writer and reconnect tasks
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `address` | Rendezvous address parsing and formatting |
//! | `config` | Listener configuration and reconnect policy |
//! | `connection` | Control connection: sessions, reconnect, transport seam |
//! | `dispatcher` | Routing of named inbound messages with shape checks |
//! | `error` | Error type shared by all operations |
//! | `handshake` | Join handshake and challenge signing |
//! | `identity` | Keypairs and the challenge-signer seam |
//! | `listener` | Listen / dial orchestration |
//! | `messages` | Wire frames and their codec |
//! | `stream` | Virtual streams over named byte channels |
//! | `transport` | Multi-server facade with listener registry and discovery |

pub mod address;
pub mod config;
pub mod connection;
pub mod dispatcher;
mod error;
pub mod handshake;
mod identity;
mod listener;
pub mod messages;
pub mod stream;
mod transport;

pub use address::{SignalAddr, PROTOCOL_NAME};
pub use config::{ListenerConfig, ReconnectPolicy};
pub use connection::{Connector, TcpConnector};
pub use error::{Result, SignalingError};
pub use identity::{ChallengeSigner, Identity, Keypair};
pub use listener::{ConnectionHandler, DialOptions, Listener, ListenerEvent};
pub use stream::{Connection, DialId, Direction};
pub use transport::{DiscoveredPeer, ListenerRegistry, StarTransport};

pub use libp2p_identity::PeerId;
pub use multiaddr::Multiaddr;
