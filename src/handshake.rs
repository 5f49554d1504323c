//! # Join Handshake
//!
//! Registers a listener's address with the signaling server, answering the
//! server's crypto challenge if it sends one.
//!
//! ```text
//! first join                          re-join (after reconnect)
//! ──────────                          ─────────────────────────
//! ss-join(addr, pubkey|"")            ss-join(addr, cached signature)
//!   ◄── ack(err, challenge?)            ◄── ack(err, need_new_challenge)
//! no challenge → cache "_", done      false → done
//! challenge    → sign, then           true  → forget signature,
//! ss-join(addr, signature)                     run the first-join flow once
//!   ◄── ack(err, need_new_challenge)
//! ```
//!
//! The signature is cached for the life of the listener and dropped on close.

use std::sync::Arc;

use tracing::{debug, info};

use crate::address::SignalAddr;
use crate::connection::Session;
use crate::dispatcher::ack_error;
use crate::error::{Result, SignalingError};
use crate::identity::ChallengeSigner;
use crate::messages::{Arg, SS_JOIN};

/// Cached in place of a signature when the server did not challenge us.
pub const NO_CHALLENGE_SIGNATURE: &str = "_";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinState {
    Disconnected,
    Connected,
    Joining,
    Authenticated,
    Rejected,
}

pub struct JoinHandshake {
    identity: Option<Arc<dyn ChallengeSigner>>,
    signature: Option<String>,
    state: JoinState,
}

impl JoinHandshake {
    pub fn new(identity: Option<Arc<dyn ChallengeSigner>>) -> Self {
        Self {
            identity,
            signature: None,
            state: JoinState::Disconnected,
        }
    }

    pub fn state(&self) -> JoinState {
        self.state
    }

    pub fn cached_signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    pub fn on_connected(&mut self) {
        self.state = JoinState::Connected;
    }

    pub fn on_disconnected(&mut self) {
        self.state = JoinState::Disconnected;
    }

    /// Forget the cached signature. Used when the listener closes.
    pub fn reset(&mut self) {
        self.signature = None;
        self.state = JoinState::Disconnected;
    }

    /// Join `addr` on `session`, re-using the cached signature if present.
    pub async fn run(&mut self, session: &Arc<Session>, addr: &SignalAddr) -> Result<()> {
        self.state = JoinState::Joining;
        let result = self.join_or_challenge(session, addr).await;
        self.state = match &result {
            Ok(()) => JoinState::Authenticated,
            Err(_) => JoinState::Rejected,
        };
        result
    }

    async fn join_or_challenge(&mut self, session: &Arc<Session>, addr: &SignalAddr) -> Result<()> {
        if let Some(signature) = self.signature.clone() {
            if !self.join(session, addr, &signature).await? {
                debug!(addr = %addr, "re-joined with cached signature");
                return Ok(());
            }
            debug!(addr = %addr, "server requested a new challenge");
            self.signature = None;
        }
        self.challenge(session, addr).await
    }

    async fn challenge(&mut self, session: &Arc<Session>, addr: &SignalAddr) -> Result<()> {
        let public_key = self
            .identity
            .as_ref()
            .map(|id| id.public_key_hex())
            .unwrap_or_default();

        let reply = session
            .request(SS_JOIN, vec![Arg::from(addr.to_string()), Arg::from(public_key)])
            .await?
            .await?;
        if let Some(reason) = ack_error(&reply) {
            return Err(SignalingError::Handshake(reason));
        }

        let challenge = match reply.get(1) {
            None => None,
            Some(arg) if arg.is_falsy() => None,
            Some(Arg::Str(challenge)) => Some(challenge.clone()),
            Some(other) => {
                return Err(SignalingError::handshake(format!("malformed challenge {:?}", other)));
            }
        };

        let Some(challenge) = challenge else {
            info!(addr = %addr, "joined signaling server without challenge");
            self.signature = Some(NO_CHALLENGE_SIGNATURE.to_string());
            return Ok(());
        };

        let Some(identity) = &self.identity else {
            return Err(SignalingError::CannotProveIdentity);
        };

        let signature = identity
            .sign_challenge(challenge.as_bytes())
            .await
            .map_err(|e| SignalingError::handshake(format!("signing challenge failed: {}", e)))?;
        let signature = hex::encode(signature);
        self.signature = Some(signature.clone());

        if self.join(session, addr, &signature).await? {
            self.signature = None;
            return Err(SignalingError::handshake(
                "server requested a new challenge for a fresh signature",
            ));
        }
        info!(addr = %addr, "joined signaling server with signed challenge");
        Ok(())
    }

    /// Signed join. Returns whether the server wants a new challenge.
    async fn join(&self, session: &Arc<Session>, addr: &SignalAddr, signature: &str) -> Result<bool> {
        let reply = session
            .request(SS_JOIN, vec![Arg::from(addr.to_string()), Arg::from(signature)])
            .await?
            .await?;
        if let Some(reason) = ack_error(&reply) {
            return Err(SignalingError::Handshake(reason));
        }
        Ok(reply.get(1).is_some_and(|arg| !arg.is_falsy()))
    }
}

impl std::fmt::Debug for JoinHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinHandshake")
            .field("has_identity", &self.identity.is_some())
            .field("has_signature", &self.signature.is_some())
            .field("state", &self.state)
            .finish()
    }
}
