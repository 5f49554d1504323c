//! # Identity and Challenge Signing
//!
//! This module defines the identity types a listener uses to prove its right to
//! claim an address at the signaling server:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`Identity`]: 32-byte public key serving as the peer's unique identifier
//! - [`ChallengeSigner`]: the async seam the join handshake signs through
//!
//! The crypto challenge is an identity proof, not a channel cipher: the server
//! hands out a challenge string, the listener signs it with its private key and
//! re-joins with the hex signature attached.

use anyhow::Result;
use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use libp2p_identity::{DecodingError, PeerId};
use rand::rngs::OsRng;

/// Something that can answer a signaling server's crypto challenge.
#[async_trait]
pub trait ChallengeSigner: Send + Sync + 'static {
    /// Marshaled public key, hex-encoded, as sent in the first `ss-join`.
    fn public_key_hex(&self) -> String;

    /// Sign the raw challenge bytes.
    async fn sign_challenge(&self, challenge: &[u8]) -> Result<Vec<u8>>;
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &hex::encode(self.identity().as_bytes()))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ChallengeSigner for Keypair {
    fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    async fn sign_challenge(&self, challenge: &[u8]) -> Result<Vec<u8>> {
        Ok(self.sign(challenge).to_bytes().to_vec())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identity([u8; 32]);

impl Identity {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// The libp2p peer id of this key, as carried in `/p2p/<peer-id>`
    /// address components. Fails if the bytes are not an Ed25519 point.
    pub fn peer_id(&self) -> Result<PeerId, DecodingError> {
        let key = libp2p_identity::ed25519::PublicKey::try_from_bytes(&self.0)?;
        Ok(libp2p_identity::PublicKey::from(key).to_peer_id())
    }

    /// Verify a challenge signature produced by the matching [`Keypair`].
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(message, &signature).is_ok()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for Identity {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}
