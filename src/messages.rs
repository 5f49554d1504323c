//! # Wire Protocol Messages
//!
//! Everything that crosses the control connection is a [`Frame`]:
//!
//! | Frame | Purpose |
//! |-------|---------|
//! | `Event` | Named message with arguments, optionally expecting an `Ack` |
//! | `Ack` | Acknowledgement arguments for one `Event` |
//! | `Data` | Raw bytes on a named byte channel |
//! | `End` | The writer closed a named byte channel |
//!
//! Frames are bincode-encoded and length-prefixed:
//!
//! ```text
//! ┌─────────────────┬──────────────────────────┐
//! │ Length (4 bytes)│ bincode Frame (N bytes)  │
//! │  big-endian u32 │                          │
//! └─────────────────┴──────────────────────────┘
//! ```
//!
//! ## Security Limits
//!
//! - All deserialization goes through [`decode_frame`] with a size limit
//! - Oversized length prefixes are rejected before the body is read

use bincode::Options;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SignalingError};

/// Join (or re-join) this listener's address at the signaling server.
pub const SS_JOIN: &str = "ss-join";

/// Ask the server to relay a dial to another registered peer.
pub const SS_DIAL: &str = "ss-dial";

/// Server → listener: a peer is dialing us (note the historical spelling).
pub const SS_INCOMING: &str = "ss-incomming";

/// Server → listener: peer announcement, fire-and-forget.
pub const WS_PEER: &str = "ws-peer";

/// A single message argument.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Arg {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Arg>),
}

impl Arg {
    pub fn kind(&self) -> ArgKind {
        match self {
            Arg::Null => ArgKind::Null,
            Arg::Bool(_) => ArgKind::Bool,
            Arg::Int(_) => ArgKind::Int,
            Arg::Str(_) => ArgKind::Str,
            Arg::Bytes(_) => ArgKind::Bytes,
            Arg::List(_) => ArgKind::List,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Arg::Null)
    }

    /// Treats `Null`, `false` and empty strings as absent, the way signaling
    /// servers report "no error" / "no challenge".
    pub fn is_falsy(&self) -> bool {
        match self {
            Arg::Null => true,
            Arg::Bool(b) => !b,
            Arg::Str(s) => s.is_empty(),
            _ => false,
        }
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Str(s.to_string())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Str(s)
    }
}

impl From<bool> for Arg {
    fn from(b: bool) -> Self {
        Arg::Bool(b)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgKind {
    Null,
    Bool,
    Int,
    Str,
    Bytes,
    List,
    /// Rendezvous address in canonical string form.
    Addr,
}

impl std::fmt::Display for ArgKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ArgKind::Null => "null",
            ArgKind::Bool => "bool",
            ArgKind::Int => "int",
            ArgKind::Str => "string",
            ArgKind::Bytes => "bytes",
            ArgKind::List => "list",
            ArgKind::Addr => "address",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Event {
        name: String,
        args: Vec<Arg>,
        /// Set when the sender expects exactly one `Ack` back.
        ack: Option<u64>,
    },
    Ack {
        id: u64,
        args: Vec<Arg>,
    },
    Data {
        channel: String,
        payload: Vec<u8>,
    },
    End {
        channel: String,
    },
}

impl Frame {
    /// Short label for logging.
    pub fn label(&self) -> &str {
        match self {
            Frame::Event { name, .. } => name,
            Frame::Ack { .. } => "ack",
            Frame::Data { .. } => "data",
            Frame::End { .. } => "end",
        }
    }
}

fn bincode_options(limit: u64) -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(limit)
        .with_fixint_encoding()
}

pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>> {
    Ok(bincode_options(u64::MAX).serialize(frame)?)
}

/// Deserialize with size bounds enforced.
pub fn decode_frame(bytes: &[u8], limit: u64) -> Result<Frame> {
    Ok(bincode_options(limit).deserialize(bytes)?)
}

/// Read one length-prefixed frame. Returns `Ok(None)` on a clean EOF between
/// frames.
pub async fn read_frame<R>(reader: &mut R, limit: u64) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as u64;

    if len > limit {
        return Err(SignalingError::Codec(format!(
            "frame too large: {} bytes (max {})",
            len, limit
        )));
    }
    if len == 0 {
        return Err(SignalingError::Codec("empty frame".to_string()));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    decode_frame(&body, limit).map(Some)
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = encode_frame(frame)?;
    let len = u32::try_from(body.len())
        .map_err(|_| SignalingError::Codec(format!("frame too large: {} bytes", body.len())))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}
