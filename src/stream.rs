//! # Virtual Stream Multiplexer
//!
//! A dialed connection is a pair of named byte channels on the shared
//! control connection, keyed by a random dial id:
//!
//! | Role | Writes to | Reads from |
//! |------|-----------|------------|
//! | Initiator (dialer) | `<id>.dialer` | `<id>.listener` |
//! | Responder (listener) | `<id>.listener` | `<id>.dialer` |
//!
//! Both sides open their pair before the dial request (initiator) or the
//! dial acknowledgement (responder) goes out, so no early bytes are lost.
//!
//! A [`Connection`] is bound to the session it was opened on: once that
//! session ends (close or reconnect), reads return EOF and writes fail with
//! `BrokenPipe`. Writes wait while the control connection's outbound queue
//! is full.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::address::SignalAddr;
use crate::connection::{ChannelSink, ChannelSource, Session};
use crate::error::Result;

const DIAL_ID_LEN: usize = 16;

/// Opaque identifier of one virtual stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DialId(String);

impl DialId {
    /// Fresh random id: 16 bytes from the OS RNG, hex-encoded.
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; DIAL_ID_LEN];
        getrandom::getrandom(&mut bytes).map_err(|e| io::Error::other(e.to_string()))?;
        Ok(Self(hex::encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn dialer_channel(&self) -> String {
        format!("{}.dialer", self.0)
    }

    pub fn listener_channel(&self) -> String {
        format!("{}.listener", self.0)
    }
}

impl fmt::Display for DialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DialId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DialId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// The two channel ends of one virtual stream.
#[derive(Debug)]
pub struct ChannelPair {
    pub sink: ChannelSink,
    pub source: ChannelSource,
}

pub fn open_as_initiator(session: &Arc<Session>, dial_id: &DialId) -> ChannelPair {
    ChannelPair {
        source: session.create_source(&dial_id.listener_channel()),
        sink: session.create_sink(&dial_id.dialer_channel()),
    }
}

pub fn open_as_responder(session: &Arc<Session>, dial_id: &DialId) -> ChannelPair {
    ChannelPair {
        source: session.create_source(&dial_id.dialer_channel()),
        sink: session.create_sink(&dial_id.listener_channel()),
    }
}

/// A bidirectional byte stream to a remote peer, relayed by the server.
///
/// Usable either chunk-wise ([`send`](Self::send) / [`recv`](Self::recv)) or
/// through `AsyncRead` / `AsyncWrite`. Dropping it ends the outbound half.
pub struct Connection {
    dial_id: DialId,
    direction: Direction,
    remote: SignalAddr,
    sink: ChannelSink,
    source: ChannelSource,
    read_buf: Bytes,
}

impl Connection {
    pub(crate) fn new(dial_id: DialId, direction: Direction, remote: SignalAddr, pair: ChannelPair) -> Self {
        Self {
            dial_id,
            direction,
            remote,
            sink: pair.sink,
            source: pair.source,
            read_buf: Bytes::new(),
        }
    }

    pub fn dial_id(&self) -> &DialId {
        &self.dial_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn remote(&self) -> &SignalAddr {
        &self.remote
    }

    /// Addresses observed for the remote end: just the address it dialed
    /// from (inbound) or the one we dialed (outbound).
    pub fn observed_addrs(&self) -> Vec<SignalAddr> {
        vec![self.remote.clone()]
    }

    pub async fn send(&self, data: &[u8]) -> Result<()> {
        self.sink.send(data).await
    }

    /// Next chunk from the remote, or `None` at end of stream.
    pub async fn recv(&mut self) -> Option<Bytes> {
        if !self.read_buf.is_empty() {
            return Some(std::mem::take(&mut self.read_buf));
        }
        self.source.recv().await
    }

    /// End the outbound half. Reading continues until the remote ends too.
    pub fn close(&self) {
        self.sink.finish();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("dial_id", &self.dial_id)
            .field("direction", &self.direction)
            .field("remote", &self.remote.to_string())
            .finish_non_exhaustive()
    }
}

impl AsyncRead for Connection {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if self.read_buf.is_empty() {
            match self.source.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => self.read_buf = chunk,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = self.read_buf.len().min(buf.remaining());
        buf.put_slice(&self.read_buf[..n]);
        self.read_buf.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for Connection {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.get_mut()
            .sink
            .poll_send(cx, buf)
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.sink.finish();
        Poll::Ready(Ok(()))
    }
}
