//! # Request Dispatcher
//!
//! Routes named inbound messages on a control connection to registered
//! handlers, after checking each message's arguments against the shape the
//! handler was registered with.
//!
//! - One handler per message name; registering again replaces the old one.
//! - Malformed messages are logged and dropped, never propagated.
//! - Request/response messages carry a [`Responder`]; it is consumed by
//!   [`Responder::respond`], so a handler cannot acknowledge twice.
//! - Outbound requests resolve through a [`PendingRequest`]. The first `Ack`
//!   for an id wins; later ones find no pending entry and are ignored.
//!   No timeout is imposed here; dropping the request forgets it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock as StdRwLock, Weak};
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::address::SignalAddr;
use crate::connection::Session;
use crate::error::{Result, SignalingError};
use crate::messages::{Arg, ArgKind};

/// Expected argument list of an inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArgShape {
    kinds: Vec<ArgKind>,
    expects_ack: bool,
}

impl ArgShape {
    /// Fire-and-forget message with the given argument kinds.
    pub fn new(kinds: impl Into<Vec<ArgKind>>) -> Self {
        Self {
            kinds: kinds.into(),
            expects_ack: false,
        }
    }

    /// Request/response message: the sender must supply an ack id.
    pub fn with_ack(mut self) -> Self {
        self.expects_ack = true;
        self
    }

    pub fn expects_ack(&self) -> bool {
        self.expects_ack
    }

    pub fn validate(&self, name: &str, args: &[Arg], has_ack: bool) -> Result<()> {
        let shape_error = |reason: String| SignalingError::ProtocolShape {
            name: name.to_string(),
            reason,
        };

        if args.len() != self.kinds.len() {
            return Err(shape_error(format!(
                "expected {} arguments, got {}",
                self.kinds.len(),
                args.len()
            )));
        }

        for (position, (arg, kind)) in args.iter().zip(&self.kinds).enumerate() {
            let ok = match kind {
                ArgKind::Addr => arg.as_str().is_some_and(SignalAddr::matches),
                kind => arg.kind() == *kind,
            };
            if !ok {
                return Err(shape_error(format!(
                    "argument {} should be {}, got {:?}",
                    position, kind, arg
                )));
            }
        }

        if self.expects_ack && !has_ack {
            return Err(shape_error("missing acknowledgement callback".to_string()));
        }
        Ok(())
    }
}

/// A named message delivered to a handler.
pub struct Inbound {
    pub name: String,
    pub args: Vec<Arg>,
    /// Present for request/response messages.
    pub responder: Option<Responder>,
    /// The control-connection session the message arrived on.
    pub session: Arc<Session>,
}

pub type Handler = Arc<dyn Fn(Inbound) + Send + Sync>;

struct Registration {
    shape: ArgShape,
    handler: Handler,
}

#[derive(Default)]
pub struct Dispatcher {
    handlers: StdRwLock<HashMap<String, Registration>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `name`, replacing any previous registration.
    pub fn add_handler<F>(&self, name: &str, shape: ArgShape, handler: F)
    where
        F: Fn(Inbound) + Send + Sync + 'static,
    {
        let registration = Registration {
            shape,
            handler: Arc::new(handler),
        };
        let mut handlers = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if handlers.insert(name.to_string(), registration).is_some() {
            debug!(message = name, "replaced message handler");
        }
    }

    pub fn has_handler(&self, name: &str) -> bool {
        match self.handlers.read() {
            Ok(guard) => guard.contains_key(name),
            Err(poisoned) => poisoned.into_inner().contains_key(name),
        }
    }

    /// Route one inbound message. Unknown names and shape mismatches are
    /// dropped with a log line.
    pub fn dispatch(&self, inbound: Inbound) {
        let (shape, handler) = {
            let handlers = match self.handlers.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match handlers.get(&inbound.name) {
                Some(reg) => (reg.shape.clone(), reg.handler.clone()),
                None => {
                    debug!(message = %inbound.name, "no handler registered, dropping message");
                    return;
                }
            }
        };

        if let Err(e) = shape.validate(&inbound.name, &inbound.args, inbound.responder.is_some()) {
            warn!(error = %e, "dropping malformed message");
            return;
        }

        trace!(message = %inbound.name, args = inbound.args.len(), "dispatching message");
        handler(inbound);
    }
}

/// One-shot acknowledgement for an inbound request.
pub struct Responder {
    id: u64,
    session: Arc<Session>,
}

impl Responder {
    pub(crate) fn new(id: u64, session: Arc<Session>) -> Self {
        Self { id, session }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Send the acknowledgement. Consumes the responder.
    pub fn respond(self, args: Vec<Arg>) {
        if let Err(e) = self.session.send_ack(self.id, args) {
            debug!(ack = self.id, error = %e, "failed to send acknowledgement");
        }
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder").field("id", &self.id).finish()
    }
}

/// An outbound request awaiting its acknowledgement arguments.
///
/// Resolves with [`SignalingError::Closed`] if the control connection drops
/// first. Dropping it removes the session's pending entry.
#[derive(Debug)]
pub struct PendingRequest {
    id: u64,
    rx: oneshot::Receiver<Vec<Arg>>,
    session: Weak<Session>,
}

impl PendingRequest {
    pub(crate) fn new(id: u64, rx: oneshot::Receiver<Vec<Arg>>, session: Weak<Session>) -> Self {
        Self { id, rx, session }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for PendingRequest {
    type Output = Result<Vec<Arg>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| SignalingError::Closed))
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            session.forget_request(self.id);
        }
    }
}

/// Interpret the leading error argument of an acknowledgement.
pub(crate) fn ack_error(args: &[Arg]) -> Option<String> {
    match args.first() {
        None => None,
        Some(arg) if arg.is_falsy() => None,
        Some(Arg::Str(message)) => Some(message.clone()),
        Some(other) => Some(format!("{:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Frame, SS_INCOMING, WS_PEER};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    const ADDR: &str = "/ip4/127.0.0.1/tcp/15555/ws/p2p-websocket-star";

    fn session() -> (Arc<Session>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(256);
        (Arc::new(Session::new(1, tx, 16)), rx)
    }

    fn inbound(name: &str, args: Vec<Arg>, responder: Option<Responder>, session: &Arc<Session>) -> Inbound {
        Inbound {
            name: name.to_string(),
            args,
            responder,
            session: session.clone(),
        }
    }

    #[test]
    fn test_shape_validation() {
        let shape = ArgShape::new([ArgKind::Str, ArgKind::Addr]).with_ack();

        assert!(shape.validate("m", &[Arg::from("id"), Arg::from(ADDR)], true).is_ok());
        // Wrong arity.
        assert!(shape.validate("m", &[Arg::from("id")], true).is_err());
        // Address that does not parse.
        assert!(shape.validate("m", &[Arg::from("id"), Arg::from("/ip4/x")], true).is_err());
        // Wrong kind.
        assert!(shape.validate("m", &[Arg::Int(3), Arg::from(ADDR)], true).is_err());
        // Missing ack.
        assert!(shape.validate("m", &[Arg::from("id"), Arg::from(ADDR)], false).is_err());
    }

    #[test]
    fn test_dispatch_routes_and_drops_malformed() {
        let (session, _rx) = session();
        let dispatcher = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        dispatcher.add_handler(WS_PEER, ArgShape::new([ArgKind::Addr]), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.dispatch(inbound(WS_PEER, vec![Arg::from(ADDR)], None, &session));
        dispatcher.dispatch(inbound(WS_PEER, vec![Arg::from("not-an-addr")], None, &session));
        dispatcher.dispatch(inbound(WS_PEER, vec![], None, &session));
        dispatcher.dispatch(inbound("unknown", vec![], None, &session));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_re_registration_replaces_handler() {
        let (session, _rx) = session();
        let dispatcher = Dispatcher::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let c = first.clone();
        dispatcher.add_handler(WS_PEER, ArgShape::new([ArgKind::Addr]), move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let c = second.clone();
        dispatcher.add_handler(WS_PEER, ArgShape::new([ArgKind::Addr]), move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.dispatch(inbound(WS_PEER, vec![Arg::from(ADDR)], None, &session));

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert!(dispatcher.has_handler(WS_PEER));
    }

    #[test]
    fn test_responder_sends_single_ack() {
        let (session, mut rx) = session();
        let dispatcher = Dispatcher::new();
        dispatcher.add_handler(
            SS_INCOMING,
            ArgShape::new([ArgKind::Str, ArgKind::Addr]).with_ack(),
            |inbound: Inbound| {
                if let Some(responder) = inbound.responder {
                    responder.respond(vec![]);
                }
            },
        );

        let responder = Responder::new(42, session.clone());
        dispatcher.dispatch(inbound(
            SS_INCOMING,
            vec![Arg::from("dial"), Arg::from(ADDR)],
            Some(responder),
            &session,
        ));

        assert_eq!(rx.try_recv().unwrap(), Frame::Ack { id: 42, args: vec![] });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pending_request_first_ack_wins() {
        let (session, mut rx) = session();
        let pending = session.request("ss-dial", vec![Arg::from("a")]).await.unwrap();
        let id = pending.id();

        match rx.try_recv().unwrap() {
            Frame::Event { ack, .. } => assert_eq!(ack, Some(id)),
            other => panic!("unexpected frame {:?}", other),
        }

        let dispatcher = Dispatcher::new();
        session.route(Frame::Ack { id, args: vec![Arg::Null] }, &dispatcher);
        session.route(Frame::Ack { id, args: vec![Arg::from("late")] }, &dispatcher);

        assert_eq!(pending.await.unwrap(), vec![Arg::Null]);
    }

    #[tokio::test]
    async fn test_pending_request_fails_when_session_shuts_down() {
        let (session, _rx) = session();
        let pending = session.request("ss-join", vec![]).await.unwrap();
        session.shutdown();
        assert!(matches!(pending.await, Err(SignalingError::Closed)));
    }

    #[tokio::test]
    async fn test_abandoned_requests_are_forgotten() {
        let (session, _rx) = session();

        for _ in 0..100 {
            let pending = session.request("ss-dial", vec![]).await.unwrap();
            let waited = tokio::time::timeout(Duration::ZERO, pending).await;
            assert!(waited.is_err());
        }
        assert_eq!(session.pending_requests(), 0);

        // An ack for a forgotten request is ignored.
        let kept = session.request("ss-dial", vec![]).await.unwrap();
        assert_eq!(session.pending_requests(), 1);
        session.route(Frame::Ack { id: 1, args: vec![] }, &Dispatcher::new());
        assert_eq!(session.pending_requests(), 1);
        drop(kept);
        assert_eq!(session.pending_requests(), 0);
    }

    #[test]
    fn test_ack_error_interpretation() {
        assert_eq!(ack_error(&[]), None);
        assert_eq!(ack_error(&[Arg::Null]), None);
        assert_eq!(ack_error(&[Arg::from("")]), None);
        assert_eq!(ack_error(&[Arg::from("peer not found")]), Some("peer not found".to_string()));
    }
}
