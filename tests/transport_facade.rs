//! Integration tests for StarTransport: listener registry, routing of dials
//! by server, and the merged discovery stream.

mod common;

use common::{inbound_queue, init_tracing, next_inbound, recv_exact, wait_for_event, TestServer, TEST_TIMEOUT};
use sigstar::{DialOptions, ListenerConfig, ListenerEvent, SignalingError, StarTransport};
use tokio::time::timeout;

#[tokio::test]
async fn listeners_register_under_their_server() {
    init_tracing();
    let server_a = TestServer::start().await;
    let server_b = TestServer::start().await;
    let transport = StarTransport::new(ListenerConfig::default(), None);

    let on_a = transport.create_listener(|_| {});
    let on_b = transport.create_listener(|_| {});
    on_a.listen(&server_a.addr("me")).await.unwrap();
    on_b.listen(&server_b.addr("me")).await.unwrap();

    let mut expected = vec![server_a.endpoint(), server_b.endpoint()];
    expected.sort();
    assert_eq!(transport.registry().endpoints(), expected);
    assert_eq!(
        transport.registry().get(&server_a.endpoint()).map(|l| l.id()),
        Some(on_a.id())
    );

    on_a.close().await;
    assert_eq!(transport.registry().endpoints(), vec![server_b.endpoint()]);
}

#[tokio::test]
async fn dial_routes_through_matching_listener() {
    init_tracing();
    let server = TestServer::start().await;
    let other_server = TestServer::start().await;

    let transport = StarTransport::new(ListenerConfig::default(), None);
    let local = transport.create_listener(|_| {});
    local.listen(&server.addr("alice")).await.unwrap();

    let (handler, mut inbound) = inbound_queue();
    let remote_transport = StarTransport::new(ListenerConfig::default(), None);
    let remote = remote_transport.create_listener(handler);
    remote.listen(&server.addr("bob")).await.unwrap();

    let stream = timeout(TEST_TIMEOUT, transport.dial(&server.addr("bob"), DialOptions::default()))
        .await
        .expect("dial timeout")
        .expect("dial failed");
    stream.send(b"via facade").await.unwrap();
    let mut accepted = next_inbound(&mut inbound).await;
    assert_eq!(recv_exact(&mut accepted, 10).await, b"via facade");

    let err = transport
        .dial(&other_server.addr("carol"), DialOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SignalingError::NoListenerForServer(e) if e == other_server.endpoint()));
}

#[tokio::test]
async fn discovery_merges_peer_announcements() {
    init_tracing();
    let server = TestServer::start().await;
    let transport = StarTransport::new(ListenerConfig::default(), None);
    let mut discovered = transport.discovery();

    let listener = transport.create_listener(|_| {});
    let mut events = listener.subscribe();
    listener.listen(&server.addr("alice")).await.unwrap();

    let other = StarTransport::new(ListenerConfig::default(), None);
    let bob = other.create_listener(|_| {});
    bob.listen(&server.addr("bob")).await.unwrap();

    let peer = timeout(TEST_TIMEOUT, discovered.recv())
        .await
        .expect("discovery timeout")
        .expect("discovery closed");
    assert_eq!(peer.addr, server.addr("bob"));
    assert_eq!(peer.peer_id(), Some(common::peer_id("bob")));

    // Listener-level events still fire alongside discovery.
    wait_for_event(&mut events, |e| matches!(e, ListenerEvent::Peer(_))).await;
}

#[tokio::test]
async fn filter_accepts_only_rendezvous_addresses() {
    let transport = StarTransport::new(ListenerConfig::default(), None);
    let kept = transport.filter(vec![
        format!("/ip4/1.2.3.4/tcp/9090/ws/p2p-websocket-star/p2p/{}", common::peer_id("x")),
        "/ip4/1.2.3.4/tcp/9090/ws".to_string(),
        "/ip6/::1/tcp/9090/wss/p2p-websocket-star".to_string(),
    ]);
    assert_eq!(kept.len(), 2);
    assert_eq!(kept[1].server_endpoint(), "[::1]:9090");
}
