//! Integration tests for the Node public API: lifecycle, dialing, events and
//! bootstrap discovery.

use std::time::Duration;

use murmur::{
    DiscoveryConfig, Keypair, MemoryHub, MemoryTransport, NetworkError, Node, NodeConfig,
    PeerAddress, PeerEvent, PeerId, Transports,
};
use tokio::sync::broadcast;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn memory_node(hub: &MemoryHub, config: NodeConfig) -> Node {
    Node::with_transports(
        Keypair::generate(),
        config,
        Transports::new().with(MemoryTransport::with_hub(hub.clone())),
    )
}

fn listening() -> NodeConfig {
    NodeConfig {
        listen_addrs: vec![PeerAddress::memory(0)],
        discovery: DiscoveryConfig {
            interval: Duration::from_millis(100),
            dht_random_walk: false,
            ..DiscoveryConfig::default()
        },
        ..NodeConfig::default()
    }
}

async fn next_event<F>(events: &mut broadcast::Receiver<PeerEvent>, mut want: F) -> PeerEvent
where
    F: FnMut(&PeerEvent) -> bool,
{
    timeout(TEST_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if want(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_connected(node: &Node, peer: PeerId) {
    timeout(TEST_TIMEOUT, async {
        while !node.connected_peers().await.contains(&peer) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("peer never connected");
}

#[tokio::test]
async fn node_bind_reports_address_and_identity() {
    let node = Node::bind("/ip4/127.0.0.1/tcp/0").await.unwrap();
    let addrs = node.listen_addrs().await;
    assert_eq!(addrs.len(), 1);
    assert!(addrs[0].socket_addr().is_some_and(|a| a.port() != 0));
    assert_eq!(node.peer_id(), node.keypair().peer_id());
    node.stop().await;
}

#[tokio::test]
async fn bind_rejects_garbage_address() {
    assert!(Node::bind("not-an-address").await.is_err());
}

#[tokio::test]
async fn dial_emits_connected_on_both_sides() {
    let hub = MemoryHub::default();
    let a = memory_node(&hub, listening());
    let b = memory_node(&hub, listening());
    a.start().await.unwrap();
    b.start().await.unwrap();
    let mut events_a = a.events();
    let mut events_b = b.events();

    let addr = a.listen_addrs().await[0].with_peer_id(a.peer_id());
    let connection = b.dial(addr).await.unwrap();
    assert_eq!(connection.remote_peer(), a.peer_id());

    let seen_by_a = next_event(&mut events_a, |e| matches!(e, PeerEvent::Connected { .. })).await;
    assert_eq!(seen_by_a.peer(), b.peer_id());
    let seen_by_b = next_event(&mut events_b, |e| matches!(e, PeerEvent::Connected { .. })).await;
    assert_eq!(seen_by_b.peer(), a.peer_id());

    b.disconnect(a.peer_id()).await;
    let gone = next_event(&mut events_a, |e| matches!(e, PeerEvent::Disconnected { .. })).await;
    assert_eq!(gone.peer(), b.peer_id());
}

#[tokio::test]
async fn dial_with_wrong_identity_fails_handshake() {
    let hub = MemoryHub::default();
    let a = memory_node(&hub, listening());
    let b = memory_node(&hub, listening());
    a.start().await.unwrap();
    b.start().await.unwrap();

    let impostor = Keypair::generate().peer_id();
    let addr = a.listen_addrs().await[0].with_peer_id(impostor);
    assert!(matches!(
        b.dial(addr).await,
        Err(NetworkError::HandshakeFailed(_))
    ));
    assert!(b.connected_peers().await.is_empty());
}

#[tokio::test]
async fn dial_unknown_peer_has_no_address() {
    let hub = MemoryHub::default();
    let node = memory_node(&hub, listening());
    node.start().await.unwrap();
    let stranger = Keypair::generate().peer_id();
    assert_eq!(node.dial_peer(stranger).await.err(), Some(NetworkError::NoAddressKnown));
}

#[tokio::test]
async fn dial_peer_uses_added_address() {
    let hub = MemoryHub::default();
    let a = memory_node(&hub, listening());
    let b = memory_node(&hub, listening());
    a.start().await.unwrap();
    b.start().await.unwrap();

    let addr = a.listen_addrs().await[0].clone();
    b.add_address(a.peer_id(), addr).await.unwrap();
    let connection = b.dial_peer(a.peer_id()).await.unwrap();
    assert_eq!(connection.remote_peer(), a.peer_id());
}

#[tokio::test]
async fn bootstrap_list_connects_automatically() {
    let hub = MemoryHub::default();
    let seed = memory_node(&hub, listening());
    seed.start().await.unwrap();
    let seed_addr = seed.listen_addrs().await[0].with_peer_id(seed.peer_id());

    let joiner = memory_node(
        &hub,
        NodeConfig {
            bootstrap: vec![seed_addr],
            ..listening()
        },
    );
    let mut events = joiner.events();
    joiner.start().await.unwrap();

    let discovered = next_event(&mut events, |e| matches!(e, PeerEvent::Discovered { .. })).await;
    assert_eq!(discovered.peer(), seed.peer_id());
    wait_connected(&joiner, seed.peer_id()).await;
}

#[tokio::test]
async fn bootstrap_without_auto_dial_only_records() {
    let hub = MemoryHub::default();
    let seed = memory_node(&hub, listening());
    seed.start().await.unwrap();
    let seed_addr = seed.listen_addrs().await[0].with_peer_id(seed.peer_id());

    let base = listening();
    let joiner = memory_node(
        &hub,
        NodeConfig {
            bootstrap: vec![seed_addr],
            discovery: DiscoveryConfig {
                auto_dial: false,
                ..base.discovery.clone()
            },
            ..base
        },
    );
    let mut events = joiner.events();
    joiner.start().await.unwrap();

    next_event(&mut events, |e| matches!(e, PeerEvent::Discovered { .. })).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(joiner.connected_peers().await.is_empty());
}

#[tokio::test]
async fn stopped_node_refuses_work() {
    let hub = MemoryHub::default();
    let node = memory_node(&hub, listening());
    node.start().await.unwrap();
    node.stop().await;
    node.stop().await;

    assert_eq!(node.start().await, Err(NetworkError::NotRunning));
    assert_eq!(node.subscribe("news").await.err(), Some(NetworkError::NotRunning));
    let addr = PeerAddress::memory(1);
    assert!(node.dial(addr).await.is_err());
}
