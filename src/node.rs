//! # Node
//!
//! [`Node`] wires the stack together: the connection manager owns transports,
//! secure channels and multiplexed connections; gossip, DHT and ping run as
//! protocol handlers on top of it.
//!
//! ```text
//!   Node ──► ConnectionManager ──► Transports ─► secure ─► mux
//!     │            ▲  │ events
//!     │            │  ▼
//!     ├─► GossipSub ─┐
//!     ├─► DhtNode ───┼─► NetworkRpc (streams per protocol id)
//!     └─► ping ──────┘
//! ```
//!
//! ## Lifecycle
//!
//! | State | `start()` | `stop()` |
//! |-------|-----------|----------|
//! | Created | binds listeners, spawns services | tears down |
//! | Running | no-op | tears down |
//! | Stopped | `NotRunning` | no-op |
//!
//! A stopped node cannot be restarted; build a new one.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::address::PeerAddress;
use crate::config::NodeConfig;
use crate::connection::{ConnectionManager, InboundStream, PeerEvent, ProtocolRouter};
use crate::dht::{DhtNode, Key};
use crate::discovery::{run_discovery, DhtDiscovery, Discovery, StaticDiscovery};
use crate::error::NetworkError;
use crate::gossipsub::{GossipSub, Subscription};
use crate::identity::{Contact, Keypair, PeerId};
use crate::messages::{MessageId, GOSSIPSUB_PROTOCOL, KAD_PROTOCOL, PING_PROTOCOL};
use crate::mux::Connection;
use crate::ping::{keepalive, ping, serve_ping};
use crate::rpc::{serve_dht, serve_gossip, NetworkRpc};
use crate::transport::Transports;

struct Inbound {
    kad: mpsc::Receiver<InboundStream>,
    gossip: mpsc::Receiver<InboundStream>,
    ping: mpsc::Receiver<InboundStream>,
}

enum State {
    Created(Inbound),
    Running(JoinSet<()>),
    Stopped,
}

pub struct Node {
    keypair: Keypair,
    config: NodeConfig,
    manager: ConnectionManager,
    rpc: NetworkRpc,
    dht: DhtNode<NetworkRpc>,
    gossipsub: GossipSub<NetworkRpc>,
    state: Mutex<State>,
}

impl Node {
    /// Build a node. Must run inside a Tokio runtime; nothing listens until
    /// [`Node::start`].
    pub fn new(keypair: Keypair, config: NodeConfig) -> Self {
        let transports = Transports::from_config(&config.transports);
        Self::with_transports(keypair, config, transports)
    }

    /// Like [`Node::new`] with an explicit carrier set, e.g. a private
    /// `MemoryHub` in tests.
    pub fn with_transports(keypair: Keypair, config: NodeConfig, transports: Transports) -> Self {
        let mut router = ProtocolRouter::default();
        let inbound = Inbound {
            kad: router.register_protocol(KAD_PROTOCOL),
            gossip: router.register_protocol(GOSSIPSUB_PROTOCOL),
            ping: router.register_protocol(PING_PROTOCOL),
        };

        let manager = ConnectionManager::spawn(
            keypair.clone(),
            transports,
            config.connection.clone(),
            config.mux.clone(),
            router,
        );
        let rpc = NetworkRpc::new(manager.clone(), config.rpc_timeout());

        // Bound addresses are unknown until start; peers learn them from the handshake.
        let self_contact = Contact::new(keypair.peer_id(), Vec::new());
        let dht = DhtNode::new(self_contact, rpc.clone(), config.dht.clone());
        let gossipsub = GossipSub::spawn(
            keypair.clone(),
            Arc::new(rpc.clone()),
            config.gossip.clone(),
        );

        Self {
            keypair,
            config,
            manager,
            rpc,
            dht,
            gossipsub,
            state: Mutex::new(State::Created(inbound)),
        }
    }

    /// Generate a keypair, listen on `addr` and start.
    pub async fn bind(addr: &str) -> Result<Self> {
        let listen: PeerAddress = addr
            .parse()
            .with_context(|| format!("invalid listen address {}", addr))?;
        let config = NodeConfig {
            listen_addrs: vec![listen],
            ..NodeConfig::default()
        };
        let node = Self::new(Keypair::generate(), config);
        node.start().await?;
        Ok(node)
    }

    pub fn peer_id(&self) -> PeerId {
        self.keypair.peer_id()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Bind listeners and launch the protocol, discovery and keepalive tasks.
    pub async fn start(&self) -> Result<(), NetworkError> {
        let mut state = self.state.lock().await;
        match &*state {
            State::Running(_) => return Ok(()),
            State::Stopped => return Err(NetworkError::NotRunning),
            State::Created(_) => {}
        }

        // Subscribe before anything can connect so no event is missed.
        let events = self.manager.events();
        let bootstrap_events = self.manager.events();

        for addr in &self.config.listen_addrs {
            let bound = self.manager.listen(addr.clone()).await?;
            info!(addr = %bound, peer = %self.peer_id().short(), "listening");
        }

        let State::Created(inbound) = std::mem::replace(&mut *state, State::Stopped) else {
            return Ok(());
        };

        let mut tasks = JoinSet::new();
        tasks.spawn(serve_dht(self.dht.clone(), inbound.kad));
        tasks.spawn(serve_gossip(self.gossipsub.clone(), inbound.gossip));
        tasks.spawn(serve_ping(inbound.ping));
        tasks.spawn(keepalive(self.manager.clone(), self.config.ping.clone()));
        tasks.spawn(route_events(
            events,
            self.dht.clone(),
            self.gossipsub.clone(),
            self.rpc.clone(),
        ));

        let mut sources: Vec<Box<dyn Discovery>> = Vec::new();
        if !self.config.bootstrap.is_empty() {
            sources.push(Box::new(StaticDiscovery::new(self.config.bootstrap.clone())));
            tasks.spawn(bootstrap_dht(self.dht.clone(), bootstrap_events, self.config.dht.lookup_timeout));
        }
        if self.config.discovery.dht_random_walk {
            sources.push(Box::new(DhtDiscovery::new(self.dht.clone())));
        }
        if !sources.is_empty() {
            tasks.spawn(run_discovery(
                self.manager.clone(),
                sources,
                self.config.discovery.clone(),
            ));
        }

        *state = State::Running(tasks);
        info!(peer = %self.peer_id().short(), "node started");
        Ok(())
    }

    /// Close every connection, cancel every task and release listeners.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, State::Stopped) {
            State::Stopped => return,
            State::Running(mut tasks) => tasks.shutdown().await,
            State::Created(_) => {}
        }
        self.manager.shutdown().await;
        self.gossipsub.quit().await;
        self.dht.quit().await;
        info!(peer = %self.peer_id().short(), "node stopped");
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, State::Running(_))
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Bound listen addresses.
    pub async fn listen_addrs(&self) -> Vec<PeerAddress> {
        self.manager.listen_addrs().await
    }

    /// Dial an address; a `/p2p/` suffix pins the expected identity.
    pub async fn dial(&self, addr: PeerAddress) -> Result<Connection, NetworkError> {
        self.manager.dial_address(addr).await
    }

    /// Connect to `peer` using known addresses.
    pub async fn dial_peer(&self, peer: PeerId) -> Result<Connection, NetworkError> {
        self.manager.dial(peer).await
    }

    pub async fn add_address(&self, peer: PeerId, addr: PeerAddress) -> Result<(), NetworkError> {
        self.manager.add_addresses(peer, vec![addr]).await.map(|_| ())
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.manager.connected_peers().await
    }

    pub async fn disconnect(&self, peer: PeerId) {
        self.manager.disconnect(peer).await;
    }

    /// Connect, disconnect and discovery notifications from now on.
    pub fn events(&self) -> broadcast::Receiver<PeerEvent> {
        self.manager.events()
    }

    /// Round trip time to `peer`, dialing if needed.
    pub async fn ping(&self, peer: PeerId) -> Result<Duration, NetworkError> {
        let connection = self.manager.dial(peer).await?;
        ping(&connection, self.config.ping.timeout).await
    }

    // ========================================================================
    // PubSub
    // ========================================================================

    pub async fn subscribe(&self, topic: &str) -> Result<Subscription, NetworkError> {
        self.gossipsub.subscribe(topic).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), NetworkError> {
        self.gossipsub.unsubscribe(topic).await
    }

    pub async fn publish(&self, topic: &str, data: impl Into<Vec<u8>>) -> Result<MessageId, NetworkError> {
        self.gossipsub.publish(topic, data.into()).await
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        self.gossipsub.subscriptions().await
    }

    pub async fn mesh_peers(&self, topic: &str) -> Vec<PeerId> {
        self.gossipsub.mesh_peers(topic).await
    }

    /// Send every message on `peer`'s topics straight to it, outside the mesh.
    pub async fn add_explicit_peer(&self, peer: PeerId) {
        self.gossipsub.add_explicit_peer(peer).await
    }

    pub async fn remove_explicit_peer(&self, peer: PeerId) {
        self.gossipsub.remove_explicit_peer(peer).await
    }

    pub async fn explicit_peers(&self) -> Vec<PeerId> {
        self.gossipsub.explicit_peers().await
    }

    // ========================================================================
    // DHT
    // ========================================================================

    pub async fn find_peer(&self, peer: PeerId) -> Result<Contact, NetworkError> {
        self.dht.find_peer(peer).await
    }

    /// Announce this node as a provider of `key`. Returns how many remote
    /// peers stored the record.
    pub async fn provide(&self, key: Key) -> Result<usize, NetworkError> {
        self.dht.provide(key).await
    }

    pub async fn find_providers(&self, key: Key) -> Result<Vec<Contact>, NetworkError> {
        self.dht.find_providers(key).await
    }
}

// ============================================================================
// Background tasks
// ============================================================================

/// Feed connection events into gossip and the routing table.
async fn route_events(
    mut events: broadcast::Receiver<PeerEvent>,
    dht: DhtNode<NetworkRpc>,
    gossipsub: GossipSub<NetworkRpc>,
    rpc: NetworkRpc,
) {
    loop {
        match events.recv().await {
            Ok(PeerEvent::Connected { peer, info }) => {
                dht.observe_contact(Contact::new(peer, info.remote_listen_addrs)).await;
                gossipsub.peer_connected(peer).await;
            }
            Ok(PeerEvent::Disconnected { peer, .. }) => {
                rpc.forget(&peer).await;
                gossipsub.peer_disconnected(peer).await;
            }
            Ok(PeerEvent::Discovered { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "peer event consumer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Self lookup through the first bootstrap connection.
async fn bootstrap_dht(
    dht: DhtNode<NetworkRpc>,
    mut events: broadcast::Receiver<PeerEvent>,
    wait: Duration,
) {
    let first = tokio::time::timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(PeerEvent::Connected { peer, info }) => {
                    return Some(Contact::new(peer, info.remote_listen_addrs));
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await;

    match first {
        Ok(Some(seed)) => {
            if let Err(e) = dht.bootstrap(vec![seed]).await {
                debug!(error = %e, "dht bootstrap failed");
            }
        }
        Ok(None) => {}
        Err(_) => debug!("no bootstrap peer connected in time"),
    }
}
