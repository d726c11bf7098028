//! # Peer Discovery
//!
//! Discovery sources produce candidate peers; the discovery service merges
//! them into the peer store and, when `auto_dial` is set, connects to them.
//!
//! | Source | Produces |
//! |--------|----------|
//! | [`StaticDiscovery`] | The configured bootstrap addresses |
//! | [`DhtDiscovery`] | Closest peers found by a random-walk DHT lookup |
//!
//! The connection manager emits `PeerEvent::Discovered` whenever a merge
//! teaches it a new peer or a new address, so repeated rounds over the same
//! bootstrap list stay silent.
//!
//! A bootstrap address without a `/p2p/` suffix names no identity; it is
//! dialed by address and remembered under the identity the handshake proved.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::address::PeerAddress;
use crate::connection::ConnectionManager;
use crate::dht::DhtNode;
use crate::error::NetworkError;
use crate::identity::PeerId;
use crate::mux::Connection;
use crate::protocols::DhtRpc;

pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(30);

/// Dials started per discovery round.
pub const DEFAULT_MAX_DIALS_PER_ROUND: usize = 16;

#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    pub interval: Duration,
    /// Connect to discovered peers, not just record them.
    pub auto_dial: bool,
    pub max_dials_per_round: usize,
    /// Also walk the DHT for peers.
    pub dht_random_walk: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_DISCOVERY_INTERVAL,
            auto_dial: true,
            max_dials_per_round: DEFAULT_MAX_DIALS_PER_ROUND,
            dht_random_walk: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredPeer {
    /// `None` for a bare address whose identity is learned on connect.
    pub peer_id: Option<PeerId>,
    pub addrs: Vec<PeerAddress>,
}

#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn discover(&self) -> Result<Vec<DiscoveredPeer>>;
}

// ============================================================================
// Sources
// ============================================================================

pub struct StaticDiscovery {
    peers: Vec<DiscoveredPeer>,
}

impl StaticDiscovery {
    pub fn new(addrs: Vec<PeerAddress>) -> Self {
        let mut by_peer: HashMap<PeerId, Vec<PeerAddress>> = HashMap::new();
        let mut peers = Vec::new();
        for addr in addrs {
            match addr.peer_id() {
                Some(peer) => by_peer.entry(peer).or_default().push(addr.without_peer_id()),
                None => peers.push(DiscoveredPeer { peer_id: None, addrs: vec![addr] }),
            }
        }
        peers.extend(
            by_peer
                .into_iter()
                .map(|(peer, addrs)| DiscoveredPeer { peer_id: Some(peer), addrs }),
        );
        Self { peers }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn discover(&self) -> Result<Vec<DiscoveredPeer>> {
        Ok(self.peers.clone())
    }
}

/// Random-walk discovery: each round looks up a random id.
pub struct DhtDiscovery<N: DhtRpc> {
    dht: DhtNode<N>,
}

impl<N: DhtRpc> DhtDiscovery<N> {
    pub fn new(dht: DhtNode<N>) -> Self {
        Self { dht }
    }
}

#[async_trait]
impl<N: DhtRpc> Discovery for DhtDiscovery<N> {
    fn name(&self) -> &'static str {
        "dht"
    }

    async fn discover(&self) -> Result<Vec<DiscoveredPeer>> {
        if self.dht.routing_table_size().await == 0 {
            return Ok(Vec::new());
        }
        let target = PeerId::from_bytes(rand::random());
        let result = self.dht.lookup(target).await?;
        Ok(result
            .closest
            .into_iter()
            .filter(|c| c.peer_id != self.dht.peer_id() && !c.addrs.is_empty())
            .map(|c| DiscoveredPeer { peer_id: Some(c.peer_id), addrs: c.addrs })
            .collect())
    }
}

// ============================================================================
// Service
// ============================================================================

enum DialTarget {
    Peer(PeerId),
    Address(PeerAddress),
}

/// Run discovery rounds every `config.interval`, the first immediately.
pub async fn run_discovery(
    manager: ConnectionManager,
    sources: Vec<Box<dyn Discovery>>,
    config: DiscoveryConfig,
) {
    let mut interval = tokio::time::interval(config.interval.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut dials: JoinSet<(DialTarget, Result<Connection, NetworkError>)> = JoinSet::new();
    let mut in_flight: HashSet<PeerAddress> = HashSet::new();
    // Identities proven behind bare bootstrap addresses.
    let mut resolved: HashMap<PeerAddress, PeerId> = HashMap::new();

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let connected: HashSet<PeerId> = manager.connected_peers().await.into_iter().collect();
                let mut started = 0;
                for source in &sources {
                    let entries = match source.discover().await {
                        Ok(entries) => entries,
                        Err(e) => {
                            debug!(source = source.name(), error = %e, "discovery round failed");
                            continue;
                        }
                    };
                    trace!(source = source.name(), found = entries.len(), "discovery round");

                    for entry in entries {
                        let target = match entry.peer_id {
                            Some(peer) => {
                                if let Err(e) = manager.add_addresses(peer, entry.addrs).await {
                                    debug!(error = %e, "connection manager unavailable, stopping discovery");
                                    return;
                                }
                                DialTarget::Peer(peer)
                            }
                            None => {
                                let Some(addr) = entry.addrs.into_iter().next() else {
                                    continue;
                                };
                                match resolved.get(&addr) {
                                    Some(peer) => DialTarget::Peer(*peer),
                                    None => DialTarget::Address(addr),
                                }
                            }
                        };

                        if !config.auto_dial || started >= config.max_dials_per_round {
                            continue;
                        }
                        match target {
                            DialTarget::Peer(peer) if !connected.contains(&peer) => {
                                let manager = manager.clone();
                                dials.spawn(async move {
                                    let result = manager.dial(peer).await;
                                    (DialTarget::Peer(peer), result)
                                });
                                started += 1;
                            }
                            DialTarget::Address(addr) if in_flight.insert(addr.clone()) => {
                                let manager = manager.clone();
                                dials.spawn(async move {
                                    let result = manager.dial_address(addr.clone()).await;
                                    (DialTarget::Address(addr), result)
                                });
                                started += 1;
                            }
                            _ => {}
                        }
                    }
                }
            }
            Some(joined) = dials.join_next(), if !dials.is_empty() => {
                let Ok((target, result)) = joined else {
                    continue;
                };
                match (target, result) {
                    (DialTarget::Address(addr), Ok(connection)) => {
                        in_flight.remove(&addr);
                        debug!(addr = %addr, peer = %connection.remote_peer().short(), "connected to bootstrap address");
                        resolved.insert(addr, connection.remote_peer());
                    }
                    (DialTarget::Address(addr), Err(e)) => {
                        in_flight.remove(&addr);
                        debug!(addr = %addr, error = %e, "bootstrap dial failed");
                    }
                    (DialTarget::Peer(peer), Ok(_)) => {
                        trace!(peer = %peer.short(), "connected to discovered peer");
                    }
                    (DialTarget::Peer(peer), Err(e)) => {
                        debug!(peer = %peer.short(), error = %e, "dial to discovered peer failed");
                    }
                }
            }
        }
    }
}
