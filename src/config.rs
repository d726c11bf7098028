//! Node configuration.
//!
//! [`NodeConfig`] is assembled once and handed to [`crate::Node::new`]; the node
//! never mutates it afterwards. Every component keeps its own config type and
//! `DEFAULT_*` constants next to the code that uses them.

use std::time::Duration;

use crate::address::PeerAddress;
use crate::connection::ConnectionConfig;
use crate::dht::DhtConfig;
use crate::discovery::DiscoveryConfig;
use crate::gossipsub::GossipSubConfig;
use crate::mux::MuxConfig;
use crate::ping::PingConfig;
use crate::transport::TransportConfig;

/// Per-request timeout of the DHT protocol.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Default)]
pub struct NodeConfig {
    /// Addresses bound by `start`. Port 0 picks a free port.
    pub listen_addrs: Vec<PeerAddress>,
    /// Bootstrap peers, optionally with a `/p2p/` suffix.
    pub bootstrap: Vec<PeerAddress>,
    pub transports: TransportConfig,
    pub connection: ConnectionConfig,
    pub mux: MuxConfig,
    pub discovery: DiscoveryConfig,
    pub gossip: GossipSubConfig,
    pub dht: DhtConfig,
    pub ping: PingConfig,
    /// `None` uses [`DEFAULT_RPC_TIMEOUT`].
    pub rpc_timeout: Option<Duration>,
}

impl NodeConfig {
    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout.unwrap_or(DEFAULT_RPC_TIMEOUT)
    }
}
