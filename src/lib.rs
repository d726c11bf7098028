//! # Murmur - Peer-to-Peer Overlay Engine
//!
//! Murmur lets independent processes find each other, establish authenticated
//! encrypted connections, run many logical streams over each connection and
//! exchange data through:
//!
//! - **PubSub**: gossip pubsub with mesh maintenance, lazy IHAVE/IWANT repair and dedup
//! - **DHT**: Kademlia routing, iterative peer lookups and provider records
//! - **Ping**: liveness probes and connection keepalive
//!
//! ## Architecture
//!
//! Every stateful component follows the **Actor Pattern**:
//! - A public handle that is cheap to clone and talks to its actor over channels
//! - A private actor task that owns all mutable state and processes commands in order
//!
//! Connections are built as a pipeline: a [`Transport`] carrier produces a raw
//! byte stream, the secure channel authenticates the remote [`PeerId`] and
//! encrypts every frame, and the multiplexer splits the channel into
//! independent [`Stream`]s tagged with a protocol id.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | Lifecycle and public surface combining all components |
//! | `config` | Immutable node configuration |
//! | `identity` | Ed25519 keypairs, PeerIds, XOR distance, Contacts |
//! | `address` | Multiaddr-style peer addresses |
//! | `crypto` | Domain-separated signatures and session key derivation |
//! | `error` | `NetworkError` taxonomy |
//! | `transport` | TCP, framed WebSocket-style and in-memory carriers |
//! | `secure` | Authenticated X25519 handshake and ChaCha20-Poly1305 framing |
//! | `mux` | Stream multiplexer with per-stream flow control |
//! | `peer_store` | Known peers, address priority and eviction |
//! | `connection` | Connection manager: dialing, accepting, events, protocol routing |
//! | `discovery` | Bootstrap and DHT random-walk discovery |
//! | `gossipsub` | Gossip pubsub |
//! | `dht` | Kademlia DHT |
//! | `ping` | Ping protocol and keepalive |
//! | `protocols` | Protocol trait definitions (DhtRpc, GossipRpc) |
//! | `rpc` | Stream-backed implementation of the protocol traits |
//! | `messages` | Wire types and protocol ids |
//!
//! ## Example
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! let node = murmur::Node::bind("/ip4/0.0.0.0/tcp/0").await?;
//! let mut news = node.subscribe("news").await?;
//! node.publish("news", b"hello".to_vec()).await.ok();
//! while let Some(message) = news.next().await {
//!     println!("{}", String::from_utf8_lossy(&message.data));
//! }
//! # Ok(())
//! # }
//! ```

mod address;
mod config;
mod connection;
mod crypto;
mod dht;
mod discovery;
mod error;
mod gossipsub;
mod identity;
mod messages;
mod mux;
mod node;
mod peer_store;
mod ping;
mod protocols;
mod rpc;
mod secure;
mod transport;

pub use address::{AddressError, Carrier, PeerAddress, Protocol};
pub use config::{NodeConfig, DEFAULT_RPC_TIMEOUT};
pub use connection::{ConnectionConfig, ConnectionManager, InboundStream, PeerEvent, ProtocolRouter};
pub use crypto::SignatureError;
pub use dht::{content_key, DhtConfig, DhtNode, Key, LookupResult};
pub use discovery::{
    run_discovery, DhtDiscovery, DiscoveredPeer, Discovery, DiscoveryConfig, StaticDiscovery,
};
pub use error::NetworkError;
pub use gossipsub::{GossipSub, GossipSubConfig, MessageRejection, Subscription, ValidationMode};
pub use identity::{Contact, Keypair, PeerId};
pub use messages::{
    message_id, DhtRequest, DhtResponse, GossipSubRequest, Message, MessageId,
    GOSSIPSUB_PROTOCOL, KAD_PROTOCOL, PING_PROTOCOL,
};
pub use mux::{Connection, ConnectionInfo, Direction, MuxConfig, Stream};
pub use node::Node;
pub use peer_store::{ConnectionState, MergeOutcome, PeerRecord};
pub use ping::{keepalive, ping, serve_ping, PingConfig};
pub use protocols::{DhtRpc, GossipRpc};
pub use rpc::{serve_dht, serve_gossip, NetworkRpc};
pub use transport::{
    Listener, MemoryHub, MemoryTransport, RawConnection, TcpTransport, Transport,
    TransportConfig, Transports, WsTransport,
};
