//! Protocol trait definitions for the networking layer.
//!
//! The DHT and gossip engines only talk to remote peers through these traits.
//! [`crate::rpc::NetworkRpc`] implements them over multiplexed streams; the
//! test suites implement them over in-process registries to simulate whole
//! networks without sockets.
//!
//! | Protocol | Trait | Purpose |
//! |----------|-------|---------|
//! | DHT | [`DhtRpc`] | Kademlia routing and provider records |
//! | PubSub | [`GossipRpc`] | One-way gossip control and payload delivery |

use anyhow::Result;
use async_trait::async_trait;

use crate::dht::Key;
use crate::identity::{Contact, PeerId};
use crate::messages::GossipSubRequest;

#[async_trait]
pub trait DhtRpc: Send + Sync + 'static {
    /// Ask `to` for the contacts it knows closest to `target`.
    async fn find_node(&self, to: &Contact, target: PeerId) -> Result<Vec<Contact>>;

    /// Providers `to` stores for `key`, plus contacts closer to `key`.
    async fn get_providers(&self, to: &Contact, key: Key) -> Result<(Vec<Contact>, Vec<Contact>)>;

    async fn add_provider(&self, to: &Contact, key: Key, provider: Contact) -> Result<()>;

    async fn ping(&self, to: &Contact) -> Result<()>;
}

#[async_trait]
pub trait GossipRpc: Send + Sync + 'static {
    async fn send_gossip(&self, to: &PeerId, message: GossipSubRequest) -> Result<()>;
}
