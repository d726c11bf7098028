//! # Wire Protocol Messages
//!
//! Serializable message types for the stream protocols. Each protocol runs on
//! its own multiplexed stream, negotiated by protocol id when the stream opens.
//!
//! | Protocol id | Request | Response |
//! |-------------|---------|----------|
//! | [`KAD_PROTOCOL`] | [`DhtRequest`] | [`DhtResponse`] |
//! | [`GOSSIPSUB_PROTOCOL`] | [`GossipSubRequest`] | (none, one-way) |
//! | [`PING_PROTOCOL`] | 32 random bytes | same bytes echoed |
//!
//! All decoding goes through [`deserialize_bounded`] so a hostile length
//! cannot make us allocate without limit.
//!
//! ## Message IDs
//!
//! Gossip messages are identified by `blake3(source || seqno_be)`. The pair is
//! unique per publisher, which is what dedup needs; identical payloads from two
//! publishes stay distinct messages.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::dht::Key;
use crate::identity::{Contact, PeerId};

pub const KAD_PROTOCOL: &str = "/murmur/kad/1.0.0";
pub const GOSSIPSUB_PROTOCOL: &str = "/murmur/gossipsub/1.0.0";
pub const PING_PROTOCOL: &str = "/murmur/ping/1.0.0";

/// Largest application payload carried by one gossip message.
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization, payload plus framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_VALUE_SIZE as u64) + 4096;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Deserialize with size bounds enforced. Use this instead of raw `bincode::deserialize`.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

// ============================================================================
// DHT
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DhtRequest {
    Ping,
    FindNode { target: PeerId },
    GetProviders { key: Key },
    AddProvider { key: Key, provider: Contact },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DhtResponse {
    Pong,
    Nodes(Vec<Contact>),
    Providers {
        providers: Vec<Contact>,
        closer: Vec<Contact>,
    },
    Ack,
    Error { message: String },
}

// ============================================================================
// Gossip
// ============================================================================

pub type MessageId = [u8; 32];

pub fn message_id(source: &PeerId, seqno: u64) -> MessageId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(source.as_bytes());
    hasher.update(&seqno.to_be_bytes());
    *hasher.finalize().as_bytes()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GossipSubRequest {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    /// Ask the receiver to add us to its mesh for `topic`.
    Graft { topic: String },
    /// Removal from the mesh; the receiver should not re-graft before the backoff.
    Prune {
        topic: String,
        backoff_secs: Option<u64>,
    },
    Publish {
        topic: String,
        msg_id: MessageId,
        source: PeerId,
        seqno: u64,
        data: Vec<u8>,
        /// Empty in permissive mode.
        signature: Vec<u8>,
    },
    IHave {
        topic: String,
        msg_ids: Vec<MessageId>,
    },
    IWant { msg_ids: Vec<MessageId> },
}

impl GossipSubRequest {
    pub fn topic(&self) -> Option<&str> {
        match self {
            GossipSubRequest::Subscribe { topic }
            | GossipSubRequest::Unsubscribe { topic }
            | GossipSubRequest::Graft { topic }
            | GossipSubRequest::Prune { topic, .. }
            | GossipSubRequest::Publish { topic, .. }
            | GossipSubRequest::IHave { topic, .. } => Some(topic),
            GossipSubRequest::IWant { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GossipSubRequest::Subscribe { .. } => "subscribe",
            GossipSubRequest::Unsubscribe { .. } => "unsubscribe",
            GossipSubRequest::Graft { .. } => "graft",
            GossipSubRequest::Prune { .. } => "prune",
            GossipSubRequest::Publish { .. } => "publish",
            GossipSubRequest::IHave { .. } => "ihave",
            GossipSubRequest::IWant { .. } => "iwant",
        }
    }
}

/// A message delivered to local subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub topic: String,
    pub source: PeerId,
    pub seqno: u64,
    pub data: Vec<u8>,
}

/// Bytes covered by a strict-mode publish signature.
pub fn publish_signing_bytes(topic: &str, source: &PeerId, seqno: u64, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + topic.len() + 32 + 8 + data.len());
    out.extend_from_slice(&(topic.len() as u64).to_be_bytes());
    out.extend_from_slice(topic.as_bytes());
    out.extend_from_slice(source.as_bytes());
    out.extend_from_slice(&seqno.to_be_bytes());
    out.extend_from_slice(data);
    out
}
