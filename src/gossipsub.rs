//! # GossipSub Epidemic Broadcast
//!
//! Topic based publish/subscribe over the `/murmur/gossipsub/1.0.0` protocol.
//!
//! ## Peer Sets
//!
//! For every topic the engine tracks three peer sets:
//!
//! | Set | Purpose | Traffic |
//! |-----|---------|---------|
//! | Subscribers | Every connected peer known to be subscribed | Subscribe / Unsubscribe |
//! | Mesh | Subset we exchange full payloads with (subscribed topics) | Publish |
//! | Fanout | Subset used to publish on a topic we are not subscribed to | Publish |
//!
//! Subscribers outside the mesh are lazy links: each heartbeat they receive
//! the ids of recent messages (`IHave`) and can pull what they missed
//! (`IWant`).
//!
//! ## Mesh Maintenance
//!
//! The heartbeat keeps every mesh within `[mesh_n_low, mesh_n_high]`:
//!
//! 1. **Graft**: below `mesh_n_low`, add subscribers not in prune backoff
//!    until the mesh reaches `mesh_n`
//! 2. **Prune**: above `mesh_n_high`, drop random members down to `mesh_n`
//!    and tell them, with a backoff, so they look elsewhere
//! 3. **Gossip**: send `IHave` with recent ids to up to `gossip_lazy`
//!    subscribers outside the mesh
//!
//! Joining a topic and learning of a new subscriber also graft immediately
//! while the mesh is below `mesh_n`.
//!
//! ## Explicit Peers
//!
//! Explicit peers sit outside mesh maintenance. They are never grafted or
//! pruned, and a Graft from one is answered with Prune. Every publish and
//! forward on a topic also goes to each explicit peer subscribed to it.
//!
//! ## Delivery
//!
//! Each peer has its own writer task draining a bounded queue, so one slow
//! peer never stalls the actor or its neighbours. A send that fails, times
//! out, or finds the queue full prunes that peer from every mesh; it stays a
//! known subscriber and can be grafted again by a later heartbeat.
//!
//! Received messages are deduplicated by [`MessageId`] in a bounded,
//! time-evicted cache, delivered to local subscriptions, and forwarded to the
//! mesh excluding the peer that sent them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use rand::seq::{IteratorRandom, SliceRandom};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::crypto::{sign_with_domain, verify_with_domain, SignatureError, GOSSIPSUB_SIGNATURE_DOMAIN};
use crate::error::NetworkError;
use crate::identity::{Keypair, PeerId};
use crate::messages::{
    message_id, publish_signing_bytes, GossipSubRequest, Message, MessageId, MAX_VALUE_SIZE,
};
use crate::protocols::GossipRpc;

// ============================================================================
// Mesh Parameters
// ============================================================================

/// D - Target number of peers in the mesh per topic.
pub const DEFAULT_MESH_N: usize = 6;

/// D_lo - Minimum mesh size before adding peers.
pub const DEFAULT_MESH_N_LOW: usize = 5;

/// D_hi - Maximum mesh size before pruning.
pub const DEFAULT_MESH_N_HIGH: usize = 12;

/// D_lazy - Number of peers to gossip IHAVE to during heartbeat.
pub const DEFAULT_GOSSIP_LAZY: usize = 6;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of the seen-message cache used for deduplication.
pub const DEFAULT_MESSAGE_CACHE_SIZE: usize = 10_000;

/// How long a message id stays in the dedup cache.
pub const DEFAULT_MESSAGE_CACHE_TTL: Duration = Duration::from_secs(120);

/// Maximum message ids per IHAVE and per IWANT.
pub const DEFAULT_MAX_IHAVE_LENGTH: usize = 100;

/// Default PRUNE backoff duration in seconds.
pub const DEFAULT_PRUNE_BACKOFF_SECS: u64 = 60;

/// Upper bound on a backoff requested by a remote PRUNE.
pub const MAX_PRUNE_BACKOFF_SECS: u64 = 3600;

/// Bound on a single outbound gossip write.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Fanout sets unused for this long are dropped.
pub const DEFAULT_FANOUT_TTL: Duration = Duration::from_secs(60);

/// Buffered messages per [`Subscription`] before delivery drops.
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 1024;

/// Number of heartbeats a message id is advertised in IHAVE.
pub const GOSSIP_HISTORY_HEARTBEATS: u32 = 3;

pub const MAX_TOPIC_LENGTH: usize = 256;

/// Topics tracked from remote subscriptions.
pub const MAX_KNOWN_TOPICS: usize = 10_000;

/// Messages queued towards one peer before it counts as slow.
const PEER_QUEUE_CAPACITY: usize = 256;

/// Total payload bytes kept for IWANT replies.
const MAX_MESSAGE_CACHE_BYTES: usize = 64 * 1024 * 1024;

const MAX_BACKOFF_ENTRIES: usize = 10_000;

const COMMAND_QUEUE: usize = 1024;

pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= MAX_TOPIC_LENGTH
        && topic.chars().all(|c| c.is_ascii_graphic() || c == ' ')
}

/// Signature policy for published messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ValidationMode {
    /// Sign every publish and drop anything unsigned or badly signed.
    #[default]
    Strict,
    /// Neither sign nor check signatures.
    Permissive,
}

#[derive(Clone, Debug)]
pub struct GossipSubConfig {
    /// D - Target number of peers in the mesh per topic.
    pub mesh_n: usize,
    /// D_lo - Minimum mesh peers before grafting more.
    pub mesh_n_low: usize,
    /// D_hi - Maximum mesh peers before pruning excess.
    pub mesh_n_high: usize,
    /// D_lazy - Number of peers to gossip IHave to.
    pub gossip_lazy: usize,
    /// PRUNE backoff duration before re-grafting.
    pub prune_backoff: Duration,
    pub heartbeat_interval: Duration,
    pub message_cache_size: usize,
    pub message_cache_ttl: Duration,
    pub max_ihave_length: usize,
    pub max_message_size: usize,
    pub send_timeout: Duration,
    pub fanout_ttl: Duration,
    pub subscription_buffer: usize,
    pub validation_mode: ValidationMode,
    /// Succeed on publish even when no peer receives the message.
    pub allow_publish_to_zero_peers: bool,
    /// Deliver our own publishes to local subscriptions.
    pub emit_self: bool,
}

impl Default for GossipSubConfig {
    fn default() -> Self {
        Self {
            mesh_n: DEFAULT_MESH_N,
            mesh_n_low: DEFAULT_MESH_N_LOW,
            mesh_n_high: DEFAULT_MESH_N_HIGH,
            gossip_lazy: DEFAULT_GOSSIP_LAZY,
            prune_backoff: Duration::from_secs(DEFAULT_PRUNE_BACKOFF_SECS),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            message_cache_size: DEFAULT_MESSAGE_CACHE_SIZE,
            message_cache_ttl: DEFAULT_MESSAGE_CACHE_TTL,
            max_ihave_length: DEFAULT_MAX_IHAVE_LENGTH,
            max_message_size: MAX_VALUE_SIZE,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            fanout_ttl: DEFAULT_FANOUT_TTL,
            subscription_buffer: DEFAULT_SUBSCRIPTION_BUFFER,
            validation_mode: ValidationMode::Strict,
            allow_publish_to_zero_peers: false,
            emit_self: false,
        }
    }
}

/// Why a local publish or subscribe was refused before touching the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRejection {
    /// Message payload exceeds `GossipSubConfig::max_message_size`.
    MessageTooLarge,
    /// Topic name exceeds `MAX_TOPIC_LENGTH` (256 bytes).
    TopicTooLong,
    /// Topic name contains invalid characters or is empty.
    InvalidTopic,
}

impl std::fmt::Display for MessageRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MessageTooLarge => write!(f, "message size exceeds maximum allowed"),
            Self::TopicTooLong => write!(f, "topic name exceeds maximum length"),
            Self::InvalidTopic => write!(f, "topic name is invalid (empty or contains non-ASCII characters)"),
        }
    }
}

impl std::error::Error for MessageRejection {}

impl From<MessageRejection> for NetworkError {
    fn from(rejection: MessageRejection) -> Self {
        NetworkError::Rejected(rejection.to_string())
    }
}

fn check_topic(topic: &str) -> Result<(), MessageRejection> {
    if topic.len() > MAX_TOPIC_LENGTH {
        return Err(MessageRejection::TopicTooLong);
    }
    if !is_valid_topic(topic) {
        return Err(MessageRejection::InvalidTopic);
    }
    Ok(())
}

// ============================================================================
// Subscription
// ============================================================================

/// Messages received on one topic.
///
/// The sequence ends (`next` returns `None`) when the topic is unsubscribed or
/// the engine stops. Dropping a subscription only stops local delivery; the
/// node stays in the topic until [`GossipSub::unsubscribe`].
pub struct Subscription {
    topic: String,
    rx: mpsc::Receiver<Message>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    Subscribe(String, oneshot::Sender<Result<Subscription, NetworkError>>),
    Unsubscribe(String, oneshot::Sender<()>),
    Publish(String, Vec<u8>, oneshot::Sender<Result<MessageId, NetworkError>>),
    HandleMessage(PeerId, GossipSubRequest, oneshot::Sender<()>),
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    AddExplicitPeer(PeerId),
    RemoveExplicitPeer(PeerId),
    GetExplicitPeers(oneshot::Sender<Vec<PeerId>>),
    GetSubscriptions(oneshot::Sender<Vec<String>>),
    GetMeshPeers(String, oneshot::Sender<Vec<PeerId>>),
    GetTopicPeers(String, oneshot::Sender<Vec<PeerId>>),
    HasMessage(MessageId, oneshot::Sender<bool>),
    Quit,
}

// ============================================================================
// GossipSub Handle (public API - cheap to clone)
// ============================================================================

pub struct GossipSub<N: GossipRpc> {
    cmd_tx: mpsc::Sender<Command>,
    local: PeerId,
    _network: PhantomData<fn() -> N>,
}

impl<N: GossipRpc> Clone for GossipSub<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            local: self.local,
            _network: PhantomData,
        }
    }
}

impl<N: GossipRpc> GossipSub<N> {
    pub fn spawn(keypair: Keypair, network: Arc<N>, config: GossipSubConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let local = keypair.peer_id();
        let actor = GossipSubActor::new(keypair, network, config);
        tokio::spawn(actor.run(cmd_rx));
        Self {
            cmd_tx,
            local,
            _network: PhantomData,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.local
    }

    pub async fn subscribe(&self, topic: &str) -> Result<Subscription, NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe(topic.to_string(), tx))
            .await
            .map_err(|_| NetworkError::NotRunning)?;
        rx.await.map_err(|_| NetworkError::NotRunning)?
    }

    /// Leave `topic`. Every [`Subscription`] on it ends.
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Unsubscribe(topic.to_string(), tx))
            .await
            .map_err(|_| NetworkError::NotRunning)?;
        rx.await.map_err(|_| NetworkError::NotRunning)
    }

    /// Publish `data` on `topic`.
    ///
    /// Fails with [`NetworkError::NoPeers`] when nobody would receive the
    /// message, unless `allow_publish_to_zero_peers` is set.
    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<MessageId, NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish(topic.to_string(), data, tx))
            .await
            .map_err(|_| NetworkError::NotRunning)?;
        rx.await.map_err(|_| NetworkError::NotRunning)?
    }

    /// Handle an incoming gossip message from a peer.
    ///
    /// Returns once the actor has processed it, so a reader feeding messages
    /// from one stream keeps their order.
    pub async fn handle_message(&self, from: PeerId, message: GossipSubRequest) {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::HandleMessage(from, message, tx))
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub async fn peer_connected(&self, peer: PeerId) {
        let _ = self.cmd_tx.send(Command::PeerConnected(peer)).await;
    }

    pub async fn peer_disconnected(&self, peer: PeerId) {
        let _ = self.cmd_tx.send(Command::PeerDisconnected(peer)).await;
    }

    /// Always send full messages to `peer` and keep it out of every mesh.
    pub async fn add_explicit_peer(&self, peer: PeerId) {
        let _ = self.cmd_tx.send(Command::AddExplicitPeer(peer)).await;
    }

    pub async fn remove_explicit_peer(&self, peer: PeerId) {
        let _ = self.cmd_tx.send(Command::RemoveExplicitPeer(peer)).await;
    }

    pub async fn explicit_peers(&self) -> Vec<PeerId> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetExplicitPeers(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetSubscriptions(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn mesh_peers(&self, topic: &str) -> Vec<PeerId> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::GetMeshPeers(topic.to_string(), tx))
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Connected peers known to be subscribed to `topic`.
    pub async fn topic_peers(&self, topic: &str) -> Vec<PeerId> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::GetTopicPeers(topic.to_string(), tx))
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Whether `id` is in the recent-message cache.
    pub async fn has_message(&self, id: &MessageId) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::HasMessage(*id, tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or_default()
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// GossipSub Actor (owns state)
// ============================================================================

struct CachedMessage {
    topic: String,
    source: PeerId,
    seqno: u64,
    data: Vec<u8>,
    signature: Vec<u8>,
    cached_at: Instant,
}

impl CachedMessage {
    fn size_bytes(&self) -> usize {
        self.topic.len() + self.data.len() + self.signature.len() + 64
    }

    fn to_publish(&self, msg_id: MessageId) -> GossipSubRequest {
        GossipSubRequest::Publish {
            topic: self.topic.clone(),
            msg_id,
            source: self.source,
            seqno: self.seqno,
            data: self.data.clone(),
            signature: self.signature.clone(),
        }
    }
}

struct Fanout {
    peers: HashSet<PeerId>,
    last_published: Instant,
}

/// Key for backoff tracking: (peer, topic).
type BackoffKey = (PeerId, String);

struct GossipSubActor<N: GossipRpc> {
    network: Arc<N>,
    keypair: Keypair,
    local: PeerId,
    config: GossipSubConfig,
    seqno: u64,
    /// Connected peers.
    peers: HashSet<PeerId>,
    /// Peers outside mesh maintenance that get every message on their topics.
    explicit_peers: HashSet<PeerId>,
    /// Local subscriptions per topic.
    subscriptions: HashMap<String, Vec<mpsc::Sender<Message>>>,
    /// Remote peers known to be subscribed, per topic.
    topic_peers: HashMap<String, HashSet<PeerId>>,
    mesh: HashMap<String, HashSet<PeerId>>,
    fanout: HashMap<String, Fanout>,
    /// Recent message ids per topic, advertised in IHAVE.
    history: HashMap<String, VecDeque<(MessageId, Instant)>>,
    seen: LruCache<MessageId, Instant>,
    message_cache: LruCache<MessageId, CachedMessage>,
    message_cache_bytes: usize,
    /// (peer, topic) pairs we must not graft before the expiry.
    prune_backoff: LruCache<BackoffKey, Instant>,
    writers: HashMap<PeerId, mpsc::Sender<GossipSubRequest>>,
    failed_tx: mpsc::Sender<PeerId>,
    failed_rx: mpsc::Receiver<PeerId>,
}

impl<N: GossipRpc> GossipSubActor<N> {
    fn new(keypair: Keypair, network: Arc<N>, config: GossipSubConfig) -> Self {
        let cache_size = NonZeroUsize::new(config.message_cache_size)
            .unwrap_or(NonZeroUsize::MIN);
        let backoff_cap = NonZeroUsize::new(MAX_BACKOFF_ENTRIES)
            .expect("MAX_BACKOFF_ENTRIES must be non-zero");
        let (failed_tx, failed_rx) = mpsc::channel(COMMAND_QUEUE);
        let local = keypair.peer_id();

        Self {
            network,
            keypair,
            local,
            config,
            seqno: rand::random(),
            peers: HashSet::new(),
            explicit_peers: HashSet::new(),
            subscriptions: HashMap::new(),
            topic_peers: HashMap::new(),
            mesh: HashMap::new(),
            fanout: HashMap::new(),
            history: HashMap::new(),
            seen: LruCache::new(cache_size),
            message_cache: LruCache::new(cache_size),
            message_cache_bytes: 0,
            prune_backoff: LruCache::new(backoff_cap),
            writers: HashMap::new(),
            failed_tx,
            failed_rx,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut heartbeat_interval = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Subscribe(topic, reply)) => {
                            let _ = reply.send(self.handle_subscribe_cmd(&topic));
                        }
                        Some(Command::Unsubscribe(topic, reply)) => {
                            self.handle_unsubscribe_cmd(&topic);
                            let _ = reply.send(());
                        }
                        Some(Command::Publish(topic, data, reply)) => {
                            let _ = reply.send(self.handle_publish_cmd(&topic, data));
                        }
                        Some(Command::HandleMessage(from, msg, reply)) => {
                            self.handle_message(from, msg);
                            let _ = reply.send(());
                        }
                        Some(Command::PeerConnected(peer)) => {
                            self.handle_peer_connected(peer);
                        }
                        Some(Command::PeerDisconnected(peer)) => {
                            self.handle_peer_disconnected(&peer);
                        }
                        Some(Command::AddExplicitPeer(peer)) => {
                            self.handle_add_explicit_peer(peer);
                        }
                        Some(Command::RemoveExplicitPeer(peer)) => {
                            if self.explicit_peers.remove(&peer) {
                                debug!(peer = %peer.short(), "removed explicit peer");
                            }
                        }
                        Some(Command::GetExplicitPeers(reply)) => {
                            let _ = reply.send(self.explicit_peers.iter().copied().collect());
                        }
                        Some(Command::GetSubscriptions(reply)) => {
                            let _ = reply.send(self.subscriptions.keys().cloned().collect());
                        }
                        Some(Command::GetMeshPeers(topic, reply)) => {
                            let peers = self
                                .mesh
                                .get(&topic)
                                .map(|m| m.iter().copied().collect())
                                .unwrap_or_default();
                            let _ = reply.send(peers);
                        }
                        Some(Command::GetTopicPeers(topic, reply)) => {
                            let peers = self
                                .topic_peers
                                .get(&topic)
                                .map(|m| m.iter().copied().collect())
                                .unwrap_or_default();
                            let _ = reply.send(peers);
                        }
                        Some(Command::HasMessage(id, reply)) => {
                            let _ = reply.send(self.message_cache.contains(&id));
                        }
                        Some(Command::Quit) => {
                            debug!("GossipSub actor quitting");
                            break;
                        }
                        None => {
                            debug!("GossipSub handle dropped, actor quitting");
                            break;
                        }
                    }
                }
                Some(peer) = self.failed_rx.recv() => {
                    self.prune_slow_peer(&peer);
                }
                _ = heartbeat_interval.tick() => {
                    self.heartbeat();
                }
            }
        }
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Queue `message` for `to` without waiting for the write.
    fn send(&mut self, to: PeerId, message: GossipSubRequest) {
        let kind = message.kind();
        let writer = self
            .writers
            .entry(to)
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(PEER_QUEUE_CAPACITY);
                tokio::spawn(peer_writer(
                    self.network.clone(),
                    to,
                    rx,
                    self.config.send_timeout,
                    self.failed_tx.clone(),
                ));
                tx
            });
        match writer.try_send(message) {
            Ok(()) => trace!(peer = %to.short(), kind, "queued gossip message"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(peer = %to.short(), kind, "gossip queue full, pruning slow peer");
                self.prune_slow_peer(&to);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.writers.remove(&to);
            }
        }
    }

    /// Remove `peer` from every mesh and fanout. It stays a known subscriber.
    fn prune_slow_peer(&mut self, peer: &PeerId) {
        let mut pruned = Vec::new();
        for (topic, mesh) in self.mesh.iter_mut() {
            if mesh.remove(peer) {
                pruned.push(topic.clone());
            }
        }
        for fanout in self.fanout.values_mut() {
            fanout.peers.remove(peer);
        }
        let until = backoff_deadline(self.config.prune_backoff);
        for topic in &pruned {
            self.prune_backoff.put((*peer, topic.clone()), until);
        }
        if !pruned.is_empty() {
            debug!(peer = %peer.short(), topics = pruned.len(), "pruned unresponsive peer from mesh");
        }
    }

    // ========================================================================
    // PRUNE Backoff
    // ========================================================================

    fn record_backoff(&mut self, peer: &PeerId, topic: &str, backoff_secs: Option<u64>) {
        let backoff = backoff_secs
            .map(|secs| Duration::from_secs(secs.min(MAX_PRUNE_BACKOFF_SECS)))
            .unwrap_or(self.config.prune_backoff);
        self.prune_backoff
            .put((*peer, topic.to_string()), backoff_deadline(backoff));
        trace!(
            peer = %peer.short(),
            topic = %topic,
            backoff_secs = backoff.as_secs(),
            "recorded PRUNE backoff"
        );
    }

    fn is_in_backoff(&mut self, peer: &PeerId, topic: &str) -> bool {
        let key = (*peer, topic.to_string());
        if let Some(expiry) = self.prune_backoff.get(&key) {
            if Instant::now() < *expiry {
                return true;
            }
            self.prune_backoff.pop(&key);
        }
        false
    }

    fn cleanup_backoff(&mut self) {
        let now = Instant::now();
        let expired: Vec<BackoffKey> = self
            .prune_backoff
            .iter()
            .filter(|(_, expiry)| now >= **expiry)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.prune_backoff.pop(&key);
        }
    }

    /// Subscribers of `topic` outside `exclude` that we may graft now.
    fn graft_candidates(&mut self, topic: &str, exclude: &HashSet<PeerId>) -> Vec<PeerId> {
        let known: Vec<PeerId> = self
            .topic_peers
            .get(topic)
            .map(|peers| {
                peers
                    .iter()
                    .filter(|p| !exclude.contains(p) && !self.explicit_peers.contains(p))
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        let mut candidates: Vec<PeerId> = known
            .into_iter()
            .filter(|p| !self.is_in_backoff(p, topic))
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates
    }

    fn graft(&mut self, topic: &str, peers: Vec<PeerId>) {
        for peer in peers {
            let added = self
                .mesh
                .get_mut(topic)
                .is_some_and(|mesh| mesh.insert(peer));
            if added {
                self.send(peer, GossipSubRequest::Graft { topic: topic.to_string() });
                debug!(peer = %peer.short(), topic = %topic, "grafted peer into mesh");
            }
        }
    }

    // ========================================================================
    // Explicit Peers
    // ========================================================================

    fn handle_add_explicit_peer(&mut self, peer: PeerId) {
        if peer == self.local || !self.explicit_peers.insert(peer) {
            return;
        }
        let mut left = Vec::new();
        for (topic, mesh) in self.mesh.iter_mut() {
            if mesh.remove(&peer) {
                left.push(topic.clone());
            }
        }
        for fanout in self.fanout.values_mut() {
            fanout.peers.remove(&peer);
        }
        for topic in left {
            self.send(peer, GossipSubRequest::Prune { topic, backoff_secs: None });
        }
        debug!(peer = %peer.short(), "added explicit peer");
    }

    /// Explicit peers known to be subscribed to `topic`.
    fn explicit_subscribers(&self, topic: &str) -> Vec<PeerId> {
        self.topic_peers
            .get(topic)
            .map(|subs| {
                subs.iter()
                    .filter(|p| self.explicit_peers.contains(p))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    // ========================================================================
    // Local Commands
    // ========================================================================

    fn handle_subscribe_cmd(&mut self, topic: &str) -> Result<Subscription, NetworkError> {
        check_topic(topic)?;

        let (tx, rx) = mpsc::channel(self.config.subscription_buffer.max(1));
        let first = !self.subscriptions.contains_key(topic);
        self.subscriptions.entry(topic.to_string()).or_default().push(tx);

        if first {
            // Join: start from the fanout set, then top up from subscribers.
            let mut mesh: HashSet<PeerId> = self
                .fanout
                .remove(topic)
                .map(|f| f.peers)
                .unwrap_or_default();
            mesh.retain(|p| self.peers.contains(p) && !self.explicit_peers.contains(p));
            self.mesh.insert(topic.to_string(), HashSet::new());

            let needed = self.config.mesh_n.saturating_sub(mesh.len());
            let extra: Vec<PeerId> = self
                .graft_candidates(topic, &mesh)
                .into_iter()
                .take(needed)
                .collect();
            let members: Vec<PeerId> = mesh.into_iter().chain(extra).collect();

            let announce: Vec<PeerId> = self.peers.iter().copied().collect();
            for peer in announce {
                self.send(peer, GossipSubRequest::Subscribe { topic: topic.to_string() });
            }
            self.graft(topic, members);

            debug!(topic = %topic, "subscribed to topic");
        }

        Ok(Subscription {
            topic: topic.to_string(),
            rx,
        })
    }

    fn handle_unsubscribe_cmd(&mut self, topic: &str) {
        if self.subscriptions.remove(topic).is_none() {
            return;
        }
        self.mesh.remove(topic);
        self.history.remove(topic);

        let announce: Vec<PeerId> = self.peers.iter().copied().collect();
        for peer in announce {
            self.send(peer, GossipSubRequest::Unsubscribe { topic: topic.to_string() });
        }
        debug!(topic = %topic, "unsubscribed from topic");
    }

    fn handle_publish_cmd(&mut self, topic: &str, data: Vec<u8>) -> Result<MessageId, NetworkError> {
        if data.len() > self.config.max_message_size {
            return Err(MessageRejection::MessageTooLarge.into());
        }
        check_topic(topic)?;

        let subscribed = self.subscriptions.contains_key(topic);
        let mut targets: HashSet<PeerId> = if subscribed {
            self.mesh.get(topic).cloned().unwrap_or_default()
        } else {
            self.fanout_peers(topic).into_iter().collect()
        };
        targets.extend(self.explicit_subscribers(topic));

        if targets.is_empty() && !self.config.allow_publish_to_zero_peers {
            debug!(topic = %topic, "publish with no peers");
            return Err(NetworkError::NoPeers);
        }

        self.seqno = self.seqno.wrapping_add(1);
        let seqno = self.seqno;
        let msg_id = message_id(&self.local, seqno);
        let signature = match self.config.validation_mode {
            ValidationMode::Strict => sign_with_domain(
                &self.keypair,
                GOSSIPSUB_SIGNATURE_DOMAIN,
                &publish_signing_bytes(topic, &self.local, seqno, &data),
            ),
            ValidationMode::Permissive => Vec::new(),
        };

        self.seen.put(msg_id, Instant::now());
        let cached = CachedMessage {
            topic: topic.to_string(),
            source: self.local,
            seqno,
            data,
            signature,
            cached_at: Instant::now(),
        };
        let publish = cached.to_publish(msg_id);
        for peer in &targets {
            self.send(*peer, publish.clone());
        }

        if subscribed && self.config.emit_self {
            self.deliver(Message {
                id: msg_id,
                topic: topic.to_string(),
                source: self.local,
                seqno,
                data: cached.data.clone(),
            });
        }
        self.remember(msg_id, cached);

        debug!(
            topic = %topic,
            msg_id = %hex::encode(&msg_id[..8]),
            peers = targets.len(),
            "published message"
        );
        Ok(msg_id)
    }

    /// Fanout peers for an unsubscribed topic, topped up to `mesh_n`.
    fn fanout_peers(&mut self, topic: &str) -> Vec<PeerId> {
        let mut current = self
            .fanout
            .remove(topic)
            .map(|f| f.peers)
            .unwrap_or_default();
        current.retain(|p| {
            self.topic_peers
                .get(topic)
                .is_some_and(|subs| subs.contains(p))
        });
        let needed = self.config.mesh_n.saturating_sub(current.len());
        if needed > 0 {
            let extra: Vec<PeerId> = self
                .graft_candidates(topic, &current)
                .into_iter()
                .take(needed)
                .collect();
            current.extend(extra);
        }
        let peers: Vec<PeerId> = current.iter().copied().collect();
        if !current.is_empty() {
            self.fanout.insert(
                topic.to_string(),
                Fanout {
                    peers: current,
                    last_published: Instant::now(),
                },
            );
        }
        peers
    }

    // ========================================================================
    // Peer Events
    // ========================================================================

    fn handle_peer_connected(&mut self, peer: PeerId) {
        if peer == self.local || !self.peers.insert(peer) {
            return;
        }
        let topics: Vec<String> = self.subscriptions.keys().cloned().collect();
        for topic in topics {
            self.send(peer, GossipSubRequest::Subscribe { topic });
        }
        trace!(peer = %peer.short(), "gossip peer connected");
    }

    fn handle_peer_disconnected(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
        self.writers.remove(peer);
        for subs in self.topic_peers.values_mut() {
            subs.remove(peer);
        }
        self.topic_peers.retain(|_, subs| !subs.is_empty());
        for mesh in self.mesh.values_mut() {
            mesh.remove(peer);
        }
        for fanout in self.fanout.values_mut() {
            fanout.peers.remove(peer);
        }
        trace!(peer = %peer.short(), "gossip peer disconnected");
    }

    // ========================================================================
    // Inbound Messages
    // ========================================================================

    fn handle_message(&mut self, from: PeerId, msg: GossipSubRequest) {
        if from == self.local {
            return;
        }
        if let Some(topic) = msg.topic()
            && !is_valid_topic(topic)
        {
            debug!(peer = %from.short(), "dropping gossip with invalid topic");
            return;
        }
        self.peers.insert(from);

        match msg {
            GossipSubRequest::Subscribe { topic } => self.handle_subscribe(from, topic),
            GossipSubRequest::Unsubscribe { topic } => self.handle_unsubscribe(&from, &topic),
            GossipSubRequest::Graft { topic } => self.handle_graft(from, topic),
            GossipSubRequest::Prune { topic, backoff_secs } => {
                self.handle_prune(&from, &topic, backoff_secs)
            }
            GossipSubRequest::Publish { topic, msg_id, source, seqno, data, signature } => {
                self.handle_publish(from, topic, msg_id, source, seqno, data, signature)
            }
            GossipSubRequest::IHave { topic, msg_ids } => self.handle_ihave(from, &topic, msg_ids),
            GossipSubRequest::IWant { msg_ids } => self.handle_iwant(from, msg_ids),
        }
    }

    fn handle_subscribe(&mut self, from: PeerId, topic: String) {
        if !self.topic_peers.contains_key(&topic) && self.topic_peers.len() >= MAX_KNOWN_TOPICS {
            debug!(peer = %from.short(), topic = %topic, "known topic limit reached");
            return;
        }
        let inserted = self.topic_peers.entry(topic.clone()).or_default().insert(from);
        if !inserted {
            return;
        }
        trace!(peer = %from.short(), topic = %topic, "peer subscribed");

        let under_target = self
            .mesh
            .get(&topic)
            .is_some_and(|mesh| mesh.len() < self.config.mesh_n);
        if under_target && !self.explicit_peers.contains(&from) && !self.is_in_backoff(&from, &topic) {
            self.graft(&topic, vec![from]);
        }
    }

    fn handle_unsubscribe(&mut self, from: &PeerId, topic: &str) {
        if let Some(subs) = self.topic_peers.get_mut(topic) {
            subs.remove(from);
            if subs.is_empty() {
                self.topic_peers.remove(topic);
            }
        }
        if let Some(mesh) = self.mesh.get_mut(topic) {
            mesh.remove(from);
        }
        if let Some(fanout) = self.fanout.get_mut(topic) {
            fanout.peers.remove(from);
        }
        trace!(peer = %from.short(), topic = %topic, "peer unsubscribed");
    }

    fn handle_graft(&mut self, from: PeerId, topic: String) {
        let backoff_secs = Some(self.config.prune_backoff.as_secs());
        if !self.subscriptions.contains_key(&topic)
            || self.explicit_peers.contains(&from)
            || self.is_in_backoff(&from, &topic)
        {
            self.send(from, GossipSubRequest::Prune { topic, backoff_secs });
            return;
        }
        self.topic_peers.entry(topic.clone()).or_default().insert(from);
        if let Some(mesh) = self.mesh.get_mut(&topic)
            && mesh.insert(from)
        {
            debug!(peer = %from.short(), topic = %topic, "peer grafted us");
        }
    }

    fn handle_prune(&mut self, from: &PeerId, topic: &str, backoff_secs: Option<u64>) {
        if let Some(mesh) = self.mesh.get_mut(topic) {
            mesh.remove(from);
        }
        self.record_backoff(from, topic, backoff_secs);
        debug!(peer = %from.short(), topic = %topic, "pruned by peer");
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_publish(
        &mut self,
        from: PeerId,
        topic: String,
        msg_id: MessageId,
        source: PeerId,
        seqno: u64,
        data: Vec<u8>,
        signature: Vec<u8>,
    ) {
        if self.seen.contains(&msg_id) {
            trace!(msg_id = %hex::encode(&msg_id[..8]), from = %from.short(), "duplicate message");
            return;
        }
        if data.len() > self.config.max_message_size {
            debug!(from = %from.short(), "rejecting oversized message");
            return;
        }
        if msg_id != message_id(&source, seqno) {
            debug!(from = %from.short(), "rejecting message with mismatched id");
            return;
        }
        if let Err(e) = self.validate_signature(&topic, &source, seqno, &data, &signature) {
            debug!(from = %from.short(), error = %e, "rejecting message with invalid signature");
            return;
        }

        self.seen.put(msg_id, Instant::now());
        let cached = CachedMessage {
            topic: topic.clone(),
            source,
            seqno,
            data,
            signature,
            cached_at: Instant::now(),
        };

        if self.subscriptions.contains_key(&topic) {
            self.deliver(Message {
                id: msg_id,
                topic: topic.clone(),
                source,
                seqno,
                data: cached.data.clone(),
            });

            let mut forward: HashSet<PeerId> = self.mesh.get(&topic).cloned().unwrap_or_default();
            forward.extend(self.explicit_subscribers(&topic));
            forward.retain(|p| *p != from && *p != source);
            if !forward.is_empty() {
                let publish = cached.to_publish(msg_id);
                for peer in &forward {
                    self.send(*peer, publish.clone());
                }
            }
            trace!(
                msg_id = %hex::encode(&msg_id[..8]),
                topic = %topic,
                forwarded = forward.len(),
                "handled publish"
            );
        }
        self.remember(msg_id, cached);
    }

    fn validate_signature(
        &self,
        topic: &str,
        source: &PeerId,
        seqno: u64,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), SignatureError> {
        match self.config.validation_mode {
            ValidationMode::Permissive => Ok(()),
            ValidationMode::Strict => verify_with_domain(
                source,
                GOSSIPSUB_SIGNATURE_DOMAIN,
                &publish_signing_bytes(topic, source, seqno, data),
                signature,
            ),
        }
    }

    fn handle_ihave(&mut self, from: PeerId, topic: &str, msg_ids: Vec<MessageId>) {
        if !self.subscriptions.contains_key(topic) {
            return;
        }
        let missing: Vec<MessageId> = msg_ids
            .into_iter()
            .take(self.config.max_ihave_length)
            .filter(|id| !self.seen.contains(id))
            .collect();
        if missing.is_empty() {
            return;
        }
        debug!(from = %from.short(), topic = %topic, missing = missing.len(), "requesting missed messages");
        self.send(from, GossipSubRequest::IWant { msg_ids: missing });
    }

    fn handle_iwant(&mut self, from: PeerId, msg_ids: Vec<MessageId>) {
        let replies: Vec<GossipSubRequest> = msg_ids
            .into_iter()
            .take(self.config.max_ihave_length)
            .filter_map(|id| self.message_cache.peek(&id).map(|m| m.to_publish(id)))
            .collect();
        for reply in replies {
            self.send(from, reply);
        }
    }

    // ========================================================================
    // Caches
    // ========================================================================

    fn deliver(&mut self, message: Message) {
        let Some(subscribers) = self.subscriptions.get_mut(&message.topic) else {
            return;
        };
        subscribers.retain(|tx| !tx.is_closed());
        for tx in subscribers.iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(message.clone()) {
                warn!(topic = %message.topic, "subscription buffer full, dropping message");
            }
        }
    }

    fn remember(&mut self, msg_id: MessageId, message: CachedMessage) {
        let size = message.size_bytes();
        while self.message_cache_bytes + size > MAX_MESSAGE_CACHE_BYTES {
            match self.message_cache.pop_lru() {
                Some((_, evicted)) => {
                    self.message_cache_bytes =
                        self.message_cache_bytes.saturating_sub(evicted.size_bytes());
                }
                None => break,
            }
        }

        let history = self.history.entry(message.topic.clone()).or_default();
        history.push_back((msg_id, message.cached_at));
        while history.len() > self.config.max_ihave_length {
            history.pop_front();
        }

        if let Some((_, evicted)) = self.message_cache.push(msg_id, message) {
            self.message_cache_bytes = self.message_cache_bytes.saturating_sub(evicted.size_bytes());
        }
        self.message_cache_bytes = self.message_cache_bytes.saturating_add(size);
    }

    fn expire_caches(&mut self) {
        let ttl = self.config.message_cache_ttl;
        while let Some((_, seen_at)) = self.seen.peek_lru() {
            if seen_at.elapsed() < ttl {
                break;
            }
            self.seen.pop_lru();
        }
        while let Some((_, cached)) = self.message_cache.peek_lru() {
            if cached.cached_at.elapsed() < ttl {
                break;
            }
            if let Some((_, evicted)) = self.message_cache.pop_lru() {
                self.message_cache_bytes =
                    self.message_cache_bytes.saturating_sub(evicted.size_bytes());
            }
        }

        let window = self.config.heartbeat_interval * GOSSIP_HISTORY_HEARTBEATS;
        for history in self.history.values_mut() {
            while history.front().is_some_and(|(_, at)| at.elapsed() >= window) {
                history.pop_front();
            }
        }
        self.history.retain(|_, h| !h.is_empty());
    }

    // ========================================================================
    // Heartbeat
    // ========================================================================

    fn heartbeat(&mut self) {
        self.expire_caches();
        self.cleanup_backoff();

        let topics: Vec<String> = self.mesh.keys().cloned().collect();
        for topic in topics {
            self.maintain_mesh(&topic);
            self.emit_gossip(&topic);
        }

        let fanout_ttl = self.config.fanout_ttl;
        self.fanout
            .retain(|_, f| f.last_published.elapsed() < fanout_ttl && !f.peers.is_empty());
    }

    fn maintain_mesh(&mut self, topic: &str) {
        let Some(mut mesh) = self.mesh.remove(topic) else {
            return;
        };
        let subscribers = self.topic_peers.get(topic).cloned().unwrap_or_default();
        mesh.retain(|p| subscribers.contains(p));

        if mesh.len() < self.config.mesh_n_low {
            let needed = self.config.mesh_n.saturating_sub(mesh.len());
            let extra: Vec<PeerId> = self
                .graft_candidates(topic, &mesh)
                .into_iter()
                .take(needed)
                .collect();
            self.mesh.insert(topic.to_string(), mesh);
            if !extra.is_empty() {
                debug!(topic = %topic, grafting = extra.len(), "mesh below low watermark");
            }
            self.graft(topic, extra);
            return;
        }

        if mesh.len() > self.config.mesh_n_high {
            let excess = mesh.len() - self.config.mesh_n;
            let victims: Vec<PeerId> = mesh
                .iter()
                .copied()
                .choose_multiple(&mut rand::thread_rng(), excess);
            let backoff_secs = Some(self.config.prune_backoff.as_secs());
            for peer in &victims {
                mesh.remove(peer);
                self.record_backoff(peer, topic, backoff_secs);
                self.send(
                    *peer,
                    GossipSubRequest::Prune {
                        topic: topic.to_string(),
                        backoff_secs,
                    },
                );
            }
            debug!(topic = %topic, pruned = victims.len(), "mesh above high watermark");
        }
        self.mesh.insert(topic.to_string(), mesh);
    }

    /// Advertise recent ids to subscribers outside the mesh.
    fn emit_gossip(&mut self, topic: &str) {
        let ids: Vec<MessageId> = match self.history.get(topic) {
            Some(history) if !history.is_empty() => history
                .iter()
                .rev()
                .take(self.config.max_ihave_length)
                .map(|(id, _)| *id)
                .collect(),
            _ => return,
        };
        let mesh = self.mesh.get(topic);
        let lazy: Vec<PeerId> = self
            .topic_peers
            .get(topic)
            .map(|subs| {
                subs.iter()
                    .filter(|p| !mesh.is_some_and(|m| m.contains(p)))
                    .filter(|p| !self.explicit_peers.contains(p))
                    .copied()
                    .choose_multiple(&mut rand::thread_rng(), self.config.gossip_lazy)
            })
            .unwrap_or_default();
        for peer in lazy {
            self.send(
                peer,
                GossipSubRequest::IHave {
                    topic: topic.to_string(),
                    msg_ids: ids.clone(),
                },
            );
        }
    }
}

fn backoff_deadline(backoff: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(backoff)
        .unwrap_or_else(|| now + Duration::from_secs(MAX_PRUNE_BACKOFF_SECS))
}

/// Drains one peer's queue in order, reporting failed or slow writes.
async fn peer_writer<N: GossipRpc>(
    network: Arc<N>,
    peer: PeerId,
    mut rx: mpsc::Receiver<GossipSubRequest>,
    send_timeout: Duration,
    failed_tx: mpsc::Sender<PeerId>,
) {
    while let Some(message) = rx.recv().await {
        let kind = message.kind();
        match tokio::time::timeout(send_timeout, network.send_gossip(&peer, message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(peer = %peer.short(), kind, error = %e, "gossip send failed");
                let _ = failed_tx.send(peer).await;
            }
            Err(_) => {
                debug!(peer = %peer.short(), kind, "gossip send timed out");
                let _ = failed_tx.send(peer).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use tokio::sync::{Mutex, RwLock};
    use tokio::time::{sleep, timeout};

    #[derive(Default)]
    struct NetworkRegistry {
        nodes: RwLock<HashMap<PeerId, GossipSub<TestNetwork>>>,
        stalled: Mutex<HashSet<PeerId>>,
        /// Every (from, to, message) handed to the network.
        sent: Mutex<Vec<(PeerId, PeerId, GossipSubRequest)>>,
    }

    struct TestNetwork {
        local: PeerId,
        registry: Arc<NetworkRegistry>,
    }

    #[async_trait::async_trait]
    impl GossipRpc for TestNetwork {
        async fn send_gossip(&self, to: &PeerId, message: GossipSubRequest) -> anyhow::Result<()> {
            self.registry.sent.lock().await.push((self.local, *to, message.clone()));
            if self.registry.stalled.lock().await.contains(to) {
                std::future::pending::<()>().await;
            }
            let node = self
                .registry
                .nodes
                .read()
                .await
                .get(to)
                .cloned()
                .ok_or_else(|| anyhow!("peer not reachable"))?;
            node.handle_message(self.local, message).await;
            Ok(())
        }
    }

    fn test_config() -> GossipSubConfig {
        GossipSubConfig {
            heartbeat_interval: Duration::from_millis(50),
            send_timeout: Duration::from_millis(200),
            ..GossipSubConfig::default()
        }
    }

    async fn spawn_node(registry: &Arc<NetworkRegistry>, config: GossipSubConfig) -> GossipSub<TestNetwork> {
        let keypair = Keypair::generate();
        let network = Arc::new(TestNetwork {
            local: keypair.peer_id(),
            registry: registry.clone(),
        });
        let node = GossipSub::spawn(keypair, network, config);
        registry.nodes.write().await.insert(node.peer_id(), node.clone());
        node
    }

    async fn connect(a: &GossipSub<TestNetwork>, b: &GossipSub<TestNetwork>) {
        a.peer_connected(b.peer_id()).await;
        b.peer_connected(a.peer_id()).await;
    }

    async fn wait_for_mesh(node: &GossipSub<TestNetwork>, topic: &str, size: usize) {
        timeout(Duration::from_secs(5), async {
            while node.mesh_peers(topic).await.len() < size {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("mesh did not form");
    }

    async fn expect_message(sub: &mut Subscription) -> Message {
        timeout(Duration::from_secs(5), sub.next())
            .await
            .expect("timed out waiting for message")
            .expect("subscription closed")
    }

    async fn expect_silence(sub: &mut Subscription) {
        assert!(timeout(Duration::from_millis(200), sub.next()).await.is_err());
    }

    async fn wait_for_sent<F>(registry: &Arc<NetworkRegistry>, from: PeerId, to: PeerId, want: F)
    where
        F: Fn(&GossipSubRequest) -> bool,
    {
        timeout(Duration::from_secs(5), async {
            loop {
                let found = registry
                    .sent
                    .lock()
                    .await
                    .iter()
                    .any(|(f, t, m)| *f == from && *t == to && want(m));
                if found {
                    return;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("expected message was never sent");
    }

    async fn wait_for_topic_peer(node: &GossipSub<TestNetwork>, topic: &str, peer: PeerId) {
        timeout(Duration::from_secs(5), async {
            while !node.topic_peers(topic).await.contains(&peer) {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscription never announced");
    }

    fn prune(topic: &str, backoff_secs: Option<u64>) -> GossipSubRequest {
        GossipSubRequest::Prune {
            topic: topic.to_string(),
            backoff_secs,
        }
    }

    fn graft(topic: &str) -> GossipSubRequest {
        GossipSubRequest::Graft {
            topic: topic.to_string(),
        }
    }

    #[test]
    fn config_defaults_are_consistent() {
        let config = GossipSubConfig::default();
        assert!(config.mesh_n_low <= config.mesh_n);
        assert!(config.mesh_n <= config.mesh_n_high);
        assert_eq!(config.validation_mode, ValidationMode::Strict);
        assert!(!config.allow_publish_to_zero_peers);
        assert!(!config.emit_self);
    }

    #[test]
    fn topic_validation() {
        assert!(is_valid_topic("news"));
        assert!(is_valid_topic("chat room"));
        assert!(!is_valid_topic(""));
        assert!(!is_valid_topic("tab\there"));
        assert!(!is_valid_topic("caf\u{e9}"));
        assert_eq!(check_topic(&"x".repeat(MAX_TOPIC_LENGTH + 1)), Err(MessageRejection::TopicTooLong));
    }

    #[tokio::test]
    async fn publish_reaches_subscribed_peer() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = spawn_node(&registry, test_config()).await;
        let b = spawn_node(&registry, test_config()).await;

        let mut sub_a = a.subscribe("news").await.unwrap();
        let mut sub_b = b.subscribe("news").await.unwrap();
        connect(&a, &b).await;
        wait_for_mesh(&a, "news", 1).await;

        let id = a.publish("news", b"hello".to_vec()).await.unwrap();
        let message = expect_message(&mut sub_b).await;
        assert_eq!(message.id, id);
        assert_eq!(message.data, b"hello");
        assert_eq!(message.source, a.peer_id());
        assert_eq!(message.topic, "news");

        // Publishers do not hear themselves by default.
        expect_silence(&mut sub_a).await;
    }

    #[tokio::test]
    async fn publish_without_peers() {
        let registry = Arc::new(NetworkRegistry::default());
        let strict = spawn_node(&registry, test_config()).await;
        let _sub = strict.subscribe("news").await.unwrap();
        assert_eq!(
            strict.publish("news", b"x".to_vec()).await,
            Err(NetworkError::NoPeers)
        );

        let lenient = spawn_node(
            &registry,
            GossipSubConfig {
                allow_publish_to_zero_peers: true,
                emit_self: true,
                ..test_config()
            },
        )
        .await;
        let mut sub = lenient.subscribe("news").await.unwrap();
        let id = lenient.publish("news", b"x".to_vec()).await.unwrap();
        assert!(lenient.has_message(&id).await);
        assert_eq!(expect_message(&mut sub).await.id, id);
    }

    #[tokio::test]
    async fn publish_rejects_invalid_input() {
        let registry = Arc::new(NetworkRegistry::default());
        let node = spawn_node(
            &registry,
            GossipSubConfig {
                max_message_size: 4,
                allow_publish_to_zero_peers: true,
                ..test_config()
            },
        )
        .await;
        assert!(matches!(
            node.publish("news", vec![0; 5]).await,
            Err(NetworkError::Rejected(_))
        ));
        assert!(matches!(node.publish("", vec![]).await, Err(NetworkError::Rejected(_))));
        assert!(node.subscribe("bad\ntopic").await.is_err());
    }

    #[tokio::test]
    async fn messages_are_forwarded_and_deduplicated() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = spawn_node(&registry, test_config()).await;
        let b = spawn_node(&registry, test_config()).await;
        let c = spawn_node(&registry, test_config()).await;

        let _sub_a = a.subscribe("news").await.unwrap();
        let mut sub_b = b.subscribe("news").await.unwrap();
        let mut sub_c = c.subscribe("news").await.unwrap();

        // Triangle: c hears every message twice, via a and via b.
        connect(&a, &b).await;
        connect(&b, &c).await;
        connect(&a, &c).await;
        wait_for_mesh(&a, "news", 2).await;
        wait_for_mesh(&b, "news", 2).await;

        a.publish("news", b"once".to_vec()).await.unwrap();
        assert_eq!(expect_message(&mut sub_b).await.data, b"once");
        assert_eq!(expect_message(&mut sub_c).await.data, b"once");
        expect_silence(&mut sub_c).await;
        expect_silence(&mut sub_b).await;
    }

    #[tokio::test]
    async fn messages_travel_multiple_hops() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = spawn_node(&registry, test_config()).await;
        let b = spawn_node(&registry, test_config()).await;
        let c = spawn_node(&registry, test_config()).await;

        let _sub_a = a.subscribe("news").await.unwrap();
        let _sub_b = b.subscribe("news").await.unwrap();
        let mut sub_c = c.subscribe("news").await.unwrap();

        connect(&a, &b).await;
        connect(&b, &c).await;
        wait_for_mesh(&b, "news", 2).await;
        wait_for_mesh(&a, "news", 1).await;

        a.publish("news", b"relayed".to_vec()).await.unwrap();
        let message = expect_message(&mut sub_c).await;
        assert_eq!(message.source, a.peer_id());
        assert_eq!(message.data, b"relayed");
    }

    #[tokio::test]
    async fn fanout_publish_to_unsubscribed_topic() {
        let registry = Arc::new(NetworkRegistry::default());
        let publisher = spawn_node(&registry, test_config()).await;
        let listener = spawn_node(&registry, test_config()).await;

        let mut sub = listener.subscribe("alerts").await.unwrap();
        connect(&publisher, &listener).await;
        timeout(Duration::from_secs(5), async {
            while publisher.topic_peers("alerts").await.is_empty() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        publisher.publish("alerts", b"fire".to_vec()).await.unwrap();
        assert_eq!(expect_message(&mut sub).await.data, b"fire");
        assert!(publisher.mesh_peers("alerts").await.is_empty());
    }

    #[tokio::test]
    async fn strict_mode_drops_forged_messages() {
        let registry = Arc::new(NetworkRegistry::default());
        let node = spawn_node(&registry, test_config()).await;
        let mut sub = node.subscribe("news").await.unwrap();

        let honest = Keypair::generate();
        let forger = Keypair::generate().peer_id();
        let source = honest.peer_id();
        let seqno = 7;
        let data = b"payload".to_vec();
        let good_sig = sign_with_domain(
            &honest,
            GOSSIPSUB_SIGNATURE_DOMAIN,
            &publish_signing_bytes("news", &source, seqno, &data),
        );

        // Tampered payload under an honest signature.
        node.handle_message(
            forger,
            GossipSubRequest::Publish {
                topic: "news".into(),
                msg_id: message_id(&source, seqno),
                source,
                seqno,
                data: b"tampered".to_vec(),
                signature: good_sig.clone(),
            },
        )
        .await;
        // Unsigned.
        node.handle_message(
            forger,
            GossipSubRequest::Publish {
                topic: "news".into(),
                msg_id: message_id(&source, seqno),
                source,
                seqno,
                data: data.clone(),
                signature: Vec::new(),
            },
        )
        .await;
        expect_silence(&mut sub).await;

        // The forged copies must not poison the dedup cache.
        node.handle_message(
            forger,
            GossipSubRequest::Publish {
                topic: "news".into(),
                msg_id: message_id(&source, seqno),
                source,
                seqno,
                data: data.clone(),
                signature: good_sig,
            },
        )
        .await;
        assert_eq!(expect_message(&mut sub).await.data, data);
    }

    #[tokio::test]
    async fn permissive_mode_accepts_unsigned() {
        let registry = Arc::new(NetworkRegistry::default());
        let node = spawn_node(
            &registry,
            GossipSubConfig {
                validation_mode: ValidationMode::Permissive,
                ..test_config()
            },
        )
        .await;
        let mut sub = node.subscribe("news").await.unwrap();
        let source = Keypair::generate().peer_id();
        node.handle_message(
            source,
            GossipSubRequest::Publish {
                topic: "news".into(),
                msg_id: message_id(&source, 1),
                source,
                seqno: 1,
                data: b"open".to_vec(),
                signature: Vec::new(),
            },
        )
        .await;
        assert_eq!(expect_message(&mut sub).await.data, b"open");
    }

    #[tokio::test]
    async fn slow_peer_is_pruned_not_publisher() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = spawn_node(&registry, test_config()).await;
        let fast = spawn_node(&registry, test_config()).await;
        let slow = spawn_node(&registry, test_config()).await;

        let _sub_a = a.subscribe("news").await.unwrap();
        let mut sub_fast = fast.subscribe("news").await.unwrap();
        let _sub_slow = slow.subscribe("news").await.unwrap();
        connect(&a, &fast).await;
        connect(&a, &slow).await;
        wait_for_mesh(&a, "news", 2).await;

        registry.stalled.lock().await.insert(slow.peer_id());
        a.publish("news", b"m".to_vec()).await.unwrap();
        assert_eq!(expect_message(&mut sub_fast).await.data, b"m");

        timeout(Duration::from_secs(5), async {
            while a.mesh_peers("news").await.contains(&slow.peer_id()) {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("slow peer was not pruned");
        assert!(a.mesh_peers("news").await.contains(&fast.peer_id()));
        // Still a known subscriber.
        assert!(a.topic_peers("news").await.contains(&slow.peer_id()));
    }

    #[tokio::test]
    async fn ihave_iwant_repairs_missed_message() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = spawn_node(
            &registry,
            GossipSubConfig {
                allow_publish_to_zero_peers: true,
                ..test_config()
            },
        )
        .await;
        let b = spawn_node(&registry, test_config()).await;

        let _sub_a = a.subscribe("news").await.unwrap();
        let id = a.publish("news", b"missed".to_vec()).await.unwrap();

        let mut sub_b = b.subscribe("news").await.unwrap();
        b.handle_message(
            a.peer_id(),
            GossipSubRequest::IHave {
                topic: "news".into(),
                msg_ids: vec![id],
            },
        )
        .await;

        let message = expect_message(&mut sub_b).await;
        assert_eq!(message.id, id);
        assert_eq!(message.data, b"missed");
    }

    #[tokio::test]
    async fn heartbeat_trims_oversized_mesh() {
        let registry = Arc::new(NetworkRegistry::default());
        let small = GossipSubConfig {
            mesh_n: 2,
            mesh_n_low: 1,
            mesh_n_high: 3,
            ..test_config()
        };
        let hub = spawn_node(&registry, small.clone()).await;
        let _hub_sub = hub.subscribe("news").await.unwrap();

        let mut spokes = Vec::new();
        for _ in 0..5 {
            let spoke = spawn_node(&registry, small.clone()).await;
            let sub = spoke.subscribe("news").await.unwrap();
            connect(&hub, &spoke).await;
            spokes.push((spoke, sub));
        }

        timeout(Duration::from_secs(5), async {
            while hub.topic_peers("news").await.len() < spokes.len() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        // Every spoke grafts the hub; let a few heartbeats trim the excess.
        sleep(Duration::from_millis(500)).await;

        let size = hub.mesh_peers("news").await.len();
        assert!((small.mesh_n_low..=small.mesh_n_high).contains(&size), "mesh size {}", size);
        let mut grafted = 0;
        let mut pruned = 0;
        for (spoke, _) in &spokes {
            match spoke.mesh_peers("news").await.len() {
                0 => pruned += 1,
                n => grafted += n,
            }
        }
        assert_eq!(grafted, size);
        assert!(pruned >= spokes.len() - small.mesh_n_high);
    }

    #[tokio::test]
    async fn unsubscribe_ends_subscription_and_leaves_mesh() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = spawn_node(&registry, test_config()).await;
        let b = spawn_node(&registry, test_config()).await;

        let mut sub_a = a.subscribe("news").await.unwrap();
        let _sub_b = b.subscribe("news").await.unwrap();
        connect(&a, &b).await;
        wait_for_mesh(&b, "news", 1).await;

        a.unsubscribe("news").await.unwrap();
        assert!(timeout(Duration::from_secs(1), sub_a.next()).await.unwrap().is_none());
        assert!(a.subscriptions().await.is_empty());

        timeout(Duration::from_secs(5), async {
            while !b.mesh_peers("news").await.is_empty() || !b.topic_peers("news").await.is_empty() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("peer kept us in its mesh");
    }

    #[tokio::test]
    async fn disconnect_forgets_peer() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = spawn_node(&registry, test_config()).await;
        let b = spawn_node(&registry, test_config()).await;
        let _sub_a = a.subscribe("news").await.unwrap();
        let _sub_b = b.subscribe("news").await.unwrap();
        connect(&a, &b).await;
        wait_for_mesh(&a, "news", 1).await;
        wait_for_mesh(&b, "news", 1).await;
        sleep(Duration::from_millis(100)).await;

        a.peer_disconnected(b.peer_id()).await;
        assert!(a.mesh_peers("news").await.is_empty());
        assert!(a.topic_peers("news").await.is_empty());
    }

    #[test]
    fn backoff_deadline_saturates() {
        let before = Instant::now();
        let until = backoff_deadline(Duration::MAX);
        assert!(until > before);
        assert!(until <= Instant::now() + Duration::from_secs(MAX_PRUNE_BACKOFF_SECS));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_prune_backoff_is_capped() {
        let registry = Arc::new(NetworkRegistry::default());
        let node = spawn_node(
            &registry,
            GossipSubConfig {
                allow_publish_to_zero_peers: true,
                ..test_config()
            },
        )
        .await;
        let _sub = node.subscribe("news").await.unwrap();
        let remote = spawn_node(&registry, test_config()).await.peer_id();

        node.handle_message(remote, prune("news", Some(u64::MAX))).await;

        // The actor survives a hostile backoff.
        assert!(node.subscribe("other").await.is_ok());
        assert!(node.publish("news", b"alive".to_vec()).await.is_ok());

        node.handle_message(remote, graft("news")).await;
        assert!(!node.mesh_peers("news").await.contains(&remote));

        tokio::time::advance(Duration::from_secs(MAX_PRUNE_BACKOFF_SECS + 1)).await;
        node.handle_message(remote, graft("news")).await;
        assert!(node.mesh_peers("news").await.contains(&remote));
    }

    #[tokio::test]
    async fn graft_during_backoff_is_answered_with_prune() {
        let registry = Arc::new(NetworkRegistry::default());
        let node = spawn_node(&registry, test_config()).await;
        let _sub = node.subscribe("news").await.unwrap();
        let remote = Keypair::generate().peer_id();

        node.handle_message(remote, prune("news", Some(60))).await;
        node.handle_message(remote, graft("news")).await;

        wait_for_sent(&registry, node.peer_id(), remote, |m| {
            matches!(m, GossipSubRequest::Prune { topic, backoff_secs: Some(_) } if topic == "news")
        })
        .await;
        assert!(node.mesh_peers("news").await.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_regrafts_once_backoff_expires() {
        let registry = Arc::new(NetworkRegistry::default());
        let config = GossipSubConfig {
            prune_backoff: Duration::from_millis(500),
            ..test_config()
        };
        let a = spawn_node(&registry, config.clone()).await;
        let b = spawn_node(&registry, config).await;
        let _sub_a = a.subscribe("news").await.unwrap();
        let _sub_b = b.subscribe("news").await.unwrap();
        connect(&a, &b).await;
        wait_for_mesh(&a, "news", 1).await;

        a.handle_message(b.peer_id(), prune("news", None)).await;
        assert!(a.mesh_peers("news").await.is_empty());

        // Several heartbeats pass inside the backoff window.
        sleep(Duration::from_millis(150)).await;
        assert!(a.mesh_peers("news").await.is_empty());

        wait_for_mesh(&a, "news", 1).await;
        assert_eq!(a.mesh_peers("news").await, vec![b.peer_id()]);
    }

    #[tokio::test]
    async fn explicit_peer_receives_publish_outside_mesh() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = spawn_node(&registry, test_config()).await;
        let b = spawn_node(&registry, test_config()).await;

        a.add_explicit_peer(b.peer_id()).await;
        a.add_explicit_peer(a.peer_id()).await;
        assert_eq!(a.explicit_peers().await, vec![b.peer_id()]);

        let _sub_a = a.subscribe("news").await.unwrap();
        let mut sub_b = b.subscribe("news").await.unwrap();
        connect(&a, &b).await;
        wait_for_topic_peer(&a, "news", b.peer_id()).await;

        let id = a.publish("news", b"direct".to_vec()).await.unwrap();
        assert_eq!(expect_message(&mut sub_b).await.id, id);
        assert!(a.mesh_peers("news").await.is_empty());

        // A graft from an explicit peer is refused.
        a.handle_message(b.peer_id(), graft("news")).await;
        wait_for_sent(&registry, a.peer_id(), b.peer_id(), |m| {
            matches!(m, GossipSubRequest::Prune { topic, .. } if topic == "news")
        })
        .await;
        assert!(a.mesh_peers("news").await.is_empty());

        a.remove_explicit_peer(b.peer_id()).await;
        assert!(a.explicit_peers().await.is_empty());
    }

    #[tokio::test]
    async fn explicit_peer_receives_forwarded_messages() {
        let registry = Arc::new(NetworkRegistry::default());
        let relay = spawn_node(&registry, test_config()).await;
        let origin = spawn_node(&registry, test_config()).await;
        let direct = spawn_node(&registry, test_config()).await;

        relay.add_explicit_peer(direct.peer_id()).await;
        let _sub_relay = relay.subscribe("news").await.unwrap();
        let _sub_origin = origin.subscribe("news").await.unwrap();
        let mut sub_direct = direct.subscribe("news").await.unwrap();
        connect(&relay, &origin).await;
        connect(&relay, &direct).await;
        wait_for_mesh(&origin, "news", 1).await;
        wait_for_topic_peer(&relay, "news", direct.peer_id()).await;

        origin.publish("news", b"relayed".to_vec()).await.unwrap();
        let message = expect_message(&mut sub_direct).await;
        assert_eq!(message.source, origin.peer_id());
        assert!(!relay.mesh_peers("news").await.contains(&direct.peer_id()));
    }

    #[tokio::test]
    async fn adding_explicit_peer_leaves_mesh() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = spawn_node(&registry, test_config()).await;
        let b = spawn_node(&registry, test_config()).await;
        let _sub_a = a.subscribe("news").await.unwrap();
        let _sub_b = b.subscribe("news").await.unwrap();
        connect(&a, &b).await;
        wait_for_mesh(&a, "news", 1).await;

        a.add_explicit_peer(b.peer_id()).await;
        assert!(a.mesh_peers("news").await.is_empty());
        wait_for_sent(&registry, a.peer_id(), b.peer_id(), |m| {
            matches!(m, GossipSubRequest::Prune { topic, backoff_secs: None } if topic == "news")
        })
        .await;
    }
}
