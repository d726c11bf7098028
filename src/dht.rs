//! # Kademlia-style Distributed Hash Table
//!
//! Peer routing and provider records over the `/murmur/kad/1.0.0` protocol.
//!
//! ## Key Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `find_peer(id)` | Iterative lookup that stops as soon as `id` is returned |
//! | `lookup(id)` | Iterative lookup for the K closest contacts |
//! | `provide(key)` | Announce this node as a provider to the K closest peers |
//! | `find_providers(key)` | Collect provider records along the lookup path |
//! | `bootstrap(seeds)` | Self lookup through the given seeds |
//!
//! ## Routing Table
//!
//! 256 k-buckets indexed by the length of the common prefix with the local id.
//! A full bucket never drops a live entry for an unverified newcomer: the
//! oldest entry is pinged first and only replaced if the ping fails.
//!
//! ## Actor Architecture
//!
//! - [`DhtNode`]: public handle, runs lookups on the caller's task
//! - `DhtActor`: owns the routing table and the provider store
//!
//! Lookups are driven from the handle so that many can run concurrently while
//! the actor only serializes the bookkeeping.

use std::collections::{BinaryHeap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use lru::LruCache;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, trace};

use crate::error::NetworkError;
use crate::identity::{distance_cmp, Contact, PeerId};
use crate::messages::{DhtRequest, DhtResponse};
use crate::protocols::DhtRpc;

pub type Key = [u8; 32];

/// Content key for arbitrary bytes.
pub fn content_key(data: &[u8]) -> Key {
    *blake3::hash(data).as_bytes()
}

/// Default replication factor (bucket size).
pub const DEFAULT_K: usize = 20;

/// Default lookup concurrency.
pub const DEFAULT_ALPHA: usize = 3;

pub const DEFAULT_MAX_HOPS: usize = 20;
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PROVIDER_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

const MAX_PROVIDER_KEYS: usize = 10_000;
const MAX_PROVIDERS_PER_KEY: usize = 20;
const EXPIRATION_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const COMMAND_QUEUE: usize = 256;

#[derive(Clone, Debug)]
pub struct DhtConfig {
    pub k: usize,
    pub alpha: usize,
    /// Upper bound on lookup rounds.
    pub max_hops: usize,
    pub query_timeout: Duration,
    pub lookup_timeout: Duration,
    pub provider_ttl: Duration,
    /// Buckets untouched for this long are refreshed with a random lookup.
    pub refresh_interval: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            max_hops: DEFAULT_MAX_HOPS,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            provider_ttl: DEFAULT_PROVIDER_TTL,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}

// ============================================================================
// Routing Table (XOR-Metric)
// ============================================================================
//
//   Bucket 0:   distance has 0 leading zeros (furthest, half the keyspace)
//   Bucket 1:   1 leading zero (a quarter)
//   ...
//   Bucket 255: closest
//
// Within a bucket contacts are ordered least recently seen first.

#[derive(Debug, Clone)]
struct RoutingBucket {
    contacts: Vec<Contact>,
    last_refresh: Instant,
}

#[derive(Debug)]
enum BucketTouchOutcome {
    Inserted,
    Refreshed,
    Full {
        new_contact: Box<Contact>,
        oldest: Box<Contact>,
    },
}

#[derive(Clone, Debug)]
struct PendingBucketUpdate {
    bucket_index: usize,
    oldest: Contact,
    new_contact: Contact,
}

impl RoutingBucket {
    fn new() -> Self {
        Self {
            contacts: Vec::new(),
            last_refresh: Instant::now(),
        }
    }

    fn mark_refreshed(&mut self) {
        self.last_refresh = Instant::now();
    }

    fn is_stale(&self, threshold: Duration) -> bool {
        self.last_refresh.elapsed() > threshold
    }

    fn touch(&mut self, contact: Contact, k: usize) -> BucketTouchOutcome {
        if let Some(pos) = self.contacts.iter().position(|c| c.peer_id == contact.peer_id) {
            let existing = self.contacts.remove(pos);
            // A sighting without addresses keeps the ones we already have.
            let updated = if contact.addrs.is_empty() { existing } else { contact };
            self.contacts.push(updated);
            self.mark_refreshed();
            return BucketTouchOutcome::Refreshed;
        }

        if self.contacts.len() < k {
            self.contacts.push(contact);
            self.mark_refreshed();
            return BucketTouchOutcome::Inserted;
        }

        match self.contacts.first().cloned() {
            Some(oldest) => BucketTouchOutcome::Full {
                new_contact: Box::new(contact),
                oldest: Box::new(oldest),
            },
            // k == 0: nothing can ever be stored.
            None => BucketTouchOutcome::Refreshed,
        }
    }

    fn refresh(&mut self, id: &PeerId) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| &c.peer_id == id) {
            let existing = self.contacts.remove(pos);
            self.contacts.push(existing);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, id: &PeerId) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| &c.peer_id == id) {
            self.contacts.remove(pos);
            true
        } else {
            false
        }
    }
}

fn bucket_index(self_id: &PeerId, other: &PeerId) -> usize {
    let dist = self_id.xor_distance(other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    255
}

/// A random id that falls into bucket `bucket_idx` of `self_id`.
fn random_id_for_bucket(self_id: &PeerId, bucket_idx: usize) -> PeerId {
    let bucket_idx = bucket_idx.min(255);
    let mut distance: [u8; 32] = rand::random();

    let byte_idx = bucket_idx / 8;
    let bit_pos = bucket_idx % 8;
    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }
    let target_bit = 0x80u8 >> bit_pos;
    distance[byte_idx] = target_bit | (distance[byte_idx] & target_bit.wrapping_sub(1));

    let self_bytes = self_id.as_bytes();
    let mut target = [0u8; 32];
    for i in 0..32 {
        target[i] = self_bytes[i] ^ distance[i];
    }
    PeerId::from_bytes(target)
}

fn sort_by_distance(contacts: &mut [Contact], target: &PeerId) {
    contacts.sort_by(|a, b| {
        distance_cmp(&a.peer_id.xor_distance(target), &b.peer_id.xor_distance(target))
    });
}

#[derive(Debug)]
pub struct RoutingTable {
    self_id: PeerId,
    k: usize,
    buckets: Vec<RoutingBucket>,
}

impl RoutingTable {
    pub fn new(self_id: PeerId, k: usize) -> Self {
        Self {
            self_id,
            k,
            buckets: (0..256).map(|_| RoutingBucket::new()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub fn update(&mut self, contact: Contact) {
        let _ = self.update_with_pending(contact);
    }

    fn update_with_pending(&mut self, contact: Contact) -> Option<PendingBucketUpdate> {
        if contact.peer_id == self.self_id || !contact.peer_id.is_valid() {
            return None;
        }
        let idx = bucket_index(&self.self_id, &contact.peer_id);
        match self.buckets[idx].touch(contact, self.k) {
            BucketTouchOutcome::Inserted | BucketTouchOutcome::Refreshed => None,
            BucketTouchOutcome::Full { new_contact, oldest } => Some(PendingBucketUpdate {
                bucket_index: idx,
                oldest: *oldest,
                new_contact: *new_contact,
            }),
        }
    }

    pub fn closest(&self, target: &PeerId, k: usize) -> Vec<Contact> {
        if k == 0 {
            return Vec::new();
        }

        #[derive(Eq, PartialEq)]
        struct ByDistance {
            dist: [u8; 32],
            contact: Contact,
        }

        impl Ord for ByDistance {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }

        impl PartialOrd for ByDistance {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap: BinaryHeap<ByDistance> = BinaryHeap::with_capacity(k + 1);
        for contact in self.buckets.iter().flat_map(|b| &b.contacts) {
            let dist = contact.peer_id.xor_distance(target);
            if heap.len() < k {
                heap.push(ByDistance { dist, contact: contact.clone() });
            } else if let Some(max_entry) = heap.peek()
                && distance_cmp(&dist, &max_entry.dist) == std::cmp::Ordering::Less
            {
                heap.push(ByDistance { dist, contact: contact.clone() });
                heap.pop();
            }
        }

        let mut result: Vec<_> = heap.into_iter().map(|d| d.contact).collect();
        sort_by_distance(&mut result, target);
        result
    }

    fn apply_ping_result(&mut self, pending: PendingBucketUpdate, oldest_alive: bool) {
        let bucket = &mut self.buckets[pending.bucket_index];
        if oldest_alive {
            bucket.refresh(&pending.oldest.peer_id);
            return;
        }

        let _ = bucket.remove(&pending.oldest.peer_id);
        let already_present = bucket
            .contacts
            .iter()
            .any(|c| c.peer_id == pending.new_contact.peer_id);
        if !already_present && bucket.contacts.len() < self.k {
            bucket.contacts.push(pending.new_contact);
        }
    }

    fn stale_bucket_indices(&self, threshold: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| !bucket.contacts.is_empty() && bucket.is_stale(threshold))
            .map(|(idx, _)| idx)
            .collect()
    }

    fn mark_bucket_refreshed(&mut self, bucket_idx: usize) {
        if let Some(bucket) = self.buckets.get_mut(bucket_idx) {
            bucket.mark_refreshed();
        }
    }

    fn lookup_contact(&self, peer: &PeerId) -> Option<Contact> {
        if *peer == self.self_id {
            return None;
        }
        let idx = bucket_index(&self.self_id, peer);
        self.buckets[idx]
            .contacts
            .iter()
            .find(|c| c.peer_id == *peer)
            .cloned()
    }

    fn remove(&mut self, peer: &PeerId) -> bool {
        if *peer == self.self_id {
            return false;
        }
        let idx = bucket_index(&self.self_id, peer);
        self.buckets[idx].remove(peer)
    }
}

// ============================================================================
// Provider Records
// ============================================================================

#[derive(Clone, Debug)]
struct ProviderRecord {
    contact: Contact,
    expires_at: Instant,
}

struct ProviderStore {
    records: LruCache<Key, Vec<ProviderRecord>>,
    ttl: Duration,
}

impl ProviderStore {
    fn new(ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(MAX_PROVIDER_KEYS).expect("MAX_PROVIDER_KEYS must be non-zero");
        Self {
            records: LruCache::new(capacity),
            ttl,
        }
    }

    fn add(&mut self, key: Key, contact: Contact) {
        let expires_at = Instant::now() + self.ttl;
        let list = self.records.get_or_insert_mut(key, Vec::new);
        if let Some(existing) = list.iter_mut().find(|r| r.contact.peer_id == contact.peer_id) {
            existing.contact = contact;
            existing.expires_at = expires_at;
            return;
        }
        if list.len() >= MAX_PROVIDERS_PER_KEY {
            // Drop the record closest to expiry.
            if let Some(pos) = list
                .iter()
                .enumerate()
                .min_by_key(|(_, r)| r.expires_at)
                .map(|(pos, _)| pos)
            {
                list.remove(pos);
            }
        }
        list.push(ProviderRecord { contact, expires_at });
    }

    fn get(&mut self, key: &Key) -> Vec<Contact> {
        let now = Instant::now();
        self.records
            .get(key)
            .map(|list| {
                list.iter()
                    .filter(|r| r.expires_at > now)
                    .map(|r| r.contact.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn expire(&mut self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        let mut empty = Vec::new();
        for (key, list) in self.records.iter_mut() {
            let before = list.len();
            list.retain(|r| r.expires_at > now);
            removed += before - list.len();
            if list.is_empty() {
                empty.push(*key);
            }
        }
        for key in empty {
            self.records.pop(&key);
        }
        removed
    }
}

// ============================================================================
// Lookup
// ============================================================================

#[derive(Clone, Debug)]
pub struct LookupResult {
    /// Up to K contacts, closest first.
    pub closest: Vec<Contact>,
    /// Providers collected along the way (provider lookups only).
    pub providers: Vec<Contact>,
    /// Query rounds used.
    pub rounds: usize,
    pub queried: usize,
}

#[derive(Clone, Debug)]
enum LookupGoal {
    Closest,
    Peer(PeerId),
    Providers(Key),
}

struct QueryReply {
    closer: Vec<Contact>,
    providers: Vec<Contact>,
}

async fn query<N: DhtRpc>(
    network: &N,
    to: &Contact,
    goal: &LookupGoal,
    target: PeerId,
) -> Result<QueryReply> {
    match goal {
        LookupGoal::Providers(key) => {
            let (providers, closer) = network.get_providers(to, *key).await?;
            Ok(QueryReply { closer, providers })
        }
        LookupGoal::Closest | LookupGoal::Peer(_) => Ok(QueryReply {
            closer: network.find_node(to, target).await?,
            providers: Vec::new(),
        }),
    }
}

// ============================================================================
// Handle
// ============================================================================

pub struct DhtNode<N: DhtRpc> {
    cmd_tx: mpsc::Sender<Command>,
    id: PeerId,
    self_contact: Contact,
    network: Arc<N>,
    config: Arc<DhtConfig>,
}

impl<N: DhtRpc> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            id: self.id,
            self_contact: self.self_contact.clone(),
            network: self.network.clone(),
            config: self.config.clone(),
        }
    }
}

enum Command {
    ObserveContact(Contact),
    RemoveContact(PeerId),
    GetLookupParams(PeerId, oneshot::Sender<Vec<Contact>>),
    LookupContact(PeerId, oneshot::Sender<Option<Contact>>),
    RoutingTableSize(oneshot::Sender<usize>),
    HandleRequest(Contact, DhtRequest, oneshot::Sender<DhtResponse>),
    AddLocalProvider(Key, Contact),
    GetLocalProviders(Key, oneshot::Sender<Vec<Contact>>),
    GetStaleBuckets(Duration, oneshot::Sender<Vec<usize>>),
    MarkBucketRefreshed(usize),
    ApplyPingResult(PendingBucketUpdate, bool),
    Quit,
}

impl<N: DhtRpc> DhtNode<N> {
    pub fn new(self_contact: Contact, network: N, config: DhtConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let network = Arc::new(network);
        let id = self_contact.peer_id;

        let actor = DhtActor {
            routing: RoutingTable::new(id, config.k.max(1)),
            providers: ProviderStore::new(config.provider_ttl),
            cmd_tx: cmd_tx.clone(),
            network: network.clone(),
            id,
            k: config.k.max(1),
            pending_pings: HashSet::new(),
        };
        tokio::spawn(actor.run(cmd_rx));

        let node = Self {
            cmd_tx,
            id,
            self_contact,
            network,
            config: Arc::new(config),
        };
        node.spawn_periodic_bucket_refresh();
        node
    }

    pub fn peer_id(&self) -> PeerId {
        self.id
    }

    pub fn contact(&self) -> Contact {
        self.self_contact.clone()
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub async fn observe_contact(&self, contact: Contact) {
        let _ = self.cmd_tx.send(Command::ObserveContact(contact)).await;
    }

    pub async fn remove_contact(&self, peer: PeerId) {
        let _ = self.cmd_tx.send(Command::RemoveContact(peer)).await;
    }

    /// Contact for `peer` if it is in the routing table.
    pub async fn lookup_contact(&self, peer: &PeerId) -> Option<Contact> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::LookupContact(*peer, tx)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub async fn routing_table_size(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::RoutingTableSize(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or_default()
    }

    /// Contacts from the local routing table closest to `target`, no network traffic.
    pub async fn closest_local(&self, target: PeerId) -> Vec<Contact> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetLookupParams(target, tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Answer an inbound request from an authenticated peer.
    pub async fn handle_request(&self, from: Contact, request: DhtRequest) -> DhtResponse {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::HandleRequest(from, request, tx))
            .await
            .is_err()
        {
            return DhtResponse::Error { message: "dht not running".to_string() };
        }
        rx.await.unwrap_or(DhtResponse::Error { message: "dht not running".to_string() })
    }

    fn spawn_periodic_bucket_refresh(&self) {
        let node = self.clone();
        let period = self.config.refresh_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;

                let (tx, rx) = oneshot::channel();
                if node.cmd_tx.send(Command::GetStaleBuckets(period, tx)).await.is_err() {
                    break;
                }
                let stale_buckets = match rx.await {
                    Ok(buckets) => buckets,
                    Err(_) => break,
                };
                if stale_buckets.is_empty() {
                    continue;
                }

                debug!(count = stale_buckets.len(), "refreshing stale routing buckets");
                for bucket_idx in stale_buckets {
                    let target = random_id_for_bucket(&node.id, bucket_idx);
                    if let Err(e) = node.lookup(target).await {
                        debug!(bucket = bucket_idx, error = %e, "bucket refresh lookup failed");
                    }
                    let _ = node.cmd_tx.send(Command::MarkBucketRefreshed(bucket_idx)).await;
                }
            }
        });
    }

    /// K closest contacts to `target` found by an iterative lookup.
    pub async fn lookup(&self, target: PeerId) -> Result<LookupResult, NetworkError> {
        self.iterative_lookup(target, LookupGoal::Closest, Vec::new()).await
    }

    /// Locate `peer`. Ends with `NotFound` once candidates are exhausted.
    pub async fn find_peer(&self, peer: PeerId) -> Result<Contact, NetworkError> {
        if let Some(contact) = self.lookup_contact(&peer).await {
            return Ok(contact);
        }
        let result = self
            .iterative_lookup(peer, LookupGoal::Peer(peer), Vec::new())
            .await?;
        result
            .closest
            .into_iter()
            .find(|c| c.peer_id == peer)
            .ok_or(NetworkError::NotFound)
    }

    /// Join through `seeds` with a self lookup.
    pub async fn bootstrap(&self, seeds: Vec<Contact>) -> Result<LookupResult, NetworkError> {
        for seed in &seeds {
            self.observe_contact(seed.clone()).await;
        }
        let result = self
            .iterative_lookup(self.id, LookupGoal::Closest, seeds)
            .await?;
        info!(
            contacts = result.closest.len(),
            rounds = result.rounds,
            "dht bootstrap complete"
        );
        Ok(result)
    }

    /// Record this node as a provider of `key` locally and on the K closest peers.
    /// Returns how many remote peers accepted the record.
    pub async fn provide(&self, key: Key) -> Result<usize, NetworkError> {
        let _ = self
            .cmd_tx
            .send(Command::AddLocalProvider(key, self.self_contact.clone()))
            .await;

        let result = self.lookup(PeerId::from_bytes(key)).await?;
        let mut stores = JoinSet::new();
        for contact in result.closest {
            let network = self.network.clone();
            let provider = self.self_contact.clone();
            let timeout = self.config.query_timeout;
            stores.spawn(async move {
                tokio::time::timeout(timeout, network.add_provider(&contact, key, provider))
                    .await
                    .map_err(|_| anyhow!("add_provider timed out"))
                    .and_then(|r| r)
                    .is_ok()
            });
        }
        let mut accepted = 0;
        while let Some(joined) = stores.join_next().await {
            if matches!(joined, Ok(true)) {
                accepted += 1;
            }
        }
        debug!(key = %hex::encode(&key[..8]), accepted, "provider record published");
        Ok(accepted)
    }

    pub async fn find_providers(&self, key: Key) -> Result<Vec<Contact>, NetworkError> {
        let (tx, rx) = oneshot::channel();
        let mut providers = if self.cmd_tx.send(Command::GetLocalProviders(key, tx)).await.is_ok() {
            rx.await.unwrap_or_default()
        } else {
            return Err(NetworkError::NotRunning);
        };

        let result = self
            .iterative_lookup(PeerId::from_bytes(key), LookupGoal::Providers(key), Vec::new())
            .await?;
        for provider in result.providers {
            if !providers.contains(&provider) {
                providers.push(provider);
            }
        }
        if providers.is_empty() {
            return Err(NetworkError::NotFound);
        }
        Ok(providers)
    }

    async fn iterative_lookup(
        &self,
        target: PeerId,
        goal: LookupGoal,
        seeds: Vec<Contact>,
    ) -> Result<LookupResult, NetworkError> {
        let started = Instant::now();
        let k = self.config.k.max(1);
        let alpha = self.config.alpha.max(1);

        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::GetLookupParams(target, tx))
            .await
            .map_err(|_| NetworkError::NotRunning)?;
        let mut shortlist = rx.await.map_err(|_| NetworkError::NotRunning)?;

        for seed in seeds {
            if seed.peer_id != self.id && !shortlist.contains(&seed) {
                shortlist.push(seed);
            }
        }
        sort_by_distance(&mut shortlist, &target);

        let mut seen: HashSet<PeerId> = shortlist.iter().map(|c| c.peer_id).collect();
        let mut queried: HashSet<PeerId> = HashSet::new();
        let mut providers: Vec<Contact> = Vec::new();
        let mut best = shortlist.first().map(|c| c.peer_id.xor_distance(&target));
        let mut rounds = 0;
        // After a round without progress, query every unqueried contact among the K closest once.
        let mut final_sweep = false;

        loop {
            if rounds >= self.config.max_hops {
                debug!(target = %target.short(), rounds, "lookup hit hop limit");
                break;
            }
            let remaining = match self.config.lookup_timeout.checked_sub(started.elapsed()) {
                Some(r) if !r.is_zero() => r,
                _ => {
                    debug!(target = %target.short(), "lookup timed out, returning current results");
                    break;
                }
            };

            let width = if final_sweep { k } else { alpha };
            let candidates: Vec<Contact> = shortlist
                .iter()
                .take(k)
                .filter(|c| !queried.contains(&c.peer_id))
                .take(width)
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }
            rounds += 1;

            let mut queries = JoinSet::new();
            for contact in candidates {
                queried.insert(contact.peer_id);
                let network = self.network.clone();
                let goal = goal.clone();
                let per_query = self.config.query_timeout;
                queries.spawn(async move {
                    let result = tokio::time::timeout(per_query, query(&*network, &contact, &goal, target))
                        .await
                        .unwrap_or_else(|_| Err(anyhow!("query timed out")));
                    (contact, result)
                });
            }

            let mut failed: Vec<PeerId> = Vec::new();
            let round = async {
                while let Some(joined) = queries.join_next().await {
                    let Ok((contact, result)) = joined else { continue };
                    match result {
                        Ok(reply) => {
                            self.observe_contact(contact.clone()).await;
                            for provider in reply.providers {
                                if !providers.contains(&provider) {
                                    providers.push(provider);
                                }
                            }
                            for node in reply.closer {
                                if node.peer_id != self.id && seen.insert(node.peer_id) {
                                    shortlist.push(node);
                                }
                            }
                            let satisfied = match &goal {
                                LookupGoal::Peer(peer) => seen.contains(peer),
                                LookupGoal::Providers(_) => providers.len() >= k,
                                LookupGoal::Closest => false,
                            };
                            if satisfied {
                                return true;
                            }
                        }
                        Err(e) => {
                            trace!(peer = %contact.peer_id.short(), error = %e, "lookup query failed");
                            failed.push(contact.peer_id);
                        }
                    }
                }
                false
            };
            // Dropping `queries` at the end of the round aborts anything still in flight.
            let done = match tokio::time::timeout(remaining, round).await {
                Ok(done) => done,
                Err(_) => true,
            };

            shortlist.retain(|c| !failed.contains(&c.peer_id));
            sort_by_distance(&mut shortlist, &target);
            shortlist.truncate(k);
            if done {
                break;
            }

            let new_best = shortlist.first().map(|c| c.peer_id.xor_distance(&target));
            let closer = match (new_best, best) {
                (Some(new), Some(old)) => distance_cmp(&new, &old) == std::cmp::Ordering::Less,
                (Some(_), None) => true,
                _ => false,
            };
            if closer {
                best = new_best;
                final_sweep = false;
            } else if final_sweep {
                break;
            } else {
                final_sweep = true;
            }
        }

        debug!(
            target = %target.short(),
            found = shortlist.len(),
            queried = queried.len(),
            rounds,
            "iterative lookup completed"
        );

        Ok(LookupResult {
            closest: shortlist,
            providers,
            rounds,
            queried: queried.len(),
        })
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Actor
// ============================================================================

struct DhtActor<N: DhtRpc> {
    routing: RoutingTable,
    providers: ProviderStore,
    cmd_tx: mpsc::Sender<Command>,
    network: Arc<N>,
    id: PeerId,
    k: usize,
    /// (bucket, oldest contact) pairs with a liveness ping in flight.
    pending_pings: HashSet<(usize, PeerId)>,
}

impl<N: DhtRpc> DhtActor<N> {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut expiry = tokio::time::interval(EXPIRATION_CHECK_INTERVAL);
        expiry.tick().await;
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    if !self.handle_command(cmd) {
                        break;
                    }
                }
                _ = expiry.tick() => {
                    let removed = self.providers.expire();
                    if removed > 0 {
                        debug!(removed, "expired provider records");
                    }
                }
            }
        }
        debug!("dht actor stopped");
    }

    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::ObserveContact(contact) => self.observe(contact),
            Command::RemoveContact(peer) => {
                self.routing.remove(&peer);
            }
            Command::GetLookupParams(target, reply) => {
                let _ = reply.send(self.routing.closest(&target, self.k));
            }
            Command::LookupContact(peer, reply) => {
                let _ = reply.send(self.routing.lookup_contact(&peer));
            }
            Command::RoutingTableSize(reply) => {
                let _ = reply.send(self.routing.len());
            }
            Command::HandleRequest(from, request, reply) => {
                let response = self.handle_request(from, request);
                let _ = reply.send(response);
            }
            Command::AddLocalProvider(key, contact) => self.providers.add(key, contact),
            Command::GetLocalProviders(key, reply) => {
                let _ = reply.send(self.providers.get(&key));
            }
            Command::GetStaleBuckets(threshold, reply) => {
                let _ = reply.send(self.routing.stale_bucket_indices(threshold));
            }
            Command::MarkBucketRefreshed(idx) => self.routing.mark_bucket_refreshed(idx),
            Command::ApplyPingResult(pending, alive) => {
                trace!(
                    oldest = %pending.oldest.peer_id.short(),
                    alive,
                    "applying bucket ping result"
                );
                self.pending_pings
                    .remove(&(pending.bucket_index, pending.oldest.peer_id));
                self.routing.apply_ping_result(pending, alive);
            }
            Command::Quit => return false,
        }
        true
    }

    fn handle_request(&mut self, from: Contact, request: DhtRequest) -> DhtResponse {
        let from_id = from.peer_id;
        let from_addrs = from.addrs.clone();
        self.observe(from);
        match request {
            DhtRequest::Ping => DhtResponse::Pong,
            DhtRequest::FindNode { target } => {
                let nodes = self.routing.closest(&target, self.k);
                trace!(from = %from_id.short(), target = %target.short(), returned = nodes.len(), "FIND_NODE");
                DhtResponse::Nodes(nodes)
            }
            DhtRequest::GetProviders { key } => {
                let providers = self.providers.get(&key);
                let closer = self.routing.closest(&PeerId::from_bytes(key), self.k);
                DhtResponse::Providers { providers, closer }
            }
            DhtRequest::AddProvider { key, provider } => {
                if provider.peer_id != from_id {
                    debug!(
                        from = %from_id.short(),
                        claimed = %provider.peer_id.short(),
                        "rejecting provider record for another peer"
                    );
                    return DhtResponse::Error {
                        message: "provider must be the sender".to_string(),
                    };
                }
                // Addresses the sender advertised on the authenticated connection win
                // over whatever the record claims.
                let provider = if from_addrs.is_empty() {
                    provider
                } else {
                    Contact::new(provider.peer_id, from_addrs)
                };
                self.providers.add(key, provider);
                DhtResponse::Ack
            }
        }
    }

    fn observe(&mut self, contact: Contact) {
        if contact.peer_id == self.id {
            return;
        }
        if let Some(update) = self.routing.update_with_pending(contact) {
            if !self
                .pending_pings
                .insert((update.bucket_index, update.oldest.peer_id))
            {
                trace!(
                    oldest = %update.oldest.peer_id.short(),
                    "bucket ping already in flight"
                );
                return;
            }
            let network = self.network.clone();
            let tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                let alive = network.ping(&update.oldest).await.is_ok();
                let _ = tx.send(Command::ApplyPingResult(update, alive)).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use anyhow::anyhow;
    use tokio::sync::{Mutex, RwLock};
    use tokio::time::sleep;
    use crate::address::PeerAddress;
    use crate::identity::Keypair;

    #[derive(Clone)]
    struct TestNetwork {
        registry: Arc<NetworkRegistry>,
        self_contact: Contact,
        failures: Arc<Mutex<HashSet<PeerId>>>,
        pings: Arc<Mutex<Vec<PeerId>>>,
        /// Peers whose pings take a while to answer.
        slow: Arc<Mutex<HashSet<PeerId>>>,
    }

    impl TestNetwork {
        fn new(registry: Arc<NetworkRegistry>, self_contact: Contact) -> Self {
            Self {
                registry,
                self_contact,
                failures: Arc::new(Mutex::new(HashSet::new())),
                pings: Arc::new(Mutex::new(Vec::new())),
                slow: Arc::new(Mutex::new(HashSet::new())),
            }
        }

        async fn set_failure(&self, node: PeerId, fail: bool) {
            let mut failures = self.failures.lock().await;
            if fail {
                failures.insert(node);
            } else {
                failures.remove(&node);
            }
        }

        async fn ping_calls(&self) -> Vec<PeerId> {
            self.pings.lock().await.clone()
        }

        async fn peer(&self, to: &Contact) -> anyhow::Result<DhtNode<TestNetwork>> {
            if self.failures.lock().await.contains(&to.peer_id) {
                return Err(anyhow!("injected network failure"));
            }
            self.registry
                .get(&to.peer_id)
                .await
                .ok_or_else(|| anyhow!("peer not reachable"))
        }
    }

    #[derive(Default)]
    struct NetworkRegistry {
        peers: RwLock<HashMap<PeerId, DhtNode<TestNetwork>>>,
    }

    impl NetworkRegistry {
        async fn register(&self, node: &DhtNode<TestNetwork>) {
            self.peers.write().await.insert(node.peer_id(), node.clone());
        }

        async fn get(&self, id: &PeerId) -> Option<DhtNode<TestNetwork>> {
            self.peers.read().await.get(id).cloned()
        }
    }

    #[async_trait::async_trait]
    impl DhtRpc for TestNetwork {
        async fn find_node(&self, to: &Contact, target: PeerId) -> anyhow::Result<Vec<Contact>> {
            let peer = self.peer(to).await?;
            match peer
                .handle_request(self.self_contact.clone(), DhtRequest::FindNode { target })
                .await
            {
                DhtResponse::Nodes(nodes) => Ok(nodes),
                other => Err(anyhow!("unexpected response {:?}", other)),
            }
        }

        async fn get_providers(&self, to: &Contact, key: Key) -> anyhow::Result<(Vec<Contact>, Vec<Contact>)> {
            let peer = self.peer(to).await?;
            match peer
                .handle_request(self.self_contact.clone(), DhtRequest::GetProviders { key })
                .await
            {
                DhtResponse::Providers { providers, closer } => Ok((providers, closer)),
                other => Err(anyhow!("unexpected response {:?}", other)),
            }
        }

        async fn add_provider(&self, to: &Contact, key: Key, provider: Contact) -> anyhow::Result<()> {
            let peer = self.peer(to).await?;
            match peer
                .handle_request(self.self_contact.clone(), DhtRequest::AddProvider { key, provider })
                .await
            {
                DhtResponse::Ack => Ok(()),
                other => Err(anyhow!("unexpected response {:?}", other)),
            }
        }

        async fn ping(&self, to: &Contact) -> anyhow::Result<()> {
            self.pings.lock().await.push(to.peer_id);
            if self.slow.lock().await.contains(&to.peer_id) {
                sleep(Duration::from_millis(200)).await;
            }
            self.peer(to).await.map(|_| ())
        }
    }

    struct TestNode {
        node: DhtNode<TestNetwork>,
        network: TestNetwork,
    }

    impl TestNode {
        async fn new(registry: Arc<NetworkRegistry>, index: u32, k: usize) -> Self {
            let contact = make_contact(index);
            let network = TestNetwork::new(registry.clone(), contact.clone());
            let config = DhtConfig { k, ..DhtConfig::default() };
            let node = DhtNode::new(contact, network.clone(), config);
            registry.register(&node).await;
            Self { node, network }
        }

        fn contact(&self) -> Contact {
            self.node.contact()
        }

        fn id(&self) -> PeerId {
            self.node.peer_id()
        }
    }

    fn make_identity(index: u32) -> PeerId {
        let mut seed = [0u8; 32];
        seed[..4].copy_from_slice(&index.to_be_bytes());
        Keypair::from_secret_key_bytes(&seed).peer_id()
    }

    fn make_contact(index: u32) -> Contact {
        Contact::new(make_identity(index), vec![PeerAddress::memory(u64::from(index) + 1)])
    }

    /// Indices whose identities put the last two in the same bucket relative to the first.
    fn find_same_bucket_indices() -> (u32, u32, u32) {
        let main_id = make_identity(0);
        for incumbent in 1u32..1000 {
            let bucket = bucket_index(&main_id, &make_identity(incumbent));
            for challenger in (incumbent + 1)..1000 {
                if bucket_index(&main_id, &make_identity(challenger)) == bucket {
                    return (0, incumbent, challenger);
                }
            }
        }
        panic!("could not find same-bucket indices");
    }

    #[test]
    fn bucket_index_counts_common_prefix() {
        let base = PeerId::from_bytes([0u8; 32]);
        let mut far = [0u8; 32];
        far[0] = 0x80;
        let mut near = [0u8; 32];
        near[31] = 0x01;
        assert_eq!(bucket_index(&base, &PeerId::from_bytes(far)), 0);
        assert_eq!(bucket_index(&base, &PeerId::from_bytes(near)), 255);
    }

    #[test]
    fn random_ids_land_in_requested_bucket() {
        let self_id = make_identity(7);
        for bucket in [0usize, 1, 7, 8, 100, 254] {
            let id = random_id_for_bucket(&self_id, bucket);
            assert_eq!(bucket_index(&self_id, &id), bucket);
        }
    }

    #[test]
    fn closest_orders_by_distance_and_respects_k() {
        let mut table = RoutingTable::new(make_identity(0), 64);
        for i in 1..50 {
            table.update(make_contact(i));
        }
        let target = make_identity(25);
        let closest = table.closest(&target, 5);
        assert_eq!(closest.len(), 5);
        assert_eq!(closest[0].peer_id, target);
        for pair in closest.windows(2) {
            let a = pair[0].peer_id.xor_distance(&target);
            let b = pair[1].peer_id.xor_distance(&target);
            assert_ne!(distance_cmp(&a, &b), std::cmp::Ordering::Greater);
        }
    }

    #[test]
    fn self_and_invalid_ids_are_not_routed() {
        let self_id = make_identity(0);
        let mut table = RoutingTable::new(self_id, 20);
        table.update(Contact::new(self_id, Vec::new()));
        table.update(Contact::new(PeerId::from_bytes([0u8; 32]), Vec::new()));
        assert!(table.is_empty());
    }

    #[test]
    fn touch_keeps_known_addresses() {
        let mut table = RoutingTable::new(make_identity(0), 20);
        let contact = make_contact(1);
        table.update(contact.clone());
        table.update(Contact::new(contact.peer_id, Vec::new()));
        let stored = table.lookup_contact(&contact.peer_id).unwrap();
        assert_eq!(stored.addrs, contact.addrs);
    }

    #[tokio::test]
    async fn responsive_contacts_survive_bucket_eviction() {
        let (main_idx, responsive_idx, challenger_idx) = find_same_bucket_indices();
        let registry = Arc::new(NetworkRegistry::default());
        let main = TestNode::new(registry.clone(), main_idx, 1).await;
        let responsive = TestNode::new(registry.clone(), responsive_idx, 1).await;
        let challenger = TestNode::new(registry.clone(), challenger_idx, 1).await;

        main.node.observe_contact(responsive.contact()).await;
        main.node.observe_contact(challenger.contact()).await;
        sleep(Duration::from_millis(20)).await;

        assert_eq!(main.network.ping_calls().await, vec![responsive.id()]);
        assert!(main.node.lookup_contact(&responsive.id()).await.is_some());
        assert!(main.node.lookup_contact(&challenger.id()).await.is_none());
    }

    #[tokio::test]
    async fn one_ping_per_full_bucket_at_a_time() {
        let (main_idx, incumbent_idx, challenger_idx) = find_same_bucket_indices();
        let registry = Arc::new(NetworkRegistry::default());
        let main = TestNode::new(registry.clone(), main_idx, 1).await;
        let incumbent = TestNode::new(registry.clone(), incumbent_idx, 1).await;
        let challenger = TestNode::new(registry.clone(), challenger_idx, 1).await;

        main.node.observe_contact(incumbent.contact()).await;
        main.network.slow.lock().await.insert(incumbent.id());
        for _ in 0..5 {
            main.node.observe_contact(challenger.contact()).await;
        }
        sleep(Duration::from_millis(400)).await;

        assert_eq!(main.network.ping_calls().await, vec![incumbent.id()]);
        assert!(main.node.lookup_contact(&incumbent.id()).await.is_some());
        assert!(main.node.lookup_contact(&challenger.id()).await.is_none());

        // Once the ping settles a later challenge pings again.
        main.node.observe_contact(challenger.contact()).await;
        sleep(Duration::from_millis(400)).await;
        assert_eq!(main.network.ping_calls().await.len(), 2);
    }

    #[tokio::test]
    async fn failed_pings_trigger_bucket_replacement() {
        let (main_idx, stale_idx, newcomer_idx) = find_same_bucket_indices();
        let registry = Arc::new(NetworkRegistry::default());
        let main = TestNode::new(registry.clone(), main_idx, 1).await;
        let stale = TestNode::new(registry.clone(), stale_idx, 1).await;
        let newcomer = TestNode::new(registry.clone(), newcomer_idx, 1).await;

        main.node.observe_contact(stale.contact()).await;
        main.network.set_failure(stale.id(), true).await;
        main.node.observe_contact(newcomer.contact()).await;
        sleep(Duration::from_millis(20)).await;

        assert!(main.node.lookup_contact(&stale.id()).await.is_none());
        assert!(main.node.lookup_contact(&newcomer.id()).await.is_some());
    }

    #[tokio::test]
    async fn find_peer_walks_the_network() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::new(registry.clone(), 1, 20).await;
        let b = TestNode::new(registry.clone(), 2, 20).await;
        let c = TestNode::new(registry.clone(), 3, 20).await;

        // a knows b, b knows c.
        a.node.observe_contact(b.contact()).await;
        b.node.observe_contact(c.contact()).await;

        let found = a.node.find_peer(c.id()).await.unwrap();
        assert_eq!(found.peer_id, c.id());
        assert_eq!(found.addrs, c.contact().addrs);

        let missing = make_identity(999);
        assert_eq!(a.node.find_peer(missing).await.unwrap_err(), NetworkError::NotFound);
    }

    #[tokio::test]
    async fn lookup_skips_failing_peers() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::new(registry.clone(), 1, 20).await;
        let dead = TestNode::new(registry.clone(), 2, 20).await;
        let live = TestNode::new(registry.clone(), 3, 20).await;
        a.node.observe_contact(dead.contact()).await;
        a.node.observe_contact(live.contact()).await;
        a.network.set_failure(dead.id(), true).await;

        let result = a.node.lookup(make_identity(50)).await.unwrap();
        assert!(result.closest.iter().all(|c| c.peer_id != dead.id()));
        assert!(result.closest.iter().any(|c| c.peer_id == live.id()));
    }

    #[tokio::test]
    async fn providers_are_published_and_found() {
        let registry = Arc::new(NetworkRegistry::default());
        let nodes: Vec<TestNode> = {
            let mut nodes = Vec::new();
            for i in 0..8 {
                nodes.push(TestNode::new(registry.clone(), 100 + i, 20).await);
            }
            nodes
        };
        for node in &nodes[1..] {
            node.node.bootstrap(vec![nodes[0].contact()]).await.unwrap();
        }

        let key = content_key(b"some content");
        let accepted = nodes[3].node.provide(key).await.unwrap();
        assert!(accepted > 0);

        let providers = nodes[6].node.find_providers(key).await.unwrap();
        assert!(providers.iter().any(|p| p.peer_id == nodes[3].id()));

        let unknown = content_key(b"nobody has this");
        assert_eq!(
            nodes[6].node.find_providers(unknown).await.unwrap_err(),
            NetworkError::NotFound
        );
    }

    #[tokio::test]
    async fn provider_records_must_come_from_their_owner() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::new(registry.clone(), 1, 20).await;
        let key = content_key(b"x");
        let forged = make_contact(42);
        let response = a
            .node
            .handle_request(make_contact(2), DhtRequest::AddProvider { key, provider: forged })
            .await;
        assert!(matches!(response, DhtResponse::Error { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn provider_records_expire() {
        let mut store = ProviderStore::new(Duration::from_secs(10));
        let key = content_key(b"y");
        store.add(key, make_contact(1));
        assert_eq!(store.get(&key).len(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.get(&key).is_empty());
        assert_eq!(store.expire(), 1);
        assert!(store.records.is_empty());
    }

    #[tokio::test]
    async fn lookups_converge_in_logarithmic_rounds() {
        const N: u32 = 64;
        let registry = Arc::new(NetworkRegistry::default());
        let mut nodes = Vec::new();
        for i in 0..N {
            nodes.push(TestNode::new(registry.clone(), 1000 + i, 8).await);
        }
        let seed = nodes[0].contact();
        for _ in 0..2 {
            for node in &nodes[1..] {
                node.node.bootstrap(vec![seed.clone()]).await.unwrap();
            }
        }

        let bound = 2 * (N as f64).log2().ceil() as usize;
        for (source, target) in [(5usize, 60usize), (17, 3), (40, 41), (63, 0), (30, 12)] {
            let target_id = nodes[target].id();
            let result = nodes[source].node.lookup(target_id).await.unwrap();
            assert_eq!(result.closest.first().map(|c| c.peer_id), Some(target_id));
            assert!(
                result.rounds <= bound,
                "lookup took {} rounds (bound {})",
                result.rounds,
                bound
            );
            let found = nodes[source].node.find_peer(target_id).await.unwrap();
            assert_eq!(found.peer_id, target_id);
        }
    }
}
