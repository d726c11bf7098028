//! # Peer Store
//!
//! Bookkeeping for every peer the node has heard of: its advisory addresses,
//! when it was last seen, and whether a connection to it is live.
//!
//! The store is a plain data structure owned by the connection manager actor,
//! which is its only writer. Records are bounded by an LRU; when full, the
//! least recently used *disconnected* peer is evicted first.
//!
//! ## Address priority
//!
//! [`PeerStore::addresses_by_priority`] orders a peer's addresses as:
//!
//! 1. verified addresses, most recently verified first
//! 2. addresses never tried, in the order they were learned
//! 3. failed addresses, fewest failures first

use std::num::NonZeroUsize;
use std::time::Instant;

use lru::LruCache;
use tracing::debug;

use crate::address::PeerAddress;
use crate::identity::PeerId;

pub const DEFAULT_MAX_PEERS: usize = 10_000;

/// Addresses kept per peer. Beyond this the worst address is dropped.
pub const MAX_ADDRS_PER_PEER: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Clone, Debug)]
pub struct AddressRecord {
    pub addr: PeerAddress,
    pub last_verified: Option<Instant>,
    pub failures: u32,
    learned_seq: u64,
}

impl AddressRecord {
    fn class(&self) -> u8 {
        match (self.last_verified, self.failures) {
            (Some(_), 0) => 0,
            (None, 0) => 1,
            _ => 2,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub addrs: Vec<AddressRecord>,
    pub last_seen: Instant,
    pub state: ConnectionState,
}

impl PeerRecord {
    fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            addrs: Vec::new(),
            last_seen: Instant::now(),
            state: ConnectionState::Disconnected,
        }
    }

    pub fn addresses(&self) -> Vec<PeerAddress> {
        self.addrs.iter().map(|a| a.addr.clone()).collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// First time this peer was seen.
    New,
    /// Known peer, at least one new address.
    Updated,
    /// Nothing new.
    Unchanged,
}

pub struct PeerStore {
    local: PeerId,
    peers: LruCache<PeerId, PeerRecord>,
    next_seq: u64,
}

impl PeerStore {
    pub fn new(local: PeerId, capacity: NonZeroUsize) -> Self {
        Self {
            local,
            peers: LruCache::new(capacity),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerRecord> {
        self.peers.peek(peer)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.iter().map(|(id, _)| *id).collect()
    }

    fn record_mut(&mut self, peer: PeerId) -> &mut PeerRecord {
        if !self.peers.contains(&peer) && self.peers.len() == self.peers.cap().get() {
            self.evict_one();
        }
        self.peers.get_or_insert_mut(peer, || PeerRecord::new(peer))
    }

    fn evict_one(&mut self) {
        let victim = self
            .peers
            .iter()
            .rev()
            .find(|(_, r)| r.state == ConnectionState::Disconnected)
            .map(|(id, _)| *id);
        match victim {
            Some(id) => {
                self.peers.pop(&id);
                debug!(peer = %id.short(), "evicted disconnected peer from store");
            }
            None => {
                if let Some((id, _)) = self.peers.pop_lru() {
                    debug!(peer = %id.short(), "peer store full of live peers, evicted oldest");
                }
            }
        }
    }

    /// Union `addrs` into the peer's address set. `/p2p/` suffixes are stripped.
    pub fn merge(&mut self, peer: PeerId, addrs: &[PeerAddress]) -> MergeOutcome {
        if peer == self.local {
            return MergeOutcome::Unchanged;
        }
        let is_new = !self.peers.contains(&peer);
        let mut added = false;
        for addr in addrs {
            let addr = addr.without_peer_id();
            let seq = self.next_seq;
            let record = self.record_mut(peer);
            if record.addrs.iter().any(|a| a.addr == addr) {
                continue;
            }
            if record.addrs.len() >= MAX_ADDRS_PER_PEER {
                // Drop the least useful address to make room.
                sort_by_priority(&mut record.addrs);
                if record.addrs.last().is_some_and(|worst| worst.class() == 2) {
                    record.addrs.pop();
                } else {
                    continue;
                }
            }
            record.addrs.push(AddressRecord {
                addr,
                last_verified: None,
                failures: 0,
                learned_seq: seq,
            });
            self.next_seq += 1;
            added = true;
        }
        if is_new {
            self.record_mut(peer);
            MergeOutcome::New
        } else if added {
            MergeOutcome::Updated
        } else {
            MergeOutcome::Unchanged
        }
    }

    pub fn addresses_by_priority(&self, peer: &PeerId) -> Vec<PeerAddress> {
        let Some(record) = self.peers.peek(peer) else {
            return Vec::new();
        };
        let mut addrs = record.addrs.clone();
        sort_by_priority(&mut addrs);
        addrs.into_iter().map(|a| a.addr).collect()
    }

    pub fn record_success(&mut self, peer: PeerId, addr: &PeerAddress) {
        let addr = addr.without_peer_id();
        let seq = self.next_seq;
        let record = self.record_mut(peer);
        record.last_seen = Instant::now();
        if let Some(entry) = record.addrs.iter_mut().find(|a| a.addr == addr) {
            entry.last_verified = Some(Instant::now());
            entry.failures = 0;
            return;
        }
        record.addrs.push(AddressRecord {
            addr,
            last_verified: Some(Instant::now()),
            failures: 0,
            learned_seq: seq,
        });
        self.next_seq += 1;
    }

    pub fn record_failure(&mut self, peer: PeerId, addr: &PeerAddress) {
        let addr = addr.without_peer_id();
        if let Some(record) = self.peers.peek_mut(&peer) {
            if let Some(entry) = record.addrs.iter_mut().find(|a| a.addr == addr) {
                entry.failures = entry.failures.saturating_add(1);
            }
        }
    }

    pub fn set_state(&mut self, peer: PeerId, state: ConnectionState) {
        if peer == self.local {
            return;
        }
        let record = self.record_mut(peer);
        record.state = state;
        if state == ConnectionState::Connected {
            record.last_seen = Instant::now();
        }
    }

    pub fn state(&self, peer: &PeerId) -> ConnectionState {
        self.peers
            .peek(peer)
            .map(|r| r.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Explicit removal. Records are never dropped any other way except LRU eviction.
    pub fn remove(&mut self, peer: &PeerId) -> Option<PeerRecord> {
        self.peers.pop(peer)
    }
}

fn sort_by_priority(addrs: &mut [AddressRecord]) {
    addrs.sort_by(|a, b| {
        a.class().cmp(&b.class()).then_with(|| match a.class() {
            0 => b.last_verified.cmp(&a.last_verified),
            1 => a.learned_seq.cmp(&b.learned_seq),
            _ => a
                .failures
                .cmp(&b.failures)
                .then_with(|| b.last_verified.cmp(&a.last_verified)),
        })
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn store(cap: usize) -> PeerStore {
        PeerStore::new(Keypair::generate().peer_id(), NonZeroUsize::new(cap).unwrap())
    }

    fn addr(port: u64) -> PeerAddress {
        PeerAddress::memory(port)
    }

    #[test]
    fn merge_unions_addresses() {
        let mut store = store(8);
        let peer = Keypair::generate().peer_id();

        assert_eq!(store.merge(peer, &[addr(1)]), MergeOutcome::New);
        assert_eq!(store.merge(peer, &[addr(1)]), MergeOutcome::Unchanged);
        assert_eq!(store.merge(peer, &[addr(2), addr(1)]), MergeOutcome::Updated);
        assert_eq!(store.get(&peer).unwrap().addresses(), vec![addr(1), addr(2)]);
    }

    #[test]
    fn merge_strips_peer_suffix() {
        let mut store = store(8);
        let peer = Keypair::generate().peer_id();
        store.merge(peer, &[addr(1).with_peer_id(peer)]);
        assert_eq!(store.merge(peer, &[addr(1)]), MergeOutcome::Unchanged);
    }

    #[test]
    fn local_peer_is_never_stored() {
        let local = Keypair::generate().peer_id();
        let mut store = PeerStore::new(local, NonZeroUsize::new(4).unwrap());
        assert_eq!(store.merge(local, &[addr(1)]), MergeOutcome::Unchanged);
        assert!(store.is_empty());
    }

    #[test]
    fn priority_prefers_verified_then_untried_then_failed() {
        let mut store = store(8);
        let peer = Keypair::generate().peer_id();
        store.merge(peer, &[addr(1), addr(2), addr(3), addr(4)]);

        store.record_failure(peer, &addr(1));
        store.record_failure(peer, &addr(1));
        store.record_failure(peer, &addr(2));
        store.record_success(peer, &addr(4));

        assert_eq!(
            store.addresses_by_priority(&peer),
            vec![addr(4), addr(3), addr(2), addr(1)]
        );
    }

    #[test]
    fn success_clears_failures() {
        let mut store = store(8);
        let peer = Keypair::generate().peer_id();
        store.merge(peer, &[addr(1), addr(2)]);
        store.record_failure(peer, &addr(1));
        store.record_success(peer, &addr(1));
        assert_eq!(store.addresses_by_priority(&peer)[0], addr(1));
    }

    #[test]
    fn eviction_prefers_disconnected_peers() {
        let mut store = store(2);
        let connected = Keypair::generate().peer_id();
        let idle = Keypair::generate().peer_id();
        let newcomer = Keypair::generate().peer_id();

        store.merge(connected, &[addr(1)]);
        store.set_state(connected, ConnectionState::Connected);
        store.merge(idle, &[addr(2)]);
        store.merge(newcomer, &[addr(3)]);

        assert!(store.get(&connected).is_some());
        assert!(store.get(&idle).is_none());
        assert!(store.get(&newcomer).is_some());
    }

    #[test]
    fn address_set_is_bounded() {
        let mut store = store(2);
        let peer = Keypair::generate().peer_id();
        let many: Vec<_> = (0..(MAX_ADDRS_PER_PEER as u64 + 4)).map(addr).collect();
        store.merge(peer, &many);
        assert_eq!(store.get(&peer).unwrap().addrs.len(), MAX_ADDRS_PER_PEER);

        // A failed address makes room for a new one.
        store.record_failure(peer, &addr(0));
        assert_eq!(store.merge(peer, &[addr(999)]), MergeOutcome::Updated);
        assert!(store.addresses_by_priority(&peer).contains(&addr(999)));
        assert!(!store.addresses_by_priority(&peer).contains(&addr(0)));
    }
}
