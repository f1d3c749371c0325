//! # Neighbor Table
//!
//! Kademlia-style table of known overlay peers, keyed by XOR distance between
//! node identities.
//!
//! ## Bucket Organization
//!
//! ```text
//! Bucket 0:   distance has 0 leading zero bits (furthest half of the keyspace)
//! Bucket 1:   distance has 1 leading zero bit
//! ...
//! Bucket 255: closest
//! ```
//!
//! Each bucket holds at most `k` peers ordered from least to most recently
//! seen, and the table as a whole holds at most `capacity` peers.
//!
//! ## Liveness
//!
//! | Situation | Outcome |
//! |-----------|---------|
//! | bucket full | oldest peer returned as [`PeerToPing`], newcomer parked as replacement |
//! | pong arrives | oldest kept, replacement dropped |
//! | no pong within `pong_timeout` | oldest evicted and ended, replacement inserted |
//! | peer silent beyond `session_timeout` | evicted and ended |
//! | bucket idle beyond `idle_refresh` | random id in its range probed via "find node" |
//! | table at `capacity` | newcomer replaces the furthest peer if closer, else dropped |
//!
//! [`NeighborTable::sync`] reports probes and sessions to end; the table never
//! performs I/O itself.

use std::collections::{BinaryHeap, HashMap};
use std::num::NonZeroUsize;

use lru::LruCache;
use rand::seq::IteratorRandom;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::address::AddressCandidate;
use crate::config::NeighborConfig;
use crate::identity::{distance_cmp, Identity, NodeInfo};

/// Peers learned from one reporting peer per rate window.
const INSERTION_PER_PEER_LIMIT: usize = 50;

const INSERTION_RATE_WINDOW: Duration = Duration::from_secs(60);

const MAX_INSERTION_TRACKED_PEERS: usize = 1_000;

const NUM_BUCKETS: usize = 256;


#[derive(Debug, Clone, Copy)]
struct InsertionBucket {
    tokens: f64,
    last_update: Instant,
}

impl InsertionBucket {
    fn new() -> Self {
        Self {
            tokens: INSERTION_PER_PEER_LIMIT as f64,
            last_update: Instant::now(),
        }
    }

    fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        let rate = INSERTION_PER_PEER_LIMIT as f64 / INSERTION_RATE_WINDOW.as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(INSERTION_PER_PEER_LIMIT as f64);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Token bucket per reporting peer, limiting how fast one peer can fill our
/// table through `Peers` answers.
pub struct InsertionLimiter {
    buckets: LruCache<Identity, InsertionBucket>,
}

impl Default for InsertionLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl InsertionLimiter {
    pub fn new() -> Self {
        let cap = NonZeroUsize::new(MAX_INSERTION_TRACKED_PEERS).unwrap_or(NonZeroUsize::MIN);
        Self {
            buckets: LruCache::new(cap),
        }
    }

    pub fn allow_insertion(&mut self, from_peer: &Identity) -> bool {
        self.buckets
            .get_or_insert_mut(*from_peer, InsertionBucket::new)
            .try_consume()
    }
}


#[derive(Clone, Debug)]
pub struct PeerRecord {
    pub node: NodeInfo,
    /// Address the overlay session with this peer runs over.
    pub endpoint: AddressCandidate,
    pub last_message_time: Instant,
    pub pending_ping: bool,
}

impl PeerRecord {
    pub fn new(node: NodeInfo, endpoint: AddressCandidate) -> Self {
        Self {
            node,
            endpoint,
            last_message_time: Instant::now(),
            pending_ping: false,
        }
    }

    pub fn identity(&self) -> Identity {
        self.node.identity
    }
}

/// Oldest entry of a full bucket; the caller pings it and reports the pong.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerToPing {
    pub identity: Identity,
    pub endpoint: AddressCandidate,
}

#[derive(Debug, Default)]
pub struct SyncOutcome {
    /// Random lookup target of an idle bucket mapped to the neighbours to ask.
    pub peers_to_find: HashMap<Identity, Vec<PeerRecord>>,
    /// Peers whose sessions should be closed.
    pub sessions_to_end: Vec<Identity>,
}

#[derive(Debug)]
struct ExpectedPong {
    bucket_index: usize,
    replacement: PeerRecord,
    sent_at: Instant,
}

#[derive(Debug, Clone)]
struct Bucket {
    peers: Vec<PeerRecord>,
    last_refresh: Instant,
}

impl Bucket {
    fn new() -> Self {
        Self {
            peers: Vec::new(),
            last_refresh: Instant::now(),
        }
    }

    fn position(&self, id: &Identity) -> Option<usize> {
        self.peers.iter().position(|p| &p.node.identity == id)
    }

    fn remove(&mut self, id: &Identity) -> Option<PeerRecord> {
        self.position(id).map(|pos| self.peers.remove(pos))
    }

    /// Moves the peer to the most-recently-seen end.
    fn touch(&mut self, id: &Identity, now: Instant) -> bool {
        match self.remove(id) {
            Some(mut record) => {
                record.last_message_time = now;
                record.pending_ping = false;
                self.peers.push(record);
                self.last_refresh = now;
                true
            }
            None => false,
        }
    }
}


pub(crate) fn bucket_index(self_id: &Identity, other: &Identity) -> usize {
    let dist = self_id.xor_distance(other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    NUM_BUCKETS - 1
}

/// A random identity whose distance to `self_id` falls into `bucket_idx`.
pub(crate) fn random_id_for_bucket(self_id: &Identity, bucket_idx: usize) -> Identity {
    let bucket_idx = bucket_idx.min(NUM_BUCKETS - 1);
    let mut distance = [0u8; 32];
    rand::Rng::fill(&mut rand::thread_rng(), &mut distance[..]);

    let byte_idx = bucket_idx / 8;
    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }
    let target_bit = 0x80u8 >> (bucket_idx % 8);
    distance[byte_idx] = target_bit | (distance[byte_idx] & target_bit.wrapping_sub(1));

    let self_bytes = self_id.as_bytes();
    let mut target = [0u8; 32];
    for i in 0..32 {
        target[i] = self_bytes[i] ^ distance[i];
    }
    Identity::from_bytes(target)
}


#[derive(Debug)]
pub struct NeighborTable {
    self_id: Identity,
    config: NeighborConfig,
    buckets: Vec<Bucket>,
    expected_pongs: HashMap<Identity, ExpectedPong>,
    find_requests: HashMap<Identity, Instant>,
}

impl NeighborTable {
    pub fn new(self_id: Identity, config: NeighborConfig) -> Self {
        Self {
            self_id,
            config,
            buckets: (0..NUM_BUCKETS).map(|_| Bucket::new()).collect(),
            expected_pongs: HashMap::new(),
            find_requests: HashMap::new(),
        }
    }

    pub fn self_id(&self) -> Identity {
        self.self_id
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.peers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.peers.is_empty())
    }

    pub fn contains(&self, id: &Identity) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: &Identity) -> Option<&PeerRecord> {
        let idx = bucket_index(&self.self_id, id);
        self.buckets[idx].peers.iter().find(|p| &p.node.identity == id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.buckets.iter().flat_map(|b| b.peers.iter())
    }

    /// Inserts or refreshes a peer. Returns the peer to ping when the
    /// target bucket is full.
    pub fn add_peer(&mut self, node: NodeInfo, endpoint: AddressCandidate) -> Option<PeerToPing> {
        let id = node.identity;
        if id == self.self_id {
            return None;
        }
        let now = Instant::now();
        let idx = bucket_index(&self.self_id, &id);

        if let Some(pos) = self.buckets[idx].position(&id) {
            let bucket = &mut self.buckets[idx];
            let mut existing = bucket.peers.remove(pos);
            existing.node = node;
            existing.endpoint = endpoint;
            existing.last_message_time = now;
            bucket.peers.push(existing);
            bucket.last_refresh = now;
            return None;
        }

        let record = PeerRecord::new(node, endpoint);

        if self.buckets[idx].peers.len() >= self.config.k {
            let oldest = self.buckets[idx].peers.first_mut()?;
            let oldest_id = oldest.node.identity;
            if self.expected_pongs.contains_key(&oldest_id) {
                trace!(peer = %id.short(), "bucket full and already probing, dropping");
                return None;
            }
            oldest.pending_ping = true;
            let to_ping = PeerToPing {
                identity: oldest_id,
                endpoint: oldest.endpoint.clone(),
            };
            self.expected_pongs.insert(
                oldest_id,
                ExpectedPong {
                    bucket_index: idx,
                    replacement: record,
                    sent_at: now,
                },
            );
            return Some(to_ping);
        }

        if self.len() >= self.config.capacity && !self.evict_furthest_if_closer(&id) {
            trace!(peer = %id.short(), "table at capacity and peer not closer, dropping");
            return None;
        }

        let bucket = &mut self.buckets[idx];
        bucket.peers.push(record);
        bucket.last_refresh = now;
        debug!(peer = %id.short(), bucket = idx, "added neighbor");
        None
    }

    fn evict_furthest_if_closer(&mut self, candidate: &Identity) -> bool {
        let Some(worst) = self.furthest() else {
            return false;
        };
        let worst_dist = self.self_id.xor_distance(&worst);
        let candidate_dist = self.self_id.xor_distance(candidate);
        if distance_cmp(&candidate_dist, &worst_dist) != std::cmp::Ordering::Less {
            return false;
        }
        self.remove(&worst);
        debug!(evicted = %worst.short(), for_peer = %candidate.short(), "evicted furthest neighbor");
        true
    }

    fn furthest(&self) -> Option<Identity> {
        // Lower bucket index means larger distance.
        let bucket = self.buckets.iter().find(|b| !b.peers.is_empty())?;
        bucket
            .peers
            .iter()
            .map(|p| p.node.identity)
            .max_by(|a, b| {
                distance_cmp(&self.self_id.xor_distance(a), &self.self_id.xor_distance(b))
            })
    }

    pub fn remove(&mut self, id: &Identity) -> Option<PeerRecord> {
        let idx = bucket_index(&self.self_id, id);
        self.expected_pongs.remove(id);
        self.buckets[idx].remove(id)
    }

    /// Oldest peer answered; keep it and drop the parked replacement.
    pub fn pong_received(&mut self, id: &Identity) -> bool {
        let expected = self.expected_pongs.remove(id).is_some();
        self.set_last_message_time(id);
        expected
    }

    pub fn set_last_message_time(&mut self, id: &Identity) {
        let idx = bucket_index(&self.self_id, id);
        self.buckets[idx].touch(id, Instant::now());
    }

    /// Up to `k` known peers nearest to `target`, excluding `target` itself.
    pub fn neighbours(&self, target: &Identity, k: usize) -> Vec<PeerRecord> {
        self.closest_matching(target, k, |_| true)
    }

    /// Nearest known peers that can mediate a rendezvous.
    pub fn supernodes_near(&self, target: &Identity, k: usize) -> Vec<PeerRecord> {
        self.closest_matching(target, k, |p| p.node.is_supernode())
    }

    fn closest_matching<F>(&self, target: &Identity, k: usize, keep: F) -> Vec<PeerRecord>
    where
        F: Fn(&PeerRecord) -> bool,
    {
        if k == 0 {
            return Vec::new();
        }

        struct Ranked<'a> {
            dist: [u8; 32],
            record: &'a PeerRecord,
        }
        impl PartialEq for Ranked<'_> {
            fn eq(&self, other: &Self) -> bool {
                self.dist == other.dist
            }
        }
        impl Eq for Ranked<'_> {}
        impl PartialOrd for Ranked<'_> {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }
        impl Ord for Ranked<'_> {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }

        let mut heap: BinaryHeap<Ranked<'_>> = BinaryHeap::with_capacity(k + 1);
        for record in self.peers() {
            if &record.node.identity == target || !keep(record) {
                continue;
            }
            let dist = record.node.identity.xor_distance(target);
            if heap.len() < k {
                heap.push(Ranked { dist, record });
            } else if let Some(max) = heap.peek() {
                if distance_cmp(&dist, &max.dist) == std::cmp::Ordering::Less {
                    heap.pop();
                    heap.push(Ranked { dist, record });
                }
            }
        }

        heap.into_sorted_vec()
            .into_iter()
            .map(|ranked| ranked.record.clone())
            .collect()
    }

    pub fn random_peer(&self) -> Option<PeerRecord> {
        self.peers().choose(&mut rand::thread_rng()).cloned()
    }

    pub fn is_find_pending(&self, target: &Identity) -> bool {
        self.find_requests.contains_key(target)
    }

    pub fn sync(&mut self) -> SyncOutcome {
        self.sync_at(Instant::now())
    }

    pub fn sync_at(&mut self, now: Instant) -> SyncOutcome {
        let mut outcome = SyncOutcome::default();
        self.expire_pongs(now, &mut outcome);
        self.expire_silent(now, &mut outcome);

        let request_timeout = self.config.find_request_timeout;
        self.find_requests
            .retain(|_, sent| now.saturating_duration_since(*sent) <= request_timeout);

        let idle: Vec<usize> = self
            .buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                !b.peers.is_empty()
                    && now.saturating_duration_since(b.last_refresh) > self.config.idle_refresh
            })
            .map(|(idx, _)| idx)
            .collect();

        for idx in idle {
            let target = random_id_for_bucket(&self.self_id, idx);
            let neighbours = self.neighbours(&target, self.config.alpha);
            self.buckets[idx].last_refresh = now;
            if neighbours.is_empty() {
                continue;
            }
            self.find_requests.insert(target, now);
            outcome.peers_to_find.insert(target, neighbours);
        }

        outcome
    }

    fn expire_pongs(&mut self, now: Instant, outcome: &mut SyncOutcome) {
        let timeout = self.config.pong_timeout;
        let expired: Vec<Identity> = self
            .expected_pongs
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.sent_at) > timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            let Some(pending) = self.expected_pongs.remove(&id) else {
                continue;
            };
            let bucket = &mut self.buckets[pending.bucket_index];
            bucket.remove(&id);
            outcome.sessions_to_end.push(id);

            let replacement_id = pending.replacement.node.identity;
            if bucket.position(&replacement_id).is_none() && bucket.peers.len() < self.config.k {
                bucket.peers.push(pending.replacement);
            }
            debug!(
                evicted = %id.short(),
                replacement = %replacement_id.short(),
                "no pong from oldest neighbor"
            );
        }
    }

    fn expire_silent(&mut self, now: Instant, outcome: &mut SyncOutcome) {
        let timeout = self.config.session_timeout;
        for bucket in &mut self.buckets {
            bucket.peers.retain(|p| {
                if p.pending_ping || now.saturating_duration_since(p.last_message_time) <= timeout {
                    return true;
                }
                outcome.sessions_to_end.push(p.node.identity);
                false
            });
        }
    }

    /// Forgets everything, e.g. after the node changed its identity.
    pub fn restart(&mut self, self_id: Identity) {
        self.self_id = self_id;
        self.buckets = (0..NUM_BUCKETS).map(|_| Bucket::new()).collect();
        self.expected_pongs.clear();
        self.find_requests.clear();
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn id(first: u8, second: u8) -> Identity {
        let mut bytes = [0u8; 32];
        bytes[0] = first;
        bytes[1] = second;
        Identity::from_bytes(bytes)
    }

    fn node(identity: Identity) -> NodeInfo {
        NodeInfo::new(identity, format!("node-{}", identity.short()))
    }

    fn endpoint(port: u16) -> AddressCandidate {
        AddressCandidate::new("10.0.0.1", port.max(1)).unwrap()
    }

    fn table(k: usize, capacity: usize) -> NeighborTable {
        NeighborTable::new(
            id(0, 0),
            NeighborConfig {
                k,
                capacity,
                ..NeighborConfig::default()
            },
        )
    }

    #[test]
    fn bucket_index_finds_first_different_bit() {
        let self_id = id(0, 0);
        assert_eq!(bucket_index(&self_id, &id(0x80, 0)), 0);
        assert_eq!(bucket_index(&self_id, &id(0, 0x10)), 11);
        assert_eq!(bucket_index(&self_id, &self_id), 255);
    }

    #[test]
    fn random_id_for_bucket_lands_in_bucket() {
        let self_id = Identity::from_bytes([0x42u8; 32]);
        for bucket_idx in [0, 1, 7, 8, 15, 127, 200, 255] {
            for _ in 0..10 {
                let target = random_id_for_bucket(&self_id, bucket_idx);
                assert_eq!(bucket_index(&self_id, &target), bucket_idx);
            }
        }
    }

    #[test]
    fn rejects_self() {
        let mut table = table(4, 100);
        assert!(table.add_peer(node(id(0, 0)), endpoint(1)).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn full_bucket_asks_to_ping_oldest() {
        let mut table = table(2, 100);
        assert!(table.add_peer(node(id(0x80, 1)), endpoint(1)).is_none());
        assert!(table.add_peer(node(id(0x80, 2)), endpoint(2)).is_none());

        let to_ping = table.add_peer(node(id(0x80, 3)), endpoint(3)).unwrap();
        assert_eq!(to_ping.identity, id(0x80, 1));
        assert_eq!(table.len(), 2);

        // A second newcomer while the probe is outstanding is dropped.
        assert!(table.add_peer(node(id(0x80, 4)), endpoint(4)).is_none());

        assert!(table.pong_received(&id(0x80, 1)));
        let outcome = table.sync_at(Instant::now() + Duration::from_secs(6));
        assert!(!outcome.sessions_to_end.contains(&id(0x80, 1)));
        assert!(table.contains(&id(0x80, 1)));
        assert!(!table.contains(&id(0x80, 3)));
    }

    #[test]
    fn missing_pong_evicts_oldest_for_replacement() {
        let mut table = table(2, 100);
        table.add_peer(node(id(0x80, 1)), endpoint(1));
        table.add_peer(node(id(0x80, 2)), endpoint(2));
        table.add_peer(node(id(0x80, 3)), endpoint(3)).unwrap();

        let outcome = table.sync_at(Instant::now() + Duration::from_secs(6));
        assert_eq!(outcome.sessions_to_end, vec![id(0x80, 1)]);
        assert!(!table.contains(&id(0x80, 1)));
        assert!(table.contains(&id(0x80, 3)));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn size_never_exceeds_capacity() {
        let capacity = 20;
        let mut table = NeighborTable::new(
            Identity::from_bytes(rand::random()),
            NeighborConfig {
                k: 8,
                capacity,
                ..NeighborConfig::default()
            },
        );
        for i in 0..500u32 {
            let peer = Identity::from_bytes(rand::random());
            table.add_peer(node(peer), endpoint((i % 60000) as u16 + 1));
            assert!(table.len() <= capacity);
            if i % 50 == 0 {
                table.sync_at(Instant::now() + Duration::from_secs(6));
                assert!(table.len() <= capacity);
            }
        }
        assert!(table.len() >= capacity / 2);
    }

    #[test]
    fn closer_peer_replaces_furthest_at_capacity() {
        let mut table = table(4, 2);
        table.add_peer(node(id(0x80, 0)), endpoint(1));
        table.add_peer(node(id(0x40, 0)), endpoint(2));

        // Further than everything: dropped.
        table.add_peer(node(id(0xC0, 0)), endpoint(3));
        assert!(!table.contains(&id(0xC0, 0)));

        // Closer than the furthest: replaces it.
        table.add_peer(node(id(0x01, 0)), endpoint(4));
        assert!(table.contains(&id(0x01, 0)));
        assert!(!table.contains(&id(0x80, 0)));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn neighbours_sorted_and_exclude_target() {
        let mut table = table(8, 100);
        for first in [0x10, 0x20, 0x08, 0x18] {
            table.add_peer(node(id(first, 0)), endpoint(first as u16));
        }
        let found: Vec<u8> = table
            .neighbours(&id(0x18, 0), 3)
            .iter()
            .map(|p| p.identity().as_bytes()[0])
            .collect();
        assert_eq!(found, vec![0x10, 0x08, 0x20]);
        assert!(table.neighbours(&id(0x18, 0), 0).is_empty());
    }

    #[test]
    fn supernodes_near_filters_mediators() {
        let mut table = table(8, 100);
        let mut super_node = node(id(0x10, 0));
        super_node.pub_addr = Some("1.2.3.4".into());
        super_node.prv_addr = Some("1.2.3.4".into());
        super_node.p2p_pub_port = Some(40102);
        super_node.p2p_prv_port = Some(40102);
        table.add_peer(super_node, endpoint(1));
        table.add_peer(node(id(0x11, 0)), endpoint(2));

        let found = table.supernodes_near(&id(0x11, 0), 5);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].identity(), id(0x10, 0));
    }

    #[test]
    fn silent_peers_are_ended() {
        let mut table = table(8, 100);
        table.add_peer(node(id(0x80, 1)), endpoint(1));
        table.add_peer(node(id(0x40, 1)), endpoint(2));

        let later = Instant::now() + Duration::from_secs(241);
        let outcome = table.sync_at(later);
        assert_eq!(outcome.sessions_to_end.len(), 2);
        assert!(table.is_empty());
    }

    #[test]
    fn message_time_keeps_peer_alive() {
        let mut table = table(8, 100);
        table.add_peer(node(id(0x80, 1)), endpoint(1));
        table.set_last_message_time(&id(0x80, 1));
        let outcome = table.sync_at(Instant::now() + Duration::from_secs(100));
        assert!(outcome.sessions_to_end.is_empty());
        assert!(table.contains(&id(0x80, 1)));
    }

    #[test]
    fn idle_buckets_produce_lookups() {
        let mut table = table(8, 100);
        table.add_peer(node(id(0x80, 1)), endpoint(1));
        table.add_peer(node(id(0x40, 1)), endpoint(2));

        let outcome = table.sync_at(Instant::now() + Duration::from_secs(4));
        assert_eq!(outcome.peers_to_find.len(), 2);
        for (target, peers) in &outcome.peers_to_find {
            assert!(table.is_find_pending(target));
            assert!(!peers.is_empty());
        }

        // Buckets were just refreshed.
        let again = table.sync_at(Instant::now() + Duration::from_secs(5));
        assert!(again.peers_to_find.is_empty());

        // Find requests expire.
        table.sync_at(Instant::now() + Duration::from_secs(30));
        assert!(outcome.peers_to_find.keys().all(|t| !table.is_find_pending(t)));
    }

    #[test]
    fn restart_clears_everything() {
        let mut table = table(8, 100);
        table.add_peer(node(id(0x80, 1)), endpoint(1));
        table.restart(id(0x01, 0));
        assert!(table.is_empty());
        assert_eq!(table.self_id(), id(0x01, 0));
    }

    #[test]
    fn insertion_limiter_enforces_per_peer_limit() {
        let mut limiter = InsertionLimiter::new();
        let peer1 = id(1, 0);
        let peer2 = id(2, 0);
        for _ in 0..INSERTION_PER_PEER_LIMIT {
            assert!(limiter.allow_insertion(&peer1));
        }
        assert!(!limiter.allow_insertion(&peer1));
        assert!(limiter.allow_insertion(&peer2));
    }
}
