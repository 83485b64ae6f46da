//! Core DHT logic: identifiers, the XOR metric, routing tables, and storage.
//!
//! This module contains the transport-agnostic building blocks:
//!
//! - **Identity & Hashing**: [`PeerId`], [`NodeId`], [`xor_distance`]
//! - **Routing**: [`PeerRoutingTable`] with 256 k-buckets and permanent slots
//! - **Provider Index**: [`ContentRoutingTable`] with per-entry expiry
//! - **Storage**: validator-gated key/value records with a TTL
//! - **Configuration**: [`Config`] and [`RandomWalkConfig`]
//!
//! Everything here is synchronous; the async layers in [`crate::lookup`] and
//! [`crate::node`] share these structures behind `tokio::sync::Mutex`.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::Error;

// ============================================================================
// Identifiers
// ============================================================================

/// A DHT key: an opaque byte sequence chosen by the caller.
///
/// Keys are hashed to a [`NodeId`] for routing; the raw bytes travel on the
/// wire unchanged.
pub type Key = Vec<u8>;

/// Opaque identity of a peer.
///
/// The DHT never inspects the bytes; it only compares them and hashes them
/// into a [`NodeId`] for routing purposes.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(Vec<u8>);

impl PeerId {
    /// Wrap raw peer identity bytes (e.g. a multihash) into a `PeerId`.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The canonical byte representation.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", hex::encode(&self.0))
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

/// A 256-bit identifier in the DHT keyspace, derived by SHA-256.
///
/// Both peers and keys are mapped into the same keyspace so that XOR
/// distance between them is meaningful.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId([u8; 32]);

/// An XOR distance between two [`NodeId`]s.
///
/// Compared lexicographically, which matches the interpretation of the XOR
/// result as a 256-bit unsigned integer with bit 0 most significant.
pub type Distance = [u8; 32];

impl NodeId {
    /// Derive a `NodeId` as the SHA-256 digest of arbitrary input bytes.
    pub fn hash(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }

    /// The `NodeId` of a peer: the SHA-256 digest of its canonical bytes.
    pub fn from_peer(peer: &PeerId) -> Self {
        Self::hash(peer.as_bytes())
    }

    /// Build a `NodeId` from raw digest bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// XOR distance to another id.
    pub fn distance(&self, other: &NodeId) -> Distance {
        xor_distance(&self.0, &other.0)
    }

    /// Number of leading bits shared with another id, in `[0, 256]`.
    pub fn common_prefix_len(&self, other: &NodeId) -> usize {
        for (byte_idx, byte) in xor_distance(&self.0, &other.0).iter().enumerate() {
            if *byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        256
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

/// Compute the XOR distance between two 256-bit identifiers.
pub fn xor_distance(a: &[u8; 32], b: &[u8; 32]) -> Distance {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

// ============================================================================
// Configuration
// ============================================================================

/// The protocol id registered with the host by default.
pub const DEFAULT_PROTOCOL: &str = "/ipfs/kad/1.0.0";

/// Random walk scheduling parameters.
///
/// Each period issues `queries_per_period` lookups of uniformly random
/// targets, spaced `delay` apart, and then sleeps for the remainder of
/// `interval`.
#[derive(Clone, Debug)]
pub struct RandomWalkConfig {
    pub enabled: bool,
    pub delay: Duration,
    pub interval: Duration,
    pub queries_per_period: usize,
}

impl Default for RandomWalkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: Duration::from_secs(10),
            interval: Duration::from_secs(300),
            queries_per_period: 1,
        }
    }
}

/// Tunable parameters of the DHT.
#[derive(Clone, Debug)]
pub struct Config {
    /// Protocol ids accepted on inbound streams (and dialed outbound).
    pub protocols: Vec<String>,
    /// Maximum peers per k-bucket (Kademlia's `k`).
    pub bucket_size: usize,
    /// Lookup concurrency (Kademlia's `α`).
    pub alpha: usize,
    /// How many peers/providers to attach to a reply.
    pub closer_peer_count: usize,
    /// How many peers receive a record or provider announcement.
    pub replication_factor: usize,
    /// Per-hop RPC timeout.
    pub request_timeout: Duration,
    /// Idle timeout for the read that follows a write on a session.
    pub response_timeout: Duration,
    /// Lifetime of a stored record.
    pub record_ttl: Duration,
    /// Lifetime of a provider entry.
    pub provider_ttl: Duration,
    /// Background random walk schedule.
    pub random_walk: RandomWalkConfig,
    /// Identification string presented to peers.
    pub client_version: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protocols: vec![DEFAULT_PROTOCOL.to_owned()],
            bucket_size: 20,
            alpha: 3,
            closer_peer_count: 6,
            replication_factor: 20,
            request_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(30),
            record_ttl: Duration::from_secs(24 * 60 * 60),
            provider_ttl: Duration::from_secs(24 * 60 * 60),
            random_walk: RandomWalkConfig::default(),
            client_version: concat!("kadstream/", env!("CARGO_PKG_VERSION")).to_owned(),
        }
    }
}

// ============================================================================
// Peer Routing Table
// ============================================================================

/// Outcome of [`PeerRoutingTable::update`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The peer was newly inserted into its bucket.
    Added,
    /// The peer was already present and was refreshed.
    Updated,
    /// The insert was refused (local peer, or a full bucket that could not
    /// evict).
    Rejected,
}

/// Event emitted when the routing table changes.
#[derive(Clone, Debug)]
pub enum RoutingEvent {
    PeerAdded(PeerId),
    PeerRemoved(PeerId),
}

#[derive(Clone, Debug)]
struct BucketEntry {
    peer: PeerId,
    id: NodeId,
    permanent: bool,
    connected: bool,
}

/// One k-bucket.
///
/// Entries are kept in least-recently-seen order within two classes:
/// permanent entries occupy the front of the bucket and are exempt from
/// eviction; non-permanent entries follow, with the eviction candidate at
/// the head of that class and the most recently seen peer at the tail.
#[derive(Debug, Default)]
struct Bucket {
    entries: Vec<BucketEntry>,
}

impl Bucket {
    fn position(&self, peer: &PeerId) -> Option<usize> {
        self.entries.iter().position(|e| &e.peer == peer)
    }

    /// Index of the first non-permanent entry, i.e. the end of the
    /// permanent section.
    fn permanent_end(&self) -> usize {
        self.entries
            .iter()
            .position(|e| !e.permanent)
            .unwrap_or(self.entries.len())
    }

    fn insert(&mut self, entry: BucketEntry) {
        if entry.permanent {
            let at = self.permanent_end();
            self.entries.insert(at, entry);
        } else {
            self.entries.push(entry);
        }
    }
}

/// Kademlia routing table: 256 k-buckets indexed by the common prefix
/// length between the local [`NodeId`] and the peer's.
///
/// Invariants:
/// - a peer appears in at most one bucket;
/// - a bucket never exceeds `bucket_size` entries;
/// - the local peer id is never inserted;
/// - permanent entries are never evicted.
pub struct PeerRoutingTable {
    local: PeerId,
    local_id: NodeId,
    bucket_size: usize,
    buckets: Vec<Bucket>,
    events: broadcast::Sender<RoutingEvent>,
}

impl PeerRoutingTable {
    pub fn new(local: PeerId, bucket_size: usize) -> Self {
        let local_id = NodeId::from_peer(&local);
        let mut buckets = Vec::with_capacity(256);
        buckets.resize_with(256, Bucket::default);
        let (events, _) = broadcast::channel(64);
        Self {
            local,
            local_id,
            bucket_size,
            buckets,
            events,
        }
    }

    /// Observe addition and removal of peers.
    pub fn subscribe(&self) -> broadcast::Receiver<RoutingEvent> {
        self.events.subscribe()
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        self.local_id.common_prefix_len(id).min(255)
    }

    /// Insert or refresh a peer.
    ///
    /// A refresh moves the peer to the tail of its class and updates its
    /// flags. An insert into a full bucket evicts the least-recently-seen
    /// non-permanent entry, but only when the candidate `is_connected`;
    /// otherwise the insert is rejected.
    pub fn update(&mut self, peer: PeerId, permanent: bool, is_connected: bool) -> UpdateOutcome {
        if peer == self.local {
            trace!("refusing to insert the local peer into the routing table");
            return UpdateOutcome::Rejected;
        }

        let id = NodeId::from_peer(&peer);
        let idx = self.bucket_index(&id);
        let bucket = &mut self.buckets[idx];

        if let Some(pos) = bucket.position(&peer) {
            let mut entry = bucket.entries.remove(pos);
            entry.connected = is_connected;
            entry.permanent |= permanent;
            bucket.insert(entry);
            return UpdateOutcome::Updated;
        }

        let entry = BucketEntry {
            peer: peer.clone(),
            id,
            permanent,
            connected: is_connected,
        };

        if bucket.entries.len() < self.bucket_size {
            bucket.insert(entry);
            let _ = self.events.send(RoutingEvent::PeerAdded(peer));
            return UpdateOutcome::Added;
        }

        if !is_connected {
            trace!(bucket = idx, "bucket full, rejecting unconnected candidate");
            return UpdateOutcome::Rejected;
        }

        // Evict the least-recently-seen non-permanent entry, if any.
        let victim_pos = bucket.permanent_end();
        if victim_pos >= bucket.entries.len() {
            trace!(bucket = idx, "bucket full of permanent peers");
            return UpdateOutcome::Rejected;
        }
        let victim = bucket.entries.remove(victim_pos);
        debug!(
            evicted = %victim.peer,
            bucket = idx,
            "evicting least-recently-seen peer for connected candidate"
        );
        let _ = self.events.send(RoutingEvent::PeerRemoved(victim.peer));
        bucket.insert(entry);
        let _ = self.events.send(RoutingEvent::PeerAdded(peer));
        UpdateOutcome::Added
    }

    /// Remove a peer from its bucket, if present.
    pub fn remove(&mut self, peer: &PeerId) {
        let id = NodeId::from_peer(peer);
        let idx = self.bucket_index(&id);
        let bucket = &mut self.buckets[idx];
        if let Some(pos) = bucket.position(peer) {
            bucket.entries.remove(pos);
            let _ = self.events.send(RoutingEvent::PeerRemoved(peer.clone()));
        }
    }

    /// The `count` peers nearest to `target`, ascending by XOR distance.
    pub fn nearest_peers(&self, target: &NodeId, count: usize) -> Vec<PeerId> {
        let mut all: Vec<(Distance, PeerId)> = self
            .buckets
            .iter()
            .flat_map(|b| b.entries.iter())
            .map(|e| (e.id.distance(target), e.peer.clone()))
            .collect();
        all.sort();
        all.truncate(count);
        all.into_iter().map(|(_, peer)| peer).collect()
    }

    /// Total number of peers across all buckets.
    pub fn size(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }
}

// ============================================================================
// Content Routing Table
// ============================================================================

/// Event emitted when the provider index changes.
#[derive(Clone, Debug)]
pub enum ProviderEvent {
    Added { key: Key, peer: PeerId },
    Expired { key: Key, peer: PeerId },
}

#[derive(Clone, Debug)]
struct ProviderEntry {
    peer: PeerId,
    expires_at: Instant,
}

/// Time-expiring index from content key to the peers that announced it.
pub struct ContentRoutingTable {
    provider_ttl: Duration,
    providers: HashMap<Key, Vec<ProviderEntry>>,
    events: broadcast::Sender<ProviderEvent>,
}

impl ContentRoutingTable {
    pub fn new(provider_ttl: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            provider_ttl,
            providers: HashMap::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }

    /// Record `peer` as a provider for `key` until `now + provider_ttl`.
    ///
    /// Re-announcing refreshes the expiry of the existing entry, so repeated
    /// calls keep exactly one entry per (key, peer).
    pub fn add_provider(&mut self, key: &[u8], peer: PeerId) {
        let expires_at = Instant::now() + self.provider_ttl;
        let entries = self.providers.entry(key.to_vec()).or_default();
        if let Some(entry) = entries.iter_mut().find(|e| e.peer == peer) {
            entry.expires_at = expires_at;
            return;
        }
        trace!(key = %hex::encode(&key[..key.len().min(8)]), peer = %peer, "provider added");
        entries.push(ProviderEntry { peer: peer.clone(), expires_at });
        let _ = self.events.send(ProviderEvent::Added {
            key: key.to_vec(),
            peer,
        });
    }

    /// Non-expired providers of `key`, ordered ascending by the XOR distance
    /// from the hashed key to the hashed provider id.
    ///
    /// `limit = None` returns all of them.
    pub fn providers_for(&self, key: &[u8], limit: Option<usize>) -> Vec<PeerId> {
        let target = NodeId::hash(key);
        let now = Instant::now();
        let mut found: Vec<(Distance, PeerId)> = self
            .providers
            .get(key)
            .into_iter()
            .flatten()
            .filter(|e| e.expires_at > now)
            .map(|e| (NodeId::from_peer(&e.peer).distance(&target), e.peer.clone()))
            .collect();
        found.sort();
        if let Some(limit) = limit {
            found.truncate(limit);
        }
        found.into_iter().map(|(_, peer)| peer).collect()
    }

    /// Drop expired entries, emitting [`ProviderEvent::Expired`] for each.
    pub fn sweep(&mut self) {
        let now = Instant::now();
        let events = &self.events;
        self.providers.retain(|key, entries| {
            entries.retain(|entry| {
                if entry.expires_at > now {
                    return true;
                }
                let _ = events.send(ProviderEvent::Expired {
                    key: key.clone(),
                    peer: entry.peer.clone(),
                });
                false
            });
            !entries.is_empty()
        });
    }

    /// Number of live (key, provider) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.providers
            .values()
            .flatten()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Record Storage
// ============================================================================

/// Accepts or rejects records, and arbitrates between competing values for
/// the same key.
///
/// Embedders plug in domain validators (e.g. for signed name records); the
/// default [`AcceptAllValidator`] admits everything.
pub trait Validator: Send + Sync {
    /// Accept or reject a (key, value) pair.
    fn validate(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()>;

    /// Choose the best among several accepted values for the same key,
    /// returning its index. `values` is never empty.
    fn select(&self, key: &[u8], values: &[Vec<u8>]) -> usize;
}

/// A [`Validator`] that admits every record and prefers the first value.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAllValidator;

impl Validator for AcceptAllValidator {
    fn validate(&self, _key: &[u8], _value: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }

    fn select(&self, _key: &[u8], _values: &[Vec<u8>]) -> usize {
        0
    }
}

/// Upper bound on resident records, independent of TTL expiry.
const STORAGE_MAX_RECORDS: usize = 100_000;

#[derive(Clone, Debug)]
struct StoredRecord {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-memory record store with validator-gated writes and TTL reads.
///
/// Records past their expiry read as [`Error::NotFound`] and are dropped on
/// access. Capacity is additionally bounded by an LRU policy so a busy node
/// cannot grow without limit.
pub struct Storage {
    records: LruCache<Key, StoredRecord>,
    validator: Arc<dyn Validator>,
    record_ttl: Duration,
}

impl Storage {
    pub fn new(validator: Arc<dyn Validator>, record_ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(STORAGE_MAX_RECORDS).expect("capacity must be non-zero");
        Self {
            records: LruCache::new(cap),
            validator,
            record_ttl,
        }
    }

    /// Validate and store a record with expiry `now + record_ttl`.
    ///
    /// When a live record already exists under `key`, the new value replaces
    /// it only if the validator's `select` prefers the new value; otherwise
    /// the existing record (and its expiry) is kept and `Ok` is returned.
    pub fn put(&mut self, key: Key, value: Vec<u8>) -> Result<(), Error> {
        self.validator
            .validate(&key, &value)
            .map_err(|e| Error::ValidationFailed(e.to_string()))?;

        if let Some(existing) = self.records.peek(&key) {
            if existing.expires_at > Instant::now() {
                let pair = [existing.value.clone(), value.clone()];
                if self.validator.select(&key, &pair) == 0 {
                    trace!(
                        key = %hex::encode(&key[..key.len().min(8)]),
                        "existing record preferred, keeping it"
                    );
                    return Ok(());
                }
            }
        }

        self.records.put(
            key,
            StoredRecord {
                value,
                expires_at: Instant::now() + self.record_ttl,
            },
        );
        Ok(())
    }

    /// Read a live record, returning the value and its expiry instant.
    ///
    /// Expired records are dropped and read as [`Error::NotFound`].
    pub fn get(&mut self, key: &[u8]) -> Result<(Vec<u8>, Instant), Error> {
        match self.records.get(key) {
            Some(record) if record.expires_at > Instant::now() => {
                Ok((record.value.clone(), record.expires_at))
            }
            Some(_) => {
                self.records.pop(key);
                Err(Error::NotFound)
            }
            None => Err(Error::NotFound),
        }
    }

    /// Number of resident records, counting not-yet-collected expired ones.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
