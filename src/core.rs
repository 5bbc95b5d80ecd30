//! Core identity, hashing, and routing logic.
//!
//! This module contains the transport-agnostic building blocks of the DHT:
//!
//! - **Identity & Hashing**: [`Hash`], [`PeerId`], [`blake3_digest`]
//! - **Distance Metrics**: [`xor_distance`] for Kademlia-style routing
//! - **Routing**: [`RoutingTable`] for peer bookkeeping
//! - **Lookup**: the [`NodeLookup`] capability with [`SelfLookup`] and
//!   [`KademliaLookup`] implementations

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

/// Number of bits in identifiers and keys; one routing bucket per bit.
const ID_BITS: usize = 256;

// ============================================================================
// Hashing Functions
// ============================================================================

/// Compute a 32-byte BLAKE3 digest of the input data.
pub fn blake3_digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(data);
    let digest = hasher.finalize();

    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_bytes());
    out
}

/// Implements hex rendering, parsing, and string serde for 32-byte identifiers.
macro_rules! hex_identifier {
    ($name:ident, $label:literal) => {
        impl $name {
            /// Wrap raw identifier bytes.
            pub const fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Raw identifier bytes.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &hex::encode(self.0)[..8])
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                let bytes = hex::decode(s)
                    .map_err(|e| Error::Parse(format!("{} {s:?}: {e}", $label)))?;
                let bytes: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
                    Error::Parse(format!("{} must be 32 bytes, got {}", $label, bytes.len()))
                })?;
                Ok(Self(bytes))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

/// A 256-bit content-addressed key.
///
/// Keys are the BLAKE3 hash of the content, so a stored value can always be
/// checked against the key it was offered under:
///
/// ```
/// use peer_dht::Hash;
///
/// let key = Hash::digest(b"fish");
/// assert!(key.verify(b"fish"));
/// assert!(!key.verify(b"chips"));
/// assert_eq!(key.to_string().parse::<Hash>().unwrap(), key);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; 32]);

hex_identifier!(Hash, "hash");

impl Hash {
    /// Compute the key for a piece of content.
    pub fn digest(data: &[u8]) -> Self {
        Self(blake3_digest(data))
    }

    /// Check that `value` is the content this key was derived from.
    pub fn verify(&self, value: &[u8]) -> bool {
        blake3_digest(value) == self.0
    }
}

/// A peer's network identity.
///
/// Derived by hashing the ed25519 public key of the peer's private key, which
/// makes it deterministic and places peers in the same 256-bit space as
/// [`Hash`] keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 32]);

hex_identifier!(PeerId, "peer id");

impl PeerId {
    /// Derive the peer id for a 32-byte ed25519 private key.
    ///
    /// ```
    /// use peer_dht::PeerId;
    ///
    /// let key = [7u8; 32];
    /// assert_eq!(PeerId::from_private_key(&key)?, PeerId::from_private_key(&key)?);
    /// assert!(PeerId::from_private_key(&key[..16]).is_err());
    /// # Ok::<(), peer_dht::Error>(())
    /// ```
    pub fn from_private_key(private_key: &[u8]) -> Result<Self> {
        let secret: [u8; 32] = private_key.try_into().map_err(|_| {
            Error::Parse(format!("private key must be 32 bytes, got {}", private_key.len()))
        })?;
        let signing_key = SigningKey::from_bytes(&secret);
        Ok(Self(blake3_digest(signing_key.verifying_key().as_bytes())))
    }
}

// ============================================================================
// Distance Metrics
// ============================================================================

/// Compute the XOR distance between two 256-bit identifiers.
///
/// # Properties
/// - `xor_distance(a, a) == [0; 32]`
/// - `xor_distance(a, b) == xor_distance(b, a)`
/// - for a fixed `a`, distinct `b` give distinct distances
pub fn xor_distance(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Compare two XOR distances as big-endian integers.
fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    a.cmp(b)
}

/// Index of the bucket `other` falls into, seen from `self_id`.
///
/// The index is the position of the first differing bit. Identical ids land in
/// the last bucket.
fn bucket_index(self_id: &PeerId, other: &PeerId) -> usize {
    let dist = xor_distance(self_id.as_bytes(), other.as_bytes());
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            let leading = byte.leading_zeros() as usize;
            return byte_idx * 8 + leading;
        }
    }
    ID_BITS - 1
}

// ============================================================================
// Routing Table
// ============================================================================

/// A single routing bucket.
///
/// Holds up to k peers in LRU order (oldest first). When full, long-lived
/// peers are kept and newcomers are dropped.
#[derive(Debug, Default, Clone)]
struct Bucket {
    peers: Vec<PeerId>,
}

impl Bucket {
    /// Add or refresh a peer. Returns false when the bucket is full.
    fn touch(&mut self, peer: PeerId, k: usize) -> bool {
        if let Some(pos) = self.peers.iter().position(|p| *p == peer) {
            let existing = self.peers.remove(pos);
            self.peers.push(existing);
            return true;
        }

        if self.peers.len() < k {
            self.peers.push(peer);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, peer: &PeerId) -> bool {
        if let Some(pos) = self.peers.iter().position(|p| p == peer) {
            self.peers.remove(pos);
            true
        } else {
            false
        }
    }
}

/// Kademlia routing table with one bucket per bit of the id space.
#[derive(Debug)]
pub struct RoutingTable {
    /// This node's id.
    self_id: PeerId,
    /// Maximum peers per bucket.
    k: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    /// Create an empty routing table for `self_id`.
    pub fn new(self_id: PeerId, k: usize) -> Self {
        Self {
            self_id,
            k: k.max(1),
            buckets: vec![Bucket::default(); ID_BITS],
        }
    }

    /// Update the bucket size, trimming the oldest peers of overfull buckets.
    pub fn set_k(&mut self, k: usize) {
        self.k = k.max(1);
        for bucket in &mut self.buckets {
            while bucket.peers.len() > self.k {
                bucket.peers.remove(0);
            }
        }
    }

    /// Add or refresh a peer.
    ///
    /// Returns false when the peer was not added: it is this node, or its
    /// bucket is already full.
    pub fn update(&mut self, peer: PeerId) -> bool {
        if peer == self.self_id {
            return false;
        }
        let idx = bucket_index(&self.self_id, &peer);
        self.buckets[idx].touch(peer, self.k)
    }

    /// Remove a peer. Returns true if it was present.
    pub fn remove(&mut self, peer: &PeerId) -> bool {
        let idx = bucket_index(&self.self_id, peer);
        self.buckets[idx].remove(peer)
    }

    /// Whether `peer` is in the table.
    pub fn contains(&self, peer: &PeerId) -> bool {
        let idx = bucket_index(&self.self_id, peer);
        self.buckets[idx].peers.contains(peer)
    }

    /// Number of peers across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.peers.len()).sum()
    }

    /// Whether the table holds no peers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the `k` peers closest to `target`, nearest first.
    pub fn closest(&self, target: &[u8; 32], k: usize) -> Vec<PeerId> {
        let mut all: Vec<PeerId> = self
            .buckets
            .iter()
            .flat_map(|b| b.peers.iter().copied())
            .collect();

        sort_by_distance(&mut all, target);
        all.truncate(k);
        all
    }
}

fn sort_by_distance(peers: &mut [PeerId], target: &[u8; 32]) {
    peers.sort_by(|a, b| {
        let da = xor_distance(a.as_bytes(), target);
        let db = xor_distance(b.as_bytes(), target);
        distance_cmp(&da, &db)
    });
}

// ============================================================================
// Lookup Capability
// ============================================================================

/// Finds the peer responsible for a key.
///
/// Implementations must be deterministic: with an unchanged peer set, the same
/// key always resolves to the same peer. When peers join or leave, the
/// responsibility moves to whichever peer is now nearest.
#[async_trait]
pub trait NodeLookup: Send + Sync + 'static {
    /// Return the peer currently closest to `key`.
    async fn find_node_for_hash(&self, key: &Hash) -> Result<PeerId>;
}

/// Single-node lookup: every key belongs to this node.
#[derive(Clone, Copy, Debug)]
pub struct SelfLookup {
    self_id: PeerId,
}

impl SelfLookup {
    pub fn new(self_id: PeerId) -> Self {
        Self { self_id }
    }
}

#[async_trait]
impl NodeLookup for SelfLookup {
    async fn find_node_for_hash(&self, _key: &Hash) -> Result<PeerId> {
        Ok(self.self_id)
    }
}

/// XOR-distance lookup backed by a [`RoutingTable`].
///
/// Peers are fed in with [`observe`](Self::observe) as they become known and
/// removed with [`forget`](Self::forget) when they leave.
#[derive(Debug)]
pub struct KademliaLookup {
    self_id: PeerId,
    /// Whether this node competes for responsibility with its known peers.
    include_self: bool,
    routing: Mutex<RoutingTable>,
}

impl KademliaLookup {
    /// Lookup in which this node is itself a candidate.
    pub fn new(self_id: PeerId, k: usize) -> Self {
        Self {
            self_id,
            include_self: true,
            routing: Mutex::new(RoutingTable::new(self_id, k)),
        }
    }

    /// Lookup for a node that never stores data itself.
    pub fn without_self(self_id: PeerId, k: usize) -> Self {
        Self {
            include_self: false,
            ..Self::new(self_id, k)
        }
    }

    /// Record a peer as reachable.
    pub async fn observe(&self, peer: PeerId) {
        let mut rt = self.routing.lock().await;
        if !rt.update(peer) && peer != self.self_id {
            debug!(peer = %peer, "bucket full, keeping long-lived peers");
        }
    }

    /// Drop a peer that left. Returns true if it was known.
    pub async fn forget(&self, peer: &PeerId) -> bool {
        let mut rt = self.routing.lock().await;
        rt.remove(peer)
    }

    /// Number of known peers, excluding this node.
    pub async fn peer_count(&self) -> usize {
        let rt = self.routing.lock().await;
        rt.len()
    }

    /// The `n` candidates closest to `key`, nearest first.
    pub async fn closest(&self, key: &Hash, n: usize) -> Vec<PeerId> {
        let target = key.as_bytes();
        let mut candidates = {
            let rt = self.routing.lock().await;
            rt.closest(target, n)
        };
        if self.include_self {
            candidates.push(self.self_id);
            sort_by_distance(&mut candidates, target);
            candidates.truncate(n);
        }
        candidates
    }
}

#[async_trait]
impl NodeLookup for KademliaLookup {
    async fn find_node_for_hash(&self, key: &Hash) -> Result<PeerId> {
        self.closest(key, 1)
            .await
            .into_iter()
            .next()
            .ok_or_else(|| Error::Routing(format!("no known peers to route {key}")))
    }
}
