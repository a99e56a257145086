//! The Kademlia routing table: `GUID_BITS` buckets, each holding up to `k`
//! live entries plus an unbounded-in-spirit (in practice bounded by churn)
//! replacement cache of most-recently-seen-but-not-yet-promoted contacts.
//!
//! Bucket indexing follows the canonical definition: bucket `i` holds peers
//! whose common prefix length with `self_id` is exactly `GUID_BITS - 1 - i`,
//! i.e. peers whose XOR distance from `self_id` has its most significant set
//! bit at position `i` (bit 0 = MSB of byte 0). The closest possible peers
//! (prefix length `GUID_BITS - 1`) land in bucket 0; the furthest (prefix
//! length 0) land in bucket `GUID_BITS - 1`.

use std::collections::{BTreeMap, VecDeque};

use kad_proto::bencode::{self, BencValue};
use kad_proto::guid::{Guid, NodeInfo, GUID_BITS};
use kad_proto::message::{decode_compact_node, encode_compact_node};

use crate::{DhtError, Result, K, STALE_THRESHOLD};

/// A single routing table entry: the peer plus liveness bookkeeping.
#[derive(Clone, Debug)]
pub struct BucketEntry {
    pub info: NodeInfo,
    pub last_seen: u64,
    pub stale_count: u32,
}

impl BucketEntry {
    fn fresh(info: NodeInfo, now: u64) -> Self {
        Self {
            info,
            last_seen: now,
            stale_count: 0,
        }
    }
}

#[derive(Default)]
struct Bucket {
    entries: Vec<BucketEntry>,
    replacements: VecDeque<BucketEntry>,
}

/// The outcome of an [`RoutingTable::upsert`] call, reported so the caller
/// (the lookup engine, or the daemon's query dispatcher) knows whether a
/// ping of the evicted incumbent is owed.
#[derive(Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The peer was new and the bucket had room; inserted directly.
    Inserted,
    /// The peer was already present; its `last_seen`/`stale_count` were
    /// refreshed.
    Refreshed,
    /// The bucket was full. The peer was placed in the replacement cache
    /// (most-recent at the back, oldest evicted first if the cache would
    /// grow unbounded).
    CachedAsReplacement,
}

/// A Kademlia routing table rooted at `self_id`, with capacity `k` per
/// bucket, backed by a per-bucket replacement cache.
pub struct RoutingTable {
    self_id: Guid,
    k: usize,
    buckets: Vec<Bucket>,
    replacement_cache_cap: usize,
}

impl RoutingTable {
    /// Build an empty routing table for `self_id` with bucket capacity `k`.
    pub fn new(self_id: Guid, k: usize) -> Self {
        let mut buckets = Vec::with_capacity(GUID_BITS);
        buckets.resize_with(GUID_BITS, Bucket::default);
        Self {
            self_id,
            k,
            buckets,
            replacement_cache_cap: k,
        }
    }

    /// Build a routing table with the canonical `k`.
    pub fn with_default_k(self_id: Guid) -> Self {
        Self::new(self_id, K)
    }

    /// The identifier this table is rooted at.
    pub fn self_id(&self) -> Guid {
        self.self_id
    }

    fn bucket_index(&self, id: &Guid) -> Option<usize> {
        self.self_id
            .common_prefix_len(id)
            .map(|prefix_len| GUID_BITS - 1 - prefix_len)
    }

    /// Insert or refresh a peer. Returns [`DhtError::IsSelf`] if `info.id`
    /// equals `self_id`.
    pub fn upsert(&mut self, info: NodeInfo, now: u64) -> Result<UpsertOutcome> {
        let idx = self.bucket_index(&info.id).ok_or(DhtError::IsSelf)?;
        let bucket = &mut self.buckets[idx];

        if let Some(existing) = bucket.entries.iter_mut().find(|e| e.info.id == info.id) {
            if existing.info.addr != info.addr {
                tracing::warn!(
                    id = %info.id,
                    old_addr = %existing.info.addr,
                    new_addr = %info.addr,
                    "peer address changed"
                );
            }
            existing.info = info;
            existing.last_seen = now;
            existing.stale_count = 0;
            return Ok(UpsertOutcome::Refreshed);
        }

        if bucket.entries.len() < self.k {
            bucket.entries.push(BucketEntry::fresh(info, now));
            return Ok(UpsertOutcome::Inserted);
        }

        // By the time a bucket is full, any entry that crossed
        // STALE_THRESHOLD has already been evicted eagerly by mark_stale,
        // so a full bucket here holds only live entries -- cache the new
        // peer as a replacement candidate instead.
        if bucket.replacements.len() == self.replacement_cache_cap {
            bucket.replacements.pop_front();
        }
        bucket.replacements.push_back(BucketEntry::fresh(info, now));
        Ok(UpsertOutcome::CachedAsReplacement)
    }

    /// Record a failed probe against `id`. Once `stale_count` reaches
    /// [`STALE_THRESHOLD`], the entry is evicted immediately and replaced
    /// by the most-recently-seen replacement-cache entry for that bucket,
    /// if any -- promotion happens eagerly, driven by this call, rather
    /// than by a separate background sweep.
    pub fn mark_stale(&mut self, id: &Guid) {
        let Some(idx) = self.bucket_index(id) else {
            return;
        };
        let bucket = &mut self.buckets[idx];
        let Some(pos) = bucket.entries.iter().position(|e| &e.info.id == id) else {
            return;
        };
        bucket.entries[pos].stale_count += 1;
        if bucket.entries[pos].stale_count >= STALE_THRESHOLD {
            match bucket.replacements.pop_back() {
                Some(replacement) => bucket.entries[pos] = replacement,
                None => {
                    bucket.entries.remove(pos);
                }
            }
        }
    }

    /// Remove `id` from its bucket, promoting the most-recently-seen
    /// replacement-cache entry (if any) into the freed slot.
    pub fn delete(&mut self, id: &Guid) {
        let Some(idx) = self.bucket_index(id) else {
            return;
        };
        let bucket = &mut self.buckets[idx];
        let Some(pos) = bucket.entries.iter().position(|e| &e.info.id == id) else {
            return;
        };
        bucket.entries.remove(pos);
        if let Some(replacement) = bucket.replacements.pop_back() {
            bucket.entries.push(replacement);
        }
    }

    /// The `count` peers closest to `target` across the whole table,
    /// ordered by ascending distance, excluding `exclude` (typically
    /// `self_id` or the lookup's own target) if given.
    pub fn find_closest(&self, target: &Guid, count: usize, exclude: Option<&Guid>) -> Vec<NodeInfo> {
        use std::cmp::Reverse;
        use std::collections::BinaryHeap;

        struct Candidate {
            distance: kad_proto::guid::Distance,
            info: NodeInfo,
        }
        impl PartialEq for Candidate {
            fn eq(&self, other: &Self) -> bool {
                self.distance == other.distance
            }
        }
        impl Eq for Candidate {}
        impl PartialOrd for Candidate {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }
        impl Ord for Candidate {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                self.distance.cmp(&other.distance)
            }
        }

        if count == 0 {
            return Vec::new();
        }

        // Max-heap on distance, bounded to `count`: pop the farthest
        // whenever we exceed capacity, leaving the `count` closest.
        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(count + 1);
        for bucket in &self.buckets {
            for entry in &bucket.entries {
                if Some(&entry.info.id) == exclude {
                    continue;
                }
                let distance = target.distance(&entry.info.id);
                heap.push(Candidate {
                    distance,
                    info: entry.info.clone(),
                });
                if heap.len() > count {
                    heap.pop();
                }
            }
        }

        // `into_sorted_vec` returns ascending order, which for `Candidate`
        // means nearest distance first -- exactly what callers want.
        heap.into_sorted_vec().into_iter().map(|c| c.info).collect()
    }

    /// Count of live entries across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    /// Whether the table holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist the live (non-replacement-cache) entries to a bencoded file:
    /// a dict `{"id": <20 bytes>, "nodes": [<compact node info>, ...]}`.
    pub fn write_file(&self, path: &std::path::Path) -> Result<()> {
        let mut nodes = Vec::new();
        for bucket in &self.buckets {
            for entry in &bucket.entries {
                nodes.push(BencValue::Bytes(encode_compact_node(&entry.info)));
            }
        }
        let mut dict = BTreeMap::new();
        dict.insert(b"id".to_vec(), BencValue::Bytes(self.self_id.as_bytes().to_vec()));
        dict.insert(b"nodes".to_vec(), BencValue::List(nodes));
        let bytes = bencode::encode(&BencValue::Dict(dict));
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Load a routing table previously written by [`Self::write_file`],
    /// restoring the identity it was persisted under from the file's
    /// `"id"` field rather than trusting a caller-supplied one -- a
    /// restarted node must keep the same GUID it advertised before.
    pub fn read_file(path: &std::path::Path, k: usize) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let value = bencode::decode(&bytes).map_err(kad_proto::ProtoError::from)?;
        let self_id = value
            .get("id")
            .and_then(BencValue::as_bytes)
            .and_then(|raw| <[u8; kad_proto::guid::GUID_LEN]>::try_from(raw).ok())
            .map(Guid::from_bytes)
            .ok_or(DhtError::MissingIdentity)?;
        let mut table = Self::new(self_id, k);
        let Some(BencValue::List(nodes)) = value.get("nodes") else {
            return Ok(table);
        };
        for node in nodes {
            if let Some(raw) = node.as_bytes() {
                if let Ok(info) = decode_compact_node(raw) {
                    let _ = table.upsert(info, 0);
                }
            }
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn guid_with_prefix(bit: usize) -> Guid {
        let mut bytes = [0u8; 20];
        bytes[bit / 8] |= 0x80 >> (bit % 8);
        Guid::from_bytes(bytes)
    }

    fn peer_at(bit: usize, port: u16) -> NodeInfo {
        NodeInfo::new(
            guid_with_prefix(bit),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port),
        )
    }

    #[test]
    fn self_id_upsert_rejected() {
        let self_id = Guid::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(self_id, 8);
        let err = table.upsert(NodeInfo::new(self_id, "127.0.0.1:1".parse().expect("test fixture")), 0);
        assert!(matches!(err, Err(DhtError::IsSelf)));
    }

    #[test]
    fn bucket_index_matches_spec_invariant() {
        let self_id = Guid::from_bytes([0u8; 20]);
        let table = RoutingTable::new(self_id, 8);
        // peer differs at bit 0 (MSB) => common_prefix_len = 0 => bucket GUID_BITS-1
        let far = guid_with_prefix(0);
        assert_eq!(table.bucket_index(&far), Some(GUID_BITS - 1));
        // peer differs at the very last bit => common_prefix_len = GUID_BITS-1 => bucket 0
        let near = guid_with_prefix(GUID_BITS - 1);
        assert_eq!(table.bucket_index(&near), Some(0));
    }

    #[test]
    fn bucket_overflow_caches_replacement_with_k_2() {
        let self_id = Guid::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(self_id, 2);
        // All three share the same bucket (differ at bit 0 only).
        let a = peer_at(0, 1);
        let b = peer_at(0, 2);
        let c = peer_at(0, 3);
        assert_eq!(table.upsert(a.clone(), 1).expect("test fixture"), UpsertOutcome::Inserted);
        assert_eq!(table.upsert(b.clone(), 2).expect("test fixture"), UpsertOutcome::Inserted);
        assert_eq!(
            table.upsert(c.clone(), 3).expect("test fixture"),
            UpsertOutcome::CachedAsReplacement
        );
        assert_eq!(table.len(), 2);

        // Evict `a`; its slot should be backfilled from the replacement
        // cache with `c`.
        table.delete(&a.id);
        assert_eq!(table.len(), 2);
        let closest = table.find_closest(&self_id, 8, None);
        assert!(closest.iter().any(|n| n.id == c.id));
        assert!(closest.iter().any(|n| n.id == b.id));
    }

    #[test]
    fn stale_entry_is_evicted_eagerly_by_mark_stale() {
        let self_id = Guid::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(self_id, 1);
        let a = peer_at(0, 1);
        table.upsert(a.clone(), 1).expect("test fixture");
        for _ in 0..STALE_THRESHOLD - 1 {
            table.mark_stale(&a.id);
        }
        assert_eq!(table.len(), 1, "not yet at threshold");
        table.mark_stale(&a.id);
        assert_eq!(table.len(), 0, "evicted once stale_count hits the threshold");
    }

    #[test]
    fn stale_eviction_promotes_replacement_cache_entry() {
        let self_id = Guid::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(self_id, 1);
        let a = peer_at(0, 1);
        let b = peer_at(0, 2);
        table.upsert(a.clone(), 1).expect("test fixture");
        assert_eq!(
            table.upsert(b.clone(), 2).expect("test fixture"),
            UpsertOutcome::CachedAsReplacement
        );
        for _ in 0..STALE_THRESHOLD {
            table.mark_stale(&a.id);
        }
        let closest = table.find_closest(&self_id, 8, None);
        assert_eq!(closest.len(), 1);
        assert_eq!(closest[0].id, b.id);
    }

    #[test]
    fn find_closest_orders_ascending_by_distance() {
        let self_id = Guid::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(self_id, 8);
        let near = peer_at(GUID_BITS - 1, 1);
        let mid = peer_at(10, 2);
        let far = peer_at(0, 3);
        table.upsert(near.clone(), 0).expect("test fixture");
        table.upsert(mid.clone(), 0).expect("test fixture");
        table.upsert(far.clone(), 0).expect("test fixture");

        let closest = table.find_closest(&self_id, 2, None);
        assert_eq!(closest.len(), 2);
        assert_eq!(closest[0].id, near.id);
        assert_eq!(closest[1].id, mid.id);
    }

    #[test]
    fn write_and_read_file_roundtrip_restores_persisted_identity() {
        let dir = std::env::temp_dir().join(format!(
            "kad-dht-routing-test-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).expect("test fixture");
        let path = dir.join("routes.dat");

        let self_id = guid_with_prefix(3);
        let mut table = RoutingTable::new(self_id, 8);
        let a = peer_at(5, 10);
        table.upsert(a.clone(), 0).expect("test fixture");
        table.write_file(&path).expect("test fixture");

        // A restart doesn't know its own id yet -- read_file must recover it
        // from the file rather than have the caller supply one.
        let loaded = RoutingTable::read_file(&path, 8).expect("test fixture");
        assert_eq!(loaded.self_id(), self_id, "restarted node must keep its persisted identity");
        assert_eq!(loaded.len(), 1);
        let closest = loaded.find_closest(&self_id, 1, None);
        assert_eq!(closest[0].id, a.id);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn read_file_rejects_a_file_with_no_id_field() {
        let dir = std::env::temp_dir().join(format!(
            "kad-dht-routing-test-no-id-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).expect("test fixture");
        let path = dir.join("routes.dat");

        let mut dict = BTreeMap::new();
        dict.insert(b"nodes".to_vec(), BencValue::List(Vec::new()));
        std::fs::write(&path, bencode::encode(&BencValue::Dict(dict))).expect("test fixture");

        let err = RoutingTable::read_file(&path, 8);
        assert!(matches!(err, Err(DhtError::MissingIdentity)));

        std::fs::remove_dir_all(&dir).ok();
    }
}
