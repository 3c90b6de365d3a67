//! # 一致性哈希环模块
//!
//! 本模块实现了键到物理节点的确定性映射。每个物理节点在环上放置多个虚拟
//! 节点（默认 150 个），键按 64 位哈希顺时针落到第一个位置；增删节点时
//! 只有约 1/N 的键空间改变归属。
//!
//! ## 功能特性
//!
//! - **虚拟节点**: 摊平节点间的键份额差异
//! - **有序查找**: `BTreeMap` 上 O(log V) 的顺时针查找
//! - **副本列表**: 顺时针收集 N 个互异物理节点
//! - **版本计数**: 每次拓扑变更递增环版本
//! - **并发模型**: 读共享、写独占
//!
//! ## 哈希函数
//!
//! 使用 MurmurHash3 风格的 64 位哈希（雪崩质量好、无分配），
//! 虚拟节点位置由 `"<node_id>:<index>"` 的哈希给出。

use super::Node;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tracing::debug;

/// Default number of virtual nodes per physical node
pub const DEFAULT_VIRTUAL_NODES: usize = 150;

/// MurmurHash3-style 64-bit hash with good avalanche behavior.
///
/// Processes the input in 8-byte blocks with the Murmur3 mixing constants
/// and applies the fmix64 finalizer.
pub fn hash64(data: &[u8]) -> u64 {
    const C1: u64 = 0x87c3_7b91_1142_53d5;
    const C2: u64 = 0x4cf5_ad43_2745_937f;

    let mut h1: u64 = 0;
    let mut h2: u64 = 0;

    let mut chunks = data.chunks_exact(8);
    for block in chunks.by_ref() {
        let mut k1 = u64::from_le_bytes(block.try_into().unwrap());
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(31);
        k1 = k1.wrapping_mul(C2);

        h1 ^= k1;
        h1 = h1.rotate_left(27);
        h1 = h1.wrapping_add(h2);
        h1 = h1.wrapping_mul(5).wrapping_add(0x52dc_e729);

        h2 = h2.rotate_left(31);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k1: u64 = 0;
        for (i, &byte) in tail.iter().enumerate() {
            k1 ^= (byte as u64) << (8 * i);
        }
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(31);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u64;
    h2 ^= data.len() as u64;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);

    h1 = fmix64(h1);
    h2 = fmix64(h2);

    h1.wrapping_add(h2)
}

fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

struct RingInner {
    /// hash position -> node id (virtual nodes)
    positions: BTreeMap<u64, String>,
    /// node id -> physical node, ordered for deterministic iteration
    nodes: BTreeMap<String, Node>,
}

/// 一致性哈希环
///
/// 内部状态由读写锁保护：查找走共享锁，增删节点走独占锁。
/// 查找不会无限阻塞变更。
pub struct HashRing {
    inner: RwLock<RingInner>,
    virtual_nodes_per_node: usize,
    version: AtomicU64,
}

impl HashRing {
    /// Create an empty ring
    pub fn new(virtual_nodes_per_node: usize) -> Self {
        Self {
            inner: RwLock::new(RingInner {
                positions: BTreeMap::new(),
                nodes: BTreeMap::new(),
            }),
            virtual_nodes_per_node: virtual_nodes_per_node.max(1),
            version: AtomicU64::new(0),
        }
    }

    /// Add a physical node, placing its virtual nodes on the ring.
    ///
    /// Returns false without touching the ring if the id already exists.
    pub fn add_node(&self, node: Node) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        if inner.nodes.contains_key(&node.id) {
            return false;
        }

        for i in 0..self.virtual_nodes_per_node {
            let vnode_key = format!("{}:{}", node.id, i);
            let position = hash64(vnode_key.as_bytes());
            // On the vanishingly rare position collision the lexicographically
            // smaller node id wins the slot.
            let taken = matches!(inner.positions.get(&position), Some(existing) if *existing <= node.id);
            if !taken {
                inner.positions.insert(position, node.id.clone());
            }
        }

        debug!("Ring: added node {} at {}", node.id, node.address);
        inner.nodes.insert(node.id.clone(), node);
        self.version.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Remove a physical node and all of its virtual nodes.
    ///
    /// Removing an unknown id is a no-op returning false.
    pub fn remove_node(&self, node_id: &str) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        if !inner.nodes.contains_key(node_id) {
            return false;
        }

        inner.positions.retain(|_, id| id != node_id);
        inner.nodes.remove(node_id);
        self.version.fetch_add(1, Ordering::SeqCst);
        debug!("Ring: removed node {}", node_id);
        true
    }

    /// Primary node for a key, `None` on an empty ring
    pub fn get_node(&self, key: &str) -> Option<Node> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        if inner.positions.is_empty() {
            return None;
        }

        let key_hash = hash64(key.as_bytes());
        let node_id = inner
            .positions
            .range(key_hash..)
            .next()
            .or_else(|| inner.positions.iter().next())
            .map(|(_, id)| id.clone())?;
        inner.nodes.get(&node_id).cloned()
    }

    /// First `n` distinct physical nodes encountered clockwise from the
    /// key's position, primary first. Capped at the node count.
    pub fn get_replicas(&self, key: &str, n: usize) -> Vec<Node> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut replicas = Vec::new();
        if inner.positions.is_empty() || n == 0 {
            return replicas;
        }

        let n = n.min(inner.nodes.len());
        let key_hash = hash64(key.as_bytes());
        let mut seen: BTreeSet<&str> = BTreeSet::new();

        // One full clockwise pass: tail of the map, then wrap to the head
        let walk = inner
            .positions
            .range(key_hash..)
            .chain(inner.positions.range(..key_hash));

        for (_, node_id) in walk {
            if replicas.len() >= n {
                break;
            }
            if seen.insert(node_id.as_str()) {
                if let Some(node) = inner.nodes.get(node_id) {
                    replicas.push(node.clone());
                }
            }
        }

        replicas
    }

    /// All physical nodes, ordered by id
    pub fn all_nodes(&self) -> Vec<Node> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.nodes.values().cloned().collect()
    }

    /// Number of physical nodes
    pub fn node_count(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.nodes.len()
    }

    /// Number of virtual node positions on the ring
    pub fn virtual_node_count(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.positions.len()
    }

    /// Ring version, incremented on every mutation
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Configured virtual nodes per physical node
    pub fn virtual_nodes_per_node(&self) -> usize {
        self.virtual_nodes_per_node
    }

    /// Key share per node over `num_keys` derived test keys.
    /// Useful for distribution monitoring and tests.
    pub fn distribution_stats(&self, num_keys: usize) -> BTreeMap<String, usize> {
        let mut stats: BTreeMap<String, usize> = BTreeMap::new();
        for node in self.all_nodes() {
            stats.insert(node.id, 0);
        }
        for i in 0..num_keys {
            let key = format!("key_{}", i);
            if let Some(node) = self.get_node(&key) {
                *stats.entry(node.id).or_insert(0) += 1;
            }
        }
        stats
    }

    /// Build a copy of this ring's topology with the same vnode count.
    /// Used by the rebalance planner to diff old and new ownership.
    pub fn clone_topology(&self) -> HashRing {
        let ring = HashRing::new(self.virtual_nodes_per_node);
        for node in self.all_nodes() {
            ring.add_node(node);
        }
        ring
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ring(node_count: usize) -> HashRing {
        let ring = HashRing::new(DEFAULT_VIRTUAL_NODES);
        for i in 1..=node_count {
            ring.add_node(Node::new(
                format!("node{}", i),
                format!("127.0.0.1:{}", 50050 + i),
            ));
        }
        ring
    }

    #[test]
    fn test_empty_ring() {
        let ring = HashRing::new(DEFAULT_VIRTUAL_NODES);
        assert!(ring.get_node("any").is_none());
        assert!(ring.get_replicas("any", 3).is_empty());
        assert_eq!(ring.node_count(), 0);
        assert_eq!(ring.virtual_node_count(), 0);
    }

    #[test]
    fn test_single_node_owns_everything() {
        let ring = test_ring(1);
        for i in 0..100 {
            let node = ring.get_node(&format!("key{}", i)).unwrap();
            assert_eq!(node.id, "node1");
        }
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let ring = test_ring(5);
        for i in 0..50 {
            let key = format!("key{}", i);
            let first = ring.get_node(&key).unwrap();
            let second = ring.get_node(&key).unwrap();
            assert_eq!(first.id, second.id);
        }
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let ring = test_ring(2);
        let version = ring.version();
        assert!(!ring.add_node(Node::new("node1", "somewhere:1")));
        assert_eq!(ring.node_count(), 2);
        assert_eq!(ring.version(), version);
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let ring = test_ring(2);
        let version = ring.version();
        assert!(!ring.remove_node("ghost"));
        assert_eq!(ring.version(), version);
    }

    #[test]
    fn test_version_increments_on_mutation() {
        let ring = HashRing::new(DEFAULT_VIRTUAL_NODES);
        assert_eq!(ring.version(), 0);
        ring.add_node(Node::new("node1", "a:1"));
        assert_eq!(ring.version(), 1);
        ring.add_node(Node::new("node2", "b:1"));
        assert_eq!(ring.version(), 2);
        ring.remove_node("node1");
        assert_eq!(ring.version(), 3);
    }

    #[test]
    fn test_virtual_node_count() {
        let ring = test_ring(3);
        // Position collisions across 450 vnodes are possible in theory but
        // have never been observed with this hash.
        assert_eq!(ring.virtual_node_count(), 3 * DEFAULT_VIRTUAL_NODES);
        ring.remove_node("node2");
        assert_eq!(ring.virtual_node_count(), 2 * DEFAULT_VIRTUAL_NODES);
    }

    #[test]
    fn test_replicas_are_distinct_and_capped() {
        let ring = test_ring(3);

        let replicas = ring.get_replicas("some-key", 3);
        assert_eq!(replicas.len(), 3);
        let ids: BTreeSet<_> = replicas.iter().map(|n| n.id.clone()).collect();
        assert_eq!(ids.len(), 3);

        // Asking for more replicas than nodes caps at the node count
        let replicas = ring.get_replicas("some-key", 10);
        assert_eq!(replicas.len(), 3);
    }

    #[test]
    fn test_replica_list_starts_with_primary() {
        let ring = test_ring(5);
        for i in 0..20 {
            let key = format!("key{}", i);
            let primary = ring.get_node(&key).unwrap();
            let replicas = ring.get_replicas(&key, 3);
            assert_eq!(replicas[0].id, primary.id);
        }
    }

    #[test]
    fn test_uniform_distribution() {
        let ring = test_ring(3);
        let num_keys = 10_000;
        let stats = ring.distribution_stats(num_keys);

        let expected = num_keys / 3;
        for (node_id, count) in stats {
            let deviation = (count as f64 - expected as f64).abs() / expected as f64;
            assert!(
                deviation < 0.15,
                "node {} holds {} keys, {:.1}% off the uniform share",
                node_id,
                count,
                deviation * 100.0
            );
        }
    }

    #[test]
    fn test_adding_node_moves_bounded_key_share() {
        let ring = test_ring(3);
        let num_keys = 10_000;

        let before: Vec<Option<Node>> = (0..num_keys)
            .map(|i| ring.get_node(&format!("key_{}", i)))
            .collect();

        ring.add_node(Node::new("node4", "127.0.0.1:50054"));

        let mut moved = 0;
        for (i, old) in before.iter().enumerate() {
            let new = ring.get_node(&format!("key_{}", i));
            if old.as_ref().map(|n| &n.id) != new.as_ref().map(|n| &n.id) {
                moved += 1;
            }
        }

        // Going from 3 to 4 nodes should move roughly 1/4 of the keys
        let fraction = moved as f64 / num_keys as f64;
        assert!(
            (0.10..0.45).contains(&fraction),
            "moved fraction {:.3} outside the consistent-hashing bound",
            fraction
        );
    }

    #[test]
    fn test_removed_node_receives_nothing() {
        let ring = test_ring(4);
        ring.remove_node("node3");

        for i in 0..1000 {
            let node = ring.get_node(&format!("key{}", i)).unwrap();
            assert_ne!(node.id, "node3");
        }
    }

    #[test]
    fn test_clone_topology_matches() {
        let ring = test_ring(4);
        let cloned = ring.clone_topology();

        for i in 0..200 {
            let key = format!("key{}", i);
            assert_eq!(
                ring.get_node(&key).map(|n| n.id),
                cloned.get_node(&key).map(|n| n.id)
            );
        }
    }

    #[test]
    fn test_hash64_avalanche_smoke() {
        // Nearby inputs land far apart
        let a = hash64(b"key_1");
        let b = hash64(b"key_2");
        assert_ne!(a, b);
        assert!(hash64(b"") != hash64(b"\0"));
        // Stable across calls
        assert_eq!(hash64(b"stable"), hash64(b"stable"));
    }
}
