//! # 版本向量模块
//!
//! 版本向量是 node_id 到该节点最近观察版本的映射，用于跨副本写入的
//! 因果关系判定：两个向量或者一方支配另一方（有序），或者互不支配（并发冲突）。

use crate::NodeId;
use std::collections::HashMap;

/// A mapping from node id to the last version observed from that node
pub type VersionVector = HashMap<NodeId, i64>;

/// Causal relationship between two version vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    /// Identical histories
    Equal,
    /// The first vector happened before the second
    Less,
    /// The second vector happened before the first
    Greater,
    /// Neither dominates; the updates are concurrent
    Concurrent,
}

/// Compare two version vectors.
///
/// Missing entries count as version 0.
pub fn compare(a: &VersionVector, b: &VersionVector) -> Causality {
    let mut a_dominates = false;
    let mut b_dominates = false;

    for (node_id, &ver_a) in a {
        let ver_b = b.get(node_id).copied().unwrap_or(0);
        if ver_a > ver_b {
            a_dominates = true;
        } else if ver_b > ver_a {
            b_dominates = true;
        }
    }
    for (node_id, &ver_b) in b {
        if a.contains_key(node_id) {
            continue;
        }
        if ver_b > 0 {
            b_dominates = true;
        }
    }

    match (a_dominates, b_dominates) {
        (true, true) => Causality::Concurrent,
        (true, false) => Causality::Greater,
        (false, true) => Causality::Less,
        (false, false) => Causality::Equal,
    }
}

/// Merge two version vectors, taking the maximum version per node.
pub fn merge(a: &VersionVector, b: &VersionVector) -> VersionVector {
    let mut result = a.clone();
    for (node_id, &version) in b {
        result
            .entry(node_id.clone())
            .and_modify(|v| *v = (*v).max(version))
            .or_insert(version);
    }
    result
}

/// Increment a node's version, returning the new value.
pub fn increment(vv: &mut VersionVector, node_id: &str) -> i64 {
    let entry = vv.entry(node_id.to_string()).or_insert(0);
    *entry += 1;
    *entry
}

/// Version for a node, 0 when absent.
pub fn get(vv: &VersionVector, node_id: &str) -> i64 {
    vv.get(node_id).copied().unwrap_or(0)
}

/// Whether `a` strictly dominates `b`.
pub fn dominates(a: &VersionVector, b: &VersionVector) -> bool {
    compare(a, b) == Causality::Greater
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vv(pairs: &[(&str, i64)]) -> VersionVector {
        pairs
            .iter()
            .map(|(id, v)| (id.to_string(), *v))
            .collect()
    }

    #[test]
    fn test_compare_equal_is_reflexive() {
        let a = vv(&[("n1", 2), ("n2", 5)]);
        assert_eq!(compare(&a, &a), Causality::Equal);
        assert_eq!(compare(&VersionVector::new(), &VersionVector::new()), Causality::Equal);
    }

    #[test]
    fn test_compare_is_antisymmetric() {
        let a = vv(&[("n1", 1)]);
        let b = vv(&[("n1", 2)]);
        assert_eq!(compare(&a, &b), Causality::Less);
        assert_eq!(compare(&b, &a), Causality::Greater);
    }

    #[test]
    fn test_missing_entries_count_as_zero() {
        let a = vv(&[("n1", 1)]);
        let b = vv(&[("n1", 1), ("n2", 0)]);
        assert_eq!(compare(&a, &b), Causality::Equal);
    }

    #[test]
    fn test_concurrent_when_neither_dominates() {
        let a = vv(&[("n1", 2), ("n2", 1)]);
        let b = vv(&[("n1", 1), ("n2", 2)]);
        assert_eq!(compare(&a, &b), Causality::Concurrent);
        assert_eq!(compare(&b, &a), Causality::Concurrent);
    }

    #[test]
    fn test_merge_takes_pointwise_max() {
        let a = vv(&[("n1", 3), ("n2", 1)]);
        let b = vv(&[("n1", 2), ("n2", 4), ("n3", 1)]);

        let merged = merge(&a, &b);
        assert_eq!(get(&merged, "n1"), 3);
        assert_eq!(get(&merged, "n2"), 4);
        assert_eq!(get(&merged, "n3"), 1);

        // The merge dominates (or equals) both inputs
        assert!(matches!(compare(&merged, &a), Causality::Greater | Causality::Equal));
        assert!(matches!(compare(&merged, &b), Causality::Greater | Causality::Equal));
    }

    #[test]
    fn test_increment() {
        let mut v = VersionVector::new();
        assert_eq!(increment(&mut v, "n1"), 1);
        assert_eq!(increment(&mut v, "n1"), 2);
        assert_eq!(increment(&mut v, "n2"), 1);
        assert_eq!(get(&v, "n1"), 2);
        assert_eq!(get(&v, "missing"), 0);
    }

    #[test]
    fn test_dominates() {
        let a = vv(&[("n1", 2), ("n2", 2)]);
        let b = vv(&[("n1", 1), ("n2", 2)]);
        assert!(dominates(&a, &b));
        assert!(!dominates(&b, &a));
        assert!(!dominates(&a, &a));
    }
}
