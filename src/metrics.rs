//! # 指标统计模块
//!
//! 提供缓存节点的运行时指标计数。所有计数器均为原子变量，
//! 热路径上只做无锁递增，通过管理接口的 METRICS 调用导出为名称/数值对。

use std::sync::atomic::{AtomicU64, Ordering};

/// Runtime counters for a cache node
#[derive(Debug, Default)]
pub struct Metrics {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub sets_total: AtomicU64,
    pub deletes_total: AtomicU64,
    pub cas_total: AtomicU64,
    pub cas_failures: AtomicU64,
    pub evictions_total: AtomicU64,
    pub expirations_total: AtomicU64,
    pub entries_count: AtomicU64,
    pub memory_bytes: AtomicU64,
    pub wal_appends_total: AtomicU64,
    pub replication_queued: AtomicU64,
    pub replication_shipped: AtomicU64,
    pub replication_failed: AtomicU64,
    pub replication_dropped: AtomicU64,
    pub snapshots_created: AtomicU64,
    pub failovers_total: AtomicU64,
    pub keys_migrated_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache hit ratio in [0.0, 1.0]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Export all counters as (name, value) pairs
    pub fn export(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("cache_hits", self.cache_hits.load(Ordering::Relaxed)),
            ("cache_misses", self.cache_misses.load(Ordering::Relaxed)),
            ("sets_total", self.sets_total.load(Ordering::Relaxed)),
            ("deletes_total", self.deletes_total.load(Ordering::Relaxed)),
            ("cas_total", self.cas_total.load(Ordering::Relaxed)),
            ("cas_failures", self.cas_failures.load(Ordering::Relaxed)),
            ("evictions_total", self.evictions_total.load(Ordering::Relaxed)),
            ("expirations_total", self.expirations_total.load(Ordering::Relaxed)),
            ("entries_count", self.entries_count.load(Ordering::Relaxed)),
            ("memory_bytes", self.memory_bytes.load(Ordering::Relaxed)),
            ("wal_appends_total", self.wal_appends_total.load(Ordering::Relaxed)),
            ("replication_queued", self.replication_queued.load(Ordering::Relaxed)),
            ("replication_shipped", self.replication_shipped.load(Ordering::Relaxed)),
            ("replication_failed", self.replication_failed.load(Ordering::Relaxed)),
            ("replication_dropped", self.replication_dropped.load(Ordering::Relaxed)),
            ("snapshots_created", self.snapshots_created.load(Ordering::Relaxed)),
            ("failovers_total", self.failovers_total.load(Ordering::Relaxed)),
            ("keys_migrated_total", self.keys_migrated_total.load(Ordering::Relaxed)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio() {
        let metrics = Metrics::new();
        assert_eq!(metrics.hit_ratio(), 0.0);

        metrics.cache_hits.fetch_add(3, Ordering::Relaxed);
        metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
        assert!((metrics.hit_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_export_contains_all_counters() {
        let metrics = Metrics::new();
        metrics.sets_total.fetch_add(5, Ordering::Relaxed);

        let exported = metrics.export();
        let sets = exported.iter().find(|(name, _)| *name == "sets_total").unwrap();
        assert_eq!(sets.1, 5);
    }
}
