//! # 故障转移模块
//!
//! 成员管理器的回调在对等节点跨入 DEAD 时触发故障转移：
//! 从死亡节点的副本列表中选出第一个健康节点作为新主节点，
//! 将死亡节点移出哈希环（环版本随之递增），通知集群，标记完成。
//!
//! 同一死亡节点的并发触发是幂等的：第二次调用观察到进行中的故障转移，
//! 直接返回其 id。操作员可以取消进行中的故障转移；已经生效的环变更不回滚。

use super::ring::HashRing;
use crate::metrics::Metrics;
use crate::{current_time_ms, NodeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Failover manager configuration
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    pub node_id: NodeId,
    pub replication_factor: usize,
    pub auto_failover_enabled: bool,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            node_id: "node1".to_string(),
            replication_factor: 3,
            auto_failover_enabled: true,
        }
    }
}

/// Lifecycle of one failover
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverState {
    Initiated,
    Promoting,
    Complete,
    Failed,
    Cancelled,
}

impl FailoverState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailoverState::Initiated => "initiated",
            FailoverState::Promoting => "promoting",
            FailoverState::Complete => "complete",
            FailoverState::Failed => "failed",
            FailoverState::Cancelled => "cancelled",
        }
    }
}

/// Record of one in-flight or completed promotion
#[derive(Debug, Clone)]
pub struct FailoverRecord {
    pub failover_id: String,
    pub failed_node_id: NodeId,
    pub new_primary_id: NodeId,
    pub started_at_ms: i64,
    pub completed_at_ms: Option<i64>,
    pub keys_migrated: u64,
    pub state: FailoverState,
}

impl FailoverRecord {
    pub fn in_progress(&self) -> bool {
        matches!(self.state, FailoverState::Initiated | FailoverState::Promoting)
    }
}

/// Callback invoked when a failover completes: (failed node, new primary)
pub type FailoverCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Answers "is this node currently healthy?"; wired to the membership
/// manager by the server.
pub type HealthView = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Failover statistics snapshot
#[derive(Debug, Clone, Default)]
pub struct FailoverStats {
    pub total_failovers: u64,
    pub successful_failovers: u64,
    pub failed_failovers: u64,
    pub active_failovers: usize,
}

/// 故障转移管理器
pub struct FailoverManager {
    config: FailoverConfig,
    ring: Arc<HashRing>,
    health: HealthView,
    metrics: Arc<Metrics>,
    records: Mutex<HashMap<String, FailoverRecord>>,
    callbacks: Mutex<Vec<FailoverCallback>>,
    total_failovers: AtomicU64,
    successful_failovers: AtomicU64,
    failed_failovers: AtomicU64,
    id_counter: AtomicU64,
}

impl FailoverManager {
    pub fn new(
        config: FailoverConfig,
        ring: Arc<HashRing>,
        health: HealthView,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            ring,
            health,
            metrics,
            records: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
            total_failovers: AtomicU64::new(0),
            successful_failovers: AtomicU64::new(0),
            failed_failovers: AtomicU64::new(0),
            id_counter: AtomicU64::new(0),
        }
    }

    /// Register a completion callback
    pub fn on_failover_complete(&self, callback: FailoverCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }

    /// Drive a failover for a node declared DEAD.
    ///
    /// Returns the failover id, or `None` when auto-failover is disabled or
    /// no healthy replacement exists. A second call for the same dead node
    /// while one is active returns the existing id.
    pub fn initiate_failover(&self, failed_node_id: &str) -> Option<String> {
        if !self.config.auto_failover_enabled {
            warn!(
                "Auto-failover disabled, ignoring failure of node {}",
                failed_node_id
            );
            return None;
        }

        let failover_id = {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());

            // Idempotence: one active failover per dead node
            if let Some(existing) = records
                .values()
                .find(|r| r.failed_node_id == failed_node_id && r.in_progress())
            {
                info!(
                    "Failover for {} already in progress: {}",
                    failed_node_id, existing.failover_id
                );
                return Some(existing.failover_id.clone());
            }

            let failover_id = self.generate_failover_id();
            info!(
                "Initiating failover {} for dead node {}",
                failover_id, failed_node_id
            );

            let new_primary = match self.select_new_primary(failed_node_id) {
                Some(primary) => primary,
                None => {
                    error!("No healthy replacement for dead node {}", failed_node_id);
                    records.insert(
                        failover_id.clone(),
                        FailoverRecord {
                            failover_id: failover_id.clone(),
                            failed_node_id: failed_node_id.to_string(),
                            new_primary_id: String::new(),
                            started_at_ms: current_time_ms(),
                            completed_at_ms: Some(current_time_ms()),
                            keys_migrated: 0,
                            state: FailoverState::Failed,
                        },
                    );
                    self.total_failovers.fetch_add(1, Ordering::Relaxed);
                    self.metrics.failovers_total.fetch_add(1, Ordering::Relaxed);
                    self.failed_failovers.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            };

            records.insert(
                failover_id.clone(),
                FailoverRecord {
                    failover_id: failover_id.clone(),
                    failed_node_id: failed_node_id.to_string(),
                    new_primary_id: new_primary,
                    started_at_ms: current_time_ms(),
                    completed_at_ms: None,
                    keys_migrated: 0,
                    state: FailoverState::Initiated,
                },
            );
            self.total_failovers.fetch_add(1, Ordering::Relaxed);
            self.metrics.failovers_total.fetch_add(1, Ordering::Relaxed);
            failover_id
        };

        self.execute_failover(&failover_id);
        Some(failover_id)
    }

    /// Promote the replacement: drop the dead node from the ring (version
    /// bump), notify, and mark the record complete.
    fn execute_failover(&self, failover_id: &str) {
        let (failed_node, new_primary) = {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            let record = match records.get_mut(failover_id) {
                Some(record) if record.in_progress() => record,
                _ => return, // cancelled or unknown
            };
            record.state = FailoverState::Promoting;
            (record.failed_node_id.clone(), record.new_primary_id.clone())
        };

        info!(
            "Promoting {} to primary for dead node {}",
            new_primary, failed_node
        );

        self.ring.remove_node(&failed_node);
        info!(
            "Ring updated after failover, version now {}",
            self.ring.version()
        );

        {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(record) = records.get_mut(failover_id) {
                if record.state == FailoverState::Cancelled {
                    return;
                }
                record.state = FailoverState::Complete;
                record.completed_at_ms = Some(current_time_ms());
            }
        }
        self.successful_failovers.fetch_add(1, Ordering::Relaxed);
        info!("Failover {} complete", failover_id);

        let callbacks = {
            let guard = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        for callback in callbacks {
            callback(&failed_node, &new_primary);
        }
    }

    /// First healthy node in the dead node's replica walk, excluding itself.
    fn select_new_primary(&self, failed_node_id: &str) -> Option<NodeId> {
        let replicas = self
            .ring
            .get_replicas(failed_node_id, self.config.replication_factor);

        replicas
            .into_iter()
            .filter(|node| node.id != failed_node_id)
            .find(|node| (self.health)(&node.id))
            .map(|node| node.id)
    }

    /// Cancel an in-flight failover. Applied ring changes stand.
    pub fn cancel_failover(&self, failover_id: &str) -> bool {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        match records.get_mut(failover_id) {
            Some(record) if record.in_progress() => {
                record.state = FailoverState::Cancelled;
                record.completed_at_ms = Some(current_time_ms());
                info!("Cancelled failover {}", failover_id);
                true
            }
            _ => false,
        }
    }

    /// Status of one failover
    pub fn failover_status(&self, failover_id: &str) -> Option<FailoverRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.get(failover_id).cloned()
    }

    /// All failovers still in progress
    pub fn active_failovers(&self) -> Vec<FailoverRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.values().filter(|r| r.in_progress()).cloned().collect()
    }

    /// All known failover records
    pub fn all_failovers(&self) -> Vec<FailoverRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.values().cloned().collect()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> FailoverStats {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        FailoverStats {
            total_failovers: self.total_failovers.load(Ordering::Relaxed),
            successful_failovers: self.successful_failovers.load(Ordering::Relaxed),
            failed_failovers: self.failed_failovers.load(Ordering::Relaxed),
            active_failovers: records.values().filter(|r| r.in_progress()).count(),
        }
    }

    fn generate_failover_id(&self) -> String {
        format!(
            "failover-{}-{:04}",
            current_time_ms(),
            self.id_counter.fetch_add(1, Ordering::Relaxed) % 10000
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Node;

    fn ring_with_nodes(ids: &[&str]) -> Arc<HashRing> {
        let ring = Arc::new(HashRing::new(150));
        for id in ids {
            ring.add_node(Node::new(*id, format!("{}:1", id)));
        }
        ring
    }

    fn all_healthy() -> HealthView {
        Arc::new(|_| true)
    }

    #[test]
    fn test_failover_promotes_and_removes_dead_node() {
        let ring = ring_with_nodes(&["node1", "node2", "node3"]);
        let manager = FailoverManager::new(FailoverConfig::default(), ring.clone(), all_healthy(), Arc::new(Metrics::new()));

        let version_before = ring.version();
        let id = manager.initiate_failover("node2").unwrap();

        let record = manager.failover_status(&id).unwrap();
        assert_eq!(record.state, FailoverState::Complete);
        assert_ne!(record.new_primary_id, "node2");
        assert!(!record.new_primary_id.is_empty());
        assert!(record.completed_at_ms.is_some());

        assert_eq!(ring.node_count(), 2);
        assert!(ring.version() > version_before);
        assert!(ring.all_nodes().iter().all(|n| n.id != "node2"));
    }

    #[test]
    fn test_failover_skips_unhealthy_candidates() {
        let ring = ring_with_nodes(&["node1", "node2", "node3"]);
        // Find which candidate the replica walk would pick first, then
        // declare exactly that one unhealthy.
        let first_choice = ring
            .get_replicas("node2", 3)
            .into_iter()
            .find(|n| n.id != "node2")
            .unwrap()
            .id;

        let sick = first_choice.clone();
        let health: HealthView = Arc::new(move |id| id != sick);
        let manager = FailoverManager::new(FailoverConfig::default(), ring, health, Arc::new(Metrics::new()));

        let id = manager.initiate_failover("node2").unwrap();
        let record = manager.failover_status(&id).unwrap();
        assert_ne!(record.new_primary_id, first_choice);
        assert_ne!(record.new_primary_id, "node2");
    }

    #[test]
    fn test_no_replacement_available() {
        let ring = ring_with_nodes(&["node1"]);
        let manager = FailoverManager::new(FailoverConfig::default(), ring, all_healthy(), Arc::new(Metrics::new()));

        assert!(manager.initiate_failover("node1").is_none());
        let stats = manager.stats();
        assert_eq!(stats.failed_failovers, 1);
    }

    #[test]
    fn test_auto_failover_disabled() {
        let ring = ring_with_nodes(&["node1", "node2", "node3"]);
        let manager = FailoverManager::new(
            FailoverConfig {
                auto_failover_enabled: false,
                ..FailoverConfig::default()
            },
            ring.clone(),
            all_healthy(),
            Arc::new(Metrics::new()),
        );

        assert!(manager.initiate_failover("node2").is_none());
        assert_eq!(ring.node_count(), 3);
    }

    #[test]
    fn test_completed_failover_allows_reinitiation() {
        let ring = ring_with_nodes(&["node1", "node2", "node3", "node4"]);
        let manager = FailoverManager::new(FailoverConfig::default(), ring, all_healthy(), Arc::new(Metrics::new()));

        let first = manager.initiate_failover("node2").unwrap();
        assert_eq!(
            manager.failover_status(&first).unwrap().state,
            FailoverState::Complete
        );

        // node2 already gone from the ring; a fresh failover for another
        // node gets its own id
        let second = manager.initiate_failover("node3").unwrap();
        assert_ne!(first, second);
        assert_eq!(manager.stats().successful_failovers, 2);
    }

    #[test]
    fn test_cancel_only_affects_in_flight() {
        let ring = ring_with_nodes(&["node1", "node2", "node3"]);
        let manager = FailoverManager::new(FailoverConfig::default(), ring, all_healthy(), Arc::new(Metrics::new()));

        let id = manager.initiate_failover("node2").unwrap();
        // Already complete; cancellation is refused
        assert!(!manager.cancel_failover(&id));
        assert!(!manager.cancel_failover("failover-unknown"));
    }

    #[test]
    fn test_keys_of_dead_node_resolve_to_live_primary() {
        let ring = ring_with_nodes(&["node1", "node2", "node3"]);
        let manager = FailoverManager::new(FailoverConfig::default(), ring.clone(), all_healthy(), Arc::new(Metrics::new()));

        // Collect keys whose primary is node2 before the failure
        let orphaned: Vec<String> = (0..1000)
            .map(|i| format!("key_{}", i))
            .filter(|key| ring.get_node(key).map(|n| n.id == "node2").unwrap_or(false))
            .collect();
        assert!(!orphaned.is_empty());

        let version_before = ring.version();
        manager.initiate_failover("node2").unwrap();
        assert!(ring.version() > version_before);

        // Every orphaned key now maps to a surviving node
        for key in orphaned {
            let owner = ring.get_node(&key).unwrap();
            assert_ne!(owner.id, "node2");
        }
    }

    #[test]
    fn test_completion_callback() {
        let ring = ring_with_nodes(&["node1", "node2", "node3"]);
        let manager = FailoverManager::new(FailoverConfig::default(), ring, all_healthy(), Arc::new(Metrics::new()));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager.on_failover_complete(Arc::new(move |failed, new_primary| {
            sink.lock()
                .unwrap()
                .push((failed.to_string(), new_primary.to_string()));
        }));

        manager.initiate_failover("node3").unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "node3");
        assert_ne!(seen[0].1, "node3");
    }
}
