//! # 成员管理与故障检测模块
//!
//! 每个节点运行一个心跳工作任务，按固定间隔对所有对等节点（不含自身）
//! 发起带超时的健康检查，并维护每个对等节点的状态机：
//!
//! ```text
//! HEALTHY --连续失败达到 failure_threshold--> UNHEALTHY
//! UNHEALTHY --连续失败达到 dead_threshold--> DEAD
//! 任意状态 --单次检查成功--> HEALTHY
//! ```
//!
//! `failure_threshold < dead_threshold` 构成一个隔离窗口：抖动的节点先被
//! 路由规避（UNHEALTHY），持续失联才触发故障转移（DEAD）。
//! 每次状态跃迁都会调用注册的回调（故障转移管理器、环缓存等）。
//!
//! 扫描前先对对等节点表做快照，扫描期间的增删不会使循环失效。

use super::{Node, NodeStatus};
use crate::network::client::ClientPool;
use crate::{current_time_ms, NodeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Membership configuration
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub self_node_id: NodeId,
    pub heartbeat_interval: Duration,
    pub health_timeout: Duration,
    /// Consecutive failures before UNHEALTHY
    pub failure_threshold: u32,
    /// Consecutive failures before DEAD
    pub dead_threshold: u32,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            self_node_id: "node1".to_string(),
            heartbeat_interval: Duration::from_millis(1000),
            health_timeout: Duration::from_millis(500),
            failure_threshold: 3,
            dead_threshold: 6,
        }
    }
}

/// Tracked state of one peer
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub node: Node,
    pub status: NodeStatus,
    pub consecutive_failures: u32,
    pub last_heartbeat_ms: i64,
    pub total_checks: u64,
    pub failed_checks: u64,
}

/// Callback invoked on every peer state transition
pub type NodeEventCallback = Arc<dyn Fn(&Node, NodeStatus) + Send + Sync>;

/// Membership statistics snapshot
#[derive(Debug, Clone, Default)]
pub struct MembershipStats {
    pub total_nodes: usize,
    pub healthy_nodes: usize,
    pub unhealthy_nodes: usize,
    pub dead_nodes: usize,
    pub health_checks_sent: u64,
    pub health_checks_failed: u64,
}

/// 成员管理器
///
/// 对等节点表与回调表各自持锁；回调在释放节点表锁之后调用，
/// 回调内部可以安全地回查成员状态或修改哈希环。
pub struct MembershipManager {
    config: MembershipConfig,
    peers: Mutex<HashMap<NodeId, PeerInfo>>,
    callbacks: Mutex<Vec<NodeEventCallback>>,
    pool: Arc<ClientPool>,
    checks_sent: AtomicU64,
    checks_failed: AtomicU64,
}

impl MembershipManager {
    pub fn new(config: MembershipConfig, pool: Arc<ClientPool>) -> Self {
        Self {
            config,
            peers: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
            pool,
            checks_sent: AtomicU64::new(0),
            checks_failed: AtomicU64::new(0),
        }
    }

    /// Track a peer. Adding an already-known id is a warning no-op.
    pub fn add_node(&self, node: Node) {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        if peers.contains_key(&node.id) {
            warn!("Node {} already tracked", node.id);
            return;
        }
        info!("Tracking node {} at {}", node.id, node.address);
        peers.insert(
            node.id.clone(),
            PeerInfo {
                node,
                status: NodeStatus::Healthy,
                consecutive_failures: 0,
                last_heartbeat_ms: current_time_ms(),
                total_checks: 0,
                failed_checks: 0,
            },
        );
    }

    /// Stop tracking a peer
    pub fn remove_node(&self, node_id: &str) {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        if peers.remove(node_id).is_some() {
            info!("Stopped tracking node {}", node_id);
        }
    }

    /// Register a state-transition callback
    pub fn on_node_event(&self, callback: NodeEventCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }

    /// All tracked peers
    pub fn all_nodes(&self) -> Vec<PeerInfo> {
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers.values().cloned().collect()
    }

    /// Info for one peer
    pub fn node_info(&self, node_id: &str) -> Option<PeerInfo> {
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers.get(node_id).cloned()
    }

    /// Whether a peer is currently HEALTHY. Self is always healthy.
    pub fn is_healthy(&self, node_id: &str) -> bool {
        if node_id == self.config.self_node_id {
            return true;
        }
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers
            .get(node_id)
            .map(|info| info.status == NodeStatus::Healthy)
            .unwrap_or(false)
    }

    /// All peers currently HEALTHY
    pub fn healthy_nodes(&self) -> Vec<Node> {
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .filter(|info| info.status == NodeStatus::Healthy)
            .map(|info| info.node.clone())
            .collect()
    }

    /// Force a peer's status (used by the admin DRAIN path)
    pub fn mark_status(&self, node_id: &str, status: NodeStatus) {
        let transition = {
            let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
            match peers.get_mut(node_id) {
                Some(info) if info.status != status => {
                    info.status = status;
                    Some(info.node.clone())
                }
                _ => None,
            }
        };
        if let Some(node) = transition {
            warn!("Node {} status forced to {}", node_id, status);
            self.fire_callbacks(&node, status);
        }
    }

    /// Statistics snapshot
    pub fn stats(&self) -> MembershipStats {
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        let mut stats = MembershipStats {
            total_nodes: peers.len(),
            health_checks_sent: self.checks_sent.load(Ordering::Relaxed),
            health_checks_failed: self.checks_failed.load(Ordering::Relaxed),
            ..Default::default()
        };
        for info in peers.values() {
            match info.status {
                NodeStatus::Healthy => stats.healthy_nodes += 1,
                NodeStatus::Unhealthy => stats.unhealthy_nodes += 1,
                NodeStatus::Dead => stats.dead_nodes += 1,
                _ => {}
            }
        }
        stats
    }

    /// Record the outcome of one health check and drive the state machine.
    ///
    /// Transitions are applied under the peer table lock; callbacks fire
    /// after it is released.
    pub fn record_check_result(&self, node_id: &str, healthy: bool) {
        let transition = {
            let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
            let info = match peers.get_mut(node_id) {
                Some(info) => info,
                None => return,
            };

            info.total_checks += 1;

            if healthy {
                info.last_heartbeat_ms = current_time_ms();
                info.consecutive_failures = 0;
                // DRAINING is operator-set; a passing check must not undo it
                if info.status != NodeStatus::Healthy && info.status != NodeStatus::Draining {
                    info.status = NodeStatus::Healthy;
                    Some((info.node.clone(), NodeStatus::Healthy))
                } else {
                    None
                }
            } else {
                info.failed_checks += 1;
                info.consecutive_failures += 1;

                if info.consecutive_failures >= self.config.dead_threshold {
                    if info.status != NodeStatus::Dead {
                        info.status = NodeStatus::Dead;
                        Some((info.node.clone(), NodeStatus::Dead))
                    } else {
                        None
                    }
                } else if info.consecutive_failures >= self.config.failure_threshold {
                    if info.status == NodeStatus::Healthy {
                        info.status = NodeStatus::Unhealthy;
                        Some((info.node.clone(), NodeStatus::Unhealthy))
                    } else {
                        None
                    }
                } else {
                    None
                }
            }
        };

        if let Some((node, status)) = transition {
            warn!("Node {} status changed to {}", node.id, status);
            self.fire_callbacks(&node, status);
        }
    }

    fn fire_callbacks(&self, node: &Node, status: NodeStatus) {
        let callbacks = {
            let guard = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        for callback in callbacks {
            callback(node, status);
        }
    }

    /// Heartbeat loop: check every peer once per interval until stopped.
    ///
    /// The peer set is snapshotted before each scan so concurrent add and
    /// remove cannot invalidate the iteration.
    pub async fn run(self: Arc<Self>, stop: Arc<AtomicBool>) {
        info!(
            "Heartbeat worker started (interval {:?}, timeouts {}/{} checks)",
            self.config.heartbeat_interval, self.config.failure_threshold, self.config.dead_threshold
        );

        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if stop.load(Ordering::Relaxed) {
                break;
            }

            let snapshot: Vec<Node> = {
                let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
                peers
                    .values()
                    .filter(|info| info.node.id != self.config.self_node_id)
                    .map(|info| info.node.clone())
                    .collect()
            };

            for node in snapshot {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                let healthy = self.check_node_health(&node).await;
                self.record_check_result(&node.id, healthy);
            }
        }

        info!("Heartbeat worker stopped");
    }

    /// One bounded-timeout health check against a peer
    async fn check_node_health(&self, node: &Node) -> bool {
        self.checks_sent.fetch_add(1, Ordering::Relaxed);

        let client = match self.pool.get(&node.address).await {
            Ok(client) => client,
            Err(e) => {
                debug!("Health check connect failed for {}: {}", node.id, e);
                self.checks_failed.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };

        // The outer timeout also bounds connection establishment of the
        // lazily-connected channel.
        let result = tokio::time::timeout(
            self.config.health_timeout,
            client.health_check(self.config.health_timeout),
        )
        .await;

        match result {
            Ok(Ok(true)) => true,
            Ok(Ok(false)) => {
                debug!("Node {} reports NOT_SERVING", node.id);
                self.checks_failed.fetch_add(1, Ordering::Relaxed);
                false
            }
            Ok(Err(e)) => {
                debug!("Health check failed for {}: {}", node.id, e);
                self.checks_failed.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(_) => {
                debug!("Health check timed out for {}", node.id);
                self.checks_failed.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_manager() -> MembershipManager {
        MembershipManager::new(
            MembershipConfig {
                self_node_id: "self".to_string(),
                failure_threshold: 3,
                dead_threshold: 6,
                ..MembershipConfig::default()
            },
            Arc::new(ClientPool::new()),
        )
    }

    #[test]
    fn test_add_and_remove_nodes() {
        let manager = test_manager();
        manager.add_node(Node::new("node2", "b:1"));
        manager.add_node(Node::new("node3", "c:1"));
        assert_eq!(manager.all_nodes().len(), 2);

        // Duplicate add is ignored
        manager.add_node(Node::new("node2", "elsewhere:1"));
        assert_eq!(manager.all_nodes().len(), 2);
        assert_eq!(manager.node_info("node2").unwrap().node.address, "b:1");

        manager.remove_node("node2");
        assert_eq!(manager.all_nodes().len(), 1);
    }

    #[test]
    fn test_state_machine_thresholds() {
        let manager = test_manager();
        manager.add_node(Node::new("peer", "p:1"));

        // Two failures: still healthy
        manager.record_check_result("peer", false);
        manager.record_check_result("peer", false);
        assert_eq!(manager.node_info("peer").unwrap().status, NodeStatus::Healthy);

        // Third failure crosses the failure threshold
        manager.record_check_result("peer", false);
        assert_eq!(manager.node_info("peer").unwrap().status, NodeStatus::Unhealthy);
        assert!(!manager.is_healthy("peer"));

        // Sixth failure crosses the dead threshold
        manager.record_check_result("peer", false);
        manager.record_check_result("peer", false);
        manager.record_check_result("peer", false);
        assert_eq!(manager.node_info("peer").unwrap().status, NodeStatus::Dead);
    }

    #[test]
    fn test_single_success_recovers() {
        let manager = test_manager();
        manager.add_node(Node::new("peer", "p:1"));

        for _ in 0..6 {
            manager.record_check_result("peer", false);
        }
        assert_eq!(manager.node_info("peer").unwrap().status, NodeStatus::Dead);

        manager.record_check_result("peer", true);
        let info = manager.node_info("peer").unwrap();
        assert_eq!(info.status, NodeStatus::Healthy);
        assert_eq!(info.consecutive_failures, 0);
    }

    #[test]
    fn test_self_is_always_healthy() {
        let manager = test_manager();
        assert!(manager.is_healthy("self"));
    }

    #[test]
    fn test_callbacks_fire_on_transitions_only() {
        let manager = test_manager();
        manager.add_node(Node::new("peer", "p:1"));

        let transitions = Arc::new(Mutex::new(Vec::new()));
        let seen = transitions.clone();
        manager.on_node_event(Arc::new(move |node, status| {
            seen.lock().unwrap().push((node.id.clone(), status));
        }));

        for _ in 0..7 {
            manager.record_check_result("peer", false);
        }
        manager.record_check_result("peer", true);

        let transitions = transitions.lock().unwrap();
        assert_eq!(
            *transitions,
            vec![
                ("peer".to_string(), NodeStatus::Unhealthy),
                ("peer".to_string(), NodeStatus::Dead),
                ("peer".to_string(), NodeStatus::Healthy),
            ]
        );
    }

    #[test]
    fn test_callback_can_reenter_manager() {
        // A callback that queries membership state must not deadlock
        let manager = Arc::new(test_manager());
        manager.add_node(Node::new("peer", "p:1"));

        let observed = Arc::new(AtomicUsize::new(0));
        let inner = manager.clone();
        let count = observed.clone();
        manager.on_node_event(Arc::new(move |_, _| {
            let _ = inner.healthy_nodes();
            count.fetch_add(1, Ordering::Relaxed);
        }));

        for _ in 0..3 {
            manager.record_check_result("peer", false);
        }
        assert_eq!(observed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_stats() {
        let manager = test_manager();
        manager.add_node(Node::new("a", "a:1"));
        manager.add_node(Node::new("b", "b:1"));
        manager.add_node(Node::new("c", "c:1"));

        for _ in 0..3 {
            manager.record_check_result("b", false);
        }
        for _ in 0..6 {
            manager.record_check_result("c", false);
        }

        let stats = manager.stats();
        assert_eq!(stats.total_nodes, 3);
        assert_eq!(stats.healthy_nodes, 1);
        assert_eq!(stats.unhealthy_nodes, 1);
        assert_eq!(stats.dead_nodes, 1);
    }

    #[test]
    fn test_draining_status() {
        let manager = test_manager();
        manager.add_node(Node::new("peer", "p:1"));
        manager.mark_status("peer", NodeStatus::Draining);
        assert_eq!(manager.node_info("peer").unwrap().status, NodeStatus::Draining);
        assert!(!manager.is_healthy("peer"));
    }
}
