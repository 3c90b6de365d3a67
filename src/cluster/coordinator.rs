//! # 协调器模块
//!
//! 协调器是集群成员与环版本的权威注册表。节点启动时注册，之后周期性
//! 发送心跳；心跳响应携带当前环版本，节点据此惰性拉取最新拓扑。
//!
//! ## 功能特性
//!
//! - **幂等注册**: 以节点 id 为键，重复注册只刷新心跳
//! - **心跳与活性推断**: 心跳过期超过阈值判为 UNHEALTHY，超过两倍判为 DEAD
//! - **操作员增删**: 显式添加/移除节点并递增环版本
//! - **状态持久化**: 每次环变更原子落盘（JSON 模式化，tmp + rename），
//!   启动时读回；状态文件缺失则从空集群开始

use super::ring::HashRing;
use super::{Node, NodeStatus};
use crate::storage::{StorageError, StorageResult};
use crate::{current_time_ms, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub replication_factor: usize,
    pub virtual_nodes_per_node: usize,
    /// Heartbeats older than this are UNHEALTHY; older than twice, DEAD
    pub heartbeat_timeout: Duration,
    /// Path of the persisted ring-and-nodes state
    pub state_path: PathBuf,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            virtual_nodes_per_node: 150,
            heartbeat_timeout: Duration::from_secs(5),
            state_path: PathBuf::from("./coordinator-state.json"),
        }
    }
}

/// One registered node as seen by the coordinator
#[derive(Debug, Clone)]
pub struct RegisteredNode {
    pub node: Node,
    pub status: NodeStatus,
    pub last_heartbeat_ms: i64,
}

/// View of the ring returned to callers
#[derive(Debug, Clone)]
pub struct RingView {
    pub version: u64,
    pub changed: bool,
    pub replication_factor: usize,
    pub virtual_nodes_per_node: usize,
    /// Healthy members only
    pub nodes: Vec<RegisteredNode>,
}

/// Aggregate cluster status with inferred liveness
#[derive(Debug, Clone)]
pub struct ClusterStatus {
    pub nodes: Vec<RegisteredNode>,
    pub total_nodes: usize,
    pub healthy_nodes: usize,
    pub unhealthy_nodes: usize,
    pub dead_nodes: usize,
    pub ring_version: u64,
}

/// Persisted coordinator state, schema version embedded in the layout
#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    ring_version: u64,
    nodes: Vec<PersistedNode>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedNode {
    id: String,
    address: String,
    status: String,
}

/// 协调器
///
/// 节点表由互斥锁保护；环版本是单调计数器，随每次拓扑变更递增并持久化。
pub struct Coordinator {
    config: CoordinatorConfig,
    ring: HashRing,
    nodes: Mutex<HashMap<NodeId, RegisteredNode>>,
    ring_version: AtomicU64,
    heartbeats_received: AtomicU64,
    registrations: AtomicU64,
}

impl Coordinator {
    /// Create the coordinator, loading any persisted state.
    pub fn open(config: CoordinatorConfig) -> StorageResult<Self> {
        let coordinator = Self {
            ring: HashRing::new(config.virtual_nodes_per_node),
            nodes: Mutex::new(HashMap::new()),
            ring_version: AtomicU64::new(1),
            heartbeats_received: AtomicU64::new(0),
            registrations: AtomicU64::new(0),
            config,
        };
        coordinator.load_state()?;
        Ok(coordinator)
    }

    /// Register a node. Idempotent by id: a known node only refreshes its
    /// heartbeat; a new node joins the ring and bumps the version.
    pub fn register_node(&self, node_id: &str, address: &str) -> StorageResult<u64> {
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        self.registrations.fetch_add(1, Ordering::Relaxed);

        let is_new = !nodes.contains_key(node_id);
        nodes.insert(
            node_id.to_string(),
            RegisteredNode {
                node: Node::new(node_id, address),
                status: NodeStatus::Healthy,
                last_heartbeat_ms: current_time_ms(),
            },
        );

        if is_new {
            self.ring.add_node(Node::new(node_id, address));
            let version = self.ring_version.fetch_add(1, Ordering::SeqCst) + 1;
            self.save_state(&nodes)?;
            info!("Node {} registered at {}, ring version {}", node_id, address, version);
            Ok(version)
        } else {
            debug!("Node {} re-registered", node_id);
            Ok(self.ring_version.load(Ordering::SeqCst))
        }
    }

    /// Refresh a node's heartbeat. Returns the current ring version and
    /// whether it differs from the caller's known version.
    pub fn heartbeat(&self, node_id: &str, known_version: u64) -> Option<(u64, bool)> {
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        let info = nodes.get_mut(node_id)?;

        info.last_heartbeat_ms = current_time_ms();
        if info.status != NodeStatus::Healthy {
            info!("Node {} recovered to HEALTHY", node_id);
            info.status = NodeStatus::Healthy;
        }
        self.heartbeats_received.fetch_add(1, Ordering::Relaxed);

        let version = self.ring_version.load(Ordering::SeqCst);
        Some((version, version != known_version))
    }

    /// Operator action: add a node. Fails if the id already exists.
    pub fn add_node(&self, node_id: &str, address: &str) -> Result<u64, String> {
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());

        if nodes.contains_key(node_id) {
            return Err(format!("Node {} already exists", node_id));
        }

        nodes.insert(
            node_id.to_string(),
            RegisteredNode {
                node: Node::new(node_id, address),
                status: NodeStatus::Healthy,
                last_heartbeat_ms: current_time_ms(),
            },
        );
        self.ring.add_node(Node::new(node_id, address));
        let version = self.ring_version.fetch_add(1, Ordering::SeqCst) + 1;

        if let Err(e) = self.save_state(&nodes) {
            warn!("Failed to persist coordinator state: {}", e);
        }
        info!("Node {} added, ring version {}", node_id, version);
        Ok(version)
    }

    /// Operator action: remove a node. Fails if the id is unknown.
    pub fn remove_node(&self, node_id: &str) -> Result<u64, String> {
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());

        if nodes.remove(node_id).is_none() {
            return Err(format!("Node {} not found", node_id));
        }

        self.ring.remove_node(node_id);
        let version = self.ring_version.fetch_add(1, Ordering::SeqCst) + 1;

        if let Err(e) = self.save_state(&nodes) {
            warn!("Failed to persist coordinator state: {}", e);
        }
        info!("Node {} removed, ring version {}", node_id, version);
        Ok(version)
    }

    /// All registered nodes with their stored status
    pub fn get_nodes(&self) -> Vec<RegisteredNode> {
        let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        nodes.values().cloned().collect()
    }

    /// Ring view for a caller that knows `current_version`.
    /// Only healthy members are included.
    pub fn get_ring_view(&self, current_version: u64) -> RingView {
        let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        let version = self.ring_version.load(Ordering::SeqCst);

        RingView {
            version,
            changed: version != current_version,
            replication_factor: self.config.replication_factor,
            virtual_nodes_per_node: self.config.virtual_nodes_per_node,
            nodes: nodes
                .values()
                .filter(|info| info.status == NodeStatus::Healthy)
                .cloned()
                .collect(),
        }
    }

    /// Cluster status with liveness inferred from heartbeat age.
    pub fn cluster_status(&self) -> ClusterStatus {
        let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        let now = current_time_ms();
        let timeout_ms = self.config.heartbeat_timeout.as_millis() as i64;

        let mut status = ClusterStatus {
            nodes: Vec::with_capacity(nodes.len()),
            total_nodes: nodes.len(),
            healthy_nodes: 0,
            unhealthy_nodes: 0,
            dead_nodes: 0,
            ring_version: self.ring_version.load(Ordering::SeqCst),
        };

        for info in nodes.values() {
            let elapsed = now - info.last_heartbeat_ms;
            let effective = if elapsed > timeout_ms * 2 {
                NodeStatus::Dead
            } else if elapsed > timeout_ms {
                NodeStatus::Unhealthy
            } else {
                info.status
            };

            match effective {
                NodeStatus::Healthy => status.healthy_nodes += 1,
                NodeStatus::Unhealthy => status.unhealthy_nodes += 1,
                NodeStatus::Dead => status.dead_nodes += 1,
                _ => {}
            }

            status.nodes.push(RegisteredNode {
                node: info.node.clone(),
                status: effective,
                last_heartbeat_ms: info.last_heartbeat_ms,
            });
        }

        status
    }

    /// Current ring version
    pub fn ring_version(&self) -> u64 {
        self.ring_version.load(Ordering::SeqCst)
    }

    /// The authoritative ring
    pub fn ring(&self) -> &HashRing {
        &self.ring
    }

    /// Persist ring version and node list atomically (tmp + rename).
    fn save_state(&self, nodes: &HashMap<NodeId, RegisteredNode>) -> StorageResult<()> {
        let state = PersistedState {
            ring_version: self.ring_version.load(Ordering::SeqCst),
            nodes: nodes
                .values()
                .map(|info| PersistedNode {
                    id: info.node.id.clone(),
                    address: info.node.address.clone(),
                    status: info.status.to_string(),
                })
                .collect(),
        };

        if let Some(parent) = self.config.state_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = self.config.state_path.with_extension("json.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &state)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        fs::rename(&tmp_path, &self.config.state_path)?;

        debug!("Coordinator state saved to {:?}", self.config.state_path);
        Ok(())
    }

    /// Load persisted state; an absent file starts an empty cluster.
    fn load_state(&self) -> StorageResult<()> {
        if !self.config.state_path.exists() {
            info!("No coordinator state file, starting with an empty cluster");
            return Ok(());
        }

        let file = File::open(&self.config.state_path)?;
        let reader = BufReader::new(file);
        let state: PersistedState = serde_json::from_reader(reader).map_err(|e| {
            StorageError::InvalidFormat(format!(
                "corrupt coordinator state {:?}: {}",
                self.config.state_path, e
            ))
        })?;

        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        for persisted in state.nodes {
            let status = match persisted.status.parse() {
                Ok(status) => status,
                Err(e) => {
                    warn!("Defaulting node {} to HEALTHY: {}", persisted.id, e);
                    NodeStatus::Healthy
                }
            };
            self.ring
                .add_node(Node::new(&persisted.id, &persisted.address));
            nodes.insert(
                persisted.id.clone(),
                RegisteredNode {
                    node: Node::new(&persisted.id, &persisted.address),
                    status,
                    last_heartbeat_ms: current_time_ms(),
                },
            );
        }
        self.ring_version.store(state.ring_version, Ordering::SeqCst);

        info!(
            "Coordinator state loaded: {} node(s), ring version {}",
            nodes.len(),
            state.ring_version
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_coordinator(temp_dir: &TempDir) -> Coordinator {
        Coordinator::open(CoordinatorConfig {
            state_path: temp_dir.path().join("state.json"),
            heartbeat_timeout: Duration::from_millis(100),
            ..CoordinatorConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_register_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let coordinator = test_coordinator(&temp_dir);

        let v1 = coordinator.register_node("node1", "a:1").unwrap();
        let v2 = coordinator.register_node("node1", "a:1").unwrap();
        assert_eq!(v1, v2);
        assert_eq!(coordinator.get_nodes().len(), 1);
        assert_eq!(coordinator.ring().node_count(), 1);
    }

    #[test]
    fn test_register_bumps_ring_version() {
        let temp_dir = TempDir::new().unwrap();
        let coordinator = test_coordinator(&temp_dir);

        let initial = coordinator.ring_version();
        let after = coordinator.register_node("node1", "a:1").unwrap();
        assert_eq!(after, initial + 1);
    }

    #[test]
    fn test_heartbeat_reports_ring_changes() {
        let temp_dir = TempDir::new().unwrap();
        let coordinator = test_coordinator(&temp_dir);

        let version = coordinator.register_node("node1", "a:1").unwrap();

        // Up-to-date caller sees no change
        let (v, changed) = coordinator.heartbeat("node1", version).unwrap();
        assert_eq!(v, version);
        assert!(!changed);

        // Ring mutates; the next heartbeat flags the change
        coordinator.add_node("node2", "b:1").unwrap();
        let (v2, changed) = coordinator.heartbeat("node1", version).unwrap();
        assert!(changed);
        assert_eq!(v2, version + 1);

        // Unregistered node cannot heartbeat
        assert!(coordinator.heartbeat("ghost", 0).is_none());
    }

    #[test]
    fn test_add_and_remove_node() {
        let temp_dir = TempDir::new().unwrap();
        let coordinator = test_coordinator(&temp_dir);

        coordinator.add_node("node1", "a:1").unwrap();
        assert!(coordinator.add_node("node1", "a:1").is_err());

        coordinator.remove_node("node1").unwrap();
        assert!(coordinator.remove_node("node1").is_err());
        assert_eq!(coordinator.ring().node_count(), 0);
    }

    #[test]
    fn test_ring_view_conditional() {
        let temp_dir = TempDir::new().unwrap();
        let coordinator = test_coordinator(&temp_dir);
        let version = coordinator.register_node("node1", "a:1").unwrap();

        let view = coordinator.get_ring_view(version);
        assert!(!view.changed);
        assert_eq!(view.nodes.len(), 1);

        let view = coordinator.get_ring_view(0);
        assert!(view.changed);
        assert_eq!(view.replication_factor, 3);
        assert_eq!(view.virtual_nodes_per_node, 150);
    }

    #[test]
    fn test_liveness_inference() {
        let temp_dir = TempDir::new().unwrap();
        let coordinator = test_coordinator(&temp_dir);

        coordinator.register_node("fresh", "a:1").unwrap();
        coordinator.register_node("stale", "b:1").unwrap();
        coordinator.register_node("gone", "c:1").unwrap();

        // Age the heartbeats by hand
        {
            let mut nodes = coordinator.nodes.lock().unwrap();
            nodes.get_mut("stale").unwrap().last_heartbeat_ms = current_time_ms() - 150;
            nodes.get_mut("gone").unwrap().last_heartbeat_ms = current_time_ms() - 500;
        }

        let status = coordinator.cluster_status();
        assert_eq!(status.total_nodes, 3);
        assert_eq!(status.healthy_nodes, 1);
        assert_eq!(status.unhealthy_nodes, 1);
        assert_eq!(status.dead_nodes, 1);
    }

    #[test]
    fn test_state_survives_restart() {
        let temp_dir = TempDir::new().unwrap();
        let ring_version = {
            let coordinator = test_coordinator(&temp_dir);
            coordinator.register_node("node1", "a:1").unwrap();
            coordinator.register_node("node2", "b:1").unwrap();
            coordinator.ring_version()
        };

        let coordinator = test_coordinator(&temp_dir);
        assert_eq!(coordinator.ring_version(), ring_version);
        assert_eq!(coordinator.get_nodes().len(), 2);
        assert_eq!(coordinator.ring().node_count(), 2);

        // Re-registration after restart stays idempotent
        let v = coordinator.register_node("node1", "a:1").unwrap();
        assert_eq!(v, ring_version);
    }

    #[test]
    fn test_absent_state_file_starts_empty() {
        let temp_dir = TempDir::new().unwrap();
        let coordinator = test_coordinator(&temp_dir);
        assert!(coordinator.get_nodes().is_empty());
        assert_eq!(coordinator.ring_version(), 1);
    }
}
