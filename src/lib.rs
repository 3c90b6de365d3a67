//! # 分布式内存缓存系统
//!
//! 这是一个基于一致性哈希的水平可扩展分布式内存缓存系统。集群由对等节点组成，
//! 每个键通过哈希环确定性地映射到一组副本节点，写入在主节点提交后异步复制，
//! 并通过预写日志和快照实现崩溃恢复。
//!
//! ## 核心特性
//!
//! - **一致性哈希**: 虚拟节点保证键空间均匀分布，拓扑变更时迁移量最小
//! - **分片存储引擎**: 锁分条的 LRU 缓存，支持 TTL 和原子 CAS
//! - **持久化**: 预写日志 + 周期快照，重启后无损恢复
//! - **异步复制**: 主节点批量推送变更到副本节点
//! - **法定人数读写**: W+R>N 覆盖层提供单键线性一致读
//! - **故障检测与转移**: 心跳检测节点失联，自动提升副本为新主节点
//! - **再均衡**: 环变更后按迁移路径批量搬移受影响的键
//!
//! ## 架构组件
//!
//! ### 核心模块
//!
//! - [`storage`]: 分片存储引擎、预写日志、快照与恢复
//! - [`cluster`]: 哈希环、成员管理、协调器、故障转移、再均衡、法定人数
//! - [`replication`]: 复制队列与批量推送
//! - [`network`]: 节点间 gRPC 通信层
//!
//! ### 数据流
//!
//! ```text
//! 客户端写入 → 哈希环定位主节点 → 存储引擎提交(分片锁) → 预写日志落盘
//!                                        ↓
//!                                   复制队列 → 批量推送 → 副本节点应用
//! ```
//!
//! ## 快速开始
//!
//! ### 启动单节点
//!
//! ```bash
//! cargo run --bin distcache-server -- \
//!   --node-id node1 \
//!   --grpc-addr 127.0.0.1:50051 \
//!   --data-dir ./data/node1
//! ```
//!
//! ### 三节点集群示例
//!
//! ```bash
//! # 协调器
//! cargo run --bin distcache-coordinator -- --grpc-addr 127.0.0.1:50050
//!
//! # 节点 1
//! cargo run --bin distcache-server -- \
//!   --node-id node1 --grpc-addr 127.0.0.1:50051 \
//!   --coordinator http://127.0.0.1:50050 \
//!   --peers node2@127.0.0.1:50052 --peers node3@127.0.0.1:50053
//!
//! # 节点 2、节点 3 同理
//! ```
//!
//! ## 一致性保证
//!
//! - **单键版本单调**: 每个键在每个节点上的版本严格递增
//! - **持久性**: 对客户端确认成功的写入必先写入预写日志
//! - **法定人数重叠**: W+R>N 时读必然观察到最近一次成功写入
//! - **复制有序**: 同一主节点对同一键的复制保持 FIFO 顺序

pub mod cluster;
pub mod metrics;
pub mod network;
pub mod replication;
pub mod storage;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Node identifier type
pub type NodeId = String;

/// Configuration for a cache node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique identifier for this node
    pub node_id: NodeId,
    /// Address this node's gRPC endpoint listens on
    pub listen_addr: String,
    /// Data directory for WAL and snapshots
    pub data_dir: String,
    /// Coordinator endpoint (empty = standalone)
    pub coordinator_addr: String,
    /// Initial cluster peers (node_id -> address)
    pub peers: HashMap<NodeId, String>,
    /// Cache engine configuration
    pub cache: CacheConfig,
    /// Cluster-wide replication configuration
    pub cluster: ClusterConfig,
}

/// Storage engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Number of lock-striped shards
    pub num_shards: usize,
    /// Maximum engine memory in bytes
    pub max_memory_bytes: usize,
    /// Snapshot interval in seconds
    pub snapshot_interval_secs: u64,
    /// Number of snapshots retained on disk
    pub max_snapshots_retained: usize,
    /// WAL file rotation threshold in bytes
    pub wal_max_file_size_bytes: usize,
    /// Maximum number of WAL files retained
    pub wal_max_files: usize,
    /// Sync WAL to disk after every record
    pub wal_sync_on_write: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            num_shards: 256,
            max_memory_bytes: 1024 * 1024 * 1024,
            snapshot_interval_secs: 300,
            max_snapshots_retained: 3,
            wal_max_file_size_bytes: 100 * 1024 * 1024,
            wal_max_files: 10,
            wal_sync_on_write: true,
        }
    }
}

/// Cluster topology and replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Number of replicas per key (including the primary)
    pub replication_factor: usize,
    /// Virtual nodes per physical node on the hash ring
    pub virtual_nodes_per_node: usize,
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Per-check health RPC timeout in milliseconds
    pub health_timeout_ms: u64,
    /// Consecutive failures before a peer is marked UNHEALTHY
    pub failure_threshold: u32,
    /// Consecutive failures before a peer is marked DEAD
    pub dead_threshold: u32,
    /// Enable automatic failover on DEAD transitions
    pub auto_failover: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            virtual_nodes_per_node: 150,
            heartbeat_interval_ms: 1000,
            health_timeout_ms: 500,
            failure_threshold: 3,
            dead_threshold: 6,
            auto_failover: true,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        let node_id = Uuid::new_v4().to_string();
        Self {
            node_id,
            listen_addr: "127.0.0.1:50051".to_string(),
            data_dir: "./data".to_string(),
            coordinator_addr: String::new(),
            peers: HashMap::new(),
            cache: CacheConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

/// Maximum key length in bytes accepted at the RPC boundary
pub const MAX_KEY_BYTES: usize = 256;
/// Maximum value size in bytes accepted at the RPC boundary
pub const MAX_VALUE_BYTES: usize = 1024 * 1024;
/// Maximum TTL in seconds (30 days)
pub const MAX_TTL_SECONDS: i32 = 30 * 24 * 3600;

/// Error kinds surfaced to callers of the cache
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unauthenticated")]
    Unauthenticated,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Version mismatch: actual version is {actual_version}")]
    Aborted { actual_version: i64 },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Network error: {0}")]
    Network(#[from] network::NetworkError),
}

pub type CacheResult<T> = Result<T, CacheError>;

impl From<CacheError> for tonic::Status {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::InvalidArgument(msg) => tonic::Status::invalid_argument(msg),
            CacheError::Unauthenticated => tonic::Status::unauthenticated("authentication required"),
            CacheError::PermissionDenied => tonic::Status::permission_denied("permission denied"),
            CacheError::ResourceExhausted(msg) => tonic::Status::resource_exhausted(msg),
            CacheError::NotFound(msg) => tonic::Status::not_found(msg),
            CacheError::DeadlineExceeded => tonic::Status::deadline_exceeded("deadline exceeded"),
            CacheError::Unavailable(msg) => tonic::Status::unavailable(msg),
            CacheError::Aborted { actual_version } => {
                tonic::Status::aborted(format!("version mismatch: actual version is {}", actual_version))
            }
            CacheError::Internal(msg) => tonic::Status::internal(msg),
            CacheError::Storage(e) => tonic::Status::internal(e.to_string()),
            CacheError::Network(e) => tonic::Status::unavailable(e.to_string()),
        }
    }
}

/// Current time in milliseconds since the Unix epoch
pub fn current_time_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Include generated protobuf code
pub mod proto {
    tonic::include_proto!("distcache");

    /// File descriptor set for reflection
    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("distcache_descriptor");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert!(!config.node_id.is_empty());
        assert_eq!(config.listen_addr, "127.0.0.1:50051");
        assert_eq!(config.cache.num_shards, 256);
        assert_eq!(config.cluster.replication_factor, 3);
    }

    #[test]
    fn test_cluster_config_thresholds() {
        let config = ClusterConfig::default();
        assert!(config.failure_threshold < config.dead_threshold);
        assert_eq!(config.virtual_nodes_per_node, 150);
    }

    #[test]
    fn test_error_status_mapping() {
        let status: tonic::Status = CacheError::Aborted { actual_version: 7 }.into();
        assert_eq!(status.code(), tonic::Code::Aborted);

        let status: tonic::Status = CacheError::InvalidArgument("key too long".into()).into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }
}
