//! # 网络通信模块
//!
//! 本模块实现了节点间通信层：基于 gRPC 的客户端封装与连接池，
//! 以及数据平面、复制、故障转移、管理和协调器五个服务的服务端实现。
//!
//! ## 核心组件
//!
//! ### NodeClient
//! 到单个节点的类型安全客户端，复用一条 HTTP/2 通道：
//! - 缓存数据平面（GET/SET/DELETE/CAS/健康检查）
//! - 复制批次推送与同步流
//! - 协调器注册、心跳、拉取环
//!
//! ### ClientPool
//! 按地址缓存的客户端池，自动建立和复用连接。
//!
//! ### 服务端
//! 每个 proto 服务对应一个具体处理器结构体，持有引擎、日志、
//! 管理器的共享句柄；没有任何进程级单例。
//!
//! ## 错误处理
//!
//! 网络错误统一收敛为 [`NetworkError`]，在 RPC 边界映射为相应的
//! gRPC 状态码。

use crate::proto;
use crate::storage::CacheEntry;
use crate::NodeId;

pub mod client;
pub mod server;

/// 网络错误类型
#[derive(thiserror::Error, Debug)]
pub enum NetworkError {
    #[error("Connection error: {0}")]
    Connection(#[from] tonic::transport::Error),

    #[error("RPC error: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Network timeout")]
    Timeout,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Convert between internal and protobuf types
pub mod conversion {
    use super::*;
    use crate::current_time_ms;

    /// Build a cache entry from a replicated SET, preserving the
    /// sender's version.
    pub fn entry_from_replication(
        entry: &proto::ReplicationEntry,
        source_node_id: &str,
    ) -> CacheEntry {
        let ttl = if entry.ttl_seconds > 0 {
            Some(entry.ttl_seconds)
        } else {
            None
        };
        let mut cache_entry = CacheEntry::new(entry.key.clone(), entry.value.clone(), ttl);
        cache_entry.version = entry.version;
        cache_entry
            .version_vector
            .insert(source_node_id.to_string(), entry.version);
        cache_entry
    }

    /// Build a cache entry from a catchup stream element
    pub fn entry_from_catchup(entry: &proto::CatchupEntry) -> CacheEntry {
        let ttl = if entry.ttl_seconds > 0 {
            Some(entry.ttl_seconds)
        } else {
            None
        };
        let mut cache_entry = CacheEntry::new(entry.key.clone(), entry.value.clone(), ttl);
        cache_entry.version = entry.version;
        if entry.timestamp_ms > 0 {
            cache_entry.created_at_ms = entry.timestamp_ms;
            cache_entry.expires_at_ms = ttl.map(|t| entry.timestamp_ms + t as i64 * 1000);
        }
        cache_entry
    }

    /// Build a cache entry from a sync stream element
    pub fn entry_from_sync(entry: &proto::SyncEntry) -> CacheEntry {
        let ttl = if entry.ttl_seconds > 0 {
            Some(entry.ttl_seconds)
        } else {
            None
        };
        let mut cache_entry = CacheEntry::new(entry.key.clone(), entry.value.clone(), ttl);
        cache_entry.version = entry.version;
        if entry.created_at_ms > 0 {
            cache_entry.created_at_ms = entry.created_at_ms;
            cache_entry.expires_at_ms = ttl.map(|t| entry.created_at_ms + t as i64 * 1000);
        }
        cache_entry
    }

    /// Render a cache entry as a catchup stream element
    pub fn entry_to_catchup(key: &str, entry: &CacheEntry) -> proto::CatchupEntry {
        proto::CatchupEntry {
            key: key.to_string(),
            value: entry.value.clone(),
            ttl_seconds: entry.ttl_seconds.unwrap_or(0),
            version: entry.version,
            timestamp_ms: entry.created_at_ms,
        }
    }

    /// Render a cache entry as a sync stream element
    pub fn entry_to_sync(key: &str, entry: &CacheEntry) -> proto::SyncEntry {
        proto::SyncEntry {
            key: key.to_string(),
            value: entry.value.clone(),
            ttl_seconds: entry.ttl_seconds.unwrap_or(0),
            version: entry.version,
            created_at_ms: entry.created_at_ms,
        }
    }

    /// Wrap pending replication entries into a batch message
    pub fn make_replication_batch(
        source_node_id: &str,
        entries: Vec<proto::ReplicationEntry>,
    ) -> proto::ReplicationBatch {
        proto::ReplicationBatch {
            source_node_id: source_node_id.to_string(),
            timestamp_ms: current_time_ms(),
            entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_from_replication_preserves_version() {
        let proto_entry = proto::ReplicationEntry {
            op: proto::replication_entry::Op::Set as i32,
            key: "k".to_string(),
            value: b"v".to_vec(),
            ttl_seconds: 60,
            version: 7,
        };

        let entry = conversion::entry_from_replication(&proto_entry, "node9");
        assert_eq!(entry.version, 7);
        assert_eq!(entry.ttl_seconds, Some(60));
        assert_eq!(entry.version_vector.get("node9"), Some(&7));
    }

    #[test]
    fn test_zero_ttl_means_none() {
        let proto_entry = proto::ReplicationEntry {
            op: proto::replication_entry::Op::Set as i32,
            key: "k".to_string(),
            value: b"v".to_vec(),
            ttl_seconds: 0,
            version: 1,
        };
        let entry = conversion::entry_from_replication(&proto_entry, "n");
        assert_eq!(entry.ttl_seconds, None);
        assert_eq!(entry.expires_at_ms, None);
    }

    #[test]
    fn test_catchup_round_trip() {
        let mut entry = CacheEntry::new("k".to_string(), b"v".to_vec(), Some(30));
        entry.version = 4;

        let proto_entry = conversion::entry_to_catchup("k", &entry);
        let back = conversion::entry_from_catchup(&proto_entry);

        assert_eq!(back.key, "k");
        assert_eq!(back.value, b"v");
        assert_eq!(back.version, 4);
        assert_eq!(back.ttl_seconds, Some(30));
        assert_eq!(back.created_at_ms, entry.created_at_ms);
    }
}
