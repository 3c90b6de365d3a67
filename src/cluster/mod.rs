//! # 集群模块
//!
//! 本模块汇集了分布式缓存的集群侧组件：
//!
//! - [`ring`]: 一致性哈希环，键到副本节点列表的确定性映射
//! - [`version_vector`]: 因果关系比较与合并
//! - [`membership`]: 心跳探测与故障检测状态机
//! - [`coordinator`]: 权威的成员注册表与环版本管理
//! - [`failover`]: 节点死亡后的主节点提升
//! - [`rebalance`]: 环变更后的键迁移编排
//! - [`quorum`]: W/R 法定人数读写覆盖层

use serde::{Deserialize, Serialize};

pub mod coordinator;
pub mod failover;
pub mod membership;
pub mod quorum;
pub mod rebalance;
pub mod ring;
pub mod version_vector;

/// A physical member of the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier (e.g. "node1")
    pub id: String,
    /// Network address (e.g. "http://127.0.0.1:50051")
    pub address: String,
}

impl Node {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

/// Operational state of a cluster member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Healthy,
    Unhealthy,
    Dead,
    Draining,
    Failed,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Healthy => "HEALTHY",
            NodeStatus::Unhealthy => "UNHEALTHY",
            NodeStatus::Dead => "DEAD",
            NodeStatus::Draining => "DRAINING",
            NodeStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HEALTHY" => Ok(NodeStatus::Healthy),
            "UNHEALTHY" => Ok(NodeStatus::Unhealthy),
            "DEAD" => Ok(NodeStatus::Dead),
            "DRAINING" => Ok(NodeStatus::Draining),
            "FAILED" => Ok(NodeStatus::Failed),
            other => Err(format!("unknown node status: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_equality_by_fields() {
        let a = Node::new("node1", "127.0.0.1:50051");
        let b = Node::new("node1", "127.0.0.1:50051");
        assert_eq!(a, b);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(NodeStatus::Healthy.to_string(), "HEALTHY");
        assert_eq!(NodeStatus::Draining.to_string(), "DRAINING");
    }

    #[test]
    fn test_status_round_trips_through_strings() {
        for status in [
            NodeStatus::Healthy,
            NodeStatus::Unhealthy,
            NodeStatus::Dead,
            NodeStatus::Draining,
            NodeStatus::Failed,
        ] {
            let parsed: NodeStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("SLEEPING".parse::<NodeStatus>().is_err());
    }
}
