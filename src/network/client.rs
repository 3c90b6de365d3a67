//! # 节点客户端模块
//!
//! 到单个缓存节点（或协调器）的 gRPC 客户端封装。一个客户端复用一条
//! HTTP/2 通道，各服务的存根按需从通道克隆，天然支持并发请求。
//!
//! ## 功能特性
//!
//! - **连接复用**: 单通道多服务，HTTP/2 长连接保持
//! - **超时控制**: 连接与请求超时在端点上统一配置
//! - **类型安全**: 按领域操作暴露方法，内部处理 proto 转换
//! - **连接池**: [`ClientPool`] 按地址缓存客户端

use crate::proto;
use crate::network::{NetworkError, NetworkResult};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tonic::transport::{Channel, Endpoint};
use tonic::Request;
use tracing::{debug, warn};

/// 节点客户端
///
/// 克隆成本低（底层通道引用计数），可以在异步任务间自由传递。
#[derive(Clone)]
pub struct NodeClient {
    channel: Channel,
    address: String,
}

impl NodeClient {
    /// Connect to a node, normalizing bare `host:port` addresses.
    pub async fn connect(address: &str) -> NetworkResult<Self> {
        let uri = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };

        let endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| NetworkError::InvalidAddress(format!("{}: {}", address, e)))?
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .http2_keep_alive_interval(Duration::from_secs(30))
            .keep_alive_timeout(Duration::from_secs(5))
            .keep_alive_while_idle(true);

        let channel = endpoint.connect().await.map_err(|e| {
            warn!("Failed to connect to {}: {}", address, e);
            NetworkError::Connection(e)
        })?;

        debug!("Connected to node at {}", uri);
        Ok(Self {
            channel,
            address: uri,
        })
    }

    /// Connect lazily; the channel is established on first use.
    pub fn connect_lazy(address: &str) -> NetworkResult<Self> {
        let uri = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };

        let endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| NetworkError::InvalidAddress(format!("{}: {}", address, e)))?
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .http2_keep_alive_interval(Duration::from_secs(30))
            .keep_alive_timeout(Duration::from_secs(5))
            .keep_alive_while_idle(true);

        Ok(Self {
            channel: endpoint.connect_lazy(),
            address: uri,
        })
    }

    /// Address this client talks to
    pub fn address(&self) -> &str {
        &self.address
    }

    fn cache(&self) -> proto::cache_service_client::CacheServiceClient<Channel> {
        proto::cache_service_client::CacheServiceClient::new(self.channel.clone())
    }

    fn replication(&self) -> proto::replication_service_client::ReplicationServiceClient<Channel> {
        proto::replication_service_client::ReplicationServiceClient::new(self.channel.clone())
    }

    fn failover(&self) -> proto::failover_service_client::FailoverServiceClient<Channel> {
        proto::failover_service_client::FailoverServiceClient::new(self.channel.clone())
    }

    fn coordinator(&self) -> proto::coordinator_service_client::CoordinatorServiceClient<Channel> {
        proto::coordinator_service_client::CoordinatorServiceClient::new(self.channel.clone())
    }

    // -- cache data plane ---------------------------------------------------

    /// GET a key with a per-call deadline
    pub async fn get(&self, key: &str, deadline: Duration) -> NetworkResult<proto::GetResponse> {
        let mut request = Request::new(proto::GetRequest {
            key: key.to_string(),
        });
        request.set_timeout(deadline);
        let response = self.cache().get(request).await?;
        Ok(response.into_inner())
    }

    /// SET a key with a per-call deadline
    pub async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl_seconds: Option<i32>,
        deadline: Duration,
    ) -> NetworkResult<proto::SetResponse> {
        let mut request = Request::new(proto::SetRequest {
            key: key.to_string(),
            value,
            ttl_seconds,
        });
        request.set_timeout(deadline);
        let response = self.cache().set(request).await?;
        Ok(response.into_inner())
    }

    /// DELETE a key with a per-call deadline
    pub async fn delete(&self, key: &str, deadline: Duration) -> NetworkResult<proto::DeleteResponse> {
        let mut request = Request::new(proto::DeleteRequest {
            key: key.to_string(),
        });
        request.set_timeout(deadline);
        let response = self.cache().delete(request).await?;
        Ok(response.into_inner())
    }

    /// Compare-and-swap with a per-call deadline.
    ///
    /// A version mismatch comes back as `Ok` with `success == false` and the
    /// actual version filled in; only transport problems are errors.
    pub async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: i64,
        new_value: Vec<u8>,
        ttl_seconds: Option<i32>,
        deadline: Duration,
    ) -> NetworkResult<proto::CompareAndSwapResponse> {
        let mut request = Request::new(proto::CompareAndSwapRequest {
            key: key.to_string(),
            expected_version,
            new_value,
            ttl_seconds,
        });
        request.set_timeout(deadline);
        match self.cache().compare_and_swap(request).await {
            Ok(response) => Ok(response.into_inner()),
            Err(status) if status.code() == tonic::Code::Aborted => {
                // Surface the mismatch in-band so quorum CAS can classify it
                Ok(proto::CompareAndSwapResponse {
                    success: false,
                    new_version: 0,
                    actual_version: parse_actual_version(status.message()),
                    error: status.message().to_string(),
                })
            }
            Err(status) => Err(NetworkError::Rpc(status)),
        }
    }

    /// Health check with a bounded timeout
    pub async fn health_check(&self, deadline: Duration) -> NetworkResult<bool> {
        let mut request = Request::new(proto::HealthCheckRequest {});
        request.set_timeout(deadline);
        let response = self.cache().health_check(request).await?;
        let serving = response.into_inner().status
            == proto::health_check_response::ServingStatus::Serving as i32;
        Ok(serving)
    }

    // -- replication --------------------------------------------------------

    /// Ship a replication batch
    pub async fn replicate(
        &self,
        batch: proto::ReplicationBatch,
        deadline: Duration,
    ) -> NetworkResult<proto::ReplicationAck> {
        let mut request = Request::new(batch);
        request.set_timeout(deadline);
        let response = self.replication().replicate(request).await?;
        Ok(response.into_inner())
    }

    /// Open a sync stream for the requested keys (all keys when empty)
    pub async fn sync(
        &self,
        requesting_node_id: &str,
        keys_to_sync: Vec<String>,
    ) -> NetworkResult<tonic::Streaming<proto::SyncEntry>> {
        let request = Request::new(proto::SyncRequest {
            requesting_node_id: requesting_node_id.to_string(),
            keys_to_sync,
        });
        let response = self.replication().sync(request).await?;
        Ok(response.into_inner())
    }

    // -- failover -----------------------------------------------------------

    /// Ask a peer to initiate failover for a dead node
    pub async fn initiate_failover(
        &self,
        failed_node_id: &str,
    ) -> NetworkResult<proto::FailoverResponse> {
        let request = Request::new(proto::FailoverRequest {
            failed_node_id: failed_node_id.to_string(),
        });
        let response = self.failover().initiate_failover(request).await?;
        Ok(response.into_inner())
    }

    /// Open a catchup stream for the keys this node owns
    pub async fn catchup(
        &self,
        node_id: &str,
        keys_owned: Vec<String>,
    ) -> NetworkResult<tonic::Streaming<proto::CatchupEntry>> {
        let request = Request::new(proto::CatchupRequest {
            node_id: node_id.to_string(),
            keys_owned,
        });
        let response = self.failover().catchup(request).await?;
        Ok(response.into_inner())
    }

    // -- coordinator --------------------------------------------------------

    /// Register this node with the coordinator
    pub async fn register_node(
        &self,
        node_id: &str,
        address: &str,
    ) -> NetworkResult<proto::RegisterNodeResponse> {
        let request = Request::new(proto::RegisterNodeRequest {
            node_id: node_id.to_string(),
            address: address.to_string(),
        });
        let response = self.coordinator().register_node(request).await?;
        Ok(response.into_inner())
    }

    /// Heartbeat against the coordinator
    pub async fn heartbeat(
        &self,
        node_id: &str,
        known_ring_version: u64,
    ) -> NetworkResult<proto::HeartbeatResponse> {
        let request = Request::new(proto::HeartbeatRequest {
            node_id: node_id.to_string(),
            known_ring_version,
        });
        let response = self.coordinator().heartbeat(request).await?;
        Ok(response.into_inner())
    }

    /// Pull the ring, conditional on a known version
    pub async fn get_ring(&self, current_version: u64) -> NetworkResult<proto::GetRingResponse> {
        let request = Request::new(proto::GetRingRequest { current_version });
        let response = self.coordinator().get_ring(request).await?;
        Ok(response.into_inner())
    }
}

/// Extract the actual version from an ABORTED CAS status message.
fn parse_actual_version(message: &str) -> i64 {
    message
        .rsplit(' ')
        .next()
        .and_then(|token| token.parse().ok())
        .unwrap_or(0)
}

/// 客户端连接池
///
/// 按地址缓存 [`NodeClient`]，连接惰性建立，断连的客户端可以被移除。
pub struct ClientPool {
    clients: RwLock<HashMap<String, NodeClient>>,
}

impl ClientPool {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Get the pooled client for an address, creating one lazily.
    pub async fn get(&self, address: &str) -> NetworkResult<NodeClient> {
        {
            let clients = self.clients.read().await;
            if let Some(client) = clients.get(address) {
                return Ok(client.clone());
            }
        }

        let client = NodeClient::connect_lazy(address)?;
        let mut clients = self.clients.write().await;
        Ok(clients
            .entry(address.to_string())
            .or_insert(client)
            .clone())
    }

    /// Drop a client (e.g. after repeated failures)
    pub async fn remove(&self, address: &str) -> bool {
        self.clients.write().await.remove(address).is_some()
    }

    /// Number of pooled connections
    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}

impl Default for ClientPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_address_rejected() {
        let result = NodeClient::connect_lazy("not a uri at all\u{7f}");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_bare_address_gets_scheme() {
        let client = NodeClient::connect_lazy("127.0.0.1:50051").unwrap();
        assert_eq!(client.address(), "http://127.0.0.1:50051");

        let client = NodeClient::connect_lazy("http://127.0.0.1:50052").unwrap();
        assert_eq!(client.address(), "http://127.0.0.1:50052");
    }

    #[tokio::test]
    async fn test_pool_reuses_clients() {
        let pool = ClientPool::new();
        assert!(pool.is_empty().await);

        pool.get("127.0.0.1:50051").await.unwrap();
        pool.get("127.0.0.1:50051").await.unwrap();
        assert_eq!(pool.len().await, 1);

        pool.get("127.0.0.1:50052").await.unwrap();
        assert_eq!(pool.len().await, 2);

        assert!(pool.remove("127.0.0.1:50051").await);
        assert!(!pool.remove("127.0.0.1:50051").await);
        assert_eq!(pool.len().await, 1);
    }

    #[test]
    fn test_parse_actual_version() {
        assert_eq!(parse_actual_version("version mismatch: actual version is 42"), 42);
        assert_eq!(parse_actual_version("nonsense"), 0);
    }
}
