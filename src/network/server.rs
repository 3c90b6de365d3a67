//! # 服务端实现模块
//!
//! 本模块为五个 proto 服务各实现一个具体处理器结构体。处理器不继承任何
//! 层次，每个 RPC 方法是一个函数，状态是结构体字段：引擎、预写日志、
//! 复制管理器等以共享句柄注入，进程中没有任何全局单例。
//!
//! ## 请求处理流程
//!
//! 1. **边界校验**: 键长、值大小、TTL 范围在入口处拒绝，绝不改变状态
//! 2. **本地提交**: 引擎在分片锁下提交变更
//! 3. **持久化**: 预写日志落盘后才对客户端确认
//! 4. **复制入队**: 提交成功的变更进入复制队列
//!
//! ## 错误映射
//!
//! 领域错误 [`CacheError`] 在此映射为 gRPC 状态码：版本不匹配 → ABORTED
//! （携带实际版本），键不存在 → NOT_FOUND，校验失败 → INVALID_ARGUMENT，
//! 内存超限 → RESOURCE_EXHAUSTED。

use crate::cluster::coordinator::Coordinator;
use crate::cluster::failover::FailoverManager;
use crate::cluster::membership::MembershipManager;
use crate::cluster::rebalance::RebalanceOrchestrator;
use crate::cluster::ring::HashRing;
use crate::cluster::NodeStatus;
use crate::metrics::Metrics;
use crate::network::conversion;
use crate::proto;
use crate::replication::{apply_batch, ReplicationManager};
use crate::storage::wal::Wal;
use crate::storage::{CasOutcome, StorageEngine, StorageError};
use crate::{CacheError, MAX_KEY_BYTES, MAX_TTL_SECONDS, MAX_VALUE_BYTES};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::Stream;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

/// Validate a key at the RPC boundary
fn validate_key(key: &str) -> Result<(), Status> {
    if key.is_empty() {
        return Err(CacheError::InvalidArgument("key must not be empty".to_string()).into());
    }
    if key.len() > MAX_KEY_BYTES {
        return Err(CacheError::InvalidArgument(format!(
            "key of {} bytes exceeds the {} byte limit",
            key.len(),
            MAX_KEY_BYTES
        ))
        .into());
    }
    Ok(())
}

/// Validate a value at the RPC boundary
fn validate_value(value: &[u8]) -> Result<(), Status> {
    if value.len() > MAX_VALUE_BYTES {
        return Err(CacheError::InvalidArgument(format!(
            "value of {} bytes exceeds the {} byte limit",
            value.len(),
            MAX_VALUE_BYTES
        ))
        .into());
    }
    Ok(())
}

/// Validate a TTL at the RPC boundary
fn validate_ttl(ttl_seconds: Option<i32>) -> Result<(), Status> {
    if let Some(ttl) = ttl_seconds {
        if ttl < 0 || ttl > MAX_TTL_SECONDS {
            return Err(CacheError::InvalidArgument(format!(
                "TTL {} outside the allowed range [0, {}]",
                ttl, MAX_TTL_SECONDS
            ))
            .into());
        }
    }
    Ok(())
}

fn storage_error_to_status(err: StorageError) -> Status {
    match err {
        StorageError::ResourceExhausted(msg) => CacheError::ResourceExhausted(msg).into(),
        other => CacheError::Internal(other.to_string()).into(),
    }
}

/// 缓存数据平面服务
///
/// 持有引擎、预写日志和复制管理器的共享句柄。`serving` 标志在恢复完成
/// 之前为假，健康检查相应返回 NOT_SERVING。
pub struct CacheService {
    engine: Arc<StorageEngine>,
    wal: Arc<Wal>,
    replication: Arc<ReplicationManager>,
    serving: Arc<AtomicBool>,
}

impl CacheService {
    pub fn new(
        engine: Arc<StorageEngine>,
        wal: Arc<Wal>,
        replication: Arc<ReplicationManager>,
        serving: Arc<AtomicBool>,
    ) -> Self {
        Self {
            engine,
            wal,
            replication,
            serving,
        }
    }
}

#[tonic::async_trait]
impl proto::cache_service_server::CacheService for CacheService {
    async fn get(
        &self,
        request: Request<proto::GetRequest>,
    ) -> Result<Response<proto::GetResponse>, Status> {
        let request = request.into_inner();
        validate_key(&request.key)?;

        debug!("GET key={}", request.key);
        let entry = self
            .engine
            .get(&request.key)
            .map_err(storage_error_to_status)?;

        let response = match entry {
            Some(entry) => proto::GetResponse {
                found: true,
                value: entry.value,
                version: entry.version,
                timestamp_ms: entry.modified_at_ms,
                version_vector: entry.version_vector.into_iter().collect(),
            },
            None => proto::GetResponse {
                found: false,
                value: Vec::new(),
                version: 0,
                timestamp_ms: 0,
                version_vector: Default::default(),
            },
        };
        Ok(Response::new(response))
    }

    async fn set(
        &self,
        request: Request<proto::SetRequest>,
    ) -> Result<Response<proto::SetResponse>, Status> {
        let request = request.into_inner();
        validate_key(&request.key)?;
        validate_value(&request.value)?;
        validate_ttl(request.ttl_seconds)?;

        debug!(
            "SET key={} size={} ttl={:?}",
            request.key,
            request.value.len(),
            request.ttl_seconds
        );

        let version = self
            .engine
            .set(&request.key, request.value.clone(), request.ttl_seconds)
            .map_err(storage_error_to_status)?;

        // Durability before the client sees success
        self.wal
            .append_set(&request.key, &request.value, version, request.ttl_seconds)
            .map_err(storage_error_to_status)?;
        self.engine
            .metrics()
            .wal_appends_total
            .fetch_add(1, Ordering::Relaxed);

        self.replication
            .queue_set(&request.key, request.value, request.ttl_seconds, version)
            .await;

        Ok(Response::new(proto::SetResponse {
            success: true,
            version,
            error: String::new(),
        }))
    }

    async fn delete(
        &self,
        request: Request<proto::DeleteRequest>,
    ) -> Result<Response<proto::DeleteResponse>, Status> {
        let request = request.into_inner();
        validate_key(&request.key)?;

        debug!("DELETE key={}", request.key);
        let deleted_version = self
            .engine
            .delete(&request.key)
            .map_err(storage_error_to_status)?;

        // The engine stamps the delete with the next version for this key;
        // log and replicate it so followers can reject stale deletes.
        if let Some(version) = deleted_version {
            self.wal
                .append_delete(&request.key, version)
                .map_err(storage_error_to_status)?;
            self.engine
                .metrics()
                .wal_appends_total
                .fetch_add(1, Ordering::Relaxed);
            self.replication.queue_delete(&request.key, version).await;
        }

        Ok(Response::new(proto::DeleteResponse {
            success: deleted_version.is_some(),
        }))
    }

    async fn compare_and_swap(
        &self,
        request: Request<proto::CompareAndSwapRequest>,
    ) -> Result<Response<proto::CompareAndSwapResponse>, Status> {
        let request = request.into_inner();
        validate_key(&request.key)?;
        validate_value(&request.new_value)?;
        validate_ttl(request.ttl_seconds)?;

        debug!(
            "CAS key={} expected_version={}",
            request.key, request.expected_version
        );

        let outcome = self
            .engine
            .compare_and_swap(
                &request.key,
                request.expected_version,
                request.new_value.clone(),
                request.ttl_seconds,
            )
            .map_err(storage_error_to_status)?;

        match outcome {
            CasOutcome::Success { new_version } => {
                self.wal
                    .append_cas(
                        &request.key,
                        &request.new_value,
                        new_version,
                        request.ttl_seconds,
                        request.expected_version,
                    )
                    .map_err(storage_error_to_status)?;
                // Followers receive the outcome as an ordinary versioned SET
                self.replication
                    .queue_set(&request.key, request.new_value, request.ttl_seconds, new_version)
                    .await;

                Ok(Response::new(proto::CompareAndSwapResponse {
                    success: true,
                    new_version,
                    actual_version: 0,
                    error: String::new(),
                }))
            }
            CasOutcome::VersionMismatch { actual_version } => {
                Err(CacheError::Aborted { actual_version }.into())
            }
            CasOutcome::NotFound => {
                Err(CacheError::NotFound(format!("key {} not found", request.key)).into())
            }
            CasOutcome::Expired => {
                Err(CacheError::NotFound(format!("key {} expired", request.key)).into())
            }
        }
    }

    async fn health_check(
        &self,
        _request: Request<proto::HealthCheckRequest>,
    ) -> Result<Response<proto::HealthCheckResponse>, Status> {
        let (status, message) = if self.serving.load(Ordering::Relaxed) {
            (
                proto::health_check_response::ServingStatus::Serving,
                "cache node is serving",
            )
        } else {
            (
                proto::health_check_response::ServingStatus::NotServing,
                "cache node is not serving",
            )
        };
        Ok(Response::new(proto::HealthCheckResponse {
            status: status as i32,
            message: message.to_string(),
        }))
    }
}

/// 复制服务
pub struct ReplicationService {
    engine: Arc<StorageEngine>,
}

impl ReplicationService {
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        Self { engine }
    }
}

type SyncResponseStream = Pin<Box<dyn Stream<Item = Result<proto::SyncEntry, Status>> + Send>>;

#[tonic::async_trait]
impl proto::replication_service_server::ReplicationService for ReplicationService {
    async fn replicate(
        &self,
        request: Request<proto::ReplicationBatch>,
    ) -> Result<Response<proto::ReplicationAck>, Status> {
        let batch = request.into_inner();
        debug!(
            "Replication batch from {} with {} entries",
            batch.source_node_id,
            batch.entries.len()
        );

        let (applied, failed) = apply_batch(&self.engine, &batch);
        debug!("Applied {} entries, {} failed", applied, failed);

        Ok(Response::new(proto::ReplicationAck {
            success: failed == 0,
            error: if failed > 0 {
                format!("failed to apply {} entries", failed)
            } else {
                String::new()
            },
            last_applied_timestamp: batch.timestamp_ms,
        }))
    }

    type SyncStream = SyncResponseStream;

    async fn sync(
        &self,
        request: Request<proto::SyncRequest>,
    ) -> Result<Response<Self::SyncStream>, Status> {
        let request = request.into_inner();
        info!(
            "Sync request from {} for {} key(s)",
            request.requesting_node_id,
            request.keys_to_sync.len()
        );

        let wanted: std::collections::HashSet<String> =
            request.keys_to_sync.into_iter().collect();
        let mut entries = Vec::new();
        self.engine
            .for_each(|key, entry| {
                if wanted.is_empty() || wanted.contains(key) {
                    entries.push(Ok(conversion::entry_to_sync(key, entry)));
                }
            })
            .map_err(storage_error_to_status)?;

        let stream = tokio_stream::iter(entries);
        Ok(Response::new(Box::pin(stream) as Self::SyncStream))
    }
}

/// 故障转移服务
pub struct FailoverService {
    manager: Arc<FailoverManager>,
    engine: Arc<StorageEngine>,
}

impl FailoverService {
    pub fn new(manager: Arc<FailoverManager>, engine: Arc<StorageEngine>) -> Self {
        Self { manager, engine }
    }
}

type CatchupResponseStream = Pin<Box<dyn Stream<Item = Result<proto::CatchupEntry, Status>> + Send>>;

fn failover_record_to_proto(
    record: &crate::cluster::failover::FailoverRecord,
) -> proto::FailoverInfo {
    proto::FailoverInfo {
        failover_id: record.failover_id.clone(),
        failed_node_id: record.failed_node_id.clone(),
        new_primary_id: record.new_primary_id.clone(),
        started_at_ms: record.started_at_ms,
        completed_at_ms: record.completed_at_ms.unwrap_or(0),
        in_progress: record.in_progress(),
        keys_migrated: record.keys_migrated,
        status: record.state.as_str().to_string(),
    }
}

#[tonic::async_trait]
impl proto::failover_service_server::FailoverService for FailoverService {
    async fn initiate_failover(
        &self,
        request: Request<proto::FailoverRequest>,
    ) -> Result<Response<proto::FailoverResponse>, Status> {
        let request = request.into_inner();
        info!("Failover requested for node {}", request.failed_node_id);

        match self.manager.initiate_failover(&request.failed_node_id) {
            Some(failover_id) => Ok(Response::new(proto::FailoverResponse {
                success: true,
                failover_id,
                error: String::new(),
            })),
            None => Ok(Response::new(proto::FailoverResponse {
                success: false,
                failover_id: String::new(),
                error: "failed to initiate failover".to_string(),
            })),
        }
    }

    type CatchupStream = CatchupResponseStream;

    async fn catchup(
        &self,
        request: Request<proto::CatchupRequest>,
    ) -> Result<Response<Self::CatchupStream>, Status> {
        let request = request.into_inner();
        info!("Catchup request from node {}", request.node_id);

        let wanted: std::collections::HashSet<String> = request.keys_owned.into_iter().collect();
        let mut entries = Vec::new();
        self.engine
            .for_each(|key, entry| {
                if wanted.is_empty() || wanted.contains(key) {
                    entries.push(Ok(conversion::entry_to_catchup(key, entry)));
                }
            })
            .map_err(storage_error_to_status)?;

        info!("Catchup streaming {} key(s) to {}", entries.len(), request.node_id);
        let stream = tokio_stream::iter(entries);
        Ok(Response::new(Box::pin(stream) as Self::CatchupStream))
    }

    async fn get_failover_status(
        &self,
        request: Request<proto::FailoverStatusRequest>,
    ) -> Result<Response<proto::FailoverStatusResponse>, Status> {
        let request = request.into_inner();

        let records = match request.failover_id {
            Some(failover_id) => self
                .manager
                .failover_status(&failover_id)
                .into_iter()
                .collect(),
            None => self.manager.active_failovers(),
        };

        Ok(Response::new(proto::FailoverStatusResponse {
            failovers: records.iter().map(failover_record_to_proto).collect(),
        }))
    }
}

/// 管理服务
pub struct AdminService {
    engine: Arc<StorageEngine>,
    ring: Arc<HashRing>,
    orchestrator: Arc<RebalanceOrchestrator>,
    membership: Arc<MembershipManager>,
    metrics: Arc<Metrics>,
}

impl AdminService {
    pub fn new(
        engine: Arc<StorageEngine>,
        ring: Arc<HashRing>,
        orchestrator: Arc<RebalanceOrchestrator>,
        membership: Arc<MembershipManager>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            engine,
            ring,
            orchestrator,
            membership,
            metrics,
        }
    }
}

#[tonic::async_trait]
impl proto::admin_service_server::AdminService for AdminService {
    /// Launch a rebalance for a ring change.
    ///
    /// For a joining node the live ring already contains it, so the old
    /// ownership is the live topology minus the newcomer. For a leaving
    /// node the caller invokes this before removal, so the new ownership is
    /// the live topology minus the leaver.
    async fn rebalance(
        &self,
        request: Request<proto::RebalanceRequest>,
    ) -> Result<Response<proto::RebalanceResponse>, Status> {
        let request = request.into_inner();

        let (old_ring, new_ring) = match (&request.new_node_id, &request.removed_node_id) {
            (Some(new_node), _) => {
                let old_ring = self.ring.clone_topology();
                if !old_ring.remove_node(new_node) {
                    return Ok(Response::new(proto::RebalanceResponse {
                        started: false,
                        job_id: String::new(),
                        error: format!("node {} is not in the ring", new_node),
                    }));
                }
                (old_ring, self.ring.clone_topology())
            }
            (None, Some(removed_node)) => {
                let new_ring = self.ring.clone_topology();
                if !new_ring.remove_node(removed_node) {
                    return Ok(Response::new(proto::RebalanceResponse {
                        started: false,
                        job_id: String::new(),
                        error: format!("node {} is not in the ring", removed_node),
                    }));
                }
                (self.ring.clone_topology(), new_ring)
            }
            (None, None) => {
                return Ok(Response::new(proto::RebalanceResponse {
                    started: false,
                    job_id: String::new(),
                    error: "either new_node_id or removed_node_id is required".to_string(),
                }));
            }
        };

        match self.orchestrator.clone().start_rebalance(&old_ring, &new_ring) {
            Ok(Some(job_id)) => Ok(Response::new(proto::RebalanceResponse {
                started: true,
                job_id,
                error: String::new(),
            })),
            Ok(None) => Ok(Response::new(proto::RebalanceResponse {
                started: false,
                job_id: String::new(),
                error: "no keys need to move".to_string(),
            })),
            Err(e) => Err(storage_error_to_status(e)),
        }
    }

    /// Drain this node: mark it DRAINING and move every local key out.
    async fn drain(
        &self,
        request: Request<proto::DrainRequest>,
    ) -> Result<Response<proto::DrainResponse>, Status> {
        let request = request.into_inner();
        let timeout = Duration::from_secs(request.timeout_seconds.max(1) as u64);

        info!("Drain requested for node {} (timeout {:?})", request.node_id, timeout);
        self.membership
            .mark_status(&request.node_id, NodeStatus::Draining);

        let target_ring = self.ring.clone_topology();
        target_ring.remove_node(self.engine.node_id());

        let job_id = match self.orchestrator.clone().start_drain(&target_ring, timeout) {
            Ok(Some(job_id)) => job_id,
            Ok(None) => {
                return Ok(Response::new(proto::DrainResponse {
                    success: true,
                    keys_migrated: 0,
                }))
            }
            Err(e) => return Err(storage_error_to_status(e)),
        };

        // Wait out the drain, bounded by the caller's timeout
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.orchestrator.active_jobs().is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("Drain did not finish within {:?}", timeout);
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let migrated = self
            .orchestrator
            .job(&job_id)
            .map(|job| job.keys_migrated())
            .unwrap_or(0);
        let success = self
            .orchestrator
            .job(&job_id)
            .map(|job| job.is_complete() && !job.has_failed())
            .unwrap_or(false);

        Ok(Response::new(proto::DrainResponse {
            success,
            keys_migrated: migrated,
        }))
    }

    async fn status(
        &self,
        request: Request<proto::StatusRequest>,
    ) -> Result<Response<proto::StatusResponse>, Status> {
        let request = request.into_inner();

        let nodes: Vec<proto::NodeStatusInfo> = self
            .membership
            .all_nodes()
            .into_iter()
            .filter(|info| match &request.node_id {
                Some(node_id) => &info.node.id == node_id,
                None => true,
            })
            .map(|info| proto::NodeStatusInfo {
                id: info.node.id,
                address: info.node.address,
                status: info.status.to_string(),
                last_heartbeat_ms: info.last_heartbeat_ms,
            })
            .collect();

        Ok(Response::new(proto::StatusResponse { nodes }))
    }

    async fn metrics(
        &self,
        _request: Request<proto::MetricsRequest>,
    ) -> Result<Response<proto::MetricsResponse>, Status> {
        let metrics = self
            .metrics
            .export()
            .into_iter()
            .map(|(name, value)| proto::MetricValue {
                name: name.to_string(),
                value,
            })
            .collect();
        Ok(Response::new(proto::MetricsResponse { metrics }))
    }
}

/// 协调器服务
pub struct CoordinatorService {
    coordinator: Arc<Coordinator>,
}

impl CoordinatorService {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

fn registered_node_to_proto(
    info: &crate::cluster::coordinator::RegisteredNode,
) -> proto::NodeInfo {
    proto::NodeInfo {
        id: info.node.id.clone(),
        address: info.node.address.clone(),
        status: info.status.to_string(),
        last_heartbeat_ms: info.last_heartbeat_ms,
    }
}

#[tonic::async_trait]
impl proto::coordinator_service_server::CoordinatorService for CoordinatorService {
    async fn register_node(
        &self,
        request: Request<proto::RegisterNodeRequest>,
    ) -> Result<Response<proto::RegisterNodeResponse>, Status> {
        let request = request.into_inner();
        let ring_version = self
            .coordinator
            .register_node(&request.node_id, &request.address)
            .map_err(storage_error_to_status)?;

        Ok(Response::new(proto::RegisterNodeResponse {
            success: true,
            ring_version,
        }))
    }

    async fn heartbeat(
        &self,
        request: Request<proto::HeartbeatRequest>,
    ) -> Result<Response<proto::HeartbeatResponse>, Status> {
        let request = request.into_inner();
        match self
            .coordinator
            .heartbeat(&request.node_id, request.known_ring_version)
        {
            Some((ring_version, ring_changed)) => Ok(Response::new(proto::HeartbeatResponse {
                success: true,
                ring_version,
                ring_changed,
            })),
            None => Err(CacheError::NotFound(format!(
                "node {} is not registered",
                request.node_id
            ))
            .into()),
        }
    }

    async fn get_ring(
        &self,
        request: Request<proto::GetRingRequest>,
    ) -> Result<Response<proto::GetRingResponse>, Status> {
        let request = request.into_inner();
        let view = self.coordinator.get_ring_view(request.current_version);

        Ok(Response::new(proto::GetRingResponse {
            version: view.version,
            changed: view.changed,
            replication_factor: view.replication_factor as u32,
            virtual_nodes_per_node: view.virtual_nodes_per_node as u32,
            nodes: view.nodes.iter().map(registered_node_to_proto).collect(),
        }))
    }

    async fn get_nodes(
        &self,
        _request: Request<proto::GetNodesRequest>,
    ) -> Result<Response<proto::GetNodesResponse>, Status> {
        Ok(Response::new(proto::GetNodesResponse {
            nodes: self
                .coordinator
                .get_nodes()
                .iter()
                .map(registered_node_to_proto)
                .collect(),
        }))
    }

    async fn add_node(
        &self,
        request: Request<proto::AddNodeRequest>,
    ) -> Result<Response<proto::AddNodeResponse>, Status> {
        let request = request.into_inner();
        match self.coordinator.add_node(&request.node_id, &request.address) {
            Ok(new_ring_version) => Ok(Response::new(proto::AddNodeResponse {
                success: true,
                new_ring_version,
                error: String::new(),
            })),
            Err(error) => Ok(Response::new(proto::AddNodeResponse {
                success: false,
                new_ring_version: 0,
                error,
            })),
        }
    }

    async fn remove_node(
        &self,
        request: Request<proto::RemoveNodeRequest>,
    ) -> Result<Response<proto::RemoveNodeResponse>, Status> {
        let request = request.into_inner();
        match self.coordinator.remove_node(&request.node_id) {
            Ok(new_ring_version) => Ok(Response::new(proto::RemoveNodeResponse {
                success: true,
                new_ring_version,
                error: String::new(),
            })),
            Err(error) => Ok(Response::new(proto::RemoveNodeResponse {
                success: false,
                new_ring_version: 0,
                error,
            })),
        }
    }

    async fn get_cluster_status(
        &self,
        _request: Request<proto::GetClusterStatusRequest>,
    ) -> Result<Response<proto::GetClusterStatusResponse>, Status> {
        let status = self.coordinator.cluster_status();
        Ok(Response::new(proto::GetClusterStatusResponse {
            nodes: status.nodes.iter().map(registered_node_to_proto).collect(),
            total_nodes: status.total_nodes as u32,
            healthy_nodes: status.healthy_nodes as u32,
            unhealthy_nodes: status.unhealthy_nodes as u32,
            dead_nodes: status.dead_nodes as u32,
            ring_version: status.ring_version,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ring::HashRing;
    use crate::cluster::Node;
    use crate::proto::cache_service_server::CacheService as _;
    use crate::proto::replication_service_server::ReplicationService as _;
    use crate::replication::{BatchSender, ReplicationConfig};
    use crate::storage::wal::WalConfig;
    use tempfile::TempDir;

    struct NullSender;

    #[tonic::async_trait]
    impl BatchSender for NullSender {
        async fn send_batch(
            &self,
            _address: &str,
            _batch: proto::ReplicationBatch,
            _deadline: Duration,
        ) -> bool {
            true
        }
    }

    struct Fixture {
        service: CacheService,
        engine: Arc<StorageEngine>,
        _temp_dir: TempDir,
    }

    fn make_fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let metrics = Arc::new(Metrics::new());
        let engine = Arc::new(StorageEngine::new(
            "node1".to_string(),
            16,
            64 * 1024 * 1024,
            metrics,
        ));
        let wal = Arc::new(
            Wal::open(WalConfig {
                wal_dir: temp_dir.path().to_path_buf(),
                node_id: "node1".to_string(),
                ..WalConfig::default()
            })
            .unwrap(),
        );
        let ring = Arc::new(HashRing::new(150));
        ring.add_node(Node::new("node1", "node1:1"));
        let replication = Arc::new(ReplicationManager::new(
            ReplicationConfig {
                node_id: "node1".to_string(),
                ..ReplicationConfig::default()
            },
            ring,
            Arc::new(NullSender),
            engine.metrics().clone(),
        ));
        let service = CacheService::new(
            engine.clone(),
            wal,
            replication,
            Arc::new(AtomicBool::new(true)),
        );
        Fixture {
            service,
            engine,
            _temp_dir: temp_dir,
        }
    }

    #[tokio::test]
    async fn test_set_get_delete_round_trip() {
        let fixture = make_fixture();

        let response = fixture
            .service
            .set(Request::new(proto::SetRequest {
                key: "user:1".to_string(),
                value: b"Alice".to_vec(),
                ttl_seconds: None,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(response.success);
        assert_eq!(response.version, 1);

        let response = fixture
            .service
            .get(Request::new(proto::GetRequest {
                key: "user:1".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(response.found);
        assert_eq!(response.value, b"Alice");
        assert_eq!(response.version, 1);

        let response = fixture
            .service
            .delete(Request::new(proto::DeleteRequest {
                key: "user:1".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(response.success);

        let response = fixture
            .service
            .get(Request::new(proto::GetRequest {
                key: "user:1".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(!response.found);
    }

    #[tokio::test]
    async fn test_cas_mismatch_is_aborted() {
        let fixture = make_fixture();

        fixture
            .service
            .set(Request::new(proto::SetRequest {
                key: "counter".to_string(),
                value: b"1".to_vec(),
                ttl_seconds: None,
            }))
            .await
            .unwrap();

        let response = fixture
            .service
            .compare_and_swap(Request::new(proto::CompareAndSwapRequest {
                key: "counter".to_string(),
                expected_version: 1,
                new_value: b"2".to_vec(),
                ttl_seconds: None,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(response.success);
        assert_eq!(response.new_version, 2);

        // Stale expected version: ABORTED carrying the actual version
        let status = fixture
            .service
            .compare_and_swap(Request::new(proto::CompareAndSwapRequest {
                key: "counter".to_string(),
                expected_version: 1,
                new_value: b"3".to_vec(),
                ttl_seconds: None,
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Aborted);
        assert!(status.message().contains('2'));
    }

    #[tokio::test]
    async fn test_cas_missing_key_is_not_found() {
        let fixture = make_fixture();
        let status = fixture
            .service
            .compare_and_swap(Request::new(proto::CompareAndSwapRequest {
                key: "ghost".to_string(),
                expected_version: 1,
                new_value: b"v".to_vec(),
                ttl_seconds: None,
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn test_validation_rejects_without_mutation() {
        let fixture = make_fixture();

        let status = fixture
            .service
            .set(Request::new(proto::SetRequest {
                key: "k".repeat(MAX_KEY_BYTES + 1),
                value: b"v".to_vec(),
                ttl_seconds: None,
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status = fixture
            .service
            .set(Request::new(proto::SetRequest {
                key: "k".to_string(),
                value: vec![0u8; MAX_VALUE_BYTES + 1],
                ttl_seconds: None,
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status = fixture
            .service
            .set(Request::new(proto::SetRequest {
                key: "k".to_string(),
                value: b"v".to_vec(),
                ttl_seconds: Some(-1),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status = fixture
            .service
            .get(Request::new(proto::GetRequest { key: String::new() }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        // Nothing mutated
        assert_eq!(fixture.engine.len(), 0);
    }

    #[tokio::test]
    async fn test_health_check_reflects_serving_flag() {
        let fixture = make_fixture();
        let response = fixture
            .service
            .health_check(Request::new(proto::HealthCheckRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            response.status,
            proto::health_check_response::ServingStatus::Serving as i32
        );

        fixture.service.serving.store(false, Ordering::Relaxed);
        let response = fixture
            .service
            .health_check(Request::new(proto::HealthCheckRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            response.status,
            proto::health_check_response::ServingStatus::NotServing as i32
        );
    }

    #[tokio::test]
    async fn test_replication_service_applies_batches() {
        let engine = Arc::new(StorageEngine::new(
            "node2".to_string(),
            16,
            64 * 1024 * 1024,
            Arc::new(Metrics::new()),
        ));
        let service = ReplicationService::new(engine.clone());

        let ack = service
            .replicate(Request::new(proto::ReplicationBatch {
                source_node_id: "node1".to_string(),
                timestamp_ms: 123,
                entries: vec![proto::ReplicationEntry {
                    op: proto::replication_entry::Op::Set as i32,
                    key: "k".to_string(),
                    value: b"v".to_vec(),
                    ttl_seconds: 0,
                    version: 9,
                }],
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(ack.success);
        assert_eq!(ack.last_applied_timestamp, 123);
        assert_eq!(engine.get("k").unwrap().unwrap().version, 9);
    }
}
