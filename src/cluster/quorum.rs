//! # 法定人数协调模块
//!
//! 对需要强于异步复制语义的调用方，本模块在键的 N 个副本之上叠加显式的
//! W/R 阈值：写入并行发往全部副本，截止时间内收到至少 W 个确认才算成功；
//! 读取并行发往全部副本，收齐至少 R 个响应后取（版本，时间戳）最高者为
//! 准，并在后台对落后副本做尽力而为的读修复。
//!
//! W + R > N 时任意读法定人数与任意写法定人数至少重叠一个副本，
//! 成功写入之后的读必然观察到该写入（单键线性一致）。
//!
//! 每个操作携带统一截止时间；未按时应答的副本计为失败，不返回部分结果。
//! CAS 额外规则：任何副本报告版本不匹配即判整个操作失败，无论确认数多少。

use crate::cluster::version_vector::VersionVector;
use crate::network::client::ClientPool;
use crate::network::{NetworkError, NetworkResult};
use crate::{CacheError, CacheResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Quorum thresholds over the replica set
#[derive(Debug, Clone)]
pub struct QuorumConfig {
    /// N: replicas per key
    pub total_replicas: usize,
    /// W: acks required for a write
    pub write_quorum: usize,
    /// R: responses required for a read
    pub read_quorum: usize,
    /// Shared deadline for each quorum operation
    pub timeout: Duration,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            total_replicas: 3,
            write_quorum: 2,
            read_quorum: 2,
            timeout: Duration::from_secs(2),
        }
    }
}

/// One replica's answer to a read
#[derive(Debug, Clone)]
pub struct ReplicaValue {
    pub value: Vec<u8>,
    pub version: i64,
    pub timestamp_ms: i64,
    pub version_vector: VersionVector,
}

/// One replica's answer to a CAS
#[derive(Debug, Clone)]
pub struct CasReply {
    pub success: bool,
    pub new_version: i64,
    pub actual_version: i64,
    pub version_mismatch: bool,
}

/// Replica I/O used by the quorum coordinator. The gRPC implementation is
/// wired in the server; tests substitute an in-memory transport.
#[tonic::async_trait]
pub trait ReplicaTransport: Send + Sync {
    async fn read(
        &self,
        address: &str,
        key: &str,
        deadline: Duration,
    ) -> NetworkResult<Option<ReplicaValue>>;

    /// Returns the committed version
    async fn write(
        &self,
        address: &str,
        key: &str,
        value: Vec<u8>,
        ttl_seconds: Option<i32>,
        deadline: Duration,
    ) -> NetworkResult<i64>;

    async fn cas(
        &self,
        address: &str,
        key: &str,
        expected_version: i64,
        new_value: Vec<u8>,
        ttl_seconds: Option<i32>,
        deadline: Duration,
    ) -> NetworkResult<CasReply>;
}

/// gRPC-backed replica transport over the shared client pool
pub struct GrpcReplicaTransport {
    pool: Arc<ClientPool>,
}

impl GrpcReplicaTransport {
    pub fn new(pool: Arc<ClientPool>) -> Self {
        Self { pool }
    }
}

#[tonic::async_trait]
impl ReplicaTransport for GrpcReplicaTransport {
    async fn read(
        &self,
        address: &str,
        key: &str,
        deadline: Duration,
    ) -> NetworkResult<Option<ReplicaValue>> {
        let client = self.pool.get(address).await?;
        let response = client.get(key, deadline).await?;
        if !response.found {
            return Ok(None);
        }
        Ok(Some(ReplicaValue {
            value: response.value,
            version: response.version,
            timestamp_ms: response.timestamp_ms,
            version_vector: response.version_vector.into_iter().collect(),
        }))
    }

    async fn write(
        &self,
        address: &str,
        key: &str,
        value: Vec<u8>,
        ttl_seconds: Option<i32>,
        deadline: Duration,
    ) -> NetworkResult<i64> {
        let client = self.pool.get(address).await?;
        let response = client.set(key, value, ttl_seconds, deadline).await?;
        if !response.success {
            return Err(NetworkError::Rpc(tonic::Status::internal(response.error)));
        }
        Ok(response.version)
    }

    async fn cas(
        &self,
        address: &str,
        key: &str,
        expected_version: i64,
        new_value: Vec<u8>,
        ttl_seconds: Option<i32>,
        deadline: Duration,
    ) -> NetworkResult<CasReply> {
        let client = self.pool.get(address).await?;
        let response = client
            .compare_and_swap(key, expected_version, new_value, ttl_seconds, deadline)
            .await?;
        let version_mismatch = !response.success
            && (response.actual_version != 0 || response.error.contains("mismatch"));
        Ok(CasReply {
            success: response.success,
            new_version: response.new_version,
            actual_version: response.actual_version,
            version_mismatch,
        })
    }
}

/// Result of a quorum write or CAS
#[derive(Debug, Clone, Default)]
pub struct QuorumWriteResult {
    pub success: bool,
    /// Highest version observed across acknowledgements
    pub version: i64,
    pub replicas_acknowledged: usize,
    pub version_mismatch: bool,
    pub errors: Vec<String>,
}

/// Result of a quorum read
#[derive(Debug, Clone, Default)]
pub struct QuorumReadResult {
    pub success: bool,
    pub value: Option<Vec<u8>>,
    pub version: i64,
    pub timestamp_ms: i64,
    pub version_vector: VersionVector,
    pub replicas_responded: usize,
    pub errors: Vec<String>,
}

/// 法定人数协调器
pub struct QuorumCoordinator {
    config: QuorumConfig,
    transport: Arc<dyn ReplicaTransport>,
}

impl QuorumCoordinator {
    /// Create a coordinator, rejecting impossible thresholds.
    pub fn new(config: QuorumConfig, transport: Arc<dyn ReplicaTransport>) -> CacheResult<Self> {
        if config.write_quorum > config.total_replicas {
            return Err(CacheError::InvalidArgument(format!(
                "write quorum {} exceeds total replicas {}",
                config.write_quorum, config.total_replicas
            )));
        }
        if config.read_quorum > config.total_replicas {
            return Err(CacheError::InvalidArgument(format!(
                "read quorum {} exceeds total replicas {}",
                config.read_quorum, config.total_replicas
            )));
        }
        if config.write_quorum == 0 || config.read_quorum == 0 {
            return Err(CacheError::InvalidArgument(
                "quorum thresholds must be at least 1".to_string(),
            ));
        }
        if config.write_quorum + config.read_quorum <= config.total_replicas {
            warn!(
                "W ({}) + R ({}) <= N ({}) does not guarantee read-your-write consistency",
                config.write_quorum, config.read_quorum, config.total_replicas
            );
        }
        Ok(Self { config, transport })
    }

    /// Write to all replicas in parallel; success iff at least W acknowledge
    /// by the deadline.
    pub async fn quorum_write(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl_seconds: Option<i32>,
        replica_addresses: &[String],
    ) -> QuorumWriteResult {
        let mut result = QuorumWriteResult::default();
        if replica_addresses.is_empty() {
            result.errors.push("no replica addresses provided".to_string());
            return result;
        }

        let deadline = Instant::now() + self.config.timeout;
        let mut handles = Vec::with_capacity(replica_addresses.len());
        for address in replica_addresses {
            let transport = self.transport.clone();
            let address = address.clone();
            let key = key.to_string();
            let value = value.clone();
            let timeout = self.config.timeout;
            handles.push((
                address.clone(),
                tokio::spawn(async move {
                    transport.write(&address, &key, value, ttl_seconds, timeout).await
                }),
            ));
        }

        for (address, handle) in handles {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(Ok(version))) => {
                    result.replicas_acknowledged += 1;
                    result.version = result.version.max(version);
                }
                Ok(Ok(Err(e))) => result.errors.push(format!("write failed on {}: {}", address, e)),
                Ok(Err(e)) => result.errors.push(format!("write task for {} panicked: {}", address, e)),
                Err(_) => result.errors.push(format!("timeout waiting for {}", address)),
            }
        }

        result.success = result.replicas_acknowledged >= self.config.write_quorum;
        result
    }

    /// Read from all replicas in parallel; once at least R respond, return
    /// the highest-versioned value and schedule read-repair for the rest.
    pub async fn quorum_read(&self, key: &str, replica_addresses: &[String]) -> QuorumReadResult {
        let mut result = QuorumReadResult::default();
        if replica_addresses.is_empty() {
            result.errors.push("no replica addresses provided".to_string());
            return result;
        }

        let deadline = Instant::now() + self.config.timeout;
        let mut handles = Vec::with_capacity(replica_addresses.len());
        for address in replica_addresses {
            let transport = self.transport.clone();
            let address = address.clone();
            let key = key.to_string();
            let timeout = self.config.timeout;
            handles.push((
                address.clone(),
                tokio::spawn(async move { transport.read(&address, &key, timeout).await }),
            ));
        }

        let mut responses: Vec<(String, ReplicaValue)> = Vec::new();
        for (address, handle) in handles {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(Ok(Some(value)))) => responses.push((address, value)),
                Ok(Ok(Ok(None))) => result.errors.push(format!("key not found on {}", address)),
                Ok(Ok(Err(e))) => result.errors.push(format!("read failed on {}: {}", address, e)),
                Ok(Err(e)) => result.errors.push(format!("read task for {} panicked: {}", address, e)),
                Err(_) => result.errors.push(format!("timeout waiting for {}", address)),
            }
        }

        result.replicas_responded = responses.len();
        if responses.len() < self.config.read_quorum {
            debug!(
                "Quorum read of {} got {}/{} responses",
                key,
                responses.len(),
                self.config.read_quorum
            );
            return result;
        }

        // Highest (version, timestamp) wins
        let winner = responses
            .iter()
            .max_by_key(|(_, v)| (v.version, v.timestamp_ms))
            .expect("responses is non-empty")
            .clone();

        result.success = true;
        result.value = Some(winner.1.value.clone());
        result.version = winner.1.version;
        result.timestamp_ms = winner.1.timestamp_ms;
        result.version_vector = winner.1.version_vector.clone();

        // Fire-and-forget repair of stale replicas; never extends the
        // caller's deadline.
        let stale: Vec<String> = responses
            .iter()
            .filter(|(_, v)| v.version < winner.1.version)
            .map(|(address, _)| address.clone())
            .collect();
        if !stale.is_empty() {
            self.spawn_read_repair(key, winner.1, stale);
        }

        result
    }

    /// CAS on all replicas in parallel; success iff W acknowledge and no
    /// replica reports a version mismatch.
    pub async fn quorum_cas(
        &self,
        key: &str,
        expected_version: i64,
        new_value: Vec<u8>,
        ttl_seconds: Option<i32>,
        replica_addresses: &[String],
    ) -> QuorumWriteResult {
        let mut result = QuorumWriteResult::default();
        if replica_addresses.is_empty() {
            result.errors.push("no replica addresses provided".to_string());
            return result;
        }

        let deadline = Instant::now() + self.config.timeout;
        let mut handles = Vec::with_capacity(replica_addresses.len());
        for address in replica_addresses {
            let transport = self.transport.clone();
            let address = address.clone();
            let key = key.to_string();
            let value = new_value.clone();
            let timeout = self.config.timeout;
            handles.push((
                address.clone(),
                tokio::spawn(async move {
                    transport
                        .cas(&address, &key, expected_version, value, ttl_seconds, timeout)
                        .await
                }),
            ));
        }

        for (address, handle) in handles {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(Ok(reply))) if reply.success => {
                    result.replicas_acknowledged += 1;
                    result.version = result.version.max(reply.new_version);
                }
                Ok(Ok(Ok(reply))) => {
                    if reply.version_mismatch {
                        result.version_mismatch = true;
                        result.version = result.version.max(reply.actual_version);
                    }
                    result.errors.push(format!("CAS rejected on {}", address));
                }
                Ok(Ok(Err(e))) => result.errors.push(format!("CAS failed on {}: {}", address, e)),
                Ok(Err(e)) => result.errors.push(format!("CAS task for {} panicked: {}", address, e)),
                Err(_) => result.errors.push(format!("timeout waiting for {}", address)),
            }
        }

        // A single mismatch poisons the whole operation
        result.success =
            result.replicas_acknowledged >= self.config.write_quorum && !result.version_mismatch;
        result
    }

    /// Best-effort repair: push the winning value to stale replicas in a
    /// detached task bounded by one extra timeout window.
    fn spawn_read_repair(&self, key: &str, winner: ReplicaValue, stale: Vec<String>) {
        info!("Read-repair: updating {} stale replica(s) for {}", stale.len(), key);
        let transport = self.transport.clone();
        let key = key.to_string();
        let timeout = self.config.timeout;

        tokio::spawn(async move {
            for address in stale {
                let outcome = tokio::time::timeout(
                    timeout,
                    transport.write(&address, &key, winner.value.clone(), None, timeout),
                )
                .await;
                match outcome {
                    Ok(Ok(_)) => debug!("Read-repair of {} on {} done", key, address),
                    Ok(Err(e)) => warn!("Read-repair of {} on {} failed: {}", key, address, e),
                    Err(_) => warn!("Read-repair of {} on {} timed out", key, address),
                }
            }
        });
    }

    /// Configured thresholds
    pub fn config(&self) -> &QuorumConfig {
        &self.config
    }
}
