//! # 再均衡编排模块
//!
//! 环变更之后，本模块计算需要迁移的键：遍历引擎中的每个键，对比新旧环
//! 上的主节点归属，按（源节点，目标节点）分组为迁移路径，每条路径一个
//! 作业。作业按批（默认 100 个键）执行：向目标节点发送 SET，成功后在
//! 本地删除。任何 SET 失败都使作业失败；已完成的删除不回滚。
//!
//! ## 排空（drain）
//!
//! 排空是再均衡的变体：全部本地键都要迁出，作业集合来自引擎内容而非
//! 环差异，并受总超时约束（超时的作业被取消）。
//!
//! ## 安全性
//!
//! - 归属未变的键从不迁移
//! - 不跨网络调用持有分片锁：条目在分片锁下读出，无锁发送，删除时重新加锁
//! - 迁移期间的并发更新存在固有竞态；调用方应先将节点置为 DRAINING
//!
//! 完成超过一小时的作业记录由后台清理任务丢弃。

use super::ring::HashRing;
use crate::network::client::ClientPool;
use crate::storage::{CacheEntry, StorageEngine, StorageResult};
use crate::{current_time_ms, NodeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Rebalance configuration
#[derive(Debug, Clone)]
pub struct RebalanceConfig {
    /// Keys per migration batch
    pub batch_size: usize,
    /// Deadline for each outbound SET
    pub rpc_timeout: Duration,
    /// Completed job records older than this are discarded
    pub job_retention: Duration,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            rpc_timeout: Duration::from_secs(5),
            job_retention: Duration::from_secs(3600),
        }
    }
}

/// Sends one entry to a target node. The gRPC implementation lives in the
/// server wiring; tests substitute an in-memory transport.
#[tonic::async_trait]
pub trait MigrationTransport: Send + Sync {
    async fn send_entry(&self, target_address: &str, key: &str, entry: &CacheEntry) -> bool;
}

/// gRPC-backed transport over the shared client pool
pub struct GrpcMigrationTransport {
    pool: Arc<ClientPool>,
    rpc_timeout: Duration,
}

impl GrpcMigrationTransport {
    pub fn new(pool: Arc<ClientPool>, rpc_timeout: Duration) -> Self {
        Self { pool, rpc_timeout }
    }
}

#[tonic::async_trait]
impl MigrationTransport for GrpcMigrationTransport {
    async fn send_entry(&self, target_address: &str, key: &str, entry: &CacheEntry) -> bool {
        let client = match self.pool.get(target_address).await {
            Ok(client) => client,
            Err(e) => {
                error!("Migration connect to {} failed: {}", target_address, e);
                return false;
            }
        };
        match client
            .set(key, entry.value.clone(), entry.ttl_seconds, self.rpc_timeout)
            .await
        {
            Ok(response) if response.success => true,
            Ok(response) => {
                error!("Migration SET of {} rejected by {}: {}", key, target_address, response.error);
                false
            }
            Err(e) => {
                error!("Migration SET of {} to {} failed: {}", key, target_address, e);
                false
            }
        }
    }
}

/// One in-flight migration path
pub struct RebalanceJob {
    pub job_id: String,
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    pub target_address: String,
    pub started_at_ms: i64,
    keys_total: AtomicU64,
    keys_migrated: AtomicU64,
    completed: AtomicBool,
    failed: AtomicBool,
    error: Mutex<String>,
}

impl RebalanceJob {
    fn new(job_id: String, source: NodeId, target: NodeId, target_address: String) -> Self {
        Self {
            job_id,
            source_node_id: source,
            target_node_id: target,
            target_address,
            started_at_ms: current_time_ms(),
            keys_total: AtomicU64::new(0),
            keys_migrated: AtomicU64::new(0),
            completed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            error: Mutex::new(String::new()),
        }
    }

    pub fn keys_total(&self) -> u64 {
        self.keys_total.load(Ordering::Relaxed)
    }

    pub fn keys_migrated(&self) -> u64 {
        self.keys_migrated.load(Ordering::Relaxed)
    }

    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn error_message(&self) -> String {
        self.error.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Percent complete in [0, 100]
    pub fn progress(&self) -> f64 {
        let total = self.keys_total();
        if total == 0 {
            return 100.0;
        }
        self.keys_migrated() as f64 / total as f64 * 100.0
    }

    /// Instantaneous migration rate in keys per second
    pub fn rate(&self) -> f64 {
        let elapsed_ms = (current_time_ms() - self.started_at_ms).max(1);
        self.keys_migrated() as f64 / (elapsed_ms as f64 / 1000.0)
    }

    /// Estimated seconds until completion at the current rate
    pub fn eta_seconds(&self) -> f64 {
        let rate = self.rate();
        if rate <= 0.0 {
            return 0.0;
        }
        let remaining = self.keys_total().saturating_sub(self.keys_migrated());
        remaining as f64 / rate
    }

    fn fail(&self, message: &str) {
        self.failed.store(true, Ordering::Relaxed);
        if let Ok(mut error) = self.error.lock() {
            if error.is_empty() {
                *error = message.to_string();
            }
        }
    }
}

/// Aggregate orchestrator statistics
#[derive(Debug, Clone, Default)]
pub struct RebalanceStats {
    pub total_jobs: u64,
    pub successful_jobs: u64,
    pub failed_jobs: u64,
    pub active_jobs: usize,
    pub total_keys_migrated: u64,
}

/// 再均衡编排器
pub struct RebalanceOrchestrator {
    config: RebalanceConfig,
    engine: Arc<StorageEngine>,
    transport: Arc<dyn MigrationTransport>,
    jobs: Mutex<HashMap<String, Arc<RebalanceJob>>>,
    job_counter: AtomicU64,
    successful_jobs: AtomicU64,
    failed_jobs: AtomicU64,
    total_jobs: AtomicU64,
    total_keys_migrated: AtomicU64,
}

impl RebalanceOrchestrator {
    pub fn new(
        config: RebalanceConfig,
        engine: Arc<StorageEngine>,
        transport: Arc<dyn MigrationTransport>,
    ) -> Self {
        Self {
            config,
            engine,
            transport,
            jobs: Mutex::new(HashMap::new()),
            job_counter: AtomicU64::new(0),
            successful_jobs: AtomicU64::new(0),
            failed_jobs: AtomicU64::new(0),
            total_jobs: AtomicU64::new(0),
            total_keys_migrated: AtomicU64::new(0),
        }
    }

    /// Plan and launch migration jobs for a ring change.
    ///
    /// Walks the engine's keys, diffs old and new primary ownership, groups
    /// the movers by (source, target) path and spawns one job per path.
    /// Returns the first job id, or `None` when nothing moves.
    pub fn start_rebalance(
        self: Arc<Self>,
        old_ring: &HashRing,
        new_ring: &HashRing,
    ) -> StorageResult<Option<String>> {
        info!("Planning rebalance (ring v{} -> v{})", old_ring.version(), new_ring.version());

        // path (source, target) -> (target address, keys)
        let mut paths: HashMap<(NodeId, NodeId), (String, Vec<String>)> = HashMap::new();
        self.engine.for_each(|key, _| {
            let old_owner = old_ring.get_node(key);
            let new_owner = new_ring.get_node(key);
            if let (Some(old_owner), Some(new_owner)) = (old_owner, new_owner) {
                // Keys whose owner did not change never move
                if old_owner.id != new_owner.id {
                    paths
                        .entry((old_owner.id, new_owner.id.clone()))
                        .or_insert_with(|| (new_owner.address, Vec::new()))
                        .1
                        .push(key.to_string());
                }
            }
        })?;

        if paths.is_empty() {
            info!("No keys need to move");
            return Ok(None);
        }

        info!("Rebalance plan: {} migration path(s)", paths.len());
        Ok(Some(self.launch_jobs(paths, None)))
    }

    /// Move every local key off this node.
    ///
    /// The job set derives from the engine's contents: each key goes to its
    /// owner in `ring` (skipping keys already owned by self). Jobs that
    /// outlive `timeout` are cancelled.
    pub fn start_drain(
        self: Arc<Self>,
        ring: &HashRing,
        timeout: Duration,
    ) -> StorageResult<Option<String>> {
        let self_id = self.engine.node_id().to_string();
        info!("Planning drain of node {} (timeout {:?})", self_id, timeout);

        let mut paths: HashMap<(NodeId, NodeId), (String, Vec<String>)> = HashMap::new();
        self.engine.for_each(|key, _| {
            if let Some(target) = ring.get_node(key) {
                if target.id != self_id {
                    paths
                        .entry((self_id.clone(), target.id.clone()))
                        .or_insert_with(|| (target.address, Vec::new()))
                        .1
                        .push(key.to_string());
                }
            }
        })?;

        if paths.is_empty() {
            info!("No keys to drain");
            return Ok(None);
        }

        info!("Drain plan: {} migration path(s)", paths.len());
        Ok(Some(self.launch_jobs(paths, Some(timeout))))
    }

    fn launch_jobs(
        self: Arc<Self>,
        paths: HashMap<(NodeId, NodeId), (String, Vec<String>)>,
        timeout: Option<Duration>,
    ) -> String {
        let mut first_job_id = String::new();
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());

        for ((source, target), (target_address, keys)) in paths {
            let job_id = self.generate_job_id();
            if first_job_id.is_empty() {
                first_job_id = job_id.clone();
            }

            let job = Arc::new(RebalanceJob::new(
                job_id.clone(),
                source,
                target,
                target_address,
            ));
            job.keys_total.store(keys.len() as u64, Ordering::Relaxed);
            jobs.insert(job_id.clone(), job.clone());
            self.total_jobs.fetch_add(1, Ordering::Relaxed);

            info!(
                "Created migration job {}: {} key(s) {} -> {}",
                job.job_id,
                keys.len(),
                job.source_node_id,
                job.target_node_id
            );

            let orchestrator = self.clone();
            tokio::spawn(async move {
                match timeout {
                    Some(limit) => {
                        tokio::select! {
                            _ = orchestrator.execute_job(job.clone(), keys) => {}
                            _ = tokio::time::sleep(limit) => {
                                warn!("Job {} exceeded the drain timeout, cancelling", job.job_id);
                                job.fail("drain timeout exceeded");
                                job.completed.store(true, Ordering::Relaxed);
                            }
                        }
                    }
                    None => orchestrator.execute_job(job, keys).await,
                }
            });
        }

        first_job_id
    }

    /// Run one migration job to completion.
    ///
    /// Entries are re-read at send time so the freshest committed value
    /// moves; keys deleted in the meantime are skipped.
    async fn execute_job(&self, job: Arc<RebalanceJob>, keys: Vec<String>) {
        info!(
            "Executing job {}: {} -> {} ({} keys)",
            job.job_id,
            job.source_node_id,
            job.target_node_id,
            keys.len()
        );

        for batch in keys.chunks(self.config.batch_size.max(1)) {
            if job.has_failed() {
                warn!("Job {} cancelled", job.job_id);
                break;
            }

            // Read the batch under shard locks, entry by entry
            let mut entries: Vec<(String, CacheEntry)> = Vec::with_capacity(batch.len());
            for key in batch {
                match self.engine.get(key) {
                    Ok(Some(entry)) => entries.push((key.clone(), entry)),
                    Ok(None) => debug!("Job {}: key {} vanished before migration", job.job_id, key),
                    Err(e) => {
                        job.fail(&format!("local read failed: {}", e));
                        break;
                    }
                }
            }
            if job.has_failed() {
                break;
            }

            // Ship without holding any lock
            for (key, entry) in &entries {
                if !self
                    .transport
                    .send_entry(&job.target_address, key, entry)
                    .await
                {
                    job.fail("failed to migrate batch");
                    break;
                }
            }
            if job.has_failed() {
                break;
            }

            // Delete locally under fresh locks; completed deletes stand
            for (key, _) in &entries {
                if let Err(e) = self.engine.delete(key) {
                    warn!("Job {}: cleanup of {} failed: {}", job.job_id, key, e);
                }
            }

            let migrated = entries.len() as u64;
            job.keys_migrated.fetch_add(migrated, Ordering::Relaxed);
            self.total_keys_migrated.fetch_add(migrated, Ordering::Relaxed);
            self.engine
                .metrics()
                .keys_migrated_total
                .fetch_add(migrated, Ordering::Relaxed);
            debug!(
                "Job {}: progress {:.1}% ({}/{})",
                job.job_id,
                job.progress(),
                job.keys_migrated(),
                job.keys_total()
            );
        }

        job.completed.store(true, Ordering::Relaxed);
        if job.has_failed() {
            error!("Job {} failed: {}", job.job_id, job.error_message());
            self.failed_jobs.fetch_add(1, Ordering::Relaxed);
        } else {
            info!(
                "Job {} complete: migrated {}/{} keys",
                job.job_id,
                job.keys_migrated(),
                job.keys_total()
            );
            self.successful_jobs.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Progress snapshot for a job
    pub fn job(&self, job_id: &str) -> Option<Arc<RebalanceJob>> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get(job_id).cloned()
    }

    /// Ids of jobs not yet complete
    pub fn active_jobs(&self) -> Vec<String> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.values()
            .filter(|job| !job.is_complete())
            .map(|job| job.job_id.clone())
            .collect()
    }

    /// Cancel a job; in-flight batches stop at the next boundary
    pub fn cancel_job(&self, job_id: &str) -> bool {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        match jobs.get(job_id) {
            Some(job) if !job.is_complete() => {
                job.fail("cancelled by operator");
                info!("Cancelled migration job {}", job_id);
                true
            }
            _ => false,
        }
    }

    /// Statistics snapshot
    pub fn stats(&self) -> RebalanceStats {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        RebalanceStats {
            total_jobs: self.total_jobs.load(Ordering::Relaxed),
            successful_jobs: self.successful_jobs.load(Ordering::Relaxed),
            failed_jobs: self.failed_jobs.load(Ordering::Relaxed),
            active_jobs: jobs.values().filter(|job| !job.is_complete()).count(),
            total_keys_migrated: self.total_keys_migrated.load(Ordering::Relaxed),
        }
    }

    /// Janitor: discard completed job records older than the retention
    /// window. Runs until the stop flag is set.
    pub async fn run_janitor(self: Arc<Self>, stop: Arc<AtomicBool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if stop.load(Ordering::Relaxed) {
                break;
            }
            self.prune_old_jobs();
        }
    }

    fn prune_old_jobs(&self) {
        let retention_ms = self.config.job_retention.as_millis() as i64;
        let now = current_time_ms();
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.retain(|job_id, job| {
            let expired = job.is_complete() && now - job.started_at_ms > retention_ms;
            if expired {
                debug!("Pruning old job record {}", job_id);
            }
            !expired
        });
    }

    fn generate_job_id(&self) -> String {
        format!(
            "job-{}-{:04}",
            current_time_ms() / 1000,
            self.job_counter.fetch_add(1, Ordering::Relaxed)
        )
    }
}
