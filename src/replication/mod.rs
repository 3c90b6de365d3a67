//! # 复制管道模块
//!
//! 每个主节点维护一个有界的内存 FIFO 复制队列。写入在本地提交后入队，
//! 后台工作任务按批（大小上限或时间上限先到为准）排出，按目标副本分组，
//! 经持久连接发送。队列溢出时丢弃最旧的条目并记录警告——背压通过丢弃
//! 复制实现，而不是阻塞客户端（此行为承自原始设计，是否合意存疑，
//! 保留并记录在案）。
//!
//! ## 顺序保证
//!
//! 同一主节点对同一键的条目保持入队顺序；跨键无顺序保证。
//! 副本端应用时带版本回退保护：比已存版本旧的条目被拒绝。
//!
//! ## 追赶（catchup）
//!
//! 重新加入的副本向对等节点请求其应持有的键流；对等节点遍历引擎逐条
//! 写入流，完成后副本恢复正常服务。流式服务端实现在网络模块中。

use crate::cluster::ring::HashRing;
use crate::metrics::Metrics;
use crate::network::client::ClientPool;
use crate::network::conversion;
use crate::proto;
use crate::storage::StorageEngine;
use crate::{current_time_ms, NodeId};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

/// Replication configuration
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub node_id: NodeId,
    /// Replicas per key, including the primary
    pub replication_factor: usize,
    /// Queue capacity; overflow drops the oldest entry
    pub max_queue_size: usize,
    /// Entries per shipped batch
    pub batch_size: usize,
    /// Maximum wait before a partial batch ships
    pub batch_interval: Duration,
    /// Deadline per outbound batch
    pub rpc_timeout: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            node_id: "node1".to_string(),
            replication_factor: 3,
            max_queue_size: 10_000,
            batch_size: 100,
            batch_interval: Duration::from_millis(50),
            rpc_timeout: Duration::from_secs(2),
        }
    }
}

/// Operation carried by one queued entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationOp {
    Set,
    Delete,
}

/// One pending replication entry
#[derive(Debug, Clone)]
pub struct QueuedEntry {
    pub op: ReplicationOp,
    pub key: String,
    pub value: Vec<u8>,
    pub ttl_seconds: Option<i32>,
    pub version: i64,
    pub queued_at_ms: i64,
}

impl QueuedEntry {
    fn to_proto(&self) -> proto::ReplicationEntry {
        proto::ReplicationEntry {
            op: match self.op {
                ReplicationOp::Set => proto::replication_entry::Op::Set as i32,
                ReplicationOp::Delete => proto::replication_entry::Op::Delete as i32,
            },
            key: self.key.clone(),
            value: self.value.clone(),
            ttl_seconds: self.ttl_seconds.unwrap_or(0),
            version: self.version,
        }
    }
}

/// Ships one batch to one destination. The gRPC implementation goes over
/// the pooled channels; tests substitute a loopback sender.
#[tonic::async_trait]
pub trait BatchSender: Send + Sync {
    async fn send_batch(
        &self,
        address: &str,
        batch: proto::ReplicationBatch,
        deadline: Duration,
    ) -> bool;
}

/// gRPC batch sender over the shared client pool
pub struct GrpcBatchSender {
    pool: Arc<ClientPool>,
}

impl GrpcBatchSender {
    pub fn new(pool: Arc<ClientPool>) -> Self {
        Self { pool }
    }
}

#[tonic::async_trait]
impl BatchSender for GrpcBatchSender {
    async fn send_batch(
        &self,
        address: &str,
        batch: proto::ReplicationBatch,
        deadline: Duration,
    ) -> bool {
        let client = match self.pool.get(address).await {
            Ok(client) => client,
            Err(e) => {
                warn!("Replication connect to {} failed: {}", address, e);
                return false;
            }
        };
        match client.replicate(batch, deadline).await {
            Ok(ack) if ack.success => true,
            Ok(ack) => {
                warn!("Replication rejected by {}: {}", address, ack.error);
                false
            }
            Err(e) => {
                warn!("Replication to {} failed: {}", address, e);
                false
            }
        }
    }
}

/// Replication statistics snapshot
#[derive(Debug, Clone, Default)]
pub struct ReplicationStats {
    pub queued_ops: u64,
    pub replicated_ops: u64,
    pub failed_ops: u64,
    pub dropped_ops: u64,
    pub batches_sent: u64,
    pub queue_depth: usize,
}

/// 复制管理器
pub struct ReplicationManager {
    config: ReplicationConfig,
    ring: Arc<HashRing>,
    sender: Arc<dyn BatchSender>,
    metrics: Arc<Metrics>,
    queue: Mutex<VecDeque<QueuedEntry>>,
    notify: Notify,
    queued_ops: AtomicU64,
    replicated_ops: AtomicU64,
    failed_ops: AtomicU64,
    dropped_ops: AtomicU64,
    batches_sent: AtomicU64,
}

impl ReplicationManager {
    pub fn new(
        config: ReplicationConfig,
        ring: Arc<HashRing>,
        sender: Arc<dyn BatchSender>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            ring,
            sender,
            metrics,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            queued_ops: AtomicU64::new(0),
            replicated_ops: AtomicU64::new(0),
            failed_ops: AtomicU64::new(0),
            dropped_ops: AtomicU64::new(0),
            batches_sent: AtomicU64::new(0),
        }
    }

    /// Enqueue a committed write for replication
    pub async fn queue_set(&self, key: &str, value: Vec<u8>, ttl_seconds: Option<i32>, version: i64) {
        self.enqueue(QueuedEntry {
            op: ReplicationOp::Set,
            key: key.to_string(),
            value,
            ttl_seconds,
            version,
            queued_at_ms: current_time_ms(),
        })
        .await;
    }

    /// Enqueue a committed delete for replication
    pub async fn queue_delete(&self, key: &str, version: i64) {
        self.enqueue(QueuedEntry {
            op: ReplicationOp::Delete,
            key: key.to_string(),
            value: Vec::new(),
            ttl_seconds: None,
            version,
            queued_at_ms: current_time_ms(),
        })
        .await;
    }

    async fn enqueue(&self, entry: QueuedEntry) {
        let mut queue = self.queue.lock().await;
        if queue.len() >= self.config.max_queue_size {
            // Backpressure by dropping replication, not by blocking clients
            if let Some(dropped) = queue.pop_front() {
                warn!(
                    "Replication queue full, dropping oldest entry for key {}",
                    dropped.key
                );
                self.dropped_ops.fetch_add(1, Ordering::Relaxed);
                self.metrics.replication_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        queue.push_back(entry);
        self.queued_ops.fetch_add(1, Ordering::Relaxed);
        self.metrics.replication_queued.fetch_add(1, Ordering::Relaxed);
        drop(queue);
        self.notify.notify_one();
    }

    /// Current queue depth
    pub async fn queue_depth(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Statistics snapshot
    pub async fn stats(&self) -> ReplicationStats {
        ReplicationStats {
            queued_ops: self.queued_ops.load(Ordering::Relaxed),
            replicated_ops: self.replicated_ops.load(Ordering::Relaxed),
            failed_ops: self.failed_ops.load(Ordering::Relaxed),
            dropped_ops: self.dropped_ops.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            queue_depth: self.queue.lock().await.len(),
        }
    }

    /// Drain worker: batch the queue and ship until stopped.
    pub async fn run(self: Arc<Self>, stop: Arc<AtomicBool>) {
        info!(
            "Replication worker started (batch {} / {:?})",
            self.config.batch_size, self.config.batch_interval
        );

        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }

            // Wake on new work or at the batch interval, whichever first
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.config.batch_interval) => {}
            }
            if stop.load(Ordering::Relaxed) {
                break;
            }

            let batch = self.take_batch().await;
            if batch.is_empty() {
                continue;
            }
            self.ship_batch(batch).await;

            // Re-arm immediately if more work is pending
            if self.queue.lock().await.len() > 0 {
                self.notify.notify_one();
            }
        }

        info!("Replication worker stopped");
    }

    /// Pop up to one batch from the queue, preserving FIFO order.
    async fn take_batch(&self) -> Vec<QueuedEntry> {
        let mut queue = self.queue.lock().await;
        let take = queue.len().min(self.config.batch_size);
        queue.drain(..take).collect()
    }

    /// Group a drained batch by destination replica and ship each group.
    ///
    /// Within one destination the entries keep queue order, so per-key FIFO
    /// from this primary is preserved.
    async fn ship_batch(&self, batch: Vec<QueuedEntry>) {
        let mut per_destination: HashMap<String, Vec<proto::ReplicationEntry>> = HashMap::new();

        for entry in &batch {
            let replicas = self
                .ring
                .get_replicas(&entry.key, self.config.replication_factor);
            for node in replicas {
                if node.id == self.config.node_id {
                    continue;
                }
                per_destination
                    .entry(node.address)
                    .or_default()
                    .push(entry.to_proto());
            }
        }

        if per_destination.is_empty() {
            debug!("No followers for batch of {} entries", batch.len());
            return;
        }

        for (address, entries) in per_destination {
            let count = entries.len() as u64;
            let proto_batch = conversion::make_replication_batch(&self.config.node_id, entries);

            if self
                .sender
                .send_batch(&address, proto_batch, self.config.rpc_timeout)
                .await
            {
                self.replicated_ops.fetch_add(count, Ordering::Relaxed);
                self.metrics.replication_shipped.fetch_add(count, Ordering::Relaxed);
                debug!("Replicated {} entries to {}", count, address);
            } else {
                self.failed_ops.fetch_add(count, Ordering::Relaxed);
                self.metrics.replication_failed.fetch_add(count, Ordering::Relaxed);
            }
            self.batches_sent.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Apply a received replication batch to the follower's engine.
///
/// Entries apply in batch order with the sender's versions preserved.
/// Version regressions — on SET and DELETE alike — are rejected and
/// counted; per-entry failures do not abort the batch.
/// Returns (applied, failed).
pub fn apply_batch(engine: &StorageEngine, batch: &proto::ReplicationBatch) -> (usize, usize) {
    let mut applied = 0;
    let mut failed = 0;

    for entry in &batch.entries {
        let op = proto::replication_entry::Op::try_from(entry.op)
            .unwrap_or(proto::replication_entry::Op::Set);
        match op {
            proto::replication_entry::Op::Set => {
                let cache_entry =
                    conversion::entry_from_replication(entry, &batch.source_node_id);
                match engine.apply_entry(cache_entry) {
                    Ok(true) => applied += 1,
                    Ok(false) => {
                        // Version regression guard rejected a stale entry
                        failed += 1;
                    }
                    Err(e) => {
                        warn!("Failed to apply replicated SET for {}: {}", entry.key, e);
                        failed += 1;
                    }
                }
            }
            proto::replication_entry::Op::Delete => {
                // A missing key applies trivially; a delete older than the
                // stored entry is rejected
                match engine.apply_delete(&entry.key, entry.version) {
                    Ok(true) => applied += 1,
                    Ok(false) => failed += 1,
                    Err(e) => {
                        warn!("Failed to apply replicated DELETE for {}: {}", entry.key, e);
                        failed += 1;
                    }
                }
            }
        }
    }

    (applied, failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Node;
    use crate::metrics::Metrics;
    use tokio::sync::RwLock;

    struct LoopbackSender {
        engines: RwLock<HashMap<String, Arc<StorageEngine>>>,
        fail_all: AtomicBool,
    }

    impl LoopbackSender {
        fn new() -> Self {
            Self {
                engines: RwLock::new(HashMap::new()),
                fail_all: AtomicBool::new(false),
            }
        }

        async fn attach(&self, address: &str, engine: Arc<StorageEngine>) {
            self.engines.write().await.insert(address.to_string(), engine);
        }
    }

    #[tonic::async_trait]
    impl BatchSender for LoopbackSender {
        async fn send_batch(
            &self,
            address: &str,
            batch: proto::ReplicationBatch,
            _deadline: Duration,
        ) -> bool {
            if self.fail_all.load(Ordering::Relaxed) {
                return false;
            }
            let engines = self.engines.read().await;
            match engines.get(address) {
                Some(engine) => {
                    let (_, failed) = apply_batch(engine, &batch);
                    failed == 0
                }
                None => false,
            }
        }
    }

    fn make_engine(node_id: &str) -> Arc<StorageEngine> {
        Arc::new(StorageEngine::new(
            node_id.to_string(),
            16,
            64 * 1024 * 1024,
            Arc::new(Metrics::new()),
        ))
    }

    fn two_node_ring() -> Arc<HashRing> {
        let ring = Arc::new(HashRing::new(150));
        ring.add_node(Node::new("node1", "node1:1"));
        ring.add_node(Node::new("node2", "node2:1"));
        ring
    }

    fn manager(
        ring: Arc<HashRing>,
        sender: Arc<LoopbackSender>,
        max_queue: usize,
    ) -> Arc<ReplicationManager> {
        Arc::new(ReplicationManager::new(
            ReplicationConfig {
                node_id: "node1".to_string(),
                replication_factor: 2,
                max_queue_size: max_queue,
                batch_size: 10,
                batch_interval: Duration::from_millis(10),
                rpc_timeout: Duration::from_millis(500),
            },
            ring,
            sender,
            Arc::new(Metrics::new()),
        ))
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let sender = Arc::new(LoopbackSender::new());
        let manager = manager(two_node_ring(), sender, 3);

        for i in 0..5 {
            manager
                .queue_set(&format!("key{}", i), b"v".to_vec(), None, 1)
                .await;
        }

        let stats = manager.stats().await;
        assert_eq!(stats.queue_depth, 3);
        assert_eq!(stats.dropped_ops, 2);

        // The shared metrics mirror the internal counters
        assert_eq!(manager.metrics.replication_dropped.load(Ordering::Relaxed), 2);
        assert_eq!(manager.metrics.replication_queued.load(Ordering::Relaxed), 5);

        // The survivors are the newest entries
        let queue = manager.queue.lock().await;
        let keys: Vec<_> = queue.iter().map(|e| e.key.clone()).collect();
        assert_eq!(keys, vec!["key2", "key3", "key4"]);
    }

    #[tokio::test]
    async fn test_worker_ships_to_followers() {
        let sender = Arc::new(LoopbackSender::new());
        let follower = make_engine("node2");
        sender.attach("node2:1", follower.clone()).await;

        let manager = manager(two_node_ring(), sender, 1000);
        let stop = Arc::new(AtomicBool::new(false));
        let worker = tokio::spawn(manager.clone().run(stop.clone()));

        for i in 0..20 {
            manager
                .queue_set(&format!("key{}", i), format!("v{}", i).into_bytes(), None, 3)
                .await;
        }

        // Wait for the queue to drain
        for _ in 0..100 {
            if manager.queue_depth().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        let stats = manager.stats().await;
        assert_eq!(stats.replicated_ops, 20);
        assert_eq!(stats.failed_ops, 0);
        assert!(stats.batches_sent >= 1);
        assert_eq!(manager.metrics.replication_shipped.load(Ordering::Relaxed), 20);

        // Followers hold the entries with the sender's version preserved
        for i in 0..20 {
            let entry = follower.get(&format!("key{}", i)).unwrap().unwrap();
            assert_eq!(entry.version, 3);
        }

        stop.store(true, Ordering::Relaxed);
        manager.notify.notify_one();
        let _ = tokio::time::timeout(Duration::from_secs(1), worker).await;
    }

    #[tokio::test]
    async fn test_per_key_fifo_preserved() {
        let sender = Arc::new(LoopbackSender::new());
        let follower = make_engine("node2");
        sender.attach("node2:1", follower.clone()).await;

        let manager = manager(two_node_ring(), sender, 1000);

        // Three updates to one key, versions 1..=3, in order
        for version in 1..=3 {
            manager
                .queue_set("hot", format!("v{}", version).into_bytes(), None, version)
                .await;
        }
        let batch = manager.take_batch().await;
        manager.ship_batch(batch).await;

        let entry = follower.get("hot").unwrap().unwrap();
        assert_eq!(entry.version, 3);
        assert_eq!(entry.value, b"v3");
    }

    #[tokio::test]
    async fn test_failed_batch_counted() {
        let sender = Arc::new(LoopbackSender::new());
        sender.fail_all.store(true, Ordering::Relaxed);

        let manager = manager(two_node_ring(), sender, 1000);
        manager.queue_set("k", b"v".to_vec(), None, 1).await;

        let batch = manager.take_batch().await;
        manager.ship_batch(batch).await;

        let stats = manager.stats().await;
        assert_eq!(stats.failed_ops, 1);
        assert_eq!(stats.replicated_ops, 0);
        assert_eq!(manager.metrics.replication_failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_apply_batch_version_regression_guard() {
        let engine = make_engine("node2");

        let newer = proto::ReplicationBatch {
            source_node_id: "node1".to_string(),
            timestamp_ms: current_time_ms(),
            entries: vec![proto::ReplicationEntry {
                op: proto::replication_entry::Op::Set as i32,
                key: "k".to_string(),
                value: b"new".to_vec(),
                ttl_seconds: 0,
                version: 5,
            }],
        };
        let (applied, failed) = apply_batch(&engine, &newer);
        assert_eq!((applied, failed), (1, 0));

        // A stale entry is rejected but does not abort the batch
        let stale = proto::ReplicationBatch {
            source_node_id: "node1".to_string(),
            timestamp_ms: current_time_ms(),
            entries: vec![
                proto::ReplicationEntry {
                    op: proto::replication_entry::Op::Set as i32,
                    key: "k".to_string(),
                    value: b"old".to_vec(),
                    ttl_seconds: 0,
                    version: 2,
                },
                proto::ReplicationEntry {
                    op: proto::replication_entry::Op::Set as i32,
                    key: "other".to_string(),
                    value: b"v".to_vec(),
                    ttl_seconds: 0,
                    version: 1,
                },
            ],
        };
        let (applied, failed) = apply_batch(&engine, &stale);
        assert_eq!((applied, failed), (1, 1));
        assert_eq!(engine.get("k").unwrap().unwrap().value, b"new");
        assert!(engine.exists("other").unwrap());
    }

    #[tokio::test]
    async fn test_apply_batch_rejects_stale_delete() {
        let engine = make_engine("node2");

        // Follower already holds the key at version 4
        let newer = proto::ReplicationBatch {
            source_node_id: "node1".to_string(),
            timestamp_ms: current_time_ms(),
            entries: vec![proto::ReplicationEntry {
                op: proto::replication_entry::Op::Set as i32,
                key: "k".to_string(),
                value: b"new".to_vec(),
                ttl_seconds: 0,
                version: 4,
            }],
        };
        assert_eq!(apply_batch(&engine, &newer), (1, 0));

        // A delete derived from version 2 arrives late and must not win
        let stale_delete = proto::ReplicationBatch {
            source_node_id: "node1".to_string(),
            timestamp_ms: current_time_ms(),
            entries: vec![proto::ReplicationEntry {
                op: proto::replication_entry::Op::Delete as i32,
                key: "k".to_string(),
                value: Vec::new(),
                ttl_seconds: 0,
                version: 3,
            }],
        };
        assert_eq!(apply_batch(&engine, &stale_delete), (0, 1));
        assert!(engine.exists("k").unwrap());

        // The delete that observed version 4 applies
        let fresh_delete = proto::ReplicationBatch {
            source_node_id: "node1".to_string(),
            timestamp_ms: current_time_ms(),
            entries: vec![proto::ReplicationEntry {
                op: proto::replication_entry::Op::Delete as i32,
                key: "k".to_string(),
                value: Vec::new(),
                ttl_seconds: 0,
                version: 5,
            }],
        };
        assert_eq!(apply_batch(&engine, &fresh_delete), (1, 0));
        assert!(!engine.exists("k").unwrap());
    }

    #[tokio::test]
    async fn test_apply_batch_delete_of_missing_key_is_ok() {
        let engine = make_engine("node2");
        let batch = proto::ReplicationBatch {
            source_node_id: "node1".to_string(),
            timestamp_ms: current_time_ms(),
            entries: vec![proto::ReplicationEntry {
                op: proto::replication_entry::Op::Delete as i32,
                key: "ghost".to_string(),
                value: Vec::new(),
                ttl_seconds: 0,
                version: 1,
            }],
        };
        let (applied, failed) = apply_batch(&engine, &batch);
        assert_eq!((applied, failed), (1, 0));
    }
}
