//! # 存储引擎模块
//!
//! 本模块实现了缓存节点的核心存储引擎：一个分片的内存哈希表，
//! 每个分片持有独立的读写锁、哈希表和 LRU 序，互不相关的键操作完全并行。
//! 引擎提供 GET/SET/DELETE/CAS/EXISTS 等线程安全操作，
//! 并为快照和再均衡提供全量遍历接口。
//!
//! ## 功能特性
//!
//! - **锁分条**: 键空间静态划分为 S 个分片（默认 256），分片间零竞争
//! - **LRU 淘汰**: 内存超限时从所在分片的冷端逐出，直到回到限额以下
//! - **TTL 过期**: 过期条目对读取不可见，在下次访问或淘汰扫描时惰性回收
//! - **原子 CAS**: 版本比较与替换在单次写锁内完成，不可能交错
//! - **内存核算**: 全局原子总量 + 分片局部总量，条目大小包含键、值与固定元数据
//!
//! ## 存储结构
//!
//! 每个分片内部由两部分组成：
//! - **data**: 键到缓存条目的哈希表，同时记录条目的访问戳
//! - **lru**: 访问戳到键的有序映射，戳最小者即最久未使用
//!
//! 访问戳来自全局单调递增的原子计数器，移动到"队首"即换发新戳，
//! 与侵入式链表的 move-to-front 语义等价。
//!
//! ## 核心组件
//!
//! - [`StorageEngine`]: 分片存储引擎
//! - [`CacheEntry`]: 单个键值条目及其元数据
//! - [`CasOutcome`]: CAS 操作的四种结果
//! - [`wal`]: 预写日志子模块
//! - [`snapshot`]: 快照子模块
//! - [`recovery`]: 启动恢复子模块

use crate::metrics::Metrics;
use crate::{current_time_ms, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::warn;

pub mod recovery;
pub mod snapshot;
pub mod wal;

/// 存储相关的错误类型
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Fixed per-entry metadata overhead used for memory accounting
const ENTRY_OVERHEAD_BYTES: usize = 128;

/// 缓存条目
///
/// 引擎存储的基本单位，携带 TTL、版本和 LRU 访问信息。
/// 条目只在持有所属分片写锁时被修改。
///
/// # 不变式
///
/// - 同一键在同一节点上的版本严格递增
/// - 设置了过期时间的条目，过期后的读取观察到缺失
/// - `last_accessed_ms >= created_at_ms`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Key (UTF-8 string, max 256 bytes)
    pub key: String,
    /// Value (binary blob)
    pub value: Vec<u8>,
    /// Time-to-live in seconds (optional)
    pub ttl_seconds: Option<i32>,
    /// Absolute expiration timestamp in milliseconds since epoch
    pub expires_at_ms: Option<i64>,
    /// Version for optimistic concurrency control
    pub version: i64,
    /// Creation timestamp (milliseconds since epoch)
    pub created_at_ms: i64,
    /// Last modification timestamp
    pub modified_at_ms: i64,
    /// Last access timestamp for LRU tracking
    pub last_accessed_ms: i64,
    /// Version vector for causality tracking (node_id -> version)
    pub version_vector: HashMap<NodeId, i64>,
}

impl CacheEntry {
    /// Create a new entry at version 1
    pub fn new(key: String, value: Vec<u8>, ttl_seconds: Option<i32>) -> Self {
        let now = current_time_ms();
        let expires_at_ms = ttl_seconds.map(|ttl| now + ttl as i64 * 1000);
        Self {
            key,
            value,
            ttl_seconds,
            expires_at_ms,
            version: 1,
            created_at_ms: now,
            modified_at_ms: now,
            last_accessed_ms: now,
            version_vector: HashMap::new(),
        }
    }

    /// Check if this entry has expired
    pub fn is_expired(&self) -> bool {
        match self.expires_at_ms {
            Some(expires) => current_time_ms() > expires,
            None => false,
        }
    }

    /// Update the last accessed timestamp
    pub fn touch(&mut self) {
        self.last_accessed_ms = current_time_ms();
    }

    /// Total memory footprint of this entry including key, value and metadata
    pub fn total_size(&self) -> usize {
        ENTRY_OVERHEAD_BYTES + self.key.len() + self.value.len()
    }
}

/// Result of a compare-and-swap operation
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// Version matched, entry replaced
    Success { new_version: i64 },
    /// Key does not exist
    NotFound,
    /// Key exists but has expired
    Expired,
    /// Current version differs from the expected one
    VersionMismatch { actual_version: i64 },
}

/// Per-key bookkeeping inside a shard
struct CachedData {
    entry: CacheEntry,
    /// Recency stamp; the key's position in the shard's LRU order
    stamp: u64,
}

/// A single lock-striped partition of the engine
struct Shard {
    data: HashMap<String, CachedData>,
    /// Recency stamp -> key, smallest stamp is the coldest entry
    lru: BTreeMap<u64, String>,
    memory_bytes: usize,
}

impl Shard {
    fn new() -> Self {
        Self {
            data: HashMap::new(),
            lru: BTreeMap::new(),
            memory_bytes: 0,
        }
    }
}

/// 分片存储引擎
///
/// 线程安全的分片 LRU 缓存。每个分片持有独立的 `RwLock`，
/// 全局内存量和条目数由原子计数器维护，跨分片操作逐个加锁，
/// 不会同时持有两把分片锁。
///
/// 临界区内的 panic 导致锁中毒，后续访问该分片会返回
/// [`StorageError::Internal`]，此时该节点应当被故障转移。
pub struct StorageEngine {
    node_id: NodeId,
    shards: Vec<RwLock<Shard>>,
    max_memory_bytes: usize,
    total_memory: AtomicUsize,
    total_entries: AtomicUsize,
    /// Global recency stamp source shared by all shards
    stamp_counter: AtomicU64,
    metrics: Arc<Metrics>,
}

impl StorageEngine {
    /// Create an engine with the given shard count and memory cap
    pub fn new(node_id: NodeId, num_shards: usize, max_memory_bytes: usize, metrics: Arc<Metrics>) -> Self {
        let num_shards = num_shards.max(1);
        let shards = (0..num_shards).map(|_| RwLock::new(Shard::new())).collect();
        Self {
            node_id,
            shards,
            max_memory_bytes,
            total_memory: AtomicUsize::new(0),
            total_entries: AtomicUsize::new(0),
            stamp_counter: AtomicU64::new(1),
            metrics,
        }
    }

    /// Shard index for a key
    fn shard_index(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    fn read_shard(&self, index: usize) -> StorageResult<RwLockReadGuard<'_, Shard>> {
        self.shards[index]
            .read()
            .map_err(|_| StorageError::Internal("shard lock poisoned".to_string()))
    }

    fn write_shard(&self, index: usize) -> StorageResult<RwLockWriteGuard<'_, Shard>> {
        self.shards[index]
            .write()
            .map_err(|_| StorageError::Internal("shard lock poisoned".to_string()))
    }

    fn next_stamp(&self) -> u64 {
        self.stamp_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Get a value by key.
    ///
    /// Touches the entry's LRU position and last-access timestamp.
    /// Expired entries are reaped and reported as missing.
    pub fn get(&self, key: &str) -> StorageResult<Option<CacheEntry>> {
        let index = self.shard_index(key);

        // First probe under the read lock
        {
            let shard = self.read_shard(index)?;
            match shard.data.get(key) {
                None => {
                    self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                }
                Some(cached) if cached.entry.is_expired() => {
                    // fall through to the write path to reap
                }
                Some(_) => {}
            }
        }

        // Take the write lock to update the LRU position (or reap)
        let mut shard = self.write_shard(index)?;
        let stamp = self.next_stamp();

        let expired = match shard.data.get(key) {
            None => {
                self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Some(cached) => cached.entry.is_expired(),
        };

        if expired {
            self.remove_locked(&mut shard, key);
            self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
            self.metrics.expirations_total.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let (old_stamp, entry) = {
            let cached = shard
                .data
                .get_mut(key)
                .expect("entry checked present under the same lock");
            let old_stamp = cached.stamp;
            cached.stamp = stamp;
            cached.entry.touch();
            (old_stamp, cached.entry.clone())
        };
        let key_owned = shard
            .lru
            .remove(&old_stamp)
            .unwrap_or_else(|| key.to_string());
        shard.lru.insert(stamp, key_owned);
        self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(entry))
    }

    /// Insert or replace a key.
    ///
    /// On replace, the new version is the prior version + 1 and the
    /// creation timestamp is preserved; on insert, the version is 1.
    /// Returns the committed version.
    pub fn set(&self, key: &str, value: Vec<u8>, ttl_seconds: Option<i32>) -> StorageResult<i64> {
        let mut entry = CacheEntry::new(key.to_string(), value, ttl_seconds);

        let index = self.shard_index(key);
        let stamp = self.next_stamp();
        let mut shard = self.write_shard(index)?;

        if let Some(existing) = shard.data.get(key) {
            // Expired entries do not contribute a prior version
            if !existing.entry.is_expired() {
                entry.version = existing.entry.version + 1;
                entry.created_at_ms = existing.entry.created_at_ms;
                entry.version_vector = existing.entry.version_vector.clone();
            }
        }
        entry
            .version_vector
            .insert(self.node_id.clone(), entry.version);

        let version = entry.version;
        self.insert_locked(&mut shard, entry, stamp)?;
        self.metrics.sets_total.fetch_add(1, Ordering::Relaxed);
        Ok(version)
    }

    /// Apply an entry produced elsewhere, preserving its version.
    ///
    /// Used by replication, catchup and recovery. Entries whose version is
    /// older than the currently stored one are rejected (version regression
    /// guard). Returns whether the entry was applied.
    pub fn apply_entry(&self, entry: CacheEntry) -> StorageResult<bool> {
        let index = self.shard_index(&entry.key);
        let stamp = self.next_stamp();
        let mut shard = self.write_shard(index)?;

        if let Some(existing) = shard.data.get(&entry.key) {
            if !existing.entry.is_expired() && existing.entry.version > entry.version {
                warn!(
                    "Rejecting stale entry for key {}: stored version {} > incoming {}",
                    entry.key, existing.entry.version, entry.version
                );
                return Ok(false);
            }
        }

        self.insert_locked(&mut shard, entry, stamp)?;
        Ok(true)
    }

    /// Delete a key.
    ///
    /// A delete advances the key's version the same way a replace does:
    /// the returned version is the prior version + 1 and is what gets
    /// logged and replicated for this delete. Returns `None` when no live
    /// (unexpired) entry existed.
    pub fn delete(&self, key: &str) -> StorageResult<Option<i64>> {
        let index = self.shard_index(key);
        let mut shard = self.write_shard(index)?;

        let prior_version = match shard.data.get(key) {
            None => return Ok(None),
            Some(cached) if cached.entry.is_expired() => {
                self.remove_locked(&mut shard, key);
                self.metrics.expirations_total.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Some(cached) => cached.entry.version,
        };

        self.remove_locked(&mut shard, key);
        self.metrics.deletes_total.fetch_add(1, Ordering::Relaxed);
        Ok(Some(prior_version + 1))
    }

    /// Apply a delete produced elsewhere, preserving its version.
    ///
    /// Used by replication. A delete whose version is not newer than the
    /// currently stored entry's version is rejected (version regression
    /// guard), so a stale delete cannot wipe a newer write. Deleting a
    /// missing key applies trivially. Returns whether the delete applied.
    pub fn apply_delete(&self, key: &str, version: i64) -> StorageResult<bool> {
        let index = self.shard_index(key);
        let mut shard = self.write_shard(index)?;

        if let Some(cached) = shard.data.get(key) {
            if !cached.entry.is_expired() && cached.entry.version >= version {
                warn!(
                    "Rejecting stale delete for key {}: stored version {} >= incoming {}",
                    key, cached.entry.version, version
                );
                return Ok(false);
            }
        }

        self.remove_locked(&mut shard, key);
        self.metrics.deletes_total.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Atomically replace a key if its current version matches.
    ///
    /// The shard write lock is held across the read, the comparison and the
    /// write; two concurrent CAS calls on the same key serialize and at most
    /// one succeeds.
    pub fn compare_and_swap(
        &self,
        key: &str,
        expected_version: i64,
        new_value: Vec<u8>,
        ttl_seconds: Option<i32>,
    ) -> StorageResult<CasOutcome> {
        let index = self.shard_index(key);
        let stamp = self.next_stamp();
        let mut shard = self.write_shard(index)?;
        self.metrics.cas_total.fetch_add(1, Ordering::Relaxed);

        let (actual_version, created_at_ms, version_vector) = match shard.data.get(key) {
            None => {
                self.metrics.cas_failures.fetch_add(1, Ordering::Relaxed);
                return Ok(CasOutcome::NotFound);
            }
            Some(cached) if cached.entry.is_expired() => {
                self.remove_locked(&mut shard, key);
                self.metrics.cas_failures.fetch_add(1, Ordering::Relaxed);
                self.metrics.expirations_total.fetch_add(1, Ordering::Relaxed);
                return Ok(CasOutcome::Expired);
            }
            Some(cached) => (
                cached.entry.version,
                cached.entry.created_at_ms,
                cached.entry.version_vector.clone(),
            ),
        };

        if actual_version != expected_version {
            self.metrics.cas_failures.fetch_add(1, Ordering::Relaxed);
            return Ok(CasOutcome::VersionMismatch { actual_version });
        }

        let mut entry = CacheEntry::new(key.to_string(), new_value, ttl_seconds);
        entry.version = actual_version + 1;
        entry.created_at_ms = created_at_ms;
        entry.version_vector = version_vector;
        entry
            .version_vector
            .insert(self.node_id.clone(), entry.version);

        let new_version = entry.version;
        self.insert_locked(&mut shard, entry, stamp)?;
        self.metrics.sets_total.fetch_add(1, Ordering::Relaxed);
        Ok(CasOutcome::Success { new_version })
    }

    /// Check if a key exists and is not expired
    pub fn exists(&self, key: &str) -> StorageResult<bool> {
        let index = self.shard_index(key);
        let shard = self.read_shard(index)?;
        Ok(shard
            .data
            .get(key)
            .map(|cached| !cached.entry.is_expired())
            .unwrap_or(false))
    }

    /// Visit every non-expired entry under shared locks.
    ///
    /// Shards are locked one at a time; concurrent single-key operations on
    /// other shards proceed unhindered. Used by snapshotting and rebalancing.
    pub fn for_each<F>(&self, mut f: F) -> StorageResult<()>
    where
        F: FnMut(&str, &CacheEntry),
    {
        for index in 0..self.shards.len() {
            let shard = self.read_shard(index)?;
            for (key, cached) in shard.data.iter() {
                if !cached.entry.is_expired() {
                    f(key, &cached.entry);
                }
            }
        }
        Ok(())
    }

    /// Remove all entries
    pub fn clear(&self) -> StorageResult<()> {
        for index in 0..self.shards.len() {
            let mut shard = self.write_shard(index)?;
            shard.data.clear();
            shard.lru.clear();
            shard.memory_bytes = 0;
        }
        self.total_memory.store(0, Ordering::Relaxed);
        self.total_entries.store(0, Ordering::Relaxed);
        self.metrics.entries_count.store(0, Ordering::Relaxed);
        self.metrics.memory_bytes.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Number of entries currently stored
    pub fn len(&self) -> usize {
        self.total_entries.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current memory usage in bytes
    pub fn memory_usage(&self) -> usize {
        self.total_memory.load(Ordering::Relaxed)
    }

    /// Configured memory cap in bytes
    pub fn max_memory(&self) -> usize {
        self.max_memory_bytes
    }

    /// Node id this engine belongs to
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Engine metrics handle
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Insert an entry into a locked shard, evicting as needed.
    fn insert_locked(
        &self,
        shard: &mut Shard,
        entry: CacheEntry,
        stamp: u64,
    ) -> StorageResult<()> {
        let key = entry.key.clone();
        let entry_size = entry.total_size();

        // Replacing an existing entry releases its memory first
        let displaced = shard.data.remove(&key).map(|old| {
            shard.lru.remove(&old.stamp);
            shard.memory_bytes -= old.entry.total_size();
            self.total_memory.fetch_sub(old.entry.total_size(), Ordering::Relaxed);
            self.total_entries.fetch_sub(1, Ordering::Relaxed);
            old
        });

        self.evict_until_fits(shard, entry_size);

        if self.total_memory.load(Ordering::Relaxed) + entry_size > self.max_memory_bytes {
            // The new entry cannot fit; put the displaced one back so a
            // failed SET leaves the prior value intact.
            if let Some(old) = displaced {
                let old_size = old.entry.total_size();
                shard.lru.insert(old.stamp, key.clone());
                shard.data.insert(key, old);
                shard.memory_bytes += old_size;
                self.total_memory.fetch_add(old_size, Ordering::Relaxed);
                self.total_entries.fetch_add(1, Ordering::Relaxed);
            }
            return Err(StorageError::ResourceExhausted(format!(
                "entry of {} bytes does not fit under the {} byte cap",
                entry_size, self.max_memory_bytes
            )));
        }

        shard.lru.insert(stamp, key.clone());
        shard.data.insert(key, CachedData { entry, stamp });
        shard.memory_bytes += entry_size;
        self.total_memory.fetch_add(entry_size, Ordering::Relaxed);
        self.total_entries.fetch_add(1, Ordering::Relaxed);

        self.metrics
            .entries_count
            .store(self.total_entries.load(Ordering::Relaxed) as u64, Ordering::Relaxed);
        self.metrics
            .memory_bytes
            .store(self.total_memory.load(Ordering::Relaxed) as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Remove a key from a locked shard and update the counters.
    fn remove_locked(&self, shard: &mut Shard, key: &str) {
        if let Some(old) = shard.data.remove(key) {
            shard.lru.remove(&old.stamp);
            let size = old.entry.total_size();
            shard.memory_bytes -= size;
            self.total_memory.fetch_sub(size, Ordering::Relaxed);
            self.total_entries.fetch_sub(1, Ordering::Relaxed);
            self.metrics
                .entries_count
                .store(self.total_entries.load(Ordering::Relaxed) as u64, Ordering::Relaxed);
            self.metrics
                .memory_bytes
                .store(self.total_memory.load(Ordering::Relaxed) as u64, Ordering::Relaxed);
        }
    }

    /// Evict least-recently-used entries from the locked shard until the
    /// incoming entry would fit under the global cap, or the shard is empty.
    fn evict_until_fits(&self, shard: &mut Shard, required: usize) {
        while self.total_memory.load(Ordering::Relaxed) + required > self.max_memory_bytes {
            let coldest = match shard.lru.iter().next() {
                Some((stamp, key)) => (*stamp, key.clone()),
                None => break,
            };
            shard.lru.remove(&coldest.0);
            if let Some(old) = shard.data.remove(&coldest.1) {
                let size = old.entry.total_size();
                shard.memory_bytes -= size;
                self.total_memory.fetch_sub(size, Ordering::Relaxed);
                self.total_entries.fetch_sub(1, Ordering::Relaxed);
                if old.entry.is_expired() {
                    self.metrics.expirations_total.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.metrics.evictions_total.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}
