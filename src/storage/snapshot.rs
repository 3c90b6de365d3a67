//! # 快照模块
//!
//! 本模块实现了存储引擎的时间点快照：后台任务按配置间隔遍历全部未过期条目，
//! 写入临时文件后通过原子重命名落盘，并按保留数量修剪旧快照。
//! 快照落盘后，被其覆盖的预写日志文件即可安全截断。
//!
//! ## 原子性
//!
//! 读取方只会看到最终名称下的文件；临时文件在正文与校验和刷盘之后才被
//! 重命名，因此不存在可见的半成品快照。
//!
//! ## 存储格式
//!
//! 快照文件以文本头开始，随后是二进制条目元组：
//!
//! ```text
//! DISTCACHE_SNAPSHOT_V1\n
//! <snapshot id>\n
//! <entry count>\n
//! [u64 key_len][key][u64 value_len][value][i32 ttl][i64 version][i64 created_at_ms][i64 expires_at_ms (0 = none)]
//! ...
//! ```
//!
//! 元数据（校验和、键数、覆盖的日志序列号等）以 JSON 旁车文件存储，
//! 文件名为 `<snapshot id>.meta.json`。

use super::wal::Wal;
use super::{CacheEntry, StorageEngine, StorageError, StorageResult};
use crate::{current_time_ms, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File};
use std::hash::{Hash, Hasher};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Magic first line of every snapshot file
const SNAPSHOT_MAGIC: &str = "DISTCACHE_SNAPSHOT_V1";

/// Snapshot store configuration
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub snapshot_dir: PathBuf,
    pub node_id: NodeId,
    pub snapshot_interval: Duration,
    pub max_snapshots_retained: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: PathBuf::from("./snapshots"),
            node_id: "node1".to_string(),
            snapshot_interval: Duration::from_secs(300),
            max_snapshots_retained: 3,
        }
    }
}

/// Metadata describing one snapshot on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub snapshot_id: String,
    pub node_id: NodeId,
    pub timestamp_ms: i64,
    pub num_keys: usize,
    pub total_bytes: u64,
    pub checksum: String,
    /// All WAL records with sequence <= this are covered by the snapshot
    pub last_wal_sequence: i64,
}

/// 快照存储
///
/// 管理快照的创建、枚举、校验、恢复与修剪。创建路径不持有任何分片锁
/// 跨越文件写入：条目先在分片共享锁下收集，再写入磁盘。
pub struct SnapshotStore {
    config: SnapshotConfig,
    snapshots: Mutex<Vec<SnapshotMetadata>>,
    snapshots_created: AtomicU64,
    snapshots_failed: AtomicU64,
    snapshot_counter: AtomicU64,
}

impl SnapshotStore {
    /// Open the store, loading metadata for any snapshots already on disk
    pub fn open(config: SnapshotConfig) -> StorageResult<Self> {
        fs::create_dir_all(&config.snapshot_dir)?;

        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&config.snapshot_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(".meta.json"))
                .unwrap_or(false)
            {
                match Self::read_metadata(&path) {
                    Ok(meta) => snapshots.push(meta),
                    Err(e) => warn!("Skipping unreadable snapshot metadata {:?}: {}", path, e),
                }
            }
        }
        info!(
            "Snapshot store opened in {:?} with {} existing snapshot(s)",
            config.snapshot_dir,
            snapshots.len()
        );

        Ok(Self {
            config,
            snapshots: Mutex::new(snapshots),
            snapshots_created: AtomicU64::new(0),
            snapshots_failed: AtomicU64::new(0),
            snapshot_counter: AtomicU64::new(0),
        })
    }

    /// Create a snapshot of the engine's current contents.
    ///
    /// `last_wal_sequence` is captured before enumeration so the snapshot is
    /// guaranteed to contain every mutation at or below it; truncating the
    /// WAL at that sequence afterwards is always safe.
    pub fn create_snapshot(
        &self,
        engine: &StorageEngine,
        last_wal_sequence: i64,
    ) -> StorageResult<SnapshotMetadata> {
        let started = std::time::Instant::now();
        let snapshot_id = self.generate_snapshot_id();

        let mut entries: Vec<CacheEntry> = Vec::new();
        engine.for_each(|_, entry| entries.push(entry.clone()))?;

        let final_path = self.snapshot_file_path(&snapshot_id);
        let tmp_path = self.config.snapshot_dir.join(format!("{}.tmp", snapshot_id));

        if let Err(e) = self.write_snapshot_file(&tmp_path, &snapshot_id, &entries) {
            self.snapshots_failed.fetch_add(1, Ordering::Relaxed);
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        // The rename publishes the snapshot atomically
        fs::rename(&tmp_path, &final_path)?;

        let total_bytes = fs::metadata(&final_path).map(|m| m.len()).unwrap_or(0);
        let metadata = SnapshotMetadata {
            snapshot_id: snapshot_id.clone(),
            node_id: self.config.node_id.clone(),
            timestamp_ms: current_time_ms(),
            num_keys: entries.len(),
            total_bytes,
            checksum: calculate_checksum(&entries),
            last_wal_sequence,
        };
        self.write_metadata(&metadata)?;

        {
            let mut snapshots = self
                .snapshots
                .lock()
                .map_err(|_| StorageError::Internal("snapshot list lock poisoned".to_string()))?;
            snapshots.push(metadata.clone());
        }
        self.snapshots_created.fetch_add(1, Ordering::Relaxed);
        engine
            .metrics()
            .snapshots_created
            .fetch_add(1, Ordering::Relaxed);

        info!(
            "Snapshot created: {} ({} keys, {} bytes, {}ms)",
            snapshot_id,
            metadata.num_keys,
            metadata.total_bytes,
            started.elapsed().as_millis()
        );
        Ok(metadata)
    }

    fn write_snapshot_file(
        &self,
        path: &Path,
        snapshot_id: &str,
        entries: &[CacheEntry],
    ) -> StorageResult<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        writeln!(writer, "{}", SNAPSHOT_MAGIC)?;
        writeln!(writer, "{}", snapshot_id)?;
        writeln!(writer, "{}", entries.len())?;

        for entry in entries {
            let key = entry.key.as_bytes();
            writer.write_all(&(key.len() as u64).to_le_bytes())?;
            writer.write_all(key)?;
            writer.write_all(&(entry.value.len() as u64).to_le_bytes())?;
            writer.write_all(&entry.value)?;
            writer.write_all(&entry.ttl_seconds.unwrap_or(0).to_le_bytes())?;
            writer.write_all(&entry.version.to_le_bytes())?;
            writer.write_all(&entry.created_at_ms.to_le_bytes())?;
            writer.write_all(&entry.expires_at_ms.unwrap_or(0).to_le_bytes())?;
        }

        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Read every entry of a snapshot file
    pub fn read_snapshot_file(&self, snapshot_id: &str) -> StorageResult<Vec<CacheEntry>> {
        let path = self.snapshot_file_path(snapshot_id);
        let file = File::open(&path)
            .map_err(|_| StorageError::SnapshotNotFound(snapshot_id.to_string()))?;
        let mut reader = BufReader::new(file);

        let magic = read_line(&mut reader)?;
        if magic != SNAPSHOT_MAGIC {
            return Err(StorageError::InvalidFormat(format!(
                "bad snapshot magic in {}: {:?}",
                snapshot_id, magic
            )));
        }
        let _id_line = read_line(&mut reader)?;
        let count: usize = read_line(&mut reader)?
            .parse()
            .map_err(|_| StorageError::InvalidFormat("bad snapshot entry count".to_string()))?;

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key_len = read_u64(&mut reader)? as usize;
            let mut key = vec![0u8; key_len];
            reader.read_exact(&mut key)?;
            let key = String::from_utf8(key)
                .map_err(|_| StorageError::InvalidFormat("snapshot key is not UTF-8".to_string()))?;

            let value_len = read_u64(&mut reader)? as usize;
            let mut value = vec![0u8; value_len];
            reader.read_exact(&mut value)?;

            let ttl = read_i32(&mut reader)?;
            let version = read_i64(&mut reader)?;
            let created_at_ms = read_i64(&mut reader)?;
            let expires_at_ms = read_i64(&mut reader)?;

            let mut entry = CacheEntry::new(key, value, None);
            entry.ttl_seconds = if ttl > 0 { Some(ttl) } else { None };
            entry.expires_at_ms = if expires_at_ms > 0 { Some(expires_at_ms) } else { None };
            entry.version = version;
            entry.created_at_ms = created_at_ms;
            entry.modified_at_ms = created_at_ms;
            entries.push(entry);
        }

        Ok(entries)
    }

    /// Restore a snapshot's entries into the engine, preserving versions.
    /// Returns the number of entries applied.
    pub fn restore_into(
        &self,
        snapshot_id: &str,
        engine: &StorageEngine,
    ) -> StorageResult<usize> {
        let entries = self.read_snapshot_file(snapshot_id)?;
        let mut applied = 0;
        for entry in entries {
            if engine.apply_entry(entry)? {
                applied += 1;
            }
        }
        info!("Restored {} keys from snapshot {}", applied, snapshot_id);
        Ok(applied)
    }

    /// Validate a snapshot's checksum against its file contents
    pub fn validate(&self, metadata: &SnapshotMetadata) -> bool {
        match self.read_snapshot_file(&metadata.snapshot_id) {
            Ok(entries) => calculate_checksum(&entries) == metadata.checksum,
            Err(e) => {
                warn!("Snapshot {} failed to read during validation: {}", metadata.snapshot_id, e);
                false
            }
        }
    }

    /// All known snapshot metadata (unsorted)
    pub fn list_snapshots(&self) -> Vec<SnapshotMetadata> {
        self.snapshots
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Delete oldest snapshots beyond the retention cap
    pub fn prune_old_snapshots(&self) -> StorageResult<()> {
        let mut snapshots = self
            .snapshots
            .lock()
            .map_err(|_| StorageError::Internal("snapshot list lock poisoned".to_string()))?;

        if snapshots.len() <= self.config.max_snapshots_retained {
            return Ok(());
        }

        snapshots.sort_by_key(|m| m.timestamp_ms);
        let to_delete = snapshots.len() - self.config.max_snapshots_retained;
        for meta in snapshots.drain(..to_delete) {
            let _ = fs::remove_file(self.snapshot_file_path(&meta.snapshot_id));
            let _ = fs::remove_file(self.metadata_file_path(&meta.snapshot_id));
            info!("Deleted old snapshot: {}", meta.snapshot_id);
        }
        Ok(())
    }

    /// Background scheduler: snapshot every interval, prune, then release
    /// covered WAL files. Polls the stop flag once per tick.
    pub async fn run_scheduler(
        self: Arc<Self>,
        engine: Arc<StorageEngine>,
        wal: Arc<Wal>,
        stop: Arc<AtomicBool>,
    ) {
        info!(
            "Snapshot scheduler started (interval {:?})",
            self.config.snapshot_interval
        );
        let mut ticker = tokio::time::interval(self.config.snapshot_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so the initial snapshot
        // happens one full interval after startup.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if stop.load(Ordering::Relaxed) {
                break;
            }

            let covered_sequence = wal.last_sequence();
            match self.create_snapshot(&engine, covered_sequence) {
                Ok(_) => {
                    if let Err(e) = self.prune_old_snapshots() {
                        warn!("Snapshot pruning failed: {}", e);
                    }
                    if let Err(e) = wal.truncate_before(covered_sequence) {
                        warn!("WAL truncation after snapshot failed: {}", e);
                    }
                }
                Err(e) => error!("Periodic snapshot failed: {}", e),
            }
        }
        info!("Snapshot scheduler stopped");
    }

    fn write_metadata(&self, metadata: &SnapshotMetadata) -> StorageResult<()> {
        let final_path = self.metadata_file_path(&metadata.snapshot_id);
        let tmp_path = self
            .config
            .snapshot_dir
            .join(format!("{}.meta.tmp", metadata.snapshot_id));

        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, metadata)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    fn read_metadata(path: &Path) -> StorageResult<SnapshotMetadata> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }

    fn snapshot_file_path(&self, snapshot_id: &str) -> PathBuf {
        self.config.snapshot_dir.join(format!("{}.snapshot", snapshot_id))
    }

    fn metadata_file_path(&self, snapshot_id: &str) -> PathBuf {
        self.config.snapshot_dir.join(format!("{}.meta.json", snapshot_id))
    }

    fn generate_snapshot_id(&self) -> String {
        format!(
            "snapshot-{}-{}-{:04}",
            self.config.node_id,
            current_time_ms(),
            self.snapshot_counter.fetch_add(1, Ordering::Relaxed)
        )
    }
}

/// Checksum over keys and values, stable across runs.
fn calculate_checksum(entries: &[CacheEntry]) -> String {
    let mut checksum: u64 = 0;
    for entry in entries {
        let mut hasher = DefaultHasher::new();
        entry.key.hash(&mut hasher);
        let key_hash = hasher.finish();

        let mut hasher = DefaultHasher::new();
        entry.value.hash(&mut hasher);
        let value_hash = hasher.finish();

        checksum ^= key_hash
            .wrapping_add(value_hash)
            .wrapping_add(0x9e3779b9)
            .wrapping_add(checksum << 6)
            .wrapping_add(checksum >> 2);
    }
    format!("{:016x}", checksum)
}

fn read_line<R: Read>(reader: &mut R) -> StorageResult<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        reader.read_exact(&mut byte)?;
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > 4096 {
            return Err(StorageError::InvalidFormat("snapshot header line too long".to_string()));
        }
    }
    String::from_utf8(line)
        .map_err(|_| StorageError::InvalidFormat("snapshot header is not UTF-8".to_string()))
}

fn read_u64<R: Read>(reader: &mut R) -> StorageResult<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_i64<R: Read>(reader: &mut R) -> StorageResult<i64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

fn read_i32<R: Read>(reader: &mut R) -> StorageResult<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}
