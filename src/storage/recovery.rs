//! # 启动恢复模块
//!
//! 节点启动时（开始服务之前）恢复引擎状态：先从最新的、校验和有效的快照
//! 恢复，再按序列号回放快照之后的预写日志记录。恢复是幂等的：
//! 对同一份磁盘状态执行两次得到相同的引擎状态。
//!
//! 校验和损坏的快照回退到次新的快照；全部失效则从空状态开始并记录警告。
//! 日志中的 CAS 记录按普通 SET 回放，因为日志只包含当初成功的结果。

use super::snapshot::SnapshotStore;
use super::wal::{Wal, WalRecord, WalRecordKind};
use super::{CacheEntry, StorageEngine, StorageResult};
use tracing::{info, warn};

/// Outcome of a recovery run
#[derive(Debug, Clone, Default)]
pub struct RecoveryResult {
    pub snapshot_restored: bool,
    pub snapshot_id: Option<String>,
    pub snapshot_keys: usize,
    pub wal_files_processed: usize,
    pub wal_records_replayed: usize,
    pub last_sequence: i64,
    pub duration_ms: u64,
}

/// 恢复管理器
///
/// 持有引擎、快照存储与预写日志的共享句柄，`recover` 在节点启动时
/// 恰好调用一次。
pub struct RecoveryManager<'a> {
    engine: &'a StorageEngine,
    snapshots: &'a SnapshotStore,
    wal: &'a Wal,
}

impl<'a> RecoveryManager<'a> {
    pub fn new(engine: &'a StorageEngine, snapshots: &'a SnapshotStore, wal: &'a Wal) -> Self {
        Self {
            engine,
            snapshots,
            wal,
        }
    }

    /// Run recovery: snapshot restore, then WAL replay.
    pub fn recover(&self) -> StorageResult<RecoveryResult> {
        let started = std::time::Instant::now();
        info!("=== Starting recovery ===");

        let mut result = RecoveryResult::default();

        let snapshot_sequence = self.restore_latest_valid_snapshot(&mut result)?;
        self.replay_wal(&mut result, snapshot_sequence)?;

        result.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "=== Recovery complete: snapshot={:?} ({} keys), {} WAL file(s), {} record(s) replayed, last sequence {}, {}ms ===",
            result.snapshot_id,
            result.snapshot_keys,
            result.wal_files_processed,
            result.wal_records_replayed,
            result.last_sequence,
            result.duration_ms
        );
        Ok(result)
    }

    /// Restore the newest snapshot whose checksum validates.
    ///
    /// Returns the WAL sequence covered by the restored snapshot, or 0 when
    /// starting empty (replay everything).
    fn restore_latest_valid_snapshot(&self, result: &mut RecoveryResult) -> StorageResult<i64> {
        let mut snapshots = self.snapshots.list_snapshots();
        if snapshots.is_empty() {
            info!("No snapshots available, starting from an empty engine");
            return Ok(0);
        }

        // Newest first; fall back down the list on checksum failures
        snapshots.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));

        for metadata in &snapshots {
            if !self.snapshots.validate(metadata) {
                warn!(
                    "Snapshot {} failed checksum validation, trying an older one",
                    metadata.snapshot_id
                );
                continue;
            }

            let applied = self.snapshots.restore_into(&metadata.snapshot_id, self.engine)?;
            result.snapshot_restored = true;
            result.snapshot_id = Some(metadata.snapshot_id.clone());
            result.snapshot_keys = applied;
            return Ok(metadata.last_wal_sequence);
        }

        warn!("No snapshot passed validation, starting from an empty engine");
        Ok(0)
    }

    /// Replay WAL records with sequence above the snapshot coverage,
    /// ordered by sequence across all files.
    fn replay_wal(&self, result: &mut RecoveryResult, snapshot_sequence: i64) -> StorageResult<()> {
        let mut files = self.wal.list_wal_files()?;
        if files.is_empty() {
            return Ok(());
        }
        files.sort();

        let mut records: Vec<WalRecord> = Vec::new();
        for log_id in &files {
            let path = self.wal.log_file_path(log_id);
            match self.wal.read_wal_file(&path) {
                Ok(file_records) => {
                    records.extend(
                        file_records
                            .into_iter()
                            .filter(|r| r.sequence > snapshot_sequence),
                    );
                }
                Err(e) => {
                    warn!("Skipping unreadable WAL file {} during recovery: {}", log_id, e);
                }
            }
        }
        result.wal_files_processed = files.len();

        if records.is_empty() {
            info!("No WAL records to replay after sequence {}", snapshot_sequence);
            return Ok(());
        }

        records.sort_by_key(|r| r.sequence);
        // Duplicate sequences can only come from re-reading the same data;
        // keep the first occurrence.
        records.dedup_by_key(|r| r.sequence);

        info!("Replaying {} WAL record(s)", records.len());
        let mut replayed = 0;
        let mut last_sequence = 0;
        for record in records {
            self.apply_record(&record)?;
            replayed += 1;
            last_sequence = record.sequence;
        }

        result.wal_records_replayed = replayed;
        result.last_sequence = last_sequence;
        Ok(())
    }

    fn apply_record(&self, record: &WalRecord) -> StorageResult<()> {
        match record.kind {
            // CAS replays as a plain SET: the log only ever contains the
            // outcome of a CAS that succeeded.
            WalRecordKind::Set | WalRecordKind::Cas => {
                let mut entry = CacheEntry::new(
                    record.key.clone(),
                    record.value.clone(),
                    None,
                );
                entry.ttl_seconds = record.ttl_seconds;
                entry.expires_at_ms = record
                    .ttl_seconds
                    .map(|ttl| record.timestamp_ms + ttl as i64 * 1000);
                entry.version = record.version;
                entry.created_at_ms = record.timestamp_ms;
                entry.modified_at_ms = record.timestamp_ms;
                self.engine.apply_entry(entry)?;
            }
            WalRecordKind::Delete => {
                self.engine.apply_delete(&record.key, record.version)?;
            }
        }
        Ok(())
    }
}
