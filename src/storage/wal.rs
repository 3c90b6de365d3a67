//! # 预写日志模块
//!
//! 本模块实现了缓存节点的预写日志（WAL）。所有对客户端返回成功的变更
//! （SET、DELETE、CAS）必须先持久化到日志，崩溃后通过回放日志恢复状态。
//!
//! ## 功能特性
//!
//! - **原子追加**: 记录以长度前缀分帧，恢复时要么读到完整记录，要么没有
//! - **单调序列号**: 每个节点维护全局唯一、严格递增的序列号
//! - **日志轮转**: 当前文件超过大小上限时切换到新文件，旧文件保留供恢复
//! - **保留上限**: 超过最大文件数时删除最旧的日志文件
//! - **快照截断**: 快照覆盖的序列号之前的日志文件可以安全删除
//!
//! ## 存储格式
//!
//! 日志文件以长度前缀的头部开始，随后是零或多条长度前缀的记录：
//!
//! ```text
//! [u32 len][WalHeader bytes]
//! [u32 len][WalRecord bytes]
//! [u32 len][WalRecord bytes]
//! ...
//! ```
//!
//! 头部与记录均使用 bincode 序列化，头部 schema 版本为 1。
//! 恢复读取遇到残缺的尾部记录时停止回放并记录警告。

use super::{StorageError, StorageResult};
use crate::{current_time_ms, NodeId};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

/// WAL schema version written into every file header
const WAL_SCHEMA_VERSION: u32 = 1;

/// WAL configuration
#[derive(Debug, Clone)]
pub struct WalConfig {
    pub wal_dir: PathBuf,
    pub node_id: NodeId,
    /// Rotation threshold in bytes
    pub max_file_size_bytes: usize,
    /// Retention cap on the number of files
    pub max_log_files: usize,
    /// fsync after every record
    pub sync_on_write: bool,
    /// When not syncing on every write, sync after this many appends
    pub sync_batch_size: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            wal_dir: PathBuf::from("./wal"),
            node_id: "node1".to_string(),
            max_file_size_bytes: 100 * 1024 * 1024,
            max_log_files: 10,
            sync_on_write: true,
            sync_batch_size: 100,
        }
    }
}

/// Kind of a logged mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalRecordKind {
    Set,
    Delete,
    Cas,
}

/// A single durable record of one mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalRecord {
    pub kind: WalRecordKind,
    /// Per-node monotone sequence number, never reused
    pub sequence: i64,
    pub timestamp_ms: i64,
    pub key: String,
    /// Empty for DELETE
    pub value: Vec<u8>,
    pub version: i64,
    pub ttl_seconds: Option<i32>,
    /// Expected prior version, CAS only
    pub expected_version: Option<i64>,
}

/// File header, written once per log file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalHeader {
    pub wal_id: String,
    pub created_at_ms: i64,
    pub node_id: NodeId,
    pub schema_version: u32,
}

struct WalFile {
    log_id: String,
    file: File,
    /// Appends since the last sync (batched-sync mode)
    unsynced: usize,
}

/// 预写日志
///
/// 追加端由互斥锁串行化；并发写入者在此汇聚，批量同步摊薄 fsync 开销。
/// 序列号由原子计数器分配，I/O 失败不推进序列号，调用方的变更随之失败，
/// 磁盘上不会留下幽灵记录。
pub struct Wal {
    config: WalConfig,
    current: Mutex<Option<WalFile>>,
    current_file_size: AtomicU64,
    last_sequence: AtomicI64,
    entries_written: AtomicU64,
    syncs_total: AtomicU64,
    rotations_total: AtomicU64,
    file_counter: AtomicU64,
}

/// WAL statistics snapshot
#[derive(Debug, Clone, Default)]
pub struct WalStats {
    pub entries_written: u64,
    pub syncs_total: u64,
    pub rotations_total: u64,
    pub last_sequence: i64,
    pub current_file_size: u64,
}

impl Wal {
    /// Open the WAL, creating the directory and a fresh log file.
    ///
    /// The sequence counter resumes after the highest sequence found in any
    /// existing file so that sequences are never reused across restarts.
    pub fn open(config: WalConfig) -> StorageResult<Self> {
        fs::create_dir_all(&config.wal_dir)?;

        let wal = Self {
            config,
            current: Mutex::new(None),
            current_file_size: AtomicU64::new(0),
            last_sequence: AtomicI64::new(0),
            entries_written: AtomicU64::new(0),
            syncs_total: AtomicU64::new(0),
            rotations_total: AtomicU64::new(0),
            file_counter: AtomicU64::new(0),
        };

        // Resume the sequence counter from existing files
        let existing = wal.list_wal_files()?;
        let mut max_seq = 0i64;
        for log_id in &existing {
            let path = wal.log_file_path(log_id);
            if let Ok(records) = wal.read_wal_file(&path) {
                for record in records {
                    max_seq = max_seq.max(record.sequence);
                }
            }
        }
        wal.last_sequence.store(max_seq, Ordering::SeqCst);
        wal.file_counter.store(existing.len() as u64, Ordering::Relaxed);

        wal.open_fresh_file()?;
        info!("WAL opened in {:?}, resuming after sequence {}", wal.config.wal_dir, max_seq);
        Ok(wal)
    }

    /// Append a SET record. Returns the assigned sequence number.
    pub fn append_set(
        &self,
        key: &str,
        value: &[u8],
        version: i64,
        ttl_seconds: Option<i32>,
    ) -> StorageResult<i64> {
        self.append(WalRecordKind::Set, key, value.to_vec(), version, ttl_seconds, None)
    }

    /// Append a DELETE record. Returns the assigned sequence number.
    pub fn append_delete(&self, key: &str, version: i64) -> StorageResult<i64> {
        self.append(WalRecordKind::Delete, key, Vec::new(), version, None, None)
    }

    /// Append a CAS record. Only successful CAS operations are logged.
    pub fn append_cas(
        &self,
        key: &str,
        value: &[u8],
        version: i64,
        ttl_seconds: Option<i32>,
        expected_version: i64,
    ) -> StorageResult<i64> {
        self.append(
            WalRecordKind::Cas,
            key,
            value.to_vec(),
            version,
            ttl_seconds,
            Some(expected_version),
        )
    }

    fn append(
        &self,
        kind: WalRecordKind,
        key: &str,
        value: Vec<u8>,
        version: i64,
        ttl_seconds: Option<i32>,
        expected_version: Option<i64>,
    ) -> StorageResult<i64> {
        let mut guard = self
            .current
            .lock()
            .map_err(|_| StorageError::Internal("WAL lock poisoned".to_string()))?;

        // Rotate before appending if the current file is over the cap
        if self.current_file_size.load(Ordering::Relaxed) as usize
            >= self.config.max_file_size_bytes
        {
            self.rotate_locked(&mut guard)?;
        }

        let current = guard
            .as_mut()
            .ok_or_else(|| StorageError::Internal("WAL not open".to_string()))?;

        // The sequence is only advanced once the record is safely on disk
        let sequence = self.last_sequence.load(Ordering::SeqCst) + 1;
        let record = WalRecord {
            kind,
            sequence,
            timestamp_ms: current_time_ms(),
            key: key.to_string(),
            value,
            version,
            ttl_seconds,
            expected_version,
        };

        let body = bincode::serialize(&record)?;
        let mut framed = Vec::with_capacity(4 + body.len());
        framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
        framed.extend_from_slice(&body);

        if let Err(e) = current.file.write_all(&framed) {
            error!("WAL append failed for key {}: {}", key, e);
            return Err(StorageError::Io(e));
        }

        if self.config.sync_on_write {
            current.file.sync_data()?;
            self.syncs_total.fetch_add(1, Ordering::Relaxed);
        } else {
            current.unsynced += 1;
            if current.unsynced >= self.config.sync_batch_size {
                current.file.sync_data()?;
                current.unsynced = 0;
                self.syncs_total.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.last_sequence.store(sequence, Ordering::SeqCst);
        self.current_file_size
            .fetch_add(framed.len() as u64, Ordering::Relaxed);
        self.entries_written.fetch_add(1, Ordering::Relaxed);

        Ok(sequence)
    }

    /// Flush buffered appends to disk.
    ///
    /// Once this returns, all preceding appends survive a crash.
    pub fn sync(&self) -> StorageResult<()> {
        let mut guard = self
            .current
            .lock()
            .map_err(|_| StorageError::Internal("WAL lock poisoned".to_string()))?;
        if let Some(current) = guard.as_mut() {
            current.file.sync_data()?;
            current.unsynced = 0;
            self.syncs_total.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Rotate to a fresh log file, pruning the oldest beyond the retention cap.
    pub fn rotate(&self) -> StorageResult<()> {
        let mut guard = self
            .current
            .lock()
            .map_err(|_| StorageError::Internal("WAL lock poisoned".to_string()))?;
        self.rotate_locked(&mut guard)
    }

    fn rotate_locked(&self, guard: &mut Option<WalFile>) -> StorageResult<()> {
        if let Some(current) = guard.as_mut() {
            current.file.sync_data()?;
            debug!("Rotating WAL away from {}", current.log_id);
        }
        *guard = None;

        let (log_id, file, size) = self.create_log_file()?;
        *guard = Some(WalFile {
            log_id,
            file,
            unsynced: 0,
        });
        self.current_file_size.store(size, Ordering::Relaxed);
        self.rotations_total.fetch_add(1, Ordering::Relaxed);

        // Prune oldest files beyond the retention cap
        let mut files = self.list_wal_files()?;
        if files.len() > self.config.max_log_files {
            files.sort();
            let to_delete = files.len() - self.config.max_log_files;
            for log_id in files.iter().take(to_delete) {
                let path = self.log_file_path(log_id);
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Failed to delete old WAL file {}: {}", log_id, e);
                } else {
                    info!("Deleted old WAL file: {}", log_id);
                }
            }
        }

        Ok(())
    }

    fn open_fresh_file(&self) -> StorageResult<()> {
        let mut guard = self
            .current
            .lock()
            .map_err(|_| StorageError::Internal("WAL lock poisoned".to_string()))?;
        let (log_id, file, size) = self.create_log_file()?;
        info!("WAL file opened: {}", log_id);
        *guard = Some(WalFile {
            log_id,
            file,
            unsynced: 0,
        });
        self.current_file_size.store(size, Ordering::Relaxed);
        Ok(())
    }

    /// Create a new log file with its header written and synced.
    fn create_log_file(&self) -> StorageResult<(String, File, u64)> {
        let log_id = self.generate_log_id();
        let path = self.log_file_path(&log_id);

        let mut file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;

        let header = WalHeader {
            wal_id: log_id.clone(),
            created_at_ms: current_time_ms(),
            node_id: self.config.node_id.clone(),
            schema_version: WAL_SCHEMA_VERSION,
        };
        let body = bincode::serialize(&header)?;
        let mut framed = Vec::with_capacity(4 + body.len());
        framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
        framed.extend_from_slice(&body);
        file.write_all(&framed)?;
        file.sync_data()?;

        Ok((log_id, file, framed.len() as u64))
    }

    /// Read every fully-written record of a WAL file.
    ///
    /// A torn tail (partial length prefix or truncated body) ends the read
    /// with a warning; everything before it is returned.
    pub fn read_wal_file(&self, path: &Path) -> StorageResult<Vec<WalRecord>> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let header_bytes = match read_frame(&mut reader)? {
            Some(bytes) => bytes,
            None => {
                warn!("WAL file {:?} has no header, skipping", path);
                return Ok(Vec::new());
            }
        };
        let header: WalHeader = bincode::deserialize(&header_bytes).map_err(|e| {
            StorageError::InvalidFormat(format!("corrupt WAL header in {:?}: {}", path, e))
        })?;
        if header.schema_version != WAL_SCHEMA_VERSION {
            return Err(StorageError::InvalidFormat(format!(
                "unsupported WAL schema version {} in {}",
                header.schema_version, header.wal_id
            )));
        }
        debug!("Reading WAL file {} (node {})", header.wal_id, header.node_id);

        let mut records = Vec::new();
        loop {
            match read_frame(&mut reader) {
                Ok(Some(bytes)) => match bincode::deserialize::<WalRecord>(&bytes) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        warn!("Unparseable WAL record in {}, stopping replay: {}", header.wal_id, e);
                        break;
                    }
                },
                Ok(None) => break,
                Err(StorageError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    warn!("Torn record at tail of WAL file {}, stopping replay", header.wal_id);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        debug!("Read {} records from WAL file {}", records.len(), header.wal_id);
        Ok(records)
    }

    /// List WAL file ids in this log's directory (unsorted)
    pub fn list_wal_files(&self) -> StorageResult<Vec<String>> {
        let mut files = Vec::new();
        if !self.config.wal_dir.exists() {
            return Ok(files);
        }
        for entry in fs::read_dir(&self.config.wal_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_file() && path.extension().map(|e| e == "wal").unwrap_or(false) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    files.push(stem.to_string());
                }
            }
        }
        Ok(files)
    }

    /// Delete WAL files whose records are all covered by a snapshot.
    ///
    /// A file is eligible when its maximum sequence number is at most
    /// `sequence`. The current file is never deleted.
    pub fn truncate_before(&self, sequence: i64) -> StorageResult<()> {
        let current_id = {
            let guard = self
                .current
                .lock()
                .map_err(|_| StorageError::Internal("WAL lock poisoned".to_string()))?;
            guard.as_ref().map(|f| f.log_id.clone())
        };

        for log_id in self.list_wal_files()? {
            if Some(&log_id) == current_id.as_ref() {
                continue;
            }
            let path = self.log_file_path(&log_id);
            let records = match self.read_wal_file(&path) {
                Ok(records) => records,
                Err(e) => {
                    warn!("Skipping unreadable WAL file {} during truncation: {}", log_id, e);
                    continue;
                }
            };
            let max_seq = records.iter().map(|r| r.sequence).max().unwrap_or(0);
            if max_seq <= sequence {
                fs::remove_file(&path)?;
                info!("Truncated WAL file {} (max sequence {})", log_id, max_seq);
            }
        }
        Ok(())
    }

    /// Highest sequence number assigned so far
    pub fn last_sequence(&self) -> i64 {
        self.last_sequence.load(Ordering::SeqCst)
    }

    /// Statistics snapshot
    pub fn stats(&self) -> WalStats {
        WalStats {
            entries_written: self.entries_written.load(Ordering::Relaxed),
            syncs_total: self.syncs_total.load(Ordering::Relaxed),
            rotations_total: self.rotations_total.load(Ordering::Relaxed),
            last_sequence: self.last_sequence(),
            current_file_size: self.current_file_size.load(Ordering::Relaxed),
        }
    }

    /// Directory this WAL writes to
    pub fn wal_dir(&self) -> &Path {
        &self.config.wal_dir
    }

    pub fn log_file_path(&self, log_id: &str) -> PathBuf {
        self.config.wal_dir.join(format!("{}.wal", log_id))
    }

    fn generate_log_id(&self) -> String {
        // Millisecond timestamps can collide under rapid rotation; the
        // file counter keeps ids unique within the process.
        format!(
            "wal-{}-{}-{:04}",
            self.config.node_id,
            current_time_ms(),
            self.file_counter.fetch_add(1, Ordering::Relaxed)
        )
    }
}

/// Read one `[u32 len][bytes]` frame. `Ok(None)` signals a clean EOF.
fn read_frame<R: Read>(reader: &mut R) -> StorageResult<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(StorageError::Io(e)),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).map_err(StorageError::Io)?;
    Ok(Some(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_wal(temp_dir: &TempDir) -> Wal {
        let config = WalConfig {
            wal_dir: temp_dir.path().to_path_buf(),
            node_id: "node1".to_string(),
            ..WalConfig::default()
        };
        Wal::open(config).unwrap()
    }

    #[test]
    fn test_append_and_read_back() {
        let temp_dir = TempDir::new().unwrap();
        let wal = create_test_wal(&temp_dir);

        let seq1 = wal.append_set("k1", b"v1", 1, None).unwrap();
        let seq2 = wal.append_delete("k1", 1).unwrap();
        let seq3 = wal.append_cas("k2", b"v2", 2, Some(60), 1).unwrap();

        assert_eq!(seq1, 1);
        assert_eq!(seq2, 2);
        assert_eq!(seq3, 3);

        let files = wal.list_wal_files().unwrap();
        assert_eq!(files.len(), 1);

        let records = wal.read_wal_file(&wal.log_file_path(&files[0])).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].kind, WalRecordKind::Set);
        assert_eq!(records[0].key, "k1");
        assert_eq!(records[0].value, b"v1");
        assert_eq!(records[1].kind, WalRecordKind::Delete);
        assert!(records[1].value.is_empty());
        assert_eq!(records[2].kind, WalRecordKind::Cas);
        assert_eq!(records[2].expected_version, Some(1));
        assert_eq!(records[2].ttl_seconds, Some(60));
    }

    #[test]
    fn test_sequences_strictly_increase() {
        let temp_dir = TempDir::new().unwrap();
        let wal = create_test_wal(&temp_dir);

        let mut last = 0;
        for i in 0..50 {
            let seq = wal
                .append_set(&format!("k{}", i), b"v", 1, None)
                .unwrap();
            assert!(seq > last);
            last = seq;
        }
        assert_eq!(wal.last_sequence(), 50);
    }

    #[test]
    fn test_sequence_resumes_after_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let wal = create_test_wal(&temp_dir);
            for i in 0..10 {
                wal.append_set(&format!("k{}", i), b"v", 1, None).unwrap();
            }
        }

        let wal = create_test_wal(&temp_dir);
        assert_eq!(wal.last_sequence(), 10);
        let seq = wal.append_set("k", b"v", 1, None).unwrap();
        assert_eq!(seq, 11);
    }

    #[test]
    fn test_rotation_by_size() {
        let temp_dir = TempDir::new().unwrap();
        let config = WalConfig {
            wal_dir: temp_dir.path().to_path_buf(),
            node_id: "node1".to_string(),
            max_file_size_bytes: 256,
            max_log_files: 10,
            ..WalConfig::default()
        };
        let wal = Wal::open(config).unwrap();

        for i in 0..20 {
            wal.append_set(&format!("key{}", i), &[0u8; 64], 1, None).unwrap();
        }

        let files = wal.list_wal_files().unwrap();
        assert!(files.len() > 1, "expected rotation, got {} file(s)", files.len());

        // All records across all files are still readable and unique
        let mut seqs = Vec::new();
        for log_id in files {
            for record in wal.read_wal_file(&wal.log_file_path(&log_id)).unwrap() {
                seqs.push(record.sequence);
            }
        }
        seqs.sort();
        assert_eq!(seqs.len(), 20);
        assert_eq!(seqs, (1..=20).collect::<Vec<_>>());
    }

    #[test]
    fn test_retention_prunes_oldest() {
        let temp_dir = TempDir::new().unwrap();
        let config = WalConfig {
            wal_dir: temp_dir.path().to_path_buf(),
            node_id: "node1".to_string(),
            max_file_size_bytes: 128,
            max_log_files: 3,
            ..WalConfig::default()
        };
        let wal = Wal::open(config).unwrap();

        for i in 0..40 {
            wal.append_set(&format!("key{}", i), &[0u8; 64], 1, None).unwrap();
        }

        let files = wal.list_wal_files().unwrap();
        assert!(files.len() <= 4); // retention cap + the freshly rotated file
    }

    #[test]
    fn test_truncate_before_sequence() {
        let temp_dir = TempDir::new().unwrap();
        let config = WalConfig {
            wal_dir: temp_dir.path().to_path_buf(),
            node_id: "node1".to_string(),
            max_file_size_bytes: 1024 * 1024,
            ..WalConfig::default()
        };
        let wal = Wal::open(config).unwrap();

        for i in 0..5 {
            wal.append_set(&format!("k{}", i), b"v", 1, None).unwrap();
        }
        // Rotate so the first file (sequences 1..=5) becomes immutable
        wal.rotate().unwrap();
        for i in 5..10 {
            wal.append_set(&format!("k{}", i), b"v", 1, None).unwrap();
        }

        assert_eq!(wal.list_wal_files().unwrap().len(), 2);

        // Everything up to sequence 5 is covered by a snapshot
        wal.truncate_before(5).unwrap();

        let files = wal.list_wal_files().unwrap();
        assert_eq!(files.len(), 1);
        let remaining = wal.read_wal_file(&wal.log_file_path(&files[0])).unwrap();
        assert!(remaining.iter().all(|r| r.sequence > 5));
    }

    #[test]
    fn test_torn_tail_stops_cleanly() {
        let temp_dir = TempDir::new().unwrap();
        let wal = create_test_wal(&temp_dir);

        for i in 0..3 {
            wal.append_set(&format!("k{}", i), b"value", 1, None).unwrap();
        }

        // Simulate a crash mid-append: claim a record longer than what follows
        let files = wal.list_wal_files().unwrap();
        let path = wal.log_file_path(&files[0]);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&(999u32).to_le_bytes()).unwrap();
        file.write_all(b"torn").unwrap();
        file.sync_data().unwrap();

        let records = wal.read_wal_file(&path).unwrap();
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn test_stats() {
        let temp_dir = TempDir::new().unwrap();
        let wal = create_test_wal(&temp_dir);

        wal.append_set("k", b"v", 1, None).unwrap();
        wal.append_delete("k", 1).unwrap();

        let stats = wal.stats();
        assert_eq!(stats.entries_written, 2);
        assert_eq!(stats.last_sequence, 2);
        assert!(stats.syncs_total >= 2);
        assert!(stats.current_file_size > 0);
    }
}
