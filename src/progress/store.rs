//! 进度存储
//!
//! 每个转发方向一个 JSON 文件。内存中的记录是权威状态，
//! 写盘失败只记录日志，不影响转发。
//!
//! 同一 key 的读-改-写由各自的异步锁串行化，写盘采用临时文件 + 原子重命名。

use super::types::{ProgressRecord, DEFAULT_MAX_PROGRESS_ITEMS};
use crate::client::{ChatId, IterDirection, MessageId};
use crate::error::{EngineError, EngineResult};
use chrono::Utc;
use dashmap::DashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const PROGRESS_EXTENSION: &str = "json";

/// 进度记录的 key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProgressKey {
    /// 源 -> 目标（同一对会话的所有任务共享）
    Pair { source_id: ChatId, target_id: ChatId },
    /// 单个会话独享
    Session(String),
    /// 本地下载
    Download { source_id: ChatId },
}

impl ProgressKey {
    pub fn pair(source_id: ChatId, target_id: ChatId) -> Self {
        ProgressKey::Pair { source_id, target_id }
    }

    pub fn file_stem(&self) -> String {
        match self {
            ProgressKey::Pair { source_id, target_id } => {
                format!("channel_{}_to_{}", source_id, target_id)
            }
            ProgressKey::Session(id) => format!("session_{}", id),
            ProgressKey::Download { source_id } => format!("download_{}", source_id),
        }
    }
}

impl fmt::Display for ProgressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_stem())
    }
}

/// 缓存槽位，None 表示尚未从磁盘加载
type Slot = Arc<Mutex<Option<ProgressRecord>>>;

/// 进度存储
#[derive(Debug)]
pub struct ProgressStore {
    dir: PathBuf,
    max_items: usize,
    entries: DashMap<String, Slot>,
}

impl ProgressStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_max_items(dir, DEFAULT_MAX_PROGRESS_ITEMS)
    }

    pub fn with_max_items(dir: impl Into<PathBuf>, max_items: usize) -> Self {
        Self {
            dir: dir.into(),
            max_items: max_items.max(1),
            entries: DashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_items(&self) -> usize {
        self.max_items
    }

    pub fn path_for(&self, key: &ProgressKey) -> PathBuf {
        self.dir
            .join(format!("{}.{}", key.file_stem(), PROGRESS_EXTENSION))
    }

    /// 读取进度，缺失或损坏时返回新记录
    pub async fn load(&self, key: &ProgressKey) -> ProgressRecord {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        self.ensure_loaded(key, &mut guard).clone()
    }

    /// 用给定记录覆盖并写盘
    pub async fn save(&self, key: &ProgressKey, record: ProgressRecord) -> EngineResult<()> {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        let mut record = record;
        record.trim_to(self.max_items);
        let result = self.write(key, &record);
        *guard = Some(record);
        result
    }

    /// 记录已发送消息（幂等），返回是否为新记录
    pub async fn record_sent(&self, key: &ProgressKey, id: MessageId, direction: IterDirection) -> bool {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        let max_items = self.max_items;
        self.ensure_loaded(key, &mut guard)
            .insert_sent(id, max_items, direction)
    }

    /// 记录被过滤的消息
    pub async fn record_skipped(&self, key: &ProgressKey, id: MessageId, direction: IterDirection) {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        self.ensure_loaded(key, &mut guard).note_skipped(id, direction);
    }

    /// 只推进游标
    pub async fn advance_cursor(&self, key: &ProgressKey, id: MessageId, direction: IterDirection) {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        let record = self.ensure_loaded(key, &mut guard);
        record.advance_cursor(id, direction);
        record.touch();
    }

    pub async fn contains(&self, key: &ProgressKey, id: MessageId) -> bool {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        self.ensure_loaded(key, &mut guard).contains(id)
    }

    /// 把内存中的记录写盘（未加载过则什么也不做）
    pub async fn flush(&self, key: &ProgressKey) -> EngineResult<()> {
        let slot = self.slot(key);
        let guard = slot.lock().await;
        match guard.as_ref() {
            Some(record) => self.write(key, record),
            None => Ok(()),
        }
    }

    /// 删除进度，返回文件是否存在
    pub async fn clear(&self, key: &ProgressKey) -> EngineResult<bool> {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        *guard = Some(ProgressRecord::new());
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("已清除进度: {}", key);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(persistence_error(key, e)),
        }
    }

    /// 列出磁盘上的全部进度（跳过无法解析的文件）
    pub fn list_all(&self) -> EngineResult<Vec<(String, ProgressRecord)>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.dir).map_err(|e| EngineError::Persistence {
            key: self.dir.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(stem) = progress_stem(&path) else {
                continue;
            };
            match read_record(&path) {
                Ok(record) => records.push((stem, record)),
                Err(e) => warn!("跳过无效进度文件 {:?}: {}", path, e),
            }
        }
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }

    /// 删除超过 days 天未更新的进度文件，返回删除数量
    pub fn cleanup_older_than(&self, days: u32) -> EngineResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(days as i64);
        let mut removed = 0;

        for (stem, record) in self.list_all()? {
            let expired = match record.last_updated {
                Some(updated) => updated < cutoff,
                None => false,
            };
            if !expired {
                continue;
            }

            let path = self
                .dir
                .join(format!("{}.{}", stem, PROGRESS_EXTENSION));
            match fs::remove_file(&path) {
                Ok(()) => {
                    self.entries.remove(&stem);
                    removed += 1;
                    debug!("已删除过期进度: {:?}", path);
                }
                Err(e) => warn!("删除过期进度失败 {:?}: {}", path, e),
            }
        }

        if removed > 0 {
            info!("已清理 {} 个超过 {} 天的进度文件", removed, days);
        }
        Ok(removed)
    }

    fn slot(&self, key: &ProgressKey) -> Slot {
        self.entries
            .entry(key.file_stem())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .value()
            .clone()
    }

    fn ensure_loaded<'a>(
        &self,
        key: &ProgressKey,
        slot: &'a mut Option<ProgressRecord>,
    ) -> &'a mut ProgressRecord {
        slot.get_or_insert_with(|| self.read_or_fresh(key))
    }

    fn read_or_fresh(&self, key: &ProgressKey) -> ProgressRecord {
        let path = self.path_for(key);
        if !path.exists() {
            return ProgressRecord::new();
        }
        match read_record(&path) {
            Ok(mut record) => {
                record.trim_to(self.max_items);
                debug!(
                    "已加载进度 {}: {} 条已发送, 游标 {}",
                    key,
                    record.sent_count(),
                    record.last_message_id
                );
                record
            }
            Err(e) => {
                warn!("进度文件损坏 {:?}: {}，从头开始", path, e);
                ProgressRecord::new()
            }
        }
    }

    fn write(&self, key: &ProgressKey, record: &ProgressRecord) -> EngineResult<()> {
        let path = self.path_for(key);
        write_record(&path, record).map_err(|e| {
            warn!("保存进度失败 {:?}: {}", path, e);
            persistence_error(key, e)
        })?;
        debug!("已保存进度 {}: 共发送 {}", key, record.total_sent);
        Ok(())
    }
}

fn persistence_error(key: &ProgressKey, e: io::Error) -> EngineError {
    EngineError::Persistence {
        key: key.to_string(),
        reason: e.to_string(),
    }
}

fn progress_stem(path: &Path) -> Option<String> {
    if !path.is_file() || path.extension()? != PROGRESS_EXTENSION {
        return None;
    }
    path.file_stem()?.to_str().map(str::to_string)
}

fn read_record(path: &Path) -> io::Result<ProgressRecord> {
    let reader = BufReader::new(File::open(path)?);
    serde_json::from_reader(reader).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn write_record(path: &Path, record: &ProgressRecord) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    // 先写临时文件再重命名，中断时不会留下半个文件
    let temp_path = path.with_extension("json.tmp");
    let mut writer = BufWriter::new(File::create(&temp_path)?);
    serde_json::to_writer_pretty(&mut writer, record)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.flush()?;
    drop(writer);

    fs::rename(&temp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const FORWARD: IterDirection = IterDirection::OldestFirst;

    #[test]
    fn test_key_file_names() {
        assert_eq!(ProgressKey::pair(-100, 42).file_stem(), "channel_-100_to_42");
        assert_eq!(
            ProgressKey::Session("transfer_ab".into()).file_stem(),
            "session_transfer_ab"
        );
        assert_eq!(
            ProgressKey::Download { source_id: 7 }.file_stem(),
            "download_7"
        );
    }

    #[tokio::test]
    async fn test_missing_file_yields_fresh_record() {
        let dir = TempDir::new().unwrap();
        let store = ProgressStore::new(dir.path());
        let record = store.load(&ProgressKey::pair(1, 2)).await;
        assert_eq!(record, ProgressRecord::new());
    }

    #[tokio::test]
    async fn test_record_and_flush_round_trip() {
        let dir = TempDir::new().unwrap();
        let key = ProgressKey::pair(1, 2);
        {
            let store = ProgressStore::new(dir.path());
            assert!(store.record_sent(&key, 10, FORWARD).await);
            assert!(!store.record_sent(&key, 10, FORWARD).await);
            store.record_skipped(&key, 11, FORWARD).await;
            store.flush(&key).await.unwrap();
        }

        let store = ProgressStore::new(dir.path());
        let record = store.load(&key).await;
        assert!(record.contains(10));
        assert_eq!(record.total_sent, 1);
        assert_eq!(record.total_skipped, 1);
        assert_eq!(record.last_message_id, 11);
        assert!(!store.path_for(&key).with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_replaced() {
        let dir = TempDir::new().unwrap();
        let store = ProgressStore::new(dir.path());
        let key = ProgressKey::pair(3, 4);
        fs::write(store.path_for(&key), b"{not json").unwrap();

        let record = store.load(&key).await;
        assert_eq!(record.sent_count(), 0);

        store.record_sent(&key, 1, FORWARD).await;
        store.flush(&key).await.unwrap();
        let reread = read_record(&store.path_for(&key)).unwrap();
        assert!(reread.contains(1));
    }

    #[tokio::test]
    async fn test_load_applies_cap() {
        let dir = TempDir::new().unwrap();
        let key = ProgressKey::pair(5, 6);
        let big = ProgressStore::with_max_items(dir.path(), 100);
        for id in 1..=50 {
            big.record_sent(&key, id, FORWARD).await;
        }
        big.flush(&key).await.unwrap();

        let small = ProgressStore::with_max_items(dir.path(), 20);
        let record = small.load(&key).await;
        assert_eq!(record.sent_count(), 20);
        assert!(record.contains(50));
        assert!(!record.contains(30));
    }

    #[tokio::test]
    async fn test_clear_and_list() {
        let dir = TempDir::new().unwrap();
        let store = ProgressStore::new(dir.path());
        let a = ProgressKey::pair(1, 2);
        let b = ProgressKey::Download { source_id: 9 };
        store.record_sent(&a, 1, FORWARD).await;
        store.record_sent(&b, 2, FORWARD).await;
        store.flush(&a).await.unwrap();
        store.flush(&b).await.unwrap();
        fs::write(dir.path().join("garbage.json"), b"[").unwrap();

        let listed: Vec<String> = store.list_all().unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(listed, vec!["channel_1_to_2", "download_9"]);

        assert!(store.clear(&a).await.unwrap());
        assert!(!store.clear(&a).await.unwrap());
        assert!(!store.contains(&a, 1).await);
    }

    #[tokio::test]
    async fn test_concurrent_record_sent_is_serialised() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ProgressStore::new(dir.path()));
        let key = ProgressKey::pair(1, 2);
        let mut handles = Vec::new();
        for id in 0..50 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move { store.record_sent(&key, id % 25, FORWARD).await }));
        }
        let mut fresh = 0;
        for handle in handles {
            if handle.await.unwrap() {
                fresh += 1;
            }
        }
        assert_eq!(fresh, 25);
        assert_eq!(store.load(&key).await.total_sent, 25);
    }

    #[tokio::test]
    async fn test_cleanup_older_than() {
        let dir = TempDir::new().unwrap();
        let store = ProgressStore::new(dir.path());
        let old = ProgressKey::pair(1, 2);
        let fresh = ProgressKey::pair(3, 4);

        let mut stale = ProgressRecord::new();
        stale.insert_sent(1, 10, FORWARD);
        stale.last_updated = Some(Utc::now() - chrono::Duration::days(45));
        store.save(&old, stale).await.unwrap();
        store.record_sent(&fresh, 1, FORWARD).await;
        store.flush(&fresh).await.unwrap();

        assert_eq!(store.cleanup_older_than(30).unwrap(), 1);
        assert!(!store.path_for(&old).exists());
        assert!(store.path_for(&fresh).exists());
    }
}
