// 进度记录类型定义

use crate::client::{IterDirection, MessageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

/// 已发送集合的默认上限
pub const DEFAULT_MAX_PROGRESS_ITEMS: usize = 10_000;

/// 单个转发方向的进度
///
/// 已发送集合按插入顺序保存，超出上限时淘汰最早插入的 ID
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "ProgressRecordFile", into = "ProgressRecordFile")]
pub struct ProgressRecord {
    sent_order: VecDeque<MessageId>,
    sent_index: HashSet<MessageId>,
    /// 从旧到新遍历时最后处理的消息 ID（0 表示从头开始）
    ///
    /// 从新到旧的遍历不推进该游标，只写入已发送集合
    pub last_message_id: MessageId,
    pub total_sent: u64,
    pub total_skipped: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

impl ProgressRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.sent_index.contains(&id)
    }

    /// 记录一条已发送消息
    ///
    /// 已存在时只刷新时间戳并返回 false
    pub fn insert_sent(&mut self, id: MessageId, cap: usize, direction: IterDirection) -> bool {
        self.touch();
        self.advance_cursor(id, direction);
        if !self.sent_index.insert(id) {
            return false;
        }
        self.sent_order.push_back(id);
        self.total_sent += 1;
        self.trim_to(cap);
        true
    }

    /// 记录一条被过滤/跳过的消息
    pub fn note_skipped(&mut self, id: MessageId, direction: IterDirection) {
        self.total_skipped += 1;
        self.advance_cursor(id, direction);
        self.touch();
    }

    /// 推进游标（只前进不后退，NewestFirst 不改变游标）
    pub fn advance_cursor(&mut self, id: MessageId, direction: IterDirection) {
        if direction == IterDirection::OldestFirst && id > self.last_message_id {
            self.last_message_id = id;
        }
    }

    /// 续传起点，None 表示从头开始
    pub fn cursor(&self) -> Option<MessageId> {
        (self.last_message_id > 0).then_some(self.last_message_id)
    }

    pub fn sent_count(&self) -> usize {
        self.sent_order.len()
    }

    /// 按插入顺序遍历已发送 ID
    pub fn sent_ids(&self) -> impl Iterator<Item = MessageId> + '_ {
        self.sent_order.iter().copied()
    }

    /// 只保留最近插入的 cap 个 ID
    pub fn trim_to(&mut self, cap: usize) {
        while self.sent_order.len() > cap {
            if let Some(oldest) = self.sent_order.pop_front() {
                self.sent_index.remove(&oldest);
            }
        }
    }

    pub fn touch(&mut self) {
        self.last_updated = Some(Utc::now());
    }
}

/// 磁盘上的 JSON 格式
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgressRecordFile {
    #[serde(default)]
    sent_message_ids: Vec<MessageId>,
    #[serde(default)]
    last_message_id: MessageId,
    #[serde(default)]
    total_sent: u64,
    #[serde(default)]
    total_skipped: u64,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
}

impl From<ProgressRecordFile> for ProgressRecord {
    fn from(file: ProgressRecordFile) -> Self {
        let mut sent_order = VecDeque::with_capacity(file.sent_message_ids.len());
        let mut sent_index = HashSet::with_capacity(file.sent_message_ids.len());
        for id in file.sent_message_ids {
            if sent_index.insert(id) {
                sent_order.push_back(id);
            }
        }
        Self {
            sent_order,
            sent_index,
            last_message_id: file.last_message_id,
            total_sent: file.total_sent,
            total_skipped: file.total_skipped,
            last_updated: file.last_updated,
        }
    }
}

impl From<ProgressRecord> for ProgressRecordFile {
    fn from(record: ProgressRecord) -> Self {
        Self {
            sent_message_ids: record.sent_order.into_iter().collect(),
            last_message_id: record.last_message_id,
            total_sent: record.total_sent,
            total_skipped: record.total_skipped,
            last_updated: record.last_updated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const FORWARD: IterDirection = IterDirection::OldestFirst;

    #[test]
    fn test_insert_is_idempotent() {
        let mut record = ProgressRecord::new();
        assert!(record.insert_sent(5, 10, FORWARD));
        assert!(!record.insert_sent(5, 10, FORWARD));
        assert_eq!(record.total_sent, 1);
        assert_eq!(record.sent_count(), 1);
        assert_eq!(record.last_message_id, 5);
        assert!(record.last_updated.is_some());
    }

    #[test]
    fn test_cap_keeps_most_recent() {
        let mut record = ProgressRecord::new();
        for id in 1..=10_050 {
            record.insert_sent(id, DEFAULT_MAX_PROGRESS_ITEMS, FORWARD);
        }
        assert_eq!(record.sent_count(), 10_000);
        assert!(!record.contains(50));
        assert!(record.contains(51));
        assert!(record.contains(10_050));
        assert_eq!(record.sent_ids().next(), Some(51));
        assert_eq!(record.total_sent, 10_050);
    }

    #[test]
    fn test_cursor_never_moves_backwards() {
        let mut record = ProgressRecord::new();
        assert_eq!(record.cursor(), None);
        record.note_skipped(9, FORWARD);
        record.advance_cursor(3, FORWARD);
        assert_eq!(record.cursor(), Some(9));
        assert_eq!(record.total_skipped, 1);
    }

    #[test]
    fn test_newest_first_keeps_cursor() {
        let mut record = ProgressRecord::new();
        record.insert_sent(4, 10, FORWARD);
        assert!(record.insert_sent(10, 10, IterDirection::NewestFirst));
        record.note_skipped(9, IterDirection::NewestFirst);
        record.advance_cursor(8, IterDirection::NewestFirst);
        assert_eq!(record.cursor(), Some(4));
        assert!(record.contains(10));
        assert_eq!(record.total_sent, 2);
        assert_eq!(record.total_skipped, 1);
    }

    #[test]
    fn test_json_field_names() {
        let mut record = ProgressRecord::new();
        record.insert_sent(7, 10, FORWARD);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["sentMessageIds"], serde_json::json!([7]));
        assert_eq!(json["lastMessageId"], 7);
        assert_eq!(json["totalSent"], 1);
        assert_eq!(json["totalSkipped"], 0);
        assert!(json["lastUpdated"].is_string());
    }

    #[test]
    fn test_parse_partial_and_duplicate_ids() {
        let record: ProgressRecord =
            serde_json::from_str(r#"{"sentMessageIds":[1,2,2,3],"lastMessageId":3}"#).unwrap();
        assert_eq!(record.sent_ids().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(record.total_sent, 0);
        assert!(record.last_updated.is_none());
    }

    proptest! {
        #[test]
        fn prop_cap_holds_newest(cap in 1usize..50, ids in proptest::collection::vec(1i64..200, 0..300)) {
            let mut record = ProgressRecord::new();
            for id in &ids {
                record.insert_sent(*id, cap, FORWARD);
                prop_assert!(record.sent_count() <= cap);
            }
            if let Some(last) = ids.last() {
                prop_assert!(record.contains(*last));
            }
        }
    }
}
