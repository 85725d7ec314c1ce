// 转发会话定义

use super::filter::ContentFilter;
use crate::client::{IterDirection, MessageId};
use crate::config::DownloadConfig;
use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

/// 投递方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// 带来源转发
    Forward,
    /// 复制为新消息（不带来源）
    Copy,
    /// 下载后重新上传
    #[default]
    DownloadUpload,
    /// 只下载到本地
    LocalDownload,
}

impl TransferMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Forward => "forward",
            TransferMode::Copy => "copy",
            TransferMode::DownloadUpload => "download_upload",
            TransferMode::LocalDownload => "local_download",
        }
    }

    /// 是否需要目标会话
    pub fn needs_target(&self) -> bool {
        !matches!(self, TransferMode::LocalDownload)
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "forward" => Ok(TransferMode::Forward),
            "copy" => Ok(TransferMode::Copy),
            "download_upload" => Ok(TransferMode::DownloadUpload),
            "local_download" | "download" => Ok(TransferMode::LocalDownload),
            other => Err(EngineError::Config(format!("未知的转发方式: {}", other))),
        }
    }
}

/// 进度记录的归属
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressScope {
    /// 同一对源/目标的所有会话共享
    #[default]
    Pair,
    /// 会话独享
    Session,
}

/// 本地下载目标
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadTarget {
    pub dir: PathBuf,
    /// 是否按内容类别分子目录
    pub group_by_category: bool,
}

impl DownloadTarget {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            group_by_category: true,
        }
    }

    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            dir: config.dir.clone(),
            group_by_category: config.group_by_category,
        }
    }
}

/// 会话配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// 源会话引用
    pub source: String,
    /// 目标会话引用（本地下载时为空）
    pub target: Option<String>,
    /// 显式指定的续传起点，优先于已保存的游标（0 表示从头开始）
    pub resume_from: Option<MessageId>,
    pub filter: ContentFilter,
    pub mode: TransferMode,
    pub direction: IterDirection,
    pub progress_scope: ProgressScope,
    pub download: Option<DownloadTarget>,
}

impl SessionConfig {
    /// 会话到会话的转发
    pub fn transfer(source: impl Into<String>, target: impl Into<String>, mode: TransferMode) -> Self {
        Self {
            source: source.into(),
            target: Some(target.into()),
            resume_from: None,
            filter: ContentFilter::default(),
            mode,
            direction: IterDirection::default(),
            progress_scope: ProgressScope::default(),
            download: None,
        }
    }

    /// 下载到本地目录
    pub fn download(source: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self::download_to(source, DownloadTarget::new(dir))
    }

    pub fn download_to(source: impl Into<String>, target: DownloadTarget) -> Self {
        Self {
            source: source.into(),
            target: None,
            resume_from: None,
            filter: ContentFilter::default(),
            mode: TransferMode::LocalDownload,
            direction: IterDirection::default(),
            progress_scope: ProgressScope::default(),
            download: Some(target),
        }
    }

    pub fn with_filter(mut self, filter: ContentFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_resume_from(mut self, id: MessageId) -> Self {
        self.resume_from = Some(id);
        self
    }

    pub fn with_direction(mut self, direction: IterDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_progress_scope(mut self, scope: ProgressScope) -> Self {
        self.progress_scope = scope;
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.source.trim().is_empty() {
            return Err(EngineError::Config("源会话不能为空".to_string()));
        }
        if self.mode.needs_target()
            && self.target.as_deref().map_or(true, |t| t.trim().is_empty())
        {
            return Err(EngineError::Config(format!(
                "{} 模式需要目标会话",
                self.mode
            )));
        }
        if self.mode == TransferMode::LocalDownload && self.download.is_none() {
            return Err(EngineError::Config("本地下载需要指定保存目录".to_string()));
        }
        if self.resume_from.is_some_and(|id| id < 0) {
            return Err(EngineError::Config("续传起点不能为负数".to_string()));
        }
        Ok(())
    }
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Resolving,
    Scanning,
    Transferring,
    Completed,
    Stopped,
    Failed,
}

impl SessionStatus {
    pub fn description(&self) -> &'static str {
        match self {
            SessionStatus::Created => "已创建",
            SessionStatus::Resolving => "解析会话",
            SessionStatus::Scanning => "加载进度",
            SessionStatus::Transferring => "转发中",
            SessionStatus::Completed => "已完成",
            SessionStatus::Stopped => "已停止",
            SessionStatus::Failed => "失败",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Stopped | SessionStatus::Failed
        )
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Created, Resolving) => true,
            (Resolving, Scanning) => true,
            (Scanning, Transferring) => true,
            (Transferring, Completed) => true,
            (s, Stopped | Failed) => !s.is_terminal(),
            _ => false,
        }
    }
}

/// 会话计数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub sent: u64,
    pub errored: u64,
    /// 已在进度中的消息
    pub duplicates: u64,
    /// 被内容过滤拒绝
    pub filtered: u64,
    /// 服务消息和空消息
    pub service: u64,
    /// 限流后的重试次数
    pub retried: u64,
    /// 源会话的消息总数（客户端无法提供时为空）
    pub total: Option<u64>,
}

impl SessionStats {
    pub fn skipped(&self) -> u64 {
        self.duplicates + self.filtered + self.service
    }

    /// 已处理的消息数（发送、跳过和失败之和）
    pub fn processed(&self) -> u64 {
        self.sent + self.skipped() + self.errored
    }
}

/// 对外查询的统计快照
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub sent: u64,
    pub skipped: u64,
    pub errored: u64,
    pub processed: u64,
    pub total: Option<u64>,
    pub elapsed: Duration,
    /// 平均发送速率（条/秒）
    pub messages_per_second: f64,
}

/// 转发会话
#[derive(Debug, Clone, Serialize)]
pub struct TransferSession {
    pub id: String,
    pub config: SessionConfig,
    pub status: SessionStatus,
    pub stats: SessionStats,
    pub error: Option<String>,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub updated_at: i64,
    #[serde(skip)]
    cancel: CancellationToken,
    #[serde(skip)]
    started: Option<Instant>,
    #[serde(skip)]
    finished: Option<Instant>,
}

impl TransferSession {
    pub fn new(config: SessionConfig) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            config,
            status: SessionStatus::Created,
            stats: SessionStats::default(),
            error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
            cancel: CancellationToken::new(),
            started: None,
            finished: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().timestamp();
    }

    /// 切换状态，非法切换只记录日志
    fn transition(&mut self, next: SessionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            warn!(
                "会话 {} 忽略非法状态切换: {:?} -> {:?}",
                self.id, self.status, next
            );
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(chrono::Utc::now().timestamp());
            self.finished = Some(Instant::now());
        }
        self.touch();
        true
    }

    pub fn mark_resolving(&mut self) -> bool {
        let ok = self.transition(SessionStatus::Resolving);
        if ok {
            self.started_at = Some(chrono::Utc::now().timestamp());
            self.started = Some(Instant::now());
        }
        ok
    }

    pub fn mark_scanning(&mut self) -> bool {
        self.transition(SessionStatus::Scanning)
    }

    pub fn mark_transferring(&mut self) -> bool {
        self.transition(SessionStatus::Transferring)
    }

    pub fn mark_completed(&mut self) -> bool {
        self.transition(SessionStatus::Completed)
    }

    pub fn mark_stopped(&mut self) -> bool {
        self.transition(SessionStatus::Stopped)
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) -> bool {
        let ok = self.transition(SessionStatus::Failed);
        if ok {
            self.error = Some(error.into());
        }
        ok
    }

    /// 请求停止（非阻塞，执行器在下一个检查点响应）
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn elapsed(&self) -> Duration {
        match (self.started, self.finished) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        let elapsed = self.elapsed();
        let secs = elapsed.as_secs_f64();
        StatsSnapshot {
            sent: self.stats.sent,
            skipped: self.stats.skipped(),
            errored: self.stats.errored,
            processed: self.stats.processed(),
            total: self.stats.total,
            elapsed,
            messages_per_second: if secs > 0.0 {
                self.stats.sent as f64 / secs
            } else {
                0.0
            },
        }
    }
}
