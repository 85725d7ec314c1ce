//! 会话状态回调
//!
//! 进度行按时间节流，终止行（Completed / Stopped / Error）总是立即发出且只发一次。

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// 默认进度回调间隔（毫秒）
pub const DEFAULT_STATUS_INTERVAL_MS: u64 = 1000;

/// 状态回调：(会话 ID, 状态行)
pub type StatusCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// 状态更新（通道回调使用）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub session_id: String,
    pub line: String,
}

/// 把状态行转发到 mpsc 通道，接收端关闭后静默丢弃
pub fn channel_callback(tx: mpsc::UnboundedSender<StatusUpdate>) -> StatusCallback {
    Arc::new(move |session_id: &str, line: &str| {
        let _ = tx.send(StatusUpdate {
            session_id: session_id.to_string(),
            line: line.to_string(),
        });
    })
}

/// 进度节流器
#[derive(Debug)]
pub struct ProgressThrottler {
    last_emit: Mutex<Option<Instant>>,
    interval: Duration,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_emit: Mutex::new(None),
            interval,
        }
    }

    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 距离上次发布超过间隔时返回 true 并记录时间
    pub fn should_emit(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last_emit.lock();
        match *last {
            Some(prev) if now.duration_since(prev) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    pub fn force_emit(&self) {
        *self.last_emit.lock() = Some(Instant::now());
    }

    pub fn reset(&self) {
        *self.last_emit.lock() = None;
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_STATUS_INTERVAL_MS)
    }
}

/// 单个会话的状态上报器
pub struct StatusReporter {
    session_id: String,
    callback: Option<StatusCallback>,
    throttler: ProgressThrottler,
    finished: AtomicBool,
}

impl StatusReporter {
    pub fn new(session_id: impl Into<String>, callback: Option<StatusCallback>, interval: Duration) -> Self {
        Self {
            session_id: session_id.into(),
            callback,
            throttler: ProgressThrottler::new(interval),
            finished: AtomicBool::new(false),
        }
    }

    /// 节流的进度行
    pub fn progress(&self, line: impl AsRef<str>) {
        if self.finished.load(Ordering::SeqCst) || !self.throttler.should_emit() {
            return;
        }
        self.emit(line.as_ref());
    }

    /// 立即发出（状态切换等）
    pub fn report(&self, line: impl AsRef<str>) {
        if self.finished.load(Ordering::SeqCst) {
            return;
        }
        self.throttler.force_emit();
        self.emit(line.as_ref());
    }

    /// 终止行，之后的所有上报都被忽略
    pub fn finish(&self, line: impl AsRef<str>) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.emit(line.as_ref());
    }

    fn emit(&self, line: &str) {
        tracing::debug!("[{}] {}", self.session_id, line);
        if let Some(callback) = &self.callback {
            callback(&self.session_id, line);
        }
    }
}
