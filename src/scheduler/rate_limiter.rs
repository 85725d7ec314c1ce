//! 全局发送速率限制器
//!
//! 在任意 60 秒滑动窗口内最多允许 `max_per_window` 次出站操作。
//! 窗口已满时挂起等待最早一次操作滑出窗口，从不返回错误。

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// 默认每分钟最大发送数
pub const DEFAULT_MAX_PER_MINUTE: u32 = 20;

/// 默认窗口长度
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// 滑动窗口限流器
#[derive(Debug)]
pub struct RateLimiter {
    max_per_window: u32,
    window: Duration,
    /// 排队锁，等待名额期间一直持有
    queue: tokio::sync::Mutex<()>,
    /// 窗口内每次放行的时刻，队首最早（只做短暂的同步访问）
    log: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        Self::with_window(max_per_minute, DEFAULT_WINDOW)
    }

    pub fn with_window(max_per_window: u32, window: Duration) -> Self {
        let max_per_window = max_per_window.max(1);
        Self {
            max_per_window,
            window,
            queue: tokio::sync::Mutex::new(()),
            log: Mutex::new(VecDeque::with_capacity(max_per_window as usize)),
        }
    }

    pub fn max_per_window(&self) -> u32 {
        self.max_per_window
    }

    /// 等待直到可以再发送一次，并占用一个名额
    ///
    /// 等待期间持有排队锁，后来的调用者按到达顺序排队
    pub async fn check_and_consume(&self) {
        let _queue = self.queue.lock().await;
        loop {
            let now = Instant::now();
            let oldest = {
                let mut log = self.log.lock();
                Self::evict_expired(&mut log, now, self.window);
                if (log.len() as u32) < self.max_per_window {
                    log.push_back(now);
                    return;
                }
                log.front().copied()
            };

            let Some(oldest) = oldest else {
                continue;
            };
            let wake_at = oldest + self.window;
            let wait = wake_at.saturating_duration_since(now);
            if wait >= Duration::from_secs(1) {
                info!(
                    "已达到速率上限 {}/{}s，等待 {:.1}s",
                    self.max_per_window,
                    self.window.as_secs(),
                    wait.as_secs_f64()
                );
            } else {
                debug!("速率窗口已满，等待 {}ms", wait.as_millis());
            }
            tokio::time::sleep_until(wake_at).await;
        }
    }

    /// 当前窗口内已使用的名额（不等待排队中的调用者）
    pub fn used_in_window(&self) -> u32 {
        let mut log = self.log.lock();
        Self::evict_expired(&mut log, Instant::now(), self.window);
        log.len() as u32
    }

    fn evict_expired(log: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(front) = log.front() {
            if now.duration_since(*front) >= window {
                log.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PER_MINUTE)
    }
}
