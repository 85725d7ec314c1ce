//! 多账号轮询与冷却
//!
//! 客户端按传入顺序轮询，触发 FloodWait 的账号在冷却期内被跳过。

use crate::client::ClientHandle;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// 默认冷却抖动上限（毫秒）
pub const DEFAULT_COOLDOWN_JITTER_MS: u64 = 2000;

/// 客户端轮询池
#[derive(Debug)]
pub struct ClientPool {
    /// 下一次轮询的起始位置
    cursor: Mutex<usize>,
    /// client_id -> 冷却结束时刻
    cooldowns: DashMap<String, Instant>,
    jitter_max_ms: u64,
}

impl ClientPool {
    pub fn new(jitter_max_ms: u64) -> Self {
        Self {
            cursor: Mutex::new(0),
            cooldowns: DashMap::new(),
            jitter_max_ms,
        }
    }

    /// 选出下一个可用客户端
    ///
    /// 全部在冷却中时返回 None
    pub fn next(&self, clients: &[ClientHandle]) -> Option<ClientHandle> {
        if clients.is_empty() {
            return None;
        }

        let now = Instant::now();
        let mut cursor = self.cursor.lock();
        let len = clients.len();
        for offset in 0..len {
            let idx = (*cursor + offset) % len;
            let client = &clients[idx];
            if self.is_available(client.client_id(), now) {
                *cursor = (idx + 1) % len;
                return Some(client.clone());
            }
        }

        debug!("{} 个客户端全部处于冷却中", len);
        None
    }

    /// 标记客户端进入冷却（wait_secs 加上随机抖动）
    pub fn mark_cooldown(&self, client_id: &str, wait_secs: u64) {
        let jitter_ms = if self.jitter_max_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_max_ms)
        } else {
            0
        };
        let cooldown = Duration::from_secs(wait_secs) + Duration::from_millis(jitter_ms);
        let until = Instant::now() + cooldown;
        self.cooldowns.insert(client_id.to_string(), until);
        warn!(
            "客户端 {} 触发限流，冷却 {:.1}s",
            client_id,
            cooldown.as_secs_f64()
        );
    }

    pub fn is_cooling(&self, client_id: &str) -> bool {
        !self.is_available(client_id, Instant::now())
    }

    /// 剩余冷却时间，未冷却返回 None
    pub fn cooldown_remaining(&self, client_id: &str) -> Option<Duration> {
        let until = self.cooldowns.get(client_id).map(|entry| *entry.value())?;
        let remaining = until.saturating_duration_since(Instant::now());
        (!remaining.is_zero()).then_some(remaining)
    }

    pub fn clear_cooldown(&self, client_id: &str) {
        self.cooldowns.remove(client_id);
    }

    /// 检查并清理过期冷却
    fn is_available(&self, client_id: &str, now: Instant) -> bool {
        let until = self.cooldowns.get(client_id).map(|entry| *entry.value());
        match until {
            Some(until) if until > now => false,
            Some(_) => self.release_expired(client_id, now),
            None => true,
        }
    }

    /// 删除在 now 时刻已过期的冷却，返回客户端是否可用
    ///
    /// 读取与删除之间其它会话可能写入新的冷却，只删除仍然过期的条目
    fn release_expired(&self, client_id: &str, now: Instant) -> bool {
        if self
            .cooldowns
            .remove_if(client_id, |_, until| *until <= now)
            .is_some()
        {
            debug!("客户端 {} 冷却结束", client_id);
        }
        !self.cooldowns.contains_key(client_id)
    }
}

impl Default for ClientPool {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN_JITTER_MS)
    }
}
