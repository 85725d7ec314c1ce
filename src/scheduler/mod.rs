// 进程级调度：全局速率窗口、账号轮询与冷却、自适应间隔

pub mod adaptive_delay;
pub mod client_pool;
pub mod rate_limiter;

pub use adaptive_delay::{AdaptiveDelayController, DelayBand, DelayTiers};
pub use client_pool::ClientPool;
pub use rate_limiter::RateLimiter;

use crate::config::TransferConfig;
use std::sync::Arc;

/// 所有会话共享的调度上下文
///
/// 速率窗口与冷却表是全局的，连续成功计数属于各自会话
#[derive(Debug, Clone)]
pub struct SchedulingContext {
    pub rate_limiter: Arc<RateLimiter>,
    pub client_pool: Arc<ClientPool>,
}

impl SchedulingContext {
    pub fn new(rate_limiter: RateLimiter, client_pool: ClientPool) -> Self {
        Self {
            rate_limiter: Arc::new(rate_limiter),
            client_pool: Arc::new(client_pool),
        }
    }

    pub fn from_config(config: &TransferConfig) -> Self {
        Self::new(
            RateLimiter::new(config.max_messages_per_minute),
            ClientPool::new(config.cooldown_jitter_ms),
        )
    }
}

impl Default for SchedulingContext {
    fn default() -> Self {
        Self::new(RateLimiter::default(), ClientPool::default())
    }
}
