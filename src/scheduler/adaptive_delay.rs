//! 自适应发送间隔
//!
//! 连续成功次数越多，间隔越短；任何失败都会把连续成功数清零，回到最保守的档位。

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 随机间隔区间（毫秒，闭区间）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayBand {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayBand {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    /// 在区间内均匀取样
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let (lo, hi) = if self.min_ms <= self.max_ms {
            (self.min_ms, self.max_ms)
        } else {
            (self.max_ms, self.min_ms)
        };
        Duration::from_millis(rng.gen_range(lo..=hi))
    }
}

fn default_fast_threshold() -> u32 {
    20
}

fn default_medium_fast_threshold() -> u32 {
    10
}

fn default_medium_threshold() -> u32 {
    5
}

fn default_fast_band() -> DelayBand {
    DelayBand::new(500, 1500)
}

fn default_medium_fast_band() -> DelayBand {
    DelayBand::new(1000, 2000)
}

fn default_medium_band() -> DelayBand {
    DelayBand::new(2000, 3000)
}

fn default_cautious_band() -> DelayBand {
    DelayBand::new(3000, 5000)
}

/// 档位配置
///
/// - streak > fast_threshold：fast
/// - streak > medium_fast_threshold：medium_fast
/// - streak >= medium_threshold：medium
/// - 其它：cautious
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayTiers {
    #[serde(default = "default_fast_threshold")]
    pub fast_threshold: u32,
    #[serde(default = "default_medium_fast_threshold")]
    pub medium_fast_threshold: u32,
    #[serde(default = "default_medium_threshold")]
    pub medium_threshold: u32,
    #[serde(default = "default_fast_band")]
    pub fast: DelayBand,
    #[serde(default = "default_medium_fast_band")]
    pub medium_fast: DelayBand,
    #[serde(default = "default_medium_band")]
    pub medium: DelayBand,
    #[serde(default = "default_cautious_band")]
    pub cautious: DelayBand,
}

impl Default for DelayTiers {
    fn default() -> Self {
        Self {
            fast_threshold: default_fast_threshold(),
            medium_fast_threshold: default_medium_fast_threshold(),
            medium_threshold: default_medium_threshold(),
            fast: default_fast_band(),
            medium_fast: default_medium_fast_band(),
            medium: default_medium_band(),
            cautious: default_cautious_band(),
        }
    }
}

impl DelayTiers {
    pub fn band_for(&self, streak: u32) -> DelayBand {
        if streak > self.fast_threshold {
            self.fast
        } else if streak > self.medium_fast_threshold {
            self.medium_fast
        } else if streak >= self.medium_threshold {
            self.medium
        } else {
            self.cautious
        }
    }

    /// 档位之间的阈值必须递减
    pub fn validate(&self) -> Result<(), String> {
        if self.fast_threshold < self.medium_fast_threshold
            || self.medium_fast_threshold < self.medium_threshold
        {
            return Err(format!(
                "延迟档位阈值必须递减: fast={} medium_fast={} medium={}",
                self.fast_threshold, self.medium_fast_threshold, self.medium_threshold
            ));
        }
        Ok(())
    }
}

/// 单个会话的自适应延迟控制器
#[derive(Debug, Clone, Default)]
pub struct AdaptiveDelayController {
    tiers: DelayTiers,
    streak: u32,
}

impl AdaptiveDelayController {
    pub fn new(tiers: DelayTiers) -> Self {
        Self { tiers, streak: 0 }
    }

    /// 指定连续成功数下的下一次间隔
    pub fn next_delay(&self, streak: u32) -> Duration {
        self.tiers.band_for(streak).sample(&mut rand::thread_rng())
    }

    /// 按当前连续成功数取样
    pub fn delay(&self) -> Duration {
        self.next_delay(self.streak)
    }

    pub fn record_success(&mut self) {
        self.streak = self.streak.saturating_add(1);
    }

    pub fn record_failure(&mut self) {
        self.streak = 0;
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }
}
