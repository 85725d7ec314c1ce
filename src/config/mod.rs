// 配置管理模块

use crate::progress::DEFAULT_MAX_PROGRESS_ITEMS;
use crate::scheduler::adaptive_delay::DelayTiers;
use crate::scheduler::client_pool::DEFAULT_COOLDOWN_JITTER_MS;
use crate::scheduler::rate_limiter::DEFAULT_MAX_PER_MINUTE;
use crate::transfer::session::TransferMode;
use crate::transfer::status::DEFAULT_STATUS_INTERVAL_MS;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
    /// 转发配置
    #[serde(default)]
    pub transfer: TransferConfig,
    /// 本地下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 进度持久化配置
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否写入日志文件
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info，RUST_LOG 优先）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

/// 转发配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// 全局每分钟最大发送数
    #[serde(default = "default_max_messages_per_minute")]
    pub max_messages_per_minute: u32,
    /// 每成功发送 N 条保存一次进度
    #[serde(default = "default_progress_save_interval")]
    pub progress_save_interval: u32,
    /// 同一条消息因限流重试的上限
    #[serde(default = "default_max_flood_retries")]
    pub max_flood_retries: u32,
    /// 冷却时间附加的随机抖动上限（毫秒）
    #[serde(default = "default_cooldown_jitter_ms")]
    pub cooldown_jitter_ms: u64,
    /// 默认投递方式
    #[serde(default)]
    pub default_mode: TransferMode,
    /// 进度回调最小间隔（毫秒）
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
    /// 自适应间隔档位
    #[serde(default)]
    pub delay_tiers: DelayTiers,
}

fn default_max_messages_per_minute() -> u32 {
    DEFAULT_MAX_PER_MINUTE
}

fn default_progress_save_interval() -> u32 {
    10
}

fn default_max_flood_retries() -> u32 {
    3
}

fn default_cooldown_jitter_ms() -> u64 {
    DEFAULT_COOLDOWN_JITTER_MS
}

fn default_status_interval_ms() -> u64 {
    DEFAULT_STATUS_INTERVAL_MS
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_messages_per_minute: default_max_messages_per_minute(),
            progress_save_interval: default_progress_save_interval(),
            max_flood_retries: default_max_flood_retries(),
            cooldown_jitter_ms: default_cooldown_jitter_ms(),
            default_mode: TransferMode::default(),
            status_interval_ms: default_status_interval_ms(),
            delay_tiers: DelayTiers::default(),
        }
    }
}

/// 本地下载配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 默认保存目录
    #[serde(default = "default_download_dir")]
    pub dir: PathBuf,
    /// 按内容类别分子目录
    #[serde(default = "default_group_by_category")]
    pub group_by_category: bool,
    /// 下载失败重试次数
    #[serde(default = "default_download_max_retries")]
    pub max_retries: u32,
    /// 线性退避基数（毫秒）
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_group_by_category() -> bool {
    true
}

fn default_download_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            dir: default_download_dir(),
            group_by_category: default_group_by_category(),
            max_retries: default_download_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

/// 进度持久化配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// 进度文件目录
    #[serde(default = "default_progress_dir")]
    pub progress_dir: PathBuf,
    /// 每个进度记录保留的已发送 ID 上限
    #[serde(default = "default_max_progress_items")]
    pub max_progress_items: usize,
    /// `progress cleanup` 默认清理的天数
    #[serde(default = "default_progress_retention_days")]
    pub retention_days: u32,
}

fn default_progress_dir() -> PathBuf {
    PathBuf::from("progress")
}

fn default_max_progress_items() -> usize {
    DEFAULT_MAX_PROGRESS_ITEMS
}

fn default_progress_retention_days() -> u32 {
    30
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            progress_dir: default_progress_dir(),
            max_progress_items: default_max_progress_items(),
            retention_days: default_progress_retention_days(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;

        let config: AppConfig = toml::from_str(&content).context("解析配置文件失败")?;
        config.validate().context("配置校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("序列化配置失败")?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .context("创建配置目录失败")?;
        }

        fs::write(path, content)
            .await
            .with_context(|| format!("写入配置文件失败: {:?}", path))?;

        tracing::info!("配置已保存: {:?}", path);
        Ok(())
    }

    /// 加载配置，文件不存在时写入默认配置
    pub async fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            let default_config = Self::default();
            if let Err(e) = default_config.save_to_file(path).await {
                tracing::error!("保存默认配置失败: {:#}", e);
            }
            return default_config;
        }

        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {:?}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.transfer.max_messages_per_minute == 0 {
            anyhow::bail!("transfer.max_messages_per_minute 必须大于 0");
        }
        if self.transfer.progress_save_interval == 0 {
            anyhow::bail!("transfer.progress_save_interval 必须大于 0");
        }
        if self.persistence.max_progress_items == 0 {
            anyhow::bail!("persistence.max_progress_items 必须大于 0");
        }
        self.transfer
            .delay_tiers
            .validate()
            .map_err(anyhow::Error::msg)?;
        Ok(())
    }
}
