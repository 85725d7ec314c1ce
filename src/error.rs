//! 引擎错误类型
//!
//! 只有会话解析失败、配置错误和缺少客户端会让会话进入 Failed，
//! 其它错误都在单条消息级别被吸收

use std::path::PathBuf;
use thiserror::Error;

/// 转发引擎错误
#[derive(Debug, Error)]
pub enum EngineError {
    /// 源/目标会话解析失败（会话级致命错误）
    #[error("无法解析会话 {target}: {reason}")]
    EntityResolution { target: String, reason: String },

    /// 协议层限流信号（FloodWait），触发客户端冷却并重试同一条消息
    #[error("客户端 {client_id} 触发限流，需等待 {wait_secs}s")]
    RateLimited { client_id: String, wait_secs: u64 },

    /// 发送失败（网络抖动、内容不支持等），可恢复
    #[error("发送失败: {0}")]
    Transfer(String),

    /// 媒体下载失败（已重试仍失败）
    #[error("下载失败: {0}")]
    Download(String),

    /// 本地写入失败，仅对当前消息致命
    #[error("写入文件失败 {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 进度持久化失败，内存状态仍然有效
    #[error("进度保存失败 ({key}): {reason}")]
    Persistence { key: String, reason: String },

    /// 会话配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 没有任何可用的客户端
    #[error("没有可用的客户端")]
    NoClients,

    /// 会话不存在
    #[error("会话不存在: {0}")]
    SessionNotFound(String),

    /// 会话已经启动过
    #[error("会话已启动: {0}")]
    AlreadyStarted(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
