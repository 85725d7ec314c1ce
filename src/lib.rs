// 频道消息转发引擎
// 多账号、限速、可断点续传的会话迁移核心库

// 协议客户端接口
pub mod client;

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 日志系统
pub mod logging;

// 断点续传进度
pub mod progress;

// 调度（限速、轮询、冷却）
pub mod scheduler;

// 转发引擎
pub mod transfer;

// 导出常用类型
pub use client::{ChatClient, ChatHandle, ClientError, ClientHandle, Message, MessageId};
pub use config::AppConfig;
pub use error::{EngineError, EngineResult};
pub use progress::{ProgressKey, ProgressRecord, ProgressStore};
pub use scheduler::{AdaptiveDelayController, ClientPool, RateLimiter, SchedulingContext};
pub use transfer::{
    ContentCategory, ContentFilter, SessionConfig, SessionStatus, StatsSnapshot, TransferExecutor,
    TransferManager, TransferMode, TransferSession,
};
