// 转发引擎模块

pub mod executor;
pub mod filter;
pub mod manager;
pub mod session;
pub mod sink;
pub mod status;

pub use executor::{ExecutorSettings, TransferExecutor};
pub use filter::{ContentCategory, ContentFilter, MessageClass};
pub use manager::{SessionDefaults, TransferManager};
pub use session::{
    DownloadTarget, ProgressScope, SessionConfig, SessionStats, SessionStatus, StatsSnapshot,
    TransferMode, TransferSession,
};
pub use sink::DownloadRetry;
pub use status::{channel_callback, StatusCallback, StatusUpdate};
