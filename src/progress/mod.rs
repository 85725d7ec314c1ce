// 断点续传进度

pub mod store;
pub mod types;

pub use store::{ProgressKey, ProgressStore};
pub use types::{ProgressRecord, DEFAULT_MAX_PROGRESS_ITEMS};
