//! 按投递方式发送单条消息
//!
//! 协议层的 FloodWait 统一映射为 `EngineError::RateLimited`，由执行器负责冷却和重试。

use super::filter::{ContentCategory, ContentFilter, MessageClass};
use super::session::{DownloadTarget, TransferMode};
use crate::client::{ChatClient, ChatHandle, ClientError, MediaUpload, Message};
use crate::error::{EngineError, EngineResult};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// 下载重试策略（线性退避）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadRetry {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl DownloadRetry {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self { max_retries, backoff }
    }
}

impl Default for DownloadRetry {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// 投递去向
#[derive(Debug, Clone, Copy)]
pub enum Route<'a> {
    Chat {
        source: &'a ChatHandle,
        target: &'a ChatHandle,
        mode: TransferMode,
    },
    Local(&'a DownloadTarget),
}

/// 投递结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivered {
    Sent,
    Saved(PathBuf),
}

pub async fn deliver(
    client: &dyn ChatClient,
    message: &Message,
    route: Route<'_>,
    retry: DownloadRetry,
) -> EngineResult<Delivered> {
    match route {
        Route::Chat {
            source,
            target,
            mode,
        } => {
            send_to_chat(client, message, source, target, mode, retry).await?;
            Ok(Delivered::Sent)
        }
        Route::Local(download) => save_locally(client, message, download, retry)
            .await
            .map(Delivered::Saved),
    }
}

async fn send_to_chat(
    client: &dyn ChatClient,
    message: &Message,
    source: &ChatHandle,
    target: &ChatHandle,
    mode: TransferMode,
    retry: DownloadRetry,
) -> EngineResult<()> {
    let result = match mode {
        TransferMode::Forward => client.forward_message(target, source, message).await,
        TransferMode::Copy => client.copy_message(target, message).await,
        TransferMode::DownloadUpload => match &message.media {
            Some(media) => {
                let bytes = download_with_retry(client, message, retry).await?;
                let upload = MediaUpload {
                    bytes,
                    file_name: format!("{}.{}", message.id, media.extension()),
                    caption: message.text.clone().filter(|t| !t.trim().is_empty()),
                    kind: media.kind,
                };
                client.send_file(target, upload).await
            }
            None => {
                let text = message.text.as_deref().unwrap_or_default();
                client.send_text(target, text).await
            }
        },
        TransferMode::LocalDownload => {
            return Err(EngineError::Config("本地下载不能投递到会话".to_string()))
        }
    };
    result.map_err(|e| map_send_error(client.client_id(), e))
}

/// 保存到 `<dir>/[<category>/]<id>.<ext>`，纯文本保存为 `<id>.txt`
async fn save_locally(
    client: &dyn ChatClient,
    message: &Message,
    download: &DownloadTarget,
    retry: DownloadRetry,
) -> EngineResult<PathBuf> {
    let category = match ContentFilter::classify(message) {
        MessageClass::Content(category) => category,
        MessageClass::Service(_) => ContentCategory::Other,
    };

    let (bytes, file_name) = match &message.media {
        Some(media) => {
            let bytes = download_with_retry(client, message, retry).await?;
            (bytes, format!("{}.{}", message.id, media.extension()))
        }
        None => {
            let text = message.text.clone().unwrap_or_default();
            (text.into_bytes(), format!("{}.txt", message.id))
        }
    };

    let dir = if download.group_by_category {
        download.dir.join(category.as_str())
    } else {
        download.dir.clone()
    };
    let path = dir.join(file_name);

    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|source| EngineError::Write {
            path: dir.clone(),
            source,
        })?;
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|source| EngineError::Write {
            path: path.clone(),
            source,
        })?;

    debug!("已保存消息 {} -> {:?} ({} 字节)", message.id, path, bytes.len());
    Ok(path)
}

/// 下载媒体，失败时按线性退避重试；限流信号立即返回
pub async fn download_with_retry(
    client: &dyn ChatClient,
    message: &Message,
    retry: DownloadRetry,
) -> EngineResult<Vec<u8>> {
    let mut attempt = 0u32;
    loop {
        match client.download_media(message).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) if e.flood_wait().is_some() => return Err(map_send_error(client.client_id(), e)),
            Err(e) if attempt < retry.max_retries => {
                attempt += 1;
                let wait = retry.backoff * attempt;
                warn!(
                    "下载消息 {} 失败 (第 {}/{} 次重试，{}ms 后): {}",
                    message.id,
                    attempt,
                    retry.max_retries,
                    wait.as_millis(),
                    e
                );
                tokio::time::sleep(wait).await;
            }
            Err(e) => {
                return Err(EngineError::Download(format!(
                    "消息 {} 重试 {} 次后仍失败: {}",
                    message.id, retry.max_retries, e
                )))
            }
        }
    }
}

fn map_send_error(client_id: &str, e: ClientError) -> EngineError {
    match e.flood_wait() {
        Some(wait_secs) => EngineError::RateLimited {
            client_id: client_id.to_string(),
            wait_secs,
        },
        None => EngineError::Transfer(e.to_string()),
    }
}
