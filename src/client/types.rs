// 协议客户端类型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

/// 消息 ID（同一会话内单调递增）
pub type MessageId = i64;

/// 会话 ID
pub type ChatId = i64;

/// 解析后的会话句柄
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatHandle {
    /// 会话数字 ID
    pub id: ChatId,
    /// 会话标题
    pub title: Option<String>,
    /// 解析时使用的原始引用（ID / 用户名 / 链接）
    pub reference: String,
}

impl ChatHandle {
    pub fn new(id: ChatId, reference: impl Into<String>) -> Self {
        Self {
            id,
            title: None,
            reference: reference.into(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// 展示名称，优先使用标题
    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.reference)
    }
}

/// 消息遍历方向
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterDirection {
    /// 从旧到新（默认，可线性断点续传）
    #[default]
    OldestFirst,
    /// 从新到旧
    NewestFirst,
}

/// 媒体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Document,
    Audio,
    Voice,
    Sticker,
    /// 协议层无法归类的媒体
    Unknown,
}

impl MediaKind {
    /// 默认文件扩展名
    pub fn default_extension(&self) -> &'static str {
        match self {
            MediaKind::Photo => "jpg",
            MediaKind::Video => "mp4",
            MediaKind::Audio => "mp3",
            MediaKind::Voice => "ogg",
            MediaKind::Sticker => "webp",
            MediaKind::Document | MediaKind::Unknown => "bin",
        }
    }
}

/// 媒体信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub kind: MediaKind,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
}

impl MediaInfo {
    pub fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            file_name: None,
            mime_type: None,
            size: None,
        }
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.mime_type = Some(mime.into());
        self
    }

    /// 推断保存时使用的扩展名
    ///
    /// 顺序：原始文件名 > MIME 类型 > 媒体类型默认值
    pub fn extension(&self) -> String {
        if let Some(ext) = self
            .file_name
            .as_deref()
            .and_then(|name| std::path::Path::new(name).extension())
            .and_then(|ext| ext.to_str())
            .filter(|ext| !ext.is_empty())
        {
            return ext.to_ascii_lowercase();
        }

        if let Some(ext) = self.mime_type.as_deref().and_then(extension_for_mime) {
            return ext.to_string();
        }

        self.kind.default_extension().to_string()
    }
}

fn extension_for_mime(mime: &str) -> Option<&'static str> {
    match mime {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "video/mp4" => Some("mp4"),
        "video/quicktime" => Some("mov"),
        "video/webm" => Some("webm"),
        "audio/mpeg" => Some("mp3"),
        "audio/ogg" => Some("ogg"),
        "audio/mp4" => Some("m4a"),
        "application/pdf" => Some("pdf"),
        "application/zip" => Some("zip"),
        "text/plain" => Some("txt"),
        _ => None,
    }
}

/// 服务/系统消息类型（永远不会被转发）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Join,
    Leave,
    Pin,
    Poll,
    Game,
    /// 其它系统动作
    Action(String),
}

impl ServiceKind {
    pub fn describe(&self) -> String {
        match self {
            ServiceKind::Join => "join".to_string(),
            ServiceKind::Leave => "leave".to_string(),
            ServiceKind::Pin => "pin".to_string(),
            ServiceKind::Poll => "poll".to_string(),
            ServiceKind::Game => "game".to_string(),
            ServiceKind::Action(name) => name.clone(),
        }
    }
}

/// 协议层原始负载句柄（转发 / 下载时由客户端实现自行解读）
#[derive(Clone)]
pub struct PayloadHandle(Arc<dyn Any + Send + Sync>);

impl PayloadHandle {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for PayloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PayloadHandle(..)")
    }
}

/// 消息只读视图
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    /// 文本或媒体说明
    pub text: Option<String>,
    pub media: Option<MediaInfo>,
    /// 服务消息类型（加入、置顶、投票等）
    pub service: Option<ServiceKind>,
    pub date: Option<DateTime<Utc>>,
    pub payload: Option<PayloadHandle>,
}

impl Message {
    /// 纯文本消息
    pub fn text(id: MessageId, text: impl Into<String>) -> Self {
        Self {
            id,
            text: Some(text.into()),
            media: None,
            service: None,
            date: None,
            payload: None,
        }
    }

    /// 媒体消息
    pub fn media(id: MessageId, media: MediaInfo) -> Self {
        Self {
            id,
            text: None,
            media: Some(media),
            service: None,
            date: None,
            payload: None,
        }
    }

    /// 服务消息
    pub fn service(id: MessageId, kind: ServiceKind) -> Self {
        Self {
            id,
            text: None,
            media: None,
            service: Some(kind),
            date: None,
            payload: None,
        }
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.text = Some(caption.into());
        self
    }

    pub fn has_text(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.trim().is_empty())
    }

    pub fn media_kind(&self) -> Option<MediaKind> {
        self.media.as_ref().map(|m| m.kind)
    }
}

/// 上传文件请求
#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub caption: Option<String>,
    pub kind: MediaKind,
}

/// 协议客户端错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// FloodWait，需要等待指定秒数
    #[error("FloodWait: 需等待 {wait_secs}s")]
    RateLimited { wait_secs: u64 },
    /// 会话或消息不存在
    #[error("未找到: {0}")]
    NotFound(String),
    /// 内容不支持
    #[error("不支持的内容: {0}")]
    Unsupported(String),
    /// 网络错误
    #[error("网络错误: {0}")]
    Network(String),
    #[error("{0}")]
    Other(String),
}

impl ClientError {
    /// 限流等待秒数（非限流错误返回 None）
    pub fn flood_wait(&self) -> Option<u64> {
        match self {
            ClientError::RateLimited { wait_secs } => Some(*wait_secs),
            _ => None,
        }
    }
}
