//! 内容类型过滤
//!
//! 会话内只构建一次，无状态。服务消息和空消息永远不会通过过滤。

use crate::client::{MediaKind, Message};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// 内容类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentCategory {
    Text,
    Photo,
    Video,
    Document,
    Audio,
    Voice,
    Sticker,
    /// 无法归类的媒体
    Other,
}

impl ContentCategory {
    pub const ALL: [ContentCategory; 8] = [
        ContentCategory::Text,
        ContentCategory::Photo,
        ContentCategory::Video,
        ContentCategory::Document,
        ContentCategory::Audio,
        ContentCategory::Voice,
        ContentCategory::Sticker,
        ContentCategory::Other,
    ];

    /// 目录名 / 配置键
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentCategory::Text => "text",
            ContentCategory::Photo => "photos",
            ContentCategory::Video => "videos",
            ContentCategory::Document => "documents",
            ContentCategory::Audio => "audio",
            ContentCategory::Voice => "voice",
            ContentCategory::Sticker => "stickers",
            ContentCategory::Other => "other",
        }
    }

    /// 解析配置键，兼容单复数和 images 别名
    pub fn from_key(key: &str) -> Option<Self> {
        match key.trim().to_ascii_lowercase().as_str() {
            "text" | "texts" => Some(ContentCategory::Text),
            "photo" | "photos" | "image" | "images" => Some(ContentCategory::Photo),
            "video" | "videos" => Some(ContentCategory::Video),
            "document" | "documents" | "file" | "files" => Some(ContentCategory::Document),
            "audio" | "music" => Some(ContentCategory::Audio),
            "voice" | "voices" => Some(ContentCategory::Voice),
            "sticker" | "stickers" => Some(ContentCategory::Sticker),
            "other" | "others" => Some(ContentCategory::Other),
            _ => None,
        }
    }

    pub fn from_media_kind(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Photo => ContentCategory::Photo,
            MediaKind::Video => ContentCategory::Video,
            MediaKind::Document => ContentCategory::Document,
            MediaKind::Audio => ContentCategory::Audio,
            MediaKind::Voice => ContentCategory::Voice,
            MediaKind::Sticker => ContentCategory::Sticker,
            MediaKind::Unknown => ContentCategory::Other,
        }
    }
}

impl fmt::Display for ContentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 消息分类结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageClass {
    /// 可转发内容
    Content(ContentCategory),
    /// 服务消息或空消息（附原因）
    Service(String),
}

/// 内容过滤器
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentFilter {
    enabled: BTreeSet<ContentCategory>,
}

impl Default for ContentFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl ContentFilter {
    pub fn all() -> Self {
        Self {
            enabled: ContentCategory::ALL.into_iter().collect(),
        }
    }

    pub fn none() -> Self {
        Self {
            enabled: BTreeSet::new(),
        }
    }

    pub fn only(categories: impl IntoIterator<Item = ContentCategory>) -> Self {
        Self {
            enabled: categories.into_iter().collect(),
        }
    }

    pub fn with(mut self, category: ContentCategory, enabled: bool) -> Self {
        if enabled {
            self.enabled.insert(category);
        } else {
            self.enabled.remove(&category);
        }
        self
    }

    pub fn is_enabled(&self, category: ContentCategory) -> bool {
        self.enabled.contains(&category)
    }

    pub fn enabled(&self) -> impl Iterator<Item = ContentCategory> + '_ {
        self.enabled.iter().copied()
    }

    /// 从 `{ "text": true, "photos": false, ... }` 形式的选择构建
    ///
    /// 未出现的类别默认启用，无法识别的键忽略
    pub fn from_selection(selection: &HashMap<String, bool>) -> Self {
        let mut filter = Self::all();
        for (key, enabled) in selection {
            match ContentCategory::from_key(key) {
                Some(category) => filter = filter.with(category, *enabled),
                None => tracing::debug!("忽略未知的内容类型: {}", key),
            }
        }
        filter
    }

    /// 判断消息类别
    pub fn classify(message: &Message) -> MessageClass {
        if let Some(service) = &message.service {
            return MessageClass::Service(service.describe());
        }
        if let Some(kind) = message.media_kind() {
            return MessageClass::Content(ContentCategory::from_media_kind(kind));
        }
        if message.has_text() {
            return MessageClass::Content(ContentCategory::Text);
        }
        MessageClass::Service("empty".to_string())
    }

    pub fn matches(&self, message: &Message) -> bool {
        match Self::classify(message) {
            MessageClass::Content(category) => self.is_enabled(category),
            MessageClass::Service(_) => false,
        }
    }
}
