// 协议客户端接口
//
// 引擎只依赖这里定义的能力集合：解析会话、遍历消息、转发 / 复制 / 上传 / 下载。
// 连接、登录、会话文件等由调用方负责，引擎假定拿到的句柄已经授权。

pub mod chat_ref;
#[cfg(test)]
pub(crate) mod mock;
pub mod types;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

pub use chat_ref::{channel_id_variants, normalize_reference, parse_chat_ref, ChatRef};
pub use types::{
    ChatHandle, ChatId, ClientError, IterDirection, MediaInfo, MediaKind, MediaUpload, Message,
    MessageId, PayloadHandle, ServiceKind,
};

/// 惰性消息序列（有限，可从指定游标重新开始）
pub type MessageStream = BoxStream<'static, Result<Message, ClientError>>;

/// 已授权的协议客户端
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// 客户端唯一标识（账号 ID），用于轮询与冷却
    fn client_id(&self) -> &str;

    /// 是否已授权
    async fn is_authorized(&self) -> bool {
        true
    }

    /// 解析会话引用（ID / 用户名 / 链接）
    async fn resolve_entity(&self, reference: &str) -> Result<ChatHandle, ClientError>;

    /// 会话中的消息总数，用于计算进度（不支持时返回 None）
    async fn message_count(&self, _chat: &ChatHandle) -> Result<Option<u64>, ClientError> {
        Ok(None)
    }

    /// 遍历消息
    ///
    /// `cursor` 为 Some 时只返回游标之后的消息：
    /// OldestFirst 返回 id > cursor，NewestFirst 返回 id < cursor
    async fn iter_messages(
        &self,
        chat: &ChatHandle,
        direction: IterDirection,
        cursor: Option<MessageId>,
    ) -> Result<MessageStream, ClientError>;

    /// 带来源转发
    async fn forward_message(
        &self,
        target: &ChatHandle,
        source: &ChatHandle,
        message: &Message,
    ) -> Result<(), ClientError>;

    /// 以新消息形式复制（不带来源）
    async fn copy_message(&self, target: &ChatHandle, message: &Message) -> Result<(), ClientError>;

    /// 发送文本
    async fn send_text(&self, target: &ChatHandle, text: &str) -> Result<(), ClientError>;

    /// 上传文件
    async fn send_file(&self, target: &ChatHandle, upload: MediaUpload) -> Result<(), ClientError>;

    /// 下载消息媒体
    async fn download_media(&self, message: &Message) -> Result<Vec<u8>, ClientError>;
}

/// 客户端句柄（由调用方持有，引擎只在操作期间借用）
pub type ClientHandle = Arc<dyn ChatClient>;
