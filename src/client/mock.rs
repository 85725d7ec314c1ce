// 测试用的内存协议客户端
//
// 多个 MockClient 共享一个 MockNetwork，模拟多账号访问同一组会话

use super::{
    normalize_reference, ChatClient, ChatHandle, ChatId, ClientError, IterDirection, MediaUpload, Message, MessageId,
    MessageStream,
};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SentKind {
    Forward,
    Copy,
    Text,
    File,
}

#[derive(Debug, Clone)]
pub(crate) struct SentRecord {
    pub client_id: String,
    pub target: ChatId,
    pub message_id: Option<MessageId>,
    pub kind: SentKind,
    pub text: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
pub(crate) struct MockNetwork {
    chats: Mutex<HashMap<String, ChatHandle>>,
    history: Mutex<HashMap<ChatId, Vec<Message>>>,
    media: Mutex<HashMap<MessageId, Vec<u8>>>,
    sent: Mutex<Vec<SentRecord>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_chat(&self, reference: &str, id: ChatId) -> ChatHandle {
        let handle = ChatHandle::new(id, reference).with_title(format!("chat {}", id));
        self.chats
            .lock()
            .insert(normalize_reference(reference), handle.clone());
        handle
    }

    pub fn push_message(&self, chat: ChatId, message: Message) {
        self.history.lock().entry(chat).or_default().push(message);
    }

    pub fn set_media(&self, message_id: MessageId, bytes: &[u8]) {
        self.media.lock().insert(message_id, bytes.to_vec());
    }

    pub fn sent(&self) -> Vec<SentRecord> {
        self.sent.lock().clone()
    }

    pub fn sent_ids(&self) -> Vec<MessageId> {
        self.sent.lock().iter().filter_map(|r| r.message_id).collect()
    }

    fn record(&self, record: SentRecord) {
        self.sent.lock().push(record);
    }
}

pub(crate) struct MockClient {
    id: String,
    net: Arc<MockNetwork>,
    /// 首次发送该消息时返回 FloodWait（一次性）
    flood_on_send: Mutex<HashMap<MessageId, u64>>,
    /// 发送该消息总是失败
    fail_on_send: Mutex<HashSet<MessageId>>,
    /// 下载前 N 次失败
    download_failures: Mutex<HashMap<MessageId, u32>>,
    /// 解析时始终返回的错误
    resolve_error: Mutex<Option<ClientError>>,
    /// 依次消耗：打开消息流时返回的错误
    open_failures: Mutex<VecDeque<ClientError>>,
    /// 下一次打开的消息流在产出 N 条后返回该错误（一次性）
    stream_break: Mutex<Option<(usize, ClientError)>>,
    send_attempts: AtomicUsize,
    open_attempts: AtomicUsize,
    authorized: AtomicBool,
    /// 每次发送前的模拟耗时
    send_delay: Mutex<Option<Duration>>,
}

impl MockClient {
    pub fn new(id: &str, net: Arc<MockNetwork>) -> Self {
        Self {
            id: id.to_string(),
            net,
            flood_on_send: Mutex::new(HashMap::new()),
            fail_on_send: Mutex::new(HashSet::new()),
            download_failures: Mutex::new(HashMap::new()),
            resolve_error: Mutex::new(None),
            open_failures: Mutex::new(VecDeque::new()),
            stream_break: Mutex::new(None),
            send_attempts: AtomicUsize::new(0),
            open_attempts: AtomicUsize::new(0),
            authorized: AtomicBool::new(true),
            send_delay: Mutex::new(None),
        }
    }

    pub fn flood_once(&self, message_id: MessageId, wait_secs: u64) {
        self.flood_on_send.lock().insert(message_id, wait_secs);
    }

    pub fn fail_always(&self, message_id: MessageId) {
        self.fail_on_send.lock().insert(message_id);
    }

    pub fn fail_downloads(&self, message_id: MessageId, times: u32) {
        self.download_failures.lock().insert(message_id, times);
    }

    pub fn fail_resolve(&self, error: ClientError) {
        *self.resolve_error.lock() = Some(error);
    }

    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock() = Some(delay);
    }

    async fn simulate_latency(&self) {
        let delay = *self.send_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn deauthorize(&self) {
        self.authorized.store(false, Ordering::SeqCst);
    }

    /// 接下来 times 次打开消息流都失败
    pub fn fail_open(&self, error: ClientError, times: usize) {
        let mut failures = self.open_failures.lock();
        failures.extend(std::iter::repeat(error).take(times));
    }

    pub fn break_stream_after(&self, items: usize, error: ClientError) {
        *self.stream_break.lock() = Some((items, error));
    }

    pub fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }

    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }

    fn check_send(&self, message_id: Option<MessageId>) -> Result<(), ClientError> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        let Some(id) = message_id else {
            return Ok(());
        };
        if let Some(wait_secs) = self.flood_on_send.lock().remove(&id) {
            return Err(ClientError::RateLimited { wait_secs });
        }
        if self.fail_on_send.lock().contains(&id) {
            return Err(ClientError::Network(format!("connection reset (message {})", id)));
        }
        Ok(())
    }

    fn record(&self, target: &ChatHandle, message_id: Option<MessageId>, kind: SentKind, text: Option<String>, bytes: Vec<u8>) {
        self.net.record(SentRecord {
            client_id: self.id.clone(),
            target: target.id,
            message_id,
            kind,
            text,
            bytes,
        });
    }
}

/// 从文件名中解析出原消息 ID（`<id>.<ext>`）
fn message_id_from_file_name(name: &str) -> Option<MessageId> {
    name.split('.').next().and_then(|stem| stem.parse().ok())
}

#[async_trait]
impl ChatClient for MockClient {
    fn client_id(&self) -> &str {
        &self.id
    }

    async fn resolve_entity(&self, reference: &str) -> Result<ChatHandle, ClientError> {
        if let Some(err) = self.resolve_error.lock().clone() {
            return Err(err);
        }
        self.net
            .chats
            .lock()
            .get(&normalize_reference(reference))
            .cloned()
            .ok_or_else(|| ClientError::NotFound(reference.to_string()))
    }

    async fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::SeqCst)
    }

    async fn message_count(&self, chat: &ChatHandle) -> Result<Option<u64>, ClientError> {
        let count = self.net.history.lock().get(&chat.id).map_or(0, |m| m.len());
        Ok(Some(count as u64))
    }

    async fn iter_messages(
        &self,
        chat: &ChatHandle,
        direction: IterDirection,
        cursor: Option<MessageId>,
    ) -> Result<MessageStream, ClientError> {
        self.open_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.open_failures.lock().pop_front() {
            return Err(err);
        }

        let mut messages = self
            .net
            .history
            .lock()
            .get(&chat.id)
            .cloned()
            .unwrap_or_default();
        messages.sort_by_key(|m| m.id);
        if direction == IterDirection::NewestFirst {
            messages.reverse();
        }
        let messages: Vec<Message> = messages
            .into_iter()
            .filter(|m| match (cursor, direction) {
                (None, _) => true,
                (Some(c), IterDirection::OldestFirst) => m.id > c,
                (Some(c), IterDirection::NewestFirst) => m.id < c,
            })
            .collect();

        let mut items: Vec<Result<Message, ClientError>> = messages.into_iter().map(Ok).collect();
        if let Some((after, err)) = self.stream_break.lock().take() {
            items.truncate(after);
            items.push(Err(err));
        }
        Ok(futures::stream::iter(items).boxed())
    }

    async fn forward_message(
        &self,
        target: &ChatHandle,
        _source: &ChatHandle,
        message: &Message,
    ) -> Result<(), ClientError> {
        self.simulate_latency().await;
        self.check_send(Some(message.id))?;
        self.record(target, Some(message.id), SentKind::Forward, message.text.clone(), Vec::new());
        Ok(())
    }

    async fn copy_message(&self, target: &ChatHandle, message: &Message) -> Result<(), ClientError> {
        self.simulate_latency().await;
        self.check_send(Some(message.id))?;
        self.record(target, Some(message.id), SentKind::Copy, message.text.clone(), Vec::new());
        Ok(())
    }

    async fn send_text(&self, target: &ChatHandle, text: &str) -> Result<(), ClientError> {
        self.simulate_latency().await;
        self.check_send(None)?;
        self.record(target, None, SentKind::Text, Some(text.to_string()), Vec::new());
        Ok(())
    }

    async fn send_file(&self, target: &ChatHandle, upload: MediaUpload) -> Result<(), ClientError> {
        let message_id = message_id_from_file_name(&upload.file_name);
        self.simulate_latency().await;
        self.check_send(message_id)?;
        self.record(target, message_id, SentKind::File, upload.caption, upload.bytes);
        Ok(())
    }

    async fn download_media(&self, message: &Message) -> Result<Vec<u8>, ClientError> {
        {
            let mut failures = self.download_failures.lock();
            if let Some(remaining) = failures.get_mut(&message.id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ClientError::Network(format!("download interrupted ({})", message.id)));
                }
            }
        }
        Ok(self
            .net
            .media
            .lock()
            .get(&message.id)
            .cloned()
            .unwrap_or_else(|| format!("media-{}", message.id).into_bytes()))
    }
}
