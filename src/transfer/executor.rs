//! 转发执行器
//!
//! 一个会话对应一次 `run`，会话内的消息严格串行处理：
//! 解析会话 -> 加载进度 -> 逐条过滤、限速、投递 -> 保存进度。
//! 多个会话共享同一个 `SchedulingContext`。

use super::filter::{ContentFilter, MessageClass};
use super::session::{
    ProgressScope, SessionConfig, SessionStats, SessionStatus, TransferMode, TransferSession,
};
use super::sink::{self, Delivered, DownloadRetry, Route};
use super::status::{StatusCallback, StatusReporter, DEFAULT_STATUS_INTERVAL_MS};
use crate::client::{
    channel_id_variants, normalize_reference, ChatClient, ChatHandle, ClientError, ClientHandle,
    IterDirection, Message, MessageId, MessageStream,
};
use crate::config::AppConfig;
use crate::error::{EngineError, EngineResult};
use crate::progress::{ProgressKey, ProgressStore};
use crate::scheduler::{AdaptiveDelayController, DelayTiers, SchedulingContext};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 执行器参数
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// 每成功发送 N 条保存一次进度
    pub save_interval: u32,
    /// 同一条消息因限流重试的上限
    pub max_flood_retries: u32,
    pub delay_tiers: DelayTiers,
    pub download_retry: DownloadRetry,
    pub status_interval: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            save_interval: 10,
            max_flood_retries: 3,
            delay_tiers: DelayTiers::default(),
            download_retry: DownloadRetry::default(),
            status_interval: Duration::from_millis(DEFAULT_STATUS_INTERVAL_MS),
        }
    }
}

impl ExecutorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            save_interval: config.transfer.progress_save_interval.max(1),
            max_flood_retries: config.transfer.max_flood_retries,
            delay_tiers: config.transfer.delay_tiers.clone(),
            download_retry: DownloadRetry::new(
                config.download.max_retries,
                Duration::from_millis(config.download.retry_backoff_ms),
            ),
            status_interval: Duration::from_millis(config.transfer.status_interval_ms),
        }
    }
}

/// 提前结束的原因
#[derive(Debug)]
enum Abort {
    Cancelled,
    Failed(EngineError),
}

impl From<EngineError> for Abort {
    fn from(e: EngineError) -> Self {
        Abort::Failed(e)
    }
}

/// 单条消息处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// 重复 / 服务消息 / 被过滤，不计入发送节奏
    Skipped,
    Sent,
    Errored,
    /// 限流，下一轮优先重试（附已重试次数）
    Retry(u32),
}

/// 解析结果
struct Resolved {
    client: ClientHandle,
    source: ChatHandle,
    target: Option<ChatHandle>,
}

struct LoopContext<'a> {
    session: &'a Arc<RwLock<TransferSession>>,
    config: &'a SessionConfig,
    clients: &'a [ClientHandle],
    cancel: &'a CancellationToken,
    reporter: &'a StatusReporter,
    resolved: &'a Resolved,
    key: &'a ProgressKey,
}

impl LoopContext<'_> {
    fn route(&self) -> EngineResult<Route<'_>> {
        if self.config.mode == TransferMode::LocalDownload {
            let download = self
                .config
                .download
                .as_ref()
                .ok_or_else(|| EngineError::Config("本地下载需要指定保存目录".to_string()))?;
            return Ok(Route::Local(download));
        }
        let target = self
            .resolved
            .target
            .as_ref()
            .ok_or_else(|| EngineError::Config("缺少目标会话".to_string()))?;
        Ok(Route::Chat {
            source: &self.resolved.source,
            target,
            mode: self.config.mode,
        })
    }

    async fn update_stats(&self, f: impl FnOnce(&mut SessionStats)) -> SessionStats {
        let mut session = self.session.write().await;
        f(&mut session.stats);
        session.touch();
        session.stats.clone()
    }
}

/// 转发执行器
pub struct TransferExecutor {
    scheduling: SchedulingContext,
    store: Arc<ProgressStore>,
    settings: ExecutorSettings,
}

impl TransferExecutor {
    pub fn new(scheduling: SchedulingContext, store: Arc<ProgressStore>, settings: ExecutorSettings) -> Self {
        Self {
            scheduling,
            store,
            settings,
        }
    }

    /// 执行会话直到结束，返回终止状态
    pub async fn run(
        &self,
        session: Arc<RwLock<TransferSession>>,
        clients: Vec<ClientHandle>,
        callback: Option<StatusCallback>,
    ) -> SessionStatus {
        let (session_id, config, cancel) = {
            let s = session.read().await;
            (s.id.clone(), s.config.clone(), s.cancel_token())
        };
        let reporter = StatusReporter::new(session_id.clone(), callback, self.settings.status_interval);

        if !session.write().await.mark_resolving() {
            let status = session.read().await.status;
            warn!("会话 {} 当前状态 {:?}，无法启动", session_id, status);
            return status;
        }
        reporter.report("Resolving chats");

        let result = self
            .execute(&session, &config, &clients, &cancel, &reporter)
            .await;

        let mut s = session.write().await;
        match result {
            Ok(()) => {
                s.mark_completed();
                reporter.finish("Completed");
            }
            Err(Abort::Cancelled) => {
                s.mark_stopped();
                reporter.finish("Stopped");
            }
            Err(Abort::Failed(e)) => {
                error!("会话 {} 失败: {}", session_id, e);
                s.mark_failed(e.to_string());
                reporter.finish(format!("Error: {}", e));
            }
        }

        let snapshot = s.stats_snapshot();
        info!(
            "会话 {} 结束 [{}]: 发送 {}, 跳过 {}, 失败 {}, 耗时 {:.1}s",
            session_id,
            s.status.description(),
            snapshot.sent,
            snapshot.skipped,
            snapshot.errored,
            snapshot.elapsed.as_secs_f64()
        );
        s.status
    }

    async fn execute(
        &self,
        session: &Arc<RwLock<TransferSession>>,
        config: &SessionConfig,
        clients: &[ClientHandle],
        cancel: &CancellationToken,
        reporter: &StatusReporter,
    ) -> Result<(), Abort> {
        config.validate()?;
        let authorized = authorized_clients(clients).await;
        let clients = authorized.as_slice();
        if clients.is_empty() {
            return Err(Abort::Failed(EngineError::NoClients));
        }

        let resolved = self.resolve(config, clients, cancel).await?;
        if cancel.is_cancelled() {
            return Err(Abort::Cancelled);
        }

        let total = match resolved.client.message_count(&resolved.source).await {
            Ok(total) => total,
            Err(e) => {
                debug!("获取消息总数失败，进度不显示总数: {}", e);
                None
            }
        };
        let session_id = {
            let mut s = session.write().await;
            s.mark_scanning();
            s.stats.total = total;
            s.id.clone()
        };
        let key = progress_key(&session_id, config, &resolved);
        let record = self.store.load(&key).await;
        let cursor = match config.resume_from {
            Some(0) => None,
            Some(id) => Some(id),
            None if config.direction == IterDirection::OldestFirst => record.cursor(),
            None => None,
        };
        info!(
            "会话 {} 开始: {} -> {}，方式 {}，进度 {}（已发送 {}），起点 {:?}",
            session_id,
            resolved.source.display_name(),
            resolved
                .target
                .as_ref()
                .map(|t| t.display_name().to_string())
                .unwrap_or_else(|| "本地".to_string()),
            config.mode,
            key,
            record.sent_count(),
            cursor
        );

        session.write().await.mark_transferring();
        reporter.report(match cursor {
            Some(id) => format!("Transferring (resuming after message {})", id),
            None => "Transferring".to_string(),
        });

        let ctx = LoopContext {
            session,
            config,
            clients,
            cancel,
            reporter,
            resolved: &resolved,
            key: &key,
        };
        let outcome = self.transfer_loop(&ctx, cursor).await;

        if let Err(e) = self.store.flush(&key).await {
            warn!("会话 {} 最终保存进度失败: {}", session_id, e);
        }
        outcome
    }

    /// 解析源和目标会话
    ///
    /// 限流的客户端进入冷却并换下一个，其它错误直接失败
    async fn resolve(
        &self,
        config: &SessionConfig,
        clients: &[ClientHandle],
        cancel: &CancellationToken,
    ) -> Result<Resolved, Abort> {
        let mut flood_hits = 0u32;
        let limit = self.settings.max_flood_retries + clients.len() as u32;
        loop {
            let client = self.acquire_client(clients, cancel).await?;
            match resolve_pair(client.as_ref(), config).await {
                Ok((source, target)) => {
                    debug!(
                        "客户端 {} 解析成功: source={} target={:?}",
                        client.client_id(),
                        source.id,
                        target.as_ref().map(|t| t.id)
                    );
                    return Ok(Resolved {
                        client,
                        source,
                        target,
                    });
                }
                Err(EngineError::RateLimited {
                    client_id,
                    wait_secs,
                }) => {
                    self.scheduling.client_pool.mark_cooldown(&client_id, wait_secs);
                    flood_hits += 1;
                    if flood_hits > limit {
                        return Err(Abort::Failed(EngineError::EntityResolution {
                            target: config.source.clone(),
                            reason: format!("解析时连续 {} 次触发限流", flood_hits),
                        }));
                    }
                }
                Err(e) => return Err(Abort::Failed(e)),
            }
        }
    }

    async fn transfer_loop(&self, ctx: &LoopContext<'_>, cursor: Option<MessageId>) -> Result<(), Abort> {
        let mut controller = AdaptiveDelayController::new(self.settings.delay_tiers.clone());
        let mut since_flush = 0u32;
        let mut resume_point = cursor;
        let mut iter_client = ctx.resolved.client.clone();
        let mut stream: Option<MessageStream> = None;
        let mut stream_failures = 0u32;
        let mut pending: Option<(Message, u32)> = None;

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(Abort::Cancelled);
            }

            let (message, attempts) = match pending.take() {
                Some(retry) => retry,
                None => {
                    if stream.is_none() {
                        let opened = open_stream(
                            iter_client.as_ref(),
                            &ctx.resolved.source,
                            ctx.config.direction,
                            resume_point,
                        )
                        .await;
                        match opened {
                            Ok(opened) => stream = Some(opened),
                            Err(e) => {
                                iter_client = self.recover_stream(ctx, &mut stream_failures, e).await?;
                                continue;
                            }
                        }
                    }
                    let Some(current) = stream.as_mut() else {
                        continue;
                    };

                    let item = tokio::select! {
                        _ = ctx.cancel.cancelled() => return Err(Abort::Cancelled),
                        item = current.next() => item,
                    };
                    match item {
                        None => return Ok(()),
                        Some(Ok(message)) => {
                            stream_failures = 0;
                            (message, 0)
                        }
                        Some(Err(e)) => {
                            stream = None;
                            let e = client_error(iter_client.client_id(), e);
                            iter_client = self.recover_stream(ctx, &mut stream_failures, e).await?;
                            continue;
                        }
                    }
                }
            };

            let step = self.handle_message(ctx, &message, attempts, &mut controller).await?;
            match step {
                Step::Retry(next_attempt) => {
                    pending = Some((message, next_attempt));
                    continue;
                }
                Step::Skipped => {
                    resume_point = Some(message.id);
                    continue;
                }
                Step::Sent => {
                    resume_point = Some(message.id);
                    since_flush += 1;
                    if since_flush >= self.settings.save_interval {
                        since_flush = 0;
                        if let Err(e) = self.store.flush(ctx.key).await {
                            warn!("保存进度失败（继续转发）: {}", e);
                        }
                    }
                }
                Step::Errored => {
                    resume_point = Some(message.id);
                }
            }

            self.report_progress(ctx).await;
            self.pause(&controller, ctx.cancel).await?;
        }
    }

    async fn handle_message(
        &self,
        ctx: &LoopContext<'_>,
        message: &Message,
        attempts: u32,
        controller: &mut AdaptiveDelayController,
    ) -> Result<Step, Abort> {
        let id = message.id;
        let retrying = attempts > 0;

        if !retrying && self.store.contains(ctx.key, id).await {
            self.store.advance_cursor(ctx.key, id, ctx.config.direction).await;
            ctx.update_stats(|s| s.duplicates += 1).await;
            debug!("消息 {} 已发送过，跳过", id);
            return Ok(Step::Skipped);
        }

        match ContentFilter::classify(message) {
            MessageClass::Service(reason) => {
                self.store.record_skipped(ctx.key, id, ctx.config.direction).await;
                ctx.update_stats(|s| s.service += 1).await;
                debug!("跳过服务消息 {} ({})", id, reason);
                return Ok(Step::Skipped);
            }
            MessageClass::Content(category) if !ctx.config.filter.is_enabled(category) => {
                self.store.record_skipped(ctx.key, id, ctx.config.direction).await;
                ctx.update_stats(|s| s.filtered += 1).await;
                debug!("消息 {} 类型 {} 未启用，跳过", id, category);
                return Ok(Step::Skipped);
            }
            MessageClass::Content(_) => {}
        }

        let pool = &self.scheduling.client_pool;
        let client = match pool.next(ctx.clients) {
            Some(client) => client,
            None if retrying => self.acquire_client(ctx.clients, ctx.cancel).await?,
            None => {
                warn!("消息 {} 无可用客户端（全部冷却中），计为失败", id);
                self.store.advance_cursor(ctx.key, id, ctx.config.direction).await;
                ctx.update_stats(|s| s.errored += 1).await;
                controller.record_failure();
                return Ok(Step::Errored);
            }
        };

        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(Abort::Cancelled),
            _ = self.scheduling.rate_limiter.check_and_consume() => {}
        }

        let route = ctx.route()?;
        match sink::deliver(client.as_ref(), message, route, self.settings.download_retry).await {
            Ok(delivered) => {
                self.store.record_sent(ctx.key, id, ctx.config.direction).await;
                ctx.update_stats(|s| s.sent += 1).await;
                controller.record_success();
                match delivered {
                    Delivered::Sent => debug!("消息 {} 已由 {} 发送", id, client.client_id()),
                    Delivered::Saved(path) => debug!("消息 {} 已保存到 {:?}", id, path),
                }
                Ok(Step::Sent)
            }
            Err(EngineError::RateLimited {
                client_id,
                wait_secs,
            }) => {
                pool.mark_cooldown(&client_id, wait_secs);
                controller.record_failure();
                if attempts >= self.settings.max_flood_retries {
                    warn!("消息 {} 限流重试 {} 次后放弃", id, attempts);
                    self.store.advance_cursor(ctx.key, id, ctx.config.direction).await;
                    ctx.update_stats(|s| s.errored += 1).await;
                    return Ok(Step::Errored);
                }
                ctx.update_stats(|s| s.retried += 1).await;
                info!("消息 {} 触发限流，换客户端重试", id);
                Ok(Step::Retry(attempts + 1))
            }
            Err(e) => {
                warn!("消息 {} 处理失败: {}", id, e);
                self.store.advance_cursor(ctx.key, id, ctx.config.direction).await;
                ctx.update_stats(|s| s.errored += 1).await;
                controller.record_failure();
                Ok(Step::Errored)
            }
        }
    }

    /// 遍历失败后换一个客户端重新打开，超过上限则会话失败
    async fn recover_stream(
        &self,
        ctx: &LoopContext<'_>,
        failures: &mut u32,
        e: EngineError,
    ) -> Result<ClientHandle, Abort> {
        *failures += 1;
        if let EngineError::RateLimited {
            client_id,
            wait_secs,
        } = &e
        {
            self.scheduling.client_pool.mark_cooldown(client_id, *wait_secs);
        }
        if *failures > self.settings.max_flood_retries {
            return Err(Abort::Failed(e));
        }
        warn!("读取消息失败（第 {} 次），重新打开: {}", failures, e);
        self.acquire_client(ctx.clients, ctx.cancel).await
    }

    /// 取一个可用客户端，全部冷却时等待最早结束的那个
    async fn acquire_client(
        &self,
        clients: &[ClientHandle],
        cancel: &CancellationToken,
    ) -> Result<ClientHandle, Abort> {
        if clients.is_empty() {
            return Err(Abort::Failed(EngineError::NoClients));
        }
        let pool = &self.scheduling.client_pool;
        loop {
            if let Some(client) = pool.next(clients) {
                return Ok(client);
            }
            let wait = clients
                .iter()
                .filter_map(|c| pool.cooldown_remaining(c.client_id()))
                .min()
                .unwrap_or(Duration::from_millis(1));
            info!("所有客户端冷却中，等待 {:.1}s", wait.as_secs_f64());
            tokio::select! {
                _ = cancel.cancelled() => return Err(Abort::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn pause(&self, controller: &AdaptiveDelayController, cancel: &CancellationToken) -> Result<(), Abort> {
        let delay = controller.delay();
        tokio::select! {
            _ = cancel.cancelled() => Err(Abort::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn report_progress(&self, ctx: &LoopContext<'_>) {
        let stats = ctx.session.read().await.stats.clone();
        let used = self.scheduling.rate_limiter.used_in_window();
        let processed = match stats.total {
            Some(total) => format!("{}/{}", stats.processed(), total),
            None => stats.processed().to_string(),
        };
        ctx.reporter.progress(format!(
            "Processed {} | Sent {} | Skipped {} | Errors {} | Rate {}/{}",
            processed,
            stats.sent,
            stats.skipped(),
            stats.errored,
            used,
            self.scheduling.rate_limiter.max_per_window()
        ));
    }
}

fn progress_key(session_id: &str, config: &SessionConfig, resolved: &Resolved) -> ProgressKey {
    if config.progress_scope == ProgressScope::Session {
        return ProgressKey::Session(session_id.to_string());
    }
    match &resolved.target {
        Some(target) if config.mode != TransferMode::LocalDownload => {
            ProgressKey::pair(resolved.source.id, target.id)
        }
        _ => ProgressKey::Download {
            source_id: resolved.source.id,
        },
    }
}

fn client_error(client_id: &str, e: ClientError) -> EngineError {
    match e.flood_wait() {
        Some(wait_secs) => EngineError::RateLimited {
            client_id: client_id.to_string(),
            wait_secs,
        },
        None => EngineError::Transfer(format!("读取消息失败: {}", e)),
    }
}

/// 过滤掉未授权的客户端
async fn authorized_clients(clients: &[ClientHandle]) -> Vec<ClientHandle> {
    let mut ready = Vec::with_capacity(clients.len());
    for client in clients {
        if client.is_authorized().await {
            ready.push(client.clone());
        } else {
            warn!("客户端 {} 未授权，已忽略", client.client_id());
        }
    }
    ready
}

async fn open_stream(
    client: &dyn ChatClient,
    source: &ChatHandle,
    direction: IterDirection,
    cursor: Option<MessageId>,
) -> EngineResult<MessageStream> {
    client
        .iter_messages(source, direction, cursor)
        .await
        .map_err(|e| client_error(client.client_id(), e))
}

async fn resolve_pair(
    client: &dyn ChatClient,
    config: &SessionConfig,
) -> EngineResult<(ChatHandle, Option<ChatHandle>)> {
    let source = resolve_reference(client, &config.source).await?;
    let target = match (&config.target, config.mode.needs_target()) {
        (Some(target), true) => Some(resolve_reference(client, target).await?),
        _ => None,
    };
    Ok((source, target))
}

/// 依次尝试规范化后的引用及其 ID 变体
async fn resolve_reference(client: &dyn ChatClient, raw: &str) -> EngineResult<ChatHandle> {
    let normalized = normalize_reference(raw);
    let mut last_error = None;
    for candidate in channel_id_variants(&normalized) {
        match client.resolve_entity(&candidate).await {
            Ok(handle) => return Ok(handle),
            Err(ClientError::RateLimited { wait_secs }) => {
                return Err(EngineError::RateLimited {
                    client_id: client.client_id().to_string(),
                    wait_secs,
                })
            }
            Err(e) => {
                debug!("解析 {} 失败: {}", candidate, e);
                last_error = Some(e);
            }
        }
    }
    Err(EngineError::EntityResolution {
        target: raw.to_string(),
        reason: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "无可用的引用形式".to_string()),
    })
}
