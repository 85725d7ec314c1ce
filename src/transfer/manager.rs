// 转发会话管理器

use super::executor::{ExecutorSettings, TransferExecutor};
use super::session::{
    DownloadTarget, SessionConfig, SessionStatus, StatsSnapshot, TransferMode, TransferSession,
};
use super::status::StatusCallback;
use crate::client::ClientHandle;
use crate::config::AppConfig;
use crate::error::{EngineError, EngineResult};
use crate::progress::ProgressStore;
use crate::scheduler::SchedulingContext;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 会话信息（包含会话、取消令牌和执行句柄）
pub struct SessionEntry {
    pub session: Arc<RwLock<TransferSession>>,
    pub cancellation_token: CancellationToken,
    /// 是否已被 start 占用（只能启动一次）
    started: AtomicBool,
    handle: Mutex<Option<JoinHandle<SessionStatus>>>,
}

/// 新建会话时使用的默认值
#[derive(Debug, Clone)]
pub struct SessionDefaults {
    pub mode: TransferMode,
    pub download: DownloadTarget,
}

impl SessionDefaults {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            mode: config.transfer.default_mode,
            download: DownloadTarget::from_config(&config.download),
        }
    }
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// 转发会话管理器
///
/// 所有会话共享同一个调度上下文和进度存储
pub struct TransferManager {
    sessions: Arc<DashMap<String, SessionEntry>>,
    executor: Arc<TransferExecutor>,
    scheduling: SchedulingContext,
    store: Arc<ProgressStore>,
    defaults: SessionDefaults,
}

impl TransferManager {
    pub fn new(config: &AppConfig) -> Self {
        let store = Arc::new(ProgressStore::with_max_items(
            &config.persistence.progress_dir,
            config.persistence.max_progress_items,
        ));
        Self::with_parts(
            SchedulingContext::from_config(&config.transfer),
            store,
            ExecutorSettings::from_config(config),
        )
        .with_defaults(SessionDefaults::from_config(config))
    }

    pub fn with_parts(
        scheduling: SchedulingContext,
        store: Arc<ProgressStore>,
        settings: ExecutorSettings,
    ) -> Self {
        info!(
            "创建转发管理器: 速率 {}/分钟, 进度目录 {:?}",
            scheduling.rate_limiter.max_per_window(),
            store.dir()
        );
        let executor = Arc::new(TransferExecutor::new(
            scheduling.clone(),
            store.clone(),
            settings,
        ));
        Self {
            sessions: Arc::new(DashMap::new()),
            executor,
            scheduling,
            store,
            defaults: SessionDefaults::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: SessionDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// 按默认投递方式生成会话配置
    ///
    /// 没有目标会话或默认方式为本地下载时，使用配置的下载目录
    pub fn session_config(&self, source: &str, target: Option<&str>) -> SessionConfig {
        match target {
            Some(target) if self.defaults.mode.needs_target() => {
                SessionConfig::transfer(source, target, self.defaults.mode)
            }
            _ => SessionConfig::download_to(source, self.defaults.download.clone()),
        }
    }

    /// 创建会话，返回会话 ID
    pub fn create_session(&self, config: SessionConfig) -> EngineResult<String> {
        config.validate()?;
        let session = TransferSession::new(config);
        let id = session.id.clone();
        info!(
            "创建转发会话: id={}, source={}, target={:?}, mode={}",
            id, session.config.source, session.config.target, session.config.mode
        );
        let entry = SessionEntry {
            cancellation_token: session.cancel_token(),
            session: Arc::new(RwLock::new(session)),
            started: AtomicBool::new(false),
            handle: Mutex::new(None),
        };
        self.sessions.insert(id.clone(), entry);
        Ok(id)
    }

    /// 启动会话（后台执行，立即返回）
    pub async fn start(
        &self,
        id: &str,
        clients: Vec<ClientHandle>,
        callback: Option<StatusCallback>,
    ) -> EngineResult<()> {
        let session = self.entry(id)?.session.clone();
        let status = session.read().await.status;
        if status != SessionStatus::Created {
            return Err(EngineError::AlreadyStarted(id.to_string()));
        }

        let entry = self.entry(id)?;
        // 占位与写入句柄在同一把锁内完成，并发的 start 只有一个成功
        let mut slot = entry.handle.lock();
        if entry.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyStarted(id.to_string()));
        }

        let executor = self.executor.clone();
        let task_id = id.to_string();
        *slot = Some(tokio::spawn(async move {
            let status = executor.run(session, clients, callback).await;
            info!("会话 {} 执行结束: {}", task_id, status.description());
            status
        }));
        info!("启动转发会话: {}", id);
        Ok(())
    }

    /// 请求停止（不等待结束）
    pub fn stop(&self, id: &str) -> EngineResult<()> {
        let entry = self.entry(id)?;
        entry.cancellation_token.cancel();
        if !entry.started.load(Ordering::SeqCst) {
            // 尚未启动的会话直接标记为已停止
            if let Ok(mut session) = entry.session.try_write() {
                session.mark_stopped();
            }
        }
        info!("停止转发会话: {}", id);
        Ok(())
    }

    pub async fn get_stats(&self, id: &str) -> EngineResult<StatsSnapshot> {
        let session = self.entry(id)?.session.clone();
        let snapshot = session.read().await.stats_snapshot();
        Ok(snapshot)
    }

    pub async fn get_session(&self, id: &str) -> Option<TransferSession> {
        let session = self.sessions.get(id)?.session.clone();
        let snapshot = session.read().await.clone();
        Some(snapshot)
    }

    /// 所有会话（正在被写入的会话跳过）
    pub fn list_sessions(&self) -> Vec<TransferSession> {
        let mut result: Vec<TransferSession> = self
            .sessions
            .iter()
            .filter_map(|entry| entry.value().session.try_read().ok().map(|s| s.clone()))
            .collect();
        result.sort_by_key(|s| s.created_at);
        result
    }

    /// 删除会话（运行中的会话会先被取消）
    pub fn remove_session(&self, id: &str) -> EngineResult<()> {
        match self.sessions.remove(id) {
            Some((_, entry)) => {
                entry.cancellation_token.cancel();
                info!("删除转发会话: {}", id);
                Ok(())
            }
            None => Err(EngineError::SessionNotFound(id.to_string())),
        }
    }

    /// 等待会话结束，返回终止状态
    pub async fn wait(&self, id: &str) -> EngineResult<SessionStatus> {
        let (handle, session) = {
            let entry = self.entry(id)?;
            let handle = entry.handle.lock().take();
            (handle, entry.session.clone())
        };

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("会话 {} 执行任务异常退出: {}", id, e);
                let mut s = session.write().await;
                s.mark_failed(format!("执行任务异常退出: {}", e));
            }
        }
        let status = session.read().await.status;
        Ok(status)
    }

    pub fn scheduling(&self) -> &SchedulingContext {
        &self.scheduling
    }

    pub fn progress_store(&self) -> &Arc<ProgressStore> {
        &self.store
    }

    fn entry(&self, id: &str) -> EngineResult<dashmap::mapref::one::Ref<'_, String, SessionEntry>> {
        self.sessions
            .get(id)
            .ok_or_else(|| EngineError::SessionNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::{MockClient, MockNetwork};
    use crate::client::Message;
    use crate::scheduler::{ClientPool, RateLimiter};
    use crate::transfer::session::TransferMode;
    use std::time::Duration;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, per_minute: u32) -> TransferManager {
        TransferManager::with_parts(
            SchedulingContext::new(RateLimiter::new(per_minute), ClientPool::new(0)),
            Arc::new(ProgressStore::new(dir.path())),
            ExecutorSettings::default(),
        )
    }

    fn network(pairs: &[(&str, i64)], messages: i64) -> Arc<MockNetwork> {
        let net = MockNetwork::new();
        for (reference, id) in pairs {
            net.add_chat(reference, *id);
        }
        for id in 1..=messages {
            net.push_message(pairs[0].1, Message::text(id, format!("m{}", id)));
        }
        net
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_start_wait() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, 20);
        let net = network(&[("@src", 1), ("@dst", 2)], 3);
        let client: ClientHandle = Arc::new(MockClient::new("a", net.clone()));

        let id = manager
            .create_session(SessionConfig::transfer("@src", "@dst", TransferMode::Copy))
            .unwrap();
        manager.start(&id, vec![client.clone()], None).await.unwrap();
        assert!(matches!(
            manager.start(&id, vec![client], None).await,
            Err(EngineError::AlreadyStarted(_))
        ));

        assert_eq!(manager.wait(&id).await.unwrap(), SessionStatus::Completed);
        let stats = manager.get_stats(&id).await.unwrap();
        assert_eq!(stats.sent, 3);
        assert_eq!(net.sent_ids(), vec![1, 2, 3]);
        assert_eq!(manager.list_sessions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_running_session() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, 20);
        let net = network(&[("@src", 1), ("@dst", 2)], 100);
        let client: ClientHandle = Arc::new(MockClient::new("a", net.clone()));

        let id = manager
            .create_session(SessionConfig::transfer("@src", "@dst", TransferMode::Forward))
            .unwrap();
        manager.start(&id, vec![client], None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        manager.stop(&id).unwrap();

        assert_eq!(manager.wait(&id).await.unwrap(), SessionStatus::Stopped);
        let stats = manager.get_stats(&id).await.unwrap();
        assert!(stats.sent < 100);
    }

    #[tokio::test]
    async fn test_stop_before_start_marks_stopped() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, 20);
        let id = manager
            .create_session(SessionConfig::transfer("@src", "@dst", TransferMode::Copy))
            .unwrap();
        manager.stop(&id).unwrap();
        let session = manager.get_session(&id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Stopped);
        assert!(matches!(
            manager.start(&id, Vec::new(), None).await,
            Err(EngineError::AlreadyStarted(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_and_invalid_sessions() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, 20);
        assert!(matches!(
            manager.get_stats("nope").await,
            Err(EngineError::SessionNotFound(_))
        ));
        assert!(manager.stop("nope").is_err());
        assert!(manager.remove_session("nope").is_err());
        assert!(manager.get_session("nope").await.is_none());

        let mut bad = SessionConfig::transfer("@src", "@dst", TransferMode::Copy);
        bad.target = None;
        assert!(matches!(manager.create_session(bad), Err(EngineError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_share_rate_window() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, 3);
        let net = network(&[("@a", 1), ("@b", 2), ("@c", 3)], 3);
        for id in 1..=3 {
            net.push_message(3, Message::text(100 + id, "other"));
        }
        let client: ClientHandle = Arc::new(MockClient::new("acct", net.clone()));

        let start = tokio::time::Instant::now();
        let first = manager
            .create_session(SessionConfig::transfer("@a", "@b", TransferMode::Copy))
            .unwrap();
        let second = manager
            .create_session(SessionConfig::transfer("@c", "@b", TransferMode::Copy))
            .unwrap();
        manager.start(&first, vec![client.clone()], None).await.unwrap();
        manager.start(&second, vec![client], None).await.unwrap();
        manager.wait(&first).await.unwrap();
        manager.wait(&second).await.unwrap();

        // 两个会话共 6 次发送，每分钟上限 3 次
        assert_eq!(net.sent().len(), 6);
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_start_runs_once() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(manager(&dir, 20));
        let net = network(&[("@src", 1), ("@dst", 2)], 0);

        for _ in 0..20 {
            let id = manager
                .create_session(SessionConfig::transfer("@src", "@dst", TransferMode::Copy))
                .unwrap();
            let mut starts = Vec::new();
            for i in 0..8 {
                let manager = manager.clone();
                let id = id.clone();
                let client: ClientHandle = Arc::new(MockClient::new(&format!("c{}", i), net.clone()));
                starts.push(tokio::spawn(async move {
                    manager.start(&id, vec![client], None).await
                }));
            }
            let mut ok = 0;
            for start in starts {
                match start.await.unwrap() {
                    Ok(()) => ok += 1,
                    Err(e) => assert!(matches!(e, EngineError::AlreadyStarted(_))),
                }
            }
            assert_eq!(ok, 1);
            assert_eq!(manager.wait(&id).await.unwrap(), SessionStatus::Completed);
        }
    }

    #[test]
    fn test_session_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.transfer.default_mode = TransferMode::Forward;
        config.download.dir = dir.path().join("media");
        config.download.group_by_category = false;
        let manager = manager(&dir, 20).with_defaults(SessionDefaults::from_config(&config));

        let transfer = manager.session_config("@src", Some("@dst"));
        assert_eq!(transfer.mode, TransferMode::Forward);
        assert_eq!(transfer.target.as_deref(), Some("@dst"));

        let download = manager.session_config("@src", None);
        assert_eq!(download.mode, TransferMode::LocalDownload);
        let target = download.download.unwrap();
        assert_eq!(target.dir, dir.path().join("media"));
        assert!(!target.group_by_category);

        config.transfer.default_mode = TransferMode::LocalDownload;
        let manager = manager.with_defaults(SessionDefaults::from_config(&config));
        assert_eq!(
            manager.session_config("@src", Some("@dst")).mode,
            TransferMode::LocalDownload
        );
    }

    #[tokio::test]
    async fn test_remove_cancels() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, 20);
        let id = manager
            .create_session(SessionConfig::transfer("@src", "@dst", TransferMode::Copy))
            .unwrap();
        let token = manager.sessions.get(&id).unwrap().cancellation_token.clone();
        manager.remove_session(&id).unwrap();
        assert!(token.is_cancelled());
        assert!(manager.list_sessions().is_empty());
    }
}
