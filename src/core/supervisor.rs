//! 连接监管：每个工具服务端的连接、重连与注册表重建
//!
//! - 建连：每次尝试新建传输与会话，受 connect_timeout 约束；传输错误与连接超时按指数退避重试，协议错误不重试
//! - 监视：会话意外关闭（或连续超时达到阈值被回收）后在后台重连；期间该服务端的工具从注册表移除
//! - list_changed：重新拉取清单并整体重建注册表
//! - 调用出口：按工具来源找到就绪会话交给 Dispatcher；会话不可用时返回 SessionUnavailable

use std::fmt;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::{HiveError, RecoveryAction, RecoveryEngine, TransportError};
use crate::dispatch::{Dispatcher, ToolRequest, ToolResult, ToolStatus};
use crate::react::ToolInvoker;
use crate::session::Session;
use crate::tools::{ToolDefinition, ToolRegistry};
use crate::transport::Transport;

/// 重连与退避策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub connect_timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// 连续派发超时达到此值视为会话失败
    pub timeout_threshold: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(12),
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            timeout_threshold: 3,
        }
    }
}

impl RetryPolicy {
    /// 第 attempt 次失败后的等待：initial * 2^attempt，封顶 max_backoff
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// 为一次连接尝试构造全新的传输
pub trait Connector: Send + Sync {
    fn transport(&self) -> Result<Arc<dyn Transport>, TransportError>;
}

impl<F> Connector for F
where
    F: Fn() -> Result<Arc<dyn Transport>, TransportError> + Send + Sync,
{
    fn transport(&self) -> Result<Arc<dyn Transport>, TransportError> {
        self()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStatus {
    Connecting,
    Ready,
    Reconnecting,
    Failed(String),
    Stopped,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerStatus::Connecting => f.write_str("connecting"),
            ServerStatus::Ready => f.write_str("ready"),
            ServerStatus::Reconnecting => f.write_str("reconnecting"),
            ServerStatus::Failed(reason) => write!(f, "failed: {reason}"),
            ServerStatus::Stopped => f.write_str("stopped"),
        }
    }
}

struct Managed {
    name: String,
    connector: Arc<dyn Connector>,
    session: RwLock<Option<Arc<Session>>>,
    status: RwLock<ServerStatus>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Managed {
    fn session(&self) -> Option<Arc<Session>> {
        self.session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_session(&self, session: Option<Arc<Session>>) {
        *self.session.write().unwrap_or_else(|e| e.into_inner()) = session;
    }

    fn status(&self) -> ServerStatus {
        self.status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_status(&self, status: ServerStatus) {
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = status;
    }
}

pub struct ConnectionSupervisor {
    registry: Arc<ToolRegistry>,
    dispatcher: Arc<Dispatcher>,
    policy: RetryPolicy,
    recovery: RecoveryEngine,
    /// 按添加顺序保存，注册表重建时保持服务端顺序
    servers: RwLock<Vec<Arc<Managed>>>,
    shutdown: CancellationToken,
}

impl ConnectionSupervisor {
    pub fn new(registry: Arc<ToolRegistry>, dispatcher: Arc<Dispatcher>, policy: RetryPolicy) -> Arc<Self> {
        Arc::new(Self {
            registry,
            dispatcher,
            policy,
            recovery: RecoveryEngine::new(),
            servers: RwLock::new(Vec::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn managed(&self, name: &str) -> Option<Arc<Managed>> {
        self.servers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|m| m.name == name)
            .cloned()
    }

    /// 添加并连接一个服务端（含重试）；初次连接失败时返回错误，服务端保留为 Failed
    pub async fn add_server(
        self: &Arc<Self>,
        name: impl Into<String>,
        connector: Arc<dyn Connector>,
    ) -> Result<(), HiveError> {
        let name = name.into();
        if self.managed(&name).is_some() {
            return Err(HiveError::Config(format!("duplicate server name '{name}'")));
        }
        let managed = Arc::new(Managed {
            name: name.clone(),
            connector,
            session: RwLock::new(None),
            status: RwLock::new(ServerStatus::Connecting),
            watcher: Mutex::new(None),
        });
        self.servers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(managed.clone());

        match self.connect_with_retry(&managed).await {
            Ok(session) => {
                self.install(&managed, session).await;
                Ok(())
            }
            Err(e) => {
                tracing::error!(server = %name, error = %e, "giving up on server");
                managed.set_status(ServerStatus::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn connect_with_retry(&self, managed: &Managed) -> Result<Arc<Session>, HiveError> {
        let mut attempt = 0;
        loop {
            let result = match managed.connector.transport() {
                Ok(transport) => {
                    let session = Session::new(managed.name.clone(), transport);
                    session
                        .connect(self.policy.connect_timeout)
                        .await
                        .map(|()| session)
                }
                Err(e) => Err(HiveError::from(e)),
            };
            let err = match result {
                Ok(session) => return Ok(session),
                Err(e) => e,
            };
            if self.recovery.handle(&err) != RecoveryAction::Reconnect || attempt >= self.policy.max_retries {
                return Err(err);
            }
            let wait = self.policy.backoff(attempt);
            attempt += 1;
            tracing::warn!(
                server = %managed.name,
                error = %err,
                attempt,
                max_retries = self.policy.max_retries,
                backoff_ms = wait.as_millis() as u64,
                "connect failed, retrying"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(HiveError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// 会话就绪：登记、重建注册表、启动监视任务
    async fn install(self: &Arc<Self>, managed: &Arc<Managed>, session: Arc<Session>) {
        managed.set_session(Some(session.clone()));
        managed.set_status(ServerStatus::Ready);
        self.rebuild_registry();

        let weak = Arc::downgrade(self);
        let target = managed.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(watch_session(weak, target, session, shutdown));
        *managed.watcher.lock().await = Some(handle);
    }

    /// 整体重建：按服务端顺序汇总所有就绪会话的清单
    pub fn rebuild_registry(&self) {
        let servers = self.servers.read().unwrap_or_else(|e| e.into_inner()).clone();
        let defs: Vec<ToolDefinition> = servers
            .iter()
            .filter_map(|m| m.session())
            .filter(|s| s.is_ready())
            .flat_map(|s| s.manifest())
            .collect();
        self.registry.rebuild(defs);
    }

    /// 当前就绪会话；否则 SessionUnavailable
    pub fn session(&self, name: &str) -> Result<Arc<Session>, HiveError> {
        self.managed(name)
            .and_then(|m| m.session())
            .filter(|s| s.is_ready())
            .ok_or_else(|| HiveError::SessionUnavailable(name.to_string()))
    }

    pub fn status(&self, name: &str) -> Option<ServerStatus> {
        self.managed(name).map(|m| m.status())
    }

    pub fn servers(&self) -> Vec<(String, ServerStatus)> {
        self.servers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|m| (m.name.clone(), m.status()))
            .collect()
    }

    /// 回收会话（例如连续超时）：关闭后由监视任务走重连路径
    pub async fn recycle(&self, name: &str, reason: &str) {
        if let Some(session) = self.managed(name).and_then(|m| m.session()) {
            tracing::warn!(server = %name, reason, "recycling session");
            session.close().await;
        }
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let servers = self.servers.read().unwrap_or_else(|e| e.into_inner()).clone();
        for managed in servers {
            if let Some(handle) = managed.watcher.lock().await.take() {
                let _ = handle.await;
            }
            if let Some(session) = managed.session() {
                session.close().await;
            }
            managed.set_session(None);
            managed.set_status(ServerStatus::Stopped);
        }
        self.registry.rebuild(Vec::new());
        tracing::info!("connection supervisor stopped");
    }
}

enum WatchEvent {
    Lost,
    ToolsChanged,
    Shutdown,
}

async fn watch_session(
    supervisor: Weak<ConnectionSupervisor>,
    managed: Arc<Managed>,
    session: Arc<Session>,
    shutdown: CancellationToken,
) {
    let mut session = session;
    loop {
        let mut state_rx = session.subscribe();
        let event = loop {
            if state_rx.borrow_and_update().is_terminal() {
                break WatchEvent::Lost;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break WatchEvent::Shutdown,
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break WatchEvent::Lost;
                    }
                }
                _ = session.tools_changed().notified() => break WatchEvent::ToolsChanged,
            }
        };

        let Some(sup) = supervisor.upgrade() else {
            return;
        };
        match event {
            WatchEvent::Shutdown => return,
            WatchEvent::ToolsChanged => {
                match tokio::time::timeout(sup.policy.connect_timeout, session.refresh_manifest()).await {
                    Ok(Ok(tools)) => {
                        tracing::info!(server = %managed.name, tools = tools.len(), "manifest refreshed");
                        sup.rebuild_registry();
                    }
                    Ok(Err(e)) => tracing::warn!(server = %managed.name, error = %e, "manifest refresh failed"),
                    Err(_) => tracing::warn!(server = %managed.name, "manifest refresh timed out"),
                }
            }
            WatchEvent::Lost => {
                if shutdown.is_cancelled() {
                    return;
                }
                tracing::warn!(server = %managed.name, state = %session.state(), "session lost, reconnecting");
                managed.set_session(None);
                managed.set_status(ServerStatus::Reconnecting);
                sup.rebuild_registry();
                match sup.connect_with_retry(&managed).await {
                    Ok(next) => {
                        tracing::info!(server = %managed.name, "reconnected");
                        managed.set_session(Some(next.clone()));
                        managed.set_status(ServerStatus::Ready);
                        sup.rebuild_registry();
                        session = next;
                    }
                    Err(e) => {
                        tracing::error!(server = %managed.name, error = %e, "reconnect failed, server unavailable");
                        managed.set_status(ServerStatus::Failed(e.to_string()));
                        return;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ToolInvoker for ConnectionSupervisor {
    async fn invoke(
        &self,
        tool: &ToolDefinition,
        request: ToolRequest,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, HiveError> {
        let session = self.session(&tool.origin)?;
        let result = self.dispatcher.dispatch(&session, request, cancel).await;
        if result.status == ToolStatus::Timeout
            && session.consecutive_timeouts() >= self.policy.timeout_threshold
        {
            self.recycle(
                &tool.origin,
                &format!("{} consecutive timeouts", session.consecutive_timeouts()),
            )
            .await;
        }
        Ok(result)
    }
}
