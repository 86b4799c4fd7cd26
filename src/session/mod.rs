//! 会话：与单个工具服务端的一条协商连接
//!
//! connect() 依次完成：打开传输 → initialize（版本与能力）→ notifications/initialized → tools/list（分页）→ Ready。
//! 后台读任务负责：按 id 解决待决调用、丢弃迟到响应、应答服务端 ping、收到 list_changed 时通知监管者。
//! 传输关闭时所有待决调用以传输错误结束，状态进入 Closed（握手期间则为 Errored）。

pub mod pending;
pub mod state;

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::{HiveError, ProtocolError, TransportError};
use crate::protocol::{
    is_supported_version, methods, Implementation, InitializeParams, InitializeResult,
    ListToolsParams, ListToolsResult, Message, Notification, Request, RequestId, Response,
    RpcError, ServerCapabilities, LATEST_PROTOCOL_VERSION,
};
use crate::tools::ToolDefinition;
use crate::transport::Transport;

pub use pending::{PendingTable, Reply};
pub use state::SessionState;

/// tools/list 分页上限，防止服务端游标循环
const MAX_MANIFEST_PAGES: usize = 64;

/// 握手结果
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    pub server_info: Option<Implementation>,
    pub instructions: Option<String>,
}

pub struct Session {
    name: String,
    transport: Arc<dyn Transport>,
    requested_version: String,
    state: watch::Sender<SessionState>,
    negotiated: RwLock<Option<Negotiated>>,
    manifest: RwLock<Vec<ToolDefinition>>,
    next_id: AtomicI64,
    pending: PendingTable,
    consecutive_timeouts: AtomicU32,
    tools_changed: Notify,
    reader: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Session {
    pub fn new(name: impl Into<String>, transport: Arc<dyn Transport>) -> Arc<Self> {
        Self::with_version(name, transport, LATEST_PROTOCOL_VERSION)
    }

    /// 指定请求的协议版本（默认为最新支持版本）
    pub fn with_version(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        version: impl Into<String>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Arc::new(Self {
            name: name.into(),
            transport,
            requested_version: version.into(),
            state,
            negotiated: RwLock::new(None),
            manifest: RwLock::new(Vec::new()),
            next_id: AtomicI64::new(1),
            pending: PendingTable::new(),
            consecutive_timeouts: AtomicU32::new(0),
            tools_changed: Notify::new(),
            reader: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// 订阅状态变化（监管者据此发现意外关闭）
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn negotiated(&self) -> Option<Negotiated> {
        self.negotiated
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// 清单快照
    pub fn manifest(&self) -> Vec<ToolDefinition> {
        self.manifest
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    /// 服务端发出 tools/list_changed 时唤醒
    pub fn tools_changed(&self) -> &Notify {
        &self.tools_changed
    }

    /// 记录一次派发超时，返回连续超时次数
    pub fn record_timeout(&self) -> u32 {
        self.consecutive_timeouts.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn record_response(&self) {
        self.consecutive_timeouts.store(0, Ordering::Release);
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts.load(Ordering::Acquire)
    }

    pub fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn transition(&self, to: SessionState) -> Result<(), ProtocolError> {
        let mut result = Ok(());
        self.state.send_if_modified(|current| {
            if current.can_transition_to(to) {
                tracing::debug!(server = %self.name, from = %current, to = %to, "session transition");
                *current = to;
                true
            } else {
                result = Err(ProtocolError::InvalidTransition {
                    from: current.to_string(),
                    to: to.to_string(),
                });
                false
            }
        });
        result
    }

    fn mark_errored(&self) {
        let _ = self.transition(SessionState::Errored);
    }

    /// 建立会话；超过 connect_timeout 未就绪返回 ConnectTimeout。失败后会话处于 Errored，不可再派发
    pub async fn connect(self: &Arc<Self>, connect_timeout: Duration) -> Result<(), HiveError> {
        let current = self.state();
        if current != SessionState::Disconnected {
            return Err(ProtocolError::InvalidTransition {
                from: current.to_string(),
                to: SessionState::Connecting.to_string(),
            }
            .into());
        }
        let outcome = tokio::time::timeout(connect_timeout, self.establish()).await;
        let err = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e,
            Err(_) => HiveError::ConnectTimeout(format!(
                "server '{}' did not complete negotiation within {:?}",
                self.name, connect_timeout
            )),
        };
        tracing::warn!(server = %self.name, error = %err, "session negotiation failed");
        self.mark_errored();
        self.teardown(TransportError::Closed).await;
        Err(err)
    }

    async fn establish(self: &Arc<Self>) -> Result<(), HiveError> {
        self.transition(SessionState::Connecting)?;
        self.transport.open().await?;
        self.transition(SessionState::Negotiating)?;
        self.spawn_reader().await;

        let params = serde_json::to_value(InitializeParams::new(self.requested_version.clone()))
            .map_err(|e| ProtocolError::MalformedHandshake(e.to_string()))?;
        let raw = self.request(methods::INITIALIZE, Some(params)).await?;
        let init: InitializeResult = serde_json::from_value(raw)
            .map_err(|e| ProtocolError::MalformedHandshake(e.to_string()))?;
        if init.protocol_version != self.requested_version
            && !is_supported_version(&init.protocol_version)
        {
            return Err(ProtocolError::VersionMismatch {
                requested: self.requested_version.clone(),
                offered: init.protocol_version,
            }
            .into());
        }

        self.notify(methods::INITIALIZED, None).await?;
        let tools = self.fetch_manifest().await?;

        tracing::info!(
            server = %self.name,
            version = %init.protocol_version,
            capabilities = ?init.capabilities.names(),
            tools = tools.len(),
            "session ready"
        );
        *self.negotiated.write().unwrap_or_else(|e| e.into_inner()) = Some(Negotiated {
            protocol_version: init.protocol_version,
            capabilities: init.capabilities,
            server_info: init.server_info,
            instructions: init.instructions,
        });
        *self.manifest.write().unwrap_or_else(|e| e.into_inner()) = tools;
        self.transition(SessionState::Ready)?;
        Ok(())
    }

    /// 拉取完整清单（跟随 nextCursor）；同一清单内重名视为格式错误
    async fn fetch_manifest(&self) -> Result<Vec<ToolDefinition>, HiveError> {
        let mut tools = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_MANIFEST_PAGES {
            let params = serde_json::to_value(ListToolsParams {
                cursor: cursor.take(),
            })
            .map_err(|e| ProtocolError::MalformedManifest(e.to_string()))?;
            let raw = self.request(methods::TOOLS_LIST, Some(params)).await?;
            let page: ListToolsResult = serde_json::from_value(raw)
                .map_err(|e| ProtocolError::MalformedManifest(e.to_string()))?;
            for tool in page.tools {
                if !seen.insert(tool.name.clone()) {
                    return Err(ProtocolError::MalformedManifest(format!(
                        "duplicate tool '{}'",
                        tool.name
                    ))
                    .into());
                }
                tools.push(ToolDefinition::from_wire(tool, &self.name));
            }
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }
        Err(ProtocolError::MalformedManifest(format!(
            "tools/list exceeded {MAX_MANIFEST_PAGES} pages"
        ))
        .into())
    }

    /// 重新拉取清单（list_changed 之后）；成功则替换快照
    pub async fn refresh_manifest(&self) -> Result<Vec<ToolDefinition>, HiveError> {
        if !self.is_ready() {
            return Err(HiveError::SessionUnavailable(self.name.clone()));
        }
        let tools = self.fetch_manifest().await?;
        *self.manifest.write().unwrap_or_else(|e| e.into_inner()) = tools.clone();
        Ok(tools)
    }

    /// 发送请求并等待回复（握手与清单刷新用；工具调用走 Dispatcher）
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, HiveError> {
        let id = self.next_request_id();
        let rx = self.pending.insert(id.clone());
        let msg = Message::from(Request::new(id.clone(), method, params));
        if let Err(e) = self.send(&msg).await {
            self.pending.remove(&id);
            return Err(e.into());
        }
        let reply = rx.await.map_err(|_| TransportError::Closed)??;
        reply.into_result().map_err(|e| {
            HiveError::Protocol(ProtocolError::Rejected {
                method: method.to_string(),
                code: e.code,
                message: e.message,
            })
        })
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        self.send(&Message::from(Notification::new(method, params)))
            .await
    }

    /// 编码并经传输发送一条消息
    pub async fn send(&self, msg: &Message) -> Result<(), TransportError> {
        let frame = msg
            .encode()
            .map_err(|e| TransportError::Framing(e.to_string()))?;
        tracing::trace!(server = %self.name, frame = %String::from_utf8_lossy(&frame), "send");
        self.transport.send(frame).await
    }

    async fn spawn_reader(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let transport = self.transport.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let reason = loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => break TransportError::Closed,
                    next = transport.receive() => next,
                };
                let frame = match next {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break TransportError::Closed,
                    Err(e) => break e,
                };
                let Some(session) = weak.upgrade() else {
                    return;
                };
                session.handle_frame(&frame).await;
            };
            if let Some(session) = weak.upgrade() {
                session.on_transport_closed(reason);
            }
        });
        *self.reader.lock().await = Some(handle);
    }

    async fn handle_frame(&self, frame: &[u8]) {
        let messages = match Message::decode(frame) {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(server = %self.name, error = %e, "dropping undecodable frame");
                return;
            }
        };
        for msg in messages {
            match msg {
                Message::Response(resp) => {
                    let id = resp.id.clone();
                    if !self.pending.resolve(resp) {
                        tracing::debug!(server = %self.name, id = %id, "discarding late response");
                    }
                }
                Message::Request(req) => {
                    let reply = if req.method == methods::PING {
                        Response::success(req.id, Value::Object(Default::default()))
                    } else {
                        Response::failure(req.id, RpcError::method_not_found(&req.method))
                    };
                    if let Err(e) = self.send(&Message::from(reply)).await {
                        tracing::warn!(server = %self.name, error = %e, "failed to answer server request");
                    }
                }
                Message::Notification(n) => {
                    if n.method == methods::TOOLS_LIST_CHANGED {
                        tracing::info!(server = %self.name, "server tool list changed");
                        self.tools_changed.notify_one();
                    } else {
                        tracing::debug!(server = %self.name, method = %n.method, "ignoring notification");
                    }
                }
            }
        }
    }

    fn on_transport_closed(&self, reason: TransportError) {
        let failed = self.pending.fail_all(reason.clone());
        match self.state() {
            SessionState::Ready => {
                tracing::warn!(server = %self.name, error = %reason, failed, "transport closed");
                let _ = self.transition(SessionState::Closing);
                let _ = self.transition(SessionState::Closed);
            }
            SessionState::Closing => {
                let _ = self.transition(SessionState::Closed);
            }
            SessionState::Connecting | SessionState::Negotiating => self.mark_errored(),
            _ => {}
        }
    }

    async fn teardown(&self, reason: TransportError) {
        self.shutdown.cancel();
        if let Err(e) = self.transport.close().await {
            tracing::debug!(server = %self.name, error = %e, "transport close failed");
        }
        if let Some(handle) = self.reader.lock().await.take() {
            let _ = handle.await;
        }
        self.pending.fail_all(reason);
    }

    /// 主动关闭：Ready → Closing → Closed
    pub async fn close(&self) {
        if self.state().is_terminal() {
            return;
        }
        let _ = self.transition(SessionState::Closing);
        self.teardown(TransportError::Closed).await;
        let _ = self.transition(SessionState::Closed);
        tracing::info!(server = %self.name, "session closed");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("pending", &self.pending.len())
            .finish()
    }
}
