//! 错误分类与恢复动作
//!
//! 与 RecoveryEngine 配合：TransportError / ProtocolError 对会话致命，ToolInvocation / Timeout 可恢复，
//! 根据 HiveError 决定 Reconnect / Fail / Observe / Abort。

use thiserror::Error;

/// 传输层错误：连接拒绝、管道断开、帧格式错误；本层不重试，由 ConnectionSupervisor 负责重连
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to spawn server process: {0}")]
    Spawn(String),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("http status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed framing: {0}")]
    Framing(String),

    #[error("transport not open")]
    NotOpen,

    #[error("transport closed")]
    Closed,
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        TransportError::Http(e.to_string())
    }
}

/// 协议错误：版本不匹配、握手或清单格式错误；对会话致命，不自动重试
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("protocol version mismatch: requested {requested}, server offered {offered}")]
    VersionMismatch { requested: String, offered: String },

    #[error("server rejected {method} ({code}): {message}")]
    Rejected {
        method: String,
        code: i64,
        message: String,
    },

    #[error("malformed handshake: {0}")]
    MalformedHandshake(String),

    #[error("malformed tool manifest: {0}")]
    MalformedManifest(String),

    #[error("tool '{0}' re-registered with a different schema")]
    SchemaConflict(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid session transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

/// 运行时统一错误
#[derive(Error, Debug, Clone)]
pub enum HiveError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// 派发截止超时
    #[error("timeout: {0}")]
    Timeout(String),

    /// 会话协商未在 connect timeout 内完成
    #[error("connect timeout: {0}")]
    ConnectTimeout(String),

    /// 未知工具、参数不合 schema 或工具自身报错（可恢复）
    #[error("tool invocation failed: {0}")]
    ToolInvocation(String),

    /// 会话不存在、未就绪或重连已放弃
    #[error("session unavailable: {0}")]
    SessionUnavailable(String),

    /// 外部推理步骤失败
    #[error("reasoner error: {0}")]
    Reasoner(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,
}

impl HiveError {
    /// 对所属会话致命（需交给 Supervisor 处理）
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, HiveError::Transport(_) | HiveError::Protocol(_))
    }
}

impl From<config::ConfigError> for HiveError {
    fn from(e: config::ConfigError) -> Self {
        HiveError::Config(e.to_string())
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 按退避策略重连会话（传输故障、连接超时）
    Reconnect,
    /// 会话致命且不重试（协议错误）
    Fail,
    /// 作为观察写回对话，交给下一轮推理
    Observe(String),
    /// 终止当前对话
    Abort,
}
