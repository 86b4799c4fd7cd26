//! 错误恢复引擎
//!
//! 根据 HiveError 类型返回 RecoveryAction：传输类故障交给 Supervisor 重连，协议错误直接判定会话失败，
//! 工具级错误与派发超时作为观察写回对话，推理失败与取消终止本次对话。

use crate::core::{HiveError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作（重连 / 失败 / 观察 / 终止）
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &HiveError) -> RecoveryAction {
        match err {
            HiveError::Transport(_) | HiveError::ConnectTimeout(_) => RecoveryAction::Reconnect,
            HiveError::Protocol(_) | HiveError::Config(_) => RecoveryAction::Fail,
            HiveError::ToolInvocation(msg) => RecoveryAction::Observe(msg.clone()),
            HiveError::Timeout(what) => {
                RecoveryAction::Observe(format!("timed out waiting for {what}"))
            }
            HiveError::SessionUnavailable(server) => RecoveryAction::Observe(format!(
                "tool server '{server}' is unavailable, try another tool or answer without it"
            )),
            HiveError::Reasoner(_) | HiveError::Cancelled => RecoveryAction::Abort,
        }
    }

    /// 连接阶段是否值得重试
    pub fn should_retry(&self, err: &HiveError) -> bool {
        self.handle(err) == RecoveryAction::Reconnect
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ProtocolError, TransportError};

    #[test]
    fn test_recovery_transport_reconnects() {
        let engine = RecoveryEngine::new();
        let err = HiveError::Transport(TransportError::Closed);
        assert_eq!(engine.handle(&err), RecoveryAction::Reconnect);
        assert!(engine.should_retry(&err));
    }

    #[test]
    fn test_recovery_connect_timeout_reconnects() {
        let engine = RecoveryEngine::new();
        let err = HiveError::ConnectTimeout("calc".to_string());
        assert!(engine.should_retry(&err));
    }

    #[test]
    fn test_recovery_protocol_error_is_not_retried() {
        let engine = RecoveryEngine::new();
        let err = HiveError::Protocol(ProtocolError::VersionMismatch {
            requested: "v1".to_string(),
            offered: "v0".to_string(),
        });
        assert_eq!(engine.handle(&err), RecoveryAction::Fail);
        assert!(!engine.should_retry(&err));
    }

    #[test]
    fn test_recovery_tool_error_becomes_observation() {
        let engine = RecoveryEngine::new();
        let err = HiveError::ToolInvocation("tool not found: fake_tool".to_string());
        match engine.handle(&err) {
            RecoveryAction::Observe(msg) => assert!(msg.contains("fake_tool")),
            other => panic!("Expected Observe, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_dispatch_timeout_becomes_observation() {
        let engine = RecoveryEngine::new();
        let err = HiveError::Timeout("calculate".to_string());
        assert!(matches!(engine.handle(&err), RecoveryAction::Observe(_)));
    }

    #[test]
    fn test_recovery_session_unavailable_names_server() {
        let engine = RecoveryEngine::new();
        let err = HiveError::SessionUnavailable("search".to_string());
        match engine.handle(&err) {
            RecoveryAction::Observe(msg) => assert!(msg.contains("search")),
            other => panic!("Expected Observe, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_cancelled_aborts() {
        let engine = RecoveryEngine::new();
        assert_eq!(engine.handle(&HiveError::Cancelled), RecoveryAction::Abort);
        assert_eq!(
            engine.handle(&HiveError::Reasoner("rate limited".to_string())),
            RecoveryAction::Abort
        );
    }
}
