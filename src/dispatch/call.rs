//! 工具调用与结果
//!
//! ToolRequest 是推理步骤给出的调用意图；Dispatcher 为其分配 correlation id 与截止时间得到 ToolCall；
//! 每个 ToolCall 恰好得到一个 ToolResult。

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use crate::protocol::RequestId;

/// 推理步骤请求的一次调用
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolRequest {
    pub tool: String,
    pub arguments: Value,
    /// 覆盖默认的单次调用超时
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl ToolRequest {
    pub fn new(tool: impl Into<String>, arguments: Value) -> Self {
        Self {
            tool: tool.into(),
            arguments,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// 已分配 id 的在途调用
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: RequestId,
    pub tool: String,
    pub arguments: Value,
    pub issued_at: Instant,
    pub deadline: Instant,
}

impl ToolCall {
    pub fn new(id: RequestId, request: ToolRequest, timeout: Duration) -> Self {
        let issued_at = Instant::now();
        Self {
            id,
            tool: request.tool,
            arguments: request.arguments,
            issued_at,
            deadline: issued_at + timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    /// 工具执行了但报告失败
    ToolError,
    TransportError,
    Timeout,
    Cancelled,
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ToolStatus::Success => "ok",
            ToolStatus::ToolError => "tool_error",
            ToolStatus::TransportError => "transport_error",
            ToolStatus::Timeout => "timeout",
            ToolStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    pub id: RequestId,
    pub tool: String,
    pub status: ToolStatus,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl ToolResult {
    pub fn success(call: &ToolCall, payload: Value) -> Self {
        Self::resolved(call, ToolStatus::Success, payload, None)
    }

    pub fn failure(call: &ToolCall, status: ToolStatus, error: impl Into<String>) -> Self {
        Self::resolved(call, status, Value::Null, Some(error.into()))
    }

    fn resolved(call: &ToolCall, status: ToolStatus, payload: Value, error: Option<String>) -> Self {
        Self {
            id: call.id.clone(),
            tool: call.tool.clone(),
            status,
            payload,
            error,
            elapsed: call.issued_at.elapsed(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }

    /// 写回对话的观察文本
    pub fn observation(&self) -> String {
        match (&self.status, &self.error) {
            (ToolStatus::Success, _) => match &self.payload {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            (status, Some(err)) => format!("{status}: {err}"),
            (status, None) => status.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call() -> ToolCall {
        ToolCall::new(
            RequestId::from(3),
            ToolRequest::new("calculate", json!({"expression": "1+1"})),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_deadline_follows_timeout() {
        let c = call();
        assert_eq!(c.deadline - c.issued_at, Duration::from_secs(5));
    }

    #[test]
    fn test_observation_text() {
        let c = call();
        assert_eq!(ToolResult::success(&c, json!("2")).observation(), "2");
        assert_eq!(ToolResult::success(&c, json!({"result": 2})).observation(), "{\"result\":2}");
        let r = ToolResult::failure(&c, ToolStatus::Timeout, "no reply within 5s");
        assert_eq!(r.observation(), "timeout: no reply within 5s");
        assert_eq!(r.id, RequestId::from(3));
    }
}
