//! 派发器：ToolRequest → tools/call 请求 → 关联回复 → ToolResult
//!
//! 每个会话最多 max_in_flight 个在途调用（Semaphore）；登记待决表后再发送；
//! 截止时间到达返回 Timeout 并移除 id（迟到响应由会话读任务丢弃）；对话取消令牌触发时返回 Cancelled
//! 并尽力发送 notifications/cancelled。每次调用输出一行 JSON 审计日志。

pub mod call;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::core::TransportError;
use crate::protocol::{
    methods, CallToolParams, CallToolResult, CancelledParams, Message, Notification, Request,
    RequestId,
};
use crate::session::{PendingTable, Session};

pub use call::{ToolCall, ToolRequest, ToolResult, ToolStatus};

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// 默认单次调用超时
    pub call_timeout: Duration,
    /// 每个会话的在途调用上限
    pub max_in_flight: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            max_in_flight: 16,
        }
    }
}

/// 离开作用域时移除待决项（调用方 future 被丢弃时同样生效）
struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

pub struct Dispatcher {
    config: DispatchConfig,
    permits: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            config,
            permits: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    fn semaphore(&self, session: &str) -> Arc<Semaphore> {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        permits
            .entry(session.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_in_flight.max(1))))
            .clone()
    }

    /// 派发一次调用；总是返回恰好一个 ToolResult
    pub async fn dispatch(
        &self,
        session: &Session,
        request: ToolRequest,
        cancel: &CancellationToken,
    ) -> ToolResult {
        let timeout = request.timeout.unwrap_or(self.config.call_timeout);
        let call = ToolCall::new(session.next_request_id(), request, timeout);
        let args_preview = args_preview(&call.arguments);
        let result = self.run(session, &call, cancel).await;

        let audit = serde_json::json!({
            "event": "tool_audit",
            "server": session.name(),
            "tool": call.tool,
            "id": call.id.to_string(),
            "ok": result.is_success(),
            "outcome": result.status.to_string(),
            "duration_ms": u64::try_from(result.elapsed.as_millis()).unwrap_or(u64::MAX),
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit, "tool");
        result
    }

    async fn run(&self, session: &Session, call: &ToolCall, cancel: &CancellationToken) -> ToolResult {
        if !session.is_ready() {
            return ToolResult::failure(
                call,
                ToolStatus::TransportError,
                format!(
                    "session unavailable: server '{}' is {}",
                    session.name(),
                    session.state()
                ),
            );
        }

        let semaphore = self.semaphore(session.name());
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return ToolResult::failure(call, ToolStatus::Cancelled, "cancelled before dispatch");
            }
            _ = tokio::time::sleep_until(call.deadline) => {
                return ToolResult::failure(call, ToolStatus::Timeout, "timed out waiting for a dispatch slot");
            }
            permit = semaphore.acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return ToolResult::failure(call, ToolStatus::TransportError, "dispatcher closed"),
            },
        };

        let params = serde_json::to_value(CallToolParams {
            name: call.tool.clone(),
            arguments: call.arguments.clone(),
        })
        .unwrap_or(Value::Null);

        // 先登记，再发送
        let rx = session.pending().insert(call.id.clone());
        let _guard = PendingGuard {
            table: session.pending(),
            id: call.id.clone(),
        };
        let msg = Message::from(Request::new(call.id.clone(), methods::TOOLS_CALL, Some(params)));
        // 发送本身也受截止时间与取消约束：部分传输在 send 中等待整个回复
        let exchange = async {
            match session.send(&msg).await {
                Ok(()) => rx.await.unwrap_or(Err(TransportError::Closed)),
                Err(e) => Err(e),
            }
        };

        tokio::select! {
            biased;
            reply = exchange => match reply {
                Ok(response) => {
                    session.record_response();
                    match response.into_result() {
                        Ok(value) => interpret(call, value),
                        Err(rpc) => ToolResult::failure(call, ToolStatus::ToolError, rpc.to_string()),
                    }
                }
                Err(e) => ToolResult::failure(call, ToolStatus::TransportError, e.to_string()),
            },
            _ = cancel.cancelled() => {
                session.pending().remove(&call.id);
                send_cancelled(session, &call.id, "conversation cancelled").await;
                ToolResult::failure(call, ToolStatus::Cancelled, "cancelled")
            }
            _ = tokio::time::sleep_until(call.deadline) => {
                session.pending().remove(&call.id);
                let streak = session.record_timeout();
                tracing::warn!(
                    server = %session.name(),
                    tool = %call.tool,
                    id = %call.id,
                    consecutive = streak,
                    "tool call timed out"
                );
                send_cancelled(session, &call.id, "timeout").await;
                let waited = call.deadline - call.issued_at;
                ToolResult::failure(
                    call,
                    ToolStatus::Timeout,
                    format!("no response from '{}' within {:?}", call.tool, waited),
                )
            }
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DispatchConfig::default())
    }
}

fn interpret(call: &ToolCall, value: Value) -> ToolResult {
    match serde_json::from_value::<CallToolResult>(value) {
        Ok(result) if result.is_error => {
            ToolResult::failure(call, ToolStatus::ToolError, result.joined_text())
        }
        Ok(result) => ToolResult::success(call, result.payload()),
        Err(e) => ToolResult::failure(
            call,
            ToolStatus::ToolError,
            format!("malformed tools/call result: {e}"),
        ),
    }
}

async fn send_cancelled(session: &Session, id: &RequestId, reason: &str) {
    let params = serde_json::to_value(CancelledParams {
        request_id: id.clone(),
        reason: Some(reason.to_string()),
    })
    .ok();
    let note = Message::from(Notification::new(methods::CANCELLED, params));
    if let Err(e) = session.send(&note).await {
        tracing::debug!(server = %session.name(), error = %e, "failed to send cancellation");
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
