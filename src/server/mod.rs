//! 工具服务端：把 ToolHandler 集合按 MCP 暴露出去
//!
//! handle_request 处理单个请求（initialize / ping / tools/list / tools/call），与传输无关；
//! serve 在任意 Transport 上循环读帧，每个请求独立任务执行，notifications/cancelled 取消对应请求。

pub mod builtin;
#[cfg(feature = "http-server")]
pub mod http;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::core::TransportError;
use crate::protocol::types::empty_object_schema;
use crate::protocol::{
    is_supported_version, methods, CallToolParams, CallToolResult, CancelledParams, Implementation,
    InitializeParams, InitializeResult, ListToolsParams, ListToolsResult, Message, Notification,
    Request, RequestId, Response, RpcError, ServerCapabilities, ToolsCapability, WireTool,
    LATEST_PROTOCOL_VERSION,
};
use crate::tools::validate_arguments;
use crate::transport::Transport;

pub use builtin::{CalculateTool, GetTimeTool};

/// 服务端工具：名称、描述、参数 schema、异步执行
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 默认无参数
    fn input_schema(&self) -> Value {
        empty_object_schema()
    }

    /// Ok 为结果载荷（对象按 JSON 返回，字符串按文本返回），Err 为工具级错误
    async fn call(&self, args: Value) -> Result<Value, String>;
}

pub struct ToolServer {
    info: Implementation,
    tools: RwLock<Vec<Arc<dyn ToolHandler>>>,
    page_size: Option<usize>,
    in_flight: Mutex<HashMap<RequestId, CancellationToken>>,
}

impl ToolServer {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            info: Implementation {
                name: name.into(),
                version: version.into(),
            },
            tools: RwLock::new(Vec::new()),
            page_size: None,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_tool(self, tool: impl ToolHandler + 'static) -> Self {
        self.add_tool(Arc::new(tool));
        self
    }

    /// 注册 get_time 与 calculate
    pub fn with_builtin_tools(self) -> Self {
        self.with_tool(GetTimeTool).with_tool(CalculateTool)
    }

    /// tools/list 分页大小
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size.max(1));
        self
    }

    pub fn info(&self) -> &Implementation {
        &self.info
    }

    /// 运行期增删工具；同名替换。调用方负责发送 tools/list_changed
    pub fn add_tool(&self, tool: Arc<dyn ToolHandler>) {
        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        tools.retain(|t| t.name() != tool.name());
        tools.push(tool);
    }

    pub fn remove_tool(&self, name: &str) -> bool {
        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        let before = tools.len();
        tools.retain(|t| t.name() != name);
        tools.len() != before
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.snapshot().iter().map(|t| t.name().to_string()).collect()
    }

    fn snapshot(&self) -> Vec<Arc<dyn ToolHandler>> {
        self.tools.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn find(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.snapshot().into_iter().find(|t| t.name() == name)
    }

    /// 处理单个请求并生成回复
    pub async fn handle_request(&self, request: Request) -> Response {
        let id = request.id.clone();
        let outcome = match request.method.as_str() {
            methods::INITIALIZE => self.initialize(request.params),
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => self.list_tools(request.params),
            methods::TOOLS_CALL => self.call_tool(request.params).await,
            other => Err(RpcError::method_not_found(other)),
        };
        match outcome {
            Ok(result) => Response::success(id, result),
            Err(err) => Response::failure(id, err),
        }
    }

    fn initialize(&self, params: Option<Value>) -> Result<Value, RpcError> {
        let params: InitializeParams = parse_params(params)?;
        // 客户端版本受支持则回显，否则给出本端最新版本，由客户端决定是否断开
        let version = if is_supported_version(&params.protocol_version) {
            params.protocol_version
        } else {
            LATEST_PROTOCOL_VERSION.to_string()
        };
        tracing::info!(
            client = %params.client_info.name,
            version = %version,
            "initialize"
        );
        let result = InitializeResult {
            protocol_version: version,
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: true }),
                other: Default::default(),
            },
            server_info: Some(self.info.clone()),
            instructions: None,
        };
        serde_json::to_value(result).map_err(|e| RpcError::internal(e.to_string()))
    }

    fn list_tools(&self, params: Option<Value>) -> Result<Value, RpcError> {
        let params: ListToolsParams = match params {
            Some(Value::Null) | None => ListToolsParams::default(),
            Some(v) => parse_params(Some(v))?,
        };
        let tools = self.snapshot();
        let start = match params.cursor.as_deref() {
            None => 0,
            Some(c) => c
                .parse::<usize>()
                .ok()
                .filter(|i| *i <= tools.len())
                .ok_or_else(|| RpcError::invalid_params(format!("invalid cursor: {c}")))?,
        };
        let end = match self.page_size {
            Some(size) => (start + size).min(tools.len()),
            None => tools.len(),
        };
        let page = tools[start..end]
            .iter()
            .map(|t| WireTool {
                name: t.name().to_string(),
                description: Some(t.description().to_string()),
                input_schema: t.input_schema(),
            })
            .collect();
        let result = ListToolsResult {
            tools: page,
            next_cursor: (end < tools.len()).then(|| end.to_string()),
        };
        serde_json::to_value(result).map_err(|e| RpcError::internal(e.to_string()))
    }

    async fn call_tool(&self, params: Option<Value>) -> Result<Value, RpcError> {
        let params: CallToolParams = parse_params(params)?;
        let tool = self
            .find(&params.name)
            .ok_or_else(|| RpcError::invalid_params(format!("Unknown tool: {}", params.name)))?;

        let result = match validate_arguments(&tool.input_schema(), &params.arguments) {
            Err(reason) => CallToolResult::error(format!(
                "invalid arguments for {}: {reason}",
                params.name
            )),
            Ok(()) => match tool.call(params.arguments).await {
                Ok(Value::String(text)) => CallToolResult::text(text),
                Ok(value) => CallToolResult::json(value),
                Err(e) => {
                    tracing::warn!(tool = %params.name, error = %e, "tool call failed");
                    CallToolResult::error(e)
                }
            },
        };
        serde_json::to_value(result).map_err(|e| RpcError::internal(e.to_string()))
    }

    /// 在传输上服务直到对端关闭或 shutdown 触发
    pub async fn serve(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
        shutdown: CancellationToken,
    ) -> Result<(), TransportError> {
        transport.open().await?;
        tracing::info!(server = %self.info.name, kind = %transport.kind(), "tool server started");

        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = transport.receive() => frame,
            };
            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::info!("peer closed, stopping tool server");
                    break;
                }
                Err(e) => {
                    self.cancel_all();
                    return Err(e);
                }
            };
            let messages = match Message::decode(&frame) {
                Ok(messages) => messages,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed frame");
                    continue;
                }
            };
            for message in messages {
                self.dispatch_message(message, &transport);
            }
        }

        self.cancel_all();
        let _ = transport.close().await;
        Ok(())
    }

    fn dispatch_message(self: &Arc<Self>, message: Message, transport: &Arc<dyn Transport>) {
        match message {
            Message::Request(request) => {
                let server = Arc::clone(self);
                let transport = Arc::clone(transport);
                tokio::spawn(async move {
                    let id = request.id.clone();
                    // 已取消的请求不再回复
                    let Some(response) = server.respond(request).await else {
                        return;
                    };
                    match Message::from(response).encode() {
                        Ok(frame) => {
                            if let Err(e) = transport.send(frame).await {
                                tracing::warn!(id = %id, error = %e, "failed to send response");
                            }
                        }
                        Err(e) => tracing::error!(id = %id, error = %e, "failed to encode response"),
                    }
                });
            }
            Message::Notification(notification) => self.handle_notification(notification),
            Message::Response(response) => {
                tracing::debug!(id = %response.id, "ignoring response from client");
            }
        }
    }

    /// 登记为可取消后处理请求；被 notifications/cancelled 取消时返回 None
    pub async fn respond(&self, request: Request) -> Option<Response> {
        let id = request.id.clone();
        let method = request.method.clone();
        let token = CancellationToken::new();
        self.in_flight_table().insert(id.clone(), token.clone());
        let response = tokio::select! {
            _ = token.cancelled() => None,
            response = self.handle_request(request) => Some(response),
        };
        self.in_flight_table().remove(&id);
        if response.is_none() {
            tracing::debug!(id = %id, method = %method, "request cancelled");
        }
        response
    }

    pub fn handle_notification(&self, notification: Notification) {
        match notification.method.as_str() {
            methods::INITIALIZED => tracing::debug!("client initialized"),
            methods::CANCELLED => {
                let Some(params) = notification
                    .params
                    .and_then(|p| serde_json::from_value::<CancelledParams>(p).ok())
                else {
                    tracing::warn!("malformed cancellation notice");
                    return;
                };
                if let Some(token) = self.in_flight_table().remove(&params.request_id) {
                    tracing::info!(
                        id = %params.request_id,
                        reason = params.reason.as_deref().unwrap_or(""),
                        "cancelling request"
                    );
                    token.cancel();
                }
            }
            other => tracing::debug!(method = other, "ignoring notification"),
        }
    }

    fn in_flight_table(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, CancellationToken>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cancel_all(&self) {
        for (_, token) in self.in_flight_table().drain() {
            token.cancel();
        }
    }
}

/// 工具列表变更通知帧
pub fn tools_changed_frame() -> Result<Vec<u8>, crate::core::ProtocolError> {
    Message::from(Notification::new(methods::TOOLS_LIST_CHANGED, None)).encode()
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    let value = params.unwrap_or(Value::Object(Default::default()));
    serde_json::from_value(value).map_err(|e| RpcError::invalid_params(e.to_string()))
}
