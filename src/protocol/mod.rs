//! 协议层：JSON-RPC 信封与 MCP 载荷

pub mod message;
pub mod types;

pub use message::{Message, Notification, Request, RequestId, Response, RpcError, JSONRPC_VERSION};
pub use types::{
    is_supported_version, methods, CallToolParams, CallToolResult, CancelledParams, Content,
    Implementation, InitializeParams, InitializeResult, ListToolsParams, ListToolsResult,
    ServerCapabilities, ToolsCapability, WireTool, LATEST_PROTOCOL_VERSION,
    SUPPORTED_PROTOCOL_VERSIONS,
};
