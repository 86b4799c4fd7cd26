//! Hive - Rust 工具调用运行时
//!
//! 模块划分：
//! - **agent**: 无头运行时（配置 → 监管者 → 注册表 → 编排器）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类与恢复、连接监管、编排阶段、优雅关闭
//! - **dispatch**: 关联式异步派发（超时、取消、并发上限）
//! - **llm**: 推理步骤实现（OpenAI 兼容 chat / 脚本化 / 离线回显）
//! - **observability**: 日志初始化
//! - **protocol**: JSON-RPC 信封与 MCP 载荷
//! - **react**: 记忆窗口与 think → act → observe 主循环
//! - **server**: 参考工具服务端（get_time / calculate）
//! - **session**: 会话状态机、握手与待回复表
//! - **tools**: 工具注册表与参数校验
//! - **transport**: stdio / SSE / Streamable HTTP / 内存通道

pub mod agent;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod llm;
pub mod observability;
pub mod protocol;
pub mod react;
pub mod server;
pub mod session;
pub mod tools;
pub mod transport;

pub use agent::{Hive, QueryOutcome, QueryStatus};
pub use config::{load_config, AppConfig};
pub use core::HiveError;
