//! 推理步骤接口
//!
//! 编排器把它当作可替换的决策函数：给定记忆窗口与工具列表，返回最终回答或一组工具调用请求。

use async_trait::async_trait;

use crate::core::HiveError;
use crate::dispatch::ToolRequest;
use crate::react::MemoryWindow;
use crate::tools::ToolDefinition;

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Answer(String),
    CallTools(Vec<ToolRequest>),
}

#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn decide(
        &self,
        window: &MemoryWindow,
        tools: &[ToolDefinition],
    ) -> Result<Decision, HiveError>;
}
