//! 编排过程事件：用于 CLI 展示思考、工具调用、观察与回复

use serde::Serialize;

use crate::core::LoopPhase;

/// 单步过程事件（可序列化为 JSON）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// 阶段切换
    Phase { phase: LoopPhase },
    /// 当前第几轮
    StepUpdate { step: usize, max_steps: usize },
    /// 正在调用推理步骤
    Thinking,
    /// 调用工具
    ToolCall {
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    Observation {
        tool: String,
        status: String,
        preview: String,
    },
    /// 错误恢复动作
    Recovery { action: String, detail: String },
    /// 达到轮数或时间上限
    LimitReached { reason: String },
    /// 最终回复
    Answer { text: String },
    Error { text: String },
}
