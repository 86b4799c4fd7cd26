//! 编排循环阶段
//!
//! 每个对话独立持有当前阶段；CLI 与测试通过 watch 通道观察。

use std::fmt;

use serde::Serialize;

/// 编排阶段：Idle → Thinking → Dispatching → Observing → Responding → Done；Aborted 吸收本次运行
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    Idle,
    Thinking,
    Dispatching,
    Observing,
    Responding,
    Done,
    Aborted,
}

impl LoopPhase {
    pub fn is_finished(self) -> bool {
        matches!(self, LoopPhase::Done | LoopPhase::Aborted)
    }
}

impl fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoopPhase::Idle => "idle",
            LoopPhase::Thinking => "thinking",
            LoopPhase::Dispatching => "dispatching",
            LoopPhase::Observing => "observing",
            LoopPhase::Responding => "responding",
            LoopPhase::Done => "done",
            LoopPhase::Aborted => "aborted",
        };
        f.write_str(s)
    }
}
