//! 对话记忆窗口
//!
//! 固定容量的最近轮次缓冲：追加到尾部，超出容量时从头部（最旧）逐出。长度永远不超过容量。

use std::collections::VecDeque;

use serde::Serialize;

use crate::dispatch::{ToolRequest, ToolResult};

/// 轮次角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Agent,
    ToolObservation,
}

/// 单个对话轮次：角色、文本内容，以及关联的工具调用 / 结果
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub calls: Vec<ToolRequest>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<ToolResult>,
    /// 观察所属的工具名（仅 ToolObservation）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(TurnRole::User, content.into())
    }

    pub fn agent(content: impl Into<String>) -> Self {
        Self::plain(TurnRole::Agent, content.into())
    }

    /// 推理步骤请求调用工具的轮次
    pub fn agent_calls(calls: Vec<ToolRequest>) -> Self {
        Self {
            calls,
            ..Self::plain(TurnRole::Agent, String::new())
        }
    }

    /// 未产生 ToolResult 的观察（工具不存在、参数非法、会话不可用等）
    pub fn observation(tool: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool: Some(tool.into()),
            ..Self::plain(TurnRole::ToolObservation, content.into())
        }
    }

    pub fn from_result(result: ToolResult) -> Self {
        Self {
            tool: Some(result.tool.clone()),
            content: result.observation(),
            results: vec![result],
            ..Self::plain(TurnRole::ToolObservation, String::new())
        }
    }

    fn plain(role: TurnRole, content: String) -> Self {
        Self {
            role,
            content,
            calls: Vec::new(),
            results: Vec::new(),
            tool: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MemoryWindow {
    turns: VecDeque<ConversationTurn>,
    capacity: usize,
}

impl MemoryWindow {
    /// 容量至少为 1
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            turns: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// 追加一轮；溢出时返回被逐出的最旧轮次
    pub fn push(&mut self, turn: ConversationTurn) -> Option<ConversationTurn> {
        let evicted = if self.turns.len() == self.capacity {
            self.turns.pop_front()
        } else {
            None
        };
        self.turns.push_back(turn);
        evicted
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    pub fn last(&self) -> Option<&ConversationTurn> {
        self.turns.back()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}
