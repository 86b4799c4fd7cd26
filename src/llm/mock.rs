//! 脚本化推理步骤（用于测试与离线演示，无需 API）
//!
//! 按顺序回放预设的 Decision；repeating() 无限重复同一个决策；脚本耗尽时返回 Reasoner 错误。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::HiveError;
use crate::react::{Decision, MemoryWindow, Reasoner, TurnRole};
use crate::tools::ToolDefinition;

#[derive(Debug)]
pub struct ScriptedReasoner {
    script: Mutex<VecDeque<Decision>>,
    repeat: Option<Decision>,
}

impl ScriptedReasoner {
    pub fn new(script: Vec<Decision>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            repeat: None,
        }
    }

    pub fn repeating(decision: Decision) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            repeat: Some(decision),
        }
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    async fn decide(
        &self,
        _window: &MemoryWindow,
        _tools: &[ToolDefinition],
    ) -> Result<Decision, HiveError> {
        if let Some(next) = self.script.lock().unwrap_or_else(|e| e.into_inner()).pop_front() {
            return Ok(next);
        }
        self.repeat
            .clone()
            .ok_or_else(|| HiveError::Reasoner("scripted reasoner exhausted".into()))
    }
}

/// 离线回显：最近一次观察作为回答，没有观察时回显用户输入
#[derive(Debug, Default)]
pub struct EchoReasoner;

#[async_trait]
impl Reasoner for EchoReasoner {
    async fn decide(
        &self,
        window: &MemoryWindow,
        _tools: &[ToolDefinition],
    ) -> Result<Decision, HiveError> {
        let last = window
            .iter()
            .rev()
            .find(|t| matches!(t.role, TurnRole::User | TurnRole::ToolObservation))
            .map(|t| t.content.clone())
            .unwrap_or_else(|| "(no input)".to_string());
        Ok(Decision::Answer(format!("Echo: {last}")))
    }
}
