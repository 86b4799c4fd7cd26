//! 编排层：记忆窗口、推理接口、think → act → observe 主循环

pub mod events;
pub mod loop_;
pub mod memory;
pub mod reasoner;

pub use events::AgentEvent;
pub use loop_::{
    preview, Conversation, Orchestrator, OrchestratorConfig, RunOutcome, Termination, ToolInvoker,
    ToolStep, OBSERVATION_PREVIEW_CHARS,
};
pub use memory::{ConversationTurn, MemoryWindow, TurnRole};
pub use reasoner::{Decision, Reasoner};
