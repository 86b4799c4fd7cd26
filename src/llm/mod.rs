//! 推理步骤实现：OpenAI 兼容 chat（默认 Groq）/ 脚本化 / 离线回显

pub mod chat;
pub mod mock;

pub use chat::{default_system_prompt, ChatConfig, ChatReasoner, TokenUsage, DEFAULT_MODEL, GROQ_BASE_URL};
pub use mock::{EchoReasoner, ScriptedReasoner};
