//! OpenAI 兼容 chat/completions 推理步骤
//!
//! 把记忆窗口转换为 messages、注册表转换为 function tools，调用任意 OpenAI 兼容端点（默认 Groq）；
//! 返回 tool_calls 时给出 CallTools，否则给出最终回答。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::HiveError;
use crate::dispatch::ToolRequest;
use crate::react::{Decision, MemoryWindow, Reasoner, TurnRole};
use crate::tools::ToolDefinition;

pub const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_MODEL: &str = "llama-3.3-70b-versatile";

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub request_timeout: Duration,
    /// 覆盖默认系统提示词
    pub system_prompt: Option<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: GROQ_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            temperature: 0.0,
            request_timeout: Duration::from_secs(60),
            system_prompt: None,
        }
    }
}

/// 默认系统提示词：列出可用工具名与当前日期
pub fn default_system_prompt(tools: &[ToolDefinition]) -> String {
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    let names = if names.is_empty() {
        "(none)".to_string()
    } else {
        names.join(", ")
    };
    format!(
        "You are a helpful Assistant with access to tools.\n\n\
         Available tools: {names}\n\n\
         Current date: {}\n\n\
         Call a tool only with arguments that match its parameter schema; tools without parameters take an empty object.\n\
         Use tools when needed to answer questions accurately.",
        chrono::Local::now().format("%Y-%m-%d")
    )
}

pub struct ChatReasoner {
    client: reqwest::Client,
    config: ChatConfig,
    pub usage: TokenUsage,
}

impl ChatReasoner {
    pub fn new(config: ChatConfig) -> Result<Self, HiveError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| HiveError::Reasoner(e.to_string()))?;
        Ok(Self {
            client,
            config,
            usage: TokenUsage::default(),
        })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn build_request(&self, window: &MemoryWindow, tools: &[ToolDefinition]) -> Value {
        let system = self
            .config
            .system_prompt
            .clone()
            .unwrap_or_else(|| default_system_prompt(tools));
        let mut body = json!({
            "model": self.config.model,
            "temperature": self.config.temperature,
            "messages": to_chat_messages(&system, window),
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(to_function_tool).collect());
            body["tool_choice"] = json!("auto");
        }
        body
    }
}

fn to_function_tool(def: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": def.name,
            "description": def.description,
            "parameters": def.input_schema,
        }
    })
}

/// 窗口 → chat messages。工具调用轮次分配 call id，其后的观察按工具名匹配为 role=tool；
/// 无法匹配的观察（对应的调用轮次已被逐出）降级为 user 文本，未得到观察的调用补一条占位回复。
fn to_chat_messages(system: &str, window: &MemoryWindow) -> Vec<Value> {
    let mut messages = vec![json!({"role": "system", "content": system})];
    let mut open: VecDeque<(String, String)> = VecDeque::new();
    let mut call_seq = 0usize;

    let close_open = |messages: &mut Vec<Value>, open: &mut VecDeque<(String, String)>| {
        for (id, _) in open.drain(..) {
            messages.push(json!({"role": "tool", "tool_call_id": id, "content": "no result"}));
        }
    };

    for turn in window.iter() {
        match turn.role {
            TurnRole::ToolObservation => {
                let tool = turn.tool.as_deref().unwrap_or_default();
                match open.iter().position(|(_, name)| name == tool) {
                    Some(pos) => {
                        let (id, _) = open.remove(pos).unwrap_or_default();
                        messages.push(json!({"role": "tool", "tool_call_id": id, "content": turn.content}));
                    }
                    None => {
                        close_open(&mut messages, &mut open);
                        messages.push(json!({
                            "role": "user",
                            "content": format!("Observation from {}: {}", if tool.is_empty() { "agent" } else { tool }, turn.content),
                        }));
                    }
                }
            }
            TurnRole::User => {
                close_open(&mut messages, &mut open);
                messages.push(json!({"role": "user", "content": turn.content}));
            }
            TurnRole::Agent if turn.calls.is_empty() => {
                close_open(&mut messages, &mut open);
                messages.push(json!({"role": "assistant", "content": turn.content}));
            }
            TurnRole::Agent => {
                close_open(&mut messages, &mut open);
                let calls: Vec<Value> = turn
                    .calls
                    .iter()
                    .map(|call| {
                        call_seq += 1;
                        let id = format!("call_{call_seq}");
                        open.push_back((id.clone(), call.tool.clone()));
                        json!({
                            "id": id,
                            "type": "function",
                            "function": {"name": call.tool, "arguments": call.arguments.to_string()},
                        })
                    })
                    .collect();
                messages.push(json!({"role": "assistant", "content": Value::Null, "tool_calls": calls}));
            }
        }
    }
    close_open(&mut messages, &mut open);
    messages
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChatToolCall>,
}

#[derive(Debug, Deserialize)]
struct ChatToolCall {
    function: ChatFunction,
}

#[derive(Debug, Deserialize)]
struct ChatFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

fn parse_decision(resp: ChatResponse) -> Result<Decision, HiveError> {
    let message = resp
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or_else(|| HiveError::Reasoner("completion had no choices".into()))?;
    if message.tool_calls.is_empty() {
        return Ok(Decision::Answer(message.content.unwrap_or_default()));
    }
    let requests = message
        .tool_calls
        .into_iter()
        .map(|call| {
            let raw = call.function.arguments;
            // 参数不是合法 JSON 时原样交给校验，作为 invalid arguments 观察写回
            let arguments = if raw.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&raw).unwrap_or(Value::String(raw))
            };
            ToolRequest::new(call.function.name, arguments)
        })
        .collect();
    Ok(Decision::CallTools(requests))
}

#[async_trait]
impl Reasoner for ChatReasoner {
    async fn decide(
        &self,
        window: &MemoryWindow,
        tools: &[ToolDefinition],
    ) -> Result<Decision, HiveError> {
        let body = self.build_request(window, tools);
        let mut req = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| HiveError::Reasoner(format!("request failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(HiveError::Reasoner(format!("HTTP {status}: {text}")));
        }
        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| HiveError::Reasoner(format!("invalid completion body: {e}")))?;
        if let Some(usage) = &parsed.usage {
            self.usage.add(usage.prompt_tokens, usage.completion_tokens);
        }
        let decision = parse_decision(parsed)?;
        tracing::debug!(model = %self.config.model, ?decision, "reasoning step");
        Ok(decision)
    }
}
