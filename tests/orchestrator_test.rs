//! 编排集成测试：经 Hive 运行时走完整链路（进程内服务端 + 监管者 + 派发器）

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use hive::agent::GREETING_REPLY;
use hive::config::AppConfig;
use hive::core::LoopPhase;
use hive::dispatch::ToolRequest;
use hive::llm::ScriptedReasoner;
use hive::react::{Decision, TurnRole};
use hive::server::{ToolHandler, ToolServer};
use hive::{Hive, QueryStatus};

/// 按给定时长休眠后返回的工具
struct SleepTool {
    delay: Duration,
}

#[async_trait]
impl ToolHandler for SleepTool {
    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Sleeps before answering"
    }

    async fn call(&self, _args: Value) -> Result<Value, String> {
        tokio::time::sleep(self.delay).await;
        Ok(json!("woke up"))
    }
}

fn builtin() -> Arc<ToolServer> {
    Arc::new(ToolServer::new("builtin", "1.0").with_builtin_tools())
}

async fn hive_with(config: AppConfig, script: ScriptedReasoner, server: Arc<ToolServer>) -> Hive {
    let hive = Hive::new(config, Arc::new(script));
    hive.add_embedded_server("builtin", server).await.unwrap();
    hive
}

#[tokio::test]
async fn test_iteration_cap_gives_best_effort_answer() {
    let mut config = AppConfig::default();
    config.agent.max_iterations = 3;
    let reasoner = ScriptedReasoner::repeating(Decision::CallTools(vec![ToolRequest::new(
        "get_time",
        json!({}),
    )]));
    let hive = hive_with(config, reasoner, builtin()).await;

    let mut conv = hive.new_conversation();
    let outcome = hive.query(&mut conv, "keep checking the clock").await;
    assert_eq!(outcome.status, QueryStatus::Success);
    assert_eq!(outcome.intermediate_steps.len(), 3);
    assert!(outcome.intermediate_steps.iter().all(|s| s.tool == "get_time"));
    assert!(outcome.response.contains("iteration limit of 3"));
    assert_eq!(conv.phase(), LoopPhase::Done);
    hive.shutdown().await;
}

#[tokio::test]
async fn test_memory_window_keeps_most_recent_turns() {
    let hive = Hive::new(AppConfig::default(), Arc::new(ScriptedReasoner::new(vec![])));
    let mut conv = hive.new_conversation();
    for greeting in ["hi", "hello", "hey", "hi there", "Hello"] {
        let outcome = hive.query(&mut conv, greeting).await;
        assert_eq!(outcome.response, GREETING_REPLY);
    }
    // 10 轮写入，容量 8：最早的一问一答被逐出
    let window = conv.window();
    assert_eq!(window.len(), 8);
    let first = window.iter().next().unwrap();
    assert_eq!(first.role, TurnRole::User);
    assert_eq!(first.content, "hello");
    assert_eq!(window.last().unwrap().content, GREETING_REPLY);
}

#[tokio::test]
async fn test_unknown_tool_is_observed_not_fatal() {
    let reasoner = ScriptedReasoner::new(vec![
        Decision::CallTools(vec![ToolRequest::new("web_search", json!({"query": "rust"}))]),
        Decision::CallTools(vec![ToolRequest::new("calculate", json!({"expression": "2+2"}))]),
        Decision::Answer("2 + 2 = 4".into()),
    ]);
    let hive = hive_with(AppConfig::default(), reasoner, builtin()).await;

    let mut conv = hive.new_conversation();
    let outcome = hive.query(&mut conv, "what is 2+2?").await;
    assert_eq!(outcome.status, QueryStatus::Success);
    assert_eq!(outcome.response, "2 + 2 = 4");
    assert_eq!(outcome.intermediate_steps.len(), 2);
    assert_eq!(outcome.intermediate_steps[0].result, "tool not found: web_search");
    assert!(outcome.intermediate_steps[1].result.contains('4'));
    hive.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_calls_in_one_step() {
    let reasoner = ScriptedReasoner::new(vec![
        Decision::CallTools(vec![
            ToolRequest::new("get_time", json!({})),
            ToolRequest::new("calculate", json!({"expression": "(1 + 2) * 3"})),
        ]),
        Decision::Answer("done".into()),
    ]);
    let hive = hive_with(AppConfig::default(), reasoner, builtin()).await;

    let mut conv = hive.new_conversation();
    let outcome = hive.query(&mut conv, "time and math").await;
    let mut tools: Vec<&str> = outcome
        .intermediate_steps
        .iter()
        .map(|s| s.tool.as_str())
        .collect();
    tools.sort();
    assert_eq!(tools, vec!["calculate", "get_time"]);
    // user, 调用轮, 两条观察, 回答
    assert_eq!(conv.window().len(), 5);
    hive.shutdown().await;
}

#[tokio::test]
async fn test_call_timeout_becomes_observation() {
    let server = Arc::new(
        ToolServer::new("slow", "1.0").with_tool(SleepTool {
            delay: Duration::from_secs(2),
        }),
    );
    let reasoner = ScriptedReasoner::new(vec![
        Decision::CallTools(vec![
            ToolRequest::new("sleep", json!({})).with_timeout(Duration::from_millis(100))
        ]),
        Decision::Answer("gave up waiting".into()),
    ]);
    let hive = hive_with(AppConfig::default(), reasoner, server).await;

    let mut conv = hive.new_conversation();
    let outcome = hive.query(&mut conv, "nap").await;
    assert_eq!(outcome.status, QueryStatus::Success);
    assert_eq!(outcome.response, "gave up waiting");
    assert!(outcome.intermediate_steps[0].result.starts_with("timeout"));
    hive.shutdown().await;
}

#[tokio::test]
async fn test_wall_clock_budget_cancels_outstanding_call() {
    let mut config = AppConfig::default();
    config.agent.timeout_secs = 1;
    let server = Arc::new(
        ToolServer::new("slow", "1.0").with_tool(SleepTool {
            delay: Duration::from_secs(10),
        }),
    );
    let reasoner = ScriptedReasoner::repeating(Decision::CallTools(vec![ToolRequest::new(
        "sleep",
        json!({}),
    )]));
    let hive = hive_with(config, reasoner, server).await;

    let mut conv = hive.new_conversation();
    let started = tokio::time::Instant::now();
    let outcome = hive.query(&mut conv, "nap forever").await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(outcome.status, QueryStatus::Success);
    assert!(outcome.response.contains("time budget"));
    assert!(outcome.intermediate_steps[0].result.starts_with("cancelled"));
    assert_eq!(conv.phase(), LoopPhase::Done);
    hive.shutdown().await;
}

#[tokio::test]
async fn test_conversations_are_independent() {
    let reasoner = ScriptedReasoner::repeating(Decision::Answer("ok".into()));
    let hive = hive_with(AppConfig::default(), reasoner, builtin()).await;

    let mut a = hive.new_conversation();
    let mut b = hive.new_conversation();
    hive.query(&mut a, "first question").await;
    hive.query(&mut a, "second question").await;
    hive.query(&mut b, "other question").await;
    assert_eq!(a.window().len(), 4);
    assert_eq!(b.window().len(), 2);
    assert_ne!(a.id(), b.id());
    hive.shutdown().await;
}
