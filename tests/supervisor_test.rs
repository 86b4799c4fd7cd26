//! 连接监管集成测试：list_changed 重建、断线重连、连续超时回收

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use common::{initialize_result, spawn_fake_server, wait_until, Reply};
use hive::core::{
    ConnectionSupervisor, HiveError, ProtocolError, RetryPolicy, ServerStatus, TransportError,
};
use hive::dispatch::{DispatchConfig, Dispatcher, ToolRequest, ToolStatus};
use hive::protocol::{methods, Request};
use hive::react::ToolInvoker;
use hive::server::{tools_changed_frame, ToolHandler, ToolServer};
use hive::tools::{ToolDefinition, ToolRegistry};
use hive::transport::{ChannelTransport, Transport};

const WAIT: Duration = Duration::from_secs(3);

struct SleepTool;

#[async_trait]
impl ToolHandler for SleepTool {
    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Sleeps for a second"
    }

    async fn call(&self, _args: Value) -> Result<Value, String> {
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(json!("woke up"))
    }
}

/// 进程内服务端连接器：记录连接次数，保留最近一次的服务端一侧传输
struct Harness {
    server: Arc<ToolServer>,
    attempts: Arc<AtomicU32>,
    server_end: Arc<Mutex<Option<Arc<ChannelTransport>>>>,
    shutdown: CancellationToken,
}

impl Harness {
    fn new(server: ToolServer) -> Self {
        Self {
            server: Arc::new(server),
            attempts: Arc::new(AtomicU32::new(0)),
            server_end: Arc::new(Mutex::new(None)),
            shutdown: CancellationToken::new(),
        }
    }

    fn connector(&self) -> impl Fn() -> Result<Arc<dyn Transport>, TransportError> + Send + Sync {
        let server = self.server.clone();
        let attempts = self.attempts.clone();
        let slot = self.server_end.clone();
        let shutdown = self.shutdown.clone();
        move || {
            attempts.fetch_add(1, Ordering::SeqCst);
            let (client, server_end) = ChannelTransport::pair();
            let server_end = Arc::new(server_end);
            *slot.lock().unwrap() = Some(server_end.clone());
            tokio::spawn(server.clone().serve(server_end, shutdown.child_token()));
            Ok(Arc::new(client) as Arc<dyn Transport>)
        }
    }

    fn server_end(&self) -> Arc<ChannelTransport> {
        self.server_end.lock().unwrap().clone().unwrap()
    }

    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        connect_timeout: Duration::from_secs(2),
        max_retries: 3,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        timeout_threshold: 2,
    }
}

fn supervisor(dispatch: DispatchConfig) -> Arc<ConnectionSupervisor> {
    ConnectionSupervisor::new(
        Arc::new(ToolRegistry::new()),
        Arc::new(Dispatcher::new(dispatch)),
        fast_policy(),
    )
}

#[tokio::test]
async fn test_registry_spans_servers_in_order() {
    let sup = supervisor(DispatchConfig::default());
    let first = Harness::new(ToolServer::new("a", "1").with_builtin_tools());
    let second = Harness::new(ToolServer::new("b", "1").with_tool(SleepTool));
    sup.add_server("a", Arc::new(first.connector())).await.unwrap();
    sup.add_server("b", Arc::new(second.connector())).await.unwrap();

    assert_eq!(
        sup.registry().tool_names(),
        vec!["get_time", "calculate", "sleep"]
    );
    assert_eq!(sup.registry().lookup("sleep").unwrap().origin, "b");
    assert!(sup.add_server("a", Arc::new(first.connector())).await.is_err());

    sup.shutdown().await;
    assert!(sup.registry().is_empty());
    assert_eq!(sup.status("a"), Some(ServerStatus::Stopped));
}

#[tokio::test]
async fn test_list_changed_rebuilds_registry() {
    let sup = supervisor(DispatchConfig::default());
    let harness = Harness::new(ToolServer::new("dyn", "1").with_builtin_tools());
    sup.add_server("dyn", Arc::new(harness.connector())).await.unwrap();
    assert_eq!(sup.registry().len(), 2);

    harness.server.add_tool(Arc::new(SleepTool));
    harness
        .server_end()
        .send(tools_changed_frame().unwrap())
        .await
        .unwrap();
    assert!(wait_until(WAIT, || sup.registry().lookup("sleep").is_some()).await);
    assert_eq!(sup.registry().len(), 3);

    assert!(harness.server.remove_tool("calculate"));
    harness
        .server_end()
        .send(tools_changed_frame().unwrap())
        .await
        .unwrap();
    assert!(wait_until(WAIT, || sup.registry().lookup("calculate").is_none()).await);
    assert_eq!(sup.registry().tool_names(), vec!["get_time", "sleep"]);
    assert_eq!(harness.attempts(), 1);
    sup.shutdown().await;
}

#[tokio::test]
async fn test_reconnects_after_peer_close() {
    let sup = supervisor(DispatchConfig::default());
    let harness = Harness::new(ToolServer::new("flaky", "1").with_builtin_tools());
    sup.add_server("flaky", Arc::new(harness.connector())).await.unwrap();
    let first = sup.session("flaky").unwrap();

    harness.server_end().close().await.unwrap();
    assert!(wait_until(WAIT, || harness.attempts() == 2
        && sup.status("flaky") == Some(ServerStatus::Ready)
        && sup.registry().len() == 2)
    .await);

    let second = sup.session("flaky").unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(first.state().is_terminal());

    // 新会话可以正常派发
    let def = sup.registry().lookup("calculate").unwrap();
    let result = sup
        .invoke(
            &def,
            ToolRequest::new("calculate", json!({"expression": "7*6"})),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(result.is_success());
    assert_eq!(result.payload["result"], 42);
    sup.shutdown().await;
}

#[tokio::test]
async fn test_consecutive_timeouts_recycle_session() {
    let sup = supervisor(DispatchConfig {
        call_timeout: Duration::from_millis(50),
        max_in_flight: 4,
    });
    let harness = Harness::new(ToolServer::new("slow", "1").with_tool(SleepTool));
    sup.add_server("slow", Arc::new(harness.connector())).await.unwrap();
    let def = sup.registry().lookup("sleep").unwrap();
    let cancel = CancellationToken::new();

    let first = sup
        .invoke(&def, ToolRequest::new("sleep", json!({})), &cancel)
        .await
        .unwrap();
    assert_eq!(first.status, ToolStatus::Timeout);
    assert_eq!(harness.attempts(), 1);

    let second = sup
        .invoke(&def, ToolRequest::new("sleep", json!({})), &cancel)
        .await
        .unwrap();
    assert_eq!(second.status, ToolStatus::Timeout);

    // 达到阈值：会话被回收并重连
    assert!(wait_until(WAIT, || harness.attempts() == 2
        && sup.status("slow") == Some(ServerStatus::Ready)
        && sup.registry().len() == 1)
    .await);
    let session = sup.session("slow").unwrap();
    assert_eq!(session.consecutive_timeouts(), 0);
    sup.shutdown().await;
}

#[tokio::test]
async fn test_unknown_origin_is_session_unavailable() {
    let sup = supervisor(DispatchConfig::default());
    assert!(matches!(
        sup.session("ghost"),
        Err(HiveError::SessionUnavailable(_))
    ));
    let def = ToolDefinition::new("haunt", "boo", json!({"type": "object"}), "ghost");
    let err = sup
        .invoke(&def, ToolRequest::new("haunt", json!({})), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, HiveError::SessionUnavailable(name) if name == "ghost"));
}

#[tokio::test]
async fn test_protocol_errors_are_not_retried() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let connector = move || -> Result<Arc<dyn Transport>, TransportError> {
        counter.fetch_add(1, Ordering::SeqCst);
        let (client, _fake) = spawn_fake_server(|req: &Request| match req.method.as_str() {
            methods::INITIALIZE => Reply::Result(initialize_result("1999-01-01")),
            _ => Reply::Silent,
        });
        Ok(client as Arc<dyn Transport>)
    };
    let sup = supervisor(DispatchConfig::default());
    let err = sup
        .add_server("future", Arc::new(connector))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        HiveError::Protocol(ProtocolError::VersionMismatch { .. })
    ));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(matches!(sup.status("future"), Some(ServerStatus::Failed(_))));
    assert!(sup.registry().is_empty());
}

#[tokio::test]
async fn test_connect_timeouts_are_retried() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let connector = move || -> Result<Arc<dyn Transport>, TransportError> {
        counter.fetch_add(1, Ordering::SeqCst);
        let (client, _fake) = spawn_fake_server(|_req: &Request| Reply::Silent);
        Ok(client as Arc<dyn Transport>)
    };
    let sup = ConnectionSupervisor::new(
        Arc::new(ToolRegistry::new()),
        Arc::new(Dispatcher::default()),
        RetryPolicy {
            connect_timeout: Duration::from_millis(50),
            max_retries: 2,
            ..fast_policy()
        },
    );
    let err = sup.add_server("mute", Arc::new(connector)).await.unwrap_err();
    assert!(matches!(err, HiveError::ConnectTimeout(_)));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}
