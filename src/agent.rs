//! Headless 运行时
//!
//! 把配置装配成一套可用的工具调用运行时：ToolRegistry + Dispatcher + ConnectionSupervisor + Orchestrator。
//! connect_all 按 [[servers]] 连接各工具服务端，add_embedded_server 接入进程内的 ToolServer；
//! query 对单条用户输入跑编排循环，返回与参考客户端同形的 QueryOutcome。

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, ServerSection};
use crate::core::{ConnectionSupervisor, Connector, HiveError, ServerStatus, TransportError};
use crate::dispatch::Dispatcher;
use crate::react::{
    preview, AgentEvent, Conversation, ConversationTurn, Orchestrator, Reasoner,
    OBSERVATION_PREVIEW_CHARS,
};
use crate::server::ToolServer;
use crate::tools::{ToolDefinition, ToolRegistry};
use crate::transport::{
    ChannelTransport, HttpConfig, SseTransport, StdioConfig, StdioTransport,
    StreamableHttpTransport, Transport, TransportKind,
};

/// 问候语直接回复，不走推理
const GREETINGS: &[&str] = &["hi", "hello", "hey", "hi there"];

pub const GREETING_REPLY: &str = "Hello! I'm your Assistant. I can help you search the internet, get the current time, perform calculations, and more. What would you like to know?";

pub fn is_greeting(input: &str) -> bool {
    let normalized = input.trim().to_lowercase();
    GREETINGS.contains(&normalized.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntermediateStep {
    pub tool: String,
    /// 观察预览（≤200 字符）
    pub result: String,
}

/// 单次查询结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryOutcome {
    pub status: QueryStatus,
    pub response: String,
    pub intermediate_steps: Vec<IntermediateStep>,
}

impl QueryOutcome {
    fn error(message: impl Into<String>) -> Self {
        Self {
            status: QueryStatus::Error,
            response: message.into(),
            intermediate_steps: Vec::new(),
        }
    }
}

/// 按配置的传输方式构造传输；每次连接尝试都得到全新实例
#[derive(Debug, Clone)]
pub enum DefaultConnector {
    Stdio(StdioConfig),
    Sse(HttpConfig),
    StreamableHttp(HttpConfig),
}

impl DefaultConnector {
    pub fn from_section(
        section: &ServerSection,
        connect_timeout: std::time::Duration,
    ) -> Result<Self, HiveError> {
        match section.transport {
            TransportKind::Stdio => Ok(Self::Stdio(section.stdio_config()?)),
            TransportKind::Sse => Ok(Self::Sse(section.http_config(connect_timeout)?)),
            TransportKind::StreamableHttp => {
                Ok(Self::StreamableHttp(section.http_config(connect_timeout)?))
            }
            TransportKind::Channel => {
                section.validate()?;
                Err(HiveError::Config(format!(
                    "server '{}': unsupported transport",
                    section.name
                )))
            }
        }
    }
}

impl Connector for DefaultConnector {
    fn transport(&self) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(match self {
            Self::Stdio(cfg) => Arc::new(StdioTransport::new(cfg.clone())),
            Self::Sse(cfg) => Arc::new(SseTransport::new(cfg.clone())),
            Self::StreamableHttp(cfg) => Arc::new(StreamableHttpTransport::new(cfg.clone())),
        })
    }
}

/// 进程内服务端：每次连接新建一对内存通道，服务端一侧在后台 serve
struct EmbeddedConnector {
    server: Arc<ToolServer>,
    shutdown: CancellationToken,
}

impl Connector for EmbeddedConnector {
    fn transport(&self) -> Result<Arc<dyn Transport>, TransportError> {
        let (client, server_end) = ChannelTransport::pair();
        let server = Arc::clone(&self.server);
        let shutdown = self.shutdown.child_token();
        tokio::spawn(async move {
            if let Err(e) = server.serve(Arc::new(server_end), shutdown).await {
                tracing::warn!(error = %e, "embedded tool server stopped");
            }
        });
        Ok(Arc::new(client))
    }
}

pub struct Hive {
    config: AppConfig,
    registry: Arc<ToolRegistry>,
    supervisor: Arc<ConnectionSupervisor>,
    orchestrator: Orchestrator,
    shutdown: CancellationToken,
}

impl Hive {
    pub fn new(config: AppConfig, reasoner: Arc<dyn Reasoner>) -> Self {
        let registry = Arc::new(ToolRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(config.dispatch.dispatch_config()));
        let supervisor = ConnectionSupervisor::new(
            Arc::clone(&registry),
            dispatcher,
            config.supervisor.retry_policy(),
        );
        let orchestrator = Orchestrator::new(
            reasoner,
            Arc::clone(&registry),
            supervisor.clone(),
            config.agent.orchestrator_config(),
        );
        Self {
            config,
            registry,
            supervisor,
            orchestrator,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_event_tx(mut self, tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        self.orchestrator = self.orchestrator.with_event_tx(tx);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    pub fn tools(&self) -> Vec<ToolDefinition> {
        self.registry.list()
    }

    pub fn servers(&self) -> Vec<(String, ServerStatus)> {
        self.supervisor.servers()
    }

    /// 连接 [[servers]] 中声明的全部服务端；单个失败不影响其他服务端，失败列表返回给调用方
    pub async fn connect_all(&self) -> Vec<(String, HiveError)> {
        let timeout = self.supervisor.policy().connect_timeout;
        let mut failures = Vec::new();
        for section in &self.config.servers {
            let connector = match DefaultConnector::from_section(section, timeout) {
                Ok(connector) => connector,
                Err(e) => {
                    failures.push((section.name.clone(), e));
                    continue;
                }
            };
            tracing::info!(server = %section.name, transport = %section.transport, "connecting");
            if let Err(e) = self
                .supervisor
                .add_server(section.name.clone(), Arc::new(connector))
                .await
            {
                failures.push((section.name.clone(), e));
            }
        }
        failures
    }

    /// 接入进程内 ToolServer（经内存通道，走完整握手）
    pub async fn add_embedded_server(
        &self,
        name: impl Into<String>,
        server: Arc<ToolServer>,
    ) -> Result<(), HiveError> {
        let connector = EmbeddedConnector {
            server,
            shutdown: self.shutdown.clone(),
        };
        self.supervisor.add_server(name, Arc::new(connector)).await
    }

    pub fn new_conversation(&self) -> Conversation {
        Conversation::new(self.config.agent.memory_window_size)
    }

    /// 处理一条用户输入；错误折叠为 status=error
    pub async fn query(&self, conv: &mut Conversation, input: &str) -> QueryOutcome {
        let input = input.trim();
        if input.is_empty() {
            return QueryOutcome::error("Please enter a question.");
        }
        if is_greeting(input) {
            conv.push_turn(ConversationTurn::user(input));
            conv.push_turn(ConversationTurn::agent(GREETING_REPLY));
            return QueryOutcome {
                status: QueryStatus::Success,
                response: GREETING_REPLY.to_string(),
                intermediate_steps: Vec::new(),
            };
        }

        match self.orchestrator.run(conv, input).await {
            Ok(outcome) => QueryOutcome {
                status: QueryStatus::Success,
                response: outcome.answer,
                intermediate_steps: outcome
                    .steps
                    .into_iter()
                    .map(|step| IntermediateStep {
                        tool: step.tool,
                        result: preview(&step.observation, OBSERVATION_PREVIEW_CHARS),
                    })
                    .collect(),
            },
            Err(e) => {
                tracing::error!(conversation = %conv.id(), error = %e, "query failed");
                QueryOutcome::error(format!("Error processing query: {e}"))
            }
        }
    }

    /// 关闭所有会话与进程内服务端
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
        self.shutdown.cancel();
    }
}
