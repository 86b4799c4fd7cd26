//! Hive - 工具调用 Agent 客户端
//!
//! 入口：加载配置、连接工具服务端，然后进入交互对话（chat）、单次提问（ask）或列出工具（tools）。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use hive::agent::{Hive, QueryOutcome, QueryStatus};
use hive::config::{load_config, AppConfig, ServerSection};
use hive::core::{ShutdownManager, ShutdownReason};
use hive::llm::{ChatReasoner, EchoReasoner};
use hive::observability;
use hive::react::{AgentEvent, Reasoner};
use hive::server::ToolServer;
use hive::transport::TransportKind;

#[derive(Debug, Parser)]
#[command(name = "hive", version, about = "Tool-calling agent over MCP tool servers")]
struct Cli {
    /// 额外的配置文件（叠加在 config/default.toml 之上）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 以 streamable HTTP 连接的工具服务端 URL
    #[arg(long, env = "MCP_URL")]
    url: Option<String>,

    /// 以 stdio 启动的工具服务端命令
    #[arg(long)]
    command: Option<String>,

    /// --command 的参数（可重复）
    #[arg(long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,

    #[arg(long)]
    max_iterations: Option<usize>,

    /// 单次查询的墙钟预算（秒）
    #[arg(long)]
    timeout: Option<u64>,

    #[arg(long)]
    memory_window: Option<usize>,

    /// 连接超时（秒）
    #[arg(long)]
    connect_timeout: Option<u64>,

    #[arg(long, short)]
    verbose: bool,

    /// 不调用推理端点，使用离线回显
    #[arg(long)]
    offline: bool,

    #[command(subcommand)]
    command_kind: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 交互对话（exit / quit / q 退出）
    Chat,
    /// 单次提问
    Ask {
        query: Vec<String>,
        /// 输出 JSON（status / response / intermediate_steps）
        #[arg(long)]
        json: bool,
    },
    /// 列出已连接服务端的工具
    Tools,
}

impl Cli {
    fn apply(&self, cfg: &mut AppConfig) {
        if let Some(v) = self.max_iterations {
            cfg.agent.max_iterations = v;
        }
        if let Some(v) = self.timeout {
            cfg.agent.timeout_secs = v;
        }
        if let Some(v) = self.memory_window {
            cfg.agent.memory_window_size = v;
        }
        if let Some(v) = self.connect_timeout {
            cfg.supervisor.connect_timeout_secs = v;
        }
        if self.verbose {
            cfg.agent.verbose = true;
        }
        if let Some(cmd) = &self.command {
            cfg.servers
                .push(ServerSection::stdio("cli-stdio", cmd.clone(), self.args.clone()));
        }
        if let Some(url) = &self.url {
            let declared = cfg
                .servers
                .iter()
                .any(|s| s.url.as_deref() == Some(url.as_str()));
            if !declared {
                cfg.servers
                    .push(ServerSection::remote("cli-http", TransportKind::StreamableHttp, url.clone()));
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut cfg = load_config(cli.config.clone()).context("Failed to load config")?;
    cli.apply(&mut cfg);
    observability::init(cfg.agent.verbose);

    let reasoner: Arc<dyn Reasoner> = if cli.offline {
        Arc::new(EchoReasoner)
    } else {
        let chat = cfg.llm.chat_config(cfg.agent.system_prompt.clone());
        if chat.api_key.is_none() {
            bail!(
                "no API key found in ${} (set it, configure [llm].api_key, or pass --offline)",
                cfg.llm.api_key_env
            );
        }
        Arc::new(ChatReasoner::new(chat).context("Failed to create reasoner")?)
    };

    let verbose = cfg.agent.verbose;
    let no_servers = cfg.servers.is_empty();
    let mut hive = Hive::new(cfg, reasoner);
    if verbose {
        let (tx, rx) = mpsc::unbounded_channel();
        hive = hive.with_event_tx(tx);
        tokio::spawn(render_events(rx));
    }

    for (name, err) in hive.connect_all().await {
        tracing::warn!(server = %name, error = %err, "server unavailable");
    }
    if no_servers {
        tracing::info!("no tool servers configured, using built-in tools");
        let builtin =
            Arc::new(ToolServer::new("hive-builtin", env!("CARGO_PKG_VERSION")).with_builtin_tools());
        hive.add_embedded_server("builtin", builtin)
            .await
            .context("Failed to start built-in tool server")?;
    }

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let result = match cli.command_kind.unwrap_or(Command::Chat) {
        Command::Tools => {
            print_tools(&hive);
            Ok(())
        }
        Command::Ask { query, json } => ask(&hive, &query.join(" "), json).await,
        Command::Chat => chat(&hive, &shutdown).await,
    };

    hive.shutdown().await;
    result
}

fn print_tools(hive: &Hive) {
    for (name, status) in hive.servers() {
        println!("[{name}] {status}");
    }
    let tools = hive.tools();
    if tools.is_empty() {
        println!("(no tools available)");
    }
    for tool in tools {
        println!("  {:<20} {:<12} {}", tool.name, tool.origin, tool.description);
    }
}

async fn ask(hive: &Hive, query: &str, json: bool) -> anyhow::Result<()> {
    let mut conv = hive.new_conversation();
    let outcome = hive.query(&mut conv, query).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_outcome(&outcome);
    }
    if outcome.status == QueryStatus::Error {
        bail!("query failed");
    }
    Ok(())
}

async fn chat(hive: &Hive, shutdown: &ShutdownManager) -> anyhow::Result<()> {
    let mut conv = hive.new_conversation();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let names = hive.registry().tool_names().join(", ");
    println!("Connected. Available tools: {names}");
    println!("Type 'exit', 'quit' or 'q' to leave.");

    loop {
        stdout.write_all(b"\nYou: ").await?;
        stdout.flush().await?;
        let line = tokio::select! {
            _ = shutdown.wait_for_shutdown() => break,
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        let Some(line) = line else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if matches!(input.to_lowercase().as_str(), "exit" | "quit" | "q") {
            shutdown.shutdown(ShutdownReason::UserInitiated);
            break;
        }
        let cancel = conv.cancel_token();
        let outcome = tokio::select! {
            _ = shutdown.wait_for_shutdown() => {
                cancel.cancel();
                break;
            }
            outcome = hive.query(&mut conv, input) => outcome,
        };
        print_outcome(&outcome);
    }
    println!("Goodbye!");
    Ok(())
}

fn print_outcome(outcome: &QueryOutcome) {
    match outcome.status {
        QueryStatus::Success => println!("Assistant: {}", outcome.response),
        QueryStatus::Error => eprintln!("Error: {}", outcome.response),
    }
    for step in &outcome.intermediate_steps {
        println!("  - {}: {}", step.tool, step.result);
    }
}

/// 过程事件写到 stderr，不干扰回答输出
async fn render_events(mut rx: mpsc::UnboundedReceiver<AgentEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::StepUpdate { step, max_steps } => eprintln!("[step {step}/{max_steps}]"),
            AgentEvent::Thinking => eprintln!("  thinking..."),
            AgentEvent::ToolCall { tool, args } => eprintln!("  -> {tool} {args}"),
            AgentEvent::Observation { tool, status, preview } => {
                eprintln!("  <- {tool} [{status}] {preview}")
            }
            AgentEvent::Recovery { action, detail } => eprintln!("  recovery {action}: {detail}"),
            AgentEvent::LimitReached { reason } => eprintln!("  limit reached: {reason}"),
            AgentEvent::Error { text } => eprintln!("  error: {text}"),
            AgentEvent::Phase { .. } | AgentEvent::Answer { .. } => {}
        }
    }
}
