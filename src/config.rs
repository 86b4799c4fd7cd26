//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__AGENT__MAX_ITERATIONS=4`），
//! 最后叠加参考客户端沿用的扁平变量（GROQ_API_KEY、MCP_URL、AGENT_MAX_ITERATIONS 等）。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::{HiveError, RetryPolicy};
use crate::dispatch::DispatchConfig;
use crate::llm::{ChatConfig, DEFAULT_MODEL, GROQ_BASE_URL};
use crate::react::OrchestratorConfig;
use crate::transport::{HttpConfig, StdioConfig, TransportKind};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentSection,
    pub dispatch: DispatchSection,
    pub supervisor: SupervisorSection,
    pub llm: LlmSection,
    /// [[servers]] 工具服务端声明
    pub servers: Vec<ServerSection>,
}

/// [agent] 段：循环上限、墙钟预算、记忆窗口
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_iterations: usize,
    pub timeout_secs: u64,
    pub memory_window_size: usize,
    pub verbose: bool,
    /// 覆盖默认系统提示词
    pub system_prompt: Option<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: 6,
            timeout_secs: 90,
            memory_window_size: 8,
            verbose: true,
            system_prompt: None,
        }
    }
}

impl AgentSection {
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_iterations: self.max_iterations.max(1),
            timeout: Duration::from_secs(self.timeout_secs.max(1)),
        }
    }
}

/// [dispatch] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub call_timeout_secs: u64,
    /// 每个会话的在途调用上限
    pub max_in_flight: usize,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            call_timeout_secs: 30,
            max_in_flight: 16,
        }
    }
}

impl DispatchSection {
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            call_timeout: Duration::from_secs(self.call_timeout_secs.max(1)),
            max_in_flight: self.max_in_flight.max(1),
        }
    }
}

/// [supervisor] 段：连接超时与重连退避
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub connect_timeout_secs: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub timeout_threshold: u32,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 12,
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            timeout_threshold: 3,
        }
    }
}

impl SupervisorSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms)),
            timeout_threshold: self.timeout_threshold.max(1),
        }
    }
}

/// [llm] 段：OpenAI 兼容端点（默认 Groq）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub base_url: String,
    pub model: String,
    /// 读取 API Key 的环境变量名
    pub api_key_env: String,
    /// 直接配置的 Key（优先于 api_key_env）
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
    pub temperature: f32,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: GROQ_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key_env: "GROQ_API_KEY".to_string(),
            api_key: None,
            request_timeout_secs: 60,
            temperature: 0.0,
        }
    }
}

impl LlmSection {
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|k| !k.trim().is_empty())
    }

    pub fn chat_config(&self, system_prompt: Option<String>) -> ChatConfig {
        ChatConfig {
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            api_key: self.resolve_api_key(),
            temperature: self.temperature,
            request_timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
            system_prompt,
        }
    }
}

/// [[servers]] 单个工具服务端
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    pub name: String,
    pub transport: TransportKind,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub url: Option<String>,
    /// 子进程环境变量；也是 headers 中 `${VAR}` 的唯一来源
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl ServerSection {
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Stdio,
            command: Some(command.into()),
            args,
            cwd: None,
            url: None,
            env: BTreeMap::new(),
            headers: BTreeMap::new(),
        }
    }

    pub fn remote(name: impl Into<String>, transport: TransportKind, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport,
            command: None,
            args: Vec::new(),
            cwd: None,
            url: Some(url.into()),
            env: BTreeMap::new(),
            headers: BTreeMap::new(),
        }
    }

    pub fn validate(&self) -> Result<(), HiveError> {
        if self.name.trim().is_empty() {
            return Err(HiveError::Config("server name must not be empty".into()));
        }
        match self.transport {
            TransportKind::Stdio if self.command.is_none() => Err(HiveError::Config(format!(
                "server '{}': stdio transport requires `command`",
                self.name
            ))),
            TransportKind::Sse | TransportKind::StreamableHttp if self.url.is_none() => {
                Err(HiveError::Config(format!(
                    "server '{}': {} transport requires `url`",
                    self.name, self.transport
                )))
            }
            TransportKind::Channel => Err(HiveError::Config(format!(
                "server '{}': channel transport cannot be declared in config",
                self.name
            ))),
            _ => Ok(()),
        }
    }

    /// 展开 headers 中的 `${VAR}`，变量只从本服务端的 env 表取
    pub fn resolved_headers(&self) -> Result<BTreeMap<String, String>, HiveError> {
        let mut out = BTreeMap::new();
        for (key, raw) in &self.headers {
            let value = expand_vars(raw, &self.env).map_err(|var| {
                HiveError::Config(format!(
                    "server '{}': header '{key}' references undefined ${{{var}}}",
                    self.name
                ))
            })?;
            out.insert(key.clone(), value);
        }
        Ok(out)
    }

    pub fn stdio_config(&self) -> Result<StdioConfig, HiveError> {
        self.validate()?;
        let command = self.command.clone().unwrap_or_default();
        let mut cfg = StdioConfig::new(command)
            .with_args(self.args.clone())
            .with_env(self.env.clone());
        cfg.cwd = self.cwd.clone();
        Ok(cfg)
    }

    pub fn http_config(&self, connect_timeout: Duration) -> Result<HttpConfig, HiveError> {
        self.validate()?;
        let url = self.url.clone().unwrap_or_default();
        Ok(HttpConfig::new(url)
            .with_headers(self.resolved_headers()?)
            .with_connect_timeout(connect_timeout))
    }
}

/// `${VAR}` 替换；未定义的变量以 Err(变量名) 返回
fn expand_vars(input: &str, vars: &BTreeMap<String, String>) -> Result<String, String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let name = &after[..end];
        let value = vars.get(name).ok_or_else(|| name.to_string())?;
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// 从 config 目录加载配置，环境变量 HIVE__* 与扁平变量可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path，则追加该文件（必须存在）
/// 3. 叠加环境变量 HIVE__*（双下划线表示嵌套键）
/// 4. 叠加 GROQ_API_KEY / GROQ_MODEL / MCP_URL / AGENT_* / MEMORY_WINDOW_SIZE / MCP_CONNECT_TIMEOUT / VERBOSE_LOGGING
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, HiveError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if !path.exists() {
            return Err(HiveError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        builder = builder.add_source(config::File::from(path.clone()));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let mut cfg: AppConfig = builder.build()?.try_deserialize()?;
    apply_legacy_env(&mut cfg, |key| std::env::var(key).ok());
    for server in &cfg.servers {
        server.validate()?;
    }
    Ok(cfg)
}

/// 参考客户端的扁平环境变量；lookup 便于测试注入
pub fn apply_legacy_env(cfg: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
        let raw = lookup(key)?;
        match raw.trim().parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
                None
            }
        }
    }

    if let Some(key) = lookup("GROQ_API_KEY").filter(|k| !k.trim().is_empty()) {
        if cfg.llm.api_key_env == "GROQ_API_KEY" && cfg.llm.api_key.is_none() {
            cfg.llm.api_key = Some(key);
        }
    }
    if let Some(model) = lookup("GROQ_MODEL").filter(|m| !m.trim().is_empty()) {
        cfg.llm.model = model;
    }
    if let Some(url) = lookup("MCP_URL").filter(|u| !u.trim().is_empty()) {
        if cfg.servers.is_empty() {
            cfg.servers
                .push(ServerSection::remote("default", TransportKind::StreamableHttp, url));
        }
    }
    if let Some(v) = parsed(&lookup, "AGENT_MAX_ITERATIONS") {
        cfg.agent.max_iterations = v;
    }
    if let Some(v) = parsed(&lookup, "AGENT_TIMEOUT_SECONDS") {
        cfg.agent.timeout_secs = v;
    }
    if let Some(v) = parsed(&lookup, "MEMORY_WINDOW_SIZE") {
        cfg.agent.memory_window_size = v;
    }
    if let Some(v) = parsed(&lookup, "MCP_CONNECT_TIMEOUT") {
        cfg.supervisor.connect_timeout_secs = v;
    }
    if let Some(raw) = lookup("VERBOSE_LOGGING") {
        cfg.agent.verbose = matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
    }
}
