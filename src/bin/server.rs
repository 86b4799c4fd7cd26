//! Hive 参考工具服务端（get_time / calculate）
//!
//! 默认走 stdio：stdin / stdout 每行一条 JSON-RPC 消息，日志写 stderr。
//! 启用 http-server 特性后可用 `--http 127.0.0.1:8000` 在 /mcp 上提供 streamable HTTP。
//!
//! 启动: cargo run --bin hive-server [-- --http 127.0.0.1:8000 --features http-server]

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use hive::core::{ShutdownManager, ShutdownReason};
use hive::observability;
use hive::server::ToolServer;
use hive::transport::{process_stdio, Transport};

#[derive(Debug, Parser)]
#[command(name = "hive-server", version, about = "Reference MCP tool server")]
struct Cli {
    /// 以 streamable HTTP 监听该地址（需要 http-server 特性）
    #[arg(long)]
    http: Option<String>,

    /// tools/list 分页大小
    #[arg(long)]
    page_size: Option<usize>,

    #[arg(long, short, env = "VERBOSE_LOGGING")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    observability::init(cli.verbose);

    let mut server = ToolServer::new("hive-server", env!("CARGO_PKG_VERSION")).with_builtin_tools();
    if let Some(size) = cli.page_size {
        server = server.with_page_size(size);
    }
    let server = Arc::new(server);

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    match cli.http {
        Some(addr) => serve_http(server, &addr, &shutdown).await,
        None => {
            let transport: Arc<dyn Transport> = Arc::new(process_stdio());
            server
                .serve(transport, shutdown.token())
                .await
                .context("stdio server failed")?;
            shutdown.shutdown(ShutdownReason::PeerClosed);
            Ok(())
        }
    }
}

#[cfg(feature = "http-server")]
async fn serve_http(
    server: Arc<ToolServer>,
    addr: &str,
    shutdown: &ShutdownManager,
) -> anyhow::Result<()> {
    let addr: std::net::SocketAddr = addr.parse().context("invalid --http address")?;
    hive::server::http::serve_http(server, addr, shutdown.token())
        .await
        .context("http server failed")
}

#[cfg(not(feature = "http-server"))]
async fn serve_http(
    _server: Arc<ToolServer>,
    _addr: &str,
    _shutdown: &ShutdownManager,
) -> anyhow::Result<()> {
    anyhow::bail!("--http requires building with `--features http-server`")
}
