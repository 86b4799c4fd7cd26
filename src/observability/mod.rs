//! 可观测性：日志初始化
//!
//! 日志一律写 stderr（stdio 服务端的 stdout 是协议通道）。RUST_LOG 优先；
//! 未设置时 verbose 为 debug，否则 info。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "info"
    }
}

/// 重复调用无副作用（测试中多次初始化时忽略）
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}
