//! 传输层：双向消息通道抽象
//!
//! 所有变体实现 Transport（open / send / receive / close），只负责分帧与生命周期，不理解协议语义。
//! - **stdio**：子进程标准输入输出，每行一条 JSON 记录；进程退出即关闭
//! - **sse**：服务端推送事件流，客户端写入走独立 POST 端点
//! - **streamable_http**：每条消息一次 POST，响应为 JSON 或事件流（需重组分片）
//! - **channel**：进程内内存通道（测试与内嵌服务端）
//!
//! 任何读写错误或意外关闭都返回 TransportError，本层不重试。

pub mod channel;
pub mod http;
pub mod sse;
pub mod stdio;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::core::TransportError;

pub use channel::ChannelTransport;
pub use http::StreamableHttpTransport;
pub use sse::{SseDecoder, SseEvent, SseTransport};
pub use stdio::{process_stdio, PipeTransport, StdioConfig, StdioTransport};

/// 传输方式（对应配置中的 transport 字段）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Stdio,
    #[serde(alias = "event-stream", alias = "event_stream")]
    Sse,
    #[serde(alias = "streamable-http", alias = "http")]
    StreamableHttp,
    Channel,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Sse => "sse",
            TransportKind::StreamableHttp => "streamable_http",
            TransportKind::Channel => "channel",
        };
        f.write_str(s)
    }
}

/// 传输 trait：方法均取 &self，Session 的读任务与多个并发写者可共享同一个 Arc<dyn Transport>
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn open(&self) -> Result<(), TransportError>;

    /// 发送一条完整的逻辑消息
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// 接收下一条完整消息；Ok(None) 表示对端已关闭
    async fn receive(&self) -> Result<Option<Vec<u8>>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// 网络类传输（sse / streamable_http）的配置；headers 已在构造前完成密钥展开
#[derive(Debug, Clone, Default)]
pub struct HttpConfig {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub connect_timeout: Option<Duration>,
}

impl HttpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub(crate) fn build_client(&self) -> Result<reqwest::Client, TransportError> {
        let mut builder = reqwest::Client::builder();
        if let Some(t) = self.connect_timeout {
            builder = builder.connect_timeout(t);
        }
        Ok(builder.build()?)
    }

    pub(crate) fn apply_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        req
    }
}

type InboundItem = Result<Vec<u8>, TransportError>;

/// 网络传输共用的入站队列：后台读任务推入，receive() 取出；Err(Closed) 作为关闭哨兵
pub(crate) struct InboundQueue {
    tx: mpsc::UnboundedSender<InboundItem>,
    rx: Mutex<mpsc::UnboundedReceiver<InboundItem>>,
}

impl InboundQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<InboundItem> {
        self.tx.clone()
    }

    pub(crate) fn push(&self, item: InboundItem) {
        let _ = self.tx.send(item);
    }

    pub(crate) async fn next(
        &self,
        closed: &CancellationToken,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = closed.cancelled() => Ok(None),
            item = rx.recv() => match item {
                Some(Ok(frame)) => Ok(Some(frame)),
                Some(Err(TransportError::Closed)) | None => Ok(None),
                Some(Err(e)) => Err(e),
            },
        }
    }
}
