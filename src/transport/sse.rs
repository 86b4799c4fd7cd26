//! Server-Sent Events：增量解码器与旧式 SSE 传输
//!
//! SseDecoder 按字节喂入，跨 chunk 重组行与事件（支持 LF / CRLF / CR 行尾、注释行、多行 data）。
//! SseTransport：GET 建立事件流，首个 `endpoint` 事件给出 POST 地址，之后 `message` 事件即入站消息。

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::core::TransportError;
use crate::transport::{HttpConfig, InboundQueue, Transport, TransportKind};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    /// 事件类型；未声明时为 "message"
    pub fn kind(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 喂入一段字节，返回其中已完整的事件
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        let mut start = 0;
        while let Some((end, next)) = self.next_line(start) {
            let line = String::from_utf8_lossy(&self.buf[start..end]).into_owned();
            start = next;
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        self.buf.drain(..start);
        events
    }

    /// 返回 (行尾位置, 下一行起点)；缓冲末尾的孤立 CR 需等待后续字节判断是否为 CRLF
    fn next_line(&self, start: usize) -> Option<(usize, usize)> {
        let rest = &self.buf[start..];
        let pos = rest.iter().position(|b| *b == b'\n' || *b == b'\r')?;
        let end = start + pos;
        if rest[pos] == b'\n' {
            return Some((end, end + 1));
        }
        match rest.get(pos + 1) {
            Some(b'\n') => Some((end, end + 2)),
            Some(_) => Some((end, end + 1)),
            None => None,
        }
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event,
            data,
            id: self.id.clone(),
        })
    }
}

pub struct SseTransport {
    config: HttpConfig,
    client: Mutex<Option<reqwest::Client>>,
    endpoint: RwLock<Option<reqwest::Url>>,
    inbound: Arc<InboundQueue>,
    closed: CancellationToken,
}

impl SseTransport {
    pub fn new(config: HttpConfig) -> Self {
        Self {
            config,
            client: Mutex::new(None),
            endpoint: RwLock::new(None),
            inbound: Arc::new(InboundQueue::new()),
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn open(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let base = reqwest::Url::parse(&self.config.url)
            .map_err(|e| TransportError::Http(format!("invalid url '{}': {e}", self.config.url)))?;
        let client = self.config.build_client()?;
        let resp = self
            .config
            .apply_headers(client.get(base.clone()))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();
        let tx = self.inbound.sender();
        let closed = self.closed.clone();
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut decoder = SseDecoder::new();
            let mut endpoint_tx = Some(endpoint_tx);
            loop {
                let chunk = tokio::select! {
                    _ = closed.cancelled() => break,
                    chunk = stream.next() => chunk,
                };
                match chunk {
                    Some(Ok(bytes)) => {
                        for event in decoder.feed(&bytes) {
                            match event.kind() {
                                "endpoint" => {
                                    if let Some(t) = endpoint_tx.take() {
                                        let _ = t.send(event.data);
                                    }
                                }
                                "message" => {
                                    let _ = tx.send(Ok(event.data.into_bytes()));
                                }
                                other => tracing::debug!(event = other, "ignoring sse event"),
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Err(TransportError::from(e)));
                        break;
                    }
                    None => break,
                }
            }
            let _ = tx.send(Err(TransportError::Closed));
        });

        let endpoint = endpoint_rx.await.map_err(|_| {
            TransportError::Framing("event stream ended before endpoint event".into())
        })?;
        let endpoint = base
            .join(&endpoint)
            .map_err(|e| TransportError::Framing(format!("invalid endpoint '{endpoint}': {e}")))?;
        tracing::info!(url = %self.config.url, endpoint = %endpoint, "sse stream established");
        *self.endpoint.write().await = Some(endpoint);
        *self.client.lock().await = Some(client);
        Ok(())
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let endpoint = self
            .endpoint
            .read()
            .await
            .clone()
            .ok_or(TransportError::NotOpen)?;
        let client = self
            .client
            .lock()
            .await
            .clone()
            .ok_or(TransportError::NotOpen)?;
        let resp = self
            .config
            .apply_headers(client.post(endpoint))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(frame)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Vec<u8>>, TransportError> {
        self.inbound.next(&self.closed).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.cancel();
        self.client.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_single_event() {
        let mut d = SseDecoder::new();
        let events = d.feed(b"event: endpoint\ndata: /messages?session=1\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "endpoint");
        assert_eq!(events[0].data, "/messages?session=1");
    }

    #[test]
    fn test_event_split_across_chunks() {
        let mut d = SseDecoder::new();
        assert!(d.feed(b"data: {\"jsonrpc\":").is_empty());
        assert!(d.feed(b"\"2.0\"}\r").is_empty());
        let events = d.feed(b"\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "message");
        assert_eq!(events[0].data, "{\"jsonrpc\":\"2.0\"}");
    }

    #[test]
    fn test_multiline_data_and_comments() {
        let mut d = SseDecoder::new();
        let events = d.feed(b": keep-alive\n\ndata: a\ndata: b\nid: 7\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "a\nb");
        assert_eq!(events[0].id.as_deref(), Some("7"));
    }

    #[test]
    fn test_event_without_data_is_dropped() {
        let mut d = SseDecoder::new();
        let events = d.feed(b"event: ping\n\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "message");
    }

    #[tokio::test]
    async fn test_send_before_open() {
        let t = SseTransport::new(HttpConfig::new("http://127.0.0.1:9/sse"));
        assert_eq!(t.send(b"{}".to_vec()).await, Err(TransportError::NotOpen));
    }
}
