//! Streamable HTTP 传输：每条出站消息一次 POST
//!
//! 响应体为 `application/json` 时整体作为一条入站消息；为 `text/event-stream` 时在后台读取并按事件拆分。
//! 服务端返回的 `Mcp-Session-Id` 在后续请求中回传，close 时发送 DELETE 结束会话。

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::core::TransportError;
use crate::transport::{HttpConfig, InboundQueue, SseDecoder, Transport, TransportKind};

pub const SESSION_ID_HEADER: &str = "mcp-session-id";

pub struct StreamableHttpTransport {
    config: HttpConfig,
    client: Mutex<Option<reqwest::Client>>,
    session_id: RwLock<Option<String>>,
    inbound: Arc<InboundQueue>,
    closed: CancellationToken,
}

impl StreamableHttpTransport {
    pub fn new(config: HttpConfig) -> Self {
        Self {
            config,
            client: Mutex::new(None),
            session_id: RwLock::new(None),
            inbound: Arc::new(InboundQueue::new()),
            closed: CancellationToken::new(),
        }
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    async fn client(&self) -> Result<reqwest::Client, TransportError> {
        self.client
            .lock()
            .await
            .clone()
            .ok_or(TransportError::NotOpen)
    }

    fn spawn_event_reader(&self, resp: reqwest::Response) {
        let tx = self.inbound.sender();
        let closed = self.closed.clone();
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut decoder = SseDecoder::new();
            loop {
                let chunk = tokio::select! {
                    _ = closed.cancelled() => break,
                    chunk = stream.next() => chunk,
                };
                match chunk {
                    Some(Ok(bytes)) => {
                        for event in decoder.feed(&bytes) {
                            if event.kind() == "message" {
                                let _ = tx.send(Ok(event.data.into_bytes()));
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
        });
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }

    async fn open(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        reqwest::Url::parse(&self.config.url)
            .map_err(|e| TransportError::Http(format!("invalid url '{}': {e}", self.config.url)))?;
        *self.client.lock().await = Some(self.config.build_client()?);
        Ok(())
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let client = self.client().await?;
        let mut req = self
            .config
            .apply_headers(client.post(&self.config.url))
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .body(frame);
        if let Some(id) = self.session_id.read().await.as_deref() {
            req = req.header(SESSION_ID_HEADER, id);
        }
        let resp = req.send().await?;

        if let Some(id) = resp
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut current = self.session_id.write().await;
            if current.as_deref() != Some(id) {
                tracing::debug!(session_id = id, "captured mcp session id");
                *current = Some(id.to_string());
            }
        }

        let status = resp.status();
        if status == StatusCode::ACCEPTED || status == StatusCode::NO_CONTENT {
            return Ok(());
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if content_type.starts_with("text/event-stream") {
            self.spawn_event_reader(resp);
        } else {
            let body = resp.bytes().await?;
            if !body.iter().all(u8::is_ascii_whitespace) {
                self.inbound.push(Ok(body.to_vec()));
            }
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Vec<u8>>, TransportError> {
        self.inbound.next(&self.closed).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        let client = self.client.lock().await.take();
        let session_id = self.session_id.write().await.take();
        if let (Some(client), Some(id)) = (client, session_id) {
            let req = self
                .config
                .apply_headers(client.delete(&self.config.url))
                .header(SESSION_ID_HEADER, id);
            if let Err(e) = req.send().await {
                tracing::debug!(error = %e, "session DELETE failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_before_open() {
        let t = StreamableHttpTransport::new(HttpConfig::new("http://127.0.0.1:9/mcp"));
        assert_eq!(t.send(b"{}".to_vec()).await, Err(TransportError::NotOpen));
    }

    #[tokio::test]
    async fn test_invalid_url_rejected_on_open() {
        let t = StreamableHttpTransport::new(HttpConfig::new("not a url"));
        assert!(matches!(t.open().await, Err(TransportError::Http(_))));
    }

    #[tokio::test]
    async fn test_closed_transport_yields_none() {
        let t = StreamableHttpTransport::new(HttpConfig::new("http://127.0.0.1:9/mcp"));
        t.open().await.unwrap();
        t.close().await.unwrap();
        assert_eq!(t.receive().await.unwrap(), None);
        assert_eq!(t.send(b"{}".to_vec()).await, Err(TransportError::Closed));
    }
}
