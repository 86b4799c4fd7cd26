//! Streamable HTTP 服务端（axum）
//!
//! POST /mcp 收一帧（单条或批量）：含请求则以 JSON 回复，仅通知则 202；
//! initialize 的回复带 Mcp-Session-Id，之后的请求须带同一 id。DELETE /mcp 结束会话。

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use futures_util::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::protocol::{methods, Message};
use crate::server::ToolServer;
use crate::transport::http::SESSION_ID_HEADER;

#[derive(Clone)]
struct HttpState {
    server: Arc<ToolServer>,
    sessions: Arc<Mutex<HashSet<String>>>,
}

impl HttpState {
    fn sessions(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub fn router(server: Arc<ToolServer>) -> Router {
    let state = HttpState {
        server,
        sessions: Arc::new(Mutex::new(HashSet::new())),
    };
    Router::new()
        .route("/mcp", post(handle_post).delete(handle_delete))
        .route("/health", axum::routing::get(|| async { "OK" }))
        .with_state(state)
}

/// 监听 addr 直到 shutdown 触发
pub async fn serve_http(
    server: Arc<ToolServer>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "streamable HTTP tool server listening on /mcp");
    axum::serve(listener, router(server))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn handle_post(State(state): State<HttpState>, headers: HeaderMap, body: Bytes) -> Response {
    let messages = match Message::decode(&body) {
        Ok(messages) => messages,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let batch = body.first() == Some(&b'[');

    let is_initialize = messages
        .iter()
        .any(|m| matches!(m, Message::Request(r) if r.method == methods::INITIALIZE));
    let session_id = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if !is_initialize {
        if let Some(id) = &session_id {
            if !state.sessions().contains(id) {
                return (StatusCode::NOT_FOUND, "unknown session").into_response();
            }
        }
    }

    let mut requests = Vec::new();
    for message in messages {
        match message {
            Message::Request(request) => requests.push(request),
            Message::Notification(notification) => state.server.handle_notification(notification),
            Message::Response(_) => {}
        }
    }
    if requests.is_empty() {
        return StatusCode::ACCEPTED.into_response();
    }

    let responses: Vec<Value> = join_all(requests.into_iter().map(|r| state.server.respond(r)))
        .await
        .into_iter()
        .flatten()
        .filter_map(|r| serde_json::to_value(r).ok())
        .collect();
    if responses.is_empty() {
        return StatusCode::ACCEPTED.into_response();
    }

    let mut out_headers = HeaderMap::new();
    if is_initialize {
        let id = uuid::Uuid::new_v4().to_string();
        state.sessions().insert(id.clone());
        if let Ok(value) = HeaderValue::from_str(&id) {
            out_headers.insert(SESSION_ID_HEADER, value);
        }
        tracing::info!(session = %id, "http session opened");
    }
    let body = if batch || responses.len() > 1 {
        Value::Array(responses)
    } else {
        responses.into_iter().next().unwrap_or(Value::Null)
    };
    (StatusCode::OK, out_headers, Json(body)).into_response()
}

async fn handle_delete(State(state): State<HttpState>, headers: HeaderMap) -> StatusCode {
    let Some(id) = headers.get(SESSION_ID_HEADER).and_then(|v| v.to_str().ok()) else {
        return StatusCode::BAD_REQUEST;
    };
    if state.sessions().remove(id) {
        tracing::info!(session = %id, "http session closed");
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}
