//! 集成测试公用：内存通道上的脚本化假服务端
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use hive::protocol::{methods, Message, Notification, Request, RequestId, Response, RpcError};
use hive::transport::{ChannelTransport, Transport};

/// 假服务端对单个请求的回复方式
pub enum Reply {
    Result(Value),
    Error(RpcError),
    After(Duration, Value),
    Silent,
}

pub struct FakeServer {
    pub transport: Arc<ChannelTransport>,
    seen: Arc<Mutex<Vec<Message>>>,
    outstanding: Arc<AtomicUsize>,
    max_outstanding: Arc<AtomicUsize>,
}

impl FakeServer {
    pub fn seen(&self) -> Vec<Message> {
        self.seen.lock().unwrap().clone()
    }

    pub fn requests(&self, method: &str) -> Vec<Request> {
        self.seen()
            .into_iter()
            .filter_map(|m| match m {
                Message::Request(r) if r.method == method => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn notifications(&self, method: &str) -> Vec<Notification> {
        self.seen()
            .into_iter()
            .filter_map(|m| match m {
                Message::Notification(n) if n.method == method => Some(n),
                _ => None,
            })
            .collect()
    }

    pub fn responses(&self) -> Vec<Response> {
        self.seen()
            .into_iter()
            .filter_map(|m| match m {
                Message::Response(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding.load(Ordering::SeqCst)
    }

    pub async fn send(&self, message: Message) {
        self.transport.send(message.encode().unwrap()).await.unwrap();
    }
}

/// 启动假服务端；返回客户端一侧的传输
pub fn spawn_fake_server<F>(handler: F) -> (Arc<ChannelTransport>, FakeServer)
where
    F: Fn(&Request) -> Reply + Send + Sync + 'static,
{
    let (client, server) = ChannelTransport::pair();
    let server = Arc::new(server);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let outstanding = Arc::new(AtomicUsize::new(0));
    let max_outstanding = Arc::new(AtomicUsize::new(0));
    let handler = Arc::new(handler);

    let fake = FakeServer {
        transport: server.clone(),
        seen: seen.clone(),
        outstanding: outstanding.clone(),
        max_outstanding: max_outstanding.clone(),
    };

    tokio::spawn(async move {
        server.open().await.unwrap();
        while let Ok(Some(frame)) = server.receive().await {
            let Ok(messages) = Message::decode(&frame) else {
                continue;
            };
            for message in messages {
                seen.lock().unwrap().push(message.clone());
                let Message::Request(request) = message else {
                    continue;
                };
                let reply = handler(&request);
                let now = outstanding.fetch_add(1, Ordering::SeqCst) + 1;
                max_outstanding.fetch_max(now, Ordering::SeqCst);
                let server = server.clone();
                let outstanding = outstanding.clone();
                tokio::spawn(async move {
                    let response = match reply {
                        Reply::Result(v) => Some(Response::success(request.id, v)),
                        Reply::Error(e) => Some(Response::failure(request.id, e)),
                        Reply::After(delay, v) => {
                            tokio::time::sleep(delay).await;
                            Some(Response::success(request.id, v))
                        }
                        Reply::Silent => None,
                    };
                    if let Some(response) = response {
                        outstanding.fetch_sub(1, Ordering::SeqCst);
                        let _ = server
                            .send(Message::from(response).encode().unwrap())
                            .await;
                    }
                });
            }
        }
    });

    (Arc::new(client), fake)
}

pub fn initialize_result(version: &str) -> Value {
    json!({
        "protocolVersion": version,
        "capabilities": {"tools": {"listChanged": true}},
        "serverInfo": {"name": "fake", "version": "0.0.1"}
    })
}

pub fn tool(name: &str) -> Value {
    json!({
        "name": name,
        "description": format!("{name} tool"),
        "inputSchema": {"type": "object", "properties": {"text": {"type": "string"}}}
    })
}

/// 握手按标准应答，其余交给 on_call
pub fn standard_handler<F>(tools: Vec<Value>, on_call: F) -> impl Fn(&Request) -> Reply + Send + Sync
where
    F: Fn(&Request) -> Reply + Send + Sync,
{
    move |req: &Request| match req.method.as_str() {
        methods::INITIALIZE => Reply::Result(initialize_result("2025-03-26")),
        methods::TOOLS_LIST => Reply::Result(json!({"tools": tools.clone()})),
        methods::PING => Reply::Result(json!({})),
        _ => on_call(req),
    }
}

/// tools/call 的文本结果
pub fn text_result(text: &str) -> Value {
    json!({"content": [{"type": "text", "text": text}], "isError": false})
}

pub fn call_argument(req: &Request, key: &str) -> String {
    req.params
        .as_ref()
        .and_then(|p| p["arguments"][key].as_str())
        .unwrap_or_default()
        .to_string()
}

/// 轮询直到条件成立或超时
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn id_of(req: &Request) -> RequestId {
    req.id.clone()
}
