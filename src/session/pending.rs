//! 待决调用表：correlation id → 一次性回复通道
//!
//! 先登记后发送；响应到达时按 id 取出并恰好解决一次，已被移除的 id（超时 / 取消）的迟到响应被丢弃并计数。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::core::TransportError;
use crate::protocol::{RequestId, Response};

pub type Reply = Result<Response, TransportError>;

#[derive(Debug, Default)]
pub struct PendingTable {
    inner: Mutex<HashMap<RequestId, oneshot::Sender<Reply>>>,
    late: AtomicU64,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, oneshot::Sender<Reply>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 登记 id；返回等待回复的接收端
    pub fn insert(&self, id: RequestId) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        if self.lock().insert(id.clone(), tx).is_some() {
            tracing::warn!(id = %id, "correlation id reused while outstanding");
        }
        rx
    }

    /// 按响应 id 解决；id 不在表中（迟到或未知）时返回 false
    pub fn resolve(&self, response: Response) -> bool {
        let sender = self.lock().remove(&response.id);
        match sender {
            Some(tx) => {
                let id = response.id.clone();
                if tx.send(Ok(response)).is_err() {
                    tracing::debug!(id = %id, "caller dropped before response arrived");
                }
                true
            }
            None => {
                self.late.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// 移除 id（超时 / 取消）；之后该 id 的响应被视为迟到
    pub fn remove(&self, id: &RequestId) -> bool {
        self.lock().remove(id).is_some()
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.lock().contains_key(id)
    }

    /// 传输关闭：以同一错误解决所有待决调用
    pub fn fail_all(&self, err: TransportError) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let n = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(err.clone()));
        }
        n
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 被丢弃的迟到响应数
    pub fn late_responses(&self) -> u64 {
        self.late.load(Ordering::Relaxed)
    }
}
