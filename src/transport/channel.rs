//! 进程内内存传输
//!
//! pair() 返回一对互联端点：一端 send 的帧由另一端 receive；任一端 close 后对端读到关闭。

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::core::TransportError;
use crate::transport::{Transport, TransportKind};

pub struct ChannelTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    opened: AtomicBool,
    closed: CancellationToken,
}

impl ChannelTransport {
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (Self::new(a_tx, a_rx), Self::new(b_tx, b_rx))
    }

    fn new(tx: mpsc::UnboundedSender<Vec<u8>>, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            opened: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Channel
    }

    async fn open(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.opened.store(true, Ordering::Release);
        Ok(())
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if !self.opened.load(Ordering::Acquire) {
            return Err(TransportError::NotOpen);
        }
        let tx = self.tx.lock().await;
        match tx.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn receive(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Ok(None),
            frame = rx.recv() => Ok(frame),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.cancel();
        self.tx.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_pair_roundtrip() {
        let (a, b) = ChannelTransport::pair();
        a.open().await.unwrap();
        b.open().await.unwrap();
        a.send(b"ping".to_vec()).await.unwrap();
        assert_eq!(b.receive().await.unwrap(), Some(b"ping".to_vec()));
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let (a, _b) = ChannelTransport::pair();
        assert_eq!(a.send(b"x".to_vec()).await, Err(TransportError::NotOpen));
    }

    #[tokio::test]
    async fn test_close_is_seen_by_peer() {
        let (a, b) = ChannelTransport::pair();
        a.open().await.unwrap();
        b.open().await.unwrap();
        a.close().await.unwrap();
        assert_eq!(b.receive().await.unwrap(), None);
        assert_eq!(a.receive().await.unwrap(), None);
        assert_eq!(a.send(b"late".to_vec()).await, Err(TransportError::Closed));
    }
}
