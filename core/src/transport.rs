//! The transport writer (§4.1): a single task serializing all writes to a
//! duplex byte channel, abstracted behind [`Transport`] so the rest of the
//! core is testable without a real network stack.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;

use crate::error::Result;

/// An already-negotiated duplex byte channel. The HTTP/WebSocket upgrade
/// that produces one of these is out of scope here.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_bytes(&self, bytes: Vec<u8>) -> Result<()>;
    async fn recv_bytes(&self) -> Result<Option<Vec<u8>>>;
    async fn close(&self);
}

/// Default writer-queue capacity, matching the registry's admission default
/// (§4.1 "Ambient detail").
pub const DEFAULT_WRITER_CAPACITY: usize = 64;

/// Spawns the single writer task for a connection. Returns a sender for
/// enqueueing outbound frames and a handle that resolves once the writer
/// has exited (observable by the orchestrator per §4.1).
pub fn spawn_writer(
    transport: std::sync::Arc<dyn Transport>,
    capacity: usize,
) -> (mpsc::Sender<Vec<u8>>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(capacity);
    let handle = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = transport.send_bytes(frame).await {
                warn!(error = %e, "transport writer failed to send, stopping");
                break;
            }
        }
        debug!("transport writer exiting");
        transport.close().await;
    });
    (tx, handle)
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// An in-memory transport for tests: `send_bytes` records frames,
    /// `recv_bytes` replays a fixed inbound script.
    pub struct MemoryTransport {
        pub sent: Mutex<Vec<Vec<u8>>>,
        inbound: Mutex<std::collections::VecDeque<Vec<u8>>>,
        closed: Mutex<bool>,
    }

    impl MemoryTransport {
        pub fn new(inbound: Vec<Vec<u8>>) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                inbound: Mutex::new(inbound.into()),
                closed: Mutex::new(false),
            }
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send_bytes(&self, bytes: Vec<u8>) -> Result<()> {
            self.sent.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(bytes);
            Ok(())
        }

        async fn recv_bytes(&self) -> Result<Option<Vec<u8>>> {
            Ok(self.inbound.lock().unwrap_or_else(std::sync::PoisonError::into_inner).pop_front())
        }

        async fn close(&self) {
            *self.closed.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = true;
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::test_support::MemoryTransport;
    use super::*;

    #[tokio::test]
    async fn writer_preserves_enqueue_order() {
        let transport = std::sync::Arc::new(MemoryTransport::new(Vec::new()));
        let (tx, handle) = spawn_writer(transport.clone(), DEFAULT_WRITER_CAPACITY);
        tx.send(b"one".to_vec()).await.expect("send");
        tx.send(b"two".to_vec()).await.expect("send");
        drop(tx);
        handle.await.expect("writer task joins");
        let sent = transport.sent.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        assert_eq!(*sent, vec![b"one".to_vec(), b"two".to_vec()]);
    }
}
