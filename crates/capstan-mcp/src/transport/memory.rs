//! In-process transport pair.
//!
//! Two endpoints are wired to each other's inbox; messages are handed over as
//! typed values without serialization. Each endpoint drains its inbox from a
//! single delivery task, so the peer's send order is preserved even when the
//! two sides run on different tasks. Stopping an endpoint queues a close
//! notice behind everything it already sent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{BoxFuture, CloseHandler, Handlers, MessageHandler, Transport};
use crate::error::McpError;
use crate::jsonrpc::JsonRpcMessage;

/// What travels through an endpoint's inbox.
enum Inbound {
    Message(JsonRpcMessage),
    PeerStopped,
}

/// One end of an in-process transport pair.
pub struct MemoryTransport {
    inbox_tx: mpsc::UnboundedSender<Inbound>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    peer: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    handlers: Arc<Handlers>,
    running: AtomicBool,
    delivery: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryTransport {
    /// Create an unwired endpoint. Wire it with [`MemoryTransport::connect_to`].
    pub fn new() -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            peer: Mutex::new(None),
            handlers: Arc::new(Handlers::default()),
            running: AtomicBool::new(false),
            delivery: Mutex::new(None),
        }
    }

    /// Create two endpoints already wired to each other.
    pub fn pair() -> (Self, Self) {
        let a = Self::new();
        let b = Self::new();
        a.connect_to(&b);
        (a, b)
    }

    /// Wire this endpoint and `peer` to each other.
    pub fn connect_to(&self, peer: &MemoryTransport) {
        *self.peer.lock().unwrap_or_else(PoisonError::into_inner) = Some(peer.inbox_tx.clone());
        *peer.peer.lock().unwrap_or_else(PoisonError::into_inner) = Some(self.inbox_tx.clone());
    }

    fn peer_sender(&self) -> Option<mpsc::UnboundedSender<Inbound>> {
        self.peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn start(&self) -> BoxFuture<'_, Result<(), McpError>> {
        Box::pin(async move {
            let rx = self
                .inbox_rx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            let Some(mut rx) = rx else {
                return Err(McpError::Transport(
                    "in-process transport cannot be restarted".to_string(),
                ));
            };

            let handlers = Arc::clone(&self.handlers);
            let task = tokio::spawn(async move {
                while let Some(inbound) = rx.recv().await {
                    match inbound {
                        Inbound::Message(message) => handlers.dispatch(message),
                        Inbound::PeerStopped => {
                            handlers.closed("in-process peer stopped".to_string());
                            break;
                        }
                    }
                }
            });
            *self.delivery.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<(), McpError>> {
        Box::pin(async move {
            if !self.running.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
            let task = self
                .delivery
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(task) = task {
                // Dropping the receiver makes the peer's next send fail.
                task.abort();
            }
            if let Some(peer) = self.peer_sender() {
                let _ = peer.send(Inbound::PeerStopped);
            }
            Ok(())
        })
    }

    fn send(&self, message: JsonRpcMessage) -> BoxFuture<'_, Result<(), McpError>> {
        Box::pin(async move {
            if !self.running.load(Ordering::SeqCst) {
                return Err(McpError::NotConnected);
            }
            let peer = self.peer_sender().ok_or(McpError::NotConnected)?;
            peer.send(Inbound::Message(message))
                .map_err(|_| McpError::ConnectionClosed {
                    reason: "in-process peer stopped".to_string(),
                })
        })
    }

    fn on_message(&self, handler: MessageHandler) {
        self.handlers.set_message(handler);
    }

    fn on_close(&self, handler: CloseHandler) {
        self.handlers.set_close(handler);
    }

    fn is_connected(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.peer_sender().is_some_and(|peer| !peer.is_closed())
    }

    fn kind(&self) -> &'static str {
        "in-process"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::{JsonRpcNotification, JsonRpcRequest};
    use std::time::Duration;

    fn collector(transport: &MemoryTransport) -> mpsc::UnboundedReceiver<JsonRpcMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        transport.on_message(Arc::new(move |msg| {
            let _ = tx.send(msg);
        }));
        rx
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<JsonRpcMessage>) -> JsonRpcMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("message should arrive")
            .expect("channel open")
    }

    #[tokio::test]
    async fn ping_is_received_verbatim() {
        let (a, b) = MemoryTransport::pair();
        let mut inbox = collector(&b);
        a.start().await.unwrap();
        b.start().await.unwrap();

        let ping: JsonRpcMessage = JsonRpcRequest::new(1, "ping", None).into();
        a.send(ping.clone()).await.unwrap();
        assert_eq!(recv(&mut inbox).await, ping);
    }

    #[tokio::test]
    async fn back_to_back_messages_keep_order() {
        let (a, b) = MemoryTransport::pair();
        let mut inbox = collector(&b);
        a.start().await.unwrap();
        b.start().await.unwrap();

        for id in 1..=3 {
            a.send(JsonRpcRequest::new(id, "ping", None).into())
                .await
                .unwrap();
        }
        for expected in 1..=3 {
            match recv(&mut inbox).await {
                JsonRpcMessage::Request(r) => assert_eq!(r.id, expected),
                other => panic!("Expected request, got: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn order_holds_across_concurrent_sender_task() {
        let (a, b) = MemoryTransport::pair();
        let mut inbox = collector(&b);
        b.start().await.unwrap();
        a.start().await.unwrap();

        let a = Arc::new(a);
        let sender = Arc::clone(&a);
        tokio::spawn(async move {
            for i in 0..50 {
                let n = JsonRpcNotification::new(format!("n/{i}"), None);
                sender.send(n.into()).await.unwrap();
            }
        })
        .await
        .unwrap();

        for i in 0..50 {
            let msg = recv(&mut inbox).await;
            assert_eq!(msg.method(), Some(format!("n/{i}").as_str()));
        }
    }

    #[tokio::test]
    async fn messages_sent_before_peer_starts_are_queued() {
        let (a, b) = MemoryTransport::pair();
        let mut inbox = collector(&b);
        a.start().await.unwrap();
        a.send(JsonRpcRequest::new(7, "ping", None).into())
            .await
            .unwrap();
        b.start().await.unwrap();
        assert!(matches!(recv(&mut inbox).await, JsonRpcMessage::Request(r) if r.id == 7));
    }

    #[tokio::test]
    async fn send_before_start_fails() {
        let (a, _b) = MemoryTransport::pair();
        let err = a
            .send(JsonRpcRequest::new(1, "ping", None).into())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::NotConnected));
    }

    #[tokio::test]
    async fn send_after_stop_fails() {
        let (a, b) = MemoryTransport::pair();
        a.start().await.unwrap();
        b.start().await.unwrap();
        a.stop().await.unwrap();
        assert!(a.stop().await.is_ok());
        let err = a
            .send(JsonRpcRequest::new(1, "ping", None).into())
            .await
            .unwrap_err();
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn send_to_stopped_peer_fails() {
        let (a, b) = MemoryTransport::pair();
        a.start().await.unwrap();
        b.start().await.unwrap();
        b.stop().await.unwrap();
        // Give the aborted delivery task a moment to drop its receiver.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!a.is_connected());
        let err = a
            .send(JsonRpcRequest::new(1, "ping", None).into())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ConnectionClosed { .. }));
    }

    #[tokio::test]
    async fn unwired_endpoint_cannot_send() {
        let a = MemoryTransport::new();
        a.start().await.unwrap();
        assert!(!a.is_connected());
        assert!(
            a.send(JsonRpcRequest::new(1, "ping", None).into())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn stopping_one_end_closes_the_other_after_pending_messages() {
        let (a, b) = MemoryTransport::pair();
        let mut inbox = collector(&b);
        let (closed_tx, mut closed) = mpsc::unbounded_channel();
        b.on_close(Arc::new(move |reason| {
            let _ = closed_tx.send(reason);
        }));
        a.start().await.unwrap();
        b.start().await.unwrap();

        a.send(JsonRpcRequest::new(3, "ping", None).into())
            .await
            .unwrap();
        a.stop().await.unwrap();

        assert!(matches!(recv(&mut inbox).await, JsonRpcMessage::Request(r) if r.id == 3));
        let reason = tokio::time::timeout(Duration::from_secs(2), closed.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(reason.contains("stopped"));
    }
}
