//! Pluggable duplex message channels between an MCP client and server.
//!
//! Every transport carries typed [`JsonRpcMessage`]s. Inbound messages are
//! delivered to a single registered handler, once each, in the order the
//! peer sent them.

mod http;
mod memory;
mod sse;
mod stdio;

pub use http::{StreamableHttpTransport, endpoint_url};
pub use memory::MemoryTransport;
pub use sse::{SseEvent, SseParser};
pub use stdio::StdioTransport;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::McpError;
use crate::jsonrpc::{ErrorCode, JsonRpcError, JsonRpcMessage, JsonRpcResponse};

/// Boxed future returned by transport operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Callback receiving each inbound message.
pub type MessageHandler = Arc<dyn Fn(JsonRpcMessage) + Send + Sync>;

/// Callback fired once when the peer goes away, with a human-readable reason.
pub type CloseHandler = Arc<dyn Fn(String) + Send + Sync>;

/// A duplex channel to one peer.
///
/// Handlers should be registered before [`Transport::start`]; messages that
/// arrive while no handler is registered are dropped with a warning.
pub trait Transport: Send + Sync {
    /// Acquire the underlying resources (process, stream, delivery task).
    fn start(&self) -> BoxFuture<'_, Result<(), McpError>>;

    /// Release the underlying resources. Stopping twice is harmless.
    fn stop(&self) -> BoxFuture<'_, Result<(), McpError>>;

    /// Send one message to the peer.
    ///
    /// Fails with a connection error if the transport is not running.
    fn send(&self, message: JsonRpcMessage) -> BoxFuture<'_, Result<(), McpError>>;

    /// Register the inbound message handler, replacing any previous one.
    fn on_message(&self, handler: MessageHandler);

    /// Register a handler for loss of the connection.
    fn on_close(&self, handler: CloseHandler);

    /// Whether the transport is started and the peer is still reachable.
    fn is_connected(&self) -> bool;

    /// Short label for logs and connection listings.
    fn kind(&self) -> &'static str;
}

/// Handler slots shared between a transport and its background tasks.
#[derive(Default)]
pub(crate) struct Handlers {
    message: RwLock<Option<MessageHandler>>,
    close: RwLock<Option<CloseHandler>>,
}

impl Handlers {
    pub(crate) fn set_message(&self, handler: MessageHandler) {
        *self.message.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub(crate) fn set_close(&self, handler: CloseHandler) {
        *self.close.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Deliver one inbound message to the registered handler.
    pub(crate) fn dispatch(&self, message: JsonRpcMessage) {
        let handler = self
            .message
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => handler(message),
            None => tracing::warn!("Dropping MCP message with no handler registered"),
        }
    }

    /// Decode one serialized message and deliver it.
    pub(crate) fn dispatch_text(&self, text: &str) {
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) => self.dispatch_value(value),
            Err(e) => tracing::warn!("Failed to parse MCP message: {e}: {text}"),
        }
    }

    /// Decode one JSON value and deliver it.
    ///
    /// A response that names its request id but is otherwise malformed is
    /// delivered as a parse error for that id, so the caller fails instead
    /// of waiting out its timeout.
    pub(crate) fn dispatch_value(&self, value: serde_json::Value) {
        let answered_id = value
            .as_object()
            .filter(|obj| !obj.contains_key("method"))
            .and_then(|obj| obj.get("id"))
            .and_then(serde_json::Value::as_u64);
        match serde_json::from_value::<JsonRpcMessage>(value) {
            Ok(message) => self.dispatch(message),
            Err(e) => {
                tracing::warn!("Failed to decode MCP message: {e}");
                if let Some(id) = answered_id {
                    let error =
                        JsonRpcError::new(ErrorCode::ParseError, format!("Malformed response: {e}"));
                    self.dispatch(JsonRpcResponse::failure(Some(id), error).into());
                }
            }
        }
    }

    /// Report that the connection is gone.
    pub(crate) fn closed(&self, reason: String) {
        let handler = self
            .close
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler(reason);
        }
    }
}
