//! MCP client: one session with one server.
//!
//! A client either pairs directly with an in-process [`McpServer`] or talks to
//! a server through a [`Transport`]. Every operation other than the handshake
//! requires an initialized session and fails fast with
//! [`McpError::NotConnected`] otherwise.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::McpError;
use crate::jsonrpc::{
    ErrorCode, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};
use crate::protocol::{
    GetPromptResult, Implementation, InitializeParams, InitializeResult, ListPromptsResult,
    ListResourcesResult, ListToolsResult, PROTOCOL_VERSION, PromptInfo, ReadResourceResult,
    Resource, ToolCallResult, ToolInfo, methods,
};
use crate::server::McpServer;
use crate::session::Session;
use crate::transport::Transport;

/// Default bound on a single request/response round trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type Waiter = oneshot::Sender<Result<JsonRpcResponse, McpError>>;

/// Requests awaiting a response, keyed by request id.
#[derive(Default)]
struct Pending {
    waiters: Mutex<HashMap<u64, Waiter>>,
}

impl Pending {
    fn insert(&self, id: u64, waiter: Waiter) {
        self.lock().insert(id, waiter);
    }

    fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    fn complete(&self, response: JsonRpcResponse) {
        let Some(id) = response.id else {
            tracing::warn!("Dropping MCP response without id");
            return;
        };
        match self.lock().remove(&id) {
            Some(waiter) => {
                let _ = waiter.send(Ok(response));
            }
            None => tracing::debug!("Dropping MCP response for unknown request {id}"),
        }
    }

    /// Fail every in-flight request.
    fn fail_all(&self, reason: &str) {
        let drained: Vec<Waiter> = self.lock().drain().map(|(_, w)| w).collect();
        for waiter in drained {
            let _ = waiter.send(Err(McpError::ConnectionClosed {
                reason: reason.to_string(),
            }));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drops the pending entry when the awaiting future goes away.
struct PendingSlot<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

/// Client for a single MCP server.
pub struct McpClient {
    client_info: Implementation,
    transport: Option<Arc<dyn Transport>>,
    direct: Mutex<Option<Arc<McpServer>>>,
    session: Mutex<Arc<Session>>,
    pending: Arc<Pending>,
    request_timeout: Duration,
}

impl McpClient {
    /// A client with no transport, for direct pairing via [`McpClient::connect`].
    pub fn new() -> Self {
        Self {
            client_info: Implementation::new("capstan", env!("CARGO_PKG_VERSION")),
            transport: None,
            direct: Mutex::new(None),
            session: Mutex::new(Arc::new(Session::new())),
            pending: Arc::new(Pending::default()),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// A client bound to `transport`; call [`McpClient::connect_remote`] next.
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        let pending = Arc::new(Pending::default());
        install_handlers(&transport, &pending);
        Self {
            transport: Some(transport),
            pending,
            ..Self::new()
        }
    }

    /// Identity sent to the server in `initialize`.
    pub fn with_client_info(mut self, info: Implementation) -> Self {
        self.client_info = info;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Pair directly with an in-process server, bypassing any transport.
    pub fn connect(&self, server: Arc<McpServer>) -> Result<(), McpError> {
        let session = self.session();
        session.mark_initializing()?;
        session.mark_initialized(server.initialize_result())?;
        *self.direct.lock().unwrap_or_else(PoisonError::into_inner) = Some(server);
        tracing::debug!("MCP session {} paired directly", session.id());
        Ok(())
    }

    /// Start the transport and perform the `initialize` handshake.
    ///
    /// On failure the transport is stopped and the session reset, so the call
    /// may be retried. The returned future carries no timeout of its own
    /// beyond the per-request bound; wrap it to impose one.
    pub async fn connect_remote(&self) -> Result<(), McpError> {
        let transport = self.transport.clone().ok_or_else(|| {
            McpError::Protocol("client has no transport to connect over".to_string())
        })?;
        let session = self.session();
        session.mark_initializing()?;

        let result = self.handshake(&session, transport.as_ref()).await;
        if let Err(e) = &result {
            tracing::debug!("MCP handshake over {} failed: {e}", transport.kind());
            if let Err(stop_err) = transport.stop().await {
                tracing::debug!("Failed to stop transport after handshake error: {stop_err}");
            }
            self.reset_session();
        }
        result
    }

    async fn handshake(&self, session: &Session, transport: &dyn Transport) -> Result<(), McpError> {
        transport.start().await?;

        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: json!({}),
            client_info: self.client_info.clone(),
        };
        let value = self
            .round_trip(session, methods::INITIALIZE, Some(serde_json::to_value(params)?))
            .await?;
        let result: InitializeResult = decode(methods::INITIALIZE, value)?;
        if result.protocol_version != PROTOCOL_VERSION {
            tracing::warn!(
                "MCP server '{}' negotiated protocol {} (client speaks {PROTOCOL_VERSION})",
                result.server_info.name,
                result.protocol_version
            );
        }
        let server_name = result.server_info.name.clone();
        session.mark_initialized(result)?;

        transport
            .send(JsonRpcNotification::new(methods::INITIALIZED, None).into())
            .await?;
        tracing::debug!(
            "MCP session {} initialized with '{server_name}' over {}",
            session.id(),
            transport.kind()
        );
        Ok(())
    }

    /// Stop the transport and discard the session. Harmless when repeated.
    pub async fn disconnect(&self) {
        self.reset_session();
        self.direct
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(transport) = &self.transport {
            if let Err(e) = transport.stop().await {
                tracing::debug!("Error stopping MCP transport: {e}");
            }
        }
        self.pending.fail_all("client disconnected");
    }

    pub fn is_initialized(&self) -> bool {
        self.session().is_initialized()
    }

    /// Protocol version negotiated in the handshake; `None` before it.
    pub fn protocol_version(&self) -> Option<String> {
        self.session().protocol_version()
    }

    pub fn server_info(&self) -> Option<Implementation> {
        self.session().server_info()
    }

    pub fn session_id(&self) -> String {
        self.session().id().to_string()
    }

    /// Label of the underlying transport.
    pub fn transport_kind(&self) -> &'static str {
        self.transport.as_ref().map_or("direct", |t| t.kind())
    }

    pub async fn ping(&self) -> Result<(), McpError> {
        self.request(methods::PING, None).await.map(|_| ())
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>, McpError> {
        let value = self.request(methods::TOOLS_LIST, None).await?;
        let list: ListToolsResult = decode(methods::TOOLS_LIST, value)?;
        Ok(list.tools)
    }

    /// Call a tool. A tool that ran and failed comes back with `is_error` set.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<ToolCallResult, McpError> {
        let params = json!({ "name": name, "arguments": arguments });
        let value = self.request(methods::TOOLS_CALL, Some(params)).await?;
        decode(methods::TOOLS_CALL, value)
    }

    pub async fn list_resources(&self) -> Result<Vec<Resource>, McpError> {
        let value = self.request(methods::RESOURCES_LIST, None).await?;
        let list: ListResourcesResult = decode(methods::RESOURCES_LIST, value)?;
        Ok(list.resources)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, McpError> {
        let value = self
            .request(methods::RESOURCES_READ, Some(json!({ "uri": uri })))
            .await?;
        decode(methods::RESOURCES_READ, value)
    }

    pub async fn list_prompts(&self) -> Result<Vec<PromptInfo>, McpError> {
        let value = self.request(methods::PROMPTS_LIST, None).await?;
        let list: ListPromptsResult = decode(methods::PROMPTS_LIST, value)?;
        Ok(list.prompts)
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> Result<GetPromptResult, McpError> {
        let params = json!({ "name": name, "arguments": arguments });
        let value = self.request(methods::PROMPTS_GET, Some(params)).await?;
        decode(methods::PROMPTS_GET, value)
    }

    /// One round trip on an initialized session.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let session = self.session();
        if !session.is_initialized() {
            return Err(McpError::NotConnected);
        }
        self.round_trip(&session, method, params).await
    }

    async fn round_trip(
        &self,
        session: &Session,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, McpError> {
        let id = session.next_request_id();
        let request = JsonRpcRequest::new(id, method, params);

        let direct = self
            .direct
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(server) = direct {
            return server
                .handle_request(&request)
                .into_result()
                .map_err(McpError::from);
        }

        let transport = self.transport.as_ref().ok_or(McpError::NotConnected)?;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let _slot = PendingSlot {
            pending: &self.pending,
            id,
        };

        tracing::debug!("MCP request {id}: {method}");
        // The bound covers the send too; HTTP delivers the reply inside it.
        let exchange = async {
            transport.send(request.into()).await?;
            match rx.await {
                Ok(reply) => reply?.into_result().map_err(McpError::from),
                Err(_) => Err(McpError::ConnectionClosed {
                    reason: format!("request '{method}' was abandoned"),
                }),
            }
        };
        tokio::time::timeout(self.request_timeout, exchange)
            .await
            .unwrap_or_else(|_| {
                Err(McpError::Timeout {
                    operation: method.to_string(),
                    timeout_ms: self.request_timeout.as_millis() as u64,
                })
            })
    }

    fn session(&self) -> Arc<Session> {
        Arc::clone(&self.session.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn reset_session(&self) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Arc::new(Session::new());
    }
}

impl Default for McpClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Route inbound traffic: responses to their waiters, server requests answered.
fn install_handlers(transport: &Arc<dyn Transport>, pending: &Arc<Pending>) {
    let weak = Arc::downgrade(transport);
    let for_messages = Arc::clone(pending);
    transport.on_message(Arc::new(move |message| match message {
        JsonRpcMessage::Response(response) => for_messages.complete(response),
        JsonRpcMessage::Request(request) => {
            let reply = if request.method == methods::PING {
                JsonRpcResponse::success(request.id, json!({}))
            } else {
                JsonRpcResponse::failure(
                    Some(request.id),
                    JsonRpcError::new(
                        ErrorCode::MethodNotFound,
                        format!("Method not found: {}", request.method),
                    ),
                )
            };
            if let Some(transport) = weak.upgrade() {
                tokio::spawn(async move {
                    if let Err(e) = transport.send(reply.into()).await {
                        tracing::debug!("Failed to answer server request: {e}");
                    }
                });
            }
        }
        JsonRpcMessage::Notification(notification) => {
            tracing::debug!("MCP server notification: {}", notification.method);
        }
    }));

    let for_close = Arc::clone(pending);
    transport.on_close(Arc::new(move |reason| {
        tracing::debug!("MCP transport closed: {reason}");
        for_close.fail_all(&reason);
    }));
}

fn decode<T: DeserializeOwned>(method: &str, value: Value) -> Result<T, McpError> {
    serde_json::from_value(value)
        .map_err(|e| McpError::Protocol(format!("Failed to parse {method} result: {e}")))
}
