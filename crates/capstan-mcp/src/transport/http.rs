//! Streamable HTTP transport.
//!
//! Every outbound message is POSTed to a single endpoint. The server answers
//! with either a JSON body or an SSE stream carrying the response; both are
//! handed to the message handler. Server-initiated messages arrive on a
//! long-lived GET stream that is opened after the first successful exchange.

use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::sse::{SseEvent, SseParser};
use super::{BoxFuture, CloseHandler, Handlers, MessageHandler, Transport};
use crate::error::McpError;
use crate::jsonrpc::JsonRpcMessage;
use crate::protocol::PROTOCOL_VERSION;

/// Path suffix that designates the canonical MCP endpoint.
const ENDPOINT_SUFFIX: &str = "/mcp";

const SESSION_HEADER: &str = "mcp-session-id";
const PROTOCOL_HEADER: &str = "mcp-protocol-version";
const ACCEPT_BOTH: &str = "application/json, text/event-stream";

/// Derive the canonical endpoint from a base URL.
///
/// `http://host:8080` and `http://host:8080/` become `http://host:8080/mcp`;
/// a URL whose path already ends in `/mcp` is kept (minus a trailing slash).
pub fn endpoint_url(base: &str) -> Result<Url, McpError> {
    let invalid = |message: String| McpError::InvalidUrl {
        url: base.to_string(),
        message,
    };
    let mut url = Url::parse(base).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }

    let path = url.path().trim_end_matches('/').to_string();
    if path.ends_with(ENDPOINT_SUFFIX) {
        url.set_path(&path);
    } else {
        url.set_path(&format!("{path}{ENDPOINT_SUFFIX}"));
    }
    Ok(url)
}

/// MCP client transport over Streamable HTTP.
pub struct StreamableHttpTransport {
    endpoint: Url,
    http: reqwest::Client,
    session_id: Arc<Mutex<Option<String>>>,
    handlers: Arc<Handlers>,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl StreamableHttpTransport {
    /// Create a transport for `base_url`; the endpoint is derived with [`endpoint_url`].
    pub fn new(base_url: &str) -> Result<Self, McpError> {
        let endpoint = endpoint_url(base_url)?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| McpError::Transport(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            endpoint,
            http,
            session_id: Arc::new(Mutex::new(None)),
            handlers: Arc::new(Handlers::default()),
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            listener: Mutex::new(None),
        })
    }

    /// The only URL this transport talks to.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Session id assigned by the server, if any.
    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn capture_session(&self, headers: &HeaderMap) {
        if let Some(sid) = headers.get(SESSION_HEADER).and_then(|h| h.to_str().ok()) {
            let mut current = self.session_id.lock().unwrap_or_else(PoisonError::into_inner);
            if current.as_deref() != Some(sid) {
                tracing::debug!("MCP session id assigned: {sid}");
                *current = Some(sid.to_string());
            }
        }
    }

    /// Open the server→client stream once per start.
    fn ensure_listener(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let mut listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if listener.is_some() {
            return;
        }

        let http = self.http.clone();
        let endpoint = self.endpoint.clone();
        let session_id = self.session_id();
        let handlers = Arc::clone(&self.handlers);
        let cancel = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        *listener = Some(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = listen(http, endpoint, session_id, handlers) => {}
            }
        }));
    }
}

/// Consume the standalone GET stream until it ends.
async fn listen(
    http: reqwest::Client,
    endpoint: Url,
    session_id: Option<String>,
    handlers: Arc<Handlers>,
) {
    let mut req = http
        .get(endpoint.clone())
        .header(ACCEPT, "text/event-stream")
        .header(PROTOCOL_HEADER, PROTOCOL_VERSION);
    if let Some(sid) = &session_id {
        req = req.header(SESSION_HEADER, sid);
    }

    let response = match req.send().await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!("Failed to open MCP event stream at {endpoint}: {e}");
            return;
        }
    };

    let status = response.status();
    if status == StatusCode::METHOD_NOT_ALLOWED || status == StatusCode::NOT_FOUND {
        tracing::debug!("MCP server at {endpoint} offers no standalone event stream");
        return;
    }
    if !status.is_success() {
        tracing::warn!("MCP event stream at {endpoint} returned HTTP {status}");
        return;
    }

    if let Err(e) = consume_sse(response, &handlers).await {
        tracing::warn!("MCP event stream at {endpoint} failed: {e}");
    }
    tracing::debug!("MCP event stream at {endpoint} ended");
}

/// Feed an SSE response body through the parser, dispatching each message.
async fn consume_sse(response: reqwest::Response, handlers: &Handlers) -> Result<(), McpError> {
    let mut stream = response.bytes_stream();
    let mut parser = SseParser::new();
    while let Some(chunk) = stream.next().await {
        let chunk: bytes::Bytes =
            chunk.map_err(|e| McpError::Transport(format!("Event stream read failed: {e}")))?;
        for event in parser.feed_bytes(&chunk) {
            dispatch_event(event, handlers);
        }
    }
    if let Some(event) = parser.finish() {
        dispatch_event(event, handlers);
    }
    Ok(())
}

fn dispatch_event(event: SseEvent, handlers: &Handlers) {
    if event.event_type.as_deref().is_some_and(|t| t != "message") {
        return;
    }
    handlers.dispatch_text(&event.data);
}

/// Dispatch a JSON body holding one message or a batch.
fn dispatch_json(body: &[u8], handlers: &Handlers) -> Result<(), McpError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(());
    }
    let value: serde_json::Value = serde_json::from_slice(body)?;
    let messages = match value {
        serde_json::Value::Array(items) => items,
        single => vec![single],
    };
    for item in messages {
        handlers.dispatch_value(item);
    }
    Ok(())
}

impl Transport for StreamableHttpTransport {
    fn start(&self) -> BoxFuture<'_, Result<(), McpError>> {
        Box::pin(async move {
            if self.running.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();
            tracing::debug!("Streamable HTTP transport started for {}", self.endpoint);
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<(), McpError>> {
        Box::pin(async move {
            if !self.running.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
            self.cancel
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .cancel();
            let listener = self
                .listener
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(handle) = listener {
                handle.abort();
            }

            // Best-effort session termination
            let session_id = self
                .session_id
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(sid) = session_id {
                let result = self
                    .http
                    .delete(self.endpoint.clone())
                    .header(SESSION_HEADER, sid)
                    .timeout(Duration::from_secs(2))
                    .send()
                    .await;
                if let Err(e) = result {
                    tracing::debug!("MCP session DELETE failed: {e}");
                }
            }
            Ok(())
        })
    }

    fn send(&self, message: JsonRpcMessage) -> BoxFuture<'_, Result<(), McpError>> {
        Box::pin(async move {
            if !self.running.load(Ordering::SeqCst) {
                return Err(McpError::NotConnected);
            }

            let mut req = self
                .http
                .post(self.endpoint.clone())
                .header(ACCEPT, ACCEPT_BOTH)
                .header(PROTOCOL_HEADER, PROTOCOL_VERSION)
                .json(&message);
            if let Some(sid) = self.session_id() {
                req = req.header(SESSION_HEADER, sid);
            }

            let response = req
                .send()
                .await
                .map_err(|e| McpError::Transport(format!("POST {}: {e}", self.endpoint)))?;
            self.capture_session(response.headers());

            let status = response.status();
            if status == StatusCode::ACCEPTED {
                self.ensure_listener();
                return Ok(());
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(McpError::HttpStatus {
                    status: status.as_u16(),
                    body,
                });
            }

            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|h| h.to_str().ok())
                .unwrap_or("")
                .to_string();
            if content_type.starts_with("text/event-stream") {
                consume_sse(response, &self.handlers).await?;
            } else {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| McpError::Transport(format!("Failed to read response: {e}")))?;
                dispatch_json(&body, &self.handlers)?;
            }

            self.ensure_listener();
            Ok(())
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
    }

    fn kind(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::{JsonRpcNotification, JsonRpcRequest};
    use tokio::sync::mpsc;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn collector(transport: &StreamableHttpTransport) -> mpsc::UnboundedReceiver<JsonRpcMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        transport.on_message(Arc::new(move |msg| {
            let _ = tx.send(msg);
        }));
        rx
    }

    async fn no_event_stream(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(405))
            .mount(server)
            .await;
    }

    #[test]
    fn endpoint_appends_suffix() {
        assert_eq!(
            endpoint_url("http://localhost:8080").unwrap().as_str(),
            "http://localhost:8080/mcp"
        );
        assert_eq!(
            endpoint_url("http://localhost:8080/api/").unwrap().as_str(),
            "http://localhost:8080/api/mcp"
        );
    }

    #[test]
    fn endpoint_keeps_existing_suffix() {
        assert_eq!(
            endpoint_url("https://example.com/mcp").unwrap().as_str(),
            "https://example.com/mcp"
        );
        assert_eq!(
            endpoint_url("https://example.com/v1/mcp/").unwrap().as_str(),
            "https://example.com/v1/mcp"
        );
    }

    #[test]
    fn endpoint_does_not_match_partial_segment() {
        assert_eq!(
            endpoint_url("http://h/mcpx").unwrap().as_str(),
            "http://h/mcpx/mcp"
        );
    }

    #[test]
    fn endpoint_rejects_bad_urls() {
        assert!(matches!(
            endpoint_url("not a url"),
            Err(McpError::InvalidUrl { .. })
        ));
        assert!(matches!(
            endpoint_url("ftp://example.com"),
            Err(McpError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn send_before_start_fails() {
        let transport = StreamableHttpTransport::new("http://127.0.0.1:9").unwrap();
        let err = transport
            .send(JsonRpcRequest::new(1, "ping", None).into())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::NotConnected));
    }

    #[tokio::test]
    async fn json_response_is_dispatched_and_session_echoed() {
        let server = MockServer::start().await;
        no_event_stream(&server).await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(header("mcp-session-id", "sess-1"))
            .respond_with(ResponseTemplate::new(202))
            .with_priority(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("mcp-session-id", "sess-1")
                    .set_body_json(serde_json::json!({"jsonrpc":"2.0","id":1,"result":{"ok":true}})),
            )
            .mount(&server)
            .await;

        let transport = StreamableHttpTransport::new(&server.uri()).unwrap();
        let mut inbox = collector(&transport);
        transport.start().await.unwrap();

        transport
            .send(JsonRpcRequest::new(1, "ping", None).into())
            .await
            .unwrap();
        let msg = inbox.recv().await.unwrap();
        match msg {
            JsonRpcMessage::Response(resp) => {
                assert_eq!(resp.id, Some(1));
                assert_eq!(resp.into_result().unwrap()["ok"], true);
            }
            other => panic!("Expected response, got: {other:?}"),
        }
        assert_eq!(transport.session_id().as_deref(), Some("sess-1"));

        // The follow-up carries the session header and hits the 202 mock
        transport
            .send(JsonRpcNotification::new("notifications/initialized", None).into())
            .await
            .unwrap();
        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn sse_response_is_dispatched() {
        let server = MockServer::start().await;
        no_event_stream(&server).await;
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":4,\"result\":{}}\n\n";
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let transport = StreamableHttpTransport::new(&server.uri()).unwrap();
        let mut inbox = collector(&transport);
        transport.start().await.unwrap();
        transport
            .send(JsonRpcRequest::new(4, "tools/list", None).into())
            .await
            .unwrap();
        assert!(matches!(
            inbox.recv().await.unwrap(),
            JsonRpcMessage::Response(r) if r.id == Some(4)
        ));
        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn null_result_in_json_body_is_dispatched() {
        let server = MockServer::start().await;
        no_event_stream(&server).await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"jsonrpc":"2.0","id":6,"result":null})),
            )
            .mount(&server)
            .await;

        let transport = StreamableHttpTransport::new(&server.uri()).unwrap();
        let mut inbox = collector(&transport);
        transport.start().await.unwrap();
        transport
            .send(JsonRpcRequest::new(6, "ping", None).into())
            .await
            .unwrap();
        match inbox.recv().await.unwrap() {
            JsonRpcMessage::Response(resp) => {
                assert_eq!(resp.into_result().unwrap(), serde_json::Value::Null)
            }
            other => panic!("Expected response, got: {other:?}"),
        }
        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn http_error_status_propagates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let transport = StreamableHttpTransport::new(&server.uri()).unwrap();
        transport.start().await.unwrap();
        let err = transport
            .send(JsonRpcRequest::new(1, "ping", None).into())
            .await
            .unwrap_err();
        match err {
            McpError::HttpStatus { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("Expected HttpStatus, got: {other:?}"),
        }
        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn refused_connection_is_transport_error() {
        // Port 9 (discard) is closed on test machines
        let transport = StreamableHttpTransport::new("http://127.0.0.1:9").unwrap();
        transport.start().await.unwrap();
        let err = transport
            .send(JsonRpcRequest::new(1, "ping", None).into())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Transport(_)));
        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn server_initiated_messages_arrive_on_event_stream() {
        let server = MockServer::start().await;
        let stream_body =
            "event: message\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/tools/list_changed\"}\n\n";
        Mock::given(method("GET"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(stream_body, "text/event-stream"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;

        let transport = StreamableHttpTransport::new(&server.uri()).unwrap();
        let mut inbox = collector(&transport);
        transport.start().await.unwrap();
        transport
            .send(JsonRpcNotification::new("notifications/initialized", None).into())
            .await
            .unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(5), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.method(), Some("notifications/tools/list_changed"));
        transport.stop().await.unwrap();
    }
}
