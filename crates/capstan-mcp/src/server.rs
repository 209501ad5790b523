//! In-process MCP server: a capability registry plus the request dispatcher.
//!
//! A server can be paired with a client directly, served over any
//! [`Transport`], or act as the child side of the stdio convention.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::error::McpError;
use crate::jsonrpc::{ErrorCode, JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse};
use crate::protocol::{
    CallToolParams, GetPromptParams, GetPromptResult, Implementation, InitializeParams,
    InitializeResult, ListPromptsResult, ListResourcesResult, ListToolsResult, PROTOCOL_VERSION,
    PromptArgument, PromptInfo, PromptMessage, ReadResourceParams, ReadResourceResult, Resource,
    ResourceContents, ToolCallResult, ToolInfo, ToolInputSchema, methods,
};
use crate::transport::Transport;

/// Error type returned by executors and generators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Callable behind a server tool.
pub type ToolExecutor = Arc<dyn Fn(&Map<String, Value>) -> Result<Value, BoxError> + Send + Sync>;

/// Callable behind a server prompt.
pub type PromptGenerator =
    Arc<dyn Fn(&HashMap<String, String>) -> Result<Vec<PromptMessage>, BoxError> + Send + Sync>;

/// A tool published by an [`McpServer`].
#[derive(Clone)]
pub struct ServerTool {
    pub name: String,
    pub description: String,
    pub input_schema: ToolInputSchema,
    executor: ToolExecutor,
}

impl ServerTool {
    pub fn new<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: ToolInputSchema,
        executor: F,
    ) -> Self
    where
        F: Fn(&Map<String, Value>) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            executor: Arc::new(executor),
        }
    }

    /// Wire description for `tools/list`.
    pub fn info(&self) -> ToolInfo {
        ToolInfo {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

impl fmt::Debug for ServerTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .finish_non_exhaustive()
    }
}

/// A prompt template published by an [`McpServer`].
#[derive(Clone)]
pub struct ServerPrompt {
    pub name: String,
    pub description: String,
    pub arguments: Vec<PromptArgument>,
    generator: PromptGenerator,
}

impl ServerPrompt {
    pub fn new<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        arguments: Vec<PromptArgument>,
        generator: F,
    ) -> Self
    where
        F: Fn(&HashMap<String, String>) -> Result<Vec<PromptMessage>, BoxError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            arguments,
            generator: Arc::new(generator),
        }
    }

    pub fn info(&self) -> PromptInfo {
        PromptInfo {
            name: self.name.clone(),
            description: self.description.clone(),
            arguments: self.arguments.clone(),
        }
    }

    /// Required argument names absent from `args`.
    pub fn missing_arguments(&self, args: &HashMap<String, String>) -> Vec<&str> {
        self.arguments
            .iter()
            .filter(|a| a.required && !args.contains_key(&a.name))
            .map(|a| a.name.as_str())
            .collect()
    }
}

impl fmt::Debug for ServerPrompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerPrompt")
            .field("name", &self.name)
            .field("arguments", &self.arguments)
            .finish_non_exhaustive()
    }
}

/// Registry of resources, tools and prompts with a JSON-RPC front end.
///
/// Registration is an upsert keyed by uri or name. Listings are sorted by key.
pub struct McpServer {
    info: Implementation,
    resources: RwLock<BTreeMap<String, Resource>>,
    tools: RwLock<BTreeMap<String, ServerTool>>,
    prompts: RwLock<BTreeMap<String, ServerPrompt>>,
}

impl McpServer {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            info: Implementation::new(name, version),
            resources: RwLock::new(BTreeMap::new()),
            tools: RwLock::new(BTreeMap::new()),
            prompts: RwLock::new(BTreeMap::new()),
        }
    }

    /// Identity reported during the handshake.
    pub fn info(&self) -> &Implementation {
        &self.info
    }

    pub fn register_resource(&self, resource: Resource) {
        self.resources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(resource.uri.clone(), resource);
    }

    pub fn register_tool(&self, tool: ServerTool) {
        self.tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tool.name.clone(), tool);
    }

    pub fn register_prompt(&self, prompt: ServerPrompt) {
        self.prompts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(prompt.name.clone(), prompt);
    }

    pub fn resource(&self, uri: &str) -> Option<Resource> {
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uri)
            .cloned()
    }

    pub fn tool(&self, name: &str) -> Option<ServerTool> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn prompt(&self, name: &str) -> Option<ServerPrompt> {
        self.prompts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn list_resources(&self) -> Vec<Resource> {
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn list_tools(&self) -> Vec<ToolInfo> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(ServerTool::info)
            .collect()
    }

    pub fn list_prompts(&self) -> Vec<PromptInfo> {
        self.prompts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(ServerPrompt::info)
            .collect()
    }

    /// Run a tool's executor.
    ///
    /// An unknown name is a `TOOL_NOT_FOUND` protocol error. An executor that
    /// fails yields an error-flagged result carrying its message.
    pub fn invoke_tool(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
    ) -> Result<ToolCallResult, McpError> {
        let tool = self.tool(name).ok_or_else(|| {
            McpError::rpc(ErrorCode::ToolNotFound, format!("Tool not found: {name}"))
        })?;

        match (tool.executor)(arguments) {
            Ok(Value::String(text)) => Ok(ToolCallResult::text(text)),
            Ok(other) => Ok(ToolCallResult::text(other.to_string())),
            Err(e) => {
                tracing::debug!("Tool '{name}' failed: {e}");
                Ok(ToolCallResult::error(e.to_string()))
            }
        }
    }

    /// Render a prompt after checking its required arguments.
    pub fn get_prompt(
        &self,
        name: &str,
        arguments: &HashMap<String, String>,
    ) -> Result<GetPromptResult, McpError> {
        let prompt = self.prompt(name).ok_or_else(|| {
            McpError::rpc(
                ErrorCode::PromptNotFound,
                format!("Prompt not found: {name}"),
            )
        })?;

        let missing = prompt.missing_arguments(arguments);
        if !missing.is_empty() {
            return Err(McpError::InvalidArguments {
                target: name.to_string(),
                message: format!("missing required argument(s): {}", missing.join(", ")),
            });
        }

        let messages = (prompt.generator)(arguments).map_err(|e| {
            McpError::rpc(
                ErrorCode::InternalError,
                format!("Prompt '{name}' failed: {e}"),
            )
        })?;
        Ok(GetPromptResult {
            description: Some(prompt.description.clone()),
            messages,
        })
    }

    pub fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, McpError> {
        let resource = self.resource(uri).ok_or_else(|| {
            McpError::rpc(
                ErrorCode::ResourceNotFound,
                format!("Resource not found: {uri}"),
            )
        })?;
        Ok(ReadResourceResult {
            contents: vec![ResourceContents {
                uri: resource.uri,
                mime_type: resource.mime_type,
                text: resource.text.unwrap_or_default(),
            }],
        })
    }

    /// What this server answers to `initialize`.
    pub fn initialize_result(&self) -> InitializeResult {
        InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: json!({
                "tools": {},
                "resources": {},
                "prompts": {},
            }),
            server_info: self.info.clone(),
        }
    }

    /// Answer one request.
    pub fn handle_request(&self, request: &JsonRpcRequest) -> JsonRpcResponse {
        match self.dispatch(request) {
            Ok(result) => JsonRpcResponse::success(request.id, result),
            Err(e) => {
                tracing::debug!("MCP request '{}' failed: {e}", request.method);
                JsonRpcResponse::failure(Some(request.id), e.to_rpc_error())
            }
        }
    }

    fn dispatch(&self, request: &JsonRpcRequest) -> Result<Value, McpError> {
        match request.method.as_str() {
            methods::INITIALIZE => {
                if request.params.is_some() {
                    let params: InitializeParams = params(request)?;
                    if params.protocol_version != PROTOCOL_VERSION {
                        tracing::info!(
                            "Client '{}' speaks protocol {}, answering with {PROTOCOL_VERSION}",
                            params.client_info.name,
                            params.protocol_version
                        );
                    }
                }
                to_value(self.initialize_result())
            }
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => to_value(ListToolsResult {
                tools: self.list_tools(),
            }),
            methods::TOOLS_CALL => {
                let params: CallToolParams = params(request)?;
                to_value(self.invoke_tool(&params.name, &params.arguments)?)
            }
            methods::RESOURCES_LIST => to_value(ListResourcesResult {
                resources: self.list_resources(),
            }),
            methods::RESOURCES_READ => {
                let params: ReadResourceParams = params(request)?;
                to_value(self.read_resource(&params.uri)?)
            }
            methods::PROMPTS_LIST => to_value(ListPromptsResult {
                prompts: self.list_prompts(),
            }),
            methods::PROMPTS_GET => {
                let params: GetPromptParams = params(request)?;
                to_value(self.get_prompt(&params.name, &params.arguments)?)
            }
            other => Err(McpError::rpc(
                ErrorCode::MethodNotFound,
                format!("Method not found: {other}"),
            )),
        }
    }

    /// Answer any inbound message. Only requests produce a reply.
    pub fn handle_message(&self, message: JsonRpcMessage) -> Option<JsonRpcMessage> {
        match message {
            JsonRpcMessage::Request(request) => Some(self.handle_request(&request).into()),
            JsonRpcMessage::Notification(notification) => {
                tracing::debug!("MCP notification: {}", notification.method);
                None
            }
            JsonRpcMessage::Response(response) => {
                tracing::warn!("Ignoring unexpected MCP response (id {:?})", response.id);
                None
            }
        }
    }

    /// Answer requests arriving over `transport` until the connection drops.
    ///
    /// Requests are handled one at a time, so replies leave in request order.
    pub async fn serve(self: Arc<Self>, transport: Arc<dyn Transport>) -> Result<(), McpError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Option<JsonRpcMessage>>();
        let close_tx = tx.clone();
        transport.on_message(Arc::new(move |message| {
            let _ = tx.send(Some(message));
        }));
        transport.on_close(Arc::new(move |reason| {
            tracing::debug!("MCP server transport closed: {reason}");
            let _ = close_tx.send(None);
        }));
        transport.start().await?;

        while let Some(Some(message)) = rx.recv().await {
            let Some(reply) = self.handle_message(message) else {
                continue;
            };
            if let Err(e) = transport.send(reply).await {
                if e.is_connection_error() {
                    tracing::debug!("MCP client went away: {e}");
                    break;
                }
                tracing::warn!("Failed to send MCP reply: {e}");
            }
        }
        transport.stop().await
    }

    /// Serve newline-delimited JSON-RPC until `reader` reaches EOF.
    pub async fn serve_lines<R, W>(&self, mut reader: R, mut writer: W) -> Result<(), McpError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                return Ok(());
            }
            let reply = match std::str::from_utf8(&line) {
                Ok(text) if text.trim().is_empty() => continue,
                Ok(text) => match JsonRpcMessage::parse(text) {
                    Ok(message) => self.handle_message(message),
                    Err(e) => Some(unparseable(text, &e).into()),
                },
                Err(e) => Some(
                    JsonRpcResponse::failure(
                        None,
                        JsonRpcError::new(ErrorCode::ParseError, format!("Parse error: {e}")),
                    )
                    .into(),
                ),
            };
            if let Some(reply) = reply {
                let mut out = serde_json::to_string(&reply)?;
                out.push('\n');
                writer.write_all(out.as_bytes()).await?;
                writer.flush().await?;
            }
        }
    }

    /// Act as the child side of a stdio connection.
    pub async fn serve_stdio(&self) -> Result<(), McpError> {
        self.serve_lines(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
            .await
    }
}

impl fmt::Debug for McpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("McpServer")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// Reply for a line that is not a JSON-RPC message.
fn unparseable(line: &str, err: &serde_json::Error) -> JsonRpcResponse {
    let error = if serde_json::from_str::<Value>(line).is_ok() {
        JsonRpcError::new(ErrorCode::InvalidRequest, format!("Invalid request: {err}"))
    } else {
        JsonRpcError::new(ErrorCode::ParseError, format!("Parse error: {err}"))
    };
    JsonRpcResponse::failure(None, error)
}

fn params<T: DeserializeOwned>(request: &JsonRpcRequest) -> Result<T, McpError> {
    let raw = request.params.clone().unwrap_or(Value::Null);
    serde_json::from_value(raw).map_err(|e| McpError::InvalidArguments {
        target: request.method.clone(),
        message: e.to_string(),
    })
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, McpError> {
    Ok(serde_json::to_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::ResponsePayload;
    use crate::protocol::PropertySchema;

    fn echo_tool() -> ServerTool {
        let schema = ToolInputSchema::new(
            [("text", PropertySchema::new("string", "Text to echo"))],
            ["text"],
        )
        .unwrap();
        ServerTool::new("echo", "Echo text back", schema, |args| {
            Ok(args.get("text").cloned().unwrap_or(Value::Null))
        })
    }

    fn failing_tool() -> ServerTool {
        ServerTool::new("explode", "Always fails", ToolInputSchema::empty(), |_| {
            Err("disk full".into())
        })
    }

    fn greeting_prompt() -> ServerPrompt {
        ServerPrompt::new(
            "greet",
            "Greet someone",
            vec![PromptArgument {
                name: "who".into(),
                description: "Person to greet".into(),
                required: true,
            }],
            |args| Ok(vec![PromptMessage::user(format!("Hello, {}!", args["who"]))]),
        )
    }

    fn server() -> McpServer {
        let server = McpServer::new("test-server", "1.0.0");
        server.register_tool(echo_tool());
        server.register_tool(failing_tool());
        server.register_prompt(greeting_prompt());
        server.register_resource(Resource {
            uri: "file:///readme".into(),
            name: "readme".into(),
            description: "Project readme".into(),
            resource_type: "file".into(),
            mime_type: Some("text/plain".into()),
            text: Some("hello".into()),
        });
        server
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn error_code(response: &JsonRpcResponse) -> i64 {
        match &response.payload {
            ResponsePayload::Error(e) => e.code,
            ResponsePayload::Result(r) => panic!("Expected error, got result: {r}"),
        }
    }

    #[test]
    fn invoke_returns_text_result() {
        let result = server()
            .invoke_tool("echo", &args(json!({"text": "hi"})))
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.joined_text(), "hi");
    }

    #[test]
    fn invoke_unknown_tool_is_protocol_error() {
        let err = server().invoke_tool("nope", &Map::new()).unwrap_err();
        assert_eq!(err.error_code(), Some(ErrorCode::ToolNotFound));
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn failing_executor_is_flagged_result() {
        let result = server().invoke_tool("explode", &Map::new()).unwrap();
        assert!(result.is_error);
        assert_eq!(result.joined_text(), "disk full");
    }

    #[test]
    fn non_string_results_are_serialized() {
        let server = McpServer::new("s", "1");
        server.register_tool(ServerTool::new(
            "count",
            "",
            ToolInputSchema::empty(),
            |_| Ok(json!({"n": 3})),
        ));
        let result = server.invoke_tool("count", &Map::new()).unwrap();
        assert_eq!(result.joined_text(), r#"{"n":3}"#);
    }

    #[test]
    fn registration_upserts() {
        let server = server();
        server.register_tool(ServerTool::new(
            "echo",
            "Replaced",
            ToolInputSchema::empty(),
            |_| Ok(json!("replaced")),
        ));
        assert_eq!(server.list_tools().len(), 2);
        assert_eq!(server.tool("echo").unwrap().description, "Replaced");
    }

    #[test]
    fn listings_are_sorted() {
        let names: Vec<String> = server().list_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["echo", "explode"]);
    }

    #[test]
    fn lookups_return_none_for_unknown() {
        let server = server();
        assert!(server.tool("missing").is_none());
        assert!(server.prompt("missing").is_none());
        assert!(server.resource("file:///missing").is_none());
    }

    #[test]
    fn prompt_requires_arguments() {
        let server = server();
        let err = server.get_prompt("greet", &HashMap::new()).unwrap_err();
        assert!(matches!(err, McpError::InvalidArguments { ref target, .. } if target == "greet"));
        assert!(err.to_string().contains("who"));

        let mut args = HashMap::new();
        args.insert("who".to_string(), "Ada".to_string());
        let result = server.get_prompt("greet", &args).unwrap();
        assert_eq!(result.messages, vec![PromptMessage::user("Hello, Ada!")]);
    }

    #[test]
    fn unknown_prompt_and_resource_codes() {
        let server = server();
        assert_eq!(
            server
                .get_prompt("missing", &HashMap::new())
                .unwrap_err()
                .error_code(),
            Some(ErrorCode::PromptNotFound)
        );
        assert_eq!(
            server.read_resource("file:///missing").unwrap_err().error_code(),
            Some(ErrorCode::ResourceNotFound)
        );
    }

    #[test]
    fn read_resource_returns_body() {
        let result = server().read_resource("file:///readme").unwrap();
        assert_eq!(result.contents[0].text, "hello");
        assert_eq!(result.contents[0].mime_type.as_deref(), Some("text/plain"));
    }

    #[test]
    fn handle_initialize() {
        let request = JsonRpcRequest::new(
            1,
            methods::INITIALIZE,
            Some(json!({
                "protocolVersion": "1999-01-01",
                "capabilities": {},
                "clientInfo": {"name": "c", "version": "0"}
            })),
        );
        let result = server().handle_request(&request).into_result().unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], "test-server");
    }

    #[test]
    fn handle_unknown_method_names_it() {
        let request = JsonRpcRequest::new(9, "sampling/createMessage", None);
        let response = server().handle_request(&request);
        assert_eq!(response.id, Some(9));
        assert_eq!(error_code(&response), ErrorCode::MethodNotFound.code());
        let err = response.into_result().unwrap_err();
        assert!(err.message.contains("sampling/createMessage"));
    }

    #[test]
    fn handle_call_without_params_is_invalid_params() {
        let request = JsonRpcRequest::new(2, methods::TOOLS_CALL, None);
        let response = server().handle_request(&request);
        assert_eq!(error_code(&response), ErrorCode::InvalidParams.code());
    }

    #[test]
    fn handle_prompt_missing_argument_is_invalid_params() {
        let request = JsonRpcRequest::new(
            3,
            methods::PROMPTS_GET,
            Some(json!({"name": "greet", "arguments": {}})),
        );
        let response = server().handle_request(&request);
        assert_eq!(error_code(&response), ErrorCode::InvalidParams.code());
    }

    #[test]
    fn notifications_get_no_reply() {
        let message = crate::jsonrpc::JsonRpcNotification::new(methods::INITIALIZED, None);
        assert!(server().handle_message(message.into()).is_none());
    }

    #[tokio::test]
    async fn serve_lines_answers_in_order() {
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
            "\n\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
            "\n",
        );
        let mut output = Vec::new();
        server()
            .serve_lines(input.as_bytes(), &mut output)
            .await
            .unwrap();

        let replies: Vec<JsonRpcResponse> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].id, Some(1));
        assert_eq!(replies[1].id, Some(2));
    }

    #[tokio::test]
    async fn serve_lines_reports_parse_errors_with_null_id() {
        let input = "this is not json\n{\"jsonrpc\":\"2.0\"}\n";
        let mut output = Vec::new();
        server()
            .serve_lines(input.as_bytes(), &mut output)
            .await
            .unwrap();

        let text = String::from_utf8(output).unwrap();
        let replies: Vec<Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(replies[0]["id"], Value::Null);
        assert_eq!(replies[0]["error"]["code"], ErrorCode::ParseError.code());
        assert_eq!(replies[1]["error"]["code"], ErrorCode::InvalidRequest.code());
    }

    #[tokio::test]
    async fn serve_lines_survives_invalid_utf8() {
        let mut input = b"\xff\xfe garbage\n".to_vec();
        input.extend_from_slice(br#"{"jsonrpc":"2.0","id":3,"method":"ping"}"#);
        input.push(b'\n');
        let mut output = Vec::new();
        server()
            .serve_lines(input.as_slice(), &mut output)
            .await
            .unwrap();

        let text = String::from_utf8(output).unwrap();
        let replies: Vec<Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["id"], Value::Null);
        assert_eq!(replies[0]["error"]["code"], ErrorCode::ParseError.code());
        assert_eq!(replies[1]["id"], 3);
        assert!(replies[1].get("error").is_none());
    }
}
