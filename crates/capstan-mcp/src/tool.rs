//! McpTool wraps an MCP server tool as a capstan_types::Tool.

use capstan_types::{ParameterSpec, ToolDefinition, ToolError, ToolOutput};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::client::McpClient;
use crate::protocol::ToolInfo;

const PREFIX: &str = "mcp__";
const SEPARATOR: &str = "__";

/// Registry identity of `tool` published by `server`.
pub fn bridged_name(server: &str, tool: &str) -> String {
    format!("{PREFIX}{server}{SEPARATOR}{tool}")
}

/// A tool backed by an MCP server.
///
/// Each McpTool represents one tool from one MCP server. The namespaced name
/// follows the pattern `mcp__servername__toolname` to avoid collisions with
/// built-in tools or tools from other MCP servers.
pub struct McpTool {
    namespaced_name: String,
    server_name: String,
    tool_info: ToolInfo,
    client: Arc<McpClient>,
}

impl McpTool {
    pub fn new(server_name: &str, tool_info: ToolInfo, client: Arc<McpClient>) -> Self {
        Self {
            namespaced_name: bridged_name(server_name, &tool_info.name),
            server_name: server_name.to_string(),
            tool_info,
            client,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// The tool's name on the remote server, recovered from the identity.
    pub fn remote_name(&self) -> &str {
        self.namespaced_name
            .strip_prefix(PREFIX)
            .and_then(|rest| rest.strip_prefix(self.server_name.as_str()))
            .and_then(|rest| rest.strip_prefix(SEPARATOR))
            .unwrap_or(&self.tool_info.name)
    }
}

impl capstan_types::Tool for McpTool {
    fn name(&self) -> &str {
        &self.namespaced_name
    }

    fn definition(&self) -> ToolDefinition {
        let schema = &self.tool_info.input_schema;
        let parameters = schema
            .properties
            .iter()
            .map(|(name, prop)| {
                let spec = ParameterSpec {
                    param_type: prop.type_name().unwrap_or("string").to_string(),
                    description: prop.description.clone().unwrap_or_default(),
                    enum_values: prop.enum_values.as_ref().map(|values| {
                        values
                            .iter()
                            .map(|v| match v {
                                serde_json::Value::String(s) => s.clone(),
                                other => other.to_string(),
                            })
                            .collect()
                    }),
                };
                (name.clone(), spec)
            })
            .collect();

        ToolDefinition {
            name: self.namespaced_name.clone(),
            description: format!("[MCP: {}] {}", self.server_name, self.tool_info.description),
            parameters,
            required: schema.required.clone(),
        }
    }

    fn execute(
        &self,
        input: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, ToolError>> + Send + '_>> {
        Box::pin(async move {
            let definition = capstan_types::Tool::definition(self);
            let missing = definition.missing_required(&input);
            if !missing.is_empty() {
                return Err(ToolError::InvalidInput {
                    tool: self.namespaced_name.clone(),
                    message: format!("missing required parameter(s): {}", missing.join(", ")),
                });
            }

            let arguments = match input {
                serde_json::Value::Object(map) => map,
                serde_json::Value::Null => serde_json::Map::new(),
                other => {
                    return Err(ToolError::InvalidInput {
                        tool: self.namespaced_name.clone(),
                        message: format!("expected an object, got {other}"),
                    });
                }
            };

            let result = self
                .client
                .call_tool(self.remote_name(), arguments)
                .await
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

            let text = result.joined_text();
            if result.is_error {
                return Err(ToolError::ExecutionFailed(text));
            }
            Ok(ToolOutput::text(text))
        })
    }
}
