//! Tool trait and related types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

/// Description of a single parameter accepted by a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    #[serde(rename = "type")]
    pub param_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
}

/// The host-facing description of a tool: identity, purpose, and parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: BTreeMap<String, ParameterSpec>,
    #[serde(default)]
    pub required: Vec<String>,
}

impl ToolDefinition {
    /// Names of required parameters absent from `input`.
    ///
    /// A non-object input is treated as an empty parameter map.
    pub fn missing_required(&self, input: &serde_json::Value) -> Vec<&str> {
        let supplied = input.as_object();
        self.required
            .iter()
            .filter(|name| supplied.is_none_or(|map| !map.contains_key(name.as_str())))
            .map(String::as_str)
            .collect()
    }
}

/// Successful result of executing a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub text: String,
}

impl ToolOutput {
    /// Create a text output.
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Trait that all invokable capabilities implement.
///
/// The registry dispatches to implementors by [`Tool::name`]; the name is the
/// capability's identity and must be stable for the lifetime of the value.
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// The tool definition (name, description, parameters).
    fn definition(&self) -> ToolDefinition;

    /// Execute the tool with the given JSON input.
    ///
    /// A failed execution is reported as `Err`; the caller never sees a panic
    /// or a transport error from the capability.
    fn execute(
        &self,
        input: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, crate::error::ToolError>> + Send + '_>>;
}
