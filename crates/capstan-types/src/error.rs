//! Error hierarchy shared by capability providers and consumers.

use thiserror::Error;

/// Errors from invoking a capability through the registry.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("Invalid input for tool '{tool}': {message}")]
    InvalidInput { tool: String, message: String },

    #[error("Tool execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Tool timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl ToolError {
    /// The bare failure message, without the variant prefix.
    ///
    /// For `ExecutionFailed` this is exactly the text the capability reported.
    pub fn message(&self) -> String {
        match self {
            ToolError::ExecutionFailed(message) => message.clone(),
            ToolError::InvalidInput { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file parse error at {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Missing required configuration: {key}")]
    MissingKey { key: String },

    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
}
