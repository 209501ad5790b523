//! Error types for MCP operations.

use thiserror::Error;

use crate::jsonrpc::{ErrorCode, JsonRpcError};
use crate::session::SessionState;

/// Errors from MCP server communication.
///
/// Variants fall into three groups: transport failures (spawn, closed
/// connection, HTTP, timeout), protocol errors carrying a JSON-RPC code
/// (`Rpc`), and argument validation (`InvalidArguments`). A tool that runs and
/// fails is not an error here; see `ToolCallResult::is_error`.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Failed to spawn MCP server '{command}': {source}")]
    SpawnFailed {
        command: String,
        source: std::io::Error,
    },

    #[error("MCP client is not connected")]
    NotConnected,

    #[error("MCP connection closed: {reason}")]
    ConnectionClosed { reason: String },

    #[error("MCP transport error: {0}")]
    Transport(String),

    #[error("MCP endpoint returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Invalid MCP endpoint URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error("JSON-RPC error (code {code}): {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("Invalid arguments for '{target}': {message}")]
    InvalidArguments { target: String, message: String },

    #[error("Invalid session state: expected {expected}, found {found}")]
    InvalidState {
        expected: SessionState,
        found: SessionState,
    },

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("MCP {operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    /// A protocol error from the closed code table.
    pub fn rpc(code: ErrorCode, message: impl Into<String>) -> Self {
        McpError::Rpc {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    /// The error code, when this is a protocol error with a known code.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            McpError::Rpc { code, .. } => ErrorCode::from_code(*code),
            McpError::InvalidArguments { .. } => Some(ErrorCode::InvalidParams),
            _ => None,
        }
    }

    /// Whether this error means the underlying connection is unusable.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            McpError::SpawnFailed { .. }
                | McpError::NotConnected
                | McpError::ConnectionClosed { .. }
                | McpError::Transport(_)
                | McpError::HttpStatus { .. }
                | McpError::Io(_)
        )
    }

    /// Render this error as a JSON-RPC error object for a response.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        match self {
            McpError::Rpc {
                code,
                message,
                data,
            } => JsonRpcError {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            McpError::InvalidArguments { .. } => {
                JsonRpcError::new(ErrorCode::InvalidParams, self.to_string())
            }
            McpError::Json(_) => JsonRpcError::new(ErrorCode::InvalidParams, self.to_string()),
            other => JsonRpcError::new(ErrorCode::InternalError, other.to_string()),
        }
    }
}

impl From<JsonRpcError> for McpError {
    fn from(err: JsonRpcError) -> Self {
        McpError::Rpc {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_error_exposes_code() {
        let err = McpError::rpc(ErrorCode::ToolNotFound, "Tool not found: x");
        assert_eq!(err.error_code(), Some(ErrorCode::ToolNotFound));
        assert!(!err.is_connection_error());
    }

    #[test]
    fn unknown_remote_code_has_no_table_entry() {
        let err = McpError::from(JsonRpcError {
            code: -1,
            message: "custom".into(),
            data: None,
        });
        assert_eq!(err.error_code(), None);
        assert!(err.to_string().contains("custom"));
    }

    #[test]
    fn invalid_arguments_render_as_invalid_params() {
        let err = McpError::InvalidArguments {
            target: "greet".into(),
            message: "missing required argument 'name'".into(),
        };
        let rpc = err.to_rpc_error();
        assert_eq!(rpc.code, ErrorCode::InvalidParams.code());
        assert!(rpc.message.contains("greet"));
    }

    #[test]
    fn connection_errors_are_classified() {
        assert!(McpError::NotConnected.is_connection_error());
        assert!(
            McpError::ConnectionClosed {
                reason: "eof".into()
            }
            .is_connection_error()
        );
        assert!(
            !McpError::Timeout {
                operation: "tools/call".into(),
                timeout_ms: 10
            }
            .is_connection_error()
        );
    }
}
