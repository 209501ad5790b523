//! MCP (Model Context Protocol) engine for Capstan.
//!
//! Covers the JSON-RPC envelope, session lifecycle, three transports
//! (in-process pair, stdio child process, Streamable HTTP), an in-process
//! server registry, the client, and a manager that bridges the tools of many
//! named servers into one shared [`capstan_tools::ToolRegistry`].

pub mod client;
pub mod config;
pub mod error;
pub mod jsonrpc;
pub mod manager;
pub mod protocol;
pub mod server;
pub mod session;
pub mod tool;
pub mod transport;

pub use client::McpClient;
pub use config::{McpConfig, McpServerConfig};
pub use error::McpError;
pub use jsonrpc::ErrorCode;
pub use manager::{ConnectionInfo, ConnectionStatus, McpManager, ToolsChanged};
pub use protocol::{PROTOCOL_VERSION, ToolCallResult, ToolInfo};
pub use server::{McpServer, ServerPrompt, ServerTool};
pub use session::{Session, SessionState};
pub use tool::{McpTool, bridged_name};
pub use transport::{MemoryTransport, StdioTransport, StreamableHttpTransport, Transport};
