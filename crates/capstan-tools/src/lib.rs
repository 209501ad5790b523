//! Shared capability registry for Capstan.
//!
//! Capabilities from any source (local implementations or tools bridged from
//! MCP servers) are registered here under a unique name and invoked through
//! one uniform interface.

mod registry;

pub use registry::ToolRegistry;
