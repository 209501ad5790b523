//! Capability trait and shared error hierarchy for Capstan.

pub mod error;
pub mod tool;

pub use error::{ConfigError, ToolError};
pub use tool::*;
