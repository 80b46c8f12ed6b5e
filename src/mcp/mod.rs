//! Client side of the Model Context Protocol: sessions with tool servers and
//! the registry that owns them.

mod connection;
mod manager;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

pub use connection::McpConnection;
pub use manager::McpServerManager;

use crate::models::ToolDescriptor;

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("MCP server {0} not found")]
    NotFound(String),
    #[error("MCP server {0} is not connected")]
    NotConnected(String),
    #[error("failed to start MCP server {server}: {reason}")]
    Spawn { server: String, reason: String },
    #[error("MCP handshake with {server} failed: {reason}")]
    Handshake { server: String, reason: String },
    #[error("MCP server {server} did not answer {method} within {after:?}")]
    Timeout {
        server: String,
        method: String,
        after: Duration,
    },
    #[error("MCP server {0} closed the connection")]
    Closed(String),
    #[error("protocol error from MCP server {server}: {message}")]
    Protocol { server: String, message: String },
    #[error("MCP error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("tool {tool} failed: {message}")]
    ToolFailed { tool: String, message: String },
}

/// The two tool operations an investigation needs, keyed by server name.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    async fn list_tools(&self, server: &str) -> Result<Vec<ToolDescriptor>, McpError>;

    /// Invokes a tool and returns its result rendered as text.
    async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> Result<String, McpError>;
}
