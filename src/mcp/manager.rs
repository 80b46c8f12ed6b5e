use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use super::{McpConnection, McpError, ToolProvider};
use crate::{config::McpServerConfig, models::ToolDescriptor};

pub struct McpServer {
    pub config: McpServerConfig,
    connection: Option<Arc<McpConnection>>,
}

impl McpServer {
    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|connection| connection.is_connected())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub name: String,
    pub transport: String,
    pub connected: bool,
}

/// Registry of tool servers, keyed by configured name.
///
/// Connections are established once in [`McpServerManager::initialize`] and are
/// read-only afterwards; investigations share the manager behind an `Arc`.
#[derive(Default)]
pub struct McpServerManager {
    servers: HashMap<String, McpServer>,
}

impl McpServerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts every auto-start stdio server and connects every streamable
    /// server. The first failure aborts startup; servers already connected stay
    /// registered so `stop_all` can reap them.
    pub async fn initialize(&mut self, configs: &[McpServerConfig]) -> Result<(), McpError> {
        for config in configs {
            match config.r#type.as_str() {
                "stdio" if !config.auto_start => {
                    info!(server = %config.name, "MCP server registered without auto-start");
                    self.register(config.clone(), None);
                    continue;
                }
                "stdio" | "streamable" => {}
                other => {
                    info!(
                        server = %config.name,
                        transport = %other,
                        "Skipping MCP server with unsupported transport"
                    );
                    self.register(config.clone(), None);
                    continue;
                }
            }

            info!(
                server = %config.name,
                transport = %config.r#type,
                command = %config.command,
                url = config.url.as_deref().unwrap_or_default(),
                "Connecting to MCP server"
            );
            match McpConnection::connect(config).await {
                Ok(connection) => self.register(config.clone(), Some(connection)),
                Err(err) => {
                    error!(server = %config.name, "Failed to start MCP server: {err}");
                    self.register(config.clone(), None);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    pub fn register(&mut self, config: McpServerConfig, connection: Option<McpConnection>) {
        self.servers.insert(
            config.name.clone(),
            McpServer {
                config,
                connection: connection.map(Arc::new),
            },
        );
    }

    pub fn get_server(&self, name: &str) -> Result<&McpServer, McpError> {
        self.servers
            .get(name)
            .ok_or_else(|| McpError::NotFound(name.to_string()))
    }

    fn connection(&self, name: &str) -> Result<&McpConnection, McpError> {
        let server = self.get_server(name)?;
        match &server.connection {
            Some(connection) if connection.is_connected() => Ok(connection),
            _ => Err(McpError::NotConnected(name.to_string())),
        }
    }

    /// Closes every live connection. Safe to call more than once.
    pub async fn stop_all(&self) {
        for (name, server) in &self.servers {
            if let Some(connection) = &server.connection {
                connection.close().await;
                info!(server = %name, "MCP server stopped");
            }
        }
    }

    pub fn statuses(&self) -> Vec<ServerStatus> {
        let mut statuses: Vec<ServerStatus> = self
            .servers
            .iter()
            .map(|(name, server)| ServerStatus {
                name: name.clone(),
                transport: server.config.r#type.clone(),
                connected: server.is_connected(),
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }
}

#[async_trait]
impl ToolProvider for McpServerManager {
    async fn list_tools(&self, server: &str) -> Result<Vec<ToolDescriptor>, McpError> {
        let tools = self.connection(server)?.list_tools().await?;
        Ok(tools
            .into_iter()
            .map(|tool| ToolDescriptor {
                server_name: server.to_string(),
                tool_name: tool.name.into_owned(),
                description: tool.description.unwrap_or_default().into_owned(),
                input_schema: Value::Object(Arc::unwrap_or_clone(tool.input_schema)),
            })
            .collect())
    }

    async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> Result<String, McpError> {
        let connection = self.connection(server)?;
        match connection.call_tool(tool, arguments).await {
            Ok(text) => Ok(text),
            Err(err) => {
                warn!(server = %server, tool = %tool, "MCP tool call failed: {err}");
                Err(err)
            }
        }
    }
}
