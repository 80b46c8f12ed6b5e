use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use rmcp::{
    model::{CallToolRequestParam, CallToolResult, ClientInfo, RawContent, Tool},
    service::{Peer, RoleClient, RunningService, ServiceError, ServiceExt},
    transport::{IntoTransport, StreamableHttpClientTransport, TokioChildProcess},
};
use serde_json::{Map, Value};
use tokio::{process::Command, sync::Mutex, time};
use tracing::{debug, info, warn};

use super::McpError;
use crate::config::McpServerConfig;

/// One long-lived MCP client session, either a child process on stdio or a
/// hosted streamable-HTTP endpoint.
pub struct McpConnection {
    server: String,
    peer: Peer<RoleClient>,
    service: Mutex<Option<RunningService<RoleClient, ClientInfo>>>,
    closed: AtomicBool,
    request_timeout: Duration,
}

impl McpConnection {
    /// Spawns or dials the configured server and completes the handshake
    /// within the server's timeout.
    pub async fn connect(config: &McpServerConfig) -> Result<Self, McpError> {
        match config.r#type.as_str() {
            "streamable" => {
                let url = config.url.as_deref().unwrap_or_default();
                let transport = StreamableHttpClientTransport::from_uri(url);
                Self::handshake(&config.name, transport, config.timeout()).await
            }
            _ => {
                let mut command = Command::new(&config.command);
                command.args(&config.args).envs(&config.env);
                if let Some(dir) = &config.work_dir {
                    command.current_dir(dir);
                }
                let transport = TokioChildProcess::new(command).map_err(|err| McpError::Spawn {
                    server: config.name.clone(),
                    reason: format!("{} ({err})", config.command),
                })?;
                Self::handshake(&config.name, transport, config.timeout()).await
            }
        }
    }

    /// Runs the `initialize` exchange over any rmcp transport.
    pub async fn handshake<T, E, A>(
        server: &str,
        transport: T,
        request_timeout: Duration,
    ) -> Result<Self, McpError>
    where
        T: IntoTransport<RoleClient, E, A>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let service = match time::timeout(request_timeout, client_info().serve(transport)).await {
            Err(_) => {
                return Err(McpError::Timeout {
                    server: server.to_string(),
                    method: "initialize".to_string(),
                    after: request_timeout,
                })
            }
            Ok(Err(err)) => {
                return Err(McpError::Handshake {
                    server: server.to_string(),
                    reason: err.to_string(),
                })
            }
            Ok(Ok(service)) => service,
        };

        if let Some(peer_info) = service.peer_info() {
            info!(
                server = %server,
                server_name = %peer_info.server_info.name,
                server_version = %peer_info.server_info.version,
                protocol_version = ?peer_info.protocol_version,
                "MCP server initialized"
            );
        }

        Ok(Self {
            server: server.to_string(),
            peer: service.peer().clone(),
            service: Mutex::new(Some(service)),
            closed: AtomicBool::new(false),
            request_timeout,
        })
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Lists every tool the server exposes, following pagination cursors.
    pub async fn list_tools(&self) -> Result<Vec<Tool>, McpError> {
        self.ensure_open()?;
        match time::timeout(self.request_timeout, self.peer.list_all_tools()).await {
            Err(_) => Err(self.timeout("tools/list")),
            Ok(result) => result.map_err(|err| self.service_error(err)),
        }
    }

    /// Calls a tool. A result flagged `isError` becomes [`McpError::ToolFailed`].
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<String, McpError> {
        self.ensure_open()?;
        let request = CallToolRequestParam {
            name: name.to_string().into(),
            arguments: Some(arguments),
        };
        let result = match time::timeout(self.request_timeout, self.peer.call_tool(request)).await
        {
            Err(_) => return Err(self.timeout("tools/call")),
            Ok(result) => result.map_err(|err| self.service_error(err))?,
        };

        let text = render_text(&result);
        if result.is_error.unwrap_or(false) {
            return Err(McpError::ToolFailed {
                tool: name.to_string(),
                message: text,
            });
        }
        Ok(text)
    }

    /// Stops the session and, for stdio servers, kills the child. Repeated
    /// calls are no-ops.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let Some(service) = self.service.lock().await.take() else {
            return;
        };
        match service.cancel().await {
            Ok(reason) => debug!(server = %self.server, ?reason, "MCP session closed"),
            Err(err) => warn!(server = %self.server, "MCP session did not shut down cleanly: {err}"),
        }
    }

    fn ensure_open(&self) -> Result<(), McpError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(McpError::Closed(self.server.clone()))
        }
    }

    fn timeout(&self, method: &str) -> McpError {
        McpError::Timeout {
            server: self.server.clone(),
            method: method.to_string(),
            after: self.request_timeout,
        }
    }

    fn service_error(&self, err: ServiceError) -> McpError {
        match err {
            ServiceError::McpError(error) => McpError::Rpc {
                code: i64::from(error.code.0),
                message: error.message.into_owned(),
            },
            ServiceError::TransportClosed => McpError::Closed(self.server.clone()),
            other => McpError::Protocol {
                server: self.server.clone(),
                message: other.to_string(),
            },
        }
    }
}

fn client_info() -> ClientInfo {
    let mut info = ClientInfo::default();
    info.client_info.name = env!("CARGO_PKG_NAME").to_string();
    info.client_info.version = env!("CARGO_PKG_VERSION").to_string();
    info
}

/// Text blocks joined by newlines; non-text blocks are rendered as JSON.
fn render_text(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .map(|content| match &content.raw {
            RawContent::Text(text) => text.text.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use rmcp::model::Content;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;
    use crate::mcp::testing::{connect_fake, serve_streamable, FakeToolServer};

    #[test]
    fn render_text_joins_blocks() {
        let result = CallToolResult::success(vec![
            Content::text("HEALTH_WARN"),
            Content::image("AAAA", "image/png"),
            Content::text("1 osd down"),
        ]);
        let text = render_text(&result);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "HEALTH_WARN");
        assert!(lines[1].contains("image/png"));
        assert_eq!(lines[2], "1 osd down");
    }

    #[tokio::test]
    async fn lists_tools_across_pages() {
        let conn = connect_fake("juju", FakeToolServer::paged()).await;
        let tools = conn.list_tools().await.expect("list tools");
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_ref()).collect();
        assert_eq!(names, vec!["get_status", "run_action"]);
    }

    #[tokio::test]
    async fn call_tool_surfaces_text_and_errors() {
        let conn = connect_fake("juju", FakeToolServer::default()).await;

        let mut args = Map::new();
        args.insert("model".to_string(), json!("ceph"));
        let ok = conn.call_tool("get_status", args).await.expect("call");
        assert_eq!(ok, r#"ran get_status with {"model":"ceph"}"#);

        let failed = conn.call_tool("explode", Map::new()).await;
        assert!(
            matches!(failed, Err(McpError::ToolFailed { ref message, .. }) if message == "unit not found")
        );

        let rpc = conn.call_tool("missing", Map::new()).await;
        assert!(matches!(rpc, Err(McpError::Rpc { code: -32602, .. })));
    }

    #[tokio::test]
    async fn concurrent_calls_share_one_session() {
        let conn = connect_fake("juju", FakeToolServer::default()).await;
        let mut first = Map::new();
        first.insert("tag".to_string(), json!("first"));
        let mut second = Map::new();
        second.insert("tag".to_string(), json!("second"));

        let (a, b) = tokio::join!(
            conn.call_tool("echo", first),
            conn.call_tool("echo", second),
        );
        assert_eq!(a.expect("first"), r#"ran echo with {"tag":"first"}"#);
        assert_eq!(b.expect("second"), r#"ran echo with {"tag":"second"}"#);
    }

    #[tokio::test]
    async fn answers_server_ping() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (read, mut write) = tokio::io::split(server_io);
        let mut lines = BufReader::new(read).lines();

        let server = tokio::spawn(async move {
            let init: Value = serde_json::from_str(
                &lines.next_line().await.expect("read").expect("initialize"),
            )
            .expect("json");
            assert_eq!(init["method"], "initialize");
            assert_eq!(init["params"]["clientInfo"]["name"], "mcp-sentinel");
            let reply = json!({
                "jsonrpc": "2.0",
                "id": init["id"],
                "result": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "serverInfo": { "name": "pinger", "version": "0.1.0" }
                }
            });
            write.write_all(format!("{reply}\n").as_bytes()).await.expect("write");

            let initialized: Value = serde_json::from_str(
                &lines.next_line().await.expect("read").expect("initialized"),
            )
            .expect("json");
            assert_eq!(initialized["method"], "notifications/initialized");

            let ping = json!({ "jsonrpc": "2.0", "id": "s1", "method": "ping" });
            write.write_all(format!("{ping}\n").as_bytes()).await.expect("write");
            let pong = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
                .await
                .expect("client answers ping")
                .expect("read")
                .expect("pong line");
            serde_json::from_str::<Value>(&pong).expect("json")
        });

        let conn = McpConnection::handshake("pinger", client_io, Duration::from_secs(5))
            .await
            .expect("handshake");
        let pong = server.await.expect("server task");
        assert_eq!(pong["id"], "s1");
        assert_eq!(pong["result"], json!({}));
        conn.close().await;
    }

    #[tokio::test]
    async fn silent_server_times_out_handshake() {
        let (client_io, _server_io) = tokio::io::duplex(4096);
        let result = McpConnection::handshake("slow", client_io, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(McpError::Timeout { ref method, .. }) if method == "initialize"));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_later_calls() {
        let conn = connect_fake("juju", FakeToolServer::default()).await;
        conn.close().await;
        conn.close().await;
        assert!(!conn.is_connected());
        assert!(matches!(conn.list_tools().await, Err(McpError::Closed(_))));
    }

    #[tokio::test]
    async fn connects_to_streamable_http_server() {
        let url = serve_streamable(FakeToolServer::default()).await;
        let mut config = McpServerConfig::stdio("remote", "", &[]);
        config.r#type = "streamable".to_string();
        config.url = Some(url);

        let conn = McpConnection::connect(&config).await.expect("connect");
        let tools = conn.list_tools().await.expect("list tools");
        assert!(tools.iter().any(|tool| tool.name == "get_status"));
        conn.close().await;
    }
}
