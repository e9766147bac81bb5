use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::app::config::{McpServerConfig, TransportType};
use crate::error::{Error, Result};
use crate::mcp::http_transport::StreamableHttpTransport;
use crate::mcp::protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, ProtocolHandler, ProtocolMessage};
use crate::mcp::transport::{StdioTransport, Transport};
use crate::mcp::types::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, ListToolsResult, Tool,
};

/// Upper bound on `tools/list` pages fetched from one server.
const MAX_TOOL_PAGES: usize = 100;

/// Represents the lifecycle state of an MCP server
#[derive(Debug, Clone, PartialEq)]
pub enum ServerState {
    Initializing,
    Ready,
    Error(String),
    Stopped,
}

/// A connected MCP server
pub struct McpServerInstance {
    pub name: String,
    transport: Box<dyn Transport>,
    protocol_handler: ProtocolHandler,
    request_lock: Mutex<()>,
    request_timeout: Duration,
    state: RwLock<ServerState>,
    server_info: RwLock<Option<InitializeResult>>,
}

impl McpServerInstance {
    /// Open the configured transport and run the MCP handshake
    pub async fn connect(config: &McpServerConfig) -> Result<Self> {
        info!(server = %config.name, "Connecting to MCP server");

        let transport: Box<dyn Transport> = match config.transport_type()? {
            TransportType::Stdio => {
                let command = config.command.as_deref().ok_or_else(|| {
                    Error::config(format!("MCP server {} has no command", config.name))
                })?;
                Box::new(StdioTransport::spawn(&config.name, command, &config.args, &config.env).await?)
            }
            TransportType::StreamableHttp => {
                let url = config.url.as_deref().ok_or_else(|| {
                    Error::config(format!("MCP server {} has no url", config.name))
                })?;
                Box::new(StreamableHttpTransport::new(url, &config.headers, config.request_timeout())?)
            }
            TransportType::Sse => {
                return Err(Error::mcp(format!(
                    "MCP server {}: legacy SSE transport is not supported, use streamable_http",
                    config.name
                )));
            }
        };

        let instance = Self::with_transport(config.name.clone(), transport, config.request_timeout());
        if let Err(e) = instance.initialize().await {
            *instance.state.write().await = ServerState::Error(e.to_string());
            let _ = instance.transport.close().await;
            return Err(e);
        }
        Ok(instance)
    }

    pub fn with_transport(name: String, transport: Box<dyn Transport>, request_timeout: Duration) -> Self {
        Self {
            name,
            transport,
            protocol_handler: ProtocolHandler::new(),
            request_lock: Mutex::new(()),
            request_timeout,
            state: RwLock::new(ServerState::Initializing),
            server_info: RwLock::new(None),
        }
    }

    /// `initialize` followed by `notifications/initialized`
    pub async fn initialize(&self) -> Result<()> {
        debug!(server = %self.name, "Initializing MCP protocol");

        let params = serde_json::to_value(InitializeParams::default())?;
        let result = self.request("initialize", Some(params)).await?;
        let init_result: InitializeResult = serde_json::from_value(result)
            .map_err(|e| Error::mcp(format!("Invalid initialization response: {}", e)))?;

        debug!(
            server = %self.name,
            protocol = %init_result.protocol_version,
            "MCP server initialized"
        );
        *self.server_info.write().await = Some(init_result);

        let notification = self.protocol_handler.create_notification("notifications/initialized", None);
        self.transport.send(&ProtocolMessage::Request(notification)).await?;

        *self.state.write().await = ServerState::Ready;
        Ok(())
    }

    /// Fetch every tool, following `nextCursor` pagination
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let result = self.request("tools/list", params).await?;
            let page: ListToolsResult = serde_json::from_value(result)
                .map_err(|e| Error::mcp(format!("Failed to parse tools from server {}: {}", self.name, e)))?;

            tools.extend(page.tools);
            match page.next_cursor.filter(|c| !c.is_empty()) {
                Some(next) => cursor = Some(next),
                None => return Ok(tools),
            }
        }

        warn!(server = %self.name, "Stopped following tools/list pagination after {} pages", MAX_TOOL_PAGES);
        Ok(tools)
    }

    pub async fn call_tool(&self, tool_name: &str, arguments: JsonValue) -> Result<CallToolResult> {
        let params = serde_json::to_value(CallToolParams {
            name: tool_name.to_string(),
            arguments,
        })?;
        let result = self.request("tools/call", Some(params)).await?;
        serde_json::from_value(result).map_err(|e| Error::mcp(format!("Failed to parse tool result: {}", e)))
    }

    /// Send a request and wait for the response with the same id
    pub async fn request(&self, method: &str, params: Option<JsonValue>) -> Result<JsonValue> {
        let _guard = self.request_lock.lock().await;

        let request = self.protocol_handler.create_request(method, params);
        let id = request.id.clone().unwrap_or(JsonValue::Null);
        self.transport.send(&ProtocolMessage::Request(request)).await?;

        let response = timeout(self.request_timeout, self.await_response(&id))
            .await
            .map_err(|_| {
                Error::mcp(format!(
                    "{} on server {} timed out after {:?}",
                    method, self.name, self.request_timeout
                ))
            })??;

        response.into_result(method)
    }

    async fn await_response(&self, id: &JsonValue) -> Result<JsonRpcResponse> {
        loop {
            let message = self
                .transport
                .receive()
                .await?
                .ok_or_else(|| Error::mcp(format!("MCP server {} closed the connection", self.name)))?;

            match message {
                ProtocolMessage::Response(response) if &response.id == id => return Ok(response),
                ProtocolMessage::Response(response) => {
                    debug!(server = %self.name, "Ignoring response for unknown request {}", response.id);
                }
                ProtocolMessage::Request(request) => self.answer_server_request(request).await,
            }
        }
    }

    /// Servers may ping or ask for things mid-request; pings are answered,
    /// anything else gets method-not-found and notifications are dropped.
    async fn answer_server_request(&self, request: JsonRpcRequest) {
        let Some(id) = request.id else {
            debug!(server = %self.name, "Notification from MCP server: {}", request.method);
            return;
        };

        let reply = if request.method == "ping" {
            JsonRpcResponse::success(id, serde_json::json!({}))
        } else {
            JsonRpcResponse::error(id, JsonRpcError::method_not_found(&request.method))
        };
        if let Err(e) = self.transport.send(&ProtocolMessage::Response(reply)).await {
            warn!(server = %self.name, "Failed to answer server request {}: {}", request.method, e);
        }
    }

    pub async fn get_state(&self) -> ServerState {
        self.state.read().await.clone()
    }

    pub async fn server_info(&self) -> Option<InitializeResult> {
        self.server_info.read().await.clone()
    }

    pub async fn close(&self) -> Result<()> {
        info!(server = %self.name, "Closing MCP server connection");
        *self.state.write().await = ServerState::Stopped;
        self.transport.close().await
    }
}
