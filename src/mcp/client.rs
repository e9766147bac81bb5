use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::app::config::McpServerConfig;
use crate::error::{Error, Result};
use crate::mcp::naming::ToolNameRegistry;
use crate::mcp::server_manager::McpServerInstance;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// A tool as exposed to the model
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    /// Sanitised, globally unique name handed to the model
    pub name: String,
    /// Name the owning server knows the tool by
    pub original_name: String,
    pub server: String,
    pub description: String,
    pub input_schema: JsonValue,
}

impl ToolDescriptor {
    /// Schema `properties`, or `{}` when the server sent none
    pub fn parameters(&self) -> JsonValue {
        self.input_schema
            .get("properties")
            .cloned()
            .unwrap_or_else(|| json!({}))
    }

    pub fn required(&self) -> JsonValue {
        self.input_schema
            .get("required")
            .cloned()
            .unwrap_or_else(|| json!([]))
    }

    /// The schema bound to the model; servers that omit one get an empty object schema
    pub fn model_schema(&self) -> JsonValue {
        if self.input_schema.is_object() {
            self.input_schema.clone()
        } else {
            json!({ "type": "object", "properties": {} })
        }
    }
}

/// Something that can run tools on behalf of the agent
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Every tool, grouped by server in config order
    fn tools(&self) -> &[ToolDescriptor];

    /// Configured server names in config order, including servers that failed
    fn server_names(&self) -> Vec<String>;

    /// Run a tool by its sanitised name and render the result as text
    async fn call_tool(&self, name: &str, arguments: JsonValue) -> Result<String>;

    async fn close(&self);

    fn tools_info(&self) -> JsonValue {
        let mut servers = serde_json::Map::new();
        for server in self.server_names() {
            let tools: Vec<JsonValue> = self
                .tools()
                .iter()
                .filter(|t| t.server == server)
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters(),
                        "required": t.required(),
                    })
                })
                .collect();
            servers.insert(
                server.clone(),
                json!({ "name": server, "tool_count": tools.len(), "tools": tools }),
            );
        }

        json!({
            "server_count": servers.len(),
            "total_tools": self.tools().len(),
            "servers": servers,
        })
    }
}

struct ConnectedServer {
    name: String,
    instance: Option<McpServerInstance>,
}

/// Aggregates every configured MCP server behind one tool namespace
pub struct McpClient {
    servers: Vec<ConnectedServer>,
    tools: Vec<ToolDescriptor>,
    by_name: HashMap<String, usize>,
    closed: AtomicBool,
}

impl McpClient {
    /// Connect to every server one at a time. A server that fails to start
    /// is logged and contributes no tools.
    pub async fn connect(configs: &[McpServerConfig]) -> Self {
        if configs.is_empty() {
            info!("No external MCP servers configured");
        } else {
            let names: Vec<&str> = configs.iter().map(|c| c.name.as_str()).collect();
            info!("Configured MCP servers: {:?}", names);
            probe_servers(configs).await;
        }

        let mut connected = Vec::with_capacity(configs.len());
        for config in configs {
            let instance = McpServerInstance::connect(config).await;
            if let Err(e) = &instance {
                error!(server = %config.name, "Failed to start MCP server: {}", e);
            }
            connected.push((config.name.clone(), instance.ok()));
        }

        Self::from_instances(connected).await
    }

    /// Builds the tool namespace from already-initialised servers
    pub async fn from_instances(instances: Vec<(String, Option<McpServerInstance>)>) -> Self {
        let mut registry = ToolNameRegistry::new();
        let mut servers = Vec::with_capacity(instances.len());
        let mut tools = Vec::new();

        for (name, instance) in instances {
            if let Some(instance) = &instance {
                if let Some(peer) = instance.server_info().await.and_then(|i| i.server_info) {
                    debug!(server = %name, "Server reports itself as {} {}", peer.name, peer.version);
                }
                match instance.list_tools().await {
                    Ok(server_tools) => {
                        info!(server = %name, "Loaded {} tools", server_tools.len());
                        for tool in server_tools {
                            let exposed = registry.register(&tool.name);
                            if exposed != tool.name {
                                debug!(server = %name, "Tool {} exposed as {}", tool.name, exposed);
                            }
                            tools.push(ToolDescriptor {
                                name: exposed,
                                original_name: tool.name,
                                server: name.clone(),
                                description: tool.description.unwrap_or_default(),
                                input_schema: tool.input_schema.unwrap_or(JsonValue::Null),
                            });
                        }
                    }
                    Err(e) => error!(server = %name, "Failed to list tools: {}", e),
                }
            }
            servers.push(ConnectedServer { name, instance });
        }

        let by_name = tools
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();

        info!("MCP ready: {} servers, {} tools", servers.len(), tools.len());
        Self {
            servers,
            tools,
            by_name,
            closed: AtomicBool::new(false),
        }
    }

    pub fn tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.by_name.get(name).map(|&i| &self.tools[i])
    }

    fn instance(&self, server: &str) -> Option<&McpServerInstance> {
        self.servers
            .iter()
            .find(|s| s.name == server)
            .and_then(|s| s.instance.as_ref())
    }
}

#[async_trait]
impl ToolExecutor for McpClient {
    fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    fn server_names(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.name.clone()).collect()
    }

    async fn call_tool(&self, name: &str, arguments: JsonValue) -> Result<String> {
        let tool = self
            .tool(name)
            .ok_or_else(|| Error::ToolNotFound(name.to_string()))?;
        let instance = self
            .instance(&tool.server)
            .ok_or_else(|| Error::mcp(format!("MCP server {} is not connected", tool.server)))?;

        debug!(server = %tool.server, tool = %tool.original_name, "Calling tool");
        let result = instance.call_tool(&tool.original_name, arguments).await?;
        let text = result.render_text();
        if result.is_error {
            return Err(Error::tool_execution(text));
        }
        Ok(text)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for server in &self.servers {
            if let Some(instance) = &server.instance {
                if let Err(e) = instance.close().await {
                    debug!(server = %server.name, "Error while closing MCP server: {}", e);
                }
            }
        }
    }
}

/// Reachability check for URL servers; only ever logs.
async fn probe_servers(configs: &[McpServerConfig]) {
    let client = match reqwest::Client::builder()
        .http1_only()
        .timeout(PROBE_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!("Could not build probe client: {}", e);
            return;
        }
    };

    for config in configs {
        match &config.url {
            Some(url) => match client.get(url).send().await {
                Ok(response) => info!(server = %config.name, "Probe {} -> {}", url, response.status()),
                Err(e) => warn!(server = %config.name, "Probe {} failed: {}", url, e),
            },
            None => debug!(server = %config.name, "No url configured, skipping probe"),
        }
    }
}
