use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

pub const DEFAULT_MODEL: &str = "deepseek-chat";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_TEMPERATURE: f32 = 0.2;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_RETRIES: usize = 3;
pub const DEFAULT_MAX_ROUNDS: usize = 25;
pub const DEFAULT_MCP_TIMEOUT_SECS: u64 = 30;

/// Model and loop settings, read from the process environment.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub timeout: Duration,
    pub max_retries: usize,
    pub max_rounds: usize,
    pub mcp_config_path: Option<PathBuf>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            max_rounds: DEFAULT_MAX_ROUNDS,
            mcp_config_path: None,
        }
    }
}

impl AgentSettings {
    /// Loads `.env` (searching parent directories, overriding existing
    /// variables) and then reads the settings from the environment.
    pub fn load() -> Self {
        match dotenvy::dotenv_override() {
            Ok(path) => debug!("Loaded environment from {:?}", path),
            Err(e) => debug!("No .env loaded: {}", e),
        }
        Self::from_env()
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).map(|v| v.trim().to_string());

        let api_key = read("OPENAI_API_KEY").unwrap_or_default();
        let base_url = read("OPENAI_BASE_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let model = read("OPENAI_MODEL")
            .or_else(|| read("OPENAI_MODEL_NAME"))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let temperature = read("OPENAI_TEMPERATURE")
            .and_then(|v| v.parse::<f32>().ok())
            .unwrap_or(DEFAULT_TEMPERATURE);
        let timeout_secs = read("OPENAI_TIMEOUT")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        let max_rounds = read("MCP_MAX_ROUNDS")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_MAX_ROUNDS);
        let mcp_config_path = read("MCP_CONFIG")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        Self {
            api_key,
            base_url,
            model,
            temperature,
            timeout: Duration::from_secs(timeout_secs),
            max_retries: DEFAULT_MAX_RETRIES,
            max_rounds,
            mcp_config_path,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(Error::config("缺少 OPENAI_API_KEY，请在 .env 或系统环境中配置"));
        }
        if self.model.is_empty() {
            return Err(Error::validation("Model name must not be empty"));
        }
        url::Url::parse(&self.base_url)
            .map_err(|e| Error::validation(format!("Invalid OPENAI_BASE_URL '{}': {}", self.base_url, e)))?;
        Ok(())
    }
}

/// How the client talks to one MCP server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportType {
    Stdio,
    StreamableHttp,
    Sse,
}

/// One entry under `servers` in `mcp.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServerConfig {
    #[serde(skip)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    /// Request timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl McpServerConfig {
    pub fn transport_type(&self) -> Result<TransportType> {
        match self.transport.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("stdio") => Ok(TransportType::Stdio),
            Some("streamable_http") | Some("streamable-http") | Some("http") => {
                Ok(TransportType::StreamableHttp)
            }
            Some("sse") => Ok(TransportType::Sse),
            Some(other) => Err(Error::config(format!(
                "Unknown transport '{}' for MCP server {}",
                other, self.name
            ))),
            None if self.url.is_some() => Ok(TransportType::StreamableHttp),
            None if self.command.is_some() => Ok(TransportType::Stdio),
            None => Err(Error::config(format!(
                "MCP server {} needs either a url or a command",
                self.name
            ))),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.unwrap_or(DEFAULT_MCP_TIMEOUT_SECS))
    }
}

/// Contents of `mcp.json`. Server order in the file is preserved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub servers: serde_json::Map<String, serde_json::Value>,
}

impl McpConfig {
    /// Reads the config file. A broken file falls back to the default; a
    /// missing one is created with the default contents.
    pub async fn load(path: &Path) -> Self {
        if path.exists() {
            info!("Loading MCP configuration from: {:?}", path);
            match fs::read_to_string(path).await {
                Ok(content) => match serde_json::from_str::<McpConfig>(&content) {
                    Ok(config) => return config,
                    Err(e) => warn!("MCP configuration could not be parsed, using defaults: {}", e),
                },
                Err(e) => warn!("MCP configuration could not be read, using defaults: {}", e),
            }
            return Self::default();
        }

        info!("MCP configuration not found, creating default at {:?}", path);
        let default_config = Self::default();
        if let Err(e) = default_config.save(path).await {
            error!("Failed to save MCP configuration: {}", e);
        }
        default_config
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).await?;
        debug!("MCP configuration saved to {:?}", path);
        Ok(())
    }

    /// Typed server entries in file order. Entries that are not valid
    /// server objects are logged and skipped.
    pub fn server_configs(&self) -> Vec<McpServerConfig> {
        self.servers
            .iter()
            .filter_map(|(name, value)| {
                match serde_json::from_value::<McpServerConfig>(value.clone()) {
                    Ok(mut config) => {
                        config.name = name.clone();
                        Some(config)
                    }
                    Err(e) => {
                        warn!("Ignoring MCP server {}: invalid entry: {}", name, e);
                        None
                    }
                }
            })
            .collect()
    }

    pub fn add_server(&mut self, config: &McpServerConfig) -> Result<()> {
        self.servers
            .insert(config.name.clone(), serde_json::to_value(config)?);
        Ok(())
    }
}
