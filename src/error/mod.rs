use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Model provider error: {0}")]
    ModelProvider(String),

    #[error("MCP error: {0}")]
    Mcp(String),

    #[error("工具 '{0}' 未找到")]
    ToolNotFound(String),

    #[error("{0}")]
    ToolExecution(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Agent is not initialized")]
    NotInitialized,
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn model_provider(msg: impl Into<String>) -> Self {
        Error::ModelProvider(msg.into())
    }

    pub fn mcp(msg: impl Into<String>) -> Self {
        Error::Mcp(msg.into())
    }

    pub fn tool_execution(msg: impl Into<String>) -> Self {
        Error::ToolExecution(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }
}
