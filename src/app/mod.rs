pub mod config;

pub use config::{AgentSettings, McpConfig, McpServerConfig, TransportType};
