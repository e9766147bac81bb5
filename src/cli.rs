use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::server::DEFAULT_BIND;

#[derive(Parser, Debug)]
#[command(name = "mcpmode")]
#[command(about = "Streaming chat agent with MCP tool calling")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// MCP server configuration file (mcp.json)
    #[arg(long, global = true)]
    pub mcp_config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Also write daily rolling log files into this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Run the WebSocket chat server until Ctrl-C
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = DEFAULT_BIND)]
        bind: String,
    },

    /// Run a single chat turn and print every event as a JSON line
    Chat {
        /// The user message
        message: String,

        /// Session id used for log correlation
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Print the connected servers and their tools
    Tools,
}
