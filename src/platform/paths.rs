use directories::ProjectDirs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const MCP_CONFIG_FILE: &str = "mcp.json";

pub struct AppPaths {
    project_dirs: ProjectDirs,
}

impl AppPaths {
    pub fn new() -> Result<Self> {
        let project_dirs = ProjectDirs::from("ai", "mcpmode", "mcpmode")
            .ok_or_else(|| Error::config("Failed to determine application directories"))?;

        Ok(Self { project_dirs })
    }

    pub fn config_dir(&self) -> PathBuf {
        self.project_dirs.config_dir().to_path_buf()
    }

    pub fn mcp_config_file(&self) -> PathBuf {
        self.config_dir().join(MCP_CONFIG_FILE)
    }

    /// Picks the MCP server file: explicit path, then `./mcp.json` when it
    /// exists, then the per-user config directory.
    pub fn resolve_mcp_config(&self, explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }

        let local = PathBuf::from(MCP_CONFIG_FILE);
        if local.exists() {
            return local;
        }

        self.mcp_config_file()
    }
}
