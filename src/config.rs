//! Town-level configuration (`.gt.toml`).
//!
//! Optional operator overrides for the shared server and the agent
//! program. A missing file means all defaults; unknown sections are
//! rejected so typos surface instead of silently doing nothing.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::dolt::server::ServerConfig;
use crate::error::{Result, TownError};
use crate::session::AgentProfile;
use crate::town::Town;

/// File name at the town root.
pub const CONFIG_FILE: &str = ".gt.toml";

/// Parsed `.gt.toml`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GtConfig {
    #[serde(default)]
    pub dolt: DoltSection,
    #[serde(default)]
    pub agent: AgentSection,
}

/// `[dolt]` overrides.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DoltSection {
    /// Server port (default 3307).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connection limit (default 50; 0 clamps to the server default).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DoltSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            max_connections: default_max_connections(),
        }
    }
}

/// `[agent]` overrides.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSection {
    /// Command line that starts the agent.
    #[serde(default = "default_agent_command")]
    pub command: String,
    /// Process names that count as the agent being alive.
    #[serde(default = "default_process_names")]
    pub process_names: Vec<String>,
    /// Seconds to wait for the agent to leave the shell.
    #[serde(default = "default_start_timeout")]
    pub start_timeout_seconds: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            process_names: default_process_names(),
            start_timeout_seconds: default_start_timeout(),
        }
    }
}

fn default_port() -> u16 {
    crate::dolt::server::DEFAULT_PORT
}

fn default_max_connections() -> u32 {
    crate::dolt::server::DEFAULT_MAX_CONNECTIONS
}

fn default_agent_command() -> String {
    "claude".to_owned()
}

fn default_process_names() -> Vec<String> {
    vec!["claude".to_owned(), "node".to_owned()]
}

fn default_start_timeout() -> u64 {
    30
}

impl GtConfig {
    /// Load the town's config; missing file yields defaults.
    pub fn load(town: &Town) -> Result<Self> {
        let path = town.root().join(CONFIG_FILE);
        Self::load_path(&path)
    }

    fn load_path(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| TownError::Corrupt {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
    }

    /// Server configuration with these overrides applied.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            port: self.dolt.port,
            max_connections: self.dolt.max_connections,
        }
    }

    /// Agent profile with these overrides applied.
    pub fn agent_profile(&self) -> AgentProfile {
        AgentProfile {
            name: self
                .agent
                .command
                .split_whitespace()
                .next()
                .unwrap_or("claude")
                .to_owned(),
            command: self.agent.command.clone(),
            process_names: self.agent.process_names.clone(),
            start_timeout: Duration::from_secs(self.agent.start_timeout_seconds),
            ..AgentProfile::default()
        }
    }
}
