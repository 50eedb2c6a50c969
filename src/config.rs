//! Configuration loading and validation.
//!
//! Only the keys the orchestration core reads are modeled here; the
//! embedding gateway passes everything else through to its own
//! collaborators untouched.

use crate::announce::AnnounceMode;
use crate::error::{ConfigError, Result};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Relaybot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// State directory; the subagent registry persists under
    /// `<stateDir>/subagents/`.
    pub state_dir: PathBuf,

    pub session: SessionConfig,

    pub agents: AgentsConfig,

    pub tools: ToolsConfig,

    pub models: ModelsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            session: SessionConfig::default(),
            agents: AgentsConfig::default(),
            tools: ToolsConfig::default(),
            models: ModelsConfig::default(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("relaybot"))
        .unwrap_or_else(|| PathBuf::from("./state"))
}

/// Session routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Fully qualified key the `main` alias resolves to.
    pub main_key: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            main_key: "agent:main:main".to_string(),
        }
    }
}

/// Agent defaults and per-agent overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentsConfig {
    pub defaults: AgentDefaults,
    pub list: Vec<AgentEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentDefaults {
    pub subagents: SubagentDefaults,
}

/// `agents.defaults.subagents.*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubagentDefaults {
    pub model: Option<String>,
    pub thinking: Option<String>,
    pub max_concurrent: usize,
    /// Minutes after which finished child sessions are archived; `None`
    /// disables the sweeper.
    pub archive_after_minutes: Option<u64>,
    /// Timeout for `agent.wait` watchers, in seconds.
    pub timeout_seconds: u64,
    pub announce_mode: AnnounceMode,
}

impl Default for SubagentDefaults {
    fn default() -> Self {
        Self {
            model: None,
            thinking: None,
            max_concurrent: 8,
            archive_after_minutes: Some(60),
            timeout_seconds: 600,
            announce_mode: AnnounceMode::SteerBacklog,
        }
    }
}

/// One entry of `agents.list`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentEntry {
    pub id: String,
    pub subagents: Option<SubagentOverrides>,
}

/// Per-agent `subagents` overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubagentOverrides {
    pub model: Option<String>,
    pub thinking: Option<String>,
    /// Agent ids this agent may spawn as; `None` allows only itself.
    pub allow_agents: Option<Vec<String>>,
}

/// `tools.subagents.tools.*`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolsConfig {
    pub subagents: SubagentToolsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubagentToolsConfig {
    pub tools: ToolPolicyConfig,
}

/// Allow/deny lists for subagent tool access.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolPolicyConfig {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

/// `models.providers.<provider>.models[]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelsConfig {
    pub providers: HashMap<String, ProviderConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    pub models: Vec<ModelEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelEntry {
    pub id: String,
    pub cost: Option<ModelCost>,
}

/// USD per million tokens.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelCost {
    pub input: f64,
    pub output: f64,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Load {
            path: path.display().to_string(),
            source: std::sync::Arc::new(source),
        })?;

        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config: {}", path.display()))
            .map_err(ConfigError::Other)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.session.main_key.trim().is_empty() {
            return Err(ConfigError::MissingKey("session.mainKey".to_string()).into());
        }
        Ok(())
    }

    /// The registry's persisted map.
    pub fn registry_path(&self) -> PathBuf {
        self.state_dir.join("subagents").join("runs.json")
    }

    /// Per-agent subagent overrides, if configured.
    pub fn subagent_overrides(&self, agent_id: &str) -> Option<&SubagentOverrides> {
        self.agents
            .list
            .iter()
            .find(|entry| entry.id == agent_id)
            .and_then(|entry| entry.subagents.as_ref())
    }

    /// Default model for a spawn requested by `agent_id`, honoring the
    /// per-agent override.
    pub fn subagent_model(&self, agent_id: &str) -> Option<&str> {
        self.subagent_overrides(agent_id)
            .and_then(|overrides| overrides.model.as_deref())
            .or(self.agents.defaults.subagents.model.as_deref())
    }

    /// Default thinking level for a spawn requested by `agent_id`.
    pub fn subagent_thinking(&self, agent_id: &str) -> Option<&str> {
        self.subagent_overrides(agent_id)
            .and_then(|overrides| overrides.thinking.as_deref())
            .or(self.agents.defaults.subagents.thinking.as_deref())
    }

    /// Whether `requester` may spawn a subagent running as `target`.
    /// Absent an allow list, an agent may only spawn as itself.
    pub fn may_spawn_as(&self, requester: &str, target: &str) -> bool {
        if requester == target {
            return true;
        }
        self.subagent_overrides(requester)
            .and_then(|overrides| overrides.allow_agents.as_ref())
            .is_some_and(|allowed| allowed.iter().any(|id| id == target))
    }
}
