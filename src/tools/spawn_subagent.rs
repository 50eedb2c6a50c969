//! Spawn tool: launch a subagent run on behalf of a conversation.

use crate::delivery::DeliveryContext;
use crate::gateway::SpawnRunRequest;
use crate::lanes::{EnqueueOptions, SUBAGENT_LANE};
use crate::registry::{RegisterParams, SubagentRegistry};
use crate::sessions::subagent_session_key;
use crate::tools::policy::resolve_spawn_tool_policy;
use crate::{CleanupMode, CoreDeps, pricing};
use rig::completion::ToolDefinition;
use rig::tool::Tool;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

/// Conversation context captured when the tool is built for a turn.
#[derive(Debug, Clone)]
pub struct SpawnContext {
    /// Agent the requesting conversation runs as.
    pub agent_id: String,
    pub requester_session_key: String,
    pub requester_display_key: Option<String>,
    /// Delivery context of the triggering message, captured so the
    /// eventual announcement can route back to the same place.
    pub requester_origin: Option<DeliveryContext>,
}

/// Tool for spawning subagent runs.
#[derive(Clone)]
pub struct SpawnSubagentTool {
    deps: CoreDeps,
    registry: SubagentRegistry,
    context: SpawnContext,
}

impl SpawnSubagentTool {
    pub fn new(deps: CoreDeps, registry: SubagentRegistry, context: SpawnContext) -> Self {
        Self {
            deps,
            registry,
            context,
        }
    }
}

/// Error type for the spawn tool.
#[derive(Debug, thiserror::Error)]
#[error("Subagent spawn failed: {0}")]
pub struct SpawnSubagentError(String);

/// Arguments for the spawn tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SpawnSubagentArgs {
    /// The task description for the subagent.
    pub task: String,
    /// Short label shown in announcements and session listings.
    #[serde(default)]
    pub label: Option<String>,
    /// Agent to run the child as; defaults to the requesting agent.
    /// Subject to the per-agent allow list.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Model override. Unknown values fall back to the configured
    /// default and surface a warning in the tool result.
    #[serde(default)]
    pub model: Option<String>,
    /// Thinking-level override.
    #[serde(default)]
    pub thinking: Option<String>,
    /// Wall-clock cap for the run in seconds; 0 means no timeout.
    #[serde(default)]
    pub run_timeout_seconds: Option<u64>,
    /// "delete" or "keep" (default) for the child session once the
    /// announcement lands.
    #[serde(default)]
    pub cleanup: Option<String>,
}

/// Output from the spawn tool.
#[derive(Debug, Serialize)]
pub struct SpawnSubagentOutput {
    pub status: &'static str,
    pub run_id: String,
    pub child_session_key: String,
    pub message: String,
}

impl Tool for SpawnSubagentTool {
    const NAME: &'static str = "sessions_spawn";

    type Error = SpawnSubagentError;
    type Args = SpawnSubagentArgs;
    type Output = SpawnSubagentOutput;

    async fn definition(&self, _prompt: String) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.to_string(),
            description: "Spawn a background subagent to handle one task in an isolated \
                          session. Returns immediately with a run id; the subagent's result \
                          is announced back into this conversation when it finishes. \
                          Subagents cannot spawn further subagents."
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "task": {
                        "type": "string",
                        "description": "Clear, specific description of what the subagent should do. Include all context needed since it can't see this conversation."
                    },
                    "label": {
                        "type": "string",
                        "description": "Short label used in the completion announcement and session listings."
                    },
                    "agent_id": {
                        "type": "string",
                        "description": "Agent to run the subagent as. Defaults to the current agent; other values require an allowAgents entry."
                    },
                    "model": {
                        "type": "string",
                        "description": "Model override. Unknown models fall back to the default with a warning."
                    },
                    "thinking": {
                        "type": "string",
                        "description": "Thinking-level override for the subagent."
                    },
                    "run_timeout_seconds": {
                        "type": "integer",
                        "minimum": 0,
                        "description": "Wall-clock cap for the run in seconds. 0 disables the timeout."
                    },
                    "cleanup": {
                        "type": "string",
                        "enum": ["delete", "keep"],
                        "default": "keep",
                        "description": "Whether to delete the child session after its announcement lands."
                    }
                },
                "required": ["task"]
            }),
        }
    }

    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error> {
        let config = &self.deps.config;
        let requester_agent = self.context.agent_id.as_str();
        let target_agent = args
            .agent_id
            .clone()
            .unwrap_or_else(|| requester_agent.to_string());
        if !config.may_spawn_as(requester_agent, &target_agent) {
            return Err(SpawnSubagentError(format!(
                "agent {requester_agent} is not allowed to spawn as {target_agent}"
            )));
        }

        let mut warnings = Vec::new();

        let default_model = config.subagent_model(&target_agent).map(str::to_string);
        let model = match args.model {
            Some(model) if pricing::is_known_model(&config.models, &model) => Some(model),
            Some(model) => {
                tracing::warn!(%model, "unknown subagent model override, using default");
                warnings.push(format!(
                    "Warning: unknown model \"{model}\", using the default model instead."
                ));
                default_model
            }
            None => default_model,
        };
        let thinking = args
            .thinking
            .or_else(|| config.subagent_thinking(&target_agent).map(str::to_string));

        let cleanup = match args.cleanup.as_deref() {
            None => CleanupMode::Keep,
            Some(value) => CleanupMode::parse(value).unwrap_or_else(|| {
                warnings.push(format!(
                    "Warning: invalid cleanup \"{value}\", keeping the session."
                ));
                CleanupMode::Keep
            }),
        };

        let run_timeout_seconds = args.run_timeout_seconds.filter(|seconds| *seconds > 0);

        let run_id = uuid::Uuid::new_v4().to_string();
        let child_session_key = subagent_session_key(&target_agent);

        self.registry.register(RegisterParams {
            run_id: run_id.clone(),
            child_session_key: child_session_key.clone(),
            requester_session_key: self.context.requester_session_key.clone(),
            requester_origin: self.context.requester_origin.clone(),
            requester_display_key: self.context.requester_display_key.clone(),
            task: args.task.clone(),
            label: args.label.clone(),
            cleanup,
            wait_timeout: run_timeout_seconds.map(Duration::from_secs),
        });

        let request = SpawnRunRequest {
            run_id: run_id.clone(),
            session_key: child_session_key.clone(),
            task: args.task.clone(),
            model,
            thinking,
            run_timeout_seconds,
            tool_policy: resolve_spawn_tool_policy(&config.tools.subagents.tools),
        };

        let gateway = self.deps.gateway.clone();
        let spawn_run_id = run_id.clone();
        let queued = self.deps.lanes.enqueue(
            SUBAGENT_LANE,
            EnqueueOptions::default(),
            async move {
                if let Err(error) = gateway.spawn_agent_run(request).await {
                    tracing::error!(run_id = %spawn_run_id, %error, "subagent spawn RPC failed");
                }
            },
        );
        // Fire and forget: a cleared lane during shutdown is expected.
        tokio::spawn(async move {
            if let Err(error) = queued.await {
                tracing::debug!(%error, "queued subagent spawn dropped");
            }
        });

        let mut message = format!(
            "Subagent accepted for: {}. It will announce its result here when done.",
            args.task
        );
        for warning in &warnings {
            message.push(' ');
            message.push_str(warning);
        }

        Ok(SpawnSubagentOutput {
            status: "accepted",
            run_id,
            child_session_key,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ModelEntry, ProviderConfig, SubagentOverrides};
    use crate::sessions::is_subagent_session_key;
    use crate::testing::{MockGateway, MockSessionStore};
    use std::sync::Arc;
    use tokio::time::sleep;

    fn tool_with(
        mut config: Config,
    ) -> (
        SpawnSubagentTool,
        Arc<MockGateway>,
        SubagentRegistry,
        tempfile::TempDir,
    ) {
        let state_dir = tempfile::tempdir().expect("tempdir");
        config.state_dir = state_dir.path().to_path_buf();

        let sessions = Arc::new(MockSessionStore::default());
        let gateway = Arc::new(MockGateway::default());
        let (event_tx, _event_rx) = tokio::sync::broadcast::channel(64);
        let deps = CoreDeps::new(Arc::new(config), gateway.clone(), sessions, event_tx);
        let registry = SubagentRegistry::new(deps.clone());

        let tool = SpawnSubagentTool::new(
            deps,
            registry.clone(),
            SpawnContext {
                agent_id: "main".to_string(),
                requester_session_key: "agent:main:main".to_string(),
                requester_display_key: Some("main".to_string()),
                requester_origin: None,
            },
        );
        (tool, gateway, registry, state_dir)
    }

    fn config_with_model() -> Config {
        let mut config = Config::default();
        config.models.providers.insert(
            "test".to_string(),
            ProviderConfig {
                models: vec![ModelEntry {
                    id: "known-model".to_string(),
                    cost: None,
                }],
            },
        );
        config
    }

    #[test]
    fn deserialize_defaults_for_spawn_args() {
        let value = serde_json::json!({
            "task": "quick check"
        });

        let args: SpawnSubagentArgs = serde_json::from_value(value).expect("valid args");
        assert_eq!(args.task, "quick check");
        assert!(args.label.is_none());
        assert!(args.agent_id.is_none());
        assert!(args.model.is_none());
        assert!(args.run_timeout_seconds.is_none());
        assert!(args.cleanup.is_none());
    }

    #[test]
    fn deserialize_full_spawn_args() {
        let value = serde_json::json!({
            "task": "summarise foo",
            "label": "foo",
            "agent_id": "research",
            "model": "known-model",
            "thinking": "high",
            "run_timeout_seconds": 300,
            "cleanup": "delete"
        });

        let args: SpawnSubagentArgs = serde_json::from_value(value).expect("valid args");
        assert_eq!(args.label.as_deref(), Some("foo"));
        assert_eq!(args.agent_id.as_deref(), Some("research"));
        assert_eq!(args.run_timeout_seconds, Some(300));
        assert_eq!(args.cleanup.as_deref(), Some("delete"));
    }

    #[tokio::test]
    async fn accepts_immediately_and_spawns_through_the_lane() {
        let (tool, gateway, registry, _state_dir) = tool_with(config_with_model());

        let output = tool
            .call(SpawnSubagentArgs {
                task: "summarise foo".to_string(),
                label: Some("foo".to_string()),
                agent_id: None,
                model: Some("known-model".to_string()),
                thinking: None,
                run_timeout_seconds: Some(0),
                cleanup: None,
            })
            .await
            .expect("spawn accepted");

        assert_eq!(output.status, "accepted");
        assert!(is_subagent_session_key(&output.child_session_key));
        assert!(!output.message.contains("Warning"));

        let record = registry.get(&output.run_id).expect("record registered");
        assert_eq!(record.task, "summarise foo");
        assert_eq!(record.cleanup, CleanupMode::Keep);

        // The gateway spawn happens asynchronously on the subagent lane.
        for _ in 0..50 {
            if !gateway.spawns().is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let spawns = gateway.spawns();
        assert_eq!(spawns.len(), 1);
        assert_eq!(spawns[0].run_id, output.run_id);
        assert_eq!(spawns[0].model.as_deref(), Some("known-model"));
        // runTimeoutSeconds = 0 means no timeout.
        assert_eq!(spawns[0].run_timeout_seconds, None);
        assert!(
            spawns[0]
                .tool_policy
                .deny
                .iter()
                .any(|tool| tool == "sessions_spawn"),
            "nested spawning must be denied"
        );
    }

    #[tokio::test]
    async fn unknown_model_falls_back_with_a_warning() {
        let (tool, gateway, _registry, _state_dir) = tool_with(config_with_model());

        let output = tool
            .call(SpawnSubagentArgs {
                task: "t".to_string(),
                label: None,
                agent_id: None,
                model: Some("made-up-model".to_string()),
                thinking: None,
                run_timeout_seconds: None,
                cleanup: Some("bogus".to_string()),
            })
            .await
            .expect("spawn accepted despite bad overrides");

        assert!(output.message.contains("unknown model \"made-up-model\""));
        assert!(output.message.contains("invalid cleanup \"bogus\""));

        for _ in 0..50 {
            if !gateway.spawns().is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(gateway.spawns()[0].model, None, "fallback is the (unset) default");
    }

    #[tokio::test]
    async fn foreign_agent_requires_an_allow_entry() {
        let mut config = config_with_model();
        config.agents.list.push(crate::config::AgentEntry {
            id: "main".to_string(),
            subagents: Some(SubagentOverrides {
                model: None,
                thinking: None,
                allow_agents: Some(vec!["research".to_string()]),
            }),
        });
        let (tool, _gateway, registry, _state_dir) = tool_with(config);

        let allowed = tool
            .call(SpawnSubagentArgs {
                task: "dig".to_string(),
                label: None,
                agent_id: Some("research".to_string()),
                model: None,
                thinking: None,
                run_timeout_seconds: None,
                cleanup: None,
            })
            .await
            .expect("allow-listed agent accepted");
        assert!(allowed.child_session_key.starts_with("agent:research:subagent:"));
        assert!(registry.get(&allowed.run_id).is_some());

        let denied = tool
            .call(SpawnSubagentArgs {
                task: "dig".to_string(),
                label: None,
                agent_id: Some("ops".to_string()),
                model: None,
                thinking: None,
                run_timeout_seconds: None,
                cleanup: None,
            })
            .await;
        assert!(denied.is_err());
    }
}
