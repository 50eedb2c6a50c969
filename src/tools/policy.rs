//! Subagent tool access policy.
//!
//! `deny` dominates; a configured `allow` list switches the child to
//! allow-list semantics with deny still overriding. Session-spawning
//! tools are denied by default, and `sessions_spawn` is denied
//! unconditionally: a subagent may not spawn subagents.

use crate::config::ToolPolicyConfig;
use crate::gateway::SpawnToolPolicy;

/// Tools subagents lose unless explicitly re-allowed.
pub const DEFAULT_DENIED_SUBAGENT_TOOLS: &[&str] = &[
    "sessions_list",
    "sessions_history",
    "sessions_send",
    "sessions_spawn",
];

/// The nested-spawn ban cannot be configured away.
const ALWAYS_DENIED: &str = "sessions_spawn";

/// Whether a subagent may use a tool under the given policy.
pub fn is_subagent_tool_allowed(policy: &ToolPolicyConfig, tool: &str) -> bool {
    if tool == ALWAYS_DENIED {
        return false;
    }
    if policy.deny.iter().any(|denied| denied == tool) {
        return false;
    }
    if !policy.allow.is_empty() {
        return policy.allow.iter().any(|allowed| allowed == tool);
    }
    !DEFAULT_DENIED_SUBAGENT_TOOLS.contains(&tool)
}

/// Policy shipped to the gateway with a spawn request: the configured
/// allow list plus the configured and default denies, deduplicated.
pub fn resolve_spawn_tool_policy(policy: &ToolPolicyConfig) -> SpawnToolPolicy {
    let mut deny: Vec<String> = policy.deny.clone();
    for tool in DEFAULT_DENIED_SUBAGENT_TOOLS {
        // Default denies are overridable by an explicit allow, except
        // the nested-spawn ban.
        let re_allowed = *tool != ALWAYS_DENIED && policy.allow.iter().any(|allowed| allowed == tool);
        if !re_allowed && !deny.iter().any(|denied| denied == tool) {
            deny.push((*tool).to_string());
        }
    }

    SpawnToolPolicy {
        allow: policy
            .allow
            .iter()
            .filter(|allowed| allowed.as_str() != ALWAYS_DENIED)
            .cloned()
            .collect(),
        deny,
    }
}
