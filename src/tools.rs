//! Tool surface the core contributes to agent conversations.

pub mod policy;
pub mod spawn_subagent;

pub use policy::{
    DEFAULT_DENIED_SUBAGENT_TOOLS, is_subagent_tool_allowed, resolve_spawn_tool_policy,
};
pub use spawn_subagent::{SpawnContext, SpawnSubagentArgs, SpawnSubagentOutput, SpawnSubagentTool};
