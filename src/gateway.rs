//! Gateway RPC contract.
//!
//! The model-invocation gateway exposes the `agent`, `agent.wait`, and
//! `sessions.*` methods; the core consumes them through this trait so
//! tests and alternative transports can stand in for the real thing.

use crate::RunStatus;
use crate::error::GatewayError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

/// Parameters for the `agent` method: send a message through an agent
/// conversation, optionally delivering the model's reply to a channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSendRequest {
    pub session_key: String,
    pub message: String,
    pub deliver: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub idempotency_key: String,
    #[serde(default)]
    pub expect_final: bool,
}

/// Reply shape of `agent.wait`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitReply {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Tool access policy shipped with a spawn request. `deny` dominates;
/// a non-empty `allow` switches the child to allow-list semantics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpawnToolPolicy {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny: Vec<String>,
}

/// Parameters for starting a child agent run. The call is accepted
/// immediately; completion is observed via the lifecycle bus or
/// `agent.wait`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRunRequest {
    pub run_id: String,
    pub session_key: String,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    /// Wall-clock cap for the run; `None` means no timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub tool_policy: SpawnToolPolicy,
}

/// RPC surface of the model-invocation gateway.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// `agent`: send a message through the agent; resolves when the run
    /// is final.
    async fn send_agent_message(&self, request: AgentSendRequest) -> Result<(), GatewayError>;

    /// `agent.wait`: block until the run ends or the timeout passes.
    async fn wait_for_run(
        &self,
        run_id: &str,
        timeout: Duration,
    ) -> Result<WaitReply, GatewayError>;

    /// Start a child run without blocking on its completion.
    async fn spawn_agent_run(&self, request: SpawnRunRequest) -> Result<(), GatewayError>;

    /// `sessions.patch`: best-effort label update.
    async fn patch_session_label(
        &self,
        session_key: &str,
        label: &str,
    ) -> Result<(), GatewayError>;

    /// `sessions.delete`: drop a session, optionally soft-deleting its
    /// transcript (renamed to `*.deleted.<timestamp>` by the store).
    async fn delete_session(
        &self,
        session_key: &str,
        delete_transcript: bool,
    ) -> Result<(), GatewayError>;
}
