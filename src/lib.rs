//! Relaybot core: subagent orchestration for a multi-agent chat gateway.
//!
//! The crate spawns auxiliary agent runs on behalf of a parent
//! conversation, tracks them across process restarts, delivers their
//! completion announcements back into the parent's channel under flow
//! control, and reclaims child sessions. The gateway RPC surface and the
//! session store are consumed through the [`gateway::Gateway`] and
//! [`sessions::SessionStore`] contracts; everything user-facing lives in
//! the embedding gateway binary.

pub mod announce;
pub mod config;
pub mod delivery;
pub mod error;
pub mod gateway;
pub mod lanes;
pub mod pricing;
pub mod registry;
pub mod sessions;
pub mod subscriptions;
#[cfg(test)]
pub mod testing;
pub mod tools;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Opaque run identifier, assigned at spawn.
pub type RunId = String;

/// Current time as epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Terminal (or unresolved) status of a child run.
///
/// This is the runtime signal the announce flow derives its status label
/// from; it is never inferred from model output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    Error,
    Timeout,
    Unknown,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Ok => "ok",
            RunStatus::Error => "error",
            RunStatus::Timeout => "timeout",
            RunStatus::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ok" => Some(RunStatus::Ok),
            "error" => Some(RunStatus::Error),
            "timeout" => Some(RunStatus::Timeout),
            "unknown" => Some(RunStatus::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a child run ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn ok() -> Self {
        Self {
            status: RunStatus::Ok,
            error: None,
        }
    }

    pub fn error(message: Option<String>) -> Self {
        Self {
            status: RunStatus::Error,
            error: message,
        }
    }
}

/// What to do with the child session once its announcement has landed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CleanupMode {
    Delete,
    #[default]
    Keep,
}

impl CleanupMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CleanupMode::Delete => "delete",
            CleanupMode::Keep => "keep",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "delete" => Some(CleanupMode::Delete),
            "keep" => Some(CleanupMode::Keep),
            _ => None,
        }
    }
}

impl std::fmt::Display for CleanupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle phases emitted on the agent event bus.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Start,
    End,
    Error,
}

/// Events published on the in-process agent event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Lifecycle {
        run_id: RunId,
        phase: LifecyclePhase,
        /// Epoch millis the phase occurred, when the emitter knows it.
        #[serde(default)]
        at: Option<i64>,
        #[serde(default)]
        error: Option<String>,
    },
}

/// Shared dependency bundle for the orchestration core.
#[derive(Clone)]
pub struct CoreDeps {
    pub config: Arc<config::Config>,
    pub gateway: Arc<dyn gateway::Gateway>,
    pub sessions: Arc<dyn sessions::SessionStore>,
    pub announce_queue: Arc<announce::AnnounceQueue>,
    pub lanes: lanes::LaneQueue,
    pub event_tx: tokio::sync::broadcast::Sender<AgentEvent>,
}

impl CoreDeps {
    /// Wire the bundle from its collaborators and apply the configured
    /// subagent lane concurrency.
    pub fn new(
        config: Arc<config::Config>,
        gateway: Arc<dyn gateway::Gateway>,
        sessions: Arc<dyn sessions::SessionStore>,
        event_tx: tokio::sync::broadcast::Sender<AgentEvent>,
    ) -> Self {
        let lanes = lanes::LaneQueue::new();
        lanes.set_concurrency(
            lanes::SUBAGENT_LANE,
            config.agents.defaults.subagents.max_concurrent,
        );
        let announce_queue = Arc::new(announce::AnnounceQueue::new(
            sessions.clone(),
            gateway.clone(),
            config.session.main_key.clone(),
        ));
        Self {
            config,
            gateway,
            sessions,
            announce_queue,
            lanes,
            event_tx,
        }
    }
}

impl std::fmt::Debug for CoreDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreDeps").finish_non_exhaustive()
    }
}
