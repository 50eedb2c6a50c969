//! Shared mock collaborators for the test suite.

use crate::error::GatewayError;
use crate::gateway::{AgentSendRequest, Gateway, SpawnRunRequest, WaitReply};
use crate::sessions::{SessionEntry, SessionStore, TokenUsage};
use crate::{RunStatus, now_ms};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Install an env-filtered subscriber for a test run (set `RUST_LOG` to
/// see core tracing output). Repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Programmable in-memory session store.
#[derive(Default)]
pub struct MockSessionStore {
    entries: Mutex<HashMap<String, SessionEntry>>,
    replies: Mutex<HashMap<String, String>>,
    usage: Mutex<HashMap<String, TokenUsage>>,
    run_active: Mutex<HashMap<String, bool>>,
    steerable: Mutex<HashMap<String, bool>>,
    steered: Mutex<HashMap<String, Vec<String>>>,
}

impl MockSessionStore {
    pub fn set_entry(&self, entry: SessionEntry) {
        lock(&self.entries).insert(entry.key.clone(), entry);
    }

    pub fn set_reply(&self, session_key: &str, reply: &str) {
        lock(&self.replies).insert(session_key.to_string(), reply.to_string());
    }

    pub fn set_usage(&self, session_key: &str, usage: TokenUsage) {
        lock(&self.usage).insert(session_key.to_string(), usage);
    }

    pub fn set_run_active(&self, session_key: &str, active: bool) {
        lock(&self.run_active).insert(session_key.to_string(), active);
    }

    pub fn set_steerable(&self, session_key: &str, steerable: bool) {
        lock(&self.steerable).insert(session_key.to_string(), steerable);
    }

    pub fn steered(&self, session_key: &str) -> Vec<String> {
        lock(&self.steered)
            .get(session_key)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SessionStore for MockSessionStore {
    async fn entry(&self, session_key: &str) -> Option<SessionEntry> {
        lock(&self.entries).get(session_key).cloned()
    }

    async fn latest_assistant_reply(&self, session_key: &str) -> Option<String> {
        lock(&self.replies).get(session_key).cloned()
    }

    async fn usage(&self, session_key: &str) -> Option<TokenUsage> {
        lock(&self.usage).get(session_key).copied()
    }

    async fn is_run_active(&self, session_key: &str) -> bool {
        lock(&self.run_active)
            .get(session_key)
            .copied()
            .unwrap_or(false)
    }

    async fn steer(&self, session_key: &str, message: &str) -> bool {
        let allowed = lock(&self.steerable)
            .get(session_key)
            .copied()
            .unwrap_or(false);
        if allowed {
            lock(&self.steered)
                .entry(session_key.to_string())
                .or_default()
                .push(message.to_string());
        }
        allowed
    }
}

/// Programmable gateway double recording every RPC it receives.
#[derive(Default)]
pub struct MockGateway {
    agent_sends: Mutex<Vec<AgentSendRequest>>,
    fail_sends: Mutex<usize>,
    wait_replies: Mutex<HashMap<String, WaitReply>>,
    waits: Mutex<Vec<String>>,
    spawns: Mutex<Vec<SpawnRunRequest>>,
    patches: Mutex<Vec<(String, String)>>,
    deletes: Mutex<Vec<(String, bool)>>,
}

impl MockGateway {
    pub fn agent_sends(&self) -> Vec<AgentSendRequest> {
        lock(&self.agent_sends).clone()
    }

    /// Make the next `count` `agent` sends fail.
    pub fn fail_agent_sends(&self, count: usize) {
        *lock(&self.fail_sends) = count;
    }

    pub fn set_wait_reply(&self, run_id: &str, reply: WaitReply) {
        lock(&self.wait_replies).insert(run_id.to_string(), reply);
    }

    pub fn waits(&self) -> Vec<String> {
        lock(&self.waits).clone()
    }

    pub fn spawns(&self) -> Vec<SpawnRunRequest> {
        lock(&self.spawns).clone()
    }

    pub fn patches(&self) -> Vec<(String, String)> {
        lock(&self.patches).clone()
    }

    pub fn deletes(&self) -> Vec<(String, bool)> {
        lock(&self.deletes).clone()
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn send_agent_message(&self, request: AgentSendRequest) -> Result<(), GatewayError> {
        {
            let mut remaining = lock(&self.fail_sends);
            if *remaining > 0 {
                *remaining -= 1;
                return Err(GatewayError::Rpc {
                    method: "agent",
                    message: "injected failure".to_string(),
                });
            }
        }
        lock(&self.agent_sends).push(request);
        Ok(())
    }

    async fn wait_for_run(
        &self,
        run_id: &str,
        _timeout: Duration,
    ) -> Result<WaitReply, GatewayError> {
        lock(&self.waits).push(run_id.to_string());
        Ok(lock(&self.wait_replies)
            .get(run_id)
            .cloned()
            .unwrap_or(WaitReply {
                status: RunStatus::Ok,
                started_at: None,
                ended_at: Some(now_ms()),
                error: None,
            }))
    }

    async fn spawn_agent_run(&self, request: SpawnRunRequest) -> Result<(), GatewayError> {
        lock(&self.spawns).push(request);
        Ok(())
    }

    async fn patch_session_label(
        &self,
        session_key: &str,
        label: &str,
    ) -> Result<(), GatewayError> {
        lock(&self.patches).push((session_key.to_string(), label.to_string()));
        Ok(())
    }

    async fn delete_session(
        &self,
        session_key: &str,
        delete_transcript: bool,
    ) -> Result<(), GatewayError> {
        lock(&self.deletes).push((session_key.to_string(), delete_transcript));
        Ok(())
    }
}
