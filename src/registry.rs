//! Authoritative, persisted map of in-flight subagent runs.
//!
//! The registry owns the run lifecycle: it records spawns, listens for
//! lifecycle events on the agent bus, runs a parallel `agent.wait`
//! watcher per run for cross-process coverage, resumes half-finished
//! runs after a restart, and sweeps archived child sessions. The two
//! completion signals (event bus and RPC watcher) can race; whichever
//! flips the cleanup token first runs the announce flow, exactly once
//! per attempt.

pub mod store;

use crate::announce::{FlowOptions, run_subagent_announce_flow};
use crate::delivery::DeliveryContext;
use crate::{AgentEvent, CleanupMode, CoreDeps, LifecyclePhase, RunOutcome, now_ms};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Duration;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const RESUME_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// One spawned child run. Lives in memory and in
/// `<stateDir>/subagents/runs.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubagentRecord {
    pub run_id: String,
    pub child_session_key: String,
    pub requester_session_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_origin: Option<DeliveryContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_display_key: Option<String>,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub cleanup: CleanupMode,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_at_ms: Option<i64>,
    /// Cleanup token: the announce flow for this run has started.
    #[serde(default)]
    pub cleanup_handled: bool,
    /// The announce succeeded; no further attempt will run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_completed_at: Option<i64>,
}

/// Parameters for [`SubagentRegistry::register`].
#[derive(Debug, Clone)]
pub struct RegisterParams {
    pub run_id: String,
    pub child_session_key: String,
    pub requester_session_key: String,
    pub requester_origin: Option<DeliveryContext>,
    pub requester_display_key: Option<String>,
    pub task: String,
    pub label: Option<String>,
    pub cleanup: CleanupMode,
    /// Override for the `agent.wait` watcher timeout; defaults to
    /// `agents.defaults.subagents.timeoutSeconds`.
    pub wait_timeout: Option<Duration>,
}

struct Inner {
    deps: CoreDeps,
    runs: Mutex<HashMap<String, SubagentRecord>>,
    /// Run ids already resumed this process lifetime.
    resumed: Mutex<HashSet<String>>,
    listener_started: AtomicBool,
    sweeper_running: AtomicBool,
    restored: AtomicBool,
}

/// Process-wide subagent run registry. Cheap to clone; clones share
/// state.
#[derive(Clone)]
pub struct SubagentRegistry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SubagentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubagentRegistry")
            .field("runs", &self.runs().len())
            .finish_non_exhaustive()
    }
}

impl SubagentRegistry {
    pub fn new(deps: CoreDeps) -> Self {
        Self {
            inner: Arc::new(Inner {
                deps,
                runs: Mutex::new(HashMap::new()),
                resumed: Mutex::new(HashSet::new()),
                listener_started: AtomicBool::new(false),
                sweeper_running: AtomicBool::new(false),
                restored: AtomicBool::new(false),
            }),
        }
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<String, SubagentRecord>> {
        self.inner
            .runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn default_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.inner.deps.config.agents.defaults.subagents.timeout_seconds)
    }

    /// Write the current map to disk. Best-effort: failures are logged
    /// and never surface to the caller.
    fn persist(&self) {
        let runs = self.runs().clone();
        let path = self.inner.deps.config.registry_path();
        if let Err(error) = store::save_registry(&path, &runs) {
            tracing::error!(path = %path.display(), %error, "failed to persist subagent registry");
        }
    }

    /// Record a freshly spawned run, start its `agent.wait` watcher, and
    /// make sure the lifecycle listener and (when archival is on) the
    /// sweeper are running.
    pub fn register(&self, params: RegisterParams) {
        let now = now_ms();
        let archive_at_ms = self
            .inner
            .deps
            .config
            .agents
            .defaults
            .subagents
            .archive_after_minutes
            .map(|minutes| now + minutes as i64 * 60_000);

        let record = SubagentRecord {
            run_id: params.run_id.clone(),
            child_session_key: params.child_session_key,
            requester_session_key: params.requester_session_key,
            requester_origin: params
                .requester_origin
                .as_ref()
                .and_then(DeliveryContext::normalized),
            requester_display_key: params.requester_display_key,
            task: params.task,
            label: params.label,
            cleanup: params.cleanup,
            created_at: now,
            started_at: None,
            ended_at: None,
            outcome: None,
            archive_at_ms,
            cleanup_handled: false,
            cleanup_completed_at: None,
        };

        tracing::info!(
            run_id = %record.run_id,
            child_session_key = %record.child_session_key,
            requester = %record.requester_session_key,
            "registered subagent run"
        );

        self.runs().insert(params.run_id.clone(), record);
        self.persist();

        self.ensure_listener();
        if archive_at_ms.is_some() {
            self.ensure_sweeper();
        }
        let timeout = params.wait_timeout.unwrap_or_else(|| self.default_wait_timeout());
        self.spawn_wait_watcher(params.run_id, timeout);
    }

    /// Drop a run from memory and disk.
    pub fn release(&self, run_id: &str) -> Option<SubagentRecord> {
        let removed = self.runs().remove(run_id);
        if removed.is_some() {
            self.persist();
        }
        removed
    }

    pub fn get(&self, run_id: &str) -> Option<SubagentRecord> {
        self.runs().get(run_id).cloned()
    }

    /// Runs spawned by a given parent conversation, oldest first.
    pub fn list_for_requester(&self, requester_session_key: &str) -> Vec<SubagentRecord> {
        let mut records: Vec<SubagentRecord> = self
            .runs()
            .values()
            .filter(|record| record.requester_session_key == requester_session_key)
            .cloned()
            .collect();
        records.sort_by_key(|record| record.created_at);
        records
    }

    /// Idempotent restore from disk. Records already in memory win over
    /// restored copies. Half-finished restored runs are resumed: ended
    /// runs get an announce attempt, unfinished ones a fresh watcher.
    pub async fn init(&self) {
        if self.inner.restored.swap(true, Ordering::SeqCst) {
            return;
        }

        self.ensure_listener();

        let path = self.inner.deps.config.registry_path();
        let loaded = store::load_registry(&path);
        let now = now_ms();
        let archive_window_ms = self
            .inner
            .deps
            .config
            .agents
            .defaults
            .subagents
            .archive_after_minutes
            .map(|minutes| minutes as i64 * 60_000);

        let restored: Vec<SubagentRecord> = {
            let mut runs = self.runs();
            let mut restored = Vec::new();
            for (run_id, mut record) in loaded.runs {
                if runs.contains_key(&run_id) {
                    continue;
                }
                // No announce can be in flight in a fresh process; a
                // token left set by a crash mid-announce would block the
                // resume forever.
                if record.cleanup_completed_at.is_none() {
                    record.cleanup_handled = false;
                }
                // Elapsed archive deadlines are re-anchored to the new
                // process clock instead of firing at startup.
                if let (Some(at), Some(window)) = (record.archive_at_ms, archive_window_ms)
                    && at <= now
                {
                    record.archive_at_ms = Some(now + window);
                }
                runs.insert(run_id, record.clone());
                restored.push(record);
            }
            restored
        };

        if loaded.migrated {
            self.persist();
        }

        let any_archival = restored.iter().any(|record| record.archive_at_ms.is_some());
        if any_archival {
            self.ensure_sweeper();
        }

        tracing::info!(restored = restored.len(), "subagent registry restored");
        for record in restored {
            self.resume_record(record);
        }
    }

    fn resume_record(&self, record: SubagentRecord) {
        {
            let mut resumed = self
                .inner
                .resumed
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !resumed.insert(record.run_id.clone()) {
                return;
            }
        }

        if record.cleanup_completed_at.is_some() {
            return;
        }

        if record.ended_at.unwrap_or(0) > 0 {
            if self.begin_subagent_cleanup(&record.run_id) {
                let registry = self.clone();
                let run_id = record.run_id.clone();
                tokio::spawn(async move {
                    registry
                        .run_announce_and_finalize(
                            &run_id,
                            FlowOptions {
                                wait_timeout: RESUME_WAIT_TIMEOUT,
                                wait_for_completion: false,
                                round_one_reply: None,
                            },
                        )
                        .await;
                });
            }
        } else {
            self.spawn_wait_watcher(record.run_id, self.default_wait_timeout());
        }
    }

    /// Flip the cleanup token. Only the caller that sees `false → true`
    /// proceeds with an announce attempt; everyone else backs off.
    pub fn begin_subagent_cleanup(&self, run_id: &str) -> bool {
        let won = {
            let mut runs = self.runs();
            let Some(record) = runs.get_mut(run_id) else {
                return false;
            };
            if record.cleanup_completed_at.is_some() || record.cleanup_handled {
                false
            } else {
                record.cleanup_handled = true;
                true
            }
        };
        if won {
            self.persist();
        }
        won
    }

    /// Settle a finished announce attempt. Successful delete-mode runs
    /// leave the registry entirely; failed attempts release the token so
    /// a later trigger can retry; successful keep-mode runs are stamped
    /// complete and retained until their archive deadline.
    pub fn finalize_subagent_cleanup(
        &self,
        run_id: &str,
        cleanup: CleanupMode,
        did_announce: bool,
    ) {
        if did_announce && cleanup == CleanupMode::Delete {
            self.runs().remove(run_id);
            self.persist();
            return;
        }

        {
            let mut runs = self.runs();
            let Some(record) = runs.get_mut(run_id) else {
                return;
            };
            if did_announce {
                record.cleanup_completed_at = Some(now_ms());
            } else if record.cleanup_completed_at.is_none() {
                record.cleanup_handled = false;
            }
        }
        self.persist();
    }

    fn ensure_listener(&self) {
        if self.inner.listener_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let registry = self.clone();
        let mut event_rx = self.inner.deps.event_tx.subscribe();
        tokio::spawn(async move {
            loop {
                match event_rx.recv().await {
                    Ok(AgentEvent::Lifecycle {
                        run_id,
                        phase,
                        at,
                        error,
                    }) => {
                        registry.handle_lifecycle(&run_id, phase, at, error).await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "subagent lifecycle listener lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn handle_lifecycle(
        &self,
        run_id: &str,
        phase: LifecyclePhase,
        at: Option<i64>,
        error: Option<String>,
    ) {
        if !self.runs().contains_key(run_id) {
            return;
        }

        match phase {
            LifecyclePhase::Start => {
                {
                    let mut runs = self.runs();
                    if let Some(record) = runs.get_mut(run_id)
                        && record.started_at.is_none()
                    {
                        record.started_at = Some(at.unwrap_or_else(now_ms));
                    }
                }
                self.persist();
            }
            LifecyclePhase::End => {
                self.handle_run_end(run_id, None, at, RunOutcome::ok()).await;
            }
            LifecyclePhase::Error => {
                self.handle_run_end(run_id, None, at, RunOutcome::error(error))
                    .await;
            }
        }
    }

    /// Shared end-of-run path for the lifecycle listener and the RPC
    /// watcher. Both funnel through the cleanup token, so whichever gets
    /// here second is a no-op.
    async fn handle_run_end(
        &self,
        run_id: &str,
        started_at: Option<i64>,
        ended_at: Option<i64>,
        outcome: RunOutcome,
    ) {
        {
            let mut runs = self.runs();
            let Some(record) = runs.get_mut(run_id) else {
                return;
            };
            if record.started_at.is_none() && started_at.is_some() {
                record.started_at = started_at;
            }
            if record.ended_at.is_none() {
                record.ended_at = Some(ended_at.unwrap_or_else(now_ms));
            }
            if record.outcome.is_none() {
                record.outcome = Some(outcome);
            }
        }
        self.persist();

        if !self.begin_subagent_cleanup(run_id) {
            return;
        }
        self.run_announce_and_finalize(
            run_id,
            FlowOptions {
                wait_timeout: self.default_wait_timeout(),
                wait_for_completion: false,
                round_one_reply: None,
            },
        )
        .await;
    }

    async fn run_announce_and_finalize(&self, run_id: &str, options: FlowOptions) {
        let Some(record) = self.get(run_id) else {
            return;
        };

        let result = run_subagent_announce_flow(&self.inner.deps, &record, options).await;

        {
            let mut runs = self.runs();
            if let Some(stored) = runs.get_mut(run_id) {
                if stored.started_at.is_none() {
                    stored.started_at = result.adopted_started_at;
                }
                if stored.ended_at.is_none() {
                    stored.ended_at = result.adopted_ended_at;
                }
                if stored.outcome.is_none() {
                    stored.outcome = result.outcome.clone();
                }
            }
        }

        self.finalize_subagent_cleanup(run_id, record.cleanup, result.announced);
    }

    fn spawn_wait_watcher(&self, run_id: String, timeout: Duration) {
        let registry = self.clone();
        tokio::spawn(async move {
            registry.wait_for_subagent_completion(&run_id, timeout).await;
        });
    }

    /// `agent.wait` watcher: cross-process coverage for runs whose
    /// lifecycle events never reach this process. Non-terminal statuses
    /// (timeout included) leave the record for another trigger.
    pub async fn wait_for_subagent_completion(&self, run_id: &str, timeout: Duration) {
        let reply = match self.inner.deps.gateway.wait_for_run(run_id, timeout).await {
            Ok(reply) => reply,
            Err(error) => {
                tracing::error!(run_id, %error, "agent.wait watcher failed");
                return;
            }
        };

        match reply.status {
            crate::RunStatus::Ok | crate::RunStatus::Error => {
                let outcome = RunOutcome {
                    status: reply.status,
                    error: reply.error.clone(),
                };
                self.handle_run_end(run_id, reply.started_at, reply.ended_at, outcome)
                    .await;
            }
            crate::RunStatus::Timeout | crate::RunStatus::Unknown => {
                tracing::debug!(run_id, status = %reply.status, "agent.wait returned without a terminal status");
            }
        }
    }

    fn ensure_sweeper(&self) {
        if self.inner.sweeper_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if registry.sweep_archived().await {
                    break;
                }
            }
            registry.inner.sweeper_running.store(false, Ordering::SeqCst);
            tracing::debug!("subagent archive sweeper stopped");
        });
    }

    /// One sweep pass. Returns true when no records remain, which stops
    /// the sweeper until the next registration.
    async fn sweep_archived(&self) -> bool {
        let now = now_ms();
        let due: Vec<SubagentRecord> = {
            let mut runs = self.runs();
            let due_ids: Vec<String> = runs
                .values()
                .filter(|record| record.archive_at_ms.is_some_and(|at| at <= now))
                .map(|record| record.run_id.clone())
                .collect();
            due_ids
                .iter()
                .filter_map(|run_id| runs.remove(run_id))
                .collect()
        };

        if !due.is_empty() {
            self.persist();
        }
        for record in &due {
            if let Err(error) = self
                .inner
                .deps
                .gateway
                .delete_session(&record.child_session_key, true)
                .await
            {
                tracing::warn!(run_id = %record.run_id, %error, "failed to archive child session");
            } else {
                tracing::info!(run_id = %record.run_id, "archived subagent session");
            }
        }

        self.runs().is_empty()
    }
}
