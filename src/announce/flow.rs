//! The subagent announce flow.
//!
//! Given a finished (or finishing) child run, gather its reply, compute
//! run statistics, build the announcement, and either steer it into the
//! parent's live run, queue it, or deliver it directly. The flow is
//! best-effort end to end: every failure is logged and reported as "did
//! not announce" so the registry can retry on the next trigger.

use crate::announce::queue::{Announcement, Disposition};
use crate::announce::stats::RunStats;
use crate::delivery::DeliveryContext;
use crate::gateway::AgentSendRequest;
use crate::registry::SubagentRecord;
use crate::sessions::{SessionStore, canonical_session_key};
use crate::{CleanupMode, CoreDeps, RunOutcome, RunStatus, now_ms, pricing};
use tokio::time::{Duration, Instant};

/// A child reply of exactly this sentinel suppresses the announcement.
pub const ANNOUNCE_SKIP: &str = "ANNOUNCE_SKIP";

/// Sentinel the parent model may answer with to suppress user-visible
/// output when relaying.
pub const NO_REPLY: &str = "NO_REPLY";

const ANNOUNCE_TYPE: &str = "subagent";

const SETTLE_CAP: Duration = Duration::from_secs(120);
const SETTLE_POLL: Duration = Duration::from_millis(250);
const REPLY_CAP: Duration = Duration::from_secs(15);
const REPLY_POLL: Duration = Duration::from_millis(100);

/// Inputs beyond the run record itself.
#[derive(Debug, Clone)]
pub struct FlowOptions {
    pub wait_timeout: Duration,
    /// When false, skip the `agent.wait` outcome acquisition (the caller
    /// already observed the end signal).
    pub wait_for_completion: bool,
    /// Reply captured at spawn time, when the spawner already has it.
    pub round_one_reply: Option<String>,
}

impl Default for FlowOptions {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(600),
            wait_for_completion: true,
            round_one_reply: None,
        }
    }
}

/// What the flow did, plus timestamps adopted from `agent.wait` for the
/// registry to fold back into the record.
#[derive(Debug, Clone, Default)]
pub struct FlowResult {
    pub announced: bool,
    /// The child was still mid-run; nothing was sent and the child
    /// session was kept. The caller retries later.
    pub deferred: bool,
    pub adopted_started_at: Option<i64>,
    pub adopted_ended_at: Option<i64>,
    pub outcome: Option<RunOutcome>,
}

enum ReplyAcquisition {
    Reply(String),
    Empty,
    Deferred,
}

/// Produce at most one best-effort announcement for a child run.
pub async fn run_subagent_announce_flow(
    deps: &CoreDeps,
    record: &SubagentRecord,
    options: FlowOptions,
) -> FlowResult {
    let mut result = FlowResult::default();
    let child_key = record.child_session_key.as_str();

    // Announcing while the child's parent conversation is still
    // processing would read back a partial reply as "(no output)".
    let settle_cap = options.wait_timeout.min(SETTLE_CAP);
    if !settle_embedded_run(deps.sessions.as_ref(), child_key, settle_cap).await {
        tracing::info!(
            run_id = %record.run_id,
            child_session_key = %child_key,
            "child run still active after settle wait, deferring announcement"
        );
        result.deferred = true;
        return result;
    }

    let mut outcome = record.outcome.clone();
    let mut started_at = record.started_at;
    let mut ended_at = record.ended_at;

    if options.round_one_reply.is_none() && options.wait_for_completion {
        match deps
            .gateway
            .wait_for_run(&record.run_id, options.wait_timeout)
            .await
        {
            Ok(reply) => {
                if outcome.is_none() {
                    outcome = Some(RunOutcome {
                        status: reply.status,
                        error: reply.error,
                    });
                }
                if started_at.is_none() {
                    started_at = reply.started_at;
                    result.adopted_started_at = reply.started_at;
                }
                if ended_at.is_none() {
                    ended_at = reply.ended_at;
                    result.adopted_ended_at = reply.ended_at;
                }
            }
            Err(error) => {
                tracing::error!(run_id = %record.run_id, %error, "agent.wait failed during announce");
                return result;
            }
        }
    }
    result.outcome = outcome.clone();

    let reply = match options.round_one_reply {
        Some(reply) => reply,
        None => {
            let reply_cap = options.wait_timeout.min(REPLY_CAP);
            match acquire_reply(deps.sessions.as_ref(), child_key, reply_cap).await {
                ReplyAcquisition::Reply(reply) => reply,
                ReplyAcquisition::Empty => String::new(),
                ReplyAcquisition::Deferred => {
                    tracing::info!(
                        run_id = %record.run_id,
                        "child run re-activated while waiting for a reply, deferring"
                    );
                    result.deferred = true;
                    return result;
                }
            }
        }
    };

    let reply = reply.trim().to_string();
    if reply == ANNOUNCE_SKIP {
        tracing::info!(run_id = %record.run_id, "child requested announce skip");
        finalize_child_session(deps, record).await;
        return result;
    }

    let entry = deps.sessions.entry(child_key).await;
    let usage = deps.sessions.usage(child_key).await;
    let cost_usd = match (&entry, usage) {
        (Some(entry), Some(usage)) => entry
            .model
            .as_deref()
            .and_then(|model| pricing::find_model_cost(&deps.config.models, model))
            .map(|cost| pricing::estimate_cost(cost, usage.input, usage.output)),
        _ => None,
    };
    let stats = RunStats {
        input_tokens: usage.map(|usage| usage.input),
        output_tokens: usage.map(|usage| usage.output),
        runtime_ms: match (started_at, ended_at) {
            (Some(started), Some(ended)) if ended >= started => Some(ended - started),
            _ => None,
        },
        cost_usd,
        session_key: child_key.to_string(),
        session_id: entry.as_ref().and_then(|entry| entry.session_id.clone()),
        transcript_path: entry
            .as_ref()
            .and_then(|entry| entry.transcript_path.clone()),
    };

    // The status label comes from the runtime signal alone, never from
    // whatever the model wrote.
    let status = outcome
        .as_ref()
        .map(|outcome| outcome.status)
        .unwrap_or(RunStatus::Unknown);
    let status_label = match status {
        RunStatus::Ok => "completed successfully".to_string(),
        RunStatus::Timeout => "timed out".to_string(),
        RunStatus::Error => format!(
            "failed: {}",
            outcome
                .as_ref()
                .and_then(|outcome| outcome.error.as_deref())
                .unwrap_or("unknown error")
        ),
        RunStatus::Unknown => "finished with unknown status".to_string(),
    };

    let display_label = record
        .label
        .clone()
        .unwrap_or_else(|| record.task.clone());
    let findings = if reply.is_empty() {
        "(no output)"
    } else {
        reply.as_str()
    };
    let message = build_trigger_message(
        ANNOUNCE_TYPE,
        &display_label,
        &status_label,
        findings,
        &stats.line(),
    );

    let origin = resolve_requester_origin(deps, record).await;
    let announcement = Announcement {
        session_key: record.requester_session_key.clone(),
        prompt: message.clone(),
        summary_line: Some(format!("{ANNOUNCE_TYPE} \"{display_label}\" {status_label}")),
        origin: origin.clone(),
        enqueued_at: now_ms(),
    };

    let mode = deps.config.agents.defaults.subagents.announce_mode;
    result.announced = match deps.announce_queue.offer(mode, announcement).await {
        Disposition::Steered | Disposition::Queued => true,
        Disposition::Direct => {
            let origin = origin.unwrap_or_default();
            let request = AgentSendRequest {
                session_key: canonical_session_key(
                    &record.requester_session_key,
                    &deps.config.session.main_key,
                ),
                message,
                deliver: true,
                channel: origin.channel,
                account_id: origin.account_id,
                to: origin.to,
                thread_id: origin.thread_id,
                idempotency_key: uuid::Uuid::new_v4().to_string(),
                expect_final: true,
            };
            match deps.gateway.send_agent_message(request).await {
                Ok(()) => true,
                Err(error) => {
                    tracing::error!(run_id = %record.run_id, %error, "direct announce send failed");
                    false
                }
            }
        }
    };

    finalize_child_session(deps, record).await;
    result
}

/// Wait up to `cap` for the child's embedded run to end. Returns false
/// when it is still active at the deadline.
async fn settle_embedded_run(sessions: &dyn SessionStore, session_key: &str, cap: Duration) -> bool {
    if !sessions.is_run_active(session_key).await {
        return true;
    }

    let deadline = Instant::now() + cap;
    loop {
        tokio::time::sleep(SETTLE_POLL).await;
        if !sessions.is_run_active(session_key).await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
    }
}

/// Poll for the child's latest assistant reply. An empty store with a
/// re-activated run defers instead of announcing `(no output)`.
async fn acquire_reply(
    sessions: &dyn SessionStore,
    session_key: &str,
    cap: Duration,
) -> ReplyAcquisition {
    let deadline = Instant::now() + cap;
    loop {
        if let Some(reply) = sessions.latest_assistant_reply(session_key).await
            && !reply.trim().is_empty()
        {
            return ReplyAcquisition::Reply(reply);
        }
        if Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(REPLY_POLL).await;
    }

    if sessions.is_run_active(session_key).await {
        ReplyAcquisition::Deferred
    } else {
        ReplyAcquisition::Empty
    }
}

/// The requester origin captured at spawn wins; the requester session's
/// current routing fills the gaps.
async fn resolve_requester_origin(
    deps: &CoreDeps,
    record: &SubagentRecord,
) -> Option<DeliveryContext> {
    let requester_key = canonical_session_key(
        &record.requester_session_key,
        &deps.config.session.main_key,
    );
    let session_origin = deps
        .sessions
        .entry(&requester_key)
        .await
        .as_ref()
        .and_then(DeliveryContext::from_session);
    DeliveryContext::merge(record.requester_origin.as_ref(), session_origin.as_ref())
}

fn build_trigger_message(
    announce_type: &str,
    label: &str,
    status_label: &str,
    findings: &str,
    stats_line: &str,
) -> String {
    format!(
        "A {announce_type} \"{label}\" just {status_label}.\n\n\
         Findings:\n{findings}\n\n\
         {stats_line}\n\n\
         Relay this {announce_type} result to the user in your own voice, keeping \
         identifiers, paths, and links intact. If nothing needs to be surfaced to \
         the user, respond with exactly {NO_REPLY}."
    )
}

/// Best-effort step 8: patch the child's label and honor the cleanup
/// policy. Failures are swallowed.
async fn finalize_child_session(deps: &CoreDeps, record: &SubagentRecord) {
    if let Some(label) = &record.label
        && let Err(error) = deps
            .gateway
            .patch_session_label(&record.child_session_key, label)
            .await
    {
        tracing::warn!(run_id = %record.run_id, %error, "failed to patch child session label");
    }

    if record.cleanup == CleanupMode::Delete
        && let Err(error) = deps
            .gateway
            .delete_session(&record.child_session_key, true)
            .await
    {
        tracing::warn!(run_id = %record.run_id, %error, "failed to delete child session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ModelCost, ModelEntry, ProviderConfig};
    use crate::sessions::{SessionEntry, TokenUsage};
    use crate::testing::{MockGateway, MockSessionStore};
    use std::sync::Arc;

    const CHILD: &str = "agent:main:subagent:abc";
    const PARENT: &str = "agent:main:main";

    fn config_with_pricing() -> Config {
        let mut config = Config::default();
        config.models.providers.insert(
            "test".to_string(),
            ProviderConfig {
                models: vec![ModelEntry {
                    id: "test-model".to_string(),
                    cost: Some(ModelCost {
                        input: 1.0,
                        output: 5.0,
                    }),
                }],
            },
        );
        config
    }

    fn deps_with(
        config: Config,
        sessions: Arc<MockSessionStore>,
        gateway: Arc<MockGateway>,
    ) -> CoreDeps {
        let (event_tx, _event_rx) = tokio::sync::broadcast::channel(64);
        CoreDeps::new(Arc::new(config), gateway, sessions, event_tx)
    }

    fn record() -> SubagentRecord {
        SubagentRecord {
            run_id: "run-1".to_string(),
            child_session_key: CHILD.to_string(),
            requester_session_key: PARENT.to_string(),
            requester_origin: Some(DeliveryContext {
                channel: Some("slack".to_string()),
                to: Some("C42".to_string()),
                ..Default::default()
            }),
            requester_display_key: Some("main".to_string()),
            task: "summarise foo".to_string(),
            label: Some("foo".to_string()),
            cleanup: CleanupMode::Keep,
            created_at: 1_000,
            started_at: Some(10_000),
            ended_at: Some(322_000),
            outcome: Some(RunOutcome::ok()),
            archive_at_ms: None,
            cleanup_handled: true,
            cleanup_completed_at: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_announces_with_stats_and_status() {
        let sessions = Arc::new(MockSessionStore::default());
        sessions.set_reply(CHILD, "Done: 3 items");
        sessions.set_usage(CHILD, TokenUsage { input: 100, output: 200 });
        sessions.set_entry(SessionEntry {
            key: CHILD.to_string(),
            session_id: Some("s-123".to_string()),
            model: Some("test-model".to_string()),
            transcript_path: Some("/state/sessions/s-123.jsonl".to_string()),
            ..Default::default()
        });
        let gateway = Arc::new(MockGateway::default());
        let deps = deps_with(config_with_pricing(), sessions, gateway.clone());

        let result = run_subagent_announce_flow(
            &deps,
            &record(),
            FlowOptions {
                wait_for_completion: false,
                ..Default::default()
            },
        )
        .await;

        assert!(result.announced);
        assert!(!result.deferred);

        let sends = gateway.agent_sends();
        assert_eq!(sends.len(), 1, "parent idle, so the send is direct");
        let send = &sends[0];
        assert!(send.deliver);
        assert_eq!(send.session_key, PARENT);
        assert_eq!(send.channel.as_deref(), Some("slack"));
        assert!(send.message.contains("A subagent \"foo\" just completed successfully."));
        assert!(send.message.contains("Findings:\nDone: 3 items"));
        assert!(send.message.contains("runtime 5m12s"));
        assert!(send.message.contains("tokens 300 (in 100 / out 200)"));
        assert!(send.message.contains("est $0.0011"));
        assert!(send.message.contains("sessionId s-123"));
        assert!(send.message.contains(NO_REPLY));
    }

    #[tokio::test(start_paused = true)]
    async fn status_label_comes_from_outcome_not_reply_text() {
        let sessions = Arc::new(MockSessionStore::default());
        sessions.set_reply(CHILD, "success");
        let gateway = Arc::new(MockGateway::default());
        let deps = deps_with(Config::default(), sessions, gateway.clone());

        let mut failed = record();
        failed.outcome = Some(RunOutcome::error(Some("tool crashed".to_string())));

        let result = run_subagent_announce_flow(
            &deps,
            &failed,
            FlowOptions {
                wait_for_completion: false,
                ..Default::default()
            },
        )
        .await;

        assert!(result.announced);
        let send = &gateway.agent_sends()[0];
        assert!(send.message.contains("just failed: tool crashed."));
        assert!(send.message.contains("Findings:\nsuccess"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_announces_no_output_with_timed_out_label() {
        let sessions = Arc::new(MockSessionStore::default());
        let gateway = Arc::new(MockGateway::default());
        let deps = deps_with(Config::default(), sessions, gateway.clone());

        let mut timed_out = record();
        timed_out.outcome = Some(RunOutcome {
            status: RunStatus::Timeout,
            error: None,
        });
        timed_out.ended_at = None;

        let result = run_subagent_announce_flow(
            &deps,
            &timed_out,
            FlowOptions {
                wait_timeout: Duration::from_secs(5),
                wait_for_completion: false,
                round_one_reply: None,
            },
        )
        .await;

        assert!(result.announced);
        let send = &gateway.agent_sends()[0];
        assert!(send.message.contains("just timed out."));
        assert!(send.message.contains("Findings:\n(no output)"));
        assert!(send.message.contains("runtime n/a"));
    }

    #[tokio::test(start_paused = true)]
    async fn announce_skip_sentinel_publishes_nothing() {
        let sessions = Arc::new(MockSessionStore::default());
        sessions.set_reply(CHILD, ANNOUNCE_SKIP);
        let gateway = Arc::new(MockGateway::default());
        let deps = deps_with(Config::default(), sessions, gateway.clone());

        let result = run_subagent_announce_flow(
            &deps,
            &record(),
            FlowOptions {
                wait_for_completion: false,
                ..Default::default()
            },
        )
        .await;

        assert!(!result.announced);
        assert!(!result.deferred);
        assert!(gateway.agent_sends().is_empty());
        // Step 8 still runs: the label patch is best-effort finalization.
        assert_eq!(gateway.patches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn active_child_defers_and_keeps_the_session() {
        let sessions = Arc::new(MockSessionStore::default());
        sessions.set_run_active(CHILD, true);
        let gateway = Arc::new(MockGateway::default());
        let deps = deps_with(Config::default(), sessions, gateway.clone());

        let mut delete_mode = record();
        delete_mode.cleanup = CleanupMode::Delete;

        let result = run_subagent_announce_flow(
            &deps,
            &delete_mode,
            FlowOptions {
                wait_timeout: Duration::from_secs(300),
                wait_for_completion: false,
                round_one_reply: None,
            },
        )
        .await;

        assert!(result.deferred);
        assert!(!result.announced);
        assert!(gateway.agent_sends().is_empty());
        assert!(gateway.deletes().is_empty(), "deferred flow must keep the child session");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_adopts_timestamps_when_record_has_none() {
        let sessions = Arc::new(MockSessionStore::default());
        sessions.set_reply(CHILD, "finished");
        let gateway = Arc::new(MockGateway::default());
        gateway.set_wait_reply(
            "run-1",
            crate::gateway::WaitReply {
                status: RunStatus::Ok,
                started_at: Some(50_000),
                ended_at: Some(95_000),
                error: None,
            },
        );
        let deps = deps_with(Config::default(), sessions, gateway.clone());

        let mut fresh = record();
        fresh.started_at = None;
        fresh.ended_at = None;
        fresh.outcome = None;

        let result = run_subagent_announce_flow(
            &deps,
            &fresh,
            FlowOptions {
                wait_timeout: Duration::from_secs(30),
                wait_for_completion: true,
                round_one_reply: None,
            },
        )
        .await;

        assert!(result.announced);
        assert_eq!(result.adopted_started_at, Some(50_000));
        assert_eq!(result.adopted_ended_at, Some(95_000));
        assert_eq!(gateway.waits(), vec!["run-1"]);
        let send = &gateway.agent_sends()[0];
        assert!(send.message.contains("runtime 45s"));
    }

    #[tokio::test(start_paused = true)]
    async fn delete_cleanup_removes_child_session_after_announce() {
        let sessions = Arc::new(MockSessionStore::default());
        sessions.set_reply(CHILD, "done");
        let gateway = Arc::new(MockGateway::default());
        let deps = deps_with(Config::default(), sessions, gateway.clone());

        let mut delete_mode = record();
        delete_mode.cleanup = CleanupMode::Delete;

        let result = run_subagent_announce_flow(
            &deps,
            &delete_mode,
            FlowOptions {
                wait_for_completion: false,
                ..Default::default()
            },
        )
        .await;

        assert!(result.announced);
        assert_eq!(gateway.deletes(), vec![(CHILD.to_string(), true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn round_one_reply_skips_wait_and_reply_polling() {
        let sessions = Arc::new(MockSessionStore::default());
        let gateway = Arc::new(MockGateway::default());
        let deps = deps_with(Config::default(), sessions, gateway.clone());

        let result = run_subagent_announce_flow(
            &deps,
            &record(),
            FlowOptions {
                wait_timeout: Duration::from_secs(30),
                wait_for_completion: true,
                round_one_reply: Some("captured at spawn".to_string()),
            },
        )
        .await;

        assert!(result.announced);
        assert!(gateway.waits().is_empty(), "round-one reply suppresses agent.wait");
        let send = &gateway.agent_sends()[0];
        assert!(send.message.contains("Findings:\ncaptured at spawn"));
    }
}
