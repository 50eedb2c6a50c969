//! Per-conversation holding queue for completion announcements.
//!
//! Whether a finished child's announcement is injected mid-conversation,
//! queued behind the parent's active run, or handed back for direct
//! delivery is decided here, per flow-control mode. Queued items are
//! flushed FIFO once the parent goes idle.

use crate::delivery::DeliveryContext;
use crate::gateway::{AgentSendRequest, Gateway};
use crate::sessions::{
    GLOBAL_SESSION_KEY, SessionStore, UNKNOWN_SESSION_KEY, canonical_session_key,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// Flow-control mode for announcements.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AnnounceMode {
    /// Always enqueue; flush when the parent run ends.
    Collect,
    /// Enqueue while the parent run is active; deliver on idle.
    Followup,
    /// Inject into a live embedded run, else fall through to direct send.
    Steer,
    /// Try steer; if that fails, behave like `followup`.
    #[default]
    SteerBacklog,
    /// Same queueing as `followup`; for parent-interruptible flows.
    Interrupt,
}

impl AnnounceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AnnounceMode::Collect => "collect",
            AnnounceMode::Followup => "followup",
            AnnounceMode::Steer => "steer",
            AnnounceMode::SteerBacklog => "steer-backlog",
            AnnounceMode::Interrupt => "interrupt",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "collect" => Some(AnnounceMode::Collect),
            "followup" => Some(AnnounceMode::Followup),
            "steer" => Some(AnnounceMode::Steer),
            "steer-backlog" => Some(AnnounceMode::SteerBacklog),
            "interrupt" => Some(AnnounceMode::Interrupt),
            _ => None,
        }
    }
}

impl std::fmt::Display for AnnounceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the queue did with an offered announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Injected into the parent's live embedded run.
    Steered,
    /// Held for a later flush.
    Queued,
    /// The queue declined; the caller should deliver directly.
    Direct,
}

/// One announcement bound for a parent conversation.
#[derive(Debug, Clone)]
pub struct Announcement {
    pub session_key: String,
    pub prompt: String,
    pub summary_line: Option<String>,
    pub origin: Option<DeliveryContext>,
    pub enqueued_at: i64,
}

/// Per-conversation announcement queue.
pub struct AnnounceQueue {
    queues: Mutex<HashMap<String, VecDeque<Announcement>>>,
    sessions: Arc<dyn SessionStore>,
    gateway: Arc<dyn Gateway>,
    main_session_key: String,
}

impl std::fmt::Debug for AnnounceQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnnounceQueue")
            .field("conversations", &self.lock().len())
            .finish_non_exhaustive()
    }
}

impl AnnounceQueue {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        gateway: Arc<dyn Gateway>,
        main_session_key: String,
    ) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            sessions,
            gateway,
            main_session_key,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Announcement>>> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, key: String, announcement: Announcement) {
        self.lock().entry(key).or_default().push_back(announcement);
    }

    /// Number of announcements held for a conversation.
    pub fn pending(&self, session_key: &str) -> usize {
        let key = canonical_session_key(session_key, &self.main_session_key);
        self.lock().get(&key).map_or(0, VecDeque::len)
    }

    /// Decide what to do with an announcement under the given mode.
    pub async fn offer(&self, mode: AnnounceMode, announcement: Announcement) -> Disposition {
        let key = canonical_session_key(&announcement.session_key, &self.main_session_key);
        // Conversations no delivery can target are never held.
        if key == GLOBAL_SESSION_KEY || key == UNKNOWN_SESSION_KEY {
            return Disposition::Direct;
        }

        match mode {
            AnnounceMode::Collect => {
                self.push(key, announcement);
                Disposition::Queued
            }
            AnnounceMode::Followup | AnnounceMode::Interrupt => {
                if self.sessions.is_run_active(&key).await {
                    self.push(key, announcement);
                    Disposition::Queued
                } else {
                    Disposition::Direct
                }
            }
            AnnounceMode::Steer => {
                if self.try_steer(&key, &announcement).await {
                    Disposition::Steered
                } else {
                    Disposition::Direct
                }
            }
            AnnounceMode::SteerBacklog => {
                if self.try_steer(&key, &announcement).await {
                    Disposition::Steered
                } else if self.sessions.is_run_active(&key).await {
                    self.push(key, announcement);
                    Disposition::Queued
                } else {
                    Disposition::Direct
                }
            }
        }
    }

    async fn try_steer(&self, key: &str, announcement: &Announcement) -> bool {
        if !self.sessions.is_run_active(key).await {
            return false;
        }
        self.sessions.steer(key, &announcement.prompt).await
    }

    /// Deliver everything held for a conversation, in FIFO order, via the
    /// `agent` method with `deliver = true`. On a send failure the failed
    /// item and the remainder are kept for a later flush. Returns the
    /// number delivered.
    pub async fn flush(&self, session_key: &str) -> usize {
        let key = canonical_session_key(session_key, &self.main_session_key);
        let drained: Vec<Announcement> = match self.lock().remove(&key) {
            Some(queue) => queue.into(),
            None => return 0,
        };

        let mut delivered = 0;
        let mut iter = drained.into_iter();
        while let Some(item) = iter.next() {
            let origin = item.origin.clone().unwrap_or_default();
            let request = AgentSendRequest {
                session_key: key.clone(),
                message: item.prompt.clone(),
                deliver: true,
                channel: origin.channel,
                account_id: origin.account_id,
                to: origin.to,
                thread_id: origin.thread_id,
                idempotency_key: uuid::Uuid::new_v4().to_string(),
                expect_final: false,
            };

            if let Err(error) = self.gateway.send_agent_message(request).await {
                tracing::error!(session_key = %key, %error, "announce flush send failed, keeping remainder");
                let mut queues = self.lock();
                let queue = queues.entry(key.clone()).or_default();
                // Re-queue in front so a later flush preserves FIFO.
                let mut remainder: VecDeque<Announcement> =
                    std::iter::once(item).chain(iter).collect();
                remainder.append(queue);
                *queue = remainder;
                break;
            }
            delivered += 1;
        }

        if delivered > 0 {
            tracing::info!(session_key = %key, delivered, "flushed queued announcements");
        }
        delivered
    }
}
