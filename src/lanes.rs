//! Named task lanes with per-lane concurrency caps.
//!
//! A lane serializes task execution: tasks start in FIFO order and at
//! most `max_concurrent` run at once. Lanes support a typed `clear` for
//! pending work, and a generation counter so an in-process reset
//! ([`LaneQueue::reset_all`], wired to SIGUSR1 by the host) invalidates
//! completion callbacks from tasks started before the reset.

use crate::error::{LaneClearedError, LaneError};
use futures::FutureExt as _;
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

/// Global lane that subagent spawns are serialized through.
pub const SUBAGENT_LANE: &str = "subagent";

const DEFAULT_WARN_AFTER: Duration = Duration::from_secs(2);
const ACTIVE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lanes whose tasks probe flaky externals; their failures are expected
/// and logged at debug instead of error.
fn is_probe_lane(lane: &str) -> bool {
    lane.starts_with("auth-probe:") || lane.starts_with("session:probe-")
}

/// What happens to a queued entry when it leaves the queue.
enum Disposal {
    Start,
    Cleared(LaneClearedError),
}

/// Callback invoked when a task waited past its warn threshold:
/// `(waited, queued_behind)`.
pub type OnWait = Box<dyn FnOnce(Duration, usize) + Send>;

struct QueuedEntry {
    consume: Box<dyn FnOnce(Disposal) -> Option<BoxFuture<'static, ()>> + Send>,
    enqueued_at: Instant,
    warn_after: Duration,
    on_wait: Option<OnWait>,
}

struct LaneState {
    queue: VecDeque<QueuedEntry>,
    active: HashSet<u64>,
    max_concurrent: usize,
    draining: bool,
    generation: u64,
}

impl LaneState {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            active: HashSet::new(),
            max_concurrent: 1,
            draining: false,
            generation: 0,
        }
    }
}

/// Options for [`LaneQueue::enqueue`].
pub struct EnqueueOptions {
    /// Queue-wait threshold past which a diagnostic warning is emitted.
    pub warn_after: Duration,
    pub on_wait: Option<OnWait>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            warn_after: DEFAULT_WARN_AFTER,
            on_wait: None,
        }
    }
}

/// Result of [`LaneQueue::wait_for_active_tasks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveTasksWait {
    pub drained: bool,
}

struct Inner {
    lanes: Mutex<HashMap<String, LaneState>>,
    next_task_id: AtomicU64,
}

/// Process-wide lane queue. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LaneQueue {
    inner: Arc<Inner>,
}

impl Default for LaneQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LaneQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaneQueue").finish_non_exhaustive()
    }
}

impl LaneQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                lanes: Mutex::new(HashMap::new()),
                next_task_id: AtomicU64::new(1),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, LaneState>> {
        self.inner
            .lanes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a task to a lane. The returned future resolves with the
    /// task's output once it has been started (FIFO, under the lane's
    /// concurrency cap) and run to completion, or with
    /// [`LaneClearedError`] if the lane is cleared first.
    pub fn enqueue<F, T>(
        &self,
        lane: &str,
        options: EnqueueOptions,
        task: F,
    ) -> impl Future<Output = Result<T, LaneError>> + Send + 'static
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel::<Result<T, LaneClearedError>>();
        let consume = Box::new(move |disposal: Disposal| match disposal {
            Disposal::Start => Some(
                async move {
                    let _ = result_tx.send(Ok(task.await));
                }
                .boxed(),
            ),
            Disposal::Cleared(error) => {
                let _ = result_tx.send(Err(error));
                None
            }
        });

        {
            let mut lanes = self.lock();
            let state = lanes.entry(lane.to_string()).or_insert_with(LaneState::new);
            state.queue.push_back(QueuedEntry {
                consume,
                enqueued_at: Instant::now(),
                warn_after: options.warn_after,
                on_wait: options.on_wait,
            });
        }
        self.drain(lane);

        let lane = lane.to_string();
        async move {
            match result_rx.await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(cleared)) => Err(LaneError::Cleared(cleared)),
                // Sender dropped without a result: the task panicked.
                Err(_) => Err(LaneError::Aborted { lane }),
            }
        }
    }

    /// Set a lane's concurrency cap (clamped to at least 1) and drain.
    pub fn set_concurrency(&self, lane: &str, max_concurrent: usize) {
        {
            let mut lanes = self.lock();
            let state = lanes.entry(lane.to_string()).or_insert_with(LaneState::new);
            state.max_concurrent = max_concurrent.max(1);
        }
        self.drain(lane);
    }

    /// Splice out every queued entry and reject each with a typed
    /// [`LaneClearedError`]. Already-running tasks are not cancelled.
    /// Returns the number of entries removed.
    pub fn clear(&self, lane: &str) -> usize {
        let entries: Vec<QueuedEntry> = {
            let mut lanes = self.lock();
            match lanes.get_mut(lane) {
                Some(state) => state.queue.drain(..).collect(),
                None => return 0,
            }
        };

        let removed = entries.len();
        for entry in entries {
            let _ = (entry.consume)(Disposal::Cleared(LaneClearedError::new(lane)));
        }
        if removed > 0 {
            tracing::info!(lane, removed, "cleared queued lane tasks");
        }
        removed
    }

    /// Reset every lane: bump generations, forget active tasks, clear
    /// drain guards, then drain lanes that still hold queued entries.
    /// Completion callbacks from tasks started before the reset see a
    /// stale generation and leave the lane state untouched.
    pub fn reset_all(&self) {
        let pending: Vec<String> = {
            let mut lanes = self.lock();
            let mut pending = Vec::new();
            for (name, state) in lanes.iter_mut() {
                state.generation += 1;
                state.active.clear();
                state.draining = false;
                if !state.queue.is_empty() {
                    pending.push(name.clone());
                }
            }
            pending
        };

        tracing::info!(lanes = pending.len(), "lane queues reset");
        for lane in pending {
            self.drain(&lane);
        }
    }

    pub fn get_queue_size(&self, lane: &str) -> usize {
        self.lock().get(lane).map_or(0, |state| state.queue.len())
    }

    pub fn get_total_queue_size(&self) -> usize {
        self.lock().values().map(|state| state.queue.len()).sum()
    }

    pub fn get_active_task_count(&self) -> usize {
        self.lock().values().map(|state| state.active.len()).sum()
    }

    /// Wait until every task active *at call time* has completed, or the
    /// deadline passes. The snapshot is taken synchronously when this is
    /// called; tasks enqueued afterwards are ignored.
    pub fn wait_for_active_tasks(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = ActiveTasksWait> + Send + 'static {
        let snapshot: HashSet<u64> = self
            .lock()
            .values()
            .flat_map(|state| state.active.iter().copied())
            .collect();
        let queue = self.clone();

        async move {
            if snapshot.is_empty() {
                return ActiveTasksWait { drained: true };
            }

            let deadline = Instant::now() + timeout;
            loop {
                tokio::time::sleep(ACTIVE_POLL_INTERVAL).await;

                let any_left = queue
                    .lock()
                    .values()
                    .any(|state| state.active.iter().any(|id| snapshot.contains(id)));
                if !any_left {
                    return ActiveTasksWait { drained: true };
                }
                if Instant::now() >= deadline {
                    return ActiveTasksWait { drained: false };
                }
            }
        }
    }

    /// Start queued tasks while the lane is under capacity. Guarded by
    /// the `draining` flag so callbacks that re-enter (on_wait, nested
    /// enqueues) cannot reorder FIFO starts.
    fn drain(&self, lane: &str) {
        loop {
            let (entry, task_id, generation, queued_behind) = {
                let mut lanes = self.lock();
                let Some(state) = lanes.get_mut(lane) else {
                    return;
                };
                if state.draining {
                    return;
                }
                if state.active.len() >= state.max_concurrent {
                    return;
                }
                let Some(entry) = state.queue.pop_front() else {
                    return;
                };
                state.draining = true;
                let task_id = self.inner.next_task_id.fetch_add(1, Ordering::Relaxed);
                state.active.insert(task_id);
                (entry, task_id, state.generation, state.queue.len())
            };

            let waited = entry.enqueued_at.elapsed();
            if waited >= entry.warn_after {
                tracing::warn!(
                    lane,
                    waited_ms = waited.as_millis() as u64,
                    queued_behind,
                    "lane task waited in queue"
                );
                if let Some(on_wait) = entry.on_wait {
                    on_wait(waited, queued_behind);
                }
            }

            if let Some(future) = (entry.consume)(Disposal::Start) {
                let queue = self.clone();
                let lane_name = lane.to_string();
                tokio::spawn(async move {
                    if let Err(panic) =
                        std::panic::AssertUnwindSafe(future).catch_unwind().await
                    {
                        let message = panic_message(panic.as_ref());
                        if is_probe_lane(&lane_name) {
                            tracing::debug!(lane = %lane_name, message, "lane task panicked");
                        } else {
                            tracing::error!(lane = %lane_name, message, "lane task panicked");
                        }
                    }
                    queue.complete(&lane_name, task_id, generation);
                });
            }

            {
                let mut lanes = self.lock();
                if let Some(state) = lanes.get_mut(lane) {
                    state.draining = false;
                }
            }
        }
    }

    /// Task completion bookkeeping. Returns false for stale completions
    /// (the lane was reset after the task started); those must not touch
    /// the active set or trigger a drain.
    fn complete(&self, lane: &str, task_id: u64, generation: u64) -> bool {
        {
            let mut lanes = self.lock();
            let Some(state) = lanes.get_mut(lane) else {
                return false;
            };
            if state.generation != generation {
                return false;
            }
            state.active.remove(&task_id);
        }
        self.drain(lane);
        true
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
