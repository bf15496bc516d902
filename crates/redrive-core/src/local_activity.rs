//! Local activity execution inside the workflow task
//!
//! Local activities run in-process and record their outcome as durable
//! markers instead of server-scheduled activity tasks. Execution itself
//! happens behind the [`LocalActivityDispatcher`] seam; completed attempts
//! come back through a completion queue the executor drains under its mutex.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::command::WorkflowFailure;
use crate::retry::RetryPolicy;

/// Marker name under which local activity outcomes are recorded
pub const LOCAL_ACTIVITY_MARKER_NAME: &str = "local_activity";

/// A local activity the program wants executed
#[derive(Debug, Clone, PartialEq)]
pub struct LocalActivityRequest {
    /// Activity identifier, unique within the workflow
    pub activity_id: String,

    /// Type of activity to execute
    pub activity_type: String,

    /// Input for the activity
    pub input: Option<serde_json::Value>,

    /// Retry policy evaluated between in-task attempts
    pub retry_policy: Option<RetryPolicy>,
}

/// One dispatched attempt of a local activity
#[derive(Debug, Clone)]
pub struct LocalActivityTask {
    /// Token identifying this attempt; completions carrying a stale token
    /// are dropped
    pub task_token: Uuid,

    pub request: LocalActivityRequest,

    /// Attempt number, 1-based
    pub attempt: u32,
}

/// Outcome of one local activity attempt
#[derive(Debug, Clone)]
pub struct LocalActivityCompletion {
    pub task_token: Uuid,
    pub activity_id: String,
    pub attempt: u32,
    pub result: Result<Option<serde_json::Value>, WorkflowFailure>,
    pub elapsed: Duration,
}

/// Durable marker payload for a resolved local activity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalActivityMarker {
    pub activity_id: String,
    pub attempt: u32,
    pub result: Option<serde_json::Value>,
    pub failure: Option<WorkflowFailure>,
    pub elapsed_ms: u64,
}

impl LocalActivityMarker {
    pub fn details(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("marker payload serializes")
    }

    pub fn from_details(details: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(details.clone())
    }

    /// The resolution the program observes for this marker
    pub fn resolution_result(&self) -> Result<Option<serde_json::Value>, WorkflowFailure> {
        match &self.failure {
            Some(failure) => Err(failure.clone()),
            None => Ok(self.result.clone()),
        }
    }
}

/// Executes dispatched local activity attempts
///
/// Implementations must not block the caller: spawn the work and deliver the
/// outcome through the provided sink, possibly after the workflow task that
/// dispatched it has already been handed back to the service.
pub trait LocalActivityDispatcher: Send + Sync {
    fn dispatch(&self, task: LocalActivityTask, sink: LocalActivityCompletionSink);
}

#[derive(Default)]
struct CompletionQueue {
    inner: Mutex<VecDeque<LocalActivityCompletion>>,
    notify: Notify,
}

/// Hand-off point for finished local activity attempts
///
/// Cloneable and cheap; the local activity worker calls [`complete`] from any
/// task or thread.
///
/// [`complete`]: LocalActivityCompletionSink::complete
#[derive(Clone)]
pub struct LocalActivityCompletionSink {
    queue: Arc<CompletionQueue>,
}

impl LocalActivityCompletionSink {
    pub fn complete(&self, completion: LocalActivityCompletion) {
        self.queue.inner.lock().push_back(completion);
        self.queue.notify.notify_one();
    }
}

/// Outcome of waiting on the completion queue
#[derive(Debug)]
pub enum WaitOutcome {
    Completion(LocalActivityCompletion),
    TimedOut,
    Interrupted,
}

/// What to do with a finished attempt
#[derive(Debug)]
pub enum CompletionDisposition {
    /// Record the marker and resolve the program
    Resolved(LocalActivityMarker),

    /// Re-dispatch after the backoff delay
    Retry { activity_id: String, delay: Duration },

    /// Token mismatch; a duplicate or an attempt we already gave up on
    Stale,
}

#[derive(Debug)]
struct PendingLocalActivity {
    request: LocalActivityRequest,
    attempt: u32,
    task_token: Option<Uuid>,
    first_dispatched_at: Option<Instant>,
}

/// Tracks local activities across dispatch, retry and marker recording
///
/// The pending set survives across workflow tasks: when the budget runs out
/// the executor heartbeats (force-new-task) and in-flight attempts resolve
/// into a later task.
pub struct LocalActivityRunner {
    dispatcher: Arc<dyn LocalActivityDispatcher>,
    queue: Arc<CompletionQueue>,
    pending: HashMap<String, PendingLocalActivity>,
    order: Vec<String>,
}

impl LocalActivityRunner {
    pub fn new(dispatcher: Arc<dyn LocalActivityDispatcher>) -> Self {
        Self {
            dispatcher,
            queue: Arc::new(CompletionQueue::default()),
            pending: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn sink(&self) -> LocalActivityCompletionSink {
        LocalActivityCompletionSink {
            queue: self.queue.clone(),
        }
    }

    /// Track newly scheduled requests
    pub fn enqueue(&mut self, requests: Vec<LocalActivityRequest>) {
        for request in requests {
            let activity_id = request.activity_id.clone();
            if self.pending.contains_key(&activity_id) {
                warn!(%activity_id, "duplicate local activity id; keeping the first request");
                continue;
            }
            self.order.push(activity_id.clone());
            self.pending.insert(
                activity_id,
                PendingLocalActivity {
                    request,
                    attempt: 1,
                    task_token: None,
                    first_dispatched_at: None,
                },
            );
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Attempts dispatched and not yet resolved
    pub fn in_flight(&self) -> usize {
        self.pending.values().filter(|p| p.task_token.is_some()).count()
    }

    /// Next request awaiting dispatch, in scheduling order
    pub fn next_unstarted(&self) -> Option<String> {
        self.order
            .iter()
            .find(|id| {
                self.pending
                    .get(*id)
                    .is_some_and(|p| p.task_token.is_none())
            })
            .cloned()
    }

    /// Dispatch one attempt of the given activity
    pub fn dispatch(&mut self, activity_id: &str) {
        let Some(pending) = self.pending.get_mut(activity_id) else {
            return;
        };
        let task_token = Uuid::now_v7();
        pending.task_token = Some(task_token);
        pending.first_dispatched_at.get_or_insert_with(Instant::now);

        let task = LocalActivityTask {
            task_token,
            request: pending.request.clone(),
            attempt: pending.attempt,
        };
        debug!(%activity_id, attempt = task.attempt, "dispatching local activity");
        self.dispatcher.dispatch(task, self.sink());
    }

    /// Wait for a completion, the deadline, or interruption
    pub async fn await_completion(
        &self,
        max_wait: Duration,
        interrupt: &CancellationToken,
    ) -> WaitOutcome {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if let Some(completion) = self.queue.inner.lock().pop_front() {
                return WaitOutcome::Completion(completion);
            }
            tokio::select! {
                _ = self.queue.notify.notified() => continue,
                _ = tokio::time::sleep_until(deadline) => return WaitOutcome::TimedOut,
                _ = interrupt.cancelled() => return WaitOutcome::Interrupted,
            }
        }
    }

    /// Drain a completion without waiting
    pub fn poll_completion(&self) -> Option<LocalActivityCompletion> {
        self.queue.inner.lock().pop_front()
    }

    /// Apply a finished attempt to the pending set
    pub fn handle_completion(
        &mut self,
        completion: LocalActivityCompletion,
    ) -> CompletionDisposition {
        let Some(pending) = self.pending.get_mut(&completion.activity_id) else {
            return CompletionDisposition::Stale;
        };
        if pending.task_token != Some(completion.task_token) {
            return CompletionDisposition::Stale;
        }

        match completion.result {
            Ok(result) => {
                let marker = LocalActivityMarker {
                    activity_id: completion.activity_id.clone(),
                    attempt: completion.attempt,
                    result,
                    failure: None,
                    elapsed_ms: completion.elapsed.as_millis() as u64,
                };
                self.remove(&completion.activity_id);
                CompletionDisposition::Resolved(marker)
            }
            Err(failure) => {
                let elapsed = pending
                    .first_dispatched_at
                    .map(|t| t.elapsed())
                    .unwrap_or_default();
                let next_attempt = pending.attempt + 1;
                let retry = pending.request.retry_policy.as_ref().and_then(|policy| {
                    if !failure.retryable {
                        return None;
                    }
                    let sleep = policy.sleep_time(next_attempt);
                    if policy.should_stop(
                        failure.failure_type.as_deref(),
                        next_attempt,
                        elapsed,
                        sleep,
                        None,
                    ) {
                        None
                    } else {
                        Some(sleep)
                    }
                });

                match retry {
                    Some(delay) => {
                        pending.attempt = next_attempt;
                        pending.task_token = None;
                        debug!(
                            activity_id = %completion.activity_id,
                            attempt = next_attempt,
                            delay_ms = delay.as_millis() as u64,
                            "retrying local activity"
                        );
                        CompletionDisposition::Retry {
                            activity_id: completion.activity_id,
                            delay,
                        }
                    }
                    None => {
                        let marker = LocalActivityMarker {
                            activity_id: completion.activity_id.clone(),
                            attempt: completion.attempt,
                            result: None,
                            failure: Some(failure),
                            elapsed_ms: completion.elapsed.as_millis() as u64,
                        };
                        self.remove(&completion.activity_id);
                        CompletionDisposition::Resolved(marker)
                    }
                }
            }
        }
    }

    /// Resolve pending requests against replayed markers, in marker order
    ///
    /// Consumed markers are removed from `available`; requests without a
    /// marker stay pending for a later batch.
    pub fn take_matching_markers(
        &mut self,
        available: &mut Vec<LocalActivityMarker>,
    ) -> Vec<LocalActivityMarker> {
        let mut resolved = Vec::new();
        available.retain(|marker| {
            if self.pending.contains_key(&marker.activity_id) {
                self.remove(&marker.activity_id);
                resolved.push(marker.clone());
                false
            } else {
                true
            }
        });
        resolved
    }

    fn remove(&mut self, activity_id: &str) {
        self.pending.remove(activity_id);
        self.order.retain(|id| id != activity_id);
    }
}
