//! Grouping the flat history stream into per-workflow-task batches

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::retry::RetryPolicy;

use super::{EventAttributes, HistoryError, HistoryEvent, HistoryFetcher, WorkflowTask};

/// One segment of history delimited by consecutive WorkflowTaskStarted events
///
/// `command_events` are the receipts materializing the commands the workflow
/// produced at this task's started event. `markers` are the MarkerRecorded
/// subset, surfaced ahead of `events` because later events may depend on
/// their payloads.
#[derive(Debug, Clone)]
pub struct WorkflowTaskEvents {
    /// Started event id of the task preceding this one (0 when none)
    pub previous_started_event_id: i64,

    /// Started event id closing this batch
    pub current_started_event_id: i64,

    /// Ordinary events, in history order
    pub events: Vec<HistoryEvent>,

    /// Receipts for the commands decided at this started event
    pub command_events: Vec<HistoryEvent>,

    /// MarkerRecorded receipts, dispatched before `events`
    pub markers: Vec<HistoryEvent>,

    /// True when this batch was already decided in a previous task
    pub replay: bool,

    /// Replay clock value while processing this batch
    pub replay_time_ms: i64,
}

enum BoundaryKind {
    Annulled,
    Completed,
    Live,
}

/// Streams history into [`WorkflowTaskEvents`] batches, fetching continuation
/// pages on demand
///
/// Pagination is a blocking RPC bounded by the workflow task deadline:
/// transient fetch errors are retried under the pagination policy, and
/// running out of budget surfaces [`HistoryError::DeadlineExceeded`].
pub struct HistoryIterator {
    run_id: String,
    buffered: VecDeque<HistoryEvent>,
    next_page_token: Option<Vec<u8>>,
    fetcher: Arc<dyn HistoryFetcher>,

    poll_previous_started_event_id: i64,
    poll_started_event_id: i64,
    last_started_event_id: i64,

    task_started_at: Instant,
    task_timeout: Duration,
    pagination_policy: RetryPolicy,
    pages_fetched: u32,
}

impl HistoryIterator {
    pub fn new(
        task: &WorkflowTask,
        fetcher: Arc<dyn HistoryFetcher>,
        pagination_policy: RetryPolicy,
    ) -> Self {
        // A page that does not begin at event 1 is a sticky continuation; its
        // first batch follows the task the service saw completed last.
        let last_started_event_id = match task.history.first() {
            Some(first) if first.event_id != 1 => task.previous_started_event_id,
            _ => 0,
        };

        Self {
            run_id: task.run_id.clone(),
            buffered: task.history.iter().cloned().collect(),
            next_page_token: task.next_page_token.clone(),
            fetcher,
            poll_previous_started_event_id: task.previous_started_event_id,
            poll_started_event_id: task.started_event_id,
            last_started_event_id,
            task_started_at: Instant::now(),
            task_timeout: task.workflow_task_timeout,
            pagination_policy,
            pages_fetched: 0,
        }
    }

    /// Number of continuation pages fetched so far
    pub fn pages_fetched(&self) -> u32 {
        self.pages_fetched
    }

    /// Produce the next task batch, or `None` at the end of history
    pub async fn next_task_batch(&mut self) -> Result<Option<WorkflowTaskEvents>, HistoryError> {
        let mut events: Vec<HistoryEvent> = Vec::new();

        loop {
            let Some(event) = self.next_event().await? else {
                if events.is_empty() {
                    return Ok(None);
                }
                // History ended without a closing started event: a query-only
                // page against a closed run. Treat the residue as live.
                let replay_time_ms = events.last().map(|e| e.timestamp_ms()).unwrap_or(0);
                return Ok(Some(self.close_batch(
                    self.poll_started_event_id,
                    events,
                    Vec::new(),
                    false,
                    replay_time_ms,
                )));
            };

            if !matches!(event.attributes, EventAttributes::WorkflowTaskStarted) {
                events.push(event);
                continue;
            }

            let started_event_id = event.event_id;
            let replay_time_ms = event.timestamp_ms();

            match self.peek_boundary().await? {
                // A failed or timed-out task never produced commands; its
                // started event is not a batch boundary.
                BoundaryKind::Annulled => {
                    let annulled = self.next_event().await?;
                    debug!(
                        run_id = %self.run_id,
                        started_event_id,
                        "skipping workflow task boundary annulled by {:?}",
                        annulled.map(|e| e.event_id)
                    );
                    continue;
                }

                BoundaryKind::Completed => {
                    self.next_event().await?;
                    let mut command_events = Vec::new();
                    loop {
                        let has_receipt = self
                            .peek()
                            .await?
                            .is_some_and(|peeked| peeked.is_command_event());
                        if !has_receipt {
                            break;
                        }
                        // Unwrap of the just-peeked event cannot fail.
                        command_events.push(self.next_event().await?.expect("peeked event"));
                    }
                    let replay = started_event_id <= self.poll_previous_started_event_id;
                    return Ok(Some(self.close_batch(
                        started_event_id,
                        events,
                        command_events,
                        replay,
                        replay_time_ms,
                    )));
                }

                // End of history, or a scheduled/started pair the service is
                // still deciding: this is the live batch.
                BoundaryKind::Live => {
                    let replay = started_event_id <= self.poll_previous_started_event_id;
                    return Ok(Some(self.close_batch(
                        started_event_id,
                        events,
                        Vec::new(),
                        replay,
                        replay_time_ms,
                    )));
                }
            }
        }
    }

    fn close_batch(
        &mut self,
        current_started_event_id: i64,
        events: Vec<HistoryEvent>,
        command_events: Vec<HistoryEvent>,
        replay: bool,
        replay_time_ms: i64,
    ) -> WorkflowTaskEvents {
        let previous_started_event_id = self.last_started_event_id;
        self.last_started_event_id = current_started_event_id;

        let markers = command_events
            .iter()
            .filter(|e| matches!(e.attributes, EventAttributes::MarkerRecorded { .. }))
            .cloned()
            .collect();

        WorkflowTaskEvents {
            previous_started_event_id,
            current_started_event_id,
            events,
            command_events,
            markers,
            replay,
            replay_time_ms,
        }
    }

    async fn next_event(&mut self) -> Result<Option<HistoryEvent>, HistoryError> {
        self.ensure_buffered().await?;
        Ok(self.buffered.pop_front())
    }

    /// Classify the event following a WorkflowTaskStarted boundary
    async fn peek_boundary(&mut self) -> Result<BoundaryKind, HistoryError> {
        Ok(match self.peek().await?.map(|e| &e.attributes) {
            Some(EventAttributes::WorkflowTaskFailed { .. })
            | Some(EventAttributes::WorkflowTaskTimedOut { .. }) => BoundaryKind::Annulled,
            Some(EventAttributes::WorkflowTaskCompleted { .. }) => BoundaryKind::Completed,
            _ => BoundaryKind::Live,
        })
    }

    async fn peek(&mut self) -> Result<Option<&HistoryEvent>, HistoryError> {
        self.ensure_buffered().await?;
        Ok(self.buffered.front())
    }

    async fn ensure_buffered(&mut self) -> Result<(), HistoryError> {
        while self.buffered.is_empty() {
            let Some(token) = self.next_page_token.take() else {
                return Ok(());
            };
            let page = self.fetch_page_with_retry(token).await?;
            self.buffered.extend(page.events);
            self.next_page_token = page.next_page_token;
        }
        Ok(())
    }

    async fn fetch_page_with_retry(
        &mut self,
        token: Vec<u8>,
    ) -> Result<super::HistoryPage, HistoryError> {
        let mut attempt: u32 = 1;
        loop {
            match self.fetcher.fetch_page(&self.run_id, token.clone()).await {
                Ok(page) => {
                    self.pages_fetched += 1;
                    debug!(
                        run_id = %self.run_id,
                        events = page.events.len(),
                        has_more = page.next_page_token.is_some(),
                        "fetched history page"
                    );
                    return Ok(page);
                }
                Err(err @ super::FetchError::Terminal(_)) => return Err(err.into()),
                Err(super::FetchError::Transient(message)) => {
                    let sleep = self.pagination_policy.sleep_time(attempt);
                    let elapsed = self.task_started_at.elapsed();
                    if self.pagination_policy.should_stop(
                        None,
                        attempt,
                        elapsed,
                        sleep,
                        Some(self.task_timeout),
                    ) {
                        warn!(
                            run_id = %self.run_id,
                            attempt,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "giving up on history pagination: {message}"
                        );
                        return Err(HistoryError::DeadlineExceeded { attempts: attempt });
                    }
                    debug!(
                        run_id = %self.run_id,
                        attempt,
                        sleep_ms = sleep.as_millis() as u64,
                        "retrying history fetch after transient error: {message}"
                    );
                    tokio::time::sleep(sleep).await;
                    attempt += 1;
                }
            }
        }
    }
}
