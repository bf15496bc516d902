//! The workflow task pipeline
//!
//! One `ReplayExecutor` serves one cached workflow run. Per task it groups
//! history into batches, advances the command state machines from
//! server-originated events, drives the program's event loop until it blocks,
//! executes or replays local activities, reconciles the wake-up timer, and
//! emits the commands the workflow wants sent. Replaying the same history
//! suffix must always reproduce the same command list; that determinism is
//! the crate's primary correctness property.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::{ClockError, ReplayClock};
use crate::command::{Command, RecordMarkerAttributes, StartTimerAttributes, WorkflowFailure};
use crate::history::{
    EventAttributes, HistoryError, HistoryEvent, HistoryFetcher, HistoryIterator, WorkflowTask,
    WorkflowTaskEvents,
};
use crate::local_activity::{
    CompletionDisposition, LocalActivityCompletionSink, LocalActivityDispatcher,
    LocalActivityMarker, LocalActivityRunner, WaitOutcome, LOCAL_ACTIVITY_MARKER_NAME,
};
use crate::machines::{CommandBookkeeper, CommandTarget, MachineError, MachinePayload};
use crate::program::{
    ProgramCommand, ProgramError, QueryResult, Resolution, WorkflowContext, WorkflowErrorPolicy,
    WorkflowProgram, WorkflowQuery,
};
use crate::retry::RetryPolicy;

/// Key under which the legacy single-query result is reported
pub const LEGACY_QUERY_RESULT_KEY: &str = "legacy_query";

/// Configuration for the replay executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// First backoff of the history pagination retry loop
    pub pagination_initial_backoff: Duration,

    /// Backoff ceiling of the pagination retry loop
    pub pagination_max_backoff: Duration,

    /// Fraction of the workflow task timeout local activities may consume
    /// before the executor heartbeats with a forced new task
    pub local_activity_budget_fraction: f64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            pagination_initial_backoff: Duration::from_millis(200),
            pagination_max_backoff: Duration::from_secs(4),
            local_activity_budget_fraction: 0.8,
        }
    }
}

/// Thread-safe counters the embedding worker can scrape
#[derive(Debug, Default)]
pub struct ExecutorMetrics {
    workflow_task_no_completion: AtomicU64,
    workflows_completed: AtomicU64,
    workflows_failed: AtomicU64,
    workflows_canceled: AtomicU64,
    workflows_continued_as_new: AtomicU64,
    local_activities_resolved: AtomicU64,
    history_pages_fetched: AtomicU64,
}

impl ExecutorMetrics {
    pub fn workflow_task_no_completion(&self) -> u64 {
        self.workflow_task_no_completion.load(Ordering::Relaxed)
    }

    pub fn workflows_completed(&self) -> u64 {
        self.workflows_completed.load(Ordering::Relaxed)
    }

    pub fn workflows_failed(&self) -> u64 {
        self.workflows_failed.load(Ordering::Relaxed)
    }

    pub fn workflows_canceled(&self) -> u64 {
        self.workflows_canceled.load(Ordering::Relaxed)
    }

    pub fn workflows_continued_as_new(&self) -> u64 {
        self.workflows_continued_as_new.load(Ordering::Relaxed)
    }

    pub fn local_activities_resolved(&self) -> u64 {
        self.local_activities_resolved.load(Ordering::Relaxed)
    }

    pub fn history_pages_fetched(&self) -> u64 {
        self.history_pages_fetched.load(Ordering::Relaxed)
    }
}

/// What one workflow task produced
#[derive(Debug)]
pub struct WorkflowTaskResult {
    /// Commands to send, in the order their machines were created
    pub commands: Vec<Command>,

    /// Per-query outcomes
    pub query_results: HashMap<String, QueryResult>,

    /// Ask the service to issue a fresh workflow task immediately (the
    /// local-activity heartbeat)
    pub force_create_new_workflow_task: bool,

    /// The command list closes the workflow
    pub final_command: bool,
}

/// Errors surfaced to the caller of the executor
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Non-determinism or a state machine violation; the task should be
    /// retried by the service
    #[error("workflow task failed: {0}")]
    Machine(#[from] MachineError),

    /// History pagination failed or ran out of deadline
    #[error(transparent)]
    History(#[from] HistoryError),

    /// The deterministic clock was driven backwards
    #[error("workflow task failed: {0}")]
    Clock(#[from] ClockError),

    /// The program broke in a way the author did not model, under the
    /// fail-task policy
    #[error("workflow task failed: {0}")]
    Program(String),

    /// A direct query could not be answered
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// The executor was closed
    #[error("executor is closed")]
    Closed,
}

/// Errors internal to one task's batch processing, mapped per the error
/// policy before leaving the executor
#[derive(Debug)]
enum TaskError {
    Machine(MachineError),
    Clock(ClockError),
    History(HistoryError),
    Program(String),
}

impl From<MachineError> for TaskError {
    fn from(err: MachineError) -> Self {
        Self::Machine(err)
    }
}

impl From<ClockError> for TaskError {
    fn from(err: ClockError) -> Self {
        Self::Clock(err)
    }
}

struct ExecutorInner<P> {
    program: P,
    ctx: WorkflowContext,
    bookkeeper: CommandBookkeeper,
    clock: ReplayClock,
    local_activities: LocalActivityRunner,
    started: bool,
    cancel_requested: bool,
    workflow_finished: bool,
    closed: bool,
}

/// Drives one workflow run through server-supplied history
pub struct ReplayExecutor<P: WorkflowProgram> {
    inner: Mutex<ExecutorInner<P>>,
    fetcher: Arc<dyn HistoryFetcher>,
    completion_sink: LocalActivityCompletionSink,
    metrics: Arc<ExecutorMetrics>,
    config: ExecutorConfig,
    shutdown: CancellationToken,
    run_id: String,
}

impl<P: WorkflowProgram> ReplayExecutor<P> {
    pub fn new(
        run_id: impl Into<String>,
        program: P,
        fetcher: Arc<dyn HistoryFetcher>,
        dispatcher: Arc<dyn LocalActivityDispatcher>,
        config: ExecutorConfig,
    ) -> Self {
        let local_activities = LocalActivityRunner::new(dispatcher);
        let completion_sink = local_activities.sink();
        Self {
            inner: Mutex::new(ExecutorInner {
                program,
                ctx: WorkflowContext::new(),
                bookkeeper: CommandBookkeeper::new(),
                clock: ReplayClock::new(),
                local_activities,
                started: false,
                cancel_requested: false,
                workflow_finished: false,
                closed: false,
            }),
            fetcher,
            completion_sink,
            metrics: Arc::new(ExecutorMetrics::default()),
            config,
            shutdown: CancellationToken::new(),
            run_id: run_id.into(),
        }
    }

    pub fn metrics(&self) -> Arc<ExecutorMetrics> {
        self.metrics.clone()
    }

    /// Sink the local activity worker delivers finished attempts through
    ///
    /// Completions are buffered and dispatched under the executor mutex at
    /// the next local-activity phase.
    pub fn local_activity_completion_sink(&self) -> LocalActivityCompletionSink {
        self.completion_sink.clone()
    }

    /// Decide one workflow task end to end
    #[instrument(skip(self, task), fields(run_id = %self.run_id))]
    pub async fn handle_workflow_task(
        &self,
        task: WorkflowTask,
    ) -> Result<WorkflowTaskResult, ExecutorError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(ExecutorError::Closed);
        }

        let task_started_at = Instant::now();
        let mut force_new_task = false;

        match self
            .process_task_history(&mut inner, &task, task_started_at, &mut force_new_task)
            .await
        {
            Ok(()) => {}
            Err(err) => match self.apply_error_policy(&mut inner, err)? {
                // Mapped to a fail-workflow command; fall through and respond.
                PolicyOutcome::FailedWorkflow => force_new_task = false,
            },
        }

        let mut query_results = HashMap::new();
        if !inner.workflow_finished {
            for (query_id, query) in &task.queries {
                query_results.insert(query_id.clone(), Self::run_query(&mut inner, query));
            }
            if let Some(query) = &task.legacy_query {
                query_results.insert(
                    LEGACY_QUERY_RESULT_KEY.to_string(),
                    Self::run_query(&mut inner, query),
                );
            }
        }

        let commands = inner.bookkeeper.collect_commands();
        // The response is the history boundary for the live task's machines.
        inner.bookkeeper.notify_command_sent();

        let final_command = inner.workflow_finished;
        if final_command {
            force_new_task = false;
            Self::close_inner(&mut inner);
        }

        info!(
            commands = commands.len(),
            queries = query_results.len(),
            force_new_task,
            final_command,
            "workflow task decided"
        );

        Ok(WorkflowTaskResult {
            commands,
            query_results,
            force_create_new_workflow_task: force_new_task,
            final_command,
        })
    }

    /// Answer a direct query against post-replay state
    #[instrument(skip(self, task, query), fields(run_id = %self.run_id, query_type = %query.query_type))]
    pub async fn handle_query_workflow_task(
        &self,
        task: WorkflowTask,
        query: WorkflowQuery,
    ) -> Result<Option<serde_json::Value>, ExecutorError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(ExecutorError::Closed);
        }

        let task_started_at = Instant::now();
        let mut force_new_task = false;
        if let Err(err) = self
            .process_task_history(&mut inner, &task, task_started_at, &mut force_new_task)
            .await
        {
            self.apply_error_policy(&mut inner, err)?;
        }

        match Self::run_query(&mut inner, &query) {
            QueryResult::Answered { payload } => Ok(payload),
            QueryResult::Failed { message, .. } => Err(ExecutorError::QueryFailed(message)),
        }
    }

    /// Release the cached run
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        Self::close_inner(&mut inner);
        self.shutdown.cancel();
    }

    fn close_inner(inner: &mut ExecutorInner<P>) {
        if !inner.closed {
            inner.closed = true;
            inner.program.close();
        }
    }

    async fn process_task_history(
        &self,
        inner: &mut ExecutorInner<P>,
        task: &WorkflowTask,
        task_started_at: Instant,
        force_new_task: &mut bool,
    ) -> Result<(), TaskError> {
        let pagination_policy = RetryPolicy::new(self.config.pagination_initial_backoff)
            .with_maximum_interval(self.config.pagination_max_backoff);
        let mut iterator = HistoryIterator::new(task, self.fetcher.clone(), pagination_policy);

        loop {
            let batch = match iterator.next_task_batch().await {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(err) => return Err(TaskError::History(err)),
            };
            self.process_batch(inner, &batch, task_started_at, task, force_new_task)
                .await?;
            if inner.workflow_finished {
                break;
            }
        }

        self.metrics
            .history_pages_fetched
            .fetch_add(iterator.pages_fetched() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn process_batch(
        &self,
        inner: &mut ExecutorInner<P>,
        batch: &WorkflowTaskEvents,
        task_started_at: Instant,
        task: &WorkflowTask,
        force_new_task: &mut bool,
    ) -> Result<(), TaskError> {
        debug!(
            previous_started = batch.previous_started_event_id,
            current_started = batch.current_started_event_id,
            replay = batch.replay,
            events = batch.events.len(),
            command_events = batch.command_events.len(),
            "processing workflow task batch"
        );

        // (a) replay discrimination and clock
        inner.clock.set_replaying(batch.replay);
        if batch.replay {
            inner.clock.advance_to(batch.replay_time_ms);
        } else {
            inner.clock.advance_to_wall_clock();
        }
        inner.ctx.set_replaying(batch.replay);
        inner.ctx.set_current_time_ms(inner.clock.now_ms());

        // (b) boundary bookkeeping, including the non-determinism check
        inner.bookkeeper.handle_workflow_task_started(
            batch.previous_started_event_id,
            batch.current_started_event_id,
        )?;

        // (c) markers first, then ordinary events in history order
        for marker in &batch.markers {
            Self::dispatch_marker(inner, marker);
        }
        for event in &batch.events {
            if batch.replay {
                inner.clock.advance_to(event.timestamp_ms());
                inner.ctx.set_current_time_ms(inner.clock.now_ms());
            }
            Self::process_event(inner, event)?;
        }

        // (d) drive the program until it blocks
        self.run_event_loop(inner)?;

        // (e) local activities
        if batch.replay {
            self.replay_local_activities(inner, batch)?;
        } else if self
            .run_local_activities_live(inner, task_started_at, task.workflow_task_timeout)
            .await?
        {
            *force_new_task = true;
        }

        // (f) completion or wake-up reconciliation
        if !inner.workflow_finished {
            Self::reconcile_wake_timer(inner)?;
        }

        // (g) replayed commands are already receipts in history
        if batch.replay {
            inner.bookkeeper.notify_command_sent();
        }

        // (h) advance machines from this task's receipts
        for event in &batch.command_events {
            Self::process_command_event(inner, event)?;
        }

        // (i) reset per-batch transient state
        inner
            .bookkeeper
            .renotify_started(batch.current_started_event_id);

        Ok(())
    }

    /// Event dispatch for ordinary (non-receipt) events
    fn process_event(inner: &mut ExecutorInner<P>, event: &HistoryEvent) -> Result<(), TaskError> {
        use EventAttributes::*;
        match &event.attributes {
            WorkflowExecutionStarted { input, .. } => {
                if !inner.started {
                    inner.started = true;
                    let ExecutorInner { program, ctx, .. } = &mut *inner;
                    program.start(input.as_ref(), ctx);
                }
            }

            WorkflowExecutionSignaled {
                signal_name,
                payload,
            } => {
                let ExecutorInner { program, ctx, .. } = &mut *inner;
                program.handle_signal(ctx, signal_name, payload.clone(), event.event_id);
            }

            WorkflowExecutionCancelRequested { reason } => {
                inner.cancel_requested = true;
                inner.ctx.set_cancel_requested();
                let reason = reason.clone().unwrap_or_default();
                let ExecutorInner { program, ctx, .. } = &mut *inner;
                program.cancel(ctx, &reason);
            }

            // Boundary structure was consumed by the iterator; stragglers at
            // the head of a sticky page carry no new information.
            WorkflowTaskScheduled
            | WorkflowTaskStarted
            | WorkflowTaskCompleted { .. }
            | WorkflowTaskFailed { .. }
            | WorkflowTaskTimedOut { .. } => {}

            // Terminal history events; the machines already produced the
            // matching terminal command when this run was live.
            WorkflowExecutionCompleted { .. }
            | WorkflowExecutionFailed { .. }
            | WorkflowExecutionCanceled
            | WorkflowExecutionTimedOut
            | WorkflowExecutionContinuedAsNew { .. }
            | WorkflowExecutionTerminated { .. } => {}

            ActivityTaskStarted {
                scheduled_event_id, ..
            } => {
                inner
                    .bookkeeper
                    .machine_mut(CommandTarget::Activity, *scheduled_event_id)?
                    .handle_started_event()?;
            }

            ActivityTaskCompleted {
                scheduled_event_id,
                result,
            } => {
                let machine = inner
                    .bookkeeper
                    .machine_mut(CommandTarget::Activity, *scheduled_event_id)?;
                machine.handle_completion_event()?;
                let activity_id = machine.user_id().to_string();
                inner.ctx.push_resolution(Resolution::ActivityCompleted {
                    activity_id,
                    result: result.clone(),
                });
            }

            ActivityTaskFailed {
                scheduled_event_id,
                failure,
            } => {
                let machine = inner
                    .bookkeeper
                    .machine_mut(CommandTarget::Activity, *scheduled_event_id)?;
                machine.handle_completion_event()?;
                let activity_id = machine.user_id().to_string();
                inner.ctx.push_resolution(Resolution::ActivityFailed {
                    activity_id,
                    failure: failure.clone(),
                });
            }

            ActivityTaskTimedOut {
                scheduled_event_id,
                timeout_type,
            } => {
                let machine = inner
                    .bookkeeper
                    .machine_mut(CommandTarget::Activity, *scheduled_event_id)?;
                machine.handle_completion_event()?;
                let activity_id = machine.user_id().to_string();
                inner.ctx.push_resolution(Resolution::ActivityTimedOut {
                    activity_id,
                    timeout_type: *timeout_type,
                });
            }

            ActivityTaskCancelRequested { scheduled_event_id } => {
                inner
                    .bookkeeper
                    .machine_mut(CommandTarget::Activity, *scheduled_event_id)?
                    .handle_cancellation_initiated_event()?;
            }

            ActivityTaskCanceled { scheduled_event_id } => {
                let machine = inner
                    .bookkeeper
                    .machine_mut(CommandTarget::Activity, *scheduled_event_id)?;
                machine.handle_cancellation_event()?;
                let activity_id = machine.user_id().to_string();
                inner
                    .ctx
                    .push_resolution(Resolution::ActivityCanceled { activity_id });
            }

            TimerFired {
                started_event_id,
                timer_id,
            } => {
                let machine = inner
                    .bookkeeper
                    .machine_mut(CommandTarget::Timer, *started_event_id)?;
                machine.handle_completion_event()?;
                if ReplayClock::is_wake_timer(timer_id) {
                    // Wake-up timers exist only to force a workflow task.
                    inner.clock.clear_wake(timer_id);
                } else {
                    inner.ctx.push_resolution(Resolution::TimerFired {
                        timer_id: timer_id.clone(),
                    });
                }
            }

            TimerCanceled {
                started_event_id,
                timer_id,
            } => {
                inner
                    .bookkeeper
                    .machine_mut(CommandTarget::Timer, *started_event_id)?
                    .handle_cancellation_event()?;
                if !ReplayClock::is_wake_timer(timer_id) {
                    inner.ctx.push_resolution(Resolution::TimerCanceled {
                        timer_id: timer_id.clone(),
                    });
                }
            }

            StartChildWorkflowExecutionFailed {
                initiated_event_id,
                workflow_id,
                cause,
            } => {
                inner
                    .bookkeeper
                    .machine_mut(CommandTarget::ChildWorkflow, *initiated_event_id)?
                    .handle_initiation_failed_event()?;
                inner
                    .ctx
                    .push_resolution(Resolution::ChildWorkflowStartFailed {
                        workflow_id: workflow_id.clone(),
                        cause: cause.clone(),
                    });
            }

            ChildWorkflowExecutionStarted {
                initiated_event_id,
                workflow_id,
                run_id,
            } => {
                inner
                    .bookkeeper
                    .machine_mut(CommandTarget::ChildWorkflow, *initiated_event_id)?
                    .handle_started_event()?;
                inner.ctx.push_resolution(Resolution::ChildWorkflowStarted {
                    workflow_id: workflow_id.clone(),
                    run_id: run_id.clone(),
                });
            }

            ChildWorkflowExecutionCompleted {
                initiated_event_id,
                result,
            } => {
                let machine = inner
                    .bookkeeper
                    .machine_mut(CommandTarget::ChildWorkflow, *initiated_event_id)?;
                machine.handle_completion_event()?;
                let workflow_id = machine.user_id().to_string();
                inner
                    .ctx
                    .push_resolution(Resolution::ChildWorkflowCompleted {
                        workflow_id,
                        result: result.clone(),
                    });
            }

            ChildWorkflowExecutionFailed {
                initiated_event_id,
                failure,
            } => {
                let machine = inner
                    .bookkeeper
                    .machine_mut(CommandTarget::ChildWorkflow, *initiated_event_id)?;
                machine.handle_completion_event()?;
                let workflow_id = machine.user_id().to_string();
                inner.ctx.push_resolution(Resolution::ChildWorkflowFailed {
                    workflow_id,
                    failure: failure.clone(),
                });
            }

            ChildWorkflowExecutionTimedOut {
                initiated_event_id,
                timeout_type,
            } => {
                let machine = inner
                    .bookkeeper
                    .machine_mut(CommandTarget::ChildWorkflow, *initiated_event_id)?;
                machine.handle_completion_event()?;
                let workflow_id = machine.user_id().to_string();
                inner
                    .ctx
                    .push_resolution(Resolution::ChildWorkflowTimedOut {
                        workflow_id,
                        timeout_type: *timeout_type,
                    });
            }

            ChildWorkflowExecutionCanceled { initiated_event_id } => {
                let machine = inner
                    .bookkeeper
                    .machine_mut(CommandTarget::ChildWorkflow, *initiated_event_id)?;
                machine.handle_completion_event()?;
                let workflow_id = machine.user_id().to_string();
                inner
                    .ctx
                    .push_resolution(Resolution::ChildWorkflowCanceled { workflow_id });
            }

            ChildWorkflowExecutionTerminated { initiated_event_id } => {
                let machine = inner
                    .bookkeeper
                    .machine_mut(CommandTarget::ChildWorkflow, *initiated_event_id)?;
                machine.handle_completion_event()?;
                let workflow_id = machine.user_id().to_string();
                inner
                    .ctx
                    .push_resolution(Resolution::ChildWorkflowTerminated { workflow_id });
            }

            SignalExternalWorkflowExecutionFailed {
                initiated_event_id,
                cause,
            } => {
                let machine = inner
                    .bookkeeper
                    .machine_mut(CommandTarget::Signal, *initiated_event_id)?;
                machine.handle_initiation_failed_event()?;
                let signal_id = machine.user_id().to_string();
                inner.ctx.push_resolution(Resolution::ExternalSignalFailed {
                    signal_id,
                    cause: cause.clone(),
                });
            }

            ExternalWorkflowExecutionSignaled { initiated_event_id } => {
                let machine = inner
                    .bookkeeper
                    .machine_mut(CommandTarget::Signal, *initiated_event_id)?;
                machine.handle_completion_event()?;
                let signal_id = machine.user_id().to_string();
                inner
                    .ctx
                    .push_resolution(Resolution::ExternalSignalDelivered { signal_id });
            }

            RequestCancelExternalWorkflowExecutionFailed {
                initiated_event_id,
                cause,
            } => {
                let machine = inner
                    .bookkeeper
                    .machine_mut(CommandTarget::CancelExternal, *initiated_event_id)?;
                match machine.payload() {
                    // Cancel request we issued for a child we are canceling.
                    MachinePayload::ChildWorkflow { .. } => {
                        machine.handle_cancellation_failure_event()?;
                    }
                    _ => {
                        machine.handle_initiation_failed_event()?;
                        let cancel_id = machine.user_id().to_string();
                        inner.ctx.push_resolution(Resolution::ExternalCancelFailed {
                            cancel_id,
                            cause: cause.clone(),
                        });
                    }
                }
            }

            ExternalWorkflowExecutionCancelRequested { initiated_event_id } => {
                let machine = inner
                    .bookkeeper
                    .machine_mut(CommandTarget::CancelExternal, *initiated_event_id)?;
                match machine.payload() {
                    MachinePayload::ChildWorkflow { .. } => {
                        machine.handle_cancellation_initiated_event()?;
                    }
                    _ => {
                        machine.handle_completion_event()?;
                        let cancel_id = machine.user_id().to_string();
                        inner
                            .ctx
                            .push_resolution(Resolution::ExternalCancelDelivered { cancel_id });
                    }
                }
            }

            // Receipts reaching us as ordinary events (head of a sticky page)
            // still advance their machines.
            ActivityTaskScheduled { .. }
            | TimerStarted { .. }
            | StartChildWorkflowExecutionInitiated { .. }
            | SignalExternalWorkflowExecutionInitiated { .. }
            | RequestCancelExternalWorkflowExecutionInitiated { .. }
            | UpsertWorkflowSearchAttributes { .. }
            | MarkerRecorded { .. } => {
                Self::process_command_event(inner, event)?;
            }
        }
        Ok(())
    }

    /// Receipt dispatch: advance the machine the command event materializes
    fn process_command_event(
        inner: &mut ExecutorInner<P>,
        event: &HistoryEvent,
    ) -> Result<(), TaskError> {
        inner.bookkeeper.handle_command_event(event)?;
        Ok(())
    }

    /// Marker dispatch ahead of ordinary events
    fn dispatch_marker(inner: &mut ExecutorInner<P>, event: &HistoryEvent) {
        if let EventAttributes::MarkerRecorded {
            marker_name,
            details,
        } = &event.attributes
        {
            // Local activity markers feed the replay phase instead.
            if marker_name != LOCAL_ACTIVITY_MARKER_NAME {
                inner.ctx.push_resolution(Resolution::MarkerRecorded {
                    marker_name: marker_name.clone(),
                    details: details.clone(),
                });
            }
        }
    }

    /// Run the program event loop, drain its commands, and settle completion
    fn run_event_loop(&self, inner: &mut ExecutorInner<P>) -> Result<(), TaskError> {
        // Immediate cancellations resolve without a server round-trip, so the
        // loop runs again while command draining keeps unblocking the program.
        for _ in 0..MAX_EVENT_LOOP_PASSES {
            let completed = {
                let ExecutorInner { program, ctx, .. } = &mut *inner;
                match program.event_loop(ctx) {
                    Ok(completed) => completed,
                    Err(ProgramError::Failed(failure)) => {
                        self.drain_program_commands(inner)?;
                        self.finish_with(inner, Command::FailWorkflowExecution { failure });
                        return Ok(());
                    }
                    Err(ProgramError::Canceled(reason)) => {
                        self.drain_program_commands(inner)?;
                        if inner.cancel_requested {
                            self.finish_with(inner, Command::CancelWorkflowExecution);
                        } else {
                            self.finish_with(
                                inner,
                                Command::FailWorkflowExecution {
                                    failure: WorkflowFailure::new(format!(
                                        "workflow canceled without a cancellation request: {reason}"
                                    )),
                                },
                            );
                        }
                        return Ok(());
                    }
                    Err(ProgramError::Unexpected(err)) => {
                        match inner.program.options().error_policy {
                            WorkflowErrorPolicy::FailWorkflow => {
                                error!("mapping unexpected workflow error to failure: {err:#}");
                                self.drain_program_commands(inner)?;
                                self.finish_with(
                                    inner,
                                    Command::FailWorkflowExecution {
                                        failure: WorkflowFailure::new(format!("{err:#}")),
                                    },
                                );
                                return Ok(());
                            }
                            WorkflowErrorPolicy::FailWorkflowTask => {
                                return Err(TaskError::Program(format!("{err:#}")));
                            }
                        }
                    }
                }
            };

            let unblocked = self.drain_program_commands(inner)?;

            if completed && !inner.workflow_finished {
                if inner.cancel_requested {
                    self.finish_with(inner, Command::CancelWorkflowExecution);
                } else {
                    let result = inner.program.output();
                    self.finish_with(inner, Command::CompleteWorkflowExecution { result });
                }
            }
            if inner.workflow_finished || !unblocked {
                return Ok(());
            }
        }
        warn!("event loop did not quiesce; leaving remaining work for the next task");
        Ok(())
    }

    /// Turn program commands into state machines; returns whether any
    /// resolution was delivered back (the program may be unblocked again)
    fn drain_program_commands(&self, inner: &mut ExecutorInner<P>) -> Result<bool, TaskError> {
        let mut unblocked = false;
        for command in inner.ctx.drain_commands() {
            match command {
                ProgramCommand::StartTimer(attributes) => {
                    inner.bookkeeper.new_timer(attributes);
                }
                ProgramCommand::CancelTimer { timer_id } => {
                    if inner.bookkeeper.cancel(CommandTarget::Timer, &timer_id)? {
                        inner
                            .ctx
                            .push_resolution(Resolution::TimerCanceled { timer_id });
                        unblocked = true;
                    }
                }
                ProgramCommand::ScheduleActivity(attributes) => {
                    inner.bookkeeper.new_activity(attributes);
                }
                ProgramCommand::RequestCancelActivity { activity_id } => {
                    if inner
                        .bookkeeper
                        .cancel(CommandTarget::Activity, &activity_id)?
                    {
                        inner
                            .ctx
                            .push_resolution(Resolution::ActivityCanceled { activity_id });
                        unblocked = true;
                    }
                }
                ProgramCommand::StartChildWorkflow(attributes) => {
                    inner.bookkeeper.new_child_workflow(attributes);
                }
                ProgramCommand::RequestCancelChildWorkflow { workflow_id } => {
                    if inner
                        .bookkeeper
                        .cancel(CommandTarget::ChildWorkflow, &workflow_id)?
                    {
                        inner
                            .ctx
                            .push_resolution(Resolution::ChildWorkflowCanceled { workflow_id });
                        unblocked = true;
                    }
                }
                ProgramCommand::SignalExternalWorkflow(attributes) => {
                    inner.bookkeeper.new_signal(attributes);
                }
                ProgramCommand::CancelSignalDelivery { signal_id } => {
                    if inner.bookkeeper.cancel(CommandTarget::Signal, &signal_id)? {
                        inner.ctx.push_resolution(Resolution::ExternalSignalFailed {
                            signal_id,
                            cause: "signal delivery canceled".to_string(),
                        });
                        unblocked = true;
                    }
                }
                ProgramCommand::RequestCancelExternalWorkflow(attributes) => {
                    inner.bookkeeper.new_cancel_external(attributes);
                }
                ProgramCommand::RecordMarker {
                    marker_name,
                    details,
                } => {
                    inner.bookkeeper.new_marker(RecordMarkerAttributes {
                        marker_name,
                        details,
                    });
                }
                ProgramCommand::UpsertSearchAttributes { attributes } => {
                    inner.bookkeeper.new_upsert_search_attributes(attributes);
                }
                ProgramCommand::CompleteWorkflow { result } => {
                    self.finish_with(inner, Command::CompleteWorkflowExecution { result });
                }
                ProgramCommand::FailWorkflow { failure } => {
                    self.finish_with(inner, Command::FailWorkflowExecution { failure });
                }
                ProgramCommand::CancelWorkflow => {
                    self.finish_with(inner, Command::CancelWorkflowExecution);
                }
                ProgramCommand::ContinueAsNew(attributes) => {
                    self.finish_with(
                        inner,
                        Command::ContinueAsNewWorkflowExecution(attributes),
                    );
                }
            }
        }
        Ok(unblocked)
    }

    /// Emit the terminal command once
    fn finish_with(&self, inner: &mut ExecutorInner<P>, command: Command) {
        if inner.workflow_finished {
            return;
        }
        match &command {
            Command::CompleteWorkflowExecution { .. } => {
                self.metrics.workflows_completed.fetch_add(1, Ordering::Relaxed);
            }
            Command::FailWorkflowExecution { .. } => {
                self.metrics.workflows_failed.fetch_add(1, Ordering::Relaxed);
            }
            Command::CancelWorkflowExecution => {
                self.metrics.workflows_canceled.fetch_add(1, Ordering::Relaxed);
            }
            Command::ContinueAsNewWorkflowExecution(_) => {
                self.metrics
                    .workflows_continued_as_new
                    .fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        inner.bookkeeper.new_self_command(command);
        inner.workflow_finished = true;
    }

    /// Keep exactly one wake timer aligned with the program's next wake-up
    fn reconcile_wake_timer(inner: &mut ExecutorInner<P>) -> Result<(), TaskError> {
        let next_wake_up = inner.program.next_wake_up_time();

        if let Some(stale_timer_id) = inner.clock.take_stale_wake(next_wake_up) {
            match inner.bookkeeper.cancel(CommandTarget::Timer, &stale_timer_id) {
                Ok(_) => {}
                // Already pruned or never commanded; nothing to cancel.
                Err(MachineError::UnknownUserId { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }

        if next_wake_up != 0 && inner.clock.active_wake_at_ms() != Some(next_wake_up) {
            let (timer_id, delay) = inner.clock.register_wake(next_wake_up)?;
            debug!(%timer_id, delay_ms = delay.as_millis() as u64, "scheduling wake-up timer");
            inner
                .bookkeeper
                .new_timer(StartTimerAttributes { timer_id, delay });
        }
        Ok(())
    }

    /// Replay-mode local activities: resolve from recorded markers, cascading
    fn replay_local_activities(
        &self,
        inner: &mut ExecutorInner<P>,
        batch: &WorkflowTaskEvents,
    ) -> Result<(), TaskError> {
        let mut available: Vec<LocalActivityMarker> = batch
            .markers
            .iter()
            .filter_map(|event| match &event.attributes {
                EventAttributes::MarkerRecorded {
                    marker_name,
                    details: Some(details),
                } if marker_name == LOCAL_ACTIVITY_MARKER_NAME => {
                    LocalActivityMarker::from_details(details).ok()
                }
                _ => None,
            })
            .collect();

        loop {
            let requests = inner.ctx.drain_local_activities();
            inner.local_activities.enqueue(requests);

            let resolved = inner.local_activities.take_matching_markers(&mut available);
            if resolved.is_empty() {
                return Ok(());
            }
            for marker in resolved {
                self.record_local_activity_marker(inner, marker);
            }
            self.run_event_loop(inner)?;
            if inner.workflow_finished {
                return Ok(());
            }
        }
    }

    /// Live-mode local activities under the task budget
    ///
    /// Returns true when the service should issue a fresh workflow task
    /// immediately so in-flight activities keep their run alive.
    async fn run_local_activities_live(
        &self,
        inner: &mut ExecutorInner<P>,
        task_started_at: Instant,
        task_timeout: Duration,
    ) -> Result<bool, TaskError> {
        let budget = task_timeout.mul_f64(self.config.local_activity_budget_fraction);

        loop {
            let requests = inner.ctx.drain_local_activities();
            inner.local_activities.enqueue(requests);

            // Completions that arrived since the previous task.
            let mut progressed = false;
            while let Some(completion) = inner.local_activities.poll_completion() {
                progressed |= self
                    .apply_local_activity_completion(inner, completion, task_started_at, budget)
                    .await?;
            }
            if progressed {
                self.run_event_loop(inner)?;
                if inner.workflow_finished {
                    return Ok(false);
                }
                continue;
            }

            while let Some(activity_id) = inner.local_activities.next_unstarted() {
                if task_started_at.elapsed() >= budget {
                    return Ok(true);
                }
                inner.local_activities.dispatch(&activity_id);
            }

            if inner.local_activities.in_flight() == 0 {
                // Deferred retries keep the run alive through a heartbeat.
                return Ok(inner.local_activities.pending_count() > 0);
            }

            let max_wait = budget.saturating_sub(task_started_at.elapsed());
            if max_wait.is_zero() {
                return Ok(true);
            }
            match inner
                .local_activities
                .await_completion(max_wait, &self.shutdown)
                .await
            {
                WaitOutcome::TimedOut | WaitOutcome::Interrupted => return Ok(true),
                WaitOutcome::Completion(completion) => {
                    if self
                        .apply_local_activity_completion(inner, completion, task_started_at, budget)
                        .await?
                    {
                        self.run_event_loop(inner)?;
                        if inner.workflow_finished {
                            return Ok(false);
                        }
                    }
                }
            }
        }
    }

    /// Returns true when the completion resolved an activity
    async fn apply_local_activity_completion(
        &self,
        inner: &mut ExecutorInner<P>,
        completion: crate::local_activity::LocalActivityCompletion,
        task_started_at: Instant,
        budget: Duration,
    ) -> Result<bool, TaskError> {
        match inner.local_activities.handle_completion(completion) {
            CompletionDisposition::Stale => Ok(false),
            CompletionDisposition::Retry { activity_id, delay } => {
                if task_started_at.elapsed() + delay >= budget {
                    // Backoff crosses the task boundary; the heartbeat task
                    // picks the attempt back up.
                    debug!(%activity_id, "deferring local activity retry past the task budget");
                    Ok(false)
                } else {
                    tokio::time::sleep(delay).await;
                    inner.local_activities.dispatch(&activity_id);
                    Ok(false)
                }
            }
            CompletionDisposition::Resolved(marker) => {
                self.record_local_activity_marker(inner, marker);
                Ok(true)
            }
        }
    }

    fn record_local_activity_marker(
        &self,
        inner: &mut ExecutorInner<P>,
        marker: LocalActivityMarker,
    ) {
        self.metrics
            .local_activities_resolved
            .fetch_add(1, Ordering::Relaxed);
        inner.bookkeeper.new_marker(RecordMarkerAttributes {
            marker_name: LOCAL_ACTIVITY_MARKER_NAME.to_string(),
            details: Some(marker.details()),
        });
        inner.ctx.push_resolution(Resolution::LocalActivityResolved {
            activity_id: marker.activity_id.clone(),
            result: marker.resolution_result(),
        });
    }

    fn run_query(inner: &mut ExecutorInner<P>, query: &WorkflowQuery) -> QueryResult {
        match inner
            .program
            .query(&query.query_type, query.args.as_ref())
        {
            Ok(payload) => QueryResult::Answered { payload },
            Err(failure) => QueryResult::Failed {
                message: failure.message.clone(),
                details: failure.details.clone(),
            },
        }
    }

    /// Map a batch-processing error per the workflow error policy
    fn apply_error_policy(
        &self,
        inner: &mut ExecutorInner<P>,
        err: TaskError,
    ) -> Result<PolicyOutcome, ExecutorError> {
        let policy = inner.program.options().error_policy;
        match err {
            TaskError::Machine(machine_err) => match policy {
                WorkflowErrorPolicy::FailWorkflow => {
                    error!("failing workflow on state machine violation: {machine_err}");
                    self.finish_with(
                        inner,
                        Command::FailWorkflowExecution {
                            failure: WorkflowFailure::new(machine_err.to_string())
                                .with_type("non_determinism"),
                        },
                    );
                    Ok(PolicyOutcome::FailedWorkflow)
                }
                WorkflowErrorPolicy::FailWorkflowTask => {
                    self.metrics
                        .workflow_task_no_completion
                        .fetch_add(1, Ordering::Relaxed);
                    Err(ExecutorError::Machine(machine_err))
                }
            },
            TaskError::Clock(clock_err) => match policy {
                WorkflowErrorPolicy::FailWorkflow => {
                    self.finish_with(
                        inner,
                        Command::FailWorkflowExecution {
                            failure: WorkflowFailure::new(clock_err.to_string()),
                        },
                    );
                    Ok(PolicyOutcome::FailedWorkflow)
                }
                WorkflowErrorPolicy::FailWorkflowTask => {
                    self.metrics
                        .workflow_task_no_completion
                        .fetch_add(1, Ordering::Relaxed);
                    Err(ExecutorError::Clock(clock_err))
                }
            },
            // Pagination problems are never the workflow's fault; the caller
            // retries the task regardless of policy.
            TaskError::History(history_err) => Err(ExecutorError::History(history_err)),
            TaskError::Program(message) => {
                self.metrics
                    .workflow_task_no_completion
                    .fetch_add(1, Ordering::Relaxed);
                Err(ExecutorError::Program(message))
            }
        }
    }
}

enum PolicyOutcome {
    FailedWorkflow,
}

const MAX_EVENT_LOOP_PASSES: usize = 64;
