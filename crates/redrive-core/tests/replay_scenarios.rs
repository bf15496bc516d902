//! End-to-end replay scenarios driving the executor through crafted
//! histories, the way a worker would between poll responses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;

use redrive_core::clock::WAKE_TIMER_ID_PREFIX;
use redrive_core::command::{Command, ScheduleActivityAttributes, StartTimerAttributes};
use redrive_core::executor::{ExecutorConfig, ExecutorError, ReplayExecutor};
use redrive_core::history::{
    EventAttributes, FetchError, HistoryEvent, HistoryFetcher, HistoryPage, WorkflowTask,
};
use redrive_core::local_activity::{
    LocalActivityCompletion, LocalActivityCompletionSink, LocalActivityDispatcher,
    LocalActivityRequest, LocalActivityTask,
};
use redrive_core::machines::MachineError;
use redrive_core::program::{
    ProgramError, ProgramOptions, QueryResult, Resolution, WorkflowContext, WorkflowErrorPolicy,
    WorkflowProgram, WorkflowQuery,
};
use redrive_core::retry::RetryPolicy;

const BASE_TIME_MS: i64 = 1_700_000_000_000;

fn event(event_id: i64, attributes: EventAttributes) -> HistoryEvent {
    let timestamp = Utc.timestamp_millis_opt(BASE_TIME_MS + event_id * 1000).unwrap();
    HistoryEvent::new(event_id, timestamp, attributes)
}

fn workflow_started(event_id: i64) -> HistoryEvent {
    event(
        event_id,
        EventAttributes::WorkflowExecutionStarted {
            workflow_type: "test_workflow".to_string(),
            input: None,
            original_run_id: "run-1".to_string(),
        },
    )
}

fn poll(history: Vec<HistoryEvent>, previous_started: i64, started: i64) -> WorkflowTask {
    WorkflowTask {
        workflow_id: "wf-1".to_string(),
        run_id: "run-1".to_string(),
        history,
        next_page_token: None,
        previous_started_event_id: previous_started,
        started_event_id: started,
        workflow_task_timeout: Duration::from_secs(10),
        queries: HashMap::new(),
        legacy_query: None,
    }
}

struct NoPages;

#[async_trait]
impl HistoryFetcher for NoPages {
    async fn fetch_page(&self, _run_id: &str, _token: Vec<u8>) -> Result<HistoryPage, FetchError> {
        panic!("no pagination expected in this scenario");
    }
}

struct NullDispatcher;

impl LocalActivityDispatcher for NullDispatcher {
    fn dispatch(&self, _task: LocalActivityTask, _sink: LocalActivityCompletionSink) {}
}

fn executor<P: WorkflowProgram>(program: P) -> ReplayExecutor<P> {
    ReplayExecutor::new(
        "run-1",
        program,
        Arc::new(NoPages),
        Arc::new(NullDispatcher),
        ExecutorConfig::default(),
    )
}

// =============================================================================
// Timer fire
// =============================================================================

/// Sleeps five seconds via an explicit timer, then completes.
#[derive(Default)]
struct SleepProgram {
    error_policy: WorkflowErrorPolicy,
    done: bool,
}

impl WorkflowProgram for SleepProgram {
    fn start(&mut self, _input: Option<&serde_json::Value>, ctx: &mut WorkflowContext) {
        ctx.start_timer("t1", Duration::from_secs(5));
    }

    fn event_loop(&mut self, ctx: &mut WorkflowContext) -> Result<bool, ProgramError> {
        while let Some(resolution) = ctx.poll_resolution() {
            if let Resolution::TimerFired { timer_id } = resolution {
                if timer_id == "t1" {
                    self.done = true;
                }
            }
        }
        Ok(self.done)
    }

    fn handle_signal(
        &mut self,
        _ctx: &mut WorkflowContext,
        _name: &str,
        _payload: Option<serde_json::Value>,
        _event_id: i64,
    ) {
    }

    fn cancel(&mut self, _ctx: &mut WorkflowContext, _reason: &str) {}

    fn next_wake_up_time(&self) -> i64 {
        0
    }

    fn query(
        &mut self,
        query_type: &str,
        _args: Option<&serde_json::Value>,
    ) -> Result<Option<serde_json::Value>, redrive_core::WorkflowFailure> {
        Err(redrive_core::WorkflowFailure::new(format!(
            "unknown query type: {query_type}"
        )))
    }

    fn output(&self) -> Option<serde_json::Value> {
        Some(json!({"slept": true}))
    }

    fn options(&self) -> ProgramOptions {
        ProgramOptions {
            error_policy: self.error_policy,
        }
    }
}

#[test_log::test(tokio::test)]
async fn timer_fire_across_two_tasks() {
    let executor = executor(SleepProgram::default());

    // Task 1: fresh run, the program decides to start its timer.
    let result = executor
        .handle_workflow_task(poll(
            vec![
                workflow_started(1),
                event(2, EventAttributes::WorkflowTaskScheduled),
                event(3, EventAttributes::WorkflowTaskStarted),
            ],
            0,
            3,
        ))
        .await
        .unwrap();

    assert_eq!(
        result.commands,
        vec![Command::StartTimer(StartTimerAttributes {
            timer_id: "t1".to_string(),
            delay: Duration::from_secs(5),
        })]
    );
    assert!(!result.final_command);

    // Task 2: sticky continuation carrying the receipt and the firing.
    let result = executor
        .handle_workflow_task(poll(
            vec![
                event(4, EventAttributes::WorkflowTaskCompleted { started_event_id: 3 }),
                event(
                    5,
                    EventAttributes::TimerStarted {
                        timer_id: "t1".to_string(),
                        delay: Duration::from_secs(5),
                    },
                ),
                event(
                    6,
                    EventAttributes::TimerFired {
                        started_event_id: 5,
                        timer_id: "t1".to_string(),
                    },
                ),
                event(7, EventAttributes::WorkflowTaskScheduled),
                event(8, EventAttributes::WorkflowTaskStarted),
            ],
            3,
            8,
        ))
        .await
        .unwrap();

    assert_eq!(
        result.commands,
        vec![Command::CompleteWorkflowExecution {
            result: Some(json!({"slept": true})),
        }]
    );
    assert!(result.final_command);
    assert_eq!(executor.metrics().workflows_completed(), 1);
}

#[test_log::test(tokio::test)]
async fn timer_fire_full_replay_from_scratch() {
    // A cache miss: the whole history arrives at once and the first batch is
    // replayed; only the live batch may produce commands.
    let executor = executor(SleepProgram::default());
    let result = executor
        .handle_workflow_task(poll(
            vec![
                workflow_started(1),
                event(2, EventAttributes::WorkflowTaskScheduled),
                event(3, EventAttributes::WorkflowTaskStarted),
                event(4, EventAttributes::WorkflowTaskCompleted { started_event_id: 3 }),
                event(
                    5,
                    EventAttributes::TimerStarted {
                        timer_id: "t1".to_string(),
                        delay: Duration::from_secs(5),
                    },
                ),
                event(
                    6,
                    EventAttributes::TimerFired {
                        started_event_id: 5,
                        timer_id: "t1".to_string(),
                    },
                ),
                event(7, EventAttributes::WorkflowTaskScheduled),
                event(8, EventAttributes::WorkflowTaskStarted),
            ],
            3,
            8,
        ))
        .await
        .unwrap();

    assert_eq!(
        result.commands,
        vec![Command::CompleteWorkflowExecution {
            result: Some(json!({"slept": true})),
        }]
    );
    assert!(result.final_command);
}

// =============================================================================
// Split-history determinism
// =============================================================================

/// Timer, then an activity and a second timer in parallel, then complete.
#[derive(Default)]
struct FanOutProgram {
    activity_done: bool,
    second_timer_done: bool,
    fanned_out: bool,
}

impl WorkflowProgram for FanOutProgram {
    fn start(&mut self, _input: Option<&serde_json::Value>, ctx: &mut WorkflowContext) {
        ctx.start_timer("t1", Duration::from_secs(5));
    }

    fn event_loop(&mut self, ctx: &mut WorkflowContext) -> Result<bool, ProgramError> {
        while let Some(resolution) = ctx.poll_resolution() {
            match resolution {
                Resolution::TimerFired { timer_id } if timer_id == "t1" => {
                    if !self.fanned_out {
                        self.fanned_out = true;
                        ctx.schedule_activity(ScheduleActivityAttributes {
                            activity_id: "a1".to_string(),
                            activity_type: "charge".to_string(),
                            input: Some(json!({"amount": 10})),
                            task_queue: None,
                            schedule_to_close_timeout: None,
                            start_to_close_timeout: None,
                            heartbeat_timeout: None,
                            retry_policy: None,
                        });
                        ctx.start_timer("t2", Duration::from_secs(1));
                    }
                }
                Resolution::TimerFired { timer_id } if timer_id == "t2" => {
                    self.second_timer_done = true;
                }
                Resolution::ActivityCompleted { activity_id, .. } if activity_id == "a1" => {
                    self.activity_done = true;
                }
                _ => {}
            }
        }
        Ok(self.activity_done && self.second_timer_done)
    }

    fn handle_signal(
        &mut self,
        _ctx: &mut WorkflowContext,
        _name: &str,
        _payload: Option<serde_json::Value>,
        _event_id: i64,
    ) {
    }

    fn cancel(&mut self, _ctx: &mut WorkflowContext, _reason: &str) {}

    fn next_wake_up_time(&self) -> i64 {
        0
    }

    fn query(
        &mut self,
        _query_type: &str,
        _args: Option<&serde_json::Value>,
    ) -> Result<Option<serde_json::Value>, redrive_core::WorkflowFailure> {
        Ok(None)
    }

    fn output(&self) -> Option<serde_json::Value> {
        Some(json!({"fanned_out": true}))
    }
}

fn fan_out_history() -> Vec<HistoryEvent> {
    vec![
        workflow_started(1),
        event(2, EventAttributes::WorkflowTaskScheduled),
        event(3, EventAttributes::WorkflowTaskStarted),
        event(4, EventAttributes::WorkflowTaskCompleted { started_event_id: 3 }),
        event(
            5,
            EventAttributes::TimerStarted {
                timer_id: "t1".to_string(),
                delay: Duration::from_secs(5),
            },
        ),
        event(
            6,
            EventAttributes::TimerFired {
                started_event_id: 5,
                timer_id: "t1".to_string(),
            },
        ),
        event(7, EventAttributes::WorkflowTaskScheduled),
        event(8, EventAttributes::WorkflowTaskStarted),
        event(9, EventAttributes::WorkflowTaskCompleted { started_event_id: 8 }),
        event(
            10,
            EventAttributes::ActivityTaskScheduled {
                activity_id: "a1".to_string(),
                activity_type: "charge".to_string(),
                input: Some(json!({"amount": 10})),
            },
        ),
        event(
            11,
            EventAttributes::TimerStarted {
                timer_id: "t2".to_string(),
                delay: Duration::from_secs(1),
            },
        ),
        event(
            12,
            EventAttributes::ActivityTaskStarted {
                scheduled_event_id: 10,
                attempt: 1,
            },
        ),
        event(
            13,
            EventAttributes::ActivityTaskCompleted {
                scheduled_event_id: 10,
                result: Some(json!({"charged": true})),
            },
        ),
        event(
            14,
            EventAttributes::TimerFired {
                started_event_id: 11,
                timer_id: "t2".to_string(),
            },
        ),
        event(15, EventAttributes::WorkflowTaskScheduled),
        event(16, EventAttributes::WorkflowTaskStarted),
    ]
}

#[test_log::test(tokio::test)]
async fn split_history_reproduces_the_recorded_commands() {
    // Incremental executor: three polls, as the service would issue them.
    let incremental = executor(FanOutProgram::default());
    let history = fan_out_history();

    let first = incremental
        .handle_workflow_task(poll(history[..3].to_vec(), 0, 3))
        .await
        .unwrap();
    assert_eq!(
        first.commands,
        vec![Command::StartTimer(StartTimerAttributes {
            timer_id: "t1".to_string(),
            delay: Duration::from_secs(5),
        })]
    );

    let second = incremental
        .handle_workflow_task(poll(history[3..8].to_vec(), 3, 8))
        .await
        .unwrap();
    assert_eq!(second.commands.len(), 2);
    assert!(matches!(second.commands[0], Command::ScheduleActivityTask(_)));
    assert!(
        matches!(&second.commands[1], Command::StartTimer(attrs) if attrs.timer_id == "t2")
    );

    let third = incremental
        .handle_workflow_task(poll(history[8..].to_vec(), 8, 16))
        .await
        .unwrap();

    // Cache-miss executor: the same history in one poll.
    let fresh = executor(FanOutProgram::default());
    let replayed = fresh
        .handle_workflow_task(poll(history.clone(), 8, 16))
        .await
        .unwrap();

    // The live decision is identical no matter where the history was split,
    // and the incremental commands are exactly the receipts history records.
    assert_eq!(third.commands, replayed.commands);
    assert_eq!(
        replayed.commands,
        vec![Command::CompleteWorkflowExecution {
            result: Some(json!({"fanned_out": true})),
        }]
    );
}

// =============================================================================
// Non-determinism detection
// =============================================================================

#[test_log::test(tokio::test)]
async fn started_event_skew_fails_the_task() {
    let executor = executor(SleepProgram::default());

    executor
        .handle_workflow_task(poll(
            vec![
                workflow_started(1),
                event(14, EventAttributes::WorkflowTaskScheduled),
                event(15, EventAttributes::WorkflowTaskStarted),
            ],
            0,
            15,
        ))
        .await
        .unwrap();

    // The next poll claims the previous task started at 17, but this
    // executor last saw 15.
    let err = executor
        .handle_workflow_task(poll(
            vec![
                event(16, EventAttributes::WorkflowTaskCompleted { started_event_id: 15 }),
                event(17, EventAttributes::WorkflowTaskScheduled),
                event(18, EventAttributes::WorkflowTaskStarted),
            ],
            17,
            18,
        ))
        .await
        .unwrap_err();

    match err {
        ExecutorError::Machine(MachineError::StartedEventSkew { expected, actual }) => {
            assert_eq!(expected, 15);
            assert_eq!(actual, 17);
        }
        other => panic!("expected skew error, got {other}"),
    }
    assert_eq!(executor.metrics().workflow_task_no_completion(), 1);
}

#[test_log::test(tokio::test)]
async fn started_event_skew_under_fail_workflow_policy() {
    let executor = executor(SleepProgram {
        error_policy: WorkflowErrorPolicy::FailWorkflow,
        ..Default::default()
    });

    executor
        .handle_workflow_task(poll(
            vec![
                workflow_started(1),
                event(14, EventAttributes::WorkflowTaskScheduled),
                event(15, EventAttributes::WorkflowTaskStarted),
            ],
            0,
            15,
        ))
        .await
        .unwrap();

    let result = executor
        .handle_workflow_task(poll(
            vec![
                event(16, EventAttributes::WorkflowTaskCompleted { started_event_id: 15 }),
                event(17, EventAttributes::WorkflowTaskScheduled),
                event(18, EventAttributes::WorkflowTaskStarted),
            ],
            17,
            18,
        ))
        .await
        .unwrap();

    assert!(result.final_command);
    match &result.commands[..] {
        [Command::FailWorkflowExecution { failure }] => {
            assert!(failure.message.contains("15"));
            assert!(failure.message.contains("17"));
            assert_eq!(failure.failure_type.as_deref(), Some("non_determinism"));
        }
        other => panic!("expected fail command, got {other:?}"),
    }
}

// =============================================================================
// Signals
// =============================================================================

/// Completes once it has seen the "go" signal.
#[derive(Default)]
struct SignalProgram {
    received: Vec<(String, Option<serde_json::Value>, i64)>,
}

impl WorkflowProgram for SignalProgram {
    fn start(&mut self, _input: Option<&serde_json::Value>, _ctx: &mut WorkflowContext) {}

    fn event_loop(&mut self, _ctx: &mut WorkflowContext) -> Result<bool, ProgramError> {
        Ok(!self.received.is_empty())
    }

    fn handle_signal(
        &mut self,
        _ctx: &mut WorkflowContext,
        name: &str,
        payload: Option<serde_json::Value>,
        event_id: i64,
    ) {
        self.received.push((name.to_string(), payload, event_id));
    }

    fn cancel(&mut self, _ctx: &mut WorkflowContext, _reason: &str) {}

    fn next_wake_up_time(&self) -> i64 {
        0
    }

    fn query(
        &mut self,
        _query_type: &str,
        _args: Option<&serde_json::Value>,
    ) -> Result<Option<serde_json::Value>, redrive_core::WorkflowFailure> {
        Ok(Some(json!(self.received.len())))
    }

    fn output(&self) -> Option<serde_json::Value> {
        self.received
            .first()
            .map(|(name, payload, event_id)| json!([name, payload, event_id]))
    }
}

#[test_log::test(tokio::test)]
async fn signal_is_delivered_before_the_event_loop() {
    let executor = executor(SignalProgram::default());

    let open = executor
        .handle_workflow_task(poll(
            vec![
                workflow_started(1),
                event(2, EventAttributes::WorkflowTaskScheduled),
                event(3, EventAttributes::WorkflowTaskStarted),
            ],
            0,
            3,
        ))
        .await
        .unwrap();
    assert!(open.commands.is_empty());

    let result = executor
        .handle_workflow_task(poll(
            vec![
                event(4, EventAttributes::WorkflowTaskCompleted { started_event_id: 3 }),
                event(
                    5,
                    EventAttributes::WorkflowExecutionSignaled {
                        signal_name: "go".to_string(),
                        payload: Some(json!({"speed": 3})),
                    },
                ),
                event(6, EventAttributes::WorkflowTaskScheduled),
                event(7, EventAttributes::WorkflowTaskStarted),
            ],
            3,
            7,
        ))
        .await
        .unwrap();

    // The signal reached the program (with its event id) before the event
    // loop decided to complete.
    assert_eq!(
        result.commands,
        vec![Command::CompleteWorkflowExecution {
            result: Some(json!(["go", {"speed": 3}, 5])),
        }]
    );
}

// =============================================================================
// Workflow cancellation
// =============================================================================

/// Unwinds with a cancellation error once the service requests it.
#[derive(Default)]
struct CancellableProgram {
    cancel_seen: bool,
}

impl WorkflowProgram for CancellableProgram {
    fn start(&mut self, _input: Option<&serde_json::Value>, _ctx: &mut WorkflowContext) {}

    fn event_loop(&mut self, _ctx: &mut WorkflowContext) -> Result<bool, ProgramError> {
        if self.cancel_seen {
            Err(ProgramError::Canceled("cancel requested".to_string()))
        } else {
            Ok(false)
        }
    }

    fn handle_signal(
        &mut self,
        _ctx: &mut WorkflowContext,
        _name: &str,
        _payload: Option<serde_json::Value>,
        _event_id: i64,
    ) {
    }

    fn cancel(&mut self, _ctx: &mut WorkflowContext, _reason: &str) {
        self.cancel_seen = true;
    }

    fn next_wake_up_time(&self) -> i64 {
        0
    }

    fn query(
        &mut self,
        _query_type: &str,
        _args: Option<&serde_json::Value>,
    ) -> Result<Option<serde_json::Value>, redrive_core::WorkflowFailure> {
        Ok(None)
    }
}

#[test_log::test(tokio::test)]
async fn requested_cancellation_completes_with_cancel_command() {
    let executor = executor(CancellableProgram::default());

    executor
        .handle_workflow_task(poll(
            vec![
                workflow_started(1),
                event(2, EventAttributes::WorkflowTaskScheduled),
                event(3, EventAttributes::WorkflowTaskStarted),
            ],
            0,
            3,
        ))
        .await
        .unwrap();

    let result = executor
        .handle_workflow_task(poll(
            vec![
                event(4, EventAttributes::WorkflowTaskCompleted { started_event_id: 3 }),
                event(
                    5,
                    EventAttributes::WorkflowExecutionCancelRequested {
                        reason: Some("operator".to_string()),
                    },
                ),
                event(6, EventAttributes::WorkflowTaskScheduled),
                event(7, EventAttributes::WorkflowTaskStarted),
            ],
            3,
            7,
        ))
        .await
        .unwrap();

    assert_eq!(result.commands, vec![Command::CancelWorkflowExecution]);
    assert!(result.final_command);
    assert_eq!(executor.metrics().workflows_canceled(), 1);
}

// =============================================================================
// Wake-up timer
// =============================================================================

/// Sleeps via the wake-up mechanism only: no explicit timer, just a wake
/// time reported to the executor.
#[derive(Default)]
struct WakeProgram {
    wake_at_ms: i64,
    now_ms: i64,
}

impl WorkflowProgram for WakeProgram {
    fn start(&mut self, _input: Option<&serde_json::Value>, ctx: &mut WorkflowContext) {
        self.wake_at_ms = ctx.current_time_millis() + 50;
        self.now_ms = ctx.current_time_millis();
    }

    fn event_loop(&mut self, ctx: &mut WorkflowContext) -> Result<bool, ProgramError> {
        // A wake timer must never surface as a program resolution.
        if let Some(resolution) = ctx.poll_resolution() {
            return Err(ProgramError::Unexpected(anyhow::anyhow!(
                "unexpected resolution: {resolution:?}"
            )));
        }
        self.now_ms = ctx.current_time_millis();
        Ok(self.now_ms >= self.wake_at_ms)
    }

    fn handle_signal(
        &mut self,
        _ctx: &mut WorkflowContext,
        _name: &str,
        _payload: Option<serde_json::Value>,
        _event_id: i64,
    ) {
    }

    fn cancel(&mut self, _ctx: &mut WorkflowContext, _reason: &str) {}

    fn next_wake_up_time(&self) -> i64 {
        if self.now_ms >= self.wake_at_ms {
            0
        } else {
            self.wake_at_ms
        }
    }

    fn query(
        &mut self,
        _query_type: &str,
        _args: Option<&serde_json::Value>,
    ) -> Result<Option<serde_json::Value>, redrive_core::WorkflowFailure> {
        Ok(None)
    }
}

#[test_log::test(tokio::test)]
async fn wake_up_time_materializes_as_a_timer_command() {
    let executor = executor(WakeProgram::default());

    let result = executor
        .handle_workflow_task(poll(
            vec![
                workflow_started(1),
                event(2, EventAttributes::WorkflowTaskScheduled),
                event(3, EventAttributes::WorkflowTaskStarted),
            ],
            0,
            3,
        ))
        .await
        .unwrap();

    match &result.commands[..] {
        [Command::StartTimer(attrs)] => {
            assert!(attrs.timer_id.starts_with(WAKE_TIMER_ID_PREFIX));
            assert_eq!(attrs.delay, Duration::from_millis(50));
        }
        other => panic!("expected a wake timer command, got {other:?}"),
    }

    let wake_timer_id = match &result.commands[0] {
        Command::StartTimer(attrs) => attrs.timer_id.clone(),
        _ => unreachable!(),
    };

    // Let the wake-up moment pass; live batches follow the wall clock.
    tokio::time::sleep(Duration::from_millis(80)).await;

    // The wake timer fires; its resolution is dropped, the program simply
    // observes that time has passed and completes.
    let result = executor
        .handle_workflow_task(poll(
            vec![
                event(4, EventAttributes::WorkflowTaskCompleted { started_event_id: 3 }),
                event(
                    5,
                    EventAttributes::TimerStarted {
                        timer_id: wake_timer_id.clone(),
                        delay: Duration::from_millis(50),
                    },
                ),
                event(
                    6,
                    EventAttributes::TimerFired {
                        started_event_id: 5,
                        timer_id: wake_timer_id,
                    },
                ),
                event(7, EventAttributes::WorkflowTaskScheduled),
                event(8, EventAttributes::WorkflowTaskStarted),
            ],
            3,
            8,
        ))
        .await
        .unwrap();

    assert_eq!(
        result.commands,
        vec![Command::CompleteWorkflowExecution { result: None }]
    );
}

// =============================================================================
// Local activity heartbeat
// =============================================================================

/// Runs dispatched attempts one at a time, each taking a fixed duration.
struct SequentialDispatcher {
    serializer: Arc<tokio::sync::Mutex<()>>,
    duration: Duration,
}

impl LocalActivityDispatcher for SequentialDispatcher {
    fn dispatch(&self, task: LocalActivityTask, sink: LocalActivityCompletionSink) {
        let serializer = self.serializer.clone();
        let duration = self.duration;
        tokio::spawn(async move {
            let _guard = serializer.lock().await;
            tokio::time::sleep(duration).await;
            sink.complete(LocalActivityCompletion {
                task_token: task.task_token,
                activity_id: task.request.activity_id.clone(),
                attempt: task.attempt,
                result: Ok(Some(json!({"done": task.request.activity_id}))),
                elapsed: duration,
            });
        });
    }
}

/// Schedules five local activities up front and completes when all resolve.
#[derive(Default)]
struct LocalActivityProgram {
    resolved: usize,
    scheduled: bool,
}

impl WorkflowProgram for LocalActivityProgram {
    fn start(&mut self, _input: Option<&serde_json::Value>, ctx: &mut WorkflowContext) {
        self.scheduled = true;
        for index in 0..5 {
            ctx.schedule_local_activity(LocalActivityRequest {
                activity_id: format!("la-{index}"),
                activity_type: "side_effect".to_string(),
                input: None,
                retry_policy: Some(RetryPolicy::new(Duration::from_millis(10))),
            });
        }
    }

    fn event_loop(&mut self, ctx: &mut WorkflowContext) -> Result<bool, ProgramError> {
        while let Some(resolution) = ctx.poll_resolution() {
            if matches!(resolution, Resolution::LocalActivityResolved { .. }) {
                self.resolved += 1;
            }
        }
        Ok(self.resolved >= 5)
    }

    fn handle_signal(
        &mut self,
        _ctx: &mut WorkflowContext,
        _name: &str,
        _payload: Option<serde_json::Value>,
        _event_id: i64,
    ) {
    }

    fn cancel(&mut self, _ctx: &mut WorkflowContext, _reason: &str) {}

    fn next_wake_up_time(&self) -> i64 {
        0
    }

    fn query(
        &mut self,
        _query_type: &str,
        _args: Option<&serde_json::Value>,
    ) -> Result<Option<serde_json::Value>, redrive_core::WorkflowFailure> {
        Ok(Some(json!(self.resolved)))
    }
}

#[test_log::test(tokio::test)]
async fn local_activity_heartbeat_forces_a_new_task() {
    let executor = ReplayExecutor::new(
        "run-1",
        LocalActivityProgram::default(),
        Arc::new(NoPages),
        Arc::new(SequentialDispatcher {
            serializer: Arc::new(tokio::sync::Mutex::new(())),
            duration: Duration::from_millis(100),
        }),
        ExecutorConfig::default(),
    );

    // Five sequential 100ms activities cannot finish inside 4/5 of a 400ms
    // task timeout; the executor must heartbeat instead of blocking.
    let mut task = poll(
        vec![
            workflow_started(1),
            event(2, EventAttributes::WorkflowTaskScheduled),
            event(3, EventAttributes::WorkflowTaskStarted),
        ],
        0,
        3,
    );
    task.workflow_task_timeout = Duration::from_millis(400);

    let result = executor.handle_workflow_task(task).await.unwrap();

    assert!(result.force_create_new_workflow_task);
    assert!(!result.final_command);

    let markers = result
        .commands
        .iter()
        .filter(|command| matches!(command, Command::RecordMarker(_)))
        .count();
    assert!(markers >= 1, "expected at least one completed marker");
    assert!(markers < 5, "not all activities can fit in the budget");
    assert_eq!(
        executor.metrics().local_activities_resolved(),
        markers as u64
    );
}

// =============================================================================
// Queries
// =============================================================================

#[test_log::test(tokio::test)]
async fn queries_run_against_post_replay_state() {
    let executor = executor(SignalProgram::default());

    let mut task = poll(
        vec![
            workflow_started(1),
            event(2, EventAttributes::WorkflowTaskScheduled),
            event(3, EventAttributes::WorkflowTaskStarted),
        ],
        0,
        3,
    );
    task.queries.insert(
        "q1".to_string(),
        WorkflowQuery {
            query_type: "received_count".to_string(),
            args: None,
        },
    );

    let result = executor.handle_workflow_task(task).await.unwrap();
    assert_eq!(
        result.query_results.get("q1"),
        Some(&QueryResult::Answered {
            payload: Some(json!(0)),
        })
    );
    // Queries never add commands.
    assert!(result.commands.is_empty());
}

#[test_log::test(tokio::test)]
async fn failed_query_is_captured_not_fatal() {
    let executor = executor(SleepProgram::default());

    let mut task = poll(
        vec![
            workflow_started(1),
            event(2, EventAttributes::WorkflowTaskScheduled),
            event(3, EventAttributes::WorkflowTaskStarted),
        ],
        0,
        3,
    );
    task.queries.insert(
        "broken".to_string(),
        WorkflowQuery {
            query_type: "bogus".to_string(),
            args: None,
        },
    );

    let result = executor.handle_workflow_task(task).await.unwrap();
    match result.query_results.get("broken") {
        Some(QueryResult::Failed { message, .. }) => {
            assert!(message.contains("bogus"));
        }
        other => panic!("expected failed query, got {other:?}"),
    }
    // The task itself still succeeded and produced its timer command.
    assert_eq!(result.commands.len(), 1);
}

#[test_log::test(tokio::test)]
async fn direct_query_returns_the_payload() {
    let executor = executor(SignalProgram::default());

    executor
        .handle_workflow_task(poll(
            vec![
                workflow_started(1),
                event(2, EventAttributes::WorkflowTaskScheduled),
                event(3, EventAttributes::WorkflowTaskStarted),
            ],
            0,
            3,
        ))
        .await
        .unwrap();

    let payload = executor
        .handle_query_workflow_task(
            poll(vec![], 3, 3),
            WorkflowQuery {
                query_type: "received_count".to_string(),
                args: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(payload, Some(json!(0)));
}
