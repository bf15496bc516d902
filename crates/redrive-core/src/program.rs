//! The workflow program contract
//!
//! The executor drives an externally constructed program through a mailbox:
//! the program issues [`ProgramCommand`]s through its [`WorkflowContext`] and
//! consumes [`Resolution`]s the executor delivers as history unfolds. Keeping
//! the exchange in a mailbox (rather than handing the program a handle to the
//! executor) keeps the object graph a DAG.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::{
    ContinueAsNewAttributes, RequestCancelExternalAttributes, ScheduleActivityAttributes,
    SignalExternalAttributes, StartChildWorkflowAttributes, StartTimerAttributes, TimeoutType,
    WorkflowFailure,
};
use crate::local_activity::LocalActivityRequest;

/// How the executor reacts when the program (or the machinery underneath it)
/// breaks in a way the workflow author did not model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkflowErrorPolicy {
    /// Fail the workflow task; the service retries it later
    #[default]
    FailWorkflowTask,

    /// Map the error to a workflow failure and complete the run with it
    FailWorkflow,
}

/// Options the program reports to the executor
#[derive(Debug, Clone, Default)]
pub struct ProgramOptions {
    pub error_policy: WorkflowErrorPolicy,
}

/// Errors the program's event loop can surface
#[derive(Debug, thiserror::Error)]
pub enum ProgramError {
    /// A failure the workflow author raised deliberately
    #[error("workflow failed: {0}")]
    Failed(WorkflowFailure),

    /// The program observed cancellation and unwound
    #[error("workflow canceled: {0}")]
    Canceled(String),

    /// Anything the author did not model; handled per the error policy
    #[error("unexpected workflow error: {0:#}")]
    Unexpected(#[from] anyhow::Error),
}

/// A query against post-replay workflow state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowQuery {
    pub query_type: String,
    pub args: Option<serde_json::Value>,
}

/// Per-query outcome; a failed query never fails the workflow task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryResult {
    Answered {
        payload: Option<serde_json::Value>,
    },
    Failed {
        message: String,
        details: Option<serde_json::Value>,
    },
}

/// Commands the program issues through its context
#[derive(Debug, Clone, PartialEq)]
pub enum ProgramCommand {
    StartTimer(StartTimerAttributes),
    CancelTimer { timer_id: String },
    ScheduleActivity(ScheduleActivityAttributes),
    RequestCancelActivity { activity_id: String },
    StartChildWorkflow(StartChildWorkflowAttributes),
    RequestCancelChildWorkflow { workflow_id: String },
    SignalExternalWorkflow(SignalExternalAttributes),
    CancelSignalDelivery { signal_id: String },
    RequestCancelExternalWorkflow(RequestCancelExternalAttributes),
    RecordMarker { marker_name: String, details: Option<serde_json::Value> },
    UpsertSearchAttributes { attributes: BTreeMap<String, serde_json::Value> },
    CompleteWorkflow { result: Option<serde_json::Value> },
    FailWorkflow { failure: WorkflowFailure },
    CancelWorkflow,
    ContinueAsNew(ContinueAsNewAttributes),
}

/// Notifications the executor delivers to the program
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    TimerFired { timer_id: String },
    TimerCanceled { timer_id: String },

    ActivityCompleted { activity_id: String, result: Option<serde_json::Value> },
    ActivityFailed { activity_id: String, failure: WorkflowFailure },
    ActivityTimedOut { activity_id: String, timeout_type: TimeoutType },
    ActivityCanceled { activity_id: String },

    ChildWorkflowStarted { workflow_id: String, run_id: String },
    ChildWorkflowStartFailed { workflow_id: String, cause: String },
    ChildWorkflowCompleted { workflow_id: String, result: Option<serde_json::Value> },
    ChildWorkflowFailed { workflow_id: String, failure: WorkflowFailure },
    ChildWorkflowTimedOut { workflow_id: String, timeout_type: TimeoutType },
    ChildWorkflowCanceled { workflow_id: String },
    ChildWorkflowTerminated { workflow_id: String },

    ExternalSignalDelivered { signal_id: String },
    ExternalSignalFailed { signal_id: String, cause: String },
    ExternalCancelDelivered { cancel_id: String },
    ExternalCancelFailed { cancel_id: String, cause: String },

    MarkerRecorded { marker_name: String, details: Option<serde_json::Value> },

    LocalActivityResolved {
        activity_id: String,
        result: Result<Option<serde_json::Value>, WorkflowFailure>,
    },
}

/// The mailbox between the executor and the workflow program
///
/// The executor refreshes the replay/time/cancel flags before every program
/// call, pushes resolutions as it dispatches history, and drains issued
/// commands after every event-loop pass.
#[derive(Debug, Default)]
pub struct WorkflowContext {
    replaying: bool,
    current_time_ms: i64,
    cancel_requested: bool,

    commands: Vec<ProgramCommand>,
    local_activities: Vec<LocalActivityRequest>,
    resolutions: VecDeque<Resolution>,
}

impl WorkflowContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic current time in epoch milliseconds
    pub fn current_time_millis(&self) -> i64 {
        self.current_time_ms
    }

    /// True while decisions are being reproduced from history
    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    /// True once the service asked this workflow to cancel
    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub fn start_timer(&mut self, timer_id: impl Into<String>, delay: Duration) {
        self.commands.push(ProgramCommand::StartTimer(StartTimerAttributes {
            timer_id: timer_id.into(),
            delay,
        }));
    }

    pub fn cancel_timer(&mut self, timer_id: impl Into<String>) {
        self.commands.push(ProgramCommand::CancelTimer {
            timer_id: timer_id.into(),
        });
    }

    pub fn schedule_activity(&mut self, attributes: ScheduleActivityAttributes) {
        self.commands.push(ProgramCommand::ScheduleActivity(attributes));
    }

    pub fn request_cancel_activity(&mut self, activity_id: impl Into<String>) {
        self.commands.push(ProgramCommand::RequestCancelActivity {
            activity_id: activity_id.into(),
        });
    }

    pub fn schedule_local_activity(&mut self, request: LocalActivityRequest) {
        self.local_activities.push(request);
    }

    pub fn start_child_workflow(&mut self, attributes: StartChildWorkflowAttributes) {
        self.commands.push(ProgramCommand::StartChildWorkflow(attributes));
    }

    pub fn request_cancel_child_workflow(&mut self, workflow_id: impl Into<String>) {
        self.commands.push(ProgramCommand::RequestCancelChildWorkflow {
            workflow_id: workflow_id.into(),
        });
    }

    pub fn signal_external_workflow(&mut self, attributes: SignalExternalAttributes) {
        self.commands.push(ProgramCommand::SignalExternalWorkflow(attributes));
    }

    pub fn cancel_signal_delivery(&mut self, signal_id: impl Into<String>) {
        self.commands.push(ProgramCommand::CancelSignalDelivery {
            signal_id: signal_id.into(),
        });
    }

    pub fn request_cancel_external_workflow(
        &mut self,
        attributes: RequestCancelExternalAttributes,
    ) {
        self.commands
            .push(ProgramCommand::RequestCancelExternalWorkflow(attributes));
    }

    pub fn record_marker(
        &mut self,
        marker_name: impl Into<String>,
        details: Option<serde_json::Value>,
    ) {
        self.commands.push(ProgramCommand::RecordMarker {
            marker_name: marker_name.into(),
            details,
        });
    }

    pub fn upsert_search_attributes(
        &mut self,
        attributes: BTreeMap<String, serde_json::Value>,
    ) {
        self.commands
            .push(ProgramCommand::UpsertSearchAttributes { attributes });
    }

    pub fn complete_workflow(&mut self, result: Option<serde_json::Value>) {
        self.commands.push(ProgramCommand::CompleteWorkflow { result });
    }

    pub fn fail_workflow(&mut self, failure: WorkflowFailure) {
        self.commands.push(ProgramCommand::FailWorkflow { failure });
    }

    pub fn cancel_workflow(&mut self) {
        self.commands.push(ProgramCommand::CancelWorkflow);
    }

    pub fn continue_as_new(&mut self, attributes: ContinueAsNewAttributes) {
        self.commands.push(ProgramCommand::ContinueAsNew(attributes));
    }

    /// Next resolution delivered by the executor, if any
    pub fn poll_resolution(&mut self) -> Option<Resolution> {
        self.resolutions.pop_front()
    }

    // -- executor side -------------------------------------------------------

    pub(crate) fn set_replaying(&mut self, replaying: bool) {
        self.replaying = replaying;
    }

    pub(crate) fn set_current_time_ms(&mut self, time_ms: i64) {
        self.current_time_ms = time_ms;
    }

    pub(crate) fn set_cancel_requested(&mut self) {
        self.cancel_requested = true;
    }

    pub(crate) fn push_resolution(&mut self, resolution: Resolution) {
        self.resolutions.push_back(resolution);
    }

    pub(crate) fn drain_commands(&mut self) -> Vec<ProgramCommand> {
        std::mem::take(&mut self.commands)
    }

    pub(crate) fn drain_local_activities(&mut self) -> Vec<LocalActivityRequest> {
        std::mem::take(&mut self.local_activities)
    }
}

/// The deterministic workflow program driven by the executor
///
/// Programs must be deterministic: given the same history they must issue
/// the same commands in the same order. The executor cannot enforce this;
/// the bookkeeper's started-event check is the runtime guard that catches
/// divergence.
pub trait WorkflowProgram: Send + 'static {
    /// Initialize from the WorkflowExecutionStarted event
    fn start(&mut self, input: Option<&serde_json::Value>, ctx: &mut WorkflowContext);

    /// Run queued program logic until it blocks on unresolved futures
    ///
    /// Returns true once the workflow is complete.
    fn event_loop(&mut self, ctx: &mut WorkflowContext) -> Result<bool, ProgramError>;

    /// Deliver an external signal; runs before the batch's event loop
    fn handle_signal(
        &mut self,
        ctx: &mut WorkflowContext,
        name: &str,
        payload: Option<serde_json::Value>,
        event_id: i64,
    );

    /// The service requested cancellation
    fn cancel(&mut self, ctx: &mut WorkflowContext, reason: &str);

    /// Earliest time the program needs to be woken, 0 when none
    fn next_wake_up_time(&self) -> i64;

    /// Answer a query against current state; must not mutate it
    fn query(
        &mut self,
        query_type: &str,
        args: Option<&serde_json::Value>,
    ) -> Result<Option<serde_json::Value>, WorkflowFailure>;

    /// Result payload once the workflow completed
    fn output(&self) -> Option<serde_json::Value> {
        None
    }

    /// Executor-facing options
    fn options(&self) -> ProgramOptions {
        ProgramOptions::default()
    }

    /// Release resources when the run is evicted or finished
    fn close(&mut self) {}
}
