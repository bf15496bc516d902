//! History events and the poll-side task model
//!
//! A history event is one atomic, durable record appended by the
//! orchestration service; the flat event stream is the replay input. Wire
//! shapes here mirror the service API closely enough that the gRPC layer can
//! map into them one-to-one.

mod iterator;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::{TimeoutType, WorkflowFailure};
use crate::machines::CommandTarget;
use crate::program::WorkflowQuery;

pub use iterator::{HistoryIterator, WorkflowTaskEvents};

/// Errors from history grouping and pagination
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// Ran out of workflow task deadline while paginating
    #[error("history pagination exceeded the workflow task deadline after {attempts} attempts")]
    DeadlineExceeded { attempts: u32 },

    /// Pagination RPC failed terminally
    #[error("history fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// The event stream violated its structural rules
    #[error("malformed history: {0}")]
    Malformed(String),
}

/// Errors surfaced by a [`HistoryFetcher`]
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Transient failure; the pagination loop retries it
    #[error("transient fetch error: {0}")]
    Transient(String),

    /// Terminal failure; propagated to the caller immediately
    #[error("terminal fetch error: {0}")]
    Terminal(String),
}

/// One page of history returned by the service
#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub events: Vec<HistoryEvent>,
    pub next_page_token: Option<Vec<u8>>,
}

/// Fetches history continuation pages
///
/// Implemented over the service's GetWorkflowExecutionHistory RPC; the
/// iterator calls it only when the in-memory page is exhausted and a token
/// remains.
#[async_trait]
pub trait HistoryFetcher: Send + Sync {
    async fn fetch_page(&self, run_id: &str, page_token: Vec<u8>) -> Result<HistoryPage, FetchError>;
}

/// One unit of server-issued work: decide what the workflow does next
///
/// Carries a page of history plus the bookkeeping the executor needs to
/// discriminate replay from live and to answer queries.
#[derive(Debug, Clone)]
pub struct WorkflowTask {
    pub workflow_id: String,
    pub run_id: String,

    /// First (possibly only) page of history
    pub history: Vec<HistoryEvent>,

    /// Token for fetching the rest of the history, if any
    pub next_page_token: Option<Vec<u8>>,

    /// Started event id of the last workflow task the service saw completed
    pub previous_started_event_id: i64,

    /// Started event id of the task being decided now
    pub started_event_id: i64,

    /// Hard deadline for deciding this task
    pub workflow_task_timeout: Duration,

    /// Queries to answer against post-replay state
    pub queries: HashMap<String, WorkflowQuery>,

    /// Legacy single-query field, still honored
    pub legacy_query: Option<WorkflowQuery>,
}

/// One atomic, durable record in the workflow's history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEvent {
    /// Position in the append-only log, 1-based
    pub event_id: i64,

    /// Service-recorded time of the event
    pub timestamp: DateTime<Utc>,

    /// Typed payload
    pub attributes: EventAttributes,
}

impl HistoryEvent {
    pub fn new(event_id: i64, timestamp: DateTime<Utc>, attributes: EventAttributes) -> Self {
        Self {
            event_id,
            timestamp,
            attributes,
        }
    }

    /// Epoch milliseconds of the event timestamp
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    /// Check if this event materializes a command the workflow emitted
    ///
    /// Command events are the receipts the service writes immediately after
    /// a WorkflowTaskCompleted, one per command, in command order.
    pub fn is_command_event(&self) -> bool {
        matches!(
            self.attributes,
            EventAttributes::ActivityTaskScheduled { .. }
                | EventAttributes::TimerStarted { .. }
                | EventAttributes::StartChildWorkflowExecutionInitiated { .. }
                | EventAttributes::SignalExternalWorkflowExecutionInitiated { .. }
                | EventAttributes::RequestCancelExternalWorkflowExecutionInitiated { .. }
                | EventAttributes::MarkerRecorded { .. }
                | EventAttributes::UpsertWorkflowSearchAttributes { .. }
        )
    }

    /// Check if this event closes the workflow execution
    pub fn is_terminal_workflow_event(&self) -> bool {
        matches!(
            self.attributes,
            EventAttributes::WorkflowExecutionCompleted { .. }
                | EventAttributes::WorkflowExecutionFailed { .. }
                | EventAttributes::WorkflowExecutionCanceled { .. }
                | EventAttributes::WorkflowExecutionTimedOut { .. }
                | EventAttributes::WorkflowExecutionContinuedAsNew { .. }
                | EventAttributes::WorkflowExecutionTerminated { .. }
        )
    }

    /// Routing key for the state machine this event belongs to
    ///
    /// Command events route by their own id (they create the mapping);
    /// progress events route by the initiating event id they reference.
    /// Events that never touch a machine return `None`.
    pub fn machine_routing(&self) -> Option<(CommandTarget, i64)> {
        use EventAttributes::*;
        let routing = match &self.attributes {
            ActivityTaskScheduled { .. } => (CommandTarget::Activity, self.event_id),
            ActivityTaskStarted { scheduled_event_id, .. }
            | ActivityTaskCompleted { scheduled_event_id, .. }
            | ActivityTaskFailed { scheduled_event_id, .. }
            | ActivityTaskTimedOut { scheduled_event_id, .. }
            | ActivityTaskCancelRequested { scheduled_event_id }
            | ActivityTaskCanceled { scheduled_event_id, .. } => {
                (CommandTarget::Activity, *scheduled_event_id)
            }

            TimerStarted { .. } => (CommandTarget::Timer, self.event_id),
            TimerFired { started_event_id, .. } | TimerCanceled { started_event_id, .. } => {
                (CommandTarget::Timer, *started_event_id)
            }

            StartChildWorkflowExecutionInitiated { .. } => {
                (CommandTarget::ChildWorkflow, self.event_id)
            }
            StartChildWorkflowExecutionFailed { initiated_event_id, .. }
            | ChildWorkflowExecutionStarted { initiated_event_id, .. }
            | ChildWorkflowExecutionCompleted { initiated_event_id, .. }
            | ChildWorkflowExecutionFailed { initiated_event_id, .. }
            | ChildWorkflowExecutionTimedOut { initiated_event_id, .. }
            | ChildWorkflowExecutionCanceled { initiated_event_id, .. }
            | ChildWorkflowExecutionTerminated { initiated_event_id, .. } => {
                (CommandTarget::ChildWorkflow, *initiated_event_id)
            }

            SignalExternalWorkflowExecutionInitiated { .. } => {
                (CommandTarget::Signal, self.event_id)
            }
            SignalExternalWorkflowExecutionFailed { initiated_event_id, .. }
            | ExternalWorkflowExecutionSignaled { initiated_event_id, .. } => {
                (CommandTarget::Signal, *initiated_event_id)
            }

            RequestCancelExternalWorkflowExecutionInitiated { .. } => {
                (CommandTarget::CancelExternal, self.event_id)
            }
            RequestCancelExternalWorkflowExecutionFailed { initiated_event_id, .. }
            | ExternalWorkflowExecutionCancelRequested { initiated_event_id, .. } => {
                (CommandTarget::CancelExternal, *initiated_event_id)
            }

            MarkerRecorded { .. } => (CommandTarget::Marker, self.event_id),
            UpsertWorkflowSearchAttributes { .. } => {
                (CommandTarget::UpsertSearchAttributes, self.event_id)
            }

            _ => return None,
        };
        Some(routing)
    }
}

/// Typed payloads for every event the dispatch loop understands
///
/// Events are immutable once written; the workflow's decisions are
/// reconstructed by replaying them in id order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventAttributes {
    // =========================================================================
    // Workflow Execution Lifecycle
    // =========================================================================
    WorkflowExecutionStarted {
        workflow_type: String,
        input: Option<serde_json::Value>,
        /// Original run id, used to seed deterministic randomness
        original_run_id: String,
    },

    WorkflowExecutionCompleted {
        result: Option<serde_json::Value>,
    },

    WorkflowExecutionFailed {
        failure: WorkflowFailure,
    },

    WorkflowExecutionCanceled,

    WorkflowExecutionTimedOut,

    WorkflowExecutionContinuedAsNew {
        new_run_id: String,
    },

    WorkflowExecutionTerminated {
        reason: String,
    },

    WorkflowExecutionCancelRequested {
        reason: Option<String>,
    },

    WorkflowExecutionSignaled {
        signal_name: String,
        payload: Option<serde_json::Value>,
    },

    // =========================================================================
    // Workflow Task Lifecycle
    // =========================================================================
    WorkflowTaskScheduled,

    WorkflowTaskStarted,

    WorkflowTaskCompleted {
        started_event_id: i64,
    },

    WorkflowTaskFailed {
        started_event_id: i64,
        cause: String,
    },

    WorkflowTaskTimedOut {
        started_event_id: i64,
    },

    // =========================================================================
    // Activity Tasks
    // =========================================================================
    ActivityTaskScheduled {
        activity_id: String,
        activity_type: String,
        input: Option<serde_json::Value>,
    },

    ActivityTaskStarted {
        scheduled_event_id: i64,
        attempt: u32,
    },

    ActivityTaskCompleted {
        scheduled_event_id: i64,
        result: Option<serde_json::Value>,
    },

    ActivityTaskFailed {
        scheduled_event_id: i64,
        failure: WorkflowFailure,
    },

    ActivityTaskTimedOut {
        scheduled_event_id: i64,
        timeout_type: TimeoutType,
    },

    ActivityTaskCancelRequested {
        scheduled_event_id: i64,
    },

    ActivityTaskCanceled {
        scheduled_event_id: i64,
    },

    // =========================================================================
    // Timers
    // =========================================================================
    TimerStarted {
        timer_id: String,
        #[serde(with = "crate::retry::duration_millis")]
        delay: Duration,
    },

    TimerFired {
        started_event_id: i64,
        timer_id: String,
    },

    TimerCanceled {
        started_event_id: i64,
        timer_id: String,
    },

    // =========================================================================
    // Markers & Search Attributes
    // =========================================================================
    MarkerRecorded {
        marker_name: String,
        details: Option<serde_json::Value>,
    },

    UpsertWorkflowSearchAttributes {
        attributes: std::collections::BTreeMap<String, serde_json::Value>,
    },

    // =========================================================================
    // Child Workflows
    // =========================================================================
    StartChildWorkflowExecutionInitiated {
        workflow_id: String,
        workflow_type: String,
        input: Option<serde_json::Value>,
    },

    StartChildWorkflowExecutionFailed {
        initiated_event_id: i64,
        workflow_id: String,
        cause: String,
    },

    ChildWorkflowExecutionStarted {
        initiated_event_id: i64,
        workflow_id: String,
        run_id: String,
    },

    ChildWorkflowExecutionCompleted {
        initiated_event_id: i64,
        result: Option<serde_json::Value>,
    },

    ChildWorkflowExecutionFailed {
        initiated_event_id: i64,
        failure: WorkflowFailure,
    },

    ChildWorkflowExecutionTimedOut {
        initiated_event_id: i64,
        timeout_type: TimeoutType,
    },

    ChildWorkflowExecutionCanceled {
        initiated_event_id: i64,
    },

    ChildWorkflowExecutionTerminated {
        initiated_event_id: i64,
    },

    // =========================================================================
    // External Signals & Cancels
    // =========================================================================
    SignalExternalWorkflowExecutionInitiated {
        signal_name: String,
        workflow_id: String,
    },

    SignalExternalWorkflowExecutionFailed {
        initiated_event_id: i64,
        cause: String,
    },

    ExternalWorkflowExecutionSignaled {
        initiated_event_id: i64,
    },

    RequestCancelExternalWorkflowExecutionInitiated {
        workflow_id: String,
    },

    RequestCancelExternalWorkflowExecutionFailed {
        initiated_event_id: i64,
        cause: String,
    },

    ExternalWorkflowExecutionCancelRequested {
        initiated_event_id: i64,
    },
}
