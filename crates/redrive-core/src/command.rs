//! Outbound commands and failure payloads

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::{option_duration_millis, RetryPolicy};

/// Types of timeouts that can close an activity or child workflow
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutType {
    /// Not claimed by a worker within schedule_to_start_timeout
    ScheduleToStart,

    /// Did not close within schedule_to_close_timeout
    ScheduleToClose,

    /// Did not complete within start_to_close_timeout
    StartToClose,

    /// No heartbeat within heartbeat_timeout
    Heartbeat,
}

/// Failure payload shared by workflows, activities and child workflows
///
/// `failure_type` is what [`RetryPolicy::should_stop`] matches against the
/// non-retryable list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowFailure {
    /// Error message
    pub message: String,

    /// Error type for programmatic handling
    pub failure_type: Option<String>,

    /// Whether this failure is retryable
    pub retryable: bool,

    /// Additional details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl WorkflowFailure {
    /// Create a non-retryable failure
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            failure_type: None,
            retryable: false,
            details: None,
        }
    }

    /// Create a retryable failure
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            failure_type: None,
            retryable: true,
            details: None,
        }
    }

    /// Set the failure type
    pub fn with_type(mut self, failure_type: impl Into<String>) -> Self {
        self.failure_type = Some(failure_type.into());
        self
    }

    /// Add failure details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for WorkflowFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowFailure {}

impl From<anyhow::Error> for WorkflowFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(format!("{err:#}"))
    }
}

/// Attributes for a StartTimer command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartTimerAttributes {
    /// Timer identifier, unique within the workflow
    pub timer_id: String,

    /// Duration until the timer fires
    #[serde(with = "crate::retry::duration_millis")]
    pub delay: Duration,
}

/// Attributes for a ScheduleActivityTask command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleActivityAttributes {
    /// Activity identifier, unique within the workflow
    pub activity_id: String,

    /// Type of activity to execute
    pub activity_type: String,

    /// Input for the activity
    pub input: Option<serde_json::Value>,

    /// Task queue override; the workflow's queue when unset
    pub task_queue: Option<String>,

    #[serde(with = "option_duration_millis", default)]
    pub schedule_to_close_timeout: Option<Duration>,

    #[serde(with = "option_duration_millis", default)]
    pub start_to_close_timeout: Option<Duration>,

    #[serde(with = "option_duration_millis", default)]
    pub heartbeat_timeout: Option<Duration>,

    /// Retry policy applied by the service
    pub retry_policy: Option<RetryPolicy>,
}

/// Attributes for a StartChildWorkflowExecution command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartChildWorkflowAttributes {
    /// Child workflow identifier
    pub workflow_id: String,

    /// Type of the child workflow
    pub workflow_type: String,

    /// Input for the child workflow
    pub input: Option<serde_json::Value>,

    /// Task queue override
    pub task_queue: Option<String>,

    /// Retry policy applied by the service
    pub retry_policy: Option<RetryPolicy>,
}

/// Attributes for a SignalExternalWorkflowExecution command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalExternalAttributes {
    /// Caller-chosen identifier for tracking the signal delivery
    pub signal_id: String,

    /// Target workflow
    pub workflow_id: String,

    /// Target run; latest run when unset
    pub run_id: Option<String>,

    /// Signal name delivered to the target
    pub signal_name: String,

    /// Signal payload
    pub payload: Option<serde_json::Value>,

    /// Restrict the target to a child of this workflow
    pub child_workflow_only: bool,
}

/// Attributes for a RequestCancelExternalWorkflowExecution command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestCancelExternalAttributes {
    /// Caller-chosen identifier for tracking the cancel delivery
    pub cancel_id: String,

    /// Target workflow
    pub workflow_id: String,

    /// Target run; latest run when unset
    pub run_id: Option<String>,

    /// Restrict the target to a child of this workflow
    pub child_workflow_only: bool,
}

/// Attributes for a RecordMarker command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordMarkerAttributes {
    /// Marker name; consumers dispatch on it
    pub marker_name: String,

    /// Arbitrary durable payload
    pub details: Option<serde_json::Value>,
}

/// Attributes for a ContinueAsNewWorkflowExecution command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContinueAsNewAttributes {
    /// Workflow type for the new run; current type when unset
    pub workflow_type: Option<String>,

    /// Input for the new run
    pub input: Option<serde_json::Value>,

    /// Task queue for the new run
    pub task_queue: Option<String>,
}

/// Commands the executor emits per workflow task
///
/// The service materializes each command into the matching history event,
/// which is how the per-command state machines are audited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    ScheduleActivityTask(ScheduleActivityAttributes),

    RequestCancelActivityTask {
        activity_id: String,
    },

    StartTimer(StartTimerAttributes),

    CancelTimer {
        timer_id: String,
    },

    StartChildWorkflowExecution(StartChildWorkflowAttributes),

    SignalExternalWorkflowExecution(SignalExternalAttributes),

    RequestCancelExternalWorkflowExecution(RequestCancelExternalAttributes),

    RecordMarker(RecordMarkerAttributes),

    UpsertSearchAttributes {
        attributes: BTreeMap<String, serde_json::Value>,
    },

    CompleteWorkflowExecution {
        result: Option<serde_json::Value>,
    },

    FailWorkflowExecution {
        failure: WorkflowFailure,
    },

    CancelWorkflowExecution,

    ContinueAsNewWorkflowExecution(ContinueAsNewAttributes),
}

impl Command {
    /// Check if this command closes the workflow
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CompleteWorkflowExecution { .. }
                | Self::FailWorkflowExecution { .. }
                | Self::CancelWorkflowExecution
                | Self::ContinueAsNewWorkflowExecution(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_serialization() {
        let command = Command::StartTimer(StartTimerAttributes {
            timer_id: "t1".to_string(),
            delay: Duration::from_secs(5),
        });

        let json = serde_json::to_string(&command).unwrap();
        assert!(json.contains("\"type\":\"start_timer\""));

        let parsed: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(command, parsed);
    }

    #[test]
    fn test_is_terminal() {
        assert!(Command::CompleteWorkflowExecution { result: None }.is_terminal());
        assert!(Command::CancelWorkflowExecution.is_terminal());
        assert!(!Command::CancelTimer {
            timer_id: "t".to_string()
        }
        .is_terminal());
    }

    #[test]
    fn test_failure_from_anyhow() {
        let failure: WorkflowFailure = anyhow::anyhow!("boom").into();
        assert!(failure.retryable);
        assert_eq!(failure.message, "boom");
    }

    #[test]
    fn test_failure_builders() {
        let failure = WorkflowFailure::new("bad input")
            .with_type("VALIDATION")
            .with_details(json!({"field": "email"}));

        assert!(!failure.retryable);
        assert_eq!(failure.failure_type.as_deref(), Some("VALIDATION"));
        assert_eq!(failure.to_string(), "bad input");
    }
}
