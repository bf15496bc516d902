//! Per-command state machines
//!
//! Every command the workflow emits is tracked by a small state machine that
//! is advanced by the history events the service writes in response. The
//! machines are the audit trail that makes non-determinism detectable: a
//! replayed history that does not line up with the commands the program
//! produces is a fatal divergence.

mod bookkeeper;
mod state_machine;

pub use bookkeeper::CommandBookkeeper;
pub use state_machine::{CommandStateMachine, MachinePayload};

/// The kind of entity a command targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandTarget {
    Activity,
    Timer,
    ChildWorkflow,
    Signal,
    CancelExternal,
    SelfWorkflow,
    UpsertSearchAttributes,
    Marker,
}

/// Identity of a command: the target kind plus the id of the history event
/// that materializes it
///
/// The event id is predicted at command creation (commands materialize in
/// order right after the task's WorkflowTaskCompleted event) and is the key
/// used to route later history events back to their machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandId {
    pub target: CommandTarget,
    pub event_id: i64,
}

impl CommandId {
    pub fn new(target: CommandTarget, event_id: i64) -> Self {
        Self { target, event_id }
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}:{}", self.target, self.event_id)
    }
}

/// Lifecycle states shared by the machine family
///
/// Each kind's transition table is a subset of this alphabet; `Completed` is
/// the terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Created,
    CommandSent,
    Initiated,
    Started,
    CanceledBeforeInitiated,
    CanceledAfterInitiated,
    CanceledAfterStarted,
    CancellationCommandSent,
    Completed,
}

/// Inputs that drive the machines, recorded in the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineAction {
    NotifyCommandSent,
    Cancel,
    HandleInitiated,
    HandleStarted,
    HandleCompletion,
    HandleCancellationInitiated,
    HandleCancellationFailure,
    HandleCancellation,
    HandleInitiationFailed,
}

/// Errors from machine transitions and routing
///
/// An invalid transition carries the machine's full audit log; when replay
/// diverges this message is usually the only clue to where.
#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    #[error(
        "invalid transition {action:?} in state {state:?} for machine {id}; \
         state history: [{audit}]"
    )]
    InvalidTransition {
        id: CommandId,
        state: CommandState,
        action: MachineAction,
        audit: String,
    },

    #[error(
        "no state machine for {target:?} initiated by event {event_id}; \
         history does not match the commands this workflow produced"
    )]
    UnknownMachine {
        target: CommandTarget,
        event_id: i64,
    },

    #[error("no open {target:?} machine with id {user_id:?}")]
    UnknownUserId {
        target: CommandTarget,
        user_id: String,
    },

    #[error(
        "workflow task started event mismatch: executor last saw started event \
         {expected}, history says the previous task started at {actual}"
    )]
    StartedEventSkew { expected: i64, actual: i64 },
}
