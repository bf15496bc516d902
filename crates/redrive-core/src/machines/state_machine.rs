//! The command state machine family
//!
//! One sum type covers the six command kinds; operations undefined for a
//! kind fall through to [`MachineError::InvalidTransition`] carrying the full
//! audit log.

use std::collections::BTreeMap;

use crate::command::{
    Command, RecordMarkerAttributes, RequestCancelExternalAttributes, ScheduleActivityAttributes,
    SignalExternalAttributes, StartChildWorkflowAttributes, StartTimerAttributes,
};

use super::{CommandId, CommandState, CommandTarget, MachineAction, MachineError};

/// Kind-specific payload of a machine
///
/// Signal and CancelExternal carry a `canceled` flag: a canceled delivery is
/// done from the workflow's point of view even before the server confirms.
#[derive(Debug, Clone)]
pub enum MachinePayload {
    Timer {
        attributes: StartTimerAttributes,
    },
    Activity {
        attributes: ScheduleActivityAttributes,
    },
    ChildWorkflow {
        attributes: StartChildWorkflowAttributes,
    },
    Signal {
        attributes: SignalExternalAttributes,
        canceled: bool,
    },
    CancelExternal {
        attributes: RequestCancelExternalAttributes,
        canceled: bool,
    },
    Marker {
        attributes: RecordMarkerAttributes,
    },
    UpsertSearchAttributes {
        attributes: BTreeMap<String, serde_json::Value>,
    },
    SelfCommand {
        command: Command,
    },
}

#[derive(Debug)]
pub struct CommandStateMachine {
    id: CommandId,
    state: CommandState,
    payload: MachinePayload,
    audit: Vec<(MachineAction, CommandState)>,
}

impl CommandStateMachine {
    pub(crate) fn new(id: CommandId, payload: MachinePayload) -> Self {
        Self {
            id,
            state: CommandState::Created,
            payload,
            audit: Vec::new(),
        }
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    pub fn payload(&self) -> &MachinePayload {
        &self.payload
    }

    /// The caller-facing identifier carried by this machine's payload
    pub fn user_id(&self) -> &str {
        match &self.payload {
            MachinePayload::Timer { attributes } => &attributes.timer_id,
            MachinePayload::Activity { attributes } => &attributes.activity_id,
            MachinePayload::ChildWorkflow { attributes } => &attributes.workflow_id,
            MachinePayload::Signal { attributes, .. } => &attributes.signal_id,
            MachinePayload::CancelExternal { attributes, .. } => &attributes.cancel_id,
            MachinePayload::Marker { attributes } => &attributes.marker_name,
            MachinePayload::UpsertSearchAttributes { .. } | MachinePayload::SelfCommand { .. } => "",
        }
    }

    /// True in a terminal state
    pub fn is_done(&self) -> bool {
        if self.state == CommandState::Completed {
            return true;
        }
        matches!(
            self.payload,
            MachinePayload::Signal { canceled: true, .. }
                | MachinePayload::CancelExternal { canceled: true, .. }
        )
    }

    /// The command to emit this task, if any
    ///
    /// `Created` machines emit their payload command; activity, timer and
    /// child machines that were canceled after initiation emit the matching
    /// cancel request.
    pub fn command(&self) -> Option<Command> {
        match self.state {
            CommandState::Created => Some(self.initial_command()),
            CommandState::CanceledAfterInitiated | CommandState::CanceledAfterStarted => {
                self.cancel_command()
            }
            _ => None,
        }
    }

    fn initial_command(&self) -> Command {
        match &self.payload {
            MachinePayload::Timer { attributes } => Command::StartTimer(attributes.clone()),
            MachinePayload::Activity { attributes } => {
                Command::ScheduleActivityTask(attributes.clone())
            }
            MachinePayload::ChildWorkflow { attributes } => {
                Command::StartChildWorkflowExecution(attributes.clone())
            }
            MachinePayload::Signal { attributes, .. } => {
                Command::SignalExternalWorkflowExecution(attributes.clone())
            }
            MachinePayload::CancelExternal { attributes, .. } => {
                Command::RequestCancelExternalWorkflowExecution(attributes.clone())
            }
            MachinePayload::Marker { attributes } => Command::RecordMarker(attributes.clone()),
            MachinePayload::UpsertSearchAttributes { attributes } => {
                Command::UpsertSearchAttributes {
                    attributes: attributes.clone(),
                }
            }
            MachinePayload::SelfCommand { command } => command.clone(),
        }
    }

    fn cancel_command(&self) -> Option<Command> {
        match &self.payload {
            MachinePayload::Timer { attributes } => Some(Command::CancelTimer {
                timer_id: attributes.timer_id.clone(),
            }),
            MachinePayload::Activity { attributes } => Some(Command::RequestCancelActivityTask {
                activity_id: attributes.activity_id.clone(),
            }),
            MachinePayload::ChildWorkflow { attributes } => {
                Some(Command::RequestCancelExternalWorkflowExecution(
                    RequestCancelExternalAttributes {
                        cancel_id: attributes.workflow_id.clone(),
                        workflow_id: attributes.workflow_id.clone(),
                        run_id: None,
                        child_workflow_only: true,
                    },
                ))
            }
            _ => None,
        }
    }

    /// The history boundary notification: commands handed to the server
    pub fn notify_command_sent(&mut self) {
        match self.state {
            CommandState::Created => {
                self.transition(MachineAction::NotifyCommandSent, CommandState::CommandSent)
            }
            CommandState::CanceledAfterInitiated | CommandState::CanceledAfterStarted => self
                .transition(
                    MachineAction::NotifyCommandSent,
                    CommandState::CancellationCommandSent,
                ),
            _ => {}
        }
    }

    /// Request cancellation; returns whether it completed immediately
    pub fn cancel(&mut self) -> Result<bool, MachineError> {
        if self.is_done() || matches!(self.state, CommandState::CancellationCommandSent) {
            return Ok(false);
        }
        match &mut self.payload {
            MachinePayload::Timer { .. }
            | MachinePayload::Activity { .. }
            | MachinePayload::ChildWorkflow { .. } => match self.state {
                CommandState::Created => {
                    self.transition(MachineAction::Cancel, CommandState::Completed);
                    Ok(true)
                }
                CommandState::CommandSent => {
                    self.transition(MachineAction::Cancel, CommandState::CanceledBeforeInitiated);
                    Ok(true)
                }
                CommandState::Initiated => {
                    self.transition(MachineAction::Cancel, CommandState::CanceledAfterInitiated);
                    Ok(false)
                }
                CommandState::Started => {
                    self.transition(MachineAction::Cancel, CommandState::CanceledAfterStarted);
                    Ok(false)
                }
                _ => Ok(false),
            },
            MachinePayload::Signal { canceled, .. }
            | MachinePayload::CancelExternal { canceled, .. } => match self.state {
                CommandState::Created | CommandState::Initiated => {
                    *canceled = true;
                    self.transition(MachineAction::Cancel, CommandState::Completed);
                    Ok(true)
                }
                CommandState::CommandSent => {
                    *canceled = true;
                    self.transition(MachineAction::Cancel, CommandState::CanceledBeforeInitiated);
                    Ok(true)
                }
                _ => Ok(false),
            },
            MachinePayload::Marker { .. }
            | MachinePayload::UpsertSearchAttributes { .. }
            | MachinePayload::SelfCommand { .. } => Err(self.invalid(MachineAction::Cancel)),
        }
    }

    /// The command's materializing receipt arrived
    ///
    /// Returns true when the machine now wants to emit a cancel request (it
    /// was canceled before the server learned about the command).
    pub fn handle_initiated_event(&mut self) -> Result<bool, MachineError> {
        match (&self.payload, self.state) {
            (
                MachinePayload::Timer { .. }
                | MachinePayload::Activity { .. }
                | MachinePayload::ChildWorkflow { .. }
                | MachinePayload::Signal { .. }
                | MachinePayload::CancelExternal { .. },
                CommandState::CommandSent,
            ) => {
                self.transition(MachineAction::HandleInitiated, CommandState::Initiated);
                Ok(false)
            }
            (
                MachinePayload::Timer { .. }
                | MachinePayload::Activity { .. }
                | MachinePayload::ChildWorkflow { .. },
                CommandState::CanceledBeforeInitiated,
            ) => {
                self.transition(
                    MachineAction::HandleInitiated,
                    CommandState::CanceledAfterInitiated,
                );
                Ok(true)
            }
            // A canceled signal delivery ignores its late receipt.
            (
                MachinePayload::Signal { .. } | MachinePayload::CancelExternal { .. },
                CommandState::CanceledBeforeInitiated,
            ) => {
                self.audit
                    .push((MachineAction::HandleInitiated, self.state));
                Ok(false)
            }
            (
                MachinePayload::Marker { .. }
                | MachinePayload::UpsertSearchAttributes { .. }
                | MachinePayload::SelfCommand { .. },
                CommandState::CommandSent,
            ) => {
                self.transition(MachineAction::HandleInitiated, CommandState::Completed);
                Ok(false)
            }
            _ => Err(self.invalid(MachineAction::HandleInitiated)),
        }
    }

    /// An activity or child workflow started executing
    pub fn handle_started_event(&mut self) -> Result<(), MachineError> {
        match (&self.payload, self.state) {
            (
                MachinePayload::Activity { .. } | MachinePayload::ChildWorkflow { .. },
                CommandState::Initiated,
            ) => {
                self.transition(MachineAction::HandleStarted, CommandState::Started);
                Ok(())
            }
            (
                MachinePayload::Activity { .. } | MachinePayload::ChildWorkflow { .. },
                CommandState::CanceledAfterInitiated,
            ) => {
                self.transition(MachineAction::HandleStarted, CommandState::CanceledAfterStarted);
                Ok(())
            }
            // Started while our cancel request is in flight: just record it.
            (
                MachinePayload::Activity { .. } | MachinePayload::ChildWorkflow { .. },
                CommandState::CancellationCommandSent,
            ) => {
                self.audit.push((MachineAction::HandleStarted, self.state));
                Ok(())
            }
            _ => Err(self.invalid(MachineAction::HandleStarted)),
        }
    }

    /// A closing event arrived: completed, failed, timed out, fired, signaled
    pub fn handle_completion_event(&mut self) -> Result<(), MachineError> {
        let allowed = match &self.payload {
            MachinePayload::Timer { .. } => matches!(
                self.state,
                CommandState::Initiated | CommandState::CancellationCommandSent
            ),
            MachinePayload::Activity { .. } | MachinePayload::ChildWorkflow { .. } => matches!(
                self.state,
                CommandState::Initiated
                    | CommandState::Started
                    | CommandState::CanceledBeforeInitiated
                    | CommandState::CanceledAfterInitiated
                    | CommandState::CanceledAfterStarted
                    | CommandState::CancellationCommandSent
            ),
            MachinePayload::Signal { .. } | MachinePayload::CancelExternal { .. } => matches!(
                self.state,
                CommandState::CommandSent
                    | CommandState::Initiated
                    | CommandState::CanceledBeforeInitiated
            ),
            MachinePayload::Marker { .. }
            | MachinePayload::UpsertSearchAttributes { .. }
            | MachinePayload::SelfCommand { .. } => false,
        };
        if !allowed {
            return Err(self.invalid(MachineAction::HandleCompletion));
        }
        self.transition(MachineAction::HandleCompletion, CommandState::Completed);
        Ok(())
    }

    /// The service acknowledged our cancel request
    pub fn handle_cancellation_initiated_event(&mut self) -> Result<(), MachineError> {
        match (&self.payload, self.state) {
            (
                MachinePayload::Activity { .. } | MachinePayload::ChildWorkflow { .. },
                CommandState::CancellationCommandSent
                | CommandState::CanceledAfterInitiated
                | CommandState::CanceledAfterStarted,
            ) => {
                self.audit
                    .push((MachineAction::HandleCancellationInitiated, self.state));
                Ok(())
            }
            _ => Err(self.invalid(MachineAction::HandleCancellationInitiated)),
        }
    }

    /// Our cancel request failed; the target keeps running
    pub fn handle_cancellation_failure_event(&mut self) -> Result<(), MachineError> {
        match (&self.payload, self.state) {
            (
                MachinePayload::Activity { .. } | MachinePayload::ChildWorkflow { .. },
                CommandState::CancellationCommandSent,
            ) => {
                self.transition(MachineAction::HandleCancellationFailure, CommandState::Initiated);
                Ok(())
            }
            _ => Err(self.invalid(MachineAction::HandleCancellationFailure)),
        }
    }

    /// The target was canceled
    pub fn handle_cancellation_event(&mut self) -> Result<(), MachineError> {
        match (&self.payload, self.state) {
            (
                MachinePayload::Timer { .. }
                | MachinePayload::Activity { .. }
                | MachinePayload::ChildWorkflow { .. },
                CommandState::CancellationCommandSent
                | CommandState::CanceledAfterInitiated
                | CommandState::CanceledAfterStarted,
            ) => {
                self.transition(MachineAction::HandleCancellation, CommandState::Completed);
                Ok(())
            }
            _ => Err(self.invalid(MachineAction::HandleCancellation)),
        }
    }

    /// The command could not be initiated at all
    pub fn handle_initiation_failed_event(&mut self) -> Result<(), MachineError> {
        match (&self.payload, self.state) {
            (
                MachinePayload::ChildWorkflow { .. },
                CommandState::Initiated
                | CommandState::CanceledAfterInitiated
                | CommandState::CancellationCommandSent,
            )
            | (
                MachinePayload::Signal { .. } | MachinePayload::CancelExternal { .. },
                CommandState::CommandSent
                | CommandState::Initiated
                | CommandState::CanceledBeforeInitiated,
            ) => {
                self.transition(MachineAction::HandleInitiationFailed, CommandState::Completed);
                Ok(())
            }
            _ => Err(self.invalid(MachineAction::HandleInitiationFailed)),
        }
    }

    fn transition(&mut self, action: MachineAction, next: CommandState) {
        self.audit.push((action, next));
        self.state = next;
    }

    fn invalid(&self, action: MachineAction) -> MachineError {
        let audit = self
            .audit
            .iter()
            .map(|(action, state)| format!("{action:?}->{state:?}"))
            .collect::<Vec<_>>()
            .join(", ");
        MachineError::InvalidTransition {
            id: self.id,
            state: self.state,
            action,
            audit,
        }
    }
}
