//! Command bookkeeping: machine registry, id allocation, event routing

use std::collections::HashMap;

use tracing::debug;

use crate::command::Command;
use crate::history::{EventAttributes, HistoryEvent};

use super::{
    CommandId, CommandState, CommandStateMachine, CommandTarget, MachineError, MachinePayload,
};

/// Owns the ordered set of live state machines and the bookkeeping that keeps
/// them aligned with history
///
/// Machines are keyed by the predicted id of their materializing event:
/// commands materialize in order right after the task's WorkflowTaskCompleted
/// event, so the allocator starts at `started_event_id + 2` on every task
/// boundary and advances once per emitted command.
pub struct CommandBookkeeper {
    machines: HashMap<CommandId, CommandStateMachine>,

    /// Insertion order, which is also outbound command order
    order: Vec<CommandId>,

    /// Caller-facing ids (timer id, activity id, ...) to machine ids
    by_user_id: HashMap<(CommandTarget, String), CommandId>,

    /// Extra routing entries, e.g. a child cancel receipt routed to the child
    /// machine
    aliases: HashMap<CommandId, CommandId>,

    /// Id of the most recent WorkflowTaskStarted event this executor consumed
    last_started_event_id: i64,

    /// Predicted id of the next command event
    next_command_event_id: i64,
}

impl Default for CommandBookkeeper {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandBookkeeper {
    pub fn new() -> Self {
        Self {
            machines: HashMap::new(),
            order: Vec::new(),
            by_user_id: HashMap::new(),
            aliases: HashMap::new(),
            last_started_event_id: 0,
            next_command_event_id: 0,
        }
    }

    pub fn last_started_event_id(&self) -> i64 {
        self.last_started_event_id
    }

    /// Record a task boundary
    ///
    /// Once any started event was observed, the batch's previous-started id
    /// must match ours exactly; a mismatch means the history the service
    /// holds and the commands this program produces have diverged.
    pub fn handle_workflow_task_started(
        &mut self,
        previous_started_event_id: i64,
        current_started_event_id: i64,
    ) -> Result<(), MachineError> {
        if self.last_started_event_id > 0
            && previous_started_event_id != self.last_started_event_id
        {
            return Err(MachineError::StartedEventSkew {
                expected: self.last_started_event_id,
                actual: previous_started_event_id,
            });
        }
        self.last_started_event_id = current_started_event_id;
        self.next_command_event_id = current_started_event_id + 2;
        self.prune_completed();
        Ok(())
    }

    /// Reset per-batch allocator state after the batch's receipts were
    /// consumed
    pub fn renotify_started(&mut self, current_started_event_id: i64) {
        self.next_command_event_id = current_started_event_id + 2;
    }

    /// Flip buffered machines to their sent states at a history boundary
    pub fn notify_command_sent(&mut self) {
        for id in &self.order {
            if let Some(machine) = self.machines.get_mut(id) {
                machine.notify_command_sent();
            }
        }
    }

    pub fn new_timer(&mut self, attributes: crate::command::StartTimerAttributes) -> CommandId {
        self.add_machine(CommandTarget::Timer, MachinePayload::Timer { attributes })
    }

    pub fn new_activity(
        &mut self,
        attributes: crate::command::ScheduleActivityAttributes,
    ) -> CommandId {
        self.add_machine(
            CommandTarget::Activity,
            MachinePayload::Activity { attributes },
        )
    }

    pub fn new_child_workflow(
        &mut self,
        attributes: crate::command::StartChildWorkflowAttributes,
    ) -> CommandId {
        self.add_machine(
            CommandTarget::ChildWorkflow,
            MachinePayload::ChildWorkflow { attributes },
        )
    }

    pub fn new_signal(&mut self, attributes: crate::command::SignalExternalAttributes) -> CommandId {
        self.add_machine(
            CommandTarget::Signal,
            MachinePayload::Signal {
                attributes,
                canceled: false,
            },
        )
    }

    pub fn new_cancel_external(
        &mut self,
        attributes: crate::command::RequestCancelExternalAttributes,
    ) -> CommandId {
        self.add_machine(
            CommandTarget::CancelExternal,
            MachinePayload::CancelExternal {
                attributes,
                canceled: false,
            },
        )
    }

    pub fn new_marker(&mut self, attributes: crate::command::RecordMarkerAttributes) -> CommandId {
        self.add_machine(CommandTarget::Marker, MachinePayload::Marker { attributes })
    }

    pub fn new_upsert_search_attributes(
        &mut self,
        attributes: std::collections::BTreeMap<String, serde_json::Value>,
    ) -> CommandId {
        self.add_machine(
            CommandTarget::UpsertSearchAttributes,
            MachinePayload::UpsertSearchAttributes { attributes },
        )
    }

    pub fn new_self_command(&mut self, command: Command) -> CommandId {
        self.add_machine(
            CommandTarget::SelfWorkflow,
            MachinePayload::SelfCommand { command },
        )
    }

    fn add_machine(&mut self, target: CommandTarget, payload: MachinePayload) -> CommandId {
        let id = CommandId::new(target, self.next_command_event_id);
        self.next_command_event_id += 1;

        let machine = CommandStateMachine::new(id, payload);
        let user_id = machine.user_id().to_string();
        if !user_id.is_empty() {
            self.by_user_id.insert((target, user_id), id);
        }
        self.machines.insert(id, machine);
        self.order.push(id);
        debug!(machine = %id, "created command state machine");
        id
    }

    /// Cancel the open machine registered under the caller-facing id
    ///
    /// Returns whether cancellation completed immediately. A cancel issued
    /// after initiation emits a cancel-request command, which consumes one
    /// predicted event id.
    pub fn cancel(&mut self, target: CommandTarget, user_id: &str) -> Result<bool, MachineError> {
        let id = *self
            .by_user_id
            .get(&(target, user_id.to_string()))
            .ok_or_else(|| MachineError::UnknownUserId {
                target,
                user_id: user_id.to_string(),
            })?;
        let machine = self
            .machines
            .get_mut(&id)
            .ok_or_else(|| MachineError::UnknownUserId {
                target,
                user_id: user_id.to_string(),
            })?;

        let was_canceling = matches!(
            machine.state(),
            CommandState::CanceledAfterInitiated | CommandState::CanceledAfterStarted
        );
        let immediate = machine.cancel()?;
        if !was_canceling {
            self.note_cancel_command(id);
        }
        Ok(immediate)
    }

    /// Account for a cancel-request command the machine now wants to emit
    fn note_cancel_command(&mut self, id: CommandId) {
        let (state, user_id) = match self.machines.get(&id) {
            Some(machine) => (machine.state(), machine.user_id().to_string()),
            None => return,
        };
        if !matches!(
            state,
            CommandState::CanceledAfterInitiated | CommandState::CanceledAfterStarted
        ) {
            return;
        }
        self.next_command_event_id += 1;
        if id.target == CommandTarget::ChildWorkflow {
            // The child's cancel request materializes as an external-cancel
            // receipt; register the child under that namespace so it routes.
            self.by_user_id
                .insert((CommandTarget::CancelExternal, user_id), id);
        }
    }

    fn resolve(&self, id: CommandId) -> Option<CommandId> {
        if self.machines.contains_key(&id) {
            Some(id)
        } else {
            self.aliases.get(&id).copied()
        }
    }

    pub fn machine(
        &self,
        target: CommandTarget,
        event_id: i64,
    ) -> Result<&CommandStateMachine, MachineError> {
        let id = CommandId::new(target, event_id);
        self.resolve(id)
            .and_then(|id| self.machines.get(&id))
            .ok_or(MachineError::UnknownMachine { target, event_id })
    }

    pub fn machine_mut(
        &mut self,
        target: CommandTarget,
        event_id: i64,
    ) -> Result<&mut CommandStateMachine, MachineError> {
        let id = self
            .resolve(CommandId::new(target, event_id))
            .ok_or(MachineError::UnknownMachine { target, event_id })?;
        self.machines
            .get_mut(&id)
            .ok_or(MachineError::UnknownMachine { target, event_id })
    }

    /// Feed a command event (receipt) to the machine it materializes
    ///
    /// A receipt nobody claims means the workflow produced different commands
    /// than history records, which is fatal.
    pub fn handle_command_event(&mut self, event: &HistoryEvent) -> Result<(), MachineError> {
        let Some((target, routed_id)) = event.machine_routing() else {
            return Ok(());
        };

        let id = match self.resolve(CommandId::new(target, routed_id)) {
            Some(id) => id,
            // A cancel-external receipt may belong to a child machine whose
            // cancel request we emitted.
            None if target == CommandTarget::CancelExternal => {
                let workflow_id = match &event.attributes {
                    EventAttributes::RequestCancelExternalWorkflowExecutionInitiated {
                        workflow_id,
                    } => workflow_id.clone(),
                    _ => {
                        return Err(MachineError::UnknownMachine {
                            target,
                            event_id: routed_id,
                        })
                    }
                };
                let id = *self
                    .by_user_id
                    .get(&(CommandTarget::CancelExternal, workflow_id))
                    .ok_or(MachineError::UnknownMachine {
                        target,
                        event_id: routed_id,
                    })?;
                self.aliases.insert(CommandId::new(target, routed_id), id);
                id
            }
            None => {
                return Err(MachineError::UnknownMachine {
                    target,
                    event_id: routed_id,
                })
            }
        };

        let machine = self
            .machines
            .get_mut(&id)
            .ok_or(MachineError::UnknownMachine {
                target,
                event_id: routed_id,
            })?;

        // A child machine routed through the alias treats the receipt as
        // acknowledgement of its cancel request, not as its own initiation.
        if id.target == CommandTarget::ChildWorkflow && target == CommandTarget::CancelExternal {
            machine.handle_cancellation_initiated_event()?;
            return Ok(());
        }

        let wants_cancel = machine.handle_initiated_event()?;
        if wants_cancel {
            self.note_cancel_command(id);
        }
        Ok(())
    }

    /// Outbound command list for this task, in machine creation order
    pub fn collect_commands(&self) -> Vec<Command> {
        self.order
            .iter()
            .filter_map(|id| self.machines.get(id))
            .filter(|machine| !machine.is_done())
            .filter_map(|machine| machine.command())
            .collect()
    }

    /// Number of machines not yet in a terminal state
    pub fn open_machines(&self) -> usize {
        self.machines.values().filter(|m| !m.is_done()).count()
    }

    fn prune_completed(&mut self) {
        let completed: Vec<CommandId> = self
            .machines
            .iter()
            .filter(|(_, m)| m.state() == CommandState::Completed)
            .map(|(id, _)| *id)
            .collect();
        if completed.is_empty() {
            return;
        }
        for id in &completed {
            self.machines.remove(id);
        }
        self.order.retain(|id| self.machines.contains_key(id));
        self.by_user_id.retain(|_, id| self.machines.contains_key(id));
        self.aliases.retain(|_, id| self.machines.contains_key(id));
        debug!(pruned = completed.len(), "pruned completed state machines");
    }
}
