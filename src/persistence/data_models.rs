//! Durable row attributes and the serialized blobs carried on them.
//!
//! The process execution row owns two JSON blobs that this module models in
//! full: the state-execution sequence maps (per-state sequence counters plus
//! the pending-execution map) and the waiting queues (local-queue commands
//! states are blocked on, plus unconsumed messages). Both are mutated only
//! under the process row lock.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api_types::{CommandRequest, CommandWaitingType, EncodedObject};
use crate::persistence::StoreError;

/// Shard used until a placement layer assigns others.
pub const DEFAULT_SHARD_ID: i32 = 0;

/// Status of one phase of an async state execution. The numeric encodings are
/// part of the storage contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i16)]
pub enum StateExecutionStatus {
    Undefined = 0,
    Running = 1,
    Waiting = 2,
    Completed = 3,
    Skipped = 4,
    Aborted = 5,
    Failed = 6,
}

impl StateExecutionStatus {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Result<Self, StoreError> {
        Ok(match value {
            0 => Self::Undefined,
            1 => Self::Running,
            2 => Self::Waiting,
            3 => Self::Completed,
            4 => Self::Skipped,
            5 => Self::Aborted,
            6 => Self::Failed,
            other => {
                return Err(StoreError::Corruption(format!(
                    "unknown state execution status {other}"
                )));
            }
        })
    }
}

/// Status of a process execution. Terminal statuses are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i16)]
pub enum ProcessExecutionStatus {
    Running = 1,
    Completed = 2,
    Failed = 3,
    Timeout = 4,
    Terminated = 5,
}

impl ProcessExecutionStatus {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Result<Self, StoreError> {
        Ok(match value {
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Failed,
            4 => Self::Timeout,
            5 => Self::Terminated,
            other => {
                return Err(StoreError::Corruption(format!(
                    "unknown process execution status {other}"
                )));
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i16)]
pub enum ImmediateTaskType {
    WaitUntil = 1,
    Execute = 2,
    NewLocalQueueMessage = 3,
}

impl ImmediateTaskType {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Result<Self, StoreError> {
        Ok(match value {
            1 => Self::WaitUntil,
            2 => Self::Execute,
            3 => Self::NewLocalQueueMessage,
            other => {
                return Err(StoreError::Corruption(format!(
                    "unknown immediate task type {other}"
                )));
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i16)]
pub enum TimerTaskType {
    WorkerTaskBackoff = 1,
    TimerCommand = 2,
    ProcessTimeout = 3,
}

impl TimerTaskType {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Result<Self, StoreError> {
        Ok(match value {
            1 => Self::WorkerTaskBackoff,
            2 => Self::TimerCommand,
            3 => Self::ProcessTimeout,
            other => {
                return Err(StoreError::Corruption(format!(
                    "unknown timer task type {other}"
                )));
            }
        })
    }
}

/// Identifies one attempt at one state within a process execution.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateExecutionId {
    pub state_id: String,
    pub state_id_sequence: i32,
}

impl fmt::Display for StateExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.state_id, self.state_id_sequence)
    }
}

/// Static info copied onto every state execution row so the processor can
/// reach the worker without touching the process row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncStateExecutionInfo {
    pub namespace: String,
    pub process_id: String,
    pub process_type: String,
    pub worker_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_config: Option<crate::api_types::AsyncStateConfig>,
}

/// Info blob on the process execution row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessExecutionInfo {
    pub process_type: String,
    pub worker_url: String,
}

/// Per-state sequence counters and the pending-execution map, serialized as
/// one blob on the process execution row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateExecutionSequenceMaps {
    /// state id -> next sequence to hand out
    #[serde(default)]
    pub sequence_map: BTreeMap<String, i32>,
    /// state id -> sequences currently pending
    #[serde(default)]
    pub pending_execution_map: BTreeMap<String, BTreeSet<i32>>,
}

impl StateExecutionSequenceMaps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next sequence for `state_id` and mark it pending.
    pub fn start_new_state_execution(&mut self, state_id: &str) -> i32 {
        let counter = self.sequence_map.entry(state_id.to_string()).or_insert(0);
        *counter += 1;
        let seq = *counter;
        self.pending_execution_map
            .entry(state_id.to_string())
            .or_default()
            .insert(seq);
        seq
    }

    /// Remove a completed state execution from the pending map. Completing an
    /// entry that is not pending means the stored map no longer agrees with
    /// the task stream.
    pub fn complete_state_execution(
        &mut self,
        state_id: &str,
        state_id_sequence: i32,
    ) -> Result<(), StoreError> {
        let removed = match self.pending_execution_map.get_mut(state_id) {
            Some(seqs) => seqs.remove(&state_id_sequence),
            None => false,
        };
        if !removed {
            return Err(StoreError::Corruption(format!(
                "completing a non-existing state execution {state_id}-{state_id_sequence}, \
                 current map: {:?}",
                self.pending_execution_map
            )));
        }
        if self
            .pending_execution_map
            .get(state_id)
            .is_some_and(BTreeSet::is_empty)
        {
            self.pending_execution_map.remove(state_id);
        }
        Ok(())
    }

    pub fn pending_is_empty(&self) -> bool {
        self.pending_execution_map.values().all(BTreeSet::is_empty)
    }

    pub fn clear_pending(&mut self) {
        self.pending_execution_map.clear();
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A local-queue message as carried in task info blobs and stored results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalQueueMessageInfo {
    pub queue_name: String,
    pub dedup_id: Uuid,
    #[serde(default)]
    pub payload: EncodedObject,
}

/// One local-queue command a waiting state execution is blocked on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingLocalQueueCommand {
    pub state_execution_id: StateExecutionId,
    /// Index of this command in the state's command request.
    pub command_index: usize,
    pub count: i32,
    /// True when the state waits ANY_OF its commands, false for ALL_OF.
    pub any_of: bool,
}

/// A planned consumption for one satisfiable local-queue command.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalQueueCommandConsumption {
    pub state_execution_id: StateExecutionId,
    pub any_of: bool,
    /// command index -> messages that complete it
    pub consumed: BTreeMap<usize, Vec<LocalQueueMessageInfo>>,
}

/// Waiting-queue blob on the process execution row: which state executions
/// wait on which queues, and which published messages nobody consumed yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateExecutionWaitingQueues {
    /// queue name -> waiting commands in registration order
    #[serde(default)]
    pub waiting_commands: BTreeMap<String, Vec<WaitingLocalQueueCommand>>,
    /// queue name -> unconsumed messages in publish order
    #[serde(default)]
    pub unconsumed_messages: BTreeMap<String, Vec<LocalQueueMessageInfo>>,
}

impl StateExecutionWaitingQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a local-queue command for a waiting state execution.
    pub fn add_command(
        &mut self,
        state_execution_id: StateExecutionId,
        queue_name: &str,
        command_index: usize,
        count: i32,
        any_of: bool,
    ) {
        self.waiting_commands
            .entry(queue_name.to_string())
            .or_default()
            .push(WaitingLocalQueueCommand {
                state_execution_id,
                command_index,
                count,
                any_of,
            });
    }

    /// Append a published message, ignoring dedup-id repeats on the same
    /// queue.
    pub fn add_message(&mut self, message: LocalQueueMessageInfo) {
        let messages = self
            .unconsumed_messages
            .entry(message.queue_name.clone())
            .or_default();
        if messages.iter().any(|m| m.dedup_id == message.dedup_id) {
            return;
        }
        messages.push(message);
    }

    pub fn has_unconsumed_messages(&self) -> bool {
        self.unconsumed_messages.values().any(|m| !m.is_empty())
    }

    /// Match unconsumed messages against waiting commands.
    ///
    /// Each message feeds the first command on its queue (registration order)
    /// that still needs messages. A command whose `count` is met is drained
    /// into the returned consumption plan and removed; the matched messages
    /// leave the unconsumed pool. Commands left short keep waiting and their
    /// queue keeps its remaining messages.
    pub fn collect_satisfiable(&mut self) -> Vec<LocalQueueCommandConsumption> {
        let mut plans: BTreeMap<StateExecutionId, LocalQueueCommandConsumption> = BTreeMap::new();
        let queue_names: Vec<String> = self.waiting_commands.keys().cloned().collect();

        for queue_name in queue_names {
            loop {
                let available = self
                    .unconsumed_messages
                    .get(&queue_name)
                    .map_or(0, Vec::len);
                if available == 0 {
                    break;
                }
                let commands = match self.waiting_commands.get_mut(&queue_name) {
                    Some(commands) => commands,
                    None => break,
                };
                let Some(pos) = commands.iter().position(|c| c.count as usize <= available)
                else {
                    break;
                };
                let command = commands.remove(pos);
                if commands.is_empty() {
                    self.waiting_commands.remove(&queue_name);
                }
                let messages = self
                    .unconsumed_messages
                    .get_mut(&queue_name)
                    .expect("checked non-empty above");
                let consumed: Vec<LocalQueueMessageInfo> =
                    messages.drain(..command.count as usize).collect();
                if messages.is_empty() {
                    self.unconsumed_messages.remove(&queue_name);
                }
                plans
                    .entry(command.state_execution_id.clone())
                    .or_insert_with(|| LocalQueueCommandConsumption {
                        state_execution_id: command.state_execution_id.clone(),
                        any_of: command.any_of,
                        consumed: BTreeMap::new(),
                    })
                    .consumed
                    .insert(command.command_index, consumed);
            }
        }

        plans.into_values().collect()
    }

    /// Drop every waiting command of a state execution, on all queues. Used
    /// when the state leaves the waiting status.
    pub fn remove_state(&mut self, state_execution_id: &StateExecutionId) {
        self.waiting_commands.retain(|_, commands| {
            commands.retain(|c| &c.state_execution_id != state_execution_id);
            !commands.is_empty()
        });
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Sparse command results stored on the state execution row. Keys are command
/// indexes in the stored command request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCommandResults {
    /// timer index -> fired (true) or skipped (false)
    #[serde(default)]
    pub timer_results: BTreeMap<usize, bool>,
    /// local-queue command index -> consumed messages
    #[serde(default)]
    pub local_queue_results: BTreeMap<usize, Vec<LocalQueueMessageInfo>>,
}

impl StoredCommandResults {
    /// Whether the stored command request is fully satisfied given these
    /// results.
    pub fn satisfies(&self, request: &CommandRequest) -> bool {
        match request.waiting_type {
            CommandWaitingType::EmptyCommand => true,
            CommandWaitingType::AnyOfCompletion => {
                let timer_fired = self.timer_results.values().any(|fired| *fired);
                let queue_done = !self.local_queue_results.is_empty();
                timer_fired || queue_done
            }
            CommandWaitingType::AllOfCompletion => {
                let timers_done = (0..request.timer_commands.len())
                    .all(|idx| self.timer_results.get(&idx) == Some(&true));
                let queues_done = (0..request.local_queue_commands.len())
                    .all(|idx| self.local_queue_results.contains_key(&idx));
                timers_done && queues_done
            }
        }
    }

    /// Mark every unresolved timer command skipped. Applied when an ANY_OF
    /// wait completes through another command.
    pub fn skip_unfired_timers(&mut self, request: &CommandRequest) {
        for idx in 0..request.timer_commands.len() {
            self.timer_results.entry(idx).or_insert(false);
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Attempt counters carried across retries of a worker API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerTaskBackoffInfo {
    pub completed_attempts: i32,
    pub first_attempt_timestamp_seconds: i64,
}

/// Info blob on an immediate task row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImmediateTaskInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_task_backoff_info: Option<WorkerTaskBackoffInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_queue_message_info: Option<LocalQueueMessageInfo>,
}

/// Info blob on a timer task row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerTaskInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_task_backoff_info: Option<WorkerTaskBackoffInfo>,
    /// Which phase task a fired backoff timer resumes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_task_type: Option<ImmediateTaskType>,
    /// Which timer command a TimerCommand task fires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer_command_index: Option<usize>,
}

/// An immediate task as read from its shard table.
#[derive(Debug, Clone, PartialEq)]
pub struct ImmediateTask {
    pub shard_id: i32,
    /// Absent for tasks rebuilt from a fired backoff timer.
    pub task_sequence: Option<i64>,
    pub task_type: ImmediateTaskType,
    pub process_execution_id: Uuid,
    pub state_id: String,
    pub state_id_sequence: i32,
    pub info: ImmediateTaskInfo,
}

impl ImmediateTask {
    pub fn state_execution_id(&self) -> StateExecutionId {
        StateExecutionId {
            state_id: self.state_id.clone(),
            state_id_sequence: self.state_id_sequence,
        }
    }
}

/// A timer task as read from its shard table.
#[derive(Debug, Clone, PartialEq)]
pub struct TimerTask {
    pub shard_id: i32,
    pub fire_timestamp_seconds: i64,
    pub task_sequence: Option<i64>,
    pub task_type: TimerTaskType,
    pub process_execution_id: Uuid,
    pub state_id: String,
    pub state_id_sequence: i32,
    pub info: TimerTaskInfo,
}

impl TimerTask {
    pub fn state_execution_id(&self) -> StateExecutionId {
        StateExecutionId {
            state_id: self.state_id.clone(),
            state_id_sequence: self.state_id_sequence,
        }
    }
}

/// Failure detail recorded on the state execution row after a failed worker
/// attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateApiFailure {
    pub status_code: i32,
    pub details: String,
    pub completed_attempts: i32,
}

pub fn encoded_object_to_bytes(obj: &EncodedObject) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(obj)?)
}

pub fn bytes_to_encoded_object(bytes: &[u8]) -> Result<EncodedObject, StoreError> {
    if bytes.is_empty() {
        return Ok(EncodedObject::default());
    }
    Ok(serde_json::from_slice(bytes)?)
}

pub fn command_request_to_bytes(request: &CommandRequest) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(request)?)
}

pub fn bytes_to_command_request(bytes: &[u8]) -> Result<CommandRequest, StoreError> {
    if bytes.is_empty() {
        return Ok(CommandRequest::default());
    }
    Ok(serde_json::from_slice(bytes)?)
}
