//! Persistence layer: the transactional process store and its data model.
//!
//! The storage backend is abstracted behind [`ProcessStore`], a capability
//! set of durable operations with tagged error kinds ([`StoreError`]). The
//! relational implementation lives in [`postgres`] (row CRUD) and
//! [`process_store`] (the state machine transactions built on it).

pub mod data_models;
pub mod postgres;
pub mod process_store;
mod store_error;

pub use process_store::PgProcessStore;
pub use store_error::StoreError;

use async_trait::async_trait;
use uuid::Uuid;

use crate::api_types::{
    CommandRequest, CommandResults, EncodedObject, LocalQueueMessage, ProcessExecutionDescribeResponse,
    ProcessExecutionStartRequest, StateDecision,
};
use data_models::{
    AsyncStateExecutionInfo, ImmediateTask, ImmediateTaskType, LocalQueueMessageInfo,
    StateExecutionId, StateExecutionStatus, TimerTask,
};

#[derive(Debug, Clone)]
pub struct StartProcessRequest {
    pub request: ProcessExecutionStartRequest,
    pub new_task_shard_id: i32,
}

#[derive(Debug, Clone)]
pub struct StartProcessResponse {
    pub process_execution_id: Uuid,
    pub already_started: bool,
    pub has_new_immediate_task: bool,
}

/// Snapshot of a state execution row taken before a worker call. The version
/// inside gates every subsequent write for this attempt.
#[derive(Debug, Clone)]
pub struct PrepareStateExecutionResponse {
    pub wait_until_status: StateExecutionStatus,
    pub execute_status: StateExecutionStatus,
    pub previous_version: i32,
    pub info: AsyncStateExecutionInfo,
    pub input: EncodedObject,
    pub wait_until_command_results: CommandResults,
}

#[derive(Debug, Clone)]
pub struct ProcessWaitUntilExecutionRequest {
    pub process_execution_id: Uuid,
    pub state_execution_id: StateExecutionId,
    pub prepare: PrepareStateExecutionResponse,
    pub command_request: CommandRequest,
    pub publish_to_local_queue: Vec<LocalQueueMessage>,
    pub task_shard_id: i32,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessWaitUntilExecutionResponse {
    pub has_new_immediate_task: bool,
    /// Fire times of timer tasks inserted for timer commands, for the
    /// notifier.
    pub timer_fire_timestamps: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct CompleteExecuteExecutionRequest {
    pub process_execution_id: Uuid,
    pub state_execution_id: StateExecutionId,
    pub prepare: PrepareStateExecutionResponse,
    pub state_decision: StateDecision,
    pub publish_to_local_queue: Vec<LocalQueueMessage>,
    pub task_shard_id: i32,
}

#[derive(Debug, Clone, Default)]
pub struct CompleteExecuteExecutionResponse {
    pub has_new_immediate_task: bool,
}

#[derive(Debug, Clone)]
pub struct BackoffImmediateTaskRequest {
    pub task: ImmediateTask,
    pub prepare: PrepareStateExecutionResponse,
    pub fire_timestamp_seconds: i64,
    pub last_failure_status: i32,
    pub last_failure_details: String,
}

#[derive(Debug, Clone)]
pub struct FailStateExecutionRequest {
    pub process_execution_id: Uuid,
    pub state_execution_id: StateExecutionId,
    pub prepare: PrepareStateExecutionResponse,
    pub failed_phase: ImmediateTaskType,
    pub last_failure_status: i32,
    pub last_failure_details: String,
    pub completed_attempts: i32,
}

#[derive(Debug, Clone)]
pub struct ProcessLocalQueueMessageRequest {
    pub process_execution_id: Uuid,
    pub messages: Vec<LocalQueueMessageInfo>,
    pub task_shard_id: i32,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessLocalQueueMessageResponse {
    pub has_new_immediate_task: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessTimerTaskResponse {
    pub has_new_immediate_task: bool,
}

/// Durable operations the engine and the public API are built on.
///
/// Process-level mutations are pessimistic (`SELECT ... FOR UPDATE` on the
/// process row), state-execution mutations are optimistic (version gate).
/// Implementations must keep that split.
#[async_trait]
pub trait ProcessStore: Send + Sync {
    /// Atomically insert the latest-process pointer, the optional first state
    /// execution with its immediate task, and the process row.
    async fn start_process(
        &self,
        request: StartProcessRequest,
    ) -> Result<StartProcessResponse, StoreError>;

    /// Resolve the most recent execution of a process id. `NotFound` when the
    /// id was never started.
    async fn describe_latest_process(
        &self,
        namespace: &str,
        process_id: &str,
    ) -> Result<ProcessExecutionDescribeResponse, StoreError>;

    /// Read-only snapshot of a state execution, with command results zipped
    /// from the stored request and sparse results.
    async fn prepare_state_execution(
        &self,
        process_execution_id: Uuid,
        state_execution_id: &StateExecutionId,
    ) -> Result<PrepareStateExecutionResponse, StoreError>;

    /// Record the outcome of a wait-until worker call.
    async fn process_wait_until_execution(
        &self,
        request: ProcessWaitUntilExecutionRequest,
    ) -> Result<ProcessWaitUntilExecutionResponse, StoreError>;

    /// Record the outcome of an execute worker call, advancing the pending
    /// map and applying any thread-close decision.
    async fn complete_execute_execution(
        &self,
        request: CompleteExecuteExecutionRequest,
    ) -> Result<CompleteExecuteExecutionResponse, StoreError>;

    /// Move a failed worker attempt from the immediate table to a timer task
    /// firing at the next backoff interval.
    async fn backoff_immediate_task(
        &self,
        request: BackoffImmediateTaskRequest,
    ) -> Result<(), StoreError>;

    /// Mark the running phase of a state execution failed after retry
    /// exhaustion.
    async fn fail_state_execution(
        &self,
        request: FailStateExecutionRequest,
    ) -> Result<(), StoreError>;

    /// Consume published local-queue messages into waiting state executions.
    async fn process_local_queue_message(
        &self,
        request: ProcessLocalQueueMessageRequest,
    ) -> Result<ProcessLocalQueueMessageResponse, StoreError>;

    /// Apply a fired timer task (timer command or process timeout). Backoff
    /// timers are not handled here; the timer queue replays those as
    /// immediate tasks.
    async fn process_timer_task(
        &self,
        task: TimerTask,
    ) -> Result<ProcessTimerTaskResponse, StoreError>;

    async fn batch_select_immediate_tasks(
        &self,
        shard_id: i32,
        start_sequence_inclusive: i64,
        page_size: i32,
    ) -> Result<Vec<ImmediateTask>, StoreError>;

    async fn batch_delete_immediate_tasks(
        &self,
        shard_id: i32,
        min_sequence_inclusive: i64,
        max_sequence_inclusive: i64,
    ) -> Result<(), StoreError>;

    async fn batch_select_timer_tasks(
        &self,
        shard_id: i32,
        max_fire_time_unix_seconds_inclusive: i64,
        page_size: i32,
    ) -> Result<Vec<TimerTask>, StoreError>;

    async fn select_timer_tasks_for_timestamps(
        &self,
        shard_id: i32,
        fire_timestamps: &[i64],
        min_sequence_inclusive: i64,
    ) -> Result<Vec<TimerTask>, StoreError>;

    async fn delete_timer_task(
        &self,
        shard_id: i32,
        fire_time_unix_seconds: i64,
        task_sequence: i64,
    ) -> Result<(), StoreError>;
}
