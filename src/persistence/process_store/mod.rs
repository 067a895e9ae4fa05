//! The process store: every durable state transition of the engine, each one
//! a single transaction.
//!
//! The process row lock (`SELECT ... FOR UPDATE`) serializes mutations of the
//! pending-execution map and the waiting queues; state execution rows advance
//! through optimistic version gates. Side-effect rows (immediate tasks, timer
//! tasks, local-queue messages) are inserted in the same transaction as the
//! transition that schedules them.

mod backoff_task;
mod complete_execute;
mod local_queue;
mod prepare_state;
mod start_process;
mod tasks;
mod timer_task;
mod wait_until;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::error;
use uuid::Uuid;

use crate::api_types::{AsyncStateConfig, ProcessExecutionDescribeResponse};
use crate::persistence::data_models::{
    ImmediateTask, ImmediateTaskType, StateExecutionId, StateExecutionStatus, TimerTask,
};
use crate::persistence::postgres::transactional;
use crate::persistence::{
    BackoffImmediateTaskRequest, CompleteExecuteExecutionRequest, CompleteExecuteExecutionResponse,
    FailStateExecutionRequest, PrepareStateExecutionResponse, ProcessLocalQueueMessageRequest,
    ProcessLocalQueueMessageResponse, ProcessStore, ProcessTimerTaskResponse,
    ProcessWaitUntilExecutionRequest, ProcessWaitUntilExecutionResponse, StartProcessRequest,
    StartProcessResponse, StoreError,
};

/// Relational implementation of [`ProcessStore`].
#[derive(Clone)]
pub struct PgProcessStore {
    pool: PgPool,
}

impl PgProcessStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Roll back a failed transaction, logging (not masking) rollback errors.
pub(crate) async fn rollback(tx: Transaction<'_, Postgres>) {
    if let Err(err) = tx.rollback().await {
        error!(?err, "error on rollback transaction");
    }
}

/// Initial phase statuses for a fresh state execution.
pub(crate) fn initial_statuses(
    state_config: Option<&AsyncStateConfig>,
) -> (StateExecutionStatus, StateExecutionStatus) {
    if state_config.is_some_and(|c| c.skip_wait_until) {
        (StateExecutionStatus::Skipped, StateExecutionStatus::Running)
    } else {
        (
            StateExecutionStatus::Running,
            StateExecutionStatus::Undefined,
        )
    }
}

/// Insert a state execution row and the immediate task that drives its first
/// phase.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn insert_state_and_immediate_task(
    tx: &mut Transaction<'_, Postgres>,
    process_execution_id: Uuid,
    state_id: &str,
    state_id_sequence: i32,
    state_config: Option<&AsyncStateConfig>,
    info: &[u8],
    input: &[u8],
    shard_id: i32,
) -> Result<(), StoreError> {
    let (wait_until_status, execute_status) = initial_statuses(state_config);
    transactional::insert_async_state_execution(
        tx,
        process_execution_id,
        state_id,
        state_id_sequence,
        wait_until_status,
        execute_status,
        info,
        input,
    )
    .await?;

    let task_type = if state_config.is_some_and(|c| c.skip_wait_until) {
        ImmediateTaskType::Execute
    } else {
        ImmediateTaskType::WaitUntil
    };
    transactional::insert_immediate_task(
        tx,
        shard_id,
        process_execution_id,
        state_id,
        state_id_sequence,
        task_type,
        None,
    )
    .await
}

#[async_trait]
impl ProcessStore for PgProcessStore {
    async fn start_process(
        &self,
        request: StartProcessRequest,
    ) -> Result<StartProcessResponse, StoreError> {
        self.do_start_process(request).await
    }

    async fn describe_latest_process(
        &self,
        namespace: &str,
        process_id: &str,
    ) -> Result<ProcessExecutionDescribeResponse, StoreError> {
        self.do_describe_latest_process(namespace, process_id).await
    }

    async fn prepare_state_execution(
        &self,
        process_execution_id: Uuid,
        state_execution_id: &StateExecutionId,
    ) -> Result<PrepareStateExecutionResponse, StoreError> {
        self.do_prepare_state_execution(process_execution_id, state_execution_id)
            .await
    }

    async fn process_wait_until_execution(
        &self,
        request: ProcessWaitUntilExecutionRequest,
    ) -> Result<ProcessWaitUntilExecutionResponse, StoreError> {
        self.do_process_wait_until_execution(request).await
    }

    async fn complete_execute_execution(
        &self,
        request: CompleteExecuteExecutionRequest,
    ) -> Result<CompleteExecuteExecutionResponse, StoreError> {
        self.do_complete_execute_execution(request).await
    }

    async fn backoff_immediate_task(
        &self,
        request: BackoffImmediateTaskRequest,
    ) -> Result<(), StoreError> {
        self.do_backoff_immediate_task(request).await
    }

    async fn fail_state_execution(
        &self,
        request: FailStateExecutionRequest,
    ) -> Result<(), StoreError> {
        self.do_fail_state_execution(request).await
    }

    async fn process_local_queue_message(
        &self,
        request: ProcessLocalQueueMessageRequest,
    ) -> Result<ProcessLocalQueueMessageResponse, StoreError> {
        self.do_process_local_queue_message(request).await
    }

    async fn process_timer_task(
        &self,
        task: TimerTask,
    ) -> Result<ProcessTimerTaskResponse, StoreError> {
        self.do_process_timer_task(task).await
    }

    async fn batch_select_immediate_tasks(
        &self,
        shard_id: i32,
        start_sequence_inclusive: i64,
        page_size: i32,
    ) -> Result<Vec<ImmediateTask>, StoreError> {
        self.do_batch_select_immediate_tasks(shard_id, start_sequence_inclusive, page_size)
            .await
    }

    async fn batch_delete_immediate_tasks(
        &self,
        shard_id: i32,
        min_sequence_inclusive: i64,
        max_sequence_inclusive: i64,
    ) -> Result<(), StoreError> {
        self.do_batch_delete_immediate_tasks(
            shard_id,
            min_sequence_inclusive,
            max_sequence_inclusive,
        )
        .await
    }

    async fn batch_select_timer_tasks(
        &self,
        shard_id: i32,
        max_fire_time_unix_seconds_inclusive: i64,
        page_size: i32,
    ) -> Result<Vec<TimerTask>, StoreError> {
        self.do_batch_select_timer_tasks(
            shard_id,
            max_fire_time_unix_seconds_inclusive,
            page_size,
        )
        .await
    }

    async fn select_timer_tasks_for_timestamps(
        &self,
        shard_id: i32,
        fire_timestamps: &[i64],
        min_sequence_inclusive: i64,
    ) -> Result<Vec<TimerTask>, StoreError> {
        self.do_select_timer_tasks_for_timestamps(shard_id, fire_timestamps, min_sequence_inclusive)
            .await
    }

    async fn delete_timer_task(
        &self,
        shard_id: i32,
        fire_time_unix_seconds: i64,
        task_sequence: i64,
    ) -> Result<(), StoreError> {
        self.do_delete_timer_task(shard_id, fire_time_unix_seconds, task_sequence)
            .await
    }
}
