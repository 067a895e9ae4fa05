//! Moving a failed worker attempt onto the timer table, and failing a state
//! once retries are exhausted.

use super::{rollback, PgProcessStore};
use crate::persistence::data_models::{
    ImmediateTaskType, StateApiFailure, StateExecutionStatus, TimerTaskInfo, TimerTaskType,
};
use crate::persistence::postgres::transactional;
use crate::persistence::{BackoffImmediateTaskRequest, FailStateExecutionRequest, StoreError};

impl PgProcessStore {
    /// Record the failed attempt on the state row (status untouched, version
    /// bumped), drop the immediate task, and schedule the retry as a timer
    /// task carrying the attempt counters.
    pub(crate) async fn do_backoff_immediate_task(
        &self,
        request: BackoffImmediateTaskRequest,
    ) -> Result<(), StoreError> {
        let task = &request.task;
        let backoff_info = task.info.worker_task_backoff_info.ok_or_else(|| {
            StoreError::Corruption("backoff task without attempt counters".to_string())
        })?;

        let mut tx = self.pool.begin().await?;
        let result = async {
            let failure = serde_json::to_vec(&StateApiFailure {
                status_code: request.last_failure_status,
                details: request.last_failure_details.clone(),
                completed_attempts: backoff_info.completed_attempts,
            })?;
            transactional::update_async_state_execution_last_failure(
                &mut tx,
                task.process_execution_id,
                &task.state_id,
                task.state_id_sequence,
                &failure,
                request.prepare.previous_version,
            )
            .await?;

            if let Some(task_sequence) = task.task_sequence {
                transactional::delete_immediate_task(&mut tx, task.shard_id, task_sequence).await?;
            }

            let info = serde_json::to_vec(&TimerTaskInfo {
                worker_task_backoff_info: Some(backoff_info),
                worker_task_type: Some(task.task_type),
                timer_command_index: None,
            })?;
            transactional::insert_timer_task(
                &mut tx,
                task.shard_id,
                request.fire_timestamp_seconds,
                task.process_execution_id,
                &task.state_id,
                task.state_id_sequence,
                TimerTaskType::WorkerTaskBackoff,
                Some(&info),
            )
            .await
        }
        .await;

        match result {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(err) => {
                rollback(tx).await;
                Err(err)
            }
        }
    }

    /// Terminal failure of the running phase after retry exhaustion. The
    /// pending map is left untouched; siblings keep running.
    pub(crate) async fn do_fail_state_execution(
        &self,
        request: FailStateExecutionRequest,
    ) -> Result<(), StoreError> {
        let (wait_until_status, execute_status) = match request.failed_phase {
            ImmediateTaskType::WaitUntil => {
                (StateExecutionStatus::Failed, request.prepare.execute_status)
            }
            ImmediateTaskType::Execute => (
                request.prepare.wait_until_status,
                StateExecutionStatus::Failed,
            ),
            ImmediateTaskType::NewLocalQueueMessage => {
                return Err(StoreError::Corruption(
                    "local-queue message tasks have no phase to fail".to_string(),
                ));
            }
        };

        let failure = serde_json::to_vec(&StateApiFailure {
            status_code: request.last_failure_status,
            details: request.last_failure_details.clone(),
            completed_attempts: request.completed_attempts,
        })?;

        let mut tx = self.pool.begin().await?;
        let result = transactional::update_async_state_execution_without_commands(
            &mut tx,
            request.process_execution_id,
            &request.state_execution_id.state_id,
            request.state_execution_id.state_id_sequence,
            wait_until_status,
            execute_status,
            Some(&failure),
            request.prepare.previous_version,
        )
        .await;

        match result {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(err) => {
                rollback(tx).await;
                Err(err)
            }
        }
    }
}
