//! Applying fired timer tasks: timer commands and process timeouts.
//!
//! Backoff timers never reach here; the timer queue replays those as
//! immediate tasks so the worker-call path stays in one place.

use sqlx::{Postgres, Transaction};
use tracing::warn;

use super::{rollback, PgProcessStore};
use crate::persistence::data_models::{
    bytes_to_command_request, ImmediateTaskType, ProcessExecutionStatus,
    StateExecutionSequenceMaps, StateExecutionStatus, StateExecutionWaitingQueues,
    StoredCommandResults, TimerTask, TimerTaskType,
};
use crate::persistence::postgres::transactional;
use crate::persistence::{ProcessTimerTaskResponse, StoreError};

impl PgProcessStore {
    pub(crate) async fn do_process_timer_task(
        &self,
        task: TimerTask,
    ) -> Result<ProcessTimerTaskResponse, StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = match task.task_type {
            TimerTaskType::TimerCommand => Self::fire_timer_command_tx(&mut tx, &task).await,
            TimerTaskType::ProcessTimeout => Self::fire_process_timeout_tx(&mut tx, &task).await,
            TimerTaskType::WorkerTaskBackoff => Err(StoreError::Corruption(
                "backoff timer tasks are replayed as immediate tasks, not applied here".to_string(),
            )),
        };
        match result {
            Ok(response) => {
                tx.commit().await?;
                Ok(response)
            }
            Err(err) => {
                rollback(tx).await;
                Err(err)
            }
        }
    }

    async fn fire_timer_command_tx(
        tx: &mut Transaction<'_, Postgres>,
        task: &TimerTask,
    ) -> Result<ProcessTimerTaskResponse, StoreError> {
        let command_index = task.info.timer_command_index.ok_or_else(|| {
            StoreError::Corruption("timer command task without a command index".to_string())
        })?;

        let row = match transactional::select_async_state_execution(
            tx,
            task.process_execution_id,
            &task.state_id,
            task.state_id_sequence,
        )
        .await
        {
            Ok(row) => row,
            Err(StoreError::NotFound) => {
                warn!(state_execution_id = %task.state_execution_id(), "timer fired for a missing state execution");
                return Ok(ProcessTimerTaskResponse::default());
            }
            Err(err) => return Err(err),
        };

        if StateExecutionStatus::from_i16(row.wait_until_status)? != StateExecutionStatus::Waiting {
            // the wait already resolved through another command or an abort
            return Ok(ProcessTimerTaskResponse::default());
        }

        let command_request =
            bytes_to_command_request(row.wait_until_commands.as_deref().unwrap_or_default())?;
        let mut results = StoredCommandResults::from_bytes(
            row.wait_until_command_results.as_deref().unwrap_or_default(),
        )?;
        if results.timer_results.contains_key(&command_index) {
            return Ok(ProcessTimerTaskResponse::default());
        }
        results.timer_results.insert(command_index, true);

        let satisfied = results.satisfies(&command_request);
        let commands_bytes = row.wait_until_commands.unwrap_or_default();

        if !satisfied {
            transactional::update_async_state_execution_commands(
                tx,
                task.process_execution_id,
                &task.state_id,
                task.state_id_sequence,
                StateExecutionStatus::Waiting,
                StateExecutionStatus::from_i16(row.execute_status)?,
                &commands_bytes,
                &results.to_bytes()?,
                row.previous_version,
            )
            .await?;
            return Ok(ProcessTimerTaskResponse::default());
        }

        // Clean up waiting-queue commands this state registered before moving
        // it to the execute phase.
        if !command_request.local_queue_commands.is_empty() {
            let prc_row =
                transactional::select_process_execution_for_update(tx, task.process_execution_id)
                    .await?;
            let mut queues = StateExecutionWaitingQueues::from_bytes(
                &prc_row.state_execution_waiting_queues,
            )?;
            queues.remove_state(&task.state_execution_id());
            transactional::update_process_execution(
                tx,
                task.process_execution_id,
                ProcessExecutionStatus::from_i16(prc_row.status)?,
                prc_row.wait_to_complete,
                &prc_row.state_execution_sequence_maps,
                &queues.to_bytes()?,
            )
            .await?;
        }

        results.skip_unfired_timers(&command_request);
        transactional::update_async_state_execution_commands(
            tx,
            task.process_execution_id,
            &task.state_id,
            task.state_id_sequence,
            StateExecutionStatus::Completed,
            StateExecutionStatus::Running,
            &commands_bytes,
            &results.to_bytes()?,
            row.previous_version,
        )
        .await?;
        transactional::insert_immediate_task(
            tx,
            task.shard_id,
            task.process_execution_id,
            &task.state_id,
            task.state_id_sequence,
            ImmediateTaskType::Execute,
            None,
        )
        .await?;

        Ok(ProcessTimerTaskResponse {
            has_new_immediate_task: true,
        })
    }

    async fn fire_process_timeout_tx(
        tx: &mut Transaction<'_, Postgres>,
        task: &TimerTask,
    ) -> Result<ProcessTimerTaskResponse, StoreError> {
        let prc_row =
            transactional::select_process_execution_for_update(tx, task.process_execution_id)
                .await?;
        if ProcessExecutionStatus::from_i16(prc_row.status)? != ProcessExecutionStatus::Running {
            return Ok(ProcessTimerTaskResponse::default());
        }

        let mut sequence_maps =
            StateExecutionSequenceMaps::from_bytes(&prc_row.state_execution_sequence_maps)?;
        sequence_maps.clear_pending();

        transactional::batch_abort_running_state_executions(tx, task.process_execution_id).await?;
        transactional::update_process_execution(
            tx,
            task.process_execution_id,
            ProcessExecutionStatus::Timeout,
            prc_row.wait_to_complete,
            &sequence_maps.to_bytes()?,
            &prc_row.state_execution_waiting_queues,
        )
        .await?;

        Ok(ProcessTimerTaskResponse::default())
    }
}
