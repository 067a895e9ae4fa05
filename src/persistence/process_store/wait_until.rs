//! Recording the outcome of a wait-until worker call.

use chrono::Utc;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use super::local_queue::{consume_local_queue_messages_tx, publish_to_local_queue};
use super::{rollback, PgProcessStore};
use crate::api_types::{CommandRequest, CommandWaitingType};
use crate::persistence::data_models::{
    command_request_to_bytes, ImmediateTaskType, ProcessExecutionStatus, StateExecutionId,
    StateExecutionStatus, StateExecutionWaitingQueues, StoredCommandResults, TimerTaskInfo,
    TimerTaskType,
};
use crate::persistence::postgres::transactional;
use crate::persistence::{
    ProcessWaitUntilExecutionRequest, ProcessWaitUntilExecutionResponse, StoreError,
};

impl PgProcessStore {
    pub(crate) async fn do_process_wait_until_execution(
        &self,
        request: ProcessWaitUntilExecutionRequest,
    ) -> Result<ProcessWaitUntilExecutionResponse, StoreError> {
        let mut tx = self.pool.begin().await?;
        match Self::process_wait_until_tx(&mut tx, &request).await {
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

    async fn process_wait_until_tx(
        tx: &mut Transaction<'_, Postgres>,
        request: &ProcessWaitUntilExecutionRequest,
    ) -> Result<ProcessWaitUntilExecutionResponse, StoreError> {
        let mut response = ProcessWaitUntilExecutionResponse::default();

        if request.command_request.is_empty() {
            complete_wait_until_execution(
                tx,
                request.process_execution_id,
                &request.state_execution_id,
                request.prepare.previous_version,
                request.task_shard_id,
            )
            .await?;
            response.has_new_immediate_task = true;
        } else {
            let updated = update_wait_until_execution(tx, request).await?;
            response.has_new_immediate_task = updated.has_new_immediate_task;
            response.timer_fire_timestamps = updated.timer_fire_timestamps;
        }

        if publish_to_local_queue(
            tx,
            request.process_execution_id,
            &request.publish_to_local_queue,
        )
        .await?
        {
            response.has_new_immediate_task = true;
        }

        Ok(response)
    }
}

/// Empty command request: the wait-until phase is complete, move straight to
/// the execute phase.
pub(crate) async fn complete_wait_until_execution(
    tx: &mut Transaction<'_, Postgres>,
    process_execution_id: Uuid,
    state_execution_id: &StateExecutionId,
    previous_version: i32,
    task_shard_id: i32,
) -> Result<(), StoreError> {
    transactional::update_async_state_execution_without_commands(
        tx,
        process_execution_id,
        &state_execution_id.state_id,
        state_execution_id.state_id_sequence,
        StateExecutionStatus::Completed,
        StateExecutionStatus::Running,
        None,
        previous_version,
    )
    .await?;

    transactional::insert_immediate_task(
        tx,
        task_shard_id,
        process_execution_id,
        &state_execution_id.state_id,
        state_execution_id.state_id_sequence,
        ImmediateTaskType::Execute,
        None,
    )
    .await
}

async fn update_wait_until_execution(
    tx: &mut Transaction<'_, Postgres>,
    request: &ProcessWaitUntilExecutionRequest,
) -> Result<ProcessWaitUntilExecutionResponse, StoreError> {
    let command_request = &request.command_request;
    let seid = &request.state_execution_id;
    let any_of = command_request.waiting_type == CommandWaitingType::AnyOfCompletion;

    // Step 1: register local-queue commands on the process row, under its
    // lock.
    let mut to_consume_unconsumed_messages = false;
    if !command_request.local_queue_commands.is_empty() {
        let prc_row = transactional::select_process_execution_for_update(
            tx,
            request.process_execution_id,
        )
        .await?;
        let mut queues =
            StateExecutionWaitingQueues::from_bytes(&prc_row.state_execution_waiting_queues)?;

        for (command_index, command) in command_request.local_queue_commands.iter().enumerate() {
            queues.add_command(
                seid.clone(),
                &command.queue_name,
                command_index,
                command.required_count(),
                any_of,
            );
        }

        to_consume_unconsumed_messages = queues.has_unconsumed_messages();

        transactional::update_process_execution(
            tx,
            request.process_execution_id,
            ProcessExecutionStatus::from_i16(prc_row.status)?,
            prc_row.wait_to_complete,
            &prc_row.state_execution_sequence_maps,
            &queues.to_bytes()?,
        )
        .await?;
    }

    // Step 2: persist the command request and move the state to Waiting.
    transactional::update_async_state_execution_commands(
        tx,
        request.process_execution_id,
        &seid.state_id,
        seid.state_id_sequence,
        StateExecutionStatus::Waiting,
        request.prepare.execute_status,
        &command_request_to_bytes(command_request)?,
        &StoredCommandResults::default().to_bytes()?,
        request.prepare.previous_version,
    )
    .await?;

    // Step 3: a timer task per timer command.
    let timer_fire_timestamps =
        insert_timer_command_tasks(tx, request, command_request).await?;

    // Step 4: consume messages that arrived before this state started
    // waiting.
    let mut has_new_immediate_task = false;
    if to_consume_unconsumed_messages {
        has_new_immediate_task = consume_local_queue_messages_tx(
            tx,
            request.process_execution_id,
            Vec::new(),
            request.task_shard_id,
        )
        .await?;
    }

    Ok(ProcessWaitUntilExecutionResponse {
        has_new_immediate_task,
        timer_fire_timestamps,
    })
}

async fn insert_timer_command_tasks(
    tx: &mut Transaction<'_, Postgres>,
    request: &ProcessWaitUntilExecutionRequest,
    command_request: &CommandRequest,
) -> Result<Vec<i64>, StoreError> {
    let now = Utc::now().timestamp();
    let mut fire_timestamps = Vec::with_capacity(command_request.timer_commands.len());
    for (command_index, timer) in command_request.timer_commands.iter().enumerate() {
        let fire_time = now + timer.delay_in_seconds.max(0);
        let info = serde_json::to_vec(&TimerTaskInfo {
            worker_task_backoff_info: None,
            worker_task_type: None,
            timer_command_index: Some(command_index),
        })?;
        transactional::insert_timer_task(
            tx,
            request.task_shard_id,
            fire_time,
            request.process_execution_id,
            &request.state_execution_id.state_id,
            request.state_execution_id.state_id_sequence,
            TimerTaskType::TimerCommand,
            Some(&info),
        )
        .await?;
        fire_timestamps.push(fire_time);
    }
    Ok(fire_timestamps)
}
