//! Local-queue publication and consumption.

use sqlx::{Postgres, Transaction};
use tracing::warn;
use uuid::Uuid;

use super::{rollback, PgProcessStore};
use crate::api_types::LocalQueueMessage;
use crate::persistence::data_models::{
    bytes_to_command_request, encoded_object_to_bytes, ImmediateTaskInfo, ImmediateTaskType,
    LocalQueueMessageInfo, ProcessExecutionStatus, StateExecutionStatus, StateExecutionWaitingQueues,
    StoredCommandResults, DEFAULT_SHARD_ID,
};
use crate::persistence::postgres::transactional;
use crate::persistence::{
    ProcessLocalQueueMessageRequest, ProcessLocalQueueMessageResponse, StoreError,
};

impl PgProcessStore {
    pub(crate) async fn do_process_local_queue_message(
        &self,
        request: ProcessLocalQueueMessageRequest,
    ) -> Result<ProcessLocalQueueMessageResponse, StoreError> {
        let mut tx = self.pool.begin().await?;
        match consume_local_queue_messages_tx(
            &mut tx,
            request.process_execution_id,
            request.messages,
            request.task_shard_id,
        )
        .await
        {
            Ok(has_new_immediate_task) => {
                tx.commit().await?;
                Ok(ProcessLocalQueueMessageResponse {
                    has_new_immediate_task,
                })
            }
            Err(err) => {
                rollback(tx).await;
                Err(err)
            }
        }
    }
}

/// Append published messages as durable rows plus the immediate tasks that
/// deliver them. Returns true when any task was inserted.
pub(crate) async fn publish_to_local_queue(
    tx: &mut Transaction<'_, Postgres>,
    process_execution_id: Uuid,
    messages: &[LocalQueueMessage],
) -> Result<bool, StoreError> {
    for message in messages {
        let dedup_id = message
            .dedup_id
            .as_deref()
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or_else(Uuid::new_v4);
        let payload = message.payload.clone().unwrap_or_default();

        transactional::insert_local_queue_message(
            tx,
            process_execution_id,
            &message.queue_name,
            dedup_id,
            &encoded_object_to_bytes(&payload)?,
        )
        .await?;

        let info = serde_json::to_vec(&ImmediateTaskInfo {
            worker_task_backoff_info: None,
            local_queue_message_info: Some(LocalQueueMessageInfo {
                queue_name: message.queue_name.clone(),
                dedup_id,
                payload,
            }),
        })?;
        transactional::insert_immediate_task(
            tx,
            DEFAULT_SHARD_ID,
            process_execution_id,
            "",
            0,
            ImmediateTaskType::NewLocalQueueMessage,
            Some(&info),
        )
        .await?;
    }
    Ok(!messages.is_empty())
}

/// Merge inbound messages into the waiting queues under the process row lock
/// and advance every state execution whose wait is now satisfied.
pub(crate) async fn consume_local_queue_messages_tx(
    tx: &mut Transaction<'_, Postgres>,
    process_execution_id: Uuid,
    messages: Vec<LocalQueueMessageInfo>,
    task_shard_id: i32,
) -> Result<bool, StoreError> {
    let prc_row = transactional::select_process_execution_for_update(tx, process_execution_id).await?;
    let status = ProcessExecutionStatus::from_i16(prc_row.status)?;
    let mut queues =
        StateExecutionWaitingQueues::from_bytes(&prc_row.state_execution_waiting_queues)?;

    for message in messages {
        queues.add_message(message);
    }

    let mut has_new_immediate_task = false;
    for plan in queues.collect_satisfiable() {
        let seid = plan.state_execution_id.clone();
        let row = transactional::select_async_state_execution(
            tx,
            process_execution_id,
            &seid.state_id,
            seid.state_id_sequence,
        )
        .await?;
        if StateExecutionStatus::from_i16(row.wait_until_status)? != StateExecutionStatus::Waiting {
            // the state already moved on; its leftover commands are garbage
            warn!(state_execution_id = %seid, "dropping waiting-queue commands of a non-waiting state");
            queues.remove_state(&seid);
            continue;
        }

        let command_request =
            bytes_to_command_request(row.wait_until_commands.as_deref().unwrap_or_default())?;
        let mut results = StoredCommandResults::from_bytes(
            row.wait_until_command_results.as_deref().unwrap_or_default(),
        )?;
        for (command_index, consumed) in plan.consumed {
            results.local_queue_results.insert(command_index, consumed);
        }

        // ANY_OF completes on the first satisfied command; ALL_OF needs the
        // full request (timers included) resolved.
        let satisfied = plan.any_of || results.satisfies(&command_request);
        let commands_bytes = row.wait_until_commands.unwrap_or_default();
        if satisfied {
            results.skip_unfired_timers(&command_request);
            transactional::update_async_state_execution_commands(
                tx,
                process_execution_id,
                &seid.state_id,
                seid.state_id_sequence,
                StateExecutionStatus::Completed,
                StateExecutionStatus::Running,
                &commands_bytes,
                &results.to_bytes()?,
                row.previous_version,
            )
            .await?;
            queues.remove_state(&seid);
            transactional::insert_immediate_task(
                tx,
                task_shard_id,
                process_execution_id,
                &seid.state_id,
                seid.state_id_sequence,
                ImmediateTaskType::Execute,
                None,
            )
            .await?;
            has_new_immediate_task = true;
        } else {
            // record what arrived; the state keeps waiting on the rest
            transactional::update_async_state_execution_commands(
                tx,
                process_execution_id,
                &seid.state_id,
                seid.state_id_sequence,
                StateExecutionStatus::Waiting,
                StateExecutionStatus::from_i16(row.execute_status)?,
                &commands_bytes,
                &results.to_bytes()?,
                row.previous_version,
            )
            .await?;
        }
    }

    transactional::update_process_execution(
        tx,
        process_execution_id,
        status,
        prc_row.wait_to_complete,
        &prc_row.state_execution_sequence_maps,
        &queues.to_bytes()?,
    )
    .await?;

    Ok(has_new_immediate_task)
}
