//! Recording the outcome of an execute worker call: the decision point of the
//! per-process state machine.

use sqlx::{Postgres, Transaction};

use super::local_queue::publish_to_local_queue;
use super::{insert_state_and_immediate_task, rollback, PgProcessStore};
use crate::api_types::ThreadCloseType;
use crate::persistence::data_models::{
    encoded_object_to_bytes, ProcessExecutionStatus, StateExecutionSequenceMaps,
    StateExecutionStatus,
};
use crate::persistence::postgres::transactional;
use crate::persistence::{
    CompleteExecuteExecutionRequest, CompleteExecuteExecutionResponse, StoreError,
};

impl PgProcessStore {
    pub(crate) async fn do_complete_execute_execution(
        &self,
        request: CompleteExecuteExecutionRequest,
    ) -> Result<CompleteExecuteExecutionResponse, StoreError> {
        let mut tx = self.pool.begin().await?;
        match Self::complete_execute_tx(&mut tx, &request).await {
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

    async fn complete_execute_tx(
        tx: &mut Transaction<'_, Postgres>,
        request: &CompleteExecuteExecutionRequest,
    ) -> Result<CompleteExecuteExecutionResponse, StoreError> {
        let mut has_new_immediate_task = false;
        let seid = &request.state_execution_id;

        // The process row lock serializes all pending-map mutations.
        let prc_row =
            transactional::select_process_execution_for_update(tx, request.process_execution_id)
                .await?;

        // Step 1: the current state execution is done.
        transactional::update_async_state_execution_without_commands(
            tx,
            request.process_execution_id,
            &seid.state_id,
            seid.state_id_sequence,
            request.prepare.wait_until_status,
            StateExecutionStatus::Completed,
            None,
            request.prepare.previous_version,
        )
        .await?;

        // Step 2: remove it from the pending map; absence means the stored
        // map and the task stream disagree.
        let mut sequence_maps =
            StateExecutionSequenceMaps::from_bytes(&prc_row.state_execution_sequence_maps)?;
        sequence_maps.complete_state_execution(&seid.state_id, seid.state_id_sequence)?;

        // Step 3: open the decision's next states, reusing this state's info
        // blob (namespace, worker url, process type do not change).
        if !request.state_decision.next_states.is_empty() {
            has_new_immediate_task = true;
            let state_info = serde_json::to_vec(&request.prepare.info)?;

            for next in &request.state_decision.next_states {
                let state_id_sequence = sequence_maps.start_new_state_execution(&next.state_id);
                let state_input =
                    encoded_object_to_bytes(&next.state_input.clone().unwrap_or_default())?;
                insert_state_and_immediate_task(
                    tx,
                    request.process_execution_id,
                    &next.state_id,
                    state_id_sequence,
                    next.state_config.as_ref(),
                    &state_info,
                    &state_input,
                    request.task_shard_id,
                )
                .await?;
            }
        }

        // Step 4: close handling. A process already armed for graceful
        // completion finishes the moment the pending map drains, regardless
        // of this decision's close type.
        let mut status = ProcessExecutionStatus::from_i16(prc_row.status)?;
        let mut wait_to_complete = prc_row.wait_to_complete;
        let to_gracefully_complete = wait_to_complete && sequence_maps.pending_is_empty();
        let mut to_abort_running_states = false;

        if !to_gracefully_complete {
            if let Some(decision) = &request.state_decision.thread_close_decision {
                match decision.close_type {
                    ThreadCloseType::GracefulCompleteProcess => {
                        wait_to_complete = true;
                    }
                    ThreadCloseType::ForceCompleteProcess => {
                        to_abort_running_states = !sequence_maps.pending_is_empty();
                        status = ProcessExecutionStatus::Completed;
                        sequence_maps.clear_pending();
                    }
                    ThreadCloseType::ForceFailProcess => {
                        to_abort_running_states = !sequence_maps.pending_is_empty();
                        status = ProcessExecutionStatus::Failed;
                        sequence_maps.clear_pending();
                    }
                    ThreadCloseType::DeadEnd => {}
                }
            }
        }

        // a process with nothing pending is terminal: the last state closing
        // its thread (or just dead-ending) completes the process
        if status == ProcessExecutionStatus::Running && sequence_maps.pending_is_empty() {
            status = ProcessExecutionStatus::Completed;
        }

        if to_abort_running_states {
            transactional::batch_abort_running_state_executions(tx, request.process_execution_id)
                .await?;
        }

        transactional::update_process_execution(
            tx,
            request.process_execution_id,
            status,
            wait_to_complete,
            &sequence_maps.to_bytes()?,
            &prc_row.state_execution_waiting_queues,
        )
        .await?;

        // Step 5: messages published by the execute response.
        if publish_to_local_queue(
            tx,
            request.process_execution_id,
            &request.publish_to_local_queue,
        )
        .await?
        {
            has_new_immediate_task = true;
        }

        Ok(CompleteExecuteExecutionResponse {
            has_new_immediate_task,
        })
    }
}
