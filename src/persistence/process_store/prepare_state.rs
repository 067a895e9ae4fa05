//! Read-only snapshot of a state execution, with command results materialized
//! for the worker.

use uuid::Uuid;

use super::PgProcessStore;
use crate::api_types::{
    CommandRequest, CommandResults, CommandStatus, LocalQueueMessage, LocalQueueResult,
    TimerResult,
};
use crate::persistence::data_models::{
    bytes_to_command_request, bytes_to_encoded_object, StateExecutionId, StateExecutionStatus,
    StoredCommandResults,
};
use crate::persistence::postgres::non_transactional;
use crate::persistence::{PrepareStateExecutionResponse, StoreError};

impl PgProcessStore {
    pub(crate) async fn do_prepare_state_execution(
        &self,
        process_execution_id: Uuid,
        state_execution_id: &StateExecutionId,
    ) -> Result<PrepareStateExecutionResponse, StoreError> {
        let row = non_transactional::select_async_state_execution(
            &self.pool,
            process_execution_id,
            &state_execution_id.state_id,
            state_execution_id.state_id_sequence,
        )
        .await?;

        let info = serde_json::from_slice(&row.info)?;
        let input = bytes_to_encoded_object(&row.input)?;
        let command_request =
            bytes_to_command_request(row.wait_until_commands.as_deref().unwrap_or_default())?;
        let stored_results = StoredCommandResults::from_bytes(
            row.wait_until_command_results.as_deref().unwrap_or_default(),
        )?;

        Ok(PrepareStateExecutionResponse {
            wait_until_status: StateExecutionStatus::from_i16(row.wait_until_status)?,
            execute_status: StateExecutionStatus::from_i16(row.execute_status)?,
            previous_version: row.previous_version,
            info,
            input,
            wait_until_command_results: materialize_command_results(
                &command_request,
                &stored_results,
            ),
        })
    }
}

/// Zip the stored command request with the stored sparse results: every
/// command gets a status, satisfied local-queue commands carry their consumed
/// messages.
pub(crate) fn materialize_command_results(
    request: &CommandRequest,
    stored: &StoredCommandResults,
) -> CommandResults {
    let timer_results = request
        .timer_commands
        .iter()
        .enumerate()
        .map(|(idx, _)| TimerResult {
            status: match stored.timer_results.get(&idx) {
                None => CommandStatus::WaitingCommand,
                Some(true) => CommandStatus::CompletedCommand,
                Some(false) => CommandStatus::SkippedCommand,
            },
        })
        .collect();

    let local_queue_results = request
        .local_queue_commands
        .iter()
        .enumerate()
        .map(|(idx, command)| match stored.local_queue_results.get(&idx) {
            None => LocalQueueResult {
                status: CommandStatus::WaitingCommand,
                queue_name: command.queue_name.clone(),
                messages: Vec::new(),
            },
            Some(messages) => LocalQueueResult {
                status: CommandStatus::CompletedCommand,
                queue_name: command.queue_name.clone(),
                messages: messages
                    .iter()
                    .map(|m| LocalQueueMessage {
                        queue_name: m.queue_name.clone(),
                        dedup_id: Some(m.dedup_id.to_string()),
                        payload: Some(m.payload.clone()),
                    })
                    .collect(),
            },
        })
        .collect();

    CommandResults {
        timer_results,
        local_queue_results,
    }
}
