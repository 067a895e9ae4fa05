//! Starting a process and describing the latest execution of a process id.

use chrono::Utc;
use uuid::Uuid;

use super::{insert_state_and_immediate_task, rollback, PgProcessStore};
use crate::api_types::ProcessExecutionDescribeResponse;
use crate::persistence::data_models::{
    encoded_object_to_bytes, AsyncStateExecutionInfo, ProcessExecutionInfo,
    ProcessExecutionStatus, StateExecutionSequenceMaps, StateExecutionWaitingQueues, TimerTaskType,
};
use crate::persistence::postgres::{non_transactional, transactional};
use crate::persistence::{StartProcessRequest, StartProcessResponse, StoreError};

impl PgProcessStore {
    pub(crate) async fn do_start_process(
        &self,
        request: StartProcessRequest,
    ) -> Result<StartProcessResponse, StoreError> {
        let mut tx = self.pool.begin().await?;
        let process_execution_id = Uuid::new_v4();

        // Step 1: claim the (namespace, processId) pointer. A duplicate means
        // the process id already has a latest execution.
        let claimed = transactional::insert_latest_process_execution(
            &mut tx,
            &request.request.namespace,
            &request.request.process_id,
            process_execution_id,
        )
        .await;
        if let Err(err) = claimed {
            rollback(tx).await;
            if err.is_duplicate_entry() {
                return Ok(StartProcessResponse {
                    process_execution_id,
                    already_started: true,
                    has_new_immediate_task: false,
                });
            }
            return Err(err);
        }

        match Self::start_process_tx(&mut tx, process_execution_id, &request).await {
            Ok(has_new_immediate_task) => {
                tx.commit().await?;
                Ok(StartProcessResponse {
                    process_execution_id,
                    already_started: false,
                    has_new_immediate_task,
                })
            }
            Err(err) => {
                rollback(tx).await;
                Err(err)
            }
        }
    }

    async fn start_process_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        process_execution_id: Uuid,
        request: &StartProcessRequest,
    ) -> Result<bool, StoreError> {
        let req = &request.request;
        let start_time = Utc::now();
        let timeout_seconds = req
            .process_start_config
            .as_ref()
            .and_then(|c| c.timeout_seconds)
            .unwrap_or(0);

        let mut sequence_maps = StateExecutionSequenceMaps::new();
        let mut has_new_immediate_task = false;

        // Step 2: the optional first state execution and its immediate task.
        if let Some(start_state_id) = &req.start_state_id {
            let state_id_sequence = sequence_maps.start_new_state_execution(start_state_id);
            let state_info = serde_json::to_vec(&AsyncStateExecutionInfo {
                namespace: req.namespace.clone(),
                process_id: req.process_id.clone(),
                process_type: req.process_type.clone(),
                worker_url: req.worker_url.clone(),
                state_config: req.start_state_config.clone(),
            })?;
            let state_input =
                encoded_object_to_bytes(&req.start_state_input.clone().unwrap_or_default())?;

            insert_state_and_immediate_task(
                tx,
                process_execution_id,
                start_state_id,
                state_id_sequence,
                req.start_state_config.as_ref(),
                &state_info,
                &state_input,
                request.new_task_shard_id,
            )
            .await?;
            has_new_immediate_task = true;
        }

        if timeout_seconds > 0 {
            transactional::insert_timer_task(
                tx,
                request.new_task_shard_id,
                start_time.timestamp() + i64::from(timeout_seconds),
                process_execution_id,
                "",
                0,
                TimerTaskType::ProcessTimeout,
                None,
            )
            .await?;
        }

        // Step 3: the process row itself.
        let process_info = serde_json::to_vec(&ProcessExecutionInfo {
            process_type: req.process_type.clone(),
            worker_url: req.worker_url.clone(),
        })?;
        transactional::insert_process_execution(
            tx,
            transactional::NewProcessExecutionRow {
                process_execution_id,
                namespace: &req.namespace,
                process_id: &req.process_id,
                status: ProcessExecutionStatus::Running,
                start_time,
                timeout_seconds,
                state_execution_sequence_maps: &sequence_maps.to_bytes()?,
                state_execution_waiting_queues: &StateExecutionWaitingQueues::new().to_bytes()?,
                info: &process_info,
            },
        )
        .await?;

        Ok(has_new_immediate_task)
    }

    pub(crate) async fn do_describe_latest_process(
        &self,
        namespace: &str,
        process_id: &str,
    ) -> Result<ProcessExecutionDescribeResponse, StoreError> {
        let row =
            non_transactional::select_latest_process_execution(&self.pool, namespace, process_id)
                .await?;
        let info: ProcessExecutionInfo = serde_json::from_slice(&row.info)?;
        Ok(ProcessExecutionDescribeResponse {
            process_execution_id: row.process_execution_id,
            process_type: info.process_type,
            worker_url: info.worker_url,
            start_timestamp: row.start_time.timestamp(),
        })
    }
}
