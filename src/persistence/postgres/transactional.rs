//! Statements that run inside a process transaction.
//!
//! Versioned state-execution updates return `ConditionalUpdateFailure` when
//! zero rows match the expected version; everything else surfaces classified
//! driver errors.

use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use super::{AsyncStateExecutionRow, ProcessExecutionRowForUpdate};
use crate::persistence::data_models::{
    ImmediateTaskType, ProcessExecutionStatus, StateExecutionStatus, TimerTaskType,
};
use crate::persistence::StoreError;

pub async fn insert_latest_process_execution(
    tx: &mut Transaction<'_, Postgres>,
    namespace: &str,
    process_id: &str,
    process_execution_id: Uuid,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO xdb_sys_latest_process_executions \
         (namespace, process_id, process_execution_id) VALUES ($1, $2, $3)",
    )
    .bind(namespace)
    .bind(process_id)
    .bind(process_execution_id.to_string())
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

pub struct NewProcessExecutionRow<'a> {
    pub process_execution_id: Uuid,
    pub namespace: &'a str,
    pub process_id: &'a str,
    pub status: ProcessExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub timeout_seconds: i32,
    pub state_execution_sequence_maps: &'a [u8],
    pub state_execution_waiting_queues: &'a [u8],
    pub info: &'a [u8],
}

pub async fn insert_process_execution(
    tx: &mut Transaction<'_, Postgres>,
    row: NewProcessExecutionRow<'_>,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO xdb_sys_process_executions \
         (id, namespace, process_id, status, start_time, timeout_seconds, wait_to_complete, \
          state_execution_sequence_maps, state_execution_waiting_queues, info) \
         VALUES ($1, $2, $3, $4, $5, $6, FALSE, $7, $8, $9)",
    )
    .bind(row.process_execution_id.to_string())
    .bind(row.namespace)
    .bind(row.process_id)
    .bind(row.status.as_i16())
    .bind(row.start_time)
    .bind(row.timeout_seconds)
    .bind(row.state_execution_sequence_maps)
    .bind(row.state_execution_waiting_queues)
    .bind(row.info)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

/// Lock the process row. This is the per-process mutex: every mutation of the
/// pending map, waiting queues, or status happens under it.
pub async fn select_process_execution_for_update(
    tx: &mut Transaction<'_, Postgres>,
    process_execution_id: Uuid,
) -> Result<ProcessExecutionRowForUpdate, StoreError> {
    let row = sqlx::query_as::<_, ProcessExecutionRowForUpdate>(
        "SELECT id AS process_execution_id, status, wait_to_complete, \
                state_execution_sequence_maps, state_execution_waiting_queues \
         FROM xdb_sys_process_executions WHERE id = $1 FOR UPDATE",
    )
    .bind(process_execution_id.to_string())
    .fetch_one(tx.as_mut())
    .await?;
    Ok(row)
}

pub async fn update_process_execution(
    tx: &mut Transaction<'_, Postgres>,
    process_execution_id: Uuid,
    status: ProcessExecutionStatus,
    wait_to_complete: bool,
    state_execution_sequence_maps: &[u8],
    state_execution_waiting_queues: &[u8],
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE xdb_sys_process_executions SET \
         status = $2, wait_to_complete = $3, \
         state_execution_sequence_maps = $4, state_execution_waiting_queues = $5 \
         WHERE id = $1",
    )
    .bind(process_execution_id.to_string())
    .bind(status.as_i16())
    .bind(wait_to_complete)
    .bind(state_execution_sequence_maps)
    .bind(state_execution_waiting_queues)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

pub async fn insert_async_state_execution(
    tx: &mut Transaction<'_, Postgres>,
    process_execution_id: Uuid,
    state_id: &str,
    state_id_sequence: i32,
    wait_until_status: StateExecutionStatus,
    execute_status: StateExecutionStatus,
    info: &[u8],
    input: &[u8],
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO xdb_sys_async_state_executions \
         (process_execution_id, state_id, state_id_sequence, version, \
          wait_until_status, execute_status, info, input) \
         VALUES ($1, $2, $3, 1, $4, $5, $6, $7)",
    )
    .bind(process_execution_id.to_string())
    .bind(state_id)
    .bind(state_id_sequence)
    .bind(wait_until_status.as_i16())
    .bind(execute_status.as_i16())
    .bind(info)
    .bind(input)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

/// Select a state execution row inside the transaction.
pub async fn select_async_state_execution(
    tx: &mut Transaction<'_, Postgres>,
    process_execution_id: Uuid,
    state_id: &str,
    state_id_sequence: i32,
) -> Result<AsyncStateExecutionRow, StoreError> {
    let row = sqlx::query_as::<_, AsyncStateExecutionRow>(
        "SELECT wait_until_status, execute_status, version AS previous_version, \
                wait_until_commands, wait_until_command_results, info, input \
         FROM xdb_sys_async_state_executions \
         WHERE process_execution_id = $1 AND state_id = $2 AND state_id_sequence = $3",
    )
    .bind(process_execution_id.to_string())
    .bind(state_id)
    .bind(state_id_sequence)
    .fetch_one(tx.as_mut())
    .await?;
    Ok(row)
}

/// Versioned status update leaving the stored commands untouched.
#[allow(clippy::too_many_arguments)]
pub async fn update_async_state_execution_without_commands(
    tx: &mut Transaction<'_, Postgres>,
    process_execution_id: Uuid,
    state_id: &str,
    state_id_sequence: i32,
    wait_until_status: StateExecutionStatus,
    execute_status: StateExecutionStatus,
    last_failure: Option<&[u8]>,
    previous_version: i32,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        "UPDATE xdb_sys_async_state_executions SET \
         version = $4 + 1, wait_until_status = $5, execute_status = $6, last_failure = $7 \
         WHERE process_execution_id = $1 AND state_id = $2 AND state_id_sequence = $3 \
           AND version = $4",
    )
    .bind(process_execution_id.to_string())
    .bind(state_id)
    .bind(state_id_sequence)
    .bind(previous_version)
    .bind(wait_until_status.as_i16())
    .bind(execute_status.as_i16())
    .bind(last_failure)
    .execute(tx.as_mut())
    .await?;
    if result.rows_affected() != 1 {
        return Err(StoreError::ConditionalUpdateFailure);
    }
    Ok(())
}

/// Versioned update that also replaces the stored command request and
/// results.
#[allow(clippy::too_many_arguments)]
pub async fn update_async_state_execution_commands(
    tx: &mut Transaction<'_, Postgres>,
    process_execution_id: Uuid,
    state_id: &str,
    state_id_sequence: i32,
    wait_until_status: StateExecutionStatus,
    execute_status: StateExecutionStatus,
    wait_until_commands: &[u8],
    wait_until_command_results: &[u8],
    previous_version: i32,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        "UPDATE xdb_sys_async_state_executions SET \
         version = $4 + 1, wait_until_status = $5, execute_status = $6, \
         wait_until_commands = $7, wait_until_command_results = $8, last_failure = NULL \
         WHERE process_execution_id = $1 AND state_id = $2 AND state_id_sequence = $3 \
           AND version = $4",
    )
    .bind(process_execution_id.to_string())
    .bind(state_id)
    .bind(state_id_sequence)
    .bind(previous_version)
    .bind(wait_until_status.as_i16())
    .bind(execute_status.as_i16())
    .bind(wait_until_commands)
    .bind(wait_until_command_results)
    .execute(tx.as_mut())
    .await?;
    if result.rows_affected() != 1 {
        return Err(StoreError::ConditionalUpdateFailure);
    }
    Ok(())
}

/// Record a failed attempt without moving the phase status. Still bumps the
/// version.
pub async fn update_async_state_execution_last_failure(
    tx: &mut Transaction<'_, Postgres>,
    process_execution_id: Uuid,
    state_id: &str,
    state_id_sequence: i32,
    last_failure: &[u8],
    previous_version: i32,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        "UPDATE xdb_sys_async_state_executions SET \
         version = $4 + 1, last_failure = $5 \
         WHERE process_execution_id = $1 AND state_id = $2 AND state_id_sequence = $3 \
           AND version = $4",
    )
    .bind(process_execution_id.to_string())
    .bind(state_id)
    .bind(state_id_sequence)
    .bind(previous_version)
    .bind(last_failure)
    .execute(tx.as_mut())
    .await?;
    if result.rows_affected() != 1 {
        return Err(StoreError::ConditionalUpdateFailure);
    }
    Ok(())
}

/// Move every phase currently Running to Aborted for the whole process, in
/// one statement, bumping each touched row's version.
pub async fn batch_abort_running_state_executions(
    tx: &mut Transaction<'_, Postgres>,
    process_execution_id: Uuid,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE xdb_sys_async_state_executions SET \
         version = CASE WHEN wait_until_status = 1 OR execute_status = 1 \
                        THEN version + 1 ELSE version END, \
         wait_until_status = CASE WHEN wait_until_status = 1 THEN 5 ELSE wait_until_status END, \
         execute_status = CASE WHEN execute_status = 1 THEN 5 ELSE execute_status END \
         WHERE process_execution_id = $1",
    )
    .bind(process_execution_id.to_string())
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

pub async fn insert_immediate_task(
    tx: &mut Transaction<'_, Postgres>,
    shard_id: i32,
    process_execution_id: Uuid,
    state_id: &str,
    state_id_sequence: i32,
    task_type: ImmediateTaskType,
    info: Option<&[u8]>,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO xdb_sys_immediate_tasks \
         (shard_id, process_execution_id, state_id, state_id_sequence, task_type, info) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(shard_id)
    .bind(process_execution_id.to_string())
    .bind(state_id)
    .bind(state_id_sequence)
    .bind(task_type.as_i16())
    .bind(info)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_timer_task(
    tx: &mut Transaction<'_, Postgres>,
    shard_id: i32,
    fire_time_unix_seconds: i64,
    process_execution_id: Uuid,
    state_id: &str,
    state_id_sequence: i32,
    task_type: TimerTaskType,
    info: Option<&[u8]>,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO xdb_sys_timer_tasks \
         (shard_id, fire_time_unix_seconds, process_execution_id, state_id, \
          state_id_sequence, task_type, info) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(shard_id)
    .bind(fire_time_unix_seconds)
    .bind(process_execution_id.to_string())
    .bind(state_id)
    .bind(state_id_sequence)
    .bind(task_type.as_i16())
    .bind(info)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

pub async fn delete_immediate_task(
    tx: &mut Transaction<'_, Postgres>,
    shard_id: i32,
    task_sequence: i64,
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM xdb_sys_immediate_tasks WHERE shard_id = $1 AND task_sequence = $2")
        .bind(shard_id)
        .bind(task_sequence)
        .execute(tx.as_mut())
        .await?;
    Ok(())
}

/// Insert a local-queue message. Dedup-id repeats are silently accepted.
pub async fn insert_local_queue_message(
    tx: &mut Transaction<'_, Postgres>,
    process_execution_id: Uuid,
    queue_name: &str,
    dedup_id: Uuid,
    payload: &[u8],
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO xdb_sys_local_queue (process_execution_id, queue_name, dedup_id, payload) \
         VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING",
    )
    .bind(process_execution_id.to_string())
    .bind(queue_name)
    .bind(dedup_id.to_string())
    .bind(payload)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}
