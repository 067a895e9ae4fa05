//! Standalone reads and task-table maintenance used by the API service and
//! the shard pollers.

use sqlx::PgPool;
use uuid::Uuid;

use super::{AsyncStateExecutionRow, ImmediateTaskRow, LatestProcessExecutionJoinRow, TimerTaskRow};
use crate::persistence::StoreError;

/// Resolve the most recent execution of `(namespace, process_id)`.
pub async fn select_latest_process_execution(
    pool: &PgPool,
    namespace: &str,
    process_id: &str,
) -> Result<LatestProcessExecutionJoinRow, StoreError> {
    let row = sqlx::query_as::<_, LatestProcessExecutionJoinRow>(
        "SELECT e.id AS process_execution_id, e.start_time, e.info \
         FROM xdb_sys_latest_process_executions ce \
         INNER JOIN xdb_sys_process_executions e ON e.id = ce.process_execution_id \
         WHERE ce.namespace = $1 AND ce.process_id = $2",
    )
    .bind(namespace)
    .bind(process_id)
    .fetch_optional(pool)
    .await?
    .ok_or(StoreError::NotFound)?;
    Ok(row)
}

pub async fn select_async_state_execution(
    pool: &PgPool,
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
    .fetch_optional(pool)
    .await?
    .ok_or(StoreError::NotFound)?;
    Ok(row)
}

pub async fn batch_select_immediate_tasks(
    pool: &PgPool,
    shard_id: i32,
    start_sequence_inclusive: i64,
    page_size: i32,
) -> Result<Vec<ImmediateTaskRow>, StoreError> {
    let rows = sqlx::query_as::<_, ImmediateTaskRow>(
        "SELECT shard_id, task_sequence, process_execution_id, state_id, \
                state_id_sequence, task_type, info \
         FROM xdb_sys_immediate_tasks \
         WHERE shard_id = $1 AND task_sequence >= $2 \
         ORDER BY task_sequence ASC LIMIT $3",
    )
    .bind(shard_id)
    .bind(start_sequence_inclusive)
    .bind(page_size as i64)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn batch_delete_immediate_tasks(
    pool: &PgPool,
    shard_id: i32,
    min_sequence_inclusive: i64,
    max_sequence_inclusive: i64,
) -> Result<(), StoreError> {
    sqlx::query(
        "DELETE FROM xdb_sys_immediate_tasks \
         WHERE shard_id = $1 AND task_sequence >= $2 AND task_sequence <= $3",
    )
    .bind(shard_id)
    .bind(min_sequence_inclusive)
    .bind(max_sequence_inclusive)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn batch_select_timer_tasks(
    pool: &PgPool,
    shard_id: i32,
    max_fire_time_unix_seconds_inclusive: i64,
    page_size: i32,
) -> Result<Vec<TimerTaskRow>, StoreError> {
    let rows = sqlx::query_as::<_, TimerTaskRow>(
        "SELECT shard_id, fire_time_unix_seconds, task_sequence, process_execution_id, \
                state_id, state_id_sequence, task_type, info \
         FROM xdb_sys_timer_tasks \
         WHERE shard_id = $1 AND fire_time_unix_seconds <= $2 \
         ORDER BY fire_time_unix_seconds, task_sequence ASC LIMIT $3",
    )
    .bind(shard_id)
    .bind(max_fire_time_unix_seconds_inclusive)
    .bind(page_size as i64)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Fetch the timer tasks behind a set of notified fire timestamps.
pub async fn select_timer_tasks_for_timestamps(
    pool: &PgPool,
    shard_id: i32,
    fire_timestamps: &[i64],
    min_sequence_inclusive: i64,
) -> Result<Vec<TimerTaskRow>, StoreError> {
    let rows = sqlx::query_as::<_, TimerTaskRow>(
        "SELECT shard_id, fire_time_unix_seconds, task_sequence, process_execution_id, \
                state_id, state_id_sequence, task_type, info \
         FROM xdb_sys_timer_tasks \
         WHERE shard_id = $1 AND fire_time_unix_seconds = ANY($2) AND task_sequence >= $3 \
         ORDER BY fire_time_unix_seconds, task_sequence ASC",
    )
    .bind(shard_id)
    .bind(fire_timestamps)
    .bind(min_sequence_inclusive)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn delete_timer_task(
    pool: &PgPool,
    shard_id: i32,
    fire_time_unix_seconds: i64,
    task_sequence: i64,
) -> Result<(), StoreError> {
    sqlx::query(
        "DELETE FROM xdb_sys_timer_tasks \
         WHERE shard_id = $1 AND fire_time_unix_seconds = $2 AND task_sequence = $3",
    )
    .bind(shard_id)
    .bind(fire_time_unix_seconds)
    .bind(task_sequence)
    .execute(pool)
    .await?;
    Ok(())
}
