//! Task feeds for the shard pollers: batch reads and commit-time deletes.

use uuid::Uuid;

use super::PgProcessStore;
use crate::persistence::data_models::{
    ImmediateTask, ImmediateTaskInfo, ImmediateTaskType, TimerTask, TimerTaskInfo, TimerTaskType,
};
use crate::persistence::postgres::{non_transactional, ImmediateTaskRow, TimerTaskRow};
use crate::persistence::StoreError;

impl PgProcessStore {
    pub(crate) async fn do_batch_select_immediate_tasks(
        &self,
        shard_id: i32,
        start_sequence_inclusive: i64,
        page_size: i32,
    ) -> Result<Vec<ImmediateTask>, StoreError> {
        let rows = non_transactional::batch_select_immediate_tasks(
            &self.pool,
            shard_id,
            start_sequence_inclusive,
            page_size,
        )
        .await?;
        rows.into_iter().map(immediate_task_from_row).collect()
    }

    pub(crate) async fn do_batch_delete_immediate_tasks(
        &self,
        shard_id: i32,
        min_sequence_inclusive: i64,
        max_sequence_inclusive: i64,
    ) -> Result<(), StoreError> {
        non_transactional::batch_delete_immediate_tasks(
            &self.pool,
            shard_id,
            min_sequence_inclusive,
            max_sequence_inclusive,
        )
        .await
    }

    pub(crate) async fn do_batch_select_timer_tasks(
        &self,
        shard_id: i32,
        max_fire_time_unix_seconds_inclusive: i64,
        page_size: i32,
    ) -> Result<Vec<TimerTask>, StoreError> {
        let rows = non_transactional::batch_select_timer_tasks(
            &self.pool,
            shard_id,
            max_fire_time_unix_seconds_inclusive,
            page_size,
        )
        .await?;
        rows.into_iter().map(timer_task_from_row).collect()
    }

    pub(crate) async fn do_select_timer_tasks_for_timestamps(
        &self,
        shard_id: i32,
        fire_timestamps: &[i64],
        min_sequence_inclusive: i64,
    ) -> Result<Vec<TimerTask>, StoreError> {
        let rows = non_transactional::select_timer_tasks_for_timestamps(
            &self.pool,
            shard_id,
            fire_timestamps,
            min_sequence_inclusive,
        )
        .await?;
        rows.into_iter().map(timer_task_from_row).collect()
    }

    pub(crate) async fn do_delete_timer_task(
        &self,
        shard_id: i32,
        fire_time_unix_seconds: i64,
        task_sequence: i64,
    ) -> Result<(), StoreError> {
        non_transactional::delete_timer_task(
            &self.pool,
            shard_id,
            fire_time_unix_seconds,
            task_sequence,
        )
        .await
    }
}

fn parse_process_execution_id(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw)
        .map_err(|err| StoreError::Corruption(format!("bad process execution id {raw}: {err}")))
}

fn immediate_task_from_row(row: ImmediateTaskRow) -> Result<ImmediateTask, StoreError> {
    let info = match row.info.as_deref() {
        None | Some([]) => ImmediateTaskInfo::default(),
        Some(bytes) => serde_json::from_slice(bytes)?,
    };
    Ok(ImmediateTask {
        shard_id: row.shard_id,
        task_sequence: Some(row.task_sequence),
        task_type: ImmediateTaskType::from_i16(row.task_type)?,
        process_execution_id: parse_process_execution_id(&row.process_execution_id)?,
        state_id: row.state_id,
        state_id_sequence: row.state_id_sequence,
        info,
    })
}

fn timer_task_from_row(row: TimerTaskRow) -> Result<TimerTask, StoreError> {
    let info = match row.info.as_deref() {
        None | Some([]) => TimerTaskInfo::default(),
        Some(bytes) => serde_json::from_slice(bytes)?,
    };
    Ok(TimerTask {
        shard_id: row.shard_id,
        fire_timestamp_seconds: row.fire_time_unix_seconds,
        task_sequence: Some(row.task_sequence),
        task_type: TimerTaskType::from_i16(row.task_type)?,
        process_execution_id: parse_process_execution_id(&row.process_execution_id)?,
        state_id: row.state_id,
        state_id_sequence: row.state_id_sequence,
        info,
    })
}
