//! Postgres backend: pool setup, schema DDL, and row-level CRUD.
//!
//! [`transactional`] holds the statements that must run inside a process
//! transaction; [`non_transactional`] holds the standalone reads and the
//! task-table maintenance used by the pollers. Both speak in raw rows;
//! interpreting the blobs is the process store's job.

pub mod non_transactional;
pub mod transactional;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::persistence::StoreError;

const SCHEMA_DDL: &str = include_str!("schema.sql");

/// Connect a pool against the configured database.
pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await?;
    Ok(pool)
}

/// Apply the engine schema. Idempotent; runs at bootstrap.
pub async fn apply_schema(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::raw_sql(SCHEMA_DDL).execute(pool).await?;
    Ok(())
}

/// Process execution row as read under `FOR UPDATE`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProcessExecutionRowForUpdate {
    pub process_execution_id: String,
    pub status: i16,
    pub wait_to_complete: bool,
    pub state_execution_sequence_maps: Vec<u8>,
    pub state_execution_waiting_queues: Vec<u8>,
}

/// Async state execution row, keys implied by the select filter.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AsyncStateExecutionRow {
    pub wait_until_status: i16,
    pub execute_status: i16,
    pub previous_version: i32,
    pub wait_until_commands: Option<Vec<u8>>,
    pub wait_until_command_results: Option<Vec<u8>>,
    pub info: Vec<u8>,
    pub input: Vec<u8>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ImmediateTaskRow {
    pub shard_id: i32,
    pub task_sequence: i64,
    pub process_execution_id: String,
    pub state_id: String,
    pub state_id_sequence: i32,
    pub task_type: i16,
    pub info: Option<Vec<u8>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TimerTaskRow {
    pub shard_id: i32,
    pub fire_time_unix_seconds: i64,
    pub task_sequence: i64,
    pub process_execution_id: String,
    pub state_id: String,
    pub state_id_sequence: i32,
    pub task_type: i16,
    pub info: Option<Vec<u8>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LatestProcessExecutionJoinRow {
    pub process_execution_id: String,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub info: Vec<u8>,
}
