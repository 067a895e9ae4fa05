//! Transactional tests for the process store state machine.
//!
//! These run against a real Postgres database and are skipped unless
//! `XDB_TEST_DATABASE_URL` is set.

use std::env;

use anyhow::Result;
use chrono::Utc;
use serial_test::serial;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use xdb::api_types::{
    AsyncStateConfig, CommandRequest, CommandStatus, CommandWaitingType, EncodedObject,
    LocalQueueCommand, ProcessExecutionStartRequest, StateDecision, StateMovement,
    ThreadCloseDecision, ThreadCloseType, TimerCommand,
};
use xdb::persistence::data_models::{
    LocalQueueMessageInfo, StateExecutionId, DEFAULT_SHARD_ID,
};
use xdb::persistence::{
    postgres, BackoffImmediateTaskRequest, CompleteExecuteExecutionRequest,
    FailStateExecutionRequest, PgProcessStore, PrepareStateExecutionResponse,
    ProcessLocalQueueMessageRequest, ProcessStore, ProcessWaitUntilExecutionRequest,
    StartProcessRequest, StoreError,
};

// status encodings are part of the storage contract
const STATUS_RUNNING: i16 = 1;
const STATUS_WAITING: i16 = 2;
const STATUS_COMPLETED: i16 = 3;
const STATUS_SKIPPED: i16 = 4;
const STATUS_ABORTED: i16 = 5;
const STATUS_FAILED: i16 = 6;

const PROCESS_RUNNING: i16 = 1;
const PROCESS_COMPLETED: i16 = 2;
const PROCESS_FAILED: i16 = 3;

const TASK_TYPE_EXECUTE: i16 = 2;
const TIMER_TYPE_BACKOFF: i16 = 1;
const TIMER_TYPE_COMMAND: i16 = 2;

async fn setup_store() -> Option<PgProcessStore> {
    let url = match env::var("XDB_TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("skipping test: XDB_TEST_DATABASE_URL not set");
            return None;
        }
    };
    let pool = postgres::connect(&url, 5).await.ok()?;
    postgres::apply_schema(&pool).await.ok()?;
    cleanup(&pool).await.ok()?;
    Some(PgProcessStore::new(pool))
}

async fn cleanup(pool: &PgPool) -> Result<()> {
    sqlx::query(
        "TRUNCATE xdb_sys_latest_process_executions, xdb_sys_process_executions, \
         xdb_sys_async_state_executions, xdb_sys_immediate_tasks, xdb_sys_timer_tasks, \
         xdb_sys_local_queue",
    )
    .execute(pool)
    .await?;
    Ok(())
}

fn skip_wait_until() -> AsyncStateConfig {
    AsyncStateConfig {
        skip_wait_until: true,
        ..Default::default()
    }
}

fn start_request(
    process_id: &str,
    start_state: Option<(&str, AsyncStateConfig)>,
) -> StartProcessRequest {
    StartProcessRequest {
        request: ProcessExecutionStartRequest {
            namespace: "n".to_string(),
            process_id: process_id.to_string(),
            process_type: "Order".to_string(),
            worker_url: "http://worker.test:8803".to_string(),
            start_state_id: start_state.as_ref().map(|(id, _)| id.to_string()),
            start_state_input: Some(EncodedObject {
                encoding: "json".to_string(),
                data: "\"input\"".to_string(),
            }),
            start_state_config: start_state.map(|(_, config)| config),
            process_start_config: None,
        },
        new_task_shard_id: DEFAULT_SHARD_ID,
    }
}

fn seid(state_id: &str, sequence: i32) -> StateExecutionId {
    StateExecutionId {
        state_id: state_id.to_string(),
        state_id_sequence: sequence,
    }
}

fn close_decision(close_type: ThreadCloseType) -> StateDecision {
    StateDecision {
        next_states: vec![],
        thread_close_decision: Some(ThreadCloseDecision { close_type }),
    }
}

fn next_states(ids: &[&str]) -> StateDecision {
    StateDecision {
        next_states: ids
            .iter()
            .map(|id| StateMovement {
                state_id: id.to_string(),
                state_input: None,
                state_config: Some(skip_wait_until()),
            })
            .collect(),
        thread_close_decision: None,
    }
}

async fn prepare(
    store: &PgProcessStore,
    process_execution_id: Uuid,
    state_id: &str,
    sequence: i32,
) -> PrepareStateExecutionResponse {
    store
        .prepare_state_execution(process_execution_id, &seid(state_id, sequence))
        .await
        .unwrap()
}

async fn complete_execute(
    store: &PgProcessStore,
    process_execution_id: Uuid,
    state_id: &str,
    sequence: i32,
    decision: StateDecision,
) {
    let prep = prepare(store, process_execution_id, state_id, sequence).await;
    store
        .complete_execute_execution(CompleteExecuteExecutionRequest {
            process_execution_id,
            state_execution_id: seid(state_id, sequence),
            prepare: prep,
            state_decision: decision,
            publish_to_local_queue: vec![],
            task_shard_id: DEFAULT_SHARD_ID,
        })
        .await
        .unwrap();
}

async fn process_row(pool: &PgPool, process_execution_id: Uuid) -> (i16, bool, serde_json::Value) {
    let row = sqlx::query(
        "SELECT status, wait_to_complete, state_execution_sequence_maps \
         FROM xdb_sys_process_executions WHERE id = $1",
    )
    .bind(process_execution_id.to_string())
    .fetch_one(pool)
    .await
    .unwrap();
    let maps: Vec<u8> = row.get("state_execution_sequence_maps");
    (
        row.get("status"),
        row.get("wait_to_complete"),
        serde_json::from_slice(&maps).unwrap(),
    )
}

async fn state_row(
    pool: &PgPool,
    process_execution_id: Uuid,
    state_id: &str,
    sequence: i32,
) -> (i16, i16, i32) {
    let row = sqlx::query(
        "SELECT wait_until_status, execute_status, version \
         FROM xdb_sys_async_state_executions \
         WHERE process_execution_id = $1 AND state_id = $2 AND state_id_sequence = $3",
    )
    .bind(process_execution_id.to_string())
    .bind(state_id)
    .bind(sequence)
    .fetch_one(pool)
    .await
    .unwrap();
    (
        row.get("wait_until_status"),
        row.get("execute_status"),
        row.get("version"),
    )
}

async fn count(pool: &PgPool, sql: &str) -> i64 {
    sqlx::query(sql).fetch_one(pool).await.unwrap().get::<i64, _>(0)
}

#[tokio::test]
#[serial]
async fn start_process_creates_all_rows_atomically() {
    let Some(store) = setup_store().await else { return };
    let pool = store.pool().clone();

    let resp = store
        .start_process(start_request("p", Some(("S", skip_wait_until()))))
        .await
        .unwrap();
    assert!(!resp.already_started);
    assert!(resp.has_new_immediate_task);

    let (status, wait_to_complete, maps) = process_row(&pool, resp.process_execution_id).await;
    assert_eq!(status, PROCESS_RUNNING);
    assert!(!wait_to_complete);
    assert_eq!(maps["pendingExecutionMap"]["S"], serde_json::json!([1]));

    let (wait_until, execute, version) = state_row(&pool, resp.process_execution_id, "S", 1).await;
    assert_eq!(wait_until, STATUS_SKIPPED);
    assert_eq!(execute, STATUS_RUNNING);
    assert_eq!(version, 1);

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM xdb_sys_immediate_tasks").await, 1);
    let task_type: i16 = sqlx::query("SELECT task_type FROM xdb_sys_immediate_tasks")
        .fetch_one(&pool)
        .await
        .unwrap()
        .get(0);
    assert_eq!(task_type, TASK_TYPE_EXECUTE);
}

#[tokio::test]
#[serial]
async fn duplicate_start_reports_already_started_and_leaves_no_rows() {
    let Some(store) = setup_store().await else { return };
    let pool = store.pool().clone();

    store
        .start_process(start_request("p", Some(("S", skip_wait_until()))))
        .await
        .unwrap();
    let resp = store
        .start_process(start_request("p", Some(("S", skip_wait_until()))))
        .await
        .unwrap();
    assert!(resp.already_started);

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM xdb_sys_process_executions").await, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM xdb_sys_async_state_executions").await, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM xdb_sys_immediate_tasks").await, 1);
}

#[tokio::test]
#[serial]
async fn force_complete_closes_single_state_process() {
    let Some(store) = setup_store().await else { return };
    let pool = store.pool().clone();

    let resp = store
        .start_process(start_request("p", Some(("S", skip_wait_until()))))
        .await
        .unwrap();
    let peid = resp.process_execution_id;

    complete_execute(
        &store,
        peid,
        "S",
        1,
        close_decision(ThreadCloseType::ForceCompleteProcess),
    )
    .await;

    let (wait_until, execute, version) = state_row(&pool, peid, "S", 1).await;
    assert_eq!(wait_until, STATUS_SKIPPED);
    assert_eq!(execute, STATUS_COMPLETED);
    assert_eq!(version, 2);

    let (status, _, maps) = process_row(&pool, peid).await;
    assert_eq!(status, PROCESS_COMPLETED);
    assert_eq!(
        maps["pendingExecutionMap"],
        serde_json::json!({}),
        "terminal process must have an empty pending map"
    );
    // 0 other pending states: nothing was aborted
    assert_eq!(
        count(
            &pool,
            "SELECT COUNT(*) FROM xdb_sys_async_state_executions WHERE wait_until_status = 5 OR execute_status = 5"
        )
        .await,
        0
    );
}

#[tokio::test]
#[serial]
async fn dead_end_with_pending_siblings_keeps_process_running() {
    let Some(store) = setup_store().await else { return };
    let pool = store.pool().clone();

    let resp = store
        .start_process(start_request("p", Some(("S1", skip_wait_until()))))
        .await
        .unwrap();
    let peid = resp.process_execution_id;

    complete_execute(&store, peid, "S1", 1, next_states(&["S2", "S3"])).await;
    complete_execute(&store, peid, "S2", 1, close_decision(ThreadCloseType::DeadEnd)).await;

    let (status, _, maps) = process_row(&pool, peid).await;
    assert_eq!(status, PROCESS_RUNNING);
    assert_eq!(maps["pendingExecutionMap"]["S3"], serde_json::json!([1]));

    // the last pending state dead-ending drains the map and completes the
    // process
    complete_execute(&store, peid, "S3", 1, close_decision(ThreadCloseType::DeadEnd)).await;
    let (status, _, maps) = process_row(&pool, peid).await;
    assert_eq!(status, PROCESS_COMPLETED);
    assert_eq!(maps["pendingExecutionMap"], serde_json::json!({}));
}

#[tokio::test]
#[serial]
async fn graceful_complete_arms_wait_to_complete() {
    let Some(store) = setup_store().await else { return };
    let pool = store.pool().clone();

    let resp = store
        .start_process(start_request("p", Some(("S1", skip_wait_until()))))
        .await
        .unwrap();
    let peid = resp.process_execution_id;

    complete_execute(&store, peid, "S1", 1, next_states(&["S2", "S3"])).await;
    complete_execute(
        &store,
        peid,
        "S2",
        1,
        close_decision(ThreadCloseType::GracefulCompleteProcess),
    )
    .await;

    let (status, wait_to_complete, _) = process_row(&pool, peid).await;
    assert_eq!(status, PROCESS_RUNNING);
    assert!(wait_to_complete);

    complete_execute(&store, peid, "S3", 1, close_decision(ThreadCloseType::DeadEnd)).await;
    let (status, _, _) = process_row(&pool, peid).await;
    assert_eq!(status, PROCESS_COMPLETED);
}

#[tokio::test]
#[serial]
async fn force_fail_aborts_running_siblings() {
    let Some(store) = setup_store().await else { return };
    let pool = store.pool().clone();

    let resp = store
        .start_process(start_request("p", Some(("S1", skip_wait_until()))))
        .await
        .unwrap();
    let peid = resp.process_execution_id;

    complete_execute(&store, peid, "S1", 1, next_states(&["S2", "S3"])).await;
    complete_execute(
        &store,
        peid,
        "S2",
        1,
        close_decision(ThreadCloseType::ForceFailProcess),
    )
    .await;

    let (status, _, maps) = process_row(&pool, peid).await;
    assert_eq!(status, PROCESS_FAILED);
    assert_eq!(maps["pendingExecutionMap"], serde_json::json!({}));

    // S3 was execute-running and must now be aborted with a version bump
    let (_, execute, version) = state_row(&pool, peid, "S3", 1).await;
    assert_eq!(execute, STATUS_ABORTED);
    assert_eq!(version, 2);
}

#[tokio::test]
#[serial]
async fn wait_until_timer_command_round_trip() {
    let Some(store) = setup_store().await else { return };
    let pool = store.pool().clone();

    let resp = store
        .start_process(start_request("p", Some(("S", AsyncStateConfig::default()))))
        .await
        .unwrap();
    let peid = resp.process_execution_id;

    let (wait_until, _, _) = state_row(&pool, peid, "S", 1).await;
    assert_eq!(wait_until, STATUS_RUNNING);

    let before = Utc::now().timestamp();
    let prep = prepare(&store, peid, "S", 1).await;
    let wait_resp = store
        .process_wait_until_execution(ProcessWaitUntilExecutionRequest {
            process_execution_id: peid,
            state_execution_id: seid("S", 1),
            prepare: prep,
            command_request: CommandRequest {
                waiting_type: CommandWaitingType::AllOfCompletion,
                timer_commands: vec![TimerCommand {
                    delay_in_seconds: 5,
                }],
                local_queue_commands: vec![],
            },
            publish_to_local_queue: vec![],
            task_shard_id: DEFAULT_SHARD_ID,
        })
        .await
        .unwrap();
    assert!(!wait_resp.has_new_immediate_task);
    assert_eq!(wait_resp.timer_fire_timestamps.len(), 1);

    let (wait_until, _, version) = state_row(&pool, peid, "S", 1).await;
    assert_eq!(wait_until, STATUS_WAITING);
    assert_eq!(version, 2);

    let fire_time: i64 =
        sqlx::query("SELECT fire_time_unix_seconds FROM xdb_sys_timer_tasks WHERE task_type = $1")
            .bind(TIMER_TYPE_COMMAND)
            .fetch_one(&pool)
            .await
            .unwrap()
            .get(0);
    assert!((before + 4..=before + 6).contains(&fire_time));

    // fire the timer
    let timer_tasks = store
        .batch_select_timer_tasks(DEFAULT_SHARD_ID, fire_time + 1, 10)
        .await
        .unwrap();
    assert_eq!(timer_tasks.len(), 1);
    let fired = store
        .process_timer_task(timer_tasks[0].clone())
        .await
        .unwrap();
    assert!(fired.has_new_immediate_task);

    let (wait_until, execute, version) = state_row(&pool, peid, "S", 1).await;
    assert_eq!(wait_until, STATUS_COMPLETED);
    assert_eq!(execute, STATUS_RUNNING);
    assert_eq!(version, 3);

    // the execute phase sees the fired timer in its command results
    let prep = prepare(&store, peid, "S", 1).await;
    assert_eq!(
        prep.wait_until_command_results.timer_results[0].status,
        CommandStatus::CompletedCommand
    );

    complete_execute(&store, peid, "S", 1, close_decision(ThreadCloseType::DeadEnd)).await;
    let (status, _, _) = process_row(&pool, peid).await;
    assert_eq!(status, PROCESS_COMPLETED);
}

#[tokio::test]
#[serial]
async fn local_queue_any_of_unblocks_waiting_state() {
    let Some(store) = setup_store().await else { return };
    let pool = store.pool().clone();

    let resp = store
        .start_process(start_request("p", Some(("S", AsyncStateConfig::default()))))
        .await
        .unwrap();
    let peid = resp.process_execution_id;

    let prep = prepare(&store, peid, "S", 1).await;
    store
        .process_wait_until_execution(ProcessWaitUntilExecutionRequest {
            process_execution_id: peid,
            state_execution_id: seid("S", 1),
            prepare: prep,
            command_request: CommandRequest {
                waiting_type: CommandWaitingType::AnyOfCompletion,
                timer_commands: vec![],
                local_queue_commands: vec![LocalQueueCommand {
                    queue_name: "Q".to_string(),
                    count: None,
                }],
            },
            publish_to_local_queue: vec![],
            task_shard_id: DEFAULT_SHARD_ID,
        })
        .await
        .unwrap();

    let (wait_until, _, _) = state_row(&pool, peid, "S", 1).await;
    assert_eq!(wait_until, STATUS_WAITING);

    // deliver a message the way the NewLocalQueueMessage task does
    let payload = EncodedObject {
        encoding: "json".to_string(),
        data: "\"P\"".to_string(),
    };
    let consumed = store
        .process_local_queue_message(ProcessLocalQueueMessageRequest {
            process_execution_id: peid,
            messages: vec![LocalQueueMessageInfo {
                queue_name: "Q".to_string(),
                dedup_id: Uuid::new_v4(),
                payload: payload.clone(),
            }],
            task_shard_id: DEFAULT_SHARD_ID,
        })
        .await
        .unwrap();
    assert!(consumed.has_new_immediate_task);

    let (wait_until, execute, _) = state_row(&pool, peid, "S", 1).await;
    assert_eq!(wait_until, STATUS_COMPLETED);
    assert_eq!(execute, STATUS_RUNNING);

    let prep = prepare(&store, peid, "S", 1).await;
    let queue_result = &prep.wait_until_command_results.local_queue_results[0];
    assert_eq!(queue_result.status, CommandStatus::CompletedCommand);
    assert_eq!(queue_result.messages[0].payload, Some(payload));
}

#[tokio::test]
#[serial]
async fn published_message_is_consumed_by_later_waiter() {
    let Some(store) = setup_store().await else { return };
    let pool = store.pool().clone();

    let resp = store
        .start_process(start_request("p", Some(("S1", skip_wait_until()))))
        .await
        .unwrap();
    let peid = resp.process_execution_id;

    // S1's execute publishes to Q and opens the waiting state
    let prep = prepare(&store, peid, "S1", 1).await;
    store
        .complete_execute_execution(CompleteExecuteExecutionRequest {
            process_execution_id: peid,
            state_execution_id: seid("S1", 1),
            prepare: prep,
            state_decision: StateDecision {
                next_states: vec![StateMovement {
                    state_id: "SWait".to_string(),
                    state_input: None,
                    state_config: None,
                }],
                thread_close_decision: None,
            },
            publish_to_local_queue: vec![xdb::api_types::LocalQueueMessage {
                queue_name: "Q".to_string(),
                dedup_id: None,
                payload: Some(EncodedObject {
                    encoding: "json".to_string(),
                    data: "\"P\"".to_string(),
                }),
            }],
            task_shard_id: DEFAULT_SHARD_ID,
        })
        .await
        .unwrap();

    // one durable local-queue row plus its delivery task
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM xdb_sys_local_queue").await, 1);
    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM xdb_sys_immediate_tasks WHERE task_type = 3").await,
        1
    );

    // the delivery task consumes the message into the waiting-queue map
    let tasks = store
        .batch_select_immediate_tasks(DEFAULT_SHARD_ID, 0, 100)
        .await
        .unwrap();
    let delivery = tasks
        .iter()
        .find(|t| t.info.local_queue_message_info.is_some())
        .unwrap();
    store
        .process_local_queue_message(ProcessLocalQueueMessageRequest {
            process_execution_id: peid,
            messages: vec![delivery.info.local_queue_message_info.clone().unwrap()],
            task_shard_id: DEFAULT_SHARD_ID,
        })
        .await
        .unwrap();

    // SWait registers its ANY_OF wait afterwards and is satisfied from the
    // unconsumed pool inside the same transaction
    let prep = prepare(&store, peid, "SWait", 1).await;
    let wait_resp = store
        .process_wait_until_execution(ProcessWaitUntilExecutionRequest {
            process_execution_id: peid,
            state_execution_id: seid("SWait", 1),
            prepare: prep,
            command_request: CommandRequest {
                waiting_type: CommandWaitingType::AnyOfCompletion,
                timer_commands: vec![],
                local_queue_commands: vec![LocalQueueCommand {
                    queue_name: "Q".to_string(),
                    count: None,
                }],
            },
            publish_to_local_queue: vec![],
            task_shard_id: DEFAULT_SHARD_ID,
        })
        .await
        .unwrap();
    assert!(wait_resp.has_new_immediate_task);

    let (wait_until, execute, _) = state_row(&pool, peid, "SWait", 1).await;
    assert_eq!(wait_until, STATUS_COMPLETED);
    assert_eq!(execute, STATUS_RUNNING);
}

#[tokio::test]
#[serial]
async fn backoff_moves_task_to_timer_table_then_exhaustion_fails_state() {
    let Some(store) = setup_store().await else { return };
    let pool = store.pool().clone();

    let resp = store
        .start_process(start_request("p", Some(("S", skip_wait_until()))))
        .await
        .unwrap();
    let peid = resp.process_execution_id;

    let mut task = store
        .batch_select_immediate_tasks(DEFAULT_SHARD_ID, 0, 10)
        .await
        .unwrap()
        .remove(0);
    task.info.worker_task_backoff_info = Some(xdb::persistence::data_models::WorkerTaskBackoffInfo {
        completed_attempts: 1,
        first_attempt_timestamp_seconds: Utc::now().timestamp(),
    });

    let prep = prepare(&store, peid, "S", 1).await;
    store
        .backoff_immediate_task(BackoffImmediateTaskRequest {
            task: task.clone(),
            prepare: prep,
            fire_timestamp_seconds: Utc::now().timestamp() + 1,
            last_failure_status: 500,
            last_failure_details: "worker exploded".to_string(),
        })
        .await
        .unwrap();

    // immediate task replaced by a backoff timer task
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM xdb_sys_immediate_tasks").await, 0);
    let backoff_timers: i64 =
        sqlx::query("SELECT COUNT(*) FROM xdb_sys_timer_tasks WHERE task_type = $1")
            .bind(TIMER_TYPE_BACKOFF)
            .fetch_one(&pool)
            .await
            .unwrap()
            .get(0);
    assert_eq!(backoff_timers, 1);

    // the failure is recorded without moving the phase status
    let (_, execute, version) = state_row(&pool, peid, "S", 1).await;
    assert_eq!(execute, STATUS_RUNNING);
    assert_eq!(version, 2);
    let last_failure: Option<Vec<u8>> =
        sqlx::query("SELECT last_failure FROM xdb_sys_async_state_executions")
            .fetch_one(&pool)
            .await
            .unwrap()
            .get(0);
    let failure: serde_json::Value = serde_json::from_slice(&last_failure.unwrap()).unwrap();
    assert_eq!(failure["statusCode"], 500);

    // retries exhausted: the running phase fails, siblings and the pending
    // map stay untouched
    let prep = prepare(&store, peid, "S", 1).await;
    store
        .fail_state_execution(FailStateExecutionRequest {
            process_execution_id: peid,
            state_execution_id: seid("S", 1),
            prepare: prep,
            failed_phase: xdb::persistence::data_models::ImmediateTaskType::Execute,
            last_failure_status: 500,
            last_failure_details: "worker exploded".to_string(),
            completed_attempts: 3,
        })
        .await
        .unwrap();

    let (_, execute, version) = state_row(&pool, peid, "S", 1).await;
    assert_eq!(execute, STATUS_FAILED);
    assert_eq!(version, 3);
    let (status, _, maps) = process_row(&pool, peid).await;
    assert_eq!(status, PROCESS_RUNNING);
    assert_eq!(maps["pendingExecutionMap"]["S"], serde_json::json!([1]));
}

#[tokio::test]
#[serial]
async fn conditional_update_race_loses_exactly_once() {
    let Some(store) = setup_store().await else { return };
    let pool = store.pool().clone();

    let resp = store
        .start_process(start_request("p", Some(("S", skip_wait_until()))))
        .await
        .unwrap();
    let peid = resp.process_execution_id;

    // both processors prepared the same snapshot at version 1
    let prep_a = prepare(&store, peid, "S", 1).await;
    let prep_b = prep_a.clone();

    store
        .complete_execute_execution(CompleteExecuteExecutionRequest {
            process_execution_id: peid,
            state_execution_id: seid("S", 1),
            prepare: prep_a,
            state_decision: close_decision(ThreadCloseType::ForceCompleteProcess),
            publish_to_local_queue: vec![],
            task_shard_id: DEFAULT_SHARD_ID,
        })
        .await
        .unwrap();

    let err = store
        .complete_execute_execution(CompleteExecuteExecutionRequest {
            process_execution_id: peid,
            state_execution_id: seid("S", 1),
            prepare: prep_b,
            state_decision: close_decision(ThreadCloseType::ForceCompleteProcess),
            publish_to_local_queue: vec![],
            task_shard_id: DEFAULT_SHARD_ID,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ConditionalUpdateFailure));

    // exactly one winner: version bumped once, the loser's transaction rolled
    // back completely
    let (_, execute, version) = state_row(&pool, peid, "S", 1).await;
    assert_eq!(execute, STATUS_COMPLETED);
    assert_eq!(version, 2);

    // the re-observed snapshot shows no running phase, so the loser no-ops
    let prep = prepare(&store, peid, "S", 1).await;
    assert_ne!(
        prep.execute_status,
        xdb::persistence::data_models::StateExecutionStatus::Running
    );
}

#[tokio::test]
#[serial]
async fn describe_returns_latest_process() {
    let Some(store) = setup_store().await else { return };

    let err = store.describe_latest_process("n", "missing").await.unwrap_err();
    assert!(err.is_not_found());

    let resp = store
        .start_process(start_request("p", Some(("S", skip_wait_until()))))
        .await
        .unwrap();

    let described = store.describe_latest_process("n", "p").await.unwrap();
    assert_eq!(
        described.process_execution_id,
        resp.process_execution_id.to_string()
    );
    assert_eq!(described.process_type, "Order");
    assert_eq!(described.worker_url, "http://worker.test:8803");
    assert!(described.start_timestamp > 0);
}
