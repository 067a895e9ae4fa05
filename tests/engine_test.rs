//! End-to-end engine tests: pollers, processors, and a mock worker over HTTP.
//!
//! Skipped unless `XDB_TEST_DATABASE_URL` is set.

use std::env;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serial_test::serial;
use sqlx::Row;
use tokio::net::TcpListener;
use uuid::Uuid;

use xdb::api_types::{
    AsyncStateConfig, AsyncStateExecuteRequest, AsyncStateExecuteResponse,
    AsyncStateWaitUntilRequest, AsyncStateWaitUntilResponse, CommandRequest,
    EncodedObject, NotifyImmediateTasksRequest, ProcessExecutionStartRequest, RetryPolicy,
    StateDecision, ThreadCloseDecision, ThreadCloseType, TimerCommand,
};
use xdb::config::{AsyncServiceConfig, TaskQueueConfig};
use xdb::engine::{InProcessNotifier, TaskNotifier};
use xdb::persistence::data_models::DEFAULT_SHARD_ID;
use xdb::persistence::{postgres, PgProcessStore, ProcessStore, StartProcessRequest};
use xdb::service::AsyncService;
use xdb::worker_client::{EXECUTE_PATH, WAIT_UNTIL_PATH};

#[derive(Clone)]
struct MockWorker {
    wait_until_calls: Arc<AtomicUsize>,
    execute_calls: Arc<AtomicUsize>,
    wait_until_response: Arc<AsyncStateWaitUntilResponse>,
    execute_response: Arc<AsyncStateExecuteResponse>,
    execute_status: StatusCode,
}

impl MockWorker {
    fn new(
        wait_until_response: AsyncStateWaitUntilResponse,
        execute_response: AsyncStateExecuteResponse,
        execute_status: StatusCode,
    ) -> Self {
        Self {
            wait_until_calls: Arc::new(AtomicUsize::new(0)),
            execute_calls: Arc::new(AtomicUsize::new(0)),
            wait_until_response: Arc::new(wait_until_response),
            execute_response: Arc::new(execute_response),
            execute_status,
        }
    }

    async fn spawn(self) -> SocketAddr {
        let app = Router::new()
            .route(WAIT_UNTIL_PATH, post(handle_wait_until))
            .route(EXECUTE_PATH, post(handle_execute))
            .with_state(self);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }
}

async fn handle_wait_until(
    State(worker): State<MockWorker>,
    Json(_request): Json<AsyncStateWaitUntilRequest>,
) -> Json<AsyncStateWaitUntilResponse> {
    worker.wait_until_calls.fetch_add(1, Ordering::SeqCst);
    Json(worker.wait_until_response.as_ref().clone())
}

async fn handle_execute(
    State(worker): State<MockWorker>,
    Json(_request): Json<AsyncStateExecuteRequest>,
) -> (StatusCode, Json<AsyncStateExecuteResponse>) {
    worker.execute_calls.fetch_add(1, Ordering::SeqCst);
    (
        worker.execute_status,
        Json(worker.execute_response.as_ref().clone()),
    )
}

async fn setup_store() -> Option<Arc<PgProcessStore>> {
    let url = match env::var("XDB_TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("skipping test: XDB_TEST_DATABASE_URL not set");
            return None;
        }
    };
    let pool = postgres::connect(&url, 5).await.ok()?;
    postgres::apply_schema(&pool).await.ok()?;
    sqlx::query(
        "TRUNCATE xdb_sys_latest_process_executions, xdb_sys_process_executions, \
         xdb_sys_async_state_executions, xdb_sys_immediate_tasks, xdb_sys_timer_tasks, \
         xdb_sys_local_queue",
    )
    .execute(&pool)
    .await
    .ok()?;
    Some(Arc::new(PgProcessStore::new(pool)))
}

fn fast_queue_config() -> TaskQueueConfig {
    TaskQueueConfig {
        poll_interval_seconds: 1,
        commit_interval_seconds: 1,
        default_async_state_api_timeout_seconds: 5,
        max_async_state_api_timeout_seconds: 10,
        ..Default::default()
    }
}

fn service_config() -> AsyncServiceConfig {
    AsyncServiceConfig {
        port: 0,
        owned_shards: vec![DEFAULT_SHARD_ID],
        immediate_task_queue: fast_queue_config(),
        timer_task_queue: fast_queue_config(),
    }
}

fn start_request(
    process_id: &str,
    worker_addr: SocketAddr,
    state_config: AsyncStateConfig,
) -> StartProcessRequest {
    StartProcessRequest {
        request: ProcessExecutionStartRequest {
            namespace: "n".to_string(),
            process_id: process_id.to_string(),
            process_type: "Order".to_string(),
            worker_url: format!("http://{worker_addr}"),
            start_state_id: Some("S".to_string()),
            start_state_input: Some(EncodedObject {
                encoding: "json".to_string(),
                data: "\"input\"".to_string(),
            }),
            start_state_config: Some(state_config),
            process_start_config: None,
        },
        new_task_shard_id: DEFAULT_SHARD_ID,
    }
}

async fn wait_for_process_status(
    store: &PgProcessStore,
    process_execution_id: Uuid,
    expected: i16,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        let status: i16 = sqlx::query("SELECT status FROM xdb_sys_process_executions WHERE id = $1")
            .bind(process_execution_id.to_string())
            .fetch_one(store.pool())
            .await
            .unwrap()
            .get(0);
        if status == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    false
}

async fn wait_for_execute_status(
    store: &PgProcessStore,
    process_execution_id: Uuid,
    expected: i16,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        let status: i16 = sqlx::query(
            "SELECT execute_status FROM xdb_sys_async_state_executions WHERE process_execution_id = $1",
        )
        .bind(process_execution_id.to_string())
        .fetch_one(store.pool())
        .await
        .unwrap()
        .get(0);
        if status == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    false
}

#[tokio::test]
#[serial]
async fn single_state_process_runs_to_completion() {
    let Some(store) = setup_store().await else { return };

    let worker = MockWorker::new(
        AsyncStateWaitUntilResponse::default(),
        AsyncStateExecuteResponse {
            state_decision: StateDecision {
                next_states: vec![],
                thread_close_decision: Some(ThreadCloseDecision {
                    close_type: ThreadCloseType::ForceCompleteProcess,
                }),
            },
            publish_to_local_queue: vec![],
        },
        StatusCode::OK,
    );
    let execute_calls = worker.execute_calls.clone();
    let worker_addr = worker.spawn().await;

    let notifier = Arc::new(InProcessNotifier::new());
    let service = AsyncService::start(&service_config(), store.clone(), notifier.clone())
        .await
        .unwrap();

    let resp = store
        .start_process(start_request(
            "p-complete",
            worker_addr,
            AsyncStateConfig {
                skip_wait_until: true,
                ..Default::default()
            },
        ))
        .await
        .unwrap();
    notifier.notify_new_immediate_tasks(NotifyImmediateTasksRequest {
        shard_id: DEFAULT_SHARD_ID,
        ..Default::default()
    });

    assert!(
        wait_for_process_status(&store, resp.process_execution_id, 2, Duration::from_secs(10))
            .await,
        "process should complete"
    );
    assert_eq!(execute_calls.load(Ordering::SeqCst), 1);

    service.stop().await;
}

#[tokio::test]
#[serial]
async fn wait_until_timer_fires_and_process_completes() {
    let Some(store) = setup_store().await else { return };

    let worker = MockWorker::new(
        AsyncStateWaitUntilResponse {
            command_request: CommandRequest {
                waiting_type: xdb::api_types::CommandWaitingType::AllOfCompletion,
                timer_commands: vec![TimerCommand {
                    delay_in_seconds: 1,
                }],
                local_queue_commands: vec![],
            },
            publish_to_local_queue: vec![],
        },
        AsyncStateExecuteResponse {
            state_decision: StateDecision {
                next_states: vec![],
                thread_close_decision: Some(ThreadCloseDecision {
                    close_type: ThreadCloseType::DeadEnd,
                }),
            },
            publish_to_local_queue: vec![],
        },
        StatusCode::OK,
    );
    let wait_until_calls = worker.wait_until_calls.clone();
    let worker_addr = worker.spawn().await;

    let notifier = Arc::new(InProcessNotifier::new());
    let service = AsyncService::start(&service_config(), store.clone(), notifier.clone())
        .await
        .unwrap();

    let resp = store
        .start_process(start_request(
            "p-timer",
            worker_addr,
            AsyncStateConfig::default(),
        ))
        .await
        .unwrap();
    notifier.notify_new_immediate_tasks(NotifyImmediateTasksRequest {
        shard_id: DEFAULT_SHARD_ID,
        ..Default::default()
    });

    // wait-until declares the timer, the timer fires, execute dead-ends, and
    // the drained pending map completes the process
    assert!(
        wait_for_process_status(&store, resp.process_execution_id, 2, Duration::from_secs(15))
            .await,
        "process should complete after the timer fires"
    );
    assert_eq!(wait_until_calls.load(Ordering::SeqCst), 1);

    service.stop().await;
}

#[tokio::test]
#[serial]
async fn failing_worker_exhausts_retries_and_fails_the_state() {
    let Some(store) = setup_store().await else { return };

    let worker = MockWorker::new(
        AsyncStateWaitUntilResponse::default(),
        AsyncStateExecuteResponse::default(),
        StatusCode::INTERNAL_SERVER_ERROR,
    );
    let execute_calls = worker.execute_calls.clone();
    let worker_addr = worker.spawn().await;

    let notifier = Arc::new(InProcessNotifier::new());
    let service = AsyncService::start(&service_config(), store.clone(), notifier.clone())
        .await
        .unwrap();

    let resp = store
        .start_process(start_request(
            "p-retry",
            worker_addr,
            AsyncStateConfig {
                skip_wait_until: true,
                execute_api_retry_policy: Some(RetryPolicy {
                    initial_interval_seconds: Some(1),
                    backoff_coefficient: Some(2.0),
                    maximum_interval_seconds: Some(2),
                    maximum_attempts: Some(2),
                    maximum_attempts_duration_seconds: None,
                }),
                ..Default::default()
            },
        ))
        .await
        .unwrap();
    notifier.notify_new_immediate_tasks(NotifyImmediateTasksRequest {
        shard_id: DEFAULT_SHARD_ID,
        ..Default::default()
    });

    assert!(
        wait_for_execute_status(&store, resp.process_execution_id, 6, Duration::from_secs(20))
            .await,
        "execute phase should fail after retries are exhausted"
    );
    assert_eq!(execute_calls.load(Ordering::SeqCst), 2);

    // the process keeps running: retry exhaustion fails only the state
    let status: i16 = sqlx::query("SELECT status FROM xdb_sys_process_executions WHERE id = $1")
        .bind(resp.process_execution_id.to_string())
        .fetch_one(store.pool())
        .await
        .unwrap()
        .get(0);
    assert_eq!(status, 1);

    service.stop().await;
}
