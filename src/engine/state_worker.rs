//! Turning a prepared task into a worker HTTP call and committing the
//! outcome through the process store.
//!
//! Shared by the immediate-task processor and the timer-task processor (a
//! fired backoff timer replays the same path).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::api_types::{
    AsyncStateConfig, AsyncStateExecuteRequest, AsyncStateWaitUntilRequest, Context,
    NotifyImmediateTasksRequest, NotifyTimerTasksRequest, RetryPolicy,
};
use crate::config::TaskQueueConfig;
use crate::engine::backoff::next_backoff_interval;
use crate::engine::notifier::TaskNotifier;
use crate::persistence::data_models::{
    ImmediateTask, ImmediateTaskType, StateExecutionStatus, WorkerTaskBackoffInfo,
};
use crate::persistence::{
    BackoffImmediateTaskRequest, CompleteExecuteExecutionRequest, FailStateExecutionRequest,
    PrepareStateExecutionResponse, ProcessStore, ProcessWaitUntilExecutionRequest, StoreError,
};
use crate::worker_client::{fix_worker_url, WorkerApiError, WorkerClient};

/// Everything a processor worker needs to drive one task to a durable
/// outcome.
#[derive(Clone)]
pub struct StateWorkerDeps {
    pub store: Arc<dyn ProcessStore>,
    pub worker_client: WorkerClient,
    pub notifier: Arc<dyn TaskNotifier>,
    pub config: TaskQueueConfig,
}

/// Process a worker-phase task end to end. `Err` means an internal problem
/// worth an immediate in-memory retry; worker failures are absorbed into the
/// backoff path and return `Ok`.
pub(crate) async fn process_state_task(
    deps: &StateWorkerDeps,
    mut task: ImmediateTask,
) -> Result<()> {
    let prepare = match deps
        .store
        .prepare_state_execution(task.process_execution_id, &task.state_execution_id())
        .await
    {
        Ok(prepare) => prepare,
        Err(err) if err.is_not_found() => {
            warn!(state_execution_id = %task.state_execution_id(), "task points at a missing state execution, dropping");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    let backoff_info = bump_attempt(&mut task);

    if prepare.wait_until_status == StateExecutionStatus::Running {
        process_wait_until_task(deps, &task, prepare, backoff_info).await
    } else if prepare.execute_status == StateExecutionStatus::Running {
        process_execute_task(deps, &task, prepare, backoff_info).await
    } else {
        // a concurrent writer already advanced the state; nothing to do
        info!(
            state_execution_id = %task.state_execution_id(),
            wait_until_status = ?prepare.wait_until_status,
            execute_status = ?prepare.execute_status,
            "noop for immediate task"
        );
        Ok(())
    }
}

async fn process_wait_until_task(
    deps: &StateWorkerDeps,
    task: &ImmediateTask,
    prepare: PrepareStateExecutionResponse,
    backoff_info: WorkerTaskBackoffInfo,
) -> Result<()> {
    let worker_url = fix_worker_url(&prepare.info.worker_url);
    let timeout = derive_api_timeout(
        &deps.config,
        ImmediateTaskType::WaitUntil,
        prepare.info.state_config.as_ref(),
    );
    let request = AsyncStateWaitUntilRequest {
        context: api_context(&prepare, task, backoff_info),
        process_type: prepare.info.process_type.clone(),
        state_id: task.state_id.clone(),
        state_input: Some(prepare.input.clone()),
    };

    match deps.worker_client.wait_until(&worker_url, timeout, &request).await {
        Ok(response) => {
            let result = deps
                .store
                .process_wait_until_execution(ProcessWaitUntilExecutionRequest {
                    process_execution_id: task.process_execution_id,
                    state_execution_id: task.state_execution_id(),
                    prepare: prepare.clone(),
                    command_request: response.command_request,
                    publish_to_local_queue: response.publish_to_local_queue,
                    task_shard_id: task.shard_id,
                })
                .await;
            let Some(outcome) = commit_or_abandon(result, "ProcessWaitUntilExecution")? else {
                return Ok(());
            };
            if outcome.has_new_immediate_task {
                notify_immediate(deps, &prepare, task);
            }
            if !outcome.timer_fire_timestamps.is_empty() {
                notify_timers(deps, &prepare, task, outcome.timer_fire_timestamps);
            }
            Ok(())
        }
        Err(err) => {
            let policy = prepare
                .info
                .state_config
                .as_ref()
                .and_then(|c| c.wait_until_api_retry_policy.as_ref())
                .cloned();
            handle_worker_failure(deps, task, prepare, backoff_info, err, policy).await
        }
    }
}

async fn process_execute_task(
    deps: &StateWorkerDeps,
    task: &ImmediateTask,
    prepare: PrepareStateExecutionResponse,
    backoff_info: WorkerTaskBackoffInfo,
) -> Result<()> {
    let worker_url = fix_worker_url(&prepare.info.worker_url);
    let timeout = derive_api_timeout(
        &deps.config,
        ImmediateTaskType::Execute,
        prepare.info.state_config.as_ref(),
    );
    let request = AsyncStateExecuteRequest {
        context: api_context(&prepare, task, backoff_info),
        process_type: prepare.info.process_type.clone(),
        state_id: task.state_id.clone(),
        state_input: Some(prepare.input.clone()),
        command_results: Some(prepare.wait_until_command_results.clone()),
    };

    match deps.worker_client.execute(&worker_url, timeout, &request).await {
        Ok(response) => {
            if response.state_decision.is_conflicting() {
                // a decision cannot both close the thread and open next
                // states; no retry would change the answer
                warn!(state_execution_id = %task.state_execution_id(), "decision has both thread close and next states, failing the state");
                let result = deps
                    .store
                    .fail_state_execution(FailStateExecutionRequest {
                        process_execution_id: task.process_execution_id,
                        state_execution_id: task.state_execution_id(),
                        prepare,
                        failed_phase: ImmediateTaskType::Execute,
                        last_failure_status: 0,
                        last_failure_details:
                            "invalid state decision: both thread close decision and next states"
                                .to_string(),
                        completed_attempts: backoff_info.completed_attempts,
                    })
                    .await;
                commit_or_abandon(result, "FailStateExecution")?;
                return Ok(());
            }

            let result = deps
                .store
                .complete_execute_execution(CompleteExecuteExecutionRequest {
                    process_execution_id: task.process_execution_id,
                    state_execution_id: task.state_execution_id(),
                    prepare: prepare.clone(),
                    state_decision: response.state_decision,
                    publish_to_local_queue: response.publish_to_local_queue,
                    task_shard_id: task.shard_id,
                })
                .await;
            let Some(outcome) = commit_or_abandon(result, "CompleteExecuteExecution")? else {
                return Ok(());
            };
            if outcome.has_new_immediate_task {
                notify_immediate(deps, &prepare, task);
            }
            Ok(())
        }
        Err(err) => {
            let policy = prepare
                .info
                .state_config
                .as_ref()
                .and_then(|c| c.execute_api_retry_policy.as_ref())
                .cloned();
            handle_worker_failure(deps, task, prepare, backoff_info, err, policy).await
        }
    }
}

async fn handle_worker_failure(
    deps: &StateWorkerDeps,
    task: &ImmediateTask,
    prepare: PrepareStateExecutionResponse,
    backoff_info: WorkerTaskBackoffInfo,
    err: WorkerApiError,
    policy: Option<RetryPolicy>,
) -> Result<()> {
    let status_code = err.status_code();
    let details = err.details(deps.config.max_state_api_failure_detail_size);
    info!(
        task_type = ?task.task_type,
        status_code,
        namespace = %prepare.info.namespace,
        process_id = %prepare.info.process_id,
        state_execution_id = %task.state_execution_id(),
        "worker API returned error"
    );

    let now = Utc::now().timestamp();
    match next_backoff_interval(
        backoff_info.completed_attempts,
        backoff_info.first_attempt_timestamp_seconds,
        policy.as_ref(),
        now,
    ) {
        Some(interval_seconds) => {
            let fire_timestamp_seconds = now + i64::from(interval_seconds);
            let result = deps
                .store
                .backoff_immediate_task(BackoffImmediateTaskRequest {
                    task: task.clone(),
                    prepare: prepare.clone(),
                    fire_timestamp_seconds,
                    last_failure_status: status_code,
                    last_failure_details: details,
                })
                .await;
            if commit_or_abandon(result, "BackoffImmediateTask")?.is_none() {
                return Ok(());
            }
            notify_timers(deps, &prepare, task, vec![fire_timestamp_seconds]);
            debug!(interval_seconds, fire_timestamp_seconds, "retry scheduled");
            Ok(())
        }
        None => {
            info!(
                state_execution_id = %task.state_execution_id(),
                completed_attempts = backoff_info.completed_attempts,
                "retries exhausted, failing the state execution"
            );
            let result = deps
                .store
                .fail_state_execution(FailStateExecutionRequest {
                    process_execution_id: task.process_execution_id,
                    state_execution_id: task.state_execution_id(),
                    prepare,
                    failed_phase: task.task_type,
                    last_failure_status: status_code,
                    last_failure_details: details,
                    completed_attempts: backoff_info.completed_attempts,
                })
                .await;
            commit_or_abandon(result, "FailStateExecution")?;
            Ok(())
        }
    }
}

/// A lost version race means a concurrent writer already applied a durable
/// outcome for this state; the stale task is committed as-is and ground
/// truth is re-observed by the pollers.
fn commit_or_abandon<T>(result: Result<T, StoreError>, operation: &str) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_conditional_update_failure() => {
            warn!(operation, "conditional update failed, abandoning in-flight task");
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

/// Initialize or advance the attempt counters carried on the task.
fn bump_attempt(task: &mut ImmediateTask) -> WorkerTaskBackoffInfo {
    let info = task
        .info
        .worker_task_backoff_info
        .get_or_insert_with(|| WorkerTaskBackoffInfo {
            completed_attempts: 0,
            first_attempt_timestamp_seconds: Utc::now().timestamp(),
        });
    info.completed_attempts += 1;
    *info
}

fn api_context(
    prepare: &PrepareStateExecutionResponse,
    task: &ImmediateTask,
    backoff_info: WorkerTaskBackoffInfo,
) -> Context {
    Context {
        process_id: prepare.info.process_id.clone(),
        process_execution_id: task.process_execution_id.to_string(),
        state_execution_id: task.state_execution_id().to_string(),
        attempt: backoff_info.completed_attempts,
        first_attempt_timestamp: backoff_info.first_attempt_timestamp_seconds,
    }
}

/// Per-call timeout: state config override (per phase) clamped by the system
/// maximum.
pub(crate) fn derive_api_timeout(
    config: &TaskQueueConfig,
    task_type: ImmediateTaskType,
    state_config: Option<&AsyncStateConfig>,
) -> Duration {
    let mut timeout = config.default_api_timeout();
    if let Some(state_config) = state_config {
        let override_seconds = match task_type {
            ImmediateTaskType::WaitUntil => state_config.wait_until_api_timeout_seconds,
            ImmediateTaskType::Execute => state_config.execute_api_timeout_seconds,
            ImmediateTaskType::NewLocalQueueMessage => None,
        };
        if let Some(seconds) = override_seconds.filter(|s| *s > 0) {
            timeout = Duration::from_secs(seconds as u64);
        }
    }
    timeout.min(config.max_api_timeout())
}

fn notify_immediate(deps: &StateWorkerDeps, prepare: &PrepareStateExecutionResponse, task: &ImmediateTask) {
    deps.notifier
        .notify_new_immediate_tasks(NotifyImmediateTasksRequest {
            shard_id: task.shard_id,
            namespace: Some(prepare.info.namespace.clone()),
            process_id: Some(prepare.info.process_id.clone()),
            process_execution_id: Some(task.process_execution_id.to_string()),
        });
}

fn notify_timers(
    deps: &StateWorkerDeps,
    prepare: &PrepareStateExecutionResponse,
    task: &ImmediateTask,
    fire_timestamps: Vec<i64>,
) {
    deps.notifier.notify_new_timer_tasks(NotifyTimerTasksRequest {
        shard_id: task.shard_id,
        namespace: Some(prepare.info.namespace.clone()),
        process_id: Some(prepare.info.process_id.clone()),
        process_execution_id: Some(task.process_execution_id.to_string()),
        fire_timestamps,
    });
}
