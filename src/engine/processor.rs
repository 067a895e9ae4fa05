//! Bounded concurrent task processors.
//!
//! Each processor owns a bounded channel fed by the shard pollers and a
//! semaphore capping in-flight work. Tasks whose shard is no longer owned are
//! dropped (another owner may already have re-read them); internal errors put
//! the task back onto the channel for an in-memory retry.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api_types::NotifyImmediateTasksRequest;
use crate::config::TaskQueueConfig;
use crate::engine::state_worker::{process_state_task, StateWorkerDeps};
use crate::persistence::data_models::{
    ImmediateTask, ImmediateTaskInfo, ImmediateTaskType, TimerTask, TimerTaskType,
};
use crate::persistence::ProcessLocalQueueMessageRequest;

const REENQUEUE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Shards currently owned by this server. Written only while queues are
/// brought up or torn down.
#[derive(Clone, Default)]
pub(crate) struct ShardSet {
    inner: Arc<RwLock<HashSet<i32>>>,
}

impl ShardSet {
    fn add(&self, shard_id: i32) {
        self.inner.write().expect("shard set poisoned").insert(shard_id);
    }

    fn remove(&self, shard_id: i32) {
        self.inner
            .write()
            .expect("shard set poisoned")
            .remove(&shard_id);
    }

    fn contains(&self, shard_id: i32) -> bool {
        self.inner
            .read()
            .expect("shard set poisoned")
            .contains(&shard_id)
    }
}

struct CommitChannels<T> {
    inner: Arc<RwLock<HashMap<i32, mpsc::Sender<T>>>>,
}

impl<T> Default for CommitChannels<T> {
    fn default() -> Self {
        Self {
            inner: Arc::default(),
        }
    }
}

impl<T> Clone for CommitChannels<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> CommitChannels<T> {
    fn insert(&self, shard_id: i32, sender: mpsc::Sender<T>) {
        self.inner
            .write()
            .expect("commit channels poisoned")
            .insert(shard_id, sender);
    }

    fn remove(&self, shard_id: i32) {
        self.inner
            .write()
            .expect("commit channels poisoned")
            .remove(&shard_id);
    }

    fn get(&self, shard_id: i32) -> Option<mpsc::Sender<T>> {
        self.inner
            .read()
            .expect("commit channels poisoned")
            .get(&shard_id)
            .cloned()
    }
}

/// Re-enqueue a task for in-memory retry without risking a full-channel
/// deadlock from inside a worker.
fn requeue<T: Send + 'static>(task_tx: &mpsc::Sender<T>, task: T) {
    match task_tx.try_send(task) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(task)) => {
            let task_tx = task_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(REENQUEUE_RETRY_DELAY).await;
                let _ = task_tx.send(task).await;
            });
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

/// Processor pool for immediate tasks.
pub struct ImmediateTaskProcessor {
    task_tx: mpsc::Sender<ImmediateTask>,
    shards: ShardSet,
    commit_txs: CommitChannels<ImmediateTask>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ImmediateTaskProcessor {
    pub fn start(config: TaskQueueConfig, deps: StateWorkerDeps) -> Self {
        let (task_tx, task_rx) = mpsc::channel(config.processor_buffer_size);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shards = ShardSet::default();
        let commit_txs = CommitChannels::default();

        let dispatcher = Dispatcher {
            task_rx,
            task_tx: task_tx.clone(),
            shards: shards.clone(),
            commit_txs: commit_txs.clone(),
            semaphore: Arc::new(Semaphore::new(config.processor_concurrency)),
            shutdown_rx,
            deps,
        };
        let handle = tokio::spawn(dispatcher.run_immediate());

        Self {
            task_tx,
            shards,
            commit_txs,
            shutdown_tx,
            handle,
        }
    }

    pub fn task_sender(&self) -> mpsc::Sender<ImmediateTask> {
        self.task_tx.clone()
    }

    pub fn register_shard(&self, shard_id: i32, commit_tx: mpsc::Sender<ImmediateTask>) {
        self.shards.add(shard_id);
        self.commit_txs.insert(shard_id, commit_tx);
    }

    pub fn unregister_shard(&self, shard_id: i32) {
        self.shards.remove(shard_id);
        self.commit_txs.remove(shard_id);
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.handle.await {
            error!(?err, "immediate task processor panicked");
        }
    }
}

/// Processor pool for timer tasks. Backoff timers replay the worker-call
/// path; command and timeout timers apply store operations directly.
pub struct TimerTaskProcessor {
    task_tx: mpsc::Sender<TimerTask>,
    shards: ShardSet,
    commit_txs: CommitChannels<TimerTask>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TimerTaskProcessor {
    pub fn start(config: TaskQueueConfig, deps: StateWorkerDeps) -> Self {
        let (task_tx, task_rx) = mpsc::channel(config.processor_buffer_size);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shards = ShardSet::default();
        let commit_txs = CommitChannels::default();

        let dispatcher = Dispatcher {
            task_rx,
            task_tx: task_tx.clone(),
            shards: shards.clone(),
            commit_txs: commit_txs.clone(),
            semaphore: Arc::new(Semaphore::new(config.processor_concurrency)),
            shutdown_rx,
            deps,
        };
        let handle = tokio::spawn(dispatcher.run_timer());

        Self {
            task_tx,
            shards,
            commit_txs,
            shutdown_tx,
            handle,
        }
    }

    pub fn task_sender(&self) -> mpsc::Sender<TimerTask> {
        self.task_tx.clone()
    }

    pub fn register_shard(&self, shard_id: i32, commit_tx: mpsc::Sender<TimerTask>) {
        self.shards.add(shard_id);
        self.commit_txs.insert(shard_id, commit_tx);
    }

    pub fn unregister_shard(&self, shard_id: i32) {
        self.shards.remove(shard_id);
        self.commit_txs.remove(shard_id);
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.handle.await {
            error!(?err, "timer task processor panicked");
        }
    }
}

struct Dispatcher<T> {
    task_rx: mpsc::Receiver<T>,
    task_tx: mpsc::Sender<T>,
    shards: ShardSet,
    commit_txs: CommitChannels<T>,
    semaphore: Arc<Semaphore>,
    shutdown_rx: watch::Receiver<bool>,
    deps: StateWorkerDeps,
}

impl Dispatcher<ImmediateTask> {
    async fn run_immediate(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => break,
                maybe_task = self.task_rx.recv() => {
                    let Some(task) = maybe_task else { break };
                    if !self.shards.contains(task.shard_id) {
                        info!(shard_id = task.shard_id, ?task.task_sequence, "skip stale task after shard movement");
                        continue;
                    }
                    let permit = match self.semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let deps = self.deps.clone();
                    let shards = self.shards.clone();
                    let commit_txs = self.commit_txs.clone();
                    let task_tx = self.task_tx.clone();
                    tokio::spawn(async move {
                        let result = process_immediate_task(&deps, task.clone()).await;
                        finish_task(result, task, |t| t.shard_id, &shards, &commit_txs, &task_tx);
                        drop(permit);
                    });
                }
            }
        }
        debug!("immediate task dispatcher stopped");
    }
}

impl Dispatcher<TimerTask> {
    async fn run_timer(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => break,
                maybe_task = self.task_rx.recv() => {
                    let Some(task) = maybe_task else { break };
                    if !self.shards.contains(task.shard_id) {
                        info!(shard_id = task.shard_id, ?task.task_sequence, "skip stale task after shard movement");
                        continue;
                    }
                    let permit = match self.semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let deps = self.deps.clone();
                    let shards = self.shards.clone();
                    let commit_txs = self.commit_txs.clone();
                    let task_tx = self.task_tx.clone();
                    tokio::spawn(async move {
                        let result = process_timer_task(&deps, task.clone()).await;
                        finish_task(result, task, |t| t.shard_id, &shards, &commit_txs, &task_tx);
                        drop(permit);
                    });
                }
            }
        }
        debug!("timer task dispatcher stopped");
    }
}

/// Commit the task on success, re-enqueue on internal error, drop either way
/// when the shard moved while the task was in flight.
fn finish_task<T: Send + 'static>(
    result: Result<()>,
    task: T,
    shard_of: impl Fn(&T) -> i32,
    shards: &ShardSet,
    commit_txs: &CommitChannels<T>,
    task_tx: &mpsc::Sender<T>,
) {
    let shard_id = shard_of(&task);
    if !shards.contains(shard_id) {
        info!(shard_id, "dropping in-flight task after shard movement");
        return;
    }
    match result {
        Ok(()) => {
            // never block a worker on the commit channel: the poller that
            // drains it may itself be blocked feeding the task channel
            if let Some(commit_tx) = commit_txs.get(shard_id) {
                if let Err(mpsc::error::TrySendError::Full(task)) = commit_tx.try_send(task) {
                    tokio::spawn(async move {
                        let _ = commit_tx.send(task).await;
                    });
                }
            }
        }
        Err(err) => {
            info!(?err, "task failed on internal error, re-enqueueing for immediate retry");
            requeue(task_tx, task);
        }
    }
}

async fn process_immediate_task(deps: &StateWorkerDeps, task: ImmediateTask) -> Result<()> {
    debug!(?task.task_type, ?task.task_sequence, "start executing immediate task");

    if task.task_type == ImmediateTaskType::NewLocalQueueMessage {
        return process_local_queue_message_task(deps, task).await;
    }
    process_state_task(deps, task).await
}

async fn process_local_queue_message_task(deps: &StateWorkerDeps, task: ImmediateTask) -> Result<()> {
    let message = task
        .info
        .local_queue_message_info
        .clone()
        .ok_or_else(|| anyhow!("local queue message task without message info"))?;
    // a lost version race here must retry: dropping the task would lose the
    // message, which is only durable inside this transaction's queue map
    let response = deps
        .store
        .process_local_queue_message(ProcessLocalQueueMessageRequest {
            process_execution_id: task.process_execution_id,
            messages: vec![message],
            task_shard_id: task.shard_id,
        })
        .await?;
    if response.has_new_immediate_task {
        deps.notifier
            .notify_new_immediate_tasks(NotifyImmediateTasksRequest {
                shard_id: task.shard_id,
                process_execution_id: Some(task.process_execution_id.to_string()),
                ..Default::default()
            });
    }
    Ok(())
}

async fn process_timer_task(deps: &StateWorkerDeps, task: TimerTask) -> Result<()> {
    debug!(?task.task_type, ?task.task_sequence, "start executing timer task");

    match task.task_type {
        TimerTaskType::WorkerTaskBackoff => {
            let immediate = immediate_task_from_backoff(&task)?;
            process_state_task(deps, immediate).await
        }
        TimerTaskType::TimerCommand | TimerTaskType::ProcessTimeout => {
            // timer-command races must retry, not abandon: the fired command
            // is only durable once this transaction commits
            let response = deps.store.process_timer_task(task.clone()).await?;
            if response.has_new_immediate_task {
                deps.notifier
                    .notify_new_immediate_tasks(NotifyImmediateTasksRequest {
                        shard_id: task.shard_id,
                        process_execution_id: Some(task.process_execution_id.to_string()),
                        ..Default::default()
                    });
            }
            Ok(())
        }
    }
}

/// Rebuild the worker-phase task a fired backoff timer resumes.
fn immediate_task_from_backoff(task: &TimerTask) -> Result<ImmediateTask> {
    let task_type = task
        .info
        .worker_task_type
        .ok_or_else(|| anyhow!("backoff timer task without a worker task type"))?;
    if task.info.worker_task_backoff_info.is_none() {
        warn!(?task.task_sequence, "backoff timer task without attempt counters");
    }
    Ok(ImmediateTask {
        shard_id: task.shard_id,
        task_sequence: None,
        task_type,
        process_execution_id: task.process_execution_id,
        state_id: task.state_id.clone(),
        state_id_sequence: task.state_id_sequence,
        info: ImmediateTaskInfo {
            worker_task_backoff_info: task.info.worker_task_backoff_info,
            local_queue_message_info: None,
        },
    })
}
