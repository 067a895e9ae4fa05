//! Per-shard poller for the timer task table.
//!
//! Due tasks are read into an in-memory min-heap keyed by
//! `(fire_time, task_sequence)` and dispatched in fire order. The poller
//! wakes on notifier pushes, on the long-poll tick, or when the earliest heap
//! entry comes due. Committed tasks are deleted one row at a time.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::TaskQueueConfig;
use crate::engine::processor::TimerTaskProcessor;
use crate::persistence::data_models::TimerTask;
use crate::persistence::ProcessStore;

/// Min-heap of timer tasks ordered by `(fire_time, task_sequence)`.
#[derive(Default)]
pub(crate) struct TimerTaskPriorityQueue {
    heap: BinaryHeap<Reverse<OrderedTimerTask>>,
}

struct OrderedTimerTask(TimerTask);

impl OrderedTimerTask {
    fn key(&self) -> (i64, i64) {
        (
            self.0.fire_timestamp_seconds,
            self.0.task_sequence.unwrap_or(0),
        )
    }
}

impl PartialEq for OrderedTimerTask {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for OrderedTimerTask {}

impl PartialOrd for OrderedTimerTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedTimerTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl TimerTaskPriorityQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, task: TimerTask) {
        self.heap.push(Reverse(OrderedTimerTask(task)));
    }

    pub(crate) fn pop(&mut self) -> Option<TimerTask> {
        self.heap.pop().map(|Reverse(ordered)| ordered.0)
    }

    pub(crate) fn peek_fire_time(&self) -> Option<i64> {
        self.heap
            .peek()
            .map(|Reverse(ordered)| ordered.0.fire_timestamp_seconds)
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}

/// Handle for one shard's timer task poller.
pub struct TimerTaskQueue {
    shard_id: i32,
    notify_tx: mpsc::UnboundedSender<Vec<i64>>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TimerTaskQueue {
    pub fn start(
        shard_id: i32,
        config: TaskQueueConfig,
        store: Arc<dyn ProcessStore>,
        processor: &TimerTaskProcessor,
    ) -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (commit_tx, commit_rx) = mpsc::channel(config.processor_buffer_size);
        processor.register_shard(shard_id, commit_tx);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poller = Poller {
            shard_id,
            config,
            store,
            task_tx: processor.task_sender(),
            commit_rx,
            notify_rx,
            shutdown_rx,
            heap: TimerTaskPriorityQueue::new(),
            loaded: HashSet::new(),
        };
        let handle = tokio::spawn(poller.run());

        Self {
            shard_id,
            notify_tx,
            shutdown_tx,
            handle,
        }
    }

    /// Sender the notifier uses to push new fire timestamps.
    pub fn notify_sender(&self) -> mpsc::UnboundedSender<Vec<i64>> {
        self.notify_tx.clone()
    }

    pub fn shard_id(&self) -> i32 {
        self.shard_id
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.handle.await {
            error!(?err, shard_id = self.shard_id, "timer task poller panicked");
        }
    }
}

struct Poller {
    shard_id: i32,
    config: TaskQueueConfig,
    store: Arc<dyn ProcessStore>,
    task_tx: mpsc::Sender<TimerTask>,
    commit_rx: mpsc::Receiver<TimerTask>,
    notify_rx: mpsc::UnboundedReceiver<Vec<i64>>,
    shutdown_rx: watch::Receiver<bool>,
    heap: TimerTaskPriorityQueue,
    /// (fire_time, sequence) pairs currently in the heap or in flight, so
    /// re-reads do not double-dispatch.
    loaded: HashSet<(i64, i64)>,
}

impl Poller {
    async fn run(mut self) {
        info!(shard_id = self.shard_id, "timer task poller started");

        let mut poll_ticker = interval(self.config.poll_interval());
        poll_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.dispatch_due().await;

            let now = Utc::now().timestamp();
            let sleep_duration = self
                .heap
                .peek_fire_time()
                .map(|fire| Duration::from_secs((fire - now).max(1) as u64));

            tokio::select! {
                _ = self.shutdown_rx.changed() => break,
                _ = poll_ticker.tick() => {
                    self.load_window().await;
                }
                maybe_timestamps = self.notify_rx.recv() => {
                    let Some(timestamps) = maybe_timestamps else { break };
                    self.load_notified(timestamps).await;
                }
                maybe_task = self.commit_rx.recv() => {
                    let Some(task) = maybe_task else { break };
                    self.commit(task).await;
                }
                _ = tokio::time::sleep(sleep_duration.unwrap_or(Duration::ZERO)),
                    if sleep_duration.is_some() => {}
            }
        }
        info!(shard_id = self.shard_id, "timer task poller stopped");
    }

    async fn dispatch_due(&mut self) {
        let now = Utc::now().timestamp();
        while self.heap.peek_fire_time().is_some_and(|fire| fire <= now) {
            let Some(task) = self.heap.pop() else { break };
            if self.task_tx.send(task).await.is_err() {
                debug!(shard_id = self.shard_id, "processor channel closed");
                return;
            }
        }
    }

    /// Load everything due within the next poll window.
    async fn load_window(&mut self) {
        let cutoff = Utc::now().timestamp() + self.config.poll_interval_seconds as i64;
        match self
            .store
            .batch_select_timer_tasks(self.shard_id, cutoff, self.config.poll_page_size)
            .await
        {
            Ok(tasks) => {
                self.absorb(tasks);
                debug!(shard_id = self.shard_id, heap_len = self.heap.len(), "timer window loaded");
            }
            Err(err) => warn!(?err, shard_id = self.shard_id, "timer task poll failed"),
        }
    }

    /// A notification names exact fire timestamps; fetch just those rows when
    /// they fall inside the current window.
    async fn load_notified(&mut self, timestamps: Vec<i64>) {
        let cutoff = Utc::now().timestamp() + self.config.poll_interval_seconds as i64;
        let mut relevant: Vec<i64> = timestamps.into_iter().filter(|t| *t <= cutoff).collect();
        relevant.sort_unstable();
        relevant.dedup();
        if relevant.is_empty() {
            return;
        }
        match self
            .store
            .select_timer_tasks_for_timestamps(self.shard_id, &relevant, 0)
            .await
        {
            Ok(tasks) => self.absorb(tasks),
            Err(err) => warn!(?err, shard_id = self.shard_id, "notified timer read failed"),
        }
    }

    fn absorb(&mut self, tasks: Vec<TimerTask>) {
        for task in tasks {
            let Some(task_sequence) = task.task_sequence else {
                continue;
            };
            if self.loaded.insert((task.fire_timestamp_seconds, task_sequence)) {
                self.heap.push(task);
            }
        }
    }

    /// Processing committed durably; the row can go.
    async fn commit(&mut self, task: TimerTask) {
        let Some(task_sequence) = task.task_sequence else {
            return;
        };
        self.loaded.remove(&(task.fire_timestamp_seconds, task_sequence));
        if let Err(err) = self
            .store
            .delete_timer_task(self.shard_id, task.fire_timestamp_seconds, task_sequence)
            .await
        {
            // the row will be re-read and re-processed; commits are
            // idempotent under the version gates
            warn!(?err, shard_id = self.shard_id, task_sequence, "timer task delete failed");
        }
    }
}
