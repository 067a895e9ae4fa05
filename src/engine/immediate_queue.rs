//! Per-shard poller for the immediate task table.
//!
//! The poller reads pages in `task_sequence` order and hands tasks to the
//! processor. Tasks complete out of order, so committed sequences feed a
//! frontier that only advances past a sequence once everything at or below it
//! has committed; rows behind the frontier are range-deleted.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::TaskQueueConfig;
use crate::engine::processor::ImmediateTaskProcessor;
use crate::persistence::data_models::ImmediateTask;
use crate::persistence::ProcessStore;

/// Tracks dispatched and committed sequences and yields the contiguous
/// deletable range.
#[derive(Debug, Default)]
pub(crate) struct CommitFrontier {
    outstanding: BTreeSet<i64>,
    committed: BTreeSet<i64>,
    deletable_high: Option<i64>,
    deleted_high: i64,
}

impl CommitFrontier {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn dispatched(&mut self, task_sequence: i64) {
        self.outstanding.insert(task_sequence);
    }

    pub(crate) fn committed(&mut self, task_sequence: i64) {
        if self.outstanding.remove(&task_sequence) {
            self.committed.insert(task_sequence);
        }
        loop {
            let Some(&min_committed) = self.committed.first() else {
                break;
            };
            // only delete past a committed sequence when nothing older is
            // still in flight
            if self
                .outstanding
                .first()
                .is_some_and(|&min_outstanding| min_outstanding < min_committed)
            {
                break;
            }
            self.committed.pop_first();
            self.deletable_high = Some(min_committed);
        }
    }

    /// Range safe to delete, or None when the frontier has not moved.
    pub(crate) fn deletable_range(&self) -> Option<(i64, i64)> {
        let high = self.deletable_high?;
        (high > self.deleted_high).then_some((self.deleted_high + 1, high))
    }

    pub(crate) fn mark_deleted(&mut self, max_sequence_inclusive: i64) {
        self.deleted_high = self.deleted_high.max(max_sequence_inclusive);
    }
}

/// Handle for one shard's immediate task poller.
pub struct ImmediateTaskQueue {
    shard_id: i32,
    waker: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ImmediateTaskQueue {
    pub fn start(
        shard_id: i32,
        config: TaskQueueConfig,
        store: Arc<dyn ProcessStore>,
        processor: &ImmediateTaskProcessor,
    ) -> Self {
        let waker = Arc::new(Notify::new());
        let (commit_tx, commit_rx) = mpsc::channel(config.processor_buffer_size);
        processor.register_shard(shard_id, commit_tx);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poller = Poller {
            shard_id,
            config,
            store,
            task_tx: processor.task_sender(),
            commit_rx,
            waker: waker.clone(),
            shutdown_rx,
            frontier: CommitFrontier::new(),
            next_poll_sequence: 0,
        };
        let handle = tokio::spawn(poller.run());

        Self {
            shard_id,
            waker,
            shutdown_tx,
            handle,
        }
    }

    /// Waker the notifier uses to trigger an immediate poll.
    pub fn waker(&self) -> Arc<Notify> {
        self.waker.clone()
    }

    pub fn shard_id(&self) -> i32 {
        self.shard_id
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.handle.await {
            error!(?err, shard_id = self.shard_id, "immediate task poller panicked");
        }
    }
}

struct Poller {
    shard_id: i32,
    config: TaskQueueConfig,
    store: Arc<dyn ProcessStore>,
    task_tx: mpsc::Sender<ImmediateTask>,
    commit_rx: mpsc::Receiver<ImmediateTask>,
    waker: Arc<Notify>,
    shutdown_rx: watch::Receiver<bool>,
    frontier: CommitFrontier,
    next_poll_sequence: i64,
}

impl Poller {
    async fn run(mut self) {
        info!(shard_id = self.shard_id, "immediate task poller started");

        let mut poll_ticker = interval(self.config.poll_interval());
        poll_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commit_ticker = interval(self.config.commit_interval());
        commit_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => break,
                _ = poll_ticker.tick() => {
                    self.poll().await;
                }
                _ = self.waker.notified() => {
                    self.poll().await;
                }
                maybe_task = self.commit_rx.recv() => {
                    let Some(task) = maybe_task else { break };
                    if let Some(task_sequence) = task.task_sequence {
                        self.frontier.committed(task_sequence);
                    }
                }
                _ = commit_ticker.tick() => {
                    self.flush_deletes().await;
                }
            }
        }

        // drop what can still be dropped before exiting
        self.flush_deletes().await;
        info!(shard_id = self.shard_id, "immediate task poller stopped");
    }

    /// Read pages in sequence order and hand every task to the processor. A
    /// full page means more work is likely waiting, so keep reading.
    async fn poll(&mut self) {
        loop {
            let page = match self
                .store
                .batch_select_immediate_tasks(
                    self.shard_id,
                    self.next_poll_sequence,
                    self.config.poll_page_size,
                )
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    warn!(?err, shard_id = self.shard_id, "immediate task poll failed");
                    return;
                }
            };

            let full_page = page.len() as i32 >= self.config.poll_page_size;
            for task in page {
                if let Some(task_sequence) = task.task_sequence {
                    self.frontier.dispatched(task_sequence);
                    self.next_poll_sequence = task_sequence + 1;
                }
                if self.task_tx.send(task).await.is_err() {
                    debug!(shard_id = self.shard_id, "processor channel closed");
                    return;
                }
            }
            if !full_page {
                return;
            }
        }
    }

    async fn flush_deletes(&mut self) {
        let Some((min_sequence, max_sequence)) = self.frontier.deletable_range() else {
            return;
        };
        match self
            .store
            .batch_delete_immediate_tasks(self.shard_id, min_sequence, max_sequence)
            .await
        {
            Ok(()) => {
                debug!(
                    shard_id = self.shard_id,
                    min_sequence, max_sequence, "committed immediate tasks deleted"
                );
                self.frontier.mark_deleted(max_sequence);
            }
            Err(err) => {
                // the range stays deletable; the next flush retries
                warn!(?err, shard_id = self.shard_id, "immediate task delete failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontier_advances_only_past_contiguous_commits() {
        let mut frontier = CommitFrontier::new();
        for seq in [1, 2, 3, 4] {
            frontier.dispatched(seq);
        }

        // out-of-order commit does not advance past the in-flight minimum
        frontier.committed(3);
        assert_eq!(frontier.deletable_range(), None);

        frontier.committed(1);
        assert_eq!(frontier.deletable_range(), Some((1, 1)));

        frontier.committed(2);
        assert_eq!(frontier.deletable_range(), Some((1, 3)));

        frontier.committed(4);
        assert_eq!(frontier.deletable_range(), Some((1, 4)));
    }

    #[test]
    fn frontier_tracks_deleted_ranges() {
        let mut frontier = CommitFrontier::new();
        frontier.dispatched(1);
        frontier.dispatched(2);
        frontier.committed(1);

        assert_eq!(frontier.deletable_range(), Some((1, 1)));
        frontier.mark_deleted(1);
        assert_eq!(frontier.deletable_range(), None);

        frontier.committed(2);
        assert_eq!(frontier.deletable_range(), Some((2, 2)));
    }

    #[test]
    fn frontier_handles_sequence_gaps() {
        let mut frontier = CommitFrontier::new();
        // sequences from the database are monotonic but not dense
        frontier.dispatched(5);
        frontier.dispatched(9);
        frontier.committed(9);
        assert_eq!(frontier.deletable_range(), None);
        frontier.committed(5);
        assert_eq!(frontier.deletable_range(), Some((1, 9)));
    }

    #[test]
    fn unknown_commit_is_ignored() {
        let mut frontier = CommitFrontier::new();
        frontier.committed(42);
        assert_eq!(frontier.deletable_range(), None);
    }
}
