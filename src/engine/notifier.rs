//! Fire-and-forget nudges telling pollers "new work is ready now".
//!
//! Delivery is best-effort in every implementation; the pollers' long-poll
//! interval is the correctness backstop.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, Notify};
use tracing::debug;

use crate::api_types::{NotifyImmediateTasksRequest, NotifyTimerTasksRequest};

pub trait TaskNotifier: Send + Sync {
    fn notify_new_immediate_tasks(&self, request: NotifyImmediateTasksRequest);
    fn notify_new_timer_tasks(&self, request: NotifyTimerTasksRequest);
}

/// Routes notifications straight to the owning queues when the async service
/// runs in the same process.
#[derive(Default)]
pub struct InProcessNotifier {
    immediate_wakers: RwLock<HashMap<i32, Arc<Notify>>>,
    timer_wakers: RwLock<HashMap<i32, mpsc::UnboundedSender<Vec<i64>>>>,
}

impl InProcessNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_immediate_queue(&self, shard_id: i32, waker: Arc<Notify>) {
        self.immediate_wakers
            .write()
            .expect("notifier lock poisoned")
            .insert(shard_id, waker);
    }

    pub fn register_timer_queue(&self, shard_id: i32, waker: mpsc::UnboundedSender<Vec<i64>>) {
        self.timer_wakers
            .write()
            .expect("notifier lock poisoned")
            .insert(shard_id, waker);
    }
}

impl TaskNotifier for InProcessNotifier {
    fn notify_new_immediate_tasks(&self, request: NotifyImmediateTasksRequest) {
        let wakers = self.immediate_wakers.read().expect("notifier lock poisoned");
        match wakers.get(&request.shard_id) {
            Some(waker) => waker.notify_one(),
            None => debug!(shard_id = request.shard_id, "no immediate queue for shard, dropping notification"),
        }
    }

    fn notify_new_timer_tasks(&self, request: NotifyTimerTasksRequest) {
        let wakers = self.timer_wakers.read().expect("notifier lock poisoned");
        match wakers.get(&request.shard_id) {
            Some(waker) => {
                let _ = waker.send(request.fire_timestamps);
            }
            None => debug!(shard_id = request.shard_id, "no timer queue for shard, dropping notification"),
        }
    }
}

/// Posts notifications to a remote async service's internal endpoints.
pub struct HttpNotifier {
    client: reqwest::Client,
    base_url: String,
}

pub const NOTIFY_IMMEDIATE_TASKS_PATH: &str = "/internal/api/v1/xdb/notify-immediate-tasks";
pub const NOTIFY_TIMER_TASKS_PATH: &str = "/internal/api/v1/xdb/notify-timer-tasks";

impl HttpNotifier {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn post_in_background<T: serde::Serialize + Send + 'static>(&self, path: &str, request: T) {
        let url = format!("{}{path}", self.base_url.trim_end_matches('/'));
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(err) = client.post(&url).json(&request).send().await {
                debug!(?err, %url, "task notification dropped");
            }
        });
    }
}

impl TaskNotifier for HttpNotifier {
    fn notify_new_immediate_tasks(&self, request: NotifyImmediateTasksRequest) {
        self.post_in_background(NOTIFY_IMMEDIATE_TASKS_PATH, request);
    }

    fn notify_new_timer_tasks(&self, request: NotifyTimerTasksRequest) {
        self.post_in_background(NOTIFY_TIMER_TASKS_PATH, request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_process_notifier_wakes_registered_immediate_queue() {
        let notifier = InProcessNotifier::new();
        let waker = Arc::new(Notify::new());
        notifier.register_immediate_queue(3, waker.clone());

        notifier.notify_new_immediate_tasks(NotifyImmediateTasksRequest {
            shard_id: 3,
            ..Default::default()
        });
        // the permit is stored, so this returns immediately
        waker.notified().await;
    }

    #[tokio::test]
    async fn in_process_notifier_forwards_timer_fire_timestamps() {
        let notifier = InProcessNotifier::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        notifier.register_timer_queue(0, tx);

        notifier.notify_new_timer_tasks(NotifyTimerTasksRequest {
            shard_id: 0,
            fire_timestamps: vec![100, 200],
            ..Default::default()
        });
        assert_eq!(rx.recv().await.unwrap(), vec![100, 200]);
    }

    #[tokio::test]
    async fn unknown_shard_notification_is_dropped() {
        let notifier = InProcessNotifier::new();
        // no registration; must not panic
        notifier.notify_new_immediate_tasks(NotifyImmediateTasksRequest {
            shard_id: 9,
            ..Default::default()
        });
    }
}
