//! The async service: per-shard pollers, the two processor pools, and the
//! internal notification endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::api_types::{NotifyImmediateTasksRequest, NotifyTimerTasksRequest};
use crate::config::AsyncServiceConfig;
use crate::engine::notifier::{NOTIFY_IMMEDIATE_TASKS_PATH, NOTIFY_TIMER_TASKS_PATH};
use crate::engine::state_worker::StateWorkerDeps;
use crate::engine::{
    ImmediateTaskProcessor, ImmediateTaskQueue, InProcessNotifier, TaskNotifier,
    TimerTaskProcessor, TimerTaskQueue,
};
use crate::persistence::ProcessStore;
use crate::worker_client::WorkerClient;

/// Running async service handle. Owns the queues and processor pools for
/// every shard this server was assigned.
pub struct AsyncService {
    addr: SocketAddr,
    immediate_processor: ImmediateTaskProcessor,
    timer_processor: TimerTaskProcessor,
    immediate_queues: Vec<ImmediateTaskQueue>,
    timer_queues: Vec<TimerTaskQueue>,
    http_shutdown_tx: oneshot::Sender<()>,
    http_handle: JoinHandle<()>,
}

impl AsyncService {
    pub async fn start(
        config: &AsyncServiceConfig,
        store: Arc<dyn ProcessStore>,
        notifier: Arc<InProcessNotifier>,
    ) -> Result<Self> {
        let worker_client = WorkerClient::new();

        let immediate_processor = ImmediateTaskProcessor::start(
            config.immediate_task_queue.clone(),
            StateWorkerDeps {
                store: store.clone(),
                worker_client: worker_client.clone(),
                notifier: notifier.clone(),
                config: config.immediate_task_queue.clone(),
            },
        );
        let timer_processor = TimerTaskProcessor::start(
            config.timer_task_queue.clone(),
            StateWorkerDeps {
                store: store.clone(),
                worker_client,
                notifier: notifier.clone(),
                config: config.timer_task_queue.clone(),
            },
        );

        let mut immediate_queues = Vec::with_capacity(config.owned_shards.len());
        let mut timer_queues = Vec::with_capacity(config.owned_shards.len());
        for &shard_id in &config.owned_shards {
            let immediate_queue = ImmediateTaskQueue::start(
                shard_id,
                config.immediate_task_queue.clone(),
                store.clone(),
                &immediate_processor,
            );
            notifier.register_immediate_queue(shard_id, immediate_queue.waker());
            immediate_queues.push(immediate_queue);

            let timer_queue = TimerTaskQueue::start(
                shard_id,
                config.timer_task_queue.clone(),
                store.clone(),
                &timer_processor,
            );
            notifier.register_timer_queue(shard_id, timer_queue.notify_sender());
            timer_queues.push(timer_queue);
        }

        let listener = TcpListener::bind(("0.0.0.0", config.port))
            .await
            .with_context(|| format!("failed to bind async service listener on port {}", config.port))?;
        let addr = listener.local_addr()?;
        let app = notify_router(notifier);
        let (http_shutdown_tx, http_shutdown_rx) = oneshot::channel();
        let http_handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = http_shutdown_rx.await;
            });
            if let Err(err) = serve.await {
                error!(?err, "async service HTTP server terminated with error");
            }
        });

        info!(%addr, shards = ?config.owned_shards, "async service started");
        Ok(Self {
            addr,
            immediate_processor,
            timer_processor,
            immediate_queues,
            timer_queues,
            http_shutdown_tx,
            http_handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop pollers before processors so in-flight tasks can drain.
    pub async fn stop(self) {
        let _ = self.http_shutdown_tx.send(());
        let _ = self.http_handle.await;

        for queue in self.immediate_queues {
            queue.stop().await;
        }
        for queue in self.timer_queues {
            queue.stop().await;
        }
        self.immediate_processor.stop().await;
        self.timer_processor.stop().await;
        info!("async service stopped");
    }
}

fn notify_router(notifier: Arc<InProcessNotifier>) -> Router {
    Router::new()
        .route(NOTIFY_IMMEDIATE_TASKS_PATH, post(notify_immediate_tasks))
        .route(NOTIFY_TIMER_TASKS_PATH, post(notify_timer_tasks))
        .with_state(notifier)
}

async fn notify_immediate_tasks(
    State(notifier): State<Arc<InProcessNotifier>>,
    Json(request): Json<NotifyImmediateTasksRequest>,
) -> StatusCode {
    notifier.notify_new_immediate_tasks(request);
    StatusCode::OK
}

async fn notify_timer_tasks(
    State(notifier): State<Arc<InProcessNotifier>>,
    Json(request): Json<NotifyTimerTasksRequest>,
) -> StatusCode {
    notifier.notify_new_timer_tasks(request);
    StatusCode::OK
}
