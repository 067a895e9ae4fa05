//! Public HTTP API: starting a process and describing the latest execution of
//! a process id.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::api_types::{
    ApiErrorResponse, NotifyImmediateTasksRequest, ProcessExecutionDescribeRequest,
    ProcessExecutionDescribeResponse, ProcessExecutionStartRequest, ProcessExecutionStartResponse,
};
use crate::engine::TaskNotifier;
use crate::persistence::data_models::DEFAULT_SHARD_ID;
use crate::persistence::{ProcessStore, StartProcessRequest, StoreError};

pub const START_PROCESS_PATH: &str = "/api/v1/xdb/service/process-execution/start";
pub const DESCRIBE_PROCESS_PATH: &str = "/api/v1/xdb/service/process-execution/describe";

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn ProcessStore>,
    pub notifier: Arc<dyn TaskNotifier>,
}

/// Running API server handle.
pub struct ApiServer {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl ApiServer {
    pub async fn start(port: u16, state: ApiState) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind API listener on port {port}"))?;
        let addr = listener.local_addr()?;

        let app = create_router(state);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = serve.await {
                error!(?err, "API server terminated with error");
            }
        });

        info!(%addr, "API service started");
        Ok(Self {
            addr,
            shutdown_tx,
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route(START_PROCESS_PATH, post(start_process))
        .route(DESCRIBE_PROCESS_PATH, post(describe_process))
        .with_state(state)
}

struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn invalid_request_schema() -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: "invalid request schema".to_string(),
        }
    }

    fn already_started() -> Self {
        Self {
            status: StatusCode::CONFLICT,
            detail: "process with the same id is already started".to_string(),
        }
    }

    fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            detail: "process does not exist".to_string(),
        }
    }

    fn internal(err: StoreError) -> Self {
        error!(?err, "API request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: "internal server error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiErrorResponse { detail: self.detail })).into_response()
    }
}

async fn start_process(
    State(state): State<ApiState>,
    payload: Result<Json<ProcessExecutionStartRequest>, JsonRejection>,
) -> Result<Json<ProcessExecutionStartResponse>, ApiError> {
    let Json(request) = payload.map_err(|_| ApiError::invalid_request_schema())?;
    debug!(process_id = %request.process_id, namespace = %request.namespace, "received StartProcess API request");

    let response = state
        .store
        .start_process(StartProcessRequest {
            request,
            new_task_shard_id: DEFAULT_SHARD_ID,
        })
        .await
        .map_err(ApiError::internal)?;

    if response.already_started {
        return Err(ApiError::already_started());
    }
    if response.has_new_immediate_task {
        state
            .notifier
            .notify_new_immediate_tasks(NotifyImmediateTasksRequest {
                shard_id: DEFAULT_SHARD_ID,
                process_execution_id: Some(response.process_execution_id.to_string()),
                ..Default::default()
            });
    }

    Ok(Json(ProcessExecutionStartResponse {
        process_execution_id: response.process_execution_id.to_string(),
    }))
}

async fn describe_process(
    State(state): State<ApiState>,
    payload: Result<Json<ProcessExecutionDescribeRequest>, JsonRejection>,
) -> Result<Json<ProcessExecutionDescribeResponse>, ApiError> {
    let Json(request) = payload.map_err(|_| ApiError::invalid_request_schema())?;
    debug!(process_id = %request.process_id, namespace = %request.namespace, "received DescribeProcess API request");

    let response = state
        .store
        .describe_latest_process(&request.namespace, &request.process_id)
        .await
        .map_err(|err| {
            if err.is_not_found() {
                ApiError::not_found()
            } else {
                ApiError::internal(err)
            }
        })?;

    Ok(Json(response))
}
