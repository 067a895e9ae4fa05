//! HTTP client for the two worker callback endpoints.
//!
//! Transport failures and non-2xx responses both classify as
//! [`WorkerApiError`]; the processor routes either through the backoff path.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::api_types::{
    AsyncStateExecuteRequest, AsyncStateExecuteResponse, AsyncStateWaitUntilRequest,
    AsyncStateWaitUntilResponse,
};

pub const WAIT_UNTIL_PATH: &str = "/api/v1/xdb/worker/async-state/wait-until";
pub const EXECUTE_PATH: &str = "/api/v1/xdb/worker/async-state/execute";

const TRUNCATION_MARKER: &str = "...(truncated)";

#[derive(Debug, Error)]
pub enum WorkerApiError {
    #[error("worker transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("worker returned status {status_code}: {body}")]
    Status { status_code: u16, body: String },
}

impl WorkerApiError {
    /// HTTP status of the failure; zero when the request never completed.
    pub fn status_code(&self) -> i32 {
        match self {
            WorkerApiError::Transport(err) => {
                err.status().map(|s| i32::from(s.as_u16())).unwrap_or(0)
            }
            WorkerApiError::Status { status_code, .. } => i32::from(*status_code),
        }
    }

    /// Failure detail for the state row, truncated to `max_detail_size`.
    pub fn details(&self, max_detail_size: usize) -> String {
        let raw = match self {
            WorkerApiError::Transport(err) => format!("errMsg: {err}"),
            WorkerApiError::Status { status_code, body } => {
                format!("statusCode: {status_code}, responseBody: {body}")
            }
        };
        truncate_details(raw, max_detail_size)
    }
}

pub(crate) fn truncate_details(details: String, max_detail_size: usize) -> String {
    if details.len() <= max_detail_size {
        return details;
    }
    let mut cut = max_detail_size;
    while cut > 0 && !details.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{TRUNCATION_MARKER}", &details[..cut])
}

/// Prepend a scheme when the worker URL has none, and drop a trailing slash
/// so endpoint paths concatenate cleanly.
pub fn fix_worker_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

/// Typed client for worker callbacks. Cheap to clone; the inner reqwest
/// client pools connections.
#[derive(Clone)]
pub struct WorkerClient {
    client: reqwest::Client,
}

impl Default for WorkerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub async fn wait_until(
        &self,
        worker_base_url: &str,
        timeout: Duration,
        request: &AsyncStateWaitUntilRequest,
    ) -> Result<AsyncStateWaitUntilResponse, WorkerApiError> {
        self.post(worker_base_url, WAIT_UNTIL_PATH, timeout, request)
            .await
    }

    pub async fn execute(
        &self,
        worker_base_url: &str,
        timeout: Duration,
        request: &AsyncStateExecuteRequest,
    ) -> Result<AsyncStateExecuteResponse, WorkerApiError> {
        self.post(worker_base_url, EXECUTE_PATH, timeout, request)
            .await
    }

    async fn post<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        worker_base_url: &str,
        path: &str,
        timeout: Duration,
        request: &Req,
    ) -> Result<Resp, WorkerApiError> {
        let url = format!("{worker_base_url}{path}");
        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        debug!(%url, status = status.as_u16(), "worker API call returned");
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|err| {
                format!("cannot read body from http response: {err}")
            });
            return Err(WorkerApiError::Status {
                status_code: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}
