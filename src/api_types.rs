//! Wire types shared by the public service API, the worker protocol, and the
//! persisted command blobs.
//!
//! Everything here is plain serde JSON. The same `CommandRequest` value that a
//! worker returns from a wait-until call is persisted verbatim on the state
//! execution row, so these types double as storage blobs.

use serde::{Deserialize, Serialize};

/// An opaque user payload plus the name of the encoding that produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedObject {
    #[serde(default)]
    pub encoding: String,
    #[serde(default)]
    pub data: String,
}

/// Retry policy for worker API calls. Unset fields fall back to the engine
/// defaults (initial 1s, coefficient 2.0, max interval 60s, unbounded
/// attempts and duration).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_interval_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_coefficient: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_interval_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_attempts: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_attempts_duration_seconds: Option<i32>,
}

/// Static per-state configuration supplied at start or on a state movement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncStateConfig {
    #[serde(default)]
    pub skip_wait_until: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_until_api_timeout_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_api_timeout_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_until_api_retry_policy: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_api_retry_policy: Option<RetryPolicy>,
}

/// How a command request is considered complete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandWaitingType {
    #[default]
    EmptyCommand,
    AnyOfCompletion,
    AllOfCompletion,
}

/// A timer the state waits on, relative to the moment the command request is
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerCommand {
    pub delay_in_seconds: i64,
}

/// A local-queue subscription: wait for `count` messages on `queue_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalQueueCommand {
    pub queue_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i32>,
}

impl LocalQueueCommand {
    /// Message count required by this command; unset means one.
    pub fn required_count(&self) -> i32 {
        self.count.filter(|c| *c > 0).unwrap_or(1)
    }
}

/// What a wait-until phase declared it is waiting for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    #[serde(default)]
    pub waiting_type: CommandWaitingType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub timer_commands: Vec<TimerCommand>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub local_queue_commands: Vec<LocalQueueCommand>,
}

impl CommandRequest {
    pub fn is_empty(&self) -> bool {
        self.waiting_type == CommandWaitingType::EmptyCommand
            || (self.timer_commands.is_empty() && self.local_queue_commands.is_empty())
    }
}

/// Completion status of a single command, as reported back to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    WaitingCommand,
    CompletedCommand,
    SkippedCommand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerResult {
    pub status: CommandStatus,
}

/// A message published to a per-process local queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalQueueMessage {
    pub queue_name: String,
    /// Client-supplied idempotency key; minted server-side when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<EncodedObject>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalQueueResult {
    pub status: CommandStatus,
    pub queue_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<LocalQueueMessage>,
}

/// The materialized "what arrived" view handed to the execute phase, zipped
/// from the stored command request and the stored sparse results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResults {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub timer_results: Vec<TimerResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub local_queue_results: Vec<LocalQueueResult>,
}

/// How a state thread closes its process, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreadCloseType {
    GracefulCompleteProcess,
    ForceCompleteProcess,
    ForceFailProcess,
    DeadEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadCloseDecision {
    pub close_type: ThreadCloseType,
}

/// A next state the decision opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMovement {
    pub state_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_input: Option<EncodedObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_config: Option<AsyncStateConfig>,
}

/// The outcome of an execute phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDecision {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_states: Vec<StateMovement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_close_decision: Option<ThreadCloseDecision>,
}

impl StateDecision {
    /// A decision cannot both close the thread and open next states.
    pub fn is_conflicting(&self) -> bool {
        self.thread_close_decision.is_some() && !self.next_states.is_empty()
    }
}

/// Execution context attached to every worker callback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    pub process_id: String,
    pub process_execution_id: String,
    pub state_execution_id: String,
    pub attempt: i32,
    pub first_attempt_timestamp: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncStateWaitUntilRequest {
    pub context: Context,
    pub process_type: String,
    pub state_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_input: Option<EncodedObject>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncStateWaitUntilResponse {
    #[serde(default)]
    pub command_request: CommandRequest,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub publish_to_local_queue: Vec<LocalQueueMessage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncStateExecuteRequest {
    pub context: Context,
    pub process_type: String,
    pub state_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_input: Option<EncodedObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_results: Option<CommandResults>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncStateExecuteResponse {
    #[serde(default)]
    pub state_decision: StateDecision,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub publish_to_local_queue: Vec<LocalQueueMessage>,
}

/// Options applied to the whole process at start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStartConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessExecutionStartRequest {
    pub namespace: String,
    pub process_id: String,
    pub process_type: String,
    pub worker_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_state_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_state_input: Option<EncodedObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_state_config: Option<AsyncStateConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_start_config: Option<ProcessStartConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessExecutionStartResponse {
    pub process_execution_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessExecutionDescribeRequest {
    pub namespace: String,
    pub process_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessExecutionDescribeResponse {
    pub process_execution_id: String,
    pub process_type: String,
    pub worker_url: String,
    pub start_timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyImmediateTasksRequest {
    pub shard_id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_execution_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyTimerTasksRequest {
    pub shard_id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fire_timestamps: Vec<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_request_default_is_empty() {
        let req = CommandRequest::default();
        assert_eq!(req.waiting_type, CommandWaitingType::EmptyCommand);
        assert!(req.is_empty());
    }

    #[test]
    fn command_request_with_commands_is_not_empty() {
        let req = CommandRequest {
            waiting_type: CommandWaitingType::AllOfCompletion,
            timer_commands: vec![TimerCommand {
                delay_in_seconds: 5,
            }],
            local_queue_commands: vec![],
        };
        assert!(!req.is_empty());
    }

    #[test]
    fn local_queue_command_count_defaults_to_one() {
        let cmd = LocalQueueCommand {
            queue_name: "q".to_string(),
            count: None,
        };
        assert_eq!(cmd.required_count(), 1);

        let cmd = LocalQueueCommand {
            queue_name: "q".to_string(),
            count: Some(3),
        };
        assert_eq!(cmd.required_count(), 3);

        // a non-positive count falls back to one
        let cmd = LocalQueueCommand {
            queue_name: "q".to_string(),
            count: Some(0),
        };
        assert_eq!(cmd.required_count(), 1);
    }

    #[test]
    fn decision_with_both_close_and_next_states_conflicts() {
        let decision = StateDecision {
            next_states: vec![StateMovement {
                state_id: "S2".to_string(),
                state_input: None,
                state_config: None,
            }],
            thread_close_decision: Some(ThreadCloseDecision {
                close_type: ThreadCloseType::DeadEnd,
            }),
        };
        assert!(decision.is_conflicting());

        let decision = StateDecision {
            next_states: vec![],
            thread_close_decision: Some(ThreadCloseDecision {
                close_type: ThreadCloseType::ForceCompleteProcess,
            }),
        };
        assert!(!decision.is_conflicting());
    }

    #[test]
    fn waiting_type_uses_wire_names() {
        let json = serde_json::to_string(&CommandWaitingType::AnyOfCompletion).unwrap();
        assert_eq!(json, "\"ANY_OF_COMPLETION\"");
        let parsed: CommandWaitingType = serde_json::from_str("\"EMPTY_COMMAND\"").unwrap();
        assert_eq!(parsed, CommandWaitingType::EmptyCommand);
    }

    #[test]
    fn start_request_round_trips_camel_case() {
        let req = ProcessExecutionStartRequest {
            namespace: "ns".to_string(),
            process_id: "p1".to_string(),
            process_type: "Order".to_string(),
            worker_url: "http://worker:8803".to_string(),
            start_state_id: Some("S1".to_string()),
            start_state_input: None,
            start_state_config: Some(AsyncStateConfig {
                skip_wait_until: true,
                ..Default::default()
            }),
            process_start_config: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["processId"], "p1");
        assert_eq!(json["startStateConfig"]["skipWaitUntil"], true);
    }
}
