//! xdb - a durable, shardable process execution engine.
//!
//! Processes advance through async states whose `WaitUntil` and `Execute`
//! phases run as HTTP callbacks on user-provided workers. The key layers are:
//!
//! ## Persistence
//!
//! - [`persistence::ProcessStore`]: every durable state transition as one
//!   transaction (process row lock + versioned state updates + task inserts)
//! - [`persistence::PgProcessStore`]: the Postgres implementation
//!
//! ## Engine
//!
//! - [`engine::ImmediateTaskQueue`] / [`engine::TimerTaskQueue`]: per-shard
//!   pollers over the task tables
//! - [`engine::ImmediateTaskProcessor`] / [`engine::TimerTaskProcessor`]:
//!   bounded pools turning tasks into worker calls
//! - [`engine::TaskNotifier`]: best-effort "new work is ready" nudges
//!
//! ## Services
//!
//! - [`service::ApiServer`]: the public start/describe HTTP API
//! - [`service::AsyncService`]: queue + processor wiring plus the internal
//!   notification endpoints

pub mod api_types;
pub mod config;
pub mod engine;
pub mod persistence;
pub mod service;
pub mod worker_client;

pub use config::Config;
pub use persistence::{PgProcessStore, ProcessStore, StoreError};
pub use worker_client::{WorkerApiError, WorkerClient};
