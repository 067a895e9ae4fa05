//! Service wiring: the public API server and the async task service.

pub mod api;
pub mod async_service;

pub use api::{ApiServer, ApiState};
pub use async_service::AsyncService;
