//! The task dispatch engine: per-shard pollers, bounded processors, backoff,
//! and the cross-service task notifier.

pub mod backoff;
pub mod immediate_queue;
pub mod notifier;
pub mod processor;
pub mod state_worker;
pub mod timer_queue;

pub use immediate_queue::ImmediateTaskQueue;
pub use notifier::{HttpNotifier, InProcessNotifier, TaskNotifier};
pub use processor::{ImmediateTaskProcessor, TimerTaskProcessor};
pub use timer_queue::TimerTaskQueue;
