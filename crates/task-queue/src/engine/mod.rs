//! Scheduling engine
//!
//! This module provides:
//! - [`QueueRegistry`] - registered queues with their pools and polling state
//! - [`Dispatcher`] - the single loop that claims tasks for every queue
//! - [`TaskExecutor`] - runs one claimed task to a resolution

mod dispatcher;
mod executor;
mod registry;

pub use dispatcher::Dispatcher;
pub use executor::{ExecutionError, ExecutionOutcome, TaskExecutor};
pub use registry::{QueueDefinition, QueueHandle, QueueRegistry};
