//! Persistence layer for the task queue
//!
//! This module provides:
//! - [`TaskStore`] trait for task persistence and atomic claiming
//! - [`PostgresTaskStore`] for production
//! - [`InMemoryTaskStore`] for testing

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;
pub use store::{
    ClaimRequest, Pagination, RetryOutcome, StoreError, TaskCounts, TaskFilter, TaskPage,
    TaskStore,
};
