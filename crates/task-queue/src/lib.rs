//! # Task Queue
//!
//! A PostgreSQL-backed task scheduler for the retailer sync connector.
//!
//! ## Features
//!
//! - **Durable tasks**: the task row is the only source of truth; nothing is held only in memory
//! - **Atomic claiming**: `FOR UPDATE SKIP LOCKED` claims, with optional per-tenant exclusivity
//! - **Bounded pools**: one worker pool per queue, capacity reserved before a task is claimed
//! - **Retry bookkeeping**: failed tasks are retried until the queue's retry budget runs out
//! - **Self-healing**: stuck tasks are reset, finished tasks are pruned, shutdown requeues owned work
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TaskQueueService                         │
//! │  (registers queues, starts loops, requeues on shutdown)      │
//! └─────────────────────────────────────────────────────────────┘
//!            │                                   │
//!            ▼                                   ▼
//! ┌──────────────────────────────┐  ┌──────────────────────────┐
//! │          Dispatcher           │  │  StuckTaskReclaimer       │
//! │  (claims into WorkerPools,    │  │  TaskPruner               │
//! │   TaskExecutor runs them)     │  │  (periodic maintenance)   │
//! └──────────────────────────────┘  └──────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TaskStore                             │
//! │  (PostgreSQL: queue_tasks, queue_task_logs, queue_task_errors) │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use shelfsync_task_queue::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryTaskStore::new());
//! let service = TaskQueueService::new(store, SchedulerConfig::default());
//!
//! service.register_queue(QueueDefinition::new(
//!     "locations",
//!     TaskType::LocationSync,
//!     processor_fn(|_task, ctx| async move {
//!         ctx.log("Locations refreshed").await?;
//!         Ok::<_, anyhow::Error>(())
//!     }),
//! ))?;
//!
//! service
//!     .enqueue(NewTask::new(TaskType::LocationSync, TaskPayload::LocationSync).for_organization("org-1"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod persistence;
pub mod processor;
pub mod reliability;
pub mod service;
pub mod task;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{ConfigError, SchedulerConfig};
    pub use crate::engine::{QueueDefinition, QueueHandle, QueueRegistry};
    pub use crate::persistence::{
        InMemoryTaskStore, Pagination, PostgresTaskStore, StoreError, TaskFilter, TaskPage,
        TaskStore,
    };
    pub use crate::processor::{processor_fn, TaskContext, TaskProcessor};
    pub use crate::reliability::{RetryPolicy, SyncErrorCode, TenantNotifier};
    pub use crate::service::{ServiceError, TaskQueueService};
    pub use crate::task::{NewTask, Task, TaskPayload, TaskStatus, TaskType};
}

// Re-export key types at crate root
pub use config::{ConfigError, SchedulerConfig};
pub use engine::{
    Dispatcher, ExecutionError, ExecutionOutcome, QueueDefinition, QueueHandle, QueueRegistry,
    TaskExecutor,
};
pub use persistence::{
    ClaimRequest, InMemoryTaskStore, Pagination, PostgresTaskStore, RetryOutcome, StoreError,
    TaskCounts, TaskFilter, TaskPage, TaskStore,
};
pub use processor::{processor_fn, FnProcessor, TaskContext, TaskProcessor};
pub use reliability::{
    classify_upstream_fault, LoggingTenantNotifier, RetryDecision, RetryPolicy, SyncErrorCode,
    TenantNotifier,
};
pub use service::{ServiceError, TaskQueueService, SHUTDOWN_NOTE};
pub use task::{NewTask, Task, TaskLogEntry, TaskPayload, TaskStatus, TaskType, UnknownTaskType};
pub use worker::{StuckTaskReclaimer, TaskPruner, WorkerPool, WorkerPoolStatus, STUCK_NOTE};
