//! Execution capacity and background maintenance
//!
//! This module provides:
//! - [`WorkerPool`] - bounded concurrent executor, one per queue
//! - [`StuckTaskReclaimer`] - resets tasks whose owner stopped making progress
//! - [`TaskPruner`] - deletes terminal tasks past the retention window

mod maintenance;
mod pool;

pub use maintenance::{StuckTaskReclaimer, TaskPruner, STUCK_NOTE};
pub use pool::{WorkerPool, WorkerPoolStatus};
