//! Task model
//!
//! This module provides:
//! - [`Task`] - the persisted unit of work, the only source of truth
//! - [`TaskType`] - which queue/processor owns a task
//! - [`TaskStatus`] - status derived from the stored flags
//! - [`NewTask`] - what producers hand to the store when enqueueing

mod payload;

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use payload::TaskPayload;

/// Kind of work a task represents; one queue per type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    ProductTrigger,
    ProductSync,
    CollectionTrigger,
    CollectionSync,
    LocationSync,
    OrderProcessing,
    Debug,
}

impl TaskType {
    /// All task types, in registration order
    pub const ALL: [TaskType; 7] = [
        Self::ProductTrigger,
        Self::ProductSync,
        Self::CollectionTrigger,
        Self::CollectionSync,
        Self::LocationSync,
        Self::OrderProcessing,
        Self::Debug,
    ];

    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProductTrigger => "product_trigger",
            Self::ProductSync => "product_sync",
            Self::CollectionTrigger => "collection_trigger",
            Self::CollectionSync => "collection_sync",
            Self::LocationSync => "location_sync",
            Self::OrderProcessing => "order_processing",
            Self::Debug => "debug",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a stored task type is not recognised
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task type: {0}")]
pub struct UnknownTaskType(pub String);

impl FromStr for TaskType {
    type Err = UnknownTaskType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownTaskType(s.to_string()))
    }
}

/// Status derived from a task's flags, never stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting to be claimed (possibly scheduled for later)
    Pending,

    /// Claimed by a worker and started
    InProgress,

    /// Finished successfully or cancelled
    Complete,

    /// Ran out of retries
    Failed,
}

impl TaskStatus {
    /// Complete and Failed are terminal and the only prunable states
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::InProgress => write!(f, "IN_PROGRESS"),
            Self::Complete => write!(f, "COMPLETE"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Timestamped line in a task's log or error list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLogEntry {
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// A persisted task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    pub task_type: TaskType,
    /// Tenant key used for exclusivity
    pub organization_id: Option<String>,
    pub payload: TaskPayload,
    /// Higher is dispatched first
    pub priority: i32,
    /// Not claimable before this instant
    pub scheduled_start: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Failed attempts so far
    pub retries: i32,
    /// Owner (process instance) while claimed
    pub being_processed_by: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub is_complete: bool,
    pub failed: bool,
    pub log_messages: Vec<TaskLogEntry>,
    pub errors: Vec<TaskLogEntry>,
}

impl Task {
    /// Derived status
    pub fn status(&self) -> TaskStatus {
        if self.failed {
            TaskStatus::Failed
        } else if self.is_complete {
            TaskStatus::Complete
        } else if self.being_processed_by.is_some() && self.start_time.is_some() {
            TaskStatus::InProgress
        } else {
            TaskStatus::Pending
        }
    }

    /// Whether the task asked to run later than `now`
    pub fn is_deferred(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_start.is_some_and(|at| at > now)
    }
}

/// Definition of a task to be enqueued
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use shelfsync_task_queue::{NewTask, TaskPayload, TaskType};
///
/// let task = NewTask::new(TaskType::LocationSync, TaskPayload::LocationSync)
///     .for_organization("org-1")
///     .with_priority(5)
///     .with_delay(Duration::from_secs(60));
///
/// assert_eq!(task.priority, 5);
/// ```
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: TaskType,
    pub organization_id: Option<String>,
    pub payload: TaskPayload,
    pub priority: i32,
    /// Delay before the task becomes claimable; zero means immediately
    pub delay: Duration,
}

impl NewTask {
    /// Create a task definition with priority 0 and no delay
    pub fn new(task_type: TaskType, payload: TaskPayload) -> Self {
        Self {
            task_type,
            organization_id: None,
            payload,
            priority: 0,
            delay: Duration::ZERO,
        }
    }

    /// Attach the owning tenant
    pub fn for_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Delay the first possible claim
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}
