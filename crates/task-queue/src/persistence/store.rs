//! TaskStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::reliability::RetryPolicy;
use crate::task::{NewTask, Task, TaskStatus, TaskType};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Operation not allowed in the task's current state
    #[error("cannot {operation} task {id}: task is {status}")]
    InvalidState {
        id: Uuid,
        status: TaskStatus,
        operation: &'static str,
    },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Parameters of a single claim attempt
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub task_type: TaskType,

    /// Owner written into `being_processed_by`
    pub worker_id: String,

    /// Tasks with `retries >= max_retries` are never claimed
    pub max_retries: u32,

    /// Tasks younger than this are not eligible yet
    pub min_age: Duration,

    /// At most one owned task per organization
    pub exclusive: bool,

    /// An owned row untouched for this long may be taken over
    pub liveness_timeout: Duration,
}

/// Outcome of recording a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Task is pending again
    WillRetry { retries: i32 },

    /// Task ran out of retries and is now failed
    Failed { retries: i32 },
}

/// Filter for listing tasks
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub task_type: Option<TaskType>,
    pub organization_id: Option<String>,
    pub status: Option<TaskStatus>,
}

impl TaskFilter {
    pub fn with_task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = Some(task_type);
        self
    }

    pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Whether a task passes this filter
    pub fn matches(&self, task: &Task) -> bool {
        self.task_type.map_or(true, |t| t == task.task_type)
            && self
                .organization_id
                .as_ref()
                .map_or(true, |org| task.organization_id.as_ref() == Some(org))
            && self.status.map_or(true, |s| s == task.status())
    }
}

/// Pagination parameters
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// One page of tasks, newest first
#[derive(Debug, Clone)]
pub struct TaskPage {
    pub tasks: Vec<Task>,

    /// Total number of tasks matching the filter
    pub total: u64,

    pub pagination: Pagination,
}

impl TaskPage {
    /// Whether more tasks follow this page
    pub fn has_more(&self) -> bool {
        u64::from(self.pagination.offset) + (self.tasks.len() as u64) < self.total
    }
}

/// Number of tasks per derived status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounts {
    pub pending: u64,
    pub in_progress: u64,
    pub complete: u64,
    pub failed: u64,
}

impl TaskCounts {
    pub(crate) fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::InProgress => self.in_progress += 1,
            TaskStatus::Complete => self.complete += 1,
            TaskStatus::Failed => self.failed += 1,
        }
    }
}

/// Log line written when an administrator restarts a task
pub(crate) const RESTART_NOTE: &str = "Task restarted by administrator";

/// Log line written when a task is cancelled
pub(crate) fn cancel_note(reason: &str) -> String {
    format!("Task cancelled: {reason}")
}

/// Store for tasks and their log/error entries
///
/// This trait defines the interface for persisting scheduler state.
/// Implementations must be thread-safe and support concurrent access from
/// several processes; every mutator persists immediately.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    // =========================================================================
    // Producer Operations
    // =========================================================================

    /// Insert a new pending task
    ///
    /// `scheduled_start` is set when the definition carries a non-zero delay.
    async fn enqueue(&self, task: NewTask) -> Result<Task, StoreError>;

    /// Load a task with its logs and errors
    async fn find_task(&self, task_id: Uuid) -> Result<Option<Task>, StoreError>;

    /// Pending tasks of one type for one organization, oldest first
    async fn find_pending_by_org_and_type(
        &self,
        organization_id: &str,
        task_type: TaskType,
    ) -> Result<Vec<Task>, StoreError>;

    /// Whether any non-terminal task of this type exists
    async fn has_queued_task_by_type(&self, task_type: TaskType) -> Result<bool, StoreError>;

    /// List tasks matching a filter, newest first
    async fn list_tasks(
        &self,
        filter: &TaskFilter,
        pagination: Pagination,
    ) -> Result<TaskPage, StoreError>;

    /// Count tasks per status, optionally for one type
    async fn task_counts(&self, task_type: Option<TaskType>) -> Result<TaskCounts, StoreError>;

    // =========================================================================
    // Claiming
    // =========================================================================

    /// Claim the next eligible task
    ///
    /// Selects one row with FOR UPDATE SKIP LOCKED and marks it owned in the
    /// same statement. `Ok(None)` means nothing is eligible right now.
    async fn claim_next(&self, request: &ClaimRequest) -> Result<Option<Task>, StoreError>;

    // =========================================================================
    // Execution Mutators
    // =========================================================================

    /// Set `start_time` to now for a claimed task
    async fn mark_started(&self, task_id: Uuid) -> Result<(), StoreError>;

    /// Mark a task complete
    async fn mark_complete(&self, task_id: Uuid) -> Result<(), StoreError>;

    /// Record a failed attempt and decide between retry and failure
    async fn mark_retry_needed(
        &self,
        task_id: Uuid,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<RetryOutcome, StoreError>;

    /// Mark a task permanently failed
    async fn mark_failed(&self, task_id: Uuid, error: &str) -> Result<(), StoreError>;

    /// Defer a task until `at`
    async fn reschedule(&self, task_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Append a log line; also refreshes `updated_at`
    async fn append_log(&self, task_id: Uuid, message: &str) -> Result<(), StoreError>;

    /// Set or clear the owner
    ///
    /// Setting an owner also sets `start_time` if it was empty.
    async fn set_owner(&self, task_id: Uuid, owner: Option<&str>) -> Result<(), StoreError>;

    // =========================================================================
    // Owner-Guarded Mutators
    // =========================================================================
    //
    // Each applies only while `being_processed_by = owner`, checked in the
    // same statement as the write. Anything else means a reclaimer, a
    // shutdown requeue or another claim got there first.

    /// Mark a task complete and clear its owner
    ///
    /// Returns false when `owner` no longer holds the task.
    async fn complete_owned(&self, task_id: Uuid, owner: &str) -> Result<bool, StoreError>;

    /// Record a failed attempt like [`mark_retry_needed`](Self::mark_retry_needed)
    ///
    /// Returns `None` when `owner` no longer holds the task; nothing is
    /// recorded in that case.
    async fn retry_owned(
        &self,
        task_id: Uuid,
        owner: &str,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<Option<RetryOutcome>, StoreError>;

    /// Clear the owner, appending `note` to the log when given
    ///
    /// Returns false when `owner` no longer holds the task.
    async fn release_owned(
        &self,
        task_id: Uuid,
        owner: &str,
        note: Option<&str>,
    ) -> Result<bool, StoreError>;

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Delete terminal tasks whose `finish_time` is older than `retention`
    async fn prune_older_than(&self, retention: Duration) -> Result<u64, StoreError>;

    /// Owned tasks whose `updated_at` is older than `timeout`
    async fn find_stuck(&self, timeout: Duration) -> Result<Vec<Task>, StoreError>;

    /// Force a stuck task back to pending
    ///
    /// Only applies while the task is still owned and stale, so a task whose
    /// owner came back to life in the meantime is left alone. Returns whether
    /// the task was reset.
    async fn reclaim_stuck(
        &self,
        task_id: Uuid,
        timeout: Duration,
        priority_boost: i32,
        note: &str,
    ) -> Result<bool, StoreError>;

    /// Tasks currently owned by `owner`
    async fn find_owned_by(&self, owner: &str) -> Result<Vec<Task>, StoreError>;

    // =========================================================================
    // Administrative Operations
    // =========================================================================

    /// Delete a terminal task
    async fn delete_task(&self, task_id: Uuid) -> Result<(), StoreError>;

    /// Raise a task's priority by one
    async fn promote_task(&self, task_id: Uuid) -> Result<Task, StoreError>;

    /// Force a task back to pending, clearing failure and owner state
    async fn restart_task(&self, task_id: Uuid) -> Result<Task, StoreError>;

    /// Cancel a task that has not been claimed
    ///
    /// The task becomes complete with a log line carrying `reason`.
    async fn cancel_task(&self, task_id: Uuid, reason: &str) -> Result<(), StoreError>;
}
