//! In-memory implementation of TaskStore for testing

use std::cmp::Reverse;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use super::store::*;
use crate::reliability::{RetryDecision, RetryPolicy};
use crate::task::{NewTask, Task, TaskLogEntry, TaskStatus, TaskType};

/// In-memory implementation of TaskStore
///
/// This is primarily for testing. It keeps all tasks behind one lock, which
/// makes every claim trivially atomic, and provides the same semantics as the
/// PostgreSQL implementation.
///
/// The store's clock can be moved forward with [`advance_clock`] so tests can
/// cover delays, minimum ages and liveness timeouts without sleeping.
///
/// # Example
///
/// ```
/// use shelfsync_task_queue::InMemoryTaskStore;
///
/// let store = InMemoryTaskStore::new();
/// assert_eq!(store.task_count(), 0);
/// ```
///
/// [`advance_clock`]: InMemoryTaskStore::advance_clock
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<Uuid, Task>>,
    clock_offset: Mutex<chrono::Duration>,
}

impl InMemoryTaskStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            clock_offset: Mutex::new(chrono::Duration::zero()),
        }
    }

    /// Move the store's notion of "now" forward
    pub fn advance_clock(&self, by: Duration) {
        let mut offset = self.clock_offset.lock();
        *offset = *offset + to_chrono(by);
    }

    /// The store's current time
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + *self.clock_offset.lock()
    }

    /// Get the number of tasks
    pub fn task_count(&self) -> usize {
        self.tasks.read().len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.tasks.write().clear();
    }

    fn with_task<T>(
        &self,
        task_id: Uuid,
        f: impl FnOnce(&mut Task, DateTime<Utc>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let now = self.now();
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        f(task, now)
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

fn before(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(to_chrono(duration))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn entry(message: &str, at: DateTime<Utc>) -> TaskLogEntry {
    TaskLogEntry {
        message: message.to_string(),
        created_at: at,
    }
}

fn complete(task: &mut Task, now: DateTime<Utc>) {
    task.is_complete = true;
    task.failed = false;
    task.finish_time = Some(now);
    task.updated_at = now;
}

fn record_failure(
    task: &mut Task,
    now: DateTime<Utc>,
    error: &str,
    policy: &RetryPolicy,
) -> RetryOutcome {
    task.errors.push(entry(error, now));
    task.retries += 1;
    task.being_processed_by = None;
    task.updated_at = now;

    match policy.decide(task.retries) {
        RetryDecision::Fail => {
            task.failed = true;
            task.is_complete = false;
            task.finish_time = Some(now);
            RetryOutcome::Failed {
                retries: task.retries,
            }
        }
        RetryDecision::Retry => {
            task.start_time = None;
            task.finish_time = None;
            RetryOutcome::WillRetry {
                retries: task.retries,
            }
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn enqueue(&self, task: NewTask) -> Result<Task, StoreError> {
        let now = self.now();
        let scheduled_start = if task.delay.is_zero() {
            None
        } else {
            now.checked_add_signed(to_chrono(task.delay))
        };

        let created = Task {
            id: Uuid::now_v7(),
            task_type: task.task_type,
            organization_id: task.organization_id,
            payload: task.payload,
            priority: task.priority,
            scheduled_start,
            created_at: now,
            updated_at: now,
            retries: 0,
            being_processed_by: None,
            start_time: None,
            finish_time: None,
            is_complete: false,
            failed: false,
            log_messages: vec![],
            errors: vec![],
        };

        self.tasks.write().insert(created.id, created.clone());
        Ok(created)
    }

    async fn find_task(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.read().get(&task_id).cloned())
    }

    async fn find_pending_by_org_and_type(
        &self,
        organization_id: &str,
        task_type: TaskType,
    ) -> Result<Vec<Task>, StoreError> {
        let mut pending: Vec<Task> = self
            .tasks
            .read()
            .values()
            .filter(|t| {
                t.task_type == task_type
                    && t.organization_id.as_deref() == Some(organization_id)
                    && t.status() == TaskStatus::Pending
            })
            .cloned()
            .collect();

        pending.sort_by_key(|t| (t.created_at, t.id));
        Ok(pending)
    }

    async fn has_queued_task_by_type(&self, task_type: TaskType) -> Result<bool, StoreError> {
        Ok(self
            .tasks
            .read()
            .values()
            .any(|t| t.task_type == task_type && !t.status().is_terminal()))
    }

    async fn list_tasks(
        &self,
        filter: &TaskFilter,
        pagination: Pagination,
    ) -> Result<TaskPage, StoreError> {
        let mut matching: Vec<Task> = self
            .tasks
            .read()
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();

        matching.sort_by_key(|t| Reverse((t.created_at, t.id)));
        let total = matching.len() as u64;

        let tasks = matching
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect();

        Ok(TaskPage {
            tasks,
            total,
            pagination,
        })
    }

    async fn task_counts(&self, task_type: Option<TaskType>) -> Result<TaskCounts, StoreError> {
        let mut counts = TaskCounts::default();
        for task in self.tasks.read().values() {
            if task_type.map_or(true, |t| t == task.task_type) {
                counts.record(task.status());
            }
        }
        Ok(counts)
    }

    async fn claim_next(&self, request: &ClaimRequest) -> Result<Option<Task>, StoreError> {
        let now = self.now();
        let liveness_cutoff = before(now, request.liveness_timeout);
        let min_age_cutoff = before(now, request.min_age);
        let policy = RetryPolicy::new(request.max_retries);

        let mut tasks = self.tasks.write();

        let candidate = tasks
            .values()
            .filter(|t| {
                t.task_type == request.task_type
                    && (t.being_processed_by.is_none() || t.updated_at < liveness_cutoff)
                    && policy.allows_claim(t.retries)
                    && !t.is_complete
                    && !t.failed
                    && t.created_at <= min_age_cutoff
                    && t.scheduled_start.map_or(true, |at| at <= now)
            })
            .filter(|t| {
                if !request.exclusive {
                    return true;
                }
                let Some(org) = t.organization_id.as_ref() else {
                    return true;
                };
                !tasks.values().any(|other| {
                    other.id != t.id
                        && other.task_type == t.task_type
                        && other.organization_id.as_ref() == Some(org)
                        && other.being_processed_by.is_some()
                })
            })
            .min_by_key(|t| (Reverse(t.priority), t.created_at, t.id))
            .map(|t| t.id);

        let Some(task_id) = candidate else {
            return Ok(None);
        };

        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        task.being_processed_by = Some(request.worker_id.clone());
        task.start_time = Some(now);
        task.finish_time = None;
        task.updated_at = now;

        Ok(Some(task.clone()))
    }

    async fn mark_started(&self, task_id: Uuid) -> Result<(), StoreError> {
        self.with_task(task_id, |task, now| {
            task.start_time = Some(now);
            task.updated_at = now;
            Ok(())
        })
    }

    async fn mark_complete(&self, task_id: Uuid) -> Result<(), StoreError> {
        self.with_task(task_id, |task, now| {
            complete(task, now);
            Ok(())
        })
    }

    async fn mark_retry_needed(
        &self,
        task_id: Uuid,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<RetryOutcome, StoreError> {
        self.with_task(task_id, |task, now| Ok(record_failure(task, now, error, policy)))
    }

    async fn mark_failed(&self, task_id: Uuid, error: &str) -> Result<(), StoreError> {
        self.with_task(task_id, |task, now| {
            task.errors.push(entry(error, now));
            task.failed = true;
            task.is_complete = false;
            task.finish_time = Some(now);
            task.updated_at = now;
            Ok(())
        })
    }

    async fn reschedule(&self, task_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.with_task(task_id, |task, now| {
            task.scheduled_start = Some(at);
            task.updated_at = now;
            Ok(())
        })
    }

    async fn append_log(&self, task_id: Uuid, message: &str) -> Result<(), StoreError> {
        self.with_task(task_id, |task, now| {
            task.log_messages.push(entry(message, now));
            task.updated_at = now;
            Ok(())
        })
    }

    async fn set_owner(&self, task_id: Uuid, owner: Option<&str>) -> Result<(), StoreError> {
        self.with_task(task_id, |task, now| {
            match owner {
                Some(owner) => {
                    task.being_processed_by = Some(owner.to_string());
                    task.start_time.get_or_insert(now);
                }
                None => task.being_processed_by = None,
            }
            task.updated_at = now;
            Ok(())
        })
    }

    async fn complete_owned(&self, task_id: Uuid, owner: &str) -> Result<bool, StoreError> {
        self.with_task(task_id, |task, now| {
            if task.being_processed_by.as_deref() != Some(owner) {
                return Ok(false);
            }
            complete(task, now);
            task.being_processed_by = None;
            Ok(true)
        })
    }

    async fn retry_owned(
        &self,
        task_id: Uuid,
        owner: &str,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<Option<RetryOutcome>, StoreError> {
        self.with_task(task_id, |task, now| {
            if task.being_processed_by.as_deref() != Some(owner) {
                return Ok(None);
            }
            Ok(Some(record_failure(task, now, error, policy)))
        })
    }

    async fn release_owned(
        &self,
        task_id: Uuid,
        owner: &str,
        note: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.with_task(task_id, |task, now| {
            if task.being_processed_by.as_deref() != Some(owner) {
                return Ok(false);
            }
            if let Some(note) = note {
                task.log_messages.push(entry(note, now));
            }
            task.being_processed_by = None;
            task.updated_at = now;
            Ok(true)
        })
    }

    async fn prune_older_than(&self, retention: Duration) -> Result<u64, StoreError> {
        let cutoff = before(self.now(), retention);
        let mut tasks = self.tasks.write();
        let before_len = tasks.len();

        tasks.retain(|_, t| {
            let expired = t.finish_time.is_some_and(|finished| finished < cutoff);
            !((t.is_complete || t.failed) && expired)
        });

        Ok((before_len - tasks.len()) as u64)
    }

    async fn find_stuck(&self, timeout: Duration) -> Result<Vec<Task>, StoreError> {
        let cutoff = before(self.now(), timeout);
        let mut stuck: Vec<Task> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.being_processed_by.is_some() && t.updated_at < cutoff)
            .cloned()
            .collect();

        stuck.sort_by_key(|t| (t.updated_at, t.id));
        Ok(stuck)
    }

    async fn reclaim_stuck(
        &self,
        task_id: Uuid,
        timeout: Duration,
        priority_boost: i32,
        note: &str,
    ) -> Result<bool, StoreError> {
        self.with_task(task_id, |task, now| {
            let cutoff = before(now, timeout);
            if task.being_processed_by.is_none() || task.updated_at >= cutoff {
                return Ok(false);
            }

            task.log_messages.push(entry(note, now));
            task.being_processed_by = None;
            task.retries = 0;
            task.errors.clear();
            task.start_time = None;
            task.finish_time = None;
            task.is_complete = false;
            task.failed = false;
            task.priority = task.priority.saturating_add(priority_boost);
            task.updated_at = now;
            Ok(true)
        })
    }

    async fn find_owned_by(&self, owner: &str) -> Result<Vec<Task>, StoreError> {
        let mut owned: Vec<Task> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.being_processed_by.as_deref() == Some(owner))
            .cloned()
            .collect();

        owned.sort_by_key(|t| (t.created_at, t.id));
        Ok(owned)
    }

    async fn delete_task(&self, task_id: Uuid) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        let status = task.status();
        if !status.is_terminal() {
            return Err(StoreError::InvalidState {
                id: task_id,
                status,
                operation: "delete",
            });
        }

        tasks.remove(&task_id);
        Ok(())
    }

    async fn promote_task(&self, task_id: Uuid) -> Result<Task, StoreError> {
        self.with_task(task_id, |task, now| {
            task.priority = task.priority.saturating_add(1);
            task.updated_at = now;
            Ok(task.clone())
        })
    }

    async fn restart_task(&self, task_id: Uuid) -> Result<Task, StoreError> {
        self.with_task(task_id, |task, now| {
            task.log_messages.push(entry(RESTART_NOTE, now));
            task.being_processed_by = None;
            task.retries = 0;
            task.start_time = None;
            task.finish_time = None;
            task.scheduled_start = None;
            task.is_complete = false;
            task.failed = false;
            task.updated_at = now;
            Ok(task.clone())
        })
    }

    async fn cancel_task(&self, task_id: Uuid, reason: &str) -> Result<(), StoreError> {
        self.with_task(task_id, |task, now| {
            let status = task.status();
            if status != TaskStatus::Pending || task.being_processed_by.is_some() {
                return Err(StoreError::InvalidState {
                    id: task_id,
                    status,
                    operation: "cancel",
                });
            }

            task.log_messages.push(entry(&cancel_note(reason), now));
            task.is_complete = true;
            task.finish_time = Some(now);
            task.updated_at = now;
            Ok(())
        })
    }
}
