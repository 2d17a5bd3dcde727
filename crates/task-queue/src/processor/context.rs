//! Task execution context

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::persistence::{StoreError, TaskStore};

/// Context provided to processors during execution
///
/// The context provides:
/// - The id of the running task and of the executing worker
/// - Task log lines, which also refresh the task's liveness
/// - Self-rescheduling: a task whose `scheduled_start` is in the future when
///   the processor returns stays pending instead of completing
///
/// Long-running processors should log progress regularly; a task that stays
/// silent longer than the stuck timeout is reclaimed and may run again.
#[derive(Clone)]
pub struct TaskContext {
    task_id: Uuid,
    worker_id: Arc<str>,
    store: Arc<dyn TaskStore>,
}

impl TaskContext {
    /// Create a new task context
    pub fn new(task_id: Uuid, worker_id: impl Into<Arc<str>>, store: Arc<dyn TaskStore>) -> Self {
        Self {
            task_id,
            worker_id: worker_id.into(),
            store,
        }
    }

    /// Id of the running task
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Id of the process instance executing the task
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Append a line to the task log
    pub async fn log(&self, message: impl AsRef<str>) -> Result<(), StoreError> {
        self.store.append_log(self.task_id, message.as_ref()).await
    }

    /// Defer the task until `at`
    ///
    /// Takes effect once the processor returns successfully: the task is left
    /// pending and becomes claimable again at `at`.
    pub async fn reschedule_at(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.store.reschedule(self.task_id, at).await
    }

    /// Defer the task by `delay` from now
    pub async fn reschedule_in(&self, delay: Duration) -> Result<(), StoreError> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| StoreError::Serialization(format!("invalid delay: {e}")))?;
        self.reschedule_at(Utc::now() + delay).await
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryTaskStore;
    use crate::task::{NewTask, TaskPayload, TaskType};

    #[tokio::test]
    async fn test_log_refreshes_liveness() {
        let store = Arc::new(InMemoryTaskStore::new());
        let task = store
            .enqueue(NewTask::new(TaskType::LocationSync, TaskPayload::LocationSync))
            .await
            .unwrap();

        store.advance_clock(Duration::from_secs(30));
        let ctx = TaskContext::new(task.id, "worker-1", store.clone());
        ctx.log("halfway there").await.unwrap();

        let current = store.find_task(task.id).await.unwrap().unwrap();
        assert_eq!(current.log_messages.len(), 1);
        assert_eq!(current.log_messages[0].message, "halfway there");
        assert!(current.updated_at > task.updated_at);
    }

    #[tokio::test]
    async fn test_reschedule_in_sets_future_start() {
        let store = Arc::new(InMemoryTaskStore::new());
        let task = store
            .enqueue(NewTask::new(TaskType::LocationSync, TaskPayload::LocationSync))
            .await
            .unwrap();

        let ctx = TaskContext::new(task.id, "worker-1", store.clone());
        ctx.reschedule_in(Duration::from_secs(120)).await.unwrap();

        let current = store.find_task(task.id).await.unwrap().unwrap();
        assert!(current.is_deferred(Utc::now()));
    }

    #[tokio::test]
    async fn test_missing_task() {
        let store = Arc::new(InMemoryTaskStore::new());
        let ctx = TaskContext::new(Uuid::now_v7(), "worker-1", store);

        let result = ctx.log("nobody home").await;
        assert!(matches!(result, Err(StoreError::TaskNotFound(_))));
    }
}
