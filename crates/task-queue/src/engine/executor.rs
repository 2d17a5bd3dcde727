//! Task executor
//!
//! The `TaskExecutor` runs one claimed task to a resolution:
//! - Logs the start (worker id and version) and stamps `start_time`
//! - Invokes the queue's processor, catching errors and panics
//! - Re-reads the task and completes it, leaves it deferred, or records a
//!   failed attempt through the retry policy
//! - Flags the tenant when the failure looks like an upstream fault
//! - Releases ownership and asks the dispatcher for the next claim

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::registry::{QueueDefinition, QueueHandle};
use crate::persistence::{RetryOutcome, StoreError, TaskStore};
use crate::processor::TaskContext;
use crate::reliability::{classify_upstream_fault, TenantNotifier};
use crate::task::Task;

/// Errors that end an execution without a state transition
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// The task row disappeared while the task was running
    #[error("task {0} vanished during execution")]
    TaskVanished(Uuid),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// How an execution was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Processor succeeded; task is complete
    Completed,

    /// Processor succeeded after rescheduling itself; task is pending
    Deferred,

    /// Processor failed; task is pending again
    Retrying { retries: i32 },

    /// Processor failed for the last time; task is failed
    Failed { retries: i32 },

    /// Another owner took the task while it ran; left untouched
    OwnershipLost,
}

/// Runs claimed tasks for every queue of this process
pub struct TaskExecutor {
    store: Arc<dyn TaskStore>,
    worker_id: Arc<str>,
    notifier: Arc<dyn TenantNotifier>,
}

impl TaskExecutor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        worker_id: impl Into<Arc<str>>,
        notifier: Arc<dyn TenantNotifier>,
    ) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            notifier,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Execute a claimed task and request the next claim for its queue
    #[instrument(
        skip_all,
        fields(queue = %queue.name(), task_id = %task.id, task_type = %task.task_type)
    )]
    pub async fn execute(
        &self,
        queue: &QueueHandle,
        task: Task,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let task_id = task.id;
        let result = self.run(queue.definition(), task).await;

        // Finished outcomes already cleared the owner in the same write
        if let Err(ExecutionError::Store(_)) = &result {
            match self.store.release_owned(task_id, &self.worker_id, None).await {
                Ok(true) => {}
                Ok(false) => debug!(%task_id, "Task is held by another owner; not releasing"),
                Err(e) => error!(%task_id, "Failed to release task: {}", e),
            }
        }

        queue.request_claim();

        match &result {
            Ok(outcome) => debug!(?outcome, "Task execution finished"),
            Err(e) => error!("Task execution aborted: {}", e),
        }
        result
    }

    async fn run(
        &self,
        queue: &QueueDefinition,
        task: Task,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let task_id = task.id;
        let organization_id = task.organization_id.clone();
        let scheduled_before = task.scheduled_start;

        self.store
            .append_log(
                task_id,
                &format!(
                    "Starting task on worker {} (version {})",
                    self.worker_id,
                    env!("CARGO_PKG_VERSION")
                ),
            )
            .await
            .map_err(|e| vanished_or(e, task_id))?;
        self.store
            .mark_started(task_id)
            .await
            .map_err(|e| vanished_or(e, task_id))?;

        let ctx = TaskContext::new(task_id, Arc::clone(&self.worker_id), Arc::clone(&self.store));
        let processor = queue.processor();
        let result = AssertUnwindSafe(processor.process(task, ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(anyhow::anyhow!(
                    "processor panicked: {}",
                    panic_message(&*panic)
                ))
            });

        // The processor may have rescheduled the task, or lost it to the
        // reclaimer or a shutdown requeue while it ran
        let current = self
            .store
            .find_task(task_id)
            .await?
            .ok_or(ExecutionError::TaskVanished(task_id))?;

        if current.being_processed_by.as_deref() != Some(self.worker_id.as_ref()) {
            return Ok(self.ownership_lost(task_id).await);
        }

        match result {
            // Only a reschedule made during this run defers the task
            Ok(()) if current.scheduled_start != scheduled_before
                && current.is_deferred(Utc::now()) =>
            {
                if !self.store.release_owned(task_id, &self.worker_id, None).await? {
                    return Ok(self.ownership_lost(task_id).await);
                }
                info!(scheduled_start = ?current.scheduled_start, "Task deferred itself");
                Ok(ExecutionOutcome::Deferred)
            }
            Ok(()) => {
                if !self.store.complete_owned(task_id, &self.worker_id).await? {
                    return Ok(self.ownership_lost(task_id).await);
                }
                Ok(ExecutionOutcome::Completed)
            }
            Err(err) => {
                let message = format!("{err:#}");
                warn!(error = %message, "Task failed");

                self.store
                    .append_log(
                        task_id,
                        &format!("[{}] Task failed: {}", Utc::now().to_rfc3339(), message),
                    )
                    .await?;

                let Some(retry) = self
                    .store
                    .retry_owned(task_id, &self.worker_id, &message, &queue.retry_policy())
                    .await?
                else {
                    return Ok(self.ownership_lost(task_id).await);
                };

                let outcome = match retry {
                    RetryOutcome::WillRetry { retries } => ExecutionOutcome::Retrying { retries },
                    RetryOutcome::Failed { retries } => {
                        warn!(retries, "Task failed permanently");
                        ExecutionOutcome::Failed { retries }
                    }
                };

                if let Some(org) = organization_id {
                    self.flag_upstream_fault(org, message);
                }
                Ok(outcome)
            }
        }
    }

    async fn ownership_lost(&self, task_id: Uuid) -> ExecutionOutcome {
        let owner = match self.store.find_task(task_id).await {
            Ok(Some(task)) => task.being_processed_by,
            _ => None,
        };
        warn!(
            owner = owner.as_deref().unwrap_or_default(),
            "Task is no longer owned by this worker; leaving it alone"
        );
        ExecutionOutcome::OwnershipLost
    }

    /// Notify the tenant off the execution path
    fn flag_upstream_fault(&self, organization_id: String, message: String) {
        let Some(code) = classify_upstream_fault(&message) else {
            return;
        };

        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier
                .flag_sync_error(&organization_id, code, &message)
                .await
            {
                warn!(%organization_id, %code, "Failed to flag tenant sync error: {:#}", e);
            }
        });
    }
}

fn vanished_or(error: StoreError, task_id: Uuid) -> ExecutionError {
    match error {
        StoreError::TaskNotFound(_) => ExecutionError::TaskVanished(task_id),
        other => ExecutionError::Store(other),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::engine::registry::QueueRegistry;
    use chrono::DateTime;

    use crate::persistence::{
        ClaimRequest, InMemoryTaskStore, Pagination, TaskCounts, TaskFilter, TaskPage,
    };
    use crate::processor::processor_fn;
    use crate::reliability::{LoggingTenantNotifier, RetryPolicy, SyncErrorCode};
    use crate::task::{NewTask, TaskPayload, TaskStatus, TaskType};

    const WORKER: &str = "worker-test";

    #[derive(Default)]
    struct RecordingNotifier {
        calls: Mutex<Vec<(String, SyncErrorCode)>>,
    }

    #[async_trait]
    impl TenantNotifier for RecordingNotifier {
        async fn flag_sync_error(
            &self,
            organization_id: &str,
            code: SyncErrorCode,
            _message: &str,
        ) -> anyhow::Result<()> {
            self.calls.lock().push((organization_id.to_string(), code));
            Ok(())
        }
    }

    struct Harness {
        store: Arc<InMemoryTaskStore>,
        executor: TaskExecutor,
        queue: Arc<QueueHandle>,
    }

    fn harness(definition: QueueDefinition, notifier: Arc<dyn TenantNotifier>) -> Harness {
        let store = Arc::new(InMemoryTaskStore::new());
        let registry = QueueRegistry::new();
        let queue = registry.register(definition).unwrap();
        let executor = TaskExecutor::new(store.clone(), WORKER, notifier);
        Harness {
            store,
            executor,
            queue,
        }
    }

    async fn enqueue_and_claim(h: &Harness, new_task: NewTask) -> Task {
        h.store.enqueue(new_task).await.unwrap();
        h.store
            .claim_next(&ClaimRequest {
                task_type: h.queue.definition().task_type,
                worker_id: WORKER.to_string(),
                max_retries: h.queue.definition().max_retries,
                min_age: Duration::ZERO,
                exclusive: false,
                liveness_timeout: Duration::from_secs(3600),
            })
            .await
            .unwrap()
            .unwrap()
    }

    fn debug_task() -> NewTask {
        NewTask::new(
            TaskType::Debug,
            TaskPayload::Debug {
                message: "hello".to_string(),
                fail: false,
            },
        )
    }

    #[tokio::test]
    async fn test_success_completes_and_releases() {
        let h = harness(
            QueueDefinition::new(
                "debug",
                TaskType::Debug,
                processor_fn(|_task, ctx| async move {
                    ctx.log("did the thing").await?;
                    Ok::<_, anyhow::Error>(())
                }),
            ),
            Arc::new(LoggingTenantNotifier),
        );
        let task = enqueue_and_claim(&h, debug_task()).await;

        let outcome = h.executor.execute(&h.queue, task.clone()).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed);

        let current = h.store.find_task(task.id).await.unwrap().unwrap();
        assert_eq!(current.status(), TaskStatus::Complete);
        assert!(current.being_processed_by.is_none());
        assert!(current.finish_time.is_some());
        assert!(current.log_messages[0].message.starts_with("Starting task on worker worker-test"));
        assert_eq!(current.log_messages[1].message, "did the thing");
    }

    #[tokio::test]
    async fn test_failure_records_retry() {
        let h = harness(
            QueueDefinition::new(
                "debug",
                TaskType::Debug,
                processor_fn(|_task, _ctx| async move {
                    Err::<(), _>(anyhow::anyhow!("upstream timed out"))
                }),
            )
            .with_max_retries(3),
            Arc::new(LoggingTenantNotifier),
        );
        let task = enqueue_and_claim(&h, debug_task()).await;

        let outcome = h.executor.execute(&h.queue, task.clone()).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Retrying { retries: 1 });

        let current = h.store.find_task(task.id).await.unwrap().unwrap();
        assert_eq!(current.status(), TaskStatus::Pending);
        assert_eq!(current.retries, 1);
        assert_eq!(current.errors.len(), 1);
        assert_eq!(current.errors[0].message, "upstream timed out");
        assert!(current
            .log_messages
            .iter()
            .any(|l| l.message.contains("Task failed: upstream timed out")));
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let h = harness(
            QueueDefinition::new(
                "debug",
                TaskType::Debug,
                processor_fn(|_task, _ctx| async move {
                    if true {
                        panic!("kaboom");
                    }
                    Ok(())
                }),
            )
            .with_max_retries(1),
            Arc::new(LoggingTenantNotifier),
        );
        let task = enqueue_and_claim(&h, debug_task()).await;

        let outcome = h.executor.execute(&h.queue, task.clone()).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Failed { retries: 1 });

        let current = h.store.find_task(task.id).await.unwrap().unwrap();
        assert_eq!(current.status(), TaskStatus::Failed);
        assert!(current.errors[0].message.contains("kaboom"));
    }

    #[tokio::test]
    async fn test_reschedule_leaves_task_pending() {
        let h = harness(
            QueueDefinition::new(
                "debug",
                TaskType::Debug,
                processor_fn(|_task, ctx| async move {
                    ctx.reschedule_in(Duration::from_secs(120)).await?;
                    Ok::<_, anyhow::Error>(())
                }),
            ),
            Arc::new(LoggingTenantNotifier),
        );
        let task = enqueue_and_claim(&h, debug_task()).await;

        let outcome = h.executor.execute(&h.queue, task.clone()).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Deferred);

        let current = h.store.find_task(task.id).await.unwrap().unwrap();
        assert_eq!(current.status(), TaskStatus::Pending);
        assert!(!current.is_complete);
        assert!(current.being_processed_by.is_none());
        assert!(current.is_deferred(Utc::now()));
    }

    #[tokio::test]
    async fn test_vanished_task_is_fatal() {
        let store_slot: Arc<Mutex<Option<Arc<InMemoryTaskStore>>>> = Arc::new(Mutex::new(None));
        let slot = store_slot.clone();
        let h = harness(
            QueueDefinition::new(
                "debug",
                TaskType::Debug,
                processor_fn(move |task, _ctx| {
                    let slot = slot.clone();
                    async move {
                        let store = slot.lock().clone();
                        if let Some(store) = store {
                            store.clear();
                        }
                        let _ = task;
                        Ok(())
                    }
                }),
            ),
            Arc::new(LoggingTenantNotifier),
        );
        *store_slot.lock() = Some(h.store.clone());
        let task = enqueue_and_claim(&h, debug_task()).await;

        let result = h.executor.execute(&h.queue, task.clone()).await;
        assert!(matches!(result, Err(ExecutionError::TaskVanished(id)) if id == task.id));
    }

    #[tokio::test]
    async fn test_lost_ownership_is_not_finalized() {
        let store_slot: Arc<Mutex<Option<Arc<InMemoryTaskStore>>>> = Arc::new(Mutex::new(None));
        let slot = store_slot.clone();
        let h = harness(
            QueueDefinition::new(
                "debug",
                TaskType::Debug,
                processor_fn(move |task, _ctx| {
                    let slot = slot.clone();
                    async move {
                        let store = slot.lock().clone();
                        if let Some(store) = store {
                            store.set_owner(task.id, Some("another-worker")).await?;
                        }
                        Ok::<_, anyhow::Error>(())
                    }
                }),
            ),
            Arc::new(LoggingTenantNotifier),
        );
        *store_slot.lock() = Some(h.store.clone());
        let task = enqueue_and_claim(&h, debug_task()).await;

        let outcome = h.executor.execute(&h.queue, task.clone()).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::OwnershipLost);

        let current = h.store.find_task(task.id).await.unwrap().unwrap();
        assert_eq!(current.being_processed_by.as_deref(), Some("another-worker"));
        assert!(!current.is_complete);
    }

    /// Lets a second instance claim the row right after a failure is recorded
    struct RivalClaimStore {
        inner: Arc<InMemoryTaskStore>,
        rival: ClaimRequest,
        rival_claim: Mutex<Option<Task>>,
    }

    #[async_trait]
    impl TaskStore for RivalClaimStore {
        async fn enqueue(&self, task: NewTask) -> Result<Task, StoreError> {
            self.inner.enqueue(task).await
        }
        async fn find_task(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
            self.inner.find_task(task_id).await
        }
        async fn find_pending_by_org_and_type(
            &self,
            organization_id: &str,
            task_type: TaskType,
        ) -> Result<Vec<Task>, StoreError> {
            self.inner.find_pending_by_org_and_type(organization_id, task_type).await
        }
        async fn has_queued_task_by_type(&self, task_type: TaskType) -> Result<bool, StoreError> {
            self.inner.has_queued_task_by_type(task_type).await
        }
        async fn list_tasks(
            &self,
            filter: &TaskFilter,
            pagination: Pagination,
        ) -> Result<TaskPage, StoreError> {
            self.inner.list_tasks(filter, pagination).await
        }
        async fn task_counts(&self, task_type: Option<TaskType>) -> Result<TaskCounts, StoreError> {
            self.inner.task_counts(task_type).await
        }
        async fn claim_next(&self, request: &ClaimRequest) -> Result<Option<Task>, StoreError> {
            self.inner.claim_next(request).await
        }
        async fn mark_started(&self, task_id: Uuid) -> Result<(), StoreError> {
            self.inner.mark_started(task_id).await
        }
        async fn mark_complete(&self, task_id: Uuid) -> Result<(), StoreError> {
            self.inner.mark_complete(task_id).await
        }
        async fn mark_retry_needed(
            &self,
            task_id: Uuid,
            error: &str,
            policy: &RetryPolicy,
        ) -> Result<RetryOutcome, StoreError> {
            self.inner.mark_retry_needed(task_id, error, policy).await
        }
        async fn mark_failed(&self, task_id: Uuid, error: &str) -> Result<(), StoreError> {
            self.inner.mark_failed(task_id, error).await
        }
        async fn reschedule(&self, task_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
            self.inner.reschedule(task_id, at).await
        }
        async fn append_log(&self, task_id: Uuid, message: &str) -> Result<(), StoreError> {
            self.inner.append_log(task_id, message).await
        }
        async fn set_owner(&self, task_id: Uuid, owner: Option<&str>) -> Result<(), StoreError> {
            self.inner.set_owner(task_id, owner).await
        }
        async fn complete_owned(&self, task_id: Uuid, owner: &str) -> Result<bool, StoreError> {
            self.inner.complete_owned(task_id, owner).await
        }
        async fn retry_owned(
            &self,
            task_id: Uuid,
            owner: &str,
            error: &str,
            policy: &RetryPolicy,
        ) -> Result<Option<RetryOutcome>, StoreError> {
            let outcome = self.inner.retry_owned(task_id, owner, error, policy).await?;
            let claimed = self.inner.claim_next(&self.rival).await?;
            *self.rival_claim.lock() = claimed;
            Ok(outcome)
        }
        async fn release_owned(
            &self,
            task_id: Uuid,
            owner: &str,
            note: Option<&str>,
        ) -> Result<bool, StoreError> {
            self.inner.release_owned(task_id, owner, note).await
        }
        async fn prune_older_than(&self, retention: Duration) -> Result<u64, StoreError> {
            self.inner.prune_older_than(retention).await
        }
        async fn find_stuck(&self, timeout: Duration) -> Result<Vec<Task>, StoreError> {
            self.inner.find_stuck(timeout).await
        }
        async fn reclaim_stuck(
            &self,
            task_id: Uuid,
            timeout: Duration,
            priority_boost: i32,
            note: &str,
        ) -> Result<bool, StoreError> {
            self.inner
                .reclaim_stuck(task_id, timeout, priority_boost, note)
                .await
        }
        async fn find_owned_by(&self, owner: &str) -> Result<Vec<Task>, StoreError> {
            self.inner.find_owned_by(owner).await
        }
        async fn delete_task(&self, task_id: Uuid) -> Result<(), StoreError> {
            self.inner.delete_task(task_id).await
        }
        async fn promote_task(&self, task_id: Uuid) -> Result<Task, StoreError> {
            self.inner.promote_task(task_id).await
        }
        async fn restart_task(&self, task_id: Uuid) -> Result<Task, StoreError> {
            self.inner.restart_task(task_id).await
        }
        async fn cancel_task(&self, task_id: Uuid, reason: &str) -> Result<(), StoreError> {
            self.inner.cancel_task(task_id, reason).await
        }
    }

    fn exclusive_claim(worker_id: &str) -> ClaimRequest {
        ClaimRequest {
            task_type: TaskType::LocationSync,
            worker_id: worker_id.to_string(),
            max_retries: 3,
            min_age: Duration::ZERO,
            exclusive: true,
            liveness_timeout: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn test_retry_does_not_release_a_rival_claim() {
        let inner = Arc::new(InMemoryTaskStore::new());
        let store = Arc::new(RivalClaimStore {
            inner: inner.clone(),
            rival: exclusive_claim("instance-b"),
            rival_claim: Mutex::new(None),
        });

        let registry = QueueRegistry::new();
        let queue = registry
            .register(
                QueueDefinition::new(
                    "location_sync",
                    TaskType::LocationSync,
                    processor_fn(|_task, _ctx| async move {
                        Err::<(), _>(anyhow::anyhow!("upstream timed out"))
                    }),
                )
                .exclusive(),
            )
            .unwrap();
        let executor = TaskExecutor::new(
            store.clone(),
            "instance-a",
            Arc::new(LoggingTenantNotifier),
        );

        let org_task =
            || NewTask::new(TaskType::LocationSync, TaskPayload::LocationSync).for_organization("org-x");
        let first = inner.enqueue(org_task()).await.unwrap();
        inner.advance_clock(Duration::from_millis(10));
        let second = inner.enqueue(org_task()).await.unwrap();
        let claimed = inner
            .claim_next(&exclusive_claim("instance-a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, first.id);

        let outcome = executor.execute(&queue, claimed).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Retrying { retries: 1 });

        let rival = store.rival_claim.lock().clone().unwrap();
        assert_eq!(rival.id, first.id);

        let current = inner.find_task(first.id).await.unwrap().unwrap();
        assert_eq!(current.being_processed_by.as_deref(), Some("instance-b"));
        assert_eq!(current.status(), TaskStatus::InProgress);

        // org-x stays exclusive while instance-b runs
        let third = inner.claim_next(&exclusive_claim("instance-c")).await.unwrap();
        assert!(third.is_none());
        let waiting = inner.find_task(second.id).await.unwrap().unwrap();
        assert!(waiting.being_processed_by.is_none());
    }

    #[tokio::test]
    async fn test_upstream_fault_flags_tenant() {
        let notifier = Arc::new(RecordingNotifier::default());
        let h = harness(
            QueueDefinition::new(
                "debug",
                TaskType::Debug,
                processor_fn(|_task, _ctx| async move {
                    Err::<(), _>(anyhow::anyhow!("upstream returned 401 Unauthorized"))
                }),
            ),
            notifier.clone(),
        );
        let task = enqueue_and_claim(&h, debug_task().for_organization("org-9")).await;

        let outcome = h.executor.execute(&h.queue, task).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Retrying { retries: 1 });

        // Notification runs on its own task
        for _ in 0..50 {
            if !notifier.calls.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            notifier.calls.lock().as_slice(),
            &[("org-9".to_string(), SyncErrorCode::Unauthorized)]
        );
    }

    #[tokio::test]
    async fn test_execution_requests_next_claim() {
        let h = harness(
            QueueDefinition::new(
                "debug",
                TaskType::Debug,
                processor_fn(|_task, _ctx| async move { Ok(()) }),
            )
            .with_idle_interval(Duration::from_secs(60)),
            Arc::new(LoggingTenantNotifier),
        );
        let task = enqueue_and_claim(&h, debug_task()).await;

        h.queue.defer_poll(tokio::time::Instant::now());
        assert!(!h.queue.is_due(tokio::time::Instant::now()));

        h.executor.execute(&h.queue, task).await.unwrap();
        assert!(h.queue.is_due(tokio::time::Instant::now()));
    }
}
