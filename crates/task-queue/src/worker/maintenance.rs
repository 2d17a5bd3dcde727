//! Periodic maintenance loops
//!
//! Both loops run on a fixed interval until cancelled, independent of the
//! dispatcher. A failed pass is logged and retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::SchedulerConfig;
use crate::persistence::{StoreError, TaskStore};

/// Log line written into a task reset by the reclaimer
pub const STUCK_NOTE: &str = "Reset: task appeared stuck and was returned to the queue";

/// Resets tasks whose owner stopped making progress
///
/// A task counts as stuck when it is owned and its `updated_at` is older than
/// the stuck timeout. Reset tasks lose their retries and errors, gain priority
/// and become pending again.
pub struct StuckTaskReclaimer {
    store: Arc<dyn TaskStore>,
    timeout: Duration,
    priority_boost: i32,
    interval: Duration,
}

impl StuckTaskReclaimer {
    pub fn new(store: Arc<dyn TaskStore>, config: &SchedulerConfig) -> Self {
        Self {
            store,
            timeout: config.stuck_timeout,
            priority_boost: config.priority_boost,
            interval: config.reclaim_interval,
        }
    }

    /// Run one sweep, returning the number of tasks reset
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<usize, StoreError> {
        let stuck = self.store.find_stuck(self.timeout).await?;
        let mut reclaimed = 0;

        for task in stuck {
            // The owner may have come back since the scan; reclaim_stuck re-checks
            match self
                .store
                .reclaim_stuck(task.id, self.timeout, self.priority_boost, STUCK_NOTE)
                .await
            {
                Ok(true) => {
                    warn!(
                        task_id = %task.id,
                        task_type = %task.task_type,
                        owner = task.being_processed_by.as_deref().unwrap_or_default(),
                        "Reclaimed stuck task"
                    );
                    reclaimed += 1;
                }
                Ok(false) => debug!(task_id = %task.id, "Task recovered before reclaim"),
                Err(e) => error!(task_id = %task.id, "Failed to reclaim stuck task: {}", e),
            }
        }

        Ok(reclaimed)
    }

    /// Sweep every interval until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(0) => {}
                        Ok(count) => info!(count, "Reclaimed stuck tasks"),
                        Err(e) => error!("Stuck task sweep failed: {}", e),
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("Reclaim loop: shutdown requested");
                    break;
                }
            }
        }

        debug!("Reclaim loop exited");
    }
}

/// Deletes terminal tasks past the retention window
pub struct TaskPruner {
    store: Arc<dyn TaskStore>,
    retention: Duration,
    interval: Duration,
}

impl TaskPruner {
    pub fn new(store: Arc<dyn TaskStore>, config: &SchedulerConfig) -> Self {
        Self {
            store,
            retention: config.retention,
            interval: config.prune_interval,
        }
    }

    /// Run one pass, returning the number of tasks deleted
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<u64, StoreError> {
        self.store.prune_older_than(self.retention).await
    }

    /// Prune every interval until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(0) => {}
                        Ok(count) => info!(count, "Pruned finished tasks"),
                        Err(e) => error!("Prune pass failed: {}", e),
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("Prune loop: shutdown requested");
                    break;
                }
            }
        }

        debug!("Prune loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{ClaimRequest, InMemoryTaskStore};
    use crate::task::{NewTask, TaskPayload, TaskStatus, TaskType};

    fn config() -> SchedulerConfig {
        SchedulerConfig::default()
            .with_stuck_timeout(Duration::from_secs(60))
            .with_priority_boost(10)
            .with_retention(Duration::from_secs(3600))
    }

    async fn claimed_task(store: &InMemoryTaskStore) -> uuid::Uuid {
        let task = store
            .enqueue(NewTask::new(TaskType::LocationSync, TaskPayload::LocationSync))
            .await
            .unwrap();
        store
            .claim_next(&ClaimRequest {
                task_type: TaskType::LocationSync,
                worker_id: "dead-worker".to_string(),
                max_retries: 3,
                min_age: Duration::ZERO,
                exclusive: false,
                liveness_timeout: Duration::from_secs(3600),
            })
            .await
            .unwrap()
            .unwrap();
        task.id
    }

    #[tokio::test]
    async fn test_reclaimer_resets_stale_tasks() {
        let store = Arc::new(InMemoryTaskStore::new());
        let task_id = claimed_task(&store).await;
        store
            .mark_retry_needed(task_id, "flaky", &crate::RetryPolicy::new(5))
            .await
            .unwrap();
        store.set_owner(task_id, Some("dead-worker")).await.unwrap();

        let reclaimer = StuckTaskReclaimer::new(store.clone(), &config());
        assert_eq!(reclaimer.run_once().await.unwrap(), 0);

        store.advance_clock(Duration::from_secs(61));
        assert_eq!(reclaimer.run_once().await.unwrap(), 1);

        let task = store.find_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status(), TaskStatus::Pending);
        assert!(task.being_processed_by.is_none());
        assert_eq!(task.retries, 0);
        assert!(task.errors.is_empty());
        assert!(task.start_time.is_none());
        assert_eq!(task.priority, 10);
        assert_eq!(
            task.log_messages.last().map(|l| l.message.as_str()),
            Some(STUCK_NOTE)
        );
    }

    #[tokio::test]
    async fn test_reclaimer_leaves_live_tasks_alone() {
        let store = Arc::new(InMemoryTaskStore::new());
        let task_id = claimed_task(&store).await;

        store.advance_clock(Duration::from_secs(45));
        store.append_log(task_id, "still working").await.unwrap();
        store.advance_clock(Duration::from_secs(45));

        let reclaimer = StuckTaskReclaimer::new(store.clone(), &config());
        assert_eq!(reclaimer.run_once().await.unwrap(), 0);

        let task = store.find_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.being_processed_by.as_deref(), Some("dead-worker"));
    }

    #[tokio::test]
    async fn test_pruner_only_deletes_old_terminal_tasks() {
        let store = Arc::new(InMemoryTaskStore::new());
        let pending = store
            .enqueue(NewTask::new(TaskType::LocationSync, TaskPayload::LocationSync))
            .await
            .unwrap();
        let in_progress = claimed_task(&store).await;
        let old_complete = store
            .enqueue(NewTask::new(TaskType::LocationSync, TaskPayload::LocationSync))
            .await
            .unwrap();
        let old_failed = store
            .enqueue(NewTask::new(TaskType::LocationSync, TaskPayload::LocationSync))
            .await
            .unwrap();
        store.mark_complete(old_complete.id).await.unwrap();
        store.mark_failed(old_failed.id, "gave up").await.unwrap();

        store.advance_clock(Duration::from_secs(2 * 3600));
        let recent = store
            .enqueue(NewTask::new(TaskType::LocationSync, TaskPayload::LocationSync))
            .await
            .unwrap();
        store.mark_complete(recent.id).await.unwrap();

        let pruner = TaskPruner::new(store.clone(), &config());
        assert_eq!(pruner.run_once().await.unwrap(), 2);

        assert!(store.find_task(pending.id).await.unwrap().is_some());
        assert!(store.find_task(in_progress).await.unwrap().is_some());
        assert!(store.find_task(recent.id).await.unwrap().is_some());
        assert!(store.find_task(old_complete.id).await.unwrap().is_none());
        assert!(store.find_task(old_failed.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_loops_stop_on_cancel() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let cancel = CancellationToken::new();
        let config = config().with_reclaim_interval(Duration::from_millis(10));

        let reclaim = tokio::spawn(StuckTaskReclaimer::new(store.clone(), &config).run(cancel.clone()));
        let prune = tokio::spawn(TaskPruner::new(store, &config).run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), reclaim)
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), prune)
            .await
            .unwrap()
            .unwrap();
    }
}
