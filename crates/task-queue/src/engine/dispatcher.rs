//! Dispatcher loop
//!
//! A single loop per process visits every registered queue. For each queue
//! that is accepting work, has a free slot and is due for a poll, it claims
//! one task and hands it to the queue's pool. An empty poll backs the queue
//! off for its idle interval without holding up the other queues.
//!
//! The loop sleeps only when a full pass claimed nothing, until the earliest
//! queue is due, a claim is requested, or the cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::executor::TaskExecutor;
use super::registry::QueueRegistry;
use crate::config::SchedulerConfig;
use crate::persistence::TaskStore;

/// Claims tasks and feeds them to worker pools
pub struct Dispatcher {
    registry: Arc<QueueRegistry>,
    store: Arc<dyn TaskStore>,
    executor: Arc<TaskExecutor>,
    liveness_timeout: Duration,
    max_idle_sleep: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<QueueRegistry>,
        store: Arc<dyn TaskStore>,
        executor: Arc<TaskExecutor>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            store,
            executor,
            liveness_timeout: config.claim_liveness_timeout,
            max_idle_sleep: config.max_idle_sleep,
        }
    }

    /// Run until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            worker_id = %self.executor.worker_id(),
            queues = self.registry.len(),
            "Dispatcher started"
        );

        while !cancel.is_cancelled() {
            if self.tick().await > 0 {
                // Keep feeding while there is work, but let executions run
                tokio::task::yield_now().await;
                continue;
            }

            let wait = self.idle_wait();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.registry.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!("Dispatcher stopped");
    }

    /// One pass over all queues; returns the number of tasks claimed
    pub async fn tick(&self) -> usize {
        let mut claimed = 0;

        for queue in self.registry.queues() {
            let now = Instant::now();
            if queue.is_paused() || !queue.is_due(now) {
                continue;
            }

            // Reserve capacity first so a claimed task never waits for a slot
            let Some(permit) = queue.pool().try_reserve() else {
                continue;
            };

            let request = queue
                .definition()
                .claim_request(self.executor.worker_id(), self.liveness_timeout);

            match self.store.claim_next(&request).await {
                Ok(Some(task)) => {
                    debug!(queue = %queue.name(), task_id = %task.id, "Dispatching task");
                    let executor = Arc::clone(&self.executor);
                    let handle = Arc::clone(&queue);
                    queue.pool().spawn(permit, async move {
                        // Errors are logged by the executor
                        let _ = executor.execute(&handle, task).await;
                    });
                    claimed += 1;
                }
                Ok(None) => queue.defer_poll(now),
                Err(e) => {
                    warn!(queue = %queue.name(), "Failed to claim task: {}", e);
                    queue.defer_poll(now);
                }
            }
        }

        claimed
    }

    /// How long to sleep after a pass that claimed nothing
    fn idle_wait(&self) -> Duration {
        let now = Instant::now();
        let until_due = self
            .registry
            .queues()
            .iter()
            .filter(|q| !q.is_paused() && q.pool().available() > 0)
            .map(|q| q.next_poll().saturating_duration_since(now))
            .min()
            .unwrap_or(self.max_idle_sleep)
            .min(self.max_idle_sleep);

        until_due + jitter(until_due)
    }
}

/// Up to 10% extra so instances do not poll in lockstep
fn jitter(base: Duration) -> Duration {
    let max_ms = (base.as_millis() / 10) as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::registry::QueueDefinition;
    use crate::persistence::InMemoryTaskStore;
    use crate::processor::processor_fn;
    use crate::reliability::LoggingTenantNotifier;
    use crate::task::{NewTask, TaskPayload, TaskStatus, TaskType};

    struct Harness {
        store: Arc<InMemoryTaskStore>,
        registry: Arc<QueueRegistry>,
        dispatcher: Dispatcher,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryTaskStore::new());
        let registry = Arc::new(QueueRegistry::new());
        let executor = Arc::new(TaskExecutor::new(
            store.clone(),
            "worker-1",
            Arc::new(LoggingTenantNotifier),
        ));
        let dispatcher = Dispatcher::new(
            registry.clone(),
            store.clone(),
            executor,
            &SchedulerConfig::default(),
        );
        Harness {
            store,
            registry,
            dispatcher,
        }
    }

    fn location_queue() -> QueueDefinition {
        QueueDefinition::new(
            "locations",
            TaskType::LocationSync,
            processor_fn(|_task, _ctx| async { Ok(()) }),
        )
        .with_idle_interval(Duration::from_secs(60))
    }

    async fn wait_for_status(store: &InMemoryTaskStore, id: uuid::Uuid, status: TaskStatus) {
        for _ in 0..100 {
            let task = store.find_task(id).await.unwrap().unwrap();
            if task.status() == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} never reached {status}");
    }

    #[tokio::test]
    async fn test_paused_queues_are_skipped() {
        let h = harness();
        h.registry.register(location_queue()).unwrap();
        h.store
            .enqueue(NewTask::new(TaskType::LocationSync, TaskPayload::LocationSync))
            .await
            .unwrap();

        assert_eq!(h.dispatcher.tick().await, 0);
        assert_eq!(h.store.task_counts(None).await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_tick_claims_and_executes() {
        let h = harness();
        h.registry.register(location_queue()).unwrap();
        h.registry.enable_processing();
        let task = h
            .store
            .enqueue(NewTask::new(TaskType::LocationSync, TaskPayload::LocationSync))
            .await
            .unwrap();

        assert_eq!(h.dispatcher.tick().await, 1);
        wait_for_status(&h.store, task.id, TaskStatus::Complete).await;
    }

    #[tokio::test]
    async fn test_empty_poll_backs_off() {
        let h = harness();
        let queue = h.registry.register(location_queue()).unwrap();
        h.registry.enable_processing();

        assert_eq!(h.dispatcher.tick().await, 0);
        assert!(!queue.is_due(Instant::now()));

        // Work enqueued during the back-off waits for the next due poll
        h.store
            .enqueue(NewTask::new(TaskType::LocationSync, TaskPayload::LocationSync))
            .await
            .unwrap();
        assert_eq!(h.dispatcher.tick().await, 0);

        queue.request_claim();
        assert_eq!(h.dispatcher.tick().await, 1);
    }

    #[tokio::test]
    async fn test_full_pool_is_not_polled() {
        let h = harness();
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        let queue = h
            .registry
            .register(
                QueueDefinition::new(
                    "locations",
                    TaskType::LocationSync,
                    processor_fn(move |_task, _ctx| {
                        let mut rx = release_rx.clone();
                        async move {
                            while !*rx.borrow() {
                                if rx.changed().await.is_err() {
                                    break;
                                }
                            }
                            Ok(())
                        }
                    }),
                )
                .with_concurrency(1),
            )
            .unwrap();
        h.registry.enable_processing();

        for _ in 0..2 {
            h.store
                .enqueue(NewTask::new(TaskType::LocationSync, TaskPayload::LocationSync))
                .await
                .unwrap();
        }

        assert_eq!(h.dispatcher.tick().await, 1);
        assert_eq!(queue.pool().in_flight(), 1);
        // Slot taken: the second task stays unclaimed
        assert_eq!(h.dispatcher.tick().await, 0);
        let counts = h.store.task_counts(None).await.unwrap();
        assert_eq!(counts.in_progress, 1);
        assert_eq!(counts.pending, 1);

        release_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let h = harness();
        h.registry.register(location_queue()).unwrap();
        h.registry.enable_processing();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(h.dispatcher.run(cancel.clone()));

        let task = h
            .store
            .enqueue(NewTask::new(TaskType::LocationSync, TaskPayload::LocationSync))
            .await
            .unwrap();
        // First pass happened before the enqueue; a claim request skips the idle wait
        h.registry.get("locations").unwrap().request_claim();
        wait_for_status(&h.store, task.id, TaskStatus::Complete).await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_jitter_is_bounded() {
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
        for _ in 0..100 {
            assert!(jitter(Duration::from_secs(1)) <= Duration::from_millis(100));
        }
    }
}
