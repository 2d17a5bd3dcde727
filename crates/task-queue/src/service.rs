//! Task queue service
//!
//! Owns the registry, the dispatcher and the maintenance loops of one process
//! instance and coordinates startup and shutdown.
//!
//! Startup registers queues, then (when background processing is enabled)
//! starts the dispatcher, the stuck-task reclaimer and the pruner. Shutdown
//! stops dispatch, gives running tasks a grace period, then hands every task
//! this instance still owns back to the queue. Interrupted tasks are never
//! completed or failed by shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConfigError, SchedulerConfig};
use crate::engine::{Dispatcher, QueueDefinition, QueueHandle, QueueRegistry, TaskExecutor};
use crate::persistence::{StoreError, TaskStore};
use crate::reliability::{LoggingTenantNotifier, TenantNotifier};
use crate::task::{NewTask, Task};
use crate::worker::{StuckTaskReclaimer, TaskPruner};

/// Log line written into tasks requeued by shutdown
pub const SHUTDOWN_NOTE: &str = "Killed by shutdown: task will be picked up again";

/// Errors from service operations
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Service already started
    #[error("task queue service is already started")]
    AlreadyStarted,
}

/// Scheduler for one process instance
///
/// # Example
///
/// ```ignore
/// use shelfsync_task_queue::prelude::*;
///
/// let store = Arc::new(PostgresTaskStore::new(pool));
/// let service = TaskQueueService::new(store, SchedulerConfig::from_env()?);
///
/// service.register_queue(
///     QueueDefinition::new("locations", TaskType::LocationSync, LocationSync::new(client))
///         .with_concurrency(2)
///         .exclusive(),
/// )?;
/// service.start()?;
///
/// // ... on SIGTERM
/// service.shutdown().await?;
/// ```
pub struct TaskQueueService {
    store: Arc<dyn TaskStore>,
    registry: Arc<QueueRegistry>,
    executor: Arc<TaskExecutor>,
    config: SchedulerConfig,
    cancel: CancellationToken,
    background: TaskTracker,
    started: AtomicBool,
    initialized: AtomicBool,
}

impl TaskQueueService {
    /// Create a service that reports tenant faults to the log only
    pub fn new(store: Arc<dyn TaskStore>, config: SchedulerConfig) -> Self {
        Self::with_notifier(store, config, Arc::new(LoggingTenantNotifier))
    }

    /// Create a service with a custom tenant notifier
    pub fn with_notifier(
        store: Arc<dyn TaskStore>,
        config: SchedulerConfig,
        notifier: Arc<dyn TenantNotifier>,
    ) -> Self {
        let executor = Arc::new(TaskExecutor::new(
            Arc::clone(&store),
            config.worker_id.clone(),
            notifier,
        ));

        Self {
            store,
            registry: Arc::new(QueueRegistry::new()),
            executor,
            config,
            cancel: CancellationToken::new(),
            background: TaskTracker::new(),
            started: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Owner id this instance writes into claimed tasks
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Whether startup has completed
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Register a queue; idempotent per queue name
    pub fn register_queue(
        &self,
        definition: QueueDefinition,
    ) -> Result<Arc<QueueHandle>, ServiceError> {
        Ok(self.registry.register(definition)?)
    }

    /// Enqueue a task and wake the dispatcher
    pub async fn enqueue(&self, task: NewTask) -> Result<Task, ServiceError> {
        let task = self.store.enqueue(task).await?;
        if task.scheduled_start.is_none() {
            if let Some(queue) = self.registry.for_task_type(task.task_type) {
                if queue.definition().min_age.is_zero() {
                    queue.request_claim();
                }
            }
        }
        Ok(task)
    }

    /// Start background processing
    ///
    /// Queues registered before or after this call are served. With background
    /// processing disabled in the configuration the queues stay paused and no
    /// loops are started; the instance can still enqueue and administer tasks.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(&self) -> Result<(), ServiceError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ServiceError::AlreadyStarted);
        }
        self.config.validate()?;

        if self.config.background_processing {
            self.registry.enable_processing();

            let dispatcher = Dispatcher::new(
                Arc::clone(&self.registry),
                Arc::clone(&self.store),
                Arc::clone(&self.executor),
                &self.config,
            );
            self.background.spawn(dispatcher.run(self.cancel.child_token()));
            self.background.spawn(
                StuckTaskReclaimer::new(Arc::clone(&self.store), &self.config)
                    .run(self.cancel.child_token()),
            );
            self.background.spawn(
                TaskPruner::new(Arc::clone(&self.store), &self.config)
                    .run(self.cancel.child_token()),
            );

            info!(queues = self.registry.len(), "Task queue processing started");
        } else {
            info!(
                queues = self.registry.len(),
                "Background processing disabled; queues stay paused"
            );
        }

        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop processing and requeue everything this instance still owns
    ///
    /// Returns the number of tasks handed back to the queue.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<usize, ServiceError> {
        info!("Initiating task queue shutdown");

        self.cancel.cancel();
        self.registry.drain_all();
        self.background.close();

        let queues = self.registry.queues();
        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            for queue in &queues {
                queue.pool().wait_idle().await;
            }
            self.background.wait().await;
        })
        .await;

        if drained.is_err() {
            let still_running: usize = queues.iter().map(|q| q.pool().in_flight()).sum();
            warn!(
                still_running,
                grace = ?self.config.shutdown_grace,
                "Shutdown grace period elapsed with tasks still running"
            );
        }

        let owned = self.store.find_owned_by(&self.config.worker_id).await?;
        let mut requeued = 0;

        for task in &owned {
            match self
                .store
                .release_owned(task.id, &self.config.worker_id, Some(SHUTDOWN_NOTE))
                .await
            {
                Ok(true) => requeued += 1,
                Ok(false) => debug!(task_id = %task.id, "Task changed owner before requeue"),
                Err(e) => error!(task_id = %task.id, "Failed to requeue task on shutdown: {}", e),
            }
        }

        info!(requeued, "Task queue shutdown complete");
        Ok(requeued)
    }
}

impl std::fmt::Debug for TaskQueueService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueueService")
            .field("worker_id", &self.config.worker_id)
            .field("registry", &self.registry)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
