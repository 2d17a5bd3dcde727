//! Queue registry
//!
//! The registry holds one [`QueueDefinition`] per task type together with the
//! queue's worker pool and polling state. It is an explicit object shared by
//! `Arc`; nothing here is process-global.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::ConfigError;
use crate::persistence::ClaimRequest;
use crate::processor::TaskProcessor;
use crate::reliability::RetryPolicy;
use crate::task::TaskType;
use crate::worker::WorkerPool;

/// Process-local configuration of one queue
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use shelfsync_task_queue::processor::processor_fn;
/// use shelfsync_task_queue::{QueueDefinition, TaskType};
///
/// let queue = QueueDefinition::new(
///     "product-sync",
///     TaskType::ProductSync,
///     processor_fn(|_task, _ctx| async { Ok(()) }),
/// )
/// .with_concurrency(2)
/// .with_max_retries(5)
/// .with_min_age(Duration::from_secs(2))
/// .exclusive();
///
/// assert!(queue.validate().is_ok());
/// ```
#[derive(Clone)]
pub struct QueueDefinition {
    pub name: String,
    pub task_type: TaskType,

    /// Maximum simultaneous executions in this process
    pub concurrency: usize,

    /// Failed attempts after which a task is failed
    pub max_retries: u32,

    /// Wait before polling again after finding nothing
    pub idle_interval: Duration,

    /// Tasks younger than this are not dispatched
    pub min_age: Duration,

    /// At most one running task per organization
    pub exclusive: bool,

    processor: Arc<dyn TaskProcessor>,
}

impl QueueDefinition {
    /// Create a queue with concurrency 1, three retries and a 5s idle interval
    pub fn new(name: impl Into<String>, task_type: TaskType, processor: impl TaskProcessor) -> Self {
        Self::with_processor(name, task_type, Arc::new(processor))
    }

    /// Create a queue around a shared processor
    pub fn with_processor(
        name: impl Into<String>,
        task_type: TaskType,
        processor: Arc<dyn TaskProcessor>,
    ) -> Self {
        Self {
            name: name.into(),
            task_type,
            concurrency: 1,
            max_retries: RetryPolicy::default().max_retries,
            idle_interval: Duration::from_secs(5),
            min_age: Duration::ZERO,
            exclusive: false,
            processor,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn with_min_age(mut self, min_age: Duration) -> Self {
        self.min_age = min_age;
        self
    }

    /// Allow at most one running task per organization
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// The queue's processor
    pub fn processor(&self) -> Arc<dyn TaskProcessor> {
        Arc::clone(&self.processor)
    }

    /// Retry policy derived from `max_retries`
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries)
    }

    /// Reject definitions the scheduler cannot run
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| {
            Err(ConfigError::InvalidQueue {
                name: self.name.clone(),
                reason: reason.to_string(),
            })
        };

        if self.name.trim().is_empty() {
            return invalid("name must not be empty");
        }
        if self.concurrency == 0 {
            return invalid("concurrency must be at least 1");
        }
        if self.max_retries == 0 {
            return invalid("max_retries must be at least 1");
        }
        if self.idle_interval.is_zero() {
            return invalid("idle_interval must be greater than zero");
        }
        Ok(())
    }

    /// Claim parameters for one attempt on this queue
    pub fn claim_request(&self, worker_id: &str, liveness_timeout: Duration) -> ClaimRequest {
        ClaimRequest {
            task_type: self.task_type,
            worker_id: worker_id.to_string(),
            max_retries: self.max_retries,
            min_age: self.min_age,
            exclusive: self.exclusive,
            liveness_timeout,
        }
    }
}

impl std::fmt::Debug for QueueDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueDefinition")
            .field("name", &self.name)
            .field("task_type", &self.task_type)
            .field("concurrency", &self.concurrency)
            .field("max_retries", &self.max_retries)
            .field("idle_interval", &self.idle_interval)
            .field("min_age", &self.min_age)
            .field("exclusive", &self.exclusive)
            .finish_non_exhaustive()
    }
}

/// A registered queue: definition, pool and polling state
pub struct QueueHandle {
    definition: QueueDefinition,
    pool: WorkerPool,
    next_poll: Mutex<Instant>,
    wake: Arc<Notify>,
}

impl QueueHandle {
    fn new(definition: QueueDefinition, wake: Arc<Notify>) -> Self {
        let pool = WorkerPool::new(definition.name.clone(), definition.concurrency);
        Self {
            definition,
            pool,
            next_poll: Mutex::new(Instant::now()),
            wake,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &QueueDefinition {
        &self.definition
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Whether the dispatcher should skip this queue entirely
    pub fn is_paused(&self) -> bool {
        !self.pool.is_accepting()
    }

    /// Earliest instant the dispatcher may poll this queue again
    pub fn next_poll(&self) -> Instant {
        *self.next_poll.lock()
    }

    /// Whether the queue may be polled at `now`
    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_poll()
    }

    /// Back off for one idle interval after an empty poll
    pub fn defer_poll(&self, now: Instant) {
        *self.next_poll.lock() = now + self.definition.idle_interval;
    }

    /// Ask the dispatcher to poll this queue right away
    pub fn request_claim(&self) {
        *self.next_poll.lock() = Instant::now();
        self.wake.notify_one();
    }
}

impl std::fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandle")
            .field("definition", &self.definition)
            .field("pool", &self.pool)
            .finish()
    }
}

/// Registry of queues served by this process
///
/// Pools start paused; [`enable_processing`](Self::enable_processing) flips
/// the process-wide flag and resumes every pool, including ones registered
/// later.
pub struct QueueRegistry {
    queues: RwLock<Vec<Arc<QueueHandle>>>,
    processing_enabled: AtomicBool,
    wake: Arc<Notify>,
}

impl Default for QueueRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(Vec::new()),
            processing_enabled: AtomicBool::new(false),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Register a queue
    ///
    /// Registering a name again returns the existing queue unchanged. A second
    /// queue for a task type that is already served is rejected.
    pub fn register(&self, definition: QueueDefinition) -> Result<Arc<QueueHandle>, ConfigError> {
        definition.validate()?;

        let mut queues = self.queues.write();

        if let Some(existing) = queues.iter().find(|q| q.name() == definition.name) {
            debug!(queue = %definition.name, "Queue already registered");
            return Ok(Arc::clone(existing));
        }

        if let Some(other) = queues
            .iter()
            .find(|q| q.definition().task_type == definition.task_type)
        {
            return Err(ConfigError::InvalidQueue {
                name: definition.name.clone(),
                reason: format!(
                    "task type {} is already served by queue {:?}",
                    definition.task_type,
                    other.name()
                ),
            });
        }

        info!(
            queue = %definition.name,
            task_type = %definition.task_type,
            concurrency = definition.concurrency,
            max_retries = definition.max_retries,
            exclusive = definition.exclusive,
            "Registered queue"
        );

        let handle = Arc::new(QueueHandle::new(definition, Arc::clone(&self.wake)));
        if self.is_processing_enabled() {
            handle.pool().resume();
        }
        queues.push(Arc::clone(&handle));
        Ok(handle)
    }

    /// Look up a queue by name
    pub fn get(&self, name: &str) -> Option<Arc<QueueHandle>> {
        self.queues.read().iter().find(|q| q.name() == name).cloned()
    }

    /// Look up the queue serving a task type
    pub fn for_task_type(&self, task_type: TaskType) -> Option<Arc<QueueHandle>> {
        self.queues
            .read()
            .iter()
            .find(|q| q.definition().task_type == task_type)
            .cloned()
    }

    /// Snapshot of all registered queues, in registration order
    pub fn queues(&self) -> Vec<Arc<QueueHandle>> {
        self.queues.read().clone()
    }

    pub fn len(&self) -> usize {
        self.queues.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.read().is_empty()
    }

    /// Turn on background processing for every queue
    pub fn enable_processing(&self) {
        self.processing_enabled.store(true, Ordering::SeqCst);
        for queue in self.queues.read().iter() {
            queue.pool().resume();
        }
        self.wake.notify_one();
    }

    pub fn is_processing_enabled(&self) -> bool {
        self.processing_enabled.load(Ordering::SeqCst)
    }

    /// Stop every pool from accepting new tasks
    pub fn drain_all(&self) {
        for queue in self.queues.read().iter() {
            queue.pool().drain();
        }
    }

    /// Wake the dispatcher
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    /// Resolves on the next [`notify`](Self::notify) or claim request
    pub(crate) async fn notified(&self) {
        self.wake.notified().await;
    }
}

impl std::fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRegistry")
            .field(
                "queues",
                &self.queues.read().iter().map(|q| q.name().to_string()).collect::<Vec<_>>(),
            )
            .field("processing_enabled", &self.is_processing_enabled())
            .finish()
    }
}
