//! Worker pool for task execution
//!
//! One pool per queue. The pool only bounds and tracks executions; claiming is
//! done by the dispatcher, which reserves a slot before it claims so a claimed
//! task never waits for capacity.

use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Registered but background processing is not enabled yet
    Paused,
    /// Accepting tasks
    Running,
    /// Finishing current tasks, not accepting new ones
    Draining,
}

/// Bounded executor for one queue
pub struct WorkerPool {
    queue: String,
    concurrency: usize,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    status: RwLock<WorkerPoolStatus>,
}

impl WorkerPool {
    /// Create a paused pool allowing `concurrency` simultaneous executions
    pub fn new(queue: impl Into<String>, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            queue: queue.into(),
            concurrency,
            permits: Arc::new(Semaphore::new(concurrency)),
            tracker: TaskTracker::new(),
            status: RwLock::new(WorkerPoolStatus::Paused),
        }
    }

    /// Name of the queue this pool serves
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Maximum simultaneous executions
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Get current status
    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Check if accepting tasks
    pub fn is_accepting(&self) -> bool {
        self.status() == WorkerPoolStatus::Running
    }

    /// Start accepting tasks; a draining pool stays draining
    pub fn resume(&self) {
        let mut status = self.status.write();
        if *status == WorkerPoolStatus::Paused {
            *status = WorkerPoolStatus::Running;
            debug!(queue = %self.queue, "Worker pool running");
        }
    }

    /// Number of executions currently running
    pub fn in_flight(&self) -> usize {
        self.concurrency - self.permits.available_permits()
    }

    /// Number of free execution slots
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Reserve an execution slot
    ///
    /// Returns `None` when the pool is full or not accepting tasks. Dropping
    /// the permit without spawning gives the slot back.
    pub fn try_reserve(&self) -> Option<OwnedSemaphorePermit> {
        if !self.is_accepting() {
            return None;
        }
        Arc::clone(&self.permits).try_acquire_owned().ok()
    }

    /// Run an execution in a reserved slot
    ///
    /// The slot is released when the future finishes.
    pub fn spawn<F>(&self, permit: OwnedSemaphorePermit, execution: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(async move {
            execution.await;
            drop(permit);
        });
    }

    /// Stop accepting tasks; running executions continue
    pub fn drain(&self) {
        *self.status.write() = WorkerPoolStatus::Draining;
        self.tracker.close();
        info!(queue = %self.queue, in_flight = self.in_flight(), "Draining worker pool");
    }

    /// Wait until every execution has finished
    ///
    /// Only returns after [`drain`](Self::drain) has been called.
    pub async fn wait_idle(&self) {
        self.tracker.wait().await;
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("queue", &self.queue)
            .field("concurrency", &self.concurrency)
            .field("in_flight", &self.in_flight())
            .field("status", &self.status())
            .finish()
    }
}
