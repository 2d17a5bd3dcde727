//! Processor contract
//!
//! Processors are the only extension point into the scheduler. Business code
//! supplies one per queue; the executor hands it the claimed [`Task`] and a
//! [`TaskContext`] for logging and self-rescheduling.
//!
//! Any error (or panic) returned by a processor is caught at the executor
//! boundary and turned into retry bookkeeping; it never escapes the pool.

mod context;

use std::future::Future;

use async_trait::async_trait;

use crate::task::Task;

pub use context::TaskContext;

/// Performs the work for a claimed task
///
/// Processors must be idempotent: a task can run more than once when its
/// owner crashes, is reclaimed, or is requeued by shutdown.
///
/// # Example
///
/// ```ignore
/// struct LocationSync { client: UpstreamClient }
///
/// #[async_trait]
/// impl TaskProcessor for LocationSync {
///     async fn process(&self, task: Task, ctx: TaskContext) -> anyhow::Result<()> {
///         let org = task.organization_id.context("location sync needs an organization")?;
///         let count = self.client.sync_locations(&org).await?;
///         ctx.log(format!("Synced {count} locations")).await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait TaskProcessor: Send + Sync + 'static {
    /// Run the task
    async fn process(&self, task: Task, ctx: TaskContext) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`TaskProcessor`]
pub struct FnProcessor<F>(F);

/// Wrap an async closure as a processor
///
/// # Example
///
/// ```
/// use shelfsync_task_queue::processor::processor_fn;
///
/// let processor = processor_fn(|task, ctx| async move {
///     ctx.log(format!("processing {}", task.id)).await?;
///     Ok::<_, anyhow::Error>(())
/// });
/// # let _ = processor;
/// ```
pub fn processor_fn<F, Fut>(f: F) -> FnProcessor<F>
where
    F: Fn(Task, TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnProcessor(f)
}

#[async_trait]
impl<F, Fut> TaskProcessor for FnProcessor<F>
where
    F: Fn(Task, TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn process(&self, task: Task, ctx: TaskContext) -> anyhow::Result<()> {
        (self.0)(task, ctx).await
    }
}
