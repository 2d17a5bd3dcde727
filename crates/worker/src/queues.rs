// Queue registration for the worker process
// Decision: One queue per task type, named after the task type
// Decision: Upstream-facing sync queues are exclusive per organization
// Decision: The debug queue is never registered in production

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use shelfsync_task_queue::{
    QueueDefinition, ServiceError, Task, TaskContext, TaskPayload, TaskProcessor,
    TaskQueueService, TaskType,
};

// =============================================================================
// Queue settings
// =============================================================================

/// Standard settings for the queue serving one task type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    pub task_type: TaskType,
    pub concurrency: usize,
    pub max_retries: u32,
    pub idle_interval: Duration,
    pub min_age: Duration,
    pub exclusive: bool,
}

impl QueueSettings {
    /// Settings for a task type
    ///
    /// Trigger tasks wait briefly after being enqueued so bursts of webhooks
    /// collapse into one upstream export.
    pub fn for_task_type(task_type: TaskType) -> Self {
        let base = Self {
            task_type,
            concurrency: 1,
            max_retries: 3,
            idle_interval: Duration::from_secs(5),
            min_age: Duration::ZERO,
            exclusive: false,
        };

        match task_type {
            TaskType::ProductTrigger | TaskType::CollectionTrigger => Self {
                min_age: Duration::from_secs(30),
                exclusive: true,
                ..base
            },
            TaskType::ProductSync | TaskType::CollectionSync => Self {
                concurrency: 2,
                exclusive: true,
                ..base
            },
            TaskType::LocationSync => Self {
                concurrency: 2,
                min_age: Duration::from_secs(10),
                exclusive: true,
                ..base
            },
            TaskType::OrderProcessing => Self {
                concurrency: 5,
                max_retries: 5,
                idle_interval: Duration::from_secs(2),
                ..base
            },
            TaskType::Debug => Self {
                max_retries: 1,
                idle_interval: Duration::from_secs(1),
                ..base
            },
        }
    }

    /// Build a queue definition served by `processor`
    pub fn definition(&self, processor: Arc<dyn TaskProcessor>) -> QueueDefinition {
        let definition =
            QueueDefinition::with_processor(self.task_type.as_str(), self.task_type, processor)
                .with_concurrency(self.concurrency)
                .with_max_retries(self.max_retries)
                .with_idle_interval(self.idle_interval)
                .with_min_age(self.min_age);

        if self.exclusive {
            definition.exclusive()
        } else {
            definition
        }
    }
}

// =============================================================================
// Processor set
// =============================================================================

/// Processors supplied by the connector, one per task type
#[derive(Default, Clone)]
pub struct ProcessorSet {
    processors: HashMap<TaskType, Arc<dyn TaskProcessor>>,
}

impl ProcessorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `task_type` with `processor`, replacing any earlier one
    pub fn with(mut self, task_type: TaskType, processor: impl TaskProcessor) -> Self {
        self.processors.insert(task_type, Arc::new(processor));
        self
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskProcessor>> {
        self.processors.get(&task_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

impl std::fmt::Debug for ProcessorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.processors.keys().map(TaskType::as_str).collect();
        types.sort_unstable();
        f.debug_struct("ProcessorSet").field("task_types", &types).finish()
    }
}

/// Register a queue for every supplied processor, plus the debug queue
/// outside production
///
/// Returns the names of the registered queues.
pub fn register_queues(
    service: &TaskQueueService,
    processors: &ProcessorSet,
    production: bool,
) -> Result<Vec<String>, ServiceError> {
    let mut registered = Vec::new();

    for task_type in TaskType::ALL {
        let processor = match processors.get(task_type) {
            _ if task_type == TaskType::Debug && production => continue,
            Some(processor) => processor,
            None if task_type == TaskType::Debug => {
                let debug: Arc<dyn TaskProcessor> = Arc::new(DebugProcessor);
                debug
            }
            None => continue,
        };

        let definition = QueueSettings::for_task_type(task_type).definition(processor);
        let queue = service.register_queue(definition)?;
        registered.push(queue.name().to_string());
    }

    Ok(registered)
}

// =============================================================================
// Debug processor
// =============================================================================

/// Echoes its message into the task log; fails on request
#[derive(Debug, Default, Clone, Copy)]
pub struct DebugProcessor;

#[async_trait]
impl TaskProcessor for DebugProcessor {
    async fn process(&self, task: Task, ctx: TaskContext) -> anyhow::Result<()> {
        let TaskPayload::Debug { message, fail } = &task.payload else {
            bail!(
                "debug processor received a {} payload",
                task.payload.data_type()
            );
        };

        ctx.log(message).await?;
        if *fail {
            bail!("debug task failed on request: {message}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelfsync_task_queue::{InMemoryTaskStore, NewTask, SchedulerConfig, TaskStore};

    fn service() -> TaskQueueService {
        TaskQueueService::new(Arc::new(InMemoryTaskStore::new()), SchedulerConfig::default())
    }

    #[test]
    fn test_sync_queues_are_exclusive() {
        for task_type in [
            TaskType::ProductTrigger,
            TaskType::ProductSync,
            TaskType::CollectionTrigger,
            TaskType::CollectionSync,
            TaskType::LocationSync,
        ] {
            assert!(QueueSettings::for_task_type(task_type).exclusive, "{task_type}");
        }
        assert!(!QueueSettings::for_task_type(TaskType::OrderProcessing).exclusive);
    }

    #[test]
    fn test_definition_carries_settings() {
        let settings = QueueSettings::for_task_type(TaskType::ProductTrigger);
        let definition = settings.definition(Arc::new(DebugProcessor));

        assert_eq!(definition.name, "product_trigger");
        assert_eq!(definition.task_type, TaskType::ProductTrigger);
        assert_eq!(definition.min_age, Duration::from_secs(30));
        assert!(definition.exclusive);
        assert!(definition.validate().is_ok());
    }

    #[test]
    fn test_debug_queue_only_outside_production() {
        let processors = ProcessorSet::new().with(TaskType::LocationSync, DebugProcessor);

        let dev = service();
        let names = register_queues(&dev, &processors, false).unwrap();
        assert_eq!(names, vec!["location_sync", "debug"]);

        let prod = service();
        let names = register_queues(&prod, &processors, true).unwrap();
        assert_eq!(names, vec!["location_sync"]);
        assert!(prod.registry().for_task_type(TaskType::Debug).is_none());
    }

    #[tokio::test]
    async fn test_debug_processor_echoes_and_fails_on_request() {
        let store = Arc::new(InMemoryTaskStore::new());
        let task = store
            .enqueue(NewTask::new(
                TaskType::Debug,
                TaskPayload::Debug {
                    message: "hello".to_string(),
                    fail: true,
                },
            ))
            .await
            .unwrap();

        let ctx = TaskContext::new(task.id, "debug-test", store.clone());
        let err = DebugProcessor.process(task.clone(), ctx).await.unwrap_err();
        assert!(err.to_string().contains("failed on request"));

        let logged = store.find_task(task.id).await.unwrap().unwrap();
        assert_eq!(logged.log_messages[0].message, "hello");
    }

    #[tokio::test]
    async fn test_debug_processor_rejects_other_payloads() {
        let store = Arc::new(InMemoryTaskStore::new());
        let task = store
            .enqueue(NewTask::new(TaskType::Debug, TaskPayload::LocationSync))
            .await
            .unwrap();

        let ctx = TaskContext::new(task.id, "debug-test", store.clone());
        let err = DebugProcessor.process(task, ctx).await.unwrap_err();
        assert!(err.to_string().contains("locationSync"));
    }
}
