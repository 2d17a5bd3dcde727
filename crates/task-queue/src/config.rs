//! Scheduler configuration
//!
//! This module provides:
//! - [`SchedulerConfig`] - process-wide settings for dispatch and maintenance
//! - [`ConfigError`] - startup configuration failures
//!
//! Queue-level settings live on [`QueueDefinition`](crate::engine::QueueDefinition).

use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

/// Startup configuration failure
///
/// Always fatal: a process with bad configuration must not register queues.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A required setting is absent
    #[error("missing required setting: {0}")]
    MissingSetting(String),

    /// A setting is present but unusable
    #[error("invalid value {value:?} for {name}: {reason}")]
    InvalidSetting {
        name: String,
        value: String,
        reason: String,
    },

    /// A queue definition is unusable
    #[error("invalid queue {name:?}: {reason}")]
    InvalidQueue { name: String, reason: String },
}

/// Process-wide scheduler settings
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Owner id written into claimed tasks; unique per process instance
    pub worker_id: String,

    /// Whether this process dispatches tasks at all
    pub background_processing: bool,

    /// An owned task untouched for this long may be claimed by another worker
    pub claim_liveness_timeout: Duration,

    /// How often the stuck-task reclaimer runs
    pub reclaim_interval: Duration,

    /// An owned task untouched for this long is reset by the reclaimer
    pub stuck_timeout: Duration,

    /// Priority added to a task when it is reclaimed
    pub priority_boost: i32,

    /// How often the pruner runs
    pub prune_interval: Duration,

    /// Terminal tasks older than this are deleted
    pub retention: Duration,

    /// How long shutdown waits for running tasks before requeueing them
    pub shutdown_grace: Duration,

    /// Upper bound for a dispatcher idle wait
    pub max_idle_sleep: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            background_processing: true,
            claim_liveness_timeout: Duration::from_secs(30 * 60),
            reclaim_interval: Duration::from_secs(60),
            stuck_timeout: Duration::from_secs(15 * 60),
            priority_boost: 1,
            prune_interval: Duration::from_secs(60 * 60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            shutdown_grace: Duration::from_secs(10),
            max_idle_sleep: Duration::from_secs(5),
        }
    }
}

impl SchedulerConfig {
    /// Load from `TASK_QUEUE_*` environment variables, falling back to defaults
    ///
    /// | Variable | Setting |
    /// |---|---|
    /// | `TASK_QUEUE_WORKER_ID` | `worker_id` |
    /// | `TASK_QUEUE_BACKGROUND_PROCESSING` | `background_processing` |
    /// | `TASK_QUEUE_CLAIM_LIVENESS_SECS` | `claim_liveness_timeout` |
    /// | `TASK_QUEUE_RECLAIM_INTERVAL_SECS` | `reclaim_interval` |
    /// | `TASK_QUEUE_STUCK_TIMEOUT_SECS` | `stuck_timeout` |
    /// | `TASK_QUEUE_PRIORITY_BOOST` | `priority_boost` |
    /// | `TASK_QUEUE_PRUNE_INTERVAL_SECS` | `prune_interval` |
    /// | `TASK_QUEUE_RETENTION_HOURS` | `retention` |
    /// | `TASK_QUEUE_SHUTDOWN_GRACE_SECS` | `shutdown_grace` |
    /// | `TASK_QUEUE_MAX_IDLE_SLEEP_MS` | `max_idle_sleep` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |name: &str, default: Duration| {
            parse::<u64>(&lookup, name).map(|v| v.map_or(default, Duration::from_secs))
        };

        let config = Self {
            worker_id: lookup("TASK_QUEUE_WORKER_ID")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.worker_id),
            background_processing: parse_bool(&lookup, "TASK_QUEUE_BACKGROUND_PROCESSING")?
                .unwrap_or(defaults.background_processing),
            claim_liveness_timeout: secs(
                "TASK_QUEUE_CLAIM_LIVENESS_SECS",
                defaults.claim_liveness_timeout,
            )?,
            reclaim_interval: secs("TASK_QUEUE_RECLAIM_INTERVAL_SECS", defaults.reclaim_interval)?,
            stuck_timeout: secs("TASK_QUEUE_STUCK_TIMEOUT_SECS", defaults.stuck_timeout)?,
            priority_boost: parse::<i32>(&lookup, "TASK_QUEUE_PRIORITY_BOOST")?
                .unwrap_or(defaults.priority_boost),
            prune_interval: secs("TASK_QUEUE_PRUNE_INTERVAL_SECS", defaults.prune_interval)?,
            retention: parse::<u64>(&lookup, "TASK_QUEUE_RETENTION_HOURS")?
                .map_or(defaults.retention, |h| Duration::from_secs(h * 60 * 60)),
            shutdown_grace: secs("TASK_QUEUE_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace)?,
            max_idle_sleep: parse::<u64>(&lookup, "TASK_QUEUE_MAX_IDLE_SLEEP_MS")?
                .map_or(defaults.max_idle_sleep, Duration::from_millis),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the scheduler cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("reclaim_interval", self.reclaim_interval),
            ("prune_interval", self.prune_interval),
            ("stuck_timeout", self.stuck_timeout),
            ("claim_liveness_timeout", self.claim_liveness_timeout),
            ("max_idle_sleep", self.max_idle_sleep),
        ];

        for (name, value) in non_zero {
            if value.is_zero() {
                return Err(ConfigError::InvalidSetting {
                    name: name.to_string(),
                    value: "0".to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Set the owner id
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Enable or disable background processing
    pub fn with_background_processing(mut self, enabled: bool) -> Self {
        self.background_processing = enabled;
        self
    }

    /// Set the claim liveness timeout
    pub fn with_claim_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.claim_liveness_timeout = timeout;
        self
    }

    /// Set the reclaimer interval
    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    /// Set the stuck-task timeout
    pub fn with_stuck_timeout(mut self, timeout: Duration) -> Self {
        self.stuck_timeout = timeout;
        self
    }

    /// Set the priority boost applied to reclaimed tasks
    pub fn with_priority_boost(mut self, boost: i32) -> Self {
        self.priority_boost = boost;
        self
    }

    /// Set the pruner interval
    pub fn with_prune_interval(mut self, interval: Duration) -> Self {
        self.prune_interval = interval;
        self
    }

    /// Set the retention window for terminal tasks
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Set the shutdown grace period
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set the maximum dispatcher idle wait
    pub fn with_max_idle_sleep(mut self, max: Duration) -> Self {
        self.max_idle_sleep = max;
        self
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|e| ConfigError::InvalidSetting {
                    name: name.to_string(),
                    value: value.clone(),
                    reason: e.to_string(),
                })
        })
        .transpose()
}

fn parse_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<bool>, ConfigError> {
    lookup(name)
        .map(|value| match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidSetting {
                name: name.to_string(),
                value,
                reason: "expected a boolean".to_string(),
            }),
        })
        .transpose()
}
